//! Parquet snapshots of the year-specific assessment and session tables,
//! written under `data/parquet/raw/` with a mirrored backup copy.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::metrics::{letters_known, AssessmentRow, SessionRow};

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Write baseline/midline/session Parquet snapshots for one assessment year
/// under `{parquet_root}/raw/{year}/`, mirror them to
/// `{parquet_root}/backup/{year}/`, and return the manifest path.
pub fn export_assessment_snapshots(
    parquet_root: &Path,
    year: &str,
    baseline: &[AssessmentRow],
    midline: &[AssessmentRow],
    sessions: &[SessionRow],
) -> Result<PathBuf> {
    let raw_dir = parquet_root.join("raw").join(year);
    let backup_dir = parquet_root.join("backup").join(year);
    std::fs::create_dir_all(&raw_dir)
        .with_context(|| format!("creating {}", raw_dir.display()))?;
    std::fs::create_dir_all(&backup_dir)
        .with_context(|| format!("creating {}", backup_dir.display()))?;

    let baseline_path = raw_dir.join("baseline_assessments.parquet");
    let midline_path = raw_dir.join("midline_assessments.parquet");
    let sessions_path = raw_dir.join("sessions.parquet");

    write_assessments_parquet(&baseline_path, baseline, "baseline")?;
    write_assessments_parquet(&midline_path, midline, "midline")?;
    write_sessions_parquet(&sessions_path, sessions)?;

    for path in [&baseline_path, &midline_path, &sessions_path] {
        let file_name = path
            .file_name()
            .context("parquet snapshot path has no file name")?;
        std::fs::copy(path, backup_dir.join(file_name))
            .with_context(|| format!("backing up {}", path.display()))?;
    }

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("baseline_assessments", &raw_dir, &baseline_path)?,
            manifest_entry("midline_assessments", &raw_dir, &midline_path)?,
            manifest_entry("sessions", &raw_dir, &sessions_path)?,
        ],
    };
    let manifest_path = raw_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_assessments_parquet(path: &Path, rows: &[AssessmentRow], round: &str) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("mcode", DataType::Utf8, false),
        ArrowField::new("grade", DataType::Utf8, false),
        ArrowField::new("school", DataType::Utf8, false),
        ArrowField::new("round", DataType::Utf8, false),
        ArrowField::new("captured", DataType::Boolean, false),
        ArrowField::new("egra", DataType::Float64, true),
        ArrowField::new("letters_known", DataType::UInt32, true),
    ]));

    let mcodes = StringArray::from(rows.iter().map(|r| Some(r.mcode.as_str())).collect::<Vec<_>>());
    let grades = StringArray::from(rows.iter().map(|r| Some(r.grade.as_str())).collect::<Vec<_>>());
    let schools = StringArray::from(rows.iter().map(|r| Some(r.school.as_str())).collect::<Vec<_>>());
    let rounds = StringArray::from(rows.iter().map(|_| Some(round)).collect::<Vec<_>>());
    let captured = BooleanArray::from(rows.iter().map(|r| r.captured).collect::<Vec<_>>());
    let egra = Float64Array::from(rows.iter().map(|r| r.egra).collect::<Vec<_>>());
    let letters = UInt32Array::from(rows.iter().map(letters_known).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(mcodes),
            Arc::new(grades),
            Arc::new(schools),
            Arc::new(rounds),
            Arc::new(captured),
            Arc::new(egra),
            Arc::new(letters),
        ],
    )
    .context("building assessments record batch")?;
    write_parquet(path, batch)
}

fn write_sessions_parquet(path: &Path, rows: &[SessionRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("mcode", DataType::Utf8, false),
        ArrowField::new("total_sessions", DataType::UInt32, false),
    ]));

    let mcodes = StringArray::from(rows.iter().map(|r| Some(r.mcode.as_str())).collect::<Vec<_>>());
    let totals = UInt32Array::from(rows.iter().map(|r| r.total_sessions).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(schema, vec![Arc::new(mcodes), Arc::new(totals)])
        .context("building sessions record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, base_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(base_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn sample_rows() -> Vec<AssessmentRow> {
        vec![AssessmentRow {
            mcode: "M001".to_string(),
            grade: "Grade 1".to_string(),
            school: "Emafini Primary".to_string(),
            captured: true,
            known_letters: BTreeSet::from(["a".to_string(), "e".to_string()]),
            egra: Some(12.0),
        }]
    }

    #[test]
    fn export_writes_raw_backup_and_manifest() {
        let dir = tempdir().unwrap();
        let sessions = vec![SessionRow {
            mcode: "M001".to_string(),
            total_sessions: 18,
        }];

        let manifest_path =
            export_assessment_snapshots(dir.path(), "2026", &sample_rows(), &sample_rows(), &sessions)
                .unwrap();

        assert!(manifest_path.ends_with("raw/2026/manifest.json"));
        for name in [
            "baseline_assessments.parquet",
            "midline_assessments.parquet",
            "sessions.parquet",
        ] {
            assert!(dir.path().join("raw/2026").join(name).exists());
            assert!(dir.path().join("backup/2026").join(name).exists());
        }

        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&manifest_path).unwrap()).unwrap();
        let files = manifest.get("files").and_then(|f| f.as_array()).unwrap();
        assert_eq!(files.len(), 3);
        for file in files {
            assert_eq!(file.get("sha256").and_then(|v| v.as_str()).unwrap().len(), 64);
        }
    }
}
