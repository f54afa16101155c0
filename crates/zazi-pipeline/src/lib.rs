//! Run orchestration for the Mentor Visit Tracker pipeline:
//! fetch -> reconcile -> merge -> snapshot -> data-quality report.

pub mod metrics;
pub mod parquet_export;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;
use zazi_core::{SurveyVersion, UnifiedRecord, METADATA_COLUMNS};
use zazi_storage::{csv_bytes, write_atomic, HttpClient, HttpClientConfig, SnapshotStore};
use zazi_survey::{
    columns_for, flatten_responses, reconcile, unified_columns, ReconcileReport, SurveyApi,
    SurveyApiConfig, SurveyFetch,
};

use crate::metrics::{derive_progress, ChildProgressRecord, DeriveReport};

pub const CRATE_NAME: &str = "zazi-pipeline";

pub const SURVEY_SOURCE_COLUMN: &str = "Survey Source";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub data_dir: PathBuf,
    pub http_timeout_secs: u64,
    pub fetch_stage_timeout_secs: u64,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            api_base_url: std::env::var("ZAZI_API_BASE_URL")
                .unwrap_or_else(|_| "https://surveys.zazi.example/api/v1".to_string()),
            api_token: std::env::var("ZAZI_API_TOKEN").ok(),
            data_dir: std::env::var("ZAZI_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            http_timeout_secs: std::env::var("ZAZI_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            fetch_stage_timeout_secs: std::env::var("ZAZI_FETCH_STAGE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
        }
    }
}

// ---------------------------------------------------------------------------
// Merger
// ---------------------------------------------------------------------------

/// Per-column null accounting over the merged table. Only columns with at
/// least one null appear. Feeds the data-quality report, not downstream
/// consumers.
#[derive(Debug, Clone, Serialize)]
pub struct MissingColumnSummary {
    pub column: String,
    pub null_rows: usize,
    pub null_percent: f64,
}

#[derive(Debug, Clone)]
pub struct MergeOutput {
    pub records: Vec<UnifiedRecord>,
    pub missing: Vec<MissingColumnSummary>,
}

/// Column order of the merged table: metadata, provenance, then the union
/// question schema.
pub fn merged_columns() -> Vec<&'static str> {
    METADATA_COLUMNS
        .iter()
        .copied()
        .chain(std::iter::once(SURVEY_SOURCE_COLUMN))
        .chain(unified_columns())
        .collect()
}

/// Concatenate the two reconciled tables and sort strictly descending by
/// `response_start_at`. The sort is stable, so ties keep input order (old
/// survey rows ahead of new survey rows).
pub fn merge_surveys(old: Vec<UnifiedRecord>, new: Vec<UnifiedRecord>) -> MergeOutput {
    let mut records = old;
    records.extend(new);
    records.sort_by(|a, b| b.meta.response_start_at.cmp(&a.meta.response_start_at));

    let missing = missing_summary(&records);
    MergeOutput { records, missing }
}

fn missing_summary(records: &[UnifiedRecord]) -> Vec<MissingColumnSummary> {
    if records.is_empty() {
        return Vec::new();
    }
    let columns = merged_columns();
    let rows: Vec<Vec<Option<String>>> = records.iter().map(merged_row_cells).collect();

    columns
        .iter()
        .enumerate()
        .filter_map(|(pos, column)| {
            let null_rows = rows.iter().filter(|row| row[pos].is_none()).count();
            (null_rows > 0).then(|| MissingColumnSummary {
                column: column.to_string(),
                null_rows,
                null_percent: null_rows as f64 / records.len() as f64 * 100.0,
            })
        })
        .collect()
}

fn meta_cells(record: &UnifiedRecord) -> Vec<Option<String>> {
    let meta = &record.meta;
    vec![
        Some(meta.response_id.to_string()),
        Some(meta.response_uuid.clone()),
        meta.user_id.map(|id| id.to_string()),
        meta.user_name.clone(),
        Some(meta.response_start_at.to_rfc3339()),
        meta.response_end_at.map(|t| t.to_rfc3339()),
        meta.duration_minutes.map(|d| d.to_string()),
        Some(meta.complete.to_string()),
        meta.created_at.map(|t| t.to_rfc3339()),
        meta.updated_at.map(|t| t.to_rfc3339()),
    ]
}

fn merged_row_cells(record: &UnifiedRecord) -> Vec<Option<String>> {
    let mut cells = meta_cells(record);
    cells.push(Some(record.survey_source.source_label().to_string()));
    for column in unified_columns() {
        cells.push(record.answer(column).map(ToString::to_string));
    }
    cells
}

/// Serialize one survey's reconciled table: metadata plus only the columns
/// that generation may populate.
pub fn survey_csv_bytes(records: &[UnifiedRecord], version: SurveyVersion) -> Result<Vec<u8>> {
    let header = columns_for(version);
    let full_header: Vec<&str> = METADATA_COLUMNS.iter().copied().chain(header.clone()).collect();
    let rows: Vec<Vec<Option<String>>> = records
        .iter()
        .map(|record| {
            let mut cells = meta_cells(record);
            for column in &header {
                cells.push(record.answer(column).map(ToString::to_string));
            }
            cells
        })
        .collect();
    csv_bytes(&full_header, &rows)
}

pub fn merged_csv_bytes(records: &[UnifiedRecord]) -> Result<Vec<u8>> {
    let header = merged_columns();
    let rows: Vec<Vec<Option<String>>> = records.iter().map(merged_row_cells).collect();
    csv_bytes(&header, &rows)
}

// ---------------------------------------------------------------------------
// Run orchestration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub old_records: usize,
    pub new_records: usize,
    pub merged_records: usize,
    pub old_reported_total: u64,
    pub new_reported_total: u64,
    pub snapshots: Vec<String>,
    pub report_dir: String,
}

pub struct Pipeline {
    config: PipelineConfig,
    store: SnapshotStore,
    api: SurveyApi,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let token = config
            .api_token
            .clone()
            .context("ZAZI_API_TOKEN must be set to fetch survey data")?;
        let http = HttpClient::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            bearer_token: Some(token),
            ..Default::default()
        })?;
        let api = SurveyApi::new(
            http,
            SurveyApiConfig {
                base_url: config.api_base_url.clone(),
            },
        );
        let store = SnapshotStore::new(config.data_dir.clone());
        Ok(Self { config, store, api })
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// One full pipeline run. The fetch stage carries an overall timeout
    /// because it is the only stage touching the network; a failure in
    /// either survey fetch aborts the run with no partial merge.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let fetch_stage = async {
            let old = self
                .api
                .fetch_survey(run_id, SurveyVersion::Old612)
                .await
                .context("fetching old survey (612)")?;
            let new = self
                .api
                .fetch_survey(run_id, SurveyVersion::New677)
                .await
                .context("fetching new survey (677)")?;
            Ok::<_, anyhow::Error>((old, new))
        };
        let (old_fetch, new_fetch) = tokio::time::timeout(
            Duration::from_secs(self.config.fetch_stage_timeout_secs),
            fetch_stage,
        )
        .await
        .context("fetch stage exceeded its overall timeout")??;

        check_fetch_accounting(&old_fetch);
        check_fetch_accounting(&new_fetch);

        let old_flat = flatten_responses(&old_fetch.records, &old_fetch.mapping);
        let new_flat = flatten_responses(&new_fetch.records, &new_fetch.mapping);
        let (old_aligned, old_report) = reconcile(old_flat, SurveyVersion::Old612);
        let (new_aligned, new_report) = reconcile(new_flat, SurveyVersion::New677);

        let written_at = Utc::now();
        let mut snapshots = Vec::new();
        for (records, version) in [
            (&old_aligned, SurveyVersion::Old612),
            (&new_aligned, SurveyVersion::New677),
        ] {
            let bytes = survey_csv_bytes(records, version)?;
            let paths = self
                .store
                .write_snapshot_pair(
                    version.snapshot_stem(),
                    version.latest_snapshot_name(),
                    written_at,
                    &bytes,
                )
                .await?;
            snapshots.push(paths.timestamped.display().to_string());
        }

        let old_count = old_aligned.len();
        let new_count = new_aligned.len();
        let merged = merge_surveys(old_aligned, new_aligned);
        let merged_bytes = merged_csv_bytes(&merged.records)?;
        let merged_paths = self
            .store
            .write_snapshot_pair("merged_data", "merged_data_latest.csv", written_at, &merged_bytes)
            .await?;
        snapshots.push(merged_paths.timestamped.display().to_string());

        let finished_at = Utc::now();
        let quality = render_data_quality_report(
            run_id,
            &old_fetch,
            &new_fetch,
            &old_report,
            &new_report,
            &merged.missing,
        );
        let report_dir = self.store.reports_dir().join(run_id.to_string());
        write_atomic(&report_dir.join("data_quality.md"), quality.as_bytes()).await?;

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at,
            old_records: old_count,
            new_records: new_count,
            merged_records: merged.records.len(),
            old_reported_total: old_fetch.reported_total,
            new_reported_total: new_fetch.reported_total,
            snapshots,
            report_dir: report_dir.display().to_string(),
        };
        let summary_json =
            serde_json::to_vec_pretty(&summary).context("serializing run summary")?;
        write_atomic(&report_dir.join("run_summary.json"), &summary_json).await?;

        Ok(summary)
    }
}

/// Convenience entrypoint for the CLI: configure from the environment and
/// run one pipeline pass.
pub async fn run_sync_once_from_env() -> Result<RunSummary> {
    let pipeline = Pipeline::new(PipelineConfig::from_env())?;
    pipeline.run_once().await
}

fn check_fetch_accounting(fetch: &SurveyFetch) {
    if fetch.records.len() as u64 != fetch.reported_total {
        warn!(
            survey_id = fetch.version.survey_id(),
            fetched = fetch.records.len(),
            reported_total = fetch.reported_total,
            "fetched record count differs from the API-reported total"
        );
    }
}

/// Markdown data-quality report for one run: fetch accounting, columns
/// outside the static schema lists, and the merged-table null summary.
pub fn render_data_quality_report(
    run_id: Uuid,
    old_fetch: &SurveyFetch,
    new_fetch: &SurveyFetch,
    old_report: &ReconcileReport,
    new_report: &ReconcileReport,
    missing: &[MissingColumnSummary],
) -> String {
    let mut out = String::new();
    out.push_str("# Mentor Visit Tracker — Data Quality\n\n");
    out.push_str(&format!("- Run ID: `{run_id}`\n"));
    for fetch in [old_fetch, new_fetch] {
        out.push_str(&format!(
            "- {}: {} records fetched over {} pages (API reported {})\n",
            fetch.version.source_label(),
            fetch.records.len(),
            fetch.pages_fetched,
            fetch.reported_total,
        ));
    }

    out.push_str("\n## Unrecognized Columns\n");
    let mut any_unrecognized = false;
    for (label, report) in [("old", old_report), ("new", new_report)] {
        for (column, count) in &report.unrecognized_columns {
            any_unrecognized = true;
            out.push_str(&format!(
                "- [{label}] `{column}`: {count} rows (dropped; not on any static schema list)\n"
            ));
        }
    }
    if !any_unrecognized {
        out.push_str("All data columns matched the static schema lists.\n");
    }

    out.push_str("\n## Missing Data\n");
    if missing.is_empty() {
        out.push_str("No merged column contains nulls.\n");
    } else {
        for entry in missing {
            out.push_str(&format!(
                "- `{}`: {} null rows ({:.1}%)\n",
                entry.column, entry.null_rows, entry.null_percent
            ));
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Metric derivation run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct DeriveSummary {
    pub run_id: Uuid,
    pub year: String,
    pub report: DeriveReport,
    pub progress_csv: String,
    pub parquet_manifest: String,
    pub report_dir: String,
}

pub const PROGRESS_COLUMNS: &[&str] = &[
    "Mcode",
    "Grade",
    "School",
    "Baseline Letters Known",
    "Midline Letters Known",
    "Baseline Letter Cohort",
    "Midline Letter Cohort",
    "EGRA Baseline",
    "EGRA Midline",
    "Letters Learned",
    "Egra Improvement Agg",
    "Egra Improvement Pct",
    "Total Sessions",
];

pub fn progress_csv_bytes(records: &[ChildProgressRecord]) -> Result<Vec<u8>> {
    let rows: Vec<Vec<Option<String>>> = records
        .iter()
        .map(|r| {
            vec![
                Some(r.mcode.clone()),
                Some(r.grade.clone()),
                Some(r.school.clone()),
                r.baseline_letters_known.map(|v| v.to_string()),
                r.midline_letters_known.map(|v| v.to_string()),
                r.baseline_cohort.map(|c| c.label().to_string()),
                r.midline_cohort.map(|c| c.label().to_string()),
                r.egra_baseline.map(|v| v.to_string()),
                r.egra_midline.map(|v| v.to_string()),
                r.letters_learned.map(|v| v.to_string()),
                r.egra_improvement_agg.map(|v| v.to_string()),
                r.egra_improvement_pct.map(|v| v.to_string()),
                r.total_sessions.map(|v| v.to_string()),
            ]
        })
        .collect();
    csv_bytes(PROGRESS_COLUMNS, &rows)
}

/// Markdown data-quality report for one derivation run: join accounting for
/// the baseline and session joins.
pub fn render_derivation_report(run_id: Uuid, year: &str, report: &DeriveReport) -> String {
    let mut out = String::new();
    out.push_str("# Child Progress Derivation — Data Quality\n\n");
    out.push_str(&format!("- Run ID: `{run_id}`\n"));
    out.push_str(&format!("- Assessment year: {year}\n"));
    out.push_str(&format!("- Midline rows: {}\n", report.midline_rows));
    out.push_str(&format!("- Derived rows: {}\n", report.derived_rows));

    out.push_str("\n## Join Accounting\n");
    if report.midline_without_baseline > 0 {
        out.push_str(&format!(
            "- {} midline rows had no baseline match and were dropped\n",
            report.midline_without_baseline
        ));
    } else {
        out.push_str("- Every midline row matched a baseline row.\n");
    }
    if report.children_without_sessions > 0 {
        out.push_str(&format!(
            "- {} children had no session record; their session count is null\n",
            report.children_without_sessions
        ));
    } else {
        out.push_str("- Every derived child carried a session count.\n");
    }
    out
}

/// Load baseline/midline/session CSV tables, derive the augmented midline
/// table, and persist it as CSV plus Parquet snapshots of the inputs. Each
/// run writes its join accounting under `data/reports/{run_id}/`.
pub async fn run_derivation(
    store: &SnapshotStore,
    year: &str,
    baseline_csv: &std::path::Path,
    midline_csv: &std::path::Path,
    sessions_csv: &std::path::Path,
) -> Result<DeriveSummary> {
    let run_id = Uuid::new_v4();
    let baseline = metrics::load_assessment_csv(baseline_csv)?;
    let midline = metrics::load_assessment_csv(midline_csv)?;
    let sessions = metrics::load_sessions_csv(sessions_csv)?;

    let (records, report) = derive_progress(&baseline, &midline, &sessions);
    if report.midline_without_baseline > 0 {
        warn!(
            dropped = report.midline_without_baseline,
            "midline rows without a baseline match were dropped from the derived table"
        );
    }

    let progress_path = store
        .root()
        .join("assessments")
        .join(format!("child_progress_{year}.csv"));
    write_atomic(&progress_path, &progress_csv_bytes(&records)?).await?;

    let manifest_path = parquet_export::export_assessment_snapshots(
        &store.parquet_dir(),
        year,
        &baseline,
        &midline,
        &sessions,
    )?;

    let report_dir = store.reports_dir().join(run_id.to_string());
    let quality = render_derivation_report(run_id, year, &report);
    write_atomic(&report_dir.join("data_quality.md"), quality.as_bytes()).await?;

    let summary = DeriveSummary {
        run_id,
        year: year.to_string(),
        report,
        progress_csv: progress_path.display().to_string(),
        parquet_manifest: manifest_path.display().to_string(),
        report_dir: report_dir.display().to_string(),
    };
    let summary_json = serde_json::to_vec_pretty(&summary).context("serializing derive summary")?;
    write_atomic(&report_dir.join("run_summary.json"), &summary_json).await?;

    Ok(summary)
}
