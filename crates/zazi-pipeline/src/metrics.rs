//! Per-child literacy metric derivation: letters known, cohort buckets,
//! improvement deltas and the benchmark summary consumed by the tool layer.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{bail, Context};
use serde::Serialize;
use zazi_core::{normalize_grade, LetterCohort, LETTER_COLUMNS};

/// One assessment snapshot row, keyed by the stable per-child `Mcode`.
/// Baseline and midline states arrive as separate rows in separate tables.
#[derive(Debug, Clone, PartialEq)]
pub struct AssessmentRow {
    pub mcode: String,
    pub grade: String,
    pub school: String,
    pub captured: bool,
    /// Letter columns with a non-null mark for this child.
    pub known_letters: BTreeSet<String>,
    pub egra: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionRow {
    pub mcode: String,
    pub total_sessions: u32,
}

/// Letters known is only defined for captured rows. An uncaptured row keeps
/// a null count so "not assessed" never collapses into "assessed, zero
/// known", whatever its letter columns contain.
pub fn letters_known(row: &AssessmentRow) -> Option<u32> {
    if !row.captured {
        return None;
    }
    let count = LETTER_COLUMNS
        .iter()
        .filter(|letter| row.known_letters.contains(**letter))
        .count();
    Some(count as u32)
}

/// The midline table augmented with derived metrics, one row per child that
/// had a matching baseline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChildProgressRecord {
    pub mcode: String,
    pub grade: String,
    pub school: String,
    pub baseline_letters_known: Option<u32>,
    pub midline_letters_known: Option<u32>,
    pub baseline_cohort: Option<LetterCohort>,
    pub midline_cohort: Option<LetterCohort>,
    pub egra_baseline: Option<f64>,
    pub egra_midline: Option<f64>,
    pub letters_learned: Option<i64>,
    pub egra_improvement_agg: Option<f64>,
    pub egra_improvement_pct: Option<f64>,
    pub total_sessions: Option<u32>,
}

/// Join accounting for the derivation run, surfaced in the data-quality
/// report instead of silently shrinking row counts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeriveReport {
    pub midline_rows: usize,
    pub derived_rows: usize,
    pub midline_without_baseline: usize,
    pub children_without_sessions: usize,
}

/// Join midline to baseline on `Mcode` (unmatched midline rows are dropped
/// and counted), then left-join session counts, and compute the derived
/// metrics.
pub fn derive_progress(
    baseline: &[AssessmentRow],
    midline: &[AssessmentRow],
    sessions: &[SessionRow],
) -> (Vec<ChildProgressRecord>, DeriveReport) {
    let baseline_by_mcode: BTreeMap<&str, &AssessmentRow> = baseline
        .iter()
        .map(|row| (row.mcode.as_str(), row))
        .collect();
    let sessions_by_mcode: BTreeMap<&str, u32> = sessions
        .iter()
        .map(|row| (row.mcode.as_str(), row.total_sessions))
        .collect();

    let mut report = DeriveReport {
        midline_rows: midline.len(),
        ..DeriveReport::default()
    };
    let mut records = Vec::with_capacity(midline.len());

    for mid in midline {
        let Some(base) = baseline_by_mcode.get(mid.mcode.as_str()) else {
            report.midline_without_baseline += 1;
            continue;
        };

        let baseline_letters_known = letters_known(base);
        let midline_letters_known = letters_known(mid);

        let total_sessions = sessions_by_mcode.get(mid.mcode.as_str()).copied();
        if total_sessions.is_none() {
            report.children_without_sessions += 1;
        }

        // Improvement metrics exist only where a midline EGRA score was
        // recorded.
        let (letters_learned, egra_improvement_agg, egra_improvement_pct) = match mid.egra {
            Some(egra_midline) => {
                let letters_learned = match (midline_letters_known, baseline_letters_known) {
                    (Some(m), Some(b)) => Some(i64::from(m) - i64::from(b)),
                    _ => None,
                };
                let agg = base.egra.map(|egra_baseline| egra_midline - egra_baseline);
                let pct = base.egra.map(|egra_baseline| {
                    egra_improvement_pct(egra_baseline, egra_midline)
                });
                (letters_learned, agg, pct)
            }
            None => (None, None, None),
        };

        records.push(ChildProgressRecord {
            mcode: mid.mcode.clone(),
            grade: normalize_grade(&mid.grade),
            school: mid.school.trim().to_string(),
            baseline_letters_known,
            midline_letters_known,
            baseline_cohort: baseline_letters_known.map(LetterCohort::from_letters_known),
            midline_cohort: midline_letters_known.map(LetterCohort::from_letters_known),
            egra_baseline: base.egra,
            egra_midline: mid.egra,
            letters_learned,
            egra_improvement_agg,
            egra_improvement_pct,
            total_sessions,
        });
    }

    report.derived_rows = records.len();
    (records, report)
}

/// Percentage improvement against an adjusted baseline: a zero baseline is
/// replaced with 1 rather than skipped, preserving numeric parity with
/// historical reports even though it understates true from-zero gains.
pub fn egra_improvement_pct(egra_baseline: f64, egra_midline: f64) -> f64 {
    let adjusted = if egra_baseline == 0.0 { 1.0 } else { egra_baseline };
    (egra_midline - adjusted) / adjusted * 100.0
}

// ---------------------------------------------------------------------------
// Benchmark summary (consumer query surface)
// ---------------------------------------------------------------------------

/// Minimal per-child view used by the benchmark tool: letters identified
/// correctly in the timed EGRA task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkRow {
    pub school: String,
    pub grade: String,
    pub letters_correct: f64,
}

/// Output contract of the benchmark tool. Field names are part of the tool
/// schema consumed by agent-based clients; do not rename.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkSummary {
    pub grade: String,
    pub school: Option<String>,
    pub benchmark: f64,
    pub initial_above_benchmark_percent: f64,
    pub midline_above_benchmark_percent: f64,
    pub improvement: f64,
    pub total_initial: usize,
    pub total_midline: usize,
    pub initial_schools_covered: usize,
    pub midline_schools_covered: usize,
}

pub const DEFAULT_BENCHMARK: f64 = 40.0;

/// Percentage of students at or above the letter-knowledge benchmark in the
/// initial vs. midline assessment, for one grade and optionally one school.
pub fn benchmark_summary(
    initial: &[BenchmarkRow],
    midline: &[BenchmarkRow],
    grade: &str,
    school: Option<&str>,
    benchmark: f64,
) -> BenchmarkSummary {
    let grade = normalize_grade(grade);
    let filter = |rows: &[BenchmarkRow]| -> Vec<BenchmarkRow> {
        rows.iter()
            .filter(|row| normalize_grade(&row.grade) == grade)
            .filter(|row| school.map_or(true, |s| row.school.trim() == s.trim()))
            .cloned()
            .collect()
    };

    let initial_rows = filter(initial);
    let midline_rows = filter(midline);

    let initial_pct = percent_at_or_above(&initial_rows, benchmark);
    let midline_pct = percent_at_or_above(&midline_rows, benchmark);

    BenchmarkSummary {
        grade,
        school: school.map(|s| s.trim().to_string()),
        benchmark,
        initial_above_benchmark_percent: initial_pct,
        midline_above_benchmark_percent: midline_pct,
        improvement: midline_pct - initial_pct,
        total_initial: initial_rows.len(),
        total_midline: midline_rows.len(),
        initial_schools_covered: distinct_schools(&initial_rows),
        midline_schools_covered: distinct_schools(&midline_rows),
    }
}

fn percent_at_or_above(rows: &[BenchmarkRow], benchmark: f64) -> f64 {
    if rows.is_empty() {
        return 0.0;
    }
    let above = rows.iter().filter(|row| row.letters_correct >= benchmark).count();
    above as f64 / rows.len() as f64 * 100.0
}

fn distinct_schools(rows: &[BenchmarkRow]) -> usize {
    rows.iter()
        .map(|row| row.school.trim())
        .collect::<BTreeSet<_>>()
        .len()
}

// ---------------------------------------------------------------------------
// CSV loaders for the spreadsheet-sourced tables
// ---------------------------------------------------------------------------

const ASSESSMENT_FIXED_COLUMNS: &[&str] = &["Mcode", "Grade", "School", "Captured", "EGRA"];

/// Read an assessment table (baseline or midline). Expects the fixed columns
/// `Mcode,Grade,School,Captured,EGRA` plus any subset of the letter columns;
/// a non-empty letter cell marks the letter as known.
pub fn load_assessment_csv(path: &Path) -> anyhow::Result<Vec<AssessmentRow>> {
    let (header, rows) = zazi_storage::read_csv_table(path)?;
    let index = column_index(&header);
    for required in ASSESSMENT_FIXED_COLUMNS {
        if !index.contains_key(*required) {
            bail!("assessment table {} is missing column {required}", path.display());
        }
    }

    let letter_positions: Vec<(&str, usize)> = LETTER_COLUMNS
        .iter()
        .filter_map(|letter| index.get(*letter).map(|pos| (*letter, *pos)))
        .collect();

    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        let cell = |name: &str| -> Option<&str> {
            index.get(name).and_then(|pos| row.get(*pos)).and_then(|c| c.as_deref())
        };
        let mcode = cell("Mcode")
            .with_context(|| format!("assessment row without Mcode in {}", path.display()))?
            .to_string();
        let known_letters = letter_positions
            .iter()
            .filter(|(_, pos)| row.get(*pos).is_some_and(|c| c.is_some()))
            .map(|(letter, _)| letter.to_string())
            .collect();
        out.push(AssessmentRow {
            mcode,
            grade: cell("Grade").map(normalize_grade).unwrap_or_default(),
            school: cell("School").unwrap_or_default().trim().to_string(),
            captured: cell("Captured").is_some_and(parse_flag),
            known_letters,
            egra: cell("EGRA").and_then(|v| v.parse::<f64>().ok()),
        });
    }
    Ok(out)
}

/// Read the per-child session-count table (`Mcode,Total Sessions`).
pub fn load_sessions_csv(path: &Path) -> anyhow::Result<Vec<SessionRow>> {
    let (header, rows) = zazi_storage::read_csv_table(path)?;
    let index = column_index(&header);
    for required in ["Mcode", "Total Sessions"] {
        if !index.contains_key(required) {
            bail!("session table {} is missing column {required}", path.display());
        }
    }

    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        let cell = |name: &str| -> Option<&str> {
            index.get(name).and_then(|pos| row.get(*pos)).and_then(|c| c.as_deref())
        };
        let Some(mcode) = cell("Mcode") else { continue };
        out.push(SessionRow {
            mcode: mcode.to_string(),
            total_sessions: cell("Total Sessions")
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(0),
        });
    }
    Ok(out)
}

/// Read a benchmark input table (`School,Grade,Letters Correct`). Rows
/// without a parsable score are skipped.
pub fn load_benchmark_csv(path: &Path) -> anyhow::Result<Vec<BenchmarkRow>> {
    let (header, rows) = zazi_storage::read_csv_table(path)?;
    let index = column_index(&header);
    for required in ["School", "Grade", "Letters Correct"] {
        if !index.contains_key(required) {
            bail!("benchmark table {} is missing column {required}", path.display());
        }
    }

    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        let cell = |name: &str| -> Option<&str> {
            index.get(name).and_then(|pos| row.get(*pos)).and_then(|c| c.as_deref())
        };
        let Some(letters_correct) = cell("Letters Correct").and_then(|v| v.parse::<f64>().ok())
        else {
            continue;
        };
        out.push(BenchmarkRow {
            school: cell("School").unwrap_or_default().trim().to_string(),
            grade: cell("Grade").map(normalize_grade).unwrap_or_default(),
            letters_correct,
        });
    }
    Ok(out)
}

fn column_index(header: &[String]) -> BTreeMap<&str, usize> {
    header
        .iter()
        .enumerate()
        .map(|(pos, name)| (name.as_str(), pos))
        .collect()
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "true" | "True" | "TRUE" | "1" | "Yes" | "yes" | "Y")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assessment(mcode: &str, captured: bool, letters: &[&str], egra: Option<f64>) -> AssessmentRow {
        AssessmentRow {
            mcode: mcode.to_string(),
            grade: "Grade 1".to_string(),
            school: "Emafini Primary".to_string(),
            captured,
            known_letters: letters.iter().map(ToString::to_string).collect(),
            egra,
        }
    }

    #[test]
    fn uncaptured_rows_keep_letters_known_null() {
        // Letter marks are present, but the row was never assessed.
        let row = assessment("M001", false, &["a", "e", "i"], Some(12.0));
        assert_eq!(letters_known(&row), None);
    }

    #[test]
    fn captured_rows_count_letter_marks() {
        let row = assessment("M001", true, &["a", "e", "i"], None);
        assert_eq!(letters_known(&row), Some(3));
        let empty = assessment("M002", true, &[], None);
        assert_eq!(letters_known(&empty), Some(0));
    }

    #[test]
    fn marks_outside_the_letter_set_are_ignored() {
        let mut row = assessment("M001", true, &["a", "e"], None);
        row.known_letters.insert("Comments".to_string());
        assert_eq!(letters_known(&row), Some(2));
    }

    #[test]
    fn zero_baseline_is_adjusted_not_skipped() {
        assert_eq!(egra_improvement_pct(0.0, 10.0), 900.0);
        assert_eq!(egra_improvement_pct(5.0, 10.0), 100.0);
    }

    #[test]
    fn midline_without_baseline_is_dropped_and_counted() {
        let baseline = vec![assessment("M001", true, &["a"], Some(4.0))];
        let midline = vec![
            assessment("M001", true, &["a", "e"], Some(8.0)),
            assessment("M999", true, &["a"], Some(2.0)),
        ];
        let (records, report) = derive_progress(&baseline, &midline, &[]);

        assert_eq!(records.len(), 1);
        assert_eq!(report.midline_rows, 2);
        assert_eq!(report.derived_rows, 1);
        assert_eq!(report.midline_without_baseline, 1);
        assert_eq!(report.children_without_sessions, 1);
    }

    #[test]
    fn improvement_metrics_require_a_midline_egra_score() {
        let baseline = vec![assessment("M001", true, &["a"], Some(4.0))];
        let midline = vec![assessment("M001", true, &["a", "e", "o"], None)];
        let (records, _) = derive_progress(&baseline, &midline, &[]);

        let record = &records[0];
        assert_eq!(record.midline_letters_known, Some(3));
        assert_eq!(record.letters_learned, None);
        assert_eq!(record.egra_improvement_agg, None);
        assert_eq!(record.egra_improvement_pct, None);
    }

    #[test]
    fn derived_fields_combine_joins_and_formulas() {
        let baseline = vec![assessment("M001", true, &["a", "e"], Some(0.0))];
        let midline = vec![assessment("M001", true, &["a", "e", "i", "o", "u", "b"], Some(10.0))];
        let sessions = vec![SessionRow {
            mcode: "M001".to_string(),
            total_sessions: 21,
        }];
        let (records, report) = derive_progress(&baseline, &midline, &sessions);

        let record = &records[0];
        assert_eq!(record.baseline_letters_known, Some(2));
        assert_eq!(record.midline_letters_known, Some(6));
        assert_eq!(record.baseline_cohort, Some(LetterCohort::ZeroToFive));
        assert_eq!(record.midline_cohort, Some(LetterCohort::SixToTwelve));
        assert_eq!(record.letters_learned, Some(4));
        assert_eq!(record.egra_improvement_agg, Some(10.0));
        assert_eq!(record.egra_improvement_pct, Some(900.0));
        assert_eq!(record.total_sessions, Some(21));
        assert_eq!(report.children_without_sessions, 0);
    }

    #[test]
    fn uncaptured_midline_blocks_letters_learned_but_not_egra_deltas() {
        let baseline = vec![assessment("M001", true, &["a", "e"], Some(4.0))];
        let midline = vec![assessment("M001", false, &["a", "e", "i"], Some(9.0))];
        let (records, _) = derive_progress(&baseline, &midline, &[]);

        let record = &records[0];
        assert_eq!(record.midline_letters_known, None);
        assert_eq!(record.midline_cohort, None);
        assert_eq!(record.letters_learned, None);
        assert_eq!(record.egra_improvement_agg, Some(5.0));
        assert_eq!(record.egra_improvement_pct, Some(125.0));
    }

    fn benchmark_row(school: &str, grade: &str, letters_correct: f64) -> BenchmarkRow {
        BenchmarkRow {
            school: school.to_string(),
            grade: grade.to_string(),
            letters_correct,
        }
    }

    #[test]
    fn benchmark_scenario_from_the_tool_contract() {
        let initial = vec![
            benchmark_row("A", "Grade 1", 35.0),
            benchmark_row("A", "Grade 1", 45.0),
        ];
        let midline = vec![
            benchmark_row("A", "Grade 1", 50.0),
            benchmark_row("A", "Grade 1", 55.0),
        ];

        let summary = benchmark_summary(&initial, &midline, "Grade 1", None, 40.0);
        assert_eq!(summary.initial_above_benchmark_percent, 50.0);
        assert_eq!(summary.midline_above_benchmark_percent, 100.0);
        assert_eq!(summary.improvement, 50.0);
        assert_eq!(summary.total_initial, 2);
        assert_eq!(summary.total_midline, 2);
        assert_eq!(summary.initial_schools_covered, 1);
        assert_eq!(summary.midline_schools_covered, 1);
    }

    #[test]
    fn benchmark_filters_by_trimmed_grade_and_school() {
        let initial = vec![
            benchmark_row("A", "Grade 1 ", 45.0),
            benchmark_row("B", "Grade 1", 45.0),
            benchmark_row("A", "Grade R", 45.0),
        ];
        let summary = benchmark_summary(&initial, &[], "Grade 1", Some("A"), 40.0);
        assert_eq!(summary.total_initial, 1);
        assert_eq!(summary.initial_above_benchmark_percent, 100.0);
        assert_eq!(summary.initial_schools_covered, 1);
        assert_eq!(summary.total_midline, 0);
        assert_eq!(summary.midline_above_benchmark_percent, 0.0);
    }
}
