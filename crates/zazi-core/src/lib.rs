//! Core domain model for the Zazi iZandi monitoring toolkit.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "zazi-core";

/// The two generations of the Mentor Visit Tracker instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SurveyVersion {
    Old612,
    New677,
}

impl SurveyVersion {
    pub fn survey_id(&self) -> u32 {
        match self {
            SurveyVersion::Old612 => 612,
            SurveyVersion::New677 => 677,
        }
    }

    /// Provenance label carried in the merged table's `survey_source` column.
    pub fn source_label(&self) -> &'static str {
        match self {
            SurveyVersion::Old612 => "Old Survey (612)",
            SurveyVersion::New677 => "New Survey (677)",
        }
    }

    /// Stem for timestamped snapshot file names.
    pub fn snapshot_stem(&self) -> &'static str {
        match self {
            SurveyVersion::Old612 => "survey612_old",
            SurveyVersion::New677 => "survey677_new",
        }
    }

    /// Name of the rolling "latest" snapshot for this survey.
    pub fn latest_snapshot_name(&self) -> &'static str {
        match self {
            SurveyVersion::Old612 => "latest_old.csv",
            SurveyVersion::New677 => "latest_new.csv",
        }
    }
}

/// Response-level metadata shared by every survey generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub response_id: i64,
    pub response_uuid: String,
    pub user_id: Option<i64>,
    pub user_name: Option<String>,
    pub response_start_at: DateTime<Utc>,
    pub response_end_at: Option<DateTime<Utc>>,
    pub duration_minutes: Option<f64>,
    pub complete: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Ordered metadata column names, matching `ResponseMeta` field order.
pub const METADATA_COLUMNS: &[&str] = &[
    "Response ID",
    "Response UUID",
    "User ID",
    "User Name",
    "Response Start",
    "Response End",
    "Duration (minutes)",
    "Complete",
    "Created At",
    "Updated At",
];

/// One row per survey response: metadata plus one entry per answered
/// question, keyed by the column name from the question mapping. Unanswered
/// questions are simply absent (null), never empty strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlattenedRecord {
    pub meta: ResponseMeta,
    pub answers: BTreeMap<String, String>,
}

impl FlattenedRecord {
    pub fn answer(&self, column: &str) -> Option<&str> {
        self.answers.get(column).map(String::as_str)
    }
}

/// A record aligned to the unified cross-survey schema. Answers hold only
/// columns from the static common/old-only/new-only lists; a column missing
/// from the map is a null cell. A record from the old survey never carries
/// new-only answers and vice versa.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedRecord {
    pub meta: ResponseMeta,
    pub survey_source: SurveyVersion,
    pub answers: BTreeMap<String, String>,
}

impl UnifiedRecord {
    pub fn answer(&self, column: &str) -> Option<&str> {
        self.answers.get(column).map(String::as_str)
    }
}

/// The fixed letter columns of the assessment instrument, in the programme's
/// teaching order. Hand-maintained like the survey schema lists.
pub const LETTER_COLUMNS: &[&str] = &[
    "a", "e", "i", "o", "u", "b", "l", "m", "k", "s", "n", "z", "h", "d", "w",
    "y", "f", "g", "v", "p", "t", "x", "c", "j", "q", "r",
];

/// Bucket classification of a child by count of known letters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LetterCohort {
    #[serde(rename = "0-5")]
    ZeroToFive,
    #[serde(rename = "6-12")]
    SixToTwelve,
    #[serde(rename = "13-18")]
    ThirteenToEighteen,
    #[serde(rename = "19+")]
    NineteenPlus,
}

impl LetterCohort {
    pub fn from_letters_known(letters_known: u32) -> Self {
        if letters_known < 6 {
            LetterCohort::ZeroToFive
        } else if letters_known < 13 {
            LetterCohort::SixToTwelve
        } else if letters_known < 19 {
            LetterCohort::ThirteenToEighteen
        } else {
            LetterCohort::NineteenPlus
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            LetterCohort::ZeroToFive => "0-5",
            LetterCohort::SixToTwelve => "6-12",
            LetterCohort::ThirteenToEighteen => "13-18",
            LetterCohort::NineteenPlus => "19+",
        }
    }
}

/// Grade values arrive with stray whitespace from the capture sheets; trim
/// before any equality filtering so "Grade 1 " and "Grade 1" compare equal.
pub fn normalize_grade(raw: &str) -> String {
    raw.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letter_column_set_is_complete() {
        assert_eq!(LETTER_COLUMNS.len(), 26);
        let mut sorted: Vec<_> = LETTER_COLUMNS.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 26);
    }

    #[test]
    fn cohort_boundaries() {
        assert_eq!(LetterCohort::from_letters_known(0).label(), "0-5");
        assert_eq!(LetterCohort::from_letters_known(5).label(), "0-5");
        assert_eq!(LetterCohort::from_letters_known(6).label(), "6-12");
        assert_eq!(LetterCohort::from_letters_known(12).label(), "6-12");
        assert_eq!(LetterCohort::from_letters_known(13).label(), "13-18");
        assert_eq!(LetterCohort::from_letters_known(18).label(), "13-18");
        assert_eq!(LetterCohort::from_letters_known(19).label(), "19+");
        assert_eq!(LetterCohort::from_letters_known(26).label(), "19+");
    }

    #[test]
    fn grade_normalization_trims_whitespace() {
        assert_eq!(normalize_grade("Grade 1 "), "Grade 1");
        assert_eq!(normalize_grade(" Grade R"), "Grade R");
        assert_eq!(normalize_grade("Grade 1"), normalize_grade("Grade 1 "));
    }

    #[test]
    fn source_labels_match_survey_ids() {
        assert_eq!(SurveyVersion::Old612.survey_id(), 612);
        assert_eq!(SurveyVersion::New677.survey_id(), 677);
        assert_eq!(SurveyVersion::Old612.source_label(), "Old Survey (612)");
        assert_eq!(SurveyVersion::New677.source_label(), "New Survey (677)");
    }
}
