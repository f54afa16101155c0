//! Survey API client, answer flattening and schema reconciliation for the
//! Mentor Visit Tracker instrument.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;
use zazi_core::{FlattenedRecord, ResponseMeta, SurveyVersion, UnifiedRecord};
use zazi_storage::{FetchError, HttpClient};

pub const CRATE_NAME: &str = "zazi-survey";

/// Fixed page size used against the survey API.
pub const PAGE_SIZE: u32 = 100;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One page of the survey responses endpoint:
/// `GET {base}/surveys/{id}/responses?page=N&per_page=100`.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponsePage {
    pub data: ResponseData,
    #[serde(default)]
    pub questions: Vec<QuestionDef>,
    pub meta: PageMeta,
    #[serde(default)]
    pub links: PageLinks,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseData {
    pub survey_responses: Vec<RawResponse>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuestionDef {
    pub id: JsonValue,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageMeta {
    pub current_page: u32,
    pub last_page: u32,
    pub total: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageLinks {
    pub next: Option<String>,
}

/// A raw survey response as delivered by the API. Immutable once fetched;
/// the pipeline never writes back.
#[derive(Debug, Clone, Deserialize)]
pub struct RawResponse {
    pub response_id: i64,
    pub response_uuid: String,
    pub user_id: Option<i64>,
    pub user_name: Option<String>,
    pub response_start_at: DateTime<Utc>,
    pub response_end_at: Option<DateTime<Utc>>,
    pub duration_minutes: Option<f64>,
    #[serde(default)]
    pub complete: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub answers: Vec<RawAnswer>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawAnswer {
    pub question_id: JsonValue,
    pub value: JsonValue,
}

/// Mapping from question id to stable column name, taken from the first
/// fetched page and assumed stable for every later page of that survey.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuestionMapping {
    columns: BTreeMap<String, String>,
}

impl QuestionMapping {
    pub fn from_questions(questions: &[QuestionDef]) -> Self {
        let columns = questions
            .iter()
            .map(|q| (json_id_to_string(&q.id), q.name.clone()))
            .collect();
        Self { columns }
    }

    pub fn column_for(&self, question_id: &str) -> Option<&str> {
        self.columns.get(question_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

fn json_id_to_string(id: &JsonValue) -> String {
    match id {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SurveyFetchError {
    #[error("fetching page {page} of survey {survey_id}: {source}")]
    Transport {
        survey_id: u32,
        page: u32,
        #[source]
        source: FetchError,
    },
    #[error("parsing page {page} of survey {survey_id}: {source}")]
    Parse {
        survey_id: u32,
        page: u32,
        #[source]
        source: serde_json::Error,
    },
}

/// Everything one successful survey fetch produces.
#[derive(Debug, Clone)]
pub struct SurveyFetch {
    pub version: SurveyVersion,
    pub records: Vec<RawResponse>,
    pub mapping: QuestionMapping,
    pub reported_total: u64,
    pub pages_fetched: u32,
}

/// Whether the pagination loop should request another page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStep {
    FetchNext,
    Done,
}

/// Accumulates parsed pages and owns the loop-termination rules, separate
/// from the transport so the pagination behaviour is testable on canned
/// pages. The question mapping is taken from the first absorbed page only.
#[derive(Debug)]
pub struct PageAccumulator {
    version: SurveyVersion,
    records: Vec<RawResponse>,
    mapping: QuestionMapping,
    reported_total: u64,
    pages_absorbed: u32,
}

impl PageAccumulator {
    pub fn new(version: SurveyVersion) -> Self {
        Self {
            version,
            records: Vec::new(),
            mapping: QuestionMapping::default(),
            reported_total: 0,
            pages_absorbed: 0,
        }
    }

    pub fn absorb(&mut self, page: ResponsePage) -> PageStep {
        self.pages_absorbed += 1;
        if self.pages_absorbed == 1 {
            self.mapping = QuestionMapping::from_questions(&page.questions);
        }
        self.reported_total = page.meta.total;

        // Defensive double-check: a page with no new records ends the loop
        // even if the API still advertises a next link.
        if page.data.survey_responses.is_empty() {
            return PageStep::Done;
        }
        self.records.extend(page.data.survey_responses);

        if page.links.next.is_none() {
            PageStep::Done
        } else {
            PageStep::FetchNext
        }
    }

    pub fn finish(self) -> SurveyFetch {
        SurveyFetch {
            version: self.version,
            records: self.records,
            mapping: self.mapping,
            reported_total: self.reported_total,
            pages_fetched: self.pages_absorbed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SurveyApiConfig {
    pub base_url: String,
}

/// Client for the survey analytics API. Pages are fetched strictly one at a
/// time; any transport or parse failure aborts the whole survey fetch and
/// discards pages accumulated so far.
pub struct SurveyApi {
    http: HttpClient,
    base_url: String,
}

impl SurveyApi {
    pub fn new(http: HttpClient, config: SurveyApiConfig) -> Self {
        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }

    fn page_url(&self, survey_id: u32, page: u32) -> String {
        format!(
            "{}/surveys/{}/responses?page={}&per_page={}",
            self.base_url, survey_id, page, PAGE_SIZE
        )
    }

    /// Fetch the full ordered response sequence for one survey, plus the
    /// question mapping observed on page 1. API-delivered order is preserved
    /// within and across pages.
    pub async fn fetch_survey(
        &self,
        run_id: Uuid,
        version: SurveyVersion,
    ) -> Result<SurveyFetch, SurveyFetchError> {
        let survey_id = version.survey_id();
        let mut accumulator = PageAccumulator::new(version);
        let mut page = 1u32;

        loop {
            let url = self.page_url(survey_id, page);
            let response = self
                .http
                .fetch_bytes(run_id, &url)
                .await
                .map_err(|source| SurveyFetchError::Transport {
                    survey_id,
                    page,
                    source,
                })?;

            let parsed = parse_response_page(&response.body).map_err(|source| {
                SurveyFetchError::Parse {
                    survey_id,
                    page,
                    source,
                }
            })?;

            match accumulator.absorb(parsed) {
                PageStep::FetchNext => page += 1,
                PageStep::Done => break,
            }
        }

        Ok(accumulator.finish())
    }
}

pub fn parse_response_page(bytes: &[u8]) -> Result<ResponsePage, serde_json::Error> {
    serde_json::from_slice(bytes)
}

// ---------------------------------------------------------------------------
// Flattening
// ---------------------------------------------------------------------------

/// Flatten raw responses into one row per response using the first-page
/// question mapping. Answers whose question id is absent from the mapping
/// are dropped (the mapping is assumed stable across pages); null and empty
/// answer values stay absent rather than becoming empty cells.
pub fn flatten_responses(responses: &[RawResponse], mapping: &QuestionMapping) -> Vec<FlattenedRecord> {
    let mut unmapped_questions = 0usize;
    let records = responses
        .iter()
        .map(|response| {
            let mut answers = BTreeMap::new();
            for answer in &response.answers {
                let question_id = json_id_to_string(&answer.question_id);
                let Some(column) = mapping.column_for(&question_id) else {
                    unmapped_questions += 1;
                    continue;
                };
                if let Some(value) = answer_value_to_string(&answer.value) {
                    answers.insert(column.to_string(), value);
                }
            }
            FlattenedRecord {
                meta: response_meta(response),
                answers,
            }
        })
        .collect();

    if unmapped_questions > 0 {
        warn!(
            unmapped_questions,
            "dropped answers whose question id was not on page 1"
        );
    }
    records
}

fn response_meta(response: &RawResponse) -> ResponseMeta {
    ResponseMeta {
        response_id: response.response_id,
        response_uuid: response.response_uuid.clone(),
        user_id: response.user_id,
        user_name: response.user_name.clone(),
        response_start_at: response.response_start_at,
        response_end_at: response.response_end_at,
        duration_minutes: response.duration_minutes,
        complete: response.complete,
        created_at: response.created_at,
        updated_at: response.updated_at,
    }
}

fn answer_value_to_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        // Multi-select answers arrive as arrays; join them the way the
        // capture tool renders them.
        JsonValue::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(answer_value_to_string).collect();
            (!parts.is_empty()).then(|| parts.join("; "))
        }
        JsonValue::Object(_) => Some(value.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Schema reconciliation
// ---------------------------------------------------------------------------

/// Question columns asked identically (exact text match) in both survey
/// generations. Hand-maintained; a wording change in the instrument must be
/// reflected here or the column splits in two.
pub const COMMON_COLUMNS: &[&str] = &[
    "Mentor Name",
    "School",
    "Date of Visit",
    "Grade",
    "TA Name",
    "Number of Children Present",
    "Letter Tracker Correct",
    "Commentary",
];

/// Columns that only ever existed in the old (612) instrument.
pub const OLD_ONLY_COLUMNS: &[&str] = &[
    "Paired Reading Observed",
    "Group Session Count",
    "Classroom Support Given",
];

/// Columns introduced by the new (677) instrument.
pub const NEW_ONLY_COLUMNS: &[&str] = &[
    "EGRA Checkpoint Completed",
    "Tablet Used",
    "Visit Rating",
    "Principal Engaged",
];

/// Union question schema in output order: common, then old-only, then
/// new-only.
pub fn unified_columns() -> Vec<&'static str> {
    COMMON_COLUMNS
        .iter()
        .chain(OLD_ONLY_COLUMNS)
        .chain(NEW_ONLY_COLUMNS)
        .copied()
        .collect()
}

/// The columns a record from the given survey generation may populate.
pub fn columns_for(version: SurveyVersion) -> Vec<&'static str> {
    let version_only = match version {
        SurveyVersion::Old612 => OLD_ONLY_COLUMNS,
        SurveyVersion::New677 => NEW_ONLY_COLUMNS,
    };
    COMMON_COLUMNS.iter().chain(version_only).copied().collect()
}

/// Side output of reconciliation: data columns not covered by any static
/// list, with occurrence counts. These are excluded from the unified output
/// but reported rather than silently discarded.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub records: usize,
    pub unrecognized_columns: BTreeMap<String, usize>,
}

/// Align flattened records from one survey generation to the unified schema.
/// Columns from the static lists that a record does not carry remain null by
/// omission; columns outside the lists are dropped and counted.
pub fn reconcile(
    records: Vec<FlattenedRecord>,
    version: SurveyVersion,
) -> (Vec<UnifiedRecord>, ReconcileReport) {
    let allowed = columns_for(version);
    let mut report = ReconcileReport {
        records: records.len(),
        ..ReconcileReport::default()
    };

    let unified = records
        .into_iter()
        .map(|record| {
            let mut answers = BTreeMap::new();
            for (column, value) in record.answers {
                if allowed.iter().any(|allowed_col| *allowed_col == column) {
                    answers.insert(column, value);
                } else {
                    *report.unrecognized_columns.entry(column).or_default() += 1;
                }
            }
            UnifiedRecord {
                meta: record.meta,
                survey_source: version,
                answers,
            }
        })
        .collect();

    for (column, count) in &report.unrecognized_columns {
        warn!(
            column = column.as_str(),
            count, "column present in fetched data but absent from the static schema lists"
        );
    }

    (unified, report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_page_json(next: Option<&str>) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "data": {
                "survey_responses": [
                    {
                        "response_id": 9001,
                        "response_uuid": "7f6d3c9a-1",
                        "user_id": 42,
                        "user_name": "Nosipho M",
                        "response_start_at": "2026-03-02T08:05:00Z",
                        "response_end_at": "2026-03-02T08:35:00Z",
                        "duration_minutes": 30.0,
                        "complete": true,
                        "created_at": "2026-03-02T08:36:00Z",
                        "updated_at": "2026-03-02T08:36:00Z",
                        "answers": [
                            {"question_id": "q_school", "value": "Emafini Primary"},
                            {"question_id": "q_grade", "value": "Grade 1"},
                            {"question_id": "q_children", "value": 7},
                            {"question_id": "q_comment", "value": null}
                        ]
                    }
                ]
            },
            "questions": [
                {"id": "q_school", "name": "School"},
                {"id": "q_grade", "name": "Grade"},
                {"id": "q_children", "name": "Number of Children Present"},
                {"id": "q_comment", "name": "Commentary"}
            ],
            "meta": {"current_page": 1, "last_page": 3, "total": 215},
            "links": {"next": next}
        }))
        .unwrap()
    }

    fn canned_page(ids: &[i64], total: u64, next: Option<&str>, question_name: &str) -> ResponsePage {
        let responses: Vec<serde_json::Value> = ids
            .iter()
            .map(|id| {
                json!({
                    "response_id": id,
                    "response_uuid": format!("uuid-{id}"),
                    "response_start_at": "2026-03-02T08:05:00Z",
                    "complete": true,
                    "answers": []
                })
            })
            .collect();
        serde_json::from_value(json!({
            "data": {"survey_responses": responses},
            "questions": [{"id": "q_school", "name": question_name}],
            "meta": {"current_page": 1, "last_page": 3, "total": total},
            "links": {"next": next}
        }))
        .unwrap()
    }

    #[test]
    fn pagination_accumulates_pages_up_to_the_reported_total() {
        let mut accumulator = PageAccumulator::new(SurveyVersion::Old612);
        assert_eq!(
            accumulator.absorb(canned_page(&[1, 2], 5, Some("page=2"), "School")),
            PageStep::FetchNext
        );
        assert_eq!(
            accumulator.absorb(canned_page(&[3, 4], 5, Some("page=3"), "Renamed Later")),
            PageStep::FetchNext
        );
        assert_eq!(
            accumulator.absorb(canned_page(&[5], 5, None, "Renamed Later")),
            PageStep::Done
        );

        let fetch = accumulator.finish();
        assert_eq!(fetch.records.len() as u64, fetch.reported_total);
        assert_eq!(fetch.pages_fetched, 3);
        // API-delivered order survives across pages.
        let ids: Vec<i64> = fetch.records.iter().map(|r| r.response_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        // The mapping comes from page 1; later pages never rewrite it.
        assert_eq!(fetch.mapping.column_for("q_school"), Some("School"));
    }

    #[test]
    fn pagination_stops_when_no_next_link_is_present() {
        let mut accumulator = PageAccumulator::new(SurveyVersion::New677);
        assert_eq!(
            accumulator.absorb(canned_page(&[1, 2], 2, None, "School")),
            PageStep::Done
        );
        assert_eq!(accumulator.finish().records.len(), 2);
    }

    #[test]
    fn pagination_stops_on_an_empty_page_despite_a_next_link() {
        let mut accumulator = PageAccumulator::new(SurveyVersion::Old612);
        assert_eq!(
            accumulator.absorb(canned_page(&[1, 2], 2, Some("page=2"), "School")),
            PageStep::FetchNext
        );
        assert_eq!(
            accumulator.absorb(canned_page(&[], 2, Some("page=3"), "School")),
            PageStep::Done
        );

        let fetch = accumulator.finish();
        assert_eq!(fetch.records.len(), 2);
        assert_eq!(fetch.pages_fetched, 2);
    }

    #[test]
    fn parses_the_documented_page_shape() {
        let page = parse_response_page(&sample_page_json(Some("/surveys/612/responses?page=2"))).unwrap();
        assert_eq!(page.meta.total, 215);
        assert_eq!(page.meta.last_page, 3);
        assert_eq!(page.data.survey_responses.len(), 1);
        assert!(page.links.next.is_some());

        let mapping = QuestionMapping::from_questions(&page.questions);
        assert_eq!(mapping.len(), 4);
        assert_eq!(mapping.column_for("q_school"), Some("School"));
    }

    #[test]
    fn last_page_carries_no_next_link() {
        let page = parse_response_page(&sample_page_json(None)).unwrap();
        assert!(page.links.next.is_none());
    }

    #[test]
    fn flattening_is_deterministic() {
        let page = parse_response_page(&sample_page_json(None)).unwrap();
        let mapping = QuestionMapping::from_questions(&page.questions);

        let first = flatten_responses(&page.data.survey_responses, &mapping);
        let second = flatten_responses(&page.data.survey_responses, &mapping);
        assert_eq!(first, second);
    }

    #[test]
    fn flattening_keeps_null_answers_absent() {
        let page = parse_response_page(&sample_page_json(None)).unwrap();
        let mapping = QuestionMapping::from_questions(&page.questions);
        let records = flatten_responses(&page.data.survey_responses, &mapping);

        let record = &records[0];
        assert_eq!(record.answer("School"), Some("Emafini Primary"));
        assert_eq!(record.answer("Number of Children Present"), Some("7"));
        // Null answer value: absent, not an empty string.
        assert_eq!(record.answer("Commentary"), None);
    }

    #[test]
    fn flattening_drops_question_ids_unseen_on_page_one() {
        let page = parse_response_page(&sample_page_json(None)).unwrap();
        let mapping = QuestionMapping::from_questions(&page.questions[..2]);
        let records = flatten_responses(&page.data.survey_responses, &mapping);

        assert_eq!(records[0].answer("School"), Some("Emafini Primary"));
        assert_eq!(records[0].answer("Number of Children Present"), None);
    }

    #[test]
    fn unified_schema_is_the_union_of_the_static_lists() {
        let columns = unified_columns();
        assert_eq!(
            columns.len(),
            COMMON_COLUMNS.len() + OLD_ONLY_COLUMNS.len() + NEW_ONLY_COLUMNS.len()
        );
        for column in COMMON_COLUMNS.iter().chain(OLD_ONLY_COLUMNS).chain(NEW_ONLY_COLUMNS) {
            assert!(columns.contains(column));
        }
    }

    #[test]
    fn reconcile_counts_unrecognized_columns_and_drops_them() {
        let page = parse_response_page(&sample_page_json(None)).unwrap();
        let mapping = QuestionMapping::from_questions(&page.questions);
        let mut records = flatten_responses(&page.data.survey_responses, &mapping);
        records[0]
            .answers
            .insert("Weather During Visit".to_string(), "Sunny".to_string());

        let (unified, report) = reconcile(records, SurveyVersion::Old612);
        assert_eq!(unified.len(), 1);
        assert_eq!(report.records, 1);
        assert_eq!(report.unrecognized_columns.get("Weather During Visit"), Some(&1));
        assert_eq!(unified[0].answer("Weather During Visit"), None);
        assert_eq!(unified[0].answer("School"), Some("Emafini Primary"));
    }

    #[test]
    fn old_records_never_populate_new_only_columns() {
        let page = parse_response_page(&sample_page_json(None)).unwrap();
        let mapping = QuestionMapping::from_questions(&page.questions);
        let mut records = flatten_responses(&page.data.survey_responses, &mapping);
        records[0]
            .answers
            .insert("Tablet Used".to_string(), "Yes".to_string());

        let (unified, report) = reconcile(records, SurveyVersion::Old612);
        assert_eq!(unified[0].answer("Tablet Used"), None);
        assert_eq!(report.unrecognized_columns.get("Tablet Used"), Some(&1));
        assert_eq!(unified[0].survey_source, SurveyVersion::Old612);
    }
}
