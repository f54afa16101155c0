//! JSON tool API for programme consumers: an explicit tool registry served
//! over axum, with per-session context objects and a Postgres-first /
//! snapshot-fallback data loader.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::net::TcpListener;
use uuid::Uuid;
use zazi_pipeline::metrics::{benchmark_summary, load_benchmark_csv, BenchmarkRow, DEFAULT_BENCHMARK};

pub const CRATE_NAME: &str = "zazi-tools";

/// Snapshot files consulted when no database is configured, relative to the
/// data root.
pub const INITIAL_SCORES_SNAPSHOT: &str = "assessments/letter_scores_initial.csv";
pub const MIDLINE_SCORES_SNAPSHOT: &str = "assessments/letter_scores_midline.csv";

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Declared surface of one tool: name, human description and the JSON
/// schemas of its arguments and result. Served verbatim from `GET /tools`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: JsonValue,
    pub output_schema: JsonValue,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid tool arguments: {0}")]
    InvalidArguments(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub trait Tool: Send + Sync {
    fn spec(&self) -> &ToolSpec;
    fn invoke(&self, data: &AssessmentData, arguments: &JsonValue) -> Result<JsonValue, ToolError>;
}

/// Name → handler dispatch table. Registration is validated up front so a
/// bad tool set fails at startup, not on first call.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> anyhow::Result<()> {
        let name = tool.spec().name.clone();
        if name.trim().is_empty() {
            bail!("tool registered with an empty name");
        }
        if self.tools.contains_key(&name) {
            bail!("duplicate tool name: {name}");
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn specs(&self) -> Vec<&ToolSpec> {
        self.tools.values().map(|tool| tool.spec()).collect()
    }
}

/// Registry with the stock tool set.
pub fn default_registry() -> anyhow::Result<ToolRegistry> {
    let mut registry = ToolRegistry::default();
    registry.register(Arc::new(GradeBenchmarkTool::new()))?;
    Ok(registry)
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Per-session context. Sessions exist so a conversational consumer can be
/// reset without touching any other caller's state; there is no global
/// mutable tool state.
#[derive(Debug, Clone, Serialize)]
pub struct SessionContext {
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub invocations: Vec<SessionInvocation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInvocation {
    pub tool: String,
    pub at: DateTime<Utc>,
}

impl SessionContext {
    fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            created_at: Utc::now(),
            invocations: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.invocations.clear();
    }
}

type SessionStore = Arc<Mutex<HashMap<Uuid, SessionContext>>>;

/// Single lock policy for the session store: a poisoned lock is recovered,
/// since session contexts stay structurally valid even if a holder panicked.
fn lock_sessions(store: &SessionStore) -> std::sync::MutexGuard<'_, HashMap<Uuid, SessionContext>> {
    store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Data loading
// ---------------------------------------------------------------------------

/// Letter-score tables backing the benchmark tool, one row per child per
/// assessment round.
#[derive(Debug, Clone, Default)]
pub struct AssessmentData {
    pub initial: Vec<BenchmarkRow>,
    pub midline: Vec<BenchmarkRow>,
}

/// Load assessment data database-first: when `DATABASE_URL` is set and the
/// query yields rows, use those; otherwise fall back to the CSV snapshots
/// under the data root.
pub async fn load_assessment_data(data_root: &Path) -> anyhow::Result<AssessmentData> {
    if let Some(pool) = connect_db_from_env().await {
        match load_assessment_data_from_db(&pool).await {
            Ok(data) if !data.initial.is_empty() || !data.midline.is_empty() => return Ok(data),
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "database load failed; falling back to snapshots");
            }
        }
    }
    load_assessment_data_from_snapshots(data_root)
}

async fn connect_db_from_env() -> Option<PgPool> {
    let database_url = std::env::var("DATABASE_URL").ok()?;
    PgPool::connect(&database_url).await.ok()
}

async fn load_assessment_data_from_db(pool: &PgPool) -> anyhow::Result<AssessmentData> {
    let rows = sqlx::query(
        r#"
        SELECT school, grade, letters_correct, round
          FROM letter_assessments
         WHERE round IN ('initial', 'midline')
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut data = AssessmentData::default();
    for row in rows {
        let record = BenchmarkRow {
            school: row.try_get("school")?,
            grade: row.try_get("grade")?,
            letters_correct: row.try_get("letters_correct")?,
        };
        let round: String = row.try_get("round")?;
        match round.as_str() {
            "initial" => data.initial.push(record),
            _ => data.midline.push(record),
        }
    }
    Ok(data)
}

fn load_assessment_data_from_snapshots(data_root: &Path) -> anyhow::Result<AssessmentData> {
    let initial_path = data_root.join(INITIAL_SCORES_SNAPSHOT);
    let midline_path = data_root.join(MIDLINE_SCORES_SNAPSHOT);
    Ok(AssessmentData {
        initial: load_benchmark_csv(&initial_path)
            .with_context(|| format!("loading {}", initial_path.display()))?,
        midline: load_benchmark_csv(&midline_path)
            .with_context(|| format!("loading {}", midline_path.display()))?,
    })
}

// ---------------------------------------------------------------------------
// Benchmark tool
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GradeBenchmarkArgs {
    grade: String,
    school: Option<String>,
    benchmark: Option<f64>,
}

/// Percentage of children at or above the letter-knowledge benchmark in the
/// initial vs. midline assessment, for one grade and optionally one school.
pub struct GradeBenchmarkTool {
    spec: ToolSpec,
}

impl GradeBenchmarkTool {
    pub fn new() -> Self {
        Self {
            spec: ToolSpec {
                name: "grade_benchmark".to_string(),
                description: "Share of children at or above the letter-knowledge benchmark, \
                              initial vs. midline, for one grade and optionally one school."
                    .to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "grade": {"type": "string"},
                        "school": {"type": "string"},
                        "benchmark": {"type": "number", "default": DEFAULT_BENCHMARK}
                    },
                    "required": ["grade"]
                }),
                output_schema: json!({
                    "type": "object",
                    "properties": {
                        "grade": {"type": "string"},
                        "school": {"type": ["string", "null"]},
                        "benchmark": {"type": "number"},
                        "initial_above_benchmark_percent": {"type": "number"},
                        "midline_above_benchmark_percent": {"type": "number"},
                        "improvement": {"type": "number"},
                        "total_initial": {"type": "integer"},
                        "total_midline": {"type": "integer"},
                        "initial_schools_covered": {"type": "integer"},
                        "midline_schools_covered": {"type": "integer"}
                    }
                }),
            },
        }
    }
}

impl Default for GradeBenchmarkTool {
    fn default() -> Self {
        Self::new()
    }
}

impl Tool for GradeBenchmarkTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn invoke(&self, data: &AssessmentData, arguments: &JsonValue) -> Result<JsonValue, ToolError> {
        let args: GradeBenchmarkArgs = serde_json::from_value(arguments.clone())
            .map_err(|err| ToolError::InvalidArguments(err.to_string()))?;

        let summary = benchmark_summary(
            &data.initial,
            &data.midline,
            &args.grade,
            args.school.as_deref(),
            args.benchmark.unwrap_or(DEFAULT_BENCHMARK),
        );
        serde_json::to_value(summary)
            .context("serializing benchmark summary")
            .map_err(ToolError::Internal)
    }
}

// ---------------------------------------------------------------------------
// HTTP surface
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ToolRegistry>,
    pub data_root: PathBuf,
    sessions: SessionStore,
}

impl AppState {
    pub fn new(registry: ToolRegistry, data_root: impl Into<PathBuf>) -> Self {
        Self {
            registry: Arc::new(registry),
            data_root: data_root.into(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct InvokeRequest {
    #[serde(default)]
    session_id: Option<Uuid>,
    #[serde(default)]
    arguments: JsonValue,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/tools", get(list_tools_handler))
        .route("/tools/{name}", post(invoke_tool_handler))
        .route("/sessions", post(create_session_handler))
        .route("/sessions/{id}/reset", post(reset_session_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("ZAZI_TOOLS_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let data_root = std::env::var("ZAZI_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
    let state = AppState::new(default_registry()?, data_root);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

async fn list_tools_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({"tools": state.registry.specs()})).into_response()
}

async fn invoke_tool_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
    Json(request): Json<InvokeRequest>,
) -> Response {
    let Some(tool) = state.registry.get(&name) else {
        return error_response(StatusCode::NOT_FOUND, format!("unknown tool: {name}"));
    };

    // A supplied session id must refer to a live session; invocations are
    // recorded on it.
    if let Some(session_id) = request.session_id {
        let mut sessions = lock_sessions(&state.sessions);
        let Some(session) = sessions.get_mut(&session_id) else {
            return error_response(StatusCode::NOT_FOUND, format!("unknown session: {session_id}"));
        };
        session.invocations.push(SessionInvocation {
            tool: name.clone(),
            at: Utc::now(),
        });
    }

    let data = match load_assessment_data(&state.data_root).await {
        Ok(data) => data,
        Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };

    match tool.invoke(&data, &request.arguments) {
        Ok(result) => Json(json!({
            "tool": name,
            "session_id": request.session_id,
            "result": result,
        }))
        .into_response(),
        Err(ToolError::InvalidArguments(message)) => {
            error_response(StatusCode::UNPROCESSABLE_ENTITY, message)
        }
        Err(ToolError::Internal(err)) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

async fn create_session_handler(State(state): State<Arc<AppState>>) -> Response {
    let session = SessionContext::new();
    let session_id = session.session_id;
    lock_sessions(&state.sessions).insert(session_id, session);
    (StatusCode::CREATED, Json(json!({"session_id": session_id}))).into_response()
}

async fn reset_session_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    let mut sessions = lock_sessions(&state.sessions);
    match sessions.get_mut(&id) {
        Some(session) => {
            session.reset();
            Json(json!({"session_id": id, "invocations": 0})).into_response()
        }
        None => error_response(StatusCode::NOT_FOUND, format!("unknown session: {id}")),
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}
