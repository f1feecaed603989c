//! # Pipeline API
//!
//! Start, observe, approve and cancel pipeline runs.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use outreach_core::config::PipelineConfig;
use outreach_core::state::{ErrorLog, PipelineErrorRecord, TaskRecord};
use outreach_core::swarm::{ApprovalDecisions, RunSnapshot, RunStatus};
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;
use utoipa::ToSchema;

use super::{api_error, pipeline_error, ApiError, ApiResponse};
use crate::SharedState;

/// Comment sent on an idle event stream
const HEARTBEAT: Duration = Duration::from_secs(15);

const DEFAULT_ERROR_LIMIT: usize = 50;

#[derive(Debug, Deserialize, ToSchema)]
pub struct StartRunRequest {
    pub batch_number: u32,
    /// Pipeline configuration; omitted fields take their defaults
    #[serde(default)]
    #[schema(value_type = Object)]
    pub config: Option<PipelineConfig>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct ApprovalRequest {
    /// Artifact id -> `approve` | `reject` | `edit`. Missing artifacts are approved.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub decisions: ApprovalDecisions,
}

#[derive(Debug, Deserialize)]
pub struct ErrorQuery {
    pub batch_id: Option<String>,
    pub limit: Option<usize>,
}

pub fn pipeline_routes() -> Router<SharedState> {
    Router::new()
        .route("/start", post(start_run))
        .route("/runs", get(list_runs))
        .route("/runs/:id", get(get_run))
        .route("/runs/:id/cancel", post(cancel_run))
        .route("/runs/:id/approve", post(submit_approval))
        .route("/runs/:id/skip-approval", post(skip_approval))
        .route("/runs/:id/stream", get(stream_run))
        .route("/runs/:id/tasks", get(list_tasks))
        .route("/errors", get(list_errors))
}

fn not_found(run_id: &str) -> ApiError {
    api_error(
        StatusCode::NOT_FOUND,
        format!("pipeline run not found: {}", run_id),
    )
}

/// Start a pipeline run for a batch
#[utoipa::path(
    post,
    path = "/api/v1/pipeline/start",
    tag = "pipeline",
    request_body = StartRunRequest,
    responses(
        (status = 200, description = "Run registered; body is the initial snapshot"),
        (status = 400, description = "Invalid batch number or configuration", body = ApiResponse),
        (status = 409, description = "Batch number already used", body = ApiResponse)
    )
)]
pub async fn start_run(
    State(state): State<SharedState>,
    Json(req): Json<StartRunRequest>,
) -> Result<Json<RunSnapshot>, ApiError> {
    let config = state
        .settings
        .pipeline_config(req.config.unwrap_or_default());
    let snapshot = state
        .registry
        .start_run(req.batch_number, config)
        .map_err(pipeline_error)?;
    Ok(Json(snapshot))
}

/// List every run known to this server
#[utoipa::path(
    get,
    path = "/api/v1/pipeline/runs",
    tag = "pipeline",
    responses((status = 200, description = "Run snapshots, newest first"))
)]
pub async fn list_runs(State(state): State<SharedState>) -> Json<Vec<RunSnapshot>> {
    Json(state.registry.list_runs())
}

/// Current snapshot of one run
#[utoipa::path(
    get,
    path = "/api/v1/pipeline/runs/{id}",
    tag = "pipeline",
    params(("id" = String, Path, description = "Run id")),
    responses(
        (status = 200, description = "Run snapshot"),
        (status = 404, description = "Unknown run", body = ApiResponse)
    )
)]
pub async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<RunSnapshot>, ApiError> {
    state
        .registry
        .get_run(&id)
        .map(Json)
        .ok_or_else(|| not_found(&id))
}

/// Request cancellation of a run
#[utoipa::path(
    post,
    path = "/api/v1/pipeline/runs/{id}/cancel",
    tag = "pipeline",
    params(("id" = String, Path, description = "Run id")),
    responses(
        (status = 200, description = "Cancellation requested", body = ApiResponse),
        (status = 404, description = "Unknown run", body = ApiResponse),
        (status = 409, description = "Run already finished", body = ApiResponse)
    )
)]
pub async fn cancel_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse>, ApiError> {
    let snapshot = state.registry.get_run(&id).ok_or_else(|| not_found(&id))?;
    if !state.registry.cancel_run(&id) {
        return Err(api_error(
            StatusCode::CONFLICT,
            format!("run already {}", snapshot.status.as_str()),
        ));
    }
    Ok(ApiResponse::ok("cancellation requested"))
}

fn approval_conflict(state: &SharedState, id: &str) -> ApiError {
    match state.registry.get_run(id) {
        None => not_found(id),
        Some(snapshot) => api_error(
            StatusCode::CONFLICT,
            format!(
                "run is {}, not {}",
                snapshot.status.as_str(),
                RunStatus::ApprovalNeeded.as_str()
            ),
        ),
    }
}

/// Submit approval decisions for a run waiting at the approval gate
#[utoipa::path(
    post,
    path = "/api/v1/pipeline/runs/{id}/approve",
    tag = "pipeline",
    params(("id" = String, Path, description = "Run id")),
    request_body = ApprovalRequest,
    responses(
        (status = 200, description = "Decisions accepted", body = ApiResponse),
        (status = 404, description = "Unknown run", body = ApiResponse),
        (status = 409, description = "Run is not waiting for approval", body = ApiResponse)
    )
)]
pub async fn submit_approval(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<ApprovalRequest>,
) -> Result<Json<ApiResponse>, ApiError> {
    let count = req.decisions.len();
    if !state.registry.submit_approval(&id, req.decisions) {
        return Err(approval_conflict(&state, &id));
    }
    Ok(ApiResponse::ok(format!("{} decisions submitted", count)))
}

/// Approve every artifact without review
#[utoipa::path(
    post,
    path = "/api/v1/pipeline/runs/{id}/skip-approval",
    tag = "pipeline",
    params(("id" = String, Path, description = "Run id")),
    responses(
        (status = 200, description = "Approval skipped", body = ApiResponse),
        (status = 404, description = "Unknown run", body = ApiResponse),
        (status = 409, description = "Run is not waiting for approval", body = ApiResponse)
    )
)]
pub async fn skip_approval(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse>, ApiError> {
    if !state.registry.skip_approval(&id) {
        return Err(approval_conflict(&state, &id));
    }
    Ok(ApiResponse::ok("approval skipped"))
}

/// Server-sent events for one run. The first event is the run snapshot;
/// the stream ends after the terminal event.
pub async fn stream_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let subscription = state.registry.subscribe(&id).map_err(pipeline_error)?;

    let stream = stream::unfold((subscription, false), |(mut sub, done)| async move {
        if done {
            return None;
        }
        match tokio::time::timeout(HEARTBEAT, sub.recv()).await {
            Ok(Some(event)) => {
                let terminal = event.kind.is_terminal();
                let json = serde_json::to_string(&event).unwrap_or_default();
                Some((
                    Ok(Event::default().event(event.kind.as_str()).data(json)),
                    (sub, terminal),
                ))
            }
            // Bus closed the run
            Ok(None) => None,
            Err(_) => Some((Ok(Event::default().comment("heartbeat")), (sub, false))),
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Tasks registered by a run
#[utoipa::path(
    get,
    path = "/api/v1/pipeline/runs/{id}/tasks",
    tag = "pipeline",
    params(("id" = String, Path, description = "Run id")),
    responses((status = 200, description = "Task records in creation order"))
)]
pub async fn list_tasks(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<TaskRecord>>, ApiError> {
    state
        .registry
        .services()
        .tasks
        .list_for_run(&id)
        .map(Json)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)))
}

/// Recent pipeline errors, optionally for one batch
#[utoipa::path(
    get,
    path = "/api/v1/pipeline/errors",
    tag = "pipeline",
    params(
        ("batch_id" = Option<String>, Query, description = "Only errors of this batch"),
        ("limit" = Option<usize>, Query, description = "Maximum records (default 50)")
    ),
    responses((status = 200, description = "Error records, newest first"))
)]
pub async fn list_errors(
    State(state): State<SharedState>,
    Query(query): Query<ErrorQuery>,
) -> Result<Json<Vec<PipelineErrorRecord>>, ApiError> {
    ErrorLog::new(&state.db)
        .list_recent(
            query.batch_id.as_deref(),
            query.limit.unwrap_or(DEFAULT_ERROR_LIMIT),
        )
        .map(Json)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use crate::{app, AppState};
    use axum::body::Body;
    use axum::http::Request;
    use outreach_core::state::OutreachDb;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn state(dir: &tempfile::TempDir) -> SharedState {
        let settings = Settings {
            output_dir: dir.path().to_path_buf(),
            ..Settings::default()
        };
        Arc::new(AppState::new(OutreachDb::open_in_memory().unwrap(), settings))
    }

    async fn send(
        state: &SharedState,
        method: &str,
        uri: &str,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    async fn get(state: &SharedState, uri: &str) -> (StatusCode, serde_json::Value) {
        send(state, "GET", uri, serde_json::Value::Null).await
    }

    async fn post(state: &SharedState, uri: &str) -> (StatusCode, serde_json::Value) {
        send(state, "POST", uri, serde_json::Value::Null).await
    }

    #[tokio::test]
    async fn test_start_rejects_bad_requests() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);

        let (status, body) = send(
            &state,
            "POST",
            "/api/v1/pipeline/start",
            serde_json::json!({ "batch_number": 0 }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, _) = send(
            &state,
            "POST",
            "/api/v1/pipeline/start",
            serde_json::json!({ "batch_number": 1, "config": { "target_count": 0 } }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);

        let (status, _) = get(&state, "/api/v1/pipeline/runs/prun_nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            &state,
            "POST",
            "/api/v1/pipeline/runs/prun_nope/approve",
            serde_json::json!({ "decisions": {} }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = post(&state, "/api/v1/pipeline/runs/prun_nope/cancel").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_builtin_run_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);

        let config = serde_json::json!({
            "prospects": [
                { "first_name": "Ada", "last_name": "Lovelace", "company": "Engines",
                  "linkedin_url": "https://linkedin.com/in/ada" },
                { "first_name": "Alan", "last_name": "Turing", "company": "Bletchley",
                  "email": "alan@example.com" }
            ]
        });
        let (status, body) = send(
            &state,
            "POST",
            "/api/v1/pipeline/start",
            serde_json::json!({ "batch_number": 1, "config": config }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let run_id = body["run_id"].as_str().unwrap().to_string();

        let (status, _) = send(
            &state,
            "POST",
            "/api/v1/pipeline/start",
            serde_json::json!({ "batch_number": 1 }),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let done = state
            .registry
            .handle(&run_id)
            .unwrap()
            .wait_for_terminal()
            .await;
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.contact_ids.len(), 2);
        assert!(dir.path().join("batch_1_deliverable.json").exists());

        let run_uri = format!("/api/v1/pipeline/runs/{}", run_id);
        let (status, body) = get(&state, &run_uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
        assert_eq!(body["progress_pct"], 100.0);

        let (_, tasks) = get(&state, &format!("{}/tasks", run_uri)).await;
        assert!(!tasks.as_array().unwrap().is_empty());

        let (status, _) = post(&state, &format!("{}/cancel", run_uri)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = post(&state, &format!("{}/skip-approval", run_uri)).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_stream_of_finished_run_sends_snapshot_and_ends() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let snapshot = state
            .registry
            .start_run(1, PipelineConfig::default())
            .unwrap();
        state
            .registry
            .handle(&snapshot.run_id)
            .unwrap()
            .wait_for_terminal()
            .await;

        let request = Request::builder()
            .uri(format!("/api/v1/pipeline/runs/{}/stream", snapshot.run_id))
            .body(Body::empty())
            .unwrap();
        let response = app(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.starts_with("event: state"));
        assert!(text.contains("\"status\":\"completed\""));
    }
}
