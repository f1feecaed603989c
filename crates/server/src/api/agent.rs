//! # Agent API
//!
//! One-off actions on a contact or batch, plus daily and weekly roll-ups.

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use outreach_core::swarm::{ActionRequest, ActionResult, AgentAction, DailySummary, WeeklyReview};
use serde::Deserialize;
use utoipa::ToSchema;

use super::{api_error, ApiError};
use crate::SharedState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct AgentActionRequest {
    /// `re_score` | `re_research` | `run_qc` | `score_batch` | `generate_deliverable` |
    /// `run_pre_brief`
    #[schema(value_type = String)]
    pub action: AgentAction,
    /// Target of contact actions
    #[serde(default)]
    pub contact_id: Option<String>,
    /// Target of batch actions
    #[serde(default)]
    pub batch_id: Option<String>,
    /// Upcoming batch for `run_pre_brief`; the batch before it is reviewed
    #[serde(default)]
    pub batch_number: Option<u32>,
}

impl From<AgentActionRequest> for ActionRequest {
    fn from(req: AgentActionRequest) -> Self {
        Self {
            action: req.action,
            contact_id: req.contact_id,
            batch_id: req.batch_id,
            batch_number: req.batch_number,
        }
    }
}

pub fn agent_routes() -> Router<SharedState> {
    Router::new()
        .route("/action", post(run_action))
        .route("/daily-summary", get(daily_summary))
        .route("/weekly-review", get(weekly_review))
}

/// Run one action outside any pipeline run. A failed action still answers
/// 200 with `status: failed` and the error.
#[utoipa::path(
    post,
    path = "/api/v1/agent/action",
    tag = "agent",
    request_body = AgentActionRequest,
    responses(
        (status = 200, description = "Action result with data or error"),
        (status = 422, description = "Unknown action or malformed body")
    )
)]
pub async fn run_action(
    State(state): State<SharedState>,
    Json(req): Json<AgentActionRequest>,
) -> Json<ActionResult> {
    Json(state.registry.run_action(&req.into()).await)
}

/// Today's runs, pending work and errors
#[utoipa::path(
    get,
    path = "/api/v1/agent/daily-summary",
    tag = "agent",
    responses((status = 200, description = "Daily summary"))
)]
pub async fn daily_summary(
    State(state): State<SharedState>,
) -> Result<Json<DailySummary>, ApiError> {
    let runs = state.registry.list_runs();
    DailySummary::collect(&state.db, &runs, Utc::now().date_naive())
        .map(Json)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)))
}

/// Last seven days of runs and draft reviews by channel
#[utoipa::path(
    get,
    path = "/api/v1/agent/weekly-review",
    tag = "agent",
    responses((status = 200, description = "Weekly review"))
)]
pub async fn weekly_review(
    State(state): State<SharedState>,
) -> Result<Json<WeeklyReview>, ApiError> {
    let runs = state.registry.list_runs();
    WeeklyReview::collect(&state.db, &runs, Utc::now())
        .map(Json)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)))
}
