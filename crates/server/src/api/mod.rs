//! # HTTP API
//!
//! Versioned routes under `/api/v1`.

use axum::{http::StatusCode, Json};
use outreach_core::PipelineError;
use serde::Serialize;
use utoipa::ToSchema;

pub mod agent;
pub mod pipeline;

pub use agent::agent_routes;
pub use pipeline::pipeline_routes;

#[derive(Debug, Serialize, ToSchema)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
}

impl ApiResponse {
    pub fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
        })
    }
}

/// Status code plus an `ApiResponse` body
pub type ApiError = (StatusCode, Json<ApiResponse>);

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ApiResponse {
            success: false,
            message: message.into(),
        }),
    )
}

/// [`PipelineError`] mapped to its HTTP status
pub fn pipeline_error(e: PipelineError) -> ApiError {
    let status = match &e {
        PipelineError::InvalidConfig(_) | PipelineError::InvalidBatchNumber(_) => {
            StatusCode::BAD_REQUEST
        }
        PipelineError::BatchExists(_) => StatusCode::CONFLICT,
        PipelineError::RunNotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::Store(_) => {
            tracing::error!(error = %e, "store error");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    api_error(status, e.to_string())
}
