//! # API Request/Response Types
//!
//! JSON structures for the HTTP API and the mapping from engine errors to
//! HTTP statuses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use stagegate_core::{EngineError, Quantity, Stage, TokenError};

// =============================================================================
// HEALTH / STAGES
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageJson {
    pub index: u32,
    pub name: String,
    pub allows_parallel_work: bool,
}

impl From<&Stage> for StageJson {
    fn from(stage: &Stage) -> Self {
        Self {
            index: stage.index.0,
            name: stage.name.clone(),
            allows_parallel_work: stage.allows_parallel_work,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagesResponse {
    pub stages: Vec<StageJson>,
}

// =============================================================================
// REQUESTS
// =============================================================================

/// Stages are named by name ("framing") or index ("1") throughout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterOrderRequest {
    pub order_id: u64,
    #[serde(default)]
    pub stage: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffRequest {
    pub target_stage: String,
}

/// A scanned token, JSON or base64url.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRequest {
    pub token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotesRequest {
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReworkRequest {
    pub from_stage: String,
    pub to_stage: String,
    pub reason: String,
}

/// One line of an order's material breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialLine {
    pub material: String,
    pub quantity: Quantity,
}

/// The full breakdown; an empty list clears it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialsRequest {
    pub materials: Vec<MaterialLine>,
}

/// `GET /blocks` filters. `status` defaults to `active`; `all` drops the filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlocksQuery {
    pub order_id: Option<u64>,
    pub stage: Option<String>,
    pub status: Option<String>,
}

// =============================================================================
// RESPONSES
// =============================================================================

/// Success envelope: `{ "success": true, ...data }`.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(flatten)]
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Response {
        (
            StatusCode::OK,
            Json(Self {
                success: true,
                code: None,
                data,
            }),
        )
            .into_response()
    }

    /// A gate refusal: 409 with the shortage report.
    pub fn blocked(data: T) -> Response {
        (
            StatusCode::CONFLICT,
            Json(Self {
                success: false,
                code: Some("blocked"),
                data,
            }),
        )
            .into_response()
    }
}

/// Error body: `{ "success": false, "code": "...", "error": "..." }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub success: bool,
    pub code: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::UnknownOrder(_) | EngineError::UnknownStage(_) | EngineError::UnknownBlock(_) => {
            StatusCode::NOT_FOUND
        }
        EngineError::InvalidField { .. } | EngineError::Token(TokenError::Malformed(_)) => {
            StatusCode::BAD_REQUEST
        }
        EngineError::InvalidTransition { .. }
        | EngineError::StageMismatch { .. }
        | EngineError::BlockNotActive(_)
        | EngineError::Token(TokenError::AlreadyConsumed | TokenError::Superseded) => {
            StatusCode::CONFLICT
        }
        EngineError::Token(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::Unauthorized(_) | EngineError::StageRestricted { .. } => StatusCode::FORBIDDEN,
        EngineError::ConcurrencyExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            tracing::error!(code = err.reason_code(), error = %err, "request failed");
        }
        Self::new(status, err.reason_code(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                success: false,
                code: self.code.to_string(),
                error: self.message,
            }),
        )
            .into_response()
    }
}

// =============================================================================
// TESTS
// =============================================================================
