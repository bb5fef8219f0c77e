//! # API Endpoint Handlers
//!
//! Every engine call is synchronous and may touch the disk, so handlers hand
//! it to the blocking pool and map the result to an HTTP response.

use super::{
    AppState,
    types::{
        ApiError, ApiResponse, BlocksQuery, HandoffRequest, HealthResponse, MaterialsRequest,
        NotesRequest, RegisterOrderRequest, ReworkRequest, StageJson, StagesResponse, TokenRequest,
    },
};
use axum::{
    Extension, Json,
    http::StatusCode,
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
};
use serde_json::json;
use stagegate_core::{
    BlockFilter, BlockId, BlockStatus, Capability, ConfirmOutcome, EngineError, HandoffOutcome,
    InventoryError, OrderId, Principal, Quantity, ReadyOutcome, StageEngine, StageIndex,
};
use std::sync::Arc;

/// Run `op` against the engine on the blocking pool.
async fn run_blocking<T, F>(state: &AppState, op: F) -> Result<T, ApiError>
where
    F: FnOnce(&StageEngine) -> Result<T, EngineError> + Send + 'static,
    T: Send + 'static,
{
    let engine = Arc::clone(&state.engine);
    tokio::task::spawn_blocking(move || op(&engine))
        .await
        .map_err(|e| ApiError::internal(format!("worker failed: {e}")))?
        .map_err(ApiError::from)
}

fn stage_index(engine: &StageEngine, input: &str) -> Result<StageIndex, EngineError> {
    engine.registry().resolve(input).map(|s| s.index)
}

// =============================================================================
// HEALTH / STAGES
// =============================================================================

pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse::default())
}

/// Active stages in pipeline order.
pub async fn stages_handler(State(state): State<AppState>) -> Response {
    let stages = state
        .engine
        .registry()
        .list_active_stages()
        .iter()
        .map(StageJson::from)
        .collect();
    ApiResponse::ok(StagesResponse { stages })
}

// =============================================================================
// ORDERS
// =============================================================================

pub async fn register_order_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<RegisterOrderRequest>,
) -> Result<Response, ApiError> {
    let summary = run_blocking(&state, move |engine| {
        let stage = request
            .stage
            .as_deref()
            .map(|s| stage_index(engine, s))
            .transpose()?;
        engine.register_order(&principal, OrderId(request.order_id), stage)
    })
    .await?;
    Ok(ApiResponse::ok(summary))
}

pub async fn order_handler(
    State(state): State<AppState>,
    Path(order_id): Path<u64>,
) -> Result<Response, ApiError> {
    let summary = run_blocking(&state, move |engine| engine.order_summary(OrderId(order_id))).await?;
    Ok(ApiResponse::ok(summary))
}

pub async fn transfers_handler(
    State(state): State<AppState>,
    Path(order_id): Path<u64>,
) -> Result<Response, ApiError> {
    let transfers = run_blocking(&state, move |engine| engine.transfers(OrderId(order_id))).await?;
    Ok(ApiResponse::ok(json!({ "order_id": order_id, "transfers": transfers })))
}

/// Replace the order's material breakdown. The gate uses these quantities
/// instead of the stage requirements for the materials listed.
pub async fn materials_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(order_id): Path<u64>,
    Json(request): Json<MaterialsRequest>,
) -> Result<Response, ApiError> {
    let stock = Arc::clone(&state.stock);
    let replaced = run_blocking(&state, move |engine| {
        principal.require(Capability::GenerateCheckpoint)?;
        engine.order_summary(OrderId(order_id))?;
        let lines: Vec<(String, Quantity)> = request
            .materials
            .into_iter()
            .map(|line| (line.material, line.quantity))
            .collect();
        Ok(stock.replace_order_demand(OrderId(order_id), &lines))
    })
    .await?;
    let breakdown = replaced.map_err(|e| match e {
        InventoryError::Unavailable(reason) => ApiError::internal(reason),
        InventoryError::UnknownMaterial(_) | InventoryError::NegativeQuantity(_) => {
            ApiError::new(StatusCode::BAD_REQUEST, "invalid_field", format!("materials: {e}"))
        }
    })?;
    tracing::info!(order_id, materials = breakdown.len(), "order material breakdown replaced");
    Ok(ApiResponse::ok(json!({ "order_id": order_id, "materials": breakdown })))
}

// =============================================================================
// CHECKPOINTS
// =============================================================================

/// Gate the target stage and issue a checkpoint token, or report the block.
pub async fn handoff_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(order_id): Path<u64>,
    Json(request): Json<HandoffRequest>,
) -> Result<Response, ApiError> {
    let outcome = run_blocking(&state, move |engine| {
        let target = stage_index(engine, &request.target_stage)?;
        engine.request_handoff(&principal, OrderId(order_id), target)
    })
    .await?;
    Ok(match outcome {
        HandoffOutcome::Issued(_) => ApiResponse::ok(outcome),
        HandoffOutcome::Blocked(_) => ApiResponse::blocked(outcome),
    })
}

/// The scan at the receiving station.
pub async fn confirm_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<TokenRequest>,
) -> Result<Response, ApiError> {
    let outcome = run_blocking(&state, move |engine| {
        engine.confirm_handoff(&principal, &request.token)
    })
    .await?;
    Ok(match outcome {
        ConfirmOutcome::Confirmed(_) => ApiResponse::ok(outcome),
        ConfirmOutcome::Blocked { .. } => ApiResponse::blocked(outcome),
    })
}

/// Check a token without consuming it.
pub async fn verify_handler(
    State(state): State<AppState>,
    Json(request): Json<TokenRequest>,
) -> Result<Response, ApiError> {
    let inspection = run_blocking(&state, move |engine| engine.inspect_token(&request.token)).await?;
    Ok(ApiResponse::ok(inspection))
}

// =============================================================================
// READY / REWORK / SHIP
// =============================================================================

pub async fn ready_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(order_id): Path<u64>,
    Json(request): Json<NotesRequest>,
) -> Result<Response, ApiError> {
    let outcome = run_blocking(&state, move |engine| {
        engine.mark_ready(&principal, OrderId(order_id), request.notes)
    })
    .await?;
    Ok(match outcome {
        ReadyOutcome::Advanced(_) | ReadyOutcome::ReadyToShip(_) => ApiResponse::ok(outcome),
        ReadyOutcome::Blocked(_) => ApiResponse::blocked(outcome),
    })
}

pub async fn rework_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(order_id): Path<u64>,
    Json(request): Json<ReworkRequest>,
) -> Result<Response, ApiError> {
    let summary = run_blocking(&state, move |engine| {
        let from = stage_index(engine, &request.from_stage)?;
        let to = stage_index(engine, &request.to_stage)?;
        engine.return_for_rework(&principal, OrderId(order_id), from, to, &request.reason)
    })
    .await?;
    Ok(ApiResponse::ok(summary))
}

/// Shipping an already shipped order succeeds with `already_shipped`.
pub async fn ship_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(order_id): Path<u64>,
) -> Result<Response, ApiError> {
    let outcome = run_blocking(&state, move |engine| engine.ship(&principal, OrderId(order_id))).await?;
    Ok(ApiResponse::ok(outcome))
}

// =============================================================================
// BLOCKS
// =============================================================================

pub async fn blocks_handler(
    State(state): State<AppState>,
    Query(query): Query<BlocksQuery>,
) -> Result<Response, ApiError> {
    let blocks = run_blocking(&state, move |engine| {
        let status = match query.status.as_deref() {
            None => Some(BlockStatus::Active),
            Some("all") => None,
            Some(s) => Some(
                s.parse::<BlockStatus>()
                    .map_err(|reason| EngineError::InvalidField { field: "status", reason })?,
            ),
        };
        let stage = query
            .stage
            .as_deref()
            .map(|s| stage_index(engine, s))
            .transpose()?;
        engine.list_blocks(&BlockFilter {
            order_id: query.order_id.map(OrderId),
            stage,
            status,
        })
    })
    .await?;
    Ok(ApiResponse::ok(json!({ "blocks": blocks })))
}

pub async fn resolve_block_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(block_id): Path<u64>,
    Json(request): Json<NotesRequest>,
) -> Result<Response, ApiError> {
    let block = run_blocking(&state, move |engine| {
        engine.resolve_block(&principal, BlockId(block_id), request.notes)
    })
    .await?;
    Ok(ApiResponse::ok(json!({ "block": block })))
}

pub async fn ignore_block_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(block_id): Path<u64>,
    Json(request): Json<NotesRequest>,
) -> Result<Response, ApiError> {
    let block = run_blocking(&state, move |engine| {
        engine.ignore_block(&principal, BlockId(block_id), request.notes)
    })
    .await?;
    Ok(ApiResponse::ok(json!({ "block": block })))
}
