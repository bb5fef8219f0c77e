//! # Stagegate HTTP API Module
//!
//! The REST API used by supervisor consoles and station scanners.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check (no auth)
//! - `GET /stages` - Active stage pipeline
//! - `POST /orders` - Register an order at a stage
//! - `GET /orders/{id}` - Order position and active token
//! - `GET /orders/{id}/transfers` - Transfer history
//! - `PUT /orders/{id}/materials` - Replace the order's material breakdown
//! - `POST /orders/{id}/handoff` - Gate a target stage and issue a token
//! - `POST /orders/{id}/ready` - Finish work at the current stage
//! - `POST /orders/{id}/rework` - Send back to an earlier stage
//! - `POST /orders/{id}/ship` - Ship a ready order
//! - `POST /checkpoints/confirm` - Scan a token at the receiving station
//! - `POST /checkpoints/verify` - Inspect a token without using it
//! - `GET /blocks` - Material blocks (`?order_id=&stage=&status=`)
//! - `POST /blocks/{id}/resolve` - Mark a block resolved
//! - `POST /blocks/{id}/ignore` - Proceed despite a shortage
//!
//! Gate refusals return 409 with `code = "blocked"` and the shortage report.

mod auth;
mod handlers;
mod middleware;
mod types;

pub use auth::OperatorDirectory;
pub use middleware::{GlobalRateLimiter, create_rate_limiter};
pub use types::{
    ApiError, ApiResponse, BlocksQuery, ErrorBody, HandoffRequest, HealthResponse, MaterialLine,
    MaterialsRequest, NotesRequest, RegisterOrderRequest, ReworkRequest, StageJson, StagesResponse,
    TokenRequest,
};

use crate::config::ServerConfig;
use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware as axum_middleware,
    routing::{get, post, put},
};
use stagegate_core::{StageEngine, StockTable};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

// =============================================================================
// SERVER STATE
// =============================================================================

/// Shared server state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<StageEngine>,
    /// The same table the engine's gate reads.
    pub stock: Arc<StockTable>,
    pub operators: OperatorDirectory,
}

impl AppState {
    #[must_use]
    pub fn new(engine: Arc<StageEngine>, stock: Arc<StockTable>, operators: OperatorDirectory) -> Self {
        Self {
            engine,
            stock,
            operators,
        }
    }
}

// =============================================================================
// CORS CONFIGURATION
// =============================================================================

/// Build the CORS layer from `[server] cors_origins`.
///
/// - unset: localhost only
/// - `["*"]`: any origin
/// - otherwise: the listed origins
fn build_cors_layer(origins: Option<&[String]>) -> CorsLayer {
    match origins {
        Some([only]) if only == "*" => {
            tracing::warn!("CORS: Allowing ALL origins. This is insecure for production!");
            CorsLayer::permissive()
        }
        Some(origins) => {
            let allowed: Vec<HeaderValue> = origins
                .iter()
                .filter_map(|s| match s.trim().parse::<HeaderValue>() {
                    Ok(hv) => {
                        tracing::info!("CORS: Allowing origin: {}", s.trim());
                        Some(hv)
                    }
                    Err(e) => {
                        tracing::warn!("CORS: Invalid origin '{}': {}", s, e);
                        None
                    }
                })
                .collect();
            if allowed.is_empty() {
                tracing::warn!("CORS: No valid origins configured, defaulting to localhost only");
                build_localhost_cors()
            } else {
                restricted_cors(allowed)
            }
        }
        None => build_localhost_cors(),
    }
}

fn restricted_cors(origins: Vec<HeaderValue>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

fn build_localhost_cors() -> CorsLayer {
    let origins = [
        "http://localhost:3000",
        "http://localhost:8080",
        "http://127.0.0.1:3000",
        "http://127.0.0.1:8080",
    ]
    .iter()
    .filter_map(|o| o.parse::<HeaderValue>().ok())
    .collect();
    restricted_cors(origins)
}

// =============================================================================
// ROUTER CREATION
// =============================================================================

/// Create the router with all endpoints and middleware.
///
/// Middleware stack (outer to inner):
/// 1. Tracing
/// 2. CORS
/// 3. Body limit
/// 4. Rate limiting (if enabled)
/// 5. Operator authentication
pub fn create_router(state: AppState, server: &ServerConfig) -> Router {
    if state.operators.is_empty() {
        tracing::warn!("No operators configured: every endpoint except /health will return 401");
    }

    let mut router = Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/stages", get(handlers::stages_handler))
        .route("/orders", post(handlers::register_order_handler))
        .route("/orders/{id}", get(handlers::order_handler))
        .route("/orders/{id}/transfers", get(handlers::transfers_handler))
        .route("/orders/{id}/materials", put(handlers::materials_handler))
        .route("/orders/{id}/handoff", post(handlers::handoff_handler))
        .route("/orders/{id}/ready", post(handlers::ready_handler))
        .route("/orders/{id}/rework", post(handlers::rework_handler))
        .route("/orders/{id}/ship", post(handlers::ship_handler))
        .route("/checkpoints/confirm", post(handlers::confirm_handler))
        .route("/checkpoints/verify", post(handlers::verify_handler))
        .route("/blocks", get(handlers::blocks_handler))
        .route("/blocks/{id}/resolve", post(handlers::resolve_block_handler))
        .route("/blocks/{id}/ignore", post(handlers::ignore_block_handler));

    router = router.layer(axum_middleware::from_fn_with_state(
        state.operators.clone(),
        auth::operator_auth_middleware,
    ));

    if server.rate_limit > 0 {
        tracing::info!("Rate limiting enabled: {} requests/second", server.rate_limit);
        router = router.layer(axum_middleware::from_fn_with_state(
            create_rate_limiter(server.rate_limit),
            middleware::rate_limit_middleware,
        ));
    } else {
        tracing::info!("Rate limiting disabled");
    }

    router
        .layer(axum::extract::DefaultBodyLimit::max(server.max_body_bytes))
        .layer(build_cors_layer(server.cors_origins.as_deref()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// SERVER STARTUP
// =============================================================================

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Cannot listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Bind and serve until Ctrl+C.
pub async fn run_server(addr: &str, state: AppState, server: &ServerConfig) -> std::io::Result<()> {
    let router = create_router(state, server);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Stagegate HTTP server listening on {}", addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
}
