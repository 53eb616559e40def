//! HTTP route definitions

use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::world::WorldStatsSummary;
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;

/// Upper bound for plain HTTP requests
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    // CORS configuration - support multiple origins (comma-separated in CLIENT_ORIGIN)
    let allowed_origins: Vec<HeaderValue> = state
        .config
        .client_origin
        .split(',')
        .filter_map(|s| s.trim().parse::<HeaderValue>().ok())
        .filter(|origin| !origin.is_empty())
        .collect();

    let cors = (if allowed_origins.is_empty() {
        CorsLayer::new().allow_origin(Any)
    } else {
        CorsLayer::new().allow_origin(allowed_origins)
    })
    .allow_methods([Method::GET, Method::OPTIONS])
    .allow_headers([header::CONTENT_TYPE]);

    let api_routes = Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/worlds/:world_id/stats", get(world_stats_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
                .layer(CompressionLayer::new()),
        );

    Router::new()
        .merge(api_routes)
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    active_worlds: usize,
    active_actors: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        active_worlds: state.registry.active_worlds(),
        active_actors: state.registry.total_actors(),
    })
}

// ============================================================================
// Stats endpoints
// ============================================================================

#[derive(Serialize)]
struct StatsResponse {
    tick_rate: u32,
    snapshot_interval: u32,
    worlds: Vec<WorldStatsSummary>,
}

async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        tick_rate: state.config.sim.tick_rate,
        snapshot_interval: state.config.sim.snapshot_interval,
        worlds: state.registry.stats(),
    })
}

async fn world_stats_handler(
    State(state): State<AppState>,
    Path(world_id): Path<Uuid>,
) -> Result<Json<WorldStatsSummary>, AppError> {
    state
        .registry
        .get(&world_id)
        .map(|world| Json(world.stats()))
        .ok_or_else(|| AppError::NotFound(format!("world {world_id}")))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}
