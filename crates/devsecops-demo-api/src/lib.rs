//! Demo API
//!
//! The service the demo pipelines build, ship and verify. Two endpoints:
//! - `GET /health` returns `{"status": "ok"}`
//! - `GET /echo/{msg}` returns `{"message": msg}`

use axum::{extract::Path, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

/// Default bind address, matching the container port the pipeline probes.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EchoResponse {
    pub message: String,
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// GET /echo/{msg}
pub async fn echo(Path(msg): Path<String>) -> Json<EchoResponse> {
    Json(EchoResponse { message: msg })
}

/// Create the API router
pub fn router() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/echo/{msg}", get(echo))
        .layer(TraceLayer::new_for_http())
}
