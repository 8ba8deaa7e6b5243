//! Health check endpoints.
//!
//! Used by the orchestrator to decide whether the controller is alive and
//! whether it can reach the platform.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

const SERVICE: &str = "faultline-controller";

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// "ok" or "degraded".
    pub status: String,

    pub service: String,
    pub version: String,

    /// Current timestamp (RFC 3339).
    pub timestamp: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<ComponentHealth>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentHealth {
    pub platform: ComponentStatus,

    /// Dynamic-target watches currently held.
    pub cache_contexts: usize,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentStatus {
    /// "ok" or "unavailable".
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

fn response(status: &str, components: Option<ComponentHealth>) -> HealthResponse {
    HealthResponse {
        status: status.to_string(),
        service: SERVICE.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        components,
    }
}

/// Is the process up? Checks no dependency.
async fn healthz() -> impl IntoResponse {
    Json(response("ok", None))
}

/// Can the controller reach the platform?
///
/// Returns 503 when listing disruptions fails.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let platform = state.platform().list_disruptions().await;
    let platform_ok = platform.is_ok();

    let components = ComponentHealth {
        platform: ComponentStatus {
            status: if platform_ok { "ok" } else { "unavailable" }.to_string(),
            message: platform.err().map(|e| e.to_string()),
        },
        cache_contexts: state.caches().len().await,
    };

    if platform_ok {
        (StatusCode::OK, Json(response("ok", Some(components))))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(response("degraded", Some(components))),
        )
    }
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}
