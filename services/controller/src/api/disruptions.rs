//! Read-only disruption status.

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ControllerError;
use crate::model::{Disruption, FaultKind, InjectionStatus};
use crate::state::AppState;
use crate::watch::CacheContextInfo;

/// One disruption, as listed by `GET /v1/disruptions`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct DisruptionSummary {
    pub namespace: String,
    pub name: String,
    pub kinds: Vec<FaultKind>,
    pub injection_status: InjectionStatus,
    pub desired_targets_count: u32,
    pub selected_targets_count: u32,
    pub injected_targets_count: u32,
    pub ignored_targets_count: u32,
    pub targets: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub deleting: bool,
    pub stuck_on_removal: bool,
}

impl DisruptionSummary {
    fn new(disruption: &Disruption, default_duration: std::time::Duration) -> Self {
        let status = &disruption.status;
        Self {
            namespace: disruption.namespace().to_string(),
            name: disruption.name().to_string(),
            kinds: disruption.fault_kinds(),
            injection_status: status.injection_status,
            desired_targets_count: status.desired_targets_count,
            selected_targets_count: status.selected_targets_count,
            injected_targets_count: status.injected_targets_count,
            ignored_targets_count: status.ignored_targets_count,
            targets: status.target_names(),
            expires_at: disruption.deadline(default_duration),
            deleting: disruption.metadata.is_being_deleted(),
            stuck_on_removal: status.is_stuck_on_removal,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/disruptions", get(list_disruptions))
        .route("/cache-contexts", get(list_cache_contexts))
}

async fn list_disruptions(
    State(state): State<AppState>,
) -> Result<Json<Vec<DisruptionSummary>>, ApiError> {
    let disruptions = state
        .platform()
        .list_disruptions()
        .await
        .map_err(ControllerError::from)?;

    Ok(Json(
        disruptions
            .iter()
            .map(|d| DisruptionSummary::new(d, state.default_duration()))
            .collect(),
    ))
}

async fn list_cache_contexts(State(state): State<AppState>) -> Json<Vec<CacheContextInfo>> {
    Json(state.caches().list().await)
}

/// Platform failure surfaced as a 503.
struct ApiError(ControllerError);

impl From<ControllerError> for ApiError {
    fn from(err: ControllerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        tracing::warn!(error = %self.0, "Status request failed");
        (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use faultline_reconcile::Count;
    use tower::ServiceExt;

    use super::*;
    use crate::api::create_router;
    use crate::model::DisruptionSpec;
    use crate::platform::InMemoryPlatform;
    use crate::watch::CacheContextRegistry;

    async fn get(state: AppState, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = create_router(state)
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_list_disruptions() {
        let platform = Arc::new(InMemoryPlatform::new());
        let mut disruption = Disruption::new(
            "chaos",
            "latency",
            DisruptionSpec::new(&[("app", "web")], Count::Fixed(2), vec![]),
        );
        disruption.status.desired_targets_count = 2;
        platform.apply_disruption(disruption).await;

        let state = AppState::new(
            platform,
            Arc::new(CacheContextRegistry::new()),
            Duration::from_secs(3600),
        );
        let (status, body) = get(state, "/v1/disruptions").await;

        assert_eq!(status, StatusCode::OK);
        let summaries: Vec<DisruptionSummary> = serde_json::from_slice(&body).unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].name, "latency");
        assert_eq!(summaries[0].desired_targets_count, 2);
        assert_eq!(summaries[0].injection_status, InjectionStatus::NotInjected);
        assert!(!summaries[0].deleting);
    }

    #[tokio::test]
    async fn test_list_cache_contexts_empty() {
        let state = AppState::new(
            Arc::new(InMemoryPlatform::new()),
            Arc::new(CacheContextRegistry::new()),
            Duration::from_secs(3600),
        );
        let (status, body) = get(state, "/v1/cache-contexts").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"[]");
    }
}
