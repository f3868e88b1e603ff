use std::sync::Arc;

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use trenova_cache::CacheStore;

use crate::websocket::Hub;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub server_id: String,
}

pub async fn healthz(State(hub): State<Arc<Hub>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            server_id: hub.server_id().to_string(),
        }),
    )
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyResponse {
    pub status: &'static str,
    pub cache: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breaker: Option<&'static str>,
    pub subscribed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Ready once the cache answers a ping.
pub async fn readyz(
    State(cache): State<Arc<dyn CacheStore>>,
    State(hub): State<Arc<Hub>>,
) -> impl IntoResponse {
    let ping = cache.ping().await;
    let breaker = cache.breaker_state().map(|s| s.as_str());
    let subscribed = hub.is_subscribed();

    match ping {
        Ok(()) => (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                cache: "up",
                breaker,
                subscribed,
                error: None,
            }),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReadyResponse {
                    status: "unavailable",
                    cache: "down",
                    breaker,
                    subscribed,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}
