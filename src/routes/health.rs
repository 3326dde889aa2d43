//! Health check endpoint for load balancers and uptime checks.

use axum::{Json, extract::State, response::IntoResponse};
use http::StatusCode;
use serde::Serialize;

use crate::AppState;

/// Health status response.
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    /// "healthy" or "unhealthy"
    pub status: &'static str,
    /// Service version
    pub version: &'static str,
    /// Trust configuration state: "ready", "uninitialized" or "failed"
    pub trust: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idp_entity_id: Option<String>,
}

/// Reports healthy only once the IdP trust configuration is loaded.
#[tracing::instrument(name = "health.check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let trust = state.authenticator.trust();
    let ready = trust.ready().ok();

    let body = HealthStatus {
        status: if ready.is_some() {
            "healthy"
        } else {
            "unhealthy"
        },
        version: env!("CARGO_PKG_VERSION"),
        trust: trust.status(),
        idp_entity_id: ready.map(|t| t.descriptor.idp_entity_id.clone()),
    };

    let status = if body.status == "healthy" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}
