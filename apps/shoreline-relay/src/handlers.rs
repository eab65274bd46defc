use axum::{extract::State, response::Json};
use serde::Serialize;

use crate::relay::RelayState;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
    online: usize,
    connections: usize,
}

#[derive(Debug, Serialize)]
pub struct PresenceResponse {
    pub online: Vec<String>,
}

/// GET /health
pub async fn health_check(State(relay): State<RelayState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        online: relay.registry().len(),
        connections: relay.connection_count(),
    })
}

/// GET /presence - identities that currently have a live channel.
pub async fn presence(State(relay): State<RelayState>) -> Json<PresenceResponse> {
    Json(PresenceResponse {
        online: relay.registry().online(),
    })
}
