//! Node-plane endpoints: register, heartbeat, ack, ready callbacks

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use tracing::warn;

use crate::commands::CommandAck;
use crate::registry::heartbeat::HeartbeatRequest;
use crate::registry::RegisterRequest;

use super::{AppState, OperationStatus};

/// Extract the bearer token from an Authorization header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

pub async fn register_node(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> impl IntoResponse {
    match state.registry.register(request).await {
        Ok(response) => (StatusCode::CREATED, Json(response)).into_response(),
        Err(e) => {
            warn!(error = %e, "node registration failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(OperationStatus::failure(e.to_string())),
            )
                .into_response()
        }
    }
}

pub async fn node_heartbeat(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<HeartbeatRequest>,
) -> impl IntoResponse {
    let Some(token) = bearer_token(&headers) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(OperationStatus::failure("Missing bearer token")),
        )
            .into_response();
    };
    if !state.registry.validate_token(&node_id, token).await {
        return (
            StatusCode::UNAUTHORIZED,
            Json(OperationStatus::failure("Invalid auth token")),
        )
            .into_response();
    }

    match state.registry.handle_heartbeat(&node_id, request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(OperationStatus::failure(e.to_string())),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
pub struct AckRequest {
    #[serde(default)]
    pub results: Vec<CommandAck>,
}

pub async fn node_ack(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<AckRequest>,
) -> impl IntoResponse {
    let Some(token) = bearer_token(&headers) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(OperationStatus::failure("Missing bearer token")),
        )
            .into_response();
    };
    if !state.registry.validate_token(&node_id, token).await {
        return (
            StatusCode::UNAUTHORIZED,
            Json(OperationStatus::failure("Invalid auth token")),
        )
            .into_response();
    }

    match state.registry.handle_acks(&node_id, request.results).await {
        Ok(()) => (
            StatusCode::OK,
            Json(OperationStatus::success("Acknowledged")),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(OperationStatus::failure(e.to_string())),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
pub struct DhtReadyRequest {
    #[serde(rename = "vmId")]
    pub vm_id: String,

    #[serde(rename = "peerId")]
    pub peer_id: String,
}

/// `POST /api/dht/ready`, authenticated by the `X-DHT-Token` HMAC over
/// `vmId:peerId`.
pub async fn dht_ready(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<DhtReadyRequest>,
) -> impl IntoResponse {
    let Some(signature) = headers.get("X-DHT-Token").and_then(|v| v.to_str().ok()) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(OperationStatus::failure("Missing X-DHT-Token")),
        )
            .into_response();
    };

    match state
        .sysvm
        .handle_dht_ready(&request.vm_id, &request.peer_id, signature)
        .await
    {
        Ok(()) => (StatusCode::OK, Json(OperationStatus::success("Recorded"))).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(OperationStatus::failure(e.to_string())),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
pub struct RelayReadyRequest {
    #[serde(rename = "nodeId")]
    pub node_id: String,

    #[serde(rename = "relayVmId")]
    pub relay_vm_id: String,
}

/// `POST /api/relay/ready`, authenticated by the `X-Relay-Token` HMAC over
/// `nodeId:relayVmId` keyed by the relay's WireGuard private key.
pub async fn relay_ready(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RelayReadyRequest>,
) -> impl IntoResponse {
    let Some(signature) = headers.get("X-Relay-Token").and_then(|v| v.to_str().ok()) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(OperationStatus::failure("Missing X-Relay-Token")),
        )
            .into_response();
    };

    match state
        .sysvm
        .handle_relay_ready(&request.node_id, &request.relay_vm_id, signature)
        .await
    {
        Ok(()) => (StatusCode::OK, Json(OperationStatus::success("Recorded"))).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(OperationStatus::failure(e.to_string())),
        )
            .into_response(),
    }
}
