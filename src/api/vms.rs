//! Tenant-plane and proxy-plane endpoints

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::auth::{LoginRequest, API_KEY_PREFIX};
use crate::billing::hourly_rate_for;
use crate::commands::{CommandType, NodeCommand};
use crate::ingress::sanitize_subdomain;
use crate::latency::rolling_stats;
use crate::lifecycle::vm::{QualityTier, VirtualMachine, VmSpec, VmStatus};
use crate::lifecycle::{TransitionContext, TransitionTrigger};

use super::{AppState, OperationStatus};

/// Resolve the caller: JWT bearer or `dc_` API key.
fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, Response> {
    let unauthorized = || {
        (
            StatusCode::UNAUTHORIZED,
            Json(OperationStatus::failure("Authentication required")),
        )
            .into_response()
    };

    let Some(value) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return Err(unauthorized());
    };
    let Some(credential) = value.strip_prefix("Bearer ") else {
        return Err(unauthorized());
    };

    let result = if credential.starts_with(API_KEY_PREFIX) {
        state.auth.validate_api_key(credential)
    } else {
        state.auth.validate_access_token(credential)
    };
    result.map_err(|_| unauthorized())
}

// ============================================================================
// Auth endpoints
// ============================================================================

pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> impl IntoResponse {
    match state.auth.login(&request).await {
        Ok(tokens) => (StatusCode::OK, Json(tokens)).into_response(),
        Err(e) => (
            StatusCode::UNAUTHORIZED,
            Json(OperationStatus::failure(e.to_string())),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
pub struct RefreshRequest {
    #[serde(rename = "refreshToken")]
    pub refresh_token: String,
}

pub async fn refresh(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> impl IntoResponse {
    match state.auth.refresh(&request.refresh_token).await {
        Ok(tokens) => (StatusCode::OK, Json(tokens)).into_response(),
        Err(e) => (
            StatusCode::UNAUTHORIZED,
            Json(OperationStatus::failure(e.to_string())),
        )
            .into_response(),
    }
}

#[derive(Serialize)]
struct ApiKeyResponse {
    #[serde(rename = "apiKey")]
    api_key: String,
}

pub async fn mint_api_key(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user_id = match authenticate(&state, &headers) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.auth.mint_api_key(&user_id).await {
        Ok(api_key) => (StatusCode::CREATED, Json(ApiKeyResponse { api_key })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(OperationStatus::failure(e.to_string())),
        )
            .into_response(),
    }
}

// ============================================================================
// VM endpoints
// ============================================================================

#[derive(Deserialize)]
pub struct CreateVmRequest {
    pub name: String,

    pub vcpus: u32,

    #[serde(rename = "memoryBytes")]
    pub memory_bytes: u64,

    #[serde(rename = "diskBytes")]
    pub disk_bytes: u64,

    #[serde(default)]
    pub tier: QualityTier,

    #[serde(rename = "gpuRequired")]
    #[serde(default)]
    pub gpu_required: bool,

    #[serde(rename = "templateId")]
    #[serde(default)]
    pub template_id: Option<String>,

    #[serde(rename = "regionHint")]
    #[serde(default)]
    pub region_hint: Option<String>,

    #[serde(rename = "zoneHint")]
    #[serde(default)]
    pub zone_hint: Option<String>,
}

pub async fn create_vm(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateVmRequest>,
) -> Response {
    let user_id = match authenticate(&state, &headers) {
        Ok(id) => id,
        Err(response) => return response,
    };

    if request.vcpus == 0 || request.memory_bytes == 0 || request.disk_bytes == 0 {
        return (
            StatusCode::BAD_REQUEST,
            Json(OperationStatus::failure("vcpus, memory and disk must be positive")),
        )
            .into_response();
    }
    if sanitize_subdomain(&request.name).is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(OperationStatus::failure("Name has no DNS-safe characters")),
        )
            .into_response();
    }
    if state.store.find_vm_by_name(&request.name).is_some() {
        return (
            StatusCode::CONFLICT,
            Json(OperationStatus::failure("VM name already in use")),
        )
            .into_response();
    }
    if let Some(template_id) = &request.template_id {
        if state.store.get_template(template_id).is_none() {
            return (
                StatusCode::BAD_REQUEST,
                Json(OperationStatus::failure("Unknown template")),
            )
                .into_response();
        }
    }

    // Points per vCPU derive from the tier's benchmark floor relative to
    // the baseline, so better tiers cost more points for the same shape.
    let policy = state.config.tier_policy(request.tier);
    let points_per_vcpu = policy.minimum_benchmark / state.config.scheduling.baseline_benchmark;
    let compute_point_cost = (request.vcpus as f64 * points_per_vcpu).ceil() as u64;

    let spec = VmSpec {
        vcpus: request.vcpus,
        memory_bytes: request.memory_bytes,
        disk_bytes: request.disk_bytes,
        tier: request.tier,
        gpu_required: request.gpu_required,
        bandwidth_tier: Default::default(),
        template_id: request.template_id,
        region_hint: request.region_hint,
        zone_hint: request.zone_hint,
        compute_point_cost: compute_point_cost.max(1),
    };

    let mut vm = VirtualMachine::new(request.name, user_id, spec);
    vm.billing.hourly_rate = hourly_rate_for(&vm.spec, &policy, &state.config.billing);
    if let Some(template_id) = &vm.spec.template_id {
        if let Some(template) = state.store.get_template(template_id) {
            vm.services = template
                .exposed_ports
                .iter()
                .map(|p| crate::lifecycle::vm::VmService {
                    name: p.name.clone(),
                    internal_port: p.port,
                    external_port: None,
                    protocol: p.protocol,
                    status: Default::default(),
                })
                .collect();
            vm.ingress.default_port = template
                .exposed_ports
                .iter()
                .find(|p| p.protocol.routed_via_subdomain())
                .map(|p| p.port)
                .unwrap_or(80);
        }
    }

    match state.store.save_vm(vm.clone()).await {
        Ok(()) => (StatusCode::CREATED, Json(vm)).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(OperationStatus::failure(e.to_string())),
        )
            .into_response(),
    }
}

/// Load a VM if the caller owns it.
fn owned_vm(state: &AppState, user_id: &str, vm_id: &str) -> Result<VirtualMachine, Response> {
    match state.store.get_vm(vm_id) {
        Some(vm) if vm.owner_id == user_id => Ok(vm),
        _ => Err((
            StatusCode::NOT_FOUND,
            Json(OperationStatus::failure("VM not found")),
        )
            .into_response()),
    }
}

pub async fn list_vms(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user_id = match authenticate(&state, &headers) {
        Ok(id) => id,
        Err(response) => return response,
    };
    Json(state.store.list_vms_for_owner(&user_id)).into_response()
}

pub async fn get_vm(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
) -> Response {
    let user_id = match authenticate(&state, &headers) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match owned_vm(&state, &user_id, &vm_id) {
        Ok(vm) => Json(vm).into_response(),
        Err(response) => response,
    }
}

pub async fn start_vm(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
) -> Response {
    let user_id = match authenticate(&state, &headers) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let vm = match owned_vm(&state, &user_id, &vm_id) {
        Ok(vm) => vm,
        Err(response) => return response,
    };

    if !matches!(vm.status, VmStatus::Stopped | VmStatus::Error) {
        return (
            StatusCode::CONFLICT,
            Json(OperationStatus::failure(format!(
                "Cannot start a VM in {} state",
                vm.status
            ))),
        )
            .into_response();
    }
    let Some(node_id) = vm.node_id.clone() else {
        return (
            StatusCode::CONFLICT,
            Json(OperationStatus::failure("VM has no placement")),
        )
            .into_response();
    };

    let command = NodeCommand::new(
        CommandType::StartVm,
        serde_json::json!({ "vmId": vm_id }),
    );
    state.commands.deliver(&node_id, command).await;
    (
        StatusCode::ACCEPTED,
        Json(OperationStatus::success("Start command dispatched")),
    )
        .into_response()
}

pub async fn stop_vm(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
) -> Response {
    let user_id = match authenticate(&state, &headers) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let vm = match owned_vm(&state, &user_id, &vm_id) {
        Ok(vm) => vm,
        Err(response) => return response,
    };
    let Some(node_id) = vm.node_id.clone() else {
        return (
            StatusCode::CONFLICT,
            Json(OperationStatus::failure("VM has no placement")),
        )
            .into_response();
    };

    let moved = state
        .lifecycle
        .transition(
            &vm_id,
            VmStatus::Stopping,
            TransitionContext::new(TransitionTrigger::Manual).with_source(&user_id),
        )
        .await;
    match moved {
        Ok(true) => {
            let command = NodeCommand::new(
                CommandType::StopVm,
                serde_json::json!({ "vmId": vm_id }),
            );
            state.commands.deliver(&node_id, command).await;
            (
                StatusCode::ACCEPTED,
                Json(OperationStatus::success("Stop command dispatched")),
            )
                .into_response()
        }
        Ok(false) => (
            StatusCode::CONFLICT,
            Json(OperationStatus::failure(format!(
                "Cannot stop a VM in {} state",
                vm.status
            ))),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(OperationStatus::failure(e.to_string())),
        )
            .into_response(),
    }
}

pub async fn delete_vm(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
) -> Response {
    let user_id = match authenticate(&state, &headers) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let vm = match owned_vm(&state, &user_id, &vm_id) {
        Ok(vm) => vm,
        Err(response) => return response,
    };

    let moved = state
        .lifecycle
        .transition(
            &vm_id,
            VmStatus::Deleting,
            TransitionContext::new(TransitionTrigger::Manual).with_source(&user_id),
        )
        .await;
    match moved {
        Ok(true) => {
            match vm.node_id.clone() {
                Some(node_id) => {
                    // The node tears the guest down and acks into Deleted.
                    let command = NodeCommand::new(
                        CommandType::DeleteVm,
                        serde_json::json!({ "vmId": vm_id }),
                    );
                    state.commands.deliver(&node_id, command).await;
                }
                None => {
                    // Never placed; nothing to tear down remotely.
                    let _ = state
                        .lifecycle
                        .transition(
                            &vm_id,
                            VmStatus::Deleted,
                            TransitionContext::new(TransitionTrigger::Manual)
                                .with_source("api")
                                .with_message("Deleted before placement"),
                        )
                        .await;
                }
            }
            (
                StatusCode::ACCEPTED,
                Json(OperationStatus::success("Deletion started")),
            )
                .into_response()
        }
        Ok(false) => (
            StatusCode::CONFLICT,
            Json(OperationStatus::failure(format!(
                "Cannot delete a VM in {} state",
                vm.status
            ))),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(OperationStatus::failure(e.to_string())),
        )
            .into_response(),
    }
}

/// Re-run metering for a VM after a balance top-up; clears an
/// insufficient-balance pause when the charge now clears.
pub async fn resume_billing(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
) -> Response {
    let user_id = match authenticate(&state, &headers) {
        Ok(id) => id,
        Err(response) => return response,
    };
    if let Err(response) = owned_vm(&state, &user_id, &vm_id) {
        return response;
    }

    state
        .metering
        .enqueue(&vm_id, crate::billing::MeteringTrigger::BalanceAdded)
        .await;
    (
        StatusCode::ACCEPTED,
        Json(OperationStatus::success("Billing resume queued")),
    )
        .into_response()
}

#[derive(Serialize)]
struct LatencyResponse {
    #[serde(rename = "sampleMs")]
    sample_ms: f64,

    #[serde(rename = "baselineRttMs")]
    baseline_rtt_ms: Option<f64>,

    #[serde(rename = "currentRttMs")]
    current_rtt_ms: Option<f64>,

    #[serde(rename = "minMs")]
    min_ms: Option<f64>,

    #[serde(rename = "maxMs")]
    max_ms: Option<f64>,

    #[serde(rename = "stddevMs")]
    stddev_ms: Option<f64>,
}

pub async fn vm_latency(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
) -> Response {
    let user_id = match authenticate(&state, &headers) {
        Ok(id) => id,
        Err(response) => return response,
    };
    if let Err(response) = owned_vm(&state, &user_id, &vm_id) {
        return response;
    }

    match state.latency.measure_rtt(&vm_id).await {
        Ok(sample_ms) => {
            let metrics = state
                .store
                .get_vm(&vm_id)
                .map(|vm| vm.network_metrics)
                .unwrap_or_default();
            let stats = rolling_stats(&metrics.recent_samples);
            Json(LatencyResponse {
                sample_ms,
                baseline_rtt_ms: metrics.baseline_rtt_ms,
                current_rtt_ms: metrics.current_rtt_ms,
                min_ms: stats.map(|s| s.0),
                max_ms: stats.map(|s| s.1),
                stddev_ms: stats.map(|s| s.2),
            })
            .into_response()
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(OperationStatus::failure(e.to_string())),
        )
            .into_response(),
    }
}

// ============================================================================
// Custom domain endpoints
// ============================================================================

#[derive(Deserialize)]
pub struct AddDomainRequest {
    pub domain: String,

    #[serde(rename = "targetPort")]
    #[serde(default = "default_domain_port")]
    pub target_port: u16,
}

fn default_domain_port() -> u16 {
    80
}

pub async fn add_domain(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
    Json(request): Json<AddDomainRequest>,
) -> Response {
    let user_id = match authenticate(&state, &headers) {
        Ok(id) => id,
        Err(response) => return response,
    };
    if let Err(response) = owned_vm(&state, &user_id, &vm_id) {
        return response;
    }

    match state
        .ingress
        .add_custom_domain(&vm_id, &request.domain, request.target_port)
        .await
    {
        Ok(domain) => (StatusCode::CREATED, Json(domain)).into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(OperationStatus::failure(e.to_string())),
        )
            .into_response(),
    }
}

pub async fn list_domains(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
) -> Response {
    let user_id = match authenticate(&state, &headers) {
        Ok(id) => id,
        Err(response) => return response,
    };
    if let Err(response) = owned_vm(&state, &user_id, &vm_id) {
        return response;
    }
    Json(state.ingress.list_custom_domains(&vm_id)).into_response()
}

pub async fn verify_domain(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(domain): Path<String>,
) -> Response {
    if let Err(response) = authenticate(&state, &headers) {
        return response;
    }
    match state.ingress.verify_dns(&domain).await {
        Ok(verified) => (StatusCode::OK, Json(verified)).into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(OperationStatus::failure(e.to_string())),
        )
            .into_response(),
    }
}

pub async fn delete_domain(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(domain): Path<String>,
) -> Response {
    if let Err(response) = authenticate(&state, &headers) {
        return response;
    }
    match state.ingress.remove_custom_domain(&domain).await {
        Ok(()) => (
            StatusCode::OK,
            Json(OperationStatus::success("Domain removed")),
        )
            .into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(OperationStatus::failure(e.to_string())),
        )
            .into_response(),
    }
}

// ============================================================================
// Proxy plane
// ============================================================================

#[derive(Serialize)]
struct RoutesSnapshot {
    routes: Vec<crate::ingress::Route>,

    #[serde(rename = "customDomains")]
    custom_domains: Vec<crate::ingress::CustomDomain>,
}

pub async fn ingress_routes(State(state): State<AppState>) -> impl IntoResponse {
    let (routes, custom_domains) = state.ingress.snapshot();
    Json(RoutesSnapshot {
        routes,
        custom_domains,
    })
}

#[derive(Deserialize)]
pub struct TlsGateQuery {
    pub domain: String,
}

/// The on-demand TLS gate: 200 only for Active custom domains, so the
/// proxy never issues certificates for strangers.
pub async fn tls_gate(
    State(state): State<AppState>,
    Query(query): Query<TlsGateQuery>,
) -> impl IntoResponse {
    if state.ingress.is_custom_domain_registered(&query.domain) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}
