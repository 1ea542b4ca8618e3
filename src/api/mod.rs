//! Orchestrator HTTP API
//!
//! Three planes share one axum router:
//! - **Node plane**: registration, heartbeats, command acks, system-VM
//!   ready callbacks - authenticated by node bearer tokens or HMACs.
//! - **Tenant plane**: VM lifecycle and custom domains - authenticated by
//!   wallet-login JWTs or `dc_` API keys.
//! - **Proxy plane**: route snapshots and the on-demand TLS gate consumed
//!   by the external reverse proxy.

pub mod nodes;
pub mod vms;

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::AuthService;
use crate::billing::MeteringPipeline;
use crate::commands::CommandSender;
use crate::config::OrchestratorConfig;
use crate::ingress::IngressRegistry;
use crate::latency::LatencyTracker;
use crate::lifecycle::vm::VmStatus;
use crate::lifecycle::LifecycleManager;
use crate::registry::node::NodeStatus;
use crate::registry::NodeRegistry;
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::sysvm::SysVmController;

/// Shared state for every handler
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub config: Arc<OrchestratorConfig>,
    pub registry: NodeRegistry,
    pub scheduler: Scheduler,
    pub lifecycle: LifecycleManager,
    pub ingress: IngressRegistry,
    pub auth: AuthService,
    pub sysvm: SysVmController,
    pub metering: MeteringPipeline,
    pub latency: LatencyTracker,
    pub commands: CommandSender,
}

/// Build the full router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & status
        .route("/health", get(health_check))
        .route("/v1/status", get(cluster_status))
        // Node plane
        .route("/nodes/register", post(nodes::register_node))
        .route("/nodes/{id}/heartbeat", post(nodes::node_heartbeat))
        .route("/nodes/{id}/ack", post(nodes::node_ack))
        .route("/api/dht/ready", post(nodes::dht_ready))
        .route("/api/relay/ready", post(nodes::relay_ready))
        // Auth
        .route("/auth/login", post(vms::login))
        .route("/auth/refresh", post(vms::refresh))
        .route("/auth/api-keys", post(vms::mint_api_key))
        // Tenant plane
        .route("/v1/vms", get(vms::list_vms).post(vms::create_vm))
        .route("/v1/vms/{id}", get(vms::get_vm).delete(vms::delete_vm))
        .route("/v1/vms/{id}/start", post(vms::start_vm))
        .route("/v1/vms/{id}/stop", post(vms::stop_vm))
        .route("/v1/vms/{id}/latency", get(vms::vm_latency))
        .route("/v1/vms/{id}/billing/resume", post(vms::resume_billing))
        .route(
            "/v1/vms/{id}/domains",
            get(vms::list_domains).post(vms::add_domain),
        )
        .route("/v1/domains/{domain}/verify", post(vms::verify_domain))
        .route("/v1/domains/{domain}", axum::routing::delete(vms::delete_domain))
        // Proxy plane
        .route("/api/ingress/routes", get(vms::ingress_routes))
        .route("/api/ingress/tls-gate", get(vms::tls_gate))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Uniform operation outcome envelope
#[derive(Serialize)]
pub struct OperationStatus {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationStatus {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(error.into()),
        }
    }
}

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Serialize)]
struct ClusterStatusResponse {
    status: String,

    #[serde(rename = "totalNodes")]
    total_nodes: usize,

    #[serde(rename = "onlineNodes")]
    online_nodes: usize,

    #[serde(rename = "totalVms")]
    total_vms: usize,

    #[serde(rename = "runningVms")]
    running_vms: usize,

    #[serde(rename = "pendingVms")]
    pending_vms: usize,
}

async fn cluster_status(State(state): State<AppState>) -> impl IntoResponse {
    let nodes = state.store.list_nodes();
    let vms = state.store.list_vms();
    Json(ClusterStatusResponse {
        status: "ok".to_string(),
        total_nodes: nodes.len(),
        online_nodes: nodes.iter().filter(|n| n.status == NodeStatus::Online).count(),
        total_vms: vms.len(),
        running_vms: vms.iter().filter(|v| v.status == VmStatus::Running).count(),
        pending_vms: vms.iter().filter(|v| v.status == VmStatus::Pending).count(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::InsecureDevVerifier;
    use crate::billing::settlement::{AlwaysVerifiedAttestation, LoggingSettlementClient};
    use crate::events::EventBus;
    use crate::ingress::RecordingProxyReloader;
    use crate::latency::{HttpIcmpTransport, LatencyTracker};
    use crate::sysvm::mesh::FakeKeyForge;
    use crate::sysvm::relay::HttpRelayAdmin;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct NoDns;

    #[async_trait::async_trait]
    impl crate::ingress::DnsResolver for NoDns {
        async fn resolve(&self, _: &str) -> Result<Vec<std::net::IpAddr>, String> {
            Ok(vec!["203.0.113.10".parse().unwrap()])
        }
    }

    /// A fully wired state over in-memory collaborators.
    pub(crate) fn test_state() -> AppState {
        let store = Store::in_memory();
        let bus = EventBus::new();
        let config = Arc::new(OrchestratorConfig::default());

        let ingress = IngressRegistry::new(
            store.clone(),
            config.ingress.clone(),
            Arc::new(RecordingProxyReloader::default()),
            Arc::new(NoDns),
        );
        let lifecycle = LifecycleManager::new(store.clone(), bus.clone(), ingress.clone());
        let commands = CommandSender::new(store.clone());
        let registry = NodeRegistry::new(
            store.clone(),
            bus.clone(),
            config.registry.clone(),
            config.scheduling.clone(),
            lifecycle.clone(),
        );
        let scheduler = Scheduler::new(
            store.clone(),
            config.scheduling.clone(),
            lifecycle.clone(),
            commands.clone(),
        );
        let auth = AuthService::new(
            store.clone(),
            bus.clone(),
            config.auth.clone(),
            Arc::new(InsecureDevVerifier),
        );
        let sysvm = SysVmController::new(
            store.clone(),
            bus.clone(),
            config.sysvm.clone(),
            lifecycle.clone(),
            commands.clone(),
            Arc::new(FakeKeyForge),
            Arc::new(HttpRelayAdmin::new()),
            "http://localhost:8181".to_string(),
        );
        let (metering, _rx) = MeteringPipeline::new(
            store.clone(),
            bus.clone(),
            config.billing.clone(),
            Arc::new(LoggingSettlementClient),
            Arc::new(AlwaysVerifiedAttestation),
        );
        let latency = LatencyTracker::new(store.clone(), Arc::new(HttpIcmpTransport::new()));

        AppState {
            store,
            config,
            registry,
            scheduler,
            lifecycle,
            ingress,
            auth,
            sysvm,
            metering,
            latency,
            commands,
        }
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = create_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cluster_status_empty() {
        let app = create_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/v1/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
