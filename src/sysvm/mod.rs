//! System-VM obligation engine
//!
//! Every node owes the network a set of system VMs determined by its
//! hardware: all nodes run a DHT VM; public nodes with enough cores,
//! memory and bandwidth also host a WireGuard relay. The reconcile loop
//! inspects Online nodes and deploys any obligation still `Pending`
//! through the role's deployer. BlockStore and Ingress are wired through
//! the data model but deliberately have no deployment path yet.

pub mod cloudinit;
pub mod dht;
pub mod mesh;
pub mod relay;

use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::commands::{CommandSender, CommandType, NodeCommand};
use crate::config::SysVmConfig;
use crate::events::EventBus;
use crate::lifecycle::vm::{QualityTier, VirtualMachine, VmSpec, VmStatus};
use crate::lifecycle::{LifecycleManager, TransitionContext, TransitionTrigger};
use crate::registry::node::{
    HardwareProfile, NatClass, Node, NodeStatus, SystemVmObligation, SystemVmRole,
};
use crate::store::Store;

use cloudinit::CloudInitRenderer;
use mesh::KeyForge;
use relay::RelayAdminApi;

/// Hardware floor for the relay role
const RELAY_MIN_CORES: u32 = 2;
const RELAY_MIN_MEMORY: u64 = 4 << 30;
const RELAY_MIN_BANDWIDTH_MBPS: u64 = 50;

/// Hardware floor for the planned BlockStore role
const BLOCKSTORE_MIN_STORAGE: u64 = 100 << 30;
const BLOCKSTORE_MIN_MEMORY: u64 = 4 << 30;

/// Errors from system-VM deployment
#[derive(Error, Debug)]
pub enum SysVmError {
    #[error(transparent)]
    Mesh(#[from] mesh::MeshError),

    #[error(transparent)]
    CloudInit(#[from] cloudinit::CloudInitError),

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    #[error(transparent)]
    Lifecycle(#[from] crate::lifecycle::LifecycleError),

    #[error("Relay admin API call failed: {0}")]
    RelayAdmin(String),

    #[error("No relay available for node '{0}'")]
    NoRelayAvailable(String),

    #[error("Role '{0}' is enabled but has no deployment path")]
    RoleNotDeployable(String),

    #[error("Node '{0}' not found")]
    NodeNotFound(String),
}

/// Compute which roles a node owes, from hardware alone.
pub fn compute_obligations(hardware: &HardwareProfile, nat: NatClass) -> Vec<SystemVmObligation> {
    let mut obligations = vec![SystemVmObligation::pending(SystemVmRole::Dht)];

    let relay_capable = nat == NatClass::None
        && hardware.physical_cores >= RELAY_MIN_CORES
        && hardware.memory_bytes >= RELAY_MIN_MEMORY
        && hardware.bandwidth_mbps >= RELAY_MIN_BANDWIDTH_MBPS;
    if relay_capable {
        obligations.push(SystemVmObligation::pending(SystemVmRole::Relay));
        obligations.push(SystemVmObligation::pending(SystemVmRole::Ingress));
    }

    if hardware.total_storage_bytes() >= BLOCKSTORE_MIN_STORAGE
        && hardware.memory_bytes >= BLOCKSTORE_MIN_MEMORY
    {
        obligations.push(SystemVmObligation::pending(SystemVmRole::BlockStore));
    }

    obligations
}

/// Merge freshly computed obligations with a node's existing set, keeping
/// the state of roles the node already carries and dropping roles its
/// hardware no longer qualifies for.
pub fn merge_obligations(node: &Node, computed: Vec<SystemVmObligation>) -> Vec<SystemVmObligation> {
    computed
        .into_iter()
        .map(|fresh| match node.obligation(fresh.role) {
            Some(existing) => existing.clone(),
            None => fresh,
        })
        .collect()
}

/// The obligation engine and mesh manager
#[derive(Clone)]
pub struct SysVmController {
    pub(crate) store: Store,
    pub(crate) bus: EventBus,
    pub(crate) config: SysVmConfig,
    pub(crate) lifecycle: LifecycleManager,
    pub(crate) commands: CommandSender,
    pub(crate) renderer: CloudInitRenderer,
    pub(crate) keyforge: Arc<dyn KeyForge>,
    pub(crate) relay_admin: Arc<dyn RelayAdminApi>,
    pub(crate) orchestrator_url: String,
}

impl SysVmController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        bus: EventBus,
        config: SysVmConfig,
        lifecycle: LifecycleManager,
        commands: CommandSender,
        keyforge: Arc<dyn KeyForge>,
        relay_admin: Arc<dyn RelayAdminApi>,
        orchestrator_url: String,
    ) -> Self {
        let renderer = CloudInitRenderer::new(config.dht_binary_dir.clone());
        Self {
            store,
            bus,
            config,
            lifecycle,
            commands,
            renderer,
            keyforge,
            relay_admin,
            orchestrator_url,
        }
    }

    /// One reconcile pass over every Online node.
    pub async fn reconcile(&self) {
        for node in self.store.list_nodes() {
            if node.status != NodeStatus::Online {
                continue;
            }

            // CGNAT nodes need a relay attachment before anything else can
            // reach them.
            if node.nat.needs_relay() && node.cgnat.is_none() {
                if let Err(e) = self.enroll_cgnat(&node.id, &[]).await {
                    warn!(node_id = %node.id, error = %e, "CGNAT enrollment failed");
                }
            }

            for obligation in &node.obligations {
                if obligation.status != crate::registry::node::ObligationStatus::Pending {
                    continue;
                }
                let role_name = obligation.role.to_string();
                if !self.config.deployable_roles.contains(&role_name) {
                    debug!(node_id = %node.id, role = %role_name, "role not deployable, skipping");
                    continue;
                }

                let result = match obligation.role {
                    SystemVmRole::Dht => self.deploy_dht(&node.id).await,
                    SystemVmRole::Relay => self.deploy_relay(&node.id).await,
                    SystemVmRole::BlockStore | SystemVmRole::Ingress => {
                        Err(SysVmError::RoleNotDeployable(role_name.clone()))
                    }
                };

                match result {
                    Ok(()) => info!(node_id = %node.id, role = %role_name, "obligation deployed"),
                    Err(SysVmError::RoleNotDeployable(role)) => {
                        // Configuration failure: enabled without a deployer.
                        // Loud, and the obligation stays Pending rather than
                        // silently flapping.
                        error!(node_id = %node.id, role, "deployable_roles enables a role with no deployment path");
                    }
                    Err(e) => {
                        warn!(node_id = %node.id, role = %role_name, error = %e, "deployment failed, will retry");
                    }
                }
            }
        }
    }

    /// Persist a system VM pinned to a node (system VMs bypass the
    /// scheduler) and dispatch its `CreateVm` command. The caller builds
    /// the record first so the VM id is available to cloud-init rendering.
    pub(crate) async fn create_system_vm(
        &self,
        vm: VirtualMachine,
        cloud_init: String,
    ) -> Result<String, SysVmError> {
        let vm_id = vm.id.clone();
        let vm_type = vm.vm_type;
        let node_id = vm.node_id.clone().unwrap_or_default();
        self.store.save_vm(vm).await?;

        self.lifecycle
            .transition(
                &vm_id,
                VmStatus::Provisioning,
                TransitionContext::new(TransitionTrigger::Manual)
                    .with_source("sysvm")
                    .with_message(format!("Deploying {vm_type:?} system VM")),
            )
            .await?;

        let command = NodeCommand::new(
            CommandType::CreateVm,
            serde_json::json!({
                "vmId": vm_id,
                "vmType": vm_type,
                "cloudInit": cloud_init,
            }),
        );
        self.commands.deliver(&node_id, command).await;
        Ok(vm_id)
    }

    /// Spec used for system VMs; small, Burstable, never metered.
    pub(crate) fn system_vm_spec(&self) -> VmSpec {
        VmSpec {
            vcpus: 1,
            memory_bytes: 1 << 30,
            disk_bytes: 8 << 30,
            tier: QualityTier::Burstable,
            gpu_required: false,
            bandwidth_tier: Default::default(),
            template_id: None,
            region_hint: None,
            zone_hint: None,
            compute_point_cost: 1,
        }
    }
}

/// A fresh callback secret for a system VM's ready endpoint.
pub(crate) fn mint_callback_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Spawn the obligation reconcile loop.
pub fn spawn_reconcile_loop(
    controller: SysVmController,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let interval_secs = controller.config.reconcile_interval_secs;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        info!(interval_secs, "obligation reconcile loop started");
        loop {
            tokio::select! {
                _ = ticker.tick() => controller.reconcile().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("obligation reconcile loop shutting down");
                        break;
                    }
                }
            }
        }
    })
}

/// Spawn the relay health monitor.
pub fn spawn_relay_health_loop(
    controller: SysVmController,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let interval_secs = controller.config.relay_health_interval_secs;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        info!(interval_secs, "relay health monitor started");
        loop {
            tokio::select! {
                _ = ticker.tick() => controller.relay_health_sweep().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("relay health monitor shutting down");
                        break;
                    }
                }
            }
        }
    })
}
