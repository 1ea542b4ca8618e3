//! VM lifecycle management
//!
//! [`LifecycleManager`] is the sole mutator of `VirtualMachine.status`.
//! Every status change goes through [`LifecycleManager::transition`], which
//! validates the move against the legal-transition table, writes the new
//! status atomically, then fires side effects keyed by `(from, to)`. Side
//! effects run in their own error boundaries: a failed ingress call or port
//! allocation never rolls back the status write; reconciliation repairs it
//! on a later tick.

pub mod vm;

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::billing::usage::UsageRecord;
use crate::events::{Event, EventBus};
use crate::ingress::IngressRegistry;
use crate::store::Store;

use vm::{
    PowerState, ServiceStatus, VirtualMachine, VmService, VmStatus, VmTemplate,
    TEMPLATE_FEE_LABEL_PREFIX,
};

/// Direct-access ports are allocated from this range, per node
const DIRECT_PORT_RANGE: std::ops::RangeInclusive<u16> = 30000..=32767;

/// How long the enter-Running effect waits for the node to report an IP
const PRIVATE_IP_POLL_ATTEMPTS: u32 = 30;
const PRIVATE_IP_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// What caused a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionTrigger {
    /// Node acknowledged a command
    CommandAck,
    /// Observed via heartbeat reconciliation
    Heartbeat,
    /// Operator or tenant API call
    Manual,
    /// A watchdog timed out
    Timeout,
    /// The hosting node went offline
    NodeOffline,
    /// Node reported a command failure
    CommandFailed,
}

/// Context accompanying a transition request
#[derive(Debug, Clone)]
pub struct TransitionContext {
    pub trigger: TransitionTrigger,

    /// Where the request originated (node id, subsystem name)
    pub source: Option<String>,

    /// Human-readable status message
    pub message: Option<String>,
}

impl TransitionContext {
    pub fn new(trigger: TransitionTrigger) -> Self {
        Self {
            trigger,
            source: None,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Errors from the lifecycle manager. A refused transition is not an error;
/// only storage failures surface here.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

/// The single transition authority for VM status
#[derive(Clone)]
pub struct LifecycleManager {
    store: Store,
    bus: EventBus,
    ingress: IngressRegistry,
}

impl LifecycleManager {
    pub fn new(store: Store, bus: EventBus, ingress: IngressRegistry) -> Self {
        Self { store, bus, ingress }
    }

    /// Request a status transition.
    ///
    /// Returns `Ok(true)` when the status was changed (or was already the
    /// target), `Ok(false)` when the VM is unknown or the move is illegal.
    pub async fn transition(
        &self,
        vm_id: &str,
        new_status: VmStatus,
        context: TransitionContext,
    ) -> Result<bool, LifecycleError> {
        let Some(vm) = self.store.get_vm(vm_id) else {
            warn!(vm_id, ?new_status, "transition requested for unknown VM");
            return Ok(false);
        };

        let old_status = vm.status;
        if old_status == new_status {
            debug!(vm_id, ?new_status, "transition is a no-op");
            return Ok(true);
        }

        if !old_status.can_transition_to(new_status) {
            warn!(
                vm_id,
                from = %old_status,
                to = %new_status,
                trigger = ?context.trigger,
                "illegal transition refused"
            );
            return Ok(false);
        }

        // The status write is atomic per VM: the closure runs under the
        // store's entry lock and the full record persists before release.
        let updated = self
            .store
            .update_vm(vm_id, |vm| {
                vm.status = new_status;
                vm.status_message = context.message.clone();
                vm.power_state = PowerState::from_status(new_status);
                vm.updated_at = Utc::now();
                match new_status {
                    VmStatus::Running => vm.started_at = Some(Utc::now()),
                    VmStatus::Stopped => vm.stopped_at = Some(Utc::now()),
                    _ => {}
                }
                vm.node_id.clone()
            })
            .await?;
        let Some(node_id) = updated else {
            return Ok(false);
        };

        info!(
            vm_id,
            from = %old_status,
            to = %new_status,
            trigger = ?context.trigger,
            "VM transitioned"
        );

        self.dispatch_side_effects(vm_id, old_status, new_status).await;

        self.bus.publish(Event::VmTransitioned {
            vm_id: vm_id.to_string(),
            node_id,
            from: old_status,
            to: new_status,
            trigger: context.trigger,
        });
        if new_status == VmStatus::Error {
            self.bus.publish(Event::VmError {
                vm_id: vm_id.to_string(),
                message: context.message.unwrap_or_default(),
            });
        }

        Ok(true)
    }

    /// Fire the side effects for a `(from, to)` pair. Each effect has its
    /// own error boundary; failures are logged and left to reconciliation.
    async fn dispatch_side_effects(&self, vm_id: &str, from: VmStatus, to: VmStatus) {
        use VmStatus::*;

        match (from, to) {
            (Provisioning | Stopped | Error | Stopping, Running) => {
                // The node may not have reported an address yet; poll in the
                // background so heartbeat handling is never blocked.
                let manager = self.clone();
                let vm_id = vm_id.to_string();
                tokio::spawn(async move {
                    manager.enter_running_effects(&vm_id, true).await;
                });
            }
            (Running, Stopping | Error | Deleting) => {
                if self.ingress.auto_remove_on_stop() {
                    if let Err(e) = self.ingress.on_vm_stopped(vm_id).await {
                        warn!(vm_id, error = %e, "ingress pause failed");
                    }
                }
            }
            (_, Stopped) => {
                if self.ingress.auto_remove_on_stop() {
                    if let Err(e) = self.ingress.on_vm_stopped(vm_id).await {
                        warn!(vm_id, error = %e, "ingress cleanup on stop failed");
                    }
                }
            }
            (_, Deleted) => {
                self.enter_deleted_effects(vm_id).await;
            }
            _ => {}
        }
    }

    /// Effects on entering Running: reset service states, wait for the
    /// node-reported address, register ingress, allocate direct ports,
    /// record the one-shot template fee.
    pub(crate) async fn enter_running_effects(&self, vm_id: &str, poll_for_ip: bool) {
        if let Err(e) = self
            .store
            .update_vm(vm_id, |vm| {
                for service in &mut vm.services {
                    service.status = ServiceStatus::Pending;
                }
            })
            .await
        {
            warn!(vm_id, error = %e, "service reset failed");
        }

        let mut attempts = if poll_for_ip { PRIVATE_IP_POLL_ATTEMPTS } else { 1 };
        let vm = loop {
            match self.store.get_vm(vm_id) {
                Some(vm) if vm.status != VmStatus::Running => {
                    debug!(vm_id, "VM left Running while waiting for address, bailing");
                    return;
                }
                Some(vm) if vm.network.private_ip.is_some() => break vm,
                Some(_) if attempts > 1 => {
                    attempts -= 1;
                    tokio::time::sleep(PRIVATE_IP_POLL_INTERVAL).await;
                }
                Some(_) => {
                    warn!(vm_id, "no private IP reported within the polling window");
                    return;
                }
                None => return,
            }
        };

        if self.ingress.auto_register_on_start() {
            if let Err(e) = self.ingress.register_vm(vm_id, None).await {
                warn!(vm_id, error = %e, "ingress registration failed");
            }
        }
        if let Err(e) = self.ingress.on_vm_started(vm_id).await {
            warn!(vm_id, error = %e, "custom domain resume failed");
        }

        if let Some(template_id) = vm.spec.template_id.clone() {
            if let Some(template) = self.store.get_template(&template_id) {
                if let Err(e) = self.allocate_direct_ports(&vm, &template).await {
                    warn!(vm_id, error = %e, "direct port allocation failed");
                }
                if let Err(e) = self.record_template_fee(&vm, &template).await {
                    warn!(vm_id, error = %e, "template fee recording failed");
                }
            } else {
                warn!(vm_id, template_id, "template missing, skipping ports and fee");
            }
        }
    }

    /// Allocate host ports for every non-http/ws template port that does
    /// not already have one. Idempotent across restarts.
    async fn allocate_direct_ports(
        &self,
        vm: &VirtualMachine,
        template: &VmTemplate,
    ) -> Result<(), LifecycleError> {
        let Some(node_id) = vm.node_id.as_deref() else {
            return Ok(());
        };

        // Ports already handed out on this node, excluding deleted VMs.
        let mut used: std::collections::HashSet<u16> = self
            .store
            .list_vms_on_node(node_id)
            .iter()
            .filter(|v| v.status != VmStatus::Deleted)
            .flat_map(|v| v.services.iter().filter_map(|s| s.external_port))
            .collect();

        let mut services: Vec<VmService> = Vec::new();
        for port in &template.exposed_ports {
            if port.protocol.routed_via_subdomain() {
                continue;
            }
            let existing = vm
                .services
                .iter()
                .find(|s| s.internal_port == port.port && s.external_port.is_some());
            if let Some(s) = existing {
                services.push(s.clone());
                continue;
            }

            let Some(external) = DIRECT_PORT_RANGE.clone().find(|p| !used.contains(p)) else {
                warn!(vm_id = %vm.id, node_id, "direct port range exhausted");
                break;
            };
            used.insert(external);
            services.push(VmService {
                name: port.name.clone(),
                internal_port: port.port,
                external_port: Some(external),
                protocol: port.protocol,
                status: ServiceStatus::Active,
            });
        }

        if !services.is_empty() {
            self.store
                .update_vm(&vm.id, |vm| {
                    for allocated in services {
                        match vm
                            .services
                            .iter_mut()
                            .find(|s| s.internal_port == allocated.internal_port)
                        {
                            Some(slot) => *slot = allocated,
                            None => vm.services.push(allocated),
                        }
                    }
                })
                .await?;
        }
        Ok(())
    }

    /// Record the template's one-shot fee as a usage record, exactly once
    /// per VM (idempotent via a label).
    async fn record_template_fee(
        &self,
        vm: &VirtualMachine,
        template: &VmTemplate,
    ) -> Result<(), LifecycleError> {
        if template.one_shot_fee_usdc <= 0.0 || vm.template_fee_settled(&template.id) {
            return Ok(());
        }

        let now = Utc::now();
        let record = UsageRecord::new(
            vm.owner_id.clone(),
            vm.id.clone(),
            vm.node_id.clone().unwrap_or_default(),
            template.author_wallet.clone(),
            template.one_shot_fee_usdc,
            now,
            now,
            true,
        );
        let record_id = record.id.clone();
        let amount = record.amount_usdc;
        self.store.save_usage_record(record).await?;

        self.store
            .update_vm(&vm.id, |vm| {
                vm.labels.insert(
                    format!("{TEMPLATE_FEE_LABEL_PREFIX}{}", template.id),
                    "true".to_string(),
                );
            })
            .await?;

        self.bus.publish(Event::UsageRecorded {
            usage_record_id: record_id,
            vm_id: vm.id.clone(),
            amount_usdc: amount,
        });
        Ok(())
    }

    /// Effects on entering Deleted: ingress teardown, port release, node
    /// resource release, user quota release, completion counter.
    async fn enter_deleted_effects(&self, vm_id: &str) {
        if let Err(e) = self.ingress.on_vm_deleted(vm_id).await {
            warn!(vm_id, error = %e, "ingress removal failed");
        }

        let Some(vm) = self.store.get_vm(vm_id) else {
            return;
        };

        if let Err(e) = self
            .store
            .update_vm(vm_id, |vm| {
                for service in &mut vm.services {
                    service.external_port = None;
                    service.status = ServiceStatus::Pending;
                }
            })
            .await
        {
            warn!(vm_id, error = %e, "port release failed");
        }

        if let Some(node_id) = vm.node_id.as_deref() {
            let cost = crate::registry::node::ResourceSet::new(
                vm.spec.compute_point_cost,
                vm.spec.memory_bytes,
                vm.spec.disk_bytes,
            );
            let result = self
                .store
                .update_node(node_id, |node| {
                    node.resources.reserved = node.resources.reserved.saturating_sub(&cost);
                    node.reputation.successful_vm_completions += 1;
                })
                .await;
            if let Err(e) = result {
                warn!(vm_id, node_id, error = %e, "resource release failed");
            }
        }

        let result = self
            .store
            .update_user(&vm.owner_id, |user| {
                user.quota.active_vms = user.quota.active_vms.saturating_sub(1);
                user.quota.reserved_compute_points = user
                    .quota
                    .reserved_compute_points
                    .saturating_sub(vm.spec.compute_point_cost);
            })
            .await;
        if let Err(e) = result {
            warn!(vm_id, owner = %vm.owner_id, error = %e, "quota release failed");
        }
    }
}

/// Shared handle alias
pub type SharedLifecycleManager = Arc<LifecycleManager>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{User, UserQuota};
    use crate::config::IngressConfig;
    use crate::ingress::RecordingProxyReloader;
    use crate::lifecycle::vm::{QualityTier, ServiceProtocol, TemplatePort, VmSpec};
    use crate::registry::node::{
        HardwareProfile, NatClass, Node, NodeStatus, ResourceLedger, ResourceSet,
    };

    struct NoDns;

    #[async_trait::async_trait]
    impl crate::ingress::DnsResolver for NoDns {
        async fn resolve(&self, _: &str) -> Result<Vec<std::net::IpAddr>, String> {
            Err("no dns in tests".into())
        }
    }

    async fn harness() -> (LifecycleManager, Store) {
        let store = Store::in_memory();
        let bus = EventBus::new();
        let ingress = IngressRegistry::new(
            store.clone(),
            IngressConfig::default(),
            Arc::new(RecordingProxyReloader::default()),
            Arc::new(NoDns),
        );
        (LifecycleManager::new(store.clone(), bus, ingress), store)
    }

    fn spec() -> VmSpec {
        VmSpec {
            vcpus: 2,
            memory_bytes: 2 << 30,
            disk_bytes: 20 << 30,
            tier: QualityTier::Balanced,
            gpu_required: false,
            bandwidth_tier: Default::default(),
            template_id: None,
            region_hint: None,
            zone_hint: None,
            compute_point_cost: 2,
        }
    }

    async fn node_with_reservation(store: &Store) -> Node {
        let mut node = Node {
            id: "node-1".into(),
            wallet_address: "0xnode".into(),
            name: "node-1".into(),
            region: "eu".into(),
            zone: "a".into(),
            status: NodeStatus::Online,
            public_ip: Some("198.51.100.7".into()),
            agent_port: 8080,
            nat: NatClass::None,
            hardware: HardwareProfile::default(),
            resources: ResourceLedger::default(),
            evaluation: None,
            obligations: vec![],
            dht: None,
            relay: None,
            cgnat: None,
            reputation: Default::default(),
            last_heartbeat: None,
            metrics: None,
            push_enabled: true,
            push_successes: 0,
            consecutive_push_failures: 0,
            last_command_pushed_at: None,
            agent_version: String::new(),
            supported_images: vec![],
            labels: Default::default(),
            registered_at: Utc::now(),
            updated_at: Utc::now(),
        };
        node.resources.total = ResourceSet::new(16, 32 << 30, 100 << 30);
        node.resources.reserved = ResourceSet::new(2, 2 << 30, 20 << 30);
        store.save_node(node.clone()).await.unwrap();
        node
    }

    #[tokio::test]
    async fn test_unknown_vm_refused() {
        let (manager, _) = harness().await;
        let ok = manager
            .transition("ghost", VmStatus::Running, TransitionContext::new(TransitionTrigger::Manual))
            .await
            .unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_same_status_noop() {
        let (manager, store) = harness().await;
        let vm = VirtualMachine::new("a", "0xu", spec());
        let id = vm.id.clone();
        store.save_vm(vm).await.unwrap();

        let ok = manager
            .transition(&id, VmStatus::Pending, TransitionContext::new(TransitionTrigger::Manual))
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(store.get_vm(&id).unwrap().status, VmStatus::Pending);
    }

    #[tokio::test]
    async fn test_illegal_transition_refused_without_mutation() {
        let (manager, store) = harness().await;
        let vm = VirtualMachine::new("a", "0xu", spec());
        let id = vm.id.clone();
        store.save_vm(vm).await.unwrap();

        let ok = manager
            .transition(&id, VmStatus::Running, TransitionContext::new(TransitionTrigger::Heartbeat))
            .await
            .unwrap();
        assert!(!ok);
        assert_eq!(store.get_vm(&id).unwrap().status, VmStatus::Pending);
    }

    #[tokio::test]
    async fn test_legal_walk_updates_derived_fields() {
        let (manager, store) = harness().await;
        let vm = VirtualMachine::new("a", "0xu", spec());
        let id = vm.id.clone();
        store.save_vm(vm).await.unwrap();

        for (status, trigger) in [
            (VmStatus::Scheduling, TransitionTrigger::Manual),
            (VmStatus::Provisioning, TransitionTrigger::Manual),
            (VmStatus::Running, TransitionTrigger::Heartbeat),
        ] {
            assert!(manager
                .transition(&id, status, TransitionContext::new(trigger))
                .await
                .unwrap());
        }

        let vm = store.get_vm(&id).unwrap();
        assert_eq!(vm.status, VmStatus::Running);
        assert_eq!(vm.power_state, PowerState::Running);
        assert!(vm.started_at.is_some());

        assert!(manager
            .transition(&id, VmStatus::Stopping, TransitionContext::new(TransitionTrigger::CommandAck))
            .await
            .unwrap());
        assert!(manager
            .transition(&id, VmStatus::Stopped, TransitionContext::new(TransitionTrigger::CommandAck))
            .await
            .unwrap());

        let vm = store.get_vm(&id).unwrap();
        assert_eq!(vm.power_state, PowerState::Off);
        assert!(vm.stopped_at.is_some());
    }

    #[tokio::test]
    async fn test_deleted_releases_resources_and_quota() {
        let (manager, store) = harness().await;
        node_with_reservation(&store).await;
        store
            .save_user(User {
                id: "0xu".into(),
                wallet_address: "0xu".into(),
                suspended: false,
                quota: UserQuota {
                    active_vms: 1,
                    reserved_compute_points: 2,
                },
                refresh_token_hash: None,
                refresh_expires_at: None,
                api_keys: vec![],
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let mut vm = VirtualMachine::new("a", "0xu", spec());
        vm.node_id = Some("node-1".into());
        vm.status = VmStatus::Stopped;
        let id = vm.id.clone();
        store.save_vm(vm).await.unwrap();

        assert!(manager
            .transition(&id, VmStatus::Deleting, TransitionContext::new(TransitionTrigger::Manual))
            .await
            .unwrap());
        assert!(manager
            .transition(&id, VmStatus::Deleted, TransitionContext::new(TransitionTrigger::CommandAck))
            .await
            .unwrap());

        let node = store.get_node("node-1").unwrap();
        assert_eq!(node.resources.reserved, ResourceSet::new(0, 0, 0));
        assert_eq!(node.reputation.successful_vm_completions, 1);

        let user = store.get_user("0xu").unwrap();
        assert_eq!(user.quota.active_vms, 0);
        assert_eq!(user.quota.reserved_compute_points, 0);
    }

    #[tokio::test]
    async fn test_enter_running_allocates_ports_and_fee_once() {
        let (manager, store) = harness().await;
        node_with_reservation(&store).await;

        store
            .save_template(VmTemplate {
                id: "tpl-1".into(),
                name: "game server".into(),
                exposed_ports: vec![
                    TemplatePort {
                        name: "web".into(),
                        port: 80,
                        protocol: ServiceProtocol::Http,
                    },
                    TemplatePort {
                        name: "game".into(),
                        port: 7777,
                        protocol: ServiceProtocol::Udp,
                    },
                ],
                one_shot_fee_usdc: 2.5,
                author_wallet: "0xauthor".into(),
            })
            .await
            .unwrap();

        let mut vm_spec = spec();
        vm_spec.template_id = Some("tpl-1".into());
        let mut vm = VirtualMachine::new("game-1", "0xu", vm_spec);
        vm.node_id = Some("node-1".into());
        vm.status = VmStatus::Running;
        vm.network.private_ip = Some("192.168.0.2".into());
        let id = vm.id.clone();
        store.save_vm(vm).await.unwrap();

        manager.enter_running_effects(&id, false).await;
        manager.enter_running_effects(&id, false).await;

        let vm = store.get_vm(&id).unwrap();
        // http is subdomain-routed, only the udp port gets a direct port.
        assert_eq!(vm.services.len(), 1);
        assert_eq!(vm.services[0].internal_port, 7777);
        assert!(vm.services[0].external_port.is_some());

        // Fee recorded exactly once despite two invocations.
        let fees = store.list_usage_records();
        assert_eq!(fees.len(), 1);
        assert_eq!(fees[0].amount_usdc, 2.5);
        assert_eq!(fees[0].node_wallet, "0xauthor");
        assert!(vm.template_fee_settled("tpl-1"));
    }

    #[tokio::test]
    async fn test_node_offline_error_path() {
        let (manager, store) = harness().await;
        let mut vm = VirtualMachine::new("a", "0xu", spec());
        vm.status = VmStatus::Running;
        let id = vm.id.clone();
        store.save_vm(vm).await.unwrap();

        assert!(manager
            .transition(
                &id,
                VmStatus::Error,
                TransitionContext::new(TransitionTrigger::NodeOffline).with_message("Node offline"),
            )
            .await
            .unwrap());

        let vm = store.get_vm(&id).unwrap();
        assert_eq!(vm.status, VmStatus::Error);
        assert_eq!(vm.status_message.as_deref(), Some("Node offline"));
    }
}
