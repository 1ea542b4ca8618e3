//! Heartbeat ingestion and VM state reconciliation
//!
//! A heartbeat is the node's word on what it is actually running. The
//! registry marks the node Online, persists its metrics, then reconciles
//! every VM the orchestrator believes lives there against the report:
//! missing VMs become errors, newly visible state is folded in, and VMs
//! the orchestrator has never heard of go through validated recovery -
//! never blind trust.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::commands::NodeCommand;
use crate::events::Event;
use crate::lifecycle::vm::{
    BillingInfo, PowerState, QualityTier, VirtualMachine, VmMetrics, VmSpec, VmStatus,
    RECOVERED_LABEL,
};
use crate::lifecycle::{TransitionContext, TransitionTrigger};
use crate::registry::node::{NodeMetrics, NodeStatus, ResourceSet};

use super::{NodeRegistry, RegistryError};

/// Heartbeat payload from a node agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub metrics: NodeMetrics,

    /// The node's own view of its free resources
    #[serde(rename = "availableResources")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_resources: Option<ResourceSet>,

    #[serde(rename = "activeVms")]
    #[serde(default)]
    pub active_vms: Vec<ReportedVm>,
}

/// One VM as the node sees it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportedVm {
    #[serde(rename = "vmId")]
    pub vm_id: String,

    #[serde(default)]
    pub name: String,

    pub state: ReportedVmState,

    #[serde(rename = "tenantId")]
    #[serde(default)]
    pub tenant_id: String,

    #[serde(rename = "privateIp")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,

    #[serde(default)]
    pub vcpus: u32,

    #[serde(rename = "memoryBytes")]
    #[serde(default)]
    pub memory_bytes: u64,

    #[serde(rename = "cpuUsagePercent")]
    #[serde(default)]
    pub cpu_usage_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportedVmState {
    Provisioning,
    Running,
    Stopped,
    Error,
    Deleted,
}

/// Heartbeat response: drained commands plus advisories
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub ok: bool,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub commands: Vec<NodeCommand>,

    /// Set when the node's auth token is close to expiry
    #[serde(rename = "tokenWarning")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_warning: Option<String>,
}

impl NodeRegistry {
    /// Ingest a heartbeat. The caller has already validated the token.
    pub async fn handle_heartbeat(
        &self,
        node_id: &str,
        request: HeartbeatRequest,
    ) -> Result<HeartbeatResponse, RegistryError> {
        let updated = self
            .store
            .update_node(node_id, |node| {
                let was_offline = node.status == NodeStatus::Offline;
                node.status = NodeStatus::Online;
                node.last_heartbeat = Some(Utc::now());
                let mut metrics = request.metrics.clone();
                metrics.reported_available = request.available_resources;
                node.metrics = Some(metrics);
                // A live heartbeat proves the node is reachable again.
                if !node.push_enabled {
                    info!(node_id = %node.id, "push re-enabled after successful heartbeat");
                    node.push_enabled = true;
                }
                node.consecutive_push_failures = 0;
                node.updated_at = Utc::now();
                was_offline
            })
            .await?;

        let Some(was_offline) = updated else {
            return Err(RegistryError::NodeNotFound(node_id.to_string()));
        };
        if was_offline {
            self.bus.publish(Event::NodeRecovered {
                node_id: node_id.to_string(),
            });
        }

        self.reconcile_vms(node_id, &request.active_vms).await?;

        let commands = self.store.get_and_clear_pending_commands(node_id);
        for command in &commands {
            self.store.record_dispatched(command.clone());
        }
        if !commands.is_empty() {
            debug!(node_id, count = commands.len(), "drained pending commands");
        }

        let token_warning = self.store.get_token(node_id).and_then(|record| {
            record
                .expiring_within(self.config.expiration_warning_days)
                .then(|| {
                    format!(
                        "Auth token expires at {}; re-register to rotate",
                        record.expires_at.to_rfc3339()
                    )
                })
        });

        Ok(HeartbeatResponse {
            ok: true,
            commands,
            token_warning,
        })
    }

    /// Fold the node's report into orchestrator state.
    async fn reconcile_vms(
        &self,
        node_id: &str,
        reported: &[ReportedVm],
    ) -> Result<(), RegistryError> {
        let known = self.store.list_vms_on_node(node_id);

        for vm in &known {
            if vm.status == VmStatus::Deleted || vm.status == VmStatus::Deleting {
                continue;
            }
            match reported.iter().find(|r| r.vm_id == vm.id) {
                Some(report) => self.apply_report(vm, report).await?,
                None => {
                    // The node should be running this VM but is not.
                    if matches!(vm.status, VmStatus::Running | VmStatus::Provisioning) {
                        warn!(vm_id = %vm.id, node_id, "VM missing from node report");
                        self.lifecycle
                            .transition(
                                &vm.id,
                                VmStatus::Error,
                                TransitionContext::new(TransitionTrigger::Heartbeat)
                                    .with_source(node_id)
                                    .with_message("VM missing from node"),
                            )
                            .await?;
                    }
                }
            }
        }

        for report in reported {
            if known.iter().any(|vm| vm.id == report.vm_id) {
                continue;
            }
            self.try_recover_vm(node_id, report).await?;
        }

        Ok(())
    }

    /// Apply a report for a VM the orchestrator already tracks.
    async fn apply_report(&self, vm: &VirtualMachine, report: &ReportedVm) -> Result<(), RegistryError> {
        // First sighting of the guest address.
        if vm.network.private_ip.is_none() && report.private_ip.is_some() {
            let ip = report.private_ip.clone();
            self.store
                .update_vm(&vm.id, |vm| vm.network.private_ip = ip)
                .await?;
        }

        self.store
            .update_vm(&vm.id, |vm| {
                vm.metrics = Some(VmMetrics {
                    cpu_usage_percent: report.cpu_usage_percent,
                    memory_usage_percent: vm
                        .metrics
                        .as_ref()
                        .map(|m| m.memory_usage_percent)
                        .unwrap_or_default(),
                    disk_usage_percent: vm
                        .metrics
                        .as_ref()
                        .map(|m| m.disk_usage_percent)
                        .unwrap_or_default(),
                    collected_at: Utc::now(),
                });
            })
            .await?;

        if vm.status == VmStatus::Provisioning && report.state == ReportedVmState::Running {
            self.lifecycle
                .transition(
                    &vm.id,
                    VmStatus::Running,
                    TransitionContext::new(TransitionTrigger::Heartbeat)
                        .with_source(vm.node_id.clone().unwrap_or_default())
                        .with_message("Node reported running"),
                )
                .await?;
        }
        Ok(())
    }

    /// Validated recovery of a VM the orchestrator does not know. Every
    /// gate failure is a security event, not a retry.
    async fn try_recover_vm(&self, node_id: &str, report: &ReportedVm) -> Result<(), RegistryError> {
        let refuse = |detail: String| {
            warn!(node_id, vm_id = %report.vm_id, detail, "orphan VM recovery refused");
            self.bus.publish(Event::SecurityAlert {
                subject: format!("node:{node_id}"),
                detail,
            });
        };

        if Uuid::parse_str(&report.vm_id).is_err() {
            refuse(format!("orphan VM id '{}' is not a UUID", report.vm_id));
            return Ok(());
        }

        let Some(node) = self.store.get_node(node_id) else {
            refuse(format!("orphan VM reported by unknown node '{node_id}'"));
            return Ok(());
        };

        let tenant = self.store.get_user(&report.tenant_id);
        match tenant {
            None => {
                refuse(format!("orphan VM tenant '{}' unknown", report.tenant_id));
                return Ok(());
            }
            Some(user) if user.suspended => {
                refuse(format!("orphan VM tenant '{}' suspended", report.tenant_id));
                return Ok(());
            }
            Some(_) => {}
        }

        if report.vcpus > node.hardware.physical_cores
            || report.memory_bytes > node.hardware.memory_bytes
        {
            refuse("orphan VM claims more resources than the node has".to_string());
            return Ok(());
        }

        if matches!(report.state, ReportedVmState::Error | ReportedVmState::Deleted) {
            refuse(format!("orphan VM in unrecoverable state {:?}", report.state));
            return Ok(());
        }

        // All gates passed: synthesize a minimal record.
        let now = Utc::now();
        let status = match report.state {
            ReportedVmState::Running => VmStatus::Running,
            ReportedVmState::Provisioning => VmStatus::Provisioning,
            ReportedVmState::Stopped => VmStatus::Stopped,
            ReportedVmState::Error | ReportedVmState::Deleted => unreachable!(),
        };

        let mut vm = VirtualMachine {
            id: report.vm_id.clone(),
            name: if report.name.is_empty() {
                format!("recovered-{}", &report.vm_id[..8])
            } else {
                report.name.clone()
            },
            owner_id: report.tenant_id.clone(),
            node_id: Some(node_id.to_string()),
            spec: VmSpec {
                vcpus: report.vcpus.max(1),
                memory_bytes: report.memory_bytes,
                disk_bytes: 0,
                tier: QualityTier::Balanced,
                gpu_required: false,
                bandwidth_tier: Default::default(),
                template_id: None,
                region_hint: None,
                zone_hint: None,
                compute_point_cost: u64::from(report.vcpus.max(1)),
            },
            status,
            status_message: Some("Recovered from node report".to_string()),
            power_state: PowerState::from_status(status),
            vm_type: Default::default(),
            network: Default::default(),
            ingress: Default::default(),
            services: vec![],
            billing: BillingInfo::default(),
            metrics: None,
            network_metrics: Default::default(),
            labels: Default::default(),
            created_at: now,
            started_at: (status == VmStatus::Running).then_some(now),
            stopped_at: None,
            updated_at: now,
        };
        vm.labels.insert(RECOVERED_LABEL.to_string(), "true".to_string());
        vm.network.private_ip = report.private_ip.clone();

        self.store.save_vm(vm).await?;
        info!(node_id, vm_id = %report.vm_id, "orphan VM recovered");
        self.bus.publish(Event::VmRecovered {
            vm_id: report.vm_id.clone(),
            node_id: node_id.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{User, UserQuota};
    use crate::commands::{CommandType, NodeCommand};
    use crate::registry::tests::{register_request, registry_harness};

    fn heartbeat(active_vms: Vec<ReportedVm>) -> HeartbeatRequest {
        HeartbeatRequest {
            metrics: NodeMetrics::default(),
            available_resources: Some(ResourceSet::new(4, 8 << 30, 100 << 30)),
            active_vms,
        }
    }

    fn reported(vm_id: &str, tenant: &str, state: ReportedVmState) -> ReportedVm {
        ReportedVm {
            vm_id: vm_id.to_string(),
            name: "guest".into(),
            state,
            tenant_id: tenant.to_string(),
            private_ip: Some("192.168.100.5".into()),
            vcpus: 2,
            memory_bytes: 2 << 30,
            cpu_usage_percent: 10.0,
        }
    }

    async fn seed_user(store: &crate::store::Store, id: &str, suspended: bool) {
        store
            .save_user(User {
                id: id.to_string(),
                wallet_address: id.to_string(),
                suspended,
                quota: UserQuota::default(),
                refresh_token_hash: None,
                refresh_expires_at: None,
                api_keys: vec![],
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_marks_online_and_drains_queue() {
        let (registry, store) = registry_harness();
        let reg = registry.register(register_request("0xAAA")).await.unwrap();

        // Knock the node offline and disable push, as the health scan would.
        store
            .update_node(&reg.node_id, |n| {
                n.status = NodeStatus::Offline;
                n.push_enabled = false;
                n.consecutive_push_failures = 5;
            })
            .await
            .unwrap();
        for i in 0..2 {
            store.add_pending_command(
                &reg.node_id,
                NodeCommand::new(CommandType::StartVm, serde_json::json!({ "seq": i })),
            );
        }

        let response = registry
            .handle_heartbeat(&reg.node_id, heartbeat(vec![]))
            .await
            .unwrap();

        assert!(response.ok);
        assert_eq!(response.commands.len(), 2);
        assert_eq!(response.commands[0].payload["seq"], 0);

        let node = store.get_node(&reg.node_id).unwrap();
        assert_eq!(node.status, NodeStatus::Online);
        assert!(node.push_enabled);
        assert_eq!(node.consecutive_push_failures, 0);
        assert!(node.metrics.unwrap().reported_available.is_some());
    }

    #[tokio::test]
    async fn test_provisioning_to_running_on_report() {
        let (registry, store) = registry_harness();
        let reg = registry.register(register_request("0xAAA")).await.unwrap();
        seed_user(&store, "0xuser", false).await;

        let mut vm = crate::lifecycle::vm::VirtualMachine::new(
            "web",
            "0xuser",
            VmSpec {
                vcpus: 1,
                memory_bytes: 1 << 30,
                disk_bytes: 10 << 30,
                tier: QualityTier::Balanced,
                gpu_required: false,
                bandwidth_tier: Default::default(),
                template_id: None,
                region_hint: None,
                zone_hint: None,
                compute_point_cost: 1,
            },
        );
        vm.node_id = Some(reg.node_id.clone());
        vm.status = VmStatus::Provisioning;
        let vm_id = vm.id.clone();
        store.save_vm(vm).await.unwrap();

        registry
            .handle_heartbeat(
                &reg.node_id,
                heartbeat(vec![reported(&vm_id, "0xuser", ReportedVmState::Running)]),
            )
            .await
            .unwrap();

        let vm = store.get_vm(&vm_id).unwrap();
        assert_eq!(vm.status, VmStatus::Running);
        assert_eq!(vm.network.private_ip.as_deref(), Some("192.168.100.5"));
    }

    #[tokio::test]
    async fn test_missing_vm_marked_error() {
        let (registry, store) = registry_harness();
        let reg = registry.register(register_request("0xAAA")).await.unwrap();

        let mut vm = crate::lifecycle::vm::VirtualMachine::new(
            "web",
            "0xuser",
            VmSpec {
                vcpus: 1,
                memory_bytes: 1 << 30,
                disk_bytes: 10 << 30,
                tier: QualityTier::Balanced,
                gpu_required: false,
                bandwidth_tier: Default::default(),
                template_id: None,
                region_hint: None,
                zone_hint: None,
                compute_point_cost: 1,
            },
        );
        vm.node_id = Some(reg.node_id.clone());
        vm.status = VmStatus::Running;
        let vm_id = vm.id.clone();
        store.save_vm(vm).await.unwrap();

        registry
            .handle_heartbeat(&reg.node_id, heartbeat(vec![]))
            .await
            .unwrap();

        let vm = store.get_vm(&vm_id).unwrap();
        assert_eq!(vm.status, VmStatus::Error);
        assert_eq!(vm.status_message.as_deref(), Some("VM missing from node"));
    }

    #[tokio::test]
    async fn test_orphan_recovery_happy_path() {
        let (registry, store) = registry_harness();
        let reg = registry.register(register_request("0xAAA")).await.unwrap();
        seed_user(&store, "0xuser", false).await;

        let orphan_id = Uuid::new_v4().to_string();
        registry
            .handle_heartbeat(
                &reg.node_id,
                heartbeat(vec![reported(&orphan_id, "0xuser", ReportedVmState::Running)]),
            )
            .await
            .unwrap();

        let vm = store.get_vm(&orphan_id).unwrap();
        assert_eq!(vm.status, VmStatus::Running);
        assert_eq!(vm.labels.get(RECOVERED_LABEL).map(String::as_str), Some("true"));
        assert_eq!(vm.node_id.as_deref(), Some(reg.node_id.as_str()));
    }

    #[tokio::test]
    async fn test_orphan_recovery_rejects_unknown_tenant() {
        let (registry, store) = registry_harness();
        let reg = registry.register(register_request("0xAAA")).await.unwrap();
        let mut security_events = registry.bus.subscribe();

        let orphan_id = Uuid::new_v4().to_string();
        registry
            .handle_heartbeat(
                &reg.node_id,
                heartbeat(vec![reported(&orphan_id, "unknown-user", ReportedVmState::Running)]),
            )
            .await
            .unwrap();

        assert!(store.get_vm(&orphan_id).is_none());
        let mut saw_alert = false;
        while let Ok(record) = security_events.try_recv() {
            if matches!(record.event, Event::SecurityAlert { .. }) {
                saw_alert = true;
            }
        }
        assert!(saw_alert);
    }

    #[tokio::test]
    async fn test_orphan_recovery_rejects_bad_id_and_state() {
        let (registry, store) = registry_harness();
        let reg = registry.register(register_request("0xAAA")).await.unwrap();
        seed_user(&store, "0xuser", false).await;

        registry
            .handle_heartbeat(
                &reg.node_id,
                heartbeat(vec![reported("not-a-uuid", "0xuser", ReportedVmState::Running)]),
            )
            .await
            .unwrap();
        assert!(store.get_vm("not-a-uuid").is_none());

        let errored = Uuid::new_v4().to_string();
        registry
            .handle_heartbeat(
                &reg.node_id,
                heartbeat(vec![reported(&errored, "0xuser", ReportedVmState::Error)]),
            )
            .await
            .unwrap();
        assert!(store.get_vm(&errored).is_none());
    }

    #[tokio::test]
    async fn test_orphan_recovery_rejects_oversized_claim() {
        let (registry, store) = registry_harness();
        let reg = registry.register(register_request("0xAAA")).await.unwrap();
        seed_user(&store, "0xuser", false).await;

        let orphan_id = Uuid::new_v4().to_string();
        let mut report = reported(&orphan_id, "0xuser", ReportedVmState::Running);
        report.vcpus = 512;

        registry
            .handle_heartbeat(&reg.node_id, heartbeat(vec![report]))
            .await
            .unwrap();
        assert!(store.get_vm(&orphan_id).is_none());
    }
}
