//! Scheduler - benchmark-driven, overcommit-aware VM placement
//!
//! The scheduler filters Online nodes through a feasibility gate (tier
//! eligibility, effective capacity, utilization cap, memory floor, GPU),
//! scores survivors on capacity, load, reputation and locality, and
//! reserves resources on the winner atomically before the `CreateVm`
//! command is handed to delivery. When nothing fits, the VM parks back in
//! `Pending` and the sweep retries on the next tick.

pub mod capacity;
pub mod evaluator;

use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::commands::{CommandSender, CommandType, NodeCommand};
use crate::config::SchedulingConfig;
use crate::lifecycle::vm::{VirtualMachine, VmSpec, VmStatus};
use crate::lifecycle::{LifecycleManager, TransitionContext, TransitionTrigger};
use crate::registry::node::{Node, NodeStatus, ResourceSet};
use crate::store::Store;

use capacity::{effective_capacity, projected_utilization_percent, remaining_capacity};

/// Stable reason string for the no-capacity park message
pub const WAITING_FOR_RESOURCES: &str = "Waiting for available resources";

/// Why a node failed the feasibility gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Infeasibility {
    NotOnline,
    TierIneligible,
    InsufficientCapacity,
    UtilizationCapExceeded,
    MemoryFloorViolated,
    GpuUnavailable,
}

/// Errors from placement
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("VM '{0}' not found")]
    VmNotFound(String),

    #[error("No feasible node for VM '{0}'")]
    NoFeasibleNode(String),

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    #[error(transparent)]
    Lifecycle(#[from] crate::lifecycle::LifecycleError),
}

/// Score breakdown for one candidate node
#[derive(Debug, Clone)]
pub struct PlacementScore {
    pub node_id: String,
    pub total: f64,
    pub capacity: f64,
    pub load: f64,
    pub reputation: f64,
    pub locality: f64,
}

/// The placement engine
#[derive(Clone)]
pub struct Scheduler {
    store: Store,
    config: SchedulingConfig,
    lifecycle: LifecycleManager,
    commands: CommandSender,
}

impl Scheduler {
    pub fn new(
        store: Store,
        config: SchedulingConfig,
        lifecycle: LifecycleManager,
        commands: CommandSender,
    ) -> Self {
        Self {
            store,
            config,
            lifecycle,
            commands,
        }
    }

    /// The resource cost of a spec, as reserved on a node.
    fn cost_of(spec: &VmSpec) -> ResourceSet {
        ResourceSet::new(spec.compute_point_cost, spec.memory_bytes, spec.disk_bytes)
    }

    /// Check one node against the feasibility gate.
    pub fn check_feasibility(&self, node: &Node, spec: &VmSpec) -> Result<(), Infeasibility> {
        if node.status != NodeStatus::Online {
            return Err(Infeasibility::NotOnline);
        }

        let policy = self
            .config
            .tiers
            .get(&spec.tier)
            .ok_or(Infeasibility::TierIneligible)?;
        if node.hardware.benchmark_score < policy.minimum_benchmark {
            return Err(Infeasibility::TierIneligible);
        }

        let cost = Self::cost_of(spec);
        let remaining = remaining_capacity(node, spec.tier, &self.config);
        if !remaining.covers(&cost) {
            return Err(Infeasibility::InsufficientCapacity);
        }

        let projected = projected_utilization_percent(
            node,
            spec.tier,
            spec.compute_point_cost,
            &self.config,
        );
        if projected > self.config.max_utilization_percent {
            return Err(Infeasibility::UtilizationCapExceeded);
        }

        let free_after = remaining.memory_bytes.saturating_sub(spec.memory_bytes);
        if free_after < self.config.min_free_memory_mb * 1024 * 1024 {
            return Err(Infeasibility::MemoryFloorViolated);
        }

        if spec.gpu_required && !node.hardware.has_gpu() {
            return Err(Infeasibility::GpuUnavailable);
        }

        Ok(())
    }

    /// Score a feasible node for a spec. Higher is better; all components
    /// are 0..=1 before weighting.
    pub fn score_node(&self, node: &Node, spec: &VmSpec) -> PlacementScore {
        let weights = self.config.weights;
        let cost = Self::cost_of(spec);

        // Capacity: fraction of effective capacity still free after this
        // placement, averaged equally over points, memory and storage.
        let capacity = self
            .config
            .tiers
            .get(&spec.tier)
            .map(|policy| {
                let total = effective_capacity(node, policy, &self.config);
                let after = total
                    .saturating_sub(&node.resources.reserved)
                    .saturating_sub(&cost);
                let frac = |rem: u64, tot: u64| {
                    if tot == 0 {
                        0.0
                    } else {
                        rem as f64 / tot as f64
                    }
                };
                (frac(after.compute_points, total.compute_points)
                    + frac(after.memory_bytes, total.memory_bytes)
                    + frac(after.storage_bytes, total.storage_bytes))
                    / 3.0
            })
            .unwrap_or(0.0);

        // Load: inverse of the normalized load average, 0 when unknown.
        let load = node
            .metrics
            .as_ref()
            .and_then(|m| m.normalized_load)
            .map(|l| (1.0 - l).clamp(0.0, 1.0))
            .unwrap_or(0.0);

        // Reputation: monotonic in completions and uptime.
        let completions = node.reputation.successful_vm_completions as f64;
        let reputation = 0.5 * (node.reputation.uptime_percent / 100.0).clamp(0.0, 1.0)
            + 0.5 * (completions / (completions + 10.0));

        // Locality: exact region match beats zone match beats nothing.
        let locality = match (&spec.region_hint, &spec.zone_hint) {
            (Some(region), _) if self.config.prefer_local_region && *region == node.region => 1.0,
            (_, Some(zone)) if self.config.prefer_local_region && *zone == node.zone => 0.5,
            _ => 0.0,
        };

        PlacementScore {
            node_id: node.id.clone(),
            total: weights.capacity * capacity
                + weights.load * load
                + weights.reputation * reputation
                + weights.locality * locality,
            capacity,
            load,
            reputation,
            locality,
        }
    }

    /// Rank all feasible nodes for a spec, best first, ties broken by id.
    pub fn rank_candidates(&self, spec: &VmSpec) -> Vec<PlacementScore> {
        let mut scored: Vec<PlacementScore> = self
            .store
            .list_nodes()
            .iter()
            .filter(|node| self.check_feasibility(node, spec).is_ok())
            .map(|node| self.score_node(node, spec))
            .collect();

        scored.sort_by(|a, b| {
            b.total
                .partial_cmp(&a.total)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        scored
    }

    /// Place one VM. On success the winner holds the reservation, the VM is
    /// in `Provisioning`, and the `CreateVm` command is on its way.
    pub async fn place_vm(&self, vm_id: &str) -> Result<String, SchedulerError> {
        let vm = self
            .store
            .get_vm(vm_id)
            .ok_or_else(|| SchedulerError::VmNotFound(vm_id.to_string()))?;

        let candidates = self.rank_candidates(&vm.spec);
        if candidates.is_empty() {
            self.park_pending(vm_id).await?;
            return Err(SchedulerError::NoFeasibleNode(vm_id.to_string()));
        }

        for candidate in candidates {
            if self.try_reserve(&candidate.node_id, &vm).await? {
                debug!(
                    vm_id,
                    node_id = %candidate.node_id,
                    score = candidate.total,
                    "placement reserved"
                );

                self.store
                    .update_vm(vm_id, |vm| vm.node_id = Some(candidate.node_id.clone()))
                    .await?;
                let _ = self
                    .store
                    .update_user(&vm.owner_id, |user| {
                        user.quota.active_vms += 1;
                        user.quota.reserved_compute_points += vm.spec.compute_point_cost;
                    })
                    .await;

                self.lifecycle
                    .transition(
                        vm_id,
                        VmStatus::Provisioning,
                        TransitionContext::new(TransitionTrigger::Manual)
                            .with_source("scheduler")
                            .with_message(format!("Placed on node {}", candidate.node_id)),
                    )
                    .await?;

                let command = NodeCommand::new(
                    CommandType::CreateVm,
                    serde_json::json!({
                        "vmId": vm.id,
                        "name": vm.name,
                        "spec": vm.spec,
                        "vmType": vm.vm_type,
                    }),
                );
                self.commands.deliver(&candidate.node_id, command).await;

                info!(vm_id, node_id = %candidate.node_id, "VM scheduled");
                return Ok(candidate.node_id);
            }
            // Lost the race for this node; fall through to the next one.
            debug!(vm_id, node_id = %candidate.node_id, "reservation lost, trying next");
        }

        self.park_pending(vm_id).await?;
        Err(SchedulerError::NoFeasibleNode(vm_id.to_string()))
    }

    /// Reserve the VM's cost on a node. The feasibility re-check and the
    /// reservation increment run under the node's entry lock, so two
    /// placements cannot both fit into the same last slice of capacity.
    async fn try_reserve(&self, node_id: &str, vm: &VirtualMachine) -> Result<bool, SchedulerError> {
        let cost = Self::cost_of(&vm.spec);
        let config = self.config.clone();
        let spec_tier = vm.spec.tier;

        let reserved = self
            .store
            .update_node(node_id, |node| {
                let remaining = remaining_capacity(node, spec_tier, &config);
                if remaining.covers(&cost) {
                    node.resources.reserved = node.resources.reserved.plus(&cost);
                    node.reputation.total_vms_hosted += 1;
                    true
                } else {
                    false
                }
            })
            .await?;
        Ok(reserved.unwrap_or(false))
    }

    /// Return a VM to `Pending` with the stable no-capacity reason.
    async fn park_pending(&self, vm_id: &str) -> Result<(), SchedulerError> {
        let Some(vm) = self.store.get_vm(vm_id) else {
            return Ok(());
        };
        if vm.status == VmStatus::Scheduling {
            self.lifecycle
                .transition(
                    vm_id,
                    VmStatus::Pending,
                    TransitionContext::new(TransitionTrigger::Manual)
                        .with_source("scheduler")
                        .with_message(WAITING_FOR_RESOURCES),
                )
                .await?;
        }
        Ok(())
    }

    /// One sweep over pending VMs.
    pub async fn sweep(&self) {
        for vm in self.store.list_vms_by_status(VmStatus::Pending) {
            let moved = self
                .lifecycle
                .transition(
                    &vm.id,
                    VmStatus::Scheduling,
                    TransitionContext::new(TransitionTrigger::Manual).with_source("scheduler"),
                )
                .await;
            match moved {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(vm_id = %vm.id, error = %e, "scheduling transition failed");
                    continue;
                }
            }

            match self.place_vm(&vm.id).await {
                Ok(_) => {}
                Err(SchedulerError::NoFeasibleNode(_)) => {
                    debug!(vm_id = %vm.id, "no feasible node, parked pending");
                }
                Err(e) => warn!(vm_id = %vm.id, error = %e, "placement failed"),
            }
        }
    }
}

/// Spawn the periodic scheduling sweep.
pub fn spawn_scheduler_loop(
    scheduler: Scheduler,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        info!(interval_secs, "scheduler sweep started");
        loop {
            tokio::select! {
                _ = ticker.tick() => scheduler.sweep().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler sweep shutting down");
                        break;
                    }
                }
            }
        }
    })
}
