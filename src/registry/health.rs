//! Node liveness scanning
//!
//! Every scan tick, any node whose last heartbeat is older than the
//! configured timeout is marked Offline and each Running or Provisioning
//! VM it hosts is moved to Error through the lifecycle manager. Recovery is
//! the inverse path: the next authenticated heartbeat marks the node
//! Online again.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::events::Event;
use crate::lifecycle::vm::VmStatus;
use crate::lifecycle::{TransitionContext, TransitionTrigger};
use crate::registry::node::NodeStatus;

use super::NodeRegistry;

impl NodeRegistry {
    /// One pass over all nodes: demote the silent ones and error their VMs.
    pub async fn scan_node_health(&self) {
        let timeout = self.config.heartbeat_timeout_secs;

        for node in self.store.list_nodes() {
            if node.status != NodeStatus::Online || !node.is_stale(timeout) {
                continue;
            }

            warn!(node_id = %node.id, "node missed heartbeats, marking offline");
            let result = self
                .store
                .update_node(&node.id, |n| {
                    n.status = NodeStatus::Offline;
                })
                .await;
            if let Err(e) = result {
                warn!(node_id = %node.id, error = %e, "offline mark failed");
                continue;
            }
            self.bus.publish(Event::NodeOffline {
                node_id: node.id.clone(),
            });

            for vm in self.store.list_vms_on_node(&node.id) {
                if !matches!(vm.status, VmStatus::Running | VmStatus::Provisioning) {
                    continue;
                }
                let result = self
                    .lifecycle
                    .transition(
                        &vm.id,
                        VmStatus::Error,
                        TransitionContext::new(TransitionTrigger::NodeOffline)
                            .with_source(node.id.clone())
                            .with_message("Node offline"),
                    )
                    .await;
                if let Err(e) = result {
                    warn!(vm_id = %vm.id, error = %e, "offline VM error transition failed");
                }
            }
        }
    }
}

/// Spawn the periodic liveness scan.
pub fn spawn_health_scan(
    registry: NodeRegistry,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        info!(interval_secs, "node health scan started");
        loop {
            tokio::select! {
                _ = ticker.tick() => registry.scan_node_health().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("node health scan shutting down");
                        break;
                    }
                }
            }
        }
    })
}

/// Spawn the hourly expired-token sweep.
pub fn spawn_token_sweep(
    registry: NodeRegistry,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        info!("token sweep started");
        loop {
            tokio::select! {
                _ = ticker.tick() => registry.sweep_expired_tokens().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("token sweep shutting down");
                        break;
                    }
                }
            }
        }
    })
}
