//! Command delivery - hybrid push-then-queue dispatch to node agents
//!
//! Commands destined for a node are pushed over HTTP when the node's queue
//! is empty and push is enabled; otherwise they are appended to the node's
//! FIFO queue and drained by the next heartbeat. Five consecutive push
//! failures disable push for the node until a successful heartbeat.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::Store;

/// Hard timeout for a single push attempt
pub const PUSH_TIMEOUT: Duration = Duration::from_secs(3);

/// Consecutive failures after which push is disabled for a node
pub const PUSH_DISABLE_THRESHOLD: u32 = 5;

/// A command for a node agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCommand {
    pub id: String,

    #[serde(rename = "commandType")]
    pub command_type: CommandType,

    pub payload: serde_json::Value,

    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl NodeCommand {
    pub fn new(command_type: CommandType, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            command_type,
            payload,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandType {
    CreateVm,
    StartVm,
    StopVm,
    DeleteVm,
    SignCertificate,
    ConfigureWireGuard,
}

/// How a command reached (or will reach) the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryOutcome {
    /// Delivered over HTTP push
    Pushed,
    /// Appended to the node's pending queue
    Queued,
}

/// A command result reported back by the node agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandAck {
    #[serde(rename = "commandId")]
    pub command_id: String,

    pub status: AckStatus,

    #[serde(default)]
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckStatus {
    Success,
    Failed,
}

/// Delivers commands to node agents.
#[derive(Clone)]
pub struct CommandSender {
    store: Store,
    client: Client,
}

impl CommandSender {
    pub fn new(store: Store) -> Self {
        let client = Client::builder()
            .timeout(PUSH_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");
        Self { store, client }
    }

    /// Deliver a command to a node.
    ///
    /// The queue-empty check and the push-or-enqueue decision run under the
    /// node's queue lock: once anything is queued, everything queues behind
    /// it until a heartbeat drains, so per-node order is strict FIFO.
    pub async fn deliver(&self, node_id: &str, command: NodeCommand) -> DeliveryOutcome {
        // Remembered up front so the eventual ack resolves to its VM no
        // matter which path the command takes.
        self.store.record_dispatched(command.clone());

        let node = match self.store.get_node(node_id) {
            Some(n) => n,
            None => {
                warn!(node_id, command = ?command.command_type, "command for unknown node queued");
                self.store.add_pending_command(node_id, command);
                return DeliveryOutcome::Queued;
            }
        };

        // Decide under the queue lock; actually push outside it.
        let push_candidate = self.store.with_command_queue(node_id, |queue| {
            if !queue.is_empty() || !node.push_enabled {
                queue.push_back(command.clone());
                false
            } else {
                true
            }
        });

        if !push_candidate {
            debug!(node_id, command_id = %command.id, "command queued");
            return DeliveryOutcome::Queued;
        }

        let Some(ip) = node.reachable_ip().map(String::from) else {
            warn!(node_id, "node has no reachable address, queueing");
            self.store.add_pending_command(node_id, command);
            return DeliveryOutcome::Queued;
        };

        let url = format!("http://{}:{}/api/commands/receive", ip, node.agent_port);
        match self.client.post(&url).json(&command).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(node_id, command_id = %command.id, "command pushed");
                let _ = self
                    .store
                    .update_node(node_id, |n| {
                        n.push_successes += 1;
                        n.consecutive_push_failures = 0;
                        n.last_command_pushed_at = Some(Utc::now());
                    })
                    .await;
                DeliveryOutcome::Pushed
            }
            Ok(resp) => {
                let status = resp.status();
                warn!(node_id, %status, "push rejected, queueing");
                self.record_push_failure(node_id, command).await;
                DeliveryOutcome::Queued
            }
            Err(e) => {
                warn!(node_id, error = %e, "push failed, queueing");
                self.record_push_failure(node_id, command).await;
                DeliveryOutcome::Queued
            }
        }
    }

    async fn record_push_failure(&self, node_id: &str, command: NodeCommand) {
        self.store.add_pending_command(node_id, command);
        let _ = self
            .store
            .update_node(node_id, |n| {
                n.consecutive_push_failures += 1;
                if n.consecutive_push_failures >= PUSH_DISABLE_THRESHOLD && n.push_enabled {
                    n.push_enabled = false;
                    info!(
                        node_id = %n.id,
                        failures = n.consecutive_push_failures,
                        "push disabled until next successful heartbeat"
                    );
                }
            })
            .await;
    }
}

/// Spawn the stale-command sweep.
///
/// Queued commands a node never pulled (e.g. it went offline for good) are
/// dropped after the configured TTL with a warning; nothing is dropped
/// silently.
pub fn spawn_stale_command_sweep(
    store: Store,
    ttl_secs: i64,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        info!(ttl_secs, "stale command sweep started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = store.evict_stale_commands(ttl_secs);
                    if evicted > 0 {
                        warn!(evicted, ttl_secs, "dropped stale pending commands");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("stale command sweep shutting down");
                        break;
                    }
                }
            }
        }
    })
}

/// `Arc`-able sender alias used by components that only need delivery.
pub type SharedCommandSender = Arc<CommandSender>;
