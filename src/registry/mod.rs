//! Node registry - registration, tokens, heartbeats, liveness
//!
//! The registry owns every node record: it admits nodes, rotates their auth
//! tokens, ingests heartbeats (including VM state reconciliation and orphan
//! recovery), translates command acks into lifecycle transitions, and runs
//! the liveness scan that marks silent nodes Offline.

pub mod health;
pub mod heartbeat;
pub mod node;
pub mod token;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::commands::{AckStatus, CommandAck, CommandType};
use crate::config::{RegistryConfig, SchedulingConfig};
use crate::events::{Event, EventBus};
use crate::lifecycle::vm::VmStatus;
use crate::lifecycle::{LifecycleManager, TransitionContext, TransitionTrigger};
use crate::scheduler::{capacity, evaluator};
use crate::store::Store;

use node::{GpuDevice, HardwareProfile, NatClass, Node, NodeStatus, StorageDevice};
use token::TokenRecord;

/// Errors from the registry surface
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Node '{0}' not found")]
    NodeNotFound(String),

    #[error("Invalid auth token for node '{0}'")]
    InvalidToken(String),

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    #[error(transparent)]
    Lifecycle(#[from] crate::lifecycle::LifecycleError),
}

/// Node registration request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    #[serde(rename = "walletAddress")]
    pub wallet_address: String,

    pub name: String,

    #[serde(rename = "publicIp")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,

    #[serde(rename = "agentPort")]
    pub agent_port: u16,

    #[serde(default)]
    pub nat: NatClass,

    pub region: String,

    pub zone: String,

    pub hardware: HardwareProfile,

    #[serde(rename = "agentVersion")]
    #[serde(default)]
    pub agent_version: String,

    #[serde(rename = "supportedImages")]
    #[serde(default)]
    pub supported_images: Vec<String>,

    #[serde(default)]
    pub gpus: Vec<GpuDevice>,

    #[serde(rename = "storageDevices")]
    #[serde(default)]
    pub storage_devices: Vec<StorageDevice>,
}

/// Node registration response. The raw token appears here exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    #[serde(rename = "nodeId")]
    pub node_id: String,

    pub token: String,

    #[serde(rename = "heartbeatInterval")]
    pub heartbeat_interval_secs: u64,
}

/// The node registry service
#[derive(Clone)]
pub struct NodeRegistry {
    pub(crate) store: Store,
    pub(crate) bus: EventBus,
    pub(crate) config: RegistryConfig,
    pub(crate) scheduling: SchedulingConfig,
    pub(crate) lifecycle: LifecycleManager,
}

impl NodeRegistry {
    pub fn new(
        store: Store,
        bus: EventBus,
        config: RegistryConfig,
        scheduling: SchedulingConfig,
        lifecycle: LifecycleManager,
    ) -> Self {
        Self {
            store,
            bus,
            config,
            scheduling,
            lifecycle,
        }
    }

    /// Register a node, or re-register an existing one by wallet address.
    /// Either way a fresh auth token is minted and the old one is dead.
    pub async fn register(&self, request: RegisterRequest) -> Result<RegisterResponse, RegistryError> {
        let mut hardware = request.hardware.clone();
        if !request.gpus.is_empty() {
            hardware.gpus = request.gpus.clone();
        }
        if !request.storage_devices.is_empty() {
            hardware.storage_devices = request.storage_devices.clone();
        }

        let existing = self.store.find_node_by_wallet(&request.wallet_address);
        let is_new = existing.is_none();
        let now = Utc::now();

        let mut node = existing.unwrap_or_else(|| Node {
            id: Uuid::new_v4().to_string(),
            wallet_address: request.wallet_address.clone(),
            name: request.name.clone(),
            region: request.region.clone(),
            zone: request.zone.clone(),
            status: NodeStatus::Offline,
            public_ip: None,
            agent_port: request.agent_port,
            nat: request.nat,
            hardware: HardwareProfile::default(),
            resources: Default::default(),
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
            registered_at: now,
            updated_at: now,
        });

        node.name = request.name;
        node.region = request.region;
        node.zone = request.zone;
        node.public_ip = request.public_ip;
        node.agent_port = request.agent_port;
        node.nat = request.nat;
        node.agent_version = request.agent_version;
        node.supported_images = request.supported_images;
        node.hardware = hardware;
        node.status = NodeStatus::Online;
        node.last_heartbeat = Some(now);
        node.updated_at = now;

        node.evaluation = Some(evaluator::evaluate(
            node.hardware.benchmark_score,
            &self.scheduling,
        ));
        node.resources.total = capacity::registration_totals(&node, &self.scheduling);

        // Hardware may have changed across re-registration; recompute which
        // system-VM roles this node owes, keeping the state of roles it
        // already carries.
        node.obligations = crate::sysvm::merge_obligations(
            &node,
            crate::sysvm::compute_obligations(&node.hardware, node.nat),
        );

        let node_id = node.id.clone();
        self.store.save_node(node).await?;

        let (record, raw_token) = TokenRecord::mint(&node_id, self.config.token_lifetime_days);
        self.store.save_token(record).await?;

        info!(node_id = %node_id, new = is_new, "node registered");
        self.bus.publish(Event::NodeRegistered {
            node_id: node_id.clone(),
            wallet_address: request.wallet_address,
        });

        Ok(RegisterResponse {
            node_id,
            token: raw_token,
            heartbeat_interval_secs: self.config.heartbeat_interval_secs,
        })
    }

    /// Drop token records past their expiry. A real document database
    /// enforces this with a TTL index on `expiresAt`; the explicit sweep
    /// keeps the cache and the file backend honest too.
    pub async fn sweep_expired_tokens(&self) {
        let now = Utc::now();
        for record in self.store.list_tokens() {
            if record.expires_at <= now {
                match self.store.delete_token(&record.node_id).await {
                    Ok(_) => info!(node_id = %record.node_id, "expired token removed"),
                    Err(e) => warn!(node_id = %record.node_id, error = %e, "token sweep failed"),
                }
            }
        }
    }

    /// Validate a node's bearer token, stamping `last_used_at` on success.
    pub async fn validate_token(&self, node_id: &str, presented: &str) -> bool {
        let Some(record) = self.store.get_token(node_id) else {
            return false;
        };
        if !record.validates(presented) {
            self.bus.publish(Event::SecurityAlert {
                subject: node_id.to_string(),
                detail: "invalid node auth token".to_string(),
            });
            return false;
        }

        let mut stamped = record;
        stamped.last_used_at = Some(Utc::now());
        if let Err(e) = self.store.save_token(stamped).await {
            warn!(node_id, error = %e, "token use stamp failed");
        }
        true
    }

    /// Translate command results from a node into lifecycle transitions.
    pub async fn handle_acks(&self, node_id: &str, acks: Vec<CommandAck>) -> Result<(), RegistryError> {
        for ack in acks {
            let Some(command) = self.store.take_dispatched(&ack.command_id) else {
                warn!(node_id, command_id = %ack.command_id, "ack for unknown command");
                continue;
            };
            let Some(vm_id) = command.payload.get("vmId").and_then(|v| v.as_str()) else {
                continue;
            };

            let (target, trigger) = match (command.command_type, ack.status) {
                (CommandType::CreateVm, AckStatus::Success) => {
                    (Some(VmStatus::Provisioning), TransitionTrigger::CommandAck)
                }
                (CommandType::StartVm, AckStatus::Success) => {
                    (Some(VmStatus::Running), TransitionTrigger::CommandAck)
                }
                (CommandType::StopVm, AckStatus::Success) => {
                    (Some(VmStatus::Stopped), TransitionTrigger::CommandAck)
                }
                (CommandType::DeleteVm, AckStatus::Success) => {
                    (Some(VmStatus::Deleted), TransitionTrigger::CommandAck)
                }
                (_, AckStatus::Failed) => (Some(VmStatus::Error), TransitionTrigger::CommandFailed),
                _ => (None, TransitionTrigger::CommandAck),
            };

            if let Some(target) = target {
                let message = match ack.status {
                    AckStatus::Failed => format!(
                        "Command {:?} failed: {}",
                        command.command_type,
                        ack.result.get("error").and_then(|e| e.as_str()).unwrap_or("unknown")
                    ),
                    AckStatus::Success => format!("Command {:?} acknowledged", command.command_type),
                };
                self.lifecycle
                    .transition(
                        vm_id,
                        target,
                        TransitionContext::new(trigger)
                            .with_source(node_id)
                            .with_message(message),
                    )
                    .await?;
            }
        }
        Ok(())
    }
}
