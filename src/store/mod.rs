//! Persistence gateway
//!
//! Typed read/write access to every persisted entity, fronted by concurrent
//! in-memory maps. Reads hit memory. Plain saves write the backing
//! [`DocumentStore`] first and cache only on success; the read-modify-write
//! helpers (`update_node`, `update_vm`, `update_user`) apply the mutation
//! under the entry lock and then persist, surfacing any backend failure to
//! the caller - the periodic reconciliation loops close the gap a failed
//! persist leaves behind.
//!
//! The per-node pending-command queues are in-memory only: nodes re-pull on
//! their next heartbeat after an orchestrator restart.

pub mod backend;

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::auth::User;
use crate::billing::usage::UsageRecord;
use crate::commands::NodeCommand;
use crate::lifecycle::vm::{VirtualMachine, VmStatus, VmTemplate};
use crate::registry::node::Node;
use crate::registry::token::TokenRecord;

pub use backend::{BackendError, DocumentStore, JsonFileStore, MemoryStore};

/// Collection names in the document store
pub mod collections {
    pub const NODES: &str = "nodes";
    pub const VMS: &str = "virtualMachines";
    pub const USERS: &str = "users";
    pub const TEMPLATES: &str = "templates";
    pub const USAGE_RECORDS: &str = "usageRecords";
    pub const NODE_AUTH_TOKENS: &str = "nodeAuthTokens";
}

/// Errors surfaced by the gateway
#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Serialization failure for {collection}/{id}: {source}")]
    Codec {
        collection: String,
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// The persistence gateway. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn DocumentStore>,

    nodes: Arc<DashMap<String, Node>>,
    vms: Arc<DashMap<String, VirtualMachine>>,
    users: Arc<DashMap<String, User>>,
    templates: Arc<DashMap<String, VmTemplate>>,
    usage_records: Arc<DashMap<String, UsageRecord>>,
    tokens: Arc<DashMap<String, TokenRecord>>,

    /// Per-node FIFO command queues, in-memory only
    pending_commands: Arc<DashMap<String, VecDeque<NodeCommand>>>,

    /// Commands handed to nodes (pushed or drained) awaiting an ack,
    /// keyed by command id. In-memory only.
    dispatched_commands: Arc<DashMap<String, NodeCommand>>,
}

impl Store {
    pub fn new(backend: Arc<dyn DocumentStore>) -> Self {
        Self {
            backend,
            nodes: Arc::new(DashMap::new()),
            vms: Arc::new(DashMap::new()),
            users: Arc::new(DashMap::new()),
            templates: Arc::new(DashMap::new()),
            usage_records: Arc::new(DashMap::new()),
            tokens: Arc::new(DashMap::new()),
            pending_commands: Arc::new(DashMap::new()),
            dispatched_commands: Arc::new(DashMap::new()),
        }
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Hydrate every cache from the backend. Called once at startup.
    pub async fn load_all(&self) -> Result<(), StoreError> {
        self.hydrate(collections::NODES, &self.nodes).await?;
        self.hydrate(collections::VMS, &self.vms).await?;
        self.hydrate(collections::USERS, &self.users).await?;
        self.hydrate(collections::TEMPLATES, &self.templates).await?;
        self.hydrate(collections::USAGE_RECORDS, &self.usage_records)
            .await?;
        self.hydrate(collections::NODE_AUTH_TOKENS, &self.tokens)
            .await?;

        info!(
            nodes = self.nodes.len(),
            vms = self.vms.len(),
            users = self.users.len(),
            "store hydrated"
        );
        Ok(())
    }

    async fn hydrate<T: DeserializeOwned>(
        &self,
        collection: &str,
        cache: &DashMap<String, T>,
    ) -> Result<(), StoreError> {
        for (id, doc) in self.backend.scan(collection).await? {
            match serde_json::from_value::<T>(doc) {
                Ok(entity) => {
                    cache.insert(id, entity);
                }
                Err(e) => {
                    warn!(collection, id, error = %e, "skipping undecodable document");
                }
            }
        }
        Ok(())
    }

    async fn persist<T: Serialize>(
        &self,
        collection: &str,
        id: &str,
        entity: &T,
    ) -> Result<(), StoreError> {
        let doc = serde_json::to_value(entity).map_err(|e| StoreError::Codec {
            collection: collection.to_string(),
            id: id.to_string(),
            source: e,
        })?;
        self.backend.put(collection, id, doc).await?;
        Ok(())
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    pub fn get_node(&self, id: &str) -> Option<Node> {
        self.nodes.get(id).map(|r| r.clone())
    }

    pub fn find_node_by_wallet(&self, wallet: &str) -> Option<Node> {
        let wallet = wallet.to_lowercase();
        self.nodes
            .iter()
            .find(|r| r.wallet_address.to_lowercase() == wallet)
            .map(|r| r.clone())
    }

    pub fn list_nodes(&self) -> Vec<Node> {
        self.nodes.iter().map(|r| r.clone()).collect()
    }

    pub async fn save_node(&self, node: Node) -> Result<(), StoreError> {
        self.persist(collections::NODES, &node.id, &node).await?;
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Read-modify-write a node under its cache entry lock, then persist.
    ///
    /// The closure runs while the entry is held, so concurrent mutators of
    /// the same node serialize; this is what makes reservation arithmetic
    /// and push-counter updates atomic per node.
    pub async fn update_node<F, R>(&self, id: &str, mutate: F) -> Result<Option<R>, StoreError>
    where
        F: FnOnce(&mut Node) -> R,
    {
        let snapshot = {
            let mut entry = match self.nodes.get_mut(id) {
                Some(e) => e,
                None => return Ok(None),
            };
            let result = mutate(entry.value_mut());
            (entry.value().clone(), result)
        };
        let (node, result) = snapshot;
        self.persist(collections::NODES, id, &node).await?;
        Ok(Some(result))
    }

    pub async fn delete_node(&self, id: &str) -> Result<bool, StoreError> {
        let existed = self.backend.delete(collections::NODES, id).await?;
        self.nodes.remove(id);
        self.pending_commands.remove(id);
        Ok(existed)
    }

    // =========================================================================
    // Virtual machines
    // =========================================================================

    pub fn get_vm(&self, id: &str) -> Option<VirtualMachine> {
        self.vms.get(id).map(|r| r.clone())
    }

    pub fn find_vm_by_name(&self, name: &str) -> Option<VirtualMachine> {
        self.vms.iter().find(|r| r.name == name).map(|r| r.clone())
    }

    pub fn list_vms(&self) -> Vec<VirtualMachine> {
        self.vms.iter().map(|r| r.clone()).collect()
    }

    pub fn list_vms_by_status(&self, status: VmStatus) -> Vec<VirtualMachine> {
        self.vms
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.clone())
            .collect()
    }

    pub fn list_vms_on_node(&self, node_id: &str) -> Vec<VirtualMachine> {
        self.vms
            .iter()
            .filter(|r| r.node_id.as_deref() == Some(node_id))
            .map(|r| r.clone())
            .collect()
    }

    pub fn list_vms_for_owner(&self, owner_id: &str) -> Vec<VirtualMachine> {
        self.vms
            .iter()
            .filter(|r| r.owner_id == owner_id)
            .map(|r| r.clone())
            .collect()
    }

    pub async fn save_vm(&self, vm: VirtualMachine) -> Result<(), StoreError> {
        self.persist(collections::VMS, &vm.id, &vm).await?;
        self.vms.insert(vm.id.clone(), vm);
        Ok(())
    }

    /// Read-modify-write a VM under its cache entry lock, then persist.
    /// Lifecycle transitions are linearized per VM through this.
    pub async fn update_vm<F, R>(&self, id: &str, mutate: F) -> Result<Option<R>, StoreError>
    where
        F: FnOnce(&mut VirtualMachine) -> R,
    {
        let snapshot = {
            let mut entry = match self.vms.get_mut(id) {
                Some(e) => e,
                None => return Ok(None),
            };
            let result = mutate(entry.value_mut());
            (entry.value().clone(), result)
        };
        let (vm, result) = snapshot;
        self.persist(collections::VMS, id, &vm).await?;
        Ok(Some(result))
    }

    pub async fn delete_vm(&self, id: &str) -> Result<bool, StoreError> {
        let existed = self.backend.delete(collections::VMS, id).await?;
        self.vms.remove(id);
        Ok(existed)
    }

    // =========================================================================
    // Users
    // =========================================================================

    pub fn get_user(&self, id: &str) -> Option<User> {
        self.users.get(id).map(|r| r.clone())
    }

    pub fn list_users(&self) -> Vec<User> {
        self.users.iter().map(|r| r.clone()).collect()
    }

    pub async fn save_user(&self, user: User) -> Result<(), StoreError> {
        self.persist(collections::USERS, &user.id, &user).await?;
        self.users.insert(user.id.clone(), user);
        Ok(())
    }

    pub async fn update_user<F, R>(&self, id: &str, mutate: F) -> Result<Option<R>, StoreError>
    where
        F: FnOnce(&mut User) -> R,
    {
        let snapshot = {
            let mut entry = match self.users.get_mut(id) {
                Some(e) => e,
                None => return Ok(None),
            };
            let result = mutate(entry.value_mut());
            (entry.value().clone(), result)
        };
        let (user, result) = snapshot;
        self.persist(collections::USERS, id, &user).await?;
        Ok(Some(result))
    }

    // =========================================================================
    // Templates
    // =========================================================================

    pub fn get_template(&self, id: &str) -> Option<VmTemplate> {
        self.templates.get(id).map(|r| r.clone())
    }

    pub fn list_templates(&self) -> Vec<VmTemplate> {
        self.templates.iter().map(|r| r.clone()).collect()
    }

    pub async fn save_template(&self, template: VmTemplate) -> Result<(), StoreError> {
        self.persist(collections::TEMPLATES, &template.id, &template)
            .await?;
        self.templates.insert(template.id.clone(), template);
        Ok(())
    }

    pub async fn delete_template(&self, id: &str) -> Result<bool, StoreError> {
        let existed = self.backend.delete(collections::TEMPLATES, id).await?;
        self.templates.remove(id);
        Ok(existed)
    }

    // =========================================================================
    // Usage records
    // =========================================================================

    pub fn get_usage_record(&self, id: &str) -> Option<UsageRecord> {
        self.usage_records.get(id).map(|r| r.clone())
    }

    pub fn list_usage_records(&self) -> Vec<UsageRecord> {
        self.usage_records.iter().map(|r| r.clone()).collect()
    }

    pub fn list_unsettled_usage(&self) -> Vec<UsageRecord> {
        self.usage_records
            .iter()
            .filter(|r| !r.settled)
            .map(|r| r.clone())
            .collect()
    }

    pub async fn save_usage_record(&self, record: UsageRecord) -> Result<(), StoreError> {
        self.persist(collections::USAGE_RECORDS, &record.id, &record)
            .await?;
        self.usage_records.insert(record.id.clone(), record);
        Ok(())
    }

    // =========================================================================
    // Node auth tokens (TTL handled by the explicit sweep)
    // =========================================================================

    /// Token record for a node, if any. Keyed by node id: one live token per
    /// node, rotation replaces it.
    pub fn get_token(&self, node_id: &str) -> Option<TokenRecord> {
        self.tokens.get(node_id).map(|r| r.clone())
    }

    pub fn list_tokens(&self) -> Vec<TokenRecord> {
        self.tokens.iter().map(|r| r.clone()).collect()
    }

    pub async fn save_token(&self, record: TokenRecord) -> Result<(), StoreError> {
        self.persist(collections::NODE_AUTH_TOKENS, &record.node_id, &record)
            .await?;
        self.tokens.insert(record.node_id.clone(), record);
        Ok(())
    }

    pub async fn delete_token(&self, node_id: &str) -> Result<bool, StoreError> {
        let existed = self
            .backend
            .delete(collections::NODE_AUTH_TOKENS, node_id)
            .await?;
        self.tokens.remove(node_id);
        Ok(existed)
    }

    // =========================================================================
    // Pending command queue (in-memory, FIFO per node)
    // =========================================================================

    /// Append a command to a node's queue.
    pub fn add_pending_command(&self, node_id: &str, command: NodeCommand) {
        self.pending_commands
            .entry(node_id.to_string())
            .or_default()
            .push_back(command);
    }

    pub fn has_pending_commands(&self, node_id: &str) -> bool {
        self.pending_commands
            .get(node_id)
            .map(|q| !q.is_empty())
            .unwrap_or(false)
    }

    /// Drain the node's queue in FIFO order.
    pub fn get_and_clear_pending_commands(&self, node_id: &str) -> Vec<NodeCommand> {
        self.pending_commands
            .get_mut(node_id)
            .map(|mut q| q.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn peek_pending_commands(&self, node_id: &str) -> Vec<NodeCommand> {
        self.pending_commands
            .get(node_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Run `decide` with exclusive access to the node's queue. Command
    /// delivery uses this so the queue-empty check and the push/enqueue
    /// decision happen under one lock, preserving per-node FIFO.
    pub fn with_command_queue<F, R>(&self, node_id: &str, decide: F) -> R
    where
        F: FnOnce(&mut VecDeque<NodeCommand>) -> R,
    {
        let mut entry = self.pending_commands.entry(node_id.to_string()).or_default();
        decide(entry.value_mut())
    }

    /// Remember a command handed to a node, so its eventual ack can be
    /// mapped back to the VM it concerns.
    pub fn record_dispatched(&self, command: NodeCommand) {
        self.dispatched_commands.insert(command.id.clone(), command);
    }

    /// Claim the dispatched command for an ack. Each ack resolves at most
    /// once.
    pub fn take_dispatched(&self, command_id: &str) -> Option<NodeCommand> {
        self.dispatched_commands.remove(command_id).map(|(_, c)| c)
    }

    /// Drop commands older than the TTL across all queues and the
    /// dispatched set. Returns the number removed; removals are logged by
    /// the caller.
    pub fn evict_stale_commands(&self, ttl_secs: i64) -> usize {
        let cutoff = chrono::Utc::now() - chrono::Duration::seconds(ttl_secs);
        let mut evicted = 0;
        for mut entry in self.pending_commands.iter_mut() {
            let before = entry.len();
            entry.retain(|c| c.created_at > cutoff);
            evicted += before - entry.len();
        }
        let before = self.dispatched_commands.len();
        self.dispatched_commands.retain(|_, c| c.created_at > cutoff);
        evicted += before - self.dispatched_commands.len();
        evicted
    }
}
