//! Node resource - an untrusted worker host in the DeCloud network
//!
//! A Node:
//! - Registers with the orchestrator and receives an auth token
//! - Advertises hardware (cores, memory, storage, GPUs, benchmark score)
//! - Hosts tenant VMs placed by the scheduler
//! - Carries system-VM obligations (DHT, relay) computed from its hardware
//! - Sends heartbeats to stay Online

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A worker host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Stable unique id
    pub id: String,

    /// Payout wallet address; also the registration identity
    #[serde(rename = "walletAddress")]
    pub wallet_address: String,

    /// Operator-chosen display name
    pub name: String,

    pub region: String,

    pub zone: String,

    /// Liveness status, owned by the registry
    pub status: NodeStatus,

    /// Public IP, absent for CGNAT nodes
    #[serde(rename = "publicIp")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,

    /// Port the node agent listens on
    #[serde(rename = "agentPort")]
    pub agent_port: u16,

    /// NAT classification from the agent's probe
    pub nat: NatClass,

    /// Advertised hardware inventory
    pub hardware: HardwareProfile,

    /// Resource accounting in compute points / bytes
    pub resources: ResourceLedger,

    /// Benchmark-derived evaluation, set at registration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<PerformanceEvaluation>,

    /// System-VM roles this node must run
    #[serde(default)]
    pub obligations: Vec<SystemVmObligation>,

    /// DHT participation state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dht: Option<DhtInfo>,

    /// Set when this node hosts a WireGuard relay VM
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay: Option<RelayInfo>,

    /// Set when this node reaches the mesh through a relay
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cgnat: Option<CgnatInfo>,

    /// Hosting track record
    #[serde(default)]
    pub reputation: Reputation,

    #[serde(rename = "lastHeartbeat")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,

    /// Latest agent metrics snapshot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<NodeMetrics>,

    /// Whether commands may be pushed over HTTP instead of queued
    #[serde(rename = "pushEnabled")]
    pub push_enabled: bool,

    #[serde(rename = "pushSuccesses")]
    #[serde(default)]
    pub push_successes: u64,

    #[serde(rename = "consecutivePushFailures")]
    #[serde(default)]
    pub consecutive_push_failures: u32,

    #[serde(rename = "lastCommandPushedAt")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_command_pushed_at: Option<DateTime<Utc>>,

    #[serde(rename = "agentVersion")]
    #[serde(default)]
    pub agent_version: String,

    /// Guest images the agent can boot
    #[serde(rename = "supportedImages")]
    #[serde(default)]
    pub supported_images: Vec<String>,

    #[serde(default)]
    pub labels: HashMap<String, String>,

    #[serde(rename = "registeredAt")]
    pub registered_at: DateTime<Utc>,

    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

/// Node liveness status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NodeStatus {
    Online,
    #[default]
    Offline,
    Degraded,
}

/// NAT classification reported at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NatClass {
    /// Directly reachable public IP
    None,
    /// Behind a full-cone NAT
    Full,
    /// Behind a symmetric NAT / CGNAT; needs a relay
    Symmetric,
    #[default]
    Unknown,
}

impl NatClass {
    /// Nodes without a public address must reach the mesh through a relay.
    pub fn needs_relay(self) -> bool {
        matches!(self, NatClass::Full | NatClass::Symmetric)
    }
}

/// Advertised hardware inventory
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HardwareProfile {
    /// Physical cores
    #[serde(rename = "physicalCores")]
    pub physical_cores: u32,

    #[serde(rename = "memoryBytes")]
    pub memory_bytes: u64,

    #[serde(rename = "storageDevices")]
    #[serde(default)]
    pub storage_devices: Vec<StorageDevice>,

    /// Network bandwidth in Mbps
    #[serde(rename = "bandwidthMbps")]
    #[serde(default)]
    pub bandwidth_mbps: u64,

    #[serde(default)]
    pub gpus: Vec<GpuDevice>,

    #[serde(rename = "cpuModel")]
    #[serde(default)]
    pub cpu_model: String,

    /// Guest architecture the agent boots (`amd64` or `arm64`)
    #[serde(default = "default_architecture")]
    pub architecture: String,

    /// Agent-run benchmark score
    #[serde(rename = "benchmarkScore")]
    #[serde(default)]
    pub benchmark_score: f64,
}

fn default_architecture() -> String {
    "amd64".to_string()
}

impl HardwareProfile {
    /// Total bytes across all storage devices.
    pub fn total_storage_bytes(&self) -> u64 {
        self.storage_devices.iter().map(|d| d.size_bytes).sum()
    }

    pub fn has_gpu(&self) -> bool {
        !self.gpus.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageDevice {
    pub kind: StorageKind,

    #[serde(rename = "sizeBytes")]
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Nvme,
    #[default]
    Ssd,
    Hdd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuDevice {
    pub model: String,

    #[serde(rename = "memoryBytes")]
    pub memory_bytes: u64,
}

/// A set of schedulable resources, in compute points and bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResourceSet {
    #[serde(rename = "computePoints")]
    pub compute_points: u64,

    #[serde(rename = "memoryBytes")]
    pub memory_bytes: u64,

    #[serde(rename = "storageBytes")]
    pub storage_bytes: u64,
}

impl ResourceSet {
    pub fn new(compute_points: u64, memory_bytes: u64, storage_bytes: u64) -> Self {
        Self {
            compute_points,
            memory_bytes,
            storage_bytes,
        }
    }

    /// Component-wise `self >= other`.
    pub fn covers(&self, other: &ResourceSet) -> bool {
        self.compute_points >= other.compute_points
            && self.memory_bytes >= other.memory_bytes
            && self.storage_bytes >= other.storage_bytes
    }

    /// Component-wise saturating subtraction.
    pub fn saturating_sub(&self, other: &ResourceSet) -> ResourceSet {
        ResourceSet {
            compute_points: self.compute_points.saturating_sub(other.compute_points),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
            storage_bytes: self.storage_bytes.saturating_sub(other.storage_bytes),
        }
    }

    /// Component-wise addition.
    pub fn plus(&self, other: &ResourceSet) -> ResourceSet {
        ResourceSet {
            compute_points: self.compute_points + other.compute_points,
            memory_bytes: self.memory_bytes + other.memory_bytes,
            storage_bytes: self.storage_bytes + other.storage_bytes,
        }
    }
}

/// Total and reserved resources on a node. `reserved` is the scheduler's
/// source of truth for admission; it only shrinks on the Deleted path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct ResourceLedger {
    pub total: ResourceSet,

    pub reserved: ResourceSet,
}

impl ResourceLedger {
    pub fn available(&self) -> ResourceSet {
        self.total.saturating_sub(&self.reserved)
    }

    /// Invariant check: reserved never exceeds total, component-wise.
    pub fn is_consistent(&self) -> bool {
        self.total.covers(&self.reserved)
    }
}

/// Benchmark-derived evaluation produced at registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceEvaluation {
    /// Raw benchmark score used
    #[serde(rename = "benchmarkScore")]
    pub benchmark_score: f64,

    /// Capped compute points per physical core
    #[serde(rename = "pointsPerCore")]
    pub points_per_core: f64,

    /// Tiers this node may host
    #[serde(rename = "eligibleTiers")]
    pub eligible_tiers: Vec<crate::lifecycle::vm::QualityTier>,

    #[serde(rename = "evaluatedAt")]
    pub evaluated_at: DateTime<Utc>,
}

/// A system-VM role a node must host because of its hardware
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemVmObligation {
    pub role: SystemVmRole,

    pub status: ObligationStatus,

    /// Shared secret the deployed VM uses for its ready callback
    #[serde(rename = "authToken")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,

    /// VM backing this obligation once deployed
    #[serde(rename = "vmId")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_id: Option<String>,
}

impl SystemVmObligation {
    pub fn pending(role: SystemVmRole) -> Self {
        Self {
            role,
            status: ObligationStatus::Pending,
            auth_token: None,
            vm_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SystemVmRole {
    Dht,
    Relay,
    BlockStore,
    Ingress,
}

impl std::fmt::Display for SystemVmRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::str::FromStr for SystemVmRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Dht" => Ok(SystemVmRole::Dht),
            "Relay" => Ok(SystemVmRole::Relay),
            "BlockStore" => Ok(SystemVmRole::BlockStore),
            "Ingress" => Ok(SystemVmRole::Ingress),
            other => Err(format!("unknown system VM role '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ObligationStatus {
    #[default]
    Pending,
    Initializing,
    Active,
    Failed,
}

/// DHT participation state
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DhtInfo {
    /// libp2p peer id, posted back by the DHT VM once booted
    #[serde(rename = "peerId")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,

    /// IP other peers should dial: tunnel IP for CGNAT nodes, else public
    #[serde(rename = "advertiseIp")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_ip: Option<String>,
}

/// WireGuard relay state for a public node hosting a relay VM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayInfo {
    #[serde(rename = "relayVmId")]
    pub relay_vm_id: String,

    /// `{publicIp}:51820`
    #[serde(rename = "wireGuardEndpoint")]
    pub wireguard_endpoint: String,

    #[serde(rename = "publicKey")]
    pub public_key: String,

    /// Kept to render the relay's own config; never sent to peers
    #[serde(rename = "privateKey")]
    pub private_key: String,

    /// `10.20.{subnet}.254`
    #[serde(rename = "tunnelIp")]
    pub tunnel_ip: String,

    /// Third octet within 10.20.0.0/16, 1..=254
    pub subnet: u8,

    /// CGNAT slots, tiered by node compute points
    #[serde(rename = "maxCapacity")]
    pub max_capacity: u32,

    #[serde(rename = "currentLoad")]
    pub current_load: u32,

    #[serde(rename = "connectedNodeIds")]
    #[serde(default)]
    pub connected_node_ids: Vec<String>,

    pub status: RelayStatus,

    #[serde(rename = "lastHealthCheck")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<DateTime<Utc>>,

    #[serde(rename = "deployedAt")]
    pub deployed_at: DateTime<Utc>,
}

impl RelayInfo {
    pub fn is_full(&self) -> bool {
        self.current_load >= self.max_capacity
    }

    pub fn headroom(&self) -> u32 {
        self.max_capacity.saturating_sub(self.current_load)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RelayStatus {
    #[default]
    Initializing,
    Active,
    Degraded,
    Offline,
}

/// Mesh attachment state for a CGNAT node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CgnatInfo {
    /// Node hosting the relay this node is attached to
    #[serde(rename = "assignedRelayNodeId")]
    pub assigned_relay_node_id: String,

    /// `10.20.{relaySubnet}.{2..253}`
    #[serde(rename = "tunnelIp")]
    pub tunnel_ip: String,

    /// Rendered WireGuard config handed to the node agent
    #[serde(rename = "wireGuardConfig")]
    pub wireguard_config: String,

    /// This node's WireGuard public key, registered as a peer on the relay
    #[serde(rename = "publicKey")]
    pub public_key: String,

    #[serde(rename = "tunnelStatus")]
    pub tunnel_status: TunnelStatus,

    #[serde(rename = "lastHandshake")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_handshake: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TunnelStatus {
    #[default]
    Pending,
    Up,
    Down,
}

/// Hosting track record used by the scheduler's reputation score
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct Reputation {
    #[serde(rename = "totalVmsHosted")]
    pub total_vms_hosted: u64,

    #[serde(rename = "successfulVmCompletions")]
    pub successful_vm_completions: u64,

    #[serde(rename = "uptimePercent")]
    pub uptime_percent: f64,
}

/// Metrics snapshot from the node agent's heartbeat
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeMetrics {
    #[serde(rename = "cpuUsagePercent")]
    #[serde(default)]
    pub cpu_usage_percent: f64,

    #[serde(rename = "memoryUsagePercent")]
    #[serde(default)]
    pub memory_usage_percent: f64,

    #[serde(rename = "diskUsagePercent")]
    #[serde(default)]
    pub disk_usage_percent: f64,

    /// 1-minute load average normalized by core count, 0..=1+
    #[serde(rename = "normalizedLoad")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized_load: Option<f64>,

    /// The node's own view of its free resources, as reported. The
    /// scheduler trusts the orchestrator-side ledger, not this.
    #[serde(rename = "reportedAvailable")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reported_available: Option<ResourceSet>,

    #[serde(rename = "collectedAt")]
    #[serde(default = "Utc::now")]
    pub collected_at: DateTime<Utc>,
}

impl Node {
    /// The address commands are pushed to: the mesh tunnel IP when attached
    /// to a relay, otherwise the public IP.
    pub fn reachable_ip(&self) -> Option<&str> {
        self.cgnat
            .as_ref()
            .map(|c| c.tunnel_ip.as_str())
            .or(self.public_ip.as_deref())
    }

    /// Whether the node has missed heartbeats past `threshold_secs`.
    pub fn is_stale(&self, threshold_secs: i64) -> bool {
        match self.last_heartbeat {
            Some(at) => (Utc::now() - at).num_seconds() > threshold_secs,
            None => true,
        }
    }

    /// Obligation entry for a role, if computed.
    pub fn obligation(&self, role: SystemVmRole) -> Option<&SystemVmObligation> {
        self.obligations.iter().find(|o| o.role == role)
    }

    pub fn obligation_mut(&mut self, role: SystemVmRole) -> Option<&mut SystemVmObligation> {
        self.obligations.iter_mut().find(|o| o.role == role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_set_covers() {
        let total = ResourceSet::new(10, 1000, 5000);
        let small = ResourceSet::new(5, 500, 2500);
        assert!(total.covers(&small));
        assert!(!small.covers(&total));
        assert!(total.covers(&total));
    }

    #[test]
    fn test_ledger_available_and_consistency() {
        let ledger = ResourceLedger {
            total: ResourceSet::new(16, 32, 64),
            reserved: ResourceSet::new(4, 8, 16),
        };
        assert_eq!(ledger.available(), ResourceSet::new(12, 24, 48));
        assert!(ledger.is_consistent());

        let broken = ResourceLedger {
            total: ResourceSet::new(4, 8, 16),
            reserved: ResourceSet::new(16, 32, 64),
        };
        assert!(!broken.is_consistent());
    }

    #[test]
    fn test_nat_relay_need() {
        assert!(!NatClass::None.needs_relay());
        assert!(NatClass::Symmetric.needs_relay());
        assert!(NatClass::Full.needs_relay());
    }

    #[test]
    fn test_storage_totals() {
        let hw = HardwareProfile {
            storage_devices: vec![
                StorageDevice {
                    kind: StorageKind::Nvme,
                    size_bytes: 100,
                },
                StorageDevice {
                    kind: StorageKind::Hdd,
                    size_bytes: 400,
                },
            ],
            ..Default::default()
        };
        assert_eq!(hw.total_storage_bytes(), 500);
    }

    #[test]
    fn test_relay_headroom() {
        let relay = RelayInfo {
            relay_vm_id: "vm".into(),
            wireguard_endpoint: "1.2.3.4:51820".into(),
            public_key: "pub".into(),
            private_key: "priv".into(),
            tunnel_ip: "10.20.7.254".into(),
            subnet: 7,
            max_capacity: 50,
            current_load: 48,
            connected_node_ids: vec![],
            status: RelayStatus::Active,
            last_health_check: None,
            deployed_at: Utc::now(),
        };
        assert_eq!(relay.headroom(), 2);
        assert!(!relay.is_full());
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("Relay".parse::<SystemVmRole>().unwrap(), SystemVmRole::Relay);
        assert!("Nonsense".parse::<SystemVmRole>().is_err());
    }
}
