//! VirtualMachine resource - a tenant guest VM managed by the control plane
//!
//! A VirtualMachine:
//! - Is created by a tenant with an immutable [`VmSpec`]
//! - Is placed on a node by the scheduler
//! - Moves through [`VmStatus`] states only via the lifecycle manager
//! - Accrues metered usage while Running

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Label set on VMs synthesized from a heartbeat report of an unknown VM
pub const RECOVERED_LABEL: &str = "recovered";

/// Label prefix marking a template fee as already recorded for this VM
pub const TEMPLATE_FEE_LABEL_PREFIX: &str = "template_fee_settled:";

/// A tenant (or system) virtual machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualMachine {
    /// Unique id
    pub id: String,

    /// DNS-safe unique name
    pub name: String,

    /// Owning user id (wallet-derived)
    #[serde(rename = "ownerId")]
    pub owner_id: String,

    /// Hosting node, set by the scheduler
    #[serde(rename = "nodeId")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,

    /// Immutable resource specification
    pub spec: VmSpec,

    /// Current lifecycle status. Only the lifecycle manager writes this.
    pub status: VmStatus,

    /// Human-readable context for the current status
    #[serde(rename = "statusMessage")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,

    /// Power state derived from status
    #[serde(rename = "powerState")]
    pub power_state: PowerState,

    /// General tenant VM or a system role VM
    #[serde(rename = "vmType")]
    pub vm_type: VmType,

    /// Network addressing
    pub network: VmNetworkConfig,

    /// Ingress exposure
    pub ingress: VmIngressConfig,

    /// Declared services (ports) inside the guest
    #[serde(default)]
    pub services: Vec<VmService>,

    /// Billing state
    pub billing: BillingInfo,

    /// Latest reported guest metrics
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<VmMetrics>,

    /// RTT calibration and smoothing state
    #[serde(rename = "networkMetrics", default)]
    pub network_metrics: VmNetworkMetrics,

    /// Free-form labels
    #[serde(default)]
    pub labels: HashMap<String, String>,

    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,

    #[serde(rename = "startedAt")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(rename = "stoppedAt")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,

    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

/// Immutable VM resource specification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSpec {
    /// Virtual cores
    pub vcpus: u32,

    /// Guest memory in bytes
    #[serde(rename = "memoryBytes")]
    pub memory_bytes: u64,

    /// Guest disk in bytes
    #[serde(rename = "diskBytes")]
    pub disk_bytes: u64,

    /// Quality tier the VM is sold at
    pub tier: QualityTier,

    /// Whether a GPU must be present on the host
    #[serde(rename = "gpuRequired")]
    #[serde(default)]
    pub gpu_required: bool,

    /// Network bandwidth tier
    #[serde(rename = "bandwidthTier")]
    #[serde(default)]
    pub bandwidth_tier: BandwidthTier,

    /// Marketplace template this VM was created from
    #[serde(rename = "templateId")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,

    /// Preferred placement region, from the caller
    #[serde(rename = "regionHint")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region_hint: Option<String>,

    /// Preferred placement zone, from the caller
    #[serde(rename = "zoneHint")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone_hint: Option<String>,

    /// Compute-point cost reserved on the host
    #[serde(rename = "computePointCost")]
    pub compute_point_cost: u64,
}

/// Quality tier a VM is sold at. Determines overcommit, pricing and the
/// minimum node benchmark a host must reach.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum QualityTier {
    /// Dedicated capacity, no CPU overcommit
    Guaranteed,
    /// Light overcommit
    Standard,
    /// Default price/performance
    #[default]
    Balanced,
    /// Heavy overcommit, cheapest
    Burstable,
}

/// Network bandwidth tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BandwidthTier {
    #[default]
    Standard,
    Premium,
}

/// Lifecycle status. Transitions are validated by the lifecycle manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum VmStatus {
    #[default]
    Pending,
    Scheduling,
    Provisioning,
    Running,
    Stopping,
    Stopped,
    Error,
    Deleting,
    Deleted,
}

impl VmStatus {
    /// Legal destination states from this state.
    pub fn legal_destinations(self) -> &'static [VmStatus] {
        use VmStatus::*;
        match self {
            Pending => &[Scheduling, Provisioning, Error, Deleting],
            Scheduling => &[Provisioning, Pending, Error, Deleting],
            Provisioning => &[Running, Error, Deleting],
            Running => &[Stopping, Error, Deleting],
            Stopping => &[Stopped, Running, Error, Deleting],
            Stopped => &[Provisioning, Running, Deleting, Error],
            Error => &[Provisioning, Running, Stopped, Deleting, Error],
            Deleting => &[Deleted, Error],
            Deleted => &[],
        }
    }

    /// Whether `to` is a legal move from this state.
    pub fn can_transition_to(self, to: VmStatus) -> bool {
        self.legal_destinations().contains(&to)
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        self.legal_destinations().is_empty()
    }
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Power state derived from the lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PowerState {
    Running,
    Off,
    #[default]
    Unknown,
}

impl PowerState {
    /// The power state implied by a lifecycle status.
    pub fn from_status(status: VmStatus) -> Self {
        match status {
            VmStatus::Running | VmStatus::Stopping => PowerState::Running,
            VmStatus::Stopped | VmStatus::Deleted => PowerState::Off,
            _ => PowerState::Unknown,
        }
    }
}

/// General tenant VM or a system-role VM deployed by the obligation engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum VmType {
    #[default]
    General,
    Dht,
    Relay,
    BlockStore,
    Ingress,
}

impl VmType {
    /// System VMs are exempt from metering.
    pub fn is_system(self) -> bool {
        !matches!(self, VmType::General)
    }
}

/// Guest network addressing
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VmNetworkConfig {
    /// Private IP inside the host, reported via heartbeat
    #[serde(rename = "privateIp")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,

    /// Public IP if directly exposed
    #[serde(rename = "publicIp")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

/// Ingress exposure state for a VM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmIngressConfig {
    /// Whether the `{name}.{baseDomain}` route is active
    #[serde(rename = "defaultSubdomainEnabled")]
    pub default_subdomain_enabled: bool,

    /// Backend port the default subdomain routes to
    #[serde(rename = "defaultPort")]
    pub default_port: u16,
}

impl Default for VmIngressConfig {
    fn default() -> Self {
        Self {
            default_subdomain_enabled: false,
            default_port: 80,
        }
    }
}

/// A service (exposed port) declared by the VM's template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmService {
    pub name: String,

    /// Port inside the guest
    #[serde(rename = "internalPort")]
    pub internal_port: u16,

    /// Host port allocated for direct access, if any
    #[serde(rename = "externalPort")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_port: Option<u16>,

    pub protocol: ServiceProtocol,

    pub status: ServiceStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceProtocol {
    Http,
    Ws,
    #[default]
    Tcp,
    Udp,
}

impl ServiceProtocol {
    /// http/ws traffic goes through the subdomain route, not a direct port.
    pub fn routed_via_subdomain(self) -> bool {
        matches!(self, ServiceProtocol::Http | ServiceProtocol::Ws)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ServiceStatus {
    #[default]
    Pending,
    Active,
    Failed,
}

/// Billing state for a VM
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BillingInfo {
    /// USDC per hour
    #[serde(rename = "hourlyRate")]
    pub hourly_rate: f64,

    /// End of the last recorded usage period
    #[serde(rename = "lastBillingAt")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_billing_at: Option<DateTime<Utc>>,

    /// Start of the current accrual period
    #[serde(rename = "currentPeriodStart")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_period_start: Option<DateTime<Utc>>,

    /// Lifetime billed total, USDC
    #[serde(rename = "totalBilled")]
    pub total_billed: f64,

    /// Billing suspended (insufficient balance or attestation failure)
    pub paused: bool,

    #[serde(rename = "pauseReason")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
}

/// Latest guest metrics reported by the node agent
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VmMetrics {
    #[serde(rename = "cpuUsagePercent")]
    #[serde(default)]
    pub cpu_usage_percent: f64,

    #[serde(rename = "memoryUsagePercent")]
    #[serde(default)]
    pub memory_usage_percent: f64,

    #[serde(rename = "diskUsagePercent")]
    #[serde(default)]
    pub disk_usage_percent: f64,

    #[serde(rename = "collectedAt")]
    #[serde(default = "Utc::now")]
    pub collected_at: DateTime<Utc>,
}

/// RTT calibration and smoothing state for a VM
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VmNetworkMetrics {
    /// Median of the calibration samples
    #[serde(rename = "baselineRttMs")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_rtt_ms: Option<f64>,

    /// Exponentially smoothed current RTT
    #[serde(rename = "currentRttMs")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_rtt_ms: Option<f64>,

    /// Most recent raw samples, newest last, bounded window
    #[serde(rename = "recentSamples")]
    #[serde(default)]
    pub recent_samples: Vec<f64>,

    #[serde(rename = "lastMeasuredAt")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_measured_at: Option<DateTime<Utc>>,
}

/// A marketplace template a VM can be created from. Template CRUD lives
/// outside the core; the lifecycle manager only reads exposed ports and the
/// one-shot fee.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmTemplate {
    pub id: String,

    pub name: String,

    /// Services the guest exposes after boot
    #[serde(rename = "exposedPorts")]
    #[serde(default)]
    pub exposed_ports: Vec<TemplatePort>,

    /// One-shot fee recorded as a usage record on first start, USDC
    #[serde(rename = "oneShotFeeUsdc")]
    #[serde(default)]
    pub one_shot_fee_usdc: f64,

    /// Template author's wallet, receives the fee
    #[serde(rename = "authorWallet")]
    #[serde(default)]
    pub author_wallet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplatePort {
    pub name: String,

    pub port: u16,

    pub protocol: ServiceProtocol,
}

impl VirtualMachine {
    /// Create a new VM in `Pending` with a fresh id.
    pub fn new(name: impl Into<String>, owner_id: impl Into<String>, spec: VmSpec) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            owner_id: owner_id.into(),
            node_id: None,
            spec,
            status: VmStatus::Pending,
            status_message: None,
            power_state: PowerState::Unknown,
            vm_type: VmType::General,
            network: VmNetworkConfig::default(),
            ingress: VmIngressConfig::default(),
            services: Vec::new(),
            billing: BillingInfo::default(),
            metrics: None,
            network_metrics: VmNetworkMetrics::default(),
            labels: HashMap::new(),
            created_at: now,
            started_at: None,
            stopped_at: None,
            updated_at: now,
        }
    }

    /// Mark as a system-role VM.
    pub fn with_type(mut self, vm_type: VmType) -> Self {
        self.vm_type = vm_type;
        self
    }

    /// Pin to a node (system VMs bypass the scheduler).
    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Add a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Whether this VM still occupies reserved resources on its node.
    pub fn holds_reservation(&self) -> bool {
        self.node_id.is_some() && self.status != VmStatus::Deleted
    }

    /// Whether the template fee for `template_id` was already recorded.
    pub fn template_fee_settled(&self, template_id: &str) -> bool {
        self.labels
            .contains_key(&format!("{TEMPLATE_FEE_LABEL_PREFIX}{template_id}"))
    }
}
