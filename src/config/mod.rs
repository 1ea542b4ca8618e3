//! Orchestrator configuration
//!
//! All tunables of the control plane live in [`OrchestratorConfig`], loaded
//! from a YAML file (default `~/.decloud/orchestrator.yaml`) with serde
//! defaults for every knob so a missing or partial file still yields a
//! runnable configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lifecycle::vm::QualityTier;

/// Default config file location: ~/.decloud/orchestrator.yaml
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".decloud")
        .join("orchestrator.yaml")
}

/// Errors that can occur while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// The complete orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub scheduling: SchedulingConfig,

    #[serde(default)]
    pub ingress: IngressConfig,

    #[serde(default)]
    pub sysvm: SysVmConfig,

    #[serde(default)]
    pub billing: BillingConfig,

    #[serde(default)]
    pub auth: AuthConfig,
}

/// HTTP server and data-directory settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the API server
    #[serde(rename = "bindAddr", default = "default_bind_addr")]
    pub bind_addr: String,

    /// API port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory for the document store and event log
    #[serde(rename = "dataDir", default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    crate::CONTROL_PLANE_PORT
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".decloud")
        .join("data")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            data_dir: default_data_dir(),
        }
    }
}

/// Node registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Heartbeat interval handed to nodes, seconds
    #[serde(rename = "heartbeatIntervalSecs", default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// A node is Offline after this many seconds without a heartbeat
    #[serde(rename = "heartbeatTimeoutSecs", default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: i64,

    /// How often the liveness scan runs, seconds
    #[serde(rename = "healthScanIntervalSecs", default = "default_health_scan_interval")]
    pub health_scan_interval_secs: u64,

    /// Auth token lifetime, days
    #[serde(rename = "tokenLifetimeDays", default = "default_token_lifetime")]
    pub token_lifetime_days: i64,

    /// Warn in heartbeat responses when a token expires within this many days
    #[serde(rename = "expirationWarningDays", default = "default_expiration_warning")]
    pub expiration_warning_days: i64,

    /// Commands older than this are dropped by the stale-command sweep, seconds
    #[serde(rename = "commandTtlSecs", default = "default_command_ttl")]
    pub command_ttl_secs: i64,
}

fn default_heartbeat_interval() -> u64 {
    crate::HEARTBEAT_INTERVAL_SECS
}

fn default_heartbeat_timeout() -> i64 {
    crate::HEARTBEAT_TIMEOUT_SECS
}

fn default_health_scan_interval() -> u64 {
    30
}

fn default_token_lifetime() -> i64 {
    90
}

fn default_expiration_warning() -> i64 {
    7
}

fn default_command_ttl() -> i64 {
    3600
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            health_scan_interval_secs: default_health_scan_interval(),
            token_lifetime_days: default_token_lifetime(),
            expiration_warning_days: default_expiration_warning(),
            command_ttl_secs: default_command_ttl(),
        }
    }
}

/// Scheduler settings: baseline benchmark, tier table, scoring weights
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    /// Benchmark score that equals exactly 1.0 compute points per core
    #[serde(rename = "baselineBenchmark", default = "default_baseline_benchmark")]
    pub baseline_benchmark: f64,

    /// Cap on how far above baseline a node's benchmark may count
    #[serde(rename = "maxPerformanceMultiplier", default = "default_max_multiplier")]
    pub max_performance_multiplier: f64,

    /// Quality tier policies
    #[serde(default = "default_tiers")]
    pub tiers: BTreeMap<QualityTier, TierPolicy>,

    /// Multi-factor scoring weights
    #[serde(default)]
    pub weights: ScoringWeights,

    /// Reject placements that would push a node past this utilization
    #[serde(rename = "maxUtilizationPercent", default = "default_max_utilization")]
    pub max_utilization_percent: f64,

    /// Reject placements that would leave less free memory than this
    #[serde(rename = "minFreeMemoryMb", default = "default_min_free_memory")]
    pub min_free_memory_mb: u64,

    /// Prefer nodes in the caller's region when a hint is present
    #[serde(rename = "preferLocalRegion", default = "default_true")]
    pub prefer_local_region: bool,

    /// Sweep interval for pending VMs, seconds
    #[serde(rename = "sweepIntervalSecs", default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_baseline_benchmark() -> f64 {
    1000.0
}

fn default_max_multiplier() -> f64 {
    4.0
}

fn default_max_utilization() -> f64 {
    90.0
}

fn default_min_free_memory() -> u64 {
    512
}

fn default_sweep_interval() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            baseline_benchmark: default_baseline_benchmark(),
            max_performance_multiplier: default_max_multiplier(),
            tiers: default_tiers(),
            weights: ScoringWeights::default(),
            max_utilization_percent: default_max_utilization(),
            min_free_memory_mb: default_min_free_memory(),
            prefer_local_region: true,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl SchedulingConfig {
    /// Look up the policy for a tier.
    pub fn tier_policy(&self, tier: QualityTier) -> TierPolicy {
        self.tiers
            .get(&tier)
            .copied()
            .unwrap_or(TierPolicy {
                minimum_benchmark: self.baseline_benchmark,
                cpu_overcommit_ratio: 1.0,
                storage_overcommit_ratio: 1.0,
                price_multiplier: 1.0,
            })
    }
}

/// Per-tier placement policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierPolicy {
    /// Minimum node benchmark for this tier
    #[serde(rename = "minimumBenchmark")]
    pub minimum_benchmark: f64,

    /// CPU points overcommit ratio (1.0 = none)
    #[serde(rename = "cpuOvercommitRatio")]
    pub cpu_overcommit_ratio: f64,

    /// Storage overcommit ratio (memory is never overcommitted)
    #[serde(rename = "storageOvercommitRatio")]
    pub storage_overcommit_ratio: f64,

    /// Price multiplier applied to the base hourly point rate
    #[serde(rename = "priceMultiplier")]
    pub price_multiplier: f64,
}

fn default_tiers() -> BTreeMap<QualityTier, TierPolicy> {
    let mut tiers = BTreeMap::new();
    tiers.insert(
        QualityTier::Guaranteed,
        TierPolicy {
            minimum_benchmark: 1500.0,
            cpu_overcommit_ratio: 1.0,
            storage_overcommit_ratio: 1.0,
            price_multiplier: 2.0,
        },
    );
    tiers.insert(
        QualityTier::Standard,
        TierPolicy {
            minimum_benchmark: 1200.0,
            cpu_overcommit_ratio: 2.0,
            storage_overcommit_ratio: 1.5,
            price_multiplier: 1.5,
        },
    );
    tiers.insert(
        QualityTier::Balanced,
        TierPolicy {
            minimum_benchmark: 1000.0,
            cpu_overcommit_ratio: 3.0,
            storage_overcommit_ratio: 2.0,
            price_multiplier: 1.0,
        },
    );
    tiers.insert(
        QualityTier::Burstable,
        TierPolicy {
            minimum_benchmark: 500.0,
            cpu_overcommit_ratio: 4.0,
            storage_overcommit_ratio: 3.0,
            price_multiplier: 0.5,
        },
    );
    tiers
}

/// Weights for the multi-factor placement score.
///
/// Should sum to approximately 1.0.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub capacity: f64,
    pub load: f64,
    pub reputation: f64,
    pub locality: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            capacity: 0.40,
            load: 0.25,
            reputation: 0.20,
            locality: 0.15,
        }
    }
}

/// Central ingress settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressConfig {
    /// Base domain for default subdomains, e.g. "vms.decloud.dev"
    #[serde(rename = "baseDomain", default = "default_base_domain")]
    pub base_domain: String,

    /// Register VMs with the ingress automatically when they start
    #[serde(rename = "autoRegisterOnStart", default = "default_true")]
    pub auto_register_on_start: bool,

    /// Remove routes automatically when VMs stop
    #[serde(rename = "autoRemoveOnStop", default = "default_true")]
    pub auto_remove_on_stop: bool,

    /// Maximum custom domains per VM
    #[serde(rename = "maxCustomDomainsPerVm", default = "default_max_custom_domains")]
    pub max_custom_domains_per_vm: usize,

    /// When non-empty, DNS verification additionally requires the domain to
    /// resolve to one of these orchestrator-controlled ingress IPs.
    #[serde(rename = "expectedIps", default)]
    pub expected_ips: Vec<String>,
}

fn default_base_domain() -> String {
    "vms.decloud.dev".to_string()
}

fn default_max_custom_domains() -> usize {
    5
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            base_domain: default_base_domain(),
            auto_register_on_start: true,
            auto_remove_on_stop: true,
            max_custom_domains_per_vm: default_max_custom_domains(),
            expected_ips: Vec::new(),
        }
    }
}

/// System-VM and mesh settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SysVmConfig {
    /// Roles the reconcile loop may deploy. BlockStore and Ingress are wired
    /// through the data model but have no deployment path yet; enabling them
    /// here without a deployer is a configuration error.
    #[serde(rename = "deployableRoles", default = "default_deployable_roles")]
    pub deployable_roles: Vec<String>,

    /// Obligation reconcile interval, seconds
    #[serde(rename = "reconcileIntervalSecs", default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Relay health probe interval, seconds
    #[serde(rename = "relayHealthIntervalSecs", default = "default_relay_health_interval")]
    pub relay_health_interval_secs: u64,

    /// Grace period for relays still initializing, seconds
    #[serde(rename = "relayInitTimeoutSecs", default = "default_relay_init_timeout")]
    pub relay_init_timeout_secs: i64,

    /// Directory holding the architecture-specific DHT binaries
    #[serde(rename = "dhtBinaryDir", default = "default_dht_binary_dir")]
    pub dht_binary_dir: PathBuf,
}

fn default_deployable_roles() -> Vec<String> {
    vec!["Dht".to_string(), "Relay".to_string()]
}

fn default_reconcile_interval() -> u64 {
    30
}

fn default_relay_health_interval() -> u64 {
    60
}

fn default_relay_init_timeout() -> i64 {
    600
}

fn default_dht_binary_dir() -> PathBuf {
    PathBuf::from("/var/lib/decloud/dht")
}

impl Default for SysVmConfig {
    fn default() -> Self {
        Self {
            deployable_roles: default_deployable_roles(),
            reconcile_interval_secs: default_reconcile_interval(),
            relay_health_interval_secs: default_relay_health_interval(),
            relay_init_timeout_secs: default_relay_init_timeout(),
            dht_binary_dir: default_dht_binary_dir(),
        }
    }
}

/// Metering and settlement settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    /// Periodic metering interval, seconds
    #[serde(rename = "meteringIntervalSecs", default = "default_metering_interval")]
    pub metering_interval_secs: u64,

    /// Settlement driver interval, seconds
    #[serde(rename = "settlementIntervalSecs", default = "default_settlement_interval")]
    pub settlement_interval_secs: u64,

    /// Batches below this USDC amount wait for more usage
    #[serde(rename = "minSettlementAmount", default = "default_min_settlement")]
    pub min_settlement_amount: f64,

    /// Usage records per on-chain transaction
    #[serde(rename = "maxSettlementsPerBatch", default = "default_max_per_batch")]
    pub max_settlements_per_batch: usize,

    /// Fraction of each settlement paid to the node; the rest is platform fee
    #[serde(rename = "nodeFeeShare", default = "default_node_fee_share")]
    pub node_fee_share: f64,

    /// USDC per compute-point-hour before the tier price multiplier
    #[serde(rename = "pointHourUsdc", default = "default_point_hour_usdc")]
    pub point_hour_usdc: f64,
}

fn default_metering_interval() -> u64 {
    300
}

fn default_settlement_interval() -> u64 {
    3600
}

fn default_min_settlement() -> f64 {
    1.0
}

fn default_max_per_batch() -> usize {
    10
}

fn default_node_fee_share() -> f64 {
    0.85
}

fn default_point_hour_usdc() -> f64 {
    0.02
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            metering_interval_secs: default_metering_interval(),
            settlement_interval_secs: default_settlement_interval(),
            min_settlement_amount: default_min_settlement(),
            max_settlements_per_batch: default_max_per_batch(),
            node_fee_share: default_node_fee_share(),
            point_hour_usdc: default_point_hour_usdc(),
        }
    }
}

/// Tenant authentication settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for signing access JWTs
    #[serde(rename = "jwtSecret", default = "default_jwt_secret")]
    pub jwt_secret: String,

    /// Access token lifetime, seconds
    #[serde(rename = "accessTokenTtlSecs", default = "default_access_ttl")]
    pub access_token_ttl_secs: i64,

    /// Refresh token lifetime, seconds
    #[serde(rename = "refreshTokenTtlSecs", default = "default_refresh_ttl")]
    pub refresh_token_ttl_secs: i64,

    /// Login timestamps older than this are rejected, seconds
    #[serde(rename = "loginWindowSecs", default = "default_login_window")]
    pub login_window_secs: i64,
}

fn default_jwt_secret() -> String {
    // Overridden in any real deployment via the config file or env
    "decloud-dev-secret".to_string()
}

fn default_access_ttl() -> i64 {
    3600
}

fn default_refresh_ttl() -> i64 {
    7 * 24 * 3600
}

fn default_login_window() -> i64 {
    300
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
            access_token_ttl_secs: default_access_ttl(),
            refresh_token_ttl_secs: default_refresh_ttl(),
            login_window_secs: default_login_window(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a YAML file, falling back to defaults when
    /// the file does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let config: Self = serde_yaml::from_str(&content)?;
                config.validate()?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Io(path.to_path_buf(), e)),
        }
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduling.baseline_benchmark <= 0.0 {
            return Err(ConfigError::Invalid(
                "scheduling.baselineBenchmark must be positive".to_string(),
            ));
        }
        if self.scheduling.tiers.is_empty() {
            return Err(ConfigError::Invalid(
                "scheduling.tiers must not be empty".to_string(),
            ));
        }
        if self.ingress.base_domain.is_empty() {
            return Err(ConfigError::Invalid(
                "ingress.baseDomain must not be empty".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.billing.node_fee_share) {
            return Err(ConfigError::Invalid(
                "billing.nodeFeeShare must be between 0 and 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Look up the policy for a tier.
    pub fn tier_policy(&self, tier: QualityTier) -> TierPolicy {
        self.scheduling.tier_policy(tier)
    }
}
