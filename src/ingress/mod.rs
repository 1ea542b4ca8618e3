//! Central ingress - the shared front door for every hosted VM
//!
//! Maintains the route table mapping `{vmName}.{baseDomain}` subdomains and
//! verified custom domains to node addresses, and feeds the external
//! reverse proxy complete snapshots on every change. Reloads are serialized
//! by a single mutex so the proxy never observes a half-applied state.

pub mod proxy;

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::IngressConfig;
use crate::store::Store;

pub use proxy::{LoggingProxyReloader, ProxyError, ProxyReloader, RecordingProxyReloader};

/// DNS label/domain shape accepted for custom domains
const DOMAIN_PATTERN: &str = r"^([a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?\.)+[a-zA-Z]{2,}$";

/// Timeout for a DNS verification lookup
const DNS_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Errors from the ingress registry
#[derive(Error, Debug)]
pub enum IngressError {
    #[error("VM '{0}' not found")]
    VmNotFound(String),

    #[error("VM '{0}' is not running with a known address")]
    VmNotRoutable(String),

    #[error("Invalid domain '{0}'")]
    InvalidDomain(String),

    #[error("Domain '{0}' is already registered")]
    DuplicateDomain(String),

    #[error("Custom domain limit reached ({0} per VM)")]
    DomainLimitReached(usize),

    #[error("Domain '{0}' is not registered")]
    DomainNotFound(String),

    #[error("DNS verification failed for '{domain}': {reason}")]
    DnsVerification { domain: String, reason: String },

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

/// A default subdomain route for a VM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    #[serde(rename = "vmId")]
    pub vm_id: String,

    /// `sanitize(vmName).{baseDomain}`
    pub subdomain: String,

    /// Node tunnel or public IP
    #[serde(rename = "targetHost")]
    pub target_host: String,

    #[serde(rename = "targetPort")]
    pub target_port: u16,

    pub status: RouteStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteStatus {
    Active,
    Paused,
}

/// A tenant-supplied custom domain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomDomain {
    pub id: String,

    #[serde(rename = "vmId")]
    pub vm_id: String,

    /// Stored lower-cased; the lower-cased form is globally unique
    pub domain: String,

    #[serde(rename = "targetPort")]
    pub target_port: u16,

    pub status: CustomDomainStatus,

    #[serde(rename = "verifiedAt")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,

    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CustomDomainStatus {
    PendingDns,
    Active,
    Paused,
    Error,
}

/// External DNS resolution, pinned for testability.
#[async_trait::async_trait]
pub trait DnsResolver: Send + Sync {
    async fn resolve(&self, domain: &str) -> Result<Vec<IpAddr>, String>;
}

/// System resolver via the runtime's lookup.
pub struct SystemDnsResolver;

#[async_trait::async_trait]
impl DnsResolver for SystemDnsResolver {
    async fn resolve(&self, domain: &str) -> Result<Vec<IpAddr>, String> {
        let lookup = tokio::net::lookup_host((domain, 443));
        match tokio::time::timeout(DNS_TIMEOUT, lookup).await {
            Ok(Ok(addrs)) => Ok(addrs.map(|a| a.ip()).collect()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("lookup timed out".to_string()),
        }
    }
}

/// The central ingress registry
#[derive(Clone)]
pub struct IngressRegistry {
    store: Store,
    config: IngressConfig,

    routes: Arc<DashMap<String, Route>>,
    domains: Arc<DashMap<String, CustomDomain>>,

    proxy: Arc<dyn ProxyReloader>,
    resolver: Arc<dyn DnsResolver>,
    domain_regex: Regex,

    /// Serializes every proxy reload
    reload_lock: Arc<Mutex<()>>,
}

impl IngressRegistry {
    pub fn new(
        store: Store,
        config: IngressConfig,
        proxy: Arc<dyn ProxyReloader>,
        resolver: Arc<dyn DnsResolver>,
    ) -> Self {
        Self {
            store,
            config,
            routes: Arc::new(DashMap::new()),
            domains: Arc::new(DashMap::new()),
            proxy,
            resolver,
            domain_regex: Regex::new(DOMAIN_PATTERN).expect("domain regex"),
            reload_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Build the default subdomain for a VM name.
    pub fn subdomain_for(&self, vm_name: &str) -> String {
        format!("{}.{}", sanitize_subdomain(vm_name), self.config.base_domain)
    }

    /// Whether routes should be created automatically when a VM starts.
    pub fn auto_register_on_start(&self) -> bool {
        self.config.auto_register_on_start
    }

    /// Whether routes should be torn down automatically when a VM stops.
    pub fn auto_remove_on_stop(&self) -> bool {
        self.config.auto_remove_on_stop
    }

    // =========================================================================
    // Default subdomain routes
    // =========================================================================

    /// Register the default subdomain route for a Running VM.
    ///
    /// Idempotent: re-registering replaces the route and reloads.
    pub async fn register_vm(&self, vm_id: &str, port: Option<u16>) -> Result<Route, IngressError> {
        let vm = self
            .store
            .get_vm(vm_id)
            .ok_or_else(|| IngressError::VmNotFound(vm_id.to_string()))?;

        if vm.status != crate::lifecycle::vm::VmStatus::Running || vm.network.private_ip.is_none() {
            return Err(IngressError::VmNotRoutable(vm_id.to_string()));
        }

        let node = vm
            .node_id
            .as_deref()
            .and_then(|id| self.store.get_node(id))
            .ok_or_else(|| IngressError::VmNotRoutable(vm_id.to_string()))?;
        let target_host = node
            .reachable_ip()
            .ok_or_else(|| IngressError::VmNotRoutable(vm_id.to_string()))?
            .to_string();

        let route = Route {
            vm_id: vm_id.to_string(),
            subdomain: self.subdomain_for(&vm.name),
            target_host,
            target_port: port.unwrap_or(vm.ingress.default_port),
            status: RouteStatus::Active,
        };

        self.routes.insert(vm_id.to_string(), route.clone());
        self.store
            .update_vm(vm_id, |vm| vm.ingress.default_subdomain_enabled = true)
            .await?;
        self.reload_proxy().await?;

        info!(vm_id, subdomain = %route.subdomain, "ingress route registered");
        Ok(route)
    }

    /// Remove the default route. Idempotent; reloads only when a route
    /// actually existed.
    pub async fn unregister_vm(&self, vm_id: &str) -> Result<(), IngressError> {
        let removed = self.routes.remove(vm_id).is_some();
        if removed {
            let _ = self
                .store
                .update_vm(vm_id, |vm| vm.ingress.default_subdomain_enabled = false)
                .await;
            self.reload_proxy().await?;
            info!(vm_id, "ingress route removed");
        }
        Ok(())
    }

    pub fn route_for(&self, vm_id: &str) -> Option<Route> {
        self.routes.get(vm_id).map(|r| r.clone())
    }

    // =========================================================================
    // Custom domains
    // =========================================================================

    /// Add a custom domain for a VM in `PendingDns`.
    pub async fn add_custom_domain(
        &self,
        vm_id: &str,
        domain: &str,
        target_port: u16,
    ) -> Result<CustomDomain, IngressError> {
        let key = domain.to_lowercase();

        if !self.domain_regex.is_match(&key) || key.parse::<IpAddr>().is_ok() {
            return Err(IngressError::InvalidDomain(domain.to_string()));
        }
        if key == self.config.base_domain.to_lowercase()
            || key.ends_with(&format!(".{}", self.config.base_domain.to_lowercase()))
        {
            return Err(IngressError::InvalidDomain(domain.to_string()));
        }
        if self.store.get_vm(vm_id).is_none() {
            return Err(IngressError::VmNotFound(vm_id.to_string()));
        }

        let per_vm = self.domains.iter().filter(|d| d.vm_id == vm_id).count();
        if per_vm >= self.config.max_custom_domains_per_vm {
            return Err(IngressError::DomainLimitReached(
                self.config.max_custom_domains_per_vm,
            ));
        }

        let record = CustomDomain {
            id: Uuid::new_v4().to_string(),
            vm_id: vm_id.to_string(),
            domain: key.clone(),
            target_port,
            status: CustomDomainStatus::PendingDns,
            verified_at: None,
            created_at: Utc::now(),
        };

        // Entry-or-insert keeps the global uniqueness check and the insert
        // atomic under the map's shard lock.
        match self.domains.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(IngressError::DuplicateDomain(domain.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record.clone());
                debug!(vm_id, domain = %record.domain, "custom domain pending DNS");
                Ok(record)
            }
        }
    }

    /// Resolve the domain and activate it when DNS points anywhere (or, when
    /// an ingress IP allowlist is configured, somewhere we control).
    pub async fn verify_dns(&self, domain: &str) -> Result<CustomDomain, IngressError> {
        let key = domain.to_lowercase();
        if !self.domains.contains_key(&key) {
            return Err(IngressError::DomainNotFound(domain.to_string()));
        }

        let addrs = self.resolver.resolve(&key).await.map_err(|reason| {
            IngressError::DnsVerification {
                domain: key.clone(),
                reason,
            }
        })?;

        if addrs.is_empty() {
            return Err(IngressError::DnsVerification {
                domain: key,
                reason: "no addresses returned".to_string(),
            });
        }

        if !self.config.expected_ips.is_empty() {
            let matches = addrs
                .iter()
                .any(|a| self.config.expected_ips.iter().any(|e| e == &a.to_string()));
            if !matches {
                return Err(IngressError::DnsVerification {
                    domain: key,
                    reason: "domain does not resolve to an ingress address".to_string(),
                });
            }
        }

        let updated = {
            let mut entry = self
                .domains
                .get_mut(&key)
                .ok_or_else(|| IngressError::DomainNotFound(domain.to_string()))?;
            entry.status = CustomDomainStatus::Active;
            entry.verified_at = Some(Utc::now());
            entry.clone()
        };

        self.reload_proxy().await?;
        info!(domain = %key, vm_id = %updated.vm_id, "custom domain verified");
        Ok(updated)
    }

    pub fn list_custom_domains(&self, vm_id: &str) -> Vec<CustomDomain> {
        self.domains
            .iter()
            .filter(|d| d.vm_id == vm_id)
            .map(|d| d.clone())
            .collect()
    }

    pub async fn remove_custom_domain(&self, domain: &str) -> Result<(), IngressError> {
        let key = domain.to_lowercase();
        if self.domains.remove(&key).is_none() {
            return Err(IngressError::DomainNotFound(domain.to_string()));
        }
        self.reload_proxy().await?;
        Ok(())
    }

    /// The on-demand TLS gate: the proxy calls this before issuing a
    /// certificate for an unknown SNI. Only Active domains pass.
    pub fn is_custom_domain_registered(&self, domain: &str) -> bool {
        self.domains
            .get(&domain.to_lowercase())
            .map(|d| d.status == CustomDomainStatus::Active)
            .unwrap_or(false)
    }

    // =========================================================================
    // Lifecycle hooks
    // =========================================================================

    /// VM entered Running: reactivate its paused custom domains.
    pub async fn on_vm_started(&self, vm_id: &str) -> Result<(), IngressError> {
        let mut changed = false;
        for mut entry in self.domains.iter_mut() {
            if entry.vm_id == vm_id && entry.status == CustomDomainStatus::Paused {
                entry.status = CustomDomainStatus::Active;
                changed = true;
            }
        }
        if changed {
            self.reload_proxy().await?;
        }
        Ok(())
    }

    /// VM left Running: pause its route and custom domains.
    pub async fn on_vm_stopped(&self, vm_id: &str) -> Result<(), IngressError> {
        let mut changed = false;
        if let Some(mut route) = self.routes.get_mut(vm_id) {
            if route.status != RouteStatus::Paused {
                route.status = RouteStatus::Paused;
                changed = true;
            }
        }
        for mut entry in self.domains.iter_mut() {
            if entry.vm_id == vm_id && entry.status == CustomDomainStatus::Active {
                entry.status = CustomDomainStatus::Paused;
                changed = true;
            }
        }
        if changed {
            self.reload_proxy().await?;
        }
        Ok(())
    }

    /// VM deleted: drop its route and every custom domain.
    pub async fn on_vm_deleted(&self, vm_id: &str) -> Result<(), IngressError> {
        let route_removed = self.routes.remove(vm_id).is_some();
        let domains_before = self.domains.len();
        self.domains.retain(|_, d| d.vm_id != vm_id);
        if route_removed || self.domains.len() != domains_before {
            self.reload_proxy().await?;
        }
        Ok(())
    }

    // =========================================================================
    // Proxy snapshots
    // =========================================================================

    /// Current desired state: all Active routes and Active custom domains.
    pub fn snapshot(&self) -> (Vec<Route>, Vec<CustomDomain>) {
        let routes = self
            .routes
            .iter()
            .filter(|r| r.status == RouteStatus::Active)
            .map(|r| r.clone())
            .collect();
        let domains = self
            .domains
            .iter()
            .filter(|d| d.status == CustomDomainStatus::Active)
            .map(|d| d.clone())
            .collect();
        (routes, domains)
    }

    async fn reload_proxy(&self) -> Result<(), IngressError> {
        let _guard = self.reload_lock.lock().await;
        let (routes, domains) = self.snapshot();
        if let Err(e) = self.proxy.reload_all_routes(&routes, &domains).await {
            warn!(error = %e, "proxy reload failed, will retry on next change");
            return Err(e.into());
        }
        Ok(())
    }
}

/// Sanitize a VM name into a DNS label: lowercase, spaces and underscores
/// become hyphens, anything outside `[a-z0-9-]` is dropped, hyphen runs
/// collapse, and the result is trimmed to 63 chars with no edge hyphens.
pub fn sanitize_subdomain(name: &str) -> String {
    let mut label = String::with_capacity(name.len());
    let mut last_hyphen = false;

    for c in name.to_lowercase().chars() {
        let mapped = match c {
            ' ' | '_' => Some('-'),
            'a'..='z' | '0'..='9' => Some(c),
            '-' => Some('-'),
            _ => None,
        };
        if let Some(m) = mapped {
            if m == '-' {
                if last_hyphen {
                    continue;
                }
                last_hyphen = true;
            } else {
                last_hyphen = false;
            }
            label.push(m);
        }
    }

    let trimmed: String = label.trim_matches('-').chars().take(63).collect();
    trimmed.trim_end_matches('-').to_string()
}
