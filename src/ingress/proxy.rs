//! External reverse-proxy contract
//!
//! The orchestrator always hands the proxy the complete desired state,
//! never deltas; the proxy diffs internally. The on-demand TLS gate is the
//! inverse direction: the proxy asks [`super::IngressRegistry`] whether a
//! domain is registered before issuing a certificate.

use async_trait::async_trait;
use tracing::info;

use super::{CustomDomain, Route};

/// Errors from a proxy reload
#[derive(Debug, thiserror::Error)]
#[error("Proxy reload failed: {0}")]
pub struct ProxyError(pub String);

/// The reverse proxy process, pinned as a full-state reload contract.
#[async_trait]
pub trait ProxyReloader: Send + Sync {
    /// Replace the proxy's route table with the given active routes and
    /// verified custom domains.
    async fn reload_all_routes(
        &self,
        routes: &[Route],
        custom_domains: &[CustomDomain],
    ) -> Result<(), ProxyError>;
}

/// Stand-in reloader that only logs the snapshot it was handed. The real
/// proxy process subscribes out-of-band; this keeps reload serialization
/// and snapshot construction honest in deployments without one.
pub struct LoggingProxyReloader;

#[async_trait]
impl ProxyReloader for LoggingProxyReloader {
    async fn reload_all_routes(
        &self,
        routes: &[Route],
        custom_domains: &[CustomDomain],
    ) -> Result<(), ProxyError> {
        info!(
            routes = routes.len(),
            custom_domains = custom_domains.len(),
            "proxy route snapshot reloaded"
        );
        Ok(())
    }
}

/// Test double that records every snapshot it receives.
#[derive(Default)]
pub struct RecordingProxyReloader {
    pub snapshots: std::sync::Mutex<Vec<(Vec<Route>, Vec<CustomDomain>)>>,
}

#[async_trait]
impl ProxyReloader for RecordingProxyReloader {
    async fn reload_all_routes(
        &self,
        routes: &[Route],
        custom_domains: &[CustomDomain],
    ) -> Result<(), ProxyError> {
        self.snapshots
            .lock()
            .unwrap()
            .push((routes.to_vec(), custom_domains.to_vec()));
        Ok(())
    }
}

impl RecordingProxyReloader {
    /// The most recent snapshot, if any reload happened.
    pub fn last_snapshot(&self) -> Option<(Vec<Route>, Vec<CustomDomain>)> {
        self.snapshots.lock().unwrap().last().cloned()
    }

    pub fn reload_count(&self) -> usize {
        self.snapshots.lock().unwrap().len()
    }
}
