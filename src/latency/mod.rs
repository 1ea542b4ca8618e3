//! Per-VM round-trip-time tracking
//!
//! Probes pick their target by node class: CGNAT nodes are probed through
//! the mesh at the node agent, public nodes at the VM's attestation agent
//! when its address is known. A probe is the wall time of one HTTP GET,
//! falling back to ICMP when HTTP fails. Calibration takes five samples a
//! second apart and keeps the median as the baseline; later samples feed
//! an exponential moving average plus a small rolling window.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::lifecycle::vm::VirtualMachine;
use crate::registry::node::Node;
use crate::store::Store;

/// Probe timeout
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Samples kept in the rolling window
const ROLLING_WINDOW: usize = 10;

/// Smoothing factor for the RTT EMA
const EMA_ALPHA: f64 = 0.3;

/// Calibration sample count and spacing
const CALIBRATION_SAMPLES: usize = 5;
const CALIBRATION_SPACING: Duration = Duration::from_secs(1);

/// Port of the in-guest attestation agent
const ATTESTATION_AGENT_PORT: u16 = 9999;

/// Errors from RTT measurement
#[derive(Error, Debug)]
pub enum LatencyError {
    #[error("VM '{0}' not found")]
    VmNotFound(String),

    #[error("VM '{0}' has no probeable address")]
    NoTarget(String),

    #[error("Probe failed over HTTP ({http}) and ICMP ({icmp})")]
    ProbeFailed { http: String, icmp: String },

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

/// Where a probe is aimed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    /// URL for the HTTP probe
    pub url: String,

    /// Host for the ICMP fallback
    pub host: String,
}

/// Transport doing the actual probing, pinned for testability.
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    /// Wall-clock milliseconds of one GET, or an error string.
    async fn http_probe(&self, url: &str) -> Result<f64, String>;

    /// Milliseconds of one ICMP echo, or an error string.
    async fn icmp_probe(&self, host: &str) -> Result<f64, String>;
}

/// Real transport: reqwest GET, `ping` subprocess fallback.
pub struct HttpIcmpTransport {
    client: reqwest::Client,
}

impl HttpIcmpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(PROBE_TIMEOUT)
                .build()
                .expect("Failed to create HTTP client"),
        }
    }
}

impl Default for HttpIcmpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProbeTransport for HttpIcmpTransport {
    async fn http_probe(&self, url: &str) -> Result<f64, String> {
        let start = Instant::now();
        let response = self.client.get(url).send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status()));
        }
        Ok(start.elapsed().as_secs_f64() * 1000.0)
    }

    async fn icmp_probe(&self, host: &str) -> Result<f64, String> {
        let start = Instant::now();
        let output = tokio::process::Command::new("ping")
            .args(["-c", "1", "-W", "5", host])
            .output()
            .await
            .map_err(|e| e.to_string())?;
        if !output.status.success() {
            return Err(format!("ping exited {}", output.status));
        }
        Ok(start.elapsed().as_secs_f64() * 1000.0)
    }
}

/// Tracks RTT per VM and maintains its smoothing state.
#[derive(Clone)]
pub struct LatencyTracker {
    store: Store,
    transport: Arc<dyn ProbeTransport>,
}

impl LatencyTracker {
    pub fn new(store: Store, transport: Arc<dyn ProbeTransport>) -> Self {
        Self { store, transport }
    }

    /// Pick the probe target for a VM.
    pub fn probe_target(vm: &VirtualMachine, node: &Node) -> Option<ProbeTarget> {
        // CGNAT nodes are only reachable through the mesh; probe the agent.
        if let Some(cgnat) = &node.cgnat {
            return Some(ProbeTarget {
                url: format!(
                    "http://{}:{}/api/node/health",
                    cgnat.tunnel_ip, node.agent_port
                ),
                host: cgnat.tunnel_ip.clone(),
            });
        }

        // Public node with a known guest address: hit the VM itself.
        if let Some(vm_ip) = vm.network.public_ip.as_ref().or(vm.network.private_ip.as_ref()) {
            if node.public_ip.is_some() {
                return Some(ProbeTarget {
                    url: format!("http://{vm_ip}:{ATTESTATION_AGENT_PORT}/health"),
                    host: vm_ip.clone(),
                });
            }
        }

        // Fallback: the node agent.
        node.public_ip.as_ref().map(|ip| ProbeTarget {
            url: format!("http://{}:{}/api/node/health", ip, node.agent_port),
            host: ip.clone(),
        })
    }

    /// One RTT sample for a VM: HTTP first, ICMP on any HTTP error.
    pub async fn measure_rtt(&self, vm_id: &str) -> Result<f64, LatencyError> {
        let vm = self
            .store
            .get_vm(vm_id)
            .ok_or_else(|| LatencyError::VmNotFound(vm_id.to_string()))?;
        let node = vm
            .node_id
            .as_deref()
            .and_then(|id| self.store.get_node(id))
            .ok_or_else(|| LatencyError::NoTarget(vm_id.to_string()))?;
        let target = Self::probe_target(&vm, &node)
            .ok_or_else(|| LatencyError::NoTarget(vm_id.to_string()))?;

        let sample = match self.transport.http_probe(&target.url).await {
            Ok(ms) => ms,
            Err(http_error) => {
                debug!(vm_id, error = %http_error, "HTTP probe failed, trying ICMP");
                match self.transport.icmp_probe(&target.host).await {
                    Ok(ms) => ms,
                    Err(icmp_error) => {
                        return Err(LatencyError::ProbeFailed {
                            http: http_error,
                            icmp: icmp_error,
                        });
                    }
                }
            }
        };

        self.record_sample(vm_id, sample).await?;
        Ok(sample)
    }

    /// Calibrate a VM's baseline: five samples a second apart, median kept.
    pub async fn calibrate(&self, vm_id: &str) -> Result<f64, LatencyError> {
        let mut samples = Vec::with_capacity(CALIBRATION_SAMPLES);
        for i in 0..CALIBRATION_SAMPLES {
            if i > 0 {
                tokio::time::sleep(CALIBRATION_SPACING).await;
            }
            match self.measure_rtt(vm_id).await {
                Ok(ms) => samples.push(ms),
                Err(e) => warn!(vm_id, error = %e, "calibration sample failed"),
            }
        }
        if samples.is_empty() {
            return Err(LatencyError::NoTarget(vm_id.to_string()));
        }

        let baseline = median(&mut samples);
        self.store
            .update_vm(vm_id, |vm| {
                vm.network_metrics.baseline_rtt_ms = Some(baseline);
            })
            .await?;
        Ok(baseline)
    }

    /// Fold one sample into the EMA and the rolling window.
    async fn record_sample(&self, vm_id: &str, sample: f64) -> Result<(), LatencyError> {
        self.store
            .update_vm(vm_id, |vm| {
                let metrics = &mut vm.network_metrics;
                metrics.current_rtt_ms = Some(match metrics.current_rtt_ms {
                    Some(current) => EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * current,
                    None => sample,
                });
                metrics.recent_samples.push(sample);
                if metrics.recent_samples.len() > ROLLING_WINDOW {
                    let excess = metrics.recent_samples.len() - ROLLING_WINDOW;
                    metrics.recent_samples.drain(..excess);
                }
                metrics.last_measured_at = Some(Utc::now());
            })
            .await?;
        Ok(())
    }
}

/// Rolling min/max/standard deviation over a sample window.
pub fn rolling_stats(samples: &[f64]) -> Option<(f64, f64, f64)> {
    if samples.is_empty() {
        return None;
    }
    let min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / samples.len() as f64;
    Some((min, max, variance.sqrt()))
}

fn median(samples: &mut [f64]) -> f64 {
    samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    samples[samples.len() / 2]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::vm::{QualityTier, VmSpec, VmStatus};
    use crate::registry::node::{CgnatInfo, NatClass, NodeStatus, TunnelStatus};
    use std::sync::Mutex;

    struct ScriptedTransport {
        http: Mutex<Vec<Result<f64, String>>>,
        icmp: Mutex<Vec<Result<f64, String>>>,
    }

    #[async_trait]
    impl ProbeTransport for ScriptedTransport {
        async fn http_probe(&self, _url: &str) -> Result<f64, String> {
            self.http.lock().unwrap().pop().unwrap_or(Err("exhausted".into()))
        }

        async fn icmp_probe(&self, _host: &str) -> Result<f64, String> {
            self.icmp.lock().unwrap().pop().unwrap_or(Err("exhausted".into()))
        }
    }

    fn node(public: bool) -> Node {
        Node {
            id: "node-1".into(),
            wallet_address: "0xnode".into(),
            name: "node-1".into(),
            region: "eu".into(),
            zone: "a".into(),
            status: NodeStatus::Online,
            public_ip: public.then(|| "203.0.113.4".to_string()),
            agent_port: 8080,
            nat: if public { NatClass::None } else { NatClass::Symmetric },
            hardware: Default::default(),
            resources: Default::default(),
            evaluation: None,
            obligations: vec![],
            dht: None,
            relay: None,
            cgnat: (!public).then(|| CgnatInfo {
                assigned_relay_node_id: "relay".into(),
                tunnel_ip: "10.20.3.7".into(),
                wireguard_config: String::new(),
                public_key: "pub".into(),
                tunnel_status: TunnelStatus::Up,
                last_handshake: None,
            }),
            reputation: Default::default(),
            last_heartbeat: None,
            metrics: None,
            push_enabled: false,
            push_successes: 0,
            consecutive_push_failures: 0,
            last_command_pushed_at: None,
            agent_version: String::new(),
            supported_images: vec![],
            labels: Default::default(),
            registered_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn vm_on(node_id: &str, private_ip: Option<&str>) -> VirtualMachine {
        let mut vm = VirtualMachine::new(
            "web",
            "0xuser",
            VmSpec {
                vcpus: 1,
                memory_bytes: 1,
                disk_bytes: 1,
                tier: QualityTier::Balanced,
                gpu_required: false,
                bandwidth_tier: Default::default(),
                template_id: None,
                region_hint: None,
                zone_hint: None,
                compute_point_cost: 1,
            },
        );
        vm.node_id = Some(node_id.to_string());
        vm.status = VmStatus::Running;
        vm.network.private_ip = private_ip.map(String::from);
        vm
    }

    #[test]
    fn test_cgnat_probes_node_agent_via_tunnel() {
        let node = node(false);
        let vm = vm_on("node-1", Some("192.168.1.5"));
        let target = LatencyTracker::probe_target(&vm, &node).unwrap();
        assert_eq!(target.url, "http://10.20.3.7:8080/api/node/health");
        assert_eq!(target.host, "10.20.3.7");
    }

    #[test]
    fn test_public_node_probes_vm_agent() {
        let node = node(true);
        let vm = vm_on("node-1", Some("192.168.1.5"));
        let target = LatencyTracker::probe_target(&vm, &node).unwrap();
        assert_eq!(target.url, "http://192.168.1.5:9999/health");
    }

    #[test]
    fn test_fallback_to_node_agent() {
        let node = node(true);
        let vm = vm_on("node-1", None);
        let target = LatencyTracker::probe_target(&vm, &node).unwrap();
        assert_eq!(target.url, "http://203.0.113.4:8080/api/node/health");
    }

    async fn tracker_with(
        http: Vec<Result<f64, String>>,
        icmp: Vec<Result<f64, String>>,
    ) -> (LatencyTracker, Store, String) {
        let store = Store::in_memory();
        store.save_node(node(true)).await.unwrap();
        let vm = vm_on("node-1", Some("192.168.1.5"));
        let vm_id = vm.id.clone();
        store.save_vm(vm).await.unwrap();

        let tracker = LatencyTracker::new(
            store.clone(),
            Arc::new(ScriptedTransport {
                http: Mutex::new(http),
                icmp: Mutex::new(icmp),
            }),
        );
        (tracker, store, vm_id)
    }

    #[tokio::test]
    async fn test_ema_smoothing() {
        let (tracker, store, vm_id) =
            tracker_with(vec![Ok(20.0), Ok(10.0)], vec![]).await;

        // Scripted results pop from the back: first 10, then 20.
        tracker.measure_rtt(&vm_id).await.unwrap();
        let first = store.get_vm(&vm_id).unwrap().network_metrics.current_rtt_ms.unwrap();
        assert!((first - 10.0).abs() < 1e-9);

        tracker.measure_rtt(&vm_id).await.unwrap();
        let second = store.get_vm(&vm_id).unwrap().network_metrics.current_rtt_ms.unwrap();
        // 0.3 * 20 + 0.7 * 10 = 13.
        assert!((second - 13.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_icmp_fallback_on_http_error() {
        let (tracker, _, vm_id) =
            tracker_with(vec![Err("HTTP 500".into())], vec![Ok(42.0)]).await;
        let sample = tracker.measure_rtt(&vm_id).await.unwrap();
        assert!((sample - 42.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_both_probes_failing() {
        let (tracker, _, vm_id) =
            tracker_with(vec![Err("refused".into())], vec![Err("unreachable".into())]).await;
        assert!(matches!(
            tracker.measure_rtt(&vm_id).await,
            Err(LatencyError::ProbeFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_rolling_window_bounded() {
        let samples: Vec<Result<f64, String>> = (0..15).map(|i| Ok(i as f64)).collect();
        let (tracker, store, vm_id) = tracker_with(samples, vec![]).await;

        for _ in 0..15 {
            tracker.measure_rtt(&vm_id).await.unwrap();
        }
        let metrics = store.get_vm(&vm_id).unwrap().network_metrics;
        assert_eq!(metrics.recent_samples.len(), ROLLING_WINDOW);
    }

    #[tokio::test]
    async fn test_calibration_keeps_median() {
        tokio::time::pause();
        let (tracker, store, vm_id) = tracker_with(
            vec![Ok(100.0), Ok(12.0), Ok(11.0), Ok(10.0), Ok(9.0)],
            vec![],
        )
        .await;

        let handle = {
            let tracker = tracker.clone();
            let vm_id = vm_id.clone();
            tokio::spawn(async move { tracker.calibrate(&vm_id).await })
        };
        loop {
            tokio::time::advance(Duration::from_secs(1)).await;
            if handle.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let baseline = handle.await.unwrap().unwrap();

        // Samples pop back-to-front: 9, 10, 11, 12, 100; median is 11.
        assert!((baseline - 11.0).abs() < 1e-9);
        assert_eq!(
            store.get_vm(&vm_id).unwrap().network_metrics.baseline_rtt_ms,
            Some(11.0)
        );
    }

    #[test]
    fn test_rolling_stats() {
        let (min, max, stdev) = rolling_stats(&[10.0, 20.0, 30.0]).unwrap();
        assert_eq!(min, 10.0);
        assert_eq!(max, 30.0);
        assert!((stdev - 8.1649658).abs() < 1e-5);
        assert!(rolling_stats(&[]).is_none());
    }
}
