//! Relay deployment, CGNAT enrollment, relay health and failover
//!
//! A relay is a WireGuard server VM on a public node that bridges CGNAT
//! nodes into the mesh. The health monitor probes every relay, re-adds
//! missing peers, reconciles the attached set, and on a dead relay
//! reassigns every attached CGNAT node to the best surviving relay.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::commands::{CommandType, NodeCommand};
use crate::events::Event;
use crate::lifecycle::vm::VmType;
use crate::registry::node::{
    CgnatInfo, Node, NodeStatus, ObligationStatus, RelayInfo, RelayStatus, SystemVmRole,
    TunnelStatus,
};

use super::cloudinit::RenderContext;
use super::mesh::{
    allocate_host_octet, allocate_subnet, cgnat_tunnel_ip, relay_tunnel_ip, render_cgnat_config,
    MESH_CIDR, WIREGUARD_PORT,
};
use super::{mint_callback_token, SysVmController, SysVmError};

/// A handshake older than this counts as down
const HANDSHAKE_FRESHNESS_SECS: i64 = 300;

/// Timeout for relay admin calls
const RELAY_ADMIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Peer registration request for the relay admin API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddPeerRequest {
    #[serde(rename = "publicKey")]
    pub public_key: String,

    #[serde(rename = "tunnelIp")]
    pub tunnel_ip: String,

    #[serde(rename = "allowedIps")]
    pub allowed_ips: String,

    #[serde(rename = "persistentKeepalive")]
    pub persistent_keepalive: u32,

    pub description: String,
}

/// One peer as reported by the relay VM's local WireGuard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayPeer {
    #[serde(rename = "publicKey")]
    pub public_key: String,

    /// Seconds since the last handshake, if any
    #[serde(rename = "latestHandshakeAgeSecs")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_handshake_age_secs: Option<i64>,
}

/// The relay VM's admin API, pinned for testability.
#[async_trait]
pub trait RelayAdminApi: Send + Sync {
    async fn add_peer(&self, relay_tunnel_ip: &str, peer: AddPeerRequest) -> Result<(), String>;

    async fn list_peers(&self, relay_tunnel_ip: &str) -> Result<Vec<RelayPeer>, String>;

    /// `Ok(())` iff the relay's health endpoint answered 2xx.
    async fn health(&self, relay_tunnel_ip: &str) -> Result<(), String>;
}

/// HTTP client for the relay admin API.
pub struct HttpRelayAdmin {
    client: reqwest::Client,
}

impl HttpRelayAdmin {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(RELAY_ADMIN_TIMEOUT)
                .build()
                .expect("Failed to create HTTP client"),
        }
    }
}

impl Default for HttpRelayAdmin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayAdminApi for HttpRelayAdmin {
    async fn add_peer(&self, relay_tunnel_ip: &str, peer: AddPeerRequest) -> Result<(), String> {
        let url = format!("http://{relay_tunnel_ip}:8080/api/relay/add-peer");
        let response = self
            .client
            .post(&url)
            .json(&peer)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("add-peer returned {}", response.status()));
        }
        Ok(())
    }

    async fn list_peers(&self, relay_tunnel_ip: &str) -> Result<Vec<RelayPeer>, String> {
        #[derive(Deserialize)]
        struct PeersResponse {
            peers: Vec<RelayPeer>,
        }

        let url = format!("http://{relay_tunnel_ip}:8080/api/relay/wireguard");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("wireguard query returned {}", response.status()));
        }
        let body: PeersResponse = response.json().await.map_err(|e| e.to_string())?;
        Ok(body.peers)
    }

    async fn health(&self, relay_tunnel_ip: &str) -> Result<(), String> {
        let url = format!("http://{relay_tunnel_ip}/health");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("health returned {}", response.status()));
        }
        Ok(())
    }
}

/// Relay slots by node compute points.
fn relay_capacity(compute_points: u64) -> u32 {
    match compute_points {
        0..=15 => 25,
        16..=31 => 50,
        32..=63 => 100,
        _ => 200,
    }
}

impl SysVmController {
    /// Deploy the relay obligation on a public node: allocate a subnet,
    /// forge a keypair, render cloud-init, and create the relay VM.
    pub async fn deploy_relay(&self, node_id: &str) -> Result<(), SysVmError> {
        let node = self
            .store
            .get_node(node_id)
            .ok_or_else(|| SysVmError::NodeNotFound(node_id.to_string()))?;
        let Some(public_ip) = node.public_ip.clone() else {
            return Err(SysVmError::NoRelayAvailable(format!(
                "node '{node_id}' has no public IP for a relay"
            )));
        };

        let used: Vec<u8> = self
            .store
            .list_nodes()
            .iter()
            .filter_map(|n| n.relay.as_ref().map(|r| r.subnet))
            .collect();
        let subnet = allocate_subnet(&used)?;

        let keypair = self.keyforge.generate_keypair().await?;
        let token = mint_callback_token();
        let tunnel_ip = relay_tunnel_ip(subnet);

        let vm = crate::lifecycle::vm::VirtualMachine::new(
            format!("relay-{}-{subnet}", node.name),
            "system",
            self.system_vm_spec(),
        )
        .with_type(VmType::Relay)
        .with_node(node.id.clone());

        let cloud_init = self.renderer.render_relay(&RenderContext {
            vm_id: vm.id.clone(),
            node_id: node.id.clone(),
            region: node.region.clone(),
            tunnel_ip: tunnel_ip.clone(),
            wireguard_private_key: keypair.private_key.clone(),
            relay_subnet: subnet,
            auth_token: token.clone(),
            orchestrator_url: self.orchestrator_url.clone(),
            ..Default::default()
        });

        let vm_id = self.create_system_vm(vm, cloud_init).await?;

        let relay = RelayInfo {
            relay_vm_id: vm_id.clone(),
            wireguard_endpoint: format!("{public_ip}:{WIREGUARD_PORT}"),
            public_key: keypair.public_key,
            private_key: keypair.private_key,
            tunnel_ip,
            subnet,
            max_capacity: relay_capacity(node.resources.total.compute_points),
            current_load: 0,
            connected_node_ids: vec![],
            status: RelayStatus::Initializing,
            last_health_check: None,
            deployed_at: Utc::now(),
        };

        self.store
            .update_node(node_id, |n| {
                n.relay = Some(relay);
                if let Some(obligation) = n.obligation_mut(SystemVmRole::Relay) {
                    obligation.status = ObligationStatus::Initializing;
                    obligation.vm_id = Some(vm_id.clone());
                    obligation.auth_token = Some(token.clone());
                }
            })
            .await?;

        info!(node_id, subnet, "relay deployment submitted");
        Ok(())
    }

    /// Score a candidate relay for a CGNAT node. Higher is better.
    fn relay_score(cgnat: &Node, host: &Node, relay: &RelayInfo) -> f64 {
        let mut score = 100.0;
        if host.region == cgnat.region {
            score += 50.0;
        }
        if host.zone == cgnat.zone {
            score += 25.0;
        }
        if relay.max_capacity > 0 {
            score += (1.0 - relay.current_load as f64 / relay.max_capacity as f64) * 30.0;
        }
        score += (relay.headroom() as f64 / 5.0).min(20.0);
        score
    }

    /// Pick the best relay for a CGNAT node: Online host, Active relay,
    /// not full, not excluded.
    fn select_relay(&self, cgnat: &Node, exclude: &[String]) -> Option<Node> {
        let mut candidates: Vec<(f64, Node)> = self
            .store
            .list_nodes()
            .into_iter()
            .filter(|host| {
                host.status == NodeStatus::Online
                    && !exclude.contains(&host.id)
                    && host
                        .relay
                        .as_ref()
                        .map(|r| r.status == RelayStatus::Active && !r.is_full())
                        .unwrap_or(false)
            })
            .map(|host| {
                let relay = host.relay.as_ref().expect("filtered above");
                (Self::relay_score(cgnat, &host, relay), host)
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.id.cmp(&b.1.id))
        });
        candidates.into_iter().next().map(|(_, host)| host)
    }

    /// Attach a CGNAT node to the best available relay: allocate a tunnel
    /// address, register the peer on the relay, store the config, and send
    /// it to the node agent.
    pub async fn enroll_cgnat(&self, node_id: &str, exclude: &[String]) -> Result<(), SysVmError> {
        let node = self
            .store
            .get_node(node_id)
            .ok_or_else(|| SysVmError::NodeNotFound(node_id.to_string()))?;

        let relay_host = self
            .select_relay(&node, exclude)
            .ok_or_else(|| SysVmError::NoRelayAvailable(node_id.to_string()))?;
        let relay = relay_host.relay.clone().expect("selected host has a relay");

        // Host octets already taken inside this relay's subnet.
        let used: Vec<u8> = self
            .store
            .list_nodes()
            .iter()
            .filter(|n| {
                n.cgnat
                    .as_ref()
                    .map(|c| c.assigned_relay_node_id == relay_host.id)
                    .unwrap_or(false)
            })
            .filter_map(|n| {
                n.cgnat
                    .as_ref()
                    .and_then(|c| c.tunnel_ip.rsplit('.').next()?.parse().ok())
            })
            .collect();
        let needs_dht_ip = node.obligation(SystemVmRole::Dht).is_some();
        let octet = allocate_host_octet(relay.subnet, &used, needs_dht_ip)?;
        let tunnel_ip = cgnat_tunnel_ip(relay.subnet, octet);

        let keypair = self.keyforge.generate_keypair().await?;
        let config = render_cgnat_config(
            &keypair.private_key,
            &tunnel_ip,
            &relay.public_key,
            &relay.wireguard_endpoint,
        );

        self.relay_admin
            .add_peer(
                &relay.tunnel_ip,
                AddPeerRequest {
                    public_key: keypair.public_key.clone(),
                    tunnel_ip: tunnel_ip.clone(),
                    allowed_ips: format!("{tunnel_ip}/32"),
                    persistent_keepalive: 25,
                    description: format!("node {node_id}"),
                },
            )
            .await
            .map_err(SysVmError::RelayAdmin)?;

        self.store
            .update_node(node_id, |n| {
                n.cgnat = Some(CgnatInfo {
                    assigned_relay_node_id: relay_host.id.clone(),
                    tunnel_ip: tunnel_ip.clone(),
                    wireguard_config: config.clone(),
                    public_key: keypair.public_key.clone(),
                    tunnel_status: TunnelStatus::Pending,
                    last_handshake: None,
                });
            })
            .await?;

        self.store
            .update_node(&relay_host.id, |n| {
                if let Some(r) = &mut n.relay {
                    if !r.connected_node_ids.contains(&node_id.to_string()) {
                        r.connected_node_ids.push(node_id.to_string());
                    }
                    r.current_load = r.connected_node_ids.len() as u32;
                }
            })
            .await?;

        // Hand the rendered config to the node agent.
        let command = NodeCommand::new(
            CommandType::ConfigureWireGuard,
            serde_json::json!({
                "config": config,
                "tunnelIp": tunnel_ip,
                "allowedIps": MESH_CIDR,
            }),
        );
        self.commands.deliver(node_id, command).await;

        info!(node_id, relay = %relay_host.id, tunnel_ip, "CGNAT node enrolled");
        Ok(())
    }

    /// Probe every relay once, concurrently.
    pub async fn relay_health_sweep(&self) {
        let hosts: Vec<Node> = self
            .store
            .list_nodes()
            .into_iter()
            .filter(|n| n.relay.is_some())
            .collect();

        let probes = hosts.iter().map(|host| self.check_relay_health(host));
        futures::future::join_all(probes).await;
    }

    /// One health pass for one relay host.
    pub async fn check_relay_health(&self, host: &Node) {
        let Some(relay) = host.relay.clone() else {
            return;
        };

        // Initializing relays get a grace window before probes count.
        if relay.status == RelayStatus::Initializing {
            let age = Utc::now() - relay.deployed_at;
            if age < ChronoDuration::seconds(self.config.relay_init_timeout_secs) {
                debug!(node_id = %host.id, "relay still in initialization grace");
                return;
            }
        }

        match self.relay_admin.health(&relay.tunnel_ip).await {
            Ok(()) => self.reconcile_healthy_relay(host, &relay).await,
            Err(reason) => {
                let next = match relay.status {
                    RelayStatus::Degraded | RelayStatus::Offline => RelayStatus::Offline,
                    _ => RelayStatus::Degraded,
                };
                warn!(node_id = %host.id, reason, status = ?next, "relay health probe failed");
                let _ = self
                    .store
                    .update_node(&host.id, |n| {
                        if let Some(r) = &mut n.relay {
                            r.status = next;
                            r.last_health_check = Some(Utc::now());
                        }
                    })
                    .await;

                if next == RelayStatus::Offline {
                    self.failover_relay(&host.id).await;
                }
            }
        }
    }

    /// The relay answered: verify peers, re-add the missing, converge the
    /// attached set and load, and mark the relay Active.
    async fn reconcile_healthy_relay(&self, host: &Node, relay: &RelayInfo) {
        let peers = match self.relay_admin.list_peers(&relay.tunnel_ip).await {
            Ok(p) => p,
            Err(reason) => {
                warn!(node_id = %host.id, reason, "relay peer listing failed");
                return;
            }
        };

        // Nodes whose assignment points at this relay are the desired set.
        let desired: Vec<Node> = self
            .store
            .list_nodes()
            .into_iter()
            .filter(|n| {
                n.cgnat
                    .as_ref()
                    .map(|c| c.assigned_relay_node_id == host.id)
                    .unwrap_or(false)
            })
            .collect();

        for cgnat in &desired {
            let Some(info) = cgnat.cgnat.as_ref() else {
                continue;
            };
            let registered = peers.iter().find(|p| p.public_key == info.public_key);
            match registered {
                Some(peer) => {
                    let fresh = peer
                        .latest_handshake_age_secs
                        .map(|age| age <= HANDSHAKE_FRESHNESS_SECS)
                        .unwrap_or(false);
                    let _ = self
                        .store
                        .update_node(&cgnat.id, |n| {
                            if let Some(c) = &mut n.cgnat {
                                c.tunnel_status = if fresh { TunnelStatus::Up } else { TunnelStatus::Down };
                                if fresh {
                                    c.last_handshake = Some(Utc::now());
                                }
                            }
                        })
                        .await;
                }
                None => {
                    // The relay lost this peer (reboot, wg flush): put it back.
                    info!(node_id = %cgnat.id, relay = %host.id, "re-adding missing peer");
                    let result = self
                        .relay_admin
                        .add_peer(
                            &relay.tunnel_ip,
                            AddPeerRequest {
                                public_key: info.public_key.clone(),
                                tunnel_ip: info.tunnel_ip.clone(),
                                allowed_ips: format!("{}/32", info.tunnel_ip),
                                persistent_keepalive: 25,
                                description: format!("node {}", cgnat.id),
                            },
                        )
                        .await;
                    if let Err(reason) = result {
                        warn!(node_id = %cgnat.id, reason, "peer re-add failed");
                    }
                    let _ = self
                        .store
                        .update_node(&cgnat.id, |n| {
                            if let Some(c) = &mut n.cgnat {
                                c.tunnel_status = TunnelStatus::Pending;
                            }
                        })
                        .await;
                }
            }
        }

        let desired_ids: Vec<String> = desired.iter().map(|n| n.id.clone()).collect();
        let _ = self
            .store
            .update_node(&host.id, |n| {
                if let Some(r) = &mut n.relay {
                    r.status = RelayStatus::Active;
                    r.last_health_check = Some(Utc::now());
                    r.connected_node_ids = desired_ids.clone();
                    r.current_load = desired_ids.len() as u32;
                }
                if let Some(obligation) = n.obligation_mut(SystemVmRole::Relay) {
                    if obligation.status == ObligationStatus::Initializing {
                        obligation.status = ObligationStatus::Active;
                    }
                }
            })
            .await;
    }

    /// The relay is dead: detach every CGNAT node and re-enroll each on
    /// the best surviving relay. A node is left unattached only when no
    /// alternative exists; the reconcile loop keeps retrying it.
    pub async fn failover_relay(&self, relay_node_id: &str) {
        let attached: Vec<Node> = self
            .store
            .list_nodes()
            .into_iter()
            .filter(|n| {
                n.cgnat
                    .as_ref()
                    .map(|c| c.assigned_relay_node_id == relay_node_id)
                    .unwrap_or(false)
            })
            .collect();

        let mut reassigned = 0usize;
        let mut abandoned = 0usize;

        for node in &attached {
            let _ = self
                .store
                .update_node(&node.id, |n| {
                    n.cgnat = None;
                })
                .await;

            match self.enroll_cgnat(&node.id, &[relay_node_id.to_string()]).await {
                Ok(()) => reassigned += 1,
                Err(SysVmError::NoRelayAvailable(_)) => {
                    warn!(node_id = %node.id, "no alternative relay, node left unattached");
                    abandoned += 1;
                }
                Err(e) => {
                    warn!(node_id = %node.id, error = %e, "failover enrollment failed");
                    abandoned += 1;
                }
            }
        }

        let _ = self
            .store
            .update_node(relay_node_id, |n| {
                if let Some(r) = &mut n.relay {
                    r.connected_node_ids.clear();
                    r.current_load = 0;
                }
            })
            .await;

        info!(relay = %relay_node_id, reassigned, abandoned, "relay failover complete");
        self.bus.publish(Event::RelayFailover {
            old_relay_node_id: relay_node_id.to_string(),
            reassigned,
            abandoned,
        });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sysvm::tests::{cgnat_node, controller_harness, public_node};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Test double for the relay admin API.
    #[derive(Default)]
    pub(crate) struct FakeRelayAdmin {
        /// tunnel_ip -> healthy?
        pub health_by_ip: Mutex<HashMap<String, bool>>,
        /// tunnel_ip -> peers
        pub peers_by_ip: Mutex<HashMap<String, Vec<RelayPeer>>>,
        pub add_peer_calls: Mutex<Vec<(String, AddPeerRequest)>>,
    }

    impl FakeRelayAdmin {
        pub fn set_health(&self, tunnel_ip: &str, healthy: bool) {
            self.health_by_ip
                .lock()
                .unwrap()
                .insert(tunnel_ip.to_string(), healthy);
        }

        pub fn set_peers(&self, tunnel_ip: &str, peers: Vec<RelayPeer>) {
            self.peers_by_ip
                .lock()
                .unwrap()
                .insert(tunnel_ip.to_string(), peers);
        }
    }

    #[async_trait]
    impl RelayAdminApi for FakeRelayAdmin {
        async fn add_peer(&self, relay_tunnel_ip: &str, peer: AddPeerRequest) -> Result<(), String> {
            self.peers_by_ip
                .lock()
                .unwrap()
                .entry(relay_tunnel_ip.to_string())
                .or_default()
                .push(RelayPeer {
                    public_key: peer.public_key.clone(),
                    latest_handshake_age_secs: Some(1),
                });
            self.add_peer_calls
                .lock()
                .unwrap()
                .push((relay_tunnel_ip.to_string(), peer));
            Ok(())
        }

        async fn list_peers(&self, relay_tunnel_ip: &str) -> Result<Vec<RelayPeer>, String> {
            Ok(self
                .peers_by_ip
                .lock()
                .unwrap()
                .get(relay_tunnel_ip)
                .cloned()
                .unwrap_or_default())
        }

        async fn health(&self, relay_tunnel_ip: &str) -> Result<(), String> {
            match self.health_by_ip.lock().unwrap().get(relay_tunnel_ip) {
                Some(true) => Ok(()),
                Some(false) => Err("HTTP 503".to_string()),
                None => Err("connection refused".to_string()),
            }
        }
    }

    fn binary_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("dht-amd64"), b"bin").unwrap();
        dir
    }

    /// Deploy a relay on a node and force it straight to Active.
    async fn active_relay(
        controller: &SysVmController,
        store: &crate::store::Store,
        node_id: &str,
    ) -> String {
        controller.deploy_relay(node_id).await.unwrap();
        store
            .update_node(node_id, |n| {
                if let Some(r) = &mut n.relay {
                    r.status = RelayStatus::Active;
                }
            })
            .await
            .unwrap();
        store.get_node(node_id).unwrap().relay.unwrap().tunnel_ip
    }

    #[tokio::test]
    async fn test_deploy_relay_allocates_subnet_and_vm() {
        let dir = binary_dir();
        let (controller, store, _) = controller_harness(dir.path().to_path_buf());
        store.save_node(public_node("r1")).await.unwrap();
        store.save_node(public_node("r2")).await.unwrap();

        controller.deploy_relay("r1").await.unwrap();
        controller.deploy_relay("r2").await.unwrap();

        let r1 = store.get_node("r1").unwrap().relay.unwrap();
        let r2 = store.get_node("r2").unwrap().relay.unwrap();
        assert_ne!(r1.subnet, r2.subnet);
        assert_eq!(r1.tunnel_ip, format!("10.20.{}.254", r1.subnet));
        assert!(r1.wireguard_endpoint.ends_with(":51820"));
        assert_eq!(r1.status, RelayStatus::Initializing);

        // A relay VM record exists, pinned to the host.
        let vm = store.get_vm(&r1.relay_vm_id).unwrap();
        assert_eq!(vm.vm_type, VmType::Relay);
        assert_eq!(vm.node_id.as_deref(), Some("r1"));

        let obligation = store
            .get_node("r1")
            .unwrap()
            .obligation(SystemVmRole::Relay)
            .cloned()
            .unwrap();
        assert_eq!(obligation.status, ObligationStatus::Initializing);
        assert!(obligation.auth_token.is_some());
    }

    #[tokio::test]
    async fn test_enroll_cgnat_assigns_tunnel_and_peer() {
        let dir = binary_dir();
        let (controller, store, admin) = controller_harness(dir.path().to_path_buf());
        store.save_node(public_node("relay-host")).await.unwrap();
        store.save_node(cgnat_node("cg1")).await.unwrap();
        let relay_ip = active_relay(&controller, &store, "relay-host").await;

        controller.enroll_cgnat("cg1", &[]).await.unwrap();

        let cgnat = store.get_node("cg1").unwrap().cgnat.unwrap();
        assert_eq!(cgnat.assigned_relay_node_id, "relay-host");
        assert!(cgnat.tunnel_ip.ends_with(".2"));
        assert!(cgnat.wireguard_config.contains("AllowedIPs = 10.20.0.0/16"));

        let relay = store.get_node("relay-host").unwrap().relay.unwrap();
        assert_eq!(relay.current_load, 1);
        assert!(relay.connected_node_ids.contains(&"cg1".to_string()));

        let calls = admin.add_peer_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, relay_ip);
        assert_eq!(calls[0].1.allowed_ips, format!("{}/32", cgnat.tunnel_ip));

        // The node agent got its WireGuard config.
        let queued = store.peek_pending_commands("cg1");
        assert!(queued
            .iter()
            .any(|c| c.command_type == CommandType::ConfigureWireGuard));
    }

    #[tokio::test]
    async fn test_enroll_prefers_same_region_relay() {
        let dir = binary_dir();
        let (controller, store, _) = controller_harness(dir.path().to_path_buf());

        let mut far = public_node("far-relay");
        far.region = "us-east".into();
        store.save_node(far).await.unwrap();
        store.save_node(public_node("near-relay")).await.unwrap();
        store.save_node(cgnat_node("cg1")).await.unwrap();

        active_relay(&controller, &store, "far-relay").await;
        active_relay(&controller, &store, "near-relay").await;

        controller.enroll_cgnat("cg1", &[]).await.unwrap();

        let cgnat = store.get_node("cg1").unwrap().cgnat.unwrap();
        assert_eq!(cgnat.assigned_relay_node_id, "near-relay");
    }

    #[tokio::test]
    async fn test_no_relay_available() {
        let dir = binary_dir();
        let (controller, store, _) = controller_harness(dir.path().to_path_buf());
        store.save_node(cgnat_node("cg1")).await.unwrap();

        assert!(matches!(
            controller.enroll_cgnat("cg1", &[]).await,
            Err(SysVmError::NoRelayAvailable(_))
        ));
    }

    #[tokio::test]
    async fn test_healthy_relay_reconciles_and_activates() {
        let dir = binary_dir();
        let (controller, store, admin) = controller_harness(dir.path().to_path_buf());
        store.save_node(public_node("relay-host")).await.unwrap();
        store.save_node(cgnat_node("cg1")).await.unwrap();
        let relay_ip = active_relay(&controller, &store, "relay-host").await;
        controller.enroll_cgnat("cg1", &[]).await.unwrap();

        admin.set_health(&relay_ip, true);
        // Peers already contain cg1 with a fresh handshake (FakeRelayAdmin
        // records add_peer into the peer list).

        let host = store.get_node("relay-host").unwrap();
        controller.check_relay_health(&host).await;

        let relay = store.get_node("relay-host").unwrap().relay.unwrap();
        assert_eq!(relay.status, RelayStatus::Active);
        assert_eq!(relay.connected_node_ids, vec!["cg1".to_string()]);
        assert_eq!(relay.current_load, 1);

        let cgnat = store.get_node("cg1").unwrap().cgnat.unwrap();
        assert_eq!(cgnat.tunnel_status, TunnelStatus::Up);
    }

    #[tokio::test]
    async fn test_missing_peer_readded() {
        let dir = binary_dir();
        let (controller, store, admin) = controller_harness(dir.path().to_path_buf());
        store.save_node(public_node("relay-host")).await.unwrap();
        store.save_node(cgnat_node("cg1")).await.unwrap();
        let relay_ip = active_relay(&controller, &store, "relay-host").await;
        controller.enroll_cgnat("cg1", &[]).await.unwrap();

        // The relay VM rebooted and lost its peers.
        admin.set_health(&relay_ip, true);
        admin.set_peers(&relay_ip, vec![]);
        let calls_before = admin.add_peer_calls.lock().unwrap().len();

        let host = store.get_node("relay-host").unwrap();
        controller.check_relay_health(&host).await;

        assert_eq!(admin.add_peer_calls.lock().unwrap().len(), calls_before + 1);
        let cgnat = store.get_node("cg1").unwrap().cgnat.unwrap();
        assert_eq!(cgnat.tunnel_status, TunnelStatus::Pending);
    }

    #[tokio::test]
    async fn test_degraded_then_offline_then_failover() {
        let dir = binary_dir();
        let (controller, store, admin) = controller_harness(dir.path().to_path_buf());
        store.save_node(public_node("dying")).await.unwrap();
        store.save_node(public_node("survivor")).await.unwrap();
        for i in 0..3 {
            store.save_node(cgnat_node(&format!("cg{i}"))).await.unwrap();
        }
        let dying_ip = active_relay(&controller, &store, "dying").await;
        // Survivor comes later so the initial enrollments pick "dying"
        // (same region, equal scores, id tie-break favors it).
        for i in 0..3 {
            controller.enroll_cgnat(&format!("cg{i}"), &[]).await.unwrap();
        }
        active_relay(&controller, &store, "survivor").await;
        assert_eq!(
            store.get_node("dying").unwrap().relay.unwrap().current_load,
            3
        );

        admin.set_health(&dying_ip, false);

        // First failed probe: Degraded. Second: Offline + failover.
        let host = store.get_node("dying").unwrap();
        controller.check_relay_health(&host).await;
        assert_eq!(
            store.get_node("dying").unwrap().relay.unwrap().status,
            RelayStatus::Degraded
        );

        let host = store.get_node("dying").unwrap();
        controller.check_relay_health(&host).await;

        let dying = store.get_node("dying").unwrap().relay.unwrap();
        assert_eq!(dying.status, RelayStatus::Offline);
        assert!(dying.connected_node_ids.is_empty());
        assert_eq!(dying.current_load, 0);

        // All three CGNATs moved to the survivor.
        for i in 0..3 {
            let cgnat = store.get_node(&format!("cg{i}")).unwrap().cgnat.unwrap();
            assert_eq!(cgnat.assigned_relay_node_id, "survivor");
        }
        let survivor = store.get_node("survivor").unwrap().relay.unwrap();
        assert_eq!(survivor.current_load, 3);
    }

    #[tokio::test]
    async fn test_initializing_grace_period_skips_probe() {
        let dir = binary_dir();
        let (controller, store, admin) = controller_harness(dir.path().to_path_buf());
        store.save_node(public_node("r1")).await.unwrap();
        controller.deploy_relay("r1").await.unwrap();

        // No health configured: a probe would mark it Degraded, but the
        // grace window protects it.
        let host = store.get_node("r1").unwrap();
        controller.check_relay_health(&host).await;
        assert_eq!(
            store.get_node("r1").unwrap().relay.unwrap().status,
            RelayStatus::Initializing
        );
        drop(admin);
    }

    #[test]
    fn test_relay_capacity_tiers() {
        assert_eq!(relay_capacity(8), 25);
        assert_eq!(relay_capacity(16), 50);
        assert_eq!(relay_capacity(40), 100);
        assert_eq!(relay_capacity(128), 200);
    }
}
