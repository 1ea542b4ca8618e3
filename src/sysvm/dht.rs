//! DHT system-VM deployment and ready callbacks
//!
//! Every node hosts a DHT VM. Its bootstrap peer set is built from the
//! other Online nodes whose DHT is already Active, dialed at their
//! advertise address (mesh tunnel IP for CGNAT nodes, public IP
//! otherwise). Once the VM boots it posts its libp2p peer id back,
//! authenticated with an HMAC over `vmId:peerId` keyed by the machine
//! secret injected through cloud-init.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{info, warn};

use crate::events::Event;
use crate::lifecycle::vm::VmType;
use crate::registry::node::{DhtInfo, Node, NodeStatus, ObligationStatus, SystemVmRole};

use super::cloudinit::RenderContext;
use super::mesh::dht_tunnel_ip;
use super::{mint_callback_token, SysVmController, SysVmError};

type HmacSha256 = Hmac<Sha256>;

/// Port DHT VMs listen on for peer traffic
pub const DHT_PORT: u16 = 4001;

/// The address other peers should dial for a node's DHT.
pub fn advertise_ip(node: &Node) -> Option<String> {
    match &node.cgnat {
        Some(cgnat) => Some(cgnat.tunnel_ip.clone()),
        None => node.public_ip.clone(),
    }
}

/// Multiaddrs of every Active DHT peer except `excluding`.
pub fn bootstrap_peers(nodes: &[Node], excluding: &str) -> Vec<String> {
    let mut peers: Vec<String> = nodes
        .iter()
        .filter(|n| {
            n.id != excluding
                && n.status == NodeStatus::Online
                && n.obligation(SystemVmRole::Dht)
                    .map(|o| o.status == ObligationStatus::Active)
                    .unwrap_or(false)
        })
        .filter_map(|n| {
            let peer_id = n.dht.as_ref()?.peer_id.as_ref()?;
            let ip = advertise_ip(n)?;
            Some(format!("/ip4/{ip}/tcp/{DHT_PORT}/p2p/{peer_id}"))
        })
        .collect();
    peers.sort();
    peers
}

/// Expected HMAC (hex) over `vmId:peerId` for a ready callback.
pub fn ready_signature(vm_id: &str, peer_id: &str, key: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
    mac.update(format!("{vm_id}:{peer_id}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a presented ready signature.
pub fn verify_ready_signature(vm_id: &str, peer_id: &str, key: &str, presented: &str) -> bool {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
    mac.update(format!("{vm_id}:{peer_id}").as_bytes());
    match hex::decode(presented) {
        Ok(bytes) => mac.verify_slice(&bytes).is_ok(),
        Err(_) => false,
    }
}

impl SysVmController {
    /// Deploy the DHT obligation on a node.
    pub async fn deploy_dht(&self, node_id: &str) -> Result<(), SysVmError> {
        let node = self
            .store
            .get_node(node_id)
            .ok_or_else(|| SysVmError::NodeNotFound(node_id.to_string()))?;

        // CGNAT nodes cannot host a reachable DHT until the mesh attaches
        // them; the reconcile loop retries after enrollment.
        let Some(advertise) = advertise_ip(&node) else {
            return Err(SysVmError::NoRelayAvailable(format!(
                "node '{node_id}' has no advertise address yet"
            )));
        };

        let peers = bootstrap_peers(&self.store.list_nodes(), node_id);
        let token = mint_callback_token();

        // The DHT VM's own mesh address derives from the host octet on
        // CGNAT nodes; public nodes bind the host address directly.
        let tunnel_ip = node
            .cgnat
            .as_ref()
            .and_then(|c| {
                let octet: u8 = c.tunnel_ip.rsplit('.').next()?.parse().ok()?;
                let subnet: u8 = c.tunnel_ip.split('.').nth(2)?.parse().ok()?;
                dht_tunnel_ip(subnet, octet)
            })
            .unwrap_or_else(|| advertise.clone());

        let arch = if node.hardware.architecture.is_empty() {
            "amd64"
        } else {
            node.hardware.architecture.as_str()
        };

        let vm = crate::lifecycle::vm::VirtualMachine::new(
            format!("dht-{}", node.name),
            "system",
            self.system_vm_spec(),
        )
        .with_type(VmType::Dht)
        .with_node(node.id.clone());

        let cloud_init = self
            .renderer
            .render_dht(
                &RenderContext {
                    vm_id: vm.id.clone(),
                    node_id: node.id.clone(),
                    region: node.region.clone(),
                    advertise_ip: advertise.clone(),
                    bootstrap_peers: peers,
                    tunnel_ip,
                    auth_token: token.clone(),
                    orchestrator_url: self.orchestrator_url.clone(),
                    ..Default::default()
                },
                arch,
            )
            .await?;

        let vm_id = self.create_system_vm(vm, cloud_init).await?;

        self.store
            .update_node(node_id, |n| {
                n.dht = Some(DhtInfo {
                    peer_id: None,
                    advertise_ip: Some(advertise.clone()),
                });
                if let Some(obligation) = n.obligation_mut(SystemVmRole::Dht) {
                    obligation.status = ObligationStatus::Initializing;
                    obligation.vm_id = Some(vm_id.clone());
                    obligation.auth_token = Some(token.clone());
                }
            })
            .await?;

        info!(node_id, vm_id, "DHT deployment submitted");
        Ok(())
    }

    /// A DHT VM posted its peer id. Verify the HMAC against the callback
    /// secret for that VM's obligation; a bad signature is a security
    /// event, never a retry.
    pub async fn handle_dht_ready(
        &self,
        vm_id: &str,
        peer_id: &str,
        signature: &str,
    ) -> Result<(), SysVmError> {
        let owner = self.store.list_nodes().into_iter().find(|n| {
            n.obligation(SystemVmRole::Dht)
                .map(|o| o.vm_id.as_deref() == Some(vm_id))
                .unwrap_or(false)
        });
        let Some(node) = owner else {
            self.reject_ready(vm_id, "dht ready for unknown VM");
            return Ok(());
        };

        let Some(key) = node
            .obligation(SystemVmRole::Dht)
            .and_then(|o| o.auth_token.clone())
        else {
            self.reject_ready(vm_id, "dht ready without a callback secret");
            return Ok(());
        };

        if !verify_ready_signature(vm_id, peer_id, &key, signature) {
            self.reject_ready(vm_id, "dht ready signature mismatch");
            return Ok(());
        }

        self.store
            .update_node(&node.id, |n| {
                if let Some(dht) = &mut n.dht {
                    dht.peer_id = Some(peer_id.to_string());
                }
                if let Some(obligation) = n.obligation_mut(SystemVmRole::Dht) {
                    obligation.status = ObligationStatus::Active;
                }
            })
            .await?;

        info!(node_id = %node.id, vm_id, peer_id, "DHT peer active");
        Ok(())
    }

    /// A relay VM reported in. The HMAC is keyed by the relay's WireGuard
    /// private key, which only the orchestrator and the relay VM hold.
    pub async fn handle_relay_ready(
        &self,
        node_id: &str,
        relay_vm_id: &str,
        signature: &str,
    ) -> Result<(), SysVmError> {
        let Some(node) = self.store.get_node(node_id) else {
            self.reject_ready(relay_vm_id, "relay ready for unknown node");
            return Ok(());
        };
        let Some(relay) = node.relay.as_ref() else {
            self.reject_ready(relay_vm_id, "relay ready for node without a relay");
            return Ok(());
        };
        if relay.relay_vm_id != relay_vm_id {
            self.reject_ready(relay_vm_id, "relay ready VM id mismatch");
            return Ok(());
        }

        let valid = hex::decode(signature)
            .ok()
            .map(|bytes| {
                let mut mac = HmacSha256::new_from_slice(relay.private_key.as_bytes())
                    .expect("HMAC accepts any key length");
                mac.update(format!("{node_id}:{relay_vm_id}").as_bytes());
                mac.verify_slice(&bytes).is_ok()
            })
            .unwrap_or(false);
        if !valid {
            self.reject_ready(relay_vm_id, "relay ready signature mismatch");
            return Ok(());
        }

        self.store
            .update_node(node_id, |n| {
                if let Some(r) = &mut n.relay {
                    r.status = crate::registry::node::RelayStatus::Active;
                }
                if let Some(obligation) = n.obligation_mut(SystemVmRole::Relay) {
                    obligation.status = ObligationStatus::Active;
                }
            })
            .await?;

        info!(node_id, relay_vm_id, "relay active");
        Ok(())
    }

    fn reject_ready(&self, subject: &str, detail: &str) {
        warn!(subject, detail, "ready callback refused");
        self.bus.publish(Event::SecurityAlert {
            subject: subject.to_string(),
            detail: detail.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::node::{CgnatInfo, TunnelStatus};
    use crate::sysvm::tests::{cgnat_node, controller_harness, public_node};

    fn binary_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("dht-amd64"), b"bin").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_deploy_dht_on_public_node() {
        let dir = binary_dir();
        let (controller, store, _) = controller_harness(dir.path().to_path_buf());
        store.save_node(public_node("n1")).await.unwrap();

        controller.deploy_dht("n1").await.unwrap();

        let node = store.get_node("n1").unwrap();
        let obligation = node.obligation(SystemVmRole::Dht).unwrap();
        assert_eq!(obligation.status, ObligationStatus::Initializing);
        assert!(obligation.auth_token.is_some());

        let vm = store.get_vm(obligation.vm_id.as_ref().unwrap()).unwrap();
        assert_eq!(vm.vm_type, VmType::Dht);
        assert_eq!(node.dht.unwrap().advertise_ip.as_deref(), Some("203.0.113.1"));
    }

    #[tokio::test]
    async fn test_deploy_dht_waits_for_mesh_on_cgnat() {
        let dir = binary_dir();
        let (controller, store, _) = controller_harness(dir.path().to_path_buf());
        store.save_node(cgnat_node("cg1")).await.unwrap();

        assert!(matches!(
            controller.deploy_dht("cg1").await,
            Err(SysVmError::NoRelayAvailable(_))
        ));

        // Once the mesh attaches the node, deployment proceeds with the
        // tunnel address.
        store
            .update_node("cg1", |n| {
                n.cgnat = Some(CgnatInfo {
                    assigned_relay_node_id: "relay".into(),
                    tunnel_ip: "10.20.3.7".into(),
                    wireguard_config: String::new(),
                    public_key: "pub".into(),
                    tunnel_status: TunnelStatus::Up,
                    last_handshake: None,
                });
            })
            .await
            .unwrap();

        controller.deploy_dht("cg1").await.unwrap();
        let node = store.get_node("cg1").unwrap();
        assert_eq!(node.dht.unwrap().advertise_ip.as_deref(), Some("10.20.3.7"));
    }

    #[tokio::test]
    async fn test_bootstrap_peers_only_active_known() {
        let mut ready = public_node("ready");
        ready.dht = Some(DhtInfo {
            peer_id: Some("QmReady".into()),
            advertise_ip: Some("203.0.113.1".into()),
        });
        ready
            .obligation_mut(SystemVmRole::Dht)
            .unwrap()
            .status = ObligationStatus::Active;

        let mut pending = public_node("pending");
        pending.dht = Some(DhtInfo {
            peer_id: None,
            advertise_ip: Some("203.0.113.2".into()),
        });

        let mut offline = public_node("offline");
        offline.status = NodeStatus::Offline;
        offline.dht = Some(DhtInfo {
            peer_id: Some("QmOffline".into()),
            advertise_ip: Some("203.0.113.3".into()),
        });
        offline
            .obligation_mut(SystemVmRole::Dht)
            .unwrap()
            .status = ObligationStatus::Active;

        let peers = bootstrap_peers(&[ready.clone(), pending, offline], "someone-else");
        assert_eq!(peers, vec!["/ip4/203.0.113.1/tcp/4001/p2p/QmReady".to_string()]);

        // A node never bootstraps from itself.
        let none = bootstrap_peers(&[ready], "ready");
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_dht_ready_happy_path() {
        let dir = binary_dir();
        let (controller, store, _) = controller_harness(dir.path().to_path_buf());
        store.save_node(public_node("n1")).await.unwrap();
        controller.deploy_dht("n1").await.unwrap();

        let node = store.get_node("n1").unwrap();
        let obligation = node.obligation(SystemVmRole::Dht).unwrap().clone();
        let vm_id = obligation.vm_id.unwrap();
        let key = obligation.auth_token.unwrap();

        let signature = ready_signature(&vm_id, "QmNewPeer", &key);
        controller
            .handle_dht_ready(&vm_id, "QmNewPeer", &signature)
            .await
            .unwrap();

        let node = store.get_node("n1").unwrap();
        assert_eq!(
            node.obligation(SystemVmRole::Dht).unwrap().status,
            ObligationStatus::Active
        );
        assert_eq!(node.dht.unwrap().peer_id.as_deref(), Some("QmNewPeer"));
    }

    #[tokio::test]
    async fn test_dht_ready_bad_signature_refused() {
        let dir = binary_dir();
        let (controller, store, _) = controller_harness(dir.path().to_path_buf());
        store.save_node(public_node("n1")).await.unwrap();
        controller.deploy_dht("n1").await.unwrap();

        let node = store.get_node("n1").unwrap();
        let vm_id = node
            .obligation(SystemVmRole::Dht)
            .unwrap()
            .vm_id
            .clone()
            .unwrap();

        controller
            .handle_dht_ready(&vm_id, "QmEvil", "deadbeef")
            .await
            .unwrap();

        let node = store.get_node("n1").unwrap();
        assert_eq!(
            node.obligation(SystemVmRole::Dht).unwrap().status,
            ObligationStatus::Initializing
        );
        assert!(node.dht.unwrap().peer_id.is_none());
    }

    #[tokio::test]
    async fn test_relay_ready_signature() {
        let dir = binary_dir();
        let (controller, store, _) = controller_harness(dir.path().to_path_buf());
        store.save_node(public_node("n1")).await.unwrap();
        controller.deploy_relay("n1").await.unwrap();

        let node = store.get_node("n1").unwrap();
        let relay = node.relay.clone().unwrap();

        let mut mac = HmacSha256::new_from_slice(relay.private_key.as_bytes()).unwrap();
        mac.update(format!("n1:{}", relay.relay_vm_id).as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        controller
            .handle_relay_ready("n1", &relay.relay_vm_id, &signature)
            .await
            .unwrap();

        let node = store.get_node("n1").unwrap();
        assert_eq!(node.relay.clone().unwrap().status, crate::registry::node::RelayStatus::Active);
        assert_eq!(
            node.obligation(SystemVmRole::Relay).unwrap().status,
            ObligationStatus::Active
        );
    }

    #[test]
    fn test_signature_roundtrip() {
        let sig = ready_signature("vm-1", "QmPeer", "secret");
        assert!(verify_ready_signature("vm-1", "QmPeer", "secret", &sig));
        assert!(!verify_ready_signature("vm-1", "QmPeer", "other", &sig));
        assert!(!verify_ready_signature("vm-2", "QmPeer", "secret", &sig));
        assert!(!verify_ready_signature("vm-1", "QmPeer", "secret", "zz-not-hex"));
    }
}
