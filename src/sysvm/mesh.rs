//! WireGuard mesh primitives - keypairs, subnets, tunnel addressing
//!
//! The overlay mesh lives in 10.20.0.0/16. Each relay owns one /24 within
//! it (third octet 1..=254) and sits at host .254; CGNAT nodes attached to
//! that relay take hosts .2 and up. Key generation shells out to the
//! WireGuard CLI, pinned behind [`KeyForge`] so a library implementation
//! can replace the subprocess later.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

/// The overlay network every mesh participant lives in
pub const MESH_CIDR: &str = "10.20.0.0/16";

/// UDP port relays listen on
pub const WIREGUARD_PORT: u16 = 51820;

/// Relays sit at this host octet within their subnet
pub const RELAY_HOST_OCTET: u8 = 254;

/// First and last host octets assignable to CGNAT nodes
pub const FIRST_CGNAT_OCTET: u8 = 2;
pub const LAST_CGNAT_OCTET: u8 = 253;

/// DHT VM addresses derive as `200 + hostOctet`, so a CGNAT host that must
/// also carry a DHT VM cannot sit above this octet.
pub const LAST_DHT_CAPABLE_OCTET: u8 = 53;

/// Errors from mesh allocation and key generation
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("All /24 subnets in {MESH_CIDR} are allocated")]
    SubnetExhausted,

    #[error("No free host address in subnet 10.20.{0}.0/24")]
    HostsExhausted(u8),

    #[error("WireGuard tooling unavailable: {0}")]
    ToolMissing(String),

    #[error("WireGuard key generation failed: {0}")]
    KeyGeneration(String),
}

/// A WireGuard keypair, base64-encoded as the tools emit them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireGuardKeypair {
    #[serde(rename = "privateKey")]
    pub private_key: String,

    #[serde(rename = "publicKey")]
    pub public_key: String,
}

/// Key generation collaborator. Production shells out to `wg`; tests use
/// a deterministic fake.
#[async_trait]
pub trait KeyForge: Send + Sync {
    async fn generate_keypair(&self) -> Result<WireGuardKeypair, MeshError>;
}

/// `wg genkey` / `wg pubkey` via subprocess.
pub struct WgTool;

#[async_trait]
impl KeyForge for WgTool {
    async fn generate_keypair(&self) -> Result<WireGuardKeypair, MeshError> {
        let genkey = Command::new("wg")
            .arg("genkey")
            .output()
            .await
            .map_err(|e| MeshError::ToolMissing(e.to_string()))?;
        if !genkey.status.success() {
            return Err(MeshError::KeyGeneration(
                String::from_utf8_lossy(&genkey.stderr).into_owned(),
            ));
        }
        let private_key = String::from_utf8_lossy(&genkey.stdout).trim().to_string();

        let mut pubkey_cmd = Command::new("wg")
            .arg("pubkey")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| MeshError::ToolMissing(e.to_string()))?;
        {
            use tokio::io::AsyncWriteExt;
            let stdin = pubkey_cmd
                .stdin
                .as_mut()
                .ok_or_else(|| MeshError::KeyGeneration("no stdin for wg pubkey".into()))?;
            stdin
                .write_all(private_key.as_bytes())
                .await
                .map_err(|e| MeshError::KeyGeneration(e.to_string()))?;
        }
        let pubkey = pubkey_cmd
            .wait_with_output()
            .await
            .map_err(|e| MeshError::KeyGeneration(e.to_string()))?;
        if !pubkey.status.success() {
            return Err(MeshError::KeyGeneration(
                String::from_utf8_lossy(&pubkey.stderr).into_owned(),
            ));
        }

        Ok(WireGuardKeypair {
            private_key,
            public_key: String::from_utf8_lossy(&pubkey.stdout).trim().to_string(),
        })
    }
}

/// Deterministic keypairs for tests.
pub struct FakeKeyForge;

#[async_trait]
impl KeyForge for FakeKeyForge {
    async fn generate_keypair(&self) -> Result<WireGuardKeypair, MeshError> {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        Ok(WireGuardKeypair {
            private_key: format!("priv-{nonce}"),
            public_key: format!("pub-{nonce}"),
        })
    }
}

/// The relay's own tunnel address within its subnet.
pub fn relay_tunnel_ip(subnet: u8) -> String {
    format!("10.20.{subnet}.{RELAY_HOST_OCTET}")
}

/// Tunnel address for a CGNAT host octet within a relay subnet.
pub fn cgnat_tunnel_ip(subnet: u8, host_octet: u8) -> String {
    format!("10.20.{subnet}.{host_octet}")
}

/// The address a CGNAT node's DHT VM derives from its host octet.
pub fn dht_tunnel_ip(subnet: u8, host_octet: u8) -> Option<String> {
    (host_octet <= LAST_DHT_CAPABLE_OCTET)
        .then(|| format!("10.20.{subnet}.{}", 200 + host_octet as u16))
}

/// First /24 third-octet not in `used`, 1..=254.
pub fn allocate_subnet(used: &[u8]) -> Result<u8, MeshError> {
    (1..=254)
        .find(|s| !used.contains(s))
        .ok_or(MeshError::SubnetExhausted)
}

/// First free host octet for a CGNAT node. Nodes that also owe a DHT VM
/// (all of them today) are confined to the DHT-derivable range.
pub fn allocate_host_octet(subnet: u8, used: &[u8], needs_dht_ip: bool) -> Result<u8, MeshError> {
    let last = if needs_dht_ip {
        LAST_DHT_CAPABLE_OCTET
    } else {
        LAST_CGNAT_OCTET
    };
    (FIRST_CGNAT_OCTET..=last)
        .find(|o| !used.contains(o))
        .ok_or(MeshError::HostsExhausted(subnet))
}

/// Render the client-side WireGuard config handed to a CGNAT node agent.
pub fn render_cgnat_config(
    private_key: &str,
    tunnel_ip: &str,
    relay_public_key: &str,
    relay_endpoint: &str,
) -> String {
    format!(
        "[Interface]\n\
         PrivateKey = {private_key}\n\
         Address = {tunnel_ip}/16\n\
         \n\
         [Peer]\n\
         PublicKey = {relay_public_key}\n\
         Endpoint = {relay_endpoint}\n\
         AllowedIPs = {MESH_CIDR}\n\
         PersistentKeepalive = 25\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subnet_allocation_skips_used() {
        assert_eq!(allocate_subnet(&[]).unwrap(), 1);
        assert_eq!(allocate_subnet(&[1, 2, 3]).unwrap(), 4);
        let all: Vec<u8> = (1..=254).collect();
        assert!(matches!(allocate_subnet(&all), Err(MeshError::SubnetExhausted)));
    }

    #[test]
    fn test_host_octet_allocation() {
        assert_eq!(allocate_host_octet(7, &[], false).unwrap(), 2);
        assert_eq!(allocate_host_octet(7, &[2, 3], false).unwrap(), 4);
    }

    #[test]
    fn test_dht_octet_cap() {
        let used: Vec<u8> = (2..=53).collect();
        // DHT-capable range exhausted even though the /24 has room.
        assert!(matches!(
            allocate_host_octet(7, &used, true),
            Err(MeshError::HostsExhausted(7))
        ));
        assert_eq!(allocate_host_octet(7, &used, false).unwrap(), 54);
    }

    #[test]
    fn test_tunnel_addressing() {
        assert_eq!(relay_tunnel_ip(7), "10.20.7.254");
        assert_eq!(cgnat_tunnel_ip(7, 12), "10.20.7.12");
        assert_eq!(dht_tunnel_ip(7, 12).unwrap(), "10.20.7.212");
        assert!(dht_tunnel_ip(7, 54).is_none());
    }

    #[test]
    fn test_cgnat_config_rendering() {
        let config = render_cgnat_config("privkey", "10.20.7.12", "relaypub", "203.0.113.4:51820");
        assert!(config.contains("PrivateKey = privkey"));
        assert!(config.contains("Address = 10.20.7.12/16"));
        assert!(config.contains("AllowedIPs = 10.20.0.0/16"));
        assert!(config.contains("Endpoint = 203.0.113.4:51820"));
    }

    #[tokio::test]
    async fn test_fake_forge_unique_keys() {
        let forge = FakeKeyForge;
        let a = forge.generate_keypair().await.unwrap();
        let b = forge.generate_keypair().await.unwrap();
        assert_ne!(a.private_key, b.private_key);
        assert!(a.public_key.starts_with("pub-"));
    }
}
