//! Cloud-init rendering for system-VM roles
//!
//! Each role has a string template with `{{TOKEN}}` substitution markers.
//! The DHT template additionally embeds a base64 copy of the DHT binary
//! chosen by guest architecture; binary file reads are serialized by a
//! mutex and cached, so concurrent deployments read the file once.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine;
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors from cloud-init rendering. A missing binary is a configuration
/// failure: the deployment fails loudly rather than booting a hollow VM.
#[derive(Error, Debug)]
pub enum CloudInitError {
    #[error("DHT binary for architecture '{0}' not found at {1}")]
    BinaryMissing(String, PathBuf),

    #[error("DHT binary read failed: {0}")]
    BinaryRead(#[from] std::io::Error),

    #[error("Unsupported guest architecture '{0}'")]
    UnsupportedArch(String),
}

/// Substitution values for a render
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    pub vm_id: String,
    pub node_id: String,
    pub region: String,
    pub advertise_ip: String,
    pub bootstrap_peers: Vec<String>,
    pub tunnel_ip: String,
    pub wireguard_private_key: String,
    pub relay_subnet: u8,
    pub auth_token: String,
    pub orchestrator_url: String,
}

const RELAY_TEMPLATE: &str = r#"#cloud-config
hostname: relay-{{NODE_ID}}
write_files:
  - path: /etc/wireguard/wg0.conf
    permissions: "0600"
    content: |
      [Interface]
      PrivateKey = {{WIREGUARD_PRIVATE_KEY}}
      Address = {{TUNNEL_IP}}/16
      ListenPort = 51820
  - path: /etc/decloud/relay.env
    content: |
      VM_ID={{VM_ID}}
      NODE_ID={{NODE_ID}}
      REGION={{REGION}}
      RELAY_SUBNET={{RELAY_SUBNET}}
      AUTH_TOKEN={{AUTH_TOKEN}}
      ORCHESTRATOR_URL={{ORCHESTRATOR_URL}}
runcmd:
  - systemctl enable --now wg-quick@wg0
  - systemctl enable --now decloud-relay
"#;

const DHT_TEMPLATE: &str = r#"#cloud-config
hostname: dht-{{NODE_ID}}
write_files:
  - path: /opt/decloud/dht.b64
    content: {{DHT_BINARY_B64}}
  - path: /etc/decloud/dht.env
    content: |
      VM_ID={{VM_ID}}
      NODE_ID={{NODE_ID}}
      REGION={{REGION}}
      ADVERTISE_IP={{ADVERTISE_IP}}
      BOOTSTRAP_PEERS={{BOOTSTRAP_PEERS}}
      AUTH_TOKEN={{AUTH_TOKEN}}
      ORCHESTRATOR_URL={{ORCHESTRATOR_URL}}
runcmd:
  - base64 -d /opt/decloud/dht.b64 > /opt/decloud/dht
  - chmod +x /opt/decloud/dht
  - systemctl enable --now decloud-dht
"#;

/// Renders role payloads, caching architecture binaries.
#[derive(Clone)]
pub struct CloudInitRenderer {
    binary_dir: PathBuf,

    /// Serializes binary file reads and caches the encoded result
    binary_cache: Arc<Mutex<HashMap<String, String>>>,
}

impl CloudInitRenderer {
    pub fn new(binary_dir: PathBuf) -> Self {
        Self {
            binary_dir,
            binary_cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Render the relay role payload.
    pub fn render_relay(&self, ctx: &RenderContext) -> String {
        substitute(RELAY_TEMPLATE, ctx, None)
    }

    /// Render the DHT role payload for a guest architecture (`amd64` or
    /// `arm64`).
    pub async fn render_dht(&self, ctx: &RenderContext, arch: &str) -> Result<String, CloudInitError> {
        if arch != "amd64" && arch != "arm64" {
            return Err(CloudInitError::UnsupportedArch(arch.to_string()));
        }
        let binary = self.dht_binary_base64(arch).await?;
        Ok(substitute(DHT_TEMPLATE, ctx, Some(&binary)))
    }

    /// Base64 of the DHT binary for an architecture, read once under the
    /// cache lock.
    async fn dht_binary_base64(&self, arch: &str) -> Result<String, CloudInitError> {
        let mut cache = self.binary_cache.lock().await;
        if let Some(encoded) = cache.get(arch) {
            return Ok(encoded.clone());
        }

        let path = self.binary_dir.join(format!("dht-{arch}"));
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CloudInitError::BinaryMissing(arch.to_string(), path));
            }
            Err(e) => return Err(e.into()),
        };

        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        cache.insert(arch.to_string(), encoded.clone());
        Ok(encoded)
    }
}

fn substitute(template: &str, ctx: &RenderContext, dht_binary: Option<&str>) -> String {
    let mut out = template
        .replace("{{VM_ID}}", &ctx.vm_id)
        .replace("{{NODE_ID}}", &ctx.node_id)
        .replace("{{REGION}}", &ctx.region)
        .replace("{{ADVERTISE_IP}}", &ctx.advertise_ip)
        .replace("{{BOOTSTRAP_PEERS}}", &ctx.bootstrap_peers.join(","))
        .replace("{{TUNNEL_IP}}", &ctx.tunnel_ip)
        .replace("{{WIREGUARD_PRIVATE_KEY}}", &ctx.wireguard_private_key)
        .replace("{{RELAY_SUBNET}}", &ctx.relay_subnet.to_string())
        .replace("{{AUTH_TOKEN}}", &ctx.auth_token)
        .replace("{{ORCHESTRATOR_URL}}", &ctx.orchestrator_url);
    if let Some(binary) = dht_binary {
        out = out.replace("{{DHT_BINARY_B64}}", binary);
    }
    out
}
