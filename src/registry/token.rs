//! Node auth tokens
//!
//! Tokens are 32 cryptographically random bytes, handed to the node exactly
//! once at registration as base64. Only the SHA-256 hash is persisted.
//! Validation is a constant-time hash comparison; rotation replaces the
//! record, so a rotated-out token can never validate again.

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Raw token length in bytes before base64 encoding
const TOKEN_BYTES: usize = 32;

/// Persisted token record, keyed by node id (one live token per node)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    #[serde(rename = "nodeId")]
    pub node_id: String,

    /// Hex-encoded SHA-256 of the raw token
    #[serde(rename = "tokenHash")]
    pub token_hash: String,

    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,

    #[serde(rename = "expiresAt")]
    pub expires_at: DateTime<Utc>,

    #[serde(rename = "lastUsedAt")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,

    #[serde(rename = "isRevoked")]
    pub is_revoked: bool,
}

impl TokenRecord {
    /// Mint a fresh token for a node. Returns the record to persist and the
    /// raw token, which is returned to the node exactly once.
    pub fn mint(node_id: impl Into<String>, lifetime_days: i64) -> (TokenRecord, String) {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        use base64::Engine;
        let raw = base64::engine::general_purpose::STANDARD.encode(bytes);

        let now = Utc::now();
        let record = TokenRecord {
            node_id: node_id.into(),
            token_hash: hash_token(&raw),
            created_at: now,
            expires_at: now + Duration::days(lifetime_days),
            last_used_at: None,
            is_revoked: false,
        };
        (record, raw)
    }

    /// Whether `presented` matches this record and the record is still live.
    pub fn validates(&self, presented: &str) -> bool {
        if self.is_revoked || Utc::now() >= self.expires_at {
            return false;
        }
        constant_time_eq(hash_token(presented).as_bytes(), self.token_hash.as_bytes())
    }

    /// Whether the token expires within `warning_days`.
    pub fn expiring_within(&self, warning_days: i64) -> bool {
        Utc::now() + Duration::days(warning_days) >= self.expires_at
    }
}

/// Hex-encoded SHA-256 of a raw token.
pub fn hash_token(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

/// Byte-wise constant-time equality. Both inputs here are fixed-length hex
/// digests, so length itself leaks nothing.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_and_validate() {
        let (record, raw) = TokenRecord::mint("node-1", 90);
        assert!(record.validates(&raw));
        assert!(!record.validates("not-the-token"));
        assert!(!record.is_revoked);
    }

    #[test]
    fn test_rotation_invalidates_old_token() {
        let (_old_record, old_raw) = TokenRecord::mint("node-1", 90);
        let (new_record, new_raw) = TokenRecord::mint("node-1", 90);

        // The store keeps only the newest record per node.
        assert!(!new_record.validates(&old_raw));
        assert!(new_record.validates(&new_raw));
    }

    #[test]
    fn test_revoked_token_rejected() {
        let (mut record, raw) = TokenRecord::mint("node-1", 90);
        record.is_revoked = true;
        assert!(!record.validates(&raw));
    }

    #[test]
    fn test_expired_token_rejected() {
        let (mut record, raw) = TokenRecord::mint("node-1", 90);
        record.expires_at = Utc::now() - Duration::hours(1);
        assert!(!record.validates(&raw));
    }

    #[test]
    fn test_expiry_warning_window() {
        let (mut record, _) = TokenRecord::mint("node-1", 90);
        assert!(!record.expiring_within(7));

        record.expires_at = Utc::now() + Duration::days(3);
        assert!(record.expiring_within(7));
    }

    #[test]
    fn test_tokens_are_unique() {
        let (_, a) = TokenRecord::mint("node-1", 90);
        let (_, b) = TokenRecord::mint("node-1", 90);
        assert_ne!(a, b);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
