//! Tenant authentication
//!
//! Wallet-signature login with a freshness window, JWT access tokens,
//! opaque refresh tokens, and `dc_`-prefixed API keys. The signature
//! recovery itself is an external collaborator pinned behind
//! [`SignatureVerifier`]; the orchestrator only compares the recovered
//! address against the claim.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

use crate::config::AuthConfig;
use crate::events::{Event, EventBus};
use crate::store::Store;

/// API keys are issued as `dc_<base64url>`; the first 8 chars after the
/// prefix index the stored hash for lookup.
pub const API_KEY_PREFIX: &str = "dc_";
const API_KEY_LOOKUP_LEN: usize = 8;

/// Errors from the auth surface
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Login timestamp outside the allowed window")]
    StaleTimestamp,

    #[error("Signature does not match the claimed address")]
    SignatureMismatch,

    #[error("Signature recovery failed: {0}")]
    Recovery(String),

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("User '{0}' is suspended")]
    Suspended(String),

    #[error("Storage failure: {0}")]
    Store(#[from] crate::store::StoreError),
}

/// A tenant account, keyed by the normalized wallet address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Normalized wallet address
    pub id: String,

    #[serde(rename = "walletAddress")]
    pub wallet_address: String,

    pub suspended: bool,

    /// Running usage counters, adjusted by the lifecycle manager
    #[serde(default)]
    pub quota: UserQuota,

    /// Hashed refresh token, if a session is live
    #[serde(rename = "refreshTokenHash")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token_hash: Option<String>,

    #[serde(rename = "refreshExpiresAt")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_expires_at: Option<DateTime<Utc>>,

    /// Issued API keys (hashes only)
    #[serde(rename = "apiKeys")]
    #[serde(default)]
    pub api_keys: Vec<ApiKeyRecord>,

    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Per-user usage counters
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct UserQuota {
    #[serde(rename = "activeVms")]
    pub active_vms: u64,

    #[serde(rename = "reservedComputePoints")]
    pub reserved_compute_points: u64,
}

/// A stored API key: hash plus its 8-char lookup prefix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    /// First 8 chars of the key body, for lookup
    pub prefix: String,

    /// Hex SHA-256 of the full key
    pub hash: String,

    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// External wallet-signature collaborator.
///
/// Owns signature recovery and address canonicalization; the orchestrator
/// never touches curve math.
pub trait SignatureVerifier: Send + Sync {
    /// Recover the signing address from `message` and `signature`.
    fn recover_address(&self, message: &str, signature: &str) -> Result<String, AuthError>;

    /// Canonical (checksum-normalized) form of an address.
    fn normalize(&self, address: &str) -> String;
}

/// Development verifier: accepts signatures of the form `signed:<address>`.
///
/// Never deploy this; production wires the real recovery implementation.
pub struct InsecureDevVerifier;

impl SignatureVerifier for InsecureDevVerifier {
    fn recover_address(&self, _message: &str, signature: &str) -> Result<String, AuthError> {
        signature
            .strip_prefix("signed:")
            .map(String::from)
            .ok_or_else(|| AuthError::Recovery("malformed dev signature".into()))
    }

    fn normalize(&self, address: &str) -> String {
        address.to_lowercase()
    }
}

/// JWT claims for access tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// A successful login or refresh
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTokens {
    #[serde(rename = "accessToken")]
    pub access_token: String,

    #[serde(rename = "refreshToken")]
    pub refresh_token: String,

    #[serde(rename = "expiresInSecs")]
    pub expires_in_secs: i64,
}

/// Wallet login request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(rename = "walletAddress")]
    pub wallet_address: String,

    /// Unix seconds the message was signed at
    pub timestamp: i64,

    pub signature: String,
}

/// The auth service
#[derive(Clone)]
pub struct AuthService {
    store: Store,
    bus: EventBus,
    config: AuthConfig,
    verifier: std::sync::Arc<dyn SignatureVerifier>,
}

impl AuthService {
    pub fn new(
        store: Store,
        bus: EventBus,
        config: AuthConfig,
        verifier: std::sync::Arc<dyn SignatureVerifier>,
    ) -> Self {
        Self {
            store,
            bus,
            config,
            verifier,
        }
    }

    /// Wallet-signature login. Creates the user on first sight.
    pub async fn login(&self, request: &LoginRequest) -> Result<SessionTokens, AuthError> {
        let now = Utc::now().timestamp();
        if (now - request.timestamp).abs() > self.config.login_window_secs {
            self.security_alert(&request.wallet_address, "stale login timestamp");
            return Err(AuthError::StaleTimestamp);
        }

        let message = format!("decloud-login:{}:{}", request.wallet_address, request.timestamp);
        let recovered = self
            .verifier
            .recover_address(&message, &request.signature)
            .map_err(|e| {
                self.security_alert(&request.wallet_address, "signature recovery failed");
                e
            })?;

        if !recovered.eq_ignore_ascii_case(&request.wallet_address) {
            self.security_alert(&request.wallet_address, "signature address mismatch");
            return Err(AuthError::SignatureMismatch);
        }

        let user_id = self.verifier.normalize(&request.wallet_address);
        let mut user = match self.store.get_user(&user_id) {
            Some(u) => u,
            None => User {
                id: user_id.clone(),
                wallet_address: request.wallet_address.clone(),
                suspended: false,
                quota: UserQuota::default(),
                refresh_token_hash: None,
                refresh_expires_at: None,
                api_keys: Vec::new(),
                created_at: Utc::now(),
            },
        };

        if user.suspended {
            return Err(AuthError::Suspended(user.id));
        }

        let tokens = self.issue_session(&mut user)?;
        self.store.save_user(user).await?;
        Ok(tokens)
    }

    /// Exchange a live refresh token for a new session.
    pub async fn refresh(&self, refresh_token: &str) -> Result<SessionTokens, AuthError> {
        let hash = sha256_hex(refresh_token);
        let mut user = self
            .store
            .list_users()
            .into_iter()
            .find(|u| u.refresh_token_hash.as_deref() == Some(hash.as_str()))
            .ok_or(AuthError::InvalidToken)?;

        match user.refresh_expires_at {
            Some(at) if at > Utc::now() => {}
            _ => return Err(AuthError::InvalidToken),
        }
        if user.suspended {
            return Err(AuthError::Suspended(user.id));
        }

        let tokens = self.issue_session(&mut user)?;
        self.store.save_user(user).await?;
        Ok(tokens)
    }

    fn issue_session(&self, user: &mut User) -> Result<SessionTokens, AuthError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user.id.clone(),
            iat: now.timestamp(),
            exp: (now + Duration::seconds(self.config.access_token_ttl_secs)).timestamp(),
        };
        let access_token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.config.jwt_secret.as_bytes()),
        )
        .map_err(|_| AuthError::InvalidToken)?;

        let refresh_token = random_token();
        user.refresh_token_hash = Some(sha256_hex(&refresh_token));
        user.refresh_expires_at =
            Some(now + Duration::seconds(self.config.refresh_token_ttl_secs));

        Ok(SessionTokens {
            access_token,
            refresh_token,
            expires_in_secs: self.config.access_token_ttl_secs,
        })
    }

    /// Validate a bearer JWT and return the user id.
    pub fn validate_access_token(&self, token: &str) -> Result<String, AuthError> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.config.jwt_secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| AuthError::InvalidToken)?;
        Ok(data.claims.sub)
    }

    /// Mint an API key for a user. The raw key is returned exactly once.
    pub async fn mint_api_key(&self, user_id: &str) -> Result<String, AuthError> {
        let body = random_token();
        let raw = format!("{API_KEY_PREFIX}{body}");
        let record = ApiKeyRecord {
            prefix: body.chars().take(API_KEY_LOOKUP_LEN).collect(),
            hash: sha256_hex(&raw),
            created_at: Utc::now(),
        };

        let updated = self
            .store
            .update_user(user_id, |user| user.api_keys.push(record))
            .await?;
        if updated.is_none() {
            return Err(AuthError::InvalidToken);
        }
        Ok(raw)
    }

    /// Resolve an API key to its user id.
    pub fn validate_api_key(&self, raw: &str) -> Result<String, AuthError> {
        let body = raw.strip_prefix(API_KEY_PREFIX).ok_or(AuthError::InvalidApiKey)?;
        let prefix: String = body.chars().take(API_KEY_LOOKUP_LEN).collect();
        let hash = sha256_hex(raw);

        for user in self.store.list_users() {
            if user
                .api_keys
                .iter()
                .any(|k| k.prefix == prefix && k.hash == hash)
            {
                if user.suspended {
                    return Err(AuthError::Suspended(user.id));
                }
                return Ok(user.id);
            }
        }
        Err(AuthError::InvalidApiKey)
    }

    fn security_alert(&self, subject: &str, detail: &str) {
        warn!(subject, detail, "authentication refused");
        self.bus.publish(Event::SecurityAlert {
            subject: subject.to_string(),
            detail: detail.to_string(),
        });
    }
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn service() -> AuthService {
        AuthService::new(
            Store::in_memory(),
            EventBus::new(),
            AuthConfig::default(),
            Arc::new(InsecureDevVerifier),
        )
    }

    fn login_request(wallet: &str) -> LoginRequest {
        LoginRequest {
            wallet_address: wallet.to_string(),
            timestamp: Utc::now().timestamp(),
            signature: format!("signed:{wallet}"),
        }
    }

    #[tokio::test]
    async fn test_login_creates_user_and_session() {
        let auth = service();
        let tokens = auth.login(&login_request("0xAbC123")).await.unwrap();

        let user_id = auth.validate_access_token(&tokens.access_token).unwrap();
        assert_eq!(user_id, "0xabc123");
        assert!(auth.store.get_user("0xabc123").is_some());
    }

    #[tokio::test]
    async fn test_stale_timestamp_rejected() {
        let auth = service();
        let mut request = login_request("0xabc");
        request.timestamp = Utc::now().timestamp() - 3600;
        assert!(matches!(
            auth.login(&request).await,
            Err(AuthError::StaleTimestamp)
        ));
    }

    #[tokio::test]
    async fn test_signature_mismatch_rejected() {
        let auth = service();
        let mut request = login_request("0xabc");
        request.signature = "signed:0xother".into();
        assert!(matches!(
            auth.login(&request).await,
            Err(AuthError::SignatureMismatch)
        ));
    }

    #[tokio::test]
    async fn test_refresh_rotates_session() {
        let auth = service();
        let first = auth.login(&login_request("0xabc")).await.unwrap();
        let second = auth.refresh(&first.refresh_token).await.unwrap();

        assert_ne!(first.refresh_token, second.refresh_token);
        // The old refresh token is rotated out.
        assert!(auth.refresh(&first.refresh_token).await.is_err());
    }

    #[tokio::test]
    async fn test_api_key_roundtrip() {
        let auth = service();
        auth.login(&login_request("0xabc")).await.unwrap();

        let key = auth.mint_api_key("0xabc").await.unwrap();
        assert!(key.starts_with(API_KEY_PREFIX));
        assert_eq!(auth.validate_api_key(&key).unwrap(), "0xabc");
        assert!(auth.validate_api_key("dc_bogus").is_err());
    }

    #[tokio::test]
    async fn test_suspended_user_refused() {
        let auth = service();
        auth.login(&login_request("0xabc")).await.unwrap();
        auth.store
            .update_user("0xabc", |u| u.suspended = true)
            .await
            .unwrap();

        assert!(matches!(
            auth.login(&login_request("0xabc")).await,
            Err(AuthError::Suspended(_))
        ));
    }
}
