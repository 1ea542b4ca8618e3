//! Usage records and settlement batches

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One metered billing interval for one VM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: String,

    #[serde(rename = "userId")]
    pub user_id: String,

    #[serde(rename = "vmId")]
    pub vm_id: String,

    /// Hosting node; its wallet receives the node share
    #[serde(rename = "nodeId")]
    pub node_id: String,

    #[serde(rename = "nodeWallet")]
    pub node_wallet: String,

    #[serde(rename = "amountUsdc")]
    pub amount_usdc: f64,

    #[serde(rename = "periodStart")]
    pub period_start: DateTime<Utc>,

    #[serde(rename = "periodEnd")]
    pub period_end: DateTime<Utc>,

    /// Whether the attestation service vouched for this interval
    #[serde(rename = "attestationVerified")]
    pub attestation_verified: bool,

    pub settled: bool,

    #[serde(rename = "settlementTxHash")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement_tx_hash: Option<String>,

    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl UsageRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: impl Into<String>,
        vm_id: impl Into<String>,
        node_id: impl Into<String>,
        node_wallet: impl Into<String>,
        amount_usdc: f64,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        attestation_verified: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            vm_id: vm_id.into(),
            node_id: node_id.into(),
            node_wallet: node_wallet.into(),
            amount_usdc,
            period_start,
            period_end,
            attestation_verified,
            settled: false,
            settlement_tx_hash: None,
            created_at: Utc::now(),
        }
    }
}

/// Pending usage grouped by payer and payee, submitted together on-chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementBatch {
    /// Paying tenant wallet (user id)
    #[serde(rename = "userWallet")]
    pub user_wallet: String,

    /// Receiving node wallet
    #[serde(rename = "nodeWallet")]
    pub node_wallet: String,

    pub records: Vec<UsageRecord>,

    /// Fraction of the total paid to the node; the rest is the platform fee
    #[serde(rename = "nodeFeeShare")]
    pub node_fee_share: f64,
}

impl SettlementBatch {
    pub fn total_usdc(&self) -> f64 {
        self.records.iter().map(|r| r.amount_usdc).sum()
    }

    pub fn node_amount_usdc(&self) -> f64 {
        self.total_usdc() * self.node_fee_share
    }

    pub fn platform_amount_usdc(&self) -> f64 {
        self.total_usdc() * (1.0 - self.node_fee_share)
    }
}
