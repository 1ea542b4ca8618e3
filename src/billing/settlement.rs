//! On-chain settlement driver
//!
//! Pending usage records group into batches by `(userWallet, nodeWallet)`.
//! Every settlement cycle, batches over the minimum amount are chunked to
//! respect gas limits, each chunk is submitted through the chain client,
//! and the contained records are marked settled with the transaction hash.
//! Chunk failures are isolated; the rest of the cycle continues.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::BillingConfig;
use crate::events::{Event, EventBus};
use crate::store::Store;

use super::usage::{SettlementBatch, UsageRecord};

/// Pause between chunk submissions, to stay under RPC rate limits
const INTER_CHUNK_SPACING: Duration = Duration::from_secs(3);

/// The blockchain settlement collaborator.
#[async_trait]
pub trait SettlementClient: Send + Sync {
    /// Record usage against the tenant's escrow balance. `Ok(false)` means
    /// the balance could not cover it and billing should pause.
    async fn record_usage(&self, record: &UsageRecord) -> Result<bool, String>;

    /// Submit one chunk of records on-chain. Returns the transaction hash.
    async fn submit_batch(
        &self,
        user_wallet: &str,
        node_wallet: &str,
        records: &[UsageRecord],
        node_fee_share: f64,
    ) -> Result<String, String>;
}

/// Stand-in chain client that approves every charge and fabricates local
/// tx hashes. Deployments wire the real RPC client here.
pub struct LoggingSettlementClient;

#[async_trait]
impl SettlementClient for LoggingSettlementClient {
    async fn record_usage(&self, record: &UsageRecord) -> Result<bool, String> {
        info!(
            vm_id = %record.vm_id,
            amount = record.amount_usdc,
            "usage recorded (logging client)"
        );
        Ok(true)
    }

    async fn submit_batch(
        &self,
        user_wallet: &str,
        node_wallet: &str,
        records: &[UsageRecord],
        _node_fee_share: f64,
    ) -> Result<String, String> {
        info!(user_wallet, node_wallet, count = records.len(), "batch submitted (logging client)");
        Ok(format!("0xlocal{}", uuid::Uuid::new_v4().simple()))
    }
}

/// The external attestation service consulted before metering.
#[async_trait]
pub trait AttestationClient: Send + Sync {
    async fn check(&self, vm_id: &str) -> AttestationStatus;
}

/// Attestation verdict for one VM
#[derive(Debug, Clone, Copy)]
pub struct AttestationStatus {
    /// The attestation agent vouched for this interval
    pub verified: bool,

    /// Billing is administratively paused for attestation failure
    pub billing_paused: bool,
}

/// Stand-in attestation client that vouches for everything.
pub struct AlwaysVerifiedAttestation;

#[async_trait]
impl AttestationClient for AlwaysVerifiedAttestation {
    async fn check(&self, _vm_id: &str) -> AttestationStatus {
        AttestationStatus {
            verified: true,
            billing_paused: false,
        }
    }
}

/// Drives the hourly settlement cycle.
#[derive(Clone)]
pub struct SettlementDriver {
    store: Store,
    bus: EventBus,
    config: BillingConfig,
    client: Arc<dyn SettlementClient>,
}

impl SettlementDriver {
    pub fn new(
        store: Store,
        bus: EventBus,
        config: BillingConfig,
        client: Arc<dyn SettlementClient>,
    ) -> Self {
        Self {
            store,
            bus,
            config,
            client,
        }
    }

    /// Group unsettled usage into per-(user, node) batches over the
    /// minimum amount, deterministically ordered.
    pub fn pending_batches(&self) -> Vec<SettlementBatch> {
        let mut grouped: BTreeMap<(String, String), Vec<UsageRecord>> = BTreeMap::new();
        for record in self.store.list_unsettled_usage() {
            grouped
                .entry((record.user_id.clone(), record.node_wallet.clone()))
                .or_default()
                .push(record);
        }

        grouped
            .into_iter()
            .map(|((user_wallet, node_wallet), mut records)| {
                records.sort_by(|a, b| a.period_end.cmp(&b.period_end));
                SettlementBatch {
                    user_wallet,
                    node_wallet,
                    records,
                    node_fee_share: self.config.node_fee_share,
                }
            })
            .filter(|batch| batch.total_usdc() >= self.config.min_settlement_amount)
            .collect()
    }

    /// One settlement cycle: submit every due batch in gas-sized chunks.
    pub async fn run_cycle(&self) {
        let batches = self.pending_batches();
        if batches.is_empty() {
            return;
        }
        info!(batches = batches.len(), "settlement cycle starting");

        let mut first_chunk = true;
        for batch in batches {
            for chunk in batch.records.chunks(self.config.max_settlements_per_batch) {
                if !first_chunk {
                    tokio::time::sleep(INTER_CHUNK_SPACING).await;
                }
                first_chunk = false;

                let result = self
                    .client
                    .submit_batch(
                        &batch.user_wallet,
                        &batch.node_wallet,
                        chunk,
                        batch.node_fee_share,
                    )
                    .await;

                match result {
                    Ok(tx_hash) => {
                        for record in chunk {
                            let mut settled = record.clone();
                            settled.settled = true;
                            settled.settlement_tx_hash = Some(tx_hash.clone());
                            if let Err(e) = self.store.save_usage_record(settled).await {
                                warn!(record_id = %record.id, error = %e, "settled mark failed");
                            }
                        }
                        self.bus.publish(Event::SettlementSubmitted {
                            tx_hash,
                            record_count: chunk.len(),
                        });
                    }
                    Err(reason) => {
                        // Isolated: the chunk stays unsettled and retries
                        // next cycle.
                        warn!(
                            user_wallet = %batch.user_wallet,
                            node_wallet = %batch.node_wallet,
                            reason,
                            "chunk submission failed"
                        );
                    }
                }
            }
        }
    }
}

/// Spawn the periodic settlement driver.
pub fn spawn_settlement_driver(
    driver: SettlementDriver,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        info!(interval_secs, "settlement driver started");
        loop {
            tokio::select! {
                _ = ticker.tick() => driver.run_cycle().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("settlement driver shutting down");
                        break;
                    }
                }
            }
        }
    })
}
