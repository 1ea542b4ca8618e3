//! Event-driven metering pipeline
//!
//! A bounded billing queue feeds a single consumer. Producers are the
//! periodic metering timer (every Running VM), VM stop events from the
//! event bus, and manual or balance-added triggers. The consumer applies
//! the gates in order - Running check, system-VM exemption, attestation,
//! minimum period, minimum cost - then records usage through the
//! settlement client, pausing billing when the tenant's balance cannot
//! cover the charge.

pub mod settlement;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::{BillingConfig, TierPolicy};
use crate::events::{Event, EventBus};
use crate::lifecycle::vm::{VmSpec, VmStatus};
use crate::store::Store;

use settlement::{AttestationClient, SettlementClient};
use usage::UsageRecord;

/// Billing queue capacity; producers block when the consumer falls behind
const QUEUE_CAPACITY: usize = 1000;

/// Intervals shorter than this are not billed (except on stop)
const MIN_BILLABLE_SECS: i64 = 60;

/// Charges below this are not billed
const MIN_BILLABLE_USDC: f64 = 0.01;

/// Why a VM landed on the billing queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeteringTrigger {
    Periodic,
    VmStop,
    Manual,
    BalanceAdded,
}

/// One unit of metering work
#[derive(Debug, Clone)]
pub struct BillingEvent {
    pub vm_id: String,
    pub trigger: MeteringTrigger,
}

/// The hourly rate a spec is sold at under a tier policy.
pub fn hourly_rate_for(spec: &VmSpec, policy: &TierPolicy, config: &BillingConfig) -> f64 {
    spec.compute_point_cost as f64 * config.point_hour_usdc * policy.price_multiplier
}

/// The metering pipeline: producers push [`BillingEvent`]s, one consumer
/// drains them.
#[derive(Clone)]
pub struct MeteringPipeline {
    store: Store,
    bus: EventBus,
    config: BillingConfig,
    settlement: Arc<dyn SettlementClient>,
    attestation: Arc<dyn AttestationClient>,
    tx: mpsc::Sender<BillingEvent>,
}

impl MeteringPipeline {
    pub fn new(
        store: Store,
        bus: EventBus,
        config: BillingConfig,
        settlement: Arc<dyn SettlementClient>,
        attestation: Arc<dyn AttestationClient>,
    ) -> (Self, mpsc::Receiver<BillingEvent>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        (
            Self {
                store,
                bus,
                config,
                settlement,
                attestation,
                tx,
            },
            rx,
        )
    }

    /// Enqueue a metering event, blocking when the queue is full.
    pub async fn enqueue(&self, vm_id: &str, trigger: MeteringTrigger) {
        let event = BillingEvent {
            vm_id: vm_id.to_string(),
            trigger,
        };
        if self.tx.send(event).await.is_err() {
            warn!(vm_id, "billing queue closed, event dropped");
        }
    }

    /// One producer tick: every Running general VM gets a periodic event.
    pub async fn produce_periodic(&self) {
        for vm in self.store.list_vms_by_status(VmStatus::Running) {
            if vm.vm_type.is_system() {
                continue;
            }
            self.enqueue(&vm.id, MeteringTrigger::Periodic).await;
        }
    }

    /// Process one billing event through all gates.
    pub async fn process_event(&self, event: &BillingEvent) {
        let Some(vm) = self.store.get_vm(&event.vm_id) else {
            return;
        };
        let is_stop = event.trigger == MeteringTrigger::VmStop;

        if vm.status != VmStatus::Running && !is_stop {
            return;
        }
        if vm.vm_type.is_system() {
            return;
        }

        // Balance pause holds until a stop (final interval) or an explicit
        // balance-added resume.
        if vm.billing.paused && !is_stop && event.trigger != MeteringTrigger::BalanceAdded {
            debug!(vm_id = %vm.id, reason = ?vm.billing.pause_reason, "billing paused, skipping");
            return;
        }

        let attestation = self.attestation.check(&vm.id).await;
        if attestation.billing_paused && !is_stop {
            info!(vm_id = %vm.id, "attestation pause, skipping billing cycle");
            return;
        }

        let now = Utc::now();
        let anchor = vm
            .billing
            .last_billing_at
            .or(vm.billing.current_period_start)
            .or(vm.started_at);
        let Some(period_start) = anchor else {
            // Never started: open the accrual period and wait.
            let _ = self
                .store
                .update_vm(&vm.id, |vm| vm.billing.current_period_start = Some(now))
                .await;
            return;
        };

        let period_secs = (now - period_start).num_seconds();
        if period_secs < MIN_BILLABLE_SECS && !is_stop {
            return;
        }

        let hours = period_secs.max(0) as f64 / 3600.0;
        let cost = vm.billing.hourly_rate * hours;
        if cost < MIN_BILLABLE_USDC {
            return;
        }

        let node = vm.node_id.as_deref().and_then(|id| self.store.get_node(id));
        let (node_id, node_wallet) = match node {
            Some(n) => (n.id, n.wallet_address),
            None => {
                warn!(vm_id = %vm.id, "billable VM has no node, skipping");
                return;
            }
        };

        let record = UsageRecord::new(
            vm.owner_id.clone(),
            vm.id.clone(),
            node_id,
            node_wallet,
            cost,
            period_start,
            now,
            attestation.verified,
        );

        match self.settlement.record_usage(&record).await {
            Ok(true) => {
                let record_id = record.id.clone();
                if let Err(e) = self.store.save_usage_record(record).await {
                    warn!(vm_id = %vm.id, error = %e, "usage record save failed");
                    return;
                }
                let _ = self
                    .store
                    .update_vm(&vm.id, |vm| {
                        vm.billing.last_billing_at = Some(now);
                        vm.billing.current_period_start = Some(now);
                        vm.billing.total_billed += cost;
                        if event.trigger == MeteringTrigger::BalanceAdded {
                            vm.billing.paused = false;
                            vm.billing.pause_reason = None;
                        }
                    })
                    .await;
                self.bus.publish(Event::UsageRecorded {
                    usage_record_id: record_id,
                    vm_id: vm.id.clone(),
                    amount_usdc: cost,
                });
            }
            Ok(false) => {
                info!(vm_id = %vm.id, cost, "insufficient balance, pausing billing");
                let _ = self
                    .store
                    .update_vm(&vm.id, |vm| {
                        vm.billing.paused = true;
                        vm.billing.pause_reason = Some("Insufficient balance".to_string());
                    })
                    .await;
            }
            Err(reason) => {
                // Transient transport: retried on the next tick.
                warn!(vm_id = %vm.id, reason, "usage recording failed, will retry");
            }
        }
    }
}

/// Spawn the periodic producer timer.
pub fn spawn_metering_producer(
    pipeline: MeteringPipeline,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let interval_secs = pipeline.config.metering_interval_secs;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        info!(interval_secs, "metering producer started");
        loop {
            tokio::select! {
                _ = ticker.tick() => pipeline.produce_periodic().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("metering producer shutting down");
                        break;
                    }
                }
            }
        }
    })
}

/// Spawn the stop-event listener: every transition out of Running becomes
/// a final-interval metering event.
pub fn spawn_stop_listener(
    pipeline: MeteringPipeline,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let mut rx = pipeline.bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(record) => {
                        if let Event::VmTransitioned { vm_id, from, to, .. } = record.event {
                            if from == VmStatus::Running && to != VmStatus::Running {
                                pipeline.enqueue(&vm_id, MeteringTrigger::VmStop).await;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "stop listener lagged, events missed");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("stop listener shutting down");
                        break;
                    }
                }
            }
        }
    })
}

/// Spawn the single queue consumer.
pub fn spawn_metering_consumer(
    pipeline: MeteringPipeline,
    mut rx: mpsc::Receiver<BillingEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!("metering consumer started");
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => pipeline.process_event(&event).await,
                    None => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("metering consumer shutting down");
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::vm::{QualityTier, VirtualMachine, VmType};
    use crate::registry::node::{NatClass, Node, NodeStatus};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use super::settlement::tests::FakeChain;
    use super::settlement::AttestationStatus;

    struct TogglableAttestation {
        paused: std::sync::Mutex<bool>,
    }

    #[async_trait]
    impl AttestationClient for TogglableAttestation {
        async fn check(&self, _vm_id: &str) -> AttestationStatus {
            AttestationStatus {
                verified: true,
                billing_paused: *self.paused.lock().unwrap(),
            }
        }
    }

    async fn harness(
        paused: bool,
    ) -> (MeteringPipeline, Store, Arc<FakeChain>, Arc<TogglableAttestation>) {
        let store = Store::in_memory();
        let chain = Arc::new(FakeChain::default());
        let attestation = Arc::new(TogglableAttestation {
            paused: std::sync::Mutex::new(paused),
        });
        let (pipeline, _rx) = MeteringPipeline::new(
            store.clone(),
            EventBus::new(),
            BillingConfig::default(),
            chain.clone(),
            attestation.clone(),
        );
        (pipeline, store, chain, attestation)
    }

    async fn running_vm(store: &Store, hours_ago: i64) -> String {
        let node = Node {
            id: "node-1".into(),
            wallet_address: "0xnode".into(),
            name: "node-1".into(),
            region: "eu".into(),
            zone: "a".into(),
            status: NodeStatus::Online,
            public_ip: Some("203.0.113.4".into()),
            agent_port: 8080,
            nat: NatClass::None,
            hardware: Default::default(),
            resources: Default::default(),
            evaluation: None,
            obligations: vec![],
            dht: None,
            relay: None,
            cgnat: None,
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
        };
        store.save_node(node).await.unwrap();

        let mut vm = VirtualMachine::new(
            "web",
            "0xuser",
            VmSpec {
                vcpus: 2,
                memory_bytes: 2 << 30,
                disk_bytes: 20 << 30,
                tier: QualityTier::Balanced,
                gpu_required: false,
                bandwidth_tier: Default::default(),
                template_id: None,
                region_hint: None,
                zone_hint: None,
                compute_point_cost: 2,
            },
        );
        vm.node_id = Some("node-1".into());
        vm.status = VmStatus::Running;
        vm.started_at = Some(Utc::now() - ChronoDuration::hours(hours_ago));
        vm.billing.hourly_rate = 0.10;
        let id = vm.id.clone();
        store.save_vm(vm).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_periodic_billing_records_usage() {
        let (pipeline, store, _, _) = harness(false).await;
        let vm_id = running_vm(&store, 2).await;

        pipeline
            .process_event(&BillingEvent {
                vm_id: vm_id.clone(),
                trigger: MeteringTrigger::Periodic,
            })
            .await;

        let records = store.list_usage_records();
        assert_eq!(records.len(), 1);
        // Two hours at 0.10/h.
        assert!((records[0].amount_usdc - 0.20).abs() < 0.001);
        assert!(records[0].attestation_verified);

        let vm = store.get_vm(&vm_id).unwrap();
        assert!(vm.billing.last_billing_at.is_some());
        assert!((vm.billing.total_billed - 0.20).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_attestation_pause_skips_periodic_but_not_stop() {
        let (pipeline, store, _, attestation) = harness(true).await;
        let vm_id = running_vm(&store, 2).await;

        pipeline
            .process_event(&BillingEvent {
                vm_id: vm_id.clone(),
                trigger: MeteringTrigger::Periodic,
            })
            .await;
        assert!(store.list_usage_records().is_empty());

        // The stop trigger still records the final interval.
        pipeline
            .process_event(&BillingEvent {
                vm_id: vm_id.clone(),
                trigger: MeteringTrigger::VmStop,
            })
            .await;
        assert_eq!(store.list_usage_records().len(), 1);
        drop(attestation);
    }

    #[tokio::test]
    async fn test_short_period_skipped_unless_stop() {
        let (pipeline, store, _, _) = harness(false).await;
        let vm_id = running_vm(&store, 0).await;
        // Anchor 30 seconds ago.
        store
            .update_vm(&vm_id, |vm| {
                vm.billing.last_billing_at = Some(Utc::now() - ChronoDuration::seconds(30));
            })
            .await
            .unwrap();

        pipeline
            .process_event(&BillingEvent {
                vm_id: vm_id.clone(),
                trigger: MeteringTrigger::Periodic,
            })
            .await;
        assert!(store.list_usage_records().is_empty());
    }

    #[tokio::test]
    async fn test_tiny_cost_skipped() {
        let (pipeline, store, _, _) = harness(false).await;
        let vm_id = running_vm(&store, 2).await;
        store
            .update_vm(&vm_id, |vm| vm.billing.hourly_rate = 0.001)
            .await
            .unwrap();

        pipeline
            .process_event(&BillingEvent {
                vm_id,
                trigger: MeteringTrigger::Periodic,
            })
            .await;
        assert!(store.list_usage_records().is_empty());
    }

    #[tokio::test]
    async fn test_system_vm_never_billed() {
        let (pipeline, store, _, _) = harness(false).await;
        let vm_id = running_vm(&store, 2).await;
        store
            .update_vm(&vm_id, |vm| vm.vm_type = VmType::Relay)
            .await
            .unwrap();

        pipeline
            .process_event(&BillingEvent {
                vm_id,
                trigger: MeteringTrigger::Periodic,
            })
            .await;
        assert!(store.list_usage_records().is_empty());
    }

    #[tokio::test]
    async fn test_insufficient_balance_pauses_billing() {
        let (pipeline, store, chain, _) = harness(false).await;
        let vm_id = running_vm(&store, 2).await;
        *chain.deny_usage.lock().unwrap() = true;

        pipeline
            .process_event(&BillingEvent {
                vm_id: vm_id.clone(),
                trigger: MeteringTrigger::Periodic,
            })
            .await;

        let vm = store.get_vm(&vm_id).unwrap();
        assert!(vm.billing.paused);
        assert_eq!(vm.billing.pause_reason.as_deref(), Some("Insufficient balance"));
        assert!(store.list_usage_records().is_empty());

        // Paused VMs skip further periodic cycles.
        *chain.deny_usage.lock().unwrap() = false;
        pipeline
            .process_event(&BillingEvent {
                vm_id: vm_id.clone(),
                trigger: MeteringTrigger::Periodic,
            })
            .await;
        assert!(store.list_usage_records().is_empty());

        // Balance top-up resumes and clears the pause.
        pipeline
            .process_event(&BillingEvent {
                vm_id: vm_id.clone(),
                trigger: MeteringTrigger::BalanceAdded,
            })
            .await;
        let vm = store.get_vm(&vm_id).unwrap();
        assert!(!vm.billing.paused);
        assert_eq!(store.list_usage_records().len(), 1);
    }

    #[tokio::test]
    async fn test_hourly_rate_from_tier() {
        let config = BillingConfig::default();
        let policy = crate::config::OrchestratorConfig::default()
            .tier_policy(QualityTier::Guaranteed);
        let spec = VmSpec {
            vcpus: 4,
            memory_bytes: 1,
            disk_bytes: 1,
            tier: QualityTier::Guaranteed,
            gpu_required: false,
            bandwidth_tier: Default::default(),
            template_id: None,
            region_hint: None,
            zone_hint: None,
            compute_point_cost: 4,
        };
        // 4 points * 0.02 * 2.0 multiplier.
        assert!((hourly_rate_for(&spec, &policy, &config) - 0.16).abs() < 1e-9);
    }
}
