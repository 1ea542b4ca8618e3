//! In-process event bus with a durable append-only log
//!
//! Components publish [`Event`]s to a broadcast channel; the metering
//! pipeline and notification surfaces subscribe. A spawned logger task
//! appends every event as one JSON line to `events.log` so the stream
//! survives restarts for audit and replay.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::lifecycle::vm::VmStatus;
use crate::lifecycle::TransitionTrigger;

/// Buffered events before slow subscribers start lagging
const BUS_CAPACITY: usize = 1024;

/// A control-plane event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    NodeRegistered {
        node_id: String,
        wallet_address: String,
    },
    NodeOffline {
        node_id: String,
    },
    NodeRecovered {
        node_id: String,
    },
    VmTransitioned {
        vm_id: String,
        node_id: Option<String>,
        from: VmStatus,
        to: VmStatus,
        trigger: TransitionTrigger,
    },
    VmRecovered {
        vm_id: String,
        node_id: String,
    },
    VmError {
        vm_id: String,
        message: String,
    },
    SecurityAlert {
        subject: String,
        detail: String,
    },
    UsageRecorded {
        usage_record_id: String,
        vm_id: String,
        amount_usdc: f64,
    },
    SettlementSubmitted {
        tx_hash: String,
        record_count: usize,
    },
    RelayFailover {
        old_relay_node_id: String,
        reassigned: usize,
        abandoned: usize,
    },
}

/// An event with its envelope, as written to the durable log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,

    #[serde(rename = "occurredAt")]
    pub occurred_at: DateTime<Utc>,

    #[serde(flatten)]
    pub event: Event,
}

/// Broadcast bus handed to every component
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventRecord>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Never blocks; events are dropped only when no
    /// subscriber exists, which is fine (the durable logger is one).
    pub fn publish(&self, event: Event) {
        let record = EventRecord {
            id: uuid::Uuid::new_v4().to_string(),
            occurred_at: Utc::now(),
            event,
        };
        debug!(event = ?record.event, "event published");
        let _ = self.tx.send(record);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the durable event logger.
///
/// Consumes the bus and appends every record to `{data_dir}/events.log` as
/// one JSON line. Lagged receivers skip ahead with a warning rather than
/// back-pressuring publishers.
pub fn spawn_event_logger(
    bus: &EventBus,
    data_dir: PathBuf,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();

    tokio::spawn(async move {
        let path = data_dir.join("events.log");
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(path = %path.display(), error = %e, "cannot create event log directory");
                return;
            }
        }

        let mut file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot open event log");
                return;
            }
        };

        info!(path = %path.display(), "event logger started");

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(record) => {
                        let line = match serde_json::to_string(&record) {
                            Ok(l) => l,
                            Err(e) => {
                                warn!(error = %e, "unserializable event record");
                                continue;
                            }
                        };
                        if let Err(e) = file.write_all(format!("{line}\n").as_bytes()).await {
                            warn!(error = %e, "event log write failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "event logger lagged, records lost from the log");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("event logger shutting down");
                        let _ = file.flush().await;
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

    #[tokio::test]
    async fn test_publish_subscribe_roundtrip() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(Event::NodeOffline {
            node_id: "n1".into(),
        });

        let record = rx.recv().await.unwrap();
        assert!(matches!(record.event, Event::NodeOffline { ref node_id } if node_id == "n1"));
        assert!(!record.id.is_empty());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        // No receiver; must not panic or block.
        bus.publish(Event::NodeRecovered {
            node_id: "n1".into(),
        });
    }

    #[tokio::test]
    async fn test_event_logger_writes_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = spawn_event_logger(&bus, dir.path().to_path_buf(), shutdown_rx);
        // Give the logger a beat to open the file and subscribe races are
        // avoided because subscribe() happens before spawn returns.
        bus.publish(Event::SecurityAlert {
            subject: "login".into(),
            detail: "stale timestamp".into(),
        });

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let content = std::fs::read_to_string(dir.path().join("events.log")).unwrap();
        let line = content.lines().next().unwrap();
        let parsed: EventRecord = serde_json::from_str(line).unwrap();
        assert!(matches!(parsed.event, Event::SecurityAlert { .. }));
    }

    #[test]
    fn test_event_serializes_tagged() {
        let event = Event::VmError {
            vm_id: "vm-1".into(),
            message: "Node offline".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"vmError\""));
    }
}
