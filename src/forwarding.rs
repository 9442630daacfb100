use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio::time::{self, Duration};
use tracing::{debug, warn};

use crate::backend::SystemOfRecord;
use crate::protocol::Message;

/// Direction of message flow relative to the gateway.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Direction {
    /// Message received from a charge point
    Inbound,
    /// Message sent to a charge point
    Outbound,
}

/// One envelope as shipped to the system of record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRecord {
    pub identity: String,
    pub direction: Direction,
    /// `Call`, `CallResult` or `CallError`
    pub message_type: String,
    pub message_id: String,
    /// For replies, the action of the Call being answered when known
    pub action: Option<String>,
    pub payload: Value,
    pub raw_envelope: String,
    pub received_at: DateTime<Utc>,
}

impl ForwardRecord {
    pub fn new(
        identity: &str,
        direction: Direction,
        msg: &Message,
        action: Option<&str>,
        raw_envelope: impl Into<String>,
    ) -> Self {
        Self {
            identity: identity.to_string(),
            direction,
            message_type: msg.type_id().as_str().to_string(),
            message_id: msg.message_id().to_string(),
            action: msg.action().or(action).map(str::to_string),
            payload: msg.payload().clone(),
            raw_envelope: raw_envelope.into(),
            received_at: Utc::now(),
        }
    }
}

/// Tuning for the forwarding pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardingConfig {
    /// Records buffered before `submit` starts rejecting
    pub queue_capacity: usize,
    /// Deliveries allowed in flight at once
    pub max_in_flight: usize,
    /// Upper bound on a single delivery attempt (milliseconds)
    pub delivery_timeout_ms: u64,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            max_in_flight: 16,
            delivery_timeout_ms: 5_000,
        }
    }
}

impl ForwardingConfig {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

/// Result of handing a record to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// Queue full; the newest record was dropped
    QueueFull,
    /// The pipeline is no longer running
    Closed,
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ForwardingStats {
    pub accepted: u64,
    pub rejected: u64,
    pub delivered: u64,
    pub failed: u64,
}

/// Best-effort, bounded, non-blocking relay to the system of record.
///
/// `submit` never awaits. Records wait in a bounded channel; a dispatcher
/// task hands each one to a delivery task once a concurrency permit is
/// free. Each record gets one attempt; failures are logged and dropped.
#[derive(Clone)]
pub struct ForwardingPipeline {
    tx: mpsc::Sender<ForwardRecord>,
    counters: Arc<Counters>,
}

impl ForwardingPipeline {
    pub fn spawn(cfg: ForwardingConfig, sink: Arc<dyn SystemOfRecord>) -> Self {
        let (tx, mut rx) = mpsc::channel::<ForwardRecord>(cfg.queue_capacity.max(1));
        let counters = Arc::new(Counters::default());
        let limiter = Arc::new(Semaphore::new(cfg.max_in_flight.max(1)));
        let delivery_timeout = cfg.delivery_timeout();

        tokio::spawn({
            let counters = Arc::clone(&counters);
            async move {
                while let Some(record) = rx.recv().await {
                    let permit = match Arc::clone(&limiter).acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => break,
                    };
                    let sink = Arc::clone(&sink);
                    let counters = Arc::clone(&counters);
                    tokio::spawn(async move {
                        let _permit = permit;
                        match time::timeout(delivery_timeout, sink.deliver(&record)).await {
                            Ok(Ok(())) => {
                                counters.delivered.fetch_add(1, Ordering::Relaxed);
                                debug!(identity = %record.identity, message_id = %record.message_id, "forwarded");
                            }
                            Ok(Err(e)) => {
                                counters.failed.fetch_add(1, Ordering::Relaxed);
                                warn!(identity = %record.identity, message_id = %record.message_id, error = %e, "delivery failed, dropping record");
                            }
                            Err(_) => {
                                counters.failed.fetch_add(1, Ordering::Relaxed);
                                warn!(identity = %record.identity, message_id = %record.message_id, timeout_ms = delivery_timeout.as_millis() as u64, "delivery timed out, dropping record");
                            }
                        }
                    });
                }
                debug!("forwarding dispatcher stopped");
            }
        });

        Self { tx, counters }
    }

    pub fn submit(&self, record: ForwardRecord) -> SubmitOutcome {
        match self.tx.try_send(record) {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                SubmitOutcome::Accepted
            }
            Err(TrySendError::Full(record)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(identity = %record.identity, message_id = %record.message_id, "forwarding queue full, dropping record");
                SubmitOutcome::QueueFull
            }
            Err(TrySendError::Closed(record)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(identity = %record.identity, message_id = %record.message_id, "forwarding pipeline closed");
                SubmitOutcome::Closed
            }
        }
    }

    pub fn stats(&self) -> ForwardingStats {
        ForwardingStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}
