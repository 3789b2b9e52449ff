//! Queue consumer
//!
//! Pulls delivery messages off the broker and hands them to the upload
//! worker. A message is acknowledged as soon as the worker has it; the
//! worker's retry queue, not broker redelivery, drives upload retries.
//!
//! Per message: `Received -> Decoded -> Queued -> Delivered | Abandoned`.
//! When the worker reports a terminal outcome the content hash is released.
//!
//! Messages can reach the queue without a live reservation, e.g. when they
//! were published before a restart. The relay reserves on their behalf and
//! keeps its own record of hashes handed to the worker, so at most one
//! delivery per content is in the worker at any time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, Consumer, Delivery};
use crate::error::BrokerError;
use crate::hash_store::HashStore;
use crate::message::DeliveryMessage;
use crate::readiness::Readiness;
use crate::worker::{DeliveryOutcome, UploadWorkerHandle};

/// Pause before consuming again after a broker error
const CONSUME_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Relay counters
#[derive(Debug, Default)]
pub struct RelayStats {
    received: AtomicU64,
    handed_off: AtomicU64,
    decode_failures: AtomicU64,
    duplicates_dropped: AtomicU64,
    delivered: AtomicU64,
    abandoned: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatsSnapshot {
    pub received: u64,
    pub handed_off: u64,
    pub decode_failures: u64,
    pub duplicates_dropped: u64,
    pub delivered: u64,
    pub abandoned: u64,
}

impl RelayStats {
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            handed_off: self.handed_off.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

/// What the consume loop does after a message
enum Flow {
    Continue,
    Stop,
}

/// Consumer side of the pipeline
pub struct Relay {
    hash_store: HashStore,
    /// Hashes currently held by the worker
    handed_off: HashStore,
    broker: Arc<dyn Broker>,
    queue: String,
    worker: UploadWorkerHandle,
    readiness: Readiness,
    stats: Arc<RelayStats>,
}

impl Relay {
    pub fn new(
        hash_store: HashStore,
        broker: Arc<dyn Broker>,
        queue: impl Into<String>,
        worker: UploadWorkerHandle,
        readiness: Readiness,
    ) -> Self {
        Self {
            hash_store,
            handed_off: HashStore::new(),
            broker,
            queue: queue.into(),
            worker,
            readiness,
            stats: Arc::new(RelayStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        self.stats.clone()
    }

    /// Consume until `shutdown` fires or the broker closes.
    ///
    /// Returns after every outcome the worker reports has been settled, so
    /// the worker task should be stopping by then (same token). Readiness
    /// reports the relay stopped on every exit path.
    pub async fn run(
        self,
        outcomes: mpsc::UnboundedReceiver<DeliveryOutcome>,
        shutdown: CancellationToken,
    ) -> Result<(), BrokerError> {
        let mut consumer = match self.start_consuming().await {
            Ok(consumer) => consumer,
            Err(e) => {
                self.readiness.broker_down(e.to_string());
                self.readiness
                    .relay_stopped(format!("failed to start consuming: {}", e));
                return Err(e);
            }
        };

        let settler = tokio::spawn(settle_outcomes(
            outcomes,
            self.hash_store.clone(),
            self.handed_off.clone(),
            self.stats.clone(),
        ));

        self.readiness.broker_up();
        self.readiness.relay_running();
        tracing::info!(queue = %self.queue, "Relay consuming");

        let stop_reason = loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break "shutdown".to_string(),
                next = consumer.next() => next,
            };

            match next {
                Ok(Some(delivery)) => {
                    self.readiness.broker_up();
                    if let Flow::Stop = self.handle(consumer.as_mut(), delivery).await {
                        break "upload worker stopped".to_string();
                    }
                }
                Ok(None) => {
                    tracing::info!(queue = %self.queue, "Broker closed, relay stopping");
                    self.readiness.broker_down("broker connection closed");
                    break "broker connection closed".to_string();
                }
                Err(e) => {
                    tracing::error!(queue = %self.queue, error = %e, "Failed to receive message");
                    self.readiness.broker_down(e.to_string());
                    tokio::select! {
                        _ = shutdown.cancelled() => break "shutdown".to_string(),
                        _ = tokio::time::sleep(CONSUME_ERROR_BACKOFF) => {}
                    }
                }
            }
        };

        self.readiness.relay_stopped(stop_reason);

        if let Err(e) = consumer.close().await {
            tracing::warn!(error = %e, "Failed to close consumer");
        }

        // Drop our submission handle so the worker can wind down once idle
        drop(self.worker);

        if let Err(e) = settler.await {
            tracing::error!(error = %e, "Outcome settler panicked");
        }

        tracing::info!(queue = %self.queue, "Relay stopped");
        Ok(())
    }

    async fn start_consuming(&self) -> Result<Box<dyn Consumer>, BrokerError> {
        self.broker.declare_queue(&self.queue).await?;
        self.broker.consume(&self.queue).await
    }

    async fn handle(&self, consumer: &mut dyn Consumer, delivery: Delivery) -> Flow {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let tag = delivery.tag;

        let message = match DeliveryMessage::decode(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                self.drop_malformed(&delivery, &e);
                if let Err(e) = consumer.ack(tag).await {
                    tracing::error!(tag = tag, error = %e, "Failed to acknowledge malformed message");
                }
                return Flow::Continue;
            }
        };

        if delivery.redelivered {
            tracing::debug!(tag = tag, file = %message.file_name(), "Handling redelivered message");
        }

        let hash = message.content_hash();
        if !self.handed_off.reserve(&hash) {
            // The same content is already with the worker; its outcome releases the hash
            self.stats.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                tag = tag,
                hash = %hash.short(),
                file = %message.file_name(),
                "Dropping duplicate of a delivery in progress"
            );
            if let Err(e) = consumer.ack(tag).await {
                tracing::error!(tag = tag, error = %e, "Failed to acknowledge duplicate message");
            }
            return Flow::Continue;
        }

        // No reservation means the message predates this process
        let reserved_here = self.hash_store.reserve(&hash);
        if reserved_here {
            tracing::info!(
                tag = tag,
                hash = %hash.short(),
                "Reserved hash for message without a live reservation"
            );
        }

        match self.worker.submit(message) {
            Ok(()) => {
                self.stats.handed_off.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = consumer.ack(tag).await {
                    tracing::error!(tag = tag, error = %e, "Failed to acknowledge message");
                }
                Flow::Continue
            }
            Err(stopped) => {
                self.handed_off.release(&hash);
                if reserved_here {
                    self.hash_store.release(&hash);
                }
                tracing::warn!(
                    tag = tag,
                    file = %stopped.0.file_name(),
                    "Upload worker stopped, returning message to queue"
                );
                if let Err(e) = consumer.nack(tag, true).await {
                    tracing::error!(tag = tag, error = %e, "Failed to requeue message");
                }
                Flow::Stop
            }
        }
    }

    /// Malformed payloads are never retried. If the content is still readable
    /// its reservation is released as abandoned.
    fn drop_malformed(&self, delivery: &Delivery, error: &crate::error::DecodeError) {
        self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);

        match DeliveryMessage::salvage_hash(&delivery.body) {
            Some(hash) if self.handed_off.contains(&hash) => {
                tracing::error!(
                    tag = delivery.tag,
                    hash = %hash.short(),
                    error = %error,
                    "Dropping malformed message, same content is being delivered"
                );
            }
            Some(hash) => {
                let released = self.hash_store.release(&hash);
                self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    tag = delivery.tag,
                    hash = %hash.short(),
                    released = released,
                    error = %error,
                    "Dropping malformed message"
                );
            }
            None => {
                tracing::error!(
                    tag = delivery.tag,
                    size = delivery.body.len(),
                    error = %error,
                    "Dropping malformed message, no content hash recoverable"
                );
            }
        }
    }
}

/// Release reservations as deliveries reach a terminal state
async fn settle_outcomes(
    mut outcomes: mpsc::UnboundedReceiver<DeliveryOutcome>,
    hash_store: HashStore,
    handed_off: HashStore,
    stats: Arc<RelayStats>,
) {
    while let Some(outcome) = outcomes.recv().await {
        let hash = outcome.message().content_hash();
        let released = hash_store.release(&hash);
        handed_off.release(&hash);

        match &outcome {
            DeliveryOutcome::Delivered { remote_path, .. } => {
                stats.delivered.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(hash = %hash.short(), remote_path = %remote_path, "Delivery settled");
            }
            DeliveryOutcome::Abandoned { reason, attempts, .. } => {
                stats.abandoned.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    hash = %hash.short(),
                    attempts = attempts,
                    reason = %reason,
                    "Delivery abandoned"
                );
            }
        }

        if !released {
            tracing::warn!(hash = %hash.short(), "No reservation held for settled delivery");
        }
    }
}
