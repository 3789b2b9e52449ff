//! Upload Worker
//!
//! Owns the retry queue and drains it against remote storage:
//! - one attempt at a time, so retries of a message are strictly sequential
//! - each attempt opens and closes its own storage session
//! - failures go back to the tail with exponential backoff
//! - after `max_attempts` failures a delivery is abandoned
//!
//! Every submitted message produces exactly one `DeliveryOutcome`, including
//! messages still queued when shutdown is requested.

mod queue;

pub use queue::{PendingDelivery, RetryQueue};

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::StorageError;
use crate::message::DeliveryMessage;
use crate::readiness::Readiness;
use crate::storage::RemoteStorage;

/// Terminal result for one delivery
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    Delivered {
        message: DeliveryMessage,
        attempts: u32,
        remote_path: String,
    },
    Abandoned {
        message: DeliveryMessage,
        attempts: u32,
        reason: String,
    },
}

impl DeliveryOutcome {
    pub fn message(&self) -> &DeliveryMessage {
        match self {
            Self::Delivered { message, .. } | Self::Abandoned { message, .. } => message,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Delivered { attempts, .. } | Self::Abandoned { attempts, .. } => *attempts,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// The worker is no longer accepting submissions
#[derive(Debug, Error)]
#[error("Upload worker has stopped")]
pub struct WorkerStopped(pub DeliveryMessage);

/// Submission side of the worker
#[derive(Clone)]
pub struct UploadWorkerHandle {
    tx: mpsc::UnboundedSender<DeliveryMessage>,
}

impl UploadWorkerHandle {
    /// Append a message to the retry queue
    pub fn submit(&self, message: DeliveryMessage) -> Result<(), WorkerStopped> {
        self.tx.send(message).map_err(|e| WorkerStopped(e.0))
    }

    pub fn is_stopped(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Drain loop state, owned by its task
pub struct UploadWorker {
    storage: Arc<dyn RemoteStorage>,
    remote_root: String,
    retry: RetryConfig,
    queue: RetryQueue,
    submissions: mpsc::UnboundedReceiver<DeliveryMessage>,
    outcomes: mpsc::UnboundedSender<DeliveryOutcome>,
    readiness: Readiness,
    shutdown: CancellationToken,
}

impl UploadWorker {
    /// Start the drain loop.
    ///
    /// Returns the submission handle, the outcome stream and the task handle.
    /// The loop exits when `shutdown` fires, or when every handle is dropped
    /// and the queue is empty. Connect failures are reported to `readiness`.
    pub fn spawn(
        storage: Arc<dyn RemoteStorage>,
        remote_root: impl Into<String>,
        retry: RetryConfig,
        readiness: Readiness,
        shutdown: CancellationToken,
    ) -> (
        UploadWorkerHandle,
        mpsc::UnboundedReceiver<DeliveryOutcome>,
        JoinHandle<()>,
    ) {
        let (tx, submissions) = mpsc::unbounded_channel();
        let (outcomes, outcome_rx) = mpsc::unbounded_channel();

        let worker = UploadWorker {
            storage,
            remote_root: remote_root.into(),
            retry,
            queue: RetryQueue::new(),
            submissions,
            outcomes,
            readiness,
            shutdown,
        };

        let task = tokio::spawn(worker.run());
        (UploadWorkerHandle { tx }, outcome_rx, task)
    }

    async fn run(mut self) {
        tracing::info!(
            target = %self.storage.describe(),
            max_attempts = self.retry.max_attempts,
            "Upload worker started"
        );

        let mut accepting = true;

        loop {
            while let Ok(message) = self.submissions.try_recv() {
                self.enqueue(message);
            }

            if self.shutdown.is_cancelled() {
                break;
            }

            if let Some(entry) = self.queue.pop_ready(Instant::now()) {
                self.process(entry).await;
                continue;
            }

            if !accepting && self.queue.is_empty() {
                break;
            }

            // Idle: wait for a submission, the next backoff deadline or shutdown
            let deadline = self.queue.next_ready_at();
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                message = self.submissions.recv(), if accepting => match message {
                    Some(message) => self.enqueue(message),
                    None => accepting = false,
                },
                _ = wait_until(deadline) => {}
            }
        }

        self.abandon_remaining("shutdown");
        tracing::info!("Upload worker stopped");
    }

    fn enqueue(&mut self, message: DeliveryMessage) {
        tracing::debug!(
            file = %message.file_name(),
            queued = self.queue.len() + 1,
            "Delivery queued"
        );
        self.queue.push(PendingDelivery::new(message, Instant::now()));
    }

    async fn process(&mut self, mut entry: PendingDelivery) {
        let remote_path = entry.message.remote_path(&self.remote_root);
        let attempt = entry.attempts + 1;

        match self.attempt_with_grace(&entry.message, &remote_path).await {
            Ok(()) => {
                tracing::info!(
                    remote_path = %remote_path,
                    attempt = attempt,
                    size = entry.message.content.len(),
                    "File delivered"
                );
                self.report(DeliveryOutcome::Delivered {
                    message: entry.message,
                    attempts: attempt,
                    remote_path,
                });
            }
            Err(e) => {
                entry.attempts = attempt;
                entry.last_error = Some(e.to_string());

                if attempt >= self.retry.max_attempts {
                    tracing::error!(
                        remote_path = %remote_path,
                        attempts = attempt,
                        error = %e,
                        "Giving up on delivery"
                    );
                    self.report(DeliveryOutcome::Abandoned {
                        message: entry.message,
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                    return;
                }

                let backoff = self.retry.backoff_for(attempt);
                tracing::warn!(
                    remote_path = %remote_path,
                    attempt = attempt,
                    retry_in_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Upload failed, requeued"
                );
                entry.ready_at = Instant::now() + backoff;
                self.queue.push(entry);
            }
        }
    }

    /// Run one attempt; if shutdown arrives mid-flight, let it finish within the grace period
    async fn attempt_with_grace(
        &self,
        message: &DeliveryMessage,
        remote_path: &str,
    ) -> Result<(), StorageError> {
        let timeout_secs = self.retry.attempt_timeout_secs;
        let attempt = timeout(self.retry.attempt_timeout(), self.attempt(message, remote_path));
        tokio::pin!(attempt);

        let result = tokio::select! {
            result = &mut attempt => result,
            _ = self.shutdown.cancelled() => {
                tracing::info!(
                    remote_path = %remote_path,
                    grace_secs = self.retry.shutdown_grace_secs,
                    "Shutdown requested during upload, waiting for attempt"
                );
                match timeout(self.retry.shutdown_grace(), &mut attempt).await {
                    Ok(result) => result,
                    Err(_) => {
                        return Err(StorageError::Upload {
                            path: remote_path.to_string(),
                            reason: "abandoned at shutdown".to_string(),
                        })
                    }
                }
            }
        };

        result.unwrap_or(Err(StorageError::Timeout(timeout_secs)))
    }

    async fn attempt(&self, message: &DeliveryMessage, remote_path: &str) -> Result<(), StorageError> {
        let mut session = match self.storage.connect().await {
            Ok(session) => {
                self.readiness.remote_connected();
                session
            }
            Err(e) => {
                self.readiness.remote_connect_failed(e.to_string());
                return Err(e);
            }
        };
        let uploaded = session.upload(&message.content, remote_path).await;

        if let Err(e) = session.close().await {
            tracing::debug!(error = %e, "Failed to close storage session");
        }

        uploaded
    }

    fn report(&self, outcome: DeliveryOutcome) {
        if self.outcomes.send(outcome).is_err() {
            tracing::warn!("Outcome receiver dropped; reservation will not be released");
        }
    }

    /// Report everything still queued or submitted as abandoned
    fn abandon_remaining(&mut self, reason: &str) {
        self.submissions.close();
        while let Ok(message) = self.submissions.try_recv() {
            self.queue.push(PendingDelivery::new(message, Instant::now()));
        }

        let remaining: Vec<PendingDelivery> = self.queue.drain().collect();
        if !remaining.is_empty() {
            tracing::warn!(count = remaining.len(), reason = %reason, "Abandoning queued deliveries");
        }

        for entry in remaining {
            let reason = match &entry.last_error {
                Some(error) => format!("{} (last error: {})", reason, error),
                None => reason.to_string(),
            };
            self.report(DeliveryOutcome::Abandoned {
                message: entry.message,
                attempts: entry.attempts,
                reason,
            });
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
