//! Retry queue
//!
//! FIFO of deliveries waiting for an upload attempt. Entries that failed are
//! appended at the tail with a backoff deadline; an entry still backing off
//! never blocks later entries that are ready.

use std::collections::VecDeque;

use tokio::time::Instant;

use crate::message::DeliveryMessage;

/// A delivery waiting for its next attempt
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    pub message: DeliveryMessage,
    /// Failed attempts so far
    pub attempts: u32,
    /// Earliest time the next attempt may start
    pub ready_at: Instant,
    pub last_error: Option<String>,
}

impl PendingDelivery {
    pub fn new(message: DeliveryMessage, now: Instant) -> Self {
        Self {
            message,
            attempts: 0,
            ready_at: now,
            last_error: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct RetryQueue {
    entries: VecDeque<PendingDelivery>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append at the tail
    pub fn push(&mut self, entry: PendingDelivery) {
        self.entries.push_back(entry);
    }

    /// Remove the first entry, in queue order, whose backoff has elapsed
    pub fn pop_ready(&mut self, now: Instant) -> Option<PendingDelivery> {
        let index = self.entries.iter().position(|e| e.ready_at <= now)?;
        self.entries.remove(index)
    }

    /// Earliest deadline among waiting entries
    pub fn next_ready_at(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.ready_at).min()
    }

    /// Remove every entry, in queue order
    pub fn drain(&mut self) -> impl Iterator<Item = PendingDelivery> + '_ {
        self.entries.drain(..)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
