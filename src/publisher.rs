//! Accept path
//!
//! Hashes incoming content, reserves the hash and publishes a delivery
//! message. A successful accept leaves exactly one reservation held and one
//! message enqueued; a failed publish rolls the reservation back.

use std::sync::Arc;

use serde::Serialize;

use crate::broker::Broker;
use crate::error::AcceptError;
use crate::hash::ContentHash;
use crate::hash_store::HashStore;
use crate::message::DeliveryMessage;

/// A file handed to the queue
#[derive(Debug, Clone, Serialize)]
pub struct Accepted {
    pub hash: ContentHash,
    pub name: String,
    pub extension: String,
    pub size: usize,
}

/// Producer side of the pipeline
#[derive(Clone)]
pub struct Publisher {
    hash_store: HashStore,
    broker: Arc<dyn Broker>,
    queue: String,
}

impl Publisher {
    pub fn new(hash_store: HashStore, broker: Arc<dyn Broker>, queue: impl Into<String>) -> Self {
        Self {
            hash_store,
            broker,
            queue: queue.into(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Deduplicate and publish one file
    pub async fn accept(
        &self,
        content: Vec<u8>,
        original_file_name: &str,
    ) -> Result<Accepted, AcceptError> {
        let hash = ContentHash::compute(&content);

        // Reserve before publishing so a concurrent duplicate cannot slip in
        if !self.hash_store.reserve(&hash) {
            tracing::info!(
                hash = %hash.short(),
                file_name = %original_file_name,
                "Duplicate content already in flight"
            );
            return Err(AcceptError::DuplicateInFlight(hash));
        }

        let size = content.len();
        let message = DeliveryMessage::new(content, original_file_name);

        if let Err(e) = self.publish(&message).await {
            self.hash_store.release(&hash);
            tracing::error!(
                hash = %hash.short(),
                file_name = %original_file_name,
                error = %e,
                "Publish failed, reservation rolled back"
            );
            return Err(e);
        }

        tracing::info!(
            hash = %hash.short(),
            name = %message.name,
            extension = %message.extension,
            size = size,
            queue = %self.queue,
            "File accepted and queued"
        );

        Ok(Accepted {
            hash,
            name: message.name,
            extension: message.extension,
            size,
        })
    }

    async fn publish(&self, message: &DeliveryMessage) -> Result<(), AcceptError> {
        let body = message.encode()?;
        self.broker.publish(&self.queue, body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Consumer, SqliteBroker};
    use crate::error::BrokerError;

    const QUEUE: &str = "publisher_test";

    async fn setup() -> (Publisher, SqliteBroker, HashStore) {
        let broker = SqliteBroker::in_memory().await.unwrap();
        broker.declare_queue(QUEUE).await.unwrap();
        let store = HashStore::new();
        let publisher = Publisher::new(store.clone(), Arc::new(broker.clone()), QUEUE);
        (publisher, broker, store)
    }

    #[tokio::test]
    async fn test_accept_reserves_and_publishes() {
        let (publisher, broker, store) = setup().await;

        let accepted = publisher.accept(b"X".to_vec(), "report.pdf").await.unwrap();
        assert_eq!(accepted.hash, ContentHash::compute(b"X"));
        assert_eq!(accepted.name, "report");
        assert_eq!(accepted.extension, ".pdf");
        assert_eq!(accepted.size, 1);
        assert!(store.contains(&accepted.hash));

        let mut consumer = broker.consume(QUEUE).await.unwrap();
        let delivery = consumer.next().await.unwrap().unwrap();
        let message = DeliveryMessage::decode(&delivery.body).unwrap();
        assert_eq!(message, DeliveryMessage::new(b"X".to_vec(), "report.pdf"));
    }

    #[tokio::test]
    async fn test_duplicate_is_rejected_regardless_of_name() {
        let (publisher, broker, _store) = setup().await;

        publisher.accept(b"same".to_vec(), "a.txt").await.unwrap();
        let err = publisher.accept(b"same".to_vec(), "b.doc").await.unwrap_err();

        assert!(matches!(err, AcceptError::DuplicateInFlight(_)));
        assert_eq!(broker.depth(QUEUE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_releases_reservation() {
        let (publisher, broker, store) = setup().await;
        broker.close().await;

        let err = publisher.accept(b"Y".to_vec(), "y.bin").await.unwrap_err();
        assert!(matches!(err, AcceptError::Publish(BrokerError::Closed)));
        assert!(!store.contains(&ContentHash::compute(b"Y")));
        assert!(store.is_empty());
    }
}
