//! Message broker capability
//!
//! The relay only needs an at-least-once queue with manual acknowledgment:
//! - `publish` stores a persistent message on a durable queue
//! - `consume` hands out deliveries one at a time
//! - a delivery stays owned by its consumer until `ack` or `nack`
//!
//! `BROKER_URL` picks the transport: `amqp://` URLs go to RabbitMQ, anything
//! else is opened as a SQLite queue file.

mod amqp;
mod sqlite;

pub use amqp::{is_amqp_url, AmqpBroker, AmqpConsumer};
pub use sqlite::{SqliteBroker, SqliteConsumer};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::BrokerConfig;
use crate::error::BrokerError;

/// Connect to the configured broker
pub async fn connect(config: &BrokerConfig) -> Result<Arc<dyn Broker>, BrokerError> {
    if is_amqp_url(&config.url) {
        let broker = AmqpBroker::connect(&config.url, config.prefetch).await?;
        return Ok(Arc::new(broker));
    }

    let broker = SqliteBroker::connect(
        &config.url,
        Duration::from_millis(config.poll_interval_ms),
    )
    .await?;
    Ok(Arc::new(broker))
}

/// A message handed to a consumer, pending acknowledgment
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Identifies the delivery for `ack`/`nack`
    pub tag: i64,
    pub body: Vec<u8>,
    /// Set when the message was handed out before and not acknowledged
    pub redelivered: bool,
}

/// Durable queue transport
#[async_trait]
pub trait Broker: Send + Sync {
    /// Make sure the queue exists and recover deliveries orphaned by a
    /// previous consumer.
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Enqueue a persistent message
    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError>;

    /// Start consuming from a queue with manual acknowledgment
    async fn consume(&self, queue: &str) -> Result<Box<dyn Consumer>, BrokerError>;

    /// Messages waiting to be delivered
    async fn depth(&self, queue: &str) -> Result<u64, BrokerError>;

    /// Stop accepting publishes and wake any waiting consumers
    async fn close(&self);
}

/// Consumer side of a queue
#[async_trait]
pub trait Consumer: Send {
    /// Wait for the next delivery. `None` once the broker is closed.
    async fn next(&mut self) -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&mut self, tag: i64) -> Result<(), BrokerError>;

    /// Reject a delivery, returning it to the queue when `requeue` is set
    async fn nack(&mut self, tag: i64, requeue: bool) -> Result<(), BrokerError>;

    /// Return unacknowledged deliveries to the queue and stop consuming
    async fn close(&mut self) -> Result<(), BrokerError>;
}
