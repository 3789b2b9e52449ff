//! SQLite-backed durable queue
//!
//! Messages live in a single `queue_messages` table. A delivery is claimed by
//! flipping its row from `ready` to `unacked`; ack deletes the row, nack either
//! deletes it or flips it back. Rows left `unacked` by a crashed process are
//! made `ready` again when the queue is declared.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tokio::sync::Notify;

use super::{Broker, Consumer, Delivery};
use crate::error::BrokerError;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS queue_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue TEXT NOT NULL,
    body BLOB NOT NULL,
    state TEXT NOT NULL DEFAULT 'ready',
    redelivered INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_queue_messages_ready ON queue_messages(queue, state, id);
"#;

/// Durable queue stored in SQLite
#[derive(Clone)]
pub struct SqliteBroker {
    inner: Arc<SqliteBrokerInner>,
}

struct SqliteBrokerInner {
    pool: SqlitePool,
    /// Wakes consumers of this process after a publish or requeue
    notify: Notify,
    poll_interval: Duration,
    closed: AtomicBool,
}

impl SqliteBroker {
    /// Open (or create) the queue database at `url`
    pub async fn connect(url: &str, poll_interval: Duration) -> Result<Self, BrokerError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::with_pool(pool, poll_interval).await
    }

    /// Private in-memory queue, lost when the broker is dropped
    pub async fn in_memory() -> Result<Self, BrokerError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // Every connection to :memory: is its own database, so pin exactly one
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::with_pool(pool, Duration::from_millis(50)).await
    }

    async fn with_pool(pool: SqlitePool, poll_interval: Duration) -> Result<Self, BrokerError> {
        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        Ok(Self {
            inner: Arc::new(SqliteBrokerInner {
                pool,
                notify: Notify::new(),
                poll_interval,
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for SqliteBroker {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;

        let recovered = sqlx::query(
            r#"
            UPDATE queue_messages SET state = 'ready', redelivered = 1
            WHERE queue = ? AND state = 'unacked'
            "#,
        )
        .bind(queue)
        .execute(&self.inner.pool)
        .await?
        .rows_affected();

        if recovered > 0 {
            tracing::warn!(
                queue = %queue,
                recovered = recovered,
                "Returned unacknowledged messages to queue"
            );
        }

        tracing::debug!(queue = %queue, "Queue declared");
        Ok(())
    }

    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        self.ensure_open()?;

        let size = body.len();
        let id = sqlx::query("INSERT INTO queue_messages (queue, body) VALUES (?, ?)")
            .bind(queue)
            .bind(body)
            .execute(&self.inner.pool)
            .await?
            .last_insert_rowid();

        self.inner.notify.notify_waiters();

        tracing::debug!(queue = %queue, tag = id, size = size, "Message published");
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn Consumer>, BrokerError> {
        self.ensure_open()?;

        Ok(Box::new(SqliteConsumer {
            broker: self.clone(),
            queue: queue.to_string(),
            unacked: HashSet::new(),
        }))
    }

    async fn depth(&self, queue: &str) -> Result<u64, BrokerError> {
        self.ensure_open()?;

        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM queue_messages WHERE queue = ? AND state = 'ready'",
        )
        .bind(queue)
        .fetch_one(&self.inner.pool)
        .await?;

        Ok(count.max(0) as u64)
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.notify.notify_waiters();
        self.inner.pool.close().await;
        tracing::info!("Broker connection closed");
    }
}

/// Consumer handle for one queue
pub struct SqliteConsumer {
    broker: SqliteBroker,
    queue: String,
    /// Tags handed out by this consumer and not yet settled
    unacked: HashSet<i64>,
}

impl SqliteConsumer {
    async fn claim(&self) -> Result<Option<Delivery>, BrokerError> {
        let row = sqlx::query_as::<_, (i64, Vec<u8>, bool)>(
            r#"
            UPDATE queue_messages SET state = 'unacked'
            WHERE id = (
                SELECT id FROM queue_messages
                WHERE queue = ? AND state = 'ready'
                ORDER BY id
                LIMIT 1
            )
            RETURNING id, body, redelivered
            "#,
        )
        .bind(&self.queue)
        .fetch_optional(&self.broker.inner.pool)
        .await?;

        Ok(row.map(|(tag, body, redelivered)| Delivery {
            tag,
            body,
            redelivered,
        }))
    }

    fn ensure_unacked(&self, tag: i64) -> Result<(), BrokerError> {
        if !self.unacked.contains(&tag) {
            return Err(BrokerError::UnknownDelivery(tag));
        }
        Ok(())
    }
}

#[async_trait]
impl Consumer for SqliteConsumer {
    async fn next(&mut self) -> Result<Option<Delivery>, BrokerError> {
        loop {
            // Register for wakeups before looking, so a publish in between is not missed
            let notified = self.broker.inner.notify.notified();

            if self.broker.inner.closed.load(Ordering::Acquire) {
                return Ok(None);
            }

            if let Some(delivery) = self.claim().await? {
                self.unacked.insert(delivery.tag);
                return Ok(Some(delivery));
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(self.broker.inner.poll_interval) => {}
            }
        }
    }

    // Tags stay tracked until the row is settled, so a failed write is still requeued on close
    async fn ack(&mut self, tag: i64) -> Result<(), BrokerError> {
        self.ensure_unacked(tag)?;
        self.broker.ensure_open()?;

        sqlx::query("DELETE FROM queue_messages WHERE id = ? AND state = 'unacked'")
            .bind(tag)
            .execute(&self.broker.inner.pool)
            .await?;
        self.unacked.remove(&tag);

        tracing::trace!(queue = %self.queue, tag = tag, "Message acknowledged");
        Ok(())
    }

    async fn nack(&mut self, tag: i64, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_unacked(tag)?;
        self.broker.ensure_open()?;

        if requeue {
            sqlx::query(
                r#"
                UPDATE queue_messages SET state = 'ready', redelivered = 1
                WHERE id = ? AND state = 'unacked'
                "#,
            )
            .bind(tag)
            .execute(&self.broker.inner.pool)
            .await?;
            self.broker.inner.notify.notify_waiters();
        } else {
            sqlx::query("DELETE FROM queue_messages WHERE id = ? AND state = 'unacked'")
                .bind(tag)
                .execute(&self.broker.inner.pool)
                .await?;
        }
        self.unacked.remove(&tag);

        tracing::debug!(queue = %self.queue, tag = tag, requeue = requeue, "Message rejected");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        let pending: Vec<i64> = self.unacked.drain().collect();
        if pending.is_empty() || self.broker.inner.closed.load(Ordering::Acquire) {
            return Ok(());
        }

        for tag in &pending {
            sqlx::query("UPDATE queue_messages SET state = 'ready', redelivered = 1 WHERE id = ?")
                .bind(tag)
                .execute(&self.broker.inner.pool)
                .await?;
        }

        tracing::info!(
            queue = %self.queue,
            requeued = pending.len(),
            "Consumer closed with unacknowledged messages"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUEUE: &str = "test_queue";

    async fn broker() -> SqliteBroker {
        let broker = SqliteBroker::in_memory().await.unwrap();
        broker.declare_queue(QUEUE).await.unwrap();
        broker
    }

    #[tokio::test]
    async fn test_publish_consume_ack() {
        let broker = broker().await;
        broker.publish(QUEUE, b"first".to_vec()).await.unwrap();
        broker.publish(QUEUE, b"second".to_vec()).await.unwrap();
        assert_eq!(broker.depth(QUEUE).await.unwrap(), 2);

        let mut consumer = broker.consume(QUEUE).await.unwrap();
        let first = consumer.next().await.unwrap().unwrap();
        assert_eq!(first.body, b"first");
        assert!(!first.redelivered);
        assert_eq!(broker.depth(QUEUE).await.unwrap(), 1);

        consumer.ack(first.tag).await.unwrap();
        assert!(matches!(
            consumer.ack(first.tag).await,
            Err(BrokerError::UnknownDelivery(_))
        ));

        let second = consumer.next().await.unwrap().unwrap();
        assert_eq!(second.body, b"second");
    }

    #[tokio::test]
    async fn test_nack_requeue_redelivers() {
        let broker = broker().await;
        broker.publish(QUEUE, b"payload".to_vec()).await.unwrap();

        let mut consumer = broker.consume(QUEUE).await.unwrap();
        let delivery = consumer.next().await.unwrap().unwrap();
        consumer.nack(delivery.tag, true).await.unwrap();

        let again = consumer.next().await.unwrap().unwrap();
        assert_eq!(again.body, b"payload");
        assert!(again.redelivered);

        consumer.nack(again.tag, false).await.unwrap();
        assert_eq!(broker.depth(QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_declare_recovers_orphaned_deliveries() {
        let broker = broker().await;
        broker.publish(QUEUE, b"orphan".to_vec()).await.unwrap();

        let mut consumer = broker.consume(QUEUE).await.unwrap();
        let _ = consumer.next().await.unwrap().unwrap();
        drop(consumer);
        assert_eq!(broker.depth(QUEUE).await.unwrap(), 0);

        broker.declare_queue(QUEUE).await.unwrap();
        assert_eq!(broker.depth(QUEUE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_consumer_close_requeues() {
        let broker = broker().await;
        broker.publish(QUEUE, b"payload".to_vec()).await.unwrap();

        let mut consumer = broker.consume(QUEUE).await.unwrap();
        let _ = consumer.next().await.unwrap().unwrap();
        consumer.close().await.unwrap();

        assert_eq!(broker.depth(QUEUE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_waiting_consumer_wakes_on_publish() {
        let broker = broker().await;
        let mut consumer = broker.consume(QUEUE).await.unwrap();

        let waiter = tokio::spawn(async move { consumer.next().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.publish(QUEUE, b"late".to_vec()).await.unwrap();

        let delivery = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.body, b"late");
    }

    #[tokio::test]
    async fn test_closed_broker() {
        let broker = broker().await;
        let mut consumer = broker.consume(QUEUE).await.unwrap();
        broker.close().await;

        assert!(matches!(
            broker.publish(QUEUE, b"x".to_vec()).await,
            Err(BrokerError::Closed)
        ));
        assert!(consumer.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_ack_keeps_delivery_tracked() {
        let broker = broker().await;
        broker.publish(QUEUE, b"payload".to_vec()).await.unwrap();

        let mut consumer = broker.consume(QUEUE).await.unwrap();
        let delivery = consumer.next().await.unwrap().unwrap();
        broker.close().await;

        // Still owned by this consumer, not forgotten
        assert!(matches!(consumer.ack(delivery.tag).await, Err(BrokerError::Closed)));
        assert!(matches!(
            consumer.nack(delivery.tag, true).await,
            Err(BrokerError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_nack_after_failed_ack_requeues() {
        let broker = broker().await;
        broker.publish(QUEUE, b"payload".to_vec()).await.unwrap();

        let mut consumer = broker.consume(QUEUE).await.unwrap();
        let delivery = consumer.next().await.unwrap().unwrap();

        // Unknown tags fail without touching the tracked one
        assert!(matches!(
            consumer.ack(delivery.tag + 1).await,
            Err(BrokerError::UnknownDelivery(_))
        ));
        consumer.nack(delivery.tag, true).await.unwrap();
        assert_eq!(broker.depth(QUEUE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_queues_are_isolated() {
        let broker = broker().await;
        broker.publish("other", b"elsewhere".to_vec()).await.unwrap();

        assert_eq!(broker.depth(QUEUE).await.unwrap(), 0);
        assert_eq!(broker.depth("other").await.unwrap(), 1);
    }
}
