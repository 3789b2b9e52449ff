//! Application state management

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::broker::Broker;
use crate::config::Config;
use crate::hash_store::HashStore;
use crate::publisher::Publisher;
use crate::readiness::Readiness;
use crate::relay::RelayStats;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    publisher: Publisher,
    hash_store: HashStore,
    broker: Arc<dyn Broker>,
    relay_stats: Arc<RelayStats>,
    readiness: Readiness,
    started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        config: Config,
        publisher: Publisher,
        hash_store: HashStore,
        broker: Arc<dyn Broker>,
        relay_stats: Arc<RelayStats>,
        readiness: Readiness,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                publisher,
                hash_store,
                broker,
                relay_stats,
                readiness,
                started_at: Utc::now(),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn publisher(&self) -> &Publisher {
        &self.inner.publisher
    }

    pub fn hash_store(&self) -> &HashStore {
        &self.inner.hash_store
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.inner.broker
    }

    pub fn relay_stats(&self) -> &RelayStats {
        &self.inner.relay_stats
    }

    pub fn readiness(&self) -> &Readiness {
        &self.inner.readiness
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }
}
