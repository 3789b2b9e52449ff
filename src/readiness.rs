//! Pipeline readiness
//!
//! Tracks the three things a delivery depends on: the broker connection, the
//! remote storage connection and the relay task. The HTTP layer reads it for
//! `/api/v1/health` and refuses new uploads once the relay has stopped, since
//! nothing would release their reservations.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

/// Consecutive connect failures before the remote is reported down
pub const REMOTE_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "error")]
pub enum ComponentState {
    Up,
    Down(String),
}

impl ComponentState {
    pub fn is_up(&self) -> bool {
        matches!(self, Self::Up)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum RelayState {
    Starting,
    Running,
    Stopped(String),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessReport {
    pub ready: bool,
    pub broker: ComponentState,
    pub remote: ComponentState,
    pub relay: RelayState,
}

#[derive(Debug)]
struct ReadinessInner {
    broker: ComponentState,
    remote: ComponentState,
    remote_failures: u32,
    relay: RelayState,
}

/// Shared readiness state, cheap to clone
#[derive(Debug, Clone)]
pub struct Readiness {
    inner: Arc<RwLock<ReadinessInner>>,
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

impl Readiness {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(ReadinessInner {
                broker: ComponentState::Up,
                remote: ComponentState::Up,
                remote_failures: 0,
                relay: RelayState::Starting,
            })),
        }
    }

    pub fn broker_up(&self) {
        let mut inner = self.inner.write();
        if !inner.broker.is_up() {
            tracing::info!("Broker connection restored");
            inner.broker = ComponentState::Up;
        }
    }

    pub fn broker_down(&self, error: impl Into<String>) {
        let error = error.into();
        tracing::warn!(error = %error, "Broker marked unavailable");
        self.inner.write().broker = ComponentState::Down(error);
    }

    /// A session was opened; the remote is reachable
    pub fn remote_connected(&self) {
        let mut inner = self.inner.write();
        inner.remote_failures = 0;
        if !inner.remote.is_up() {
            tracing::info!("Remote storage reachable again");
            inner.remote = ComponentState::Up;
        }
    }

    /// Record a failed connect; reports the remote down at the threshold
    pub fn remote_connect_failed(&self, error: impl Into<String>) {
        let mut inner = self.inner.write();
        inner.remote_failures += 1;

        if inner.remote_failures >= REMOTE_FAILURE_THRESHOLD {
            let error = error.into();
            if inner.remote.is_up() {
                tracing::warn!(
                    failures = inner.remote_failures,
                    error = %error,
                    "Remote storage marked unavailable"
                );
            }
            inner.remote = ComponentState::Down(error);
        }
    }

    pub fn relay_running(&self) {
        self.inner.write().relay = RelayState::Running;
    }

    pub fn relay_stopped(&self, reason: impl Into<String>) {
        self.inner.write().relay = RelayState::Stopped(reason.into());
    }

    /// New uploads are refused once the relay is gone
    pub fn accepting(&self) -> bool {
        !matches!(self.inner.read().relay, RelayState::Stopped(_))
    }

    pub fn report(&self) -> ReadinessReport {
        let inner = self.inner.read();
        let relay_ok = !matches!(inner.relay, RelayState::Stopped(_));

        ReadinessReport {
            ready: relay_ok && inner.broker.is_up() && inner.remote.is_up(),
            broker: inner.broker.clone(),
            remote: inner.remote.clone(),
            relay: inner.relay.clone(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.report().ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_ready() {
        let readiness = Readiness::new();
        let report = readiness.report();

        assert!(report.ready);
        assert_eq!(report.relay, RelayState::Starting);
        assert!(readiness.accepting());
    }

    #[test]
    fn test_remote_down_after_threshold() {
        let readiness = Readiness::new();

        for _ in 1..REMOTE_FAILURE_THRESHOLD {
            readiness.remote_connect_failed("connection refused");
            assert!(readiness.is_ready());
        }
        readiness.remote_connect_failed("connection refused");

        let report = readiness.report();
        assert!(!report.ready);
        assert_eq!(
            report.remote,
            ComponentState::Down("connection refused".to_string())
        );
        // Still accepting: queued files are retried once the remote is back
        assert!(readiness.accepting());

        readiness.remote_connected();
        assert!(readiness.is_ready());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let readiness = Readiness::new();

        for _ in 1..REMOTE_FAILURE_THRESHOLD {
            readiness.remote_connect_failed("timeout");
        }
        readiness.remote_connected();
        readiness.remote_connect_failed("timeout");

        assert!(readiness.report().remote.is_up());
    }

    #[test]
    fn test_relay_stopped_refuses_uploads() {
        let readiness = Readiness::new();
        readiness.relay_running();
        readiness.relay_stopped("broker closed");

        assert!(!readiness.accepting());
        assert!(!readiness.is_ready());
    }

    #[test]
    fn test_report_json() {
        let readiness = Readiness::new();
        readiness.broker_down("connection reset");

        let json = serde_json::to_value(readiness.report()).unwrap();
        assert_eq!(json["ready"], false);
        assert_eq!(json["broker"]["state"], "down");
        assert_eq!(json["broker"]["error"], "connection reset");
        assert_eq!(json["remote"]["state"], "up");
        assert_eq!(json["relay"]["state"], "starting");
    }
}
