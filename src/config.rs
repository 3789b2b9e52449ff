//! Configuration management for File Relay

use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub broker: BrokerConfig,
    pub remote: RemoteConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Largest accepted request body
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// `amqp://` for RabbitMQ, anything else is a SQLite URL
    pub url: String,
    pub queue: String,
    /// Fallback poll interval for SQLite consumers waiting on an empty queue
    pub poll_interval_ms: u64,
    /// Unacknowledged deliveries an AMQP consumer may hold
    pub prefetch: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    pub provider: RemoteProvider,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Directory (or key prefix) files are written under
    pub root: String,
    pub bucket: String,
    pub region: Option<String>,
    pub use_tls: bool,
    /// Pinned SFTP host key (`SHA256:...`); unset accepts any key
    pub host_key_fingerprint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteProvider {
    Sftp,
    S3,
    Local,
}

impl RemoteProvider {
    /// Parse `REMOTE_PROVIDER`; unknown values fall back to `Local`
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "sftp" => RemoteProvider::Sftp,
            "s3" => RemoteProvider::S3,
            _ => RemoteProvider::Local,
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            RemoteProvider::Sftp => 22,
            RemoteProvider::S3 | RemoteProvider::Local => 9000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Attempts per file before it is abandoned
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Bound on a single connect + upload attempt
    pub attempt_timeout_secs: u64,
    /// How long an in-flight attempt may run after shutdown is requested
    pub shutdown_grace_secs: u64,
}

impl RemoteConfig {
    /// Endpoint URL for HTTP-based providers
    pub fn endpoint(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Delay before the next attempt after `attempts` failures.
    ///
    /// Doubles from `initial_backoff`, capped at `max_backoff`.
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        let delay = self.initial_backoff().saturating_mul(1u32 << exponent);
        delay.min(self.max_backoff())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 8,
            initial_backoff_ms: 500,
            max_backoff_ms: 60_000,
            attempt_timeout_secs: 120,
            shutdown_grace_secs: 10,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
                max_upload_bytes: 256 * 1024 * 1024,
            },
            broker: BrokerConfig {
                url: "sqlite:./relay-queue.db".to_string(),
                queue: "sftp_queue".to_string(),
                poll_interval_ms: 1000,
                prefetch: 16,
            },
            remote: RemoteConfig {
                provider: RemoteProvider::Local,
                host: "localhost".to_string(),
                port: 9000,
                username: "admin".to_string(),
                password: "password123".to_string(),
                root: "./remote".to_string(),
                bucket: "uploads".to_string(),
                region: Some("us-east-1".to_string()),
                use_tls: false,
                host_key_fingerprint: None,
            },
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        let defaults = Config::default();

        let provider = RemoteProvider::parse(
            &env::var("REMOTE_PROVIDER").unwrap_or_else(|_| "local".to_string()),
        );

        // Credentials are mandatory for a real remote server
        let (username, password) = match provider {
            RemoteProvider::Sftp | RemoteProvider::S3 => {
                (env::var("REMOTE_USERNAME")?, env::var("REMOTE_PASSWORD")?)
            }
            RemoteProvider::Local => (
                env::var("REMOTE_USERNAME").unwrap_or(defaults.remote.username),
                env::var("REMOTE_PASSWORD").unwrap_or(defaults.remote.password),
            ),
        };

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var("SERVER_PORT", defaults.server.port),
                max_upload_bytes: parse_var("MAX_UPLOAD_BYTES", defaults.server.max_upload_bytes),
            },
            broker: BrokerConfig {
                url: env::var("BROKER_URL").unwrap_or(defaults.broker.url),
                queue: env::var("BROKER_QUEUE").unwrap_or(defaults.broker.queue),
                poll_interval_ms: parse_var("BROKER_POLL_MS", defaults.broker.poll_interval_ms),
                prefetch: parse_var("BROKER_PREFETCH", defaults.broker.prefetch).max(1),
            },
            remote: RemoteConfig {
                provider,
                host: env::var("REMOTE_HOST").unwrap_or(defaults.remote.host),
                port: parse_var("REMOTE_PORT", provider.default_port()),
                username,
                password,
                root: env::var("REMOTE_ROOT").unwrap_or(defaults.remote.root),
                bucket: env::var("REMOTE_BUCKET").unwrap_or(defaults.remote.bucket),
                region: env::var("REMOTE_REGION").ok().or(defaults.remote.region),
                use_tls: parse_var("REMOTE_TLS", defaults.remote.use_tls),
                host_key_fingerprint: env::var("REMOTE_HOST_KEY").ok(),
            },
            retry: RetryConfig {
                max_attempts: parse_var("RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts).max(1),
                initial_backoff_ms: parse_var(
                    "RETRY_INITIAL_BACKOFF_MS",
                    defaults.retry.initial_backoff_ms,
                ),
                max_backoff_ms: parse_var("RETRY_MAX_BACKOFF_MS", defaults.retry.max_backoff_ms),
                attempt_timeout_secs: parse_var(
                    "UPLOAD_TIMEOUT_SECS",
                    defaults.retry.attempt_timeout_secs,
                ),
                shutdown_grace_secs: parse_var(
                    "SHUTDOWN_GRACE_SECS",
                    defaults.retry.shutdown_grace_secs,
                ),
            },
        })
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
