//! File Relay
//!
//! Accepts uploaded files, deduplicates them by content hash, publishes them to
//! a durable queue and delivers each unique file to remote storage.
//!
//! # Modules
//!
//! - `hash` / `hash_store`: content hashing and in-flight reservations
//! - `publisher`: accept path (dedupe + publish)
//! - `relay`: queue consumer that hands messages to the upload worker
//! - `worker`: retry queue and drain loop against remote storage
//! - `broker` / `storage`: capabilities for the queue and the remote server
//! - `readiness`: broker, remote and relay health for the HTTP layer

pub mod broker;
pub mod config;
pub mod error;
pub mod hash;
pub mod hash_store;
pub mod message;
pub mod publisher;
pub mod readiness;
pub mod relay;
pub mod routes;
pub mod state;
pub mod storage;
pub mod worker;

pub use hash::ContentHash;
pub use hash_store::HashStore;
pub use message::DeliveryMessage;
pub use publisher::{Accepted, Publisher};
pub use readiness::Readiness;
pub use relay::{Relay, RelayStats};
pub use worker::{DeliveryOutcome, UploadWorker, UploadWorkerHandle};
