//! The coordination store capability set consumed by the registry.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::Result;

/// Lease identifier issued by the coordination store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LeaseId(pub i64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// A key and its value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    /// The full key.
    pub key: String,
    /// The stored value.
    pub value: String,
}

/// Acknowledgement of one lease renewal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseAck {
    /// The renewed lease.
    pub lease: LeaseId,
    /// Remaining time-to-live in seconds. Zero or less means the lease is gone.
    pub ttl: i64,
}

/// Kind of change reported by a watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// A key was created or updated.
    Put,
    /// A key was deleted or expired.
    Delete,
}

/// A single change under a watched prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    /// What happened.
    pub kind: EventKind,
    /// The affected key.
    pub key: String,
}

/// Stream of lease renewal acknowledgements. Ends when renewal stops.
pub type KeepAliveStream = BoxStream<'static, Result<LeaseAck>>;

/// Stream of change batches under a prefix. Ends when the subscription closes.
pub type WatchStream = BoxStream<'static, Result<Vec<WatchEvent>>>;

/// A strongly-consistent key-value store with leases and prefix watches.
///
/// Every fallible method reports unreachable stores and rejected requests as errors.
#[allow(clippy::missing_errors_doc)]
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Reads a single key.
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// Reads every key starting with `prefix`, ordered by key.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    /// Writes a key, optionally attached to a lease.
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()>;

    /// Deletes a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Grants a lease with the given time-to-live in seconds.
    async fn grant_lease(&self, ttl: i64) -> Result<LeaseId>;

    /// Revokes a lease, deleting every key attached to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// Renews `lease` every `interval` and streams the acknowledgements.
    async fn keep_alive(&self, lease: LeaseId, interval: Duration) -> Result<KeepAliveStream>;

    /// Subscribes to changes of every key starting with `prefix`.
    async fn watch(&self, prefix: &str) -> Result<WatchStream>;

    /// Releases the client. Open streams end and later calls fail.
    async fn close(&self);
}
