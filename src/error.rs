use std::time::Duration;

use thiserror::Error;

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for registration, discovery and store failures.
#[derive(Debug, Error)]
pub enum Error {
    /// The service name is empty or contains a path separator.
    #[error("invalid service name {0:?}")]
    InvalidServiceName(String),

    /// A store key does not follow the `root/service/host:port` layout.
    #[error("malformed endpoint key: {0}")]
    MalformedKey(String),

    /// `register` was called while a registration is still live.
    #[error("already registered as {0}")]
    AlreadyRegistered(String),

    /// `unregister` was called without a prior successful `register`.
    #[error("no endpoint is registered")]
    NotRegistered,

    /// Live resolution found no instances of the service.
    #[error("no endpoints registered for {0}")]
    NoEndpoints(String),

    /// The health check found no root node and was not allowed to create it.
    #[error("root node {0} does not exist")]
    RootMissing(String),

    /// The store does not know the lease.
    #[error("lease {0} not found")]
    LeaseNotFound(i64),

    /// The watch subscription dropped change batches.
    #[error("watch stream lagged, {0} batches skipped")]
    WatchLagged(u64),

    /// A store operation did not finish in time.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The registry or store has been closed.
    #[error("registry is closed")]
    Closed,

    /// Building or dialing a channel failed.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// An endpoint descriptor could not be encoded.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The etcd client reported a failure.
    #[cfg(feature = "etcd")]
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    /// Any other coordination store failure.
    #[error("coordination store error: {0}")]
    Store(String),
}
