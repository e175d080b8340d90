//! Readiness probe for the coordination store.

use std::time::Duration;

use crate::store::CoordinationStore;
use crate::{Error, Result};

/// Timeout used when the configuration sets no dial timeout.
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Lease TTL, in seconds, of a root node created by the probe.
const ROOT_LEASE_TTL: i64 = 10;

/// Verifies that the `root` node exists, optionally creating it under a short lease.
///
/// The whole probe is bounded by `timeout`.
///
/// # Errors
///
/// Returns [`Error::RootMissing`] if the node is absent and `create_if_missing` is false,
/// [`Error::Timeout`] if the store does not answer in time, or the store's own error.
pub async fn check_store(
    store: &dyn CoordinationStore,
    root: &str,
    create_if_missing: bool,
    timeout: Duration,
) -> Result<()> {
    let probe = async {
        if store.get(root).await?.is_some() {
            return Ok(());
        }

        if !create_if_missing {
            return Err(Error::RootMissing(root.to_string()));
        }

        let lease = store.grant_lease(ROOT_LEASE_TTL).await?;
        store.put(root, "", Some(lease)).await?;
        tracing::debug!("created root node {root} with lease {lease}");

        Ok(())
    };

    tokio::time::timeout(timeout, probe)
        .await
        .map_err(|_| Error::Timeout(timeout))?
}

/// Connects to the configured etcd cluster and runs [`check_store`] against `config.root`.
///
/// The client is closed before returning.
///
/// # Errors
///
/// Returns an error if the cluster is unreachable or the probe fails.
#[cfg(feature = "etcd")]
pub async fn check(config: &crate::RegistryConfig, create_if_missing: bool) -> Result<()> {
    let store = crate::EtcdStore::connect(config).await?;
    let timeout = config.dial_timeout.unwrap_or(DEFAULT_CHECK_TIMEOUT);

    let outcome = check_store(&store, &config.root, create_if_missing, timeout).await;
    store.close().await;

    outcome
}
