//! Cache of dialed connections per service.
//!
//! Reads go through a shared lock. Rebuilds and single-service refreshes are
//! serialized by a separate gate, do their store scan and dialing without
//! holding the map lock, and only take the exclusive lock to swap entries in.
//! Entries are always replaced wholesale, so a reader sees either the old or
//! the new list for a service, never a mix.
//!
//! Invalidation bumps a generation counter. Results scanned before an
//! invalidation are returned to the caller that asked for them but are never
//! installed.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{Mutex, RwLock};

use crate::dial::{Connection, DialOption, Dialer, build_endpoint};
use crate::key::{EndpointKey, ServiceKey};
use crate::store::{CoordinationStore, KeyValue};
use crate::{Error, Result};

#[derive(Default)]
struct CacheState {
    entries: HashMap<ServiceKey, Vec<Connection>>,
    populated: bool,
    generation: u64,
    options: Vec<DialOption>,
    closed: bool,
}

pub(crate) struct ConnectionCache {
    store: Arc<dyn CoordinationStore>,
    dialer: Arc<dyn Dialer>,
    root: String,
    connect_timeout: Option<Duration>,
    state: RwLock<CacheState>,
    rebuild: Mutex<()>,
}

impl ConnectionCache {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        dialer: Arc<dyn Dialer>,
        root: impl Into<String>,
        connect_timeout: Option<Duration>,
    ) -> Self {
        Self {
            store,
            dialer,
            root: root.into(),
            connect_timeout,
            state: RwLock::new(CacheState::default()),
            rebuild: Mutex::new(()),
        }
    }

    /// Returns the connections for `key`, building the whole cache on first use.
    pub async fn resolve(&self, key: &ServiceKey) -> Result<Vec<Connection>> {
        if let Some(hit) = self.lookup(key).await? {
            return Ok(hit);
        }

        let _gate = self.rebuild.lock().await;

        // Another caller may have rebuilt while we waited for the gate.
        if let Some(hit) = self.lookup(key).await? {
            return Ok(hit);
        }

        let (generation, options) = self.snapshot().await?;
        let entries = self.scan_all(&options).await?;
        let found = entries.get(key).cloned().unwrap_or_default();
        self.install(generation, entries).await?;

        Ok(found)
    }

    /// Re-scans a single service and replaces its entry.
    pub async fn refresh(&self, key: &ServiceKey) -> Result<()> {
        let _gate = self.rebuild.lock().await;

        let (generation, options) = self.snapshot().await?;
        let kvs = self.store.get_prefix(&key.prefix()).await?;
        let endpoints: Vec<EndpointKey> = self
            .decode(&kvs)
            .into_iter()
            .filter(|endpoint| endpoint.service() == key)
            .collect();
        let connections: Vec<Connection> = self
            .dial_all(&endpoints, &options)
            .await
            .into_iter()
            .flatten()
            .collect();

        let stale = {
            let mut state = self.state.write().await;
            if state.closed {
                return Err(Error::Closed);
            }

            if state.generation != generation {
                tracing::debug!("cache invalidated during refresh of {key}, discarding");
                return Ok(());
            }

            tracing::debug!("refreshed {key}: {} connections", connections.len());
            state.entries.insert(key.clone(), connections)
        };

        drop(stale);
        Ok(())
    }

    /// Rebuilds every entry if the cache has been populated. An empty cache
    /// is left for the next `resolve` to build, and a build already in flight
    /// is discarded.
    pub async fn rebuild(&self) -> Result<()> {
        if self.discard_pending().await {
            return Ok(());
        }

        let _gate = self.rebuild.lock().await;

        let (generation, options) = self.snapshot().await?;
        let entries = self.scan_all(&options).await?;
        self.install(generation, entries).await
    }

    /// Drops every entry; the next `resolve` rebuilds from the store.
    pub async fn invalidate_all(&self) {
        let stale = {
            let mut state = self.state.write().await;
            state.populated = false;
            state.generation += 1;
            mem::take(&mut state.entries)
        };

        tracing::debug!("invalidated {} cached services", stale.len());
    }

    /// If the cache is not populated, bumps the generation so a first build
    /// scanned before the latest change is not installed. Returns whether it did.
    pub async fn discard_pending(&self) -> bool {
        let mut state = self.state.write().await;
        if state.populated {
            return false;
        }

        state.generation += 1;
        true
    }

    /// Appends dial options and invalidates the cache under the same lock.
    pub async fn add_options(&self, options: impl IntoIterator<Item = DialOption>) {
        let stale = {
            let mut state = self.state.write().await;
            state.options.extend(options);
            state.populated = false;
            state.generation += 1;
            mem::take(&mut state.entries)
        };

        tracing::debug!("dial options changed, dropped {} cached services", stale.len());
    }

    /// Snapshot of the current dial options.
    pub async fn options(&self) -> Vec<DialOption> {
        self.state.read().await.options.clone()
    }

    pub async fn is_populated(&self) -> bool {
        self.state.read().await.populated
    }

    /// Marks the cache closed and releases every cached connection.
    /// Returns the number of connections dropped.
    pub async fn close(&self) -> usize {
        let stale = {
            let mut state = self.state.write().await;
            state.closed = true;
            state.populated = false;
            state.generation += 1;
            mem::take(&mut state.entries)
        };

        stale.values().map(Vec::len).sum()
    }

    async fn lookup(&self, key: &ServiceKey) -> Result<Option<Vec<Connection>>> {
        let state = self.state.read().await;
        if state.closed {
            return Err(Error::Closed);
        }

        if !state.populated {
            return Ok(None);
        }

        Ok(Some(state.entries.get(key).cloned().unwrap_or_default()))
    }

    async fn snapshot(&self) -> Result<(u64, Vec<DialOption>)> {
        let state = self.state.read().await;
        if state.closed {
            return Err(Error::Closed);
        }

        Ok((state.generation, state.options.clone()))
    }

    async fn install(
        &self,
        generation: u64,
        entries: HashMap<ServiceKey, Vec<Connection>>,
    ) -> Result<()> {
        let stale = {
            let mut state = self.state.write().await;
            if state.closed {
                return Err(Error::Closed);
            }

            if state.generation != generation {
                tracing::debug!("cache invalidated during rebuild, discarding");
                return Ok(());
            }

            state.populated = true;
            mem::replace(&mut state.entries, entries)
        };

        drop(stale);
        Ok(())
    }

    async fn scan_all(&self, options: &[DialOption]) -> Result<HashMap<ServiceKey, Vec<Connection>>> {
        let kvs = self.store.get_prefix(&format!("{}/", self.root)).await?;
        let endpoints = self.decode(&kvs);
        let connections = self.dial_all(&endpoints, options).await;

        let mut entries: HashMap<ServiceKey, Vec<Connection>> = HashMap::new();
        for endpoint in &endpoints {
            entries.entry(endpoint.service().clone()).or_default();
        }

        for (endpoint, connection) in endpoints.iter().zip(connections) {
            if let Some(connection) = connection {
                if let Some(list) = entries.get_mut(endpoint.service()) {
                    list.push(connection);
                }
            }
        }

        tracing::debug!(
            "scanned {}: {} endpoints across {} services",
            self.root,
            endpoints.len(),
            entries.len()
        );

        Ok(entries)
    }

    fn decode(&self, kvs: &[KeyValue]) -> Vec<EndpointKey> {
        kvs.iter()
            .filter_map(|kv| match EndpointKey::parse(&self.root, &kv.key) {
                Ok(endpoint) => Some(endpoint),
                Err(e) => {
                    tracing::debug!("skipping key: {e}");
                    None
                }
            })
            .collect()
    }

    /// Dials every endpoint concurrently. Failed dials come back as `None`.
    async fn dial_all(&self, endpoints: &[EndpointKey], options: &[DialOption]) -> Vec<Option<Connection>> {
        join_all(endpoints.iter().map(|endpoint| self.dial(endpoint, options))).await
    }

    async fn dial(&self, endpoint: &EndpointKey, options: &[DialOption]) -> Option<Connection> {
        let address = endpoint.address();
        let built = match build_endpoint(address, self.connect_timeout, options) {
            Ok(built) => built,
            Err(e) => {
                tracing::warn!("skipping endpoint {endpoint}: {e}");
                return None;
            }
        };

        match self.dialer.dial(built).await {
            Ok(channel) => Some(Connection::new(address, channel)),
            Err(e) => {
                tracing::warn!("failed to dial {endpoint}: {e}");
                None
            }
        }
    }
}
