//! The registry façade.
//!
//! A [`Registry`] combines self-registration with discovery of other
//! services. Two resolution paths are offered on purpose:
//!
//! - [`Registry::get_connections`] serves from a cache kept current by a
//!   background watch. It is cheap and eventually consistent: a freshly
//!   registered instance appears once its change event has been processed.
//! - [`Registry::get_connection`] scans the store on every call and returns
//!   one channel balanced across the instances found at that moment.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tonic::transport::Channel;

use crate::cache::ConnectionCache;
use crate::dial::{Connection, DialOption, Dialer, build_endpoint};
use crate::key::{EndpointKey, ServiceKey};
use crate::registration::{LeaseStatus, Registrar};
use crate::store::CoordinationStore;
use crate::{Error, RegistryConfig, Result, watch as watcher};

/// Service registry backed by a coordination store.
///
/// Cloning is cheap; clones share the cache, registration and watch task.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

struct Inner {
    config: RegistryConfig,
    store: Arc<dyn CoordinationStore>,
    cache: Arc<ConnectionCache>,
    registrar: Registrar,
    watch_task: StdMutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Registry {
    /// Connects to etcd and starts watching `config.root`.
    ///
    /// Service endpoints are dialed eagerly with [`crate::ConnectDialer`].
    ///
    /// # Errors
    ///
    /// Returns an error if the etcd client cannot be created.
    #[cfg(feature = "etcd")]
    pub async fn connect(config: RegistryConfig) -> Result<Self> {
        let store = crate::EtcdStore::connect(&config).await?;
        Ok(Self::with_store(config, Arc::new(store), Arc::new(crate::ConnectDialer)))
    }

    /// Creates a registry over an existing store and starts watching `config.root`.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn with_store(
        config: RegistryConfig,
        store: Arc<dyn CoordinationStore>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        let cache = Arc::new(ConnectionCache::new(
            Arc::clone(&store),
            dialer,
            config.root.clone(),
            config.connect_timeout,
        ));
        let registrar = Registrar::new(Arc::clone(&store), config.lease_ttl_secs());
        let watch_task = watcher::spawn(Arc::clone(&store), Arc::clone(&cache), config.root.clone());

        Self {
            inner: Arc::new(Inner {
                config,
                store,
                cache,
                registrar,
                watch_task: StdMutex::new(Some(watch_task)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The configuration this registry was built with.
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Registers this process as an instance of `service` reachable at `host:port`.
    ///
    /// The endpoint is attached to a lease of `config.lease_ttl` that is renewed in
    /// the background. Watch [`Registry::lease_status`] to learn about lease loss.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRegistered`] if a live registration exists,
    /// [`Error::InvalidServiceName`] for a bad name, or the store's error if
    /// granting the lease or writing the key fails. Nothing is retried.
    pub async fn register(&self, service: &str, host: &str, port: u16) -> Result<()> {
        self.ensure_open()?;
        let key = EndpointKey::new(&self.inner.config.root, service, host, port)?;
        self.inner.registrar.register(key).await
    }

    /// Removes this process's registration and revokes its lease.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRegistered`] without touching the store if nothing is
    /// registered, or the store's error if the removal fails.
    pub async fn unregister(&self) -> Result<()> {
        self.ensure_open()?;
        self.inner.registrar.unregister().await
    }

    /// Returns a connection to every known instance of `service`.
    ///
    /// Served from the cache; the first call after start-up or invalidation scans
    /// the whole root and dials every endpoint found. Instances that fail to dial
    /// are left out. An unknown service yields an empty list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidServiceName`] for a bad name, [`Error::Closed`]
    /// after [`Registry::close`], or the store's error if a needed scan fails.
    pub async fn get_connections(&self, service: &str) -> Result<Vec<Connection>> {
        self.ensure_open()?;
        let key = ServiceKey::new(&self.inner.config.root, service)?;
        self.inner.cache.resolve(&key).await
    }

    /// Resolves `service` against the store now and returns one channel balanced
    /// across its instances.
    ///
    /// The shared dial options apply first, then `options`. The channel connects
    /// lazily and does not follow later membership changes. Instances whose
    /// address cannot be turned into an endpoint are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoEndpoints`] if no instance is registered,
    /// [`Error::InvalidServiceName`] for a bad name, or the store's error.
    pub async fn get_connection(&self, service: &str, options: &[DialOption]) -> Result<Connection> {
        self.ensure_open()?;
        let key = ServiceKey::new(&self.inner.config.root, service)?;

        let mut all = self.inner.cache.options().await;
        all.extend_from_slice(options);

        let kvs = self.inner.store.get_prefix(&key.prefix()).await?;
        let endpoints: Vec<_> = kvs
            .iter()
            .filter_map(|kv| EndpointKey::parse(&self.inner.config.root, &kv.key).ok())
            .filter(|endpoint| endpoint.service() == &key)
            .filter_map(|endpoint| {
                match build_endpoint(endpoint.address(), self.inner.config.connect_timeout, &all) {
                    Ok(built) => Some(built),
                    Err(e) => {
                        tracing::warn!("skipping endpoint {endpoint}: {e}");
                        None
                    }
                }
            })
            .collect();

        if endpoints.is_empty() {
            return Err(Error::NoEndpoints(key.to_string()));
        }

        tracing::debug!("resolved {key} to {} endpoints", endpoints.len());
        Ok(Connection::new(
            format!("etcd:///{key}"),
            Channel::balance_list(endpoints.into_iter()),
        ))
    }

    /// `host:port` of this process's registration, including one whose lease was lost.
    #[must_use]
    pub fn self_target(&self) -> Option<String> {
        self.inner.registrar.target()
    }

    /// Subscribes to the lifecycle of this process's registration.
    #[must_use]
    pub fn lease_status(&self) -> watch::Receiver<LeaseStatus> {
        self.inner.registrar.subscribe()
    }

    /// Appends dial options for all future dials and drops every cached connection.
    ///
    /// Options cannot be removed once added.
    pub async fn add_dial_options(&self, options: impl IntoIterator<Item = DialOption>) {
        self.inner.cache.add_options(options).await;
    }

    /// Drops every cached connection; the next [`Registry::get_connections`]
    /// rescans the store.
    pub async fn invalidate(&self) {
        self.inner.cache.invalidate_all().await;
    }

    /// Stops the watch, unregisters, releases cached connections and closes the store.
    ///
    /// Later calls on this registry or its clones fail with [`Error::Closed`].
    /// Connections already handed out stay usable until their holders drop them.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let watch_task = self
            .inner
            .watch_task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();

        if let Some(task) = watch_task {
            task.abort();
        }

        match self.inner.registrar.unregister().await {
            Ok(()) | Err(Error::NotRegistered) => {}
            Err(e) => tracing::warn!("failed to unregister on close: {e}"),
        }

        let released = self.inner.cache.close().await;
        self.inner.store.close().await;

        tracing::debug!("registry closed, released {released} cached connections");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        Ok(())
    }
}
