//! In-process coordination store.
//!
//! `MemoryStore` implements [`CoordinationStore`] with the same observable
//! semantics the registry relies on from etcd: ordered prefix reads, leases
//! whose revocation deletes attached keys, and prefix watches. It also counts
//! prefix scans and can be switched into a failing mode, which makes it a
//! convenient test double.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use tokio::sync::{broadcast, watch};

use crate::store::{
    CoordinationStore, EventKind, KeepAliveStream, KeyValue, LeaseAck, LeaseId, WatchEvent,
    WatchStream,
};
use crate::{Error, Result};

const WATCH_CAPACITY: usize = 256;

#[derive(Debug)]
struct Stored {
    value: String,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct Lease {
    ttl: i64,
    // Dropped on revocation, which ends every keep-alive stream of the lease.
    _alive: watch::Sender<()>,
    alive: watch::Receiver<()>,
}

#[derive(Debug, Default)]
struct State {
    kvs: BTreeMap<String, Stored>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: i64,
}

/// An in-memory [`CoordinationStore`].
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    events: Mutex<Option<broadcast::Sender<Vec<WatchEvent>>>>,
    scans: AtomicUsize,
    unavailable: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            events: Mutex::new(Some(events)),
            scans: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Number of prefix scans served so far.
    #[must_use]
    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    /// Makes every request fail as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Current keys, in order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.lock().kvs.keys().cloned().collect()
    }

    /// Lease attached to `key`, if any.
    #[must_use]
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        self.lock().kvs.get(key).and_then(|s| s.lease)
    }

    /// Whether `lease` is still live.
    #[must_use]
    pub fn has_lease(&self, lease: LeaseId) -> bool {
        self.lock().leases.contains_key(&lease)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Store("store unavailable".to_string()));
        }

        if self
            .events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_none()
        {
            return Err(Error::Closed);
        }

        Ok(())
    }

    fn publish(&self, batch: Vec<WatchEvent>) {
        if batch.is_empty() {
            return;
        }

        if let Some(tx) = self
            .events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
        {
            // No receivers is fine.
            let _ = tx.send(batch);
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        self.check()?;
        Ok(self.lock().kvs.get(key).map(|s| KeyValue {
            key: key.to_string(),
            value: s.value.clone(),
        }))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        self.check()?;
        self.scans.fetch_add(1, Ordering::SeqCst);

        let state = self.lock();
        Ok(state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, s)| KeyValue {
                key: k.clone(),
                value: s.value.clone(),
            })
            .collect())
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        self.check()?;

        {
            let mut state = self.lock();
            if let Some(id) = lease {
                if !state.leases.contains_key(&id) {
                    return Err(Error::LeaseNotFound(id.0));
                }
            }

            state.kvs.insert(
                key.to_string(),
                Stored {
                    value: value.to_string(),
                    lease,
                },
            );
        }

        self.publish(vec![WatchEvent {
            kind: EventKind::Put,
            key: key.to_string(),
        }]);

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check()?;

        let removed = self.lock().kvs.remove(key).is_some();
        if removed {
            self.publish(vec![WatchEvent {
                kind: EventKind::Delete,
                key: key.to_string(),
            }]);
        }

        Ok(())
    }

    async fn grant_lease(&self, ttl: i64) -> Result<LeaseId> {
        self.check()?;

        let mut state = self.lock();
        state.next_lease += 1;
        let id = LeaseId(state.next_lease);
        let (tx, rx) = watch::channel(());
        state.leases.insert(
            id,
            Lease {
                ttl,
                _alive: tx,
                alive: rx,
            },
        );

        Ok(id)
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.check()?;

        let batch = {
            let mut state = self.lock();
            if state.leases.remove(&lease).is_none() {
                return Err(Error::LeaseNotFound(lease.0));
            }

            let attached: Vec<String> = state
                .kvs
                .iter()
                .filter(|(_, s)| s.lease == Some(lease))
                .map(|(k, _)| k.clone())
                .collect();

            attached
                .into_iter()
                .map(|key| {
                    state.kvs.remove(&key);
                    WatchEvent {
                        kind: EventKind::Delete,
                        key,
                    }
                })
                .collect()
        };

        self.publish(batch);
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId, interval: Duration) -> Result<KeepAliveStream> {
        self.check()?;

        let (ttl, alive) = {
            let state = self.lock();
            let entry = state
                .leases
                .get(&lease)
                .ok_or(Error::LeaseNotFound(lease.0))?;
            (entry.ttl, entry.alive.clone())
        };

        let ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        let renewals = stream::unfold((ticker, alive), move |(mut ticker, mut alive)| async move {
            tokio::select! {
                _ = ticker.tick() => {
                    if alive.has_changed().is_err() {
                        return None;
                    }

                    Some((Ok(LeaseAck { lease, ttl }), (ticker, alive)))
                }

                // Only errors: the sender never sends, it is dropped on revocation.
                _ = alive.changed() => None,
            }
        });

        Ok(renewals.boxed())
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream> {
        self.check()?;

        let rx = self
            .events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .ok_or(Error::Closed)?
            .subscribe();

        let prefix = prefix.to_string();
        let batches = stream::unfold((rx, prefix), |(mut rx, prefix)| async move {
            loop {
                match rx.recv().await {
                    Ok(batch) => {
                        let events: Vec<WatchEvent> = batch
                            .into_iter()
                            .filter(|e| e.key.starts_with(&prefix))
                            .collect();

                        if !events.is_empty() {
                            return Some((Ok(events), (rx, prefix)));
                        }
                    }

                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        return Some((Err(Error::WatchLagged(skipped)), (rx, prefix)));
                    }

                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(batches.boxed())
    }

    async fn close(&self) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();

        // Ends open keep-alive streams.
        self.lock().leases.clear();
    }
}
