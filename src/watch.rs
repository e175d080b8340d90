//! Background task keeping the connection cache in step with the store.
//!
//! # How It Works
//!
//! 1. Subscribes to every key under `root/`
//! 2. Maps each change batch to the services it touches
//! 3. Refreshes those services, or rebuilds everything when a key cannot be
//!    attributed to a service or the subscription lagged
//! 4. Exits when the subscription ends; reconnecting is left to the store client

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;

use crate::cache::ConnectionCache;
use crate::key::{EndpointKey, ServiceKey};
use crate::store::{CoordinationStore, WatchEvent};
use crate::{Error, Result};

/// What a change batch requires of the cache.
#[derive(Debug, PartialEq, Eq)]
enum Refresh {
    Services(BTreeSet<ServiceKey>),
    All,
}

/// Starts the watch loop.
pub(crate) fn spawn(
    store: Arc<dyn CoordinationStore>,
    cache: Arc<ConnectionCache>,
    root: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = watch_loop(store, cache, &root).await {
            tracing::error!("watch on {root} failed: {e}");
        }
    })
}

async fn watch_loop(
    store: Arc<dyn CoordinationStore>,
    cache: Arc<ConnectionCache>,
    root: &str,
) -> Result<()> {
    let prefix = format!("{root}/");
    let mut stream = store.watch(&prefix).await?;

    tracing::debug!("watching {prefix} for endpoint changes");

    while let Some(batch) = stream.next().await {
        let refresh = match batch {
            Ok(events) => process_events(root, &events),
            Err(e) => {
                tracing::warn!("watch on {prefix} interrupted: {e}");
                Refresh::All
            }
        };

        let outcome = match refresh {
            Refresh::Services(services) => {
                // A first build may be scanning right now; make sure it is not kept.
                if cache.discard_pending().await {
                    continue;
                }

                let mut outcome = Ok(());
                for service in &services {
                    if let Err(e) = cache.refresh(service).await {
                        outcome = Err(e);
                        break;
                    }
                }

                outcome
            }

            Refresh::All => cache.rebuild().await,
        };

        match outcome {
            Ok(()) => {}
            Err(Error::Closed) => break,
            // The cache stays as it was; the next batch retries.
            Err(e) => tracing::warn!("failed to apply changes under {prefix}: {e}"),
        }
    }

    tracing::debug!("watch on {prefix} closed");
    Ok(())
}

/// Maps a change batch to the services it affects.
fn process_events(root: &str, events: &[WatchEvent]) -> Refresh {
    let mut services = BTreeSet::new();

    for event in events {
        match EndpointKey::parse(root, &event.key) {
            Ok(endpoint) => {
                tracing::debug!("{:?} {endpoint}", event.kind);
                services.insert(endpoint.service().clone());
            }

            Err(_) => {
                tracing::debug!("unattributable change to {}, rebuilding", event.key);
                return Refresh::All;
            }
        }
    }

    Refresh::Services(services)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::tests::TestDialer;
    use crate::memory::MemoryStore;
    use crate::store::EventKind;

    fn put(key: &str) -> WatchEvent {
        WatchEvent {
            kind: EventKind::Put,
            key: key.to_string(),
        }
    }

    fn delete(key: &str) -> WatchEvent {
        WatchEvent {
            kind: EventKind::Delete,
            key: key.to_string(),
        }
    }

    fn service(name: &str) -> ServiceKey {
        ServiceKey::new("svc", name).unwrap()
    }

    // process_events tests

    #[test]
    fn process_events_collects_distinct_services() {
        let events = [
            put("svc/chat/10.0.0.1:9000"),
            delete("svc/chat/10.0.0.2:9000"),
            put("svc/push/10.0.0.3:9100"),
        ];

        let refresh = process_events("svc", &events);

        assert_eq!(
            refresh,
            Refresh::Services([service("chat"), service("push")].into_iter().collect())
        );
    }

    #[test]
    fn process_events_empty_batch_refreshes_nothing() {
        assert_eq!(process_events("svc", &[]), Refresh::Services(BTreeSet::new()));
    }

    #[test]
    fn process_events_unattributable_key_rebuilds_all() {
        let events = [put("svc/chat/10.0.0.1:9000"), put("svc/chat")];
        assert_eq!(process_events("svc", &events), Refresh::All);
    }

    // watch loop tests

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        panic!("condition not met in time");
    }

    fn setup() -> (Arc<MemoryStore>, Arc<ConnectionCache>) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(ConnectionCache::new(
            Arc::clone(&store) as Arc<dyn CoordinationStore>,
            Arc::new(TestDialer::default()),
            "svc",
            None,
        ));

        (store, cache)
    }

    #[tokio::test]
    async fn watch_loop_applies_puts_and_deletes() {
        let (store, cache) = setup();
        cache.resolve(&service("chat")).await.unwrap();
        let task = spawn(store.clone(), Arc::clone(&cache), "svc".to_string());
        tokio::task::yield_now().await;

        let c = &*cache;
        store.put("svc/chat/10.0.0.1:9000", "", None).await.unwrap();
        eventually(move || async move { c.resolve(&service("chat")).await.unwrap().len() == 1 }).await;

        store.delete("svc/chat/10.0.0.1:9000").await.unwrap();
        eventually(move || async move { c.resolve(&service("chat")).await.unwrap().is_empty() }).await;

        task.abort();
    }

    #[tokio::test]
    async fn watch_loop_leaves_unpopulated_cache_alone() {
        let (store, cache) = setup();
        let task = spawn(store.clone(), Arc::clone(&cache), "svc".to_string());
        tokio::task::yield_now().await;

        store.put("svc/chat/10.0.0.1:9000", "", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.scan_count(), 0);
        assert!(!cache.is_populated().await);
        task.abort();
    }

    #[tokio::test]
    async fn watch_loop_catches_changes_during_first_build() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(ConnectionCache::new(
            Arc::clone(&store) as Arc<dyn CoordinationStore>,
            Arc::new(TestDialer::slow(Duration::from_millis(200))),
            "svc",
            None,
        ));
        store.put("svc/chat/10.0.0.1:9000", "", None).await.unwrap();
        let task = spawn(store.clone(), Arc::clone(&cache), "svc".to_string());
        tokio::task::yield_now().await;

        let first = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move { cache.resolve(&service("chat")).await.unwrap().len() }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        store.put("svc/chat/10.0.0.2:9000", "", None).await.unwrap();
        assert_eq!(first.await.unwrap(), 1);

        let c = &*cache;
        eventually(move || async move {
            c.resolve(&service("chat")).await.unwrap().len() == 2
        })
        .await;

        task.abort();
    }

    #[tokio::test]
    async fn watch_loop_exits_when_store_closes() {
        let (store, cache) = setup();
        let task = spawn(store.clone(), cache, "svc".to_string());
        tokio::task::yield_now().await;

        store.close().await;

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("watch loop should stop")
            .unwrap();
    }
}
