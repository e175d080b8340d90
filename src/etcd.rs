//! etcd-backed coordination store.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, LeaseKeepAliveStream, LeaseKeeper, PutOptions,
    WatchOptions,
};
use futures::StreamExt;
use futures::stream;

use crate::store::{
    CoordinationStore, EventKind, KeepAliveStream, KeyValue, LeaseAck, LeaseId, WatchEvent,
    WatchStream,
};
use crate::{Error, RegistryConfig, Result};

type KeepAliveState = Option<(LeaseKeeper, LeaseKeepAliveStream, tokio::time::Interval)>;

/// A [`CoordinationStore`] talking to an etcd cluster.
pub struct EtcdStore {
    client: Mutex<Option<Client>>,
}

impl EtcdStore {
    /// Connects to the cluster members listed in `config.endpoints`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Etcd`] if the client cannot be created.
    pub async fn connect(config: &RegistryConfig) -> Result<Self> {
        let mut options = ConnectOptions::new().with_keep_alive_while_idle(true);
        if let Some(timeout) = config.dial_timeout {
            options = options.with_connect_timeout(timeout);
        }

        let client = Client::connect(&config.endpoints, Some(options)).await?;
        tracing::debug!("connected to etcd at {:?}", config.endpoints);

        Ok(Self {
            client: Mutex::new(Some(client)),
        })
    }

    /// The client is cheap to clone; each request works on its own handle.
    fn client(&self) -> Result<Client> {
        self.client
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .ok_or(Error::Closed)
    }
}

fn key_value(kv: &etcd_client::KeyValue) -> Option<KeyValue> {
    Some(KeyValue {
        key: kv.key_str().ok()?.to_string(),
        value: kv.value_str().unwrap_or_default().to_string(),
    })
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let resp = self.client()?.get(key, None).await?;
        Ok(resp.kvs().first().and_then(key_value))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let resp = self
            .client()?
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        Ok(resp.kvs().iter().filter_map(key_value).collect())
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        let options = lease.map(|id| PutOptions::new().with_lease(id.0));
        self.client()?.put(key, value, options).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client()?.delete(key, None).await?;
        Ok(())
    }

    async fn grant_lease(&self, ttl: i64) -> Result<LeaseId> {
        let resp = self.client()?.lease_grant(ttl, None).await?;
        Ok(LeaseId(resp.id()))
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.client()?.lease_revoke(lease.0).await?;
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId, interval: Duration) -> Result<KeepAliveStream> {
        let (keeper, responses) = self.client()?.lease_keep_alive(lease.0).await?;
        let ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));

        let renewals = stream::unfold(
            Some((keeper, responses, ticker)),
            |state: KeepAliveState| async move {
                let (mut keeper, mut responses, mut ticker) = state?;
                ticker.tick().await;

                if let Err(e) = keeper.keep_alive().await {
                    return Some((Err(Error::from(e)), None));
                }

                match responses.message().await {
                    Ok(Some(resp)) => Some((
                        Ok(LeaseAck {
                            lease: LeaseId(resp.id()),
                            ttl: resp.ttl(),
                        }),
                        Some((keeper, responses, ticker)),
                    )),

                    Ok(None) => None,
                    Err(e) => Some((Err(Error::from(e)), None)),
                }
            },
        );

        Ok(renewals.boxed())
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream> {
        let (watcher, responses) = self
            .client()?
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await?;

        // The watcher handle must outlive the stream, or the server cancels the watch.
        let batches = stream::unfold(Some((watcher, responses)), |state| async move {
            let (watcher, mut responses) = state?;

            loop {
                match responses.message().await {
                    Ok(Some(resp)) if resp.canceled() => {
                        tracing::debug!("etcd watch {} canceled", resp.watch_id());
                        return None;
                    }

                    Ok(Some(resp)) => {
                        let events: Vec<WatchEvent> = resp
                            .events()
                            .iter()
                            .filter_map(|event| {
                                let key = event.kv()?.key_str().ok()?.to_string();
                                let kind = match event.event_type() {
                                    EventType::Put => EventKind::Put,
                                    EventType::Delete => EventKind::Delete,
                                };

                                Some(WatchEvent { kind, key })
                            })
                            .collect();

                        // Progress notifications carry no events.
                        if !events.is_empty() {
                            return Some((Ok(events), Some((watcher, responses))));
                        }
                    }

                    Ok(None) => return None,
                    Err(e) => return Some((Err(Error::from(e)), None)),
                }
            }
        });

        Ok(batches.boxed())
    }

    async fn close(&self) {
        self.client
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
    }
}
