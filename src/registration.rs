//! Registration of this process's own endpoint under a renewed lease.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::key::{EndpointDescriptor, EndpointKey};
use crate::store::{CoordinationStore, KeepAliveStream, LeaseId};
use crate::{Error, Result};

/// Lifecycle of this process's registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaseStatus {
    /// Nothing is registered.
    Unregistered,
    /// A lease is being granted and the endpoint attached.
    Registering,
    /// The endpoint is attached and its lease is being renewed.
    Registered {
        /// The registered endpoint.
        key: EndpointKey,
        /// The lease keeping it alive.
        lease: LeaseId,
    },
    /// The endpoint is being removed.
    Unregistering,
    /// Renewal stopped; the store has dropped or will drop the endpoint.
    Lost {
        /// The endpoint that was registered.
        key: EndpointKey,
        /// The lease that was lost.
        lease: LeaseId,
    },
}

impl LeaseStatus {
    /// The endpoint of a live or lost registration.
    #[must_use]
    pub fn key(&self) -> Option<&EndpointKey> {
        match self {
            Self::Registered { key, .. } | Self::Lost { key, .. } => Some(key),
            _ => None,
        }
    }
}

struct Active {
    key: EndpointKey,
    lease: LeaseId,
    renewal: JoinHandle<()>,
}

pub(crate) struct Registrar {
    store: Arc<dyn CoordinationStore>,
    ttl: i64,
    active: Mutex<Option<Active>>,
    status: Arc<watch::Sender<LeaseStatus>>,
}

impl Registrar {
    pub fn new(store: Arc<dyn CoordinationStore>, ttl: i64) -> Self {
        let (status, _) = watch::channel(LeaseStatus::Unregistered);
        Self {
            store,
            ttl,
            active: Mutex::new(None),
            status: Arc::new(status),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LeaseStatus> {
        self.status.subscribe()
    }

    /// `host:port` of the current or last registration.
    pub fn target(&self) -> Option<String> {
        self.status.borrow().key().map(|k| k.address().to_string())
    }

    /// Grants a lease, attaches `key` to it and starts renewal.
    ///
    /// A registration whose lease was lost may be replaced; a live one may not.
    pub async fn register(&self, key: EndpointKey) -> Result<()> {
        let mut active = self.active.lock().await;

        if let Some(current) = active.take() {
            let lost = matches!(&*self.status.borrow(), LeaseStatus::Lost { .. });
            if !lost {
                let key = current.key.to_string();
                *active = Some(current);
                return Err(Error::AlreadyRegistered(key));
            }

            tracing::debug!("replacing lost registration {}", current.key);
            current.renewal.abort();
            if let Err(e) = self.store.revoke_lease(current.lease).await {
                tracing::debug!("lost lease {} not revoked: {e}", current.lease);
            }
        }

        self.status.send_replace(LeaseStatus::Registering);

        let (lease, renewals) = match self.attach(&key).await {
            Ok(attached) => attached,
            Err(e) => {
                self.status.send_replace(LeaseStatus::Unregistered);
                return Err(e);
            }
        };

        self.status.send_replace(LeaseStatus::Registered {
            key: key.clone(),
            lease,
        });

        let renewal = tokio::spawn(renew(renewals, key.clone(), lease, Arc::clone(&self.status)));
        tracing::debug!("registered {key} with lease {lease}");

        *active = Some(Active {
            key,
            lease,
            renewal,
        });

        Ok(())
    }

    async fn attach(&self, key: &EndpointKey) -> Result<(LeaseId, KeepAliveStream)> {
        let value = EndpointDescriptor::encode(key)?;
        let lease = self.store.grant_lease(self.ttl).await?;

        let attached = async {
            self.store.put(&key.to_string(), &value, Some(lease)).await?;
            self.store.keep_alive(lease, self.renewal_interval()).await
        }
        .await;

        match attached {
            Ok(renewals) => Ok((lease, renewals)),
            Err(e) => {
                if let Err(revoke) = self.store.revoke_lease(lease).await {
                    tracing::warn!("failed to revoke lease {lease} after failed registration: {revoke}");
                }

                Err(e)
            }
        }
    }

    /// Deletes the registered key, revokes its lease and stops renewal.
    pub async fn unregister(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        let Some(current) = active.take() else {
            return Err(Error::NotRegistered);
        };

        self.status.send_replace(LeaseStatus::Unregistering);
        current.renewal.abort();

        let key = current.key.to_string();
        let deleted = self.store.delete(&key).await;
        let revoked = self.store.revoke_lease(current.lease).await;
        self.status.send_replace(LeaseStatus::Unregistered);

        deleted?;
        match revoked {
            // Already expired: the key is gone either way.
            Ok(()) | Err(Error::LeaseNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        tracing::debug!("unregistered {key}");
        Ok(())
    }

    #[cfg(test)]
    pub async fn is_registered(&self) -> bool {
        self.active.lock().await.is_some()
    }

    fn renewal_interval(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.ttl).unwrap_or(1).max(1)) / 3
    }
}

/// Consumes renewal acknowledgements until the stream ends or reports a dead lease.
async fn renew(
    mut renewals: KeepAliveStream,
    key: EndpointKey,
    lease: LeaseId,
    status: Arc<watch::Sender<LeaseStatus>>,
) {
    let reason = loop {
        match renewals.next().await {
            Some(Ok(ack)) if ack.ttl > 0 => {
                tracing::trace!("lease {lease} renewed, ttl {}s", ack.ttl);
            }

            Some(Ok(_)) => break "lease expired".to_string(),
            Some(Err(e)) => break e.to_string(),
            None => break "keep-alive stream closed".to_string(),
        }
    };

    let lost = status.send_if_modified(|current| match current {
        LeaseStatus::Registered { lease: live, .. } if *live == lease => {
            *current = LeaseStatus::Lost {
                key: key.clone(),
                lease,
            };
            true
        }
        _ => false,
    });

    if lost {
        tracing::warn!("registration {key} lost lease {lease}: {reason}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn endpoint() -> EndpointKey {
        EndpointKey::new("svc", "chat", "10.0.0.1", 9000).unwrap()
    }

    fn registrar(store: &Arc<MemoryStore>) -> Registrar {
        Registrar::new(Arc::clone(store) as Arc<dyn CoordinationStore>, 30)
    }

    #[tokio::test]
    async fn register_attaches_key_to_lease() {
        let store = Arc::new(MemoryStore::new());
        let registrar = registrar(&store);

        registrar.register(endpoint()).await.unwrap();

        assert_eq!(store.keys(), vec!["svc/chat/10.0.0.1:9000".to_string()]);
        let lease = store.lease_of("svc/chat/10.0.0.1:9000").unwrap();
        assert_eq!(
            *registrar.subscribe().borrow(),
            LeaseStatus::Registered {
                key: endpoint(),
                lease
            }
        );
        assert_eq!(registrar.target().as_deref(), Some("10.0.0.1:9000"));

        let stored = store.get("svc/chat/10.0.0.1:9000").await.unwrap().unwrap();
        assert_eq!(stored.value, r#"{"Addr":"10.0.0.1:9000","Metadata":null}"#);
    }

    #[tokio::test]
    async fn register_twice_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let registrar = registrar(&store);
        registrar.register(endpoint()).await.unwrap();

        let other = EndpointKey::new("svc", "chat", "10.0.0.2", 9000).unwrap();
        let err = registrar.register(other).await.unwrap_err();

        assert!(matches!(err, Error::AlreadyRegistered(_)));
        assert_eq!(store.keys().len(), 1);
    }

    #[tokio::test]
    async fn unregister_without_register_fails_without_mutation() {
        let store = Arc::new(MemoryStore::new());
        store.put("svc/chat/10.0.0.9:9000", "", None).await.unwrap();
        let registrar = registrar(&store);

        assert!(matches!(registrar.unregister().await, Err(Error::NotRegistered)));
        assert_eq!(store.keys().len(), 1);
    }

    #[tokio::test]
    async fn unregister_deletes_key_and_revokes_lease() {
        let store = Arc::new(MemoryStore::new());
        let registrar = registrar(&store);
        registrar.register(endpoint()).await.unwrap();
        let lease = store.lease_of("svc/chat/10.0.0.1:9000").unwrap();

        registrar.unregister().await.unwrap();

        assert!(store.keys().is_empty());
        assert!(!store.has_lease(lease));
        assert_eq!(*registrar.subscribe().borrow(), LeaseStatus::Unregistered);
        assert!(!registrar.is_registered().await);
        assert!(matches!(registrar.unregister().await, Err(Error::NotRegistered)));
    }

    #[tokio::test]
    async fn failed_grant_leaves_nothing_behind() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let registrar = registrar(&store);

        assert!(registrar.register(endpoint()).await.is_err());

        store.set_unavailable(false);
        assert!(store.keys().is_empty());
        assert_eq!(*registrar.subscribe().borrow(), LeaseStatus::Unregistered);
        assert!(!registrar.is_registered().await);
    }

    #[tokio::test]
    async fn lost_lease_is_observable_and_replaceable() {
        let store = Arc::new(MemoryStore::new());
        let registrar = registrar(&store);
        let mut status = registrar.subscribe();
        registrar.register(endpoint()).await.unwrap();
        let lease = store.lease_of("svc/chat/10.0.0.1:9000").unwrap();

        store.revoke_lease(lease).await.unwrap();

        tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(|s| matches!(s, LeaseStatus::Lost { .. })),
        )
        .await
        .unwrap()
        .unwrap();

        registrar.register(endpoint()).await.unwrap();

        assert_eq!(store.keys(), vec!["svc/chat/10.0.0.1:9000".to_string()]);
        assert!(matches!(
            *registrar.subscribe().borrow(),
            LeaseStatus::Registered { .. }
        ));
    }
}
