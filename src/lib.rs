#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! etcd service registration and discovery for [Tonic](https://docs.rs/tonic) gRPC clients.
//!
//! Each process registers its own gRPC endpoint under a service name with a
//! lease that is renewed in the background, so the entry disappears when the
//! process dies or is partitioned away. Other processes resolve service names
//! into tonic channels, kept in step with the store by a watch rather than by
//! polling.
//!
//! # Features
//!
//! - **Leased self-registration**: `{root}/{service}/{host}:{port}` attached to a renewed lease
//! - **Observable lease loss**: a status channel reports when renewal stops
//! - **Watched connection cache**: channels per service, refreshed on every change
//! - **Live resolution**: one balanced channel resolved against the store on demand
//! - **Pluggable store**: etcd by default, an in-memory store for tests
//!
//! # Usage
//!
//! ```ignore
//! use std::time::Duration;
//! use tonic_lb_etcd::{Registry, RegistryConfig, dial_option};
//!
//! let config = RegistryConfig::new("openim", ["127.0.0.1:2379"])
//!     .connect_timeout(Duration::from_secs(5));
//! let registry = Registry::connect(config).await?;
//!
//! // Announce this process
//! registry.register("msg-gateway", "10.0.0.1", 10140).await?;
//!
//! // Resolve other services
//! registry
//!     .add_dial_options([dial_option(|e| e.timeout(Duration::from_secs(10)))])
//!     .await;
//! let channels = registry.get_connections("user").await?;
//!
//! // Use with your generated gRPC client
//! // let client = UserClient::new(channels[0].channel());
//!
//! registry.close().await;
//! ```

mod cache;
mod config;
mod dial;
mod error;
#[cfg(feature = "etcd")]
mod etcd;
mod health;
mod key;
pub mod memory;
mod registration;
mod registry;
pub mod store;
mod watch;

pub use config::{DEFAULT_DIAL_TIMEOUT, DEFAULT_LEASE_TTL, RegistryConfig};
pub use dial::{ConnectDialer, Connection, DialOption, Dialer, LazyDialer, dial_option};
pub use error::{Error, Result};
#[cfg(feature = "etcd")]
pub use etcd::EtcdStore;
#[cfg(feature = "etcd")]
pub use health::check;
pub use health::{DEFAULT_CHECK_TIMEOUT, check_store};
pub use key::{EndpointKey, ServiceKey};
pub use memory::MemoryStore;
pub use registration::LeaseStatus;
pub use registry::Registry;
pub use store::{CoordinationStore, LeaseId};
