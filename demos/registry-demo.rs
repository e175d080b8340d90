//! Registers this process in etcd and resolves a service until interrupted.
//!
//! # Running locally
//!
//! ```bash
//! etcd &
//! cargo run --example registry-demo
//! ```
//!
//! # Environment Variables
//!
//! - `REGISTRY_ROOT`: root directory (default: registry)
//! - `ETCD_ENDPOINTS`: comma-separated etcd addresses (default: 127.0.0.1:2379)
//! - `SERVICE_NAME`: name to register and resolve (default: greeter)
//! - `GRPC_HOST`: host to register (default: 127.0.0.1)
//! - `GRPC_PORT`: port to register (default: 50051)
//! - `RESOLVE_INTERVAL_MS`: milliseconds between resolutions (default: 2000)

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tonic_lb_etcd::{EtcdStore, LazyDialer, LeaseStatus, Registry, RegistryConfig, check};
use tracing::{Level, error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    let config = RegistryConfig::from_env();
    let service_name = env::var("SERVICE_NAME").unwrap_or_else(|_| "greeter".to_string());
    let host = env::var("GRPC_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("GRPC_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(50051);
    let interval_ms: u64 = env::var("RESOLVE_INTERVAL_MS")
        .ok()
        .and_then(|i| i.parse().ok())
        .unwrap_or(2000);

    info!("Root: {}", config.root);
    info!("etcd: {:?}", config.endpoints);

    check(&config, true).await?;
    info!("Root node present");

    // Nothing listens on the registered port, so connect lazily.
    let store = EtcdStore::connect(&config).await?;
    let registry = Registry::with_store(config, Arc::new(store), Arc::new(LazyDialer));

    registry.register(&service_name, &host, port).await?;
    info!("Registered as {}", registry.self_target().unwrap_or_default());

    let mut status = registry.lease_status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            if let LeaseStatus::Lost { key, lease } = &*status.borrow() {
                warn!("Lease {lease} for {key} lost");
            }
        }
    });

    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match registry.get_connections(&service_name).await {
                    Ok(connections) => {
                        let targets: Vec<_> = connections.iter().map(|c| c.target()).collect();
                        info!("{service_name}: {targets:?}");
                    }

                    Err(e) => error!("Resolution failed: {e}"),
                }
            }

            _ = tokio::signal::ctrl_c() => break,
        }
    }

    registry.close().await;
    info!("Unregistered and closed");

    Ok(())
}
