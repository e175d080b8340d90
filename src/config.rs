//! Registry configuration.

use std::env;
use std::time::Duration;

/// Default timeout for establishing the store connection.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time-to-live of the registration lease.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

/// Configuration for an etcd-backed service registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryConfig {
    /// The root directory all services are registered under, without a trailing `/`.
    pub root: String,

    /// Addresses of the coordination store cluster members.
    pub endpoints: Vec<String>,

    /// Timeout for connecting to the coordination store.
    /// Also bounds each health check operation.
    pub dial_timeout: Option<Duration>,

    /// Time-to-live of the lease attached to this process's registration.
    pub lease_ttl: Duration,

    /// Connect timeout applied to every service endpoint before user dial options.
    pub connect_timeout: Option<Duration>,
}

impl RegistryConfig {
    /// Creates a new registry configuration.
    ///
    /// Trailing slashes are stripped from `root`.
    #[must_use]
    pub fn new<I, S>(root: impl Into<String>, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let root = root.into();
        Self {
            root: root.trim_end_matches('/').to_string(),
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            dial_timeout: Some(DEFAULT_DIAL_TIMEOUT),
            lease_ttl: DEFAULT_LEASE_TTL,
            connect_timeout: None,
        }
    }

    /// Reads the configuration from the environment.
    ///
    /// - `REGISTRY_ROOT`: root directory (default: `registry`)
    /// - `ETCD_ENDPOINTS`: comma-separated store addresses (default: `127.0.0.1:2379`)
    /// - `REGISTRY_DIAL_TIMEOUT_MS`: store connect timeout in milliseconds
    /// - `REGISTRY_LEASE_TTL_SECS`: registration lease TTL in seconds
    ///
    /// Unparseable numeric values fall back to the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let root = env::var("REGISTRY_ROOT").unwrap_or_else(|_| "registry".to_string());
        let endpoints = env::var("ETCD_ENDPOINTS").unwrap_or_else(|_| "127.0.0.1:2379".to_string());
        let mut config = Self::new(
            root,
            endpoints
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(String::from),
        );

        if let Some(ms) = env::var("REGISTRY_DIAL_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config = config.dial_timeout(Duration::from_millis(ms));
        }

        if let Some(secs) = env::var("REGISTRY_LEASE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config = config.lease_ttl(Duration::from_secs(secs));
        }

        config
    }

    /// Sets the store connect timeout.
    #[must_use]
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = Some(timeout);
        self
    }

    /// Sets the registration lease time-to-live. Sub-second values round up to one second.
    #[must_use]
    pub fn lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl.max(Duration::from_secs(1));
        self
    }

    /// Sets the connect timeout applied to every service endpoint.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Lease TTL in whole seconds, as the store expects it.
    pub(crate) fn lease_ttl_secs(&self) -> i64 {
        i64::try_from(self.lease_ttl.as_secs()).unwrap_or(i64::MAX)
    }
}
