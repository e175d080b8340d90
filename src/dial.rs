//! Dialing service endpoints into tonic channels.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::{Channel, Endpoint};

use crate::Result;

/// Option applied to every endpoint before it is dialed.
///
/// Options run in the order they were added, after the configured connect timeout.
pub type DialOption = Arc<dyn Fn(Endpoint) -> Endpoint + Send + Sync>;

/// Wraps a closure as a [`DialOption`].
///
/// ```ignore
/// use std::time::Duration;
///
/// let option = tonic_lb_etcd::dial_option(|e| e.timeout(Duration::from_secs(10)));
/// registry.add_dial_options([option]).await;
/// ```
#[must_use]
pub fn dial_option<F>(f: F) -> DialOption
where
    F: Fn(Endpoint) -> Endpoint + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Establishes channels to resolved endpoints.
#[allow(clippy::missing_errors_doc)]
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Dials a fully configured endpoint.
    async fn dial(&self, endpoint: Endpoint) -> std::result::Result<Channel, tonic::transport::Error>;
}

/// Connects eagerly, so unreachable endpoints fail at dial time.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnectDialer;

#[async_trait]
impl Dialer for ConnectDialer {
    async fn dial(&self, endpoint: Endpoint) -> std::result::Result<Channel, tonic::transport::Error> {
        endpoint.connect().await
    }
}

/// Connects on first use; dialing never fails once the endpoint is valid.
#[derive(Clone, Copy, Debug, Default)]
pub struct LazyDialer;

#[async_trait]
impl Dialer for LazyDialer {
    async fn dial(&self, endpoint: Endpoint) -> std::result::Result<Channel, tonic::transport::Error> {
        Ok(endpoint.connect_lazy())
    }
}

/// A channel to one resolved target.
///
/// Clones share the underlying connection, which is released when the last clone is dropped.
#[derive(Clone)]
pub struct Connection {
    target: String,
    channel: Channel,
}

impl Connection {
    pub(crate) fn new(target: impl Into<String>, channel: Channel) -> Self {
        Self {
            target: target.into(),
            channel,
        }
    }

    /// What this connection was dialed for.
    ///
    /// Connections from [`crate::Registry::get_connections`] carry the instance's
    /// `host:port`. The balanced connection from [`crate::Registry::get_connection`]
    /// carries `etcd:///root/service`, naming the service it spreads calls across.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// A handle to the channel, ready to hand to a generated client.
    #[must_use]
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// Consumes the connection, returning its channel.
    #[must_use]
    pub fn into_channel(self) -> Channel {
        self.channel
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// Builds the endpoint for `address` with the connect timeout and options applied.
pub(crate) fn build_endpoint(
    address: &str,
    connect_timeout: Option<Duration>,
    options: &[DialOption],
) -> Result<Endpoint> {
    let mut endpoint = Endpoint::from_shared(format!("http://{address}"))?;
    if let Some(timeout) = connect_timeout {
        endpoint = endpoint.connect_timeout(timeout);
    }

    Ok(options.iter().fold(endpoint, |endpoint, option| option(endpoint)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_endpoint_uses_http_scheme() {
        let endpoint = build_endpoint("10.0.0.1:9000", None, &[]).unwrap();

        assert_eq!(endpoint.uri().scheme_str(), Some("http"));
        assert_eq!(
            endpoint.uri().authority().map(|a| a.as_str()),
            Some("10.0.0.1:9000")
        );
    }

    #[test]
    fn build_endpoint_applies_options_in_order() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let options: Vec<DialOption> = (0..3)
            .map(|i| {
                let seen = Arc::clone(&seen);
                dial_option(move |e| {
                    seen.lock().unwrap().push(i);
                    e
                })
            })
            .collect();

        build_endpoint("[::1]:50051", Some(Duration::from_secs(1)), &options).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn build_endpoint_rejects_invalid_address() {
        assert!(build_endpoint("bad address", None, &[]).is_err());
    }

    #[tokio::test]
    async fn lazy_dialer_does_not_connect() {
        let endpoint = build_endpoint("10.255.255.1:9", None, &[]).unwrap();
        let channel = LazyDialer.dial(endpoint).await.unwrap();
        let connection = Connection::new("10.255.255.1:9", channel);

        assert_eq!(connection.target(), "10.255.255.1:9");
    }
}
