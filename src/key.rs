//! Store key layout: `{root}/{service}/{host}:{port}`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Identity of a named service within a root directory: `root/service`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceKey(String);

impl ServiceKey {
    /// Builds the key for `service` under `root`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidServiceName`] if `service` is empty or contains `/`.
    pub fn new(root: &str, service: &str) -> Result<Self> {
        if service.is_empty() || service.contains('/') {
            return Err(Error::InvalidServiceName(service.to_string()));
        }

        Ok(Self(format!("{root}/{service}")))
    }

    /// The key as stored.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix matching every endpoint of this service.
    #[must_use]
    pub fn prefix(&self) -> String {
        format!("{}/", self.0)
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one registered instance: `root/service/host:port`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    service: ServiceKey,
    address: String,
}

impl EndpointKey {
    /// Builds the key for `host:port` of `service` under `root`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidServiceName`] if `service` is empty or contains `/`.
    pub fn new(root: &str, service: &str, host: &str, port: u16) -> Result<Self> {
        Ok(Self {
            service: ServiceKey::new(root, service)?,
            address: format!("{host}:{port}"),
        })
    }

    /// Splits a stored key at its last `/` into service key and address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedKey`] if the key is outside `root/` or has no address segment.
    pub fn parse(root: &str, key: &str) -> Result<Self> {
        let malformed = || Error::MalformedKey(key.to_string());

        let (service, address) = key.rsplit_once('/').ok_or_else(malformed)?;
        let name = service
            .strip_prefix(root)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(malformed)?;

        if address.is_empty() || name.is_empty() || name.contains('/') {
            return Err(malformed());
        }

        Ok(Self {
            service: ServiceKey(service.to_string()),
            address: address.to_string(),
        })
    }

    /// The service this endpoint belongs to.
    #[must_use]
    pub fn service(&self) -> &ServiceKey {
        &self.service
    }

    /// The `host:port` dial target.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.address)
    }
}

/// Value stored under an endpoint key, readable by etcd's gRPC naming resolvers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct EndpointDescriptor {
    #[serde(rename = "Addr")]
    pub addr: String,
    #[serde(rename = "Metadata")]
    pub metadata: Option<serde_json::Value>,
}

impl EndpointDescriptor {
    pub fn encode(key: &EndpointKey) -> Result<String> {
        let descriptor = Self {
            addr: key.address().to_string(),
            metadata: None,
        };

        Ok(serde_json::to_string(&descriptor)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_key_layout() {
        let key = ServiceKey::new("svc", "chat").unwrap();

        assert_eq!(key.as_str(), "svc/chat");
        assert_eq!(key.prefix(), "svc/chat/");
    }

    #[test]
    fn service_key_rejects_separators_and_empty_names() {
        assert!(matches!(
            ServiceKey::new("svc", "a/b"),
            Err(Error::InvalidServiceName(_))
        ));
        assert!(matches!(
            ServiceKey::new("svc", ""),
            Err(Error::InvalidServiceName(_))
        ));
    }

    #[test]
    fn endpoint_key_layout() {
        let key = EndpointKey::new("svc", "chat", "10.0.0.1", 9000).unwrap();

        assert_eq!(key.to_string(), "svc/chat/10.0.0.1:9000");
        assert_eq!(key.address(), "10.0.0.1:9000");
        assert_eq!(key.service().as_str(), "svc/chat");
    }

    #[test]
    fn parse_splits_at_last_separator() {
        let key = EndpointKey::parse("svc", "svc/chat/10.0.0.1:9000").unwrap();

        assert_eq!(key.service().as_str(), "svc/chat");
        assert_eq!(key.address(), "10.0.0.1:9000");
    }

    #[test]
    fn parse_accepts_nested_roots() {
        let key = EndpointKey::parse("openim/rpc", "openim/rpc/msg/[::1]:10300").unwrap();

        assert_eq!(key.service().as_str(), "openim/rpc/msg");
        assert_eq!(key.address(), "[::1]:10300");
    }

    #[test]
    fn parse_rejects_foreign_and_truncated_keys() {
        for key in ["other/chat/10.0.0.1:9000", "svc/10.0.0.1:9000", "svc/chat/", "svc", "svcx/chat/a:1"] {
            assert!(
                matches!(EndpointKey::parse("svc", key), Err(Error::MalformedKey(_))),
                "{key} should be rejected"
            );
        }
    }

    #[test]
    fn parse_rejects_deeper_paths() {
        assert!(EndpointKey::parse("svc", "svc/chat/extra/10.0.0.1:9000").is_err());
    }

    #[test]
    fn descriptor_uses_naming_manager_field_names() {
        let key = EndpointKey::new("svc", "chat", "10.0.0.1", 9000).unwrap();
        let encoded = EndpointDescriptor::encode(&key).unwrap();

        assert_eq!(encoded, r#"{"Addr":"10.0.0.1:9000","Metadata":null}"#);

        let decoded: EndpointDescriptor = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.addr, "10.0.0.1:9000");
    }
}
