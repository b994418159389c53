//! Client configuration and the key sessions are pooled under.

use std::fmt;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::types::{EndpointUrl, IdentityKind, MessageSecurityMode, SecurityPolicy};

/// A subscription the session factory creates alongside the session.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SubscriptionConfig {
    /// Subscription name.
    pub name: String,
    /// Requested publishing interval.
    pub publishing_interval: Duration,
    /// Nodes to monitor, in string node-id form.
    pub monitored_nodes: Vec<String>,
}

impl SubscriptionConfig {
    /// Create a subscription with a 1 s publishing interval and no nodes.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            publishing_interval: Duration::from_secs(1),
            monitored_nodes: Vec::new(),
        }
    }

    /// Set the publishing interval.
    pub fn with_publishing_interval(mut self, interval: Duration) -> Self {
        self.publishing_interval = interval;
        self
    }

    /// Add a node to monitor.
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.monitored_nodes.push(node.into());
        self
    }
}

/// Validated client configuration handed over by the configuration source.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ClientConfig {
    /// Server endpoint.
    pub endpoint_url: EndpointUrl,
    /// Application name of the connection.
    pub connection_name: String,
    /// Application instance URI.
    pub application_uri: String,
    /// Product URI.
    pub product_uri: String,
    /// Security policy of the secure channel.
    pub security_policy: SecurityPolicy,
    /// Message security mode of the secure channel.
    pub message_security_mode: MessageSecurityMode,
    /// User identity.
    pub identity: IdentityKind,
    /// Session name requested from the server.
    pub session_name: String,
    /// Requested session timeout.
    pub session_timeout: Duration,
    /// Timeout of individual service requests.
    pub request_timeout: Duration,
    /// Subscriptions created with the session.
    pub subscriptions: Vec<SubscriptionConfig>,
}

impl ClientConfig {
    /// Create an anonymous, unsecured configuration.
    pub fn new(endpoint_url: impl Into<EndpointUrl>, connection_name: impl Into<String>) -> Self {
        let connection_name = connection_name.into();
        Self {
            endpoint_url: endpoint_url.into(),
            application_uri: format!("urn:opcua-pool:{connection_name}"),
            product_uri: "urn:opcua-pool".to_string(),
            session_name: connection_name.clone(),
            connection_name,
            security_policy: SecurityPolicy::None,
            message_security_mode: MessageSecurityMode::None,
            identity: IdentityKind::Anonymous,
            session_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(5),
            subscriptions: Vec::new(),
        }
    }

    /// Key sessions for this configuration are pooled under.
    pub fn key(&self) -> ClientKey {
        ClientKey::from(self)
    }

    /// Set the application URI.
    pub fn with_application_uri(mut self, uri: impl Into<String>) -> Self {
        self.application_uri = uri.into();
        self
    }

    /// Set the product URI.
    pub fn with_product_uri(mut self, uri: impl Into<String>) -> Self {
        self.product_uri = uri.into();
        self
    }

    /// Set the security policy and message security mode.
    pub fn with_security(mut self, policy: SecurityPolicy, mode: MessageSecurityMode) -> Self {
        self.security_policy = policy;
        self.message_security_mode = mode;
        self
    }

    /// Set the user identity.
    pub fn with_identity(mut self, identity: IdentityKind) -> Self {
        self.identity = identity;
        self
    }

    /// Set the session name.
    pub fn with_session_name(mut self, name: impl Into<String>) -> Self {
        self.session_name = name.into();
        self
    }

    /// Set the session timeout.
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Set the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Add a subscription.
    pub fn with_subscription(mut self, subscription: SubscriptionConfig) -> Self {
        self.subscriptions.push(subscription);
        self
    }
}

/// Structural identity of a pooled session.
///
/// Two configurations that agree on endpoint, connection name, security
/// policy and security mode share sessions, whatever their other fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ClientKey {
    /// Server endpoint.
    pub endpoint_url: EndpointUrl,
    /// Application name of the connection.
    pub connection_name: String,
    /// Canonical security policy URI.
    pub security_policy_uri: String,
    /// Message security mode.
    pub message_security_mode: MessageSecurityMode,
}

impl From<&ClientConfig> for ClientKey {
    fn from(config: &ClientConfig) -> Self {
        Self {
            endpoint_url: config.endpoint_url.clone(),
            connection_name: config.connection_name.clone(),
            security_policy_uri: config.security_policy.uri(),
            message_security_mode: config.message_security_mode,
        }
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} [{} {}]",
            self.connection_name,
            self.endpoint_url,
            self.security_policy_uri,
            self.message_security_mode
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_key_ignores_session_parameters() {
        let a = ClientConfig::new("opc.tcp://plc:4840", "line-1");
        let b = ClientConfig::new("opc.tcp://plc:4840", "line-1")
            .with_session_timeout(Duration::from_secs(600))
            .with_identity(IdentityKind::UsernamePassword {
                username: "op".into(),
                password: "secret".into(),
            })
            .with_subscription(SubscriptionConfig::new("alarms"));

        assert_eq!(a.key(), b.key());

        let mut keys = HashSet::new();
        keys.insert(a.key());
        assert!(keys.contains(&b.key()));
    }

    #[test]
    fn test_key_distinguishes_security() {
        let plain = ClientConfig::new("opc.tcp://plc:4840", "line-1");
        let signed = plain
            .clone()
            .with_security(SecurityPolicy::Basic256Sha256, MessageSecurityMode::Sign);
        let renamed = ClientConfig::new("opc.tcp://plc:4840", "line-2");

        assert_ne!(plain.key(), signed.key());
        assert_ne!(plain.key(), renamed.key());
        assert_eq!(
            signed.key().security_policy_uri,
            "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256"
        );
    }

    #[test]
    fn test_key_display() {
        let key = ClientConfig::new("opc.tcp://plc:4840", "line-1").key();
        assert_eq!(
            key.to_string(),
            "line-1@opc.tcp://plc:4840 [http://opcfoundation.org/UA/SecurityPolicy#None None]"
        );
    }
}
