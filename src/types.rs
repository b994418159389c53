//! Identity and security types shared by the pools.

use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{PoolError, Result};

/// Opaque identifier of a managed connection or pooled session.
pub type ConnectionId = uuid::Uuid;

/// Generate a fresh connection identifier.
pub(crate) fn new_connection_id() -> ConnectionId {
    uuid::Uuid::new_v4()
}

/// Target identity a connection is bound to (an `opc.tcp://` endpoint URL).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct EndpointUrl(String);

impl EndpointUrl {
    /// Wrap an endpoint URL. The value is checked when a connection uses it.
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    /// Get the URL as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reject empty or blank identities.
    pub fn validate(&self) -> Result<()> {
        if self.0.trim().is_empty() {
            return Err(PoolError::InvalidTarget(self.0.clone()));
        }
        Ok(())
    }
}

impl fmt::Display for EndpointUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointUrl {
    fn from(url: &str) -> Self {
        Self::new(url)
    }
}

impl From<String> for EndpointUrl {
    fn from(url: String) -> Self {
        Self(url)
    }
}

/// OPC UA security policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SecurityPolicy {
    /// No security.
    #[default]
    None,
    /// Deprecated RSA-15 policy.
    Basic128Rsa15,
    /// Deprecated SHA-1 policy.
    Basic256,
    /// RSA with SHA-256.
    Basic256Sha256,
    /// AES-128 with RSA-OAEP.
    Aes128Sha256RsaOaep,
    /// AES-256 with RSA-PSS.
    Aes256Sha256RsaPss,
}

impl SecurityPolicy {
    const URI_PREFIX: &'static str = "http://opcfoundation.org/UA/SecurityPolicy#";

    /// All known policies.
    pub const ALL: [SecurityPolicy; 6] = [
        Self::None,
        Self::Basic128Rsa15,
        Self::Basic256,
        Self::Basic256Sha256,
        Self::Aes128Sha256RsaOaep,
        Self::Aes256Sha256RsaPss,
    ];

    fn fragment(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Basic128Rsa15 => "Basic128Rsa15",
            Self::Basic256 => "Basic256",
            Self::Basic256Sha256 => "Basic256Sha256",
            Self::Aes128Sha256RsaOaep => "Aes128_Sha256_RsaOaep",
            Self::Aes256Sha256RsaPss => "Aes256_Sha256_RsaPss",
        }
    }

    /// The canonical policy URI.
    pub fn uri(&self) -> String {
        format!("{}{}", Self::URI_PREFIX, self.fragment())
    }

    /// Look up a policy by its canonical URI.
    pub fn from_uri(uri: &str) -> Option<Self> {
        let fragment = uri.strip_prefix(Self::URI_PREFIX)?;
        Self::ALL.into_iter().find(|p| p.fragment() == fragment)
    }
}

impl FromStr for SecurityPolicy {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_uri(s)
            .ok_or_else(|| PoolError::invalid_config(format!("unknown security policy URI: {s}")))
    }
}

/// Message security applied on the secure channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MessageSecurityMode {
    /// Messages are neither signed nor encrypted.
    #[default]
    None,
    /// Messages are signed.
    Sign,
    /// Messages are signed and encrypted.
    SignAndEncrypt,
}

impl MessageSecurityMode {
    /// Create a mode from its OPC UA enumeration value.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::None),
            2 => Some(Self::Sign),
            3 => Some(Self::SignAndEncrypt),
            _ => None,
        }
    }

    /// The OPC UA enumeration value.
    pub fn as_u32(&self) -> u32 {
        match self {
            Self::None => 1,
            Self::Sign => 2,
            Self::SignAndEncrypt => 3,
        }
    }
}

impl fmt::Display for MessageSecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "None",
            Self::Sign => "Sign",
            Self::SignAndEncrypt => "SignAndEncrypt",
        };
        f.write_str(name)
    }
}

/// User identity presented when activating a session.
#[derive(Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum IdentityKind {
    /// Anonymous identity token.
    #[default]
    Anonymous,
    /// User name and password.
    UsernamePassword { username: String, password: String },
    /// X.509 certificate with its private key.
    Certificate {
        certificate_path: String,
        private_key_path: String,
    },
}

impl IdentityKind {
    /// Short name of the identity variant, safe for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::UsernamePassword { .. } => "username",
            Self::Certificate { .. } => "certificate",
        }
    }
}

// Credentials stay out of logs.
impl fmt::Debug for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::UsernamePassword { username, .. } => f
                .debug_struct("UsernamePassword")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::Certificate {
                certificate_path, ..
            } => f
                .debug_struct("Certificate")
                .field("certificate_path", certificate_path)
                .finish_non_exhaustive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_validation() {
        assert!(EndpointUrl::from("opc.tcp://plc:4840").validate().is_ok());
        assert!(matches!(
            EndpointUrl::from("   ").validate(),
            Err(PoolError::InvalidTarget(_))
        ));
        assert!(EndpointUrl::from("").validate().is_err());
    }

    #[test]
    fn test_security_policy_uri() {
        assert_eq!(
            SecurityPolicy::Basic256Sha256.uri(),
            "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256"
        );
        for policy in SecurityPolicy::ALL {
            assert_eq!(SecurityPolicy::from_uri(&policy.uri()), Some(policy));
        }
        assert!("http://example.com#None".parse::<SecurityPolicy>().is_err());
    }

    #[test]
    fn test_message_security_mode() {
        assert_eq!(MessageSecurityMode::from_u32(3), Some(MessageSecurityMode::SignAndEncrypt));
        assert_eq!(MessageSecurityMode::from_u32(0), None);
        assert_eq!(MessageSecurityMode::Sign.as_u32(), 2);
    }

    #[test]
    fn test_identity_debug_redacts_password() {
        let identity = IdentityKind::UsernamePassword {
            username: "operator".into(),
            password: "hunter2".into(),
        };
        let rendered = format!("{identity:?}");
        assert!(rendered.contains("operator"));
        assert!(!rendered.contains("hunter2"));
        assert_eq!(identity.kind(), "username");
    }
}
