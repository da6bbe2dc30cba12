//! Credential strategies for MQTT authentication
//!
//! Two modes are supported and selected by `client.credential.mode`:
//!
//! - `normal` - client id, username and password come straight from configuration
//! - `aliyun-signature` - client id, username and password are derived from an
//!   access key pair via HMAC-SHA1 (see [`signature`])
//!
//! Both implement [`CredentialStrategy`], so further signature schemes only
//! need a new strategy and a new [`CredentialMode`] variant.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub mod signature;

pub use signature::{derive_aliyun_signature, DeviceIdSource, SignedCredentials};

/// Marker substituted for the hidden part of a secret
const MASK: &str = "*****";

/// Resolved connection identity
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &mask_secret(&self.password, 4))
            .finish()
    }
}

/// Credential mode tag from configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialMode {
    /// Username and password used as configured
    #[default]
    Normal,
    /// Aliyun MQ signature derived from an access key pair
    AliyunSignature,
}

impl fmt::Display for CredentialMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialMode::Normal => write!(f, "normal"),
            CredentialMode::AliyunSignature => write!(f, "aliyun-signature"),
        }
    }
}

/// Errors raised while resolving credentials
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Invalid credential input: {field} is empty")]
    InvalidCredentialInput { field: &'static str },

    #[error("Could not resolve device id from configuration, environment or file")]
    MissingDeviceId,

    #[error("Failed to read device id file {path}")]
    DeviceIdFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A way of turning configuration into [`Credentials`]
pub trait CredentialStrategy: Send + Sync {
    /// Mode this strategy implements
    fn mode(&self) -> CredentialMode;

    /// Produce the credentials to connect with
    fn resolve(&self) -> Result<Credentials, CredentialError>;
}

/// `normal` mode: values pass through untouched
#[derive(Debug, Clone)]
pub struct DirectCredentials {
    credentials: Credentials,
}

impl DirectCredentials {
    pub fn new(client_id: &str, username: &str, password: &str) -> Self {
        Self {
            credentials: Credentials {
                client_id: client_id.to_string(),
                username: username.to_string(),
                password: password.to_string(),
            },
        }
    }
}

impl CredentialStrategy for DirectCredentials {
    fn mode(&self) -> CredentialMode {
        CredentialMode::Normal
    }

    fn resolve(&self) -> Result<Credentials, CredentialError> {
        Ok(self.credentials.clone())
    }
}

/// Hide all but the first and last `keep` characters of a secret
///
/// Secrets too short to keep both ends are replaced entirely.
pub fn mask_secret(secret: &str, keep: usize) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= keep * 2 {
        return MASK.to_string();
    }

    let head: String = chars[..keep].iter().collect();
    let tail: String = chars[chars.len() - keep..].iter().collect();
    format!("{head}{MASK}{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_secret_keeps_ends() {
        assert_eq!(mask_secret("0123456789abcdef", 4), "0123*****cdef");
    }

    #[test]
    fn test_mask_secret_short_values_fully_hidden() {
        assert_eq!(mask_secret("", 4), "*****");
        assert_eq!(mask_secret("abc", 4), "*****");
        assert_eq!(mask_secret("12345678", 4), "*****");
        assert_eq!(mask_secret("123456789", 4), "1234*****6789");
    }

    #[test]
    fn test_mask_secret_multibyte() {
        assert_eq!(mask_secret("ééééxxxxxéééé", 4), "éééé*****éééé");
    }

    #[test]
    fn test_direct_credentials_pass_through() {
        let strategy = DirectCredentials::new("cid", "user", "pass");
        assert_eq!(strategy.mode(), CredentialMode::Normal);

        let creds = strategy.resolve().unwrap();
        assert_eq!(creds.client_id, "cid");
        assert_eq!(creds.username, "user");
        assert_eq!(creds.password, "pass");
    }

    #[test]
    fn test_credentials_debug_masks_password() {
        let creds = Credentials {
            client_id: "cid".to_string(),
            username: "user".to_string(),
            password: "very-secret-password".to_string(),
        };
        let debug = format!("{creds:?}");
        assert!(!debug.contains("very-secret-password"));
        assert!(debug.contains("very*****word"));
    }

    #[test]
    fn test_credential_mode_display() {
        assert_eq!(CredentialMode::Normal.to_string(), "normal");
        assert_eq!(
            CredentialMode::AliyunSignature.to_string(),
            "aliyun-signature"
        );
    }
}
