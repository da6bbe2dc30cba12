//! Aliyun MQ signature credentials
//!
//! The broker verifies the password by recomputing it, so the derivation must
//! match byte for byte:
//!
//! ```text
//! client_id = group_id "@@@" device_id
//! username  = "Signature|" access_key_id "|" instance_id
//! password  = base64(HMAC-SHA1(access_key_secret, client_id))
//! ```

use super::{mask_secret, CredentialError, CredentialMode, CredentialStrategy, Credentials};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::path::PathBuf;
use tracing::debug;

type HmacSha1 = Hmac<Sha1>;

/// Derive the signed `(client_id, username, password)` triple
pub fn derive_aliyun_signature(
    access_key_id: &str,
    access_key_secret: &str,
    instance_id: &str,
    group_id: &str,
    device_id: &str,
) -> Result<Credentials, CredentialError> {
    let inputs = [
        ("access-key-id", access_key_id),
        ("access-key-secret", access_key_secret),
        ("instance-id", instance_id),
        ("group-id", group_id),
        ("device-id", device_id),
    ];
    if let Some((field, _)) = inputs.iter().find(|(_, value)| value.is_empty()) {
        return Err(CredentialError::InvalidCredentialInput { field: *field });
    }

    debug!(
        access_key_id = %access_key_id,
        access_key_secret = %mask_secret(access_key_secret, 4),
        instance_id = %instance_id,
        group_id = %group_id,
        device_id = %device_id,
        "Calculating aliyun signature"
    );

    let client_id = format!("{group_id}@@@{device_id}");
    let username = format!("Signature|{access_key_id}|{instance_id}");

    let mut mac = HmacSha1::new_from_slice(access_key_secret.as_bytes()).map_err(|_| {
        CredentialError::InvalidCredentialInput {
            field: "access-key-secret",
        }
    })?;
    mac.update(client_id.as_bytes());
    let password = BASE64.encode(mac.finalize().into_bytes());

    debug!(
        client_id = %client_id,
        username = %username,
        password = %mask_secret(&password, 4),
        "Aliyun signature calculated"
    );

    Ok(Credentials {
        client_id,
        username,
        password,
    })
}

/// Where the device id comes from when it is not configured directly
#[derive(Debug, Clone, Default)]
pub struct DeviceIdSource {
    pub device_id: String,
    /// Environment variable holding the device id
    pub env: Option<String>,
    /// File holding the device id (surrounding whitespace is trimmed)
    pub file: Option<PathBuf>,
}

impl DeviceIdSource {
    /// Resolve against the process environment
    pub fn resolve(&self) -> Result<String, CredentialError> {
        self.resolve_with(|name| std::env::var(name).ok())
    }

    /// Resolve with an injected environment lookup
    ///
    /// Precedence: direct value, then the environment variable (if named),
    /// then the file (only when no variable is named).
    pub fn resolve_with<F>(&self, lookup_env: F) -> Result<String, CredentialError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut device_id = self.device_id.clone();

        if device_id.is_empty() {
            if let Some(env) = self.env.as_deref().filter(|e| !e.is_empty()) {
                debug!(env = %env, "Reading device id from environment");
                device_id = lookup_env(env).unwrap_or_default();
            } else if let Some(path) = self.file.as_ref().filter(|p| !p.as_os_str().is_empty()) {
                debug!(file = %path.display(), "Reading device id from file");
                let content =
                    std::fs::read_to_string(path).map_err(|source| CredentialError::DeviceIdFile {
                        path: path.clone(),
                        source,
                    })?;
                device_id = content.trim().to_string();
            }
        }

        if device_id.is_empty() {
            return Err(CredentialError::MissingDeviceId);
        }
        Ok(device_id)
    }
}

/// `aliyun-signature` mode
#[derive(Clone)]
pub struct SignedCredentials {
    pub access_key_id: String,
    pub access_key_secret: String,
    pub instance_id: String,
    pub group_id: String,
    pub device: DeviceIdSource,
}

impl std::fmt::Debug for SignedCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("access_key_secret", &mask_secret(&self.access_key_secret, 4))
            .field("instance_id", &self.instance_id)
            .field("group_id", &self.group_id)
            .field("device", &self.device)
            .finish()
    }
}

impl CredentialStrategy for SignedCredentials {
    fn mode(&self) -> CredentialMode {
        CredentialMode::AliyunSignature
    }

    fn resolve(&self) -> Result<Credentials, CredentialError> {
        let device_id = self.device.resolve()?;
        derive_aliyun_signature(
            &self.access_key_id,
            &self.access_key_secret,
            &self.instance_id,
            &self.group_id,
            &device_id,
        )
    }
}
