//! TOML configuration for tinymqtt clients
//!
//! The layout mirrors the dotted keys used by deployments:
//! `client.*`, `client.credential.*`, `client.store.*` and `credentials.<name>.*`.
//! Durations accept either an integer number of seconds or a string with an
//! `ms`, `s`, `m` or `h` suffix.

use crate::credentials::{mask_secret, CredentialMode};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Top-level configuration document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttConfig {
    pub client: ClientSection,
    /// Named username/password pairs referenced by `client.credential.name`
    #[serde(default)]
    pub credentials: HashMap<String, CredentialPair>,
}

/// `[client]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ClientSection {
    /// Client identifier, replaced by the derived one in signed mode
    #[serde(default)]
    pub client_id: String,
    /// Broker address, e.g. `tcp://localhost:1883` or `ssl://broker:8883`
    #[serde(default)]
    pub broker_server: String,
    #[serde(
        default,
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub keep_alive: Option<Duration>,
    #[serde(
        default,
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub ping_timeout: Option<Duration>,
    #[serde(default)]
    pub clean_session: bool,
    #[serde(rename = "order_matters", default = "default_true")]
    pub order_matters: bool,
    /// Disconnect quiesce in milliseconds (0 means the 250ms default)
    #[serde(default)]
    pub quiesce: u64,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default)]
    pub credential: CredentialSection,

    // Signed mode identity fields
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id_file: Option<PathBuf>,

    #[serde(default)]
    pub store: StoreConfig,
}

fn default_true() -> bool {
    true
}

/// `[client.credential]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CredentialSection {
    #[serde(default)]
    pub mode: CredentialMode,
    /// Key into the `[credentials]` table
    #[serde(default)]
    pub name: String,
}

/// `[credentials.<name>]` entry
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CredentialPair {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// `[client.store]` fragment handed to store constructors
///
/// Everything besides `provider` is kept verbatim so each backend can read
/// its own parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(flatten)]
    pub params: toml::Table,
}

impl StoreConfig {
    /// Store fragment for the given provider with no parameters
    pub fn with_provider(provider: &str) -> Self {
        Self {
            provider: Some(provider.to_string()),
            params: toml::Table::new(),
        }
    }

    /// Add a string parameter (builder style, mostly for tests)
    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.params
            .insert(key.to_string(), toml::Value::String(value.to_string()));
        self
    }

    /// Look up a string parameter
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    /// Provider name if one is configured and non-empty
    pub fn provider(&self) -> Option<&str> {
        self.provider.as_deref().filter(|p| !p.is_empty())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MqttConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text and validate it
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: MqttConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that do not depend on the credential mode
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client.broker_server.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "client.broker-server must not be empty".to_string(),
            ));
        }
        if let Some(provider) = &self.client.store.provider {
            if provider.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "client.store.provider must not be blank when set".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Look up a named credential pair
    pub fn credential_pair(&self, name: &str) -> Option<&CredentialPair> {
        self.credentials.get(name)
    }

    /// Copy of the configuration with every password masked, for display
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for pair in copy.credentials.values_mut() {
            pair.password = mask_secret(&pair.password, 4);
        }
        copy
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[client]
client-id = "test-client"
broker-server = "tcp://localhost:1883"

[client.credential]
name = "default"

[credentials.default]
username = "user"
password = "pass"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Parse `250ms`, `30s`, `2m`, `1h` or a bare integer (seconds)
pub fn parse_duration(text: &str) -> Result<Duration, ConfigError> {
    let text = text.trim();
    let invalid = || ConfigError::InvalidConfig(format!("invalid duration '{text}'"));

    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    if digits.is_empty() {
        return Err(invalid());
    }
    let value: u64 = digits.parse().map_err(|_| invalid())?;

    let scaled = |factor: u64| {
        value
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| ConfigError::InvalidConfig(format!("duration '{text}' is too large")))
    };

    match unit.trim() {
        "" | "s" => Ok(Duration::from_secs(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "m" => scaled(60),
        "h" => scaled(3600),
        _ => Err(invalid()),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawDuration>::deserialize(deserializer)?;
    raw.map(|raw| match raw {
        RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
        RawDuration::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    })
    .transpose()
}

fn serialize_duration<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(duration) => serializer.serialize_str(&format!("{}ms", duration.as_millis())),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[client]
client-id = "cid"
broker-server = "ssl://broker.example.com:8883"
keep-alive = "45s"
ping-timeout = 5
clean-session = true
order_matters = false
quiesce = 500
auto-reconnect = false
instance-id = "inst-1"
group-id = "GID_demo"
device-id-env = "DEVICE_ID"
device-id-file = "/etc/device-id"

[client.credential]
mode = "aliyun-signature"
name = "aliyun"

[client.store]
provider = "file"
directory = "/var/lib/tinymqtt"

[credentials.aliyun]
username = "AK"
password = "SECRET"
"#;

        let config = MqttConfig::from_toml_str(toml_content).unwrap();
        let client = &config.client;
        assert_eq!(client.client_id, "cid");
        assert_eq!(client.keep_alive, Some(Duration::from_secs(45)));
        assert_eq!(client.ping_timeout, Some(Duration::from_secs(5)));
        assert!(client.clean_session);
        assert!(!client.order_matters);
        assert_eq!(client.quiesce, 500);
        assert!(!client.auto_reconnect);
        assert_eq!(client.credential.mode, CredentialMode::AliyunSignature);
        assert_eq!(client.device_id_env.as_deref(), Some("DEVICE_ID"));
        assert_eq!(client.store.provider(), Some("file"));
        assert_eq!(client.store.get_str("directory"), Some("/var/lib/tinymqtt"));
        assert_eq!(config.credential_pair("aliyun").unwrap().username, "AK");
    }

    #[test]
    fn test_defaults() {
        let config = MqttConfig::test_config();
        let client = &config.client;
        assert!(client.order_matters);
        assert!(client.auto_reconnect);
        assert!(!client.clean_session);
        assert_eq!(client.quiesce, 0);
        assert_eq!(client.keep_alive, None);
        assert_eq!(client.credential.mode, CredentialMode::Normal);
        assert_eq!(client.store.provider(), None);
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("15").unwrap(), Duration::from_secs(15));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("ms").is_err());
        assert!(parse_duration("10 days").is_err());
        assert!(parse_duration("-5s").is_err());
    }

    #[test]
    fn test_parse_duration_overflow_is_an_error() {
        assert!(matches!(
            parse_duration("307445734561825861m"),
            Err(ConfigError::InvalidConfig(msg)) if msg.contains("too large")
        ));
        assert!(parse_duration("5124095576030432h").is_err());

        let result = MqttConfig::from_toml_str(
            "[client]\nbroker-server = \"tcp://localhost:1883\"\nclient-id = \"x\"\nkeep-alive = \"307445734561825861m\"\n",
        );
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_missing_broker_rejected() {
        let result = MqttConfig::from_toml_str("[client]\nclient-id = \"x\"\n");
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_redacted_masks_passwords() {
        let mut config = MqttConfig::test_config();
        config.credentials.insert(
            "long".to_string(),
            CredentialPair {
                username: "u".to_string(),
                password: "abcdefghijklmnop".to_string(),
            },
        );
        let redacted = config.redacted();
        assert_eq!(redacted.credentials["long"].password, "abcd*****mnop");
        assert_eq!(redacted.credentials["default"].password, "*****");
        assert_eq!(redacted.credentials["long"].username, "u");
    }

    #[test]
    fn test_redacted_round_trips_through_toml() {
        let config = MqttConfig::test_config().redacted();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: MqttConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.client.broker_server, "tcp://localhost:1883");
    }
}
