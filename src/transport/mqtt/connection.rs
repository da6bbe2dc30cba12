//! Pure connection state management for the MQTT session
//!
//! Broker address parsing, reconnect backoff and option mapping. Nothing in
//! here touches the network.

use crate::transport::{SessionError, SessionOptions};
use rumqttc::{MqttOptions, Transport as RumqttcTransport};
use std::time::Duration;
use url::Url;

/// Default port for plain TCP brokers
pub const DEFAULT_TCP_PORT: u16 = 1883;
/// Default port for TLS brokers
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// Connection state for the MQTT session
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - attempting to connect
    Connecting,
    /// Successfully connected and ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Permanently disconnected - max reconnection attempts exceeded
    PermanentlyDisconnected(String),
}

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![25, 50, 100, 250, 1000],
            sustained_delay: 2000,
        }
    }
}

impl ReconnectConfig {
    /// Total time spent across all attempts, None when retries are unlimited
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .sum()
        })
    }

    /// Backoff delay in milliseconds for a 1-based attempt number
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// Host, port and transport security extracted from a broker URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse `tcp://`, `mqtt://`, `ssl://`, `tls://` or `mqtts://` broker URLs
pub fn parse_broker_url(broker: &str) -> Result<BrokerAddress, SessionError> {
    let url = Url::parse(broker).map_err(|_| SessionError::InvalidBrokerUrl(broker.to_string()))?;

    let tls = match url.scheme() {
        "tcp" | "mqtt" => false,
        "ssl" | "tls" | "mqtts" => true,
        _ => return Err(SessionError::InvalidBrokerUrl(broker.to_string())),
    };

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| SessionError::InvalidBrokerUrl(broker.to_string()))?;
    let port = url
        .port()
        .unwrap_or(if tls { DEFAULT_TLS_PORT } else { DEFAULT_TCP_PORT });

    Ok(BrokerAddress {
        host: host.to_string(),
        port,
        tls,
    })
}

/// Map session options onto rumqttc options
pub fn configure_mqtt_options(options: &SessionOptions) -> Result<MqttOptions, SessionError> {
    let address = parse_broker_url(&options.broker)?;
    let mut mqtt_options = MqttOptions::new(&options.client_id, &address.host, address.port);

    if address.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if !options.username.is_empty() {
        mqtt_options.set_credentials(&options.username, &options.password);
    }

    // rumqttc refuses sub-second keep-alives
    mqtt_options.set_keep_alive(options.keep_alive.max(Duration::from_secs(1)));

    // An empty client id is only legal together with a clean session
    mqtt_options.set_clean_session(options.clean_session || options.client_id.is_empty());

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_config_default() {
        let config = ReconnectConfig::default();
        assert_eq!(config.max_attempts, None);
        assert_eq!(config.backoff_pattern, vec![25, 50, 100, 250, 1000]);
        assert_eq!(config.sustained_delay, 2000);
    }

    #[test]
    fn test_calculate_max_total_time() {
        let config = ReconnectConfig {
            max_attempts: Some(3),
            backoff_pattern: vec![10, 20],
            sustained_delay: 50,
        };
        assert_eq!(config.calculate_max_total_time(), Some(80));
        assert_eq!(ReconnectConfig::default().calculate_max_total_time(), None);
    }

    #[test]
    fn test_calculate_backoff_delay() {
        let config = ReconnectConfig::default();

        assert_eq!(config.calculate_backoff_delay(1), 25);
        assert_eq!(config.calculate_backoff_delay(2), 50);
        assert_eq!(config.calculate_backoff_delay(5), 1000);
        assert_eq!(config.calculate_backoff_delay(6), 2000);
        assert_eq!(config.calculate_backoff_delay(100), 2000);

        let empty = ReconnectConfig {
            backoff_pattern: vec![],
            ..ReconnectConfig::default()
        };
        assert_eq!(empty.calculate_backoff_delay(1), 2000);
    }

    #[test]
    fn test_parse_broker_url_schemes() {
        let plain = parse_broker_url("tcp://broker.example.com").unwrap();
        assert_eq!(plain.port, 1883);
        assert!(!plain.tls);

        let mqtt = parse_broker_url("mqtt://localhost:1884").unwrap();
        assert_eq!(mqtt.host, "localhost");
        assert_eq!(mqtt.port, 1884);

        let secure = parse_broker_url("ssl://post-cn-abc.mqtt.aliyuncs.com").unwrap();
        assert_eq!(secure.port, 8883);
        assert!(secure.tls);

        assert!(parse_broker_url("mqtts://host:443").unwrap().tls);
        assert!(parse_broker_url("tls://host").unwrap().tls);
    }

    #[test]
    fn test_invalid_broker_url() {
        for broker in ["invalid-url", "http://host:80", "tcp://", ""] {
            assert!(
                matches!(
                    parse_broker_url(broker),
                    Err(SessionError::InvalidBrokerUrl(_))
                ),
                "{broker} should be rejected"
            );
        }
    }

    #[test]
    fn test_configure_mqtt_options() {
        let mut options = SessionOptions::new("tcp://localhost:1883", "GID_test@@@device-001");
        options.username = "Signature|AK|inst".to_string();
        options.password = "secret".to_string();
        options.keep_alive = Duration::from_secs(45);
        options.clean_session = true;

        let mqtt_options = configure_mqtt_options(&options).unwrap();
        assert_eq!(mqtt_options.client_id(), "GID_test@@@device-001");
        assert_eq!(
            mqtt_options.broker_address(),
            ("localhost".to_string(), 1883)
        );
        assert_eq!(mqtt_options.keep_alive(), Duration::from_secs(45));
        assert!(mqtt_options.clean_session());
        assert_eq!(
            mqtt_options.credentials(),
            Some(("Signature|AK|inst".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn test_configure_mqtt_options_without_credentials() {
        let mut options = SessionOptions::new("tcp://localhost", "cid");
        options.keep_alive = Duration::from_millis(10);

        let mqtt_options = configure_mqtt_options(&options).unwrap();
        assert_eq!(mqtt_options.credentials(), None);
        assert_eq!(mqtt_options.keep_alive(), Duration::from_secs(1));
        assert!(!mqtt_options.clean_session());
    }
}
