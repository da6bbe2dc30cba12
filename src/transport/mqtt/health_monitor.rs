//! Pure reconnection decisions and state transitions
//!
//! The event loop task asks these functions what to do when the connection
//! drops; they never perform I/O themselves.

use super::connection::{ConnectionState, ReconnectConfig};
use tracing::{debug, error, info, warn};

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt
    Proceed { attempt: u32, delay_ms: u64 },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - auto-reconnect is disabled
    AbortReconnectDisabled,
    /// Abort reconnection - the first connect never succeeded
    AbortNeverConnected,
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Connect requested, waiting for ConnAck
    ConnectionStarted,
    /// ConnAck received from broker
    ConnAckReceived,
    /// Broker initiated disconnect
    DisconnectedByBroker,
    /// Network or protocol error
    NetworkError(String),
    /// Reconnection attempt started
    ReconnectionStarted(u32),
    /// Permanent failure - no more retries
    PermanentFailure(String),
    /// Disconnect requested by the client
    ClientDisconnected,
}

pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether a dropped connection should be re-established
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        auto_reconnect: bool,
        ever_connected: bool,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }
        if !ever_connected {
            return ReconnectionDecision::AbortNeverConnected;
        }
        if !auto_reconnect {
            return ReconnectionDecision::AbortReconnectDisabled;
        }
        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        ReconnectionDecision::Proceed {
            attempt: current_attempts + 1,
            delay_ms: config.calculate_backoff_delay(current_attempts + 1),
        }
    }

    /// Determine next state after connection event
    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnectionStarted => ConnectionState::Connecting,
            ConnectionEvent::ConnAckReceived => ConnectionState::Connected,
            ConnectionEvent::DisconnectedByBroker => {
                ConnectionState::Disconnected("Broker disconnected".to_string())
            }
            ConnectionEvent::NetworkError(error) => ConnectionState::Disconnected(error),
            ConnectionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
            ConnectionEvent::PermanentFailure(reason) => {
                ConnectionState::PermanentlyDisconnected(reason)
            }
            ConnectionEvent::ClientDisconnected => {
                ConnectionState::Disconnected("Client disconnected".to_string())
            }
        }
    }

    /// Check if connection state allows publish/subscribe/unsubscribe
    pub fn can_send_requests(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    pub fn log_state_transition(client_id: &str, from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Reconnecting(attempt), ConnectionState::Connected) => {
                info!(client_id, attempt, "Session re-established");
            }
            (_, ConnectionState::Connected) => info!(client_id, "Session connected"),
            (ConnectionState::Connected, ConnectionState::Disconnected(reason)) => {
                warn!(client_id, %reason, "Session lost");
            }
            (_, ConnectionState::Reconnecting(attempt)) => {
                info!(client_id, attempt, "Reconnecting");
            }
            (_, ConnectionState::PermanentlyDisconnected(reason)) => {
                error!(client_id, %reason, "Session permanently disconnected");
            }
            _ => debug!(client_id, ?from, ?to, "Session state changed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnection_proceeds_with_backoff() {
        let config = ReconnectConfig::default();
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, &config, true, true, false),
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay_ms: 25
            }
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(7, &config, true, true, false),
            ReconnectionDecision::Proceed {
                attempt: 8,
                delay_ms: 2000
            }
        );
    }

    #[test]
    fn test_reconnection_abort_reasons() {
        let config = ReconnectConfig {
            max_attempts: Some(2),
            ..ReconnectConfig::default()
        };

        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, &config, true, true, true),
            ReconnectionDecision::AbortShutdownRequested
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, &config, true, false, false),
            ReconnectionDecision::AbortNeverConnected
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, &config, false, true, false),
            ReconnectionDecision::AbortReconnectDisabled
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(2, &config, true, true, false),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );
    }

    #[test]
    fn test_state_transitions() {
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::ConnAckReceived),
            ConnectionState::Connected
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::ReconnectionStarted(3)),
            ConnectionState::Reconnecting(3)
        );
        assert!(matches!(
            HealthMonitor::determine_next_state(ConnectionEvent::NetworkError("eof".into())),
            ConnectionState::Disconnected(reason) if reason == "eof"
        ));
        assert!(matches!(
            HealthMonitor::determine_next_state(ConnectionEvent::PermanentFailure("x".into())),
            ConnectionState::PermanentlyDisconnected(_)
        ));
    }

    #[test]
    fn test_can_send_requests() {
        assert!(HealthMonitor::can_send_requests(&ConnectionState::Connected));
        assert!(!HealthMonitor::can_send_requests(&ConnectionState::Connecting));
        assert!(!HealthMonitor::can_send_requests(
            &ConnectionState::Reconnecting(1)
        ));
    }
}
