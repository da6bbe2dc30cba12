//! Session capability consumed by the lifecycle manager
//!
//! [`Session`] is the seam between the lifecycle state machine and the MQTT
//! engine. [`mqtt::MqttSession`] implements it on top of rumqttc; tests use
//! [`crate::testing::MockSession`].

use crate::credentials::mask_secret;
use crate::store::{BoxError, MessageStore, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod mqtt;

pub use mqtt::ConnectionState;
pub use rumqttc::QoS;

/// Keep-alive used when none is configured
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);
/// Ping timeout used when none is configured
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(10);

/// A publish delivered by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub pkid: u16,
    pub dup: bool,
}

impl Message {
    pub fn new(topic: &str, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.to_string(),
            payload: payload.into(),
            qos,
            retain: false,
            pkid: 0,
            dup: false,
        }
    }
}

/// Callback invoked for every message matching a subscription
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Fully resolved connection options
#[derive(Clone)]
pub struct SessionOptions {
    pub broker: String,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub clean_session: bool,
    pub keep_alive: Duration,
    pub ping_timeout: Duration,
    pub auto_reconnect: bool,
    /// Deliver messages to handlers one at a time, in arrival order
    pub order_matters: bool,
    pub store: Option<Arc<dyn MessageStore>>,
}

impl SessionOptions {
    /// Options with library defaults for everything but the broker and client id
    pub fn new(broker: &str, client_id: &str) -> Self {
        Self {
            broker: broker.to_string(),
            client_id: client_id.to_string(),
            username: String::new(),
            password: String::new(),
            clean_session: false,
            keep_alive: DEFAULT_KEEP_ALIVE,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            auto_reconnect: true,
            order_matters: true,
            store: None,
        }
    }
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("broker", &self.broker)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &mask_secret(&self.password, 4))
            .field("clean_session", &self.clean_session)
            .field("keep_alive", &self.keep_alive)
            .field("ping_timeout", &self.ping_timeout)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("order_matters", &self.order_matters)
            .field("store", &self.store.as_ref().map(|s| s.name()))
            .finish()
    }
}

/// Errors reported by a session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },

    #[error("Request could not be queued")]
    RequestFailed(#[source] BoxError),

    #[error("Broker rejected {operation}: {reason}")]
    Rejected {
        operation: &'static str,
        reason: String,
    },

    #[error("Connection lost before {0} completed")]
    ConnectionLost(&'static str),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Connection to a broker as seen by the lifecycle manager
///
/// Every method resolves only once the broker has answered (CONNACK, SUBACK,
/// UNSUBACK, PUBACK/PUBCOMP), so callers observe a strictly sequential flow.
#[async_trait]
pub trait Session: Send + Sync {
    /// Open the connection and wait for the broker to accept it
    async fn connect(&mut self) -> Result<(), SessionError>;

    /// Subscribe `handler` to `topic` (a filter, wildcards allowed)
    async fn subscribe(
        &mut self,
        topic: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<(), SessionError>;

    /// Remove subscriptions for all `topics` in one call
    async fn unsubscribe(&mut self, topics: &[String]) -> Result<(), SessionError>;

    /// Close the connection, giving in-flight work up to `quiesce` to settle
    async fn disconnect(&mut self, quiesce: Duration);

    /// Publish and return the packet id the session assigned (0 for QoS 0)
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retained: bool,
        payload: Vec<u8>,
    ) -> Result<u16, SessionError>;

    /// Check if the session is currently connected
    fn is_connected(&self) -> bool;
}
