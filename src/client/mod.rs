//! Client construction and session lifecycle
//!
//! [`ClientBuilder`] turns an [`MqttConfig`](crate::config::MqttConfig) and a
//! list of [`SubscribeIntent`]s into a [`SessionClient`] without connecting.
//! The client then walks `Idle -> Connected -> Subscribed -> Stopped` through
//! [`SessionClient::start`] and [`SessionClient::stop`].

use crate::credentials::CredentialError;
use crate::store::RegistryError;
use crate::transport::{MessageHandler, QoS, SessionError};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub mod builder;
pub mod lifecycle;

pub use builder::{ClientBuilder, DEFAULT_QUIESCE};
pub use lifecycle::{LifecycleState, SessionClient};

/// A subscription to establish on start
#[derive(Clone)]
pub struct SubscribeIntent {
    pub topic: String,
    pub qos: QoS,
    pub handler: MessageHandler,
}

impl SubscribeIntent {
    pub fn new(topic: &str, qos: QoS, handler: MessageHandler) -> Self {
        Self {
            topic: topic.to_string(),
            qos,
            handler,
        }
    }
}

impl fmt::Debug for SubscribeIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeIntent")
            .field("topic", &self.topic)
            .field("qos", &self.qos)
            .finish_non_exhaustive()
    }
}

/// Outcome of a completed publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResult {
    pub topic: String,
    pub broker: String,
    pub username: String,
    pub msg_id: u16,
    pub qos: u8,
    pub retained: bool,
}

/// Map a numeric QoS level (0, 1, 2) onto [`QoS`]
pub fn qos_from_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// Errors raised while building a client
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("client.credential.name is not set")]
    MissingCredentialName,

    #[error("Client id is empty after resolving credentials")]
    MissingClientId,

    #[error("Credential resolution failed: {0}")]
    Credential(#[from] CredentialError),

    #[error("Store resolution failed: {0}")]
    Store(#[from] RegistryError),

    #[error("Session construction failed: {0}")]
    Session(#[from] SessionError),
}

/// Errors raised by lifecycle operations
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Connect to {broker} failed")]
    ConnectFailed {
        broker: String,
        #[source]
        source: SessionError,
    },

    #[error("Subscribe to '{topic}' failed")]
    SubscribeFailed {
        topic: String,
        #[source]
        source: SessionError,
    },

    #[error("Unsubscribe from {topics:?} failed")]
    UnsubscribeFailed {
        topics: Vec<String>,
        #[source]
        source: SessionError,
    },

    #[error("Publish to '{topic}' failed")]
    PublishFailed {
        topic: String,
        #[source]
        source: SessionError,
    },

    #[error("Client is not connected (state: {state})")]
    NotConnected { state: LifecycleState },

    #[error("Cannot {operation} from state {state}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },
}
