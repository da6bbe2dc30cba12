//! MQTT session on top of rumqttc
//!
//! The module separates pure decisions from I/O:
//!
//! - [`connection`] - broker URL parsing, option mapping, reconnect backoff
//! - [`message_handler`] - event routing, topic matching, handler dispatch
//! - [`health_monitor`] - reconnection decisions and state transitions
//! - [`requests`] - correlation of requests with broker acknowledgements
//! - [`client`] - the event loop task and the [`crate::transport::Session`] impl
//!
//! # Usage
//!
//! ```rust,no_run
//! use tinymqtt::transport::mqtt::MqttSession;
//! use tinymqtt::transport::{QoS, Session, SessionOptions};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let options = SessionOptions::new("tcp://localhost:1883", "sensor-gateway");
//! let mut session = MqttSession::new(options)?;
//! session.connect().await?;
//! session
//!     .subscribe("sensors/#", QoS::AtLeastOnce, Arc::new(|message| {
//!         println!("{}: {:?}", message.topic, message.payload);
//!     }))
//!     .await?;
//! session.publish("sensors/1", QoS::AtLeastOnce, false, b"21.5".to_vec()).await?;
//! session.disconnect(Duration::from_millis(250)).await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;
pub mod requests;

pub use client::MqttSession;
pub use connection::{
    configure_mqtt_options, parse_broker_url, BrokerAddress, ConnectionState, ReconnectConfig,
};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{topic_matches, EventRoute, EventRouter, HandlerTable, RequestKind};
