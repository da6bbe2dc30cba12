//! tinymqtt - configuration-driven MQTT sessions
//!
//! A thin session manager over an MQTT 3.1.1 client:
//! - a [`StoreRegistry`] of pluggable message stores (`file`, `memory`)
//! - normal or Aliyun-signed credentials ([`credentials`])
//! - a [`ClientBuilder`] turning TOML configuration into a [`SessionClient`]
//! - a strictly sequential lifecycle: start (connect, then subscribe in
//!   order), publish, stop (unsubscribe, then disconnect)
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tinymqtt::{ClientBuilder, MqttConfig, QoS, SubscribeIntent};
//!
//! # tokio_test::block_on(async {
//! let config = MqttConfig::from_toml_str(r#"
//! [client]
//! client-id = "gateway-1"
//! broker-server = "tcp://localhost:1883"
//!
//! [client.credential]
//! name = "default"
//!
//! [credentials.default]
//! username = "gateway"
//! password = "secret"
//! "#)?;
//!
//! let mut client = ClientBuilder::new(&config)
//!     .subscribe(SubscribeIntent::new(
//!         "commands/#",
//!         QoS::AtLeastOnce,
//!         Arc::new(|message| println!("{} -> {:?}", message.topic, message.payload)),
//!     ))
//!     .build()?;
//!
//! client.start().await?;
//! let result = client
//!     .send_message("telemetry/gateway-1", QoS::AtLeastOnce, false, "online")
//!     .await?;
//! println!("{}", serde_json::to_string(&result)?);
//! client.stop().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod observability;
pub mod store;
pub mod testing;
pub mod transport;

pub use client::{
    ClientBuilder, LifecycleError, LifecycleState, PublishResult, SessionClient, SubscribeIntent,
};
pub use config::{MqttConfig, StoreConfig};
pub use error::{TinyMqttError, TinyMqttResult};
pub use store::{MessageStore, StoreRegistry};
pub use transport::{Message, QoS, Session, SessionOptions};
