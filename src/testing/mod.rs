//! Testing utilities and mock implementations
//!
//! Mocks and an in-process broker for exercising sessions and the client
//! lifecycle without an external MQTT broker.

pub mod broker;
pub mod mocks;

pub use broker::{BrokerPacket, FakeBroker};
pub use mocks::*;
