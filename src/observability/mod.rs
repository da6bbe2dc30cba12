//! Structured logging for tinymqtt
//!
//! `tracing` events are emitted throughout the crate; this module installs
//! the subscriber and provides the span macros used around MQTT operations.

pub mod logging;

pub use logging::{init_cli_logging, init_default_logging, init_logging, parse_level, LogFormat};

// Span macros for structured logging
pub use logging::{lifecycle_span, mqtt_span};
