//! Crate-wide error type
//!
//! Each module defines its own `thiserror` enum; [`TinyMqttError`] wraps them
//! for callers that do not care which layer failed.

use crate::client::{BuildError, LifecycleError};
use crate::config::ConfigError;
use crate::credentials::CredentialError;
use crate::store::{RegistryError, StoreError};
use crate::transport::SessionError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Longest message [`sanitize_error_message`] returns
const MAX_MESSAGE_LEN: usize = 500;
const TRUNCATED: &str = "...[truncated]";

#[derive(Debug, Error)]
pub enum TinyMqttError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Client build error: {0}")]
    Build(#[from] BuildError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to render output: {0}")]
    Output(String),
}

pub type TinyMqttResult<T> = Result<T, TinyMqttError>;

static SECRET_ASSIGNMENT: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|passwd|token|key|secret)\s*[=:]\s*\S+").ok());

static SECRET_PATH: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+").ok()
});

/// Redact secret-looking fragments and cap the length of an error message
///
/// Used before error text reaches logs or the terminal.
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(re) = SECRET_ASSIGNMENT.as_ref() {
        sanitized = re.replace_all(&sanitized, "${1}=***").into_owned();
    }
    if let Some(re) = SECRET_PATH.as_ref() {
        sanitized = re.replace_all(&sanitized, "/***REDACTED***/").into_owned();
    }

    if sanitized.len() > MAX_MESSAGE_LEN {
        let budget = MAX_MESSAGE_LEN - TRUNCATED.len();
        let cut = sanitized
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= budget)
            .last()
            .unwrap_or(0);
        sanitized.truncate(cut);
        sanitized.push_str(TRUNCATED);
    }

    sanitized
}

/// Render an error and its `source()` chain as `outer: inner: root`
pub fn error_chain(error: &dyn std::error::Error) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::LifecycleState;

    #[test]
    fn test_sanitize_redacts_secrets() {
        let sanitized = sanitize_error_message("connect failed: password=hunter2 user=bob");
        assert!(!sanitized.contains("hunter2"));
        assert!(sanitized.contains("password=***"));
        assert!(sanitized.contains("user=bob"));

        let sanitized = sanitize_error_message("Secret: abc123 rejected");
        assert!(!sanitized.contains("abc123"));
    }

    #[test]
    fn test_sanitize_redacts_sensitive_paths() {
        let sanitized = sanitize_error_message("cannot read /home/me/.ssh/id_rsa");
        assert!(!sanitized.contains("id_rsa"));
        assert!(sanitized.contains("/***REDACTED***/"));
    }

    #[test]
    fn test_sanitize_truncates_long_messages() {
        let long = "x".repeat(1000);
        let sanitized = sanitize_error_message(&long);
        assert!(sanitized.len() <= MAX_MESSAGE_LEN);
        assert!(sanitized.ends_with(TRUNCATED));
    }

    #[test]
    fn test_sanitize_truncates_on_char_boundary() {
        let long = "é".repeat(400);
        let sanitized = sanitize_error_message(&long);
        assert!(sanitized.len() <= MAX_MESSAGE_LEN);
        assert!(sanitized.ends_with(TRUNCATED));
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let error = LifecycleError::ConnectFailed {
            broker: "tcp://b:1883".to_string(),
            source: SessionError::ConnectionFailed("refused".to_string()),
        };
        assert_eq!(
            error_chain(&error),
            "Connect to tcp://b:1883 failed: Connection failed: refused"
        );
    }

    #[test]
    fn test_conversions() {
        let error: TinyMqttError = LifecycleError::NotConnected {
            state: LifecycleState::Idle,
        }
        .into();
        assert_eq!(error.to_string(), "Client is not connected (state: idle)");

        let error: TinyMqttError = ConfigError::InvalidConfig("bad".to_string()).into();
        assert!(matches!(error, TinyMqttError::Config(_)));
    }

    #[test]
    fn test_question_mark_lifts_module_errors() {
        fn load(text: &str) -> TinyMqttResult<u64> {
            let duration = crate::config::parse_duration(text)?;
            Ok(duration.as_secs())
        }

        assert_eq!(load("2m").unwrap(), 120);
        assert!(matches!(load("soon"), Err(TinyMqttError::Config(_))));

        fn io() -> TinyMqttResult<()> {
            let closed = std::io::Error::new(std::io::ErrorKind::Other, "closed");
            Err(closed.into())
        }
        assert_eq!(io().unwrap_err().to_string(), "I/O error: closed");
    }
}
