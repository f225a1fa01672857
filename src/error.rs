//! Error types for fammail.

use std::time::Duration;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Order error: {0}")]
    Order(#[from] OrderError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
///
/// `DuplicateKey` and `InvalidTransition` are integrity violations: the
/// orchestrator never triggers them in normal flow, so seeing one means a
/// caller skipped the idempotency check or tried to move a record backwards.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Duplicate key: an order already exists for message {message_id}")]
    DuplicateKey { message_id: String },

    #[error("Order {id} cannot transition from {from} to {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Mailbox channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Mailbox {host} connection failed: {reason}")]
    ConnectFailed { host: String, reason: String },

    #[error("Mailbox authentication failed for {user}")]
    AuthFailed { user: String },

    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    #[error("Mailbox disconnected: {0}")]
    Disconnected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// The session is unusable; the caller must reconnect. A tagged `NO` or
    /// `BAD` (`Protocol`) leaves the session intact.
    pub fn is_session_error(&self) -> bool {
        !matches!(self, Self::Protocol(_))
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Message-level failures. Every variant is caught by the orchestrator and
/// persisted as the `error_message` of a failed order record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderError {
    /// Missing or invalid address/message fields.
    #[error("{0}")]
    Validation(String),

    /// No pattern matched and the generative response was not usable JSON.
    #[error("{0}")]
    Parse(String),

    /// Non-2xx from the print-mail provider.
    #[error("Provider error ({status}): {message}")]
    Provider {
        status: u16,
        message: String,
        body: Option<String>,
    },

    /// The extractor or provider could not be reached at all.
    #[error("Network error: {0}")]
    Network(String),
}

impl OrderError {
    /// Short kind label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Parse(_) => "parse",
            Self::Provider { .. } => "provider",
            Self::Network(_) => "network",
        }
    }
}

impl From<LlmError> for OrderError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::RequestFailed { .. } | LlmError::Timeout { .. } => {
                OrderError::Network(e.to_string())
            }
            LlmError::InvalidResponse { .. } | LlmError::Json(_) => OrderError::Parse(e.to_string()),
        }
    }
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_display_includes_status_and_message() {
        let err = OrderError::Provider {
            status: 400,
            message: "Invalid address".into(),
            body: Some(r#"{"message":"Invalid address"}"#.into()),
        };
        assert_eq!(err.to_string(), "Provider error (400): Invalid address");
        assert_eq!(err.kind(), "provider");
    }

    #[test]
    fn validation_error_display_is_bare_message() {
        let err = OrderError::Validation("Missing required field: recipient.city".into());
        assert_eq!(err.to_string(), "Missing required field: recipient.city");
    }

    #[test]
    fn only_protocol_errors_keep_the_session() {
        assert!(!ChannelError::Protocol("FETCH failed: NO".into()).is_session_error());
        assert!(ChannelError::Disconnected("eof".into()).is_session_error());
        assert!(ChannelError::AuthFailed { user: "u".into() }.is_session_error());
    }

    #[test]
    fn llm_transport_failure_maps_to_network() {
        let err: OrderError = LlmError::RequestFailed {
            provider: "anthropic".into(),
            reason: "connection refused".into(),
        }
        .into();
        assert_eq!(err.kind(), "network");
    }

    #[test]
    fn llm_bad_response_maps_to_parse() {
        let err: OrderError = LlmError::InvalidResponse {
            provider: "openai".into(),
            reason: "empty".into(),
        }
        .into();
        assert_eq!(err.kind(), "parse");
    }
}
