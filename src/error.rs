//! Error types for the gateway core.

use crate::types::QueryId;
use thiserror::Error;

/// Main error type for gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No mutually supported protocol version between client and server.
    #[error("Protocol negotiation failed")]
    NegotiationFailed,

    /// Unknown identity, bad signature, or expired timestamp. Collapsed into
    /// one variant so clients cannot probe which part failed.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// An authorize hook said no, or a privileged message arrived on a
    /// connection without an identity.
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Unknown query: {0}")]
    UnknownQuery(QueryId),

    #[error("Unknown publication: {0}")]
    UnknownPublication(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    /// Identity-scoped query executed with no current subscribers. Transient:
    /// the job is dropped and the next subscribe re-triggers execution.
    #[error("No subscribers for query: {0}")]
    NoSubscribers(QueryId),

    #[error("Publication already registered: {0}")]
    DuplicatePublication(String),

    #[error("Action already registered: {0}")]
    DuplicateAction(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Unknown message type: {0}")]
    UnknownMessage(String),

    /// A publication's exec returned an error.
    #[error("Publication failed: {0}")]
    PublicationFailed(String),

    /// An action's exec returned an error.
    #[error("Action failed: {0}")]
    ActionFailed(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl GatewayError {
    /// Numeric code carried by wire `error` responses. Only code 1 is part of
    /// the negotiated protocol contract; the rest are stable local
    /// assignments.
    pub fn wire_code(&self) -> u8 {
        match self {
            GatewayError::NegotiationFailed
            | GatewayError::MalformedMessage(_)
            | GatewayError::UnknownMessage(_) => 1,
            GatewayError::AuthenticationFailed => 2,
            GatewayError::Unauthorized => 3,
            GatewayError::UnknownQuery(_)
            | GatewayError::UnknownPublication(_)
            | GatewayError::UnknownAction(_) => 4,
            _ => 5,
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Serialization(e.to_string())
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
