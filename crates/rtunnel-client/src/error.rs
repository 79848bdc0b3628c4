//! Client error types

use rtunnel_proto::CodecError;
use thiserror::Error;

/// Errors surfaced by the tunnel client core
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The server answered the login with a non-empty error
    #[error("{0}")]
    LoginRejected(String),

    #[error(
        "login to the server failed: {0}. With loginFailExit enabled, no additional retries will be attempted"
    )]
    LoginFailed(String),

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("proxy [{0}] not found")]
    ProxyNotFound(String),

    #[error("proxy [{0}] already exists")]
    ProxyAlreadyExists(String),

    #[error("proxy [{name}] start error: {reason}")]
    ProxyStartRejected { name: String, reason: String },

    #[error("unknown proxy type: {0}")]
    UnknownProxyType(String),

    #[error("invalid payload type: {0}")]
    InvalidPayloadType(&'static str),

    #[error("proxy [{name}] is in phase {phase}, expected {expected}")]
    InvalidPhase {
        name: String,
        phase: &'static str,
        expected: &'static str,
    },

    #[error("proxy manager is closed")]
    ManagerClosed,

    #[error("no active control connection")]
    NotConnected,

    #[error("message transport is closed")]
    TransportClosed,

    #[error("Webhook error: {0}")]
    WebhookError(#[from] reqwest::Error),
}

impl ClientError {
    /// Returns true for lookups that legitimately found nothing
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::ProxyNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
