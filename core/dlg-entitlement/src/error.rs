//! Error types for the entitlement engine.
//!
//! Business denials (banned, maintenance, device limit, ...) are not errors;
//! they travel as [`crate::AccessDecision`] values. The types here cover the
//! cases where an operation could not produce an authoritative answer.

use serde::Serialize;
use thiserror::Error;

/// Normalized failure of a remote call.
///
/// Every variant is recoverable: the caller may retry once the network or
/// the server is back. The gateway itself never retries.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TransportError {
    /// No response within the configured bound.
    #[error("request timed out")]
    Timeout,

    /// The server could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// TLS/certificate failure or a response that is not a JSON object.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Anything else the transport reported.
    #[error("transport error: {0}")]
    Other(String),
}

/// Entitlement-specific errors.
#[derive(Debug, Error)]
pub enum EntitlementError {
    /// The operation needs an authenticated user.
    #[error("not authenticated")]
    NotAuthenticated,

    /// The remote call failed before an answer was received.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The remote service answered but refused the request.
    #[error("request rejected: {message}")]
    Rejected {
        /// Server-provided code, if any.
        code: Option<String>,
        /// Human-readable message.
        message: String,
    },

    /// The local session file could not be written or removed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for entitlement operations.
pub type EntitlementResult<T> = Result<T, EntitlementError>;
