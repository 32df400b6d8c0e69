//! Error types for the ESL engine

use crate::connection::ConnectionState;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type EslResult<T> = Result<T, EslError>;

/// Errors produced by the ESL engine.
///
/// Framing and socket errors are fatal to a connection and cascade to every
/// outstanding waiter as [`EslError::ConnectionClosed`]. Command-level and
/// cache errors are local to the caller that triggered them.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EslError {
    /// TCP connect or DNS failure before the handshake started.
    #[error("connect to {address} failed: {reason}")]
    Connect { address: String, reason: String },

    /// Handshake rejected by the switch.
    #[error("authentication failed: {reason}")]
    AuthenticationFailed { reason: String },

    /// Malformed or unsatisfiable frame. Fatal to the connection.
    #[error("framing error: {message}")]
    Framing { message: String },

    /// Command answered with `-ERR`.
    #[error("command rejected: {reply_text}")]
    CommandRejected { reply_text: String },

    /// Reply-Text was neither `+OK` nor `-ERR`.
    #[error("unexpected reply: {reply_text}")]
    UnexpectedReply { reply_text: String },

    /// A deadline expired while waiting.
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The connection went away while the caller was waiting.
    #[error("connection closed")]
    ConnectionClosed,

    /// No background job with this id is registered on the connection.
    #[error("unknown background job: {job_uuid}")]
    UnknownJob { job_uuid: String },

    /// Application command issued outside the `Ready` state.
    #[error("connection not ready (state: {state:?})")]
    NotReady { state: ConnectionState },

    /// Cache service could not be used; resolution falls back.
    #[error("cache unavailable: {reason}")]
    CacheUnavailable { reason: String },

    /// Locally detected protocol misuse (e.g. newline injection).
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Header line without a `:` separator.
    #[error("invalid header: {header}")]
    InvalidHeader { header: String },

    /// Events were dropped because the consumer fell behind.
    #[error("event queue full, events dropped")]
    QueueFull,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),
}

impl EslError {
    pub(crate) fn protocol_error(message: impl Into<String>) -> Self {
        EslError::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn framing(message: impl Into<String>) -> Self {
        EslError::Framing {
            message: message.into(),
        }
    }

    pub(crate) fn auth_failed(reason: impl Into<String>) -> Self {
        EslError::AuthenticationFailed {
            reason: reason.into(),
        }
    }

    pub(crate) fn cache_unavailable(reason: impl std::fmt::Display) -> Self {
        EslError::CacheUnavailable {
            reason: reason.to_string(),
        }
    }

    /// `true` when the error means the connection is unusable.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            EslError::ConnectionClosed
                | EslError::Framing { .. }
                | EslError::Io(_)
                | EslError::Connect { .. }
        )
    }

    /// `true` for failures the caller may retry or ignore without reconnecting.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EslError::CommandRejected { .. }
                | EslError::UnexpectedReply { .. }
                | EslError::Timeout { .. }
                | EslError::CacheUnavailable { .. }
                | EslError::QueueFull
        )
    }
}
