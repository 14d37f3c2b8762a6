//! The `error` module defines the error kinds surfaced by the messaging layer.
//!
//! Setup-time failures (connection, topology) abort the call that triggered
//! them. Failures that happen while a consumption loop is running are logged
//! inside the loop and never propagate past it.

use thiserror::Error;

/// Errors produced by the broker client and the pub/sub layer on top of it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PubSubError {
    /// The connection or session is unusable (refused, dropped, closed).
    #[error("connection error: {0}")]
    Connection(String),

    /// Exchange/queue declaration or binding was rejected by the broker.
    #[error("topology error: {0}")]
    Topology(String),

    /// A value could not be encoded or a payload could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The broker rejected a publish frame.
    #[error("publish error: {0}")]
    Publish(String),

    /// The broker rejected an acknowledgment call.
    #[error("ack error: {0}")]
    Ack(String),
}

impl PubSubError {
    /// Returns `true` for errors worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PubSubError::Connection(_))
    }
}

impl From<serde_json::Error> for PubSubError {
    fn from(err: serde_json::Error) -> Self {
        PubSubError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for PubSubError {
    fn from(err: bincode::Error) -> Self {
        PubSubError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PubSubError>;
