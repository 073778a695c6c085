//! Internal error type for `Result` plumbing inside the broker.
//!
//! This is distinct from the wire-level [`crate::types::MessageError`]/
//! [`crate::types::ErrorCode`] taxonomy, which is what gets serialized back
//! to clients. Nothing here crosses the wire.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("channel closed")]
    ChannelClosed,

    #[error("topic error: {0}")]
    Topic(#[from] crate::topic::TopicError),

    #[error("{0}")]
    Other(String),
}
