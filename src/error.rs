//! Error types shared by the codecs and the client.
//!
//! Transport failures never escape the client as `Err` returns from
//! [`Client::command`](crate::client::Client::command).  They are converted
//! into a [`ClientError`] and delivered through the same completion handle
//! as a successful reply, so every request has exactly one result shape.

use std::time::Duration;

/// A violation of the framing contract, detected while encoding or decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The bytes at a frame boundary do not start with the protocol magic.
    #[error("bad frame magic: {0:02x?}")]
    BadMagic(Vec<u8>),

    /// A frame announced (or a request needs) more payload than allowed.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A line grew past the configured maximum without a terminator.
    #[error("line too long ({len} bytes, max {max})")]
    LineTooLong { len: usize, max: usize },

    /// The first line from the peer did not match the expected greeting.
    #[error("unexpected greeting: {0:?}")]
    BadGreeting(String),

    /// The bytes are not a valid frame of this protocol.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The request cannot be represented on the wire.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// An application-level error reported by the peer for one request.
///
/// The connection stays up; only the request that produced it fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}{message}", context(.code, .command))]
pub struct ProtocolError {
    /// Numeric error code, when the protocol carries one.
    pub code: Option<u32>,
    /// Position of the failing command inside a command list.
    pub index: Option<u32>,
    /// Name of the command the peer was executing.
    pub command: Option<String>,
    /// Human-readable message.
    pub message: String,
}

impl ProtocolError {
    /// An error with only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            index: None,
            command: None,
            message: message.into(),
        }
    }
}

/// The `[code] command: ` prefix of a [`ProtocolError`], empty parts omitted.
fn context(code: &Option<u32>, command: &Option<String>) -> String {
    let mut out = String::new();
    if let Some(code) = code {
        out.push_str(&format!("[{}] ", code));
    }
    if let Some(command) = command.as_deref().filter(|c| !c.is_empty()) {
        out.push_str(command);
        out.push_str(": ");
    }
    out
}

/// The failure value handed to a request's completion handle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The peer is not listening.  Retried in the background.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// The connection carrying the request went away before a reply arrived.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The peer sent bytes that violate the framing contract.
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),

    /// The peer rejected the request.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A reply did not match the request at the head of the queue.
    #[error("reply out of sync: expected {expected}, received {received}")]
    CorrelationViolation { expected: String, received: String },

    /// No reply arrived before the request's deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The request could not be encoded.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The client was destroyed.
    #[error("client closed")]
    Closed,
}
