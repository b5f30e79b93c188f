//! Domain-specific error types for the RFB engine.
//!
//! All fallible operations return `Result<T, RfbError>`.
//! Invalid input never panics. Every error is typed and classified
//! through [`RfbError::kind`].

use std::time::Duration;
use thiserror::Error;

use crate::types::{FrameSize, Rect};

// ── ErrorKind ────────────────────────────────────────────────────

/// Coarse classification used by session owners to decide what to do
/// with a failed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Socket closed, reset or timed out. Not retried internally.
    Transport,
    /// The peer broke the wire protocol. Always fatal.
    Protocol,
    /// A codec could not decode a rectangle. Fatal by default.
    Decode,
    /// A component was used outside its lifecycle.
    Lifecycle,
    /// The caller passed a value the protocol cannot carry.
    InvalidInput,
    /// Work stopped because cancellation was requested.
    Cancelled,
}

// ── RfbError ─────────────────────────────────────────────────────

/// The canonical error type for the RFB engine.
#[derive(Debug, Error)]
pub enum RfbError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// The server banner is not a protocol version we can speak.
    #[error("unsupported protocol version: {0:?}")]
    UnsupportedVersion(String),

    /// The server refused the connection and gave a reason.
    #[error("server refused connection: {0}")]
    ConnectionRefused(String),

    /// None of the offered security types is usable.
    #[error("no supported security type offered (server offered {0:?})")]
    NoSecurityType(Vec<u32>),

    /// VNC authentication was offered but no password is configured.
    #[error("server requires a password")]
    PasswordRequired,

    /// The SecurityResult reported a failure.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// A rectangle used an encoding id no codec claims.
    #[error("unknown encoding id {0}")]
    UnknownEncoding(i32),

    /// A rectangle extends past the current framebuffer.
    #[error("rectangle {rect} outside framebuffer {size}")]
    RectOutOfBounds { rect: Rect, size: FrameSize },

    /// A message body exceeded the configured maximum.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// A packet violated protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// A codec rejected the bytes of one rectangle.
    #[error("decode error in encoding {encoding}: {source}")]
    Decode {
        encoding: i32,
        #[source]
        source: DecodeError,
    },

    /// Two codecs claimed the same encoding id.
    #[error("encoding id {0} is already registered")]
    DuplicateEncoding(i32),

    // ── Caller Errors ────────────────────────────────────────────
    /// An outbound message parameter is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// The transport is closed; nothing more can be sent or received.
    #[error("connection closed")]
    ConnectionClosed,

    /// The stream ended in the middle of a message.
    #[error("connection closed mid-message ({0} bytes pending)")]
    UnexpectedEof(usize),

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Lifecycle Errors ─────────────────────────────────────────
    /// The operation was cancelled through the connection token.
    #[error("operation cancelled")]
    Cancelled,

    /// A component was used after disposal.
    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// The background unit of work panicked.
    #[error("background task panicked: {0}")]
    Panicked(String),
}

impl RfbError {
    /// Classify the error for the session owner.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RfbError::Connection(_)
            | RfbError::ConnectionClosed
            | RfbError::UnexpectedEof(_)
            | RfbError::Timeout(_) => ErrorKind::Transport,
            RfbError::Decode { .. } => ErrorKind::Decode,
            RfbError::InvalidArgument(_) | RfbError::DuplicateEncoding(_) => ErrorKind::InvalidInput,
            RfbError::Lifecycle(_) | RfbError::Panicked(_) => ErrorKind::Lifecycle,
            RfbError::Cancelled => ErrorKind::Cancelled,
            RfbError::UnsupportedVersion(_)
            | RfbError::ConnectionRefused(_)
            | RfbError::NoSecurityType(_)
            | RfbError::PasswordRequired
            | RfbError::AuthFailed(_)
            | RfbError::UnknownVariant { .. }
            | RfbError::UnknownEncoding(_)
            | RfbError::RectOutOfBounds { .. }
            | RfbError::MessageTooLarge { .. }
            | RfbError::ProtocolViolation(_) => ErrorKind::Protocol,
        }
    }

    /// Whether the error is fatal to the connection it came from.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::Cancelled | ErrorKind::Lifecycle | ErrorKind::InvalidInput
        )
    }
}

// ── DecodeError ──────────────────────────────────────────────────

/// Typed error for codec failures.
///
/// The receiver wraps these into [`RfbError::Decode`] together with the
/// encoding id of the offending rectangle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The byte span ended before the encoding was complete.
    #[error("truncated {0}")]
    Truncated(&'static str),

    /// A field held a value the encoding does not allow.
    #[error("invalid {0}")]
    Invalid(&'static str),

    /// The negotiated pixel format cannot be handled by this codec.
    #[error("unsupported pixel format: {0}")]
    UnsupportedPixelFormat(String),

    /// A write or copy fell outside the target buffer.
    #[error("{0} outside framebuffer")]
    OutOfBounds(Rect),

    /// The zlib stream could not be inflated.
    #[error("zlib: {0}")]
    Zlib(String),
}

// ── LifecycleError ───────────────────────────────────────────────

/// Typed error for components used outside their lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    /// The component was disposed; it cannot be restarted.
    #[error("{0} has been disposed")]
    Disposed(&'static str),

    /// The component was created outside a Tokio runtime.
    #[error("no tokio runtime available for {0}")]
    NoRuntime(&'static str),

    /// A connection phase transition was not allowed.
    #[error("invalid phase transition: {0}")]
    InvalidTransition(&'static str),
}

// ── Convenient From implementations ──────────────────────────────

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for RfbError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        RfbError::ConnectionClosed
    }
}
