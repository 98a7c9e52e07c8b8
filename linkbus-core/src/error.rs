//! Typed errors for the bus protocol.
//!
//! Expected negative outcomes — an authentication refusal, a frame that
//! matches no subscriber — are ordinary values, not errors. `BusError` is
//! reserved for malformed input, protocol violations and dead transports.

use thiserror::Error;

/// The canonical error type for the bus.
#[derive(Debug, Error)]
pub enum BusError {
    // ── Frame Errors ─────────────────────────────────────────────
    /// An inbound line carried no topic delimiter.
    #[error("malformed frame: missing topic delimiter")]
    MissingDelimiter,

    /// The payload segment was not valid JSON.
    #[error("payload decode error: {0}")]
    Payload(#[from] serde_json::Error),

    /// A wire line was not valid UTF-8.
    #[error("invalid utf-8 in frame: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// A single line exceeded the codec's limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Command payload fields are flattened into the outbound message, so
    /// the payload must be a JSON object (or null for "no payload").
    #[error("command payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    // ── Protocol Errors ──────────────────────────────────────────
    /// A reply frame arrived while no command was in flight.
    #[error("reply received with no command in flight")]
    OrphanReply,

    /// An invalid link lifecycle transition was attempted.
    #[error("link state violation: {0}")]
    LinkState(&'static str),

    // ── Connection Errors ────────────────────────────────────────
    /// A controller address could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The underlying stream reported an error.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// A channel to the bus task was closed unexpectedly.
    #[error("bus channel closed")]
    ChannelClosed,

    /// The session ended with this operation still unresolved.
    #[error("connection closed")]
    Closed,
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for BusError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        BusError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = BusError::MissingDelimiter;
        assert!(e.to_string().contains("delimiter"));

        let e = BusError::FrameTooLarge {
            size: 2000,
            max: 1000,
        };
        assert!(e.to_string().contains("2000"));
        assert!(e.to_string().contains("1000"));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: BusError = io_err.into();
        assert!(matches!(e, BusError::Io(_)));
    }

    #[test]
    fn from_send_error() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<u8>();
        drop(rx);
        let e: BusError = tx.send(1).unwrap_err().into();
        assert!(matches!(e, BusError::ChannelClosed));
    }
}
