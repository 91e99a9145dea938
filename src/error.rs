//! Domain-specific error types for the streaming client core.
//!
//! All fallible operations return `Result<T, VaporError>`.
//! No panics on invalid input — every error is typed and recoverable.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the streaming client core.
#[derive(Debug, Error)]
pub enum VaporError {
    // ── Transport Errors ─────────────────────────────────────────
    /// The TCP/UDP layer reported an error.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// Connecting to the remote host exceeded its deadline.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The remote peer disconnected or was never connected.
    #[error("peer disconnected")]
    Disconnected,

    /// A reliable packet went unacknowledged past the peer timeout.
    #[error("peer unresponsive for {0:?}")]
    PeerTimeout(Duration),

    // ── Protocol Errors ──────────────────────────────────────────
    /// The received frame is shorter than its declared header.
    #[error("runt packet: {actual} bytes (min {min})")]
    Runt { actual: usize, min: usize },

    /// The negotiated profile does not carry this message type.
    #[error("message not supported by negotiated profile")]
    UnsupportedMessage,

    // ── Crypto Errors ────────────────────────────────────────────
    /// A cipher init/encrypt/decrypt/tag step failed.
    #[error("cipher failure during {0}")]
    Crypto(&'static str),

    // ── Queue Errors ─────────────────────────────────────────────
    /// A bounded queue rejected an item.
    #[error("queue bound exceeded")]
    QueueBound,

    /// The queue was shut down while waiting or offering.
    #[error("queue shut down")]
    QueueShutdown,

    // ── Lifecycle Errors ─────────────────────────────────────────
    /// An operation was invoked before start or after shutdown.
    #[error("stream not started")]
    NotStarted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = VaporError::Runt { actual: 3, min: 26 };
        assert!(e.to_string().contains('3'));
        assert!(e.to_string().contains("26"));

        let e = VaporError::Crypto("control decrypt");
        assert!(e.to_string().contains("control decrypt"));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: VaporError = io_err.into();
        assert!(matches!(e, VaporError::Io(_)));
    }
}
