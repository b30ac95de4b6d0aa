//! Error types shared by both ends of a connection.
//!
//! Decode failures are split into two classes. A fatal [`CodecError`] means
//! the byte stream can no longer be trusted and the connection must be torn
//! down. A [`CodecError::PayloadMismatch`] means the frame itself was sound
//! but its contents were not what the receiver expected, which is answered
//! with an operation failure while the connection stays open.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::packet::{FailureInfo, FailureKind};

/// Errors produced while turning packets into frames and back.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed frame: {0}")]
    Malformed(#[source] bincode::Error),

    #[error("Frame is missing its authenticity marker")]
    MissingMarker,

    #[error("Frame carries an unrecognised authenticity marker")]
    WrongMarker,

    #[error("Payload mismatch: {0}")]
    PayloadMismatch(String),

    /// Only produced while encoding; nothing reaches the wire.
    #[error("Frame of {size} bytes exceeds the {max} byte limit")]
    Oversized { size: usize, max: usize },
}

impl CodecError {
    /// Whether the connection that produced this error must be closed.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            CodecError::PayloadMismatch(_) | CodecError::Oversized { .. }
        )
    }
}

/// Errors surfaced by connection-level operations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed")]
    Closed,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Rejected by server: {0}")]
    Rejected(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Returned by application handlers when they cannot process a packet.
///
/// The error is reported back to whoever sent the packet as an
/// operation-failed envelope; it never tears down the connection.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Payload(#[from] CodecError),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }

    /// The description of this error that is allowed to cross the wire.
    pub fn to_failure_info(&self) -> FailureInfo {
        match self {
            HandlerError::Payload(e) => FailureInfo::new(FailureKind::PayloadMismatch, e.to_string()),
            HandlerError::Failed(message) => FailureInfo::new(FailureKind::HandlerFailed, message.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_mismatch_is_recoverable() {
        assert!(!CodecError::PayloadMismatch("wrong type".to_string()).is_fatal());
        assert!(!CodecError::Oversized { size: 2, max: 1 }.is_fatal());
        assert!(CodecError::MissingMarker.is_fatal());
        assert!(CodecError::WrongMarker.is_fatal());
        assert!(CodecError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "eof")).is_fatal());
    }

    #[test]
    fn test_handler_error_failure_info() {
        let info = HandlerError::failed("no such room").to_failure_info();
        assert_eq!(info.kind, FailureKind::HandlerFailed);
        assert_eq!(info.message, "no such room");

        let info = HandlerError::from(CodecError::PayloadMismatch("expected u32".to_string()))
            .to_failure_info();
        assert_eq!(info.kind, FailureKind::PayloadMismatch);
        assert!(info.message.contains("expected u32"));
    }
}
