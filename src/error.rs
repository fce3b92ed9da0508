//! Error types for crosslink
//!
//! Every failure that reaches a user resolves to a short status string via
//! [`LinkError::status_message`] rather than raw error text.

use std::io;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// A specialized `Result` type for crosslink operations.
pub type Result<T> = std::result::Result<T, LinkError>;

/// Close code the host uses when a `pair` frame carries a bad token.
pub const CLOSE_PAIRING_REJECTED: u16 = 4001;

/// Close code the host uses when no `pair` frame arrives in time.
pub const CLOSE_HANDSHAKE_TIMEOUT: u16 = 4002;

#[derive(Error, Debug)]
pub enum LinkError {
    /// DNS failure, refused connection, unreachable host
    #[error("failed to connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("handshake with {0} timed out")]
    HandshakeTimeout(String),

    /// Host closed the socket with [`CLOSE_PAIRING_REJECTED`]
    #[error("pairing rejected by host")]
    PairingRejected,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("no paired devices")]
    NoDevices,

    #[error("none of the paired devices answered")]
    Unreachable,

    #[error("no {0} from device")]
    NoReply(&'static str),

    #[error("session is not authenticated")]
    NotAuthenticated,

    #[error("connection closed")]
    Closed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("command rejected: {0}")]
    Command(String),

    #[error("clipboard unavailable: {0}")]
    Clipboard(String),

    #[error("failed to generate QR code: {0}")]
    Qr(String),

    #[error("failed to detect LAN address: {0}")]
    LocalIp(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    WebSocket(#[from] tungstenite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Failures of the chunked file transfer protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("no transfer in progress for file id {0}")]
    UnknownTransfer(String),

    #[error("chunk {missing} of '{file}' never arrived")]
    ChunkGap { file: String, missing: u64 },

    #[error("'{file}' declared {declared} bytes but {received} arrived")]
    SizeMismatch {
        file: String,
        declared: u64,
        received: u64,
    },

    #[error("chunk {index} of '{file}' is not valid base64")]
    InvalidChunk { file: String, index: u64 },

    #[error("'{file}' is {size} bytes, limit is {limit}")]
    TooLarge { file: String, size: u64, limit: u64 },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("cannot read '{path}': {reason}")]
    Read { path: String, reason: String },

    #[error("cannot write '{path}': {reason}")]
    Write { path: String, reason: String },

    #[error("connection lost during transfer")]
    ConnectionLost,
}

impl LinkError {
    /// Short human readable status for UIs.
    pub fn status_message(&self) -> String {
        match self {
            LinkError::Connect { .. } | LinkError::WebSocket(_) => {
                "Unable to reach device".to_string()
            }
            LinkError::HandshakeTimeout(_) | LinkError::NoReply(_) => {
                "Device did not respond".to_string()
            }
            LinkError::PairingRejected => "Pairing rejected".to_string(),
            LinkError::Protocol(_) | LinkError::Json(_) => "Unexpected reply from device".to_string(),
            LinkError::Transfer(e) => match e {
                TransferError::Cancelled => "Transfer cancelled".to_string(),
                TransferError::Read { .. } => "Could not read file".to_string(),
                TransferError::TooLarge { .. } => "File is too large".to_string(),
                TransferError::ConnectionLost => "Connection lost".to_string(),
                _ => "Transfer failed".to_string(),
            },
            LinkError::Storage(_) => "Could not access saved devices".to_string(),
            LinkError::NoDevices => "No paired devices".to_string(),
            LinkError::Unreachable => "No paired device reachable".to_string(),
            LinkError::NotAuthenticated => "Not connected".to_string(),
            LinkError::Closed => "Disconnected".to_string(),
            LinkError::Cancelled => "Cancelled".to_string(),
            LinkError::Command(_) => "Command not allowed".to_string(),
            LinkError::Clipboard(_) => "Clipboard unavailable".to_string(),
            LinkError::Qr(_) => "Could not render QR code".to_string(),
            LinkError::LocalIp(_) => "No network connection".to_string(),
            LinkError::Io(_) => "I/O error".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairing_rejected_has_distinct_status() {
        let rejected = LinkError::PairingRejected.status_message();
        let closed = LinkError::Closed.status_message();
        let refused = LinkError::Connect {
            addr: "10.0.0.2:9000".into(),
            reason: "refused".into(),
        }
        .status_message();

        assert_eq!(rejected, "Pairing rejected");
        assert_ne!(rejected, closed);
        assert_ne!(rejected, refused);
    }

    #[test]
    fn test_status_never_leaks_raw_text() {
        let err = LinkError::Protocol("expected value at line 1 column 1".into());
        assert!(!err.status_message().contains("line 1"));
    }

    #[test]
    fn test_transfer_error_display() {
        let err = TransferError::SizeMismatch {
            file: "a.bin".into(),
            declared: 100,
            received: 50,
        };
        assert_eq!(err.to_string(), "'a.bin' declared 100 bytes but 50 arrived");
    }
}
