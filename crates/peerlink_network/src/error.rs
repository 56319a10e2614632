//! Network error types.

use std::time::Duration;

use crate::codec::{DecodeError, EncodeError};
use crate::commands::CommandError;

/// Errors that can occur in the peerlink_network crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Bad node/network name, port list, key or remote cap. Raised at
    /// construction time only.
    #[error("Invalid configuration: {0}")]
    Validation(String),

    /// A payload could not be decrypted or parsed.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A payload could not be encrypted.
    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    /// Command registration or resolution failed.
    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    /// The target is neither locally discovered nor reachable through a relay.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// No response arrived within the configured window.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// A transport-level error (HTTP connect/send/receive).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The target answered, but with a non-success status.
    #[error("Command on {target} failed with status {status}: {detail}")]
    CommandFailed {
        target: String,
        status: u16,
        detail: String,
    },

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The node is not running.
    #[error("Node not running")]
    NotRunning,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for NetworkError {
    fn from(e: reqwest::Error) -> Self {
        NetworkError::Transport(e.to_string())
    }
}
