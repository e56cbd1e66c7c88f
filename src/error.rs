//! Reader error taxonomy.

use crate::address::Address;
use crate::discovery::DiscoveryError;
use crate::protocol::{MessageId, ProtocolError};

/// Result type for reader operations.
pub type Result<T> = std::result::Result<T, ReaderError>;

/// Errors that can occur while consuming.
///
/// Only `DirectConnectionLost` is ever yielded by a reader's message
/// stream; transport, discovery and protocol failures are logged and
/// recovered by the component that owns them.
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Connection to {address} failed: {message}")]
    Connect { address: Address, message: String },

    #[error("Already connected to {0}")]
    AlreadyConnected(Address),

    #[error("Connection to {0} is closed")]
    Closed(Address),

    #[error("Direct connection to {address} lost after {attempts} attempts: {message}")]
    DirectConnectionLost {
        address: Address,
        attempts: usize,
        message: String,
    },

    #[error("Message {0} is not in flight")]
    NotInFlight(MessageId),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
