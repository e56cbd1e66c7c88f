//! Broker wire protocol.
//!
//! This module contains:
//! - `Command`: client → broker commands and their line encoding
//! - `MessageId`: fixed-width broker-assigned message identifier
//! - `Frame`: broker → client frames and message decoding (see `frame`)
//! - Topic/channel name validation

use std::fmt;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

pub mod frame;

pub use frame::{read_frame, Frame, RawMessage};

/// Protocol magic sent once after the TCP connection is established.
pub const MAGIC_V2: &[u8; 4] = b"  V2";

/// Response body the broker sends to check the consumer is alive.
pub const HEARTBEAT: &[u8] = b"_heartbeat_";

/// Response body acknowledging `CLS`.
pub const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";

/// Length of a message id on the wire.
pub const MESSAGE_ID_LEN: usize = 16;

/// Maximum length of a topic or channel name.
const MAX_NAME_LEN: usize = 64;

/// Suffix marking an ephemeral topic or channel.
const EPHEMERAL_SUFFIX: &str = "#ephemeral";

/// Errors decoding broker frames or validating protocol values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Truncated {what}: need {expected} bytes, got {actual}")]
    Truncated {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Unknown frame type {0}")]
    UnknownFrameType(u32),

    #[error("Invalid {kind} name '{name}'")]
    InvalidName { kind: &'static str, name: String },
}

/// Opaque broker-assigned message identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(pub [u8; MESSAGE_ID_LEN]);

impl MessageId {
    pub fn as_bytes(&self) -> &[u8; MESSAGE_ID_LEN] {
        &self.0
    }
}

impl From<[u8; MESSAGE_ID_LEN]> for MessageId {
    fn from(bytes: [u8; MESSAGE_ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Brokers hand out printable ASCII ids; anything else is shown as hex.
        if self.0.iter().all(|b| b.is_ascii_graphic()) {
            f.write_str(&String::from_utf8_lossy(&self.0))
        } else {
            f.write_str(&hex::encode(self.0))
        }
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

/// Commands a reader sends to a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Subscribe to a topic/channel.
    Sub { topic: String, channel: String },
    /// Grant credit: the broker may push up to `n` unacknowledged messages.
    Rdy(u64),
    /// Mark a message as successfully processed.
    Fin(MessageId),
    /// Requeue a message, eligible for redelivery after `delay`.
    Req(MessageId, Duration),
    /// Reset the processing timeout of an in-flight message.
    Touch(MessageId),
    /// Stop delivery and start a graceful close.
    Cls,
    /// Heartbeat reply.
    Nop,
}

impl Command {
    /// Protocol verb, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Sub { .. } => "SUB",
            Command::Rdy(_) => "RDY",
            Command::Fin(_) => "FIN",
            Command::Req(..) => "REQ",
            Command::Touch(_) => "TOUCH",
            Command::Cls => "CLS",
            Command::Nop => "NOP",
        }
    }

    /// Encode as a newline-terminated command line.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_slice(self.name().as_bytes());
        match self {
            Command::Sub { topic, channel } => {
                buf.put_u8(b' ');
                buf.put_slice(topic.as_bytes());
                buf.put_u8(b' ');
                buf.put_slice(channel.as_bytes());
            }
            Command::Rdy(n) => {
                buf.put_slice(format!(" {}", n).as_bytes());
            }
            Command::Fin(id) | Command::Touch(id) => {
                buf.put_u8(b' ');
                buf.put_slice(id.as_bytes());
            }
            Command::Req(id, delay) => {
                buf.put_u8(b' ');
                buf.put_slice(id.as_bytes());
                buf.put_slice(format!(" {}", delay.as_millis()).as_bytes());
            }
            Command::Cls | Command::Nop => {}
        }
        buf.put_u8(b'\n');
        buf.freeze()
    }
}

/// Validate a topic or channel name.
///
/// Names are 1..=64 characters of `[.a-zA-Z0-9_-]`, optionally ending in
/// `#ephemeral`.
pub fn validate_name(kind: &'static str, name: &str) -> Result<(), ProtocolError> {
    let base = name.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(name);
    let valid = !base.is_empty()
        && name.len() <= MAX_NAME_LEN
        && base
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));

    if valid {
        Ok(())
    } else {
        Err(ProtocolError::InvalidName {
            kind,
            name: name.to_string(),
        })
    }
}

/// Error codes the broker reports for a single failed FIN/REQ/TOUCH.
///
/// These leave the connection usable; every other error frame is fatal.
pub fn is_recoverable_error(body: &[u8]) -> bool {
    const RECOVERABLE: [&[u8]; 3] = [b"E_FIN_FAILED", b"E_REQ_FAILED", b"E_TOUCH_FAILED"];
    RECOVERABLE.iter().any(|code| body.starts_with(code))
}
