//! Inbound frame decoding.
//!
//! Every frame is `u32 size | u32 frame_type | data` (big-endian), where
//! `size` counts the frame type and the data.

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{MessageId, ProtocolError, MESSAGE_ID_LEN};

pub const FRAME_TYPE_RESPONSE: u32 = 0;
pub const FRAME_TYPE_ERROR: u32 = 1;
pub const FRAME_TYPE_MESSAGE: u32 = 2;

/// Upper bound on a single frame.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Timestamp + attempts + id.
const MESSAGE_HEADER_LEN: usize = 8 + 2 + MESSAGE_ID_LEN;

/// A frame received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Response(Bytes),
    Error(Bytes),
    Message(RawMessage),
}

/// A decoded message frame, not yet bound to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Broker receive time, nanoseconds since the Unix epoch.
    pub timestamp: i64,
    pub attempts: u16,
    pub id: MessageId,
    pub body: Bytes,
}

impl Frame {
    /// Decode a frame from its type and data (size prefix already stripped).
    pub fn decode(frame_type: u32, data: Bytes) -> Result<Self, ProtocolError> {
        match frame_type {
            FRAME_TYPE_RESPONSE => Ok(Frame::Response(data)),
            FRAME_TYPE_ERROR => Ok(Frame::Error(data)),
            FRAME_TYPE_MESSAGE => RawMessage::decode(data).map(Frame::Message),
            other => Err(ProtocolError::UnknownFrameType(other)),
        }
    }

    /// Whether this is a response carrying exactly `body`.
    pub fn is_response(&self, body: &[u8]) -> bool {
        matches!(self, Frame::Response(data) if &data[..] == body)
    }
}

impl RawMessage {
    pub fn decode(mut data: Bytes) -> Result<Self, ProtocolError> {
        if data.len() < MESSAGE_HEADER_LEN {
            return Err(ProtocolError::Truncated {
                what: "message header",
                expected: MESSAGE_HEADER_LEN,
                actual: data.len(),
            });
        }

        let timestamp = data.get_i64();
        let attempts = data.get_u16();
        let mut id = [0u8; MESSAGE_ID_LEN];
        data.copy_to_slice(&mut id);

        Ok(Self {
            timestamp,
            attempts,
            id: MessageId(id),
            body: data,
        })
    }
}

/// Read one frame from a byte stream.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut size_buf = [0u8; 4];
    match reader.read_exact(&mut size_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let size = u32::from_be_bytes(size_buf) as usize;
    if size > MAX_FRAME_SIZE {
        return Err(invalid_data(ProtocolError::FrameTooLarge {
            size,
            limit: MAX_FRAME_SIZE,
        }));
    }
    if size < 4 {
        return Err(invalid_data(ProtocolError::Truncated {
            what: "frame",
            expected: 4,
            actual: size,
        }));
    }

    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf).await?;

    let mut data = Bytes::from(buf);
    let frame_type = data.get_u32();
    Frame::decode(frame_type, data)
        .map(Some)
        .map_err(invalid_data)
}

fn invalid_data(e: ProtocolError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e)
}
