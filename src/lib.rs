//! nsq-reader - consumer client for NSQ-style message brokers
//!
//! Subscribes to a topic/channel on many broker nodes at once, discovered
//! through one or more directory services or configured statically, and
//! fans their messages into a single stream with credit-based flow control.

pub mod address;
pub mod config;
pub mod discovery;
pub mod error;
pub mod protocol;
pub mod reader;
pub mod transport;
pub mod utils;

pub use address::Address;
pub use config::ReaderConfig;
pub use error::{ReaderError, Result};
pub use protocol::MessageId;
pub use reader::{
    CloseReason, ConnectionOptions, ConnectionPhase, DirectConnection, Lookup, Message, Reader,
    ReaderConnection, SingleMessageReader,
};
