//! Framed connections to broker nodes.
//!
//! A `Transport` opens a `Link` to one broker: a `CommandSink` for outbound
//! commands and a mailbox of `Inbound` events fed by the transport's own
//! receive activity. The reader never registers callbacks; it drains the
//! mailbox from its connection task.
//!
//! Implementations:
//! - `TcpTransport`: TCP with the V2 framing
//! - `MockTransport`: in-memory fake broker for tests (`test-utils`)

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::address::Address;
use crate::error::Result;
use crate::protocol::{Command, Frame};

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod tcp;

#[cfg(any(test, feature = "test-utils"))]
pub use mock::{MockBroker, MockTransport};
pub use tcp::TcpTransport;

/// Event delivered from a broker link to its owning connection.
#[derive(Debug)]
pub enum Inbound {
    /// A decoded frame.
    Frame(Frame),
    /// The link is gone. Terminal; carries the failure reason if any.
    Closed(Option<String>),
}

/// Outbound half of a broker link.
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Write one command.
    ///
    /// Fails once the link is closed or broken.
    async fn send(&self, command: Command) -> Result<()>;

    /// Release the link. Idempotent.
    async fn close(&self);
}

/// An established link to one broker node.
pub struct Link {
    pub sink: Arc<dyn CommandSink>,
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
}

/// Opens links to broker nodes.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, address: &Address) -> Result<Link>;
}
