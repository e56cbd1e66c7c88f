//! Delivered messages and their acknowledgment.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, warn};

use super::connection::ConnectionShared;
use crate::address::Address;
use crate::error::{ReaderError, Result};
use crate::protocol::{Command, MessageId, RawMessage};

/// A message delivered to the application.
///
/// Settle it with `finish` or `requeue`. A message dropped unsettled is
/// requeued immediately. While unsettled, the broker-side lease is renewed
/// in the background so slow handlers do not trigger redelivery.
pub struct Message {
    id: MessageId,
    timestamp: i64,
    attempts: u16,
    body: Bytes,
    connection: Arc<ConnectionShared>,
}

impl Message {
    pub(crate) fn new(raw: RawMessage, connection: Arc<ConnectionShared>) -> Self {
        Self {
            id: raw.id,
            timestamp: raw.timestamp,
            attempts: raw.attempts,
            body: raw.body,
            connection,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Delivery attempts so far, including this one.
    pub fn attempts(&self) -> u16 {
        self.attempts
    }

    /// Broker timestamp, nanoseconds since the epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.timestamp)
    }

    /// Broker that delivered this message.
    pub fn address(&self) -> &Address {
        self.connection.address()
    }

    /// Acknowledge successful processing.
    ///
    /// Fails with `NotInFlight` if the connection already requeued the
    /// message while closing. A broken link is logged and tolerated: the
    /// broker redelivers after its own timeout.
    pub async fn finish(self) -> Result<()> {
        self.settle(Command::Fin(self.id)).await
    }

    /// Return the message to the broker for redelivery after `delay`.
    pub async fn requeue(self, delay: Duration) -> Result<()> {
        self.settle(Command::Req(self.id, delay)).await
    }

    /// Reset the broker-side processing timeout now.
    pub async fn touch(&self) -> Result<()> {
        if !self.connection.is_in_flight(&self.id) {
            return Err(ReaderError::NotInFlight(self.id));
        }
        self.connection.send(Command::Touch(self.id)).await
    }

    async fn settle(&self, command: Command) -> Result<()> {
        let entry = self
            .connection
            .take_in_flight(&self.id)
            .ok_or(ReaderError::NotInFlight(self.id))?;
        entry.cancel_lease().await;

        let verb = command.name();
        if let Err(e) = self.connection.send(command).await {
            warn!(
                address = %self.connection.address(),
                message_id = %self.id,
                command = verb,
                error = %e,
                "Acknowledgment not delivered, broker will redeliver"
            );
        } else {
            debug!(address = %self.connection.address(), message_id = %self.id, command = verb, "Settled");
        }
        Ok(())
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        let Some(entry) = self.connection.take_in_flight(&self.id) else {
            return;
        };

        let id = self.id;
        let connection = self.connection.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(address = %connection.address(), message_id = %id, "Message dropped unsettled, requeueing");
                handle.spawn(async move {
                    entry.cancel_lease().await;
                    if let Err(e) = connection.send(Command::Req(id, Duration::ZERO)).await {
                        debug!(address = %connection.address(), message_id = %id, error = %e, "Requeue failed");
                    }
                });
            }
            Err(_) => warn!(message_id = %id, "Message dropped outside a runtime; broker will redeliver"),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("attempts", &self.attempts)
            .field("timestamp", &self.timestamp)
            .field("body_len", &self.body.len())
            .field("address", self.connection.address())
            .finish()
    }
}
