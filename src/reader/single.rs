//! One-message-at-a-time consumption across all connections.
//!
//! Every `next` call grants one unit of credit to every connection. The
//! first message to arrive wins: credit is revoked everywhere and the
//! message is handed over. Anything that arrives while no consumer is
//! waiting is requeued untouched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{Delivery, Message, Reader, ReaderContext};
use crate::address::Address;
use crate::config::ReaderConfig;
use crate::discovery::Directory;
use crate::error::{ReaderError, Result};
use crate::transport::Transport;

/// Aborts the pump when the reader goes away.
struct PumpTask(JoinHandle<()>);

impl Drop for PumpTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn pump(
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    context: Arc<ReaderContext>,
    ready: Arc<AtomicBool>,
    handoff: mpsc::Sender<Delivery>,
) {
    while let Some(delivery) = deliveries.recv().await {
        match delivery {
            Ok(message) if ready.swap(false, Ordering::SeqCst) => {
                context.registry.grant(0).await;
                if let Err(rejected) = handoff.send(Ok(message)).await {
                    if let Ok(message) = rejected.0 {
                        let _ = message.requeue(Duration::ZERO).await;
                    }
                    return;
                }
            }
            Ok(message) => requeue_untouched(message).await,
            Err(e) => {
                let _ = handoff.send(Err(e)).await;
                return;
            }
        }
    }
}

async fn requeue_untouched(message: Message) {
    debug!(
        address = %message.address(),
        message_id = %message.id(),
        "No consumer waiting, requeueing"
    );
    if let Err(e) = message.requeue(Duration::ZERO).await {
        debug!(error = %e, "Requeue skipped");
    }
}

/// Undoes a `next` call that is dropped while it waits.
struct Waiting<'a> {
    ready: &'a AtomicBool,
    context: &'a Arc<ReaderContext>,
    revoke: &'a mut Option<JoinHandle<()>>,
    handed_over: &'a mut bool,
    done: bool,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if self.ready.swap(false, Ordering::SeqCst) {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let context = self.context.clone();
                *self.revoke = Some(handle.spawn(async move { context.registry.grant(0).await }));
            }
        } else {
            // The pump already took a message for this call.
            *self.handed_over = true;
        }
    }
}

/// Reader that holds at most one message in flight across all brokers.
pub struct SingleMessageReader {
    reader: Reader,
    ready: Arc<AtomicBool>,
    handoff: mpsc::Receiver<Delivery>,
    _pump: PumpTask,
    /// Credit revocation left behind by a cancelled `next`.
    revoke: Option<JoinHandle<()>>,
    /// A cancelled `next` won a message that is still in the handoff.
    handed_over: bool,
    terminated: bool,
}

impl SingleMessageReader {
    /// Start a reader with no standing credit. `max_in_flight` is ignored.
    pub async fn start(
        mut config: ReaderConfig,
        transport: Arc<dyn Transport>,
        directory: Arc<dyn Directory>,
    ) -> Result<Self> {
        config.max_in_flight = 0;
        let reader = Reader::start(config, transport, directory).await?;
        Self::from_reader(reader)
    }

    /// Same as `start`, over TCP and the HTTP directory.
    pub async fn connect(mut config: ReaderConfig) -> Result<Self> {
        config.max_in_flight = 0;
        let reader = Reader::connect(config).await?;
        Self::from_reader(reader)
    }

    fn from_reader(mut reader: Reader) -> Result<Self> {
        let deliveries = reader
            .take_deliveries()
            .ok_or_else(|| ReaderError::Config("reader deliveries already taken".to_string()))?;
        let ready = Arc::new(AtomicBool::new(false));
        let (tx, handoff) = mpsc::channel(1);
        let task = tokio::spawn(pump(deliveries, reader.context().clone(), ready.clone(), tx));
        Ok(Self {
            reader,
            ready,
            handoff,
            _pump: PumpTask(task),
            revoke: None,
            handed_over: false,
            terminated: false,
        })
    }

    /// Grant one message everywhere and wait for the first to arrive.
    ///
    /// Cancel safe: dropping the call revokes the credit it granted, and a
    /// message it already won is returned by the next call.
    pub async fn next(&mut self) -> Option<Result<Message>> {
        if self.terminated {
            return None;
        }

        let delivery = if self.handed_over {
            let delivery = self.handoff.recv().await;
            self.handed_over = false;
            delivery
        } else {
            if let Some(revoke) = self.revoke.as_mut() {
                let _ = revoke.await;
                self.revoke = None;
            }
            let mut waiting = Waiting {
                ready: &self.ready,
                context: self.reader.context(),
                revoke: &mut self.revoke,
                handed_over: &mut self.handed_over,
                done: false,
            };
            self.ready.store(true, Ordering::SeqCst);
            self.reader.grant(1).await;
            let delivery = self.handoff.recv().await;
            waiting.done = true;
            delivery
        };

        if !matches!(delivery, Some(Ok(_))) {
            self.terminated = true;
        }
        delivery
    }

    /// Addresses of all live connections, sorted.
    pub fn connections(&self) -> Vec<Address> {
        self.reader.connections()
    }

    /// Close the underlying reader and stop handing out messages.
    pub async fn close(self) -> Result<()> {
        self.ready.store(false, Ordering::SeqCst);
        self.reader.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::MockDirectory;
    use crate::transport::MockTransport;

    fn nsqd(n: u16) -> Address {
        Address::new(format!("nsqd-{n}"), 4150)
    }

    async fn start(transport: &MockTransport, brokers: &[Address]) -> SingleMessageReader {
        let mut config = ReaderConfig::new("events", "archive");
        config.nsqd_tcp_addresses = brokers.to_vec();
        config.max_in_flight = 25;
        config.close_timeout_ms = 50;
        let reader = SingleMessageReader::start(
            config,
            Arc::new(transport.clone()),
            Arc::new(MockDirectory::new()),
        )
        .await
        .unwrap();
        for address in brokers {
            let broker = transport.broker(address);
            assert!(broker.wait_for(|b| b.count("SUB") == 1).await);
        }
        reader
    }

    #[tokio::test]
    async fn test_starts_without_credit() {
        let transport = MockTransport::new();
        let reader = start(&transport, &[nsqd(0)]).await;
        let broker = transport.broker(&nsqd(0));

        assert!(broker.wait_for(|b| b.last_ready() == Some(0)).await);
        let id = broker.deliver(b"early").unwrap();
        assert!(broker.wait_for(|b| b.requeued() == vec![id]).await);

        reader.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_first_message_wins_and_other_is_requeued() {
        let transport = MockTransport::new();
        let mut reader = start(&transport, &[nsqd(0), nsqd(1)]).await;
        let a = transport.broker(&nsqd(0));
        let b = transport.broker(&nsqd(1));

        let consumer = tokio::spawn(async move {
            let message = reader.next().await;
            (reader, message)
        });
        assert!(a.wait_for(|x| x.last_ready() == Some(1)).await);
        assert!(b.wait_for(|x| x.last_ready() == Some(1)).await);

        let id_a = a.deliver(b"from a").unwrap();
        let id_b = b.deliver(b"from b").unwrap();

        let (reader, message) = consumer.await.unwrap();
        let message = message.unwrap().unwrap();
        assert!(message.id() == id_a || message.id() == id_b);

        assert!(a.wait_for(|x| x.last_ready() == Some(0)).await);
        assert!(b.wait_for(|x| x.last_ready() == Some(0)).await);

        let other = if message.id() == id_a { (&b, id_b) } else { (&a, id_a) };
        assert!(other.0.wait_for(|x| x.requeued() == vec![other.1]).await);
        assert!(a.requeued().len() + b.requeued().len() == 1);

        message.finish().await.unwrap();
        reader.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_next_after_settle_grants_again() {
        let transport = MockTransport::new();
        let mut reader = start(&transport, &[nsqd(0)]).await;
        let broker = transport.broker(&nsqd(0));

        for body in [b"one", b"two"] {
            let waiter = broker.clone();
            let deliver = tokio::spawn(async move {
                assert!(waiter.wait_for(|b| b.last_ready() == Some(1)).await);
                waiter.deliver(body).unwrap()
            });
            let message = reader.next().await.unwrap().unwrap();
            let id = deliver.await.unwrap();
            assert_eq!(message.id(), id);
            assert_eq!(&message.body()[..], body);
            assert!(broker.wait_for(|b| b.last_ready() == Some(0)).await);
            message.finish().await.unwrap();
        }

        assert_eq!(broker.finished().len(), 2);
        assert!(broker.requeued().is_empty());
        reader.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_next_revokes_credit() {
        let transport = MockTransport::new();
        let mut reader = start(&transport, &[nsqd(0), nsqd(1)]).await;
        let a = transport.broker(&nsqd(0));
        let b = transport.broker(&nsqd(1));

        let waited = tokio::time::timeout(Duration::from_millis(50), reader.next()).await;
        assert!(waited.is_err());
        for broker in [&a, &b] {
            assert!(broker.wait_for(|x| x.count("RDY") == 3 && x.last_ready() == Some(0)).await);
        }

        // Nobody is waiting, so this goes straight back.
        let stale = a.deliver(b"stale").unwrap();
        assert!(a.wait_for(|x| x.requeued() == vec![stale]).await);

        let consumer = tokio::spawn(async move {
            let message = reader.next().await;
            (reader, message)
        });
        assert!(a.wait_for(|x| x.last_ready() == Some(1)).await);
        assert!(b.wait_for(|x| x.last_ready() == Some(1)).await);
        let fresh = b.deliver(b"fresh").unwrap();

        let (reader, message) = consumer.await.unwrap();
        let message = message.unwrap().unwrap();
        assert_eq!(message.id(), fresh);
        assert!(a.wait_for(|x| x.last_ready() == Some(0)).await);
        assert!(b.wait_for(|x| x.last_ready() == Some(0)).await);

        message.finish().await.unwrap();
        assert_eq!(a.requeued(), vec![stale]);
        assert!(b.requeued().is_empty());
        reader.close().await.unwrap();
    }
}
