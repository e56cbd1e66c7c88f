//! In-memory fake broker for testing.
//!
//! `MockTransport` hands out links to `MockBroker`s keyed by address. Each
//! broker records every command it receives and lets a test push frames
//! (messages, heartbeats, errors) or break the link.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::{CommandSink, Inbound, Link, Transport};
use crate::address::Address;
use crate::error::{ReaderError, Result};
use crate::protocol::{Command, Frame, MessageId, RawMessage, CLOSE_WAIT, HEARTBEAT};

/// How long `MockBroker::wait_for` polls before giving up.
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Fake transport: every address maps to one `MockBroker`.
#[derive(Clone, Default)]
pub struct MockTransport {
    brokers: Arc<Mutex<HashMap<Address, MockBroker>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or create) the broker behind `address`.
    pub fn broker(&self, address: &Address) -> MockBroker {
        let mut brokers = self.brokers.lock().unwrap_or_else(|e| e.into_inner());
        brokers
            .entry(address.clone())
            .or_insert_with(|| MockBroker::new(address.clone()))
            .clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, address: &Address) -> Result<Link> {
        self.broker(address).accept()
    }
}

struct Session {
    id: u64,
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
}

struct BrokerState {
    address: Address,
    session: Mutex<Option<Session>>,
    commands: Mutex<Vec<Command>>,
    connects: AtomicUsize,
    next_session: AtomicU64,
    next_message: AtomicU64,
    refuse_connect: AtomicBool,
    ack_close: AtomicBool,
    fail_sends: AtomicBool,
    reset_on_accept: AtomicBool,
    write_delay_ms: AtomicU64,
    torn_writes: AtomicUsize,
}

/// Handle to one fake broker node.
#[derive(Clone)]
pub struct MockBroker {
    state: Arc<BrokerState>,
}

impl MockBroker {
    fn new(address: Address) -> Self {
        Self {
            state: Arc::new(BrokerState {
                address,
                session: Mutex::new(None),
                commands: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
                next_session: AtomicU64::new(1),
                next_message: AtomicU64::new(1),
                refuse_connect: AtomicBool::new(false),
                ack_close: AtomicBool::new(true),
                fail_sends: AtomicBool::new(false),
                reset_on_accept: AtomicBool::new(false),
                write_delay_ms: AtomicU64::new(0),
                torn_writes: AtomicUsize::new(0),
            }),
        }
    }

    fn accept(&self) -> Result<Link> {
        if self.state.refuse_connect.load(Ordering::SeqCst) {
            return Err(ReaderError::Connect {
                address: self.state.address.clone(),
                message: "connection refused".to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.state.next_session.fetch_add(1, Ordering::SeqCst);
        if self.state.reset_on_accept.load(Ordering::SeqCst) {
            let _ = tx.send(Inbound::Closed(Some("connection reset by peer".to_string())));
        }
        *self.session() = Some(Session {
            id,
            inbound: Some(tx),
        });
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        Ok(Link {
            sink: Arc::new(MockSink {
                state: self.state.clone(),
                session: id,
            }),
            inbound: rx,
        })
    }

    fn session(&self) -> std::sync::MutexGuard<'_, Option<Session>> {
        self.state.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, frame: Frame) -> bool {
        let session = self.session();
        match session.as_ref().and_then(|s| s.inbound.as_ref()) {
            Some(tx) => tx.send(Inbound::Frame(frame)).is_ok(),
            None => false,
        }
    }

    pub fn address(&self) -> &Address {
        &self.state.address
    }

    /// Refuse (or accept again) new connections.
    pub fn set_refuse_connect(&self, refuse: bool) {
        self.state.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    /// Whether `CLS` is answered with `CLOSE_WAIT`. Defaults to true.
    pub fn set_ack_close(&self, ack: bool) {
        self.state.ack_close.store(ack, Ordering::SeqCst);
    }

    /// Accept links and then reset them at once, as a broker that drops
    /// every session would.
    pub fn set_reset_on_accept(&self, reset: bool) {
        self.state.reset_on_accept.store(reset, Ordering::SeqCst);
    }

    /// Make every command write take `delay`, as under socket backpressure.
    pub fn set_write_delay(&self, delay: Duration) {
        self.state
            .write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Writes abandoned part way through. Each one would leave a partial
    /// command on a real socket.
    pub fn torn_writes(&self) -> usize {
        self.state.torn_writes.load(Ordering::SeqCst)
    }

    /// Make every command write fail, as on a half-dead socket.
    pub fn set_fail_sends(&self, fail: bool) {
        self.state.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Number of links accepted so far.
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Whether a link is currently open.
    pub fn is_connected(&self) -> bool {
        self.session()
            .as_ref()
            .map(|s| s.inbound.is_some())
            .unwrap_or(false)
    }

    /// Deliver a message with a generated id. `None` if no link is open.
    pub fn deliver(&self, body: &[u8]) -> Option<MessageId> {
        let n = self.state.next_message.fetch_add(1, Ordering::SeqCst);
        let mut id = [0u8; 16];
        id.copy_from_slice(format!("{:016}", n).as_bytes());
        self.deliver_with(MessageId(id), 1, body)
    }

    /// Deliver a message with an explicit id and attempt count.
    pub fn deliver_with(&self, id: MessageId, attempts: u16, body: &[u8]) -> Option<MessageId> {
        let timestamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let frame = Frame::Message(RawMessage {
            timestamp,
            attempts,
            id,
            body: Bytes::copy_from_slice(body),
        });
        self.push(frame).then_some(id)
    }

    /// Send a heartbeat.
    pub fn heartbeat(&self) -> bool {
        self.push(Frame::Response(Bytes::from_static(HEARTBEAT)))
    }

    /// Send an error frame.
    pub fn send_error(&self, body: &'static [u8]) -> bool {
        self.push(Frame::Error(Bytes::from_static(body)))
    }

    /// Break the current link as a network failure would.
    pub fn drop_connection(&self) {
        let mut session = self.session();
        if let Some(tx) = session.as_mut().and_then(|s| s.inbound.take()) {
            let _ = tx.send(Inbound::Closed(Some("connection reset by peer".to_string())));
        }
    }

    /// Fail the read side only: the connection sees a transport error while
    /// commands it writes still reach the broker.
    pub fn fail_reads(&self, reason: &str) {
        let session = self.session();
        if let Some(tx) = session.as_ref().and_then(|s| s.inbound.as_ref()) {
            let _ = tx.send(Inbound::Closed(Some(reason.to_string())));
        }
    }

    /// Snapshot of every command received, across all links.
    pub fn commands(&self) -> Vec<Command> {
        self.state
            .commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn clear_commands(&self) {
        self.state
            .commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Number of received commands with the given verb.
    pub fn count(&self, verb: &str) -> usize {
        self.commands().iter().filter(|c| c.name() == verb).count()
    }

    /// Most recent credit grant.
    pub fn last_ready(&self) -> Option<u64> {
        self.commands().iter().rev().find_map(|c| match c {
            Command::Rdy(n) => Some(*n),
            _ => None,
        })
    }

    pub fn finished(&self) -> Vec<MessageId> {
        self.commands()
            .iter()
            .filter_map(|c| match c {
                Command::Fin(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn requeued(&self) -> Vec<MessageId> {
        self.commands()
            .iter()
            .filter_map(|c| match c {
                Command::Req(id, _) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn touches(&self, id: MessageId) -> usize {
        self.commands()
            .iter()
            .filter(|c| matches!(c, Command::Touch(t) if *t == id))
            .count()
    }

    /// Poll until `predicate` holds for this broker. Returns false on timeout.
    pub async fn wait_for<F>(&self, predicate: F) -> bool
    where
        F: Fn(&MockBroker) -> bool,
    {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if predicate(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        predicate(self)
    }
}

struct MockSink {
    state: Arc<BrokerState>,
    session: u64,
}

/// Counts a write as torn unless it is marked complete before dropping.
struct PendingWrite<'a> {
    state: &'a BrokerState,
    complete: bool,
}

impl Drop for PendingWrite<'_> {
    fn drop(&mut self) {
        if !self.complete {
            self.state.torn_writes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl MockSink {
    fn live_sender(&self) -> Option<mpsc::UnboundedSender<Inbound>> {
        let session = self.state.session.lock().unwrap_or_else(|e| e.into_inner());
        session
            .as_ref()
            .filter(|s| s.id == self.session)
            .and_then(|s| s.inbound.clone())
    }
}

#[async_trait]
impl CommandSink for MockSink {
    async fn send(&self, command: Command) -> Result<()> {
        let inbound = self
            .live_sender()
            .ok_or_else(|| ReaderError::Closed(self.state.address.clone()))?;
        if self.state.fail_sends.load(Ordering::SeqCst) {
            return Err(ReaderError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "broken pipe",
            )));
        }

        let delay = Duration::from_millis(self.state.write_delay_ms.load(Ordering::SeqCst));
        if !delay.is_zero() {
            let mut write = PendingWrite {
                state: &self.state,
                complete: false,
            };
            tokio::time::sleep(delay).await;
            write.complete = true;
        }

        let is_close = command == Command::Cls;
        self.state
            .commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(command);

        if is_close && self.state.ack_close.load(Ordering::SeqCst) {
            let _ = inbound.send(Inbound::Frame(Frame::Response(Bytes::from_static(
                CLOSE_WAIT,
            ))));
        }
        Ok(())
    }

    async fn close(&self) {
        let mut session = self.state.session.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(s) = session.as_mut().filter(|s| s.id == self.session) {
            s.inbound = None;
        }
    }
}
