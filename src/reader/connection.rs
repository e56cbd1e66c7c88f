//! Subscribed connection to a single broker node.
//!
//! A `ReaderConnection` owns one broker link. Its receive task admits
//! messages within the granted credit, tracks them in the in-flight map and
//! pushes them into the reader's delivery queue. On close (requested or
//! forced by a transport failure) the connection drains: it unsubscribes,
//! requeues everything still in flight and releases the link.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::message::Message;
use super::{wait_for_shutdown, ReaderContext};
use crate::address::Address;
use crate::error::Result;
use crate::protocol::{
    is_recoverable_error, Command, Frame, MessageId, RawMessage, CLOSE_WAIT, HEARTBEAT,
};
use crate::transport::{CommandSink, Inbound};

/// Per-connection tuning.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Initial credit granted to each connection.
    pub max_in_flight: u64,
    /// Interval between `TOUCH`es of an unsettled message. Zero disables.
    pub lease_keepalive_interval: Duration,
    /// How long to wait for `CLOSE_WAIT` after `CLS`.
    pub close_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_in_flight: 1,
            lease_keepalive_interval: Duration::from_secs(30),
            close_timeout: Duration::from_secs(1),
        }
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Subscribed,
    Draining,
    Closed,
}

/// Why a connection stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed on request.
    Shutdown,
    /// The link failed.
    Transport(String),
    /// The broker sent a fatal error frame.
    Protocol(String),
}

impl CloseReason {
    pub fn is_shutdown(&self) -> bool {
        matches!(self, CloseReason::Shutdown)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Shutdown => write!(f, "closed on request"),
            CloseReason::Transport(reason) => write!(f, "transport failure: {reason}"),
            CloseReason::Protocol(reason) => write!(f, "broker error: {reason}"),
        }
    }
}

/// Background `TOUCH` renewal for one message.
struct Lease {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// In-flight bookkeeping for one message.
///
/// Dropping an entry stops its lease after any renewal being written.
pub(crate) struct InFlight {
    lease: Option<Lease>,
}

impl InFlight {
    /// Stop the lease keepalive and wait for it to finish. A renewal that is
    /// already being written completes first, so nothing can follow the
    /// settling command.
    pub(crate) async fn cancel_lease(self) {
        if let Some(lease) = self.lease {
            let _ = lease.stop.send(true);
            let _ = lease.task.await;
        }
    }
}

struct ConnectionState {
    phase: ConnectionPhase,
    in_flight: HashMap<MessageId, InFlight>,
    /// Credit last advertised to the broker; `None` before the first `RDY`.
    ready: Option<u64>,
}

/// State shared between a connection handle, its receive task, the
/// messages it delivered and the reader's registry.
pub(crate) struct ConnectionShared {
    address: Address,
    sink: Arc<dyn CommandSink>,
    state: Mutex<ConnectionState>,
    /// Serializes `RDY` updates so the last one sent carries the latest credit.
    ready_gate: tokio::sync::Mutex<()>,
    context: Arc<ReaderContext>,
}

impl ConnectionShared {
    fn state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn address(&self) -> &Address {
        &self.address
    }

    pub(crate) async fn send(&self, command: Command) -> Result<()> {
        trace!(address = %self.address, command = command.name(), "Sending command");
        self.sink.send(command).await
    }

    pub(crate) fn is_in_flight(&self, id: &MessageId) -> bool {
        self.state().in_flight.contains_key(id)
    }

    /// Remove an in-flight entry. Each entry is removed exactly once.
    pub(crate) fn take_in_flight(&self, id: &MessageId) -> Option<InFlight> {
        self.state().in_flight.remove(id)
    }

    /// Advertise the reader's current credit if it changed.
    pub(crate) async fn sync_ready(&self) {
        let _gate = self.ready_gate.lock().await;
        let credit = self.context.registry.credit();
        {
            let mut state = self.state();
            if state.phase != ConnectionPhase::Subscribed || state.ready == Some(credit) {
                return;
            }
            state.ready = Some(credit);
        }
        debug!(address = %self.address, credit, "Granting credit");
        if let Err(e) = self.send(Command::Rdy(credit)).await {
            debug!(address = %self.address, error = %e, "Failed to send RDY");
        }
    }

    /// Admit a message if the connection is subscribed and has credit left.
    fn admit(self: &Arc<Self>, raw: RawMessage) -> std::result::Result<Message, RawMessage> {
        let mut state = self.state();
        let credit = state.ready.unwrap_or(0);
        if state.phase != ConnectionPhase::Subscribed
            || state.in_flight.len() as u64 >= credit
            || state.in_flight.contains_key(&raw.id)
        {
            return Err(raw);
        }
        let lease = self.spawn_lease(raw.id);
        state.in_flight.insert(raw.id, InFlight { lease });
        Ok(Message::new(raw, self.clone()))
    }

    fn spawn_lease(&self, id: MessageId) -> Option<Lease> {
        let interval = self.context.options.lease_keepalive_interval;
        if interval.is_zero() {
            return None;
        }
        let sink = self.sink.clone();
        let address = self.address.clone();
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                // Only the wait is interruptible; a started write runs to completion.
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = wait_for_shutdown(&mut stopped) => break,
                }
                if let Err(e) = sink.send(Command::Touch(id)).await {
                    debug!(address = %address, message_id = %id, error = %e, "Lease renewal failed");
                    break;
                }
                trace!(address = %address, message_id = %id, "Renewed lease");
            }
        });
        Some(Lease { stop, task })
    }

    async fn handle_message(self: &Arc<Self>, raw: RawMessage) {
        match self.admit(raw) {
            Ok(message) => {
                if let Err(rejected) = self.context.queue.send(Ok(message)) {
                    // Reader gone; hand the message straight back.
                    if let Ok(message) = rejected.0 {
                        let _ = message.requeue(Duration::ZERO).await;
                    }
                }
            }
            Err(raw) => {
                debug!(
                    address = %self.address,
                    message_id = %raw.id,
                    "Message outside granted credit, requeueing"
                );
                if let Err(e) = self.send(Command::Req(raw.id, Duration::ZERO)).await {
                    debug!(address = %self.address, error = %e, "Failed to requeue message");
                }
            }
        }
    }

    async fn handle_frame(self: &Arc<Self>, frame: Frame) -> std::result::Result<(), CloseReason> {
        match frame {
            Frame::Message(raw) => {
                self.handle_message(raw).await;
                Ok(())
            }
            Frame::Response(body) if &body[..] == HEARTBEAT => {
                trace!(address = %self.address, "Heartbeat");
                self.send(Command::Nop)
                    .await
                    .map_err(|e| CloseReason::Transport(e.to_string()))
            }
            Frame::Response(body) => {
                debug!(address = %self.address, response = %String::from_utf8_lossy(&body), "Response");
                Ok(())
            }
            Frame::Error(body) if is_recoverable_error(&body) => {
                warn!(address = %self.address, error = %String::from_utf8_lossy(&body), "Broker rejected command");
                Ok(())
            }
            Frame::Error(body) => {
                let message = String::from_utf8_lossy(&body).into_owned();
                error!(address = %self.address, error = %message, "Fatal broker error");
                Err(CloseReason::Protocol(message))
            }
        }
    }

    /// Unsubscribe, requeue everything still in flight and release the link.
    async fn drain(self: &Arc<Self>, inbound: &mut mpsc::UnboundedReceiver<Inbound>, reason: &CloseReason) {
        let was_subscribed = {
            let mut state = self.state();
            let subscribed = state.phase == ConnectionPhase::Subscribed;
            state.phase = ConnectionPhase::Draining;
            subscribed
        };
        self.context.registry.release(&self.address);
        info!(address = %self.address, reason = ?reason, "Draining connection");

        if was_subscribed {
            match self.send(Command::Cls).await {
                Ok(()) => self.await_close_ack(inbound).await,
                Err(e) => debug!(address = %self.address, error = %e, "CLS not delivered"),
            }
        }

        let pending: Vec<(MessageId, InFlight)> = self.state().in_flight.drain().collect();
        let requeues = pending.into_iter().map(|(id, entry)| async move {
            entry.cancel_lease().await;
            if let Err(e) = self.send(Command::Req(id, Duration::ZERO)).await {
                debug!(address = %self.address, message_id = %id, error = %e, "Requeue on close failed");
            }
        });
        let requeued = join_all(requeues).await.len();

        self.sink.close().await;
        self.state().phase = ConnectionPhase::Closed;
        info!(address = %self.address, requeued, "Connection closed");
    }

    /// Wait for `CLOSE_WAIT`, requeueing anything delivered meanwhile.
    async fn await_close_ack(self: &Arc<Self>, inbound: &mut mpsc::UnboundedReceiver<Inbound>) {
        let wait = async {
            while let Some(event) = inbound.recv().await {
                match event {
                    Inbound::Frame(frame) if frame.is_response(CLOSE_WAIT) => return true,
                    Inbound::Frame(Frame::Message(raw)) => self.handle_message(raw).await,
                    Inbound::Frame(frame) if frame.is_response(HEARTBEAT) => {
                        let _ = self.send(Command::Nop).await;
                    }
                    Inbound::Frame(_) => {}
                    Inbound::Closed(_) => return false,
                }
            }
            false
        };

        match tokio::time::timeout(self.context.options.close_timeout, wait).await {
            Ok(true) => debug!(address = %self.address, "Close acknowledged"),
            Ok(false) => debug!(address = %self.address, "Link closed before acknowledgment"),
            Err(_) => debug!(address = %self.address, "Close acknowledgment timed out"),
        }
    }
}

async fn run(
    shared: Arc<ConnectionShared>,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    mut shutdown: watch::Receiver<bool>,
) -> CloseReason {
    let reason = loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break CloseReason::Shutdown,
            event = inbound.recv() => match event {
                Some(Inbound::Frame(frame)) => {
                    if let Err(reason) = shared.handle_frame(frame).await {
                        break reason;
                    }
                }
                Some(Inbound::Closed(reason)) => {
                    break CloseReason::Transport(reason.unwrap_or_else(|| "closed by broker".to_string()));
                }
                None => break CloseReason::Transport("link dropped".to_string()),
            }
        }
    };

    if !reason.is_shutdown() {
        warn!(address = %shared.address, reason = ?reason, "Connection failed");
    }
    shared.drain(&mut inbound, &reason).await;
    reason
}

/// A subscribed connection to one broker.
///
/// Dropping the handle starts the drain in the background; `close` waits
/// for it.
pub struct ReaderConnection {
    shared: Arc<ConnectionShared>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<CloseReason>>,
}

impl ReaderConnection {
    /// Connect, subscribe and grant the reader's current credit.
    ///
    /// Fails with `AlreadyConnected` if the reader already holds a
    /// connection to `address`.
    pub(crate) async fn open(address: Address, context: Arc<ReaderContext>) -> Result<Self> {
        context.registry.claim(&address)?;
        match Self::establish(address.clone(), context.clone()).await {
            Ok(connection) => Ok(connection),
            Err(e) => {
                context.registry.release(&address);
                Err(e)
            }
        }
    }

    async fn establish(address: Address, context: Arc<ReaderContext>) -> Result<Self> {
        let link = context.transport.connect(&address).await?;
        let shared = Arc::new(ConnectionShared {
            address: address.clone(),
            sink: link.sink,
            state: Mutex::new(ConnectionState {
                phase: ConnectionPhase::Connecting,
                in_flight: HashMap::new(),
                ready: None,
            }),
            ready_gate: tokio::sync::Mutex::new(()),
            context: context.clone(),
        });

        let subscribe = Command::Sub {
            topic: context.topic.clone(),
            channel: context.channel.clone(),
        };
        if let Err(e) = shared.send(subscribe).await {
            shared.sink.close().await;
            return Err(e);
        }
        shared.state().phase = ConnectionPhase::Subscribed;
        context.registry.attach(&address, &shared);
        shared.sync_ready().await;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(shared.clone(), link.inbound, shutdown_rx));
        info!(
            address = %address,
            topic = %context.topic,
            channel = %context.channel,
            "Subscribed"
        );

        Ok(Self {
            shared,
            shutdown,
            task: Some(task),
        })
    }

    pub fn address(&self) -> &Address {
        &self.shared.address
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.shared.state().phase
    }

    /// Number of delivered, unsettled messages.
    pub fn in_flight(&self) -> usize {
        self.shared.state().in_flight.len()
    }

    /// Credit currently advertised to the broker.
    pub fn ready(&self) -> u64 {
        self.shared.state().ready.unwrap_or(0)
    }

    /// Whether the connection has finished draining.
    pub fn is_closed(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }

    /// Wait until the connection stops on its own or is closed.
    pub(crate) async fn finished(&mut self) -> CloseReason {
        match self.task.as_mut() {
            Some(task) => {
                let reason = task
                    .await
                    .unwrap_or_else(|e| CloseReason::Transport(format!("connection task failed: {e}")));
                self.task = None;
                reason
            }
            None => CloseReason::Shutdown,
        }
    }

    /// Drain and close. Resolves once every in-flight message was requeued
    /// and the link released.
    pub async fn close(mut self) -> Result<()> {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            task.await?;
        }
        Ok(())
    }
}

impl Drop for ReaderConnection {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

impl std::fmt::Debug for ReaderConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderConnection")
            .field("address", &self.shared.address)
            .field("phase", &self.phase())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
