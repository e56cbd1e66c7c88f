//! Topic/channel consumer.
//!
//! A `Reader` fans messages from every broker connection into one stream.
//! Connections come from two sources:
//! - `Lookup`: one per directory address, reconciled on every poll
//! - `DirectConnection`: one per static broker address, reconnected with backoff
//!
//! All connections share a `ReaderContext`: topic/channel, tuning, the
//! transport, the delivery queue and the credit registry.

mod connection;
mod direct;
mod lookup;
mod message;
mod registry;
mod single;

#[cfg(test)]
mod tests;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::join_all;
use futures::Stream;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

pub use connection::{CloseReason, ConnectionOptions, ConnectionPhase, ReaderConnection};
pub use direct::DirectConnection;
pub use lookup::Lookup;
pub use message::Message;
pub use single::SingleMessageReader;

use crate::address::Address;
use crate::config::ReaderConfig;
use crate::discovery::{Directory, HttpDirectory};
use crate::error::{ReaderError, Result};
use crate::transport::{TcpTransport, Transport};
use registry::ConnectionRegistry;

/// One item of the delivery queue: a message or a terminal failure.
pub(crate) type Delivery = Result<Message>;

/// State shared by every connection of one reader.
pub(crate) struct ReaderContext {
    pub(crate) topic: String,
    pub(crate) channel: String,
    pub(crate) options: ConnectionOptions,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) queue: mpsc::UnboundedSender<Delivery>,
    pub(crate) registry: ConnectionRegistry,
}

impl ReaderContext {
    pub(crate) fn new(
        topic: String,
        channel: String,
        options: ConnectionOptions,
        transport: Arc<dyn Transport>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Delivery>) {
        let (queue, deliveries) = mpsc::unbounded_channel();
        let registry = ConnectionRegistry::new(options.max_in_flight);
        let context = Arc::new(Self {
            topic,
            channel,
            options,
            transport,
            queue,
            registry,
        });
        (context, deliveries)
    }
}

/// Resolve once shutdown is signalled or the sender is gone.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Consumer for one topic/channel across many brokers.
///
/// Yields messages from all connections in arrival order. A direct
/// connection that exhausts its reconnect budget surfaces as an `Err` item,
/// after which the stream ends.
pub struct Reader {
    context: Arc<ReaderContext>,
    lookups: Vec<Lookup>,
    directs: Vec<DirectConnection>,
    deliveries: Option<mpsc::UnboundedReceiver<Delivery>>,
    terminated: bool,
}

impl Reader {
    /// Start consuming over the given transport and directory.
    #[tracing::instrument(name = "reader.start", skip_all, fields(topic = %config.topic, channel = %config.channel))]
    pub async fn start(
        config: ReaderConfig,
        transport: Arc<dyn Transport>,
        directory: Arc<dyn Directory>,
    ) -> Result<Self> {
        config.validate()?;

        let (context, deliveries) = ReaderContext::new(
            config.topic.clone(),
            config.channel.clone(),
            config.connection_options(),
            transport,
        );

        let lookups: Vec<Lookup> = config
            .lookupd_http_addresses
            .iter()
            .map(|address| {
                let mut lookup = Lookup::new(address.clone(), directory.clone(), context.clone());
                lookup.start(config.lookupd_poll_interval());
                lookup
            })
            .collect();
        let directs: Vec<DirectConnection> = config
            .nsqd_tcp_addresses
            .iter()
            .map(|address| {
                DirectConnection::start(address.clone(), context.clone(), config.max_reconnect_attempts)
            })
            .collect();

        info!(
            lookups = lookups.len(),
            directs = directs.len(),
            max_in_flight = config.max_in_flight,
            "Reader started"
        );

        Ok(Self {
            context,
            lookups,
            directs,
            deliveries: Some(deliveries),
            terminated: false,
        })
    }

    /// Start consuming over TCP, discovering brokers over HTTP.
    pub async fn connect(config: ReaderConfig) -> Result<Self> {
        let transport = Arc::new(TcpTransport::new(config.connect_timeout()));
        let directory = Arc::new(HttpDirectory::new(config.lookupd_request_timeout()));
        Self::start(config, transport, directory).await
    }

    pub fn topic(&self) -> &str {
        &self.context.topic
    }

    pub fn channel(&self) -> &str {
        &self.context.channel
    }

    /// Next message, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<Result<Message>> {
        std::future::poll_fn(|cx| self.poll_delivery(cx)).await
    }

    fn poll_delivery(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Message>>> {
        if self.terminated {
            return Poll::Ready(None);
        }
        let Some(deliveries) = self.deliveries.as_mut() else {
            return Poll::Ready(None);
        };
        match deliveries.poll_recv(cx) {
            Poll::Ready(Some(Err(e))) => {
                self.terminated = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.terminated = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }

    /// Set the credit every connection advertises, now and on (re)connect.
    pub async fn grant(&self, credit: u64) {
        self.context.registry.grant(credit).await
    }

    /// Addresses of all live connections, sorted.
    pub fn connections(&self) -> Vec<Address> {
        self.context.registry.addresses()
    }

    pub(crate) fn context(&self) -> &Arc<ReaderContext> {
        &self.context
    }

    pub(crate) fn take_deliveries(&mut self) -> Option<mpsc::UnboundedReceiver<Delivery>> {
        self.deliveries.take()
    }

    /// Close every lookup and direct connection concurrently.
    ///
    /// Resolves once all connections drained. Every child is closed even if
    /// some fail; the first failure is returned.
    pub async fn close(self) -> Result<()> {
        info!(topic = %self.context.topic, channel = %self.context.channel, "Closing reader");
        self.context.registry.log_summary();
        let (lookups, directs) = tokio::join!(
            join_all(self.lookups.into_iter().map(|lookup| lookup.close())),
            join_all(self.directs.into_iter().map(|direct| direct.close())),
        );

        let mut first: Option<ReaderError> = None;
        for e in lookups.into_iter().chain(directs).filter_map(|r| r.err()) {
            error!(error = %e, "Close failed");
            first.get_or_insert(e);
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Stream for Reader {
    type Item = Result<Message>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_delivery(cx)
    }
}

#[cfg(test)]
pub(crate) fn test_context_with(
    transport: &crate::transport::MockTransport,
    max_in_flight: u64,
    lease_keepalive_interval: std::time::Duration,
) -> (Arc<ReaderContext>, mpsc::UnboundedReceiver<Delivery>) {
    ReaderContext::new(
        "events".to_string(),
        "archive".to_string(),
        ConnectionOptions {
            max_in_flight,
            lease_keepalive_interval,
            close_timeout: std::time::Duration::from_millis(50),
        },
        Arc::new(transport.clone()),
    )
}

#[cfg(test)]
pub(crate) fn test_context(
    transport: &crate::transport::MockTransport,
    max_in_flight: u64,
) -> (Arc<ReaderContext>, mpsc::UnboundedReceiver<Delivery>) {
    test_context_with(transport, max_in_flight, std::time::Duration::from_secs(30))
}
