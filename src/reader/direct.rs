//! Supervised connection to a statically configured broker.
//!
//! Reconnects with exponential backoff whenever the link fails to open or a
//! session ends early. One backoff spans both, and it is reset only after a
//! session stays up for `STABLE_SESSION`. Once the retry budget is spent the
//! failure is pushed into the reader's delivery queue, where the consumer
//! sees it as the final item.

use std::sync::Arc;
use std::time::Duration;

use backon::BackoffBuilder;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::connection::{CloseReason, ReaderConnection};
use super::{wait_for_shutdown, ReaderContext};
use crate::address::Address;
use crate::error::{ReaderError, Result};
use crate::utils::retry::connection_backoff;

/// How often to check again while another source holds the address.
const CLAIMED_RECHECK_INTERVAL: Duration = Duration::from_secs(5);

/// A session that lasts this long resets the retry budget. Shorter ones
/// count as failed attempts.
const STABLE_SESSION: Duration = Duration::from_secs(10);

/// Keeps one connection to a fixed broker address alive.
pub struct DirectConnection {
    address: Address,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl DirectConnection {
    pub(crate) fn start(address: Address, context: Arc<ReaderContext>, max_attempts: usize) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(supervise(address.clone(), context, max_attempts, shutdown_rx));
        Self {
            address,
            shutdown,
            task: Some(task),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Whether the supervisor has stopped (closed or out of retries).
    pub fn is_stopped(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }

    /// Stop reconnecting and drain the current connection, if any.
    pub async fn close(mut self) -> Result<()> {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            task.await?;
        }
        Ok(())
    }
}

impl Drop for DirectConnection {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// How one connection attempt ended.
enum Attempt {
    /// Closed on request; the supervisor stops.
    Shutdown,
    /// Another source holds the address.
    Claimed,
    /// A session ran for at least `STABLE_SESSION` before it was lost.
    Stable(CloseReason),
    /// The link failed to open or the session ended early.
    Failed(String),
}

async fn attempt(
    address: &Address,
    context: &Arc<ReaderContext>,
    shutdown: &mut watch::Receiver<bool>,
) -> Attempt {
    let opened = tokio::select! {
        result = ReaderConnection::open(address.clone(), context.clone()) => result,
        _ = wait_for_shutdown(shutdown) => return Attempt::Shutdown,
    };
    let mut connection = match opened {
        Ok(connection) => connection,
        Err(ReaderError::AlreadyConnected(_)) => return Attempt::Claimed,
        Err(e) => return Attempt::Failed(e.to_string()),
    };

    let started = Instant::now();
    let stopped = tokio::select! {
        reason = connection.finished() => Some(reason),
        _ = wait_for_shutdown(shutdown) => None,
    };
    match stopped {
        Some(CloseReason::Shutdown) => Attempt::Shutdown,
        Some(reason) if started.elapsed() >= STABLE_SESSION => Attempt::Stable(reason),
        Some(reason) => Attempt::Failed(reason.to_string()),
        None => {
            if let Err(e) = connection.close().await {
                warn!(address = %address, error = %e, "Close failed");
            }
            Attempt::Shutdown
        }
    }
}

async fn supervise(
    address: Address,
    context: Arc<ReaderContext>,
    max_attempts: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let backoff_builder = connection_backoff(max_attempts);
    let mut backoff = backoff_builder.build();
    let mut attempts = 0usize;

    loop {
        let failure = match attempt(&address, &context, &mut shutdown).await {
            Attempt::Shutdown => return,
            Attempt::Claimed => {
                debug!(address = %address, "Address served by another connection");
                tokio::select! {
                    _ = tokio::time::sleep(CLAIMED_RECHECK_INTERVAL) => continue,
                    _ = wait_for_shutdown(&mut shutdown) => return,
                }
            }
            Attempt::Stable(reason) => {
                info!(address = %address, reason = %reason, "Direct connection lost, reconnecting");
                backoff = backoff_builder.build();
                attempts = 0;
                continue;
            }
            Attempt::Failed(failure) => failure,
        };
        attempts += 1;

        match backoff.next() {
            Some(delay) => {
                warn!(address = %address, attempts, error = %failure, delay = ?delay, "Direct connection failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wait_for_shutdown(&mut shutdown) => return,
                }
            }
            None => {
                error!(address = %address, attempts, error = %failure, "Giving up on direct connection");
                let _ = context.queue.send(Err(ReaderError::DirectConnectionLost {
                    address: address.clone(),
                    attempts,
                    message: failure,
                }));
                return;
            }
        }
    }
}
