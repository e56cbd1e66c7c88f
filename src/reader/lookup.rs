//! Directory-driven connection set for one lookup address.
//!
//! Polls the directory for the topic's producers and reconciles its
//! connections against the answer: new producers are connected, vanished
//! ones drained and closed. A failed poll leaves the set untouched.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connection::ReaderConnection;
use super::{wait_for_shutdown, ReaderContext};
use crate::address::Address;
use crate::discovery::Directory;
use crate::error::Result;

struct LookupShared {
    lookup: Address,
    directory: Arc<dyn Directory>,
    context: Arc<ReaderContext>,
    connections: Mutex<HashMap<Address, ReaderConnection>>,
}

impl LookupShared {
    async fn refresh(&self) {
        let producers = match self
            .directory
            .producers(&self.lookup, &self.context.topic)
            .await
        {
            Ok(producers) => producers,
            Err(e) => {
                warn!(lookup = %self.lookup, error = %e, "Directory query failed, keeping current connections");
                return;
            }
        };
        self.reconcile(producers.into_iter().collect()).await;
    }

    async fn reconcile(&self, wanted: BTreeSet<Address>) {
        let mut connections = self.connections.lock().await;

        let dead: Vec<Address> = connections
            .iter()
            .filter(|(_, connection)| connection.is_closed())
            .map(|(address, _)| address.clone())
            .collect();
        for address in dead {
            if let Some(connection) = connections.remove(&address) {
                debug!(lookup = %self.lookup, address = %address, "Pruning closed connection");
                let _ = connection.close().await;
            }
        }

        let current: BTreeSet<Address> = connections.keys().cloned().collect();
        let removed: Vec<ReaderConnection> = current
            .difference(&wanted)
            .filter_map(|address| connections.remove(address))
            .collect();
        let added: Vec<Address> = wanted.difference(&current).cloned().collect();
        if removed.is_empty() && added.is_empty() {
            debug!(lookup = %self.lookup, connections = connections.len(), "Producers unchanged");
            return;
        }
        info!(
            lookup = %self.lookup,
            added = added.len(),
            removed = removed.len(),
            "Reconciling connections"
        );

        let closes = join_all(removed.into_iter().map(|connection| async move {
            let address = connection.address().clone();
            if let Err(e) = connection.close().await {
                warn!(address = %address, error = %e, "Close failed");
            }
        }));
        let opens = join_all(added.into_iter().map(|address| async move {
            let result = ReaderConnection::open(address.clone(), self.context.clone()).await;
            (address, result)
        }));
        let (_, opened) = tokio::join!(closes, opens);

        for (address, result) in opened {
            match result {
                Ok(connection) => {
                    connections.insert(address, connection);
                }
                Err(e) => {
                    warn!(lookup = %self.lookup, address = %address, error = %e, "Connect failed, retrying on next poll");
                }
            }
        }
    }

    async fn close_all(&self) {
        let drained: Vec<ReaderConnection> = {
            let mut connections = self.connections.lock().await;
            connections.drain().map(|(_, connection)| connection).collect()
        };
        let results = join_all(drained.into_iter().map(|connection| connection.close())).await;
        for e in results.into_iter().filter_map(|r| r.err()) {
            warn!(lookup = %self.lookup, error = %e, "Close failed");
        }
    }
}

async fn poll(shared: Arc<LookupShared>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => shared.refresh().await,
            _ = wait_for_shutdown(&mut shutdown) => break,
        }
    }
    shared.close_all().await;
    debug!(lookup = %shared.lookup, "Lookup stopped");
}

/// Connections for one topic as advertised by one directory.
pub struct Lookup {
    shared: Arc<LookupShared>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Lookup {
    pub(crate) fn new(lookup: Address, directory: Arc<dyn Directory>, context: Arc<ReaderContext>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(LookupShared {
                lookup,
                directory,
                context,
                connections: Mutex::new(HashMap::new()),
            }),
            shutdown,
            task: None,
        }
    }

    /// Refresh now and then every `interval` until closed.
    pub(crate) fn start(&mut self, interval: Duration) {
        if self.task.is_some() {
            return;
        }
        info!(lookup = %self.shared.lookup, interval = ?interval, "Polling directory");
        self.task = Some(tokio::spawn(poll(
            self.shared.clone(),
            interval,
            self.shutdown.subscribe(),
        )));
    }

    pub fn address(&self) -> &Address {
        &self.shared.lookup
    }

    /// Query the directory once and reconcile.
    pub async fn refresh(&self) {
        self.shared.refresh().await
    }

    /// Addresses currently connected, sorted.
    pub async fn connections(&self) -> Vec<Address> {
        let connections = self.shared.connections.lock().await;
        let mut addresses: Vec<Address> = connections.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Stop polling and drain every connection.
    ///
    /// Connections are drained even if the poll task failed; its failure is
    /// returned afterwards.
    pub async fn close(mut self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let stopped = match self.task.take() {
            Some(task) => task.await,
            None => Ok(()),
        };
        // Empty already when the poll task exited cleanly.
        self.shared.close_all().await;
        stopped?;
        Ok(())
    }
}

impl Drop for Lookup {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
