//! Reader-wide connection registry and credit control.
//!
//! Tracks every connection a reader currently holds, keyed by broker
//! address, and the credit value each of them should advertise.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::future::join_all;
use tracing::{debug, info};

use super::connection::ConnectionShared;
use crate::address::Address;
use crate::error::{ReaderError, Result};

enum Slot {
    /// Claimed by a connection that is still connecting.
    Connecting,
    Live(Weak<ConnectionShared>),
}

/// Thread-safe registry of a reader's connections.
///
/// Guarantees at most one connection per address and lets a credit grant
/// reach every live connection, including ones that register after the
/// grant was made.
pub(crate) struct ConnectionRegistry {
    credit: AtomicU64,
    connections: Mutex<HashMap<Address, Slot>>,
}

impl ConnectionRegistry {
    pub(crate) fn new(initial_credit: u64) -> Self {
        Self {
            credit: AtomicU64::new(initial_credit),
            connections: Mutex::new(HashMap::new()),
        }
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<Address, Slot>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserve `address` for a new connection.
    pub(crate) fn claim(&self, address: &Address) -> Result<()> {
        let mut connections = self.connections();
        if connections.contains_key(address) {
            return Err(ReaderError::AlreadyConnected(address.clone()));
        }
        connections.insert(address.clone(), Slot::Connecting);
        Ok(())
    }

    /// Mark a claimed address as live.
    pub(crate) fn attach(&self, address: &Address, connection: &Arc<ConnectionShared>) {
        debug!(address = %address, "Registering connection");
        self.connections()
            .insert(address.clone(), Slot::Live(Arc::downgrade(connection)));
    }

    /// Free an address, whether connecting or live.
    pub(crate) fn release(&self, address: &Address) {
        if self.connections().remove(address).is_some() {
            debug!(address = %address, "Released connection slot");
        }
    }

    /// Credit every connection should currently advertise.
    pub(crate) fn credit(&self) -> u64 {
        self.credit.load(Ordering::SeqCst)
    }

    fn live(&self) -> Vec<Arc<ConnectionShared>> {
        self.connections()
            .values()
            .filter_map(|slot| match slot {
                Slot::Live(conn) => conn.upgrade(),
                Slot::Connecting => None,
            })
            .collect()
    }

    /// Set the reader-wide credit and push it to every live connection.
    ///
    /// Connections that attach later pick the value up as their initial
    /// grant.
    pub(crate) async fn grant(&self, credit: u64) {
        let previous = self.credit.swap(credit, Ordering::SeqCst);
        if previous != credit {
            debug!(credit, previous, "Updating reader credit");
        }
        let live = self.live();
        join_all(live.iter().map(|conn| conn.sync_ready())).await;
    }

    /// Addresses with a live connection, sorted.
    pub(crate) fn addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> = self
            .connections()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Live(conn) if conn.strong_count() > 0))
            .map(|(address, _)| address.clone())
            .collect();
        addresses.sort();
        addresses
    }

    pub(crate) fn log_summary(&self) {
        let connections = self.connections();
        let live = connections
            .values()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count();
        info!(
            live,
            connecting = connections.len() - live,
            credit = self.credit(),
            "Connection registry"
        );
    }
}
