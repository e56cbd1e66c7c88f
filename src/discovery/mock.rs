//! Scripted directory for testing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Directory, DiscoveryError};
use crate::address::Address;

/// Directory that answers from per-lookup-address scripted responses.
///
/// Lookup addresses without a response fail with `DiscoveryError::Request`.
#[derive(Default)]
pub struct MockDirectory {
    responses: Mutex<HashMap<Address, Result<Vec<Address>, DiscoveryError>>>,
    calls: AtomicUsize,
}

impl MockDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, lookup: &Address, response: Result<Vec<Address>, DiscoveryError>) {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(lookup.clone(), response);
    }

    pub fn set_producers(&self, lookup: &Address, producers: Vec<Address>) {
        self.set(lookup, Ok(producers));
    }

    /// Topic unknown to the directory (HTTP 404): an empty producer set.
    pub fn set_not_found(&self, lookup: &Address) {
        self.set(lookup, Ok(Vec::new()));
    }

    pub fn set_failure(&self, lookup: &Address, message: &str) {
        self.set(
            lookup,
            Err(DiscoveryError::Request {
                address: lookup.clone(),
                message: message.to_string(),
            }),
        );
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Directory for MockDirectory {
    async fn producers(
        &self,
        lookup: &Address,
        _topic: &str,
    ) -> Result<Vec<Address>, DiscoveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(lookup)
            .cloned()
            .unwrap_or_else(|| {
                Err(DiscoveryError::Request {
                    address: lookup.clone(),
                    message: "no scripted response".to_string(),
                })
            })
    }
}
