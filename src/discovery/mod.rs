//! Broker discovery through directory (lookup) services.
//!
//! Provides the `Directory` collaborator a `Lookup` polls for the current
//! producer set of a topic:
//! - `HttpDirectory`: HTTP lookup service (production)
//! - `MockDirectory`: scripted responses for tests (`test-utils`)

use async_trait::async_trait;

use crate::address::Address;

pub mod http;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use http::HttpDirectory;
#[cfg(any(test, feature = "test-utils"))]
pub use mock::MockDirectory;

/// Errors querying a directory service.
///
/// A topic with no producers is not an error; directories report it as an
/// empty producer list.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Request to {address} failed: {message}")]
    Request { address: Address, message: String },

    #[error("Directory at {address} returned HTTP {status}")]
    Status { address: Address, status: u16 },

    #[error("Malformed response from {address}: {message}")]
    Decode { address: Address, message: String },
}

/// Maps a topic to the broker addresses currently producing it.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Fetch the producer set for `topic` from the directory at `lookup`.
    async fn producers(
        &self,
        lookup: &Address,
        topic: &str,
    ) -> Result<Vec<Address>, DiscoveryError>;
}
