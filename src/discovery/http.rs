//! HTTP directory client.
//!
//! Queries `GET /lookup?topic=<topic>` and reads the `producers` list. A 404
//! means the topic is not (yet) produced anywhere.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{Directory, DiscoveryError};
use crate::address::Address;

/// Default timeout for one lookup request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const ACCEPT_HEADER: &str = "application/vnd.nsq; version=1.0";

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    producers: Option<Vec<Producer>>,
    /// Older directories wrap the payload in `{"status_code": .., "data": {..}}`.
    #[serde(default)]
    data: Option<Box<LookupResponse>>,
}

#[derive(Debug, Deserialize)]
struct Producer {
    #[serde(alias = "broadcast_address")]
    address: String,
    tcp_port: u16,
}

/// Directory client over HTTP.
#[derive(Debug, Clone)]
pub struct HttpDirectory {
    client: reqwest::Client,
}

impl HttpDirectory {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });
        Self { client }
    }
}

impl Default for HttpDirectory {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn producers(
        &self,
        lookup: &Address,
        topic: &str,
    ) -> Result<Vec<Address>, DiscoveryError> {
        let url = format!("{}/lookup", lookup.http_base());
        let response = self
            .client
            .get(&url)
            .query(&[("topic", topic)])
            .header(reqwest::header::ACCEPT, ACCEPT_HEADER)
            .send()
            .await
            .map_err(|e| DiscoveryError::Request {
                address: lookup.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(lookup = %lookup, topic = %topic, "Topic not found, no producers");
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(DiscoveryError::Status {
                address: lookup.clone(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|e| DiscoveryError::Request {
            address: lookup.clone(),
            message: e.to_string(),
        })?;
        parse_producers(lookup, &body)
    }
}

/// Decode a lookup response body into a sorted, de-duplicated address list.
pub fn parse_producers(lookup: &Address, body: &[u8]) -> Result<Vec<Address>, DiscoveryError> {
    let decode_err = |message: String| DiscoveryError::Decode {
        address: lookup.clone(),
        message,
    };

    let mut response: LookupResponse =
        serde_json::from_slice(body).map_err(|e| decode_err(e.to_string()))?;
    if response.producers.is_none() {
        if let Some(inner) = response.data.take() {
            response = *inner;
        }
    }
    let producers = response
        .producers
        .ok_or_else(|| decode_err("missing 'producers'".to_string()))?;

    let addresses: BTreeSet<Address> = producers
        .into_iter()
        .map(|p| Address::new(p.address, p.tcp_port))
        .collect();
    Ok(addresses.into_iter().collect())
}
