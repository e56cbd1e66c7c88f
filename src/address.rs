//! Broker and directory-service addresses.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer};

/// A `(host, port)` pair identifying one broker node or directory service.
///
/// Two connections to the same `Address` are never live at once within a
/// reader.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Base URL for HTTP requests against this address.
    pub fn http_base(&self) -> String {
        format!("http://{self}")
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Error parsing an address from `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid address '{0}': expected host:port")]
pub struct AddressParseError(pub String);

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s
            .strip_prefix("http://")
            .or_else(|| s.strip_prefix("tcp://"))
            .unwrap_or(s)
            .trim_end_matches('/');

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressParseError(s.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(AddressParseError(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| AddressParseError(s.to_string()))?;

        Ok(Address::new(host, port))
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
