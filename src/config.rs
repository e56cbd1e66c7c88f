//! Reader configuration.
//!
//! Supports YAML files and environment variable overrides.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Deserialize;

use crate::address::Address;
use crate::error::{ReaderError, Result};
use crate::protocol::validate_name;
use crate::reader::ConnectionOptions;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "nsq-reader.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "NSQ_READER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "NSQ_READER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "NSQ_READER_LOG";

/// Reader configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Topic to consume.
    pub topic: String,
    /// Channel (consumer group) within the topic.
    pub channel: String,
    /// Statically configured broker TCP addresses.
    pub nsqd_tcp_addresses: Vec<Address>,
    /// Directory (lookup) service HTTP addresses.
    pub lookupd_http_addresses: Vec<Address>,
    /// Seconds between directory refreshes.
    pub lookupd_poll_interval_secs: u64,
    /// Timeout for a single directory request.
    pub lookupd_request_timeout_secs: u64,
    /// Credit granted to each connection.
    pub max_in_flight: u64,
    /// Seconds between lease renewals (`TOUCH`) of an unacknowledged
    /// message. Must stay below the broker's message timeout; 0 disables.
    pub lease_keepalive_interval_secs: u64,
    /// How long a closing connection waits for the broker to acknowledge `CLS`.
    pub close_timeout_ms: u64,
    /// TCP connect timeout.
    pub connect_timeout_secs: u64,
    /// Reconnect attempts for a direct connection before giving up.
    pub max_reconnect_attempts: usize,
    /// Deliver one message at a time across all connections.
    pub single_message: bool,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            topic: String::new(),
            channel: String::new(),
            nsqd_tcp_addresses: Vec::new(),
            lookupd_http_addresses: Vec::new(),
            lookupd_poll_interval_secs: 60,
            lookupd_request_timeout_secs: 5,
            max_in_flight: 1,
            lease_keepalive_interval_secs: 30,
            close_timeout_ms: 1000,
            connect_timeout_secs: 5,
            max_reconnect_attempts: 10,
            single_message: false,
        }
    }
}

impl ReaderConfig {
    /// Config for `topic`/`channel` with default tuning and no addresses.
    pub fn new(topic: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            channel: channel.into(),
            ..Default::default()
        }
    }

    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `nsq-reader.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix; address
    ///    lists are comma-separated
    pub fn load(path: Option<&str>) -> std::result::Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("nsqd_tcp_addresses")
                    .with_list_parse_key("lookupd_http_addresses")
                    .try_parsing(true),
            )
            .build()?;

        let config: ReaderConfig = config.try_deserialize()?;
        Ok(config)
    }

    /// Check names and addresses before any connection is made.
    pub fn validate(&self) -> Result<()> {
        validate_name("topic", &self.topic)?;
        validate_name("channel", &self.channel)?;

        if self.nsqd_tcp_addresses.is_empty() && self.lookupd_http_addresses.is_empty() {
            return Err(ReaderError::Config(
                "at least one nsqd or lookupd address is required".to_string(),
            ));
        }

        let unique: BTreeSet<_> = self.nsqd_tcp_addresses.iter().collect();
        if unique.len() != self.nsqd_tcp_addresses.len() {
            return Err(ReaderError::Config(
                "duplicate nsqd address".to_string(),
            ));
        }

        if !self.lookupd_http_addresses.is_empty() && self.lookupd_poll_interval_secs == 0 {
            return Err(ReaderError::Config(
                "lookupd_poll_interval_secs must be positive".to_string(),
            ));
        }

        Ok(())
    }

    pub fn lookupd_poll_interval(&self) -> Duration {
        Duration::from_secs(self.lookupd_poll_interval_secs)
    }

    pub fn lookupd_request_timeout(&self) -> Duration {
        Duration::from_secs(self.lookupd_request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Per-connection options derived from this config.
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            max_in_flight: self.max_in_flight,
            lease_keepalive_interval: Duration::from_secs(self.lease_keepalive_interval_secs),
            close_timeout: Duration::from_millis(self.close_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = ReaderConfig::default();
        assert_eq!(config.max_in_flight, 1);
        assert_eq!(config.lookupd_poll_interval(), Duration::from_secs(60));
        assert_eq!(
            config.connection_options().lease_keepalive_interval,
            Duration::from_secs(30)
        );
        assert!(!config.single_message);
    }

    #[test]
    fn test_validate_requires_address() {
        let config = ReaderConfig::new("events", "archive");
        assert!(matches!(config.validate(), Err(ReaderError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_names() {
        let mut config = ReaderConfig::new("bad topic", "archive");
        config.nsqd_tcp_addresses = vec![Address::new("nsqd", 4150)];
        assert!(matches!(config.validate(), Err(ReaderError::Protocol(_))));
    }

    #[test]
    fn test_validate_rejects_duplicate_nsqd() {
        let mut config = ReaderConfig::new("events", "archive");
        config.nsqd_tcp_addresses = vec![Address::new("nsqd", 4150), Address::new("nsqd", 4150)];
        assert!(matches!(config.validate(), Err(ReaderError::Config(_))));
    }

    #[test]
    #[serial]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "topic: events\nchannel: archive\nmax_in_flight: 25\nlookupd_http_addresses:\n  - \"lookupd-0:4161\"\n  - \"lookupd-1:4161\""
        )
        .unwrap();

        let config = ReaderConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.topic, "events");
        assert_eq!(config.max_in_flight, 25);
        assert_eq!(
            config.lookupd_http_addresses,
            vec![Address::new("lookupd-0", 4161), Address::new("lookupd-1", 4161)]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_load_env_override() {
        std::env::set_var("NSQ_READER__TOPIC", "orders");
        std::env::set_var("NSQ_READER__CHANNEL", "billing");
        std::env::set_var("NSQ_READER__NSQD_TCP_ADDRESSES", "nsqd-0:4150,nsqd-1:4150");

        let config = ReaderConfig::load(None);

        std::env::remove_var("NSQ_READER__TOPIC");
        std::env::remove_var("NSQ_READER__CHANNEL");
        std::env::remove_var("NSQ_READER__NSQD_TCP_ADDRESSES");

        let config = config.unwrap();
        assert_eq!(config.topic, "orders");
        assert_eq!(config.channel, "billing");
        assert_eq!(
            config.nsqd_tcp_addresses,
            vec![Address::new("nsqd-0", 4150), Address::new("nsqd-1", 4150)]
        );
    }
}
