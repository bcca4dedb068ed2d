//! Configuration types for the write stream

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::warn;

use crate::error::ClientError;
use crate::Result;

/// Acknowledgment level requested from the partition leader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Acks {
    /// Fire and forget; the broker sends no response
    None,
    /// Leader has written the batch
    Leader,
    /// Every in-sync replica has the batch
    #[default]
    All,
}

impl Acks {
    pub fn as_i16(self) -> i16 {
        match self {
            Acks::None => 0,
            Acks::Leader => 1,
            Acks::All => -1,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "0" => Some(Acks::None),
            "1" => Some(Acks::Leader),
            "-1" | "all" => Some(Acks::All),
            _ => None,
        }
    }
}

impl fmt::Display for Acks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Acks::None => write!(f, "0"),
            Acks::Leader => write!(f, "1"),
            Acks::All => write!(f, "all"),
        }
    }
}

/// Write stream configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteStreamConfig {
    /// Initial broker addresses (`host:port`)
    pub bootstrap_servers: Vec<String>,
    /// Client identifier sent in every request header
    pub client_id: Option<String>,
    pub acks: Acks,
    /// How long the collector waits for more records before sealing a batch
    pub linger: Duration,
    /// Upper bound for one encoded record batch, in bytes
    pub batch_size: usize,
    /// Upper bound for the number of records in one batch
    pub batch_max_records: usize,
    /// Records one broker channel holds between submission and completion
    pub buffer_records: usize,
    pub enable_idempotence: bool,
    pub transactional_id: Option<String>,
    pub transaction_timeout: Duration,
    /// Resend attempts for a failed batch before its records are failed
    pub retries: u32,
    pub retry_backoff: Duration,
    pub request_timeout: Duration,
    pub connection_setup_timeout: Duration,
    /// Lifetime of cached topic metadata
    pub metadata_max_age: Duration,
}

impl Default for WriteStreamConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: vec!["localhost:9092".to_string()],
            client_id: None,
            acks: Acks::All,
            linger: Duration::from_millis(5),
            batch_size: 16 * 1024,
            batch_max_records: 1000,
            buffer_records: 1000,
            enable_idempotence: false,
            transactional_id: None,
            transaction_timeout: Duration::from_secs(60),
            retries: 5,
            retry_backoff: Duration::from_millis(100),
            request_timeout: Duration::from_secs(30),
            connection_setup_timeout: Duration::from_secs(10),
            metadata_max_age: Duration::from_secs(10),
        }
    }
}

impl WriteStreamConfig {
    pub fn builder() -> WriteStreamConfigBuilder {
        WriteStreamConfigBuilder::new()
    }

    /// Builds a configuration from Kafka-style `key=value` properties.
    ///
    /// Unknown keys are logged and ignored; malformed values fail.
    pub fn from_properties<I, K, V>(properties: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in properties {
            let (key, value) = (key.as_ref().trim(), value.as_ref().trim());
            match key {
                "bootstrap.servers" => {
                    config.bootstrap_servers = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                "client.id" => config.client_id = non_empty(value),
                "acks" => {
                    config.acks = Acks::parse(value).ok_or_else(|| {
                        ClientError::config(format!("Unknown value '{}' for acks", value))
                    })?;
                }
                "linger.ms" => config.linger = millis(key, value)?,
                "batch.size" => config.batch_size = number(key, value)?,
                "batch.max.records" => config.batch_max_records = number(key, value)?,
                "buffer.records" => config.buffer_records = number(key, value)?,
                "enable.idempotence" => config.enable_idempotence = boolean(key, value)?,
                "transactional.id" => config.transactional_id = non_empty(value),
                "transaction.timeout.ms" => config.transaction_timeout = millis(key, value)?,
                "retries" => config.retries = number(key, value)?,
                "retry.backoff.ms" => config.retry_backoff = millis(key, value)?,
                "request.timeout.ms" => config.request_timeout = millis(key, value)?,
                "socket.connection.setup.timeout.ms" => {
                    config.connection_setup_timeout = millis(key, value)?
                }
                "metadata.max.age.ms" => config.metadata_max_age = millis(key, value)?,
                _ => warn!("Ignoring unknown write stream property '{}'", key),
            }
        }
        config.validate()
    }

    /// Applies implied settings and rejects inconsistent ones.
    ///
    /// A transactional id turns idempotence on, and idempotence needs
    /// `acks=all`.
    pub fn validate(mut self) -> Result<Self> {
        if self.bootstrap_servers.is_empty() {
            return Err(ClientError::config("bootstrap.servers must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(ClientError::config("batch.size must be positive"));
        }
        if self.batch_max_records == 0 {
            return Err(ClientError::config("batch.max.records must be positive"));
        }
        if self.buffer_records == 0 {
            return Err(ClientError::config("buffer.records must be positive"));
        }
        if matches!(&self.transactional_id, Some(id) if id.is_empty()) {
            self.transactional_id = None;
        }
        if self.transactional_id.is_some() {
            self.enable_idempotence = true;
        }
        if self.enable_idempotence && self.acks != Acks::All {
            return Err(ClientError::config(format!(
                "Idempotence requires acks=all, got acks={}",
                self.acks
            )));
        }
        if self.transaction_timeout.as_millis() > i32::MAX as u128 {
            return Err(ClientError::config("transaction.timeout.ms is out of range"));
        }
        Ok(self)
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional_id.is_some()
    }

    /// Produce request timeout as sent on the wire
    pub fn request_timeout_ms(&self) -> i32 {
        i32::try_from(self.request_timeout.as_millis()).unwrap_or(i32::MAX)
    }

    pub fn transaction_timeout_ms(&self) -> i32 {
        i32::try_from(self.transaction_timeout.as_millis()).unwrap_or(i32::MAX)
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| ClientError::config(format!("Invalid number '{}' for {}", value, key)))
}

fn millis(key: &str, value: &str) -> Result<Duration> {
    number::<u64>(key, value).map(Duration::from_millis)
}

fn boolean(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ClientError::config(format!(
            "Invalid boolean '{}' for {}",
            value, key
        ))),
    }
}

/// Builder for WriteStreamConfig
#[derive(Debug, Default)]
pub struct WriteStreamConfigBuilder {
    config: WriteStreamConfig,
}

impl WriteStreamConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bootstrap_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.bootstrap_servers = servers.into_iter().map(|s| s.into()).collect();
        self
    }

    pub fn client_id<S: Into<String>>(mut self, client_id: S) -> Self {
        self.config.client_id = Some(client_id.into());
        self
    }

    pub fn acks(mut self, acks: Acks) -> Self {
        self.config.acks = acks;
        self
    }

    pub fn linger(mut self, linger: Duration) -> Self {
        self.config.linger = linger;
        self
    }

    pub fn batch_size(mut self, bytes: usize) -> Self {
        self.config.batch_size = bytes;
        self
    }

    pub fn batch_max_records(mut self, records: usize) -> Self {
        self.config.batch_max_records = records;
        self
    }

    pub fn buffer_records(mut self, records: usize) -> Self {
        self.config.buffer_records = records;
        self
    }

    pub fn enable_idempotence(mut self, enable: bool) -> Self {
        self.config.enable_idempotence = enable;
        self
    }

    pub fn transactional_id<S: Into<String>>(mut self, transactional_id: S) -> Self {
        self.config.transactional_id = Some(transactional_id.into());
        self
    }

    pub fn transaction_timeout(mut self, timeout: Duration) -> Self {
        self.config.transaction_timeout = timeout;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.config.retries = retries;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.config.retry_backoff = backoff;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn connection_setup_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_setup_timeout = timeout;
        self
    }

    pub fn metadata_max_age(mut self, max_age: Duration) -> Self {
        self.config.metadata_max_age = max_age;
        self
    }

    pub fn build(self) -> Result<WriteStreamConfig> {
        self.config.validate()
    }
}
