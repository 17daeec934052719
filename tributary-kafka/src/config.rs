//! Pool configuration.
//!
//! The configuration is read once at startup, usually from a TOML file:
//!
//! ```toml
//! client_id = "cms"
//! group_id = "cms-consumers"
//! enabled = true
//!
//! [clusters.main]
//! log = "WARN"
//!
//! [clusters.main.connection]
//! brokers = ["kafka-1:9092", "kafka-2:9092"]
//! ssl = "true"
//!
//! [clusters.main.consumer]
//! auto_offset_reset = "earliest"
//!
//! [clusters.main.producer]
//! send_timeout_ms = 10000
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable consulted for the default of `debug`.
pub const ENVIRONMENT_VAR: &str = "TRIBUTARY_ENV";

/// Default producer send timeout.
pub const SEND_TIMEOUT_DEFAULT_MS: u64 = 30_000;

fn default_debug() -> bool {
    std::env::var(ENVIRONMENT_VAR).map_or(true, |env| env != "production")
}

const fn default_send_timeout_ms() -> u64 {
    SEND_TIMEOUT_DEFAULT_MS
}

/// Top-level pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Client id shared by every cluster connection.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Consumer group id shared by every consumer.
    #[serde(default)]
    pub group_id: Option<String>,
    /// Master switch. A disabled pool never connects.
    #[serde(default)]
    pub enabled: bool,
    /// Verbose startup diagnostics (topic listing per cluster).
    #[serde(default = "default_debug")]
    pub debug: bool,
    /// Cluster definitions keyed by cluster name.
    #[serde(default)]
    pub clusters: Option<ClusterSection>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            group_id: None,
            enabled: false,
            debug: default_debug(),
            clusters: None,
        }
    }
}

/// The `clusters` section as written by the operator.
///
/// Anything that is not a table of cluster definitions is kept verbatim so
/// that [`PoolConfig::is_usable`] can reject it instead of failing the load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClusterSection {
    /// Cluster name to cluster definition.
    Table(BTreeMap<String, ClusterConfig>),
    /// Malformed section (array, scalar, or table with invalid entries).
    Malformed(toml::Value),
}

impl PoolConfig {
    /// Creates an enabled configuration with no clusters.
    #[must_use]
    pub fn new(client_id: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            client_id: Some(client_id.into()),
            group_id: Some(group_id.into()),
            enabled: true,
            clusters: Some(ClusterSection::Table(BTreeMap::new())),
            ..Self::default()
        }
    }

    /// Adds or replaces a cluster definition.
    ///
    /// A malformed `clusters` section is replaced by a fresh table.
    #[must_use]
    pub fn with_cluster(mut self, name: impl Into<String>, cluster: ClusterConfig) -> Self {
        let mut table = match self.clusters.take() {
            Some(ClusterSection::Table(table)) => table,
            Some(ClusterSection::Malformed(_)) | None => BTreeMap::new(),
        };
        table.insert(name.into(), cluster);
        self.clusters = Some(ClusterSection::Table(table));
        self
    }

    /// Sets the master switch.
    #[must_use]
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the debug flag.
    #[must_use]
    pub const fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Returns true when a client id, a group id and a table of clusters are
    /// all present.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        let present = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.is_empty());
        present(&self.client_id)
            && present(&self.group_id)
            && matches!(self.clusters, Some(ClusterSection::Table(_)))
    }

    /// Returns the cluster table, or `None` if it is missing or malformed.
    #[must_use]
    pub fn clusters(&self) -> Option<&BTreeMap<String, ClusterConfig>> {
        match &self.clusters {
            Some(ClusterSection::Table(table)) => Some(table),
            _ => None,
        }
    }

    /// Load a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;
        Self::from_toml(&contents)
    }

    /// Parse a configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML cannot be parsed.
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })
    }
}

/// One Kafka cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Broker connection parameters.
    pub connection: ConnectionConfig,
    /// Consumer settings. No consumer is created when absent.
    #[serde(default)]
    pub consumer: Option<ConsumerConfig>,
    /// Producer settings. No producer is created when absent.
    #[serde(default)]
    pub producer: Option<ProducerConfig>,
    /// Client library log verbosity.
    #[serde(default)]
    pub log: ClientLogLevel,
}

impl ClusterConfig {
    /// Creates a cluster with neither consumer nor producer.
    #[must_use]
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            consumer: None,
            producer: None,
            log: ClientLogLevel::default(),
        }
    }

    /// Sets the consumer settings.
    #[must_use]
    pub fn with_consumer(mut self, consumer: ConsumerConfig) -> Self {
        self.consumer = Some(consumer);
        self
    }

    /// Sets the producer settings.
    #[must_use]
    pub fn with_producer(mut self, producer: ProducerConfig) -> Self {
        self.producer = Some(producer);
        self
    }

    /// Sets the client log level.
    #[must_use]
    pub const fn with_log(mut self, log: ClientLogLevel) -> Self {
        self.log = log;
        self
    }
}

/// Broker connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Bootstrap brokers (`host:port`).
    pub brokers: Vec<String>,
    /// TLS toggle, accepted as a boolean or a string.
    #[serde(default)]
    pub ssl: TlsSetting,
    /// SASL credentials.
    #[serde(default)]
    pub sasl: Option<SaslConfig>,
    /// Socket connection timeout.
    #[serde(default)]
    pub connection_timeout_ms: Option<u64>,
    /// Extra client library properties, passed through unchanged.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ConnectionConfig {
    /// Creates connection parameters for the given brokers.
    #[must_use]
    pub fn new<I, S>(brokers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            brokers: brokers.into_iter().map(Into::into).collect(),
            ssl: TlsSetting::default(),
            sasl: None,
            connection_timeout_ms: None,
            properties: BTreeMap::new(),
        }
    }

    /// Sets the TLS toggle.
    #[must_use]
    pub fn with_ssl(mut self, ssl: impl Into<TlsSetting>) -> Self {
        self.ssl = ssl.into();
        self
    }

    /// Sets SASL credentials.
    #[must_use]
    pub fn with_sasl(mut self, sasl: SaslConfig) -> Self {
        self.sasl = Some(sasl);
        self
    }

    /// Adds a pass-through client property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// TLS toggle as written in configuration.
///
/// Environment-driven configuration often renders booleans as strings, so
/// both `ssl = true` and `ssl = "true"` are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TlsSetting {
    /// Native boolean.
    Flag(bool),
    /// String form. Only the literal `"true"` enables TLS.
    Text(String),
}

impl Default for TlsSetting {
    fn default() -> Self {
        Self::Flag(false)
    }
}

impl TlsSetting {
    /// Normalizes the setting to a boolean.
    #[must_use]
    pub fn enabled(&self) -> bool {
        match self {
            Self::Flag(flag) => *flag,
            Self::Text(text) => text == "true",
        }
    }
}

impl From<bool> for TlsSetting {
    fn from(flag: bool) -> Self {
        Self::Flag(flag)
    }
}

impl From<&str> for TlsSetting {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// SASL authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaslConfig {
    /// Mechanism.
    pub mechanism: SaslMechanism,
    /// User name.
    pub username: String,
    /// Password.
    pub password: String,
}

/// Supported SASL mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaslMechanism {
    /// `PLAIN`.
    #[serde(rename = "plain")]
    Plain,
    /// `SCRAM-SHA-256`.
    #[serde(rename = "scram-sha-256")]
    ScramSha256,
    /// `SCRAM-SHA-512`.
    #[serde(rename = "scram-sha-512")]
    ScramSha512,
}

impl SaslMechanism {
    /// Name understood by the client library.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::ScramSha256 => "SCRAM-SHA-256",
            Self::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

/// Where a new consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    /// Oldest retained message.
    Earliest,
    /// Only new messages.
    Latest,
}

impl OffsetReset {
    /// Name understood by the client library.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Earliest => "earliest",
            Self::Latest => "latest",
        }
    }
}

/// Consumer settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Group session timeout.
    #[serde(default)]
    pub session_timeout_ms: Option<u64>,
    /// Offset reset policy for partitions without a committed offset.
    #[serde(default)]
    pub auto_offset_reset: Option<OffsetReset>,
    /// Extra client library properties.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Producer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// How long a send may wait in the local queue.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Required acknowledgements (`-1` all, `0` none, `1` leader).
    #[serde(default)]
    pub acks: Option<i16>,
    /// Compression codec (`none`, `gzip`, `snappy`, `lz4`, `zstd`).
    #[serde(default)]
    pub compression: Option<String>,
    /// Extra client library properties.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: SEND_TIMEOUT_DEFAULT_MS,
            acks: None,
            compression: None,
            properties: BTreeMap::new(),
        }
    }
}

impl ProducerConfig {
    /// Default send timeout as a [`Duration`].
    #[must_use]
    pub const fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Client library log verbosity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClientLogLevel {
    /// Silent.
    Nothing,
    /// Errors only.
    #[default]
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational.
    Info,
    /// Everything.
    Debug,
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading the configuration file.
    #[error("failed to read configuration from {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Parse error in TOML.
    #[error("failed to parse configuration: {message}")]
    Parse {
        /// Error message.
        message: String,
    },
}
