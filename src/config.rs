use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the TPS monitor.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// JSON-RPC node connection configuration.
    #[serde(default)]
    pub rpc: RpcConfig,

    /// Consensus family of the monitored chain. Selects the block timestamp unit.
    #[serde(default)]
    pub consensus: Option<Consensus>,

    /// How often the chain reader polls for a new block height. Default: 1s.
    #[serde(default = "default_one_second", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Heartbeat cadence that keeps emissions going while the chain is idle. Default: 1s.
    #[serde(default = "default_one_second", with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Historical block range. Range mode is used when both bounds are positive.
    #[serde(default)]
    pub range: RangeConfig,

    /// CSV report file configuration.
    #[serde(default)]
    pub report: ReportConfig,

    /// Query server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Metric sink configuration.
    #[serde(default)]
    pub sinks: SinksConfig,
}

/// Consensus family, which decides how block timestamps are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Consensus {
    /// Raft blocks carry nanosecond timestamps.
    Raft,
    /// IBFT blocks carry whole-second timestamps.
    Ibft,
}

impl Consensus {
    /// Returns the canonical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raft => "raft",
            Self::Ibft => "ibft",
        }
    }

    /// Whether block timestamps are in nanoseconds.
    pub fn nanosecond_timestamps(&self) -> bool {
        matches!(self, Self::Raft)
    }
}

impl std::str::FromStr for Consensus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "raft" => Ok(Self::Raft),
            "ibft" => Ok(Self::Ibft),
            other => bail!("invalid consensus {other:?}, should be raft or ibft"),
        }
    }
}

/// JSON-RPC node connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    /// Node HTTP endpoint (e.g., "http://localhost:8545").
    #[serde(default)]
    pub endpoint: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_rpc_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Historical block range.
#[derive(Debug, Default, Clone, Copy, Deserialize)]
pub struct RangeConfig {
    #[serde(default)]
    pub from_block: u64,

    #[serde(default)]
    pub to_block: u64,
}

impl RangeConfig {
    /// Range mode is selected only when both bounds are positive.
    pub fn is_given(&self) -> bool {
        self.from_block > 0 && self.to_block > 0
    }
}

/// CSV report file configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportConfig {
    /// Report path. Empty disables the report. Default: "tps-report.csv".
    #[serde(default = "default_report_path")]
    pub path: String,
}

/// Query server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address. Default: ":7575".
    #[serde(default = "default_server_addr")]
    pub addr: String,
}

/// Metric sink configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct SinksConfig {
    /// AWS CloudWatch metrics.
    #[serde(default)]
    pub cloudwatch: CloudWatchSinkConfig,

    /// Pull-based Prometheus endpoint.
    #[serde(default)]
    pub prometheus: PrometheusSinkConfig,

    /// InfluxDB time-series database.
    #[serde(default)]
    pub influxdb: InfluxDbSinkConfig,
}

/// AWS CloudWatch sink configuration. Credentials come from the standard
/// AWS provider chain.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct CloudWatchSinkConfig {
    /// Enable the sink. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// AWS region (e.g., "ap-southeast-1").
    #[serde(default)]
    pub region: String,

    /// Network name, first half of the metric namespace.
    #[serde(default)]
    pub network: String,

    /// Instance name, second half of the metric namespace.
    #[serde(default)]
    pub instance: String,

    /// Overrides the service endpoint, for local emulators.
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

/// Prometheus endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PrometheusSinkConfig {
    /// Enable the endpoint. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_prometheus_addr")]
    pub addr: String,
}

/// InfluxDB sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct InfluxDbSinkConfig {
    /// Enable the sink. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Server URL. Default: "http://localhost:8086".
    #[serde(default = "default_influxdb_endpoint")]
    pub endpoint: String,

    /// API token, or "username:password". Default: ":".
    #[serde(default = "default_influxdb_token")]
    pub token: String,

    /// Organization name.
    #[serde(default)]
    pub org: String,

    /// Bucket or database name. Default: "telegraf".
    #[serde(default = "default_influxdb_bucket")]
    pub bucket: String,

    /// Measurement name. Default: "quorum_tps".
    #[serde(default = "default_influxdb_measurement")]
    pub measurement: String,

    /// Comma separated key=value tags. Default: "system=quorum,comp=tps".
    #[serde(default = "default_influxdb_tags")]
    pub tags: String,

    /// Write timeout. Default: 10s.
    #[serde(default = "default_rpc_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_one_second() -> Duration {
    Duration::from_secs(1)
}

fn default_rpc_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_report_path() -> String {
    "tps-report.csv".to_string()
}

fn default_server_addr() -> String {
    ":7575".to_string()
}

fn default_prometheus_addr() -> String {
    ":9090".to_string()
}

fn default_influxdb_endpoint() -> String {
    "http://localhost:8086".to_string()
}

fn default_influxdb_token() -> String {
    ":".to_string()
}

fn default_influxdb_bucket() -> String {
    "telegraf".to_string()
}

fn default_influxdb_measurement() -> String {
    "quorum_tps".to_string()
}

fn default_influxdb_tags() -> String {
    "system=quorum,comp=tps".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            rpc: RpcConfig::default(),
            consensus: None,
            poll_interval: default_one_second(),
            heartbeat_interval: default_one_second(),
            range: RangeConfig::default(),
            report: ReportConfig::default(),
            server: ServerConfig::default(),
            sinks: SinksConfig::default(),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: default_rpc_timeout(),
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            path: default_report_path(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
        }
    }
}

impl Default for PrometheusSinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_prometheus_addr(),
        }
    }
}

impl Default for InfluxDbSinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_influxdb_endpoint(),
            token: default_influxdb_token(),
            org: String::new(),
            bucket: default_influxdb_bucket(),
            measurement: default_influxdb_measurement(),
            tags: default_influxdb_tags(),
            timeout: default_rpc_timeout(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file without validating it.
    ///
    /// Callers apply command-line overrides and then call [`Config::validate`].
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Returns the configured consensus family. Only valid after `validate`.
    pub fn consensus(&self) -> Result<Consensus> {
        self.consensus
            .context("consensus is required (raft or ibft)")
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.rpc.endpoint.is_empty() {
            bail!("rpc.endpoint is required");
        }

        self.consensus()?;

        if self.poll_interval.is_zero() {
            bail!("poll_interval must be positive");
        }
        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat_interval must be positive");
        }

        if self.range.from_block > self.range.to_block {
            bail!(
                "range.from_block {} is greater than range.to_block {}",
                self.range.from_block,
                self.range.to_block
            );
        }

        let cloudwatch = &self.sinks.cloudwatch;
        if cloudwatch.enabled {
            if cloudwatch.region.is_empty() {
                bail!("sinks.cloudwatch.region is required when enabled");
            }
            if cloudwatch.network.is_empty() || cloudwatch.instance.is_empty() {
                bail!("sinks.cloudwatch.network and instance are required when enabled");
            }
        }

        let influx = &self.sinks.influxdb;
        if influx.enabled {
            if influx.endpoint.is_empty() {
                bail!("sinks.influxdb.endpoint is required when enabled");
            }
            reqwest::Url::parse(&influx.endpoint)
                .with_context(|| format!("parsing influxdb endpoint {:?}", influx.endpoint))?;
            if influx.bucket.is_empty() {
                bail!("sinks.influxdb.bucket is required when enabled");
            }
            if influx.measurement.is_empty() {
                bail!("sinks.influxdb.measurement is required when enabled");
            }
            if influx.tags.is_empty() {
                bail!("sinks.influxdb.tags is required when enabled");
            }
        }

        Ok(())
    }
}

/// Turns a ":port" shorthand into a bindable address.
pub fn bind_addr(addr: &str, fallback: &str) -> String {
    let addr = if addr.is_empty() { fallback } else { addr };

    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}
