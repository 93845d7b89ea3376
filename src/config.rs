// src/config.rs

//! Manages broker configuration: loading, resolving defaults, and validation.

use crate::core::protocol::WireFormat;
use crate::core::protocol::codec::DEFAULT_MAX_FRAME_SIZE;
use anyhow::{Context, Result, anyhow};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tracing::warn;

/// Liveness advertisement of this node.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BrokerConfig {
    /// The address other nodes use to reach this broker. Defaults to
    /// `host:port` when empty.
    #[serde(default)]
    pub advertise_addr: String,
    #[serde(default = "default_broker_refresh", with = "humantime_serde")]
    pub refresh_interval: Duration,
    #[serde(default = "default_broker_ttl", with = "humantime_serde")]
    pub ttl: Duration,
}

fn default_broker_refresh() -> Duration {
    Duration::from_secs(10)
}
fn default_broker_ttl() -> Duration {
    Duration::from_secs(30)
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            advertise_addr: String::new(),
            refresh_interval: default_broker_refresh(),
            ttl: default_broker_ttl(),
        }
    }
}

/// Per-connection session settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionConfig {
    /// A session with no heartbeat for this long is closed.
    #[serde(default = "default_heartbeat_timeout", with = "humantime_serde")]
    pub heartbeat_timeout: Duration,
    /// How often the sweeper checks for timed-out sessions.
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// TTL of presence records; refreshed on every heartbeat.
    #[serde(default = "default_presence_ttl", with = "humantime_serde")]
    pub presence_ttl: Duration,
    /// Capacity of the per-connection outbound queue.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_sweep_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_presence_ttl() -> Duration {
    Duration::from_secs(60)
}
fn default_outbound_buffer() -> usize {
    256
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: default_heartbeat_timeout(),
            sweep_interval: default_sweep_interval(),
            presence_ttl: default_presence_ttl(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

/// Distributed lock tuning.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LockConfig {
    #[serde(default = "default_lock_ttl", with = "humantime_serde")]
    pub ttl: Duration,
    #[serde(default = "default_lock_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base", with = "humantime_serde")]
    pub backoff_base: Duration,
    #[serde(default = "default_backoff_max", with = "humantime_serde")]
    pub backoff_max: Duration,
}

fn default_lock_ttl() -> Duration {
    Duration::from_secs(10)
}
fn default_lock_max_retries() -> u32 {
    5
}
fn default_backoff_base() -> Duration {
    Duration::from_millis(20)
}
fn default_backoff_max() -> Duration {
    Duration::from_millis(500)
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: default_lock_ttl(),
            max_retries: default_lock_max_retries(),
            backoff_base: default_backoff_base(),
            backoff_max: default_backoff_max(),
        }
    }
}

impl LockConfig {
    /// Delay before retry `attempt + 1`: exponential in the retry index,
    /// capped, with full jitter over its upper half.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.backoff_base.as_millis() as u64;
        let cap = self.backoff_max.as_millis() as u64;
        let ceiling = base.saturating_mul(1u64 << attempt.min(16)).min(cap).max(1);
        let millis = rand::thread_rng().gen_range(ceiling / 2..=ceiling);
        Duration::from_millis(millis)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SequenceConfig {
    /// How many values one refill reserves for the local cache.
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
}

fn default_batch_size() -> u64 {
    100
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

/// Which `KvStore` implementation backs the broker.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store; only meaningful for a single node.
    #[default]
    Memory,
    /// A Redis-compatible server shared by every node.
    Resp,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_store_addr")]
    pub addr: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_op_timeout", with = "humantime_serde")]
    pub op_timeout: Duration,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(default = "default_script_timeout", with = "humantime_serde")]
    pub script_timeout: Duration,
    /// How often the memory backend actively purges expired keys.
    #[serde(default = "default_purge_interval", with = "humantime_serde")]
    pub purge_interval: Duration,
}

fn default_store_addr() -> String {
    "127.0.0.1:7878".to_string()
}
fn default_pool_size() -> usize {
    8
}
fn default_op_timeout() -> Duration {
    Duration::from_secs(2)
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(2)
}
fn default_script_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_purge_interval() -> Duration {
    Duration::from_secs(1)
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            addr: default_store_addr(),
            password: None,
            pool_size: default_pool_size(),
            op_timeout: default_op_timeout(),
            connect_timeout: default_connect_timeout(),
            script_timeout: default_script_timeout(),
            purge_interval: default_purge_interval(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProtocolConfig {
    #[serde(default)]
    pub format: WireFormat,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            format: WireFormat::default(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

/// Configuration for TLS encryption.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cert_path")]
    pub cert_path: String,
    #[serde(default = "default_key_path")]
    pub key_path: String,
}

fn default_cert_path() -> String {
    "spinelchat.crt".to_string()
}
fn default_key_path() -> String {
    "spinelchat.key".to_string()
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9878
}

/// A raw representation of the config file before validation and resolution.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_max_clients")]
    max_clients: usize,
    #[serde(default)]
    broker: BrokerConfig,
    #[serde(default)]
    session: SessionConfig,
    #[serde(default)]
    lock: LockConfig,
    #[serde(default)]
    sequence: SequenceConfig,
    #[serde(default)]
    store: StoreConfig,
    #[serde(default)]
    protocol: ProtocolConfig,
    #[serde(default)]
    tls: TlsConfig,
    #[serde(default)]
    metrics: MetricsConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8090
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_clients() -> usize {
    10000
}

/// The final, validated, and resolved broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub max_clients: usize,
    pub broker: BrokerConfig,
    pub session: SessionConfig,
    pub lock: LockConfig,
    pub sequence: SequenceConfig,
    pub store: StoreConfig,
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            max_clients: default_max_clients(),
            broker: BrokerConfig::default(),
            session: SessionConfig::default(),
            lock: LockConfig::default(),
            sequence: SequenceConfig::default(),
            store: StoreConfig::default(),
            protocol: ProtocolConfig::default(),
            tls: TlsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config file '{path}'"))
    }

    /// Parses and validates a configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(contents).context("Failed to parse TOML")?;

        let config = Config {
            host: raw.host,
            port: raw.port,
            log_level: raw.log_level,
            max_clients: raw.max_clients,
            broker: raw.broker,
            session: raw.session,
            lock: raw.lock,
            sequence: raw.sequence,
            store: raw.store,
            protocol: raw.protocol,
            tls: raw.tls,
            metrics: raw.metrics,
        };

        config.validate()?;
        Ok(config)
    }

    /// The address this broker advertises in its liveness record.
    pub fn advertise_addr(&self) -> String {
        if self.broker.advertise_addr.trim().is_empty() {
            format!("{}:{}", self.host, self.port)
        } else {
            self.broker.advertise_addr.clone()
        }
    }

    /// Validates the resolved configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.max_clients == 0 {
            return Err(anyhow!("max_clients cannot be 0"));
        }

        let non_zero = [
            ("broker.refresh_interval", self.broker.refresh_interval),
            ("broker.ttl", self.broker.ttl),
            ("session.heartbeat_timeout", self.session.heartbeat_timeout),
            ("session.sweep_interval", self.session.sweep_interval),
            ("session.presence_ttl", self.session.presence_ttl),
            ("lock.ttl", self.lock.ttl),
            ("store.op_timeout", self.store.op_timeout),
            ("store.connect_timeout", self.store.connect_timeout),
            ("store.script_timeout", self.store.script_timeout),
            ("store.purge_interval", self.store.purge_interval),
        ];
        for (name, value) in non_zero {
            if value.is_zero() {
                return Err(anyhow!("{name} cannot be 0"));
            }
        }

        if self.broker.ttl <= self.broker.refresh_interval {
            return Err(anyhow!(
                "broker.ttl ({:?}) must be longer than broker.refresh_interval ({:?})",
                self.broker.ttl,
                self.broker.refresh_interval
            ));
        }
        if self.session.presence_ttl <= self.session.heartbeat_timeout {
            return Err(anyhow!(
                "session.presence_ttl ({:?}) must be longer than session.heartbeat_timeout ({:?})",
                self.session.presence_ttl,
                self.session.heartbeat_timeout
            ));
        }
        if self.session.sweep_interval > self.session.heartbeat_timeout {
            warn!(
                "session.sweep_interval is longer than session.heartbeat_timeout; timeouts will be detected late."
            );
        }
        if self.session.outbound_buffer == 0 {
            return Err(anyhow!("session.outbound_buffer cannot be 0"));
        }
        if self.lock.backoff_base > self.lock.backoff_max {
            return Err(anyhow!("lock.backoff_base cannot exceed lock.backoff_max"));
        }
        if self.sequence.batch_size == 0 {
            return Err(anyhow!("sequence.batch_size cannot be 0"));
        }
        if self.protocol.max_frame_size < 16 {
            return Err(anyhow!("protocol.max_frame_size is too small"));
        }

        if self.store.backend == StoreBackend::Resp {
            if self.store.addr.trim().is_empty() {
                return Err(anyhow!("store.addr cannot be empty for the resp backend"));
            }
            if self.store.pool_size == 0 {
                return Err(anyhow!("store.pool_size cannot be 0"));
            }
        }

        if self.tls.enabled {
            if self.tls.cert_path.trim().is_empty() {
                return Err(anyhow!("tls.cert_path cannot be empty when TLS is enabled"));
            }
            if self.tls.key_path.trim().is_empty() {
                return Err(anyhow!("tls.key_path cannot be empty when TLS is enabled"));
            }
        }

        if self.metrics.enabled {
            if self.metrics.port == 0 {
                return Err(anyhow!("metrics.port cannot be 0"));
            }
            if self.metrics.port == self.port {
                return Err(anyhow!(
                    "metrics.port cannot be the same as the main server port"
                ));
            }
        }
        Ok(())
    }
}
