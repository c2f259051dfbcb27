use crate::cluster::Error;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for a fabric node.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub rpc_server: RpcServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcServerConfig {
    /// Worker shard count for per-user handler execution.
    #[serde(default = "default_services")]
    pub services: usize,
    /// Broker connection url. Required.
    #[serde(default)]
    pub connect: String,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_max_reconnection_retries")]
    pub max_reconnection_retries: usize,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub buffer: BufferConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    /// Capacity of the engine's message and bindings channels.
    #[serde(default = "default_messages_buffer")]
    pub messages: usize,
    /// Capacity of the user-push channel; larger to absorb fan-out bursts.
    #[serde(default = "default_push_buffer")]
    pub push: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// TTL on the cluster-cache binding record; refreshed on every flush.
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
}

/// External registry settings, consumed by the discovery implementation.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default = "default_heartbeat_seconds")]
    pub heartbeat_seconds: u64,
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TelemetryConfig {
    pub log_level: Option<String>,
}

impl RpcServerConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Fail fast on settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.connect.is_empty() {
            return Err(Error::NoBrokerUrl);
        }
        if self.buffer.messages == 0 {
            return Err(Error::MessagesBufferZero);
        }
        if self.buffer.push == 0 {
            return Err(Error::PushBufferZero);
        }
        Ok(())
    }
}

impl SessionConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }
}

impl Config {
    /// Load from the path in PITAYA_CLUSTER_CONFIG, defaulting to
    /// `config/cluster.toml`.
    pub fn load_from_env() -> Result<Self> {
        let path = std::env::var("PITAYA_CLUSTER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/cluster.toml"));
        Self::load(&path)
    }

    /// Load from a specific file (TOML or JSON based on extension).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        if is_json(path_ref) {
            Ok(serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON config {}", path_ref.display()))?)
        } else {
            Ok(toml::from_str(&data)
                .with_context(|| format!("invalid TOML config {}", path_ref.display()))?)
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.rpc_server.validate()?;
        Ok(())
    }
}

fn is_json(path: &Path) -> bool {
    matches!(path.extension().and_then(|s| s.to_str()), Some("json"))
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            services: default_services(),
            connect: String::new(),
            connection_timeout_ms: default_connection_timeout_ms(),
            max_reconnection_retries: default_max_reconnection_retries(),
            request_timeout_ms: default_request_timeout_ms(),
            buffer: BufferConfig::default(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            messages: default_messages_buffer(),
            push: default_push_buffer(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: default_cache_ttl_seconds(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            heartbeat_seconds: default_heartbeat_seconds(),
            lease_seconds: default_lease_seconds(),
        }
    }
}

fn default_services() -> usize {
    30
}

fn default_connection_timeout_ms() -> u64 {
    2_000
}

fn default_max_reconnection_retries() -> usize {
    15
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_messages_buffer() -> usize {
    75
}

fn default_push_buffer() -> usize {
    100
}

fn default_cache_ttl_seconds() -> u64 {
    300
}

fn default_heartbeat_seconds() -> u64 {
    20
}

fn default_lease_seconds() -> u64 {
    60
}
