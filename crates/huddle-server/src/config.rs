//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (HUDDLE_HOST, HUDDLE_PORT)
//! - TOML configuration file
//! - The `--config` command line flag

use anyhow::{Context, Result};
use huddle_core::{BridgeConfig, ClusterConfig, CoordinatorConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port of the local line server.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Coordinator configuration.
    #[serde(default)]
    pub coordinator: CoordinatorSection,

    /// Cluster node configuration.
    #[serde(default)]
    pub cluster: ClusterSection,

    /// Hub server configuration.
    #[serde(default)]
    pub hub: HubSection,

    /// Bus retry configuration.
    #[serde(default)]
    pub bus: BusSection,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Shutdown configuration.
    #[serde(default)]
    pub shutdown: ShutdownSection,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSection {
    /// Capacity of the command queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Capacity of each session's outbound queue.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    /// Remove rooms when their last member leaves.
    #[serde(default)]
    pub reclaim_empty_rooms: bool,
}

/// Where a cluster node keeps presence records and the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// In-process, for a single node.
    Memory,
    /// A hub server shared by every node.
    Hub,
}

/// Cluster node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSection {
    /// RPC port.
    #[serde(default = "default_cluster_port")]
    pub port: u16,

    /// Path for the RPC WebSocket endpoint.
    #[serde(default = "default_rpc_path")]
    pub rpc_path: String,

    /// Presence store backend.
    #[serde(default = "default_store")]
    pub store: StoreKind,

    /// Hub endpoint when `store = "hub"`.
    #[serde(default = "default_hub_url")]
    pub hub_url: String,

    /// Page size for presence scans.
    #[serde(default = "default_scan_count")]
    pub scan_count: usize,

    /// Timeout for one hub request in milliseconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

/// Hub server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSection {
    /// Hub port.
    #[serde(default = "default_hub_port")]
    pub port: u16,

    /// Path for the hub WebSocket endpoint.
    #[serde(default = "default_hub_path")]
    pub path: String,
}

/// Bus retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSection {
    /// Consecutive read failures tolerated.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Linear backoff unit in milliseconds.
    #[serde(default = "default_backoff")]
    pub backoff_ms: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of concurrent connections per listener.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum length of one protocol line in bytes.
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,

    /// Maximum WebSocket message size in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

/// Shutdown configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownSection {
    /// How long to wait for connection tasks, in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub timeout_secs: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("HUDDLE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("HUDDLE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_queue_capacity() -> usize {
    256
}

fn default_outbound_capacity() -> usize {
    64
}

fn default_cluster_port() -> u16 {
    3000
}

fn default_rpc_path() -> String {
    "/rpc".to_string()
}

fn default_store() -> StoreKind {
    StoreKind::Hub
}

fn default_hub_url() -> String {
    "ws://127.0.0.1:6379/hub".to_string()
}

fn default_scan_count() -> usize {
    100
}

fn default_request_timeout() -> u64 {
    5_000
}

fn default_hub_port() -> u16 {
    6379
}

fn default_hub_path() -> String {
    "/hub".to_string()
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_backoff() -> u64 {
    200
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_line_length() -> usize {
    8 * 1024
}

fn default_max_frame_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            coordinator: CoordinatorSection::default(),
            cluster: ClusterSection::default(),
            hub: HubSection::default(),
            bus: BusSection::default(),
            limits: LimitsConfig::default(),
            shutdown: ShutdownSection::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            outbound_capacity: default_outbound_capacity(),
            reclaim_empty_rooms: false,
        }
    }
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            port: default_cluster_port(),
            rpc_path: default_rpc_path(),
            store: default_store(),
            hub_url: default_hub_url(),
            scan_count: default_scan_count(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            port: default_hub_port(),
            path: default_hub_path(),
        }
    }
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            backoff_ms: default_backoff(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_line_length: default_max_line_length(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, the default paths, or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or if
    /// an explicit `path` cannot be read.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        let config_paths = [
            "huddle.toml",
            "/etc/huddle/huddle.toml",
            "~/.config/huddle/huddle.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Socket address for `port` on the configured host.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self, port: u16) -> Result<SocketAddr> {
        format!("{}:{}", self.host, port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, port))
    }

    /// RPC endpoint a client on this host would connect to.
    #[must_use]
    pub fn rpc_url(&self) -> String {
        format!(
            "ws://{}:{}{}",
            self.host, self.cluster.port, self.cluster.rpc_path
        )
    }

    /// Settings for the local coordinator.
    #[must_use]
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            queue_capacity: self.coordinator.queue_capacity,
            reclaim_empty_rooms: self.coordinator.reclaim_empty_rooms,
        }
    }

    /// Settings for a cluster node.
    #[must_use]
    pub fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            queue_capacity: self.coordinator.queue_capacity,
            scan_count: self.cluster.scan_count,
            bridge: BridgeConfig {
                max_retries: self.bus.retry_attempts,
                backoff: Duration::from_millis(self.bus.backoff_ms),
            },
        }
    }

    /// Timeout for one hub request.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.request_timeout_ms)
    }

    /// How long shutdown waits for connection tasks.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown.timeout_secs)
    }
}
