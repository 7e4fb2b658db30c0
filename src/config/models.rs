use crate::device::NetworkSettings;
use crate::harvest::{MatchMode, SourceSettings};
use crate::humanize::ByteSize;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub harvest: HarvestConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Timing for device sessions
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_advertise_interval_ms")]
    pub advertise_interval_ms: u64,
    /// Bounded wait for background tasks at teardown
    #[serde(default = "default_teardown_wait_ms")]
    pub teardown_wait_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            advertise_interval_ms: default_advertise_interval_ms(),
            teardown_wait_ms: default_teardown_wait_ms(),
        }
    }
}

impl NetworkConfig {
    pub fn settings(&self) -> NetworkSettings {
        NetworkSettings {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            advertise_interval: Duration::from_millis(self.advertise_interval_ms),
            teardown_wait: Duration::from_millis(self.teardown_wait_ms),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_reconnect_interval_ms() -> u64 {
    2000
}

fn default_advertise_interval_ms() -> u64 {
    2000
}

fn default_teardown_wait_ms() -> u64 {
    1000
}

/// File harvesting
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HarvestConfig {
    #[serde(default = "default_harvest_root")]
    pub root: PathBuf,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: ByteSize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// How long `cancel_all` waits for each worker before aborting it
    #[serde(default = "default_cancel_wait_ms")]
    pub cancel_wait_ms: u64,
    #[serde(default)]
    pub match_mode: MatchMode,
    #[serde(default = "default_list_retries")]
    pub list_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Interval between progress lines while harvesting
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            root: default_harvest_root(),
            chunk_size: default_chunk_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            cancel_wait_ms: default_cancel_wait_ms(),
            match_mode: MatchMode::default(),
            list_retries: default_list_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

impl HarvestConfig {
    pub fn source_settings(&self) -> SourceSettings {
        SourceSettings {
            chunk_size: self.chunk_size.as_usize(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            max_retries: self.list_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn cancel_wait(&self) -> Duration {
        Duration::from_millis(self.cancel_wait_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

fn default_harvest_root() -> PathBuf {
    PathBuf::from("data/harvest")
}

fn default_chunk_size() -> ByteSize {
    ByteSize(256 * 1024) // 256 KB
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_cancel_wait_ms() -> u64 {
    5000
}

fn default_list_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_progress_interval_ms() -> u64 {
    1000
}

/// Device persistence
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    #[serde(default = "default_devices_file")]
    pub devices_file: PathBuf,
    /// Save the devices file when `run` exits
    #[serde(default = "default_save_on_exit")]
    pub save_on_exit: bool,
    /// How often `run` polls pollable devices
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            devices_file: default_devices_file(),
            save_on_exit: default_save_on_exit(),
            refresh_interval_ms: default_refresh_interval_ms(),
        }
    }
}

fn default_devices_file() -> PathBuf {
    PathBuf::from("config/devices.json")
}

fn default_save_on_exit() -> bool {
    true
}

fn default_refresh_interval_ms() -> u64 {
    1000
}

/// Logging
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "stagehand=info".to_string()
}
