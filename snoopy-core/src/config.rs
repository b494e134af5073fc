//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/snoopy/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/snoopy/` (~/.config/snoopy/)
//! - Data: `$XDG_DATA_HOME/snoopy/` (~/.local/share/snoopy/), or `$SNOOPY_DATA_DIR`
//! - State/Logs: `$XDG_STATE_HOME/snoopy/` (~/.local/state/snoopy/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Shortest allowed poll interval
pub const MIN_INTERVAL_SECS: f64 = 2.0;

/// Longest allowed poll interval (one day)
pub const MAX_INTERVAL_SECS: f64 = 86_400.0;

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Buffer, flush and store settings
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Failure handling for collector ticks
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Exclusions shared by every collector
    #[serde(default)]
    pub filters: FilterConfig,

    /// Per-collector overrides, keyed by collector name
    #[serde(default)]
    pub collectors: HashMap<String, CollectorOverrides>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// What producers experience when the buffer is full.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Producers wait for the next flush. Nothing is lost.
    #[default]
    Block,
    /// Oldest pending events are discarded and counted.
    DropOldest,
}

/// Buffer, flush and store settings
#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    /// Seconds between periodic buffer flushes
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Pending events that trigger an early flush
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,

    /// Hard bound on pending events
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Back-pressure policy at `buffer_capacity`
    #[serde(default)]
    pub overflow: OverflowPolicy,

    /// Seconds between daemon_health heartbeat rows
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Upper bound on a single adapter call
    #[serde(default = "default_collect_timeout")]
    pub collect_timeout_secs: u64,

    /// Store write attempts per batch before the batch is dropped
    #[serde(default = "default_write_retry_attempts")]
    pub write_retry_attempts: u32,

    /// First retry delay in milliseconds (doubles per attempt)
    #[serde(default = "default_write_retry_base_ms")]
    pub write_retry_base_ms: u64,

    /// Ceiling for the retry delay in milliseconds
    #[serde(default = "default_write_retry_max_ms")]
    pub write_retry_max_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: default_flush_interval(),
            flush_threshold: default_flush_threshold(),
            buffer_capacity: default_buffer_capacity(),
            overflow: OverflowPolicy::default(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            collect_timeout_secs: default_collect_timeout(),
            write_retry_attempts: default_write_retry_attempts(),
            write_retry_base_ms: default_write_retry_base_ms(),
            write_retry_max_ms: default_write_retry_max_ms(),
        }
    }
}

impl DaemonConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn collect_timeout(&self) -> Duration {
        Duration::from_secs(self.collect_timeout_secs)
    }
}

fn default_flush_interval() -> u64 {
    5
}

fn default_flush_threshold() -> usize {
    500
}

fn default_buffer_capacity() -> usize {
    5000
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_collect_timeout() -> u64 {
    30
}

fn default_write_retry_attempts() -> u32 {
    5
}

fn default_write_retry_base_ms() -> u64 {
    200
}

fn default_write_retry_max_ms() -> u64 {
    10_000
}

/// Failure handling for collector ticks
#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Ceiling for the backoff delay between failing ticks
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Consecutive failures after which a collector is suspended for the run
    #[serde(default = "default_suspend_after")]
    pub suspend_after_failures: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_backoff_secs: default_max_backoff(),
            suspend_after_failures: default_suspend_after(),
        }
    }
}

fn default_max_backoff() -> u64 {
    600
}

fn default_suspend_after() -> u32 {
    10
}

/// Exclusions applied by every collector in addition to its own
#[derive(Debug, Deserialize, Clone, Default)]
pub struct FilterConfig {
    /// Exact names (apps, processes, senders) to drop
    #[serde(default)]
    pub exclude_names: Vec<String>,

    /// Path fragments or glob patterns to drop
    #[serde(default)]
    pub exclude_paths: Vec<String>,
}

/// Per-collector overrides
#[derive(Debug, Deserialize, Clone)]
pub struct CollectorOverrides {
    /// Disable the collector entirely
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Poll interval override (polled collectors only)
    pub interval_secs: Option<f64>,

    /// Seed window for the first run
    pub seed_days: Option<u32>,

    /// Re-emit an unchanged state after this many seconds (unset = never)
    pub dedup_window_secs: Option<f64>,

    /// Coalescing window override (event-driven collectors only)
    pub coalesce_ms: Option<u64>,

    /// Names to drop for this collector only
    #[serde(default)]
    pub exclude_names: Vec<String>,

    /// Path fragments or globs to drop for this collector only
    #[serde(default)]
    pub exclude_paths: Vec<String>,

    /// Source locations for file-backed adapters (history file, watched
    /// directories). Empty = the adapter's defaults.
    #[serde(default)]
    pub paths: Vec<PathBuf>,
}

impl Default for CollectorOverrides {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_secs: None,
            seed_days: None,
            dedup_window_secs: None,
            coalesce_ms: None,
            exclude_names: vec![],
            exclude_paths: vec![],
            paths: vec![],
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,

    /// Also write logs to stderr (foreground runs)
    #[serde(default)]
    pub stderr: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
            stderr: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        let daemon = &self.daemon;
        if daemon.flush_interval_secs == 0 {
            return Err(Error::Config(
                "daemon.flush_interval_secs must be at least 1".to_string(),
            ));
        }
        if daemon.heartbeat_interval_secs == 0 || daemon.collect_timeout_secs == 0 {
            return Err(Error::Config(
                "daemon.heartbeat_interval_secs and daemon.collect_timeout_secs must be at least 1"
                    .to_string(),
            ));
        }
        if daemon.buffer_capacity == 0 {
            return Err(Error::Config(
                "daemon.buffer_capacity must be at least 1".to_string(),
            ));
        }
        if daemon.flush_threshold == 0 || daemon.flush_threshold > daemon.buffer_capacity {
            return Err(Error::Config(format!(
                "daemon.flush_threshold must be between 1 and buffer_capacity ({})",
                daemon.buffer_capacity
            )));
        }
        if daemon.write_retry_attempts == 0 {
            return Err(Error::Config(
                "daemon.write_retry_attempts must be at least 1".to_string(),
            ));
        }
        if self.scheduler.suspend_after_failures == 0 {
            return Err(Error::Config(
                "scheduler.suspend_after_failures must be at least 1".to_string(),
            ));
        }
        for (name, overrides) in &self.collectors {
            if let Some(interval) = overrides.interval_secs {
                if !(MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&interval) {
                    return Err(Error::Config(format!(
                        "collectors.{}.interval_secs must be between {} and {}",
                        name, MIN_INTERVAL_SECS, MAX_INTERVAL_SECS
                    )));
                }
            }
            if let Some(window) = overrides.dedup_window_secs {
                if !(window.is_finite() && window > 0.0) {
                    return Err(Error::Config(format!(
                        "collectors.{}.dedup_window_secs must be positive",
                        name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Overrides for one collector (defaults when not configured)
    pub fn collector(&self, name: &str) -> CollectorOverrides {
        self.collectors.get(name).cloned().unwrap_or_default()
    }

    /// Returns the user's home directory (`$HOME`, else the platform lookup)
    pub fn home_dir() -> PathBuf {
        home_dir()
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/snoopy/config.toml` (~/.config/snoopy/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("snoopy").join("config.toml")
    }

    /// Returns the data directory path (for the SQLite database)
    ///
    /// `$SNOOPY_DATA_DIR`, else `$XDG_DATA_HOME/snoopy/` (~/.local/share/snoopy/)
    pub fn data_dir() -> PathBuf {
        match std::env::var_os("SNOOPY_DATA_DIR") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => xdg_data_home().join("snoopy"),
        }
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/snoopy/` (~/.local/state/snoopy/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("snoopy")
    }

    /// Returns the database file path
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("snoopy.db")
    }
}
