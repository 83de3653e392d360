//! Reader configuration management.
//!
//! Handles loading, saving, and validating reader configuration including:
//! - Device identity and provisioning secret
//! - Backend endpoint
//! - Known network profiles in priority order
//! - Task timing, delivery retry and buffer limits
//! - Watchdog supervision
//!
//! Configuration is read from a TOML file and layered under environment
//! overrides of the form `TAPIN__SECTION__KEY`, e.g.
//! `TAPIN__BACKEND__BASE_URL=https://attendance.example.com`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable naming an explicit configuration file.
pub const CONFIG_PATH_ENV: &str = "TAPIN_CONFIG";

static DEVICE_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,31}$").expect("device id pattern is valid")
});

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No configuration file at the given path.
    #[error("configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The file exists but could not be read.
    #[error("failed to read {}: {source}", .path.display())]
    ReadError {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file could not be written.
    #[error("failed to write {}: {source}", .path.display())]
    WriteError {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The layered sources could not be merged or deserialized.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// The configuration could not be serialized to TOML.
    #[error("failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// A single field holds an invalid value.
    #[error("{field}: {message}")]
    ValidationError {
        /// Dotted field path.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields hold invalid values.
    #[error("{} configuration errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Complete reader configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Device identity.
    pub device: DeviceConfig,
    /// Attendance backend.
    pub backend: BackendConfig,
    /// Network profiles and link checks.
    pub wifi: WifiConfig,
    /// Scan loop and queue timing.
    pub timing: TimingConfig,
    /// Event delivery retries.
    pub delivery: DeliveryConfig,
    /// Registration and heartbeat cadence.
    pub network: NetworkConfig,
    /// Offline event buffer.
    pub buffer: BufferConfig,
    /// Display task.
    pub display: DisplayConfig,
    /// Task supervision.
    pub watchdog: WatchdogConfig,
    /// Persistent storage location.
    pub storage: StorageConfig,
}

/// Device identity presented at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Stable device identifier.
    pub id: String,
    /// Human-readable reader name.
    pub name: String,
    /// Where the reader is mounted.
    pub location: String,
    /// Shared secret proving the device was provisioned.
    pub provisioning_secret: String,
    /// Reported in heartbeats.
    pub firmware_version: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: "tapin-reader".to_string(),
            name: "Tapin Reader".to_string(),
            location: String::new(),
            provisioning_secret: String::new(),
            firmware_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Attendance backend endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL the contract paths are resolved against.
    pub base_url: String,
    /// Upper bound for one HTTP request.
    pub request_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            request_timeout_ms: 5_000,
        }
    }
}

impl BackendConfig {
    /// Upper bound for one HTTP request.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// A known network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiProfile {
    /// Network SSID.
    pub ssid: String,

    /// Network passphrase, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl WifiProfile {
    /// An open network.
    #[must_use]
    pub fn open(ssid: &str) -> Self {
        Self {
            ssid: ssid.to_string(),
            password: None,
        }
    }
}

/// Link management.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WifiConfig {
    /// Profiles in priority order.
    pub networks: Vec<WifiProfile>,
    /// Attempts per profile before falling through to the next.
    pub attempts_per_profile: u32,
    /// How often link health is checked.
    pub check_interval_ms: u64,
    /// Upper bound for one connection attempt.
    pub connect_timeout_ms: u64,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            networks: Vec::new(),
            attempts_per_profile: 3,
            check_interval_ms: 5_000,
            connect_timeout_ms: 10_000,
        }
    }
}

/// Scan loop and queue timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Card reader poll interval.
    pub poll_interval_ms: u64,
    /// Identical tags within this window are discarded.
    pub debounce_ms: u64,
    /// Capacity of every inter-task queue.
    pub queue_capacity: usize,
    /// Bound for handing a scan to the network task.
    pub queue_send_timeout_ms: u64,
    /// Bound for one network-task queue receive.
    pub queue_recv_timeout_ms: u64,
    /// How long the scan task waits for an outcome.
    pub outcome_timeout_ms: u64,
    /// Bound for acquiring any peripheral lock.
    pub lock_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            debounce_ms: 3_000,
            queue_capacity: 10,
            queue_send_timeout_ms: 100,
            queue_recv_timeout_ms: 100,
            outcome_timeout_ms: 5_000,
            lock_timeout_ms: 200,
        }
    }
}

impl TimingConfig {
    /// Card reader poll interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Debounce window.
    #[must_use]
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Bound for handing a scan to the network task.
    #[must_use]
    pub const fn queue_send_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_send_timeout_ms)
    }

    /// Bound for one network-task queue receive.
    #[must_use]
    pub const fn queue_recv_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_recv_timeout_ms)
    }

    /// How long the scan task waits for an outcome.
    #[must_use]
    pub const fn outcome_timeout(&self) -> Duration {
        Duration::from_millis(self.outcome_timeout_ms)
    }

    /// Bound for acquiring any peripheral lock.
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Event delivery retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Transport attempts per live event before buffering.
    pub max_attempts: u32,
    /// First backoff delay.
    pub backoff_initial_ms: u64,
    /// Backoff ceiling.
    pub backoff_max_ms: u64,
    /// Re-registrations allowed while delivering one event.
    pub max_reauth: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 8_000,
            max_reauth: 1,
        }
    }
}

/// Registration and heartbeat cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interval between registration attempts while unregistered.
    pub registration_retry_ms: u64,
    /// Interval between heartbeats.
    pub heartbeat_interval_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            registration_retry_ms: 30_000,
            heartbeat_interval_ms: 60_000,
        }
    }
}

/// What happens when the offline buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse the incoming event.
    #[default]
    DropNewest,
    /// Evict the oldest buffered event to make room.
    DropOldest,
}

/// Offline event buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Maximum number of buffered events.
    pub capacity: usize,
    /// Entries flushed per cycle.
    pub flush_batch: usize,
    /// Interval between flush cycles.
    pub flush_interval_ms: u64,
    /// Interval between compactions.
    pub compaction_interval_ms: u64,
    /// Behavior at capacity.
    pub overflow_policy: OverflowPolicy,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            flush_batch: 5,
            flush_interval_ms: 2_000,
            compaction_interval_ms: 3_600_000,
            overflow_policy: OverflowPolicy::DropNewest,
        }
    }
}

/// Display task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Quiet period before the idle screen returns.
    pub idle_after_ms: u64,
    /// IANA timezone for the idle clock.
    pub timezone: String,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            idle_after_ms: 3_000,
            timezone: "UTC".to_string(),
        }
    }
}

impl DisplayConfig {
    /// Parsed timezone, UTC if unparsable.
    #[must_use]
    pub fn tz(&self) -> chrono_tz::Tz {
        self.timezone.parse().unwrap_or(chrono_tz::UTC)
    }
}

/// Task supervision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// A task silent for longer than this restarts the device.
    pub timeout_ms: u64,
    /// Supervisor check cadence.
    pub check_interval_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            check_interval_ms: 1_000,
        }
    }
}

/// Persistent storage location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory; platform default when unset.
    pub data_dir: Option<PathBuf>,
}

impl ReaderConfig {
    /// Load configuration from the default location plus environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the sources cannot be parsed or fail validation.
    pub fn load() -> ConfigResult<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Load configuration from `path` plus environment overrides.
    ///
    /// A missing file is not an error; defaults and environment apply.
    ///
    /// # Errors
    ///
    /// Returns an error if the sources cannot be parsed or fail validation.
    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        let settings = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix("TAPIN")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        let config: Self = settings
            .try_deserialize()
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_to(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteError {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::WriteError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check every field, collecting all problems.
    ///
    /// # Errors
    ///
    /// Returns the single problem, or [`ConfigError::MultipleValidationErrors`].
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut invalid = |field: &'static str, message: &str| {
            errors.push(ConfigError::ValidationError {
                field,
                message: message.to_string(),
            });
        };

        if !DEVICE_ID_RE.is_match(&self.device.id) {
            invalid(
                "device.id",
                "must be 1-32 characters of letters, digits, '-' or '_'",
            );
        }
        if self.device.provisioning_secret.trim().is_empty() {
            invalid("device.provisioning_secret", "must be set");
        }
        if url::Url::parse(&self.backend.base_url).is_err() {
            invalid("backend.base_url", "must be an absolute URL");
        }
        if self.backend.request_timeout_ms == 0 {
            invalid("backend.request_timeout_ms", "must be greater than zero");
        }
        if self.wifi.attempts_per_profile == 0 {
            invalid("wifi.attempts_per_profile", "must be at least 1");
        }
        if self.wifi.check_interval_ms == 0 {
            invalid("wifi.check_interval_ms", "must be greater than zero");
        }
        if self.timing.poll_interval_ms == 0 {
            invalid("timing.poll_interval_ms", "must be greater than zero");
        }
        if self.timing.queue_capacity == 0 {
            invalid("timing.queue_capacity", "must be at least 1");
        }
        if self.delivery.max_attempts == 0 {
            invalid("delivery.max_attempts", "must be at least 1");
        }
        if self.delivery.backoff_initial_ms > self.delivery.backoff_max_ms {
            invalid(
                "delivery.backoff_initial_ms",
                "must not exceed delivery.backoff_max_ms",
            );
        }
        if self.buffer.capacity == 0 {
            invalid("buffer.capacity", "must be at least 1");
        }
        if self.buffer.flush_batch == 0 {
            invalid("buffer.flush_batch", "must be at least 1");
        }
        if self.display.timezone.parse::<chrono_tz::Tz>().is_err() {
            invalid("display.timezone", "must be an IANA timezone name");
        }
        if self.watchdog.check_interval_ms == 0
            || self.watchdog.check_interval_ms >= self.watchdog.timeout_ms
        {
            invalid(
                "watchdog.check_interval_ms",
                "must be non-zero and shorter than watchdog.timeout_ms",
            );
        }
        for (field, timeout_ms) in [
            ("timing.outcome_timeout_ms", self.timing.outcome_timeout_ms),
            ("backend.request_timeout_ms", self.backend.request_timeout_ms),
            ("wifi.connect_timeout_ms", self.wifi.connect_timeout_ms),
        ] {
            if timeout_ms >= self.watchdog.timeout_ms {
                invalid(field, "must be shorter than watchdog.timeout_ms");
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }

    /// Get the configuration file path.
    ///
    /// # Errors
    ///
    /// Returns an error if no configuration directory can be determined.
    pub fn config_path() -> ConfigResult<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Ok(PathBuf::from(path));
        }
        // On readers: /etc/tapin/config.toml
        // For development: ~/.config/tapin/config.toml
        #[cfg(target_os = "linux")]
        {
            Ok(PathBuf::from("/etc/tapin/config.toml"))
        }
        #[cfg(not(target_os = "linux"))]
        {
            let dirs = directories::ProjectDirs::from("", "", "tapin").ok_or_else(|| {
                ConfigError::NotFound(PathBuf::from("config.toml"))
            })?;
            Ok(dirs.config_dir().join("config.toml"))
        }
    }
}
