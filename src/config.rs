//! Configuration System using Figment
//!
//! Strongly-typed configuration for the control process. Configuration is
//! loaded from (in order of precedence, highest first):
//! 1. Environment variables prefixed with `VISX_`
//! 2. A TOML file (default: `config/visx.toml`)
//! 3. Built-in defaults, which describe a runnable simulated setup
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! VISX_APPLICATION__LOG_LEVEL=debug
//! VISX_STORAGE__DATA_DIR=/data/rawimages/camvisx
//! VISX_CAMERA__INITIAL_EXPOSURE_S=30
//! ```
//!
//! # Example
//!
//! ```no_run
//! use visx_ctrl::config::ControlConfig;
//!
//! let config = ControlConfig::load_from("config/visx.toml")?;
//! println!("Device: {}", config.application.device_name);
//! # Ok::<(), visx_ctrl::error::ControlError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ControlError;
use crate::metadata::CameraField;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ControlConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Camera defaults applied at startup
    #[serde(default)]
    pub camera: CameraConfig,
    /// Frame persistence settings
    #[serde(default)]
    pub storage: StorageConfig,
    /// Telemetry captured into each exposure header
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Cooler setpoint handling
    #[serde(default)]
    pub temperature: TemperatureConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Device name used on the property bus and as the file prefix default
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit logs as JSON lines instead of human-readable text
    #[serde(default)]
    pub json_logs: bool,
    /// Control loop cadence in milliseconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    /// Poll interval while waiting for the bus to connect
    #[serde(default = "default_connect_poll")]
    pub bus_connect_poll_ms: u64,
}

/// Camera startup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Exposure time in seconds before any bus request
    #[serde(default = "default_exposure")]
    pub initial_exposure_s: f64,
    /// Sensor gain
    #[serde(default = "default_gain")]
    pub gain: f64,
    /// Cooler setpoint at startup (deg C)
    #[serde(default)]
    pub initial_temperature_c: f64,
    /// Simulated sensor width in pixels
    #[serde(default = "default_sensor_width")]
    pub sensor_width: u32,
    /// Simulated sensor height in pixels
    #[serde(default = "default_sensor_height")]
    pub sensor_height: u32,
    /// Bits per pixel (8 or 16)
    #[serde(default = "default_bpp")]
    pub bits_per_pixel: u8,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory receiving frame and header files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// File name prefix; falls back to the device name when empty
    #[serde(default)]
    pub file_prefix: String,
}

/// One external telemetry entry captured into snapshots
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryEntry {
    /// Header keyword for this value
    pub key: String,
    /// Source address passed to the telemetry provider
    pub source: String,
}

/// Telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Camera readings included in every snapshot
    #[serde(default = "default_camera_fields")]
    pub camera_fields: Vec<CameraField>,
    /// External values included in every snapshot
    #[serde(default)]
    pub entries: Vec<TelemetryEntry>,
    /// Optional JSON document backing the external values
    #[serde(default)]
    pub json_file: Option<PathBuf>,
}

/// Temperature regulation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemperatureConfig {
    /// Whether setpoint forwarding is active at startup
    #[serde(default = "default_enabled")]
    pub controller_enabled: bool,
    /// Lowest accepted setpoint (deg C)
    #[serde(default = "default_min_temperature")]
    pub min_c: f64,
    /// Highest accepted setpoint (deg C)
    #[serde(default = "default_max_temperature")]
    pub max_c: f64,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_device_name() -> String {
    "camvisx".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tick_interval() -> u64 {
    100
}

fn default_connect_poll() -> u64 {
    1000
}

fn default_exposure() -> f64 {
    1.0
}

fn default_gain() -> f64 {
    1.0
}

fn default_sensor_width() -> u32 {
    1024
}

fn default_sensor_height() -> u32 {
    1024
}

fn default_bpp() -> u8 {
    16
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data/rawimages/camvisx")
}

fn default_camera_fields() -> Vec<CameraField> {
    CameraField::ALL.to_vec()
}

fn default_enabled() -> bool {
    true
}

fn default_min_temperature() -> f64 {
    -100.0
}

fn default_max_temperature() -> f64 {
    100.0
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            log_level: default_log_level(),
            json_logs: false,
            tick_interval_ms: default_tick_interval(),
            bus_connect_poll_ms: default_connect_poll(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            initial_exposure_s: default_exposure(),
            gain: default_gain(),
            initial_temperature_c: 0.0,
            sensor_width: default_sensor_width(),
            sensor_height: default_sensor_height(),
            bits_per_pixel: default_bpp(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            file_prefix: String::new(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            camera_fields: default_camera_fields(),
            entries: Vec::new(),
            json_file: None,
        }
    }
}

impl Default for TemperatureConfig {
    fn default() -> Self {
        Self {
            controller_enabled: default_enabled(),
            min_c: default_min_temperature(),
            max_c: default_max_temperature(),
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl ControlConfig {
    /// Load configuration from `config/visx.toml` and environment variables.
    pub fn load() -> Result<Self, ControlError> {
        Self::load_from("config/visx.toml")
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error: defaults and environment overrides
    /// still apply. The merged result is validated before it is returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ControlError> {
        let config: Self = Figment::from(Serialized::defaults(ControlConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("VISX_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Tick and poll intervals are non-zero
    /// - Initial exposure time is positive
    /// - Temperature bounds are ordered and contain the initial setpoint
    /// - Bit depth is 8 or 16
    /// - Telemetry keys are unique and non-empty
    pub fn validate(&self) -> Result<(), ControlError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ControlError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.application.device_name.trim().is_empty() {
            return Err(ControlError::Configuration(
                "'device_name' cannot be empty".to_string(),
            ));
        }

        if self.application.tick_interval_ms == 0 || self.application.bus_connect_poll_ms == 0 {
            return Err(ControlError::Configuration(
                "tick_interval_ms and bus_connect_poll_ms must be > 0".to_string(),
            ));
        }

        if !(self.camera.initial_exposure_s > 0.0) {
            return Err(ControlError::Configuration(format!(
                "Invalid initial_exposure_s {}. Must be > 0",
                self.camera.initial_exposure_s
            )));
        }

        if ![8, 16].contains(&self.camera.bits_per_pixel) {
            return Err(ControlError::Configuration(format!(
                "Invalid bits_per_pixel {}. Must be 8 or 16",
                self.camera.bits_per_pixel
            )));
        }

        let temperature = &self.temperature;
        if temperature.min_c >= temperature.max_c {
            return Err(ControlError::Configuration(format!(
                "Temperature bounds [{}, {}] are not ordered",
                temperature.min_c, temperature.max_c
            )));
        }
        if !(temperature.min_c..=temperature.max_c).contains(&self.camera.initial_temperature_c) {
            return Err(ControlError::Configuration(format!(
                "initial_temperature_c {} outside [{}, {}]",
                self.camera.initial_temperature_c, temperature.min_c, temperature.max_c
            )));
        }

        let mut keys = HashSet::new();
        for entry in &self.telemetry.entries {
            if entry.key.trim().is_empty() {
                return Err(ControlError::Configuration(
                    "Telemetry entry with empty key".to_string(),
                ));
            }
            if !keys.insert(entry.key.as_str()) {
                return Err(ControlError::Configuration(format!(
                    "Duplicate telemetry key: '{}'",
                    entry.key
                )));
            }
        }

        Ok(())
    }

    /// File prefix for persisted frames.
    pub fn file_prefix(&self) -> &str {
        if self.storage.file_prefix.is_empty() {
            &self.application.device_name
        } else {
            &self.storage.file_prefix
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.application.tick_interval_ms)
    }

    pub fn connect_poll_interval(&self) -> Duration {
        Duration::from_millis(self.application.bus_connect_poll_ms)
    }
}
