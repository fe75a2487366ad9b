//! Rig configuration.
//!
//! All sections are optional in the TOML file; missing fields fall back
//! to the defaults used on the production capture rig.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use flexrig_types::{Axis, DeviceId};

use crate::error::{Error, Result};

/// Top-level rig configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    /// Interpolation grid rate in Hz.
    pub target_hz: u32,
    /// Minimum gap between scan restarts, milliseconds.
    pub scan_burst_gap_ms: u64,
    /// Discovery RSSI floor in dBm; weaker advertisements are ignored.
    pub min_rssi: i16,
    /// Advertised-name substrings that identify rig sensors.
    pub device_name_patterns: Vec<String>,
    /// Reconnection backoff.
    pub reconnect: ReconnectConfig,
    /// Stream-silence watchdog.
    pub watchdog: WatchdogConfig,
    /// Joints to compute.
    pub joints: Vec<JointConfig>,
    /// Connection strategy.
    pub strategy: StrategyConfig,
    /// Recording upload sink.
    pub sink: SinkConfig,
    /// Enable the cross-joint sorting window (smoothness, not correctness).
    pub sorting_window: bool,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            target_hz: 100,
            scan_burst_gap_ms: 700,
            min_rssi: -90,
            device_name_patterns: vec!["FLEXRIG".to_string()],
            reconnect: ReconnectConfig::default(),
            watchdog: WatchdogConfig::default(),
            joints: vec![JointConfig::left_knee(), JointConfig::right_knee()],
            strategy: StrategyConfig::default(),
            sink: SinkConfig::default(),
            sorting_window: true,
        }
    }
}

impl RigConfig {
    /// Load configuration from the default path, or defaults when the
    /// file does not exist.
    pub fn load_default() -> Result<Self> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::invalid_config(format!("{}: {e}", path.as_ref().display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.target_hz == 0 || self.target_hz > 1000 {
            return Err(Error::invalid_config("target_hz must be in 1..=1000"));
        }
        if self.device_name_patterns.is_empty() {
            return Err(Error::invalid_config(
                "device_name_patterns must not be empty",
            ));
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(Error::invalid_config("reconnect.multiplier must be >= 1.0"));
        }
        if self.reconnect.base_delay_ms == 0 {
            return Err(Error::invalid_config("reconnect.base_delay_ms must be > 0"));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(Error::invalid_config(
                "reconnect.max_delay_ms must be >= base_delay_ms",
            ));
        }
        if self.watchdog.silence_threshold_ms < self.watchdog.interval_ms {
            return Err(Error::invalid_config(
                "watchdog.silence_threshold_ms must be >= interval_ms",
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for joint in &self.joints {
            if joint.name.is_empty() {
                return Err(Error::invalid_config("joint name must not be empty"));
            }
            if !seen.insert(joint.name.as_str()) {
                return Err(Error::invalid_config(format!(
                    "duplicate joint name '{}'",
                    joint.name
                )));
            }
            if !joint.proximal.is_proximal() {
                return Err(Error::invalid_config(format!(
                    "joint '{}': {} is not a proximal sensor",
                    joint.name, joint.proximal
                )));
            }
            if !joint.distal.is_distal() {
                return Err(Error::invalid_config(format!(
                    "joint '{}': {} is not a distal sensor",
                    joint.name, joint.distal
                )));
            }
        }
        Ok(())
    }

    /// Interpolation grid spacing.
    pub fn grid_interval_ms(&self) -> u64 {
        (1000 / self.target_hz) as u64
    }
}

/// Reconnection backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// First-attempt delay in milliseconds.
    pub base_delay_ms: u64,
    /// Backoff ceiling in milliseconds.
    pub max_delay_ms: u64,
    /// Exponential multiplier per attempt.
    pub multiplier: f64,
    /// Attempts before the device enters the error state.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay for a given attempt count, clamped to the ceiling.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let ms = self.base_delay_ms as f64 * self.multiplier.powi(attempts as i32);
        Duration::from_millis((ms as u64).min(self.max_delay_ms))
    }
}

/// Stream-silence watchdog settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Supervisor tick interval in milliseconds.
    pub interval_ms: u64,
    /// Silence duration that triggers stream recovery, milliseconds.
    pub silence_threshold_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            silence_threshold_ms: 3_000,
        }
    }
}

/// One joint to derive from a sensor pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JointConfig {
    /// Joint name used in samples and recordings.
    pub name: String,
    /// The proximal (thigh) sensor.
    pub proximal: DeviceId,
    /// The distal (shin) sensor.
    pub distal: DeviceId,
    /// Rotation axis the angle is extracted about.
    pub axis: Axis,
    /// Optional output calibration.
    #[serde(default)]
    pub calibration: Calibration,
}

impl JointConfig {
    /// The left knee with default mounting.
    pub fn left_knee() -> Self {
        Self {
            name: "left_knee".to_string(),
            proximal: DeviceId::LeftThigh,
            distal: DeviceId::LeftShin,
            axis: Axis::Y,
            calibration: Calibration::default(),
        }
    }

    /// The right knee with default mounting.
    pub fn right_knee() -> Self {
        Self {
            name: "right_knee".to_string(),
            proximal: DeviceId::RightThigh,
            distal: DeviceId::RightShin,
            axis: Axis::Y,
            calibration: Calibration::default(),
        }
    }
}

/// Linear calibration applied to a computed angle:
/// `(angle + offset) * multiplier`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Calibration {
    /// Additive offset in degrees, applied before the multiplier.
    pub offset: f64,
    /// Scale factor.
    pub multiplier: f64,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            offset: 0.0,
            multiplier: 1.0,
        }
    }
}

/// Which connection strategy to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// All connects launched concurrently.
    #[default]
    Parallel,
    /// One connect at a time with stabilization pauses.
    Sequential,
}

/// Connection strategy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Strategy variant.
    pub kind: StrategyKind,
    /// Sequential: pause between peripherals, milliseconds.
    pub inter_connection_delay_ms: u64,
    /// Sequential: settle time after a raw connect, milliseconds.
    pub stabilization_delay_ms: u64,
    /// Sequential: deadline for the post-connect state check, milliseconds.
    pub state_verification_timeout_ms: u64,
    /// Both: per-attempt connect timeout, milliseconds.
    pub connection_timeout_ms: u64,
    /// Parallel: retries per peripheral.
    pub max_retries: u32,
    /// Parallel: delay between retries, milliseconds.
    pub retry_delay_ms: u64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            kind: StrategyKind::Parallel,
            inter_connection_delay_ms: 300,
            stabilization_delay_ms: 500,
            state_verification_timeout_ms: 2_000,
            connection_timeout_ms: 30_000,
            max_retries: 2,
            retry_delay_ms: 500,
        }
    }
}

/// Recording upload sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Base URL of the recording service; recordings POST to
    /// `{base_url}/recordings`.
    pub base_url: String,
    /// Directory for the persistent retry queue.
    pub queue_dir: PathBuf,
    /// Upload attempts per queued item before it is dropped.
    pub max_retries: u32,
    /// Maximum queued items; oldest are evicted beyond this.
    pub max_queue_size: usize,
    /// Interval between retry sweeps, seconds.
    pub retry_interval_secs: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            queue_dir: default_queue_dir(),
            max_retries: 10,
            max_queue_size: 100,
            retry_interval_secs: 60,
        }
    }
}

/// Default configuration file location.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("flexrig")
        .join("config.toml")
}

/// Default retry-queue directory.
pub fn default_queue_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("flexrig")
        .join("upload-queue")
}
