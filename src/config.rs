// src/config.rs

//! # Autopilot Configuration
//!
//! The live parameter record shared by both control loops, plus the port
//! used to persist it.
//!
//! Loops never copy gains or cutoffs out of the record. They hold a
//! [`Binding`] and read through it on every tick, so a value written via
//! [`ConfigHandle::update`] is picked up by the very next sample. Every
//! update is validated as a whole and rolled back if any field is invalid,
//! which keeps non-positive cutoffs and non-finite gains from ever reaching
//! a filter or PID.

use crate::error::ConfigError;
use log::{debug, info};
use serde::{Deserialize, Deserializer, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Version written into every persisted [`ConfigRecord`].
pub const CONFIG_VERSION: u32 = 1;

/// Proportional, integral and derivative gains.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PidGains {
    /// Proportional gain.
    pub kp: f64,
    /// Integral gain.
    pub ki: f64,
    /// Derivative gain.
    pub kd: f64,
}

impl PidGains {
    /// Creates a gain set.
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self { kp, ki, kd }
    }
}

/// Parameters of one control loop and its tuning runs.
///
/// Each loop has its own defaults, [`LoopConfig::rotation`] and
/// [`LoopConfig::heading`]. Stored fields are laid over those.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Gains used by the loop's PID.
    pub gains: PidGains,
    /// Cutoff of the low-pass filter applied to the PID derivative, in Hz.
    pub derivative_low_pass_hz: f64,
    /// Cutoff of the low-pass filter applied to the loop's measurement, in Hz.
    pub low_pass_hz: f64,
    /// Boat speed in knots at which the current gains were tuned.
    pub tune_speed_kt: Option<f64>,
    /// Relay hysteresis used for the first cycles of a tuning run.
    pub tune_noise_band: f64,
    /// Allowed peak-to-peak variation between cycles, in percent.
    pub tune_allowed_variance_pct: f64,
    /// Half-cycles after which the relay hysteresis is dropped.
    pub tune_disable_noise_band_cycles: u32,
}

impl LoopConfig {
    /// Defaults for the inner rotation-rate loop.
    pub fn rotation() -> Self {
        Self {
            gains: PidGains::default(),
            derivative_low_pass_hz: 1.0 / 10.0,
            low_pass_hz: 1.0 / 8.0,
            tune_speed_kt: None,
            tune_noise_band: 1.0,
            tune_allowed_variance_pct: 10.0,
            tune_disable_noise_band_cycles: 2,
        }
    }

    /// Defaults for the outer heading loop.
    pub fn heading() -> Self {
        Self {
            gains: PidGains::default(),
            derivative_low_pass_hz: 1.0,
            low_pass_hz: 1.0,
            tune_speed_kt: None,
            tune_noise_band: 0.5,
            tune_allowed_variance_pct: 10.0,
            tune_disable_noise_band_cycles: 2,
        }
    }

    fn validate(&self, fields: &'static [&'static str; 6]) -> Result<(), ConfigError> {
        finite(fields[0], self.gains.kp)?;
        finite(fields[1], self.gains.ki)?;
        finite(fields[2], self.gains.kd)?;
        positive(fields[3], self.derivative_low_pass_hz)?;
        positive(fields[4], self.low_pass_hz)?;
        if let Some(speed) = self.tune_speed_kt {
            non_negative("tune_speed_kt", speed)?;
        }
        non_negative("tune_noise_band", self.tune_noise_band)?;
        positive(fields[5], self.tune_allowed_variance_pct)
    }
}

/// The fields of a stored [`LoopConfig`] that are present.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StoredLoopConfig {
    gains: Option<PidGains>,
    derivative_low_pass_hz: Option<f64>,
    low_pass_hz: Option<f64>,
    tune_speed_kt: Option<f64>,
    tune_noise_band: Option<f64>,
    tune_allowed_variance_pct: Option<f64>,
    tune_disable_noise_band_cycles: Option<u32>,
}

impl StoredLoopConfig {
    fn over(self, defaults: LoopConfig) -> LoopConfig {
        LoopConfig {
            gains: self.gains.unwrap_or(defaults.gains),
            derivative_low_pass_hz: self
                .derivative_low_pass_hz
                .unwrap_or(defaults.derivative_low_pass_hz),
            low_pass_hz: self.low_pass_hz.unwrap_or(defaults.low_pass_hz),
            tune_speed_kt: self.tune_speed_kt.or(defaults.tune_speed_kt),
            tune_noise_band: self.tune_noise_band.unwrap_or(defaults.tune_noise_band),
            tune_allowed_variance_pct: self
                .tune_allowed_variance_pct
                .unwrap_or(defaults.tune_allowed_variance_pct),
            tune_disable_noise_band_cycles: self
                .tune_disable_noise_band_cycles
                .unwrap_or(defaults.tune_disable_noise_band_cycles),
        }
    }
}

fn rotation_loop<'de, D: Deserializer<'de>>(deserializer: D) -> Result<LoopConfig, D::Error> {
    Ok(StoredLoopConfig::deserialize(deserializer)?.over(LoopConfig::rotation()))
}

fn heading_loop<'de, D: Deserializer<'de>>(deserializer: D) -> Result<LoopConfig, D::Error> {
    Ok(StoredLoopConfig::deserialize(deserializer)?.over(LoopConfig::heading()))
}

/// Simulated boat parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Drive the simulated boat instead of real hardware.
    pub enabled: bool,
    /// Constant boat speed in knots.
    pub speed_kt: f64,
    /// Peak-to-peak amplitude of the heading noise, in degrees.
    pub noise_amplitude: f64,
    /// Seed of the noise generator.
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            speed_kt: 3.0,
            noise_amplitude: 0.01,
            seed: 0,
        }
    }
}

/// How a motor level is put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveMode {
    /// Send the level as an 8-bit duty value.
    #[default]
    Proportional,
    /// Switch the motor fully on and off through the pulse modulator.
    Pulsed,
}

/// Wireless motor parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorConfig {
    /// Cadence of outbound motor writes, in milliseconds.
    pub flush_interval_ms: u64,
    /// Wire encoding of motor levels.
    pub drive_mode: DriveMode,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 200,
            drive_mode: DriveMode::Proportional,
        }
    }
}

/// A gain set saved under a name for manual recall.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedPidConfig {
    /// Display name, e.g. `"Pessen"`.
    pub name: String,
    /// The saved gains.
    pub gains: PidGains,
    /// Measurement filter cutoff the gains were tuned with.
    pub low_pass_hz: f64,
    /// Derivative filter cutoff the gains were tuned with.
    pub derivative_low_pass_hz: f64,
}

/// The complete autopilot parameter record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutopilotConfig {
    /// Simulated boat parameters.
    pub simulation: SimulationConfig,
    /// Inner rotation-rate loop.
    #[serde(deserialize_with = "rotation_loop")]
    pub rotation: LoopConfig,
    /// Number of cascaded low-pass stages on the measured rotation rate.
    pub rotation_filter_stages: usize,
    /// Outer heading loop.
    #[serde(deserialize_with = "heading_loop")]
    pub heading: LoopConfig,
    /// Turn rate limit per knot of boat speed, in degrees per second.
    pub max_turn_rate_deg_per_sec_per_kt: f64,
    /// Wireless motor parameters.
    pub motor: MotorConfig,
    /// Heading gain sets saved by tuning runs, newest first.
    pub heading_snapshots: Vec<NamedPidConfig>,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            simulation: SimulationConfig::default(),
            rotation: LoopConfig::rotation(),
            rotation_filter_stages: 1,
            heading: LoopConfig::heading(),
            max_turn_rate_deg_per_sec_per_kt: 4.0,
            motor: MotorConfig::default(),
            heading_snapshots: Vec::new(),
        }
    }
}

impl AutopilotConfig {
    /// Checks every parameter the control core depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rotation.validate(&[
            "rotation.gains.kp",
            "rotation.gains.ki",
            "rotation.gains.kd",
            "rotation.derivative_low_pass_hz",
            "rotation.low_pass_hz",
            "rotation.tune_allowed_variance_pct",
        ])?;
        self.heading.validate(&[
            "heading.gains.kp",
            "heading.gains.ki",
            "heading.gains.kd",
            "heading.derivative_low_pass_hz",
            "heading.low_pass_hz",
            "heading.tune_allowed_variance_pct",
        ])?;
        if self.rotation_filter_stages == 0 {
            return Err(ConfigError::InvalidValue {
                field: "rotation_filter_stages",
                value: 0.0,
                reason: "at least one filter stage is required",
            });
        }
        positive(
            "max_turn_rate_deg_per_sec_per_kt",
            self.max_turn_rate_deg_per_sec_per_kt,
        )?;
        non_negative("simulation.speed_kt", self.simulation.speed_kt)?;
        non_negative("simulation.noise_amplitude", self.simulation.noise_amplitude)?;
        if self.motor.flush_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "motor.flush_interval_ms",
                value: 0.0,
                reason: "must be positive",
            });
        }
        for snapshot in &self.heading_snapshots {
            finite("heading_snapshots.gains.kp", snapshot.gains.kp)?;
            finite("heading_snapshots.gains.ki", snapshot.gains.ki)?;
            finite("heading_snapshots.gains.kd", snapshot.gains.kd)?;
            positive("heading_snapshots.low_pass_hz", snapshot.low_pass_hz)?;
            positive(
                "heading_snapshots.derivative_low_pass_hz",
                snapshot.derivative_low_pass_hz,
            )?;
        }
        Ok(())
    }
}

fn finite(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field,
            value,
            reason: "must be finite",
        })
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field,
            value,
            reason: "must be positive",
        })
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field,
            value,
            reason: "must not be negative",
        })
    }
}

/// Shared, validated handle to the live configuration record.
///
/// Cloning the handle shares the record.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Rc<RefCell<AutopilotConfig>>,
}

impl ConfigHandle {
    /// Wraps a configuration after validating it.
    pub fn new(config: AutopilotConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Rc::new(RefCell::new(config)),
        })
    }

    /// Reads from the current record.
    pub fn read<R>(&self, f: impl FnOnce(&AutopilotConfig) -> R) -> R {
        f(&self.inner.borrow())
    }

    /// Applies a change, keeping it only if the result is valid.
    pub fn update(&self, f: impl FnOnce(&mut AutopilotConfig)) -> Result<(), ConfigError> {
        let mut config = self.inner.borrow_mut();
        let previous = config.clone();
        f(&mut config);
        if let Err(e) = config.validate() {
            *config = previous;
            debug!("rejected config update: {e}");
            return Err(e);
        }
        Ok(())
    }

    /// A copy of the current record, for persistence.
    pub fn snapshot(&self) -> AutopilotConfig {
        self.inner.borrow().clone()
    }

    /// Binds a live view onto one value of the record.
    pub fn bind<T>(&self, read: fn(&AutopilotConfig) -> T) -> Binding<T> {
        Binding {
            handle: self.clone(),
            read,
        }
    }
}

/// A live view of one value inside the shared configuration.
pub struct Binding<T> {
    handle: ConfigHandle,
    read: fn(&AutopilotConfig) -> T,
}

impl<T> Clone for Binding<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            read: self.read,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Binding<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Binding").field(&self.get()).finish()
    }
}

impl<T> Binding<T> {
    /// Reads the current value.
    pub fn get(&self) -> T {
        self.handle.read(self.read)
    }
}

/// The persisted form of the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigRecord {
    /// Schema version, see [`CONFIG_VERSION`].
    pub version: u32,
    /// The configuration itself.
    pub config: AutopilotConfig,
}

impl ConfigRecord {
    fn into_config(self) -> Result<AutopilotConfig, ConfigError> {
        if self.version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion {
                found: self.version,
                expected: CONFIG_VERSION,
            });
        }
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Load/save port for the configuration record.
pub trait ConfigStore {
    /// Loads the stored configuration, `None` if nothing has been saved yet.
    fn load(&self) -> Result<Option<AutopilotConfig>, ConfigError>;

    /// Persists the configuration.
    fn save(&mut self, config: &AutopilotConfig) -> Result<(), ConfigError>;

    /// Loads the stored configuration or falls back to defaults.
    fn load_or_default(&self) -> Result<AutopilotConfig, ConfigError> {
        Ok(self.load()?.unwrap_or_default())
    }
}

/// Stores the configuration as a JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Creates a store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for JsonFileStore {
    fn load(&self) -> Result<Option<AutopilotConfig>, ConfigError> {
        if !self.path.exists() {
            debug!("no config at {}, using defaults", self.path.display());
            return Ok(None);
        }
        let text = std::fs::read_to_string(&self.path)?;
        let record: ConfigRecord = serde_json::from_str(&text)?;
        record.into_config().map(Some)
    }

    fn save(&mut self, config: &AutopilotConfig) -> Result<(), ConfigError> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let record = ConfigRecord {
            version: CONFIG_VERSION,
            config: config.clone(),
        };
        std::fs::write(&self.path, serde_json::to_string_pretty(&record)?)?;
        info!("saved config to {}", self.path.display());
        Ok(())
    }
}

/// Keeps the serialized record in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    json: Option<String>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The last serialized record, if any.
    pub fn raw(&self) -> Option<&str> {
        self.json.as_deref()
    }
}

impl ConfigStore for MemoryStore {
    fn load(&self) -> Result<Option<AutopilotConfig>, ConfigError> {
        match &self.json {
            Some(json) => {
                let record: ConfigRecord = serde_json::from_str(json)?;
                record.into_config().map(Some)
            }
            None => Ok(None),
        }
    }

    fn save(&mut self, config: &AutopilotConfig) -> Result<(), ConfigError> {
        let record = ConfigRecord {
            version: CONFIG_VERSION,
            config: config.clone(),
        };
        self.json = Some(serde_json::to_string(&record)?);
        Ok(())
    }
}
