// src/error.rs

//! # Error Types
//!
//! Errors surfaced by configuration, devices and the autopilot facade.
//! Tuning timeouts and cancellations are not errors; they are reported as
//! a [`TuningResult`](crate::pid::TuningResult) with `success == false`.

use thiserror::Error;

/// Errors raised while validating, loading or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A numeric parameter is outside its allowed range.
    #[error("invalid value {value} for `{field}`: {reason}")]
    InvalidValue {
        /// Name of the offending field.
        field: &'static str,
        /// The rejected value.
        value: f64,
        /// Why the value was rejected.
        reason: &'static str,
    },

    /// The persisted record was written by an incompatible version.
    #[error("unsupported config version {found}, expected {expected}")]
    UnsupportedVersion {
        /// Version found in the record.
        found: u32,
        /// Version this build understands.
        expected: u32,
    },

    /// No named gain snapshot with this name exists.
    #[error("no gain snapshot named `{0}`")]
    UnknownSnapshot(String),

    /// Reading or writing the backing file failed.
    #[error("config storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The stored record is not valid JSON for this schema.
    #[error("config record could not be parsed: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors raised by actuator devices.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// No device matching the name prefix was found.
    #[error("no device found with name prefix `{0}`")]
    NotFound(String),

    /// The device is not connected; control is paused until it reconnects.
    #[error("actuator is disconnected")]
    Disconnected,

    /// The underlying wireless link dropped during an operation.
    #[error("wireless link lost")]
    LinkLost,

    /// Any other transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Errors surfaced by the autopilot facade.
#[derive(Debug, Error)]
pub enum AutopilotError {
    /// A sensor has not produced a reading yet.
    #[error("no {0} reading available yet")]
    SensorUnavailable(&'static str),

    /// Configuration could not be loaded, saved or applied.
    #[error(transparent)]
    Config(#[from] ConfigError),
}
