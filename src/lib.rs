// src/lib.rs

//! # Tiller Autopilot Control Core
//!
//! Cascaded heading and rotation-rate PID control for a self-steering
//! tiller autopilot, with relay-feedback auto-tuning of both loops.
//!
//! Heading samples drive everything. The rotation-rate loop turns heading
//! deltas into a rate and commands the tiller motor; the heading loop sets
//! the rate loop's target so the boat holds a heading. Supporting modules
//! cover the filters, navigation math, GPS speed estimation, the actuator
//! devices (wireless tiller motor and simulated boat), the live
//! configuration and telemetry.

#![deny(missing_docs)]

pub mod autopilot;
pub mod config;
pub mod device;
pub mod error;
pub mod filter;
pub mod navigation;
pub mod pid;
pub mod sensor;
pub mod speed;
pub mod stabilizer;
pub mod telemetry;

#[doc(inline)]
pub use autopilot::Autopilot;
#[doc(inline)]
pub use config::{AutopilotConfig, ConfigHandle, ConfigStore, JsonFileStore, PidGains};
#[doc(inline)]
pub use error::{AutopilotError, ConfigError, DeviceError};
#[doc(inline)]
pub use stabilizer::*;

#[cfg(test)]
mod test_utils;
