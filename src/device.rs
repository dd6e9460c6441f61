// src/device.rs

//! # Actuator Devices
//!
//! Capability traits at the boundary between the control core and whatever
//! moves the tiller, with the wireless tiller motor, the simulated boat and
//! the pulse modulator used to drive binary motors.

use crate::error::DeviceError;
use std::future::Future;
use tokio::sync::watch;

pub mod pulse;
pub use pulse::*;
pub mod simulated;
pub use simulated::*;
pub mod tiller;
pub use tiller::*;

/// Accepts a normalized command in `[-1, 1]`.
///
/// The sign is the direction of travel. Both control loops implement this
/// too, so a tuner can drive either an actuator or an inner loop.
pub trait Controller {
    /// Requests `level`.
    fn command(&mut self, level: f64);

    /// Stops all motion.
    fn stop(&mut self);
}

/// A [`Controller`] that moves physical hardware.
pub trait Actuator: Controller {
    /// `true` while commands can reach the device.
    fn is_connected(&self) -> bool;
}

/// A device reached over a link that can drop and come back.
pub trait ConnectableDevice {
    /// Establishes the link.
    fn connect(&mut self) -> impl Future<Output = Result<(), DeviceError>>;

    /// Tears the link down.
    fn disconnect(&mut self);

    /// Watches the link state.
    fn connection(&self) -> watch::Receiver<bool>;
}
