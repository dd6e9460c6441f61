// src/test_utils.rs

//! This module contains utilities for testing.

use crate::device::{Actuator, Controller};

/// A constant defining the tolerance within which floating-point values
/// are considered close enough to be equal.
pub const TEST_TOLERANCE: f64 = 1e-5;

/// Checks if two floating point numbers are close enough to be considered
/// equal.
///
/// # Arguments
/// * `target` - The target value.
/// * `value` - The value to compare against the target.
///
/// # Returns
/// `true` if the absolute difference between `target` and `value` is less than
/// `TEST_TOLERANCE`, otherwise `false`.
pub fn value_close(target: f64, value: f64) -> bool {
    (target - value).abs() < TEST_TOLERANCE
}

/// Checks if two floating point numbers are within `tolerance` of each other.
pub fn value_within(target: f64, value: f64, tolerance: f64) -> bool {
    (target - value).abs() <= tolerance
}

/// An actuator that records every command it receives.
#[derive(Debug, Clone, Default)]
pub struct RecordingActuator {
    /// Every level passed to `command`, in order.
    pub commands: Vec<f64>,
    /// Number of `stop` calls.
    pub stops: usize,
    /// Reported connection state.
    pub connected: bool,
}

impl RecordingActuator {
    /// A connected actuator with no history.
    pub fn connected() -> Self {
        Self {
            connected: true,
            ..Self::default()
        }
    }

    /// The most recent level, zero after a stop or before any command.
    pub fn level(&self) -> f64 {
        self.commands.last().copied().unwrap_or(0.0)
    }
}

impl Controller for RecordingActuator {
    fn command(&mut self, level: f64) {
        self.commands.push(level);
    }

    fn stop(&mut self) {
        self.stops += 1;
        self.commands.push(0.0);
    }
}

impl Actuator for RecordingActuator {
    fn is_connected(&self) -> bool {
        self.connected
    }
}
