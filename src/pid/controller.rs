// src/pid/controller.rs

//! # Loop PID Controller
//!
//! This module provides a compute function and control data structure for
//! the timestamp-driven PID used by the heading and rotation-rate loops,
//! plus [`PidController`], which owns the state around it: last update time,
//! previous output, saturation flag and the derivative filter.
//!
//! The three-term arithmetic runs through `piddiy`. The compute callback
//! suspends integration while the loop is saturated and the error would
//! push the output further into saturation.

use crate::config::{Binding, PidGains};
use crate::filter::{Filter, IdentityFilter};
use log::trace;
use piddiy::PidController as PiddiyController;

/// Control data for the loop PID compute callback.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LoopControlData {
    /// The measured process value.
    pub measurement: f64,
    /// Seconds since the previous update, zero on the first update.
    pub dt: f64,
    /// Filtered change in error since the previous update.
    pub derivative_delta: f64,
    /// Keep the integral where it is for this update.
    pub hold_integral: bool,
}

/// Loop PID compute callback.
///
/// A non-positive `dt` contributes neither integral nor derivative.
pub fn compute_loop(
    pid: &mut PiddiyController<f64, LoopControlData>,
    data: LoopControlData,
) -> (f64, f64, f64) {
    let error = pid.set_point - data.measurement;
    let integral = if data.hold_integral || data.dt <= 0.0 {
        pid.integral
    } else {
        pid.integral + error * data.dt
    };
    let derivative = if data.dt > 0.0 {
        data.derivative_delta / data.dt
    } else {
        0.0
    };

    (error, integral, derivative)
}

/// Supplies gains to a [`PidController`] on every update.
pub trait GainSource {
    /// The gains to use for the next update.
    fn gains(&self) -> PidGains;
}

impl GainSource for PidGains {
    fn gains(&self) -> PidGains {
        *self
    }
}

impl GainSource for Binding<PidGains> {
    fn gains(&self) -> PidGains {
        self.get()
    }
}

/// Stateful PID with anti-windup and a pluggable derivative filter.
pub struct PidController<G: GainSource = PidGains> {
    pid: PiddiyController<f64, LoopControlData>,
    gains: G,
    derivative_filter: Box<dyn Filter>,
    previous_output: f64,
    last_update: Option<f64>,
    saturation_reached: bool,
}

impl<G: GainSource> PidController<G> {
    /// Creates a controller targeting zero with no derivative filtering.
    pub fn new(gains: G) -> Self {
        Self::with_derivative_filter(gains, IdentityFilter)
    }

    /// Creates a controller targeting zero whose error deltas pass
    /// through `filter` before differentiation.
    pub fn with_derivative_filter(gains: G, filter: impl Filter + 'static) -> Self {
        let mut pid = PiddiyController::new();
        pid.compute_fn(compute_loop).set_point(0.0);

        PidController {
            pid,
            gains,
            derivative_filter: Box::new(filter),
            previous_output: 0.0,
            last_update: None,
            saturation_reached: false,
        }
    }

    /// Sets the value the controller regulates towards.
    pub fn set_target(&mut self, target: f64) {
        self.pid.set_point(target);
    }

    /// The value the controller regulates towards.
    pub fn target(&self) -> f64 {
        self.pid.set_point
    }

    /// Reports whether the caller had to clamp the last output.
    pub fn set_saturation_reached(&mut self, saturated: bool) {
        self.saturation_reached = saturated;
    }

    /// Accumulated integral of the error, before the integral gain.
    pub fn integral(&self) -> f64 {
        self.pid.integral
    }

    /// Output of the most recent update.
    pub fn previous_output(&self) -> f64 {
        self.previous_output
    }

    /// Runs one control step for the measurement `current` taken at `time_ms`.
    pub fn update(&mut self, current: f64, time_ms: f64) -> f64 {
        let dt = self
            .last_update
            .map_or(0.0, |last| (time_ms - last) / 1000.0);
        let error = self.pid.set_point - current;
        let derivative_delta = self
            .derivative_filter
            .process(error - self.pid.error, time_ms);
        let hold_integral = self.saturation_reached && error * self.previous_output > 0.0;

        let gains = self.gains.gains();
        self.pid.kp(gains.kp).ki(gains.ki).kd(gains.kd);

        let output = self.pid.compute(LoopControlData {
            measurement: current,
            dt,
            derivative_delta,
            hold_integral,
        });
        trace!(
            "pid error={error:.3} integral={:.3} dt={dt:.3} hold={hold_integral} output={output:.3}",
            self.pid.integral
        );

        self.previous_output = output;
        self.last_update = Some(time_ms);
        output
    }
}
