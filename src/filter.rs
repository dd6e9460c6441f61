// src/filter.rs

//! # Low-Pass Filter Chain
//!
//! Single-pole low-pass filters over irregularly sampled signals, their
//! N-stage cascade, and a pass-through used to disable derivative filtering.
//! Times are in milliseconds; the filter derives `dt` from successive
//! timestamps, so the sample cadence does not need to be fixed.

use crate::config::Binding;
use crate::error::ConfigError;
use std::f64::consts::TAU;

/// A causal filter over timestamped samples.
pub trait Filter {
    /// Feeds one sample and returns the filtered value.
    fn process(&mut self, input: f64, time_ms: f64) -> f64;
}

/// Where a low-pass filter reads its cutoff frequency from.
#[derive(Debug, Clone)]
pub enum Cutoff {
    /// A cutoff fixed at construction, in Hz.
    Fixed(f64),
    /// A cutoff read from the live configuration on every sample.
    Live(Binding<f64>),
}

impl Cutoff {
    fn hz(&self) -> f64 {
        match self {
            Cutoff::Fixed(hz) => *hz,
            Cutoff::Live(binding) => binding.get(),
        }
    }
}

/// Single-pole RC low-pass filter.
#[derive(Debug, Clone)]
pub struct LowPassFilter {
    cutoff: Cutoff,
    previous: Option<(f64, f64)>,
}

impl LowPassFilter {
    /// Creates a filter with a fixed cutoff frequency in Hz.
    pub fn new(cutoff_hz: f64) -> Result<Self, ConfigError> {
        if !(cutoff_hz.is_finite() && cutoff_hz > 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "cutoff_hz",
                value: cutoff_hz,
                reason: "cutoff frequency must be positive",
            });
        }
        Ok(Self::with_cutoff(Cutoff::Fixed(cutoff_hz)))
    }

    /// Creates a filter whose cutoff follows the live configuration.
    ///
    /// The configuration handle validates the bound value on every write.
    pub fn live(cutoff: Binding<f64>) -> Self {
        Self::with_cutoff(Cutoff::Live(cutoff))
    }

    fn with_cutoff(cutoff: Cutoff) -> Self {
        Self {
            cutoff,
            previous: None,
        }
    }
}

impl Filter for LowPassFilter {
    fn process(&mut self, input: f64, time_ms: f64) -> f64 {
        let Some((previous_output, previous_time)) = self.previous else {
            self.previous = Some((input, time_ms));
            return input;
        };

        let rc = 1.0 / (TAU * self.cutoff.hz());
        let dt = (time_ms - previous_time) / 1000.0;
        let alpha = dt / (rc + dt);

        let output = alpha * input + (1.0 - alpha) * previous_output;
        self.previous = Some((output, time_ms));
        output
    }
}

/// Identical low-pass filters applied in series.
#[derive(Debug, Clone)]
pub struct ChainedFilter {
    stages: Vec<LowPassFilter>,
}

impl ChainedFilter {
    /// Creates `stages` filters with a fixed cutoff in Hz.
    pub fn new(cutoff_hz: f64, stages: usize) -> Result<Self, ConfigError> {
        check_stages(stages)?;
        let stage = LowPassFilter::new(cutoff_hz)?;
        Ok(Self {
            stages: vec![stage; stages],
        })
    }

    /// Creates `stages` filters sharing a live cutoff.
    pub fn live(cutoff: Binding<f64>, stages: usize) -> Result<Self, ConfigError> {
        check_stages(stages)?;
        Ok(Self {
            stages: vec![LowPassFilter::live(cutoff); stages],
        })
    }
}

fn check_stages(stages: usize) -> Result<(), ConfigError> {
    if stages == 0 {
        return Err(ConfigError::InvalidValue {
            field: "stages",
            value: 0.0,
            reason: "at least one filter stage is required",
        });
    }
    Ok(())
}

impl Filter for ChainedFilter {
    fn process(&mut self, input: f64, time_ms: f64) -> f64 {
        self.stages
            .iter_mut()
            .fold(input, |value, stage| stage.process(value, time_ms))
    }
}

/// Passes samples through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityFilter;

impl Filter for IdentityFilter {
    fn process(&mut self, input: f64, _time_ms: f64) -> f64 {
        input
    }
}
