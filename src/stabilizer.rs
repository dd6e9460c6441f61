// src/stabilizer.rs

//! # Cascaded Stabilizers
//!
//! The heading loop regulates a desired rotation rate and cascades onto the
//! rotation-rate loop, which regulates the motor command. Both loops react
//! to the same heading samples, rate loop first.
//!
//! Either loop can hand its output over to a [`RelayTuner`] for one tuning
//! run. The run's [`TuningResult`] is delivered once through a
//! `tokio::sync::oneshot` channel, whether it converged, timed out or was
//! canceled.

use crate::config::LoopConfig;
use crate::pid::{RelayTuner, TuneConfig, TuningResult};
use log::debug;
use tokio::sync::oneshot;

pub mod heading;
pub use heading::*;
pub mod rate;
pub use rate::*;

/// Below this speed in knots the boat counts as stopped and speed
/// compensation assumes 1 kt.
pub const MIN_SPEED_KT: f64 = 0.01;

/// Half cycles a tuning run may take before it times out.
pub const TUNE_MAX_CYCLES: u32 = 20;

/// Speed used for compensation and rate limits.
pub fn effective_speed_kt(speed_kt: f64) -> f64 {
    if speed_kt > MIN_SPEED_KT {
        speed_kt
    } else {
        1.0
    }
}

/// Scales the loop error by `tune_speed / speed`, so gains tuned at one
/// speed keep the loop gain roughly constant at another.
pub fn speed_multiplier(tune_speed_kt: Option<f64>, speed_kt: f64) -> f64 {
    match tune_speed_kt {
        Some(tune_speed) if tune_speed > 0.0 => tune_speed / effective_speed_kt(speed_kt),
        _ => 1.0,
    }
}

/// Relay parameters for tuning a loop with `config`.
pub fn relay_tune_config(config: &LoopConfig) -> TuneConfig {
    TuneConfig {
        set_point: 0.0,
        step: 1.0,
        max_cycle_count: TUNE_MAX_CYCLES,
        noise_band: config.tune_noise_band,
        allowed_amplitude_variance: config.tune_allowed_variance_pct / 100.0,
        disable_noise_band_after_cycle: config.tune_disable_noise_band_cycles,
    }
}

/// A tuning run in progress and the channel its result goes to.
pub(crate) struct TuningSession {
    pub(crate) tuner: RelayTuner,
    done: oneshot::Sender<TuningResult>,
}

impl TuningSession {
    pub(crate) fn start(config: TuneConfig) -> (Self, oneshot::Receiver<TuningResult>) {
        let (done, receiver) = oneshot::channel();
        let session = Self {
            tuner: RelayTuner::new(config),
            done,
        };
        (session, receiver)
    }

    pub(crate) fn finish(self, result: TuningResult) {
        if self.done.send(result).is_err() {
            debug!("tuning result dropped, nobody is waiting for it");
        }
    }
}
