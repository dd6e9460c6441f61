// src/pid/tuner.rs

//! # Relay-Feedback Auto-Tuner
//!
//! Drives a [`Controller`] with a bang-bang signal of `±step` around a set
//! point, which makes the closed loop oscillate in a limit cycle. Every
//! switch of the relay closes a half cycle; the first extremum of that half
//! cycle's samples is kept as a peak. Once two pairs of alternate peaks
//! agree within the allowed variance the oscillation is considered stable
//! and the ultimate gain `Ku` and period `Tu` are measured from it:
//!
//! ```text
//! Ku = 4 * (2 * step) / (PI * amplitude)
//! Tu = 2 * (mean spacing of the peaks)
//! ```
//!
//! Seven classic tuning rules are then applied to `Ku` and `Tu`.
//!
//! A tuner serves exactly one run. Once it returns a [`TuningResult`] it
//! ignores further samples.

use crate::config::PidGains;
use crate::device::Controller;
use log::{debug, info, warn};
use std::f64::consts::PI;
use std::fmt;

/// Number of most recent peak extrema used for `Ku` and `Tu`.
pub const LOOK_BACK_SAMPLES: usize = 4;

/// A timestamped process value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    /// Sample time in milliseconds.
    pub time_ms: f64,
    /// Process value.
    pub value: f64,
}

impl Point {
    /// Creates a point.
    pub fn new(time_ms: f64, value: f64) -> Self {
        Self { time_ms, value }
    }
}

/// Parameters of one tuning run.
#[derive(Debug, Clone, PartialEq)]
pub struct TuneConfig {
    /// Value the relay switches around.
    pub set_point: f64,
    /// Relay output magnitude.
    pub step: f64,
    /// Half cycles after which the run gives up.
    pub max_cycle_count: u32,
    /// Relay hysteresis around the set point.
    pub noise_band: f64,
    /// Allowed peak difference as a fraction of the peak amplitude.
    pub allowed_amplitude_variance: f64,
    /// Half cycles after which the hysteresis is dropped.
    pub disable_noise_band_after_cycle: u32,
}

impl Default for TuneConfig {
    fn default() -> Self {
        Self {
            set_point: 0.0,
            step: 1.0,
            max_cycle_count: 5,
            noise_band: 0.0,
            allowed_amplitude_variance: 0.10,
            disable_noise_band_after_cycle: 2,
        }
    }
}

/// Classic gain formulas applied to the ultimate gain and period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TuningRule {
    /// Ziegler-Nichols P.
    P,
    /// Ziegler-Nichols PI.
    Pi,
    /// Ziegler-Nichols PD.
    Pd,
    /// Ziegler-Nichols PID.
    Pid,
    /// PID without overshoot.
    NoOvershoot,
    /// Pessen integral rule.
    Pessen,
    /// PID with some overshoot.
    SomeOvershoot,
}

impl TuningRule {
    /// Every rule, in reporting order.
    pub const ALL: [TuningRule; 7] = [
        TuningRule::P,
        TuningRule::Pi,
        TuningRule::Pd,
        TuningRule::Pid,
        TuningRule::NoOvershoot,
        TuningRule::Pessen,
        TuningRule::SomeOvershoot,
    ];

    /// Display name of the rule.
    pub fn name(self) -> &'static str {
        match self {
            TuningRule::P => "P",
            TuningRule::Pi => "PI",
            TuningRule::Pd => "PD",
            TuningRule::Pid => "PID",
            TuningRule::NoOvershoot => "No Overshoot",
            TuningRule::Pessen => "Pessen",
            TuningRule::SomeOvershoot => "Some Overshoot",
        }
    }

    /// `(c_p, c_i, c_d)` such that `kp = c_p·Ku`, `ki = c_i·Ku/Tu`, `kd = c_d·Ku·Tu`.
    pub fn coefficients(self) -> (f64, f64, f64) {
        match self {
            TuningRule::P => (0.5, 0.0, 0.0),
            TuningRule::Pi => (0.45, 0.54, 0.0),
            TuningRule::Pd => (0.8, 0.0, 0.1),
            TuningRule::Pid => (0.6, 1.2, 0.075),
            TuningRule::NoOvershoot => (0.2, 0.4, 2.0 / 30.0),
            TuningRule::Pessen => (0.7, 1.74, 0.105),
            TuningRule::SomeOvershoot => (1.0 / 3.0, 2.0 / 3.0, 1.0 / 9.0),
        }
    }

    /// Gains for an ultimate gain `ku` and ultimate period `tu` in seconds.
    pub fn gains(self, ku: f64, tu: f64) -> PidGains {
        let (c_p, c_i, c_d) = self.coefficients();
        PidGains::new(c_p * ku, c_i * ku / tu, c_d * ku * tu)
    }
}

impl fmt::Display for TuningRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Gains suggested by a converged run.
#[derive(Debug, Clone, PartialEq)]
pub struct SuggestedGains {
    /// Ultimate gain.
    pub ku: f64,
    /// Ultimate period in seconds.
    pub tu: f64,
    gains: [PidGains; 7],
}

impl SuggestedGains {
    /// Applies every rule to `ku` and `tu`.
    pub fn new(ku: f64, tu: f64) -> Self {
        Self {
            ku,
            tu,
            gains: TuningRule::ALL.map(|rule| rule.gains(ku, tu)),
        }
    }

    /// Gains of one rule.
    pub fn get(&self, rule: TuningRule) -> PidGains {
        self.gains[rule as usize]
    }

    /// Every rule with its gains, in reporting order.
    pub fn iter(&self) -> impl Iterator<Item = (TuningRule, PidGains)> + '_ {
        TuningRule::ALL.into_iter().zip(self.gains.iter().copied())
    }
}

/// How a tuning run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuningOutcome {
    /// The oscillation stabilized and gains were derived.
    Converged,
    /// The cycle limit was exceeded.
    TimedOut,
    /// The run was canceled by the user.
    Canceled,
}

/// Terminal value of one tuning run.
#[derive(Debug, Clone, PartialEq)]
pub struct TuningResult {
    /// `true` only for [`TuningOutcome::Converged`].
    pub success: bool,
    /// How the run ended.
    pub outcome: TuningOutcome,
    /// Human-readable summary.
    pub description: String,
    /// Suggested gains, present on success.
    pub suggested: Option<SuggestedGains>,
}

impl TuningResult {
    /// A successful run.
    pub fn converged(suggested: SuggestedGains) -> Self {
        Self {
            success: true,
            outcome: TuningOutcome::Converged,
            description: "Tuning completed successfully".into(),
            suggested: Some(suggested),
        }
    }

    /// A run that exceeded its cycle limit.
    pub fn timed_out() -> Self {
        Self {
            success: false,
            outcome: TuningOutcome::TimedOut,
            description: "PID tuning timed out without finding consistent results".into(),
            suggested: None,
        }
    }

    /// A run stopped by the user.
    pub fn canceled() -> Self {
        Self {
            success: false,
            outcome: TuningOutcome::Canceled,
            description: "PID tuning canceled".into(),
            suggested: None,
        }
    }
}

/// Relay-feedback tuning state machine.
#[derive(Debug, Clone)]
pub struct RelayTuner {
    config: TuneConfig,
    history: Vec<Point>,
    peaks: Vec<Point>,
    last_command: f64,
    cycles_completed: u32,
    stepping_up: bool,
    finished: bool,
}

impl RelayTuner {
    /// Starts a run.
    pub fn new(config: TuneConfig) -> Self {
        debug!("relay tuner started: {config:?}");
        Self {
            config,
            history: Vec::new(),
            peaks: Vec::new(),
            last_command: 0.0,
            cycles_completed: 0,
            stepping_up: false,
            finished: false,
        }
    }

    /// Half cycles completed so far.
    pub fn cycles_completed(&self) -> u32 {
        self.cycles_completed
    }

    /// The relay output sent with the most recent sample.
    pub fn last_command(&self) -> f64 {
        self.last_command
    }

    /// `true` once a result has been returned.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feeds one process sample and drives `driven` with the relay output.
    ///
    /// Returns the result when the run converges or times out; in both cases
    /// `driven` has been stopped.
    pub fn sensor_value_updated<C: Controller + ?Sized>(
        &mut self,
        value: f64,
        time_ms: f64,
        driven: &mut C,
    ) -> Option<TuningResult> {
        if self.finished {
            return None;
        }

        let noise_band = if self.cycles_completed >= self.config.disable_noise_band_after_cycle {
            0.0
        } else {
            self.config.noise_band
        };

        if self.stepping_up && value > self.config.set_point + noise_band {
            self.stepping_up = false;
        } else if !self.stepping_up && value < self.config.set_point - noise_band {
            self.stepping_up = true;
        }

        let command = if self.stepping_up {
            self.config.step
        } else {
            -self.config.step
        };

        if command != self.last_command {
            self.cycles_completed += 1;
            if let Some(peak) = find_local_extrema(&self.history).first() {
                self.peaks.push(*peak);
            }
            self.history.clear();
            debug!(
                "relay switched to {command} after {} half cycles, {} peaks",
                self.cycles_completed,
                self.peaks.len()
            );

            if let Some(suggested) = self.check_convergence() {
                driven.stop();
                self.finished = true;
                info!(
                    "tuning converged: Ku={:.4} Tu={:.3}s",
                    suggested.ku, suggested.tu
                );
                return Some(TuningResult::converged(suggested));
            }
        }
        self.last_command = command;
        self.history.push(Point::new(time_ms, value));

        if self.cycles_completed > self.config.max_cycle_count {
            driven.stop();
            self.finished = true;
            warn!(
                "tuning timed out after {} half cycles",
                self.cycles_completed
            );
            return Some(TuningResult::timed_out());
        }

        driven.command(command);
        None
    }

    fn check_convergence(&mut self) -> Option<SuggestedGains> {
        if self.peaks.len() < 4 {
            return None;
        }

        let peak1_delta = (self.peaks[0].value - self.peaks[2].value).abs();
        let peak2_delta = (self.peaks[1].value - self.peaks[3].value).abs();
        let max = self.peaks.iter().map(|p| p.value).fold(f64::MIN, f64::max);
        let min = self.peaks.iter().map(|p| p.value).fold(f64::MAX, f64::min);
        let amplitude = max - min;

        if amplitude > 0.0 {
            let allowed = self.config.allowed_amplitude_variance;
            if peak1_delta / amplitude <= allowed && peak2_delta / amplitude <= allowed {
                let extrema = find_local_extrema(&self.peaks);
                if let Some((ku, tu)) =
                    relay_ultimate_parameters(&extrema, self.config.step * 2.0, LOOK_BACK_SAMPLES)
                {
                    return Some(SuggestedGains::new(ku, tu));
                }
            }
        }

        let excess = self.peaks.len() - 3;
        self.peaks.drain(..excess);
        None
    }
}

/// Finds local extrema of a sampled series.
///
/// A point strictly above or below both neighbours is an extremum. A run of
/// equal values bounded on both sides by strictly lower (or strictly
/// higher) values reports one extremum at the middle of the run; a run
/// that is followed by a continuation of the trend is discarded.
pub fn find_local_extrema(points: &[Point]) -> Vec<Point> {
    let mut extrema = Vec::new();
    let mut run_start: Option<usize> = None;

    for i in 1..points.len().saturating_sub(1) {
        let prev = points[i - 1].value;
        let current = points[i].value;
        let next = points[i + 1].value;

        if let Some(start) = run_start {
            let before_run = points[start - 1].value;
            let midpoint = points[(i + start + 1) / 2];
            if (current < before_run && current < next) || (current > before_run && current > next)
            {
                extrema.push(midpoint);
                run_start = None;
            } else if points[start].value != current {
                run_start = None;
            }
        }

        if (current < prev && current < next) || (current > prev && current > next) {
            extrema.push(points[i]);
        } else if current == next && current != prev && run_start.is_none() {
            run_start = Some(i);
        }
    }

    extrema
}

/// Ultimate gain and period from alternating extrema of a relay oscillation.
///
/// Uses the last `look_back` extrema, or all of them if fewer. Returns
/// `None` when fewer than two extrema are available or they show no
/// amplitude.
pub fn relay_ultimate_parameters(
    extrema: &[Point],
    control_amplitude: f64,
    look_back: usize,
) -> Option<(f64, f64)> {
    let recent = &extrema[extrema.len().saturating_sub(look_back)..];
    let (first, last) = (recent.first()?, recent.last()?);
    if recent.len() < 2 {
        return None;
    }

    let intervals = (recent.len() - 1) as f64;
    let period = 2.0 * ((last.time_ms - first.time_ms) / intervals) / 1000.0;
    let amplitude = recent
        .windows(2)
        .map(|pair| (pair[1].value - pair[0].value).abs())
        .sum::<f64>()
        / intervals;

    if amplitude <= 0.0 || period <= 0.0 {
        return None;
    }

    let ku = 4.0 * control_amplitude / (PI * amplitude);
    Some((ku, period))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use std::collections::VecDeque;

    fn points(values: &[f64]) -> Vec<Point> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| Point::new(i as f64 * 100.0, *v))
            .collect()
    }

    /// Test strict local extrema.
    #[test]
    fn test_find_local_extrema_simple() {
        let series = points(&[10.0, 15.0, 12.0, 8.0, 11.0, 16.0]);
        let extrema = find_local_extrema(&series);
        assert_eq!(extrema, vec![series[1], series[3]]);
    }

    /// Test that plateaus report their midpoint and trend continuations are dropped.
    #[test]
    fn test_find_local_extrema_flat_runs() {
        let series = points(&[
            0.0, 1.0, 2.0, 2.0, 2.0, 1.0, 3.0, 3.0, 4.0, 5.0, 4.0, -1.0, -1.0, -1.0, 0.0,
        ]);
        let extrema = find_local_extrema(&series);
        let indices: Vec<usize> = extrema
            .iter()
            .map(|p| (p.time_ms / 100.0) as usize)
            .collect();
        // Plateau 2..=4 reports 3, the rising 3,3 run is dropped, plateau 11..=13 reports 12.
        assert_eq!(indices, vec![3, 5, 9, 12]);
    }

    /// Test that a short series has no extrema.
    #[test]
    fn test_find_local_extrema_short_series() {
        assert!(find_local_extrema(&[]).is_empty());
        assert!(find_local_extrema(&points(&[1.0, 2.0])).is_empty());
    }

    /// Test the rule table against hand-computed gains.
    #[test]
    fn test_tuning_rules() {
        let suggested = SuggestedGains::new(2.0, 4.0);
        let pid = suggested.get(TuningRule::Pid);
        assert!(value_close(1.2, pid.kp));
        assert!(value_close(0.6, pid.ki));
        assert!(value_close(0.6, pid.kd));

        let no_overshoot = suggested.get(TuningRule::NoOvershoot);
        assert!(value_close(0.4, no_overshoot.kp));
        assert!(value_close(0.2, no_overshoot.ki));
        assert!(value_close(8.0 / 15.0, no_overshoot.kd));

        let p = suggested.get(TuningRule::P);
        assert_eq!(p, PidGains::new(1.0, 0.0, 0.0));
        assert_eq!(suggested.iter().count(), 7);
    }

    /// Delayed integrator driven by the relay; each tick the plant
    /// integrates the command issued two ticks earlier.
    struct DelayedIntegrator {
        value: f64,
        pipeline: VecDeque<f64>,
    }

    impl DelayedIntegrator {
        fn new() -> Self {
            Self {
                value: 0.0,
                pipeline: VecDeque::from(vec![0.0, 0.0]),
            }
        }

        fn step(&mut self, command: f64) {
            self.pipeline.push_back(command);
            self.value += self.pipeline.pop_front().unwrap_or(0.0);
        }
    }

    fn run_tuner(config: TuneConfig) -> (TuningResult, RecordingActuator, f64) {
        let mut tuner = RelayTuner::new(config);
        let mut plant = DelayedIntegrator::new();
        let mut actuator = RecordingActuator::connected();

        for tick in 0..500 {
            let time = tick as f64 * 100.0;
            if let Some(result) = tuner.sensor_value_updated(plant.value, time, &mut actuator) {
                return (result, actuator, time);
            }
            plant.step(actuator.level());
        }
        panic!("tuner never finished");
    }

    fn triangle_config() -> TuneConfig {
        TuneConfig {
            set_point: 0.0,
            step: 1.0,
            max_cycle_count: 20,
            noise_band: 5.0,
            allowed_amplitude_variance: 0.10,
            disable_noise_band_after_cycle: 100,
        }
    }

    /// Test convergence on a triangle wave and the derived Ku/Tu.
    #[test]
    fn test_relay_tuner_converges_on_delayed_integrator() {
        let (result, actuator, time) = run_tuner(triangle_config());

        assert!(result.success);
        assert_eq!(result.outcome, TuningOutcome::Converged);
        assert_eq!(time, 7_200.0);
        assert_eq!(actuator.stops, 1);

        let suggested = result.suggested.unwrap();
        // Peaks alternate between +8 and -8, 1.6 s apart.
        assert!(value_close(3.2, suggested.tu));
        assert!(value_close(1.0 / (2.0 * PI), suggested.ku));

        let pid = suggested.get(TuningRule::Pid);
        assert!(value_close(0.6 * suggested.ku, pid.kp));
        assert!(value_close(1.2 * suggested.ku / 3.2, pid.ki));
        assert!(value_close(0.075 * suggested.ku * 3.2, pid.kd));
    }

    /// Test that exceeding the cycle limit times out and stops the driven controller.
    #[test]
    fn test_relay_tuner_times_out() {
        let config = TuneConfig {
            max_cycle_count: 4,
            ..triangle_config()
        };
        let (result, actuator, time) = run_tuner(config);

        assert!(!result.success);
        assert_eq!(result.outcome, TuningOutcome::TimedOut);
        assert!(result.suggested.is_none());
        assert!(result.description.contains("timed out"));
        assert_eq!(time, 5_600.0);
        assert_eq!(actuator.stops, 1);
    }

    /// Test that a finished tuner ignores further samples.
    #[test]
    fn test_relay_tuner_ignores_samples_after_finish() {
        let mut tuner = RelayTuner::new(TuneConfig {
            max_cycle_count: 0,
            ..TuneConfig::default()
        });
        let mut actuator = RecordingActuator::connected();

        let result = tuner.sensor_value_updated(-1.0, 0.0, &mut actuator);
        assert_eq!(result.map(|r| r.outcome), Some(TuningOutcome::TimedOut));
        assert!(tuner.is_finished());

        let commands = actuator.commands.len();
        assert!(tuner.sensor_value_updated(5.0, 100.0, &mut actuator).is_none());
        assert_eq!(actuator.commands.len(), commands);
    }

    /// Test the relay switches with hysteresis around the set point.
    #[test]
    fn test_relay_tuner_hysteresis() {
        let mut tuner = RelayTuner::new(TuneConfig {
            noise_band: 1.0,
            max_cycle_count: 100,
            disable_noise_band_after_cycle: 100,
            ..TuneConfig::default()
        });
        let mut actuator = RecordingActuator::connected();

        for (i, value) in [0.0, -0.5, -1.5, 0.5, 1.5].iter().enumerate() {
            tuner.sensor_value_updated(*value, i as f64 * 100.0, &mut actuator);
        }
        assert_eq!(actuator.commands, vec![-1.0, -1.0, 1.0, 1.0, -1.0]);
        assert_eq!(tuner.cycles_completed(), 3);
    }
}
