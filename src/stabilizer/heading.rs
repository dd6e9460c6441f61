// src/stabilizer/heading.rs

//! # Heading Stabilizer
//!
//! The outer loop. It regulates the desired rotation rate of the
//! [`RateStabilizer`] so the boat holds a heading. The signed heading error
//! is low-pass filtered and fed to a PID with a target of zero, so a boat
//! sitting to the right of its course (heading above the desired one) asks
//! for a positive rotation rate, which brings the heading down.
//!
//! The output is clamped to the rate loop's current limit. A tuning run
//! hands the output to a relay tuner that drives the rate loop through its
//! [`Controller`] interface.

use crate::config::{Binding, ConfigHandle, NamedPidConfig, PidGains};
use crate::device::Controller;
use crate::error::AutopilotError;
use crate::filter::{Filter, LowPassFilter};
use crate::navigation::{normalize_heading, normalized_angle_delta, HeadingHistory};
use crate::pid::{PidController, SuggestedGains, TuningResult, TuningRule};
use crate::sensor::HeadingSample;
use crate::stabilizer::{relay_tune_config, speed_multiplier, RateStabilizer, TuningSession};
use crate::telemetry::{TelemetryRecord, TelemetrySink};
use log::{info, trace, warn};
use std::cell::RefCell;
use std::rc::Rc;
use tokio::sync::oneshot;

/// Significant digits kept in tuned heading gains.
pub const TUNED_GAIN_DIGITS: i32 = 4;

/// Rounds `value` to `digits` significant digits.
pub fn round_significant(value: f64, digits: i32) -> f64 {
    if value == 0.0 || !value.is_finite() {
        return value;
    }
    let magnitude = value.abs().log10().floor() as i32;
    let factor = 10f64.powi(digits - 1 - magnitude);
    (value * factor).round() / factor
}

/// Holds the boat on a heading by steering the rotation-rate loop.
pub struct HeadingStabilizer {
    config: ConfigHandle,
    rate: Rc<RefCell<RateStabilizer>>,
    telemetry: Rc<dyn TelemetrySink>,
    history: HeadingHistory,
    error_filter: LowPassFilter,
    pid: PidController<Binding<PidGains>>,
    tuning: Option<TuningSession>,
    last_time_ms: Option<f64>,
    desired: f64,
    enabled: bool,
}

impl HeadingStabilizer {
    /// Creates a disabled loop cascading onto `rate`.
    pub fn new(
        config: ConfigHandle,
        rate: Rc<RefCell<RateStabilizer>>,
        telemetry: Rc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            error_filter: error_filter(&config),
            pid: heading_pid(&config),
            config,
            rate,
            telemetry,
            history: HeadingHistory::new(),
            tuning: None,
            last_time_ms: None,
            desired: 0.0,
            enabled: false,
        }
    }

    /// Desired heading in degrees.
    pub fn desired(&self) -> f64 {
        self.desired
    }

    /// Sets the desired heading.
    pub fn set_desired(&mut self, heading: f64) {
        self.desired = normalize_heading(heading);
    }

    /// Turns the desired heading by `delta` degrees and returns the new one.
    pub fn adjust_desired_heading(&mut self, delta: f64) -> f64 {
        self.set_desired(self.desired + delta);
        self.desired
    }

    /// `true` only while both loops are engaged.
    pub fn enabled(&self) -> bool {
        self.enabled && self.rate.borrow().enabled()
    }

    /// Engages or disengages both loops.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.rate.borrow_mut().set_enabled(enabled);
    }

    /// `true` while a tuning run is active.
    pub fn is_tuning(&self) -> bool {
        self.tuning.is_some()
    }

    /// Circular mean of the recent headings.
    pub fn average_heading(&self) -> Option<f64> {
        self.history.average()
    }

    /// Holds the current (averaged) heading and engages both loops.
    ///
    /// Returns the heading now held.
    pub fn maintain_current_heading(&mut self) -> Result<f64, AutopilotError> {
        self.hold_average()?;
        self.set_enabled(true);
        info!("holding heading {:.1}", self.desired);
        Ok(self.desired)
    }

    fn hold_average(&mut self) -> Result<(), AutopilotError> {
        let average = self
            .history
            .average()
            .ok_or(AutopilotError::SensorUnavailable("heading"))?;
        self.desired = average;
        self.error_filter = error_filter(&self.config);
        self.pid = heading_pid(&self.config);
        Ok(())
    }

    /// Processes one heading sample.
    ///
    /// A sample not later than the previous one is ignored.
    pub fn on_heading(&mut self, sample: HeadingSample) {
        if self.last_time_ms.is_some_and(|last| sample.time_ms <= last) {
            trace!("heading sample without time progress skipped");
            return;
        }
        self.last_time_ms = Some(sample.time_ms);
        self.history.push(sample.heading);
        let error_raw = normalized_angle_delta(self.desired, sample.heading);
        let error_filtered = self.error_filter.process(error_raw, sample.time_ms);

        let command = match self.tuning.take() {
            Some(mut session) => {
                let result = session.tuner.sensor_value_updated(
                    error_filtered,
                    sample.time_ms,
                    &mut *self.rate.borrow_mut(),
                );
                let command = session.tuner.last_command();
                match result {
                    Some(result) => self.finish_tuning(session, result),
                    None => self.tuning = Some(session),
                }
                command
            }
            None => self.regulate(error_filtered, sample.time_ms),
        };

        self.telemetry.record(TelemetryRecord::Heading {
            time_ms: sample.time_ms,
            desired: self.desired,
            raw: sample.heading,
            error_raw,
            error_filtered,
            command,
            enabled: self.enabled(),
            average: self.history.average(),
        });
    }

    fn regulate(&mut self, error_filtered: f64, time_ms: f64) -> f64 {
        let (speed_kt, max_rate) = {
            let rate = self.rate.borrow();
            (rate.speed_kt(), rate.max_rotation_rate())
        };
        let tune_speed = self.config.read(|c| c.heading.tune_speed_kt);
        let multiplier = speed_multiplier(tune_speed, speed_kt);

        let raw_command = self.pid.update(error_filtered * multiplier, time_ms);
        self.pid.set_saturation_reached(raw_command.abs() > max_rate);
        let command = raw_command.clamp(-max_rate, max_rate);

        if self.enabled {
            self.rate.borrow_mut().set_desired(command);
        }
        command
    }

    /// Starts a tuning run around the current heading.
    ///
    /// Both loops are disengaged; the tuner engages the rate loop itself.
    /// A heading or rate tuning run already in progress is canceled first.
    pub fn start_tuning(&mut self) -> Result<oneshot::Receiver<TuningResult>, AutopilotError> {
        self.hold_average()?;
        if let Some(session) = self.tuning.take() {
            session.finish(TuningResult::canceled());
        }
        {
            let mut rate = self.rate.borrow_mut();
            if rate.is_tuning() {
                rate.cancel_tuning();
            }
        }
        self.set_enabled(false);

        let tune = self.config.read(|c| relay_tune_config(&c.heading));
        let (session, receiver) = TuningSession::start(tune);
        self.tuning = Some(session);
        info!("heading tuning started around {:.1}", self.desired);
        Ok(receiver)
    }

    /// Cancels the tuning run, if any, and stops the rate loop.
    pub fn cancel_tuning(&mut self) {
        self.rate.borrow_mut().stop();
        if let Some(session) = self.tuning.take() {
            info!("heading tuning canceled");
            session.finish(TuningResult::canceled());
        }
    }

    fn finish_tuning(&mut self, session: TuningSession, result: TuningResult) {
        match &result.suggested {
            Some(suggested) => {
                self.rate.borrow_mut().command(0.0);
                self.apply_tuned_gains(suggested);
                if let Err(e) = self.maintain_current_heading() {
                    warn!("could not resume heading hold after tuning: {e}");
                }
            }
            None => self.rate.borrow_mut().stop(),
        }
        session.finish(result);
    }

    fn apply_tuned_gains(&mut self, suggested: &SuggestedGains) {
        let p = suggested.get(TuningRule::P);
        let gains = PidGains::new(
            round_significant(p.kp, TUNED_GAIN_DIGITS),
            round_significant(p.ki, TUNED_GAIN_DIGITS),
            round_significant(p.kd, TUNED_GAIN_DIGITS),
        );
        let speed_kt = self.rate.borrow().speed_kt();

        let applied = self.config.update(|c| {
            let mut snapshots: Vec<NamedPidConfig> = suggested
                .iter()
                .map(|(rule, rule_gains)| NamedPidConfig {
                    name: format!("{rule} Ku {:.4} Tu {:.2}", suggested.ku, suggested.tu),
                    gains: rule_gains,
                    low_pass_hz: c.heading.low_pass_hz,
                    derivative_low_pass_hz: c.heading.derivative_low_pass_hz,
                })
                .collect();
            snapshots.append(&mut c.heading_snapshots);
            c.heading_snapshots = snapshots;
            c.heading.gains = gains;
            c.heading.tune_speed_kt = Some(speed_kt);
        });
        match applied {
            Ok(()) => info!("heading gains tuned at {speed_kt:.2} kt: {gains:?}"),
            Err(e) => warn!("tuned heading gains rejected: {e}"),
        }
    }
}

fn error_filter(config: &ConfigHandle) -> LowPassFilter {
    LowPassFilter::live(config.bind(|c| c.heading.low_pass_hz))
}

fn heading_pid(config: &ConfigHandle) -> PidController<Binding<PidGains>> {
    PidController::with_derivative_filter(
        config.bind(|c| c.heading.gains),
        LowPassFilter::live(config.bind(|c| c.heading.derivative_low_pass_hz)),
    )
}
