// src/stabilizer/rate.rs

//! # Rotation-Rate Stabilizer
//!
//! The inner loop. Every heading sample turns into a rotation rate, taken
//! from the heading change since the previous sample and positive when the
//! heading decreases, which is the way a positive tiller command turns the
//! boat. The rate is low-pass filtered and compared against the desired
//! rate, clamped to what the boat can do at its current speed:
//!
//! ```text
//! max_rate = max_turn_rate_deg_per_sec_per_kt * speed_kt
//! error    = filtered_rate - clamp(desired, -max_rate, max_rate)
//! command  = clamp(pid(error * tune_speed / speed), -1, 1)
//! ```
//!
//! Gains and filter cutoffs are read live from the configuration. While a
//! tuning run is active the relay tuner drives the motor instead of the PID.

use crate::config::{Binding, ConfigHandle, PidGains};
use crate::device::{Actuator, Controller};
use crate::error::ConfigError;
use crate::filter::{ChainedFilter, Filter, LowPassFilter};
use crate::navigation::normalized_angle_delta;
use crate::pid::{PidController, TuningResult, TuningRule};
use crate::sensor::{HeadingSample, SpeedSensor};
use crate::stabilizer::{
    effective_speed_kt, relay_tune_config, speed_multiplier, TuningSession,
};
use crate::telemetry::{TelemetryRecord, TelemetrySink};
use log::{debug, info, trace, warn};
use std::cell::RefCell;
use std::rc::Rc;
use tokio::sync::oneshot;

/// Delay between disabling the loop and zeroing the motor, in milliseconds.
pub const STOP_DEBOUNCE_MS: f64 = 100.0;

/// Regulates the boat's rotation rate through the tiller motor.
pub struct RateStabilizer {
    config: ConfigHandle,
    motor: Rc<RefCell<dyn Actuator>>,
    speed: Rc<dyn SpeedSensor>,
    telemetry: Rc<dyn TelemetrySink>,
    pid: PidController<Binding<PidGains>>,
    filter: ChainedFilter,
    tuning: Option<TuningSession>,
    previous: Option<HeadingSample>,
    desired: f64,
    enabled: bool,
    pending_stop_at: Option<f64>,
    last_time: Option<f64>,
}

impl RateStabilizer {
    /// Creates a disabled loop with a desired rate of zero.
    pub fn new(
        config: ConfigHandle,
        motor: Rc<RefCell<dyn Actuator>>,
        speed: Rc<dyn SpeedSensor>,
        telemetry: Rc<dyn TelemetrySink>,
    ) -> Result<Self, ConfigError> {
        let stages = config.read(|c| c.rotation_filter_stages);
        let filter = ChainedFilter::live(config.bind(|c| c.rotation.low_pass_hz), stages)?;
        let pid = rate_pid(&config);
        Ok(Self {
            config,
            motor,
            speed,
            telemetry,
            pid,
            filter,
            tuning: None,
            previous: None,
            desired: 0.0,
            enabled: false,
            pending_stop_at: None,
            last_time: None,
        })
    }

    /// Desired rotation rate in degrees per second, before clamping.
    pub fn desired(&self) -> f64 {
        self.desired
    }

    /// Sets the desired rotation rate without changing the enabled flag.
    pub fn set_desired(&mut self, rate: f64) {
        self.desired = rate;
    }

    /// `true` while the loop drives the motor.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Engages or disengages the loop.
    ///
    /// Disengaging zeroes the motor after [`STOP_DEBOUNCE_MS`], unless the
    /// loop was engaged again or a tuning run started in the meantime.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if enabled {
            self.pending_stop_at = None;
            return;
        }
        match self.last_time {
            Some(now_ms) => self.pending_stop_at = Some(now_ms + STOP_DEBOUNCE_MS),
            None => self.motor.borrow_mut().command(0.0),
        }
    }

    /// `true` while a tuning run is active.
    pub fn is_tuning(&self) -> bool {
        self.tuning.is_some()
    }

    /// Boat speed in knots, as reported by the speed sensor.
    pub fn speed_kt(&self) -> f64 {
        self.speed.speed_kt()
    }

    /// Largest rotation rate the loop will ask for at the current speed.
    pub fn max_rotation_rate(&self) -> f64 {
        let per_kt = self.config.read(|c| c.max_turn_rate_deg_per_sec_per_kt);
        per_kt * effective_speed_kt(self.speed_kt())
    }

    /// Processes one heading sample.
    pub fn on_heading(&mut self, sample: HeadingSample) {
        let Some(previous) = self.previous.replace(sample) else {
            self.last_time = Some(sample.time_ms);
            return;
        };
        let dt = (sample.time_ms - previous.time_ms) / 1000.0;
        if dt <= 0.0 {
            trace!("heading sample without time progress skipped");
            self.previous = Some(previous);
            return;
        }
        self.last_time = Some(sample.time_ms);

        let raw = -normalized_angle_delta(sample.heading, previous.heading) / dt;
        let filtered = self.filter.process(raw, sample.time_ms);
        let max_rate = self.max_rotation_rate();
        let error = filtered - self.desired.clamp(-max_rate, max_rate);

        let command = match self.tuning.take() {
            Some(mut session) => {
                let result = session.tuner.sensor_value_updated(
                    filtered,
                    sample.time_ms,
                    &mut *self.motor.borrow_mut(),
                );
                let command = session.tuner.last_command();
                match result {
                    Some(result) => self.finish_tuning(session, result),
                    None => self.tuning = Some(session),
                }
                command
            }
            None => self.regulate(error, sample.time_ms),
        };

        self.poll(sample.time_ms);

        self.telemetry.record(TelemetryRecord::Rate {
            time_ms: sample.time_ms,
            desired: self.desired,
            raw,
            filtered,
            error,
            command,
        });
    }

    fn regulate(&mut self, error: f64, time_ms: f64) -> f64 {
        let tune_speed = self.config.read(|c| c.rotation.tune_speed_kt);
        let multiplier = speed_multiplier(tune_speed, self.speed_kt());

        let raw_command = self.pid.update(error * multiplier, time_ms);
        self.pid.set_saturation_reached(raw_command.abs() >= 1.0);
        let command = raw_command.clamp(-1.0, 1.0);

        let mut motor = self.motor.borrow_mut();
        if self.enabled && motor.is_connected() {
            motor.command(command);
        }
        command
    }

    /// Issues a pending stop whose debounce has elapsed at `now_ms`.
    pub fn poll(&mut self, now_ms: f64) {
        let Some(deadline) = self.pending_stop_at else {
            return;
        };
        if now_ms < deadline {
            return;
        }
        self.pending_stop_at = None;
        if !self.enabled && self.tuning.is_none() {
            debug!("rate loop disengaged, zeroing motor");
            self.motor.borrow_mut().command(0.0);
        }
    }

    /// Starts a tuning run that drives the motor directly.
    ///
    /// A run already in progress is canceled first. The loop is left
    /// disengaged with a desired rate of zero.
    pub fn start_tuning(&mut self) -> oneshot::Receiver<TuningResult> {
        if let Some(session) = self.tuning.take() {
            session.finish(TuningResult::canceled());
        }
        let tune = self.config.read(|c| relay_tune_config(&c.rotation));
        self.desired = 0.0;
        self.enabled = false;
        self.pending_stop_at = None;
        self.pid = rate_pid(&self.config);

        let (session, receiver) = TuningSession::start(tune);
        self.tuning = Some(session);
        info!("rotation rate tuning started");
        receiver
    }

    /// Cancels the tuning run, if any, and zeroes the motor.
    pub fn cancel_tuning(&mut self) {
        self.motor.borrow_mut().command(0.0);
        if let Some(session) = self.tuning.take() {
            info!("rotation rate tuning canceled");
            session.finish(TuningResult::canceled());
        }
    }

    fn finish_tuning(&mut self, session: TuningSession, result: TuningResult) {
        self.motor.borrow_mut().command(0.0);

        if let Some(suggested) = &result.suggested {
            let gains = suggested.get(TuningRule::Pid);
            let speed_kt = self.speed_kt();
            let applied = self.config.update(|c| {
                c.rotation.gains = gains;
                c.rotation.tune_speed_kt = Some(speed_kt);
            });
            match applied {
                Ok(()) => info!("rotation gains tuned at {speed_kt:.2} kt: {gains:?}"),
                Err(e) => warn!("tuned rotation gains rejected: {e}"),
            }
            self.pid = rate_pid(&self.config);
        }

        session.finish(result);
    }
}

impl Controller for RateStabilizer {
    fn command(&mut self, level: f64) {
        self.desired = level;
        self.set_enabled(true);
    }

    fn stop(&mut self) {
        self.set_enabled(false);
        self.motor.borrow_mut().stop();
    }
}

fn rate_pid(config: &ConfigHandle) -> PidController<Binding<PidGains>> {
    PidController::with_derivative_filter(
        config.bind(|c| c.rotation.gains),
        LowPassFilter::live(config.bind(|c| c.rotation.derivative_low_pass_hz)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AutopilotConfig;
    use crate::navigation::{kt_to_mps, normalize_heading};
    use crate::pid::TuningOutcome;
    use crate::telemetry::MemorySink;
    use crate::test_utils::*;
    use approx::assert_abs_diff_eq;
    use std::collections::VecDeque;
    use std::f64::consts::PI;

    struct FixedSpeed(f64);

    impl SpeedSensor for FixedSpeed {
        fn speed_mps(&self) -> f64 {
            kt_to_mps(self.0)
        }
    }

    struct Fixture {
        config: ConfigHandle,
        motor: Rc<RefCell<RecordingActuator>>,
        sink: Rc<MemorySink>,
        rate: RateStabilizer,
    }

    fn fixture(config: AutopilotConfig, speed_kt: f64) -> Fixture {
        let config = ConfigHandle::new(config).unwrap();
        let motor = Rc::new(RefCell::new(RecordingActuator::connected()));
        let sink = Rc::new(MemorySink::new());
        let rate = RateStabilizer::new(
            config.clone(),
            motor.clone(),
            Rc::new(FixedSpeed(speed_kt)),
            sink.clone(),
        )
        .unwrap();
        Fixture {
            config,
            motor,
            sink,
            rate,
        }
    }

    fn proportional(kp: f64) -> AutopilotConfig {
        let mut config = AutopilotConfig::default();
        config.rotation.gains = PidGains::new(kp, 0.0, 0.0);
        config
    }

    fn last_rate_record(sink: &MemorySink) -> (f64, f64, f64, f64) {
        match sink.records().last() {
            Some(TelemetryRecord::Rate {
                raw,
                filtered,
                error,
                command,
                ..
            }) => (*raw, *filtered, *error, *command),
            other => panic!("expected a rate record, got {other:?}"),
        }
    }

    /// Test that a decreasing heading is a positive rate and that the
    /// command opposes an excess rate.
    #[test]
    fn test_rate_sign_and_command() {
        let mut f = fixture(proportional(1.0), 3.0);
        f.rate.command(0.0);
        f.rate.on_heading(HeadingSample::new(0.0, 10.0));
        assert!(f.sink.is_empty(), "First sample only primes the loop.");

        f.rate.on_heading(HeadingSample::new(1_000.0, 9.0));
        let (raw, filtered, error, command) = last_rate_record(&f.sink);
        assert!(value_close(1.0, raw));
        assert!(value_close(1.0, filtered), "First filter sample passes through.");
        assert!(value_close(1.0, error));
        assert!(value_close(-1.0, command));
        assert_eq!(f.motor.borrow().commands, vec![-1.0]);
    }

    /// Test the rate across north is the short way round.
    #[test]
    fn test_rate_wraps_across_north() {
        let mut f = fixture(proportional(0.0), 3.0);
        f.rate.on_heading(HeadingSample::new(0.0, 359.0));
        f.rate.on_heading(HeadingSample::new(500.0, 1.0));
        let (raw, ..) = last_rate_record(&f.sink);
        assert!(value_close(-4.0, raw));
    }

    /// Test the desired rate is limited by speed and the command clamped.
    #[test]
    fn test_rate_desired_clamped_by_speed() {
        let mut f = fixture(proportional(0.05), 3.0);
        assert_abs_diff_eq!(f.rate.max_rotation_rate(), 12.0, epsilon = 1e-9);

        f.rate.command(100.0);
        f.rate.on_heading(HeadingSample::new(0.0, 90.0));
        f.rate.on_heading(HeadingSample::new(100.0, 90.0));
        let (_, _, error, command) = last_rate_record(&f.sink);
        assert_abs_diff_eq!(error, -12.0, epsilon = 1e-9);
        assert_abs_diff_eq!(command, 0.6, epsilon = 1e-9);

        f.config
            .update(|c| c.rotation.gains = PidGains::new(1.0, 0.0, 0.0))
            .unwrap();
        f.rate.on_heading(HeadingSample::new(200.0, 90.0));
        assert_eq!(f.motor.borrow().level(), 1.0);
    }

    /// Test a stopped boat is treated as moving at one knot.
    #[test]
    fn test_rate_stopped_boat_uses_one_knot() {
        let f = fixture(AutopilotConfig::default(), 0.0);
        assert!(value_close(4.0, f.rate.max_rotation_rate()));
    }

    /// Test that gains tuned at one speed are scaled at another.
    #[test]
    fn test_rate_speed_compensation() {
        let mut config = proportional(0.1);
        config.rotation.tune_speed_kt = Some(6.0);
        let mut f = fixture(config, 3.0);
        f.rate.command(-1.0);
        f.rate.on_heading(HeadingSample::new(0.0, 0.0));
        f.rate.on_heading(HeadingSample::new(100.0, 0.0));
        let (_, _, error, command) = last_rate_record(&f.sink);
        assert!(value_close(1.0, error));
        assert!(value_close(-0.2, command));
    }

    /// Test no command reaches a disabled loop's or a disconnected motor.
    #[test]
    fn test_rate_disabled_or_disconnected_sends_nothing() {
        let mut f = fixture(proportional(1.0), 3.0);
        f.rate.on_heading(HeadingSample::new(0.0, 10.0));
        f.rate.on_heading(HeadingSample::new(100.0, 9.0));
        assert!(f.motor.borrow().commands.is_empty());

        f.rate.command(0.0);
        f.motor.borrow_mut().connected = false;
        f.rate.on_heading(HeadingSample::new(200.0, 8.0));
        assert!(f.motor.borrow().commands.is_empty());
        assert_eq!(f.sink.len(), 2, "Telemetry is recorded regardless.");
    }

    /// Test repeated timestamps are skipped without producing NaN.
    #[test]
    fn test_rate_skips_zero_dt() {
        let mut f = fixture(proportional(1.0), 3.0);
        f.rate.command(0.0);
        f.rate.on_heading(HeadingSample::new(0.0, 10.0));
        f.rate.on_heading(HeadingSample::new(0.0, 12.0));
        assert!(f.sink.is_empty());

        f.rate.on_heading(HeadingSample::new(100.0, 10.0));
        let (raw, ..) = last_rate_record(&f.sink);
        assert!(value_close(0.0, raw));
    }

    /// Test disabling zeroes the motor after the debounce.
    #[test]
    fn test_rate_disable_debounce() {
        let mut f = fixture(proportional(0.0), 3.0);
        f.rate.set_enabled(false);
        assert_eq!(f.motor.borrow().commands, vec![0.0], "No samples yet, stop now.");

        f.rate.command(0.5);
        f.rate.on_heading(HeadingSample::new(0.0, 10.0));
        f.rate.on_heading(HeadingSample::new(50.0, 10.0));
        let sent = f.motor.borrow().commands.len();

        f.rate.set_enabled(false);
        f.rate.on_heading(HeadingSample::new(100.0, 10.0));
        assert_eq!(f.motor.borrow().commands.len(), sent);
        f.rate.poll(150.0);
        assert_eq!(f.motor.borrow().commands.len(), sent + 1);
        assert_eq!(f.motor.borrow().level(), 0.0);

        // Re-engaging within the debounce cancels the stop.
        f.rate.set_enabled(false);
        f.rate.command(0.5);
        f.rate.poll(1_000.0);
        assert_eq!(f.motor.borrow().commands.len(), sent + 1);
    }

    /// Test stop disengages the loop and stops the motor at once.
    #[test]
    fn test_rate_stop() {
        let mut f = fixture(proportional(1.0), 3.0);
        f.rate.command(1.0);
        assert!(f.rate.enabled());
        f.rate.stop();
        assert!(!f.rate.enabled());
        assert_eq!(f.motor.borrow().stops, 1);
    }

    /// Test cancelling a tuning run zeroes the motor and reports the cancel.
    #[test]
    fn test_rate_tuning_cancel() {
        let mut f = fixture(proportional(1.0), 3.0);
        f.rate.command(2.0);
        let mut receiver = f.rate.start_tuning();
        assert!(f.rate.is_tuning());
        assert!(!f.rate.enabled());
        assert_eq!(f.rate.desired(), 0.0);

        f.rate.on_heading(HeadingSample::new(0.0, 10.0));
        f.rate.on_heading(HeadingSample::new(100.0, 11.0));
        assert_eq!(f.motor.borrow().level(), 1.0, "Relay steps up below the set point.");

        f.rate.cancel_tuning();
        assert!(!f.rate.is_tuning());
        assert_eq!(f.motor.borrow().level(), 0.0);
        let result = receiver.try_recv().unwrap();
        assert_eq!(result.outcome, TuningOutcome::Canceled);

        // Idempotent.
        f.rate.cancel_tuning();
        assert_eq!(f.motor.borrow().level(), 0.0);
    }

    /// Test a tuning run that never settles times out and keeps the gains.
    #[test]
    fn test_rate_tuning_timeout() {
        let mut config = proportional(1.0);
        config.rotation.low_pass_hz = 1e6;
        let mut f = fixture(config, 3.0);
        let mut receiver = f.rate.start_tuning();

        let mut heading = 100.0;
        f.rate.on_heading(HeadingSample::new(0.0, heading));
        for tick in 1..=21 {
            // Rate alternates between -5 and +5 deg/s.
            heading += if tick % 2 == 0 { 0.5 } else { -0.5 };
            f.rate.on_heading(HeadingSample::new(tick as f64 * 100.0, heading));
        }

        let result = receiver.try_recv().unwrap();
        assert_eq!(result.outcome, TuningOutcome::TimedOut);
        assert!(!f.rate.is_tuning());
        assert_eq!(f.motor.borrow().level(), 0.0);
        assert_eq!(f.config.read(|c| c.rotation.gains), PidGains::new(1.0, 0.0, 0.0));
        assert_eq!(f.config.read(|c| c.rotation.tune_speed_kt), None);
    }

    /// Test a converged tuning run applies the PID rule and records the speed.
    #[test]
    fn test_rate_tuning_converges() {
        let mut config = AutopilotConfig::default();
        config.rotation.low_pass_hz = 1e6;
        config.rotation.tune_noise_band = 5.0;
        config.rotation.tune_disable_noise_band_cycles = 100;
        let mut f = fixture(config, 3.0);
        let mut receiver = f.rate.start_tuning();

        // The rate integrates the motor command issued two ticks earlier.
        let mut rate = 0.0;
        let mut pipeline = VecDeque::from(vec![0.0, 0.0]);
        let mut heading = 100.0;
        let mut result = None;
        for tick in 0..500 {
            f.rate.on_heading(HeadingSample::new(tick as f64 * 100.0, heading));
            if let Ok(r) = receiver.try_recv() {
                result = Some(r);
                break;
            }
            pipeline.push_back(f.motor.borrow().level());
            rate += pipeline.pop_front().unwrap();
            heading = normalize_heading(heading - rate * 0.1);
        }

        let result = result.expect("tuning never finished");
        assert!(result.success);
        let suggested = result.suggested.unwrap();
        assert_abs_diff_eq!(suggested.tu, 3.2, epsilon = 1e-6);
        assert_abs_diff_eq!(suggested.ku, 1.0 / (2.0 * PI), epsilon = 1e-3);

        assert_eq!(f.config.read(|c| c.rotation.gains), suggested.get(TuningRule::Pid));
        let tune_speed = f.config.read(|c| c.rotation.tune_speed_kt).unwrap();
        assert_abs_diff_eq!(tune_speed, 3.0, epsilon = 1e-9);
        assert!(!f.rate.is_tuning());
        assert_eq!(f.motor.borrow().level(), 0.0);
    }
}
