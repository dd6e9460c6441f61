// src/autopilot.rs

//! # Autopilot
//!
//! Wires the sensors, both stabilizers, the configuration and telemetry
//! together and exposes the operations a user interface needs: hold the
//! current heading, nudge it, tune either loop, recall saved gains and
//! steer relative to a track line.
//!
//! Heading samples published on the orientation topic reach the rate loop
//! first and the heading loop second. GPS fixes published on the location
//! topic feed the speed tracker and produce location telemetry.

use crate::config::{ConfigHandle, ConfigStore};
use crate::device::{Actuator, ConfigSpeed};
use crate::error::{AutopilotError, ConfigError};
use crate::navigation::{Position, TrackLine};
use crate::pid::TuningResult;
use crate::sensor::{
    GpsSensor, HeadingSample, LocationSample, OrientationSensor, SpeedSensor, Topic,
};
use crate::stabilizer::{HeadingStabilizer, RateStabilizer};
use crate::telemetry::{TelemetryRecord, TelemetrySink};
use log::{debug, info};
use std::cell::RefCell;
use std::rc::Rc;
use tokio::sync::oneshot;

/// The assembled control core.
pub struct Autopilot {
    config: ConfigHandle,
    store: Box<dyn ConfigStore>,
    orientation: Rc<OrientationSensor>,
    location: Rc<Topic<LocationSample>>,
    gps: Rc<RefCell<GpsSensor>>,
    rate: Rc<RefCell<RateStabilizer>>,
    heading: Rc<RefCell<HeadingStabilizer>>,
    track_line: Rc<RefCell<Option<TrackLine>>>,
}

impl Autopilot {
    /// Loads the configuration from `store` and assembles the core.
    pub fn from_store(
        store: Box<dyn ConfigStore>,
        motor: Rc<RefCell<dyn Actuator>>,
        telemetry: Rc<dyn TelemetrySink>,
    ) -> Result<Self, AutopilotError> {
        let config = ConfigHandle::new(store.load_or_default()?)?;
        Self::new(config, store, motor, telemetry)
    }

    /// Assembles the core around an existing configuration.
    ///
    /// Speed comes from the simulation settings when simulation is enabled
    /// and from the GPS speed tracker otherwise.
    pub fn new(
        config: ConfigHandle,
        store: Box<dyn ConfigStore>,
        motor: Rc<RefCell<dyn Actuator>>,
        telemetry: Rc<dyn TelemetrySink>,
    ) -> Result<Self, AutopilotError> {
        let gps = Rc::new(RefCell::new(GpsSensor::new()));
        let speed: Rc<dyn SpeedSensor> = if config.read(|c| c.simulation.enabled) {
            Rc::new(ConfigSpeed::new(&config))
        } else {
            gps.clone()
        };

        let rate = RateStabilizer::new(config.clone(), motor, speed, telemetry.clone())?;
        let rate = Rc::new(RefCell::new(rate));
        let heading = HeadingStabilizer::new(config.clone(), rate.clone(), telemetry.clone());
        let heading = Rc::new(RefCell::new(heading));

        let orientation = Rc::new(OrientationSensor::new());
        let rate_handler = rate.clone();
        orientation.subscribe(move |sample: &HeadingSample| {
            rate_handler.borrow_mut().on_heading(*sample);
        });
        let heading_handler = heading.clone();
        orientation.subscribe(move |sample: &HeadingSample| {
            heading_handler.borrow_mut().on_heading(*sample);
        });

        let track_line = Rc::new(RefCell::new(None));
        let location = Rc::new(Topic::new());
        {
            let gps = gps.clone();
            let track_line = track_line.clone();
            location.subscribe(move |sample: &LocationSample| {
                let mut gps = gps.borrow_mut();
                if !gps.record(*sample) {
                    debug!("fix with accuracy {:.1} m not tracked", sample.accuracy_m);
                }
                let cross_track_m = track_line
                    .borrow()
                    .as_ref()
                    .map(|line: &TrackLine| line.cross_track_distance(sample.position()));
                telemetry.record(TelemetryRecord::Location {
                    time_ms: sample.time_ms,
                    latitude: sample.latitude,
                    longitude: sample.longitude,
                    speed_kt: gps.speed_kt(),
                    course: gps.course(),
                    cross_track_m,
                });
            });
        }

        Ok(Self {
            config,
            store,
            orientation,
            location,
            gps,
            rate,
            heading,
            track_line,
        })
    }

    /// The live configuration.
    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// The configuration store.
    pub fn store(&self) -> &dyn ConfigStore {
        self.store.as_ref()
    }

    /// The topic heading samples are published on.
    pub fn orientation(&self) -> Rc<OrientationSensor> {
        self.orientation.clone()
    }

    /// The topic GPS fixes are published on.
    pub fn location(&self) -> Rc<Topic<LocationSample>> {
        self.location.clone()
    }

    /// Publishes a heading sample to both loops.
    pub fn on_heading(&self, sample: HeadingSample) -> bool {
        self.orientation.publish(&sample)
    }

    /// Publishes a GPS fix.
    pub fn on_fix(&self, sample: LocationSample) -> bool {
        self.location.publish(&sample)
    }

    /// Advances timers that do not wait for a sample.
    pub fn poll(&self, now_ms: f64) {
        self.rate.borrow_mut().poll(now_ms);
    }

    /// Tracked speed over ground in knots.
    pub fn gps_speed_kt(&self) -> f64 {
        self.gps.borrow().speed_kt()
    }

    /// Position of the latest GPS fix.
    pub fn position(&self) -> Option<Position> {
        self.gps.borrow().position()
    }

    /// `true` while both loops are engaged.
    pub fn engaged(&self) -> bool {
        self.heading.borrow().enabled()
    }

    /// `true` while either loop is being tuned.
    pub fn is_tuning(&self) -> bool {
        self.heading.borrow().is_tuning() || self.rate.borrow().is_tuning()
    }

    /// Heading the autopilot steers to.
    pub fn desired_heading(&self) -> f64 {
        self.heading.borrow().desired()
    }

    /// Cancels any tuning run, then holds the current heading.
    pub fn hold_current_heading(&self) -> Result<f64, AutopilotError> {
        if self.is_tuning() {
            self.cancel_tune();
        }
        self.heading.borrow_mut().maintain_current_heading()
    }

    /// Turns the held heading by `delta` degrees.
    pub fn adjust_desired_heading(&self, delta: f64) -> f64 {
        self.heading.borrow_mut().adjust_desired_heading(delta)
    }

    /// Cancels any tuning run and disengages both loops.
    pub fn disengage(&self) {
        if self.is_tuning() {
            self.cancel_tune();
        }
        self.heading.borrow_mut().set_enabled(false);
        info!("autopilot disengaged");
    }

    /// Starts tuning the heading loop around the current heading.
    pub fn start_heading_tune(&self) -> Result<oneshot::Receiver<TuningResult>, AutopilotError> {
        self.heading.borrow_mut().start_tuning()
    }

    /// Starts tuning the rotation-rate loop; the heading loop is disengaged.
    pub fn start_rate_tune(&self) -> oneshot::Receiver<TuningResult> {
        {
            let mut heading = self.heading.borrow_mut();
            if heading.is_tuning() {
                heading.cancel_tuning();
            }
            heading.set_enabled(false);
        }
        self.rate.borrow_mut().start_tuning()
    }

    /// Cancels whichever tuning run is active and zeroes the motor.
    pub fn cancel_tune(&self) {
        let heading_tuning = self.heading.borrow().is_tuning();
        if heading_tuning {
            self.heading.borrow_mut().cancel_tuning();
        } else {
            self.rate.borrow_mut().cancel_tuning();
        }
    }

    /// Saves the current configuration.
    pub fn persist(&mut self) -> Result<(), ConfigError> {
        self.store.save(&self.config.snapshot())
    }

    /// Applies a saved heading gain set and its filter cutoffs.
    pub fn recall_heading_snapshot(&self, name: &str) -> Result<(), ConfigError> {
        let snapshot = self
            .config
            .read(|c| c.heading_snapshots.iter().find(|s| s.name == name).cloned())
            .ok_or_else(|| ConfigError::UnknownSnapshot(name.to_owned()))?;
        self.config.update(|c| {
            c.heading.gains = snapshot.gains;
            c.heading.low_pass_hz = snapshot.low_pass_hz;
            c.heading.derivative_low_pass_hz = snapshot.derivative_low_pass_hz;
        })?;
        info!("recalled heading gains `{name}`");
        Ok(())
    }

    /// Starts a track line at the latest fix along the reported course.
    pub fn set_track_line_from_gps(&self) -> Result<TrackLine, AutopilotError> {
        let gps = self.gps.borrow();
        let start = gps.position().ok_or(AutopilotError::SensorUnavailable("gps"))?;
        let course = gps.course().ok_or(AutopilotError::SensorUnavailable("course"))?;
        let line = TrackLine::new(start, course);
        *self.track_line.borrow_mut() = Some(line);
        info!("track line set from {start:?} along {course:.1}");
        Ok(line)
    }

    /// The active track line.
    pub fn track_line(&self) -> Option<TrackLine> {
        *self.track_line.borrow()
    }

    /// Signed distance of the latest fix from the track line, in metres.
    pub fn cross_track_distance(&self) -> Option<f64> {
        let line = self.track_line()?;
        self.position().map(|p| line.cross_track_distance(p))
    }
}
