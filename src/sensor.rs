// src/sensor.rs

//! # Sensors
//!
//! Synchronous publish/subscribe topics carrying sensor samples, the speed
//! sensor capability and the GPS fix store.

use crate::navigation::{mps_to_kt, Position};
use crate::speed::{Fix, SpeedTracker};
use log::warn;
use std::cell::RefCell;

/// Delivers values to subscribers in subscription order.
///
/// Delivery is synchronous. A value published from inside a handler of the
/// same topic is dropped.
pub struct Topic<T> {
    subscribers: RefCell<Vec<Box<dyn FnMut(&T)>>>,
}

impl<T> Default for Topic<T> {
    fn default() -> Self {
        Self {
            subscribers: RefCell::new(Vec::new()),
        }
    }
}

impl<T> Topic<T> {
    /// Creates a topic with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler after all existing ones.
    ///
    /// Returns `false` if called from inside a handler of this topic.
    pub fn subscribe(&self, handler: impl FnMut(&T) + 'static) -> bool {
        match self.subscribers.try_borrow_mut() {
            Ok(mut subscribers) => {
                subscribers.push(Box::new(handler));
                true
            }
            Err(_) => {
                warn!("subscribe during delivery ignored");
                false
            }
        }
    }

    /// Delivers `value` to every subscriber.
    ///
    /// Returns `false` if the publish was dropped as reentrant.
    pub fn publish(&self, value: &T) -> bool {
        match self.subscribers.try_borrow_mut() {
            Ok(mut subscribers) => {
                for handler in subscribers.iter_mut() {
                    handler(value);
                }
                true
            }
            Err(_) => {
                warn!("reentrant publish dropped");
                false
            }
        }
    }

    /// Number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.borrow().len()
    }
}

/// One compass reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeadingSample {
    /// Reading time in milliseconds.
    pub time_ms: f64,
    /// Heading in degrees, `[0, 360)`.
    pub heading: f64,
}

impl HeadingSample {
    /// Creates a sample.
    pub fn new(time_ms: f64, heading: f64) -> Self {
        Self { time_ms, heading }
    }
}

/// Heading readings, published in time order.
pub type OrientationSensor = Topic<HeadingSample>;

/// Reports boat speed over ground.
pub trait SpeedSensor {
    /// Speed in metres per second.
    fn speed_mps(&self) -> f64;

    /// Speed in knots.
    fn speed_kt(&self) -> f64 {
        mps_to_kt(self.speed_mps())
    }
}

impl<S: SpeedSensor + ?Sized> SpeedSensor for RefCell<S> {
    fn speed_mps(&self) -> f64 {
        self.borrow().speed_mps()
    }
}

/// A raw GPS fix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationSample {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Fix time in milliseconds.
    pub time_ms: f64,
    /// Estimated horizontal accuracy in metres.
    pub accuracy_m: f64,
    /// Course over ground in degrees, if the receiver reports one.
    pub course: Option<f64>,
}

impl LocationSample {
    /// The fix position.
    pub fn position(&self) -> Position {
        Position::new(self.latitude, self.longitude)
    }
}

/// Keeps the latest GPS fix, course and tracked speed.
#[derive(Debug, Clone, Default)]
pub struct GpsSensor {
    tracker: SpeedTracker,
    latest: Option<LocationSample>,
    course: Option<f64>,
}

impl GpsSensor {
    /// Creates a sensor with no fix.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a fix; returns `false` if its accuracy was too poor for
    /// speed tracking.
    pub fn record(&mut self, sample: LocationSample) -> bool {
        self.latest = Some(sample);
        if let Some(course) = sample.course {
            self.course = Some(course);
        }
        self.tracker.try_add(
            Fix {
                position: sample.position(),
                time_ms: sample.time_ms,
            },
            sample.accuracy_m,
        )
    }

    /// Position of the latest fix.
    pub fn position(&self) -> Option<Position> {
        self.latest.map(|s| s.position())
    }

    /// Latest reported course over ground.
    pub fn course(&self) -> Option<f64> {
        self.course
    }

    /// The latest fix.
    pub fn latest(&self) -> Option<LocationSample> {
        self.latest
    }
}

impl SpeedSensor for GpsSensor {
    fn speed_mps(&self) -> f64 {
        self.tracker.speed_mps()
    }
}
