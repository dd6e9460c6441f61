// src/navigation.rs

//! # Navigation Math
//!
//! Angle normalization, circular statistics over headings and great-circle
//! geometry on a spherical Earth.
//!
//! Headings are in degrees, clockwise from north, in `[0, 360)`. Angle
//! differences are in `(-180, 180]`.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Mean Earth radius in metres.
pub const EARTH_RADIUS_M: f64 = 6_371e3;

/// Knots per metre per second.
pub const KNOTS_PER_MPS: f64 = 1.94384;

/// Number of headings averaged by [`HeadingHistory`].
pub const HEADING_HISTORY_LEN: usize = 6;

/// Converts metres per second to knots.
pub fn mps_to_kt(mps: f64) -> f64 {
    mps * KNOTS_PER_MPS
}

/// Converts knots to metres per second.
pub fn kt_to_mps(kt: f64) -> f64 {
    kt / KNOTS_PER_MPS
}

/// Signed shortest rotation from `b` to `a`, in `(-180, 180]`.
pub fn normalized_angle_delta(a: f64, b: f64) -> f64 {
    let delta = (a - b) % 360.0;
    if delta > 180.0 {
        delta - 360.0
    } else if delta <= -180.0 {
        delta + 360.0
    } else {
        delta
    }
}

/// Wraps a heading into `[0, 360)`.
pub fn normalize_heading(heading: f64) -> f64 {
    let wrapped = heading.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative inputs.
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Circular mean of a set of headings, in `[0, 360)`.
///
/// Returns `None` for an empty set.
pub fn circular_mean(degrees: &[f64]) -> Option<f64> {
    if degrees.is_empty() {
        return None;
    }
    let (sin_sum, cos_sum) = degrees.iter().fold((0.0, 0.0), |(s, c), d| {
        let rad = d.to_radians();
        (s + rad.sin(), c + rad.cos())
    });
    Some(normalize_heading(sin_sum.atan2(cos_sum).to_degrees()))
}

/// The most recent headings, for a noise-free "current heading".
#[derive(Debug, Clone, Default)]
pub struct HeadingHistory {
    headings: VecDeque<f64>,
}

impl HeadingHistory {
    /// Creates an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a heading, dropping the oldest beyond the history length.
    pub fn push(&mut self, heading: f64) {
        if self.headings.len() == HEADING_HISTORY_LEN {
            self.headings.pop_front();
        }
        self.headings.push_back(heading);
    }

    /// Number of recorded headings.
    pub fn len(&self) -> usize {
        self.headings.len()
    }

    /// `true` before the first heading.
    pub fn is_empty(&self) -> bool {
        self.headings.is_empty()
    }

    /// Circular mean of the recorded headings.
    pub fn average(&self) -> Option<f64> {
        let headings: Vec<f64> = self.headings.iter().copied().collect();
        circular_mean(&headings)
    }
}

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

impl Position {
    /// Creates a position.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Great-circle distance between two positions, in metres.
pub fn haversine_distance(a: Position, b: Position) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let d_lat = lat2 - lat1;
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

/// Signed distance in metres of `current` from the line through `start`
/// along `heading`.
///
/// Negative values lie to the left of the line, positive to the right.
pub fn cross_track_distance(start: Position, heading: f64, current: Position) -> f64 {
    let lat1 = start.latitude.to_radians();
    let lat2 = current.latitude.to_radians();
    let d_lon = (current.longitude - start.longitude).to_radians();

    let y = d_lon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * d_lon.cos();
    let bearing = y.atan2(x);

    haversine_distance(start, current) * (heading.to_radians() - bearing).sin()
}

/// The position reached from `start` after `distance_m` metres along `bearing`.
pub fn project_position(start: Position, distance_m: f64, bearing: f64) -> Position {
    let angular = distance_m / EARTH_RADIUS_M;
    let bearing = bearing.to_radians();
    let lat1 = start.latitude.to_radians();
    let lon1 = start.longitude.to_radians();

    let lat2 = (lat1.sin() * angular.cos() + lat1.cos() * angular.sin() * bearing.cos()).asin();
    let lon2 = lon1
        + (bearing.sin() * angular.sin() * lat1.cos())
            .atan2(angular.cos() - lat1.sin() * lat2.sin());

    Position::new(lat2.to_degrees(), lon2.to_degrees())
}

/// A line to steer along: a start position and a heading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackLine {
    /// Where the line starts.
    pub start: Position,
    /// Direction of the line in degrees.
    pub heading: f64,
}

impl TrackLine {
    /// Creates a track line.
    pub fn new(start: Position, heading: f64) -> Self {
        Self {
            start,
            heading: normalize_heading(heading),
        }
    }

    /// Signed distance of `position` from the line, in metres.
    pub fn cross_track_distance(&self, position: Position) -> f64 {
        cross_track_distance(self.start, self.heading, position)
    }
}
