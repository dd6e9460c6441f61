// src/speed.rs

//! # GPS Speed Tracker
//!
//! Estimates boat speed over ground from a short window of GPS fixes.
//! Fixes with a poor accuracy estimate are dropped. A fix within the
//! accuracy radius of any retained fix still becomes the latest position but
//! does not enter the window, so GPS jitter while slow does not collapse the
//! window onto a few metres of noise.

use crate::navigation::{haversine_distance, Position};
use log::debug;

/// Fixes with a worse accuracy estimate than this are ignored, in metres.
pub const MIN_ACCURACY_M: f64 = 7.0;

/// Default number of fixes kept in the window.
pub const DEFAULT_WINDOW: usize = 3;

/// A position with its timestamp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fix {
    /// Where the fix was taken.
    pub position: Position,
    /// When the fix was taken, in milliseconds.
    pub time_ms: f64,
}

/// Rolling window of accepted fixes.
#[derive(Debug, Clone)]
pub struct SpeedTracker {
    capacity: usize,
    window: Vec<Fix>,
    latest: Option<Fix>,
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl SpeedTracker {
    /// Creates a tracker keeping at most `capacity` fixes (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            window: Vec::new(),
            latest: None,
        }
    }

    /// Offers a fix; returns `false` if it was rejected for poor accuracy.
    pub fn try_add(&mut self, fix: Fix, accuracy_m: f64) -> bool {
        if !(accuracy_m <= MIN_ACCURACY_M) {
            debug!("GPS accuracy {accuracy_m:.1} m is above {MIN_ACCURACY_M} m, ignoring fix");
            return false;
        }

        self.latest = Some(fix);
        let near_retained = self
            .window
            .iter()
            .any(|kept| haversine_distance(kept.position, fix.position) < MIN_ACCURACY_M);
        if near_retained {
            return true;
        }

        if self.window.len() == self.capacity {
            self.window.remove(0);
        }
        self.window.push(fix);
        true
    }

    /// Speed in metres per second between the oldest retained fix and the
    /// latest fix; zero without a later fix.
    pub fn speed_mps(&self) -> f64 {
        let (Some(oldest), Some(latest)) = (self.window.first(), self.latest) else {
            return 0.0;
        };
        let elapsed_s = (latest.time_ms - oldest.time_ms) / 1000.0;
        if elapsed_s <= 0.0 {
            return 0.0;
        }
        haversine_distance(oldest.position, latest.position) / elapsed_s
    }

    /// The latest accepted fix.
    pub fn latest(&self) -> Option<Fix> {
        self.latest
    }

    /// The retained fixes, oldest first.
    pub fn window(&self) -> &[Fix] {
        &self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::navigation::project_position;
    use approx::assert_abs_diff_eq;

    fn fix_at(start: Position, distance: f64, bearing: f64, time_ms: f64) -> Fix {
        Fix {
            position: project_position(start, distance, bearing),
            time_ms,
        }
    }

    /// Test the window, jitter gate and speed along a straight track.
    #[test]
    fn test_speed_tracker_track() {
        let mut tracker = SpeedTracker::new(3);
        assert_eq!(tracker.speed_mps(), 0.0);

        let start = Position::new(40.1, 37.2);
        assert!(tracker.try_add(Fix { position: start, time_ms: 0.0 }, 7.0));
        assert_eq!(tracker.window().len(), 1);
        assert_eq!(tracker.speed_mps(), 0.0);

        // Within the accuracy radius: latest moves, window does not grow.
        tracker.try_add(fix_at(start, 1.0, 30.0, 1_000.0), 6.0);
        assert_eq!(tracker.window().len(), 1);
        assert_abs_diff_eq!(tracker.speed_mps(), 1.0, epsilon = 1e-4);

        tracker.try_add(fix_at(start, 1.0, 20.0, 2_000.0), 6.0);
        assert_eq!(tracker.window().len(), 1);
        assert_abs_diff_eq!(tracker.speed_mps(), 0.5, epsilon = 1e-4);

        tracker.try_add(fix_at(start, 8.0, 30.0, 8_000.0), 6.0);
        assert_eq!(tracker.window().len(), 2);
        assert_abs_diff_eq!(tracker.speed_mps(), 1.0, epsilon = 1e-3);

        tracker.try_add(fix_at(start, 9.0, 30.0, 9_000.0), 6.0);
        assert_eq!(tracker.window().len(), 2);
        assert_abs_diff_eq!(tracker.speed_mps(), 1.0, epsilon = 1e-3);
        assert_eq!(tracker.window()[0].position, start);

        tracker.try_add(fix_at(start, 16.0, 30.0, 16_000.0), 6.0);
        assert_eq!(tracker.window().len(), 3);
        assert_abs_diff_eq!(tracker.speed_mps(), 1.0, epsilon = 1e-3);
        assert_eq!(tracker.window()[0].position, start);

        tracker.try_add(fix_at(start, 24.0, 30.0, 24_000.0), 6.0);
        assert_eq!(tracker.window().len(), 3);
        assert_abs_diff_eq!(tracker.speed_mps(), 1.0, epsilon = 1e-3);
        assert_ne!(tracker.window()[0].position, start);
    }

    /// Test that inaccurate fixes are ignored entirely.
    #[test]
    fn test_speed_tracker_rejects_inaccurate_fix() {
        let mut tracker = SpeedTracker::default();
        let start = Position::new(40.1, 37.2);
        tracker.try_add(Fix { position: start, time_ms: 0.0 }, 3.0);

        assert!(!tracker.try_add(fix_at(start, 50.0, 90.0, 1_000.0), 7.5));
        assert!(!tracker.try_add(fix_at(start, 50.0, 90.0, 1_000.0), f64::NAN));
        assert_eq!(tracker.window().len(), 1);
        assert_eq!(tracker.latest().map(|f| f.time_ms), Some(0.0));
        assert_eq!(tracker.speed_mps(), 0.0);
    }
}
