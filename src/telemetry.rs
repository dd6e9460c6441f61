// src/telemetry.rs

//! # Telemetry
//!
//! One record per control tick per loop, plus one per GPS fix, handed to a
//! [`TelemetrySink`]. Sinks are fire-and-forget: recording never fails and
//! never feeds back into control.

use log::{debug, warn};
use serde::Serialize;
use std::cell::RefCell;

/// One telemetry record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryRecord {
    /// A heading loop tick.
    Heading {
        /// Sample time in milliseconds.
        time_ms: f64,
        /// Desired heading.
        desired: f64,
        /// Measured heading.
        raw: f64,
        /// Signed error before filtering.
        error_raw: f64,
        /// Signed error after filtering.
        error_filtered: f64,
        /// Output of the PID or the tuner.
        command: f64,
        /// Whether both loops were engaged.
        enabled: bool,
        /// Circular mean of the recent headings.
        average: Option<f64>,
    },
    /// A rotation-rate loop tick.
    Rate {
        /// Sample time in milliseconds.
        time_ms: f64,
        /// Desired rotation rate in degrees per second.
        desired: f64,
        /// Rotation rate from the last two headings.
        raw: f64,
        /// Filtered rotation rate.
        filtered: f64,
        /// Filtered rate minus the clamped desired rate.
        error: f64,
        /// Clamped motor command.
        command: f64,
    },
    /// A GPS fix.
    Location {
        /// Fix time in milliseconds.
        time_ms: f64,
        /// Latitude in degrees.
        latitude: f64,
        /// Longitude in degrees.
        longitude: f64,
        /// Tracked speed in knots.
        speed_kt: f64,
        /// Course over ground in degrees.
        course: Option<f64>,
        /// Distance from the track line in metres.
        cross_track_m: Option<f64>,
    },
}

/// Receives telemetry records.
pub trait TelemetrySink {
    /// Records one entry.
    fn record(&self, record: TelemetryRecord);
}

/// Discards every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn record(&self, _record: TelemetryRecord) {}
}

/// Writes records as JSON lines to the `telemetry` log target.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn record(&self, record: TelemetryRecord) {
        match serde_json::to_string(&record) {
            Ok(line) => debug!(target: "telemetry", "{line}"),
            Err(e) => warn!("telemetry record not serializable: {e}"),
        }
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: RefCell<Vec<TelemetryRecord>>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of every record so far.
    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.records.borrow().clone()
    }

    /// Removes and returns every record so far.
    pub fn take(&self) -> Vec<TelemetryRecord> {
        self.records.take()
    }

    /// Number of records so far.
    pub fn len(&self) -> usize {
        self.records.borrow().len()
    }

    /// `true` if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.records.borrow().is_empty()
    }
}

impl TelemetrySink for MemorySink {
    fn record(&self, record: TelemetryRecord) {
        self.records.borrow_mut().push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test records serialize with a kind tag.
    #[test]
    fn test_telemetry_record_json() {
        let record = TelemetryRecord::Rate {
            time_ms: 50.0,
            desired: 1.0,
            raw: 0.5,
            filtered: 0.25,
            error: -0.75,
            command: 0.3,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "rate");
        assert_eq!(json["command"], 0.3);
    }

    /// Test the memory sink keeps records in order.
    #[test]
    fn test_memory_sink() {
        let sink = MemorySink::new();
        assert!(sink.is_empty());
        for time_ms in [0.0, 50.0] {
            sink.record(TelemetryRecord::Location {
                time_ms,
                latitude: 1.0,
                longitude: 2.0,
                speed_kt: 3.0,
                course: None,
                cross_track_m: None,
            });
        }
        assert_eq!(sink.len(), 2);
        let records = sink.take();
        assert!(matches!(records[1], TelemetryRecord::Location { time_ms, .. } if time_ms == 50.0));
        assert!(sink.is_empty());
    }
}
