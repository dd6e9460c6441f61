// src/device/pulse.rs

//! # Pulse Modulator
//!
//! Lets an on/off motor approximate a continuous power level by switching
//! it in timed pulses. A pulse is never shorter than [`MIN_SWITCH_MS`] and a
//! cycle never longer than [`MAX_CYCLE_MS`]:
//!
//! ```text
//! total = min(250 / p, 60_000), on = 250
//! if total < 500: on = p * 250 / (1 - p), total = 250 + on
//! ```
//!
//! The caller supplies the clock, so the modulator is fully deterministic.

use log::trace;

/// Shortest time between two switches of the motor, in milliseconds.
pub const MIN_SWITCH_MS: f64 = 250.0;

/// Longest pulse cycle, in milliseconds.
pub const MAX_CYCLE_MS: f64 = 60_000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Off { next_on: Option<f64> },
    On { until: f64 },
    Continuous,
}

/// Maps a power request in `[0, 1]` onto on/off timing.
#[derive(Debug, Clone)]
pub struct PulseModulator {
    power: f64,
    on_ms: f64,
    total_ms: f64,
    phase: Phase,
    last_off: Option<f64>,
}

impl Default for PulseModulator {
    fn default() -> Self {
        Self::new()
    }
}

impl PulseModulator {
    /// Creates a modulator with the motor off.
    pub fn new() -> Self {
        Self {
            power: 0.0,
            on_ms: MIN_SWITCH_MS,
            total_ms: 0.0,
            phase: Phase::Off { next_on: None },
            last_off: None,
        }
    }

    /// Requested power level.
    pub fn power(&self) -> f64 {
        self.power
    }

    /// On time and total cycle time in milliseconds for the current power.
    pub fn timing(&self) -> (f64, f64) {
        (self.on_ms, self.total_ms)
    }

    /// `true` while the motor should be running.
    pub fn is_on(&self) -> bool {
        matches!(self.phase, Phase::On { .. } | Phase::Continuous)
    }

    /// Requests a new power level at time `now_ms`.
    ///
    /// Zero (or less) forces the motor off; one (or more) keeps it on.
    pub fn set_power(&mut self, power: f64, now_ms: f64) {
        self.poll(now_ms);

        if !(power > 0.0) {
            if self.is_on() {
                self.last_off = Some(now_ms);
            }
            self.power = 0.0;
            self.phase = Phase::Off { next_on: None };
            return;
        }

        if power >= 1.0 {
            self.power = 1.0;
            self.phase = Phase::Continuous;
            return;
        }

        self.power = power;
        let (on_ms, total_ms) = pulse_timing(power);
        self.on_ms = on_ms;
        self.total_ms = total_ms;
        let off_ms = total_ms - on_ms;
        trace!("pulse power {power:.3}: on {on_ms:.0} ms of {total_ms:.0} ms");

        match (self.phase, self.last_off) {
            (Phase::Continuous, _) | (Phase::Off { .. }, None) => {
                self.phase = Phase::On {
                    until: now_ms + on_ms,
                };
            }
            (Phase::Off { next_on }, Some(last_off)) => {
                let since_off = now_ms - last_off;
                self.phase = match next_on {
                    Some(_) if off_ms < since_off => Phase::On {
                        until: now_ms + on_ms,
                    },
                    Some(_) => Phase::Off { next_on },
                    None => Phase::Off {
                        next_on: Some(now_ms.max(last_off + off_ms)),
                    },
                };
                self.poll(now_ms);
            }
            (Phase::On { .. }, _) => {}
        }
    }

    /// Advances to `now_ms` and reports whether the motor should be on.
    pub fn poll(&mut self, now_ms: f64) -> bool {
        loop {
            match self.phase {
                Phase::On { until } if now_ms >= until => {
                    self.last_off = Some(until);
                    let next_on = (self.power > 0.0).then(|| until + self.total_ms - self.on_ms);
                    self.phase = Phase::Off { next_on };
                }
                Phase::Off {
                    next_on: Some(start),
                } if now_ms >= start => {
                    self.phase = Phase::On {
                        until: start + self.on_ms,
                    };
                }
                _ => break,
            }
        }
        self.is_on()
    }
}

/// On time and total cycle time in milliseconds for a power in `(0, 1)`.
pub fn pulse_timing(power: f64) -> (f64, f64) {
    let total = (MIN_SWITCH_MS / power).min(MAX_CYCLE_MS);
    if total < 2.0 * MIN_SWITCH_MS {
        let on = power * MIN_SWITCH_MS / (1.0 - power);
        (on, MIN_SWITCH_MS + on)
    } else {
        (MIN_SWITCH_MS, total)
    }
}
