// src/device/tiller.rs

//! # Wireless Tiller Motor
//!
//! Drives the tiller motor over a GATT characteristic. Commands from the
//! control loop only replace the pending level; an outbound task writes the
//! pending level on a fixed cadence, so the radio sees at most one write per
//! interval no matter how fast the loop runs.
//!
//! Each write is two bytes, `[power, direction]`. In proportional mode the
//! power byte is the level scaled to `0..=255`; in pulsed mode it is either
//! full or zero, switched by a [`PulseModulator`].

use crate::config::{ConfigHandle, DriveMode};
use crate::device::{Actuator, ConnectableDevice, Controller, PulseModulator};
use crate::error::DeviceError;
use log::{debug, info, trace, warn};
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};

/// GATT service exposed by the tiller motor.
pub const SERVICE_UUID: &str = "dc05a09d-4d38-4ea9-af54-1add36c9a987";

/// Characteristic accepting `[power, direction]` writes.
pub const CHARACTERISTIC_UUID: &str = "c460751e-342b-4700-96ce-190ac0ac526e";

/// Advertised name prefix of tiller motor devices.
pub const DEVICE_NAME_PREFIX: &str = "Tiller Pilot";

/// Direction byte for positive levels.
pub const DIRECTION_RIGHT: u8 = 1;

/// Direction byte for negative levels and stops.
pub const DIRECTION_LEFT: u8 = 0;

/// Byte-level access to a GATT characteristic.
pub trait GattTransport {
    /// Finds a device by name prefix and opens the characteristic.
    fn connect(
        &self,
        name_prefix: &str,
        service: &str,
        characteristic: &str,
    ) -> impl Future<Output = Result<(), DeviceError>>;

    /// Writes one payload to the open characteristic.
    fn write(&self, payload: [u8; 2]) -> impl Future<Output = Result<(), DeviceError>>;

    /// Closes the link.
    fn disconnect(&self);
}

/// Encodes a level in proportional mode.
pub fn encode_level(level: f64) -> [u8; 2] {
    let power = (level.abs().min(1.0) * 255.0).round() as u8;
    [power, direction(level)]
}

fn direction(level: f64) -> u8 {
    if level > 0.0 {
        DIRECTION_RIGHT
    } else {
        DIRECTION_LEFT
    }
}

/// The tiller motor behind a [`GattTransport`].
pub struct TillerMotor<T: GattTransport> {
    transport: Rc<T>,
    drive_mode: DriveMode,
    next_level: f64,
    modulator: PulseModulator,
    connected: watch::Sender<bool>,
}

impl<T: GattTransport> TillerMotor<T> {
    /// Creates a disconnected motor.
    pub fn new(transport: T, drive_mode: DriveMode) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            transport: Rc::new(transport),
            drive_mode,
            next_level: 0.0,
            modulator: PulseModulator::new(),
            connected,
        }
    }

    /// Creates a disconnected motor driven as `motor.drive_mode` says.
    pub fn from_config(transport: T, config: &ConfigHandle) -> Self {
        Self::new(transport, config.read(|c| c.motor.drive_mode))
    }

    /// The level the next write will carry.
    pub fn next_level(&self) -> f64 {
        self.next_level
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Builds the payload for the pending level at `now_ms`.
    pub fn next_payload(&mut self, now_ms: f64) -> [u8; 2] {
        match self.drive_mode {
            DriveMode::Proportional => encode_level(self.next_level),
            DriveMode::Pulsed => {
                self.modulator.set_power(self.next_level.abs(), now_ms);
                if self.modulator.poll(now_ms) {
                    [255, direction(self.next_level)]
                } else {
                    [0, DIRECTION_LEFT]
                }
            }
        }
    }

    /// Writes the pending level once.
    pub async fn flush(&mut self, now_ms: f64) -> Result<(), DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::Disconnected);
        }
        let payload = self.next_payload(now_ms);
        let result = self.transport.write(payload).await;
        self.handle_write(payload, result)
    }

    fn handle_write(
        &mut self,
        payload: [u8; 2],
        result: Result<(), DeviceError>,
    ) -> Result<(), DeviceError> {
        match result {
            Ok(()) => {
                trace!("tiller write {payload:?}");
                Ok(())
            }
            Err(DeviceError::LinkLost) => {
                warn!("tiller link lost, pausing control");
                self.connected.send_replace(false);
                Err(DeviceError::LinkLost)
            }
            Err(e) => {
                debug!("tiller write failed: {e}");
                Err(e)
            }
        }
    }
}

/// Writes the pending level of `motor` every `motor.flush_interval_ms`
/// until the motor is dropped.
///
/// Ticks are skipped while the motor is disconnected, so writes resume on
/// their own once it reconnects. The motor is borrowed only between writes,
/// so the control loop can keep commanding it while a write is in flight.
pub async fn run_outbound<T: GattTransport>(
    motor: Rc<RefCell<TillerMotor<T>>>,
    config: ConfigHandle,
) {
    let motor = Rc::downgrade(&motor);
    let interval = Duration::from_millis(config.read(|c| c.motor.flush_interval_ms));
    let start = Instant::now();
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let Some(motor) = motor.upgrade() else {
            break;
        };
        let (transport, payload) = {
            let mut motor = motor.borrow_mut();
            if !motor.is_connected() {
                trace!("tiller disconnected, write skipped");
                continue;
            }
            let now_ms = start.elapsed().as_secs_f64() * 1000.0;
            (motor.transport.clone(), motor.next_payload(now_ms))
        };
        let result = transport.write(payload).await;
        // Errors are logged by `handle_write`; link loss pauses until reconnect.
        let _ = motor.borrow_mut().handle_write(payload, result);
    }
    debug!("tiller outbound loop stopped");
}

impl<T: GattTransport> Controller for TillerMotor<T> {
    fn command(&mut self, level: f64) {
        self.next_level = level.clamp(-1.0, 1.0);
    }

    fn stop(&mut self) {
        self.next_level = 0.0;
    }
}

impl<T: GattTransport> Actuator for TillerMotor<T> {
    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }
}

impl<T: GattTransport> ConnectableDevice for TillerMotor<T> {
    async fn connect(&mut self) -> Result<(), DeviceError> {
        info!("connecting to {DEVICE_NAME_PREFIX}...");
        self.transport
            .connect(DEVICE_NAME_PREFIX, SERVICE_UUID, CHARACTERISTIC_UUID)
            .await?;
        self.connected.send_replace(true);
        info!("tiller motor connected");
        Ok(())
    }

    fn disconnect(&mut self) {
        self.transport.disconnect();
        self.connected.send_replace(false);
    }

    fn connection(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }
}
