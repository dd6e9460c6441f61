// src/device/simulated.rs

//! # Simulated Boat
//!
//! A boat and tiller motor in one, for running the control loops without
//! hardware. Motor commands set the tiller's angular rate and are latched
//! on the same 200 ms cadence the wireless motor is written at. The heading
//! turns at `tiller_angle × speed`, and the reported heading carries seeded
//! uniform noise.

use crate::config::{Binding, ConfigHandle};
use crate::device::{Actuator, ConnectableDevice, Controller};
use crate::error::DeviceError;
use crate::navigation::{kt_to_mps, normalize_heading, normalized_angle_delta};
use crate::sensor::{HeadingSample, SpeedSensor};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;

/// Heading the simulated boat starts on.
pub const INITIAL_HEADING: f64 = 30.0;

/// Interval at which motor commands take effect, in milliseconds.
pub const COMMAND_LATCH_MS: f64 = 200.0;

/// Tiller angular rate at full command, in degrees per second.
pub const TILLER_RATE_PER_LEVEL: f64 = 0.2;

/// Reads boat speed from the simulation settings.
#[derive(Debug, Clone)]
pub struct ConfigSpeed {
    speed_kt: Binding<f64>,
}

impl ConfigSpeed {
    /// Binds to `simulation.speed_kt`.
    pub fn new(config: &ConfigHandle) -> Self {
        Self {
            speed_kt: config.bind(|c| c.simulation.speed_kt),
        }
    }
}

impl SpeedSensor for ConfigSpeed {
    fn speed_mps(&self) -> f64 {
        kt_to_mps(self.speed_kt.get())
    }
}

/// Simulated hull, tiller and compass.
#[derive(Debug)]
pub struct SimulatedBoat {
    speed_kt: Binding<f64>,
    noise_amplitude: Binding<f64>,
    rng: StdRng,
    time_ms: f64,
    heading: f64,
    previous: Option<(f64, f64)>,
    tiller_angle: f64,
    tiller_rate: f64,
    next_tiller_rate: f64,
    next_latch_ms: f64,
    connected: watch::Sender<bool>,
}

impl SimulatedBoat {
    /// Creates a boat at rest on `heading`, seeded from `simulation.seed`.
    pub fn new(config: &ConfigHandle, heading: f64) -> Self {
        let seed = config.read(|c| c.simulation.seed);
        let (connected, _) = watch::channel(true);
        Self {
            speed_kt: config.bind(|c| c.simulation.speed_kt),
            noise_amplitude: config.bind(|c| c.simulation.noise_amplitude),
            rng: StdRng::seed_from_u64(seed),
            time_ms: 0.0,
            heading: normalize_heading(heading),
            previous: None,
            tiller_angle: 0.0,
            tiller_rate: 0.0,
            next_tiller_rate: 0.0,
            next_latch_ms: 0.0,
            connected,
        }
    }

    /// Advances the simulation by `dt_ms` and returns the compass reading.
    pub fn advance(&mut self, dt_ms: f64) -> HeadingSample {
        self.time_ms += dt_ms;
        while self.next_latch_ms <= self.time_ms {
            self.tiller_rate = self.next_tiller_rate;
            self.next_latch_ms += COMMAND_LATCH_MS;
        }

        let dt_s = dt_ms / 1000.0;
        self.previous = Some((self.time_ms - dt_ms, self.heading));
        self.tiller_angle += self.tiller_rate * dt_s;
        self.heading =
            normalize_heading(self.heading - self.tiller_angle * dt_s * self.speed_kt.get());

        let noise = (self.rng.random::<f64>() - 0.5) * self.noise_amplitude.get();
        HeadingSample::new(self.time_ms, normalize_heading(self.heading + noise))
    }

    /// Simulation clock in milliseconds.
    pub fn time_ms(&self) -> f64 {
        self.time_ms
    }

    /// Noise-free heading.
    pub fn heading_real(&self) -> f64 {
        self.heading
    }

    /// Current tiller angle in degrees.
    pub fn tiller_angle(&self) -> f64 {
        self.tiller_angle
    }

    /// Noise-free rotation rate over the last step, positive when the
    /// heading decreases.
    pub fn rotation_rate_real(&self) -> f64 {
        match self.previous {
            Some((time_ms, heading)) if self.time_ms > time_ms => {
                -normalized_angle_delta(self.heading, heading) / ((self.time_ms - time_ms) / 1000.0)
            }
            _ => 0.0,
        }
    }

    /// A speed sensor reading the simulated speed.
    pub fn speed_sensor(&self) -> ConfigSpeed {
        ConfigSpeed {
            speed_kt: self.speed_kt.clone(),
        }
    }
}

impl Controller for SimulatedBoat {
    fn command(&mut self, level: f64) {
        self.next_tiller_rate = level.clamp(-1.0, 1.0) * TILLER_RATE_PER_LEVEL;
    }

    fn stop(&mut self) {
        self.next_tiller_rate = 0.0;
    }
}

impl Actuator for SimulatedBoat {
    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }
}

impl ConnectableDevice for SimulatedBoat {
    async fn connect(&mut self) -> Result<(), DeviceError> {
        self.connected.send_replace(true);
        info!("simulated tiller connected");
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected.send_replace(false);
        debug!("simulated tiller disconnected");
    }

    fn connection(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AutopilotConfig;
    use crate::test_utils::*;

    fn quiet_config() -> ConfigHandle {
        let mut config = AutopilotConfig::default();
        config.simulation.noise_amplitude = 0.0;
        config.simulation.speed_kt = 2.0;
        ConfigHandle::new(config).unwrap()
    }

    /// Test that commands only take effect at the next latch.
    #[test]
    fn test_simulated_boat_latches_commands() {
        let config = quiet_config();
        let mut boat = SimulatedBoat::new(&config, INITIAL_HEADING);
        boat.advance(50.0);
        boat.command(1.0);
        boat.advance(50.0);
        boat.advance(50.0);
        assert_eq!(boat.tiller_angle(), 0.0);

        boat.advance(50.0);
        assert!(value_close(0.2 * 0.05, boat.tiller_angle()));
    }

    /// Test that a positive command turns the boat to lower headings.
    #[test]
    fn test_simulated_boat_positive_command_lowers_heading() {
        let config = quiet_config();
        let mut boat = SimulatedBoat::new(&config, 5.0);
        boat.command(1.0);
        for _ in 0..200 {
            boat.advance(50.0);
        }
        // Tiller angle after 10 s at 0.2 deg/s, heading wrapped below north.
        assert!(value_within(2.0, boat.tiller_angle(), 0.011));
        assert!(boat.heading_real() > 300.0);
        assert!(boat.rotation_rate_real() > 0.0);

        // Stop takes effect at the next latch.
        boat.stop();
        for _ in 0..4 {
            boat.advance(50.0);
        }
        let angle = boat.tiller_angle();
        for _ in 0..10 {
            boat.advance(50.0);
        }
        assert_eq!(boat.tiller_angle(), angle);
    }

    /// Test that the same seed reproduces the same noisy readings.
    #[test]
    fn test_simulated_boat_seeded_noise() {
        let mut config = AutopilotConfig::default();
        config.simulation.noise_amplitude = 2.0;
        config.simulation.seed = 7;
        let config = ConfigHandle::new(config).unwrap();

        let mut a = SimulatedBoat::new(&config, 90.0);
        let mut b = SimulatedBoat::new(&config, 90.0);
        for _ in 0..20 {
            let (sa, sb) = (a.advance(50.0), b.advance(50.0));
            assert_eq!(sa, sb);
            assert!(value_within(90.0, sa.heading, 1.0));
        }
    }

    /// Test the connection state is observable through the watch channel.
    #[tokio::test]
    async fn test_simulated_boat_connection() {
        let config = quiet_config();
        let mut boat = SimulatedBoat::new(&config, 0.0);
        let watcher = boat.connection();
        assert!(boat.is_connected());

        boat.disconnect();
        assert!(!boat.is_connected());
        assert!(!*watcher.borrow());

        boat.connect().await.unwrap();
        assert!(*watcher.borrow());
    }

    /// Test the config-backed speed sensor follows live updates.
    #[test]
    fn test_config_speed() {
        let config = quiet_config();
        let speed = ConfigSpeed::new(&config);
        assert!(value_close(2.0, speed.speed_kt()));
        config.update(|c| c.simulation.speed_kt = 5.0).unwrap();
        assert!(value_close(5.0, speed.speed_kt()));
    }
}
