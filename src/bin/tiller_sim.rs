// src/bin/tiller_sim.rs

//! # Tiller Simulator
//!
//! Runs the autopilot against the simulated boat on a virtual clock. Either
//! holds the starting heading, optionally turned by `--turn` degrees, or
//! runs one relay tuning pass on the rate or heading loop.
//!
//! Telemetry goes to the `telemetry` log target at debug level, e.g.
//! `RUST_LOG=info,telemetry=debug tiller-sim --turn -10`.

use clap::{Parser, ValueEnum};
use log::{info, warn};
use std::cell::RefCell;
use std::error::Error;
use std::path::PathBuf;
use std::rc::Rc;
use tiller_autopilot::device::{Actuator, SimulatedBoat, INITIAL_HEADING};
use tiller_autopilot::pid::TuningResult;
use tiller_autopilot::telemetry::{LogSink, NullSink, TelemetrySink};
use tiller_autopilot::{Autopilot, ConfigHandle, ConfigStore, JsonFileStore};
use tokio::sync::oneshot;

/// Loop to tune.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TuneTarget {
    /// Rotation-rate loop.
    Rate,
    /// Heading loop, cascaded onto the rate loop.
    Heading,
}

/// Command line arguments for the tiller simulator
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Run the tiller autopilot against a simulated boat",
    long_about = "Runs the cascaded heading and rotation-rate loops against a simulated \
        boat and tiller motor on a virtual clock.\n\n\
        Gains and loop settings come from the JSON configuration file. The file is \
        only written when --save is given."
)]
struct Args {
    #[arg(
        short,
        long,
        default_value = "autopilot.json",
        help = "Configuration file",
        long_help = "JSON configuration file to load. Defaults are used when the file \
            does not exist. Written back with --save."
    )]
    config: PathBuf,

    #[arg(
        short = 't',
        long,
        default_value_t = 60.0,
        help = "Simulated duration in seconds"
    )]
    duration: f64,

    #[arg(long, default_value_t = 50.0, help = "Compass sample interval in milliseconds")]
    tick_ms: f64,

    #[arg(
        long,
        default_value_t = 0.0,
        allow_hyphen_values = true,
        help = "Degrees to turn the held heading by after engaging"
    )]
    turn: f64,

    #[arg(
        long,
        value_enum,
        help = "Run a relay tuning pass instead of holding a heading"
    )]
    tune: Option<TuneTarget>,

    #[arg(long, help = "Boat speed in knots, overrides the configuration")]
    speed: Option<f64>,

    #[arg(long, help = "Heading noise seed, overrides the configuration")]
    seed: Option<u64>,

    #[arg(
        long,
        default_value_t = 1000.0,
        help = "Status report interval in simulated milliseconds"
    )]
    report_ms: f64,

    #[arg(long, help = "Save the configuration, including tuned gains, on exit")]
    save: bool,

    #[arg(long, help = "Discard per-tick telemetry records")]
    no_telemetry: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let mut args = Args::parse();
    if args.tick_ms <= 0.0 {
        return Err("--tick-ms must be positive".into());
    }

    let store = JsonFileStore::new(&args.config);
    let config = ConfigHandle::new(store.load_or_default()?)?;
    config.update(|c| {
        c.simulation.enabled = true;
        if let Some(speed) = args.speed {
            c.simulation.speed_kt = speed;
        }
        if let Some(seed) = args.seed {
            c.simulation.seed = seed;
        }
    })?;

    let boat = Rc::new(RefCell::new(SimulatedBoat::new(&config, INITIAL_HEADING)));
    let motor: Rc<RefCell<dyn Actuator>> = boat.clone();
    let telemetry: Rc<dyn TelemetrySink> = if args.no_telemetry {
        Rc::new(NullSink)
    } else {
        Rc::new(LogSink)
    };
    let mut autopilot = Autopilot::new(config, Box::new(store), motor, telemetry)?;

    let mut tuning: Option<oneshot::Receiver<TuningResult>> = None;
    let mut next_report_ms = 0.0;
    let end_ms = args.duration * 1000.0;

    while boat.borrow().time_ms() < end_ms {
        let sample = boat.borrow_mut().advance(args.tick_ms);
        autopilot.on_heading(sample);

        if !autopilot.engaged() && !autopilot.is_tuning() && tuning.is_none() {
            match args.tune {
                Some(TuneTarget::Rate) => {
                    info!("starting rate loop tune");
                    tuning = Some(autopilot.start_rate_tune());
                }
                Some(TuneTarget::Heading) => {
                    info!("starting heading loop tune");
                    tuning = Some(autopilot.start_heading_tune()?);
                }
                None => {
                    let held = autopilot.hold_current_heading()?;
                    let desired = autopilot.adjust_desired_heading(args.turn);
                    info!("holding {held:.1}, steering {desired:.1}");
                }
            }
        }

        if let Some(receiver) = tuning.as_mut() {
            if let Ok(result) = receiver.try_recv() {
                report_tuning(&result);
                tuning = None;
                args.tune = None;
                if !result.success {
                    break;
                }
            }
        }

        let boat = boat.borrow();
        if boat.time_ms() >= next_report_ms {
            info!(
                "t {:.1} s heading {:.2} desired {:.2} rate {:.3} tiller {:.2}",
                boat.time_ms() / 1000.0,
                boat.heading_real(),
                autopilot.desired_heading(),
                boat.rotation_rate_real(),
                boat.tiller_angle(),
            );
            next_report_ms += args.report_ms;
        }
    }

    if tuning.is_some() {
        warn!("simulation ended before tuning finished");
        autopilot.cancel_tune();
    }
    autopilot.disengage();

    if args.save {
        autopilot.persist()?;
    }
    Ok(())
}

fn report_tuning(result: &TuningResult) {
    info!("{}", result.description);
    if let Some(suggested) = &result.suggested {
        info!("Ku {:.4} Tu {:.2} s", suggested.ku, suggested.tu);
        for (rule, gains) in suggested.iter() {
            info!(
                "  {rule}: kp {:.4} ki {:.4} kd {:.4}",
                gains.kp, gains.ki, gains.kd
            );
        }
    }
}
