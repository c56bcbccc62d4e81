//! `hatlink`: command line access to a Build HAT.
//!
//! # Usage
//!
//! ```bash
//! # Show what is plugged into each port (reads ./hatlink.toml)
//! hatlink ports
//!
//! # Supply voltage
//! hatlink voltage
//!
//! # Turn the motor on port A a quarter turn at half speed
//! hatlink motor A --degrees 90 --speed 50
//!
//! # Use another configuration file and verbose logging
//! hatlink --config /etc/hatlink.toml --debug ports
//! ```
//!
//! The configuration must name the firmware version the HAT should run;
//! a minimal file is
//!
//! ```toml
//! firmware_version = 1636109636
//! ```
//!
//! Log output follows `RUST_LOG` when set.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use hatlink_core::{Direction, LedMode, PortId};
use hatlink_hardware::{Hat, HatBuilder, HatConfig};
use hatlink_motion::Motor;

#[derive(Parser, Debug)]
#[command(name = "hatlink", version, about = "Talk to a Build HAT over its serial link")]
struct Args {
    /// TOML configuration file; must set `firmware_version`
    #[arg(short, long, value_name = "FILE", default_value = "hatlink.toml")]
    config: PathBuf,

    /// Serial device, overriding the configuration
    #[arg(long, value_name = "PATH")]
    device: Option<String>,

    /// Debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the devices on each port
    Ports,

    /// Print the supply voltage
    Voltage,

    /// Set the LED behaviour
    Leds {
        #[arg(value_enum)]
        mode: Leds,
    },

    /// Reboot the HAT firmware
    Reboot,

    /// Move a motor
    Motor {
        /// Port letter (A-D)
        port: PortId,

        /// Turn by this many degrees
        #[arg(long, allow_hyphen_values = true, conflicts_with_all = ["to", "seconds"])]
        degrees: Option<f64>,

        /// Turn to this absolute angle
        #[arg(long, allow_hyphen_values = true, conflicts_with = "seconds")]
        to: Option<f64>,

        /// Sense of rotation for --to: shortest, clockwise or anticlockwise
        #[arg(long, default_value = "shortest")]
        direction: Direction,

        /// Run for this many seconds
        #[arg(long)]
        seconds: Option<f64>,

        /// Speed, -100 to 100
        #[arg(long, allow_hyphen_values = true)]
        speed: Option<f64>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Leds {
    Voltage,
    Off,
    Orange,
    Green,
    Both,
}

impl From<Leds> for LedMode {
    fn from(leds: Leds) -> Self {
        match leds {
            Leds::Voltage => LedMode::Voltage,
            Leds::Off => LedMode::Off,
            Leds::Orange => LedMode::Orange,
            Leds::Green => LedMode::Green,
            Leds::Both => LedMode::Both,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    let mut config = HatConfig::load(&args.config)
        .await
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(device) = &args.device {
        config.device.clone_from(device);
    }

    let hat = HatBuilder::new()
        .config(config)
        .open()
        .await
        .context("starting the HAT")?;

    let result = run(&hat, args.command).await;
    hat.shutdown().await.context("shutting the HAT down")?;
    result
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(hat: &Hat, command: Command) -> Result<()> {
    let timeout = hat.config().timing.wait_timeout();
    match command {
        Command::Ports => {
            for info in hat.ports() {
                println!("{}: {} ({})", info.port, info.name, info.description);
            }
        }
        Command::Voltage => {
            let volts = hat.voltage(timeout).await.context("reading voltage")?;
            println!("{volts:.1} V");
        }
        Command::Leds { mode } => hat.set_leds(mode.into()).await?,
        Command::Reboot => {
            hat.reboot(startup_bound(hat)).await.context("rebooting")?;
            info!(ready = hat.ready_count(), "HAT rebooted");
        }
        Command::Motor {
            port,
            degrees,
            to,
            direction,
            seconds,
            speed,
        } => {
            let motor = Motor::new(hat, port)
                .await
                .with_context(|| format!("no motor on port {port}"))?;
            let moved = match (degrees, to, seconds) {
                (Some(degrees), _, _) => motor.run_for_degrees(degrees, speed).await,
                (_, Some(angle), _) => motor.run_to_position(angle, speed, direction).await,
                (_, _, Some(seconds)) => motor.run_for_seconds(seconds, speed).await,
                (None, None, None) => Ok(()),
            };
            let position = motor.position().await;
            motor.release().await?;
            moved.context("moving motor")?;
            println!("port {port}: position {}", position?);
        }
    }
    Ok(())
}

fn startup_bound(hat: &Hat) -> Duration {
    hat.config().timing.startup_timeout()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_config_defaults_to_local_file() {
        let args = Args::try_parse_from(["hatlink", "ports"]).unwrap();
        assert_eq!(args.config, PathBuf::from("hatlink.toml"));

        let args = Args::try_parse_from(["hatlink", "-c", "/etc/hatlink.toml", "ports"]).unwrap();
        assert_eq!(args.config, PathBuf::from("/etc/hatlink.toml"));
    }

    #[test]
    fn test_motor_arguments() {
        let args = Args::try_parse_from([
            "hatlink", "motor", "b", "--to", "-90", "--direction", "anticlockwise",
        ])
        .unwrap();
        let Command::Motor {
            port, to, direction, ..
        } = args.command
        else {
            panic!("expected motor command");
        };
        assert_eq!(port, PortId::new(1).unwrap());
        assert_eq!(to, Some(-90.0));
        assert_eq!(direction, Direction::Anticlockwise);
    }

    #[test]
    fn test_motor_moves_are_exclusive() {
        let result = Args::try_parse_from([
            "hatlink", "motor", "A", "--degrees", "90", "--seconds", "2",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_bad_direction_is_rejected() {
        let result =
            Args::try_parse_from(["hatlink", "motor", "A", "--to", "10", "--direction", "up"]);
        assert!(result.is_err());
    }
}
