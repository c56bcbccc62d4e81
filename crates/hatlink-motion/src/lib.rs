//! # hatlink-motion
//!
//! Motor control on top of `hatlink-hardware`.
//!
//! [`Motor`] owns one port and offers positional moves (by degrees, by
//! rotations, to an absolute angle), timed runs, continuous drive and
//! open-loop PWM, plus readings and a rotation callback. The arithmetic
//! behind the moves lives in [`arith`] and is usable on its own.
//!
//! ```no_run
//! use hatlink_core::{Direction, PortId};
//! use hatlink_hardware::{Hat, HatConfig};
//! use hatlink_motion::Motor;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = HatConfig::load("hatlink.toml").await?;
//! let hat = Hat::builder().config(config).open().await?;
//! let motor = Motor::new(&hat, PortId::new(0)?).await?;
//! motor.run_for_rotations(2.0, Some(50.0)).await?;
//! motor.run_to_position(90.0, None, Direction::Shortest).await?;
//! motor.release().await?;
//! hat.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod arith;
pub mod motor;

pub use arith::Ramp;
pub use motor::{MOTOR_CLASS, Motor, Rotation, RotationCallback};
