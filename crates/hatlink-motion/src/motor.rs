//! Motor handle.
//!
//! A [`Motor`] wraps a [`Device`] on a port carrying one of the tacho
//! motors. It streams speed, position and absolute position as one combi
//! sample and drives the motor through the HAT's own controllers:
//!
//! | Operation | Controller | Completes on |
//! |---|---|---|
//! | `run_for_degrees`, `run_for_rotations`, `run_to_position` | position ramp | `ramp done` |
//! | `run_for_seconds` | speed pulse | `pulse done` |
//! | `start` | continuous speed | never; `stop` coasts |
//! | `pwm` | open loop | immediately |
//!
//! Every blocking move waits for its completion line with a bound of the
//! computed duration plus the configured motion slack.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use tracing::{debug, info};

use hatlink_core::{
    Direction, HatError, PortId, Result, Sample, SpeedUnit, Value, constants::DEFAULT_SELRATE_MS,
};
use hatlink_hardware::{Callback, Device, Hat};
use hatlink_protocol::CommandBuilder;

use crate::arith::{self, Ramp};

/// Class name motors are catalogued under.
pub const MOTOR_CLASS: &str = "Motor";

/// The medium linear motor has no absolute position sensor.
const LINEAR_MOTOR_TYPE_ID: i32 = 38;

const WITH_ABSOLUTE: &[(u8, u8)] = &[(1, 0), (2, 0), (3, 0)];
const WITHOUT_ABSOLUTE: &[(u8, u8)] = &[(1, 0), (2, 0)];

const RAMP_PID: &str = "0 1 s4 0.0027777778 0 5 0 .1 3 0.01";
const SPEED_PID: &str = "0 0 s1 1 0 0.003 0.01 0 100 0.01";
const RPM_PID: &str = "0 5 s2 0.0027777778 1 0 2.5 0 .4 0.01";

/// Pause between a finished ramp and coasting, so the motor settles on
/// its target first.
const RAMP_RELEASE_DELAY: Duration = Duration::from_millis(200);

const DEFAULT_SPEED: f64 = 20.0;
const DEFAULT_PLIMIT: f64 = 0.7;
const DEFAULT_PWM_THRESHOLD: f64 = 0.65;
const DEFAULT_MIN_PWM: f64 = 0.01;

/// Indices into a motor sample.
const SPEED: usize = 0;
const POSITION: usize = 1;
const ABSOLUTE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Idle,
    Free,
    Degrees,
    Seconds,
}

#[derive(Debug)]
struct MotorState {
    default_speed: f64,
    unit: SpeedUnit,
    release: bool,
    run_mode: RunMode,
    /// Processed speed of the running continuous drive.
    current_speed: f64,
}

/// One rotation report passed to a [`Motor::when_rotated`] callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rotation {
    pub speed: i64,
    /// Degrees from the position at power-up.
    pub position: i64,
    /// Degrees in `-180..=180`; `None` on motors without the sensor.
    pub absolute: Option<i64>,
}

impl Rotation {
    fn from_sample(values: &[Value], has_absolute: bool) -> Option<Self> {
        let speed = values.get(SPEED)?.as_i64();
        let position = values.get(POSITION)?.as_i64();
        let absolute = if has_absolute {
            Some(values.get(ABSOLUTE)?.as_i64())
        } else {
            None
        };
        Some(Self {
            speed,
            position,
            absolute,
        })
    }
}

/// Callback for [`Motor::when_rotated`]. Awaited on the dispatch worker, so
/// it may drive the motor itself.
pub type RotationCallback = Arc<dyn Fn(Rotation) -> BoxFuture<'static, ()> + Send + Sync>;

/// A tacho motor on one port.
#[derive(Debug)]
pub struct Motor {
    device: Device,
    has_absolute: bool,
    state: Mutex<MotorState>,
}

impl Motor {
    /// Take the motor on `port` and configure it: combi sample of speed,
    /// position and (where available) absolute position, power limit 0.7,
    /// PWM thresholds 0.65 / 0.01.
    ///
    /// # Errors
    /// - `HatError::DeviceNotFound` if `port` has no motor
    /// - `HatError::PortInUse` if the port is owned
    pub async fn new(hat: &Hat, port: PortId) -> Result<Self> {
        let device = Device::acquire(hat, port, MOTOR_CLASS)?;
        let has_absolute = device.type_id() != LINEAR_MOTOR_TYPE_ID;
        let motor = Self {
            device,
            has_absolute,
            state: Mutex::new(MotorState {
                default_speed: DEFAULT_SPEED,
                unit: SpeedUnit::Percent,
                release: true,
                run_mode: RunMode::Idle,
                current_speed: 0.0,
            }),
        };

        let pairs = if has_absolute { WITH_ABSOLUTE } else { WITHOUT_ABSOLUTE };
        motor.device.mode_combi(pairs).await?;
        motor.plimit(DEFAULT_PLIMIT).await?;
        motor
            .pwmparams(DEFAULT_PWM_THRESHOLD, DEFAULT_MIN_PWM)
            .await?;
        info!(%port, type_id = motor.device.type_id(), has_absolute, "Motor ready");
        Ok(motor)
    }

    pub fn port(&self) -> PortId {
        self.device.port()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// False on motors without an absolute position sensor.
    pub fn has_absolute_position(&self) -> bool {
        self.has_absolute
    }

    fn lock(&self) -> MutexGuard<'_, MotorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn command(&self) -> CommandBuilder {
        CommandBuilder::for_port(self.port())
    }

    pub fn default_speed(&self) -> f64 {
        self.lock().default_speed
    }

    /// Speed used when a move is given none.
    ///
    /// # Errors
    /// Returns `HatError::InvalidArgument` outside `-100..=100`.
    pub fn set_default_speed(&self, speed: f64) -> Result<()> {
        self.lock().default_speed = arith::check_speed(speed, -100.0, 100.0)?;
        Ok(())
    }

    pub fn speed_unit(&self) -> SpeedUnit {
        self.lock().unit
    }

    pub fn set_speed_unit(&self, unit: SpeedUnit) {
        self.lock().unit = unit;
    }

    /// Whether the motor is coasted after a move, so it can be turned by hand.
    pub fn release_after_move(&self) -> bool {
        self.lock().release
    }

    pub fn set_release(&self, release: bool) {
        self.lock().release = release;
    }

    fn speed_or_default(&self, speed: Option<f64>, min: f64) -> Result<f64> {
        let speed = speed.unwrap_or_else(|| self.default_speed());
        arith::check_speed(speed, min, 100.0)
    }

    fn set_run_mode(&self, mode: RunMode) {
        self.lock().run_mode = mode;
    }

    fn wait_bound(&self, seconds: f64) -> Result<Duration> {
        let motion = Duration::try_from_secs_f64(seconds)
            .map_err(|e| HatError::invalid_argument(format!("invalid duration {seconds}: {e}")))?;
        Ok(motion + self.device.hat().config().timing.motion_slack())
    }

    async fn sample(&self) -> Result<Sample> {
        let timeout = self.device.hat().config().timing.wait_timeout();
        self.device.get(timeout).await
    }

    async fn reading(&self, index: usize) -> Result<i64> {
        let sample = self.sample().await?;
        sample.get(index).map(Value::as_i64).ok_or_else(|| {
            HatError::invalid_argument(format!(
                "sample from port {} has no value {index}",
                self.port()
            ))
        })
    }

    /// Degrees turned since power-up.
    pub async fn position(&self) -> Result<i64> {
        self.reading(POSITION).await
    }

    /// Absolute angle in `-180..=180`.
    ///
    /// # Errors
    /// Returns `HatError::InvalidArgument` on motors without the sensor.
    pub async fn absolute_position(&self) -> Result<i64> {
        if !self.has_absolute {
            return Err(HatError::invalid_argument(
                "no absolute position with this motor",
            ));
        }
        self.reading(ABSOLUTE).await
    }

    pub async fn speed(&self) -> Result<i64> {
        self.reading(SPEED).await
    }

    /// Turn by `degrees`. A negative speed turns the other way.
    ///
    /// # Errors
    /// Returns `HatError::InvalidArgument` for a speed outside `-100..=100`
    /// or zero, `HatError::Timeout` if the ramp does not complete.
    pub async fn run_for_degrees(&self, degrees: f64, speed: Option<f64>) -> Result<()> {
        let speed = self.speed_or_default(speed, -100.0)?;
        self.set_run_mode(RunMode::Degrees);
        let result = async {
            let position = self.position().await?;
            let ramp = Ramp::for_degrees(position as f64, degrees, speed, self.speed_unit())?;
            self.run_ramp(ramp).await
        }
        .await;
        self.set_run_mode(RunMode::Idle);
        result
    }

    /// Turn by whole degrees in `rotations`.
    pub async fn run_for_rotations(&self, rotations: f64, speed: Option<f64>) -> Result<()> {
        self.run_for_degrees(arith::rotations_to_degrees(rotations), speed)
            .await
    }

    /// Turn to the absolute angle `degrees`.
    ///
    /// # Errors
    /// Returns `HatError::InvalidArgument` for a speed outside `0..=100`
    /// (or zero) or an angle outside `-180..=180`.
    pub async fn run_to_position(
        &self,
        degrees: f64,
        speed: Option<f64>,
        direction: Direction,
    ) -> Result<()> {
        let speed = self.speed_or_default(speed, 0.0)?;
        if !(-180.0..=180.0).contains(&degrees) {
            return Err(HatError::invalid_argument(format!("invalid angle {degrees}")));
        }
        self.set_run_mode(RunMode::Degrees);
        let result = async {
            let sample = self.sample().await?;
            let value = |index: usize| sample.get(index).map(Value::as_f64);
            let position = value(POSITION)
                .ok_or_else(|| HatError::invalid_argument("motor sample has no position"))?;
            let absolute = if self.has_absolute {
                value(ABSOLUTE).ok_or_else(|| {
                    HatError::invalid_argument("motor sample has no absolute position")
                })?
            } else {
                position
            };
            let ramp = Ramp::to_position(
                position,
                absolute,
                degrees,
                direction,
                speed,
                self.speed_unit(),
            )?;
            self.run_ramp(ramp).await
        }
        .await;
        self.set_run_mode(RunMode::Idle);
        result
    }

    async fn run_ramp(&self, ramp: Ramp) -> Result<()> {
        let port = self.port();
        debug!(%port, from = ramp.from, to = ramp.to, duration = ramp.duration, "Ramp");
        let command = self
            .command()
            .select(Some(0))
            .selrate(DEFAULT_SELRATE_MS)
            .pid(port, RAMP_PID)
            .set_ramp(ramp.from, ramp.to, ramp.duration);
        let bound = self.wait_bound(ramp.duration)?;

        let done = self.device.hat().expect_ramp_done(port);
        self.device.send(command).await?;
        done.wait(bound).await?;

        if self.release_after_move() {
            tokio::time::sleep(RAMP_RELEASE_DELAY).await;
            self.coast().await?;
        }
        Ok(())
    }

    fn with_speed_pid(&self, command: CommandBuilder) -> CommandBuilder {
        let port = self.port();
        let command = command.select(Some(0)).selrate(DEFAULT_SELRATE_MS);
        match self.speed_unit() {
            SpeedUnit::Percent => command.pid(port, SPEED_PID),
            SpeedUnit::Rpm => command.pid_diff(port, RPM_PID),
        }
    }

    /// Run at `speed` for `seconds`.
    ///
    /// # Errors
    /// Returns `HatError::InvalidArgument` for a speed outside `-100..=100`
    /// or a negative duration, `HatError::Timeout` if the pulse does not
    /// complete.
    pub async fn run_for_seconds(&self, seconds: f64, speed: Option<f64>) -> Result<()> {
        let speed = self.speed_or_default(speed, -100.0)?;
        let bound = self.wait_bound(seconds)?;
        let speed = arith::drive_speed(speed, self.speed_unit());

        self.set_run_mode(RunMode::Seconds);
        let result = async {
            let port = self.port();
            let command = self.with_speed_pid(self.command()).set_pulse(speed, seconds);
            let done = self.device.hat().expect_pulse_done(port);
            self.device.send(command).await?;
            done.wait(bound).await?;
            if self.release_after_move() {
                self.coast().await?;
            }
            Ok(())
        }
        .await;
        self.set_run_mode(RunMode::Idle);
        result
    }

    /// Run continuously at `speed`.
    ///
    /// Changes the speed of a running motor. Does nothing while a timed or
    /// positional move is in progress.
    pub async fn start(&self, speed: Option<f64>) -> Result<()> {
        let speed = self.speed_or_default(speed, -100.0)?;
        let (mode, current, unit) = {
            let state = self.lock();
            (state.run_mode, state.current_speed, state.unit)
        };
        let speed = arith::drive_speed(speed, unit);

        let command = match mode {
            RunMode::Free if current == speed => return Ok(()),
            RunMode::Free => self.command().set(speed),
            RunMode::Idle => self.with_speed_pid(self.command()).set(speed),
            RunMode::Degrees | RunMode::Seconds => {
                debug!(port = %self.port(), ?mode, "Motor busy, start ignored");
                return Ok(());
            }
        };
        self.device.send(command).await?;
        let mut state = self.lock();
        state.run_mode = RunMode::Free;
        state.current_speed = speed;
        Ok(())
    }

    /// Stop and coast.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.lock();
            state.run_mode = RunMode::Idle;
            state.current_speed = 0.0;
        }
        self.coast().await
    }

    /// Let the motor spin freely.
    pub async fn coast(&self) -> Result<()> {
        self.device.send(self.command().coast()).await
    }

    /// Open-loop drive at `value` in `-1..=1`.
    pub async fn pwm(&self, value: f64) -> Result<()> {
        if !(-1.0..=1.0).contains(&value) {
            return Err(HatError::invalid_argument("pwm should be -1 to 1"));
        }
        self.device.send(self.command().pwm().set(value)).await
    }

    /// Hold the motor with zero drive.
    pub async fn float(&self) -> Result<()> {
        self.pwm(0.0).await
    }

    /// Limit motor power to `limit` in `0..=1`.
    pub async fn plimit(&self, limit: f64) -> Result<()> {
        let limit = arith::check_unit("plimit", limit)?;
        self.device
            .configure("plimit", self.command().port_plimit(limit))
            .await
    }

    /// PWM thresholds: below `threshold` switch from fast to slow PWM, below
    /// `min` switch the drive off. Both in `0..=1`.
    pub async fn pwmparams(&self, threshold: f64, min: f64) -> Result<()> {
        let threshold = arith::check_unit("pwmthresh", threshold)?;
        let min = arith::check_unit("minpwm", min)?;
        self.device
            .configure("pwmparams", self.command().pwmparams(threshold, min))
            .await
    }

    /// Call `callback` whenever the position changes by at least a degree,
    /// or stop with `None`. The first sample only sets the reference.
    pub async fn when_rotated(&self, callback: Option<RotationCallback>) -> Result<()> {
        let Some(callback) = callback else {
            return self.device.set_callback(None).await;
        };
        let has_absolute = self.has_absolute;
        let last = Mutex::new(None::<i64>);
        let on_sample: Callback = Arc::new(move |values: Sample| {
            let Some(rotation) = Rotation::from_sample(&values, has_absolute) else {
                return future::ready(()).boxed();
            };
            let moved = {
                let mut last = last.lock().unwrap_or_else(PoisonError::into_inner);
                match *last {
                    Some(previous) if (rotation.position - previous).abs() < 1 => false,
                    Some(_) => {
                        *last = Some(rotation.position);
                        true
                    }
                    None => {
                        *last = Some(rotation.position);
                        false
                    }
                }
            };
            if moved {
                callback(rotation)
            } else {
                future::ready(()).boxed()
            }
        });
        self.device.set_callback(Some(on_sample)).await
    }

    /// Give the port up. See [`Device::release`].
    pub async fn release(&self) -> Result<()> {
        self.device.release().await
    }
}
