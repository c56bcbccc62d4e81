//! Motion arithmetic.
//!
//! Positions arrive from the motor in degrees; the `set ramp` command takes
//! rotations. Everything here is pure so it can be checked without a HAT.

use hatlink_core::{Direction, HatError, Result, SpeedUnit};

/// Degrees in one rotation.
pub const DEGREES_PER_ROTATION: f64 = 360.0;

/// Percent speeds are scaled by this before a ramp; 100% becomes
/// five rotations per second.
pub const PERCENT_RAMP_SCALE: f64 = 0.05;

/// Seconds per minute, for RPM speeds.
const RPM_DIVISOR: f64 = 60.0;

/// Check that `speed` lies within `min..=max`.
///
/// # Errors
/// Returns `HatError::InvalidArgument` otherwise (including NaN).
pub fn check_speed(speed: f64, min: f64, max: f64) -> Result<f64> {
    if (min..=max).contains(&speed) {
        Ok(speed)
    } else {
        Err(HatError::invalid_argument(format!(
            "invalid speed {speed}, should be {min} to {max}"
        )))
    }
}

/// Check that `value` lies within `0..=1`, naming it in the error.
pub fn check_unit(name: &str, value: f64) -> Result<f64> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(HatError::invalid_argument(format!("{name} should be 0 to 1")))
    }
}

/// Speed as the ramp generator expects it, in rotations per second.
pub fn ramp_speed(speed: f64, unit: SpeedUnit) -> f64 {
    match unit {
        SpeedUnit::Percent => speed * PERCENT_RAMP_SCALE,
        SpeedUnit::Rpm => speed / RPM_DIVISOR,
    }
}

/// Speed as the pulse and continuous controllers expect it.
pub fn drive_speed(speed: f64, unit: SpeedUnit) -> f64 {
    match unit {
        SpeedUnit::Percent => speed,
        SpeedUnit::Rpm => speed / RPM_DIVISOR,
    }
}

/// Signed shortest turn from `current` to `target`, both in degrees.
///
/// The result lies in `(-180, 180]`: a half turn is always taken
/// clockwise (positive).
pub fn shortest_delta(current: f64, target: f64) -> f64 {
    let delta = (target - current + 180.0).rem_euclid(DEGREES_PER_ROTATION) - 180.0;
    if delta <= -180.0 { delta + DEGREES_PER_ROTATION } else { delta }
}

/// Turn from `current` to `target` in the requested sense.
///
/// Clockwise is the positive direction. When the shortest turn goes the
/// other way, the complementary arc is taken instead.
pub fn directed_delta(current: f64, target: f64, direction: Direction) -> f64 {
    let shortest = shortest_delta(current, target);
    match direction {
        Direction::Shortest => shortest,
        Direction::Clockwise if shortest < 0.0 => shortest + DEGREES_PER_ROTATION,
        Direction::Anticlockwise if shortest > 0.0 => shortest - DEGREES_PER_ROTATION,
        Direction::Clockwise | Direction::Anticlockwise => shortest,
    }
}

/// A linear position ramp, in rotations and seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ramp {
    pub from: f64,
    pub to: f64,
    pub duration: f64,
}

impl Ramp {
    /// Ramp between two positions in rotations at `speed` (rotations per
    /// second, sign ignored).
    ///
    /// # Errors
    /// Returns `HatError::InvalidArgument` for a zero speed.
    pub fn between(from: f64, to: f64, speed: f64) -> Result<Self> {
        if speed == 0.0 || !speed.is_finite() {
            return Err(HatError::invalid_argument("ramp speed must be non-zero"));
        }
        Ok(Self {
            from,
            to,
            duration: ((to - from) / speed).abs(),
        })
    }

    /// Ramp turning `degrees` from `position` (degrees). A negative
    /// `speed` turns the other way.
    ///
    /// # Errors
    /// Returns `HatError::InvalidArgument` for a zero speed.
    pub fn for_degrees(position: f64, degrees: f64, speed: f64, unit: SpeedUnit) -> Result<Self> {
        let sign = if speed < 0.0 { -1.0 } else { 1.0 };
        let target = (degrees * sign + position) / DEGREES_PER_ROTATION;
        Self::between(
            position / DEGREES_PER_ROTATION,
            target,
            ramp_speed(speed.abs(), unit),
        )
    }

    /// Ramp from `position` (degrees, relative) to the absolute angle
    /// `target`, given the current absolute angle `absolute`.
    ///
    /// # Errors
    /// Returns `HatError::InvalidArgument` for a zero speed.
    pub fn to_position(
        position: f64,
        absolute: f64,
        target: f64,
        direction: Direction,
        speed: f64,
        unit: SpeedUnit,
    ) -> Result<Self> {
        let delta = directed_delta(absolute, target, direction);
        Self::between(
            position / DEGREES_PER_ROTATION,
            (position + delta) / DEGREES_PER_ROTATION,
            ramp_speed(speed, unit),
        )
    }
}

/// Whole degrees in `rotations`, truncated toward zero.
pub fn rotations_to_degrees(rotations: f64) -> f64 {
    (rotations * DEGREES_PER_ROTATION).trunc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[rstest]
    #[case(0.0, 90.0, 90.0)]
    #[case(0.0, -90.0, -90.0)]
    #[case(170.0, -170.0, 20.0)]
    #[case(-170.0, 170.0, -20.0)]
    #[case(0.0, 180.0, 180.0)]
    #[case(0.0, -180.0, 180.0)]
    #[case(90.0, -90.0, 180.0)]
    #[case(45.0, 45.0, 0.0)]
    fn test_shortest_delta(#[case] current: f64, #[case] target: f64, #[case] expected: f64) {
        assert!(close(shortest_delta(current, target), expected));
    }

    #[test]
    fn test_directed_delta_from_zero_to_170() {
        assert!(close(directed_delta(0.0, 170.0, Direction::Clockwise), 170.0));
        assert!(close(directed_delta(0.0, 170.0, Direction::Anticlockwise), -190.0));
        assert!(close(directed_delta(0.0, 170.0, Direction::Shortest), 170.0));
    }

    #[test]
    fn test_directed_delta_takes_complementary_arc() {
        assert!(close(directed_delta(0.0, -90.0, Direction::Clockwise), 270.0));
        assert!(close(directed_delta(0.0, 90.0, Direction::Anticlockwise), -270.0));
        assert!(close(directed_delta(10.0, 10.0, Direction::Clockwise), 0.0));
    }

    #[test]
    fn test_ramp_for_degrees() {
        let ramp = Ramp::for_degrees(0.0, 90.0, 50.0, SpeedUnit::Percent).unwrap();
        assert!(close(ramp.from, 0.0));
        assert!(close(ramp.to, 0.25));
        // 50% is 2.5 rotations per second.
        assert!(close(ramp.duration, 0.1));

        let backwards = Ramp::for_degrees(360.0, 90.0, -50.0, SpeedUnit::Percent).unwrap();
        assert!(close(backwards.from, 1.0));
        assert!(close(backwards.to, 0.75));
    }

    #[test]
    fn test_ramp_rpm_speed() {
        let ramp = Ramp::for_degrees(0.0, 360.0, 60.0, SpeedUnit::Rpm).unwrap();
        assert!(close(ramp.duration, 1.0));
    }

    #[test]
    fn test_zero_speed_ramp_is_rejected() {
        assert!(matches!(
            Ramp::for_degrees(0.0, 90.0, 0.0, SpeedUnit::Percent),
            Err(HatError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_ramp_to_position() {
        // Two full turns in, pointing at 0, going to 170 the long way round.
        let ramp = Ramp::to_position(
            720.0,
            0.0,
            170.0,
            Direction::Anticlockwise,
            20.0,
            SpeedUnit::Percent,
        )
        .unwrap();
        assert!(close(ramp.from, 2.0));
        assert!(close(ramp.to, (720.0 - 190.0) / 360.0));
    }

    #[rstest]
    #[case(-100.0, true)]
    #[case(100.0, true)]
    #[case(0.0, true)]
    #[case(100.5, false)]
    #[case(f64::NAN, false)]
    fn test_check_speed(#[case] speed: f64, #[case] ok: bool) {
        assert_eq!(check_speed(speed, -100.0, 100.0).is_ok(), ok);
    }

    #[test]
    fn test_rotations_to_degrees_truncates() {
        assert!(close(rotations_to_degrees(1.5), 540.0));
        assert!(close(rotations_to_degrees(0.0014), 0.0));
        assert!(close(rotations_to_degrees(-0.5), -180.0));
    }

    proptest! {
        #[test]
        fn prop_shortest_delta_in_range(current in -180i32..=180, target in -180i32..=180) {
            let delta = shortest_delta(f64::from(current), f64::from(target));
            prop_assert!(delta > -180.0 && delta <= 180.0);
        }

        #[test]
        fn prop_directed_delta_reaches_target(current in -180i32..=180, target in -180i32..=180) {
            for direction in [Direction::Shortest, Direction::Clockwise, Direction::Anticlockwise] {
                let delta = directed_delta(f64::from(current), f64::from(target), direction);
                let landed = (f64::from(current) + delta - f64::from(target)).rem_euclid(360.0);
                prop_assert!(landed < 1e-9 || landed > 360.0 - 1e-9);
                match direction {
                    Direction::Clockwise => prop_assert!(delta >= 0.0),
                    Direction::Anticlockwise => prop_assert!(delta <= 0.0),
                    Direction::Shortest => prop_assert!(delta.abs() <= 180.0),
                }
            }
        }

        #[test]
        fn prop_ramp_duration_non_negative(
            position in -10_000.0f64..10_000.0,
            degrees in -10_000.0f64..10_000.0,
            speed in prop_oneof![-100.0f64..-0.1, 0.1f64..100.0],
        ) {
            let ramp = Ramp::for_degrees(position, degrees, speed, SpeedUnit::Percent).unwrap();
            prop_assert!(ramp.duration >= 0.0);
            prop_assert!(ramp.duration.is_finite());
        }
    }
}
