//! Transforms between tool space and actuator space
//!
//! Each supported mechanism implements [`Kinematics`]. The machine holds a [`Mechanism`], chosen
//! once from configuration, and never branches on the geometry outside of this module except to
//! reach delta-only calibration constants.

mod cartesian;
mod delta;
mod scara;

pub use cartesian::Cartesian;
pub use delta::Delta;
pub use scara::Scara;

use crate::config::MechanismConfig;
use crate::error::KinematicError;

pub const X_AXIS: usize = 0;
pub const Y_AXIS: usize = 1;
pub const Z_AXIS: usize = 2;

/// Moves shorter than this are treated as empty
const NEGLIGIBLE: f64 = 0.000001;

/// Tool position, including the extruder
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub e: f64,
}

impl Position {
    pub const fn new(x: f64, y: f64, z: f64, e: f64) -> Self {
        Self { x, y, z, e }
    }

    pub fn xyz(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }

    pub fn with_xyz(self, xyz: [f64; 3]) -> Self {
        Self {
            x: xyz[0],
            y: xyz[1],
            z: xyz[2],
            ..self
        }
    }

    /// Same position at another height
    pub fn at_z(self, z: f64) -> Self {
        Self { z, ..self }
    }

    pub fn axis(&self, axis: usize) -> f64 {
        match axis {
            X_AXIS => self.x,
            Y_AXIS => self.y,
            Z_AXIS => self.z,
            _ => self.e,
        }
    }

    pub fn axis_mut(&mut self, axis: usize) -> &mut f64 {
        match axis {
            X_AXIS => &mut self.x,
            Y_AXIS => &mut self.y,
            Z_AXIS => &mut self.z,
            _ => &mut self.e,
        }
    }
}

/// A mapping between tool space and the three actuators
pub trait Kinematics {
    /// Actuator coordinates that place the tool at `tool`
    fn to_actuator(&self, tool: [f64; 3]) -> Result<[f64; 3], KinematicError>;

    /// Tool position produced by the given actuator coordinates
    fn to_tool(&self, actuator: [f64; 3]) -> Result<[f64; 3], KinematicError>;

    /// Splits a move into straight tool space pieces
    ///
    /// `feedrate` is in mm/min, `feed_multiply` in percent.
    fn segment(&self, from: &Position, to: &Position, feedrate: f64, feed_multiply: f64) -> Segments;
}

/// Waypoints of a segmented move, excluding the start point
#[derive(Debug, Clone)]
pub struct Segments {
    start: Position,
    end: Position,
    steps: u32,
    next: u64,
}

impl Segments {
    /// The whole move as a single piece, or nothing if it has no length
    pub fn single(from: &Position, to: &Position) -> Self {
        let steps = if travel(from, to).is_some() { 1 } else { 0 };
        Self::with_steps(from, to, steps)
    }

    /// Subdivides a move so each piece lasts about `1 / segments_per_second` seconds
    pub fn timed(
        from: &Position,
        to: &Position,
        feedrate: f64,
        feed_multiply: f64,
        segments_per_second: f64,
    ) -> Self {
        let Some(distance) = travel(from, to) else {
            return Self::with_steps(from, to, 0);
        };
        let seconds = 6000.0 * distance / feedrate / feed_multiply;
        let wanted = libm::ceil(segments_per_second * seconds);
        let steps = if wanted.is_finite() && wanted >= 1.0 {
            wanted.min(f64::from(u32::MAX)) as u32
        } else {
            1
        };
        Self::with_steps(from, to, steps)
    }

    fn with_steps(from: &Position, to: &Position, steps: u32) -> Self {
        Self {
            start: *from,
            end: *to,
            steps,
            next: 1,
        }
    }

    /// Total number of waypoints
    pub fn steps(&self) -> u32 {
        self.steps
    }
}

impl Iterator for Segments {
    type Item = Position;

    fn next(&mut self) -> Option<Position> {
        let steps = u64::from(self.steps);
        if self.next > steps {
            return None;
        }
        let s = self.next;
        self.next += 1;
        if s == steps {
            return Some(self.end);
        }
        let f = s as f64 / f64::from(self.steps);
        let lerp = |a: f64, b: f64| a + (b - a) * f;
        Some(Position::new(
            lerp(self.start.x, self.end.x),
            lerp(self.start.y, self.end.y),
            lerp(self.start.z, self.end.z),
            lerp(self.start.e, self.end.e),
        ))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = u64::from(self.steps) + 1 - self.next;
        match usize::try_from(left) {
            Ok(n) => (n, Some(n)),
            Err(_) => (usize::MAX, None),
        }
    }
}

/// Length of a move in tool space, or of its extrusion for extrude-only moves
fn travel(from: &Position, to: &Position) -> Option<f64> {
    let d = [to.x - from.x, to.y - from.y, to.z - from.z];
    let mut length = libm::sqrt(d[0] * d[0] + d[1] * d[1] + d[2] * d[2]);
    if length < NEGLIGIBLE {
        length = libm::fabs(to.e - from.e);
    }
    (length >= NEGLIGIBLE).then_some(length)
}

/// The configured mechanism
#[derive(Debug, Clone, PartialEq)]
pub enum Mechanism {
    Cartesian(Cartesian),
    Delta(Delta),
    Scara(Scara),
}

impl Mechanism {
    pub fn from_config(config: &MechanismConfig) -> Self {
        match config {
            MechanismConfig::Cartesian => Mechanism::Cartesian(Cartesian),
            MechanismConfig::Delta(delta) => Mechanism::Delta(Delta::new(delta)),
            MechanismConfig::Scara(scara) => Mechanism::Scara(Scara::new(scara)),
        }
    }

    pub fn as_delta(&self) -> Option<&Delta> {
        match self {
            Mechanism::Delta(delta) => Some(delta),
            _ => None,
        }
    }

    pub fn as_delta_mut(&mut self) -> Option<&mut Delta> {
        match self {
            Mechanism::Delta(delta) => Some(delta),
            _ => None,
        }
    }

    pub fn is_delta(&self) -> bool {
        matches!(self, Mechanism::Delta(_))
    }
}

impl Kinematics for Mechanism {
    fn to_actuator(&self, tool: [f64; 3]) -> Result<[f64; 3], KinematicError> {
        match self {
            Mechanism::Cartesian(k) => k.to_actuator(tool),
            Mechanism::Delta(k) => k.to_actuator(tool),
            Mechanism::Scara(k) => k.to_actuator(tool),
        }
    }

    fn to_tool(&self, actuator: [f64; 3]) -> Result<[f64; 3], KinematicError> {
        match self {
            Mechanism::Cartesian(k) => k.to_tool(actuator),
            Mechanism::Delta(k) => k.to_tool(actuator),
            Mechanism::Scara(k) => k.to_tool(actuator),
        }
    }

    fn segment(&self, from: &Position, to: &Position, feedrate: f64, feed_multiply: f64) -> Segments {
        match self {
            Mechanism::Cartesian(k) => k.segment(from, to, feedrate, feed_multiply),
            Mechanism::Delta(k) => k.segment(from, to, feedrate, feed_multiply),
            Mechanism::Scara(k) => k.segment(from, to, feedrate, feed_multiply),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    #[test]
    fn zero_length_move_has_no_waypoints() {
        let p = Position::new(1.0, 2.0, 3.0, 0.0);
        assert_eq!(Segments::timed(&p, &p, 3000.0, 100.0, 200.0).steps(), 0);
        assert_eq!(Segments::single(&p, &p).next(), None);
    }

    #[test]
    fn crawling_feedrate_saturates_the_count() {
        let from = Position::new(0.0, 0.0, 0.0, 0.0);
        let to = Position::new(100.0, 0.0, 0.0, 0.0);
        let segments = Segments::timed(&from, &to, 1e-9, 100.0, 200.0);
        assert_eq!(segments.steps(), u32::MAX);
        assert_eq!(segments.size_hint(), (u32::MAX as usize, Some(u32::MAX as usize)));

        let mut tail = Segments {
            next: u64::from(u32::MAX),
            ..segments
        };
        assert_eq!(tail.size_hint(), (1, Some(1)));
        assert_eq!(tail.next(), Some(to));
        assert_eq!(tail.size_hint(), (0, Some(0)));
        assert_eq!(tail.next(), None);
    }

    #[test]
    fn extrude_only_move_uses_extrusion_length() {
        let from = Position::new(0.0, 0.0, 0.0, 0.0);
        let to = Position::new(0.0, 0.0, 0.0, 6.0);
        // 6mm at 600mm/min is 0.6s
        let segments = Segments::timed(&from, &to, 600.0, 100.0, 10.0);
        assert_eq!(segments.steps(), 6);
    }

    #[test]
    fn last_waypoint_is_exact_destination() {
        let from = Position::new(0.1, 0.2, 0.3, 0.0);
        let to = Position::new(10.7, -3.3, 1.0 / 3.0, 2.0);
        let last = Segments::timed(&from, &to, 1200.0, 100.0, 200.0).last();
        assert_eq!(last, Some(to));
    }

    #[test]
    fn feed_multiply_scales_segment_count() {
        let from = Position::default();
        let to = Position::new(60.0, 0.0, 0.0, 0.0);
        // 60mm at 3600mm/min is one second
        assert_eq!(Segments::timed(&from, &to, 3600.0, 100.0, 100.0).steps(), 100);
        assert_eq!(Segments::timed(&from, &to, 3600.0, 200.0, 100.0).steps(), 50);
    }

    proptest! {
        #[test]
        fn segment_count_and_spacing(
            dx in -100.0f64..100.0, dy in -100.0f64..100.0, dz in -50.0f64..50.0,
            feedrate in 60.0f64..12000.0, sps in 1.0f64..400.0,
        ) {
            let from = Position::default();
            let to = Position::new(dx, dy, dz, 0.0);
            let length = libm::sqrt(dx * dx + dy * dy + dz * dz);
            prop_assume!(length > 0.001);
            let segments = Segments::timed(&from, &to, feedrate, 100.0, sps);
            let count = segments.steps();
            let expected = libm::ceil(sps * (6000.0 * length / feedrate / 100.0)).max(1.0);
            prop_assert_eq!(f64::from(count), expected);

            let mut prev = from;
            for p in segments {
                let step = libm::sqrt((p.x - prev.x).powi(2) + (p.y - prev.y).powi(2) + (p.z - prev.z).powi(2));
                assert_abs_diff_eq!(step, length / f64::from(count), epsilon = 1e-9);
                prev = p;
            }
        }
    }
}
