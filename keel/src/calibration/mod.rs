//! Delta geometry calibration
//!
//! The bed is probed at seven points: the centre, the three tower-aligned points, and the three
//! points opposite each tower. Each adjustment routine nudges one group of geometry constants
//! and re-probes until the affected points read flat:
//!
//! | Routine                       | Constants              | Points watched        |
//! |-------------------------------|------------------------|-----------------------|
//! | [`adjust_endstops`]           | endstop offsets        | tower points          |
//! | [`adjust_delta_radius`]       | delta radius           | centre                |
//! | [`adjust_tower_radius`]       | one tower's radius     | opposite points       |
//! | [`adjust_tower_angle`]        | one tower's angle      | the other two opposite|
//! | [`adjust_diagonal_rod`]       | diagonal rod           | centre vs opposite    |
//!
//! [`auto_calibrate`] strings them together. The routines only see the machine through
//! [`ProbeRig`], which the [`Machine`] implements on top of real probing.

mod auto;
mod endstops;
mod radius;
mod rod;
mod tower;

pub use auto::{auto_calibrate, CalibrationOutcome, CalibrationRequest};
pub use endstops::adjust_endstops;
pub use radius::adjust_delta_radius;
pub use rod::adjust_diagonal_rod;
pub use tower::{adjust_tower_angle, adjust_tower_radius, fix_tower_errors};

use crate::config::CalibrationConfig;
use crate::error::MachineError;
use crate::housekeeping::Housekeeping;
use crate::kinematics::{Delta, Kinematics, Z_AXIS};
use crate::machine::{Machine, CALIBRATION_POINTS};
use crate::planner::Planner;
use crate::respond;
use crate::response::ResponseOutput;
use core::fmt;
use libm::fabs;

const SIN_60: f64 = 0.866_025_403_784_438_6;
const COS_60: f64 = 0.5;

/// The seven calibration points, in probing order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Point {
    Centre = 0,
    /// Next to the Z tower
    Z,
    /// Opposite the Y tower
    OppositeY,
    X,
    OppositeZ,
    Y,
    OppositeX,
}

impl Point {
    pub const ALL: [Point; CALIBRATION_POINTS] = [
        Point::Centre,
        Point::Z,
        Point::OppositeY,
        Point::X,
        Point::OppositeZ,
        Point::Y,
        Point::OppositeX,
    ];

    /// Points on the circle between the towers
    pub const OPPOSITE: [Point; 3] = [Point::OppositeX, Point::OppositeY, Point::OppositeZ];

    /// The point next to tower `t` (0 = X)
    pub fn tower(t: usize) -> Point {
        [Point::X, Point::Y, Point::Z][t]
    }

    /// The point opposite tower `t`
    pub fn opposite(t: usize) -> Point {
        Point::OPPOSITE[t]
    }

    /// Short name used in progress lines
    pub fn label(self) -> &'static str {
        ["c", "z", "oy", "x", "oz", "y", "ox"][self as usize]
    }

    /// Bed coordinates on a circle of `radius`
    pub fn xy(self, radius: f64) -> [f64; 2] {
        let (x, y) = match self {
            Point::Centre => (0.0, 0.0),
            Point::Z => (0.0, 1.0),
            Point::OppositeY => (-SIN_60, COS_60),
            Point::X => (-SIN_60, -COS_60),
            Point::OppositeZ => (0.0, -1.0),
            Point::Y => (SIN_60, -COS_60),
            Point::OppositeX => (SIN_60, COS_60),
        };
        [x * radius, y * radius]
    }
}

/// Latest readings and tolerances of a calibration run
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationState {
    pub precision: f64,
    pub bed_radius: f64,
    pub max_iterations: usize,
    pub max_steps: usize,
    points: [f64; CALIBRATION_POINTS],
}

impl CalibrationState {
    pub fn new(config: &CalibrationConfig) -> Self {
        Self {
            precision: config.precision,
            bed_radius: config.bed_radius,
            max_iterations: config.max_iterations,
            max_steps: config.max_steps,
            points: [0.0; CALIBRATION_POINTS],
        }
    }

    pub fn get(&self, point: Point) -> f64 {
        self.points[point as usize]
    }

    pub fn set(&mut self, point: Point, z: f64) {
        self.points[point as usize] = z;
    }

    pub fn within(&self, point: Point) -> bool {
        fabs(self.get(point)) <= self.precision
    }

    pub fn all_within(&self, points: &[Point]) -> bool {
        points.iter().all(|p| self.within(*p))
    }
}

/// What the calibration routines need from a machine
pub trait ProbeRig {
    fn delta(&self) -> Result<&Delta, MachineError>;

    fn delta_mut(&mut self) -> Result<&mut Delta, MachineError>;

    /// Bed height under bed coordinates `(x, y)`
    fn probe(&mut self, x: f64, y: f64) -> Result<f64, MachineError>;

    /// Adds `adjust` to the endstop offsets without moving the carriages
    fn apply_endstop_adjustment(&mut self, adjust: [f64; 3]) -> Result<(), MachineError>;

    /// Lowers the top of the Z travel
    fn reduce_build_height(&mut self, by: f64);

    fn reset_safe_height(&mut self);

    fn rehome(&mut self) -> Result<(), MachineError>;

    /// Remembers the carriage positions of the last reading under calibration point `slot`
    fn save_carriages(&mut self, _slot: usize) {}

    fn raise_to_safe_height(&mut self) -> Result<(), MachineError> {
        Ok(())
    }

    /// Emits one response line
    fn report(&self, args: fmt::Arguments<'_>);
}

/// Probes one calibration point and records its reading
pub fn probe_point<R: ProbeRig + ?Sized>(
    rig: &mut R,
    state: &mut CalibrationState,
    point: Point,
) -> Result<f64, MachineError> {
    let [x, y] = point.xy(state.bed_radius);
    let z = rig.probe(x, y)?;
    state.set(point, z);
    rig.save_carriages(point as usize);
    Ok(z)
}

/// Probes all seven points
pub fn probe_all<R: ProbeRig + ?Sized>(
    rig: &mut R,
    state: &mut CalibrationState,
) -> Result<(), MachineError> {
    rig.raise_to_safe_height()?;
    for point in Point::ALL {
        probe_point(rig, state, point)?;
    }
    Ok(())
}

/// Prints the readings laid out as seen from above, with the current geometry
pub fn report<R: ProbeRig + ?Sized>(rig: &R, state: &CalibrationState) -> Result<(), MachineError> {
    let d = rig.delta()?.config();
    let p = |point| state.get(point);
    let pad = |point| if p(point) >= 0.0 { " " } else { "" };

    rig.report(format_args!("|\tZ-Tower\t\t\tEndstop Offsets"));
    rig.report(format_args!(
        "| \t{}{:.4}\t\t\tX:{:.2} Y:{:.2} Z:{:.2}",
        pad(Point::Z),
        p(Point::Z),
        d.endstop_adj[0],
        d.endstop_adj[1],
        d.endstop_adj[2]
    ));
    rig.report(format_args!(
        "| {:.4}\t\t{:.4}\tTower Offsets",
        p(Point::OppositeY),
        p(Point::OppositeX)
    ));
    rig.report(format_args!(
        "| \t{}{:.4}\t\t\tA:{:.2} B:{:.2} C:{:.2} ",
        pad(Point::Centre),
        p(Point::Centre),
        d.tower_adj[0],
        d.tower_adj[1],
        d.tower_adj[2]
    ));
    rig.report(format_args!(
        "| {:.4}\t\t{:.4}\tI:{:.2} J:{:.2} K:{:.2}",
        p(Point::X),
        p(Point::Y),
        d.tower_adj[3],
        d.tower_adj[4],
        d.tower_adj[5]
    ));
    rig.report(format_args!(
        "| \t{}{:.4}\t\t\tDelta Radius: {:.4}",
        pad(Point::OppositeZ),
        p(Point::OppositeZ),
        d.radius
    ));
    rig.report(format_args!(
        "| X-Tower\t\tY-Tower\tDiagonal Rod: {:.4}",
        d.diagonal_rod
    ));
    rig.report(format_args!(""));
    Ok(())
}

/// Next step of a one-dimensional search
///
/// The step is reversed and halved when the error changes sign or gets worse, so a search
/// started in the wrong direction still converges.
pub(crate) fn refine(step: f64, previous: f64, error: f64) -> f64 {
    if (previous > 0.0) != (error > 0.0) || fabs(error) > fabs(previous) {
        -step / 2.0
    } else {
        step
    }
}

/// Treats a search that ran out of steps as finished
pub(crate) fn tolerate<T>(result: Result<T, MachineError>, fallback: T) -> Result<T, MachineError> {
    match result {
        Err(MachineError::NotConverged) => {
            log::warn!("calibration step search hit its cap, keeping the best value found");
            Ok(fallback)
        }
        other => other,
    }
}

impl<P: Planner, H: Housekeeping, O: ResponseOutput> ProbeRig for Machine<P, H, O> {
    fn delta(&self) -> Result<&Delta, MachineError> {
        self.require_delta()
    }

    fn delta_mut(&mut self) -> Result<&mut Delta, MachineError> {
        self.require_delta_mut()
    }

    fn probe(&mut self, x: f64, y: f64) -> Result<f64, MachineError> {
        self.probe_bed(x, y)
    }

    fn apply_endstop_adjustment(&mut self, adjust: [f64; 3]) -> Result<(), MachineError> {
        let delta = self.require_delta_mut()?;
        for (tower, a) in adjust.iter().enumerate() {
            let value = delta.endstop_adj()[tower] + a;
            delta.set_endstop_adj(tower, value);
        }
        let mut actuator = self.mechanism.to_actuator(self.position.xyz())?;
        for (value, a) in actuator.iter_mut().zip(adjust) {
            *value -= a;
        }
        self.planner.set_position(actuator, self.position.e);
        self.synchronize();
        Ok(())
    }

    fn reduce_build_height(&mut self, by: f64) {
        self.config.axes[Z_AXIS].max_pos -= by;
        log::info!("build height now {:.3}", self.config.axes[Z_AXIS].max_pos);
    }

    fn reset_safe_height(&mut self) {
        self.safe_z = self.config.probe.lift - self.config.probe.offset[Z_AXIS];
    }

    fn rehome(&mut self) -> Result<(), MachineError> {
        self.home()
    }

    fn save_carriages(&mut self, slot: usize) {
        if let Some(saved) = self.carriages.get_mut(slot) {
            *saved = self.last_carriages;
        }
    }

    fn raise_to_safe_height(&mut self) -> Result<(), MachineError> {
        let up = self.position.at_z(self.safe_z);
        self.prepare_move_raw(up, self.config.probe.travel_feedrate)?;
        self.synchronize();
        Ok(())
    }

    fn report(&self, args: fmt::Arguments<'_>) {
        respond!(self.output, "{}", args);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A delta whose true geometry differs from what the controller believes

    use super::*;
    use crate::config::DeltaConfig;
    use core::cell::RefCell;
    use std::string::{String, ToString};
    use std::vec::Vec;

    pub struct VirtualDelta {
        pub believed: Delta,
        pub truth: Delta,
        /// Physical endstop positions, in carriage height
        endstops: [f64; 3],
        pub max_z: f64,
        /// Physical carriage height minus believed carriage height
        offset: [f64; 3],
        pub probes: usize,
        pub out: RefCell<Vec<String>>,
    }

    impl VirtualDelta {
        /// `endstop_error` raises each tower's physical endstop
        pub fn new(truth: Delta, endstop_error: [f64; 3]) -> Self {
            let max_z = 250.0;
            let top = truth.to_actuator([0.0, 0.0, max_z]).unwrap();
            let mut rig = Self {
                believed: Delta::new(&DeltaConfig::default()),
                truth,
                endstops: [
                    top[0] + endstop_error[0],
                    top[1] + endstop_error[1],
                    top[2] + endstop_error[2],
                ],
                max_z,
                offset: [0.0; 3],
                probes: 0,
                out: RefCell::new(Vec::new()),
            };
            rig.rehome().unwrap();
            rig
        }

        pub fn lines(&self) -> Vec<String> {
            self.out.borrow().clone()
        }
    }

    impl ProbeRig for VirtualDelta {
        fn delta(&self) -> Result<&Delta, MachineError> {
            Ok(&self.believed)
        }

        fn delta_mut(&mut self) -> Result<&mut Delta, MachineError> {
            Ok(&mut self.believed)
        }

        fn probe(&mut self, x: f64, y: f64) -> Result<f64, MachineError> {
            self.probes += 1;
            let mut z = 0.0;
            for _ in 0..60 {
                let mut carriages = self.believed.to_actuator([x, y, z])?;
                for (c, o) in carriages.iter_mut().zip(self.offset) {
                    *c += o;
                }
                let true_z = self.truth.to_tool(carriages)?[2];
                z -= true_z;
                if fabs(true_z) < 1e-12 {
                    break;
                }
            }
            Ok(z)
        }

        fn apply_endstop_adjustment(&mut self, adjust: [f64; 3]) -> Result<(), MachineError> {
            for t in 0..3 {
                self.offset[t] += adjust[t];
                let value = self.believed.endstop_adj()[t] + adjust[t];
                self.believed.set_endstop_adj(t, value);
            }
            Ok(())
        }

        fn reduce_build_height(&mut self, by: f64) {
            self.max_z -= by;
        }

        fn reset_safe_height(&mut self) {}

        fn rehome(&mut self) -> Result<(), MachineError> {
            let believed = self.believed.to_actuator([0.0, 0.0, self.max_z])?;
            for t in 0..3 {
                let retract = self.believed.endstop_adj()[t].min(0.0);
                self.offset[t] = self.endstops[t] + retract - believed[t];
            }
            Ok(())
        }

        fn report(&self, args: fmt::Arguments<'_>) {
            self.out.borrow_mut().push(args.to_string());
        }
    }

    /// A delta with the default geometry, otherwise changed by `adjust`
    pub fn truth(adjust: impl FnOnce(&mut Delta)) -> Delta {
        let mut delta = Delta::new(&DeltaConfig::default());
        adjust(&mut delta);
        delta
    }

    pub fn state() -> CalibrationState {
        CalibrationState::new(&CalibrationConfig::default())
    }
}
