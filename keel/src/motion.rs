//! Moves and homing
//!
//! Segmented moves go through the configured mechanism, are validated end to end, and only then
//! handed to the planner. Raw moves skip segmentation and bed correction; they are used while
//! homing and probing where the straight actuator path is what matters.

use crate::error::MachineError;
use crate::housekeeping;
use crate::kinematics::{Kinematics, Mechanism, Position, Z_AXIS};
use crate::machine::Machine;
use crate::planner::Planner;
use crate::response::ResponseOutput;
use crate::Housekeeping;

impl<P: Planner, H: Housekeeping, O: ResponseOutput> Machine<P, H, O> {
    /// Applies the software limits to a destination
    pub fn clamp(&self, mut dest: Position) -> Position {
        if self.config.motion.software_endstops {
            for (axis, limits) in self.config.axes.iter().enumerate() {
                let v = dest.axis_mut(axis);
                *v = v.clamp(limits.min_pos, limits.max_pos);
            }
        }
        dest
    }

    /// Actuator coordinates for a tool point, optionally including bed correction
    pub(crate) fn actuator_for(&self, tool: [f64; 3], corrected: bool) -> Result<[f64; 3], MachineError> {
        let mut actuator = self.mechanism.to_actuator(tool)?;
        if corrected {
            let h = self.correction.height_at(tool[0], tool[1]);
            if h != 0.0 {
                match self.mechanism {
                    Mechanism::Delta(_) => actuator.iter_mut().for_each(|a| *a += h),
                    _ => actuator[Z_AXIS] += h,
                }
            }
        }
        Ok(actuator)
    }

    /// Moves to `dest` at the commanded feedrate
    pub fn prepare_move(&mut self, dest: Position) -> Result<(), MachineError> {
        self.prepare_move_at(dest, self.feedrate)
    }

    /// Segmented, bed corrected move at `feedrate` mm/min
    ///
    /// The destination is clamped first. If any waypoint is unreachable nothing is sent to the
    /// planner and the tool position is left alone.
    pub fn prepare_move_at(&mut self, dest: Position, feedrate: f64) -> Result<(), MachineError> {
        let dest = self.clamp(dest);
        let segments = self
            .mechanism
            .segment(&self.position, &dest, feedrate, self.feed_multiply);
        for waypoint in segments.clone() {
            self.actuator_for(waypoint.xyz(), true)?;
        }

        let rate = feedrate * self.feed_multiply / 100.0 / 60.0;
        for waypoint in segments {
            let actuator = self.actuator_for(waypoint.xyz(), true)?;
            housekeeping::wait_for_space(&self.planner, &mut self.housekeeping);
            self.planner.buffer_line(actuator, waypoint.e, rate);
        }
        self.position = dest;
        Ok(())
    }

    /// A single straight actuator move to `dest`, `feedrate` in mm/min
    pub fn prepare_move_raw(&mut self, dest: Position, feedrate: f64) -> Result<(), MachineError> {
        let actuator = self.actuator_for(dest.xyz(), false)?;
        housekeeping::wait_for_space(&self.planner, &mut self.housekeeping);
        self.planner.buffer_line(actuator, dest.e, feedrate / 60.0);
        self.position = dest;
        Ok(())
    }

    /// Raw move at travel speed, waiting until it completes
    pub fn blocking_move_to(&mut self, x: f64, y: f64, z: f64) -> Result<(), MachineError> {
        let dest = self.position.with_xyz([x, y, z]);
        self.prepare_move_raw(dest, self.config.probe.travel_feedrate)?;
        self.synchronize();
        Ok(())
    }

    /// Declares the tool to be at `position` without moving
    pub fn set_position(&mut self, position: Position) -> Result<(), MachineError> {
        let actuator = self.actuator_for(position.xyz(), true)?;
        self.planner.set_position(actuator, position.e);
        self.position = position;
        Ok(())
    }

    /// Declares the tool position from the actuator step counters after an endstop stop
    pub(crate) fn position_from_steps(&mut self) -> Result<(), MachineError> {
        let xyz = self.measured_position()?;
        self.position = self.position.with_xyz(xyz);
        Ok(())
    }

    /// Homes every axis and marks the position known
    pub fn home(&mut self) -> Result<(), MachineError> {
        self.synchronize();
        self.homed = [false; 3];
        let e = self.position.e;
        if self.mechanism.is_delta() {
            self.home_delta(e)?;
        } else {
            self.home_axes(e)?;
        }
        self.planner.endstops_hit_on_purpose();
        self.homed = [true; 3];
        log::info!(
            "homed at X:{:.2} Y:{:.2} Z:{:.2}",
            self.position.x,
            self.position.y,
            self.position.z
        );
        Ok(())
    }

    fn home_delta(&mut self, e: f64) -> Result<(), MachineError> {
        let rate = self.config.axes[Z_AXIS].homing_feedrate / 60.0;
        let up = 3.0 * self.config.max_length(Z_AXIS);
        self.planner.set_position([0.0; 3], e);
        self.planner.enable_endstops(true);
        self.planner.buffer_line([up; 3], e, rate);
        self.synchronize();
        self.planner.endstops_hit_on_purpose();

        let mut actuator = self.actuator_from_steps();
        for tower in 0..3 {
            self.home_actuator(tower, &mut actuator, e);
        }

        let top = Position::new(0.0, 0.0, self.config.axes[Z_AXIS].max_pos, e);
        let actuator = self.actuator_for(top.xyz(), false)?;
        self.planner.set_position(actuator, e);
        self.position = top;
        Ok(())
    }

    fn home_axes(&mut self, e: f64) -> Result<(), MachineError> {
        self.planner.enable_endstops(true);
        let mut actuator = self.actuator_from_steps();
        for axis in 0..3 {
            self.home_actuator(axis, &mut actuator, e);
        }
        let axes = &self.config.axes;
        let home = Position::new(axes[0].home_pos, axes[1].home_pos, axes[2].home_pos, e);
        let actuator = self.actuator_for(home.xyz(), false)?;
        self.planner.set_position(actuator, e);
        self.position = home;
        Ok(())
    }

    /// Runs one actuator into its endstop: fast approach, back off, slow approach
    ///
    /// The homed actuator ends at coordinate zero, or at its endstop offset on a delta.
    fn home_actuator(&mut self, axis: usize, actuator: &mut [f64; 3], e: f64) {
        let cfg = self.config.axes[axis];
        let dir = f64::from(cfg.home_dir);
        let fast = cfg.homing_feedrate / 60.0;
        let delta = self.mechanism.as_delta().map(|d| d.endstop_adj()[axis]);
        let slow = if delta.is_some() { fast / 4.0 } else { fast / 2.0 };

        actuator[axis] = 0.0;
        self.planner.set_position(*actuator, e);
        actuator[axis] = 1.5 * self.config.max_length(axis) * dir;
        self.move_actuator(actuator, e, fast);

        self.planner.enable_endstops(false);
        actuator[axis] = 0.0;
        self.planner.set_position(*actuator, e);
        actuator[axis] = -cfg.home_retract * dir;
        self.move_actuator(actuator, e, fast);
        self.planner.enable_endstops(true);

        actuator[axis] = 2.0 * cfg.home_retract * dir;
        self.move_actuator(actuator, e, slow);
        actuator[axis] = 0.0;
        self.planner.set_position(*actuator, e);

        if let Some(adj) = delta.filter(|adj| adj * dir < 0.0) {
            self.planner.enable_endstops(false);
            actuator[axis] = adj;
            self.move_actuator(actuator, e, slow);
            self.planner.enable_endstops(true);
        }
        self.planner.endstops_hit_on_purpose();
        log::debug!("actuator {} homed", axis);
    }

    /// Moves in actuator space and records where the planner actually stopped
    fn move_actuator(&mut self, actuator: &mut [f64; 3], e: f64, rate: f64) {
        housekeeping::wait_for_space(&self.planner, &mut self.housekeeping);
        self.planner.buffer_line(*actuator, e, rate);
        self.synchronize();
        *actuator = self.actuator_from_steps();
    }
}

#[cfg(test)]
mod tests {
    use crate::bed_level::BedCorrection;
    use crate::error::{KinematicError, MachineError};
    use crate::kinematics::{Kinematics, Position};
    use crate::machine::testing::*;
    use approx::assert_abs_diff_eq;
    use core::cell::RefCell;

    #[test]
    fn cartesian_move_is_one_line() {
        let out = RefCell::new(Vec::new());
        let mut m = cartesian(&out);
        m.prepare_move_at(Position::new(10.0, 20.0, 5.0, 1.0), 600.0).unwrap();
        assert_eq!(m.planner.lines.len(), 1);
        let (target, rate) = m.planner.lines[0];
        assert_eq!(target, [10.0, 20.0, 5.0]);
        assert_abs_diff_eq!(rate, 10.0, epsilon = 1e-12);
        assert_eq!(m.position(), Position::new(10.0, 20.0, 5.0, 1.0));
    }

    #[test]
    fn destination_is_clamped_before_moving() {
        let out = RefCell::new(Vec::new());
        let mut m = cartesian(&out);
        m.prepare_move(Position::new(500.0, -3.0, 10.0, 0.0)).unwrap();
        assert_eq!(m.position().xyz(), [200.0, 0.0, 10.0]);
    }

    #[test]
    fn delta_move_is_segmented_and_ends_on_target() {
        let out = RefCell::new(Vec::new());
        let mut m = delta(&out);
        m.position = Position::new(0.0, 0.0, 10.0, 0.0);
        // 30mm at 1800mm/min is one second, 200 segments per second
        m.prepare_move_at(Position::new(30.0, 0.0, 10.0, 0.0), 1800.0).unwrap();
        assert_eq!(m.planner.lines.len(), 200);
        let expected = m.mechanism().to_actuator([30.0, 0.0, 10.0]).unwrap();
        let last = m.planner.lines.last().unwrap().0;
        for i in 0..3 {
            assert_abs_diff_eq!(last[i], expected[i], epsilon = 1e-9);
        }
    }

    #[test]
    fn unreachable_waypoint_sends_nothing() {
        let out = RefCell::new(Vec::new());
        let mut m = delta(&out);
        m.config.motion.software_endstops = false;
        m.position = Position::new(0.0, 0.0, 10.0, 0.0);
        let err = m.prepare_move_at(Position::new(400.0, 0.0, 10.0, 0.0), 1800.0);
        assert_eq!(err, Err(MachineError::Kinematic(KinematicError::Unreachable)));
        assert!(m.planner.lines.is_empty());
        assert_eq!(m.position(), Position::new(0.0, 0.0, 10.0, 0.0));
    }

    #[test]
    fn bed_correction_lifts_every_tower() {
        let out = RefCell::new(Vec::new());
        let mut m = delta(&out);
        m.position = Position::new(0.0, 0.0, 10.0, 0.0);
        m.set_correction(BedCorrection::Plane { a: 0.0, b: 0.0, d: 0.5 });
        m.prepare_move_at(Position::new(0.0, 0.0, 20.0, 0.0), 1800.0).unwrap();
        let plain = m.mechanism().to_actuator([0.0, 0.0, 20.0]).unwrap();
        let last = m.planner.lines.last().unwrap().0;
        for i in 0..3 {
            assert_abs_diff_eq!(last[i], plain[i] + 0.5, epsilon = 1e-9);
        }
    }

    #[test]
    fn homing_delta_reaches_top_centre() {
        let out = RefCell::new(Vec::new());
        let mut m = delta(&out);
        m.homed = [false; 3];
        m.home().unwrap();
        assert!(m.is_homed());
        assert_eq!(m.position().xyz(), [0.0, 0.0, 250.0]);
        let top = m.mechanism().to_actuator([0.0, 0.0, 250.0]).unwrap();
        assert_eq!(m.planner.position, top);
    }

    #[test]
    fn homing_cartesian_takes_home_positions() {
        let out = RefCell::new(Vec::new());
        let mut m = cartesian(&out);
        m.homed = [false; 3];
        m.home().unwrap();
        assert_eq!(m.position().xyz(), [0.0, 0.0, 0.0]);
        assert!(m.require_homed().is_ok());
    }

    #[test]
    fn set_position_declares_without_motion() {
        let out = RefCell::new(Vec::new());
        let mut m = cartesian(&out);
        m.set_position(Position::new(5.0, 6.0, 7.0, 8.0)).unwrap();
        assert!(m.planner.lines.is_empty());
        assert_eq!(m.planner.position, [5.0, 6.0, 7.0]);
        assert_eq!(m.planner.e, 8.0);
    }
}
