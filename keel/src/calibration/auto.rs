use super::{
    adjust_delta_radius, adjust_diagonal_rod, adjust_endstops, adjust_tower_angle,
    adjust_tower_radius, fix_tower_errors, probe_all, report, tolerate, CalibrationState, Point,
    ProbeRig,
};
use crate::bed_level::BedCorrection;
use crate::error::MachineError;
use crate::housekeeping::Housekeeping;
use crate::machine::Machine;
use crate::planner::Planner;
use crate::respond;
use crate::response::ResponseOutput;

/// Result of a calibration loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationOutcome {
    Converged { iterations: usize },
    DidNotConverge { iterations: usize },
}

const CORE: [Point; 4] = [Point::Centre, Point::X, Point::Y, Point::Z];

/// Runs every adjustment until all seven points are within precision
///
/// The inner loop levels the endstops and the centre. When an opposite point is still out, the
/// towers are diagnosed and corrected, or failing that the diagonal rod; either change needs a
/// fresh homing. Stops after `max_iterations` inner passes.
pub fn auto_calibrate<R: ProbeRig + ?Sized>(
    rig: &mut R,
    state: &mut CalibrationState,
) -> Result<CalibrationOutcome, MachineError> {
    let mut iterations = 0;
    loop {
        loop {
            if iterations >= state.max_iterations {
                log::warn!("calibration gave up after {} iterations", iterations);
                return Ok(CalibrationOutcome::DidNotConverge { iterations });
            }
            iterations += 1;
            rig.report(format_args!("Iteration: {}", iterations));
            rig.report(format_args!("Checking/Adjusting endstop offsets"));
            tolerate(adjust_endstops(rig, state), 0)?;
            probe_all(rig, state)?;
            report(rig, state)?;

            let radius_adjusted = if state.within(Point::Centre) {
                false
            } else {
                rig.report(format_args!("Checking delta radius"));
                tolerate(adjust_delta_radius(rig, state), true)?
            };
            if state.all_within(&CORE) && !radius_adjusted {
                break;
            }
        }

        if !state.all_within(&Point::OPPOSITE) {
            rig.report(format_args!("Checking for tower geometry errors.."));
            if fix_tower_errors(rig, state)? {
                rig.report(format_args!("Tower Postions changed .. Homing Endstops"));
                rig.rehome()?;
                rig.reset_safe_height();
            } else {
                rig.report(format_args!("Checking DiagRod Length"));
                if tolerate(adjust_diagonal_rod(rig, state), 0.0)? != 0.0 {
                    rig.report(format_args!("Diag Rod Length changed .. Homing Endstops"));
                    rig.rehome()?;
                    rig.reset_safe_height();
                }
            }
            probe_all(rig, state)?;
            report(rig, state)?;
        }

        if state.all_within(&Point::ALL) {
            log::info!("calibration converged after {} iterations", iterations);
            return Ok(CalibrationOutcome::Converged { iterations });
        }
    }
}

/// Sub-commands of a delta calibration request
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CalibrationRequest {
    /// Print the carriage positions saved by the last full probe
    pub show_carriages: bool,
    /// Probe a single point and report its height
    pub probe_at: Option<[f64; 2]>,
    /// Run the composite calibration
    pub auto: bool,
    /// New precision, zero keeps the current one
    pub precision: Option<f64>,
    pub endstops: bool,
    pub radius: bool,
    /// Tower, numbered from 1, whose angle is adjusted
    pub tower_angle: Option<i32>,
    /// Tower, numbered from 1, whose radius is adjusted
    pub tower_radius: Option<i32>,
    pub rod: bool,
}

fn tower_index(tower: i32) -> Result<usize, MachineError> {
    match tower {
        1..=3 => Ok(tower as usize - 1),
        _ => Err(MachineError::Argument("Tower must be 1, 2 or 3")),
    }
}

impl<P: Planner, H: Housekeeping, O: ResponseOutput> Machine<P, H, O> {
    /// Probes and calibrates a delta
    ///
    /// Returns the outcome of the last calibration loop that ran, if any.
    pub fn delta_calibration(
        &mut self,
        request: &CalibrationRequest,
    ) -> Result<Option<CalibrationOutcome>, MachineError> {
        self.require_homed()?;
        self.require_delta()?;
        for tower in [request.tower_angle, request.tower_radius].into_iter().flatten() {
            tower_index(tower)?;
        }
        self.synchronize();
        self.correction = BedCorrection::None;

        if request.show_carriages {
            respond!(self.output, "Carriage Positions for last scan:");
            for c in self.carriages {
                respond!(self.output, "[{:.2}, {:.2}, {:.2}]", c[0], c[1], c[2]);
            }
            return Ok(None);
        }

        if let Some([x, y]) = request.probe_at {
            self.planner.deploy_probe();
            let height = self.probe_bed(x, y);
            self.synchronize();
            self.planner.stow_probe();
            let height = height?;
            let c = self.last_carriages;
            respond!(self.output, "Bed Z-Height at X:{:.2} Y:{:.2} = {:.4}", x, y, height);
            respond!(
                self.output,
                "Carriage Positions: [{:.2}, {:.2}, {:.2}]",
                c[0],
                c[1],
                c[2]
            );
            return Ok(None);
        }

        let saved = (self.feedrate, self.feed_multiply);
        self.feed_multiply = 100.0;
        let result = self.run_calibration(request);
        self.synchronize();
        self.planner.stow_probe();
        (self.feedrate, self.feed_multiply) = saved;
        result
    }

    fn run_calibration(
        &mut self,
        request: &CalibrationRequest,
    ) -> Result<Option<CalibrationOutcome>, MachineError> {
        if request.auto {
            respond!(self.output, "Starting Auto Calibration..");
            if let Some(precision) = request.precision.filter(|p| *p != 0.0) {
                self.precision = precision;
            }
            respond!(self.output, "Calibration precision: +/-{:.3}mm", self.precision);
        }

        self.home()?;
        self.planner.deploy_probe();
        self.safe_z = self.position.z;

        let mut state = CalibrationState::new(&self.config.calibration);
        state.precision = self.precision;
        probe_all(self, &mut state)?;
        report(self, &state)?;
        let mut outcome = None;

        if request.endstops {
            outcome = Some(self.repeat_until_level(&mut state, false)?);
            if matches!(outcome, Some(CalibrationOutcome::Converged { .. })) {
                respond!(self.output, "Endstop adjustment complete");
            }
        }
        if request.radius {
            outcome = Some(self.repeat_until_level(&mut state, true)?);
        }
        if let Some(tower) = request.tower_angle {
            respond!(self.output, "Adjusting Tower Delta for tower{}", tower);
            tolerate(adjust_tower_angle(self, &mut state, tower_index(tower)?), ())?;
            respond!(self.output, "Tower Delta adjustment complete");
        }
        if request.rod {
            respond!(self.output, "Adjusting Diagonal Rod Length");
            tolerate(adjust_diagonal_rod(self, &mut state), 0.0)?;
            respond!(self.output, "Diagonal Rod Length adjustment complete");
        }
        if let Some(tower) = request.tower_radius {
            respond!(self.output, "Adjusting Tower Radius for tower{}", tower);
            tolerate(adjust_tower_radius(self, &mut state, tower_index(tower)?), ())?;
            respond!(self.output, "Tower Radius adjustment complete");
        }
        if request.auto {
            let result = auto_calibrate(self, &mut state)?;
            match result {
                CalibrationOutcome::Converged { .. } => {
                    respond!(self.output, "Autocalibration Complete");
                }
                CalibrationOutcome::DidNotConverge { iterations } => {
                    respond!(
                        self.output,
                        "Error:Autocalibration did not converge after {} iterations",
                        iterations
                    );
                }
            }
            outcome = Some(result);
        }
        Ok(outcome)
    }

    /// Endstop passes, with radius passes when `radius` is set, until the core points are level
    fn repeat_until_level(
        &mut self,
        state: &mut CalibrationState,
        radius: bool,
    ) -> Result<CalibrationOutcome, MachineError> {
        let watched: &[Point] = if radius { &CORE } else { &CORE[1..] };
        for iteration in 1..=state.max_iterations {
            respond!(self.output, "Iteration: {}", iteration);
            respond!(self.output, "Checking/Adjusting endstop offsets");
            tolerate(adjust_endstops(self, state), 0)?;
            probe_all(self, state)?;
            report(self, state)?;
            if radius {
                respond!(self.output, "Checking delta radius");
                tolerate(adjust_delta_radius(self, state), true)?;
            }
            if state.all_within(watched) {
                return Ok(CalibrationOutcome::Converged {
                    iterations: iteration,
                });
            }
        }
        Ok(CalibrationOutcome::DidNotConverge {
            iterations: state.max_iterations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::machine::testing::{cartesian, delta};
    use core::cell::RefCell;
    use libm::fabs;

    fn settle(rig: &mut VirtualDelta, state: &mut CalibrationState) -> CalibrationOutcome {
        probe_all(rig, state).unwrap();
        let outcome = auto_calibrate(rig, state).unwrap();
        probe_all(rig, state).unwrap();
        outcome
    }

    #[test]
    fn endstop_errors_alone_converge_at_once() {
        let mut rig = VirtualDelta::new(truth(|_| {}), [0.3, -0.2, 0.1]);
        let mut state = state();
        assert_eq!(
            settle(&mut rig, &mut state),
            CalibrationOutcome::Converged { iterations: 1 }
        );
        assert!(state.all_within(&Point::ALL));
    }

    #[test]
    fn mixed_geometry_errors_converge() {
        let truth = truth(|d| {
            d.set_diagonal_rod(216.5);
            d.set_radius(105.5);
            d.set_tower_adj(0, 0.3);
            d.set_tower_adj(5, -0.4);
        });
        let mut rig = VirtualDelta::new(truth, [0.4, 0.1, -0.2]);
        let mut state = state();
        let outcome = settle(&mut rig, &mut state);
        assert!(matches!(outcome, CalibrationOutcome::Converged { .. }));
        for point in Point::ALL {
            assert!(fabs(state.get(point)) <= state.precision, "{:?}", point);
        }
        assert!(rig.believed.endstop_adj().iter().all(|a| *a <= 0.0));
    }

    #[test]
    fn iteration_cap_reports_non_convergence() {
        struct Wobbly(VirtualDelta, f64);
        impl ProbeRig for Wobbly {
            fn delta(&self) -> Result<&crate::kinematics::Delta, MachineError> {
                self.0.delta()
            }
            fn delta_mut(&mut self) -> Result<&mut crate::kinematics::Delta, MachineError> {
                self.0.delta_mut()
            }
            fn probe(&mut self, x: f64, y: f64) -> Result<f64, MachineError> {
                // the centre reading flips sign on every touch
                let wobble = if x == 0.0 && y == 0.0 {
                    self.1 = -self.1;
                    self.1
                } else {
                    0.0
                };
                Ok(self.0.probe(x, y)? + wobble)
            }
            fn apply_endstop_adjustment(&mut self, adjust: [f64; 3]) -> Result<(), MachineError> {
                self.0.apply_endstop_adjustment(adjust)
            }
            fn reduce_build_height(&mut self, by: f64) {
                self.0.reduce_build_height(by)
            }
            fn reset_safe_height(&mut self) {}
            fn rehome(&mut self) -> Result<(), MachineError> {
                self.0.rehome()
            }
            fn report(&self, args: core::fmt::Arguments<'_>) {
                self.0.report(args)
            }
        }

        let mut rig = Wobbly(VirtualDelta::new(truth(|_| {}), [0.0; 3]), 0.5);
        let mut state = state();
        state.max_iterations = 3;
        state.max_steps = 10;
        probe_all(&mut rig, &mut state).unwrap();
        assert_eq!(
            auto_calibrate(&mut rig, &mut state),
            Ok(CalibrationOutcome::DidNotConverge { iterations: 3 })
        );
        assert!(rig.0.lines().contains(&"Iteration: 3".to_string()));
    }

    #[test]
    fn calibration_requires_homing_and_a_delta() {
        let out = RefCell::new(Vec::new());
        let mut machine = delta(&out);
        machine.homed = [false; 3];
        let request = CalibrationRequest {
            auto: true,
            ..Default::default()
        };
        assert_eq!(
            machine.delta_calibration(&request),
            Err(MachineError::PositionUnknown)
        );
        assert!(machine.planner.lines.is_empty());

        let mut machine = cartesian(&out);
        assert_eq!(
            machine.delta_calibration(&request),
            Err(MachineError::NotDelta)
        );
    }

    #[test]
    fn tower_numbers_are_checked_first() {
        let out = RefCell::new(Vec::new());
        let mut machine = delta(&out);
        let request = CalibrationRequest {
            tower_angle: Some(4),
            ..Default::default()
        };
        assert_eq!(
            machine.delta_calibration(&request),
            Err(MachineError::Argument("Tower must be 1, 2 or 3"))
        );
        assert!(machine.planner.lines.is_empty());
    }

    #[test]
    fn saved_carriages_are_listed() {
        let out = RefCell::new(Vec::new());
        let mut machine = delta(&out);
        machine.carriages[0] = [1.0, 2.0, 3.5];
        let request = CalibrationRequest {
            show_carriages: true,
            ..Default::default()
        };
        assert_eq!(machine.delta_calibration(&request), Ok(None));
        let lines = out.borrow();
        assert_eq!(lines[0], "Carriage Positions for last scan:");
        assert_eq!(lines[1], "[1.00, 2.00, 3.50]");
        assert_eq!(lines.len(), 8);
    }
}
