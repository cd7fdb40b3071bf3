use crate::bed_level::BedCorrection;
use crate::config::MachineConfig;
use crate::error::MachineError;
use crate::housekeeping::{self, Housekeeping};
use crate::kinematics::{Delta, Kinematics, Mechanism, Position, Z_AXIS};
use crate::planner::Planner;
use crate::respond;
use crate::response::ResponseOutput;

/// Number of canonical calibration points
pub const CALIBRATION_POINTS: usize = 7;

/// The machine context
///
/// Owns everything the foreground loop mutates: configuration, the active mechanism and its
/// constants, the commanded tool position, and the external collaborators. All command handling
/// goes through `&mut Machine`, so nothing here is shared with the intake context.
pub struct Machine<P: Planner, H: Housekeeping, O: ResponseOutput> {
    pub(crate) config: MachineConfig,
    pub(crate) mechanism: Mechanism,
    pub(crate) planner: P,
    pub(crate) housekeeping: H,
    pub(crate) output: O,

    pub(crate) position: Position,
    /// mm/min
    pub(crate) feedrate: f64,
    /// Percent
    pub(crate) feed_multiply: f64,
    pub(crate) relative: bool,
    pub(crate) homed: [bool; 3],

    pub(crate) correction: BedCorrection,
    /// Height the probe travels at between calibration points
    pub(crate) safe_z: f64,
    pub(crate) precision: f64,
    /// Carriage positions at the last probe trigger, and per calibration point
    pub(crate) last_carriages: [f64; 3],
    pub(crate) carriages: [[f64; 3]; CALIBRATION_POINTS],
}

impl<P: Planner, H: Housekeeping, O: ResponseOutput> Machine<P, H, O> {
    pub fn new(config: MachineConfig, planner: P, housekeeping: H, output: O) -> Self {
        let mechanism = Mechanism::from_config(&config.mechanism);
        let feedrate = config.motion.default_feedrate;
        let precision = config.calibration.precision;
        let safe_z = config.probe.lift - config.probe.offset[Z_AXIS];
        Self {
            config,
            mechanism,
            planner,
            housekeeping,
            output,
            position: Position::default(),
            feedrate,
            feed_multiply: 100.0,
            relative: false,
            homed: [false; 3],
            correction: BedCorrection::None,
            safe_z,
            precision,
            last_carriages: [0.0; 3],
            carriages: [[0.0; 3]; CALIBRATION_POINTS],
        }
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn mechanism(&self) -> &Mechanism {
        &self.mechanism
    }

    pub fn delta(&self) -> Option<&Delta> {
        self.mechanism.as_delta()
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn planner(&self) -> &P {
        &self.planner
    }

    pub fn planner_mut(&mut self) -> &mut P {
        &mut self.planner
    }

    pub fn housekeeping_mut(&mut self) -> &mut H {
        &mut self.housekeeping
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn correction(&self) -> &BedCorrection {
        &self.correction
    }

    pub fn set_correction(&mut self, correction: BedCorrection) {
        self.correction = correction;
    }

    pub fn is_homed(&self) -> bool {
        self.homed.iter().all(|h| *h)
    }

    /// Commanded feedrate in mm/min
    pub fn feedrate(&self) -> f64 {
        self.feedrate
    }

    pub fn set_feed_multiply(&mut self, percent: f64) {
        self.feed_multiply = percent;
    }

    /// Fails unless every axis has been homed since power-up or the last stop
    pub fn require_homed(&self) -> Result<(), MachineError> {
        if self.is_homed() {
            Ok(())
        } else {
            Err(MachineError::PositionUnknown)
        }
    }

    pub(crate) fn require_delta(&self) -> Result<&Delta, MachineError> {
        self.mechanism.as_delta().ok_or(MachineError::NotDelta)
    }

    pub(crate) fn require_delta_mut(&mut self) -> Result<&mut Delta, MachineError> {
        self.mechanism.as_delta_mut().ok_or(MachineError::NotDelta)
    }

    /// Waits for buffered motion to finish
    pub fn synchronize(&mut self) {
        housekeeping::synchronize(&self.planner, &mut self.housekeeping);
    }

    /// Waits `ms` milliseconds once motion has finished
    pub fn dwell(&mut self, ms: u64) {
        housekeeping::dwell(&self.planner, &mut self.housekeeping, ms);
    }

    /// Halts immediately; the position is unknown afterwards
    pub fn kill(&mut self) {
        log::error!("machine halted");
        self.planner.quick_stop();
        self.planner.enable_endstops(true);
        self.homed = [false; 3];
    }

    /// Reports the commanded position and the actuator counters
    pub fn report_position(&self) {
        let p = self.position;
        let spu = |axis: usize| self.config.axes[axis].steps_per_unit;
        let steps = |axis: usize| self.planner.position_steps(axis) as f64 / spu(axis);
        respond!(
            self.output,
            "X:{:.2} Y:{:.2} Z:{:.2} E:{:.2} Count X: {:.2} Y:{:.2} Z:{:.2}",
            p.x,
            p.y,
            p.z,
            p.e,
            steps(0),
            steps(1),
            steps(2)
        );
    }

    /// Actuator coordinates currently reported by the planner's step counters
    pub(crate) fn actuator_from_steps(&self) -> [f64; 3] {
        let mut out = [0.0; 3];
        for (axis, value) in out.iter_mut().enumerate() {
            *value =
                self.planner.position_steps(axis) as f64 / self.config.axes[axis].steps_per_unit;
        }
        out
    }

    /// Tool position recomputed from the actuator step counters
    pub fn measured_position(&self) -> Result<[f64; 3], MachineError> {
        Ok(self.mechanism.to_tool(self.actuator_from_steps())?)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted collaborators shared by the unit tests

    use super::*;
    use core::cell::RefCell;

    /// Planner that executes moves instantly and records them
    ///
    /// A flat bed at `bed` height (in actuator Z) stops downward moves when endstops are
    /// enabled. Only meaningful for mechanisms whose third actuator is Z.
    #[derive(Default)]
    pub struct ScriptedPlanner {
        pub lines: Vec<([f64; 3], f64)>,
        pub position: [f64; 3],
        pub e: f64,
        pub endstops: bool,
        pub bed: Option<f64>,
        pub steps_per_unit: f64,
    }

    impl ScriptedPlanner {
        pub fn new() -> Self {
            Self {
                steps_per_unit: 80.0,
                ..Self::default()
            }
        }
    }

    impl Planner for ScriptedPlanner {
        fn has_space(&self) -> bool {
            true
        }

        fn buffer_line(&mut self, target: [f64; 3], e: f64, feedrate: f64) {
            self.lines.push((target, feedrate));
            let mut target = target;
            if let Some(bed) = self.bed {
                if self.endstops && target[2] < bed && self.position[2] >= bed {
                    target[2] = bed;
                }
            }
            self.position = target;
            self.e = e;
        }

        fn set_position(&mut self, actuator: [f64; 3], e: f64) {
            self.position = actuator;
            self.e = e;
        }

        fn is_idle(&self) -> bool {
            true
        }

        fn position_steps(&self, axis: usize) -> i64 {
            libm::round(self.position[axis] * self.steps_per_unit) as i64
        }

        fn enable_endstops(&mut self, enabled: bool) {
            self.endstops = enabled;
        }

        fn endstops_hit_on_purpose(&mut self) {}
    }

    pub struct Ticker(pub u64);

    impl Housekeeping for Ticker {
        fn now_ms(&self) -> u64 {
            self.0
        }

        fn manage_heater(&mut self) {
            self.0 += 1;
        }
    }

    pub type TestMachine<'a> = Machine<ScriptedPlanner, Ticker, &'a RefCell<Vec<String>>>;

    pub fn cartesian(out: &RefCell<Vec<String>>) -> TestMachine<'_> {
        let mut machine = Machine::new(
            MachineConfig::cartesian(),
            ScriptedPlanner::new(),
            Ticker(0),
            out,
        );
        machine.homed = [true; 3];
        machine
    }

    pub fn delta(out: &RefCell<Vec<String>>) -> TestMachine<'_> {
        let mut machine = Machine::new(
            MachineConfig::default(),
            ScriptedPlanner::new(),
            Ticker(0),
            out,
        );
        machine.homed = [true; 3];
        machine
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use core::cell::RefCell;

    #[test]
    fn fresh_machine_requires_homing() {
        let out = RefCell::new(Vec::new());
        let machine = Machine::new(MachineConfig::default(), ScriptedPlanner::new(), Ticker(0), &out);
        assert_eq!(machine.require_homed(), Err(MachineError::PositionUnknown));
        assert!(machine.delta().is_some());
    }

    #[test]
    fn position_report_format() {
        let out = RefCell::new(Vec::new());
        let mut machine = cartesian(&out);
        machine.position = Position::new(1.0, 2.5, 3.0, 0.0);
        machine.planner.position = [1.0, 2.5, 3.0];
        machine.report_position();
        assert_eq!(
            out.borrow()[0],
            "X:1.00 Y:2.50 Z:3.00 E:0.00 Count X: 1.00 Y:2.50 Z:3.00"
        );
    }

    #[test]
    fn kill_forgets_homing() {
        let out = RefCell::new(Vec::new());
        let mut machine = delta(&out);
        assert!(machine.is_homed());
        machine.kill();
        assert!(!machine.is_homed());
    }
}
