//! Bed probing
//!
//! A probe reading is a two-speed descent: a fast approach until the probe triggers, a short
//! back-off, and a slow re-approach. The trigger height is recovered from the Z actuator step
//! counter, so it is only meaningful for straight vertical descents.

use crate::config::SamplingPolicy;
use crate::error::MachineError;
use crate::housekeeping::Housekeeping;
use crate::kinematics::{X_AXIS, Y_AXIS, Z_AXIS};
use crate::machine::Machine;
use crate::planner::Planner;
use crate::respond;
use crate::response::ResponseOutput;
use crate::stats::{self, Repeatability, MAX_REPEATABILITY_SAMPLES};
use core::fmt::Write;
use heapless::Vec;
use libm::{cos, fabs, sin, sqrt};

/// Most readings taken at one point
pub const MAX_SAMPLES: usize = 20;

/// Readings taken at one probe point
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeSample {
    pub x: f64,
    pub y: f64,
    /// Combined nozzle height at which the probe triggered
    pub z: f64,
    pub samples: Vec<f64, MAX_SAMPLES>,
}

/// Parameters of a repeatability test
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RepeatabilityArgs {
    pub verbosity: i32,
    pub samples: i32,
    /// Probe location; the current position when absent
    pub x: Option<f64>,
    pub y: Option<f64>,
    /// Number of random legs travelled between readings
    pub legs: i32,
    /// Deploy and stow the probe around every reading
    pub engage_each: bool,
}

impl Default for RepeatabilityArgs {
    fn default() -> Self {
        Self {
            verbosity: 1,
            samples: 10,
            x: None,
            y: None,
            legs: 0,
            engage_each: false,
        }
    }
}

/// Small xorshift generator for the wandering legs
struct Wander(u64);

impl Wander {
    fn new(seed: u64) -> Self {
        Self(seed | 1)
    }

    fn next(&mut self, modulo: u64) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0 % modulo.max(1)
    }
}

impl<P: Planner, H: Housekeeping, O: ResponseOutput> Machine<P, H, O> {
    /// Fails unless a nozzle target lies inside the XY software limits
    fn check_in_range(&self, x: f64, y: f64) -> Result<(), MachineError> {
        let axes = &self.config.axes;
        let inside = |axis: usize, v: f64| v >= axes[axis].min_pos && v <= axes[axis].max_pos;
        if inside(X_AXIS, x) && inside(Y_AXIS, y) {
            Ok(())
        } else {
            Err(MachineError::ProbeOutOfRange)
        }
    }

    /// Segmented move at travel speed, waiting until it completes
    pub(crate) fn travel_to(&mut self, x: f64, y: f64, z: f64) -> Result<(), MachineError> {
        let dest = self.position.with_xyz([x, y, z]);
        self.prepare_move_at(dest, self.config.probe.travel_feedrate)?;
        self.synchronize();
        Ok(())
    }

    /// Straight descent toward `z` that stops at the probe trigger
    ///
    /// The stop height is taken from the Z actuator counter and declared to the planner.
    fn descend(&mut self, z: f64, feedrate: f64) -> Result<(), MachineError> {
        let spu = self.config.axes[Z_AXIS].steps_per_unit;
        let start_z = self.position.z;
        let start_steps = self.planner.position_steps(Z_AXIS);
        self.prepare_move_raw(self.position.at_z(z), feedrate)?;
        self.synchronize();
        self.planner.endstops_hit_on_purpose();

        let stop_steps = self.planner.position_steps(Z_AXIS);
        self.position.z = start_z - (start_steps - stop_steps) as f64 / spu;
        let actuator = self.actuator_for(self.position.xyz(), false)?;
        self.planner.set_position(actuator, self.position.e);
        Ok(())
    }

    /// Takes one reading at the current XY and returns the trigger height
    pub fn run_z_probe(&mut self) -> Result<f64, MachineError> {
        let probe = self.config.probe;
        let retract = self.config.axes[Z_AXIS].home_retract;

        self.planner.enable_endstops(true);
        let fast = self.descend(probe.floor, probe.feedrate);
        self.planner.enable_endstops(false);
        fast?;

        let up = self.position.at_z(self.position.z + retract);
        self.prepare_move_raw(up, probe.feedrate)?;
        self.synchronize();

        self.planner.enable_endstops(true);
        let slow = self.descend(self.position.z - 2.0 * retract, probe.feedrate / 4.0);
        self.planner.enable_endstops(false);
        slow?;

        self.last_carriages = self.actuator_from_steps();
        log::debug!("probe triggered at z={:.4}", self.position.z);
        Ok(self.position.z)
    }

    /// Probes at `(x, y)` after raising to `z_before`
    ///
    /// `x` and `y` are probe coordinates; the nozzle is moved to them minus the probe offset.
    /// Readings are combined according to the configured [`SamplingPolicy`].
    pub fn probe_pt(&mut self, x: f64, y: f64, z_before: f64) -> Result<ProbeSample, MachineError> {
        self.require_homed()?;
        let off = self.config.probe.offset;
        let (nx, ny) = (x - off[X_AXIS], y - off[Y_AXIS]);
        self.check_in_range(nx, ny)?;

        self.blocking_move_to(self.position.x, self.position.y, z_before)?;
        self.blocking_move_to(nx, ny, self.position.z)?;

        let raise = self.config.probe.raise_between;
        let mut samples: Vec<f64, MAX_SAMPLES> = Vec::new();
        let z = match self.config.probe.sampling {
            SamplingPolicy::Average(count) => {
                let count = usize::from(count).clamp(1, MAX_SAMPLES);
                for n in 0..count {
                    if n > 0 {
                        self.blocking_move_to(nx, ny, self.position.z + raise)?;
                    }
                    let _ = samples.push(self.run_z_probe()?);
                }
                samples.iter().sum::<f64>() / samples.len() as f64
            }
            SamplingPolicy::AgreeTwice => loop {
                if !samples.is_empty() {
                    self.blocking_move_to(nx, ny, self.position.z + raise)?;
                }
                let z = self.run_z_probe()?;
                let agreed = samples.contains(&z);
                let _ = samples.push(z);
                if agreed || samples.is_full() {
                    break z;
                }
            },
        };

        self.output.output(|o| {
            let _ = write!(o, " x: {:.2} y: {:.2} z: {:.2} bed_array[] = [", x, y, z);
            for s in samples.iter() {
                let _ = write!(o, "{:.2},", s);
            }
            let _ = write!(o, "]");
        });
        Ok(ProbeSample { x, y, z, samples })
    }

    /// Measures the bed height at probe coordinates `(x, y)`
    ///
    /// Lifts first if the nozzle is too close to the bed, travels with segmented moves, and
    /// leaves `safe_z` just above the measured surface.
    pub fn probe_bed(&mut self, x: f64, y: f64) -> Result<f64, MachineError> {
        self.require_homed()?;
        let probe = self.config.probe;
        let off = probe.offset;
        self.check_in_range(x - off[X_AXIS], y - off[Y_AXIS])?;

        if self.position.z < probe.lift - off[Z_AXIS] {
            let up = self.position.at_z(self.position.z + probe.lift);
            self.prepare_move_at(up, probe.travel_feedrate)?;
        }
        let z = self.position.z;
        self.travel_to(x - off[X_AXIS], y - off[Y_AXIS], z)?;

        let height = self.probe_pt(x, y, self.position.z)?.z + off[Z_AXIS];
        self.safe_z = height - off[Z_AXIS] + probe.lift;
        self.housekeeping.idle();
        Ok(height)
    }

    /// Repeatedly probes one point and reports the spread of the readings
    pub fn repeatability(&mut self, args: RepeatabilityArgs) -> Result<Option<Repeatability>, MachineError> {
        self.require_homed()?;
        self.synchronize();
        self.correction = crate::bed_level::BedCorrection::None;

        if !(0..=4).contains(&args.verbosity) {
            return Err(MachineError::Argument("Verbose Level not plausible."));
        }
        if !(4..=MAX_REPEATABILITY_SAMPLES as i32).contains(&args.samples) {
            return Err(MachineError::Argument("Specified sample size not plausible."));
        }
        let off = self.config.probe.offset;
        let axes = self.config.axes;
        let px = args.x.map_or(self.position.x, |x| x - off[X_AXIS]);
        if px < axes[X_AXIS].min_pos || px > axes[X_AXIS].max_pos {
            return Err(MachineError::Argument("Specified X position out of range."));
        }
        let py = args.y.map_or(self.position.y, |y| y - off[Y_AXIS]);
        if py < axes[Y_AXIS].min_pos || py > axes[Y_AXIS].max_pos {
            return Err(MachineError::Argument("Specified Y position out of range."));
        }
        let legs = if args.legs == 1 { 2 } else { args.legs };
        if !(0..=15).contains(&legs) {
            return Err(MachineError::Argument(
                "Specified number of legs in movement not plausible.",
            ));
        }

        self.blocking_move_to(self.position.x, self.position.y, self.config.probe.raise_before)?;
        if args.verbosity > 2 {
            respond!(self.output, "Positioning probe for the test.");
        }
        self.planner.deploy_probe();
        let result = self.sample_repeatedly(&args, px, py, legs);
        self.planner.stow_probe();
        let readings = result?;

        let summary = stats::repeatability(&readings);
        if let Some(r) = summary {
            respond!(
                self.output,
                "X, Y, L, Mean, Median, Mode, Low, High, StdDev:{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6}",
                px,
                py,
                f64::from(legs),
                r.mean,
                r.median,
                r.mode,
                r.low,
                r.high,
                r.std_dev
            );
            log::info!("repeatability at ({:.2}, {:.2}): sigma {:.6}", px, py, r.std_dev);
        }
        Ok(summary)
    }

    fn sample_repeatedly(
        &mut self,
        args: &RepeatabilityArgs,
        px: f64,
        py: f64,
        legs: i32,
    ) -> Result<Vec<f64, MAX_REPEATABILITY_SAMPLES>, MachineError> {
        let raise_before = self.config.probe.raise_before;
        self.travel_to(px, py, raise_before)?;
        self.run_z_probe()?;
        let z_start = self.position.z + self.config.probe.raise_between;
        self.blocking_move_to(px, py, z_start)?;
        if args.engage_each {
            self.planner.stow_probe();
        }

        let mut readings: Vec<f64, MAX_REPEATABILITY_SAMPLES> = Vec::new();
        let count = args.samples as usize;
        for n in 0..count {
            self.travel_to(px, py, z_start)?;
            if legs > 0 {
                self.wander(px, py, z_start, legs, args.verbosity)?;
            }
            if args.engage_each {
                self.planner.deploy_probe();
                self.dwell(1000);
                self.travel_to(px, py, z_start)?;
            }

            let z = self.run_z_probe()?;
            let _ = readings.push(z);
            let (mean, sigma) = stats::mean_and_sigma(&readings);
            if args.verbosity > 1 {
                let verbose = args.verbosity > 2;
                self.output.output(|o| {
                    let _ = write!(o, "{} of {}   z: {:.6}", n + 1, count, z);
                    if verbose {
                        let _ = write!(o, " mean: {:.6}   sigma: {:.6}", mean, sigma);
                    }
                });
            }

            self.blocking_move_to(px, py, z_start)?;
            self.dwell(500);
            if args.engage_each {
                self.planner.stow_probe();
                self.dwell(1000);
            }
        }
        Ok(readings)
    }

    /// Travels a few pseudo-random legs around the probe location and returns to it
    fn wander(&mut self, px: f64, py: f64, z: f64, legs: i32, verbosity: i32) -> Result<(), MachineError> {
        let axes = self.config.axes;
        let probable = self.config.leveling.probable_radius;
        let delta = self.mechanism.is_delta();
        let mut rng = Wander::new(self.housekeeping.now_ms());

        let clockwise = rng.next(2) == 1;
        let mut radius = rng.next((self.config.max_length(X_AXIS) / 4.0) as u64) as f64;
        let mut theta = (rng.next(360) as f64).to_radians();

        for _ in 0..legs - 1 {
            let mut target = (px, py);
            for _ in 0..100 {
                let turn = (rng.next(20) as f64).to_radians();
                theta += if clockwise { turn } else { -turn };
                radius = fabs(radius + rng.next(10) as f64 - 5.0);
                let x = (px + cos(theta) * radius).clamp(axes[X_AXIS].min_pos, axes[X_AXIS].max_pos);
                let y = (py + sin(theta) * radius).clamp(axes[Y_AXIS].min_pos, axes[Y_AXIS].max_pos);
                if !delta || sqrt(x * x + y * y) <= probable {
                    target = (x, y);
                    break;
                }
            }
            if verbosity > 3 {
                respond!(self.output, "x: {:.3}y: {:.3}", target.0, target.1);
            }
            self.travel_to(target.0, target.1, z)?;
        }
        self.travel_to(px, py, z)
    }

    /// Reported position after probing, for diagnostics
    pub fn last_carriages(&self) -> [f64; 3] {
        self.last_carriages
    }
}
