//! Simulated mechanics behind the [`Planner`] trait
//!
//! The simulation keeps the physical carriage positions in the machine's *true* geometry, which
//! may differ from the constants the controller believes in. Moves complete instantly. Endstops
//! clip each carriage on its own, a deployed probe stops every carriage once the nozzle reaches
//! the bed surface, and the step counters quantise to the configured steps per unit.

use keel::config::{MachineConfig, MechanismConfig};
use keel::kinematics::{Kinematics, Mechanism};
use keel::Planner;
use serde::{Deserialize, Serialize};

/// Samples taken along a move when looking for the probe trigger
const TRIGGER_SAMPLES: usize = 200;
const BISECTIONS: usize = 40;

/// The physical machine, as opposed to what the controller believes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// True geometry; the controller's own mechanism when absent
    pub mechanism: Option<MechanismConfig>,
    /// Distance from the bottom of the envelope to the true top, delta only
    pub height: f64,
    /// Error of each endstop switch, along its homing direction
    pub endstop_error: [f64; 3],
    /// Bed surface: `z = base + slope_x * x + slope_y * y`
    pub bed_base: f64,
    pub bed_slope: [f64; 2],
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            mechanism: None,
            height: 250.0,
            endstop_error: [0.0; 3],
            bed_base: 0.0,
            bed_slope: [0.0; 2],
        }
    }
}

impl SimConfig {
    pub fn bed_height(&self, x: f64, y: f64) -> f64 {
        self.bed_base + self.bed_slope[0] * x + self.bed_slope[1] * y
    }
}

/// A [`Planner`] that moves a simulated machine
pub struct SimPlanner {
    sim: SimConfig,
    truth: Mechanism,
    probe_offset: [f64; 3],
    steps_per_unit: [f64; 3],
    home_dir: [f64; 3],
    /// Physical carriage position of every endstop switch
    stops: [f64; 3],

    physical: [f64; 3],
    /// Physical position of planner coordinate zero
    origin: [f64; 3],
    e: f64,
    endstops: bool,
    probe_deployed: bool,
    triggered: bool,
    moves: usize,
}

impl SimPlanner {
    pub fn new(machine: &MachineConfig, sim: SimConfig) -> Self {
        let truth_config = sim.mechanism.clone().unwrap_or_else(|| machine.mechanism.clone());
        let truth = Mechanism::from_config(&truth_config);
        let home_dir = machine.axes.map(|a| f64::from(a.home_dir.signum()));
        let top = match truth.to_actuator([0.0, 0.0, sim.height]) {
            Ok(top) if truth.is_delta() => top,
            _ => [0.0; 3],
        };
        let stops: [f64; 3] = core::array::from_fn(|i| top[i] + sim.endstop_error[i] * home_dir[i]);
        log::debug!("simulated endstops at {:?}", stops);

        // Start somewhere below the switches, away from the bed
        let physical: [f64; 3] = core::array::from_fn(|i| {
            if truth.is_delta() {
                stops[i] - 20.0
            } else {
                stops[i] + 20.0
            }
        });
        Self {
            sim,
            truth,
            probe_offset: machine.probe.offset,
            steps_per_unit: machine.axes.map(|a| a.steps_per_unit),
            home_dir,
            stops,
            physical,
            origin: [0.0; 3],
            e: 0.0,
            endstops: false,
            probe_deployed: false,
            triggered: false,
            moves: 0,
        }
    }

    /// Number of lines buffered so far
    pub fn moves(&self) -> usize {
        self.moves
    }

    /// The nozzle position in the true geometry
    pub fn nozzle(&self) -> Option<[f64; 3]> {
        self.truth.to_tool(self.physical).ok()
    }

    /// Extruder position in planner coordinates
    pub fn extruder(&self) -> f64 {
        self.e
    }

    /// True if an endstop or the probe stopped a move since the last acknowledgement
    pub fn triggered(&self) -> bool {
        self.triggered
    }

    pub fn is_probe_deployed(&self) -> bool {
        self.probe_deployed
    }

    pub fn sim(&self) -> &SimConfig {
        &self.sim
    }

    /// Height of the probe trigger above the bed, negative once pressed in
    fn clearance(&self, physical: [f64; 3]) -> Option<f64> {
        let tool = self.truth.to_tool(physical).ok()?;
        let [ox, oy, oz] = self.probe_offset;
        Some(tool[2] + oz - self.sim.bed_height(tool[0] + ox, tool[1] + oy))
    }

    /// Fraction of the move from `from` to `to` at which the probe triggers
    fn probe_stop(&self, from: [f64; 3], to: [f64; 3]) -> Option<f64> {
        let at = |t: f64| -> [f64; 3] { core::array::from_fn(|i| from[i] + (to[i] - from[i]) * t) };
        let pressed = |t: f64| self.clearance(at(t)).is_some_and(|c| c <= 0.0);
        if pressed(0.0) {
            return Some(0.0);
        }
        let first = (1..=TRIGGER_SAMPLES)
            .map(|n| n as f64 / TRIGGER_SAMPLES as f64)
            .find(|t| pressed(*t))?;
        let (mut lo, mut hi) = (first - 1.0 / TRIGGER_SAMPLES as f64, first);
        for _ in 0..BISECTIONS {
            let mid = (lo + hi) / 2.0;
            if pressed(mid) {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        Some(hi)
    }

    fn quantise(&self, axis: usize, planner: f64) -> f64 {
        let spu = self.steps_per_unit[axis];
        (planner * spu).round() / spu
    }
}

impl Planner for SimPlanner {
    fn has_space(&self) -> bool {
        true
    }

    fn buffer_line(&mut self, target: [f64; 3], e: f64, _feedrate: f64) {
        self.moves += 1;
        let from = self.physical;
        let mut to: [f64; 3] =
            core::array::from_fn(|i| self.origin[i] + self.quantise(i, target[i]));

        if self.endstops && self.probe_deployed {
            if let Some(t) = self.probe_stop(from, to) {
                to = core::array::from_fn(|i| {
                    let stop = from[i] + (to[i] - from[i]) * t;
                    self.origin[i] + self.quantise(i, stop - self.origin[i])
                });
                self.triggered = true;
                log::trace!("probe triggered at {:?}", to);
            }
        }
        if self.endstops {
            for i in 0..3 {
                let dir = self.home_dir[i];
                if (to[i] - self.stops[i]) * dir > 0.0 {
                    to[i] = if (from[i] - self.stops[i]) * dir > 0.0 {
                        from[i]
                    } else {
                        self.stops[i]
                    };
                    self.triggered = true;
                }
            }
        }
        self.physical = to;
        self.e = e;
    }

    fn set_position(&mut self, actuator: [f64; 3], e: f64) {
        self.origin = core::array::from_fn(|i| self.physical[i] - actuator[i]);
        self.e = e;
    }

    fn is_idle(&self) -> bool {
        true
    }

    fn position_steps(&self, axis: usize) -> i64 {
        ((self.physical[axis] - self.origin[axis]) * self.steps_per_unit[axis]).round() as i64
    }

    fn enable_endstops(&mut self, enabled: bool) {
        self.endstops = enabled;
    }

    fn endstops_hit_on_purpose(&mut self) {
        self.triggered = false;
    }

    fn deploy_probe(&mut self) {
        self.probe_deployed = true;
    }

    fn stow_probe(&mut self) {
        self.probe_deployed = false;
    }

    fn quick_stop(&mut self) {
        log::warn!("simulated machine stopped");
    }
}

/// Convenience for a truth geometry that differs from the configured one
pub fn delta_truth(machine: &MachineConfig, f: impl FnOnce(&mut keel::config::DeltaConfig)) -> Option<MechanismConfig> {
    match &machine.mechanism {
        MechanismConfig::Delta(d) => {
            let mut d = *d;
            f(&mut d);
            Some(MechanismConfig::Delta(d))
        }
        _ => None,
    }
}
