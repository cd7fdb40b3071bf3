//! Machine configuration
//!
//! Everything here is plain data. [`MachineConfig::default`] describes a typical small delta
//! printer; embedders either build a config in code or, with the `serde` feature, load one from
//! whatever format they like. Missing fields fall back to the defaults.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Largest supported detailed probing grid, per side
pub const MAX_GRID_POINTS: usize = 9;

/// Top level configuration
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct MachineConfig {
    pub mechanism: MechanismConfig,
    /// X, Y and Z axes. For a delta machine these describe the tool space envelope, except for
    /// `steps_per_unit`, `homing_feedrate` and `home_retract`, which apply to every carriage.
    pub axes: [AxisConfig; 3],
    pub probe: ProbeConfig,
    pub calibration: CalibrationConfig,
    pub leveling: LevelingConfig,
    pub motion: MotionConfig,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            mechanism: MechanismConfig::Delta(DeltaConfig::default()),
            axes: [
                AxisConfig::new(-90.0, 90.0),
                AxisConfig::new(-90.0, 90.0),
                AxisConfig::new(0.0, 250.0),
            ],
            probe: ProbeConfig::default(),
            calibration: CalibrationConfig::default(),
            leveling: LevelingConfig::default(),
            motion: MotionConfig::default(),
        }
    }
}

impl MachineConfig {
    /// A Cartesian machine with the default envelope
    pub fn cartesian() -> Self {
        let mut config = Self {
            mechanism: MechanismConfig::Cartesian,
            ..Self::default()
        };
        for axis in config.axes.iter_mut() {
            axis.home_dir = -1;
            axis.home_pos = axis.min_pos;
        }
        config.axes[0] = AxisConfig {
            min_pos: 0.0,
            max_pos: 200.0,
            home_pos: 0.0,
            ..config.axes[0]
        };
        config.axes[1] = AxisConfig {
            min_pos: 0.0,
            max_pos: 200.0,
            home_pos: 0.0,
            ..config.axes[1]
        };
        config
    }

    /// Largest travel of an axis, used to size homing moves
    pub fn max_length(&self, axis: usize) -> f64 {
        self.axes[axis].max_pos - self.axes[axis].min_pos
    }
}

/// Geometry family and its constants
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MechanismConfig {
    Cartesian,
    Delta(DeltaConfig),
    Scara(ScaraConfig),
}

/// Linear delta geometry
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct DeltaConfig {
    /// Centre-to-centre length of the diagonal rods
    pub diagonal_rod: f64,
    /// Horizontal distance from the bed centre to each tower's carriage joint line
    pub radius: f64,
    pub segments_per_second: f64,
    /// Angle corrections in degrees (A, B, C) followed by radius corrections in mm (I, J, K)
    pub tower_adj: [f64; 6],
    /// Per-tower diagonal rod corrections (U, V, W)
    pub diagrod_adj: [f64; 3],
    /// Per-tower endstop offsets, never positive after calibration
    pub endstop_adj: [f64; 3],
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            diagonal_rod: 217.0,
            radius: 105.2,
            segments_per_second: 200.0,
            tower_adj: [0.0; 6],
            diagrod_adj: [0.0; 3],
            endstop_adj: [0.0; 3],
        }
    }
}

/// Two link articulated arm
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct ScaraConfig {
    /// Inner and outer link lengths
    pub linkage: [f64; 2],
    /// Arm base position relative to the tool origin
    pub offset: [f64; 2],
    /// Tool space scaling applied before the transform
    pub scaling: [f64; 2],
    pub segments_per_second: f64,
}

impl Default for ScaraConfig {
    fn default() -> Self {
        Self {
            linkage: [150.0, 150.0],
            offset: [-150.0, 150.0],
            scaling: [1.0, 1.0],
            segments_per_second: 200.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct AxisConfig {
    pub steps_per_unit: f64,
    /// Software travel limits
    pub min_pos: f64,
    pub max_pos: f64,
    /// Position taken after homing a Cartesian or SCARA axis
    pub home_pos: f64,
    /// -1 homes toward the minimum, +1 toward the maximum
    pub home_dir: i8,
    /// mm/min
    pub homing_feedrate: f64,
    /// Back-off distance between the fast and slow homing approach
    pub home_retract: f64,
}

impl AxisConfig {
    const fn new(min_pos: f64, max_pos: f64) -> Self {
        Self {
            steps_per_unit: 80.0,
            min_pos,
            max_pos,
            home_pos: max_pos,
            home_dir: 1,
            homing_feedrate: 12000.0,
            home_retract: 5.0,
        }
    }
}

impl Default for AxisConfig {
    fn default() -> Self {
        Self::new(0.0, 200.0)
    }
}

/// How repeated probe readings are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SamplingPolicy {
    /// Take this many readings and average them
    Average(u8),
    /// Repeat until a reading equals an earlier one, at most [`crate::probe::MAX_SAMPLES`] times
    AgreeTwice,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct ProbeConfig {
    /// Position of the probe trigger point relative to the nozzle
    pub offset: [f64; 3],
    /// Clearance kept above the last probed height when travelling between points
    pub lift: f64,
    /// Height to start probing from when nothing has been probed yet
    pub raise_before: f64,
    /// Lift between repeated readings at the same point
    pub raise_between: f64,
    /// Fast descent rate, mm/min
    pub feedrate: f64,
    /// Rate of blocking travel moves, mm/min
    pub travel_feedrate: f64,
    /// Target of the fast descent; a probe that has not triggered by here stops anyway
    pub floor: f64,
    pub sampling: SamplingPolicy,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            offset: [0.0; 3],
            lift: 10.0,
            raise_before: 15.0,
            raise_between: 5.0,
            feedrate: 600.0,
            travel_feedrate: 4000.0,
            floor: -10.0,
            sampling: SamplingPolicy::AgreeTwice,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct CalibrationConfig {
    /// Tolerance every calibration point must reach
    pub precision: f64,
    /// Radius of the circle the tower and opposite points are probed on
    pub bed_radius: f64,
    /// Cap on the endstop loop and on composite calibration passes
    pub max_iterations: usize,
    /// Cap on each step search for radius, tower or rod
    pub max_steps: usize,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            precision: 0.03,
            bed_radius: 85.0,
            max_iterations: 20,
            max_steps: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct LevelingConfig {
    /// Probes per side of the detailed probing grid, odd and at most [`MAX_GRID_POINTS`]
    pub grid_points: usize,
    /// Left, right, front and back edges of the probed area
    pub left: f64,
    pub right: f64,
    pub front: f64,
    pub back: f64,
    /// Points further than this from the centre are not probed on a delta
    pub probable_radius: f64,
    /// Fit an exact plane through `three_points` instead of a grid
    pub three_point: bool,
    pub three_points: [[f64; 2]; 3],
}

impl Default for LevelingConfig {
    fn default() -> Self {
        Self {
            grid_points: 7,
            left: -75.0,
            right: 75.0,
            front: -75.0,
            back: 75.0,
            probable_radius: 75.0,
            three_point: false,
            three_points: [[-60.0, -60.0], [60.0, -60.0], [0.0, 60.0]],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct MotionConfig {
    /// mm/min, used until the first `F` word
    pub default_feedrate: f64,
    pub e_steps_per_unit: f64,
    /// Clamp destinations to the axis limits
    pub software_endstops: bool,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            default_feedrate: 1500.0,
            e_steps_per_unit: 100.0,
            software_endstops: true,
        }
    }
}
