use super::{Kinematics, Position, Segments};
use crate::config::DeltaConfig;
use crate::error::KinematicError;
use libm::{cos, sin, sqrt};

/// Nominal tower angles in degrees, X, Y and Z towers
const TOWER_ANGLES: [f64; 3] = [210.0, 330.0, 90.0];

/// Linear delta with three vertical towers
///
/// The geometric constants are private. Every setter recomputes the tower positions and squared
/// rod lengths used by the transforms, so the two can never disagree.
#[derive(Debug, Clone, PartialEq)]
pub struct Delta {
    diagonal_rod: f64,
    radius: f64,
    segments_per_second: f64,
    tower_adj: [f64; 6],
    diagrod_adj: [f64; 3],
    endstop_adj: [f64; 3],

    towers: [[f64; 2]; 3],
    rod_sq: [f64; 3],
}

impl Delta {
    pub fn new(config: &DeltaConfig) -> Self {
        let mut delta = Self {
            diagonal_rod: config.diagonal_rod,
            radius: config.radius,
            segments_per_second: config.segments_per_second,
            tower_adj: config.tower_adj,
            diagrod_adj: config.diagrod_adj,
            endstop_adj: config.endstop_adj,
            towers: [[0.0; 2]; 3],
            rod_sq: [0.0; 3],
        };
        delta.recompute();
        delta
    }

    /// Current constants, e.g. for storing them
    pub fn config(&self) -> DeltaConfig {
        DeltaConfig {
            diagonal_rod: self.diagonal_rod,
            radius: self.radius,
            segments_per_second: self.segments_per_second,
            tower_adj: self.tower_adj,
            diagrod_adj: self.diagrod_adj,
            endstop_adj: self.endstop_adj,
        }
    }

    fn recompute(&mut self) {
        for i in 0..3 {
            let r = self.radius + self.tower_adj[3 + i];
            let angle = (TOWER_ANGLES[i] + self.tower_adj[i]).to_radians();
            self.towers[i] = [r * cos(angle), r * sin(angle)];
            let rod = self.diagonal_rod + self.diagrod_adj[i];
            self.rod_sq[i] = rod * rod;
        }
    }

    pub fn diagonal_rod(&self) -> f64 {
        self.diagonal_rod
    }

    pub fn set_diagonal_rod(&mut self, rod: f64) {
        self.diagonal_rod = rod;
        self.recompute();
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    pub fn set_radius(&mut self, radius: f64) {
        self.radius = radius;
        self.recompute();
    }

    pub fn segments_per_second(&self) -> f64 {
        self.segments_per_second
    }

    pub fn set_segments_per_second(&mut self, sps: f64) {
        self.segments_per_second = sps;
    }

    /// Angle corrections (0..3, degrees) followed by radius corrections (3..6, mm)
    pub fn tower_adj(&self) -> &[f64; 6] {
        &self.tower_adj
    }

    pub fn set_tower_adj(&mut self, index: usize, value: f64) {
        self.tower_adj[index] = value;
        self.recompute();
    }

    pub fn diagrod_adj(&self) -> &[f64; 3] {
        &self.diagrod_adj
    }

    pub fn set_diagrod_adj(&mut self, tower: usize, value: f64) {
        self.diagrod_adj[tower] = value;
        self.recompute();
    }

    pub fn endstop_adj(&self) -> &[f64; 3] {
        &self.endstop_adj
    }

    pub fn set_endstop_adj(&mut self, tower: usize, value: f64) {
        self.endstop_adj[tower] = value;
    }

    /// Effective XY of a tower
    pub fn tower(&self, tower: usize) -> [f64; 2] {
        self.towers[tower]
    }

    /// Squared effective rod length of a tower
    pub fn rod_squared(&self, tower: usize) -> f64 {
        self.rod_sq[tower]
    }
}

impl Kinematics for Delta {
    fn to_actuator(&self, tool: [f64; 3]) -> Result<[f64; 3], KinematicError> {
        let mut carriages = [0.0; 3];
        for (i, carriage) in carriages.iter_mut().enumerate() {
            let dx = self.towers[i][0] - tool[0];
            let dy = self.towers[i][1] - tool[1];
            let radicand = self.rod_sq[i] - dx * dx - dy * dy;
            if radicand < 0.0 {
                return Err(KinematicError::Unreachable);
            }
            *carriage = sqrt(radicand) + tool[2];
        }
        Ok(carriages)
    }

    /// Intersects the three rod spheres centred on the carriages, taking the lower solution
    fn to_tool(&self, actuator: [f64; 3]) -> Result<[f64; 3], KinematicError> {
        let p = |i: usize| [self.towers[i][0], self.towers[i][1], actuator[i]];
        let (p1, p2, p3) = (p(0), p(1), p(2));

        let d = norm(sub(p2, p1));
        if d == 0.0 {
            return Err(KinematicError::Unreachable);
        }
        let ex = scale(sub(p2, p1), 1.0 / d);
        let i = dot(ex, sub(p3, p1));
        let ey_raw = sub(sub(p3, p1), scale(ex, i));
        let ey_len = norm(ey_raw);
        if ey_len == 0.0 {
            return Err(KinematicError::Unreachable);
        }
        let ey = scale(ey_raw, 1.0 / ey_len);
        let ez = cross(ex, ey);
        let j = dot(ey, sub(p3, p1));

        let x = (self.rod_sq[0] - self.rod_sq[1] + d * d) / (2.0 * d);
        let y = (self.rod_sq[0] - self.rod_sq[2] + i * i + j * j - 2.0 * i * x) / (2.0 * j);
        let z_sq = self.rod_sq[0] - x * x - y * y;
        if z_sq < 0.0 {
            return Err(KinematicError::Unreachable);
        }
        let z = sqrt(z_sq);

        let base = add(p1, add(scale(ex, x), scale(ey, y)));
        let a = add(base, scale(ez, z));
        let b = sub(base, scale(ez, z));
        Ok(if a[2] < b[2] { a } else { b })
    }

    fn segment(&self, from: &Position, to: &Position, feedrate: f64, feed_multiply: f64) -> Segments {
        Segments::timed(from, to, feedrate, feed_multiply, self.segments_per_second)
    }
}

fn add(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn scale(a: [f64; 3], k: f64) -> [f64; 3] {
    [a[0] * k, a[1] * k, a[2] * k]
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn norm(a: [f64; 3]) -> f64 {
    sqrt(dot(a, a))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    fn delta() -> Delta {
        Delta::new(&DeltaConfig::default())
    }

    #[test]
    fn centre_point_lifts_all_carriages_equally() {
        let d = delta();
        let c = d.to_actuator([0.0, 0.0, 10.0]).unwrap();
        let expected = sqrt(217.0 * 217.0 - 105.2 * 105.2) + 10.0;
        for h in c {
            assert_abs_diff_eq!(h, expected, epsilon = 1e-9);
        }
    }

    #[test]
    fn point_beyond_rod_reach_is_unreachable() {
        let d = delta();
        assert_eq!(d.to_actuator([400.0, 0.0, 0.0]), Err(KinematicError::Unreachable));
    }

    #[test]
    fn setters_refresh_tower_positions() {
        let mut d = delta();
        let before = d.to_actuator([20.0, 10.0, 0.0]).unwrap();
        d.set_tower_adj(3, 1.0);
        assert_abs_diff_eq!(d.tower(0)[0], 106.2 * cos(210f64.to_radians()), epsilon = 1e-9);
        let after = d.to_actuator([20.0, 10.0, 0.0]).unwrap();
        assert!(before[0] != after[0]);
        assert_eq!(before[1], after[1]);

        d.set_diagrod_adj(2, 0.5);
        assert_abs_diff_eq!(d.rod_squared(2), 217.5 * 217.5, epsilon = 1e-9);
        d.set_diagonal_rod(220.0);
        assert_abs_diff_eq!(d.rod_squared(0), 220.0 * 220.0, epsilon = 1e-9);
    }

    proptest! {
        #[test]
        fn forward_inverts_inverse(
            r in 0.0f64..80.0, a in 0.0f64..360.0, z in 0.0f64..200.0,
            adj in proptest::array::uniform6(-0.5f64..0.5),
            rod in proptest::array::uniform3(-0.5f64..0.5),
        ) {
            let mut d = delta();
            for (i, v) in adj.iter().enumerate() {
                d.set_tower_adj(i, *v);
            }
            for (i, v) in rod.iter().enumerate() {
                d.set_diagrod_adj(i, *v);
            }
            let tool = [r * a.to_radians().cos(), r * a.to_radians().sin(), z];
            let carriages = d.to_actuator(tool).unwrap();
            let back = d.to_tool(carriages).unwrap();
            for k in 0..3 {
                assert_abs_diff_eq!(back[k], tool[k], epsilon = 1e-6);
            }
        }
    }
}
