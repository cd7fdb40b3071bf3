//! Bed surface correction
//!
//! Detailed probing (`G29`) measures the bed and installs a [`BedCorrection`]. Segmented moves
//! add the correction height at each waypoint's XY to the linear actuators, so the nozzle
//! follows the measured surface.

use crate::config::MAX_GRID_POINTS;
use crate::error::MachineError;
use crate::housekeeping::Housekeeping;
use crate::kinematics::Z_AXIS;
use crate::machine::Machine;
use crate::planner::Planner;
use crate::respond;
use crate::response::ResponseOutput;
use core::fmt::Write;
use libm::{fabs, floor, sqrt};

/// Height correction applied to moves
#[derive(Debug, Clone, PartialEq, Default)]
pub enum BedCorrection {
    #[default]
    None,
    /// `z = a·x + b·y + d`
    Plane { a: f64, b: f64, d: f64 },
    /// Bilinear interpolation over a probed grid
    Grid(HeightMap),
}

impl BedCorrection {
    /// Correction height at tool XY
    pub fn height_at(&self, x: f64, y: f64) -> f64 {
        match self {
            BedCorrection::None => 0.0,
            BedCorrection::Plane { a, b, d } => a * x + b * y + d,
            BedCorrection::Grid(map) => map.height_at(x, y),
        }
    }
}

/// Bed heights on a square grid with an odd number of points per side
#[derive(Debug, Clone, PartialEq)]
pub struct HeightMap {
    points: usize,
    centre: [f64; 2],
    spacing: [f64; 2],
    /// Indexed `[x][y]`
    values: [[f64; MAX_GRID_POINTS]; MAX_GRID_POINTS],
    filled: [[bool; MAX_GRID_POINTS]; MAX_GRID_POINTS],
}

impl HeightMap {
    /// An empty map covering `left..=right` by `front..=back`
    pub fn new(points: usize, left: f64, right: f64, front: f64, back: f64) -> Result<Self, MachineError> {
        if points < 3 || points > MAX_GRID_POINTS || points % 2 == 0 {
            return Err(MachineError::Argument("Grid points must be odd, between 3 and 9"));
        }
        let gaps = (points - 1) as f64;
        Ok(Self {
            points,
            centre: [(left + right) / 2.0, (front + back) / 2.0],
            spacing: [(right - left) / gaps, (back - front) / gaps],
            values: [[0.0; MAX_GRID_POINTS]; MAX_GRID_POINTS],
            filled: [[false; MAX_GRID_POINTS]; MAX_GRID_POINTS],
        })
    }

    pub fn points(&self) -> usize {
        self.points
    }

    pub fn get(&self, x: usize, y: usize) -> f64 {
        self.values[x][y]
    }

    pub fn is_filled(&self, x: usize, y: usize) -> bool {
        self.filled[x][y]
    }

    pub fn set(&mut self, x: usize, y: usize, z: f64) {
        self.values[x][y] = z;
        self.filled[x][y] = true;
    }

    /// Fills the unprobed corners by extrapolating outward from the centre
    ///
    /// Works from the centre out so every estimate leans on points closer in. Each missing
    /// point takes the median of the row, column and diagonal extrapolations.
    pub fn extrapolate(&mut self) {
        let half = (self.points - 1) / 2;
        for y in 0..=half {
            for x in 0..=half {
                if x + y < 3 {
                    continue;
                }
                let dx = if x > 1 { 1 } else { 0 };
                let dy = if y > 1 { 1 } else { 0 };
                self.extrapolate_one(half - x, half - y, dx, dy);
                self.extrapolate_one(half + x, half - y, -dx, dy);
                self.extrapolate_one(half - x, half + y, dx, -dy);
                self.extrapolate_one(half + x, half + y, -dx, -dy);
            }
        }
    }

    fn extrapolate_one(&mut self, x: usize, y: usize, dx: isize, dy: isize) {
        if self.filled[x][y] {
            return;
        }
        let at = |i: isize, j: isize| {
            self.values[(x as isize + i * dx) as usize][(y as isize + j * dy) as usize]
        };
        let row = 2.0 * at(1, 0) - at(2, 0);
        let column = 2.0 * at(0, 1) - at(0, 2);
        let diagonal = 2.0 * at(1, 1) - at(2, 2);
        self.set(x, y, median3(row, column, diagonal));
    }

    /// Interpolated height at tool XY, clamped to the grid edge
    pub fn height_at(&self, x: f64, y: f64) -> f64 {
        let half = ((self.points - 1) / 2) as f64;
        let limit = |v: f64| v.clamp(0.001 - half, half - 0.001);
        let gx = limit((x - self.centre[0]) / self.spacing[0]);
        let gy = limit((y - self.centre[1]) / self.spacing[1]);
        let (fx, fy) = (floor(gx), floor(gy));
        let (rx, ry) = (gx - fx, gy - fy);
        let ix = (fx + half) as usize;
        let iy = (fy + half) as usize;

        let z1 = self.values[ix][iy];
        let z2 = self.values[ix][iy + 1];
        let z3 = self.values[ix + 1][iy];
        let z4 = self.values[ix + 1][iy + 1];
        let left = (1.0 - ry) * z1 + ry * z2;
        let right = (1.0 - ry) * z3 + ry * z4;
        (1.0 - rx) * left + rx * right
    }
}

fn median3(a: f64, b: f64, c: f64) -> f64 {
    let mut m = c;
    if a < b {
        if b < c {
            m = b;
        }
        if c < a {
            m = a;
        }
    } else {
        if c < b {
            m = b;
        }
        if a < c {
            m = a;
        }
    }
    m
}

/// Least squares fit of `z = a·x + b·y + d`
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaneFit {
    n: f64,
    sx: f64,
    sy: f64,
    sz: f64,
    sxx: f64,
    sxy: f64,
    syy: f64,
    sxz: f64,
    syz: f64,
}

impl PlaneFit {
    pub fn add(&mut self, x: f64, y: f64, z: f64) {
        self.n += 1.0;
        self.sx += x;
        self.sy += y;
        self.sz += z;
        self.sxx += x * x;
        self.sxy += x * y;
        self.syy += y * y;
        self.sxz += x * z;
        self.syz += y * z;
    }

    /// Solves the normal equations, failing for collinear or too few points
    pub fn solve(&self) -> Result<[f64; 3], MachineError> {
        let m = [
            [self.sxx, self.sxy, self.sx],
            [self.sxy, self.syy, self.sy],
            [self.sx, self.sy, self.n],
        ];
        let rhs = [self.sxz, self.syz, self.sz];
        let det = det3(&m);
        let scale = self.sxx.max(self.syy).max(1.0);
        if fabs(det) < 1e-9 * scale * scale * self.n.max(1.0) {
            return Err(MachineError::LevelingFailed);
        }
        let mut out = [0.0; 3];
        for (col, v) in out.iter_mut().enumerate() {
            let mut mc = m;
            for row in 0..3 {
                mc[row][col] = rhs[row];
            }
            *v = det3(&mc) / det;
        }
        Ok(out)
    }
}

fn det3(m: &[[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1]) - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

/// Exact plane through three points
pub fn plane_through(p: [[f64; 3]; 3]) -> Result<[f64; 3], MachineError> {
    let u = [p[1][0] - p[0][0], p[1][1] - p[0][1], p[1][2] - p[0][2]];
    let v = [p[2][0] - p[0][0], p[2][1] - p[0][1], p[2][2] - p[0][2]];
    let normal = [
        u[1] * v[2] - u[2] * v[1],
        u[2] * v[0] - u[0] * v[2],
        u[0] * v[1] - u[1] * v[0],
    ];
    let len = sqrt(normal[0] * normal[0] + normal[1] * normal[1] + normal[2] * normal[2]);
    if len == 0.0 || fabs(normal[2]) < 1e-9 * len {
        return Err(MachineError::LevelingFailed);
    }
    let a = -normal[0] / normal[2];
    let b = -normal[1] / normal[2];
    Ok([a, b, p[0][2] - a * p[0][0] - b * p[0][1]])
}

impl<P: Planner, H: Housekeeping, O: ResponseOutput> Machine<P, H, O> {
    /// Measures the bed and activates a matching correction
    ///
    /// `z_adjust` is added to every stored grid height.
    pub fn detailed_probe(&mut self, z_adjust: f64) -> Result<(), MachineError> {
        self.require_homed()?;
        self.synchronize();
        self.correction = BedCorrection::None;

        self.planner.deploy_probe();
        let leveling = self.config.leveling;
        let result = if self.mechanism.is_delta() {
            self.probe_height_map(z_adjust).map(BedCorrection::Grid)
        } else if leveling.three_point {
            self.probe_three_points()
        } else {
            self.probe_plane()
        };
        self.synchronize();
        self.planner.stow_probe();

        self.correction = result?;
        log::info!("bed correction active");
        Ok(())
    }

    /// Visits the grid in serpentine order, calling `visit` with indices and probe XY
    fn probe_grid(
        &mut self,
        mut visit: impl FnMut(usize, usize, f64, f64, f64),
    ) -> Result<usize, MachineError> {
        let lv = self.config.leveling;
        let n = lv.grid_points;
        if !(2..=MAX_GRID_POINTS).contains(&n) {
            return Err(MachineError::Argument("Grid points must be between 2 and 9"));
        }
        let gaps = (n - 1) as f64;
        let (step_x, step_y) = ((lv.right - lv.left) / gaps, (lv.back - lv.front) / gaps);
        let delta = self.mechanism.is_delta();
        let mut probed = 0;

        for yi in 0..n {
            let y = lv.front + step_y * yi as f64;
            for k in 0..n {
                let xi = if yi % 2 == 1 { k } else { n - 1 - k };
                let x = lv.left + step_x * xi as f64;
                if delta && sqrt(x * x + y * y) > lv.probable_radius {
                    continue;
                }
                let z_before = if probed == 0 {
                    self.config.probe.raise_before
                } else {
                    self.position.z + self.config.probe.raise_between
                };
                let z = self.probe_pt(x, y, z_before)?.z;
                visit(xi, yi, x, y, z);
                probed += 1;
                self.housekeeping.idle();
            }
        }
        Ok(probed)
    }

    fn probe_height_map(&mut self, z_adjust: f64) -> Result<HeightMap, MachineError> {
        let lv = self.config.leveling;
        let mut map = HeightMap::new(lv.grid_points, lv.left, lv.right, lv.front, lv.back)?;
        let offset = self.config.probe.offset[Z_AXIS] + z_adjust;
        self.probe_grid(|xi, yi, _, _, z| map.set(xi, yi, z + offset))?;
        map.extrapolate();

        let n = map.points();
        for y in 0..n {
            self.output.output(|o| {
                for x in 0..n {
                    let _ = write!(o, "{:.2} ", map.get(x, y));
                }
            });
        }
        Ok(map)
    }

    fn probe_plane(&mut self) -> Result<BedCorrection, MachineError> {
        let mut fit = PlaneFit::default();
        let offset = self.config.probe.offset[Z_AXIS];
        self.probe_grid(|_, _, x, y, z| fit.add(x, y, z + offset))?;
        let [a, b, d] = fit.solve()?;
        respond!(self.output, "Eqn coefficients: a: {:.6} b: {:.6} d: {:.6}", a, b, d);
        Ok(BedCorrection::Plane { a, b, d })
    }

    fn probe_three_points(&mut self) -> Result<BedCorrection, MachineError> {
        let pts = self.config.leveling.three_points;
        let offset = self.config.probe.offset[Z_AXIS];
        let mut measured = [[0.0; 3]; 3];
        for (i, [x, y]) in pts.into_iter().enumerate() {
            let z_before = if i == 0 {
                self.config.probe.raise_before
            } else {
                self.position.z + self.config.probe.raise_between
            };
            let z = self.probe_pt(x, y, z_before)?.z;
            measured[i] = [x, y, z + offset];
        }
        let [a, b, d] = plane_through(measured)?;
        respond!(self.output, "Eqn coefficients: a: {:.6} b: {:.6} d: {:.6}", a, b, d);
        Ok(BedCorrection::Plane { a, b, d })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinematics::Position;
    use crate::machine::testing::*;
    use approx::assert_abs_diff_eq;
    use core::cell::RefCell;

    fn tilted(n: usize, a: f64, b: f64, skip_corners: bool) -> HeightMap {
        let mut map = HeightMap::new(n, -60.0, 60.0, -60.0, 60.0).unwrap();
        let half = (n - 1) / 2;
        for x in 0..n {
            for y in 0..n {
                let (gx, gy) = (x as f64 - half as f64, y as f64 - half as f64);
                if skip_corners && gx.abs() + gy.abs() >= 3.0 {
                    continue;
                }
                map.set(x, y, a * gx + b * gy);
            }
        }
        map
    }

    #[test]
    fn interpolation_is_exact_on_a_plane() {
        let map = tilted(5, 0.1, -0.2, false);
        // spacing is 30mm, so one grid step per 30mm
        assert_abs_diff_eq!(map.height_at(15.0, 0.0), 0.05, epsilon = 1e-9);
        assert_abs_diff_eq!(map.height_at(-45.0, 30.0), -0.15 - 0.2, epsilon = 1e-9);
        assert_abs_diff_eq!(map.height_at(0.0, 0.0), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn interpolation_clamps_outside_the_grid() {
        let map = tilted(3, 1.0, 0.0, false);
        assert_abs_diff_eq!(map.height_at(500.0, 0.0), 0.999, epsilon = 1e-9);
    }

    #[test]
    fn extrapolation_recovers_a_plane() {
        let mut map = tilted(7, 0.05, 0.02, true);
        assert!(!map.is_filled(0, 0));
        map.extrapolate();
        for x in 0..7 {
            for y in 0..7 {
                let expected = 0.05 * (x as f64 - 3.0) + 0.02 * (y as f64 - 3.0);
                assert_abs_diff_eq!(map.get(x, y), expected, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn even_grids_are_rejected() {
        assert!(HeightMap::new(4, -1.0, 1.0, -1.0, 1.0).is_err());
        assert!(HeightMap::new(11, -1.0, 1.0, -1.0, 1.0).is_err());
    }

    #[test]
    fn median_of_three() {
        assert_eq!(median3(1.0, 2.0, 3.0), 2.0);
        assert_eq!(median3(3.0, 1.0, 2.0), 2.0);
        assert_eq!(median3(2.0, 3.0, 1.0), 2.0);
        assert_eq!(median3(5.0, 5.0, 1.0), 5.0);
    }

    #[test]
    fn least_squares_plane() {
        let mut fit = PlaneFit::default();
        for (x, y) in [(0.0, 0.0), (10.0, 0.0), (0.0, 10.0), (10.0, 10.0), (5.0, 3.0)] {
            fit.add(x, y, 0.01 * x - 0.02 * y + 0.3);
        }
        let [a, b, d] = fit.solve().unwrap();
        assert_abs_diff_eq!(a, 0.01, epsilon = 1e-9);
        assert_abs_diff_eq!(b, -0.02, epsilon = 1e-9);
        assert_abs_diff_eq!(d, 0.3, epsilon = 1e-9);
    }

    #[test]
    fn collinear_points_fail() {
        let mut fit = PlaneFit::default();
        for x in [0.0, 1.0, 2.0, 3.0] {
            fit.add(x, x, 0.0);
        }
        assert_eq!(fit.solve(), Err(MachineError::LevelingFailed));
        assert_eq!(
            plane_through([[0.0, 0.0, 0.0], [1.0, 1.0, 0.0], [2.0, 2.0, 1.0]]),
            Err(MachineError::LevelingFailed)
        );
    }

    #[test]
    fn three_point_plane() {
        let [a, b, d] = plane_through([[0.0, 0.0, 1.0], [10.0, 0.0, 2.0], [0.0, 10.0, 0.0]]).unwrap();
        assert_abs_diff_eq!(a, 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(b, -0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(d, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn detailed_probe_on_flat_cartesian_bed() {
        let out = RefCell::new(Vec::new());
        let mut m = cartesian(&out);
        m.config.leveling.grid_points = 3;
        m.config.leveling.left = 20.0;
        m.config.leveling.right = 180.0;
        m.config.leveling.front = 20.0;
        m.config.leveling.back = 180.0;
        m.planner.bed = Some(1.0);
        m.set_position(Position::new(0.0, 0.0, 30.0, 0.0)).unwrap();
        m.detailed_probe(0.0).unwrap();

        match m.correction() {
            BedCorrection::Plane { a, b, d } => {
                assert_abs_diff_eq!(*a, 0.0, epsilon = 1e-9);
                assert_abs_diff_eq!(*b, 0.0, epsilon = 1e-9);
                assert_abs_diff_eq!(*d, 1.0, epsilon = 1e-9);
            }
            other => panic!("unexpected correction {:?}", other),
        }
        assert!(out.borrow().iter().any(|l| l.starts_with("Eqn coefficients: a: ")));
    }

    #[test]
    fn detailed_probe_requires_homing() {
        let out = RefCell::new(Vec::new());
        let mut m = cartesian(&out);
        m.homed = [false; 3];
        assert_eq!(m.detailed_probe(0.0), Err(MachineError::PositionUnknown));
    }
}
