use super::{probe_point, refine, tolerate, CalibrationState, Point, ProbeRig};
use crate::error::MachineError;
use libm::fabs;

/// Tower radius error that counts as flat
const RADIUS_TOLERANCE: f64 = 0.01;
/// Tower angle error that counts as flat
const ANGLE_TOLERANCE: f64 = 0.001;
/// Smallest angle step worth trying, degrees
const MIN_ANGLE_STEP: f64 = 0.001;
/// Change in a reading too small to count as movement
const STUCK_EPSILON: f64 = 1e-4;

/// Opposite point of tower `t` minus the mean of the other two, halved
fn radius_error(state: &CalibrationState, t: usize) -> (f64, f64) {
    let own = state.get(Point::opposite(t));
    let target = (0..3)
        .filter(|o| *o != t)
        .map(|o| state.get(Point::opposite(o)))
        .sum::<f64>()
        / 2.0;
    ((own - target) / 2.0, target)
}

/// Moves tower `t` in or out until its opposite point matches the other two
pub fn adjust_tower_radius<R: ProbeRig + ?Sized>(
    rig: &mut R,
    state: &mut CalibrationState,
    t: usize,
) -> Result<(), MachineError> {
    let (mut error, mut target) = radius_error(state, t);
    if fabs(error) <= RADIUS_TOLERANCE {
        return Ok(());
    }
    let mut step = if error < 0.0 { -0.4 } else { 0.4 };
    let mut stuck = 0;

    for _ in 0..state.max_steps {
        let adj = rig.delta()?.tower_adj()[3 + t] + step;
        rig.delta_mut()?.set_tower_adj(3 + t, adj);

        let (previous, previous_own, previous_target) =
            (error, state.get(Point::opposite(t)), target);
        for point in Point::OPPOSITE {
            probe_point(rig, state, point)?;
        }
        (error, target) = radius_error(state, t);
        let own = state.get(Point::opposite(t));
        let done = fabs(error) <= RADIUS_TOLERANCE;
        rig.report(format_args!(
            " target:{:.6} {}:{:.6} tower radius adj:{:.8} done:{}",
            target,
            Point::opposite(t).label(),
            own,
            adj,
            done
        ));
        if done {
            return Ok(());
        }

        if fabs(own - previous_own) < STUCK_EPSILON && fabs(target - previous_target) < STUCK_EPSILON {
            stuck += 1;
            if stuck > 1 {
                rig.report(format_args!("Stuck in Loop.. Exiting"));
                return Ok(());
            }
        }
        step = refine(step, previous, error);
    }
    Err(MachineError::NotConverged)
}

/// The two opposite points whose difference tower `t`'s angle controls
fn angle_pair(t: usize) -> (Point, Point) {
    match t {
        0 => (Point::OppositeY, Point::OppositeZ),
        1 => (Point::OppositeZ, Point::OppositeX),
        _ => (Point::OppositeX, Point::OppositeY),
    }
}

fn angle_error<R: ProbeRig + ?Sized>(
    rig: &mut R,
    state: &mut CalibrationState,
    t: usize,
) -> Result<f64, MachineError> {
    let (a, b) = angle_pair(t);
    let a = probe_point(rig, state, a)?;
    let b = probe_point(rig, state, b)?;
    Ok(a - b)
}

/// Rotates tower `t` until the two opposite points beside it read the same
pub fn adjust_tower_angle<R: ProbeRig + ?Sized>(
    rig: &mut R,
    state: &mut CalibrationState,
    t: usize,
) -> Result<(), MachineError> {
    let (a, b) = angle_pair(t);
    let mut error = angle_error(rig, state, t)?;
    let mut step = if error > 0.0 { -0.2 } else { 0.2 };

    for _ in 0..state.max_steps {
        if fabs(error) <= ANGLE_TOLERANCE || fabs(step) < MIN_ANGLE_STEP {
            return Ok(());
        }
        let adj = rig.delta()?.tower_adj()[t] + step;
        rig.delta_mut()?.set_tower_adj(t, adj);
        let previous = error;
        error = angle_error(rig, state, t)?;
        rig.report(format_args!(
            "{}:{:.4} {}:{:.4} tower delta adj:{:.5}",
            a.label(),
            state.get(a),
            b.label(),
            state.get(b),
            adj
        ));
        step = refine(step, previous, error);
    }
    Err(MachineError::NotConverged)
}

/// Finds the tower whose position explains the opposite point errors and corrects it
///
/// A tower is suspect when its tower point and its opposite point disagree by more than the
/// precision. Returns whether any tower constant changed.
pub fn fix_tower_errors<R: ProbeRig + ?Sized>(
    rig: &mut R,
    state: &mut CalibrationState,
) -> Result<bool, MachineError> {
    let saved = *rig.delta()?.tower_adj();
    let precision = state.precision;

    let diff: [f64; 3] =
        core::array::from_fn(|t| fabs(state.get(Point::tower(t)) - state.get(Point::opposite(t))));
    rig.report(format_args!(
        "x_diff = {:.5} y_diff = {:.5} z_diff = {:.5}",
        diff[0], diff[1], diff[2]
    ));
    let mut error = diff.map(|d| d > precision);
    let close = |a: usize, b: usize| fabs(diff[a] - diff[b]) <= precision;
    let all_equal = close(0, 1) && close(0, 2) && close(1, 2);

    let opposite = Point::OPPOSITE.map(|p| state.get(p));
    let high = opposite.iter().fold(f64::MIN, |m, v| m.max(*v));
    let low = opposite.iter().fold(f64::MAX, |m, v| m.min(*v));
    let range = high - low;
    if range < precision {
        rig.report(format_args!(
            "Opposite Points within Limits - Adjustment not required"
        ));
        error = [false; 3];
    }

    let mut tower = None;
    if error.iter().all(|e| *e) {
        if all_equal {
            rig.report(format_args!("All Towers Errors Equal"));
            error = [false; 3];
        } else {
            let largest = diff.iter().fold(0.0_f64, |m, d| m.max(*d));
            tower = (0..3).rev().find(|t| diff[*t] == largest);
            if let Some(t) = tower {
                rig.report(format_args!("Tower {} has largest error", t + 1));
            }
        }
    }
    match error.iter().filter(|e| **e).count() {
        2 => tower = error.iter().position(|e| !*e),
        1 => tower = error.iter().position(|e| *e),
        _ => {}
    }

    let label = |e: bool| if e { "Err" } else { "OK" };
    rig.report(format_args!(
        "t1:{} t2:{} t3:{}",
        label(error[0]),
        label(error[1]),
        label(error[2])
    ));

    let Some(mut tower) = tower else {
        rig.report(format_args!("Tower geometry OK"));
        return Ok(false);
    };
    if range > 2.0 * precision {
        if let Some(t) = (0..3).rev().find(|t| saved[*t] != 0.0 || saved[*t + 3] != 0.0) {
            tower = t;
            rig.report(format_args!("Tower {} has already been adjusted", t + 1));
        }
    }

    rig.report(format_args!("Tower{} Error: Adjusting", tower + 1));
    tolerate(adjust_tower_radius(rig, state, tower), ())?;
    tolerate(adjust_tower_angle(rig, state, tower), ())?;

    let changed = saved != *rig.delta()?.tower_adj();
    if changed {
        log::info!("tower {} geometry adjusted", tower + 1);
    }
    Ok(changed)
}
