use super::{probe_point, refine, CalibrationState, Point, ProbeRig};
use crate::error::MachineError;
use libm::fabs;

/// Centre error that counts as flat
const ROD_TOLERANCE: f64 = 0.005;
/// Smallest rod step worth trying
const MIN_ROD_STEP: f64 = 0.001;

/// Centre reading minus the mean of the opposite points
fn rod_error<R: ProbeRig + ?Sized>(
    rig: &mut R,
    state: &mut CalibrationState,
) -> Result<(f64, f64), MachineError> {
    let oy = probe_point(rig, state, Point::OppositeY)?;
    let oz = probe_point(rig, state, Point::OppositeZ)?;
    let ox = probe_point(rig, state, Point::OppositeX)?;
    let c = probe_point(rig, state, Point::Centre)?;
    let target = (ox + oy + oz) / 3.0;
    Ok((c - target, target))
}

/// Matches the centre height to the opposite points by changing the diagonal rod length
///
/// Returns the total change in rod length.
pub fn adjust_diagonal_rod<R: ProbeRig + ?Sized>(
    rig: &mut R,
    state: &mut CalibrationState,
) -> Result<f64, MachineError> {
    let start = rig.delta()?.diagonal_rod();
    let (mut error, mut target) = rod_error(rig, state)?;
    let mut step = if error > 0.0 { 0.2 } else { -0.2 };

    for _ in 0..state.max_steps {
        rig.report(format_args!(
            "target:{:.4} c:{:.4} adj:{:.5}",
            target,
            state.get(Point::Centre),
            step
        ));
        if fabs(error) < ROD_TOLERANCE || fabs(step) < MIN_ROD_STEP {
            return Ok(rig.delta()?.diagonal_rod() - start);
        }
        let rod = rig.delta()?.diagonal_rod() + step;
        rig.delta_mut()?.set_diagonal_rod(rod);
        let previous = error;
        (error, target) = rod_error(rig, state)?;
        step = refine(step, previous, error);
    }
    Err(MachineError::NotConverged)
}
