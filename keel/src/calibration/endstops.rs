use super::{probe_point, CalibrationState, Point, ProbeRig};
use crate::error::MachineError;
use libm::fabs;

/// Levels the three tower points by moving the endstop offsets
///
/// Each pass adds the tower readings to the offsets. Once all three are within precision the
/// offsets are shifted so the largest is zero, and the build height shrinks by the same amount.
/// Returns the number of probing passes.
pub fn adjust_endstops<R: ProbeRig + ?Sized>(
    rig: &mut R,
    state: &mut CalibrationState,
) -> Result<usize, MachineError> {
    let precision = state.precision;
    let status = |v: f64| if fabs(v) <= precision { "OK" } else { "ERROR" };
    let mut passes = 0;

    let converged = loop {
        if passes >= state.max_iterations {
            break false;
        }
        passes += 1;
        let z = probe_point(rig, state, Point::Z)?;
        let x = probe_point(rig, state, Point::X)?;
        let y = probe_point(rig, state, Point::Y)?;
        rig.apply_endstop_adjustment([x, y, z])?;

        let adj = *rig.delta()?.endstop_adj();
        rig.report(format_args!(
            "x:{:.4} (adj:{:.4}) y:{:.4} (adj:{:.4}) z:{:.4} (adj:{:.4})",
            x, adj[0], y, adj[1], z, adj[2]
        ));
        rig.report(format_args!(
            "X={} Y={} Z={}",
            status(x),
            status(y),
            status(z)
        ));
        if [x, y, z].iter().all(|v| fabs(*v) <= precision) {
            break true;
        }
    };

    let adj = *rig.delta()?.endstop_adj();
    let high = adj.iter().fold(0.0_f64, |m, a| m.max(*a));
    if high > 0.0 {
        rig.report(format_args!("Reducing Build height by {:.2}", high));
        let delta = rig.delta_mut()?;
        for (tower, a) in adj.iter().enumerate() {
            delta.set_endstop_adj(tower, a - high);
        }
        rig.reduce_build_height(high);
    }
    rig.reset_safe_height();

    if converged {
        log::debug!("endstops level after {} passes", passes);
        Ok(passes)
    } else {
        Err(MachineError::NotConverged)
    }
}
