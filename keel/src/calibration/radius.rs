use super::{probe_point, refine, CalibrationState, Point, ProbeRig};
use crate::error::MachineError;
use libm::fabs;

/// Consecutive passes without a better centre reading that end the search
const MAX_NON_IMPROVING: usize = 3;

/// Flattens the centre reading by adjusting the delta radius
///
/// Nothing is done while the centre is within half the precision. Returns whether the radius
/// was searched at all. If the centre stops improving, the radius with the best reading is kept.
pub fn adjust_delta_radius<R: ProbeRig + ?Sized>(
    rig: &mut R,
    state: &mut CalibrationState,
) -> Result<bool, MachineError> {
    let mut c = state.get(Point::Centre);
    if fabs(c) <= state.precision / 2.0 {
        rig.report(format_args!("Delta Radius OK"));
        return Ok(false);
    }
    rig.report(format_args!("Adjusting Delta Radius"));
    rig.reset_safe_height();

    let mut step = if c > 0.0 { -0.1 } else { 0.1 };
    let mut best = (fabs(c), rig.delta()?.radius());
    let mut non_improving = 0;
    for _ in 0..state.max_steps {
        let radius = rig.delta()?.radius() + step;
        rig.delta_mut()?.set_radius(radius);
        let previous = c;
        c = probe_point(rig, state, Point::Centre)?;
        rig.report(format_args!("r:{:.4} (adj:{:.4}) c:{:.4}", radius, step, c));

        if fabs(c) <= state.precision {
            log::debug!("delta radius {:.4}", radius);
            return Ok(true);
        }
        if fabs(c) < best.0 {
            best = (fabs(c), radius);
            non_improving = 0;
        } else {
            non_improving += 1;
            if non_improving >= MAX_NON_IMPROVING {
                rig.delta_mut()?.set_radius(best.1);
                rig.reset_safe_height();
                log::debug!("delta radius stalled, keeping {:.4}", best.1);
                return Ok(true);
            }
        }
        step = refine(step, previous, c);
    }

    rig.delta_mut()?.set_radius(best.1);
    Err(MachineError::NotConverged)
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::adjust_endstops;
    use super::*;

    #[test]
    fn small_centre_error_is_left_alone() {
        let mut rig = VirtualDelta::new(truth(|_| {}), [0.0; 3]);
        let mut state = state();
        state.set(Point::Centre, 0.01);
        assert_eq!(adjust_delta_radius(&mut rig, &mut state), Ok(false));
        assert_eq!(rig.probes, 0);
        assert_eq!(rig.lines(), vec!["Delta Radius OK".to_string()]);
    }

    #[test]
    fn radius_error_is_found() {
        let mut rig = VirtualDelta::new(truth(|d| d.set_radius(105.7)), [0.0; 3]);
        let mut state = state();
        // homing references the centre, the error shows once the towers are level
        adjust_endstops(&mut rig, &mut state).unwrap();
        probe_point(&mut rig, &mut state, Point::Centre).unwrap();
        assert!(state.get(Point::Centre) < -state.precision);

        let skip = rig.lines().len();
        assert_eq!(adjust_delta_radius(&mut rig, &mut state), Ok(true));
        assert!(fabs(state.get(Point::Centre)) <= state.precision);
        assert!(rig.believed.radius() > 105.2);
        assert_eq!(rig.lines()[skip], "Adjusting Delta Radius");
        assert!(rig.lines()[skip + 1].starts_with("r:105.3000 (adj:0.1000) c:"));
    }

    #[test]
    fn step_search_is_capped() {
        let mut rig = VirtualDelta::new(truth(|d| d.set_radius(108.0)), [0.0; 3]);
        let mut state = state();
        adjust_endstops(&mut rig, &mut state).unwrap();
        probe_point(&mut rig, &mut state, Point::Centre).unwrap();
        state.max_steps = 2;
        let before = rig.probes;
        assert_eq!(
            adjust_delta_radius(&mut rig, &mut state),
            Err(MachineError::NotConverged)
        );
        assert_eq!(rig.probes, before + 2);
    }
}
