use super::{Kinematics, Position, Segments};
use crate::error::KinematicError;

/// Each actuator drives one tool axis directly
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cartesian;

impl Kinematics for Cartesian {
    fn to_actuator(&self, tool: [f64; 3]) -> Result<[f64; 3], KinematicError> {
        Ok(tool)
    }

    fn to_tool(&self, actuator: [f64; 3]) -> Result<[f64; 3], KinematicError> {
        Ok(actuator)
    }

    fn segment(&self, from: &Position, to: &Position, _feedrate: f64, _feed_multiply: f64) -> Segments {
        Segments::single(from, to)
    }
}
