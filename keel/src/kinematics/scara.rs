use super::{Kinematics, Position, Segments};
use crate::config::ScaraConfig;
use crate::error::KinematicError;
use libm::{atan2, cos, fabs, sin, sqrt};

/// Two link arm; actuators are the shoulder angle, the absolute elbow link angle and Z
#[derive(Debug, Clone, PartialEq)]
pub struct Scara {
    linkage: [f64; 2],
    offset: [f64; 2],
    scaling: [f64; 2],
    segments_per_second: f64,
}

impl Scara {
    pub fn new(config: &ScaraConfig) -> Self {
        Self {
            linkage: config.linkage,
            offset: config.offset,
            scaling: config.scaling,
            segments_per_second: config.segments_per_second,
        }
    }
}

impl Kinematics for Scara {
    fn to_actuator(&self, tool: [f64; 3]) -> Result<[f64; 3], KinematicError> {
        let [l1, l2] = self.linkage;
        let px = tool[0] * self.scaling[0] - self.offset[0];
        let py = tool[1] * self.scaling[1] - self.offset[1];

        let c2 = (px * px + py * py - l1 * l1 - l2 * l2) / (2.0 * l1 * l2);
        if fabs(c2) > 1.0 {
            return Err(KinematicError::Unreachable);
        }
        let s2 = sqrt(1.0 - c2 * c2);
        let k1 = l1 + l2 * c2;
        let k2 = l2 * s2;

        let theta = atan2(k1, k2) - atan2(px, py);
        let psi = atan2(s2, c2);
        Ok([theta.to_degrees(), (theta + psi).to_degrees(), tool[2]])
    }

    fn to_tool(&self, actuator: [f64; 3]) -> Result<[f64; 3], KinematicError> {
        let [l1, l2] = self.linkage;
        let inner = actuator[0].to_radians();
        let outer = actuator[1].to_radians();
        let x = l1 * cos(inner) + l2 * cos(outer) + self.offset[0];
        let y = l1 * sin(inner) + l2 * sin(outer) + self.offset[1];
        Ok([x / self.scaling[0], y / self.scaling[1], actuator[2]])
    }

    fn segment(&self, from: &Position, to: &Position, feedrate: f64, feed_multiply: f64) -> Segments {
        Segments::timed(from, to, feedrate, feed_multiply, self.segments_per_second)
    }
}
