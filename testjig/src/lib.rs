//! Host side harness for keel
//!
//! Runs the whole controller, from received bytes to actuator moves, against a simulated machine
//! whose true geometry can differ from the configured one.

mod jig;
mod sim;

pub use jig::{Jig, JigConfig, QUEUE_LEN};
pub use sim::{delta_truth, SimConfig, SimPlanner};

use keel::gcode::checksum;
use keel::Housekeeping;

/// Simulated time, advancing one millisecond per housekeeping round
#[derive(Debug, Default)]
pub struct SimClock(pub u64);

impl Housekeeping for SimClock {
    fn now_ms(&self) -> u64 {
        self.0
    }

    fn idle(&mut self) {
        self.0 += 1;
    }
}

/// A host line with sequence number and checksum, newline terminated
pub fn framed(sequence: i32, body: &str) -> String {
    let line = format!("N{} {}", sequence, body);
    let cs = checksum(line.as_bytes());
    format!("{}*{}\n", line, cs)
}
