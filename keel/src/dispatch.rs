//! Command dispatch
//!
//! Maps one validated record to a machine operation, reports any failure on the response
//! channel, and acknowledges interactive records. Every record gets exactly one `ok`, whether
//! the operation succeeded or not. After an emergency stop nothing runs and nothing is
//! acknowledged.

use crate::calibration::CalibrationRequest;
use crate::channel::CommandChannel;
use crate::error::MachineError;
use crate::gcode::{Command, CommandRecord};
use crate::housekeeping::Housekeeping;
use crate::kinematics::{X_AXIS, Y_AXIS, Z_AXIS};
use crate::machine::Machine;
use crate::planner::Planner;
use crate::probe::RepeatabilityArgs;
use crate::respond;
use crate::response::ResponseOutput;

const AXIS_LETTERS: [u8; 4] = [b'X', b'Y', b'Z', b'E'];

impl<P: Planner, H: Housekeeping, O: ResponseOutput> Machine<P, H, O> {
    /// Executes one record and acknowledges it
    pub fn execute<C: ResponseOutput>(&mut self, channel: &CommandChannel<C>, record: &CommandRecord) {
        if channel.is_killed() {
            log::debug!("killed, dropping {:?}", record.as_str());
            return;
        }
        if let Err(e) = self.process(channel, record) {
            log::warn!("{:?} failed: {}", record.as_str(), e);
            match e {
                MachineError::PositionUnknown => respond!(self.output, "echo:{}", e),
                MachineError::Argument(reason) => respond!(self.output, "?{}", reason),
                _ => respond!(self.output, "Error:{}", e),
            }
        }
        channel.acknowledge(record.origin());
    }

    fn process<C: ResponseOutput>(
        &mut self,
        channel: &CommandChannel<C>,
        record: &CommandRecord,
    ) -> Result<(), MachineError> {
        let Some(Command { letter, number }) = record.command() else {
            self.unknown(record);
            return Ok(());
        };
        log::debug!("dispatch {}{}", letter as char, number);
        match (letter, number) {
            (b'G', 0 | 1) => {
                if channel.is_stopped() {
                    return Ok(());
                }
                self.linear_move(record)
            }
            (b'G', 4) => {
                let ms = match (record.value(b'P'), record.value(b'S')) {
                    (Some(p), _) => p,
                    (None, Some(s)) => s * 1000.0,
                    (None, None) => 0.0,
                };
                self.dwell(ms.max(0.0) as u64);
                Ok(())
            }
            (b'G', 28) => self.home(),
            (b'G', 29) => self.detailed_probe(record.value(b'Z').unwrap_or(0.0)),
            (b'G', 30) => self
                .delta_calibration(&calibration_request(record))
                .map(|_| ()),
            (b'G', 90) => {
                self.relative = false;
                Ok(())
            }
            (b'G', 91) => {
                self.relative = true;
                Ok(())
            }
            (b'G', 92) => self.declare_position(record),
            (b'M', 48) => self.repeatability(repeatability_args(record)).map(|_| ()),
            (b'M', 110) => Ok(()),
            (b'M', 112) => {
                channel.kill();
                self.kill();
                Ok(())
            }
            (b'M', 114) => {
                self.report_position();
                Ok(())
            }
            (b'M', 665) => self.set_geometry(record),
            (b'M', 666) => self.adjust_geometry(record),
            (b'M', 999) => {
                channel.resume();
                Ok(())
            }
            _ => {
                self.unknown(record);
                Ok(())
            }
        }
    }

    fn unknown(&self, record: &CommandRecord) {
        respond!(self.output, "echo:Unknown command: \"{}\"", record.as_str());
    }

    /// `G0`/`G1`
    fn linear_move(&mut self, record: &CommandRecord) -> Result<(), MachineError> {
        let mut dest = self.position;
        for (axis, letter) in AXIS_LETTERS.iter().enumerate() {
            if let Some(v) = record.value(*letter) {
                let base = if self.relative { self.position.axis(axis) } else { 0.0 };
                *dest.axis_mut(axis) = base + v;
            }
        }
        if let Some(f) = record.value(b'F').filter(|f| *f > 0.0) {
            self.feedrate = f;
        }
        self.prepare_move(dest)
    }

    /// `G92`
    fn declare_position(&mut self, record: &CommandRecord) -> Result<(), MachineError> {
        if AXIS_LETTERS[..3].iter().any(|l| record.has(*l)) {
            self.synchronize();
        }
        let mut position = self.position;
        for (axis, letter) in AXIS_LETTERS.iter().enumerate() {
            if let Some(v) = record.value(*letter) {
                *position.axis_mut(axis) = v;
            }
        }
        self.set_position(position)
    }

    /// `M665`
    fn set_geometry(&mut self, record: &CommandRecord) -> Result<(), MachineError> {
        let delta = self.require_delta_mut()?;
        if let Some(rod) = record.value(b'L') {
            delta.set_diagonal_rod(rod);
        }
        if let Some(radius) = record.value(b'R') {
            delta.set_radius(radius);
        }
        if let Some(sps) = record.value(b'S') {
            delta.set_segments_per_second(sps);
        }
        Ok(())
    }

    /// `M666`
    fn adjust_geometry(&mut self, record: &CommandRecord) -> Result<(), MachineError> {
        let probe_offsets = record.has(b'P');
        let delta = self.require_delta_mut()?;
        for (i, letter) in b"ABCIJK".iter().enumerate() {
            if let Some(v) = record.value(*letter) {
                delta.set_tower_adj(i, v);
            }
        }
        for (i, letter) in b"UVW".iter().enumerate() {
            if let Some(v) = record.value(*letter) {
                delta.set_diagrod_adj(i, v);
            }
        }
        if let Some(radius) = record.value(b'R') {
            delta.set_radius(radius);
        }
        if let Some(rod) = record.value(b'D') {
            delta.set_diagonal_rod(rod);
        }
        if !probe_offsets {
            for (axis, letter) in AXIS_LETTERS[..3].iter().enumerate() {
                if let Some(v) = record.value(*letter) {
                    delta.set_endstop_adj(axis, v);
                }
            }
        }

        if probe_offsets {
            let offset = &mut self.config.probe.offset;
            let mut any_axis = false;
            for (axis, letter) in AXIS_LETTERS[..3].iter().enumerate() {
                if let Some(v) = record.value(*letter) {
                    offset[axis] = v;
                    any_axis = true;
                }
            }
            if let (false, Some(z)) = (any_axis, record.value(b'P')) {
                offset[Z_AXIS] = z;
            }
        }
        if let Some(height) = record.value(b'H') {
            self.config.axes[Z_AXIS].max_pos = height;
        }

        if record.has(b'L') {
            self.report_geometry()?;
        }
        Ok(())
    }

    fn report_geometry(&self) -> Result<(), MachineError> {
        let d = self.require_delta()?.config();
        let off = self.config.probe.offset;
        respond!(self.output, "Current Delta geometry values:");
        for (axis, name) in ["X", "Y", "Z"].iter().enumerate() {
            respond!(self.output, "{} (Endstop Adj): {:.3}", name, d.endstop_adj[axis]);
        }
        respond!(
            self.output,
            "P (Z-Probe Offset): X{:.2} Y{:.2} Z{:.2}",
            off[X_AXIS],
            off[Y_AXIS],
            off[Z_AXIS]
        );
        let towers = ["A", "B", "C"];
        for (i, letter) in ["A", "B", "C"].iter().enumerate() {
            respond!(self.output, "{} (Tower {} Position Correction): {:.3}", letter, towers[i], d.tower_adj[i]);
        }
        for (i, letter) in ["I", "J", "K"].iter().enumerate() {
            respond!(self.output, "{} (Tower {} Radius Correction): {:.3}", letter, towers[i], d.tower_adj[3 + i]);
        }
        for (i, letter) in ["U", "V", "W"].iter().enumerate() {
            respond!(self.output, "{} (Tower {} Diagonal Rod Correction): {:.3}", letter, towers[i], d.diagrod_adj[i]);
        }
        respond!(self.output, "R (Delta Radius): {:.2}", d.radius);
        respond!(self.output, "D (Diagonal Rod Length): {:.2}", d.diagonal_rod);
        respond!(self.output, "H (Z-Height): {:.2}", self.config.axes[Z_AXIS].max_pos);
        Ok(())
    }
}

fn calibration_request(record: &CommandRecord) -> CalibrationRequest {
    let probe_at = (record.has(b'X') && record.has(b'Y')).then(|| {
        [
            record.value(b'X').unwrap_or(0.0),
            record.value(b'Y').unwrap_or(0.0),
        ]
    });
    CalibrationRequest {
        show_carriages: record.has(b'C'),
        probe_at,
        auto: record.has(b'A'),
        precision: record.value(b'A'),
        endstops: record.has(b'E'),
        radius: record.has(b'R'),
        tower_angle: record.value_i32(b'I'),
        tower_radius: record.value_i32(b'T'),
        rod: record.has(b'D'),
    }
}

fn repeatability_args(record: &CommandRecord) -> RepeatabilityArgs {
    let defaults = RepeatabilityArgs::default();
    RepeatabilityArgs {
        verbosity: record.value_i32(b'V').unwrap_or(defaults.verbosity),
        samples: record
            .value_i32(b'J')
            .or_else(|| record.value_i32(b'P'))
            .unwrap_or(defaults.samples),
        x: record.value(b'X'),
        y: record.value(b'Y'),
        legs: record.value_i32(b'L').unwrap_or(defaults.legs),
        engage_each: record.has(b'E'),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gcode::Origin;
    use crate::kinematics::{Delta, Kinematics, Position};
    use crate::machine::testing::*;
    use approx::assert_abs_diff_eq;
    use core::cell::RefCell;

    type Channel<'a> = CommandChannel<&'a RefCell<Vec<String>>>;

    fn run(machine: &mut TestMachine<'_>, channel: &Channel<'_>, line: &str) {
        machine.execute(channel, &CommandRecord::new(line.as_bytes(), Origin::Interactive));
    }

    fn take(out: &RefCell<Vec<String>>) -> Vec<String> {
        out.borrow_mut().drain(..).collect()
    }

    #[test]
    fn move_then_ok() {
        let out = RefCell::new(Vec::new());
        let channel = CommandChannel::new(&out);
        let mut m = cartesian(&out);
        run(&mut m, &channel, "G1 X10 Y20 F600");
        assert_eq!(m.planner.lines.len(), 1);
        assert_eq!(m.position().xyz(), [10.0, 20.0, 0.0]);
        assert_eq!(m.feedrate(), 600.0);
        assert_eq!(take(&out), vec!["ok"]);
    }

    #[test]
    fn relative_moves_accumulate() {
        let out = RefCell::new(Vec::new());
        let channel = CommandChannel::new(&out);
        let mut m = cartesian(&out);
        run(&mut m, &channel, "G91");
        run(&mut m, &channel, "G1 X5 E1");
        run(&mut m, &channel, "G1 X5 E1");
        assert_eq!(m.position(), Position::new(10.0, 0.0, 0.0, 2.0));
        run(&mut m, &channel, "G90");
        run(&mut m, &channel, "G0 X1");
        assert_eq!(m.position().x, 1.0);
    }

    #[test]
    fn motion_is_skipped_while_stopped() {
        let out = RefCell::new(Vec::new());
        let channel = CommandChannel::new(&out);
        let mut m = cartesian(&out);
        channel.stop();
        run(&mut m, &channel, "G1 X10");
        assert!(m.planner.lines.is_empty());
        assert_eq!(take(&out), vec!["ok"]);

        run(&mut m, &channel, "M999");
        assert!(!channel.is_stopped());
        assert_eq!(take(&out), vec!["Resend:1", "ok", "ok"]);
        run(&mut m, &channel, "G1 X10");
        assert_eq!(m.planner.lines.len(), 1);
    }

    #[test]
    fn unknown_commands_are_echoed() {
        let out = RefCell::new(Vec::new());
        let channel = CommandChannel::new(&out);
        let mut m = cartesian(&out);
        run(&mut m, &channel, "M9000 S1");
        assert_eq!(take(&out), vec!["echo:Unknown command: \"M9000 S1\"", "ok"]);
    }

    #[test]
    fn replayed_records_are_not_acknowledged() {
        let out = RefCell::new(Vec::new());
        let channel = CommandChannel::new(&out);
        let mut m = cartesian(&out);
        m.execute(&channel, &CommandRecord::new(b"G1 X3", Origin::Replay));
        assert_eq!(m.position().x, 3.0);
        assert!(take(&out).is_empty());
    }

    #[test]
    fn calibration_before_homing_is_refused() {
        let out = RefCell::new(Vec::new());
        let channel = CommandChannel::new(&out);
        let mut m = delta(&out);
        m.homed = [false; 3];
        run(&mut m, &channel, "G30 A");
        assert_eq!(take(&out), vec!["echo:Home X/Y before Z", "ok"]);
        assert!(m.planner.lines.is_empty());
    }

    #[test]
    fn bad_arguments_are_reported_with_a_question_mark() {
        let out = RefCell::new(Vec::new());
        let channel = CommandChannel::new(&out);
        let mut m = cartesian(&out);
        run(&mut m, &channel, "M48 V9");
        assert_eq!(take(&out), vec!["?Verbose Level not plausible.", "ok"]);
    }

    #[test]
    fn geometry_commands_update_the_delta() {
        let out = RefCell::new(Vec::new());
        let channel = CommandChannel::new(&out);
        let mut m = delta(&out);
        run(&mut m, &channel, "M665 L220 R100 S100");
        run(&mut m, &channel, "M666 X-0.5 A0.2 K-0.1 W0.05 H240");
        let d = m.delta().unwrap();
        assert_eq!(d.diagonal_rod(), 220.0);
        assert_eq!(d.radius(), 100.0);
        assert_eq!(d.segments_per_second(), 100.0);
        assert_eq!(d.endstop_adj(), &[-0.5, 0.0, 0.0]);
        assert_eq!(d.tower_adj(), &[0.2, 0.0, 0.0, 0.0, 0.0, -0.1]);
        assert_eq!(d.diagrod_adj(), &[0.0, 0.0, 0.05]);
        assert_eq!(m.config().axes[Z_AXIS].max_pos, 240.0);
        // the transform follows immediately
        let top = m.mechanism().to_tool([200.0, 200.0, 200.0]).unwrap();
        let expected = Delta::new(&m.delta().unwrap().config())
            .to_tool([200.0, 200.0, 200.0])
            .unwrap();
        assert_eq!(top, expected);

        run(&mut m, &channel, "M666 P-1.2");
        assert_eq!(m.config().probe.offset, [0.0, 0.0, -1.2]);
        run(&mut m, &channel, "M666 P X1 Y2");
        assert_eq!(m.config().probe.offset, [1.0, 2.0, -1.2]);
        // probe offsets leave the endstops alone
        assert_eq!(m.delta().unwrap().endstop_adj(), &[-0.5, 0.0, 0.0]);
        take(&out);

        run(&mut m, &channel, "M666 L");
        let lines = take(&out);
        assert_eq!(lines[0], "Current Delta geometry values:");
        assert_eq!(lines[1], "X (Endstop Adj): -0.500");
        assert_eq!(lines[4], "P (Z-Probe Offset): X1.00 Y2.00 Z-1.20");
        assert_eq!(lines[5], "A (Tower A Position Correction): 0.200");
        assert!(lines.contains(&"D (Diagonal Rod Length): 220.00".to_string()));
        assert_eq!(lines.last().map(String::as_str), Some("ok"));
    }

    #[test]
    fn geometry_commands_need_a_delta() {
        let out = RefCell::new(Vec::new());
        let channel = CommandChannel::new(&out);
        let mut m = cartesian(&out);
        run(&mut m, &channel, "M665 L220");
        assert_eq!(
            take(&out),
            vec!["Error:Command requires a delta mechanism", "ok"]
        );
    }

    #[test]
    fn dwell_runs_housekeeping() {
        let out = RefCell::new(Vec::new());
        let channel = CommandChannel::new(&out);
        let mut m = cartesian(&out);
        run(&mut m, &channel, "G4 P100");
        assert!(m.housekeeping.0 >= 100);
        run(&mut m, &channel, "G4 S0.5");
        assert!(m.housekeeping.0 >= 600);
    }

    #[test]
    fn set_position_declares_without_moving() {
        let out = RefCell::new(Vec::new());
        let channel = CommandChannel::new(&out);
        let mut m = cartesian(&out);
        run(&mut m, &channel, "G92 X5 Z2 E7");
        assert_eq!(m.position(), Position::new(5.0, 0.0, 2.0, 7.0));
        assert!(m.planner.lines.is_empty());
        assert_eq!(m.planner.position, [5.0, 0.0, 2.0]);
    }

    #[test]
    fn emergency_stop_from_replay_halts() {
        let out = RefCell::new(Vec::new());
        let channel = CommandChannel::new(&out);
        let mut m = cartesian(&out);
        m.execute(&channel, &CommandRecord::new(b"M112", Origin::Replay));
        assert!(!m.is_homed());
        assert!(channel.is_killed());
        assert!(!channel.is_stopped());
    }

    #[test]
    fn nothing_runs_once_killed() {
        let out = RefCell::new(Vec::new());
        let channel = CommandChannel::new(&out);
        let mut m = cartesian(&out);
        m.homed = [false; 3];
        channel.kill();
        for line in ["G28", "G1 X10", "M114", "M999"] {
            run(&mut m, &channel, line);
        }
        assert!(m.planner.lines.is_empty());
        assert!(!m.is_homed());
        assert!(channel.is_killed());
        assert!(take(&out).is_empty());
    }

    #[test]
    fn position_report() {
        let out = RefCell::new(Vec::new());
        let channel = CommandChannel::new(&out);
        let mut m = cartesian(&out);
        run(&mut m, &channel, "G1 X12.5");
        take(&out);
        run(&mut m, &channel, "M114");
        let lines = take(&out);
        assert!(lines[0].starts_with("X:12.50 Y:0.00 Z:0.00 E:0.00 Count X: 12.50"));
        assert_eq!(lines[1], "ok");
    }

    #[test]
    fn calibration_flags_are_parsed() {
        let r = calibration_request(&CommandRecord::new(b"G30 A0.02 I2 T3", Origin::Interactive));
        assert!(r.auto);
        assert_abs_diff_eq!(r.precision.unwrap(), 0.02);
        assert_eq!(r.tower_angle, Some(2));
        assert_eq!(r.tower_radius, Some(3));
        assert_eq!(r.probe_at, None);
        let r = calibration_request(&CommandRecord::new(b"G30 X10 Y-5", Origin::Interactive));
        assert_eq!(r.probe_at, Some([10.0, -5.0]));
        assert!(!r.auto);
    }
}
