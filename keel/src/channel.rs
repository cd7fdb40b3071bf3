use crate::byte_source::{ByteSource, ReplaySource};
use crate::error::{MachineError, ProtocolError};
use crate::gcode::{checksum, CommandRecord, Origin, MAX_CMD_SIZE};
use crate::respond;
use crate::response::ResponseOutput;
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use heapless::spsc::Producer;

const EMERGENCY_STOP: &[u8] = b"M112";
const SEQUENCE_RESET: &[u8] = b"M110";

/// Records in flight from the intake to the dispatcher
///
/// Holds at most `N - 1` records.
pub type CommandQueue<const N: usize> = heapless::spsc::Queue<CommandRecord, N>;

/// Hook invoked synchronously when an emergency stop line is received
///
/// Implementations must halt all actuation and heating before returning.
pub trait EmergencyStop {
    fn emergency_stop(&self);
}

impl EmergencyStop for AtomicBool {
    fn emergency_stop(&self) {
        self.store(true, Ordering::SeqCst);
    }
}

impl<T: EmergencyStop> EmergencyStop for &T {
    fn emergency_stop(&self) {
        (*self).emergency_stop()
    }
}

/// Accumulates bytes of one line until a terminator arrives
pub struct LineAssembler {
    buf: heapless::Vec<u8, MAX_CMD_SIZE>,
    comment: bool,
}

enum Step {
    Pending,
    Empty,
    Line,
}

impl LineAssembler {
    pub const fn new() -> Self {
        Self {
            buf: heapless::Vec::new(),
            comment: false,
        }
    }

    /// True when no bytes of a partial line are held
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    fn feed(&mut self, c: u8, extra_terminator: Option<u8>) -> Step {
        let terminates = c == b'\n'
            || c == b'\r'
            || (!self.comment && (c == b':' || Some(c) == extra_terminator))
            || self.buf.len() >= MAX_CMD_SIZE - 1;
        if terminates {
            self.comment = false;
            if self.buf.is_empty() {
                Step::Empty
            } else {
                Step::Line
            }
        } else {
            if c == b';' {
                self.comment = true;
            }
            if !self.comment {
                let _ = self.buf.push(c);
            }
            Step::Pending
        }
    }

    fn clear(&mut self) {
        self.buf.clear();
        self.comment = false;
    }
}

impl Default for LineAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer-side state of the command channel
///
/// Owned by whichever context pulls bytes (typically the receive interrupt or the main loop's
/// pump), never shared with the dispatcher.
#[derive(Default)]
pub struct Intake {
    interactive: LineAssembler,
    replay: LineAssembler,
    stop_prereading: bool,
    replay_done: bool,
}

impl Intake {
    pub const fn new() -> Self {
        Self {
            interactive: LineAssembler::new(),
            replay: LineAssembler::new(),
            stop_prereading: false,
            replay_done: false,
        }
    }

    /// Prepares for a new replay source
    pub fn start_replay(&mut self) {
        self.replay.clear();
        self.stop_prereading = false;
        self.replay_done = false;
    }

    /// True once the completion notice for the current replay source has been issued
    pub fn replay_done(&self) -> bool {
        self.replay_done
    }

    /// True while replay is held back until the queue drains
    pub fn is_prereading_stopped(&self) -> bool {
        self.stop_prereading
    }
}

/// Line protocol implementation
///
/// Validates interactive lines (sequence numbers and checksums), assembles replay lines, and
/// owns the response side of the protocol. All shared state is atomic so the intake context and
/// the dispatcher can both hold a `&CommandChannel`.
pub struct CommandChannel<O: ResponseOutput> {
    last_sequence: AtomicI32,
    killed: AtomicBool,
    stopped: AtomicBool,
    stopped_sequence: AtomicI32,
    output: O,
}

impl<O: ResponseOutput> CommandChannel<O> {
    pub const fn new(output: O) -> Self {
        Self {
            last_sequence: AtomicI32::new(0),
            killed: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stopped_sequence: AtomicI32::new(0),
            output,
        }
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    /// The most recently accepted sequence number
    pub fn last_sequence(&self) -> i32 {
        self.last_sequence.load(Ordering::SeqCst)
    }

    /// Pulls interactive bytes until the source runs dry or the queue fills
    ///
    /// Returns the number of records enqueued. Bytes left in `input` when the queue is full stay
    /// there for the next call. Once the channel is killed every byte is consumed and dropped.
    pub fn receive<const N: usize>(
        &self,
        intake: &mut Intake,
        input: &mut impl ByteSource,
        queue: &mut Producer<'_, CommandRecord, N>,
        estop: &impl EmergencyStop,
    ) -> usize {
        let mut enqueued = 0;
        while !self.is_killed() && queue.ready() {
            let Some(c) = input.next_byte() else {
                break;
            };
            match intake.interactive.feed(c, None) {
                Step::Pending | Step::Empty => {}
                Step::Line => {
                    let record = CommandRecord::new(intake.interactive.data(), Origin::Interactive);
                    intake.interactive.clear();
                    if self.accept(&record, estop) {
                        enqueued += usize::from(self.enqueue(record, queue));
                    }
                }
            }
        }
        if self.is_killed() {
            intake.interactive.clear();
            while input.next_byte().is_some() {}
        }
        enqueued
    }

    /// Pulls replay bytes until the queue fills, the source ends, or a `#` holds prereading
    ///
    /// Replay only proceeds while no partial interactive line is buffered, so lines from the two
    /// sources never mix. A `#` outside a comment terminates its line and suspends replay until
    /// the queue has drained completely.
    pub fn receive_replay<const N: usize>(
        &self,
        intake: &mut Intake,
        input: &mut impl ReplaySource,
        queue: &mut Producer<'_, CommandRecord, N>,
    ) -> usize {
        if self.is_killed() {
            intake.replay.clear();
            intake.replay_done = true;
            return 0;
        }
        if !intake.interactive.is_empty() {
            return 0;
        }
        if queue.len() == 0 {
            intake.stop_prereading = false;
        }
        let mut enqueued = 0;
        while !input.is_eof() && queue.ready() && !intake.stop_prereading {
            let Some(c) = input.next_byte() else {
                break;
            };
            let step = intake.replay.feed(c, Some(b'#'));
            if matches!(step, Step::Pending) {
                continue;
            }
            if c == b'#' {
                intake.stop_prereading = true;
            }
            if matches!(step, Step::Line) {
                let record = CommandRecord::new(intake.replay.data(), Origin::Replay);
                intake.replay.clear();
                enqueued += usize::from(self.enqueue(record, queue));
            }
            if input.is_eof() {
                self.finish_replay(intake);
            }
        }
        if input.is_eof() && queue.ready() && !intake.replay_done {
            if !intake.replay.is_empty() {
                let record = CommandRecord::new(intake.replay.data(), Origin::Replay);
                intake.replay.clear();
                enqueued += usize::from(self.enqueue(record, queue));
            }
            self.finish_replay(intake);
        }
        enqueued
    }

    fn finish_replay(&self, intake: &mut Intake) {
        if !intake.replay_done {
            intake.replay_done = true;
            log::info!("replay source finished");
            respond!(self.output, "Done printing file");
        }
    }

    fn enqueue<const N: usize>(
        &self,
        record: CommandRecord,
        queue: &mut Producer<'_, CommandRecord, N>,
    ) -> bool {
        match queue.enqueue(record) {
            Ok(()) => true,
            Err(record) => {
                log::warn!("command queue full, dropped {:?}", record.as_str());
                false
            }
        }
    }

    /// Validates an interactive record, reporting faults; true if it should be enqueued
    fn accept(&self, record: &CommandRecord, estop: &impl EmergencyStop) -> bool {
        if self.is_killed() {
            return false;
        }
        if let Err(e) = self.validate(record) {
            log::warn!("discarding line {:?}: {}", record.as_str(), e);
            respond!(self.output, "Error:{}", e);
            if e.requests_resend() {
                self.request_resend();
            }
            return false;
        }

        let body = record.body();
        if self.is_stopped() && is_motion(body) {
            respond!(self.output, "Error:{}", MachineError::Stopped);
        }

        if body == EMERGENCY_STOP {
            log::error!("emergency stop requested");
            self.kill();
            estop.emergency_stop();
            return false;
        }
        true
    }

    fn validate(&self, record: &CommandRecord) -> Result<(), ProtocolError> {
        let line = record.as_bytes();
        let last = self.last_sequence();
        let star = line.iter().position(|b| *b == b'*');
        match record.sequence() {
            Some(n) => {
                if n != last.wrapping_add(1) && !contains(line, SEQUENCE_RESET) {
                    return Err(ProtocolError::LineNumber { last });
                }
                let Some(star) = star else {
                    return Err(ProtocolError::MissingChecksum { last });
                };
                if record.checksum() != Some(checksum(&line[..star])) {
                    return Err(ProtocolError::ChecksumMismatch { last });
                }
                self.last_sequence.store(n, Ordering::SeqCst);
                Ok(())
            }
            None if star.is_some() => Err(ProtocolError::MissingLineNumber { last }),
            None => Ok(()),
        }
    }

    /// Acknowledges a dispatched record
    ///
    /// Replay records are never acknowledged, the remote sender is not involved in them.
    pub fn acknowledge(&self, origin: Origin) {
        if origin == Origin::Interactive {
            respond!(self.output, "ok");
        }
    }

    /// Asks the sender to retransmit from the line after the last accepted one
    pub fn request_resend(&self) {
        respond!(self.output, "Resend:{}", self.last_sequence().wrapping_add(1));
        respond!(self.output, "ok");
    }

    /// Latches the emergency stop; nothing is accepted or dispatched afterwards
    ///
    /// Only a reset of the controller clears it.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Refuses further motion while keeping the channel responsive
    ///
    /// The current sequence number is recorded so [`CommandChannel::resume`] can resynchronise
    /// the sender.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.stopped_sequence
                .store(self.last_sequence(), Ordering::SeqCst);
            log::warn!("stopped at line {}", self.last_sequence());
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Leaves the stopped state and requests retransmission from where it began
    pub fn resume(&self) {
        self.stopped.store(false, Ordering::SeqCst);
        self.last_sequence.store(
            self.stopped_sequence.load(Ordering::SeqCst),
            Ordering::SeqCst,
        );
        self.request_resend();
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn is_motion(body: &[u8]) -> bool {
    matches!(body, [b'G', b'0'..=b'3', rest @ ..] if rest.first().map_or(true, |b| !b.is_ascii_digit()))
}
