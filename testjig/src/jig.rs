use crate::sim::{SimConfig, SimPlanner};
use core::sync::atomic::{AtomicBool, Ordering};
use keel::{
    ByteSource, CommandChannel, CommandQueue, CommandRecord, Consumer, FifoBuffer, Housekeeping,
    Intake, Machine, MachineConfig, Producer, ReplaySource, ResponseOutput, SliceSource,
};
use serde::{Deserialize, Serialize};

/// Size of the command ring, which holds one record less
pub const QUEUE_LEN: usize = 5;
const RX_SIZE: usize = 256;

/// Controller configuration plus the physical machine it drives
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JigConfig {
    pub machine: MachineConfig,
    pub sim: SimConfig,
}

/// A complete controller wired to a simulated machine
///
/// Plays both sides of the firmware: the receive side that validates host bytes into the command
/// ring, and the foreground loop that executes one record at a time.
pub struct Jig<'a, H: Housekeeping, O: ResponseOutput> {
    channel: CommandChannel<&'a O>,
    machine: Machine<SimPlanner, H, &'a O>,
    intake: Intake,
    rx: FifoBuffer<RX_SIZE>,
    producer: Producer<'a, CommandRecord, QUEUE_LEN>,
    consumer: Consumer<'a, CommandRecord, QUEUE_LEN>,
    estop: AtomicBool,
}

impl<'a, H: Housekeeping, O: ResponseOutput> Jig<'a, H, O> {
    pub fn new(
        config: &JigConfig,
        housekeeping: H,
        output: &'a O,
        queue: &'a mut CommandQueue<QUEUE_LEN>,
    ) -> Self {
        let (producer, consumer) = queue.split();
        let planner = SimPlanner::new(&config.machine, config.sim.clone());
        Self {
            channel: CommandChannel::new(output),
            machine: Machine::new(config.machine.clone(), planner, housekeeping, output),
            intake: Intake::new(),
            rx: FifoBuffer::new(),
            producer,
            consumer,
            estop: AtomicBool::new(false),
        }
    }

    pub fn machine(&self) -> &Machine<SimPlanner, H, &'a O> {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut Machine<SimPlanner, H, &'a O> {
        &mut self.machine
    }

    pub fn channel(&self) -> &CommandChannel<&'a O> {
        &self.channel
    }

    pub fn planner(&self) -> &SimPlanner {
        self.machine.planner()
    }

    /// Accepts host bytes, returning how many fit in the receive buffer
    pub fn feed(&mut self, bytes: &[u8]) -> usize {
        self.rx.extend(bytes)
    }

    /// Validates buffered host input and executes at most one record
    ///
    /// Returns false once there was nothing to do.
    pub fn poll(&mut self) -> bool {
        let consumed = {
            let data = self.rx.data();
            let mut wrap = SliceSource::new(data);
            self.channel
                .receive(&mut self.intake, &mut wrap, &mut self.producer, &self.estop);
            data.len() - wrap.available()
        };
        self.rx.pop(consumed);
        self.check_estop();
        self.dispatch_one() || consumed > 0
    }

    /// Sends host text and runs until all of it has been processed
    pub fn send(&mut self, text: &str) {
        let mut bytes = text.as_bytes();
        loop {
            let n = self.feed(bytes);
            bytes = &bytes[n..];
            if !self.poll() && bytes.is_empty() {
                break;
            }
        }
    }

    /// Prepares for a new replay source
    pub fn start_replay(&mut self) {
        self.intake.start_replay();
    }

    /// Pulls from `source` and executes at most one record
    ///
    /// Returns false once the source is exhausted and every record from it has run.
    pub fn poll_replay(&mut self, source: &mut impl ReplaySource) -> bool {
        self.channel
            .receive_replay(&mut self.intake, source, &mut self.producer);
        self.dispatch_one();
        !(self.intake.replay_done() && !self.consumer.ready())
    }

    /// Replays `data` to completion, interleaving host input already buffered
    pub fn replay(&mut self, data: &[u8]) {
        let mut source = SliceSource::new(data);
        self.start_replay();
        loop {
            self.poll();
            if !self.poll_replay(&mut source) {
                break;
            }
        }
    }

    fn check_estop(&mut self) {
        if self.estop.swap(false, Ordering::SeqCst) {
            self.machine.kill();
        }
    }

    fn dispatch_one(&mut self) -> bool {
        match self.consumer.dequeue() {
            Some(record) => {
                self.machine.execute(&self.channel, &record);
                true
            }
            None => false,
        }
    }
}
