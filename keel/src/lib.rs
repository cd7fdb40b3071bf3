//! Keel is the motion-control core of a G-code machine controller
//!
//! Keel turns a line-oriented command stream into actuator trajectories for Cartesian, delta and
//! SCARA mechanisms, and can calibrate the geometry of a delta machine from probe measurements.
//! It is `no_std` and allocation free; everything that touches hardware is reached through
//! traits that the embedding firmware implements:
//!
//! | Trait                 | Role                                                      |
//! |-----------------------|-----------------------------------------------------------|
//! | [`ByteSource`]        | Bytes received from the host, e.g. a [`FifoBuffer`]       |
//! | [`ReplaySource`]      | A file being replayed from storage                        |
//! | [`ResponseOutput`]    | Where protocol responses go                               |
//! | [`EmergencyStop`]     | Halts actuation synchronously on `M112`                   |
//! | [`Planner`]           | Trapezoidal planner and stepper generation                |
//! | [`Housekeeping`]      | Heater management and other background duties            |
//!
//! The input path is split in two halves joined by a [`CommandQueue`]. The receiving context
//! owns an [`Intake`] and the queue's producer and calls [`CommandChannel::receive`] as bytes
//! arrive:
//! ```ignore
//! let data = RX_BUFFER.data();
//! let mut wrap = SliceSource::new(data);
//! CHANNEL.receive(&mut intake, &mut wrap, &mut producer, &ESTOP);
//! RX_BUFFER.pop(data.len() - wrap.available());
//! ```
//!
//! The foreground loop owns the consumer and a [`Machine`] and dispatches one record at a time:
//! ```ignore
//! if let Some(record) = consumer.dequeue() {
//!     machine.execute(&CHANNEL, &record);
//! }
//! ```
//!
//! Output is produced through a closure, so a `no_std` target can format into a
//! [`ScratchOutput`] and copy the result into its transmit buffer:
//! ```ignore
//! impl ResponseOutput for UartOutput {
//!     type Output = ScratchOutput;
//!     fn output(&self, f: impl FnOnce(&mut Self::Output)) {
//!         let mut scratch = ScratchOutput::new();
//!         f(&mut scratch);
//!         free(|cs| TX_BUFFER.borrow(cs).borrow_mut().extend(scratch.result()));
//!     }
//! }
//! ```

#![cfg_attr(not(any(test, feature = "std")), no_std)]

mod byte_source;
mod fifo_buffer;
mod response;

pub mod bed_level;
pub mod calibration;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gcode;
pub mod housekeeping;
pub mod kinematics;
pub mod machine;
pub mod motion;
pub mod planner;
pub mod probe;
pub mod stats;

pub use byte_source::{ByteSource, ReplaySource, SliceSource};
pub use channel::{CommandChannel, CommandQueue, EmergencyStop, Intake};
pub use config::MachineConfig;
pub use error::{KinematicError, MachineError, ProtocolError};
pub use fifo_buffer::FifoBuffer;
pub use gcode::{CommandRecord, Origin};
pub use heapless::spsc::{Consumer, Producer};
pub use housekeeping::Housekeeping;
pub use kinematics::{Kinematics, Mechanism};
pub use machine::Machine;
pub use planner::Planner;
pub use response::{ResponseOutput, ScratchOutput};
