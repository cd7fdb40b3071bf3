use thiserror::Error;

/// Faults detected while validating an interactive command line
///
/// All of these are recovered locally: the offending line is discarded and the channel keeps
/// accepting input.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Line Number is not Last Line Number+1, Last Line: {last}")]
    LineNumber { last: i32 },
    #[error("checksum mismatch, Last Line: {last}")]
    ChecksumMismatch { last: i32 },
    #[error("No Checksum with line number, Last Line: {last}")]
    MissingChecksum { last: i32 },
    #[error("No Line Number with checksum, Last Line: {last}")]
    MissingLineNumber { last: i32 },
}

impl ProtocolError {
    /// Whether the host should be asked to retransmit after this fault
    ///
    /// A checksum without a line number gives no trustworthy sequence number to resend from.
    pub fn requests_resend(&self) -> bool {
        !matches!(self, ProtocolError::MissingLineNumber { .. })
    }
}

/// Failure of a kinematic transform
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KinematicError {
    #[error("requested point is outside the reachable envelope")]
    Unreachable,
}

/// Reasons a machine operation was aborted
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineError {
    #[error("Home X/Y before Z")]
    PositionUnknown,
    #[error("Probe point out of range")]
    ProbeOutOfRange,
    #[error(transparent)]
    Kinematic(#[from] KinematicError),
    #[error("Printer stopped due to errors. Fix the error and use M999 to restart. (Temperature is reset. Set it after restarting)")]
    Stopped,
    #[error("Calibration did not converge")]
    NotConverged,
    #[error("{0}")]
    Argument(&'static str),
    #[error("Bed leveling failed: probe points are degenerate")]
    LevelingFailed,
    #[error("Command requires a delta mechanism")]
    NotDelta,
}
