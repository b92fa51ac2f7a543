//! Why a worker unit stopped

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use nix::sys::signal::Signal;

/// Reason a worker unit terminated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code
    Exited(i32),
    /// Killed by a signal the pool did not send
    Signaled(Signal),
    /// SIGKILL from outside the pool, most likely the OOM killer
    OutOfMemory,
    /// SIGSEGV
    SegFault,
    /// SIGBUS
    BusError,
    /// Hard-killed by the pool (deadline or shutdown)
    Killed,
    /// An in-process unit panicked
    Panicked(String),
    /// The unit broke the wire protocol and was killed
    Protocol(String),
    /// Could not be determined
    Unknown,
}

impl TerminationReason {
    /// Whether the pool itself stopped the unit
    pub fn is_deliberate(&self) -> bool {
        matches!(self, Self::Killed)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::OutOfMemory => "out of memory (SIGKILL)".to_string(),
            Self::SegFault => "segmentation fault (SIGSEGV)".to_string(),
            Self::BusError => "bus error (SIGBUS)".to_string(),
            Self::Killed => "killed by the pool".to_string(),
            Self::Panicked(msg) => format!("panicked: {}", msg),
            Self::Protocol(msg) => format!("protocol violation: {}", msg),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Classify the exit status of a unit process that died on its own
pub fn classify_exit(status: ExitStatus) -> TerminationReason {
    if let Some(code) = status.code() {
        return TerminationReason::Exited(code);
    }

    match status.signal().map(Signal::try_from) {
        Some(Ok(Signal::SIGKILL)) => TerminationReason::OutOfMemory,
        Some(Ok(Signal::SIGSEGV)) => TerminationReason::SegFault,
        Some(Ok(Signal::SIGBUS)) => TerminationReason::BusError,
        Some(Ok(signal)) => TerminationReason::Signaled(signal),
        _ => TerminationReason::Unknown,
    }
}
