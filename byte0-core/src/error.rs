//! Error taxonomy of the wipe engine.
//!
//! Every variant is `Clone` so errors can travel inside [`crate::events::WipeEvent`]s
//! to any number of subscribers. Cancellation is deliberately absent: a cancelled
//! job ends in [`crate::job::JobState::Cancelled`] without an error.

use crate::device::DeviceId;
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WipeError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WipeError {
    /// The OS query for block devices failed. The caller may retry the scan.
    #[error("Device enumeration failed: {0}")]
    Enumeration(String),

    #[error("Safety violation: {0}")]
    SafetyViolation(Violation),

    #[error("Could not unlock device {device}: {reason}")]
    UnlockFailure { device: DeviceId, reason: String },

    #[error("Could not start {program}: {reason}")]
    ProcessSpawn { program: String, reason: String },

    #[error("Zero-fill tool failed (exit={code:?}): {}", tail.join(" | "))]
    WipeIo { code: Option<i32>, tail: Vec<String> },

    #[error("Zero-fill tool did not finish within {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// The job's worker thread panicked. Whether the tool ran is unknown.
    #[error("Wipe worker crashed: {0}")]
    WorkerPanic(String),
}

/// The rule a refused wipe request broke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    UnknownDevice(DeviceId),
    SystemDisk(DeviceId),
    TokenMismatch(DeviceId),
    DeviceBusy(DeviceId),
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::UnknownDevice(id) => write!(f, "device {id} is not present"),
            Violation::SystemDisk(id) => write!(f, "device {id} is the system disk"),
            Violation::TokenMismatch(id) => write!(
                f,
                "confirmation does not match the current state of device {id}; re-scan and confirm again"
            ),
            Violation::DeviceBusy(id) => write!(f, "device {id} is already being wiped"),
        }
    }
}

/// Severity attached to log events and errors delivered to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARN",
            Severity::Error => "ERROR",
        };
        f.write_str(s)
    }
}

impl WipeError {
    /// Enumeration failures are transient; everything else ends the request or job.
    pub fn severity(&self) -> Severity {
        match self {
            WipeError::Enumeration(_) => Severity::Warning,
            _ => Severity::Error,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, WipeError::Enumeration(_))
    }

    /// Whether this error happened before the zero-fill tool was spawned.
    pub fn is_pre_spawn(&self) -> bool {
        matches!(
            self,
            WipeError::Enumeration(_)
                | WipeError::SafetyViolation(_)
                | WipeError::UnlockFailure { .. }
                | WipeError::ProcessSpawn { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wipe_io_message_includes_tail() {
        let err = WipeError::WipeIo {
            code: Some(7),
            tail: vec!["dd: error writing".into(), "Input/output error".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("exit=Some(7)"));
        assert!(msg.contains("dd: error writing | Input/output error"));
    }

    #[test]
    fn only_enumeration_is_recoverable() {
        assert!(WipeError::Enumeration("boom".into()).is_recoverable());
        let v = WipeError::SafetyViolation(Violation::SystemDisk(DeviceId::new("0")));
        assert!(!v.is_recoverable());
        assert_eq!(v.severity(), Severity::Error);
        assert!(v.is_pre_spawn());
        assert!(!WipeError::Timeout { timeout_secs: 1 }.is_pre_spawn());
    }
}
