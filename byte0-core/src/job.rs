//! The per-job state record and its state machine.

use crate::device::DeviceDescriptor;
use crate::error::{Result, Violation, WipeError};
use crate::progress::{self, ProgressSample};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a wipe job.
///
/// ```text
/// Idle -> Unlocking -> Wiping -> Completed
///             |          |-----> Failed
///             |          '-----> Cancelled
///             |--> Failed
///             '--> Cancelled
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobState {
    Idle,
    Unlocking,
    Wiping,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, JobState::Unlocking | JobState::Wiping)
    }

    fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Idle, Unlocking)
                | (Unlocking, Wiping)
                | (Unlocking, Failed)
                | (Unlocking, Cancelled)
                | (Wiping, Completed)
                | (Wiping, Failed)
                | (Wiping, Cancelled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Idle => "idle",
            JobState::Unlocking => "unlocking",
            JobState::Wiping => "wiping",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One zero-fill run against one device.
///
/// Owned by its worker while running; the caller receives a clone once the job
/// is terminal. `total_bytes` is copied from the descriptor at creation and
/// never changes afterwards.
#[derive(Clone, Debug)]
pub struct WipeJob {
    id: JobId,
    device: DeviceDescriptor,
    state: JobState,
    bytes_written: u64,
    total_bytes: u64,
    percent: Option<u8>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl WipeJob {
    /// Creates an idle job. Refuses the system disk outright.
    pub fn new(device: DeviceDescriptor) -> Result<Self> {
        if device.is_system_disk {
            return Err(WipeError::SafetyViolation(Violation::SystemDisk(
                device.index.clone(),
            )));
        }
        let total_bytes = device.size_bytes;
        Ok(Self {
            id: JobId::new(),
            device,
            state: JobState::Idle,
            bytes_written: 0,
            total_bytes,
            percent: progress::percent_of(0, total_bytes),
            started_at: None,
            finished_at: None,
            last_error: None,
        })
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn percent(&self) -> Option<u8> {
        self.percent
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Moves to `next` if the state machine allows it.
    pub(crate) fn transition(&mut self, next: JobState) -> bool {
        if !self.state.can_transition_to(next) {
            log::warn!(
                "job {}: ignoring invalid transition {} -> {}",
                self.id,
                self.state,
                next
            );
            return false;
        }
        if self.state == JobState::Idle {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        self.state = next;
        true
    }

    /// Applies a parsed sample. Samples that do not advance `bytes_written`
    /// are ignored so that progress never goes backwards.
    pub(crate) fn record_progress(&mut self, sample: ProgressSample) -> Option<ProgressSample> {
        if sample.bytes_written <= self.bytes_written {
            return None;
        }
        self.bytes_written = sample.bytes_written;
        let pct = progress::percent_of(self.bytes_written, self.total_bytes);
        self.percent = match (self.percent, pct) {
            (Some(old), Some(new)) => Some(old.max(new)),
            (_, new) => new,
        };
        Some(ProgressSample {
            bytes_written: self.bytes_written,
            percent: self.percent,
        })
    }

    /// Marks the job completed and forces the percentage to 100.
    pub(crate) fn complete(&mut self) -> bool {
        if !self.transition(JobState::Completed) {
            return false;
        }
        self.percent = Some(100);
        true
    }

    pub(crate) fn fail(&mut self, message: impl Into<String>) -> bool {
        let message = message.into();
        if !self.transition(JobState::Failed) {
            return false;
        }
        self.last_error = Some(message);
        true
    }

    /// Forces a non-terminal job to `Failed` from any state. Only for a worker
    /// that died without reaching a terminal state on its own.
    pub(crate) fn abort(&mut self, message: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        let now = Utc::now();
        self.started_at.get_or_insert(now);
        self.finished_at = Some(now);
        self.state = JobState::Failed;
        self.last_error = Some(message.into());
    }
}

/// Shared cancellation flag between a caller and a job worker.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleeps for `total` in `step` slices. Returns `false` if cancelled first.
    pub fn sleep(&self, total: Duration, step: Duration) -> bool {
        let deadline = Instant::now() + total;
        let step = step.max(Duration::from_millis(1));
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(step.min(deadline - now));
        }
    }
}
