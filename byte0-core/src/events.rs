//! Notifications from a job worker to any number of subscribers.
//!
//! Each job owns one [`EventBus`]. The worker is its only producer; every
//! subscriber gets its own `crossbeam-channel` receiver carrying the full stream
//! from the moment it subscribed. Order is preserved within a job. Once the
//! terminal [`WipeEvent::Done`] is published the bus keeps the report, so late
//! subscribers still learn how the job ended.

use crate::error::{Severity, WipeError};
use crate::job::{JobId, JobState, WipeJob};
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub bytes_written: u64,
    pub percent: Option<u8>,
    pub timestamp: DateTime<Utc>,
}

/// A line worth keeping for audit: tool output that is not progress, and the
/// engine's own notes about what it is doing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEvent {
    pub job_id: JobId,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateEvent {
    pub job_id: JobId,
    pub state: JobState,
    pub timestamp: DateTime<Utc>,
}

/// Final, immutable record of a job.
#[derive(Clone, Debug)]
pub struct WipeReport {
    pub job: WipeJob,
    /// Set when the job failed. Cancelled and completed jobs carry no error.
    pub error: Option<WipeError>,
}

impl WipeReport {
    pub fn state(&self) -> JobState {
        self.job.state()
    }

    pub fn is_success(&self) -> bool {
        self.job.state() == JobState::Completed
    }
}

#[derive(Clone, Debug)]
pub enum WipeEvent {
    State(StateEvent),
    Progress(ProgressEvent),
    Log(LogEvent),
    Done(WipeReport),
}

#[derive(Default)]
struct BusInner {
    subscribers: Vec<Sender<WipeEvent>>,
    done: Option<WipeReport>,
}

#[derive(Default)]
pub(crate) struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn subscribe(&self) -> Receiver<WipeEvent> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let (tx, rx) = unbounded();
        match &inner.done {
            // The sender is dropped right away so the receiver disconnects after Done.
            Some(report) => {
                let _ = tx.send(WipeEvent::Done(report.clone()));
            }
            None => inner.subscribers.push(tx),
        }
        rx
    }

    pub(crate) fn publish(&self, event: WipeEvent) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.done.is_some() {
            log::warn!("event published after job completion was dropped");
            return;
        }
        // Subscribers that hung up are pruned.
        inner
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
        if let WipeEvent::Done(report) = event {
            inner.done = Some(report);
            inner.subscribers.clear();
        }
    }

    pub(crate) fn report(&self) -> Option<WipeReport> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.done.clone()
    }
}

/// Drains `events` on a background thread, routing each event to a callback.
///
/// State changes are not forwarded separately; the worker writes a log line
/// for every phase it enters, which reaches `on_log`. The thread exits after
/// `on_done`.
pub fn dispatch<P, L, D>(
    events: Receiver<WipeEvent>,
    mut on_progress: P,
    mut on_log: L,
    on_done: D,
) -> JoinHandle<()>
where
    P: FnMut(ProgressEvent) + Send + 'static,
    L: FnMut(LogEvent) + Send + 'static,
    D: FnOnce(WipeReport) + Send + 'static,
{
    thread::spawn(move || {
        for event in events.iter() {
            match event {
                WipeEvent::Progress(p) => on_progress(p),
                WipeEvent::Log(l) => on_log(l),
                WipeEvent::State(_) => {}
                WipeEvent::Done(report) => {
                    on_done(report);
                    return;
                }
            }
        }
    })
}
