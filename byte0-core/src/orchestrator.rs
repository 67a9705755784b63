//! Runs wipe jobs: unlock, spawn the zero-fill tool, follow its output, and
//! classify how it ended.
//!
//! Every job gets its own worker thread which exclusively owns the [`WipeJob`]
//! and the child process. The caller only ever talks to the worker through the
//! job's [`EventBus`] and its [`CancelToken`].

use crate::config::EngineConfig;
use crate::device::DeviceId;
use crate::error::{Result, Severity, Violation, WipeError};
use crate::events::{
    self, EventBus, LogEvent, ProgressEvent, StateEvent, WipeEvent, WipeReport,
};
use crate::job::{CancelToken, JobId, JobState, WipeJob};
use crate::platform::Platform;
use crate::progress::{self, OutputLines};
use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::io::Read;
use std::panic::{self, AssertUnwindSafe};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use wait_timeout::ChildExt;

/// Devices with a job in `Unlocking` or `Wiping`.
#[derive(Clone, Default)]
pub(crate) struct ActiveDevices(Arc<Mutex<HashSet<DeviceId>>>);

impl ActiveDevices {
    /// Marks `id` busy, or returns `None` if it already is.
    fn claim(&self, id: &DeviceId) -> Option<ActiveGuard> {
        let mut set = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(id.clone()) {
            return None;
        }
        Some(ActiveGuard {
            devices: self.clone(),
            id: id.clone(),
        })
    }

    pub(crate) fn snapshot(&self) -> HashSet<DeviceId> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn contains(&self, id: &DeviceId) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }
}

/// RAII guard that releases a claimed device when dropped.
struct ActiveGuard {
    devices: ActiveDevices,
    id: DeviceId,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.devices
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// The caller's side of a running job.
///
/// The job's stream is subscribed before the worker starts, so nothing it
/// emits is lost. That first stream goes to whoever asks for events first,
/// through [`JobHandle::events`] or a callback subscription; later requests
/// get an independent stream starting at the time of the request. If nobody
/// claimed it, [`JobHandle::wait`] drops it so unread events do not pile up.
pub struct JobHandle {
    id: JobId,
    device: DeviceId,
    cancel: CancelToken,
    bus: Arc<EventBus>,
    unclaimed: Mutex<Option<Receiver<WipeEvent>>>,
    worker: JoinHandle<WipeReport>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// A stream of the job's events. The first call gets everything since the
    /// job started; later calls see events from now on.
    pub fn events(&self) -> Receiver<WipeEvent> {
        self.take_unclaimed().unwrap_or_else(|| self.bus.subscribe())
    }

    /// An additional, independent stream of events from now on.
    pub fn subscribe(&self) -> Receiver<WipeEvent> {
        self.bus.subscribe()
    }

    fn take_unclaimed(&self) -> Option<Receiver<WipeEvent>> {
        self.unclaimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// A token that cancels this job, e.g. for a signal handler.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The final report, once the job is terminal.
    pub fn report(&self) -> Option<WipeReport> {
        self.bus.report()
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Blocks until the worker has finished and returns the final report.
    pub fn wait(self) -> WipeReport {
        drop(self.take_unclaimed());
        self.worker
            .join()
            .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
    }
}

pub struct WipeOrchestrator {
    platform: Arc<dyn Platform>,
    config: EngineConfig,
    active: ActiveDevices,
}

impl WipeOrchestrator {
    pub fn new(platform: Arc<dyn Platform>, config: EngineConfig) -> Self {
        Self {
            platform,
            config,
            active: ActiveDevices::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_busy(&self, id: &DeviceId) -> bool {
        self.active.contains(id)
    }

    pub(crate) fn busy_devices(&self) -> HashSet<DeviceId> {
        self.active.snapshot()
    }

    /// Starts `job` on a new worker thread.
    ///
    /// Fails with [`Violation::DeviceBusy`] if another job is active on the
    /// same device; nothing is queued.
    pub fn start(&self, job: WipeJob) -> Result<JobHandle> {
        let device = job.device().index.clone();
        let guard = self.active.claim(&device).ok_or_else(|| {
            log::warn!("refusing second job for busy device {device}");
            WipeError::SafetyViolation(Violation::DeviceBusy(device.clone()))
        })?;

        let id = job.id();
        let cancel = CancelToken::new();
        let bus = Arc::new(EventBus::new());
        let events = bus.subscribe();

        let worker = Worker {
            job,
            platform: Arc::clone(&self.platform),
            config: self.config.clone(),
            cancel: cancel.clone(),
            bus: Arc::clone(&bus),
            tail: VecDeque::new(),
        };
        let worker_bus = Arc::clone(&bus);
        let mut fallback = worker.job.clone();

        let handle = thread::Builder::new()
            .name(format!("wipe-{device}"))
            .spawn(move || {
                let report = match panic::catch_unwind(AssertUnwindSafe(|| worker.run())) {
                    Ok(report) => report,
                    Err(payload) => {
                        let reason = panic_message(payload.as_ref());
                        log::error!("job {id}: worker panicked: {reason}");
                        fallback.abort(format!("worker panicked: {reason}"));
                        WipeReport {
                            job: fallback,
                            error: Some(WipeError::WorkerPanic(reason)),
                        }
                    }
                };
                // Release the device before anyone can observe the job as done.
                drop(guard);
                worker_bus.publish(WipeEvent::Done(report.clone()));
                report
            })
            .map_err(|e| WipeError::ProcessSpawn {
                program: "wipe worker thread".into(),
                reason: e.to_string(),
            })?;

        Ok(JobHandle {
            id,
            device,
            cancel,
            bus,
            unclaimed: Mutex::new(Some(events)),
            worker: handle,
        })
    }

    pub fn cancel(&self, handle: &JobHandle) {
        log::info!("cancel requested for job {}", handle.id);
        handle.cancel();
    }
}

/// How a spawned zero-fill run ended, when it did not fail.
#[derive(Debug)]
enum RunEnd {
    Exited,
    Cancelled,
}

/// What stopped the output loop early.
#[derive(Debug)]
enum Interrupt {
    /// The tool had already exited; its status decides the outcome.
    AlreadyExited(ExitStatus),
    Cancelled,
}

struct Worker {
    job: WipeJob,
    platform: Arc<dyn Platform>,
    config: EngineConfig,
    cancel: CancelToken,
    bus: Arc<EventBus>,
    tail: VecDeque<String>,
}

impl Worker {
    fn run(mut self) -> WipeReport {
        let device = self.job.device().clone();

        self.set_state(JobState::Unlocking);
        self.log(
            Severity::Info,
            format!("Unlocking {} ({})...", device.index, device.display_name),
        );
        if let Err(err) = self.platform.unlock(&device, &self.config, &self.cancel) {
            return self.fail(err);
        }
        if self.cancel.is_cancelled() {
            return self.cancelled();
        }

        self.set_state(JobState::Wiping);
        self.publish_progress(self.job.bytes_written(), self.job.percent());
        self.log(
            Severity::Info,
            format!("Starting zero-fill of {}...", device.path.display()),
        );
        match self.zero_fill() {
            Ok(RunEnd::Exited) => self.completed(),
            Ok(RunEnd::Cancelled) => self.cancelled(),
            Err(err) => self.fail(err),
        }
    }

    fn zero_fill(&mut self) -> Result<RunEnd> {
        let program = self.config.tool_path.display().to_string();
        let args = self.platform.zero_fill_args(self.job.device(), &self.config);
        log::debug!("job {}: {} {}", self.job.id(), program, args.join(" "));

        let mut cmd = Command::new(&self.config.tool_path);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        isolate(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| WipeError::ProcessSpawn {
            program: program.clone(),
            reason: e.to_string(),
        })?;

        // dd reports on stderr, but anything on stdout is kept too.
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(spawn_reader(out, tx.clone()));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_reader(err, tx.clone()));
        }
        drop(tx);

        let started = Instant::now();
        loop {
            match self.check_interrupt(&mut child, started)? {
                Some(Interrupt::Cancelled) => return Ok(RunEnd::Cancelled),
                Some(Interrupt::AlreadyExited(status)) => {
                    for line in rx.try_iter() {
                        self.handle_line(line);
                    }
                    return self.exit_outcome(&program, status);
                }
                None => {}
            }
            match rx.recv_timeout(self.config.poll_interval) {
                Ok(line) => self.handle_line(line),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // Both pipes are closed; the tool is exiting or has exited.
        let status = loop {
            match child.wait_timeout(self.config.poll_interval) {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => {
                    terminate(&mut child, self.config.kill_grace);
                    return Err(WipeError::WipeIo {
                        code: None,
                        tail: vec![format!("failed to wait for {program}: {e}")],
                    });
                }
            }
            match self.check_interrupt(&mut child, started)? {
                Some(Interrupt::Cancelled) => return Ok(RunEnd::Cancelled),
                Some(Interrupt::AlreadyExited(status)) => break status,
                None => {}
            }
        };
        for reader in readers {
            let _ = reader.join();
        }

        self.exit_outcome(&program, status)
    }

    fn exit_outcome(&self, program: &str, status: ExitStatus) -> Result<RunEnd> {
        if status.success() {
            return Ok(RunEnd::Exited);
        }
        let mut tail: Vec<String> = self.tail.iter().cloned().collect();
        tail.push(match status.code() {
            Some(code) => format!("{program} exited with code {code}"),
            None => format!("{program} was terminated by a signal"),
        });
        Err(WipeError::WipeIo {
            code: status.code(),
            tail,
        })
    }

    /// Handles cancellation and the optional timeout while the tool runs.
    ///
    /// A tool that has already exited is never reported as cancelled or timed
    /// out. Reader threads are left to finish on their own once the pipes
    /// close.
    fn check_interrupt(&mut self, child: &mut Child, started: Instant) -> Result<Option<Interrupt>> {
        let cancelled = self.cancel.is_cancelled();
        let limit = self
            .config
            .wipe_timeout
            .filter(|limit| started.elapsed() >= *limit);
        if !cancelled && limit.is_none() {
            return Ok(None);
        }

        if let Ok(Some(status)) = child.try_wait() {
            log::debug!("job {}: tool exited before the interrupt took effect", self.job.id());
            return Ok(Some(Interrupt::AlreadyExited(status)));
        }

        terminate(child, self.config.kill_grace);
        match limit {
            Some(limit) if !cancelled => Err(WipeError::Timeout {
                timeout_secs: limit.as_secs(),
            }),
            _ => {
                log::info!("job {}: zero-fill tool terminated on cancel", self.job.id());
                Ok(Some(Interrupt::Cancelled))
            }
        }
    }

    fn handle_line(&mut self, line: String) {
        match progress::parse(&line, self.job.total_bytes()) {
            Some(sample) => {
                if let Some(update) = self.job.record_progress(sample) {
                    self.publish_progress(update.bytes_written, update.percent);
                }
            }
            None => {
                log::debug!("job {}: {line}", self.job.id());
                if self.tail.len() >= self.config.log_tail_lines.max(1) {
                    self.tail.pop_front();
                }
                self.tail.push_back(line.clone());
                let severity = if line.to_ascii_lowercase().contains("error") {
                    Severity::Warning
                } else {
                    Severity::Info
                };
                self.log(severity, line);
            }
        }
    }

    fn completed(mut self) -> WipeReport {
        self.job.complete();
        self.publish_progress(self.job.bytes_written(), Some(100));
        self.publish_state();
        self.log(Severity::Info, "Wipe completed successfully.".to_string());
        self.report(None)
    }

    fn cancelled(mut self) -> WipeReport {
        self.job.transition(JobState::Cancelled);
        self.publish_state();
        self.log(Severity::Warning, "Wipe cancelled by user.".to_string());
        self.report(None)
    }

    fn fail(mut self, err: WipeError) -> WipeReport {
        let message = match &err {
            WipeError::WipeIo { tail, .. } => tail.join("\n"),
            other => other.to_string(),
        };
        self.job.fail(message);
        self.publish_state();
        self.log(err.severity(), err.to_string());
        self.report(Some(err))
    }

    fn report(self, error: Option<WipeError>) -> WipeReport {
        log::info!(
            "job {} on {} finished: {}",
            self.job.id(),
            self.job.device().index,
            self.job.state()
        );
        WipeReport {
            job: self.job,
            error,
        }
    }

    fn set_state(&mut self, next: JobState) {
        if self.job.transition(next) {
            self.publish_state();
        }
    }

    fn publish_state(&self) {
        log::info!("job {}: {}", self.job.id(), self.job.state());
        self.bus.publish(WipeEvent::State(StateEvent {
            job_id: self.job.id(),
            state: self.job.state(),
            timestamp: Utc::now(),
        }));
    }

    fn publish_progress(&self, bytes_written: u64, percent: Option<u8>) {
        self.bus.publish(WipeEvent::Progress(ProgressEvent {
            job_id: self.job.id(),
            bytes_written,
            percent,
            timestamp: Utc::now(),
        }));
    }

    fn log(&self, severity: Severity, message: String) {
        self.bus.publish(WipeEvent::Log(LogEvent {
            job_id: self.job.id(),
            timestamp: Utc::now(),
            severity,
            message,
        }));
    }
}

fn spawn_reader<R: Read + Send + 'static>(pipe: R, tx: Sender<String>) -> JoinHandle<()> {
    thread::spawn(move || {
        for line in OutputLines::new(pipe) {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::debug!("zero-fill output pipe closed: {e}");
                    break;
                }
            }
        }
    })
}

/// Puts the tool in its own process group so it can be signalled as a whole
/// and does not receive the terminal's Ctrl+C directly.
#[cfg(unix)]
fn isolate(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(windows)]
fn isolate(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    use windows_sys::Win32::System::Threading::CREATE_NO_WINDOW;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(any(unix, windows)))]
fn isolate(_cmd: &mut Command) {}

/// Asks the tool to stop, then kills it, and always reaps it.
#[cfg(unix)]
fn terminate(child: &mut Child, grace: Duration) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let group = Pid::from_raw(child.id() as i32);
    if killpg(group, Signal::SIGTERM).is_ok() {
        match child.wait_timeout(grace) {
            Ok(Some(_)) => {}
            Ok(None) => log::warn!("zero-fill tool ignored SIGTERM, killing it"),
            Err(e) => log::warn!("waiting for zero-fill tool failed: {e}"),
        }
    }
    // Also reaches anything the tool forked.
    let _ = killpg(group, Signal::SIGKILL);
    let _ = child.kill();
    if let Err(e) = child.wait() {
        log::warn!("could not reap zero-fill tool: {e}");
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, _grace: Duration) {
    if let Err(e) = child.kill() {
        log::debug!("kill of zero-fill tool failed: {e}");
    }
    if let Err(e) = child.wait() {
        log::warn!("could not reap zero-fill tool: {e}");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Routes a job's events to callbacks on a background thread.
///
/// Takes over the job's initial stream when nobody has claimed it yet, so the
/// callbacks see the job from its first event.
pub fn subscribe<P, L, D>(handle: &JobHandle, on_progress: P, on_log: L, on_done: D) -> JoinHandle<()>
where
    P: FnMut(ProgressEvent) + Send + 'static,
    L: FnMut(LogEvent) + Send + 'static,
    D: FnOnce(WipeReport) + Send + 'static,
{
    events::dispatch(handle.events(), on_progress, on_log, on_done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceDescriptor, test_device};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Runs `/bin/sh -c <script>` as the zero-fill tool.
    struct ShellPlatform {
        script: String,
    }

    impl Platform for ShellPlatform {
        fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
            Ok(Vec::new())
        }

        fn unlock(&self, _: &DeviceDescriptor, _: &EngineConfig, _: &CancelToken) -> Result<()> {
            Ok(())
        }

        fn zero_fill_args(&self, _: &DeviceDescriptor, _: &EngineConfig) -> Vec<String> {
            vec!["-c".to_string(), self.script.clone()]
        }
    }

    fn shell_config() -> EngineConfig {
        EngineConfig::default()
            .with_tool_path("/bin/sh")
            .with_unlock_settle(Duration::ZERO)
            .with_poll_interval(Duration::from_millis(10))
            .with_kill_grace(Duration::from_millis(200))
    }

    fn worker(config: EngineConfig) -> Worker {
        Worker {
            job: WipeJob::new(test_device("1", 1000, false)).unwrap(),
            platform: Arc::new(ShellPlatform {
                script: "exit 0".into(),
            }),
            config,
            cancel: CancelToken::new(),
            bus: Arc::new(EventBus::new()),
            tail: VecDeque::new(),
        }
    }

    fn exited_child() -> Child {
        let mut child = Command::new("/bin/sh").args(["-c", "exit 0"]).spawn().unwrap();
        while child.try_wait().unwrap().is_none() {
            thread::sleep(Duration::from_millis(5));
        }
        child
    }

    #[test]
    fn claim_is_exclusive_until_guard_drops() {
        let active = ActiveDevices::default();
        let id = DeviceId::new("1");
        let guard = active.claim(&id).unwrap();
        assert!(active.claim(&id).is_none());
        assert!(active.contains(&id));
        assert!(active.claim(&DeviceId::new("2")).is_some());
        drop(guard);
        assert!(!active.contains(&id));
        assert!(active.claim(&id).is_some());
    }

    #[cfg(unix)]
    #[test]
    fn callback_subscriber_takes_over_the_initial_stream() {
        let script = r#"i=1; while [ "$i" -le 2000 ]; do echo "$i bytes copied" >&2; i=$((i+1)); done"#;
        let orchestrator = WipeOrchestrator::new(
            Arc::new(ShellPlatform {
                script: script.into(),
            }),
            shell_config(),
        );
        let handle = orchestrator
            .start(WipeJob::new(test_device("1", 2000, false)).unwrap())
            .unwrap();

        let progress = Arc::new(AtomicUsize::new(0));
        let first_log = Arc::new(Mutex::new(None::<String>));
        let (p, l) = (progress.clone(), first_log.clone());
        let dispatcher = subscribe(
            &handle,
            move |_| {
                p.fetch_add(1, Ordering::SeqCst);
            },
            move |event| {
                l.lock().unwrap().get_or_insert(event.message);
            },
            |_| {},
        );
        dispatcher.join().unwrap();

        // Nothing else buffered the run: a stream requested now only sees Done.
        let late = handle.events();
        assert_eq!(late.len(), 1);
        assert!(matches!(late.recv().unwrap(), WipeEvent::Done(_)));

        // The callbacks saw the job from its very first event.
        assert!(first_log.lock().unwrap().as_deref().unwrap().starts_with("Unlocking"));
        assert!(progress.load(Ordering::SeqCst) >= 2000);
        assert_eq!(handle.wait().state(), JobState::Completed);
    }

    #[cfg(unix)]
    #[test]
    fn exited_tool_wins_over_late_cancel() {
        let mut w = worker(shell_config());
        w.cancel.cancel();
        let mut child = exited_child();
        let end = w.check_interrupt(&mut child, Instant::now()).unwrap();
        assert!(matches!(end, Some(Interrupt::AlreadyExited(status)) if status.success()));
    }

    #[cfg(unix)]
    #[test]
    fn exited_tool_wins_over_expired_timeout() {
        let mut w = worker(shell_config().with_wipe_timeout(Some(Duration::ZERO)));
        let mut child = exited_child();
        let end = w.check_interrupt(&mut child, Instant::now()).unwrap();
        assert!(matches!(end, Some(Interrupt::AlreadyExited(_))));
    }

    #[cfg(unix)]
    #[test]
    fn cancel_terminates_a_running_tool() {
        let mut w = worker(shell_config());
        w.cancel.cancel();
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", "exec sleep 30"]);
        isolate(&mut cmd);
        let mut child = cmd.spawn().unwrap();

        let end = w.check_interrupt(&mut child, Instant::now()).unwrap();
        assert!(matches!(end, Some(Interrupt::Cancelled)));
        assert!(child.try_wait().unwrap().is_some());
    }
}
