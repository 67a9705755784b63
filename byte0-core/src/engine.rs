use crate::config::EngineConfig;
use crate::device::{Availability, ConfirmationToken, DeviceDescriptor, DeviceId, ListedDevice};
use crate::error::Result;
use crate::events::{LogEvent, ProgressEvent, WipeReport};
use crate::guard::SafetyGuard;
use crate::job::WipeJob;
use crate::orchestrator::{self, JobHandle, WipeOrchestrator};
use crate::platform::Platform;
use std::sync::Arc;
use std::thread::JoinHandle;

/// The caller-facing surface of the library.
///
/// An `Engine` owns the registry of devices with an active job; separate
/// engines do not see each other's jobs.
pub struct Engine {
    platform: Arc<dyn Platform>,
    orchestrator: WipeOrchestrator,
}

impl Engine {
    /// An engine for the running OS.
    #[cfg(any(target_os = "linux", target_os = "windows"))]
    pub fn new(config: EngineConfig) -> Self {
        Self::with_platform(Arc::new(crate::platform::NativePlatform), config)
    }

    pub fn with_platform(platform: Arc<dyn Platform>, config: EngineConfig) -> Self {
        let orchestrator = WipeOrchestrator::new(Arc::clone(&platform), config);
        Self {
            platform,
            orchestrator,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        self.orchestrator.config()
    }

    /// Every physical device, with the system disk and busy devices marked.
    pub fn enumerate_devices(&self) -> Result<Vec<ListedDevice>> {
        let devices = self.platform.enumerate()?;
        Ok(devices
            .into_iter()
            .map(|device| {
                let availability = if device.is_system_disk {
                    Availability::SystemDisk
                } else if self.orchestrator.is_busy(&device.index) {
                    Availability::Busy
                } else {
                    Availability::Available
                };
                ListedDevice {
                    device,
                    availability,
                }
            })
            .collect())
    }

    /// Devices that may be offered to the user as wipe targets right now.
    pub fn wipe_candidates(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(self
            .enumerate_devices()?
            .into_iter()
            .filter(|listed| listed.availability == Availability::Available)
            .map(|listed| listed.device)
            .collect())
    }

    /// Validates the request against a fresh scan and starts the job.
    ///
    /// `token` must be the [`DeviceDescriptor::confirmation_token`] of the
    /// descriptor the user confirmed. On any error nothing has been unlocked
    /// or spawned.
    pub fn start_wipe(&self, device_id: &DeviceId, token: &ConfirmationToken) -> Result<JobHandle> {
        let known = self.platform.enumerate()?;
        let guard = SafetyGuard::new(known, self.orchestrator.busy_devices());
        let device = guard.authorize(device_id, token)?;
        let job = WipeJob::new(device)?;
        log::info!("starting job {} on device {}", job.id(), device_id);
        self.orchestrator.start(job)
    }

    /// Delivers the job's events to callbacks on a background thread that ends
    /// after `on_done`. The first consumer of a job sees it from its first
    /// event; a job that already finished still gets `on_done`.
    pub fn subscribe<P, L, D>(
        &self,
        handle: &JobHandle,
        on_progress: P,
        on_log: L,
        on_done: D,
    ) -> JoinHandle<()>
    where
        P: FnMut(ProgressEvent) + Send + 'static,
        L: FnMut(LogEvent) + Send + 'static,
        D: FnOnce(WipeReport) + Send + 'static,
    {
        orchestrator::subscribe(handle, on_progress, on_log, on_done)
    }

    pub fn cancel(&self, handle: &JobHandle) {
        self.orchestrator.cancel(handle);
    }
}
