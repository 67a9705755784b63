#![allow(dead_code)]

use byte0_core::{
    CancelToken, DeviceDescriptor, DeviceId, Engine, EngineConfig, Platform, Result, WipeError,
    WipeEvent,
};
use crossbeam_channel::Receiver;
use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const GB: u64 = 1_000_000_000;

pub fn disk(index: &str, size_bytes: u64, is_system_disk: bool) -> DeviceDescriptor {
    DeviceDescriptor {
        index: DeviceId::new(index),
        display_name: format!("Mock Disk {index}"),
        size_bytes,
        is_system_disk,
        path: PathBuf::from(format!("/dev/mock{index}")),
        mount_point: None,
        removable: !is_system_disk,
    }
}

/// A platform with a fixed device list and scriptable unlock behaviour.
#[derive(Default)]
pub struct FakePlatform {
    pub devices: Vec<DeviceDescriptor>,
    pub failing_unlocks: HashSet<String>,
    pub unlock_delay: Duration,
    pub panic_on_unlock: bool,
    pub unlock_calls: AtomicUsize,
}

impl FakePlatform {
    /// System disk 0, a 64 GB disk 1 and a 128 GB disk 2.
    pub fn standard() -> Self {
        Self::with_devices(vec![
            disk("0", 512 * GB, true),
            disk("1", 64 * GB, false),
            disk("2", 128 * GB, false),
        ])
    }

    pub fn with_devices(devices: Vec<DeviceDescriptor>) -> Self {
        Self {
            devices,
            ..Self::default()
        }
    }

    pub fn unlock_calls(&self) -> usize {
        self.unlock_calls.load(Ordering::SeqCst)
    }
}

impl Platform for FakePlatform {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(self.devices.clone())
    }

    fn unlock(
        &self,
        device: &DeviceDescriptor,
        _config: &EngineConfig,
        cancel: &CancelToken,
    ) -> Result<()> {
        self.unlock_calls.fetch_add(1, Ordering::SeqCst);
        cancel.sleep(self.unlock_delay, Duration::from_millis(5));
        if self.panic_on_unlock {
            panic!("simulated unlock crash");
        }
        if self.failing_unlocks.contains(device.index.as_str()) {
            return Err(WipeError::UnlockFailure {
                device: device.index.clone(),
                reason: "simulated diskpart failure".into(),
            });
        }
        Ok(())
    }

    fn zero_fill_args(&self, device: &DeviceDescriptor, _config: &EngineConfig) -> Vec<String> {
        vec![
            "if=/dev/zero".into(),
            format!("of={}", device.path.display()),
        ]
    }
}

/// A fake `dd` written as a shell script. Every run appends a line to
/// `spawns` in the sandbox directory so tests can count invocations.
pub struct FakeTool {
    pub dir: TempDir,
    pub path: PathBuf,
}

impl FakeTool {
    pub fn new(body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake-dd");
        let script = format!(
            "#!/bin/sh\necho run >> '{}'\n{}\n",
            dir.path().join("spawns").display(),
            body.replace("$DIR", &dir.path().display().to_string())
        );
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        Self { dir, path }
    }

    pub fn spawn_count(&self) -> usize {
        fs::read_to_string(self.dir.path().join("spawns"))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn config(&self) -> EngineConfig {
        test_config(&self.path)
    }
}

pub fn test_config(tool: &Path) -> EngineConfig {
    EngineConfig::default()
        .with_tool_path(tool)
        .with_unlock_settle(Duration::ZERO)
        .with_poll_interval(Duration::from_millis(10))
        .with_kill_grace(Duration::from_millis(500))
}

pub fn engine(platform: Arc<FakePlatform>, tool: &FakeTool) -> Engine {
    Engine::with_platform(platform, tool.config())
}

/// Receives events until `pred` matches, failing the test after `timeout`.
pub fn wait_for_event(
    rx: &Receiver<WipeEvent>,
    timeout: Duration,
    mut pred: impl FnMut(&WipeEvent) -> bool,
) -> Vec<WipeEvent> {
    let deadline = Instant::now() + timeout;
    let mut seen = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = rx
            .recv_timeout(remaining)
            .unwrap_or_else(|_| panic!("no matching event within {timeout:?}; saw {seen:?}"));
        let done = pred(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

/// Waits for a file the fake tool writes, e.g. its pid.
pub fn wait_for_file(path: &Path, timeout: Duration) -> String {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(s) = fs::read_to_string(path) {
            if !s.trim().is_empty() {
                return s.trim().to_string();
            }
        }
        assert!(Instant::now() < deadline, "{} never appeared", path.display());
        std::thread::sleep(Duration::from_millis(10));
    }
}
