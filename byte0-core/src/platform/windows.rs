use super::get_disk::{GET_DISK_SCRIPT, parse_get_disk_json};
use crate::config::EngineConfig;
use crate::device::DeviceDescriptor;
use crate::error::{Result, WipeError};
use crate::job::CancelToken;
use std::io::Write;
use std::os::windows::process::CommandExt;
use std::process::{Command, Stdio};
use std::time::Duration;
use tempfile::NamedTempFile;
use wait_timeout::ChildExt;
use windows_sys::Win32::System::Threading::CREATE_NO_WINDOW;

/// Scans for all physical disks on a Windows system using `Get-Disk`.
///
/// Boot and system disks are flagged from the `IsBoot`/`IsSystem` properties
/// instead of assuming disk 0.
pub fn enumerate_devices() -> Result<Vec<DeviceDescriptor>> {
    let output = Command::new("powershell")
        .args(["-NoProfile", "-NonInteractive", "-Command", GET_DISK_SCRIPT])
        .creation_flags(CREATE_NO_WINDOW)
        .output()
        .map_err(|e| WipeError::Enumeration(format!("cannot run powershell: {e}")))?;

    if !output.status.success() {
        return Err(WipeError::Enumeration(format!(
            "Get-Disk failed (exit={:?}): {}",
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    parse_get_disk_json(&String::from_utf8_lossy(&output.stdout))
}

fn unlock_error(device: &DeviceDescriptor, reason: impl Into<String>) -> WipeError {
    WipeError::UnlockFailure {
        device: device.index.clone(),
        reason: reason.into(),
    }
}

/// Removes the partition table with diskpart so Windows drops its volume
/// locks, then waits for handles to be released.
///
/// `clean` on an already clean disk succeeds, so this is safe to repeat.
pub fn unlock_device(
    device: &DeviceDescriptor,
    config: &EngineConfig,
    cancel: &CancelToken,
) -> Result<()> {
    let mut script = NamedTempFile::new()
        .map_err(|e| unlock_error(device, format!("cannot create diskpart script: {e}")))?;
    write!(
        script,
        "select disk {}\r\nclean\r\nrescan\r\nexit\r\n",
        device.index
    )
    .and_then(|_| script.flush())
    .map_err(|e| unlock_error(device, format!("cannot write diskpart script: {e}")))?;

    log::info!("running diskpart clean on disk {}", device.index);
    let mut child = Command::new("diskpart")
        .arg("/s")
        .arg(script.path())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .creation_flags(CREATE_NO_WINDOW)
        .spawn()
        .map_err(|e| unlock_error(device, format!("cannot run diskpart: {e}")))?;

    let status = match child
        .wait_timeout(config.unlock_timeout)
        .map_err(|e| unlock_error(device, e.to_string()))?
    {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(unlock_error(
                device,
                format!("diskpart timed out after {}s", config.unlock_timeout.as_secs()),
            ));
        }
    };

    if !status.success() {
        return Err(unlock_error(
            device,
            format!("diskpart exited with {:?}", status.code()),
        ));
    }

    // A cancelled settle wait is reported by the orchestrator, not here.
    cancel.sleep(config.unlock_settle, Duration::from_millis(100));
    Ok(())
}

/// Arguments for dd for Windows.
pub fn zero_fill_args(device: &DeviceDescriptor, config: &EngineConfig) -> Vec<String> {
    vec![
        "if=/dev/zero".to_string(),
        format!("of={}", device.path.display()),
        format!("bs={}", config.block_size),
        "--progress".to_string(),
    ]
}
