//! Provides platform-specific functionality.
//!
//! This module contains the logic for interacting with the operating system to
//! discover physical block devices, release the locks the OS holds on them, and
//! build the command line of the zero-fill tool for a given device.
//!
//! It uses conditional compilation (`#[cfg]`) to expose the correct implementation
//! for the target OS (e.g., Linux, Windows). Each submodule exposes the same
//! free functions; [`NativePlatform`] wires them into the [`Platform`] trait the
//! rest of the library depends on, so tests can substitute their own.

use crate::config::EngineConfig;
use crate::device::DeviceDescriptor;
use crate::error::Result;
use crate::job::CancelToken;

mod get_disk;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub use self::windows::*;

/// The OS-facing operations of the engine.
pub trait Platform: Send + Sync {
    /// Lists physical block devices, flagging (not hiding) the system disk.
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>>;

    /// Releases OS locks on `device` so the raw device can be written.
    /// Must be idempotent. Long waits should end early once `cancel` fires.
    fn unlock(
        &self,
        device: &DeviceDescriptor,
        config: &EngineConfig,
        cancel: &CancelToken,
    ) -> Result<()>;

    /// Arguments for the zero-fill tool writing zeros over `device`.
    fn zero_fill_args(&self, device: &DeviceDescriptor, config: &EngineConfig) -> Vec<String>;
}

/// The [`Platform`] of the running OS.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativePlatform;

#[cfg(any(target_os = "linux", target_os = "windows"))]
impl Platform for NativePlatform {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        enumerate_devices()
    }

    fn unlock(
        &self,
        device: &DeviceDescriptor,
        config: &EngineConfig,
        cancel: &CancelToken,
    ) -> Result<()> {
        unlock_device(device, config, cancel)
    }

    fn zero_fill_args(&self, device: &DeviceDescriptor, config: &EngineConfig) -> Vec<String> {
        zero_fill_args(device, config)
    }
}

pub use self::get_disk::{GET_DISK_SCRIPT, parse_get_disk_json};
