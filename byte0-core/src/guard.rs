//! Pre-flight validation of wipe requests.
//!
//! Nothing destructive happens before [`SafetyGuard::authorize`] returns `Ok`.

use crate::device::{ConfirmationToken, DeviceDescriptor, DeviceId};
use crate::error::{Result, Violation, WipeError};
use std::collections::HashSet;

pub struct SafetyGuard {
    known: Vec<DeviceDescriptor>,
    busy: HashSet<DeviceId>,
}

impl SafetyGuard {
    /// `known` should be a scan taken immediately before the request.
    pub fn new(known: Vec<DeviceDescriptor>, busy: HashSet<DeviceId>) -> Self {
        Self { known, busy }
    }

    /// Checks, in order, that the device exists, is not the system disk, is
    /// not already being wiped, and that `token` fingerprints the descriptor
    /// as it is now.
    pub fn authorize(
        &self,
        device_id: &DeviceId,
        token: &ConfirmationToken,
    ) -> Result<DeviceDescriptor> {
        let device = self
            .known
            .iter()
            .find(|d| &d.index == device_id)
            .ok_or_else(|| violation(Violation::UnknownDevice(device_id.clone())))?;

        if device.is_system_disk {
            return Err(violation(Violation::SystemDisk(device_id.clone())));
        }

        if self.busy.contains(device_id) {
            return Err(violation(Violation::DeviceBusy(device_id.clone())));
        }

        if &device.confirmation_token() != token {
            return Err(violation(Violation::TokenMismatch(device_id.clone())));
        }

        Ok(device.clone())
    }
}

fn violation(v: Violation) -> WipeError {
    log::warn!("refusing wipe request: {v}");
    WipeError::SafetyViolation(v)
}
