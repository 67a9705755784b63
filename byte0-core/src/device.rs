use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;

/// Platform identifier of a block device.
///
/// On Windows this is the disk number reported by `Get-Disk` (e.g. "1"); on
/// Linux it is the kernel block-device name (e.g. "sdb").
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Represents a physical block device discovered on the system.
///
/// A descriptor is an immutable snapshot: every scan produces fresh values and
/// existing ones are never updated in place. The system disk is included and
/// flagged with `is_system_disk` so that it can be refused explicitly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// The platform device id (disk number or kernel name).
    pub index: DeviceId,
    /// A human readable name, usually vendor and model.
    pub display_name: String,
    /// Total size in bytes, or 0 when the OS did not report one.
    pub size_bytes: u64,
    /// Whether the running OS was booted from this device.
    pub is_system_disk: bool,
    /// The raw path used to address the device (e.g. `/dev/sdb` or `\\.\PhysicalDrive1`).
    pub path: PathBuf,
    /// The primary mount point of one of its partitions, if any.
    pub mount_point: Option<String>,
    /// Whether the OS considers the media removable.
    pub removable: bool,
}

impl DeviceDescriptor {
    /// Size in GiB, for display only.
    pub fn size_gb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }

    /// Fingerprint of the identity the user was shown (index and size).
    ///
    /// A caller must echo this token back when starting a wipe. If the device
    /// list changed in between (a different disk now sits at the same index,
    /// or the size differs) the token no longer matches.
    pub fn confirmation_token(&self) -> ConfirmationToken {
        let mut hasher = Sha256::new();
        hasher.update(self.index.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.size_bytes.to_le_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        ConfirmationToken(hex)
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mount_info = match &self.mount_point {
            Some(mp) => format!("[Mounted at {mp}]"),
            None => "[Not mounted]".to_string(),
        };

        write!(
            f,
            "{:<22} {:<28} {:>8.1} GB {}",
            self.path.display(),
            self.display_name,
            self.size_gb(),
            mount_info
        )
    }
}

/// Hex encoded SHA-256 fingerprint of a [`DeviceDescriptor`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConfirmationToken(String);

impl ConfirmationToken {
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfirmationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a listed device may be chosen as a wipe target right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Availability {
    Available,
    /// The OS booted from this device. It can never be wiped.
    SystemDisk,
    /// Another job is currently unlocking or wiping this device.
    Busy,
}

/// A device together with its availability, as reported by
/// [`crate::Engine::enumerate_devices`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListedDevice {
    pub device: DeviceDescriptor,
    pub availability: Availability,
}

#[cfg(test)]
pub(crate) fn test_device(index: &str, size_bytes: u64, is_system_disk: bool) -> DeviceDescriptor {
    DeviceDescriptor {
        index: DeviceId::new(index),
        display_name: format!("Test Disk {index}"),
        size_bytes,
        is_system_disk,
        path: PathBuf::from(format!("/dev/test{index}")),
        mount_point: None,
        removable: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_stable_for_identical_descriptors() {
        let a = test_device("1", 64_000_000_000, false);
        let b = a.clone();
        assert_eq!(a.confirmation_token(), b.confirmation_token());
        assert_eq!(a.confirmation_token().as_str().len(), 64);
    }

    #[test]
    fn token_changes_with_size_or_index() {
        let a = test_device("1", 64_000_000_000, false);
        let resized = test_device("1", 128_000_000_000, false);
        let moved = test_device("2", 64_000_000_000, false);
        assert_ne!(a.confirmation_token(), resized.confirmation_token());
        assert_ne!(a.confirmation_token(), moved.confirmation_token());
    }

    #[test]
    fn token_ignores_display_only_fields() {
        let a = test_device("1", 4096, false);
        let mut b = a.clone();
        b.display_name = "Renamed".to_string();
        b.mount_point = Some("/media/usb".to_string());
        assert_eq!(a.confirmation_token(), b.confirmation_token());
    }

    #[test]
    fn display_shows_mount_state() {
        let mut d = test_device("1", 1024 * 1024 * 1024, false);
        assert!(d.to_string().contains("[Not mounted]"));
        d.mount_point = Some("/media/usb".to_string());
        assert!(d.to_string().contains("[Mounted at /media/usb]"));
    }
}
