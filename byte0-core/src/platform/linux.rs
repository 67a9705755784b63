use crate::config::EngineConfig;
use crate::device::{DeviceDescriptor, DeviceId};
use crate::error::{Result, WipeError};
use crate::job::CancelToken;
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

const SYS_BLOCK: &str = "/sys/block";
const SYS_CLASS_BLOCK: &str = "/sys/class/block";

/// Helper to read and trim a sysfs attribute. Empty values count as missing.
fn read_sys_file(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Virtual and ephemeral devices that are never wipe targets.
fn is_virtual_device(name: &str) -> bool {
    ["loop", "ram", "zram", "dm-", "md", "sr", "nbd", "fd"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// Strips a partition suffix from a kernel device name by convention
/// (`sda2 -> sda`, `nvme0n1p3 -> nvme0n1`, `mmcblk0p1 -> mmcblk0`).
/// Used only when sysfs cannot answer.
fn strip_partition_suffix(name: &str) -> String {
    if name.starts_with("nvme") || name.starts_with("mmcblk") {
        if let Some(index) = name.rfind('p') {
            let (base, part) = name.split_at(index);
            if part.len() > 1 && part[1..].chars().all(|c| c.is_ascii_digit()) {
                return base.to_string();
            }
        }
        return name.to_string();
    }

    match name.rfind(|c: char| c.is_ascii_alphabetic()) {
        Some(index) => name[..=index].to_string(),
        None => name.to_string(),
    }
}

/// Resolves a block device name to the whole disk(s) backing it.
///
/// Partitions resolve to their parent; device-mapper and md devices (LVM,
/// LUKS, RAID) are followed through `slaves/` to every disk underneath.
pub(crate) fn resolve_whole_disks(sys_class_block: &Path, name: &str) -> HashSet<String> {
    let mut out = HashSet::new();
    resolve_into(sys_class_block, name, &mut out, 0);
    out
}

fn resolve_into(sys_class_block: &Path, name: &str, out: &mut HashSet<String>, depth: usize) {
    if depth > 8 {
        return;
    }
    let entry = sys_class_block.join(name);

    if let Ok(slaves) = fs::read_dir(entry.join("slaves")) {
        let slaves: Vec<String> = slaves
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        if !slaves.is_empty() {
            for slave in slaves {
                resolve_into(sys_class_block, &slave, out, depth + 1);
            }
            return;
        }
    }

    if entry.join("partition").exists() {
        let parent = fs::canonicalize(&entry)
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()));
        match parent {
            Some(parent) => out.insert(parent),
            None => out.insert(strip_partition_suffix(name)),
        };
        return;
    }

    if entry.exists() {
        out.insert(name.to_string());
    } else {
        out.insert(strip_partition_suffix(name));
    }
}

/// Kernel names of the disk(s) backing the root filesystem.
fn system_disk_names(disks: &sysinfo::Disks) -> Result<HashSet<String>> {
    let root = disks
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
        .ok_or_else(|| WipeError::Enumeration("Could not determine system drive.".into()))?;

    // `/dev/mapper/root` style names canonicalize to `/dev/dm-N`.
    let dev_path = PathBuf::from("/dev/").join(root.name());
    let dev_path = fs::canonicalize(&dev_path).unwrap_or(dev_path);
    let name = dev_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| WipeError::Enumeration("Could not determine system drive.".into()))?;

    Ok(resolve_whole_disks(Path::new(SYS_CLASS_BLOCK), &name))
}

/// Maps each kernel device name to the first mount point of any of its partitions.
fn mount_points(disks: &sysinfo::Disks) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for disk in disks.iter() {
        let dev = PathBuf::from(disk.name());
        let Some(name) = dev.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        let mp = disk.mount_point().to_string_lossy().to_string();
        if mp.is_empty() {
            continue;
        }
        for whole in resolve_whole_disks(Path::new(SYS_CLASS_BLOCK), &name) {
            map.entry(whole).or_insert_with(|| mp.clone());
        }
    }
    map
}

/// Scans a `/sys/block` style directory for physical devices.
///
/// Virtual devices and devices reporting a size of zero (e.g. an empty card
/// reader) are skipped. Every name in `system_disks` is flagged, and the scan
/// fails if none of them is found, rather than returning a list in which the
/// boot device could go unflagged.
pub(crate) fn scan_block_devices_in(
    sys_block: &Path,
    system_disks: &HashSet<String>,
    mounts: &HashMap<String, String>,
) -> Result<Vec<DeviceDescriptor>> {
    let entries = fs::read_dir(sys_block).map_err(|e| {
        WipeError::Enumeration(format!("cannot read {}: {e}", sys_block.display()))
    })?;

    let mut devices = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let device_name = entry.file_name().to_string_lossy().to_string();
        if is_virtual_device(&device_name) {
            continue;
        }
        let dir = sys_block.join(&device_name);

        let size_sectors: u64 = read_sys_file(&dir.join("size"))
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        if size_sectors == 0 {
            continue;
        }

        let vendor = read_sys_file(&dir.join("device/vendor"));
        let model = read_sys_file(&dir.join("device/model"));
        let display_name = match (vendor, model) {
            (Some(v), Some(m)) => format!("{v} {m}"),
            (None, Some(m)) => m,
            (Some(v), None) => v,
            (None, None) => device_name.clone(),
        };

        devices.push(DeviceDescriptor {
            index: DeviceId::new(device_name.clone()),
            display_name,
            size_bytes: size_sectors.saturating_mul(512),
            is_system_disk: system_disks.contains(&device_name),
            path: PathBuf::from("/dev/").join(&device_name),
            mount_point: mounts.get(&device_name).cloned(),
            removable: read_sys_file(&dir.join("removable")).as_deref() == Some("1"),
        });
    }

    if !devices.is_empty() && !devices.iter().any(|d| d.is_system_disk) {
        return Err(WipeError::Enumeration(
            "Could not match the system drive to any block device.".into(),
        ));
    }

    devices.sort_by(|a, b| a.index.cmp(&b.index));
    Ok(devices)
}

/// Scans for all physical block devices on a Linux system.
///
/// The device holding the root filesystem is found through `sysinfo` and
/// flagged as the system disk; loop, RAM, device-mapper, md and optical
/// devices are not listed at all.
pub fn enumerate_devices() -> Result<Vec<DeviceDescriptor>> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let system_disks = system_disk_names(&disks)?;
    log::debug!("system disk(s): {system_disks:?}");
    let mounts = mount_points(&disks);
    scan_block_devices_in(Path::new(SYS_BLOCK), &system_disks, &mounts)
}

/// Checks that the raw device can be opened for exclusive writing.
///
/// Linux holds no partition locks that need releasing; opening with `O_EXCL`
/// fails with `EBUSY` while any partition is mounted or claimed. The device is
/// closed again before returning.
pub fn unlock_device(
    device: &DeviceDescriptor,
    _config: &EngineConfig,
    _cancel: &CancelToken,
) -> Result<()> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    if let Some(mp) = mount_points(&disks).get(device.index.as_str()) {
        return Err(WipeError::UnlockFailure {
            device: device.index.clone(),
            reason: format!("a partition is mounted at {mp}; unmount it first"),
        });
    }

    OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_EXCL)
        .open(&device.path)
        .map(drop)
        .map_err(|e| open_error(device, e))
}

fn open_error(device: &DeviceDescriptor, err: io::Error) -> WipeError {
    let reason = match err.raw_os_error() {
        Some(libc::EBUSY) => "device is busy (mounted or held by another process)".to_string(),
        Some(libc::EACCES) | Some(libc::EPERM) => "permission denied; run as root".to_string(),
        Some(libc::ENOENT) => format!("{} does not exist", device.path.display()),
        _ => err.to_string(),
    };
    WipeError::UnlockFailure {
        device: device.index.clone(),
        reason,
    }
}

/// GNU `dd` arguments. With a known size, `count_bytes` stops the copy exactly
/// at the end of the device so a full run exits 0 instead of reporting
/// "No space left on device".
pub fn zero_fill_args(device: &DeviceDescriptor, config: &EngineConfig) -> Vec<String> {
    let mut args = vec![
        "if=/dev/zero".to_string(),
        format!("of={}", device.path.display()),
        format!("bs={}", config.block_size),
        "conv=fsync".to_string(),
        "status=progress".to_string(),
    ];
    if device.size_bytes > 0 {
        args.push("iflag=count_bytes".to_string());
        args.push(format!("count={}", device.size_bytes));
    }
    args
}
