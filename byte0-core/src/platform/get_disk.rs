//! Parser for the JSON that PowerShell's `Get-Disk` emits on Windows.
//!
//! Kept free of any Windows API so it is tested on every platform.

use crate::device::{DeviceDescriptor, DeviceId};
use crate::error::{Result, WipeError};
use serde::Deserialize;
use std::path::PathBuf;

/// The PowerShell pipeline whose output [`parse_get_disk_json`] understands.
pub const GET_DISK_SCRIPT: &str = "Get-Disk | Select-Object Number,FriendlyName,Size,IsBoot,IsSystem,BusType | ConvertTo-Json -Compress";

/// One disk as projected by [`GET_DISK_SCRIPT`].
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetDiskRow {
    number: u32,
    friendly_name: Option<String>,
    size: Option<u64>,
    #[serde(default)]
    is_boot: bool,
    #[serde(default)]
    is_system: bool,
    bus_type: Option<String>,
}

/// `ConvertTo-Json` writes a bare object instead of an array for a single disk.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(GetDiskRow),
    Many(Vec<GetDiskRow>),
}

impl From<GetDiskRow> for DeviceDescriptor {
    fn from(row: GetDiskRow) -> Self {
        let number = row.number;
        let display_name = match row.friendly_name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => format!("Disk {number}"),
        };
        let removable = row
            .bus_type
            .as_deref()
            .map(|bus| matches!(bus.to_ascii_uppercase().as_str(), "USB" | "SD" | "MMC"))
            .unwrap_or(false);

        DeviceDescriptor {
            index: DeviceId::new(number.to_string()),
            display_name,
            size_bytes: row.size.unwrap_or(0),
            is_system_disk: row.is_boot || row.is_system,
            path: PathBuf::from(format!(r"\\.\PhysicalDrive{number}")),
            mount_point: None,
            removable,
        }
    }
}

/// Parses `ConvertTo-Json` output of [`GET_DISK_SCRIPT`].
///
/// Empty output means no disks. A disk is the system disk if either `IsBoot`
/// or `IsSystem` is set; a missing `Size` becomes 0.
pub fn parse_get_disk_json(output: &str) -> Result<Vec<DeviceDescriptor>> {
    let output = output.trim();
    if output.is_empty() {
        return Ok(Vec::new());
    }

    let rows = match serde_json::from_str::<OneOrMany>(output)
        .map_err(|e| WipeError::Enumeration(format!("unexpected Get-Disk output: {e}")))?
    {
        OneOrMany::One(row) => vec![row],
        OneOrMany::Many(rows) => rows,
    };

    let mut devices: Vec<DeviceDescriptor> = rows.into_iter().map(DeviceDescriptor::from).collect();
    devices.sort_by_key(|d| d.index.as_str().parse::<u32>().unwrap_or(u32::MAX));
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"[
        {"Number":0,"FriendlyName":"Samsung SSD 970 EVO Plus 1TB","Size":1000204886016,"IsBoot":true,"IsSystem":true,"BusType":"NVMe"},
        {"Number":1,"FriendlyName":"SanDisk Ultra, USB 3.0","Size":64023257088,"IsBoot":false,"IsSystem":false,"BusType":"USB"},
        {"Number":2,"FriendlyName":"WD Elements 25A2","Size":128035676160,"IsBoot":false,"IsSystem":false,"BusType":"USB"}
    ]"#;

    #[test]
    fn parses_disks_and_flags_system_disk() {
        let disks = parse_get_disk_json(SAMPLE).unwrap();
        assert_eq!(disks.len(), 3);

        assert!(disks[0].is_system_disk);
        assert!(!disks[0].removable);

        assert_eq!(disks[1].index, DeviceId::new("1"));
        assert_eq!(disks[1].display_name, "SanDisk Ultra, USB 3.0");
        assert_eq!(disks[1].size_bytes, 64_023_257_088);
        assert_eq!(disks[1].path, PathBuf::from(r"\\.\PhysicalDrive1"));
        assert!(disks[1].removable);
        assert!(!disks[1].is_system_disk);
    }

    #[test]
    fn single_disk_is_a_bare_object() {
        let json = r#"{"Number":0,"FriendlyName":"VBOX HARDDISK","Size":53687091200,"IsBoot":true,"IsSystem":true,"BusType":"SATA"}"#;
        let disks = parse_get_disk_json(json).unwrap();
        assert_eq!(disks.len(), 1);
        assert!(disks[0].is_system_disk);
        assert_eq!(disks[0].size_bytes, 53_687_091_200);
    }

    #[test]
    fn empty_output_is_no_devices() {
        assert!(parse_get_disk_json("").unwrap().is_empty());
        assert!(parse_get_disk_json("  \r\n").unwrap().is_empty());
        assert!(parse_get_disk_json("[]").unwrap().is_empty());
    }

    #[test]
    fn malformed_output_is_an_enumeration_error() {
        let err = parse_get_disk_json("Get-Disk : Access denied").unwrap_err();
        assert!(matches!(err, WipeError::Enumeration(_)));
    }

    #[test]
    fn tolerates_missing_fields() {
        let json = r#"[{"Number":3,"FriendlyName":null,"Size":null,"IsBoot":false,"IsSystem":true,"BusType":null},
                       {"Number":1,"FriendlyName":"  ","Size":10}]"#;
        let disks = parse_get_disk_json(json).unwrap();
        assert_eq!(disks.len(), 2);
        assert_eq!(disks[0].index, DeviceId::new("1"));
        assert_eq!(disks[0].display_name, "Disk 1");
        assert!(!disks[0].is_system_disk);
        assert_eq!(disks[1].display_name, "Disk 3");
        assert_eq!(disks[1].size_bytes, 0);
        assert!(disks[1].is_system_disk);
        assert!(!disks[1].removable);
    }
}
