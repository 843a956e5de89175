//! Typed records for the mount table and the disk-usage report.
use crate::error::Result;
use crate::probe::SystemProbe;
use tracing::{debug, warn};

/// One mounted filesystem. Rebuilt on every read, never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mount_point: String,
    /// Empty for entries that come from the disk-usage report.
    pub fs_type: String,
}

impl MountEntry {
    pub fn new(device: &str, mount_point: &str, fs_type: &str) -> Self {
        Self {
            device: device.to_string(),
            mount_point: mount_point.to_string(),
            fs_type: fs_type.to_string(),
        }
    }
}

/// Reads and parses the live mount table.
///
/// # Errors
///
/// Fails with [`crate::Error::IoUnavailable`] or
/// [`crate::Error::PermissionDenied`] when the table cannot be read.
pub fn read_mounts(probe: &dyn SystemProbe) -> Result<Vec<MountEntry>> {
    let text = probe.mount_table()?;
    let entries = parse_mount_table(&text);
    debug!(count = entries.len(), "read mount table");
    Ok(entries)
}

/// Reads and parses the disk-usage report.
pub fn read_disk_usage_report(probe: &dyn SystemProbe) -> Result<Vec<MountEntry>> {
    let text = probe.disk_usage_report()?;
    let entries = parse_disk_usage(&text);
    debug!(count = entries.len(), "read disk-usage report");
    Ok(entries)
}

/// Parses `/proc/mounts` text. Lines without at least a device, mount point
/// and filesystem type are skipped.
pub fn parse_mount_table(text: &str) -> Vec<MountEntry> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next(), fields.next()) {
                (Some(device), Some(mount_point), Some(fs_type)) => Some(MountEntry {
                    device: unescape_mount_field(device),
                    mount_point: unescape_mount_field(mount_point),
                    fs_type: fs_type.to_string(),
                }),
                _ => {
                    warn!(line, "skipping malformed mount table line");
                    None
                }
            }
        })
        .collect()
}

/// Parses `df -P` output: a header row, then filesystem, size, used,
/// available, capacity and mount point. The mount point is everything from
/// the sixth column on, so names with spaces survive.
pub fn parse_disk_usage(text: &str) -> Vec<MountEntry> {
    text.lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 6 {
                warn!(line, "skipping short disk-usage row");
                return None;
            }
            Some(MountEntry {
                device: fields[0].to_string(),
                mount_point: fields[5..].join(" "),
                fs_type: String::new(),
            })
        })
        .collect()
}

/// Decodes the octal escapes the kernel uses for whitespace in mount fields
/// (`\040` is a space).
fn unescape_mount_field(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    let bytes = value.as_bytes();
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] == b'\\'
            && index + 3 < bytes.len()
            && bytes[index + 1..=index + 3].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            if let Ok(num) = u8::from_str_radix(&value[index + 1..index + 4], 8) {
                output.push(num as char);
                index += 4;
                continue;
            }
        }
        let ch = value[index..].chars().next().unwrap_or('\u{fffd}');
        output.push(ch);
        index += ch.len_utf8();
    }

    output
}
