//! Lists the block devices a clone could read from or write to.
use crate::active::ActiveDisks;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::probe::SystemProbe;
use std::path::PathBuf;
use tracing::{debug, warn};

/// A disk as presented for selection.
#[derive(Clone, Debug, PartialEq)]
pub struct DiskSummary {
    pub device: Device,
    /// A stable identifier: WWN, serial, `<model>_<name>` or `UNKNOWN_<name>`.
    pub identity: String,
    pub solid_state: bool,
    /// `None` when the active set could not be resolved.
    pub active: Option<bool>,
}

/// Returns every top-level block device except loop devices.
///
/// # Errors
///
/// Fails if the listing tool cannot be run or reports a size that is not a
/// number.
pub fn list_disks(probe: &dyn SystemProbe) -> Result<Vec<Device>> {
    let text = probe.block_devices()?;
    let mut devices = Vec::new();

    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let Some((name, rest)) = next_field(line) else {
            continue;
        };
        let Some((size, rest)) = next_field(rest) else {
            warn!(line, "skipping block device row without a size");
            continue;
        };
        let Some((kind, rest)) = next_field(rest) else {
            warn!(line, "skipping block device row without a type");
            continue;
        };
        if kind == "loop" {
            continue;
        }

        let size_bytes = size
            .parse::<u64>()
            .map_err(|_| Error::Parse(format!("invalid size '{size}' for block device {name}")))?;
        let model = match rest.trim() {
            "" => "Unknown".to_string(),
            model => model.to_string(),
        };

        devices.push(Device {
            path: PathBuf::from(format!("/dev/{name}")),
            name: name.to_string(),
            size_bytes,
            kind: kind.to_string(),
            model,
        });
    }

    debug!(count = devices.len(), "listed block devices");
    Ok(devices)
}

/// Splits off the next whitespace-delimited field, keeping the remainder intact.
fn next_field(text: &str) -> Option<(&str, &str)> {
    let text = text.trim_start();
    if text.is_empty() {
        return None;
    }
    let end = text.find(char::is_whitespace).unwrap_or(text.len());
    Some(text.split_at(end))
}

/// A stable identity string for the disk `name`. Never fails; a failed
/// lookup yields `UNKNOWN_<name>`.
pub fn disk_identity(probe: &dyn SystemProbe, name: &str) -> String {
    let properties = match probe.device_properties(name) {
        Ok(text) => text,
        Err(err) => {
            debug!(name, %err, "device property lookup failed");
            return format!("UNKNOWN_{name}");
        }
    };

    let lookup = |key: &str| {
        properties.lines().find_map(|line| {
            let (k, v) = line.split_once('=')?;
            (k.trim() == key && !v.trim().is_empty()).then(|| v.trim().to_string())
        })
    };

    lookup("ID_WWN")
        .or_else(|| lookup("ID_SERIAL_SHORT"))
        .or_else(|| lookup("ID_MODEL").map(|model| format!("{model}_{name}")))
        .unwrap_or_else(|| format!("UNKNOWN_{name}"))
}

/// True if the kernel reports the disk as non-rotational.
pub fn is_solid_state(probe: &dyn SystemProbe, name: &str) -> bool {
    probe
        .block_attribute(name, "queue/rotational")
        .map(|value| value.trim() == "0")
        .unwrap_or(false)
}

/// Joins the disk list with identity, media type and active status.
pub fn summarize_disks(
    probe: &dyn SystemProbe,
    active: Option<&ActiveDisks>,
) -> Result<Vec<DiskSummary>> {
    Ok(list_disks(probe)?
        .into_iter()
        .map(|device| DiskSummary {
            identity: disk_identity(probe, &device.name),
            solid_state: is_solid_state(probe, &device.name),
            active: active.map(|set| set.contains(&device.name)),
            device,
        })
        .collect())
}
