//! The pre-flight check every destructive operation must pass.
use crate::active::ActiveDisks;
use crate::device::normalize;
use crate::error::{DeviceRole, Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Validates a proposed source/destination pair.
///
/// Checks, in order: the source is not an active disk, the destination is
/// not an active disk, and the two are not the same device. Two `/dev/`
/// paths on the same base disk (`/dev/sdb` and `/dev/sdb1`) count as the
/// same device. Paths are compared after lexical cleanup only; see
/// [`validate_paths`] for symlink resolution. Nothing is launched or touched.
pub fn validate(source: &str, destination: &str, active: &ActiveDisks) -> Result<()> {
    let cleaned_source = clean(source);
    let cleaned_destination = clean(destination);

    for (role, device, cleaned) in [
        (DeviceRole::Source, source, &cleaned_source),
        (DeviceRole::Destination, destination, &cleaned_destination),
    ] {
        if active.contains(cleaned) {
            warn!(%role, device, disk = %normalize(cleaned), "refusing active disk");
            return Err(Error::ActiveDiskSelected {
                role,
                device: device.to_string(),
            });
        }
    }

    if same_device(&cleaned_source, &cleaned_destination) {
        warn!(source, destination, "refusing identical source and destination");
        return Err(Error::IdenticalDevices(source.to_string()));
    }

    Ok(())
}

/// Like [`validate`], but first resolves each path that exists to its
/// canonical form, so symlinks such as `/dev/disk/by-id/*` are checked as
/// the device they point at.
pub fn validate_paths(source: &Path, destination: &Path, active: &ActiveDisks) -> Result<()> {
    let source = canonical(source);
    let destination = canonical(destination);
    validate(
        &source.to_string_lossy(),
        &destination.to_string_lossy(),
        active,
    )
}

fn canonical(path: &Path) -> PathBuf {
    match fs::canonicalize(path) {
        Ok(resolved) => {
            if resolved != path {
                debug!(
                    path = %path.display(),
                    resolved = %resolved.display(),
                    "resolved device path"
                );
            }
            resolved
        }
        Err(_) => path.to_path_buf(),
    }
}

/// Drops repeated separators and `.` components.
fn clean(path: &str) -> String {
    Path::new(path)
        .components()
        .collect::<PathBuf>()
        .to_string_lossy()
        .into_owned()
}

fn same_device(source: &str, destination: &str) -> bool {
    if source == destination {
        return true;
    }
    source.starts_with("/dev/")
        && destination.starts_with("/dev/")
        && normalize(source) == normalize(destination)
}
