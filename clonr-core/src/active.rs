//! Works out which disks back the running system.
//!
//! The answer is assembled from three unreliable sources: the mount table,
//! the disk-usage report and the block-device inventory's parent lookup.
//! Nothing here is cached; every call takes a fresh snapshot because disks
//! can be hot-plugged or remounted at any time.
use crate::device::normalize;
use crate::error::{Error, Result};
use crate::mounts::{MountEntry, read_disk_usage_report, read_mounts};
use crate::probe::SystemProbe;
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, error, info, warn};

/// Root devices that carry no real device identity (live and container roots).
const PLACEHOLDER_ROOTS: &[&str] = &["rootfs", "overlay", "aufs", "/dev/root"];

/// Mount-point fragments that mark live-boot media in the mount table.
const LIVE_MEDIA_MOUNTS: &[&str] = &["/run/live", "/lib/live", "/live/", "/cdrom"];

/// Mount-point fragments that mark live-boot media in the disk-usage report.
const LIVE_REPORT_MOUNTS: &[&str] = &["/run/live", "/lib/live"];

/// Device-name fragments of storage devices that can carry a boot medium.
const STORAGE_NAMES: &[&str] = &["sd", "nvme", "mmc"];

/// Mount-point fragments under which removable media is usually mounted.
const REMOVABLE_MOUNTS: &[&str] = &["/media", "/mnt", "/run"];

/// How many device-mapper layers the parent lookup follows.
const MAX_MAPPER_DEPTH: usize = 8;

/// The base-disk identifiers currently backing the root filesystem.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActiveDisks(BTreeSet<String>);

impl ActiveDisks {
    /// True if `device`, after normalization, is one of the active disks.
    pub fn contains(&self, device: &str) -> bool {
        self.0.contains(&normalize(device))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for ActiveDisks {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for ActiveDisks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().collect();
        f.write_str(&names.join(", "))
    }
}

/// Accumulates identifiers while the resolution steps run.
#[derive(Default)]
struct Accumulator {
    disks: BTreeSet<String>,
    live_boot_found: bool,
}

impl Accumulator {
    fn add(&mut self, id: String, why: &str) {
        debug!(disk = %id, why, "active disk candidate");
        self.disks.insert(id);
    }

    /// Adds the normalized name of a `/dev/` device; anything else is ignored.
    fn add_device(&mut self, device: &str, why: &str) -> bool {
        if !device.starts_with("/dev/") {
            return false;
        }
        self.add(normalize(device), why);
        true
    }

    fn finish(self) -> Result<ActiveDisks> {
        let named: BTreeSet<String> = self
            .disks
            .iter()
            .filter(|id| !id.starts_with("/dev/"))
            .cloned()
            .collect();

        // Path-style entries (unresolved mapper devices) name no physical
        // disk, so a set made only of them cannot protect anything.
        if named.is_empty() {
            error!(unresolved = ?self.disks, "no active disk could be determined");
            return Err(Error::NoActiveDiskFound);
        }

        // Once real live-media names are known, leftover path-style entries
        // are dropped.
        if self.live_boot_found {
            return Ok(ActiveDisks(named));
        }

        Ok(ActiveDisks(self.disks))
    }
}

/// Resolves the set of disks backing the running system, live-boot media
/// included.
///
/// # Errors
///
/// - The mount table cannot be read ([`Error::IoUnavailable`] or
///   [`Error::PermissionDenied`]).
/// - No disk could be identified ([`Error::NoActiveDiskFound`]).
///
/// The disk-usage report and the parent lookup are best-effort: their
/// failures are logged and resolution continues without them.
pub fn resolve_active_disks(probe: &dyn SystemProbe) -> Result<ActiveDisks> {
    let mounts = read_mounts(probe).inspect_err(|e| error!(%e, "cannot read mount table"))?;
    let usage = LazyReport::new(probe);
    let mut acc = Accumulator::default();

    let root_device = mounts
        .iter()
        .rev()
        .find(|m| m.mount_point == "/")
        .map(|m| m.device.as_str());

    match root_device {
        Some(root) if !PLACEHOLDER_ROOTS.contains(&root) => {
            debug!(root, "installed system root");
            add_installed_root(probe, root, &mut acc);
        }
        other => {
            info!(root = ?other, "root has no device identity, looking for live media");
            add_live_media(&mounts, &usage, &mut acc);
        }
    }

    for entry in usage.entries() {
        if mount_matches(&entry.mount_point, LIVE_REPORT_MOUNTS)
            && acc.add_device(&entry.device, "live report")
        {
            acc.live_boot_found = true;
        }
    }

    let active = acc.finish()?;
    info!(disks = %active, "active disks resolved");
    Ok(active)
}

/// True if `device` lives behind device-mapper (LVM, LUKS, dm-raid).
fn is_mapped(device: &str) -> bool {
    device.starts_with("/dev/mapper/") || device.starts_with("/dev/dm-")
}

fn add_installed_root(probe: &dyn SystemProbe, root: &str, acc: &mut Accumulator) {
    if !is_mapped(root) {
        acc.add(normalize(root), "root");
        return;
    }

    let parents = physical_parents(probe, root);
    if parents.is_empty() {
        warn!(root, "could not resolve the disks behind the mapped root");
        acc.add(root.to_string(), "unresolved mapped root");
    }
    for parent in parents {
        acc.add(normalize(&parent), "mapped root parent");
    }
}

/// Follows parent lookups through stacked device-mapper layers down to
/// physical devices.
fn physical_parents(probe: &dyn SystemProbe, device: &str) -> Vec<String> {
    let mut physical = Vec::new();
    let mut pending = vec![(device.to_string(), 0usize)];
    let mut seen = BTreeSet::new();

    while let Some((device, depth)) = pending.pop() {
        if !seen.insert(device.clone()) {
            continue;
        }
        let output = match probe.parent_devices(&device) {
            Ok(output) => output,
            Err(e) => {
                warn!(device = %device, %e, "parent lookup failed");
                continue;
            }
        };
        for parent in output.lines().map(str::trim).filter(|p| !p.is_empty()) {
            if parent.starts_with("dm-") && depth < MAX_MAPPER_DEPTH {
                pending.push((format!("/dev/{parent}"), depth + 1));
            } else {
                physical.push(parent.to_string());
            }
        }
    }

    physical
}

fn add_live_media(mounts: &[MountEntry], usage: &LazyReport<'_>, acc: &mut Accumulator) {
    for entry in mounts {
        if mount_matches(&entry.mount_point, LIVE_MEDIA_MOUNTS) {
            if acc.add_device(&entry.device, "live medium") {
                acc.live_boot_found = true;
            }
        } else if is_storage_device(&entry.device)
            && mount_matches(&entry.mount_point, REMOVABLE_MOUNTS)
        {
            acc.add_device(&entry.device, "removable boot candidate");
        }
    }

    if acc.disks.is_empty() {
        debug!("nothing found in the mount table, falling back to the disk-usage report");
        for entry in usage.entries() {
            if is_storage_device(&entry.device) {
                acc.add_device(&entry.device, "mounted storage");
            }
        }
    }
}

fn mount_matches(mount_point: &str, fragments: &[&str]) -> bool {
    fragments.iter().any(|f| mount_point.contains(f))
}

fn is_storage_device(device: &str) -> bool {
    device
        .strip_prefix("/dev/")
        .is_some_and(|leaf| STORAGE_NAMES.iter().any(|s| leaf.contains(s)))
}

/// Fetches the disk-usage report at most once per resolution.
struct LazyReport<'a> {
    probe: &'a dyn SystemProbe,
    entries: std::cell::OnceCell<Vec<MountEntry>>,
}

impl<'a> LazyReport<'a> {
    fn new(probe: &'a dyn SystemProbe) -> Self {
        Self {
            probe,
            entries: std::cell::OnceCell::new(),
        }
    }

    fn entries(&self) -> &[MountEntry] {
        self.entries.get_or_init(|| {
            read_disk_usage_report(self.probe).unwrap_or_else(|e| {
                warn!(%e, "disk-usage report unavailable");
                Vec::new()
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::CannedProbe;

    const DF_HEADER: &str = "Filesystem 1024-blocks Used Available Capacity Mounted on\n";

    fn disks(active: &ActiveDisks) -> Vec<&str> {
        active.iter().collect()
    }

    #[test]
    fn plain_partition_root() {
        let probe = CannedProbe::new()
            .with_mounts("/dev/sda1 / ext4 rw 0 0\n")
            .with_disk_usage(DF_HEADER);
        assert_eq!(disks(&resolve_active_disks(&probe).unwrap()), ["sda"]);
    }

    #[test]
    fn nvme_root_with_missing_df() {
        let probe = CannedProbe::new().with_mounts(
            "proc /proc proc rw 0 0\n/dev/nvme0n1p2 / btrfs rw 0 0\n/dev/nvme0n1p1 /boot/efi vfat rw 0 0\n",
        );
        assert_eq!(disks(&resolve_active_disks(&probe).unwrap()), ["nvme0n1"]);
    }

    #[test]
    fn device_mapper_root_resolves_parent() {
        let probe = CannedProbe::new()
            .with_mounts("/dev/dm-0 / ext4 rw 0 0\n")
            .with_parents("/dev/dm-0", "sda\n")
            .with_disk_usage(DF_HEADER);
        assert_eq!(disks(&resolve_active_disks(&probe).unwrap()), ["sda"]);
    }

    #[test]
    fn lvm_root_on_two_physical_volumes() {
        let probe = CannedProbe::new()
            .with_mounts("/dev/mapper/vg0-root / xfs rw 0 0\n")
            .with_parents("/dev/mapper/vg0-root", "sda2\nnvme0n1p3\n");
        assert_eq!(
            disks(&resolve_active_disks(&probe).unwrap()),
            ["nvme0n1", "sda"]
        );
    }

    #[test]
    fn stacked_mapper_layers_are_followed() {
        // LVM on LUKS: root LV -> dm-0 (crypt) -> nvme0n1p3
        let probe = CannedProbe::new()
            .with_mounts("/dev/mapper/vg0-root / ext4 rw 0 0\n")
            .with_parents("/dev/mapper/vg0-root", "dm-0\n")
            .with_parents("/dev/dm-0", "nvme0n1p3\n");
        assert_eq!(disks(&resolve_active_disks(&probe).unwrap()), ["nvme0n1"]);
    }

    #[test]
    fn unresolved_mapper_root_is_not_a_usable_active_set() {
        let probe = CannedProbe::new()
            .with_mounts("/dev/mapper/vg0-root / ext4 rw 0 0\n/dev/sda1 /boot ext4 rw 0 0\n");
        assert!(matches!(
            resolve_active_disks(&probe),
            Err(Error::NoActiveDiskFound)
        ));
    }

    #[test]
    fn live_media_takes_precedence_over_unresolved_mapper_root() {
        let probe = CannedProbe::new()
            .with_mounts("/dev/dm-0 / ext4 rw 0 0\n/dev/sdb1 /run/live/medium iso9660 ro 0 0\n")
            .with_disk_usage(&format!(
                "{DF_HEADER}/dev/sdb1 4000000 3000000 1000000 75% /run/live/medium\n"
            ));
        assert_eq!(disks(&resolve_active_disks(&probe).unwrap()), ["sdb"]);
    }

    #[test]
    fn live_media_is_added_next_to_resolved_mapper_root() {
        let probe = CannedProbe::new()
            .with_mounts("/dev/dm-0 / ext4 rw 0 0\n")
            .with_parents("/dev/dm-0", "sda\n")
            .with_disk_usage(&format!(
                "{DF_HEADER}/dev/sdb1 4000000 3000000 1000000 75% /run/live/medium\n"
            ));
        assert_eq!(disks(&resolve_active_disks(&probe).unwrap()), ["sda", "sdb"]);
    }

    #[test]
    fn overlay_root_finds_live_medium_in_mount_table() {
        let probe = CannedProbe::new().with_mounts(
            "overlay / overlay rw 0 0\n\
             /dev/sdc1 /run/live/medium vfat ro 0 0\n\
             /dev/loop0 /run/live/rootfs/filesystem.squashfs squashfs ro 0 0\n",
        );
        assert_eq!(
            disks(&resolve_active_disks(&probe).unwrap()),
            ["loop0", "sdc"]
        );
    }

    #[test]
    fn placeholder_root_picks_up_removable_mounts() {
        let probe = CannedProbe::new().with_mounts(
            "rootfs / rootfs rw 0 0\n\
             /dev/mmcblk0p1 /media/boot vfat rw 0 0\n\
             /dev/sda1 /home ext4 rw 0 0\n",
        );
        assert_eq!(disks(&resolve_active_disks(&probe).unwrap()), ["mmcblk0"]);
    }

    #[test]
    fn placeholder_root_falls_back_to_disk_usage_report() {
        let probe = CannedProbe::new()
            .with_mounts("/dev/root / ext4 rw 0 0\n")
            .with_disk_usage(&format!(
                "{DF_HEADER}/dev/root 1000 10 990 1% /\n/dev/sdd2 2000 10 1990 1% /srv\n"
            ));
        assert_eq!(disks(&resolve_active_disks(&probe).unwrap()), ["sdd"]);
    }

    #[test]
    fn last_root_mount_wins() {
        let probe = CannedProbe::new()
            .with_mounts("rootfs / rootfs rw 0 0\n/dev/vda1 / ext4 rw 0 0\n");
        assert_eq!(disks(&resolve_active_disks(&probe).unwrap()), ["vda"]);
    }

    #[test]
    fn nothing_identifiable_is_an_error() {
        let probe = CannedProbe::new()
            .with_mounts("overlay / overlay rw 0 0\ntmpfs /run tmpfs rw 0 0\n")
            .with_disk_usage(DF_HEADER);
        assert!(matches!(
            resolve_active_disks(&probe),
            Err(Error::NoActiveDiskFound)
        ));
    }

    #[test]
    fn unreadable_mount_table_propagates() {
        let probe = CannedProbe::new();
        assert!(matches!(
            resolve_active_disks(&probe),
            Err(Error::IoUnavailable { .. })
        ));
    }

    #[test]
    fn contains_normalizes_its_argument() {
        let active: ActiveDisks = ["sda", "nvme0n1"].into_iter().collect();
        assert!(active.contains("/dev/sda"));
        assert!(active.contains("/dev/sda3"));
        assert!(active.contains("nvme0n1p2"));
        assert!(!active.contains("/dev/sdb"));
        assert_eq!(active.to_string(), "nvme0n1, sda");
    }
}
