use std::fmt;
use std::path::PathBuf;

/// Represents a top-level block device reported by the disk inventory.
///
/// This struct is populated by [`crate::inventory::list_disks`] from the
/// block-device listing and carries what a front-end needs to present a disk
/// for selection.
#[derive(Clone, Debug, PartialEq)]
pub struct Device {
    /// The system path to the device (e.g., `/dev/sda`).
    pub path: PathBuf,
    /// The kernel-provided name of the device (e.g., "sda").
    pub name: String,
    /// The total size of the device in bytes.
    pub size_bytes: u64,
    /// The device type as reported by the inventory (e.g., "disk", "rom").
    pub kind: String,
    /// The vendor model string, or "Unknown".
    pub model: String,
}

impl Device {
    /// The size of the device in gigabytes (GB).
    pub fn size_gb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<15} {:>8.1} GB  {}",
            self.path.display(),
            self.size_gb(),
            self.model
        )
    }
}

/// Device families whose whole-disk names end in a number, so partitions are
/// marked with a `p<N>` suffix instead of bare digits.
const NUMBERED_FAMILIES: &[&str] = &["mmcblk", "loop", "nbd", "md", "sr"];

/// Maps a raw device name to its canonical base-disk identifier.
///
/// Accepts a leaf name (`sda1`) or a `/dev/` path to one (`/dev/sda1`) and
/// removes any partition suffix:
///
/// - `nvme0n1p1` -> `nvme0n1`
/// - `mmcblk0p2` -> `mmcblk0`
/// - `sda1` -> `sda`
///
/// Names that fit none of the known layouts (`/dev/mapper/vg-root`, `dm-0`)
/// are returned unchanged. The function never fails and is idempotent.
pub fn normalize(raw: &str) -> String {
    let leaf = match raw.strip_prefix("/dev/") {
        Some(leaf) if !leaf.is_empty() && !leaf.contains('/') => leaf,
        Some(_) => return raw.to_string(),
        None => raw,
    };

    nvme_base(leaf)
        .or_else(|| numbered_base(leaf))
        .or_else(|| letter_stem(leaf))
        .map(str::to_string)
        .unwrap_or_else(|| raw.to_string())
}

/// Splits `s` after its leading ASCII digits.
fn split_digits(s: &str) -> (&str, &str) {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s.split_at(end)
}

/// True for an empty suffix or a `p<digits>` partition suffix.
fn is_partition_suffix(rest: &str) -> bool {
    if rest.is_empty() {
        return true;
    }
    match rest.strip_prefix('p') {
        Some(num) => !num.is_empty() && num.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

/// `nvme<ctrl>n<ns>[p<part>]` -> `nvme<ctrl>n<ns>`
fn nvme_base(leaf: &str) -> Option<&str> {
    let after = leaf.strip_prefix("nvme")?;
    let (ctrl, rest) = split_digits(after);
    let rest = rest.strip_prefix('n')?;
    let (ns, rest) = split_digits(rest);
    if ctrl.is_empty() || ns.is_empty() || !is_partition_suffix(rest) {
        return None;
    }
    Some(&leaf[..leaf.len() - rest.len()])
}

/// `<family><n>[p<part>]` -> `<family><n>`
fn numbered_base(leaf: &str) -> Option<&str> {
    NUMBERED_FAMILIES.iter().find_map(|family| {
        let after = leaf.strip_prefix(family)?;
        let (num, rest) = split_digits(after);
        if num.is_empty() || !is_partition_suffix(rest) {
            return None;
        }
        Some(&leaf[..leaf.len() - rest.len()])
    })
}

/// `sda1` -> `sda`: the leading alphabetic stem of a letters-then-digits name.
fn letter_stem(leaf: &str) -> Option<&str> {
    let end = leaf
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(leaf.len());
    let (stem, rest) = leaf.split_at(end);
    if stem.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(stem)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLES: &[&str] = &[
        "sda",
        "sda1",
        "sdb12",
        "/dev/sdc3",
        "vda",
        "xvda2",
        "nvme0n1",
        "nvme0n1p1",
        "nvme12n3p15",
        "/dev/nvme1n1p2",
        "mmcblk0",
        "mmcblk0p2",
        "loop7",
        "md127p1",
        "sr0",
        "dm-0",
        "/dev/dm-1",
        "/dev/mapper/vg0-root",
        "mapper/vg0-root",
        "nvme0",
        "nvme0n",
        "mmcblk0boot0",
        "rootfs",
        "overlay",
        "/dev/",
        "",
        "/tmp/images/disk.img",
    ];

    #[test]
    fn strips_partition_suffixes() {
        assert_eq!(normalize("nvme0n1p1"), "nvme0n1");
        assert_eq!(normalize("sda1"), "sda");
        assert_eq!(normalize("nvme0n1"), "nvme0n1");
        assert_eq!(normalize("/dev/sdb2"), "sdb");
        assert_eq!(normalize("/dev/sdb"), "sdb");
        assert_eq!(normalize("mmcblk0p2"), "mmcblk0");
        assert_eq!(normalize("xvda3"), "xvda");
        assert_eq!(normalize("md127p1"), "md127");
        assert_eq!(normalize("sr0"), "sr0");
    }

    #[test]
    fn unknown_layouts_pass_through() {
        assert_eq!(normalize("/dev/mapper/vg0-root"), "/dev/mapper/vg0-root");
        assert_eq!(normalize("/dev/dm-0"), "/dev/dm-0");
        assert_eq!(normalize("dm-0"), "dm-0");
        assert_eq!(normalize("mmcblk0boot0"), "mmcblk0boot0");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn normalization_is_idempotent() {
        for raw in SAMPLES {
            let once = normalize(raw);
            assert_eq!(normalize(&once), once, "not idempotent for {raw:?}");
        }
    }

    #[test]
    fn display_shows_path_size_and_model() {
        let device = Device {
            path: PathBuf::from("/dev/sdb"),
            name: "sdb".into(),
            size_bytes: 32 * 1024 * 1024 * 1024,
            kind: "disk".into(),
            model: "SanDisk Ultra".into(),
        };
        let shown = device.to_string();
        assert!(shown.starts_with("/dev/sdb"));
        assert!(shown.contains("32.0 GB"));
        assert!(shown.ends_with("SanDisk Ultra"));
    }
}
