//! The seam between the library and the system it inspects.
//!
//! Every external data source the resolver and inventory consume is reached
//! through [`SystemProbe`]. Each method returns the raw text the source
//! produced; parsing into typed records happens in [`crate::mounts`] and
//! [`crate::inventory`], so all downstream logic can be exercised with canned
//! text (see [`crate::fakes::CannedProbe`]).
use crate::error::Result;

pub trait SystemProbe: Send + Sync {
    /// The live mount table (`/proc/mounts` format).
    fn mount_table(&self) -> Result<String>;

    /// A columnar disk-usage report (`df -P` format, header included).
    fn disk_usage_report(&self) -> Result<String>;

    /// Top-level block devices, one `NAME SIZE TYPE MODEL` row each, size in bytes.
    fn block_devices(&self) -> Result<String>;

    /// Names of the parent devices of a mapped device, one per line.
    fn parent_devices(&self, device: &str) -> Result<String>;

    /// udev `KEY=value` properties of the device `/dev/<name>`.
    fn device_properties(&self, name: &str) -> Result<String>;

    /// A sysfs attribute of the block device `name`, e.g. `queue/rotational`.
    fn block_attribute(&self, name: &str, attribute: &str) -> Result<String>;
}
