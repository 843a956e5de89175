//! A [`SystemProbe`] that serves fixed text, for tests and dry runs.
use crate::error::{Error, Result};
use crate::probe::SystemProbe;
use std::collections::HashMap;
use std::io;

/// Serves canned tool output. Any source left unset behaves like an
/// unavailable system file or command.
#[derive(Clone, Debug, Default)]
pub struct CannedProbe {
    pub mounts: Option<String>,
    pub disk_usage: Option<String>,
    pub block_devices: Option<String>,
    /// Parent lookup output keyed by the queried device path.
    pub parents: HashMap<String, String>,
    /// udev properties keyed by device name.
    pub properties: HashMap<String, String>,
    /// sysfs attributes keyed by `(name, attribute)`.
    pub attributes: HashMap<(String, String), String>,
}

impl CannedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mounts(mut self, text: &str) -> Self {
        self.mounts = Some(text.to_string());
        self
    }

    pub fn with_disk_usage(mut self, text: &str) -> Self {
        self.disk_usage = Some(text.to_string());
        self
    }

    pub fn with_block_devices(mut self, text: &str) -> Self {
        self.block_devices = Some(text.to_string());
        self
    }

    pub fn with_parents(mut self, device: &str, text: &str) -> Self {
        self.parents.insert(device.to_string(), text.to_string());
        self
    }

    pub fn with_properties(mut self, name: &str, text: &str) -> Self {
        self.properties.insert(name.to_string(), text.to_string());
        self
    }

    pub fn with_attribute(mut self, name: &str, attribute: &str, value: &str) -> Self {
        self.attributes
            .insert((name.to_string(), attribute.to_string()), value.to_string());
        self
    }
}

fn missing(what: &str) -> Error {
    Error::IoUnavailable {
        what: what.to_string(),
        source: io::Error::from(io::ErrorKind::NotFound),
    }
}

impl SystemProbe for CannedProbe {
    fn mount_table(&self) -> Result<String> {
        self.mounts.clone().ok_or_else(|| missing("mount table"))
    }

    fn disk_usage_report(&self) -> Result<String> {
        self.disk_usage
            .clone()
            .ok_or_else(|| Error::CommandNotFound("df".into()))
    }

    fn block_devices(&self) -> Result<String> {
        self.block_devices
            .clone()
            .ok_or_else(|| Error::CommandNotFound("lsblk".into()))
    }

    fn parent_devices(&self, device: &str) -> Result<String> {
        self.parents.get(device).cloned().ok_or_else(|| Error::CommandFailed {
            program: "lsblk".into(),
            exit_code: Some(32),
            stderr: format!("lsblk: {device}: not a block device"),
        })
    }

    fn device_properties(&self, name: &str) -> Result<String> {
        self.properties.get(name).cloned().ok_or_else(|| Error::CommandFailed {
            program: "udevadm".into(),
            exit_code: Some(1),
            stderr: format!("Unknown device \"/dev/{name}\""),
        })
    }

    fn block_attribute(&self, name: &str, attribute: &str) -> Result<String> {
        self.attributes
            .get(&(name.to_string(), attribute.to_string()))
            .cloned()
            .ok_or_else(|| missing(&format!("{name}/{attribute}")))
    }
}
