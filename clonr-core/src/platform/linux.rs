use crate::error::{Error, Result};
use crate::exec::{collect, drain};
use crate::probe::SystemProbe;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::debug;
use wait_timeout::ChildExt;

/// Upper bound for any single inventory or usage query.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Reads the live system through procfs, sysfs and the standard
/// util-linux/coreutils/udev tools.
///
/// The file locations can be redirected, which is mainly useful for running
/// against a captured system snapshot.
#[derive(Clone, Debug)]
pub struct LinuxProbe {
    mounts_path: PathBuf,
    sys_block: PathBuf,
    query_timeout: Duration,
}

impl Default for LinuxProbe {
    fn default() -> Self {
        Self {
            mounts_path: PathBuf::from("/proc/mounts"),
            sys_block: PathBuf::from("/sys/block"),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

impl LinuxProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mounts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.mounts_path = path.into();
        self
    }

    pub fn with_sys_block(mut self, path: impl Into<PathBuf>) -> Self {
        self.sys_block = path.into();
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Helper to read a specific file from the `/sys/block` filesystem.
    fn read_sys_file(&self, device_name: &str, file: &str) -> io::Result<String> {
        let path = self.sys_block.join(device_name).join(file);
        fs::read_to_string(path).map(|s| s.trim().to_string())
    }

    /// Runs a short query command and returns its standard output.
    fn query(&self, program: &str, args: &[&str]) -> Result<String> {
        debug!(program, ?args, "running query");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::spawn(program, e))?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match child
            .wait_timeout(self.query_timeout)
            .map_err(|e| Error::io(program, e))?
        {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                let _ = collect(stdout);
                let _ = collect(stderr);
                return Err(Error::Timeout {
                    program: program.to_string(),
                    seconds: self.query_timeout.as_secs(),
                });
            }
        };

        let stdout = collect(stdout);
        let stderr = collect(stderr);
        if !status.success() {
            return Err(Error::CommandFailed {
                program: program.to_string(),
                exit_code: status.code(),
                stderr,
            });
        }
        Ok(stdout)
    }
}

impl SystemProbe for LinuxProbe {
    fn mount_table(&self) -> Result<String> {
        read_file(&self.mounts_path)
    }

    fn disk_usage_report(&self) -> Result<String> {
        self.query("df", &["-P"])
    }

    fn block_devices(&self) -> Result<String> {
        self.query("lsblk", &["-d", "-b", "-n", "-o", "NAME,SIZE,TYPE,MODEL"])
    }

    fn parent_devices(&self, device: &str) -> Result<String> {
        self.query("lsblk", &["-n", "-o", "PKNAME", device])
    }

    fn device_properties(&self, name: &str) -> Result<String> {
        let name_arg = format!("--name=/dev/{name}");
        self.query("udevadm", &["info", "--query=property", &name_arg])
    }

    fn block_attribute(&self, name: &str, attribute: &str) -> Result<String> {
        self.read_sys_file(name, attribute)
            .map_err(|e| Error::io(format!("{name}/{attribute}"), e))
    }
}

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| Error::io(path.display().to_string(), e))
}
