//! The error taxonomy shared by every module of the library.
use std::fmt;
use std::io;
use thiserror::Error;

/// Which side of a clone a device was selected for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceRole {
    Source,
    Destination,
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceRole::Source => f.write_str("source"),
            DeviceRole::Destination => f.write_str("destination"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// A required system file or command output could not be read.
    #[error("{what} is unavailable: {source}")]
    IoUnavailable {
        what: String,
        #[source]
        source: io::Error,
    },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("{program} exited with {}: {stderr}", display_code(.exit_code))]
    CommandFailed {
        program: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("could not parse {0}")]
    Parse(String),

    #[error("no active system disk could be found")]
    NoActiveDiskFound,

    #[error("{device} backs the running system and cannot be used as the {role}")]
    ActiveDiskSelected { role: DeviceRole, device: String },

    #[error("source and destination are the same device: {0}")]
    IdenticalDevices(String),

    #[error("operation cancelled by user")]
    Cancelled,

    #[error("{program} did not finish within {seconds}s")]
    Timeout { program: String, seconds: u64 },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("the clone worker stopped unexpectedly")]
    WorkerPanicked,
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}

impl Error {
    /// Maps an I/O error on `what` into the matching taxonomy entry.
    pub(crate) fn io(what: impl Into<String>, source: io::Error) -> Self {
        let what = what.into();
        match source.kind() {
            io::ErrorKind::PermissionDenied => Error::PermissionDenied(what),
            _ => Error::IoUnavailable { what, source },
        }
    }

    /// Maps a failure to launch `program`.
    pub(crate) fn spawn(program: &str, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => Error::CommandNotFound(program.to_string()),
            io::ErrorKind::PermissionDenied => Error::PermissionDenied(program.to_string()),
            _ => Error::IoUnavailable {
                what: program.to_string(),
                source,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_not_found_maps_to_command_not_found() {
        let err = Error::spawn("dd", io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(err, Error::CommandNotFound(p) if p == "dd"));
    }

    #[test]
    fn io_permission_maps_to_permission_denied() {
        let err = Error::io("/proc/mounts", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[test]
    fn command_failed_message_carries_context() {
        let err = Error::CommandFailed {
            program: "cmp".into(),
            exit_code: Some(2),
            stderr: "cmp: /dev/sdz: No such file or directory".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("cmp exited with status 2"));
        assert!(msg.contains("/dev/sdz"));

        let killed = Error::CommandFailed {
            program: "dd".into(),
            exit_code: None,
            stderr: String::new(),
        };
        assert!(killed.to_string().contains("a signal"));
    }

    #[test]
    fn active_disk_message_names_role() {
        let err = Error::ActiveDiskSelected {
            role: DeviceRole::Destination,
            device: "/dev/sda".into(),
        };
        assert_eq!(
            err.to_string(),
            "/dev/sda backs the running system and cannot be used as the destination"
        );
    }
}
