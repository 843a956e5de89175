//! The core, UI-agnostic library for the `clonr` disk cloning utility.
//!
//! `clonr-core` is designed to be used as a library by any front-end, whether it's
//! a command-line interface (like `clonr`) or a graphical user interface. It
//! handles working out which disks the running system depends on, refusing to
//! touch them, and driving the external copy and compare tools.
//!
//! The library is structured into several key modules:
//! - [`device`]: The `Device` struct and device-name normalization.
//! - [`probe`] and [`platform`]: The seam to the system's mount table, block
//!   device listing and device properties, and its Linux implementation.
//! - [`mounts`]: Parsing of the mount table and the disk-usage report.
//! - [`active`]: Resolution of the disks backing the root filesystem.
//! - [`gate`]: The safety check every clone must pass.
//! - [`exec`]: Running an external tool with progress polling and cancellation.
//! - [`mod@clone`]: The clone job orchestrator.
//! - [`inventory`]: Listing disks for selection.
//!
//! Clone jobs run on a worker thread and are observed through a
//! [`clone::JobHandle`], allowing the calling application to display progress
//! in any way it chooses.
//!
//! ## Example: Cloning a Disk with Progress Reporting
//!
//! ```rust,no_run
//! use clonr_core::clone::{CloneJob, CloneOrchestrator, CloneSettings, JobState};
//! use clonr_core::platform::LinuxProbe;
//! use std::{thread, time::Duration};
//!
//! fn main() -> clonr_core::Result<()> {
//!     let orchestrator = CloneOrchestrator::new(LinuxProbe::new(), CloneSettings::default());
//!     let handle = orchestrator.start(CloneJob::new("/dev/sdb", "/dev/sdc"))?;
//!
//!     while !handle.is_finished() {
//!         println!("{}: {}%", handle.state(), handle.progress());
//!         thread::sleep(Duration::from_millis(500));
//!     }
//!
//!     let report = handle.wait();
//!     match report.error {
//!         Some(err) => Err(err),
//!         None => {
//!             assert_eq!(report.state, JobState::Completed);
//!             Ok(())
//!         }
//!     }
//! }
//! ```

pub mod active;
pub mod clone;
pub mod device;
pub mod error;
pub mod exec;
pub mod fakes;
pub mod gate;
pub mod inventory;
pub mod mounts;
pub mod platform;
pub mod probe;

pub use error::{DeviceRole, Error, Result};
