//! Provides platform-specific functionality.
//!
//! This module contains the [`crate::probe::SystemProbe`] implementation that
//! reads the running operating system: its mount table, disk-usage report,
//! block-device inventory and device properties.
//!
//! It uses conditional compilation (`#[cfg]`) to expose the implementation for
//! the target OS. Only Linux is supported, since active-disk resolution is
//! built on procfs and sysfs.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;
