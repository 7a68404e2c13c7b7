//! Provides platform-specific functionality.
//!
//! This module contains the logic for interacting with the operating system to
//! perform tasks that are not cross-platform: opening the pmem driver's device
//! object, creating sparse output files and managing the driver's service.
//!
//! It uses conditional compilation (`#[cfg]`) to expose the correct implementation
//! for the target OS. Each submodule exposes the same public API, so front-ends
//! compile everywhere; on hosts without the driver, opening the device and the
//! service functions fail with [`crate::Error::Unsupported`].

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use self::windows::*;

#[cfg(not(windows))]
mod unsupported;
#[cfg(not(windows))]
pub use self::unsupported::*;

/// Device object exposed by the pmem driver.
pub const DEFAULT_DEVICE_PATH: &str = r"\\.\pmem";

/// Service name the driver is registered under by default.
pub const DEFAULT_SERVICE_NAME: &str = "winpmem";
