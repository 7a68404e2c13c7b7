//! The core, UI-agnostic library for the `memetch` memory acquisition tool.
//!
//! `memetch-core` talks to the pmem kernel driver, images physical memory
//! with per-page fault tolerance and streams the result through optional
//! compression. Front-ends such as the `memetch` CLI only parse arguments and
//! draw progress.
//!
//! The library is structured into several key modules:
//! - [`info`]: Decodes the driver's device info reply into [`DeviceInfo`].
//! - [`run`]: Classifies physical offsets as backed or sparse.
//! - [`engine`]: The [`AcquisitionEngine`], for random reads and full dumps.
//! - [`codec`]: Compressing writers and sniffing decompressing readers.
//! - [`platform`]: Opening the driver, creating output files and managing
//!   the driver service on the host OS.
//!
//! Long-running operations take a `running` flag and return
//! [`Error::Cancelled`] once it is cleared, allowing a Ctrl+C handler to stop
//! them between chunks.
//!
//! ## Example: Acquiring a Compressed Image
//!
//! ```rust,no_run
//! use memetch_core::{codec, platform, AcquisitionEngine, AcquisitionMode, ConsoleLogger};
//! use std::path::Path;
//! use std::sync::{Arc, atomic::AtomicBool};
//!
//! fn main() -> memetch_core::Result<()> {
//!     let logger = Arc::new(ConsoleLogger::new(false));
//!     let device = platform::open_device(Path::new(r"\\.\pmem"))?;
//!     let engine = AcquisitionEngine::new(device, logger)?;
//!     engine.set_mode(AcquisitionMode::Pte)?;
//!     println!("{}", engine.info());
//!
//!     // A shared flag to allow for graceful cancellation.
//!     let running = Arc::new(AtomicBool::new(true));
//!
//!     let output = platform::create_output(Path::new("memory.s2"), false)?;
//!     let mut writer = codec::select_compressor("s2", output)?;
//!     engine.sequential_dump(&mut writer, &running)?;
//!     writer.finish()?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod device;
pub mod digest;
pub mod engine;
pub mod error;
pub mod info;
pub mod ioctl;
pub mod logger;
pub mod platform;
pub mod run;
pub mod s2;
pub mod sink;

pub use device::DeviceHandle;
pub use engine::AcquisitionEngine;
pub use error::{Error, Result};
pub use info::{DeviceInfo, MemoryRange};
pub use ioctl::AcquisitionMode;
pub use logger::{ConsoleLogger, Logger, SilentLogger};
pub use run::{Run, RunResolver};
pub use sink::OutputSink;

/// Size of one physical page, the unit of read-failure isolation.
pub const PAGE_SIZE: usize = 0x1000;

/// Bulk transfer size: 1024 pages (4 MiB).
pub const BUFFER_SIZE: usize = PAGE_SIZE * 1024;
