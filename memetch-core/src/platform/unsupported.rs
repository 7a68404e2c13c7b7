use crate::device::DeviceHandle;
use crate::error::{Error, Result};
use crate::logger::Logger;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

const NO_DRIVER: &str = "the pmem driver is only available on Windows";

/// Stand-in for the driver handle. It cannot be constructed here.
pub enum PmemDevice {}

impl Read for PmemDevice {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        match *self {}
    }
}

impl Seek for PmemDevice {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        match *self {}
    }
}

impl DeviceHandle for PmemDevice {
    fn control(&mut self, _code: u32, _input: &[u8], _output: &mut [u8]) -> io::Result<usize> {
        match *self {}
    }
}

pub fn open_device(_path: &Path) -> Result<PmemDevice> {
    Err(Error::Open(Box::new(Error::Unsupported(NO_DRIVER))))
}

/// Creates or truncates the output file. Seeking past the end of a regular
/// file already leaves a hole on these platforms.
pub fn create_output(path: &Path, _sparse: bool) -> Result<File> {
    Ok(File::create(path)?)
}

pub fn install_driver(_driver_path: &Path, _service_name: &str, _logger: &dyn Logger) -> Result<()> {
    Err(Error::Unsupported(NO_DRIVER))
}

pub fn uninstall_driver(_service_name: &str, _logger: &dyn Logger) -> Result<()> {
    Err(Error::Unsupported(NO_DRIVER))
}
