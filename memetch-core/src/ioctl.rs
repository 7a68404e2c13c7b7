//! Control codes understood by the pmem driver.

/// Builds a Windows device control code, as the `CTL_CODE` macro does.
pub const fn ctl_code(device_type: u32, function: u32, method: u32, access: u32) -> u32 {
    (device_type << 16) | (access << 14) | (function << 2) | method
}

const FILE_DEVICE_UNKNOWN: u32 = 0x22;
const METHOD_NEITHER: u32 = 3;
const FILE_ANY_ACCESS_RW: u32 = 3;

const fn pmem_code(function: u32) -> u32 {
    ctl_code(FILE_DEVICE_UNKNOWN, function, METHOD_NEITHER, FILE_ANY_ACCESS_RW)
}

/// Selects the acquisition mode. Input: 4-byte little-endian mode value.
pub const IOCTL_SET_MODE: u32 = pmem_code(0x101);
/// Reserved, not used by the engine.
pub const IOCTL_WRITE_ENABLE: u32 = pmem_code(0x102);
/// Returns the device info structure. No input.
pub const IOCTL_GET_INFO: u32 = pmem_code(0x103);
/// Reserved, not used by the engine.
pub const IOCTL_REVERSE_SEARCH_QUERY: u32 = pmem_code(0x104);

/// The strategy the driver uses to reach physical memory.
///
/// Only [`AcquisitionMode::Pte`] is used operationally; it remaps page table
/// entries inside the driver and is the most reliable of the three.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum AcquisitionMode {
    IoSpace = 0,
    Physical = 1,
    Pte = 2,
}

impl AcquisitionMode {
    /// The `SET_MODE` request payload.
    pub fn to_le_bytes(self) -> [u8; 4] {
        (self as u32).to_le_bytes()
    }
}
