use std::io::{self, Read, Seek};

/// An open handle to the acquisition driver.
///
/// Reads and seeks address physical memory directly: seeking to `offset` and
/// reading `n` bytes returns `n` bytes of RAM starting at that physical
/// address. A read of a range the driver cannot map fails with an error.
pub trait DeviceHandle: Read + Seek + Send {
    /// Issues a device control request, returning the number of bytes the
    /// driver wrote into `output`.
    fn control(&mut self, code: u32, input: &[u8], output: &mut [u8]) -> io::Result<usize>;

    /// Releases the underlying OS handle. Must tolerate repeated calls.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<D: DeviceHandle + ?Sized> DeviceHandle for Box<D> {
    fn control(&mut self, code: u32, input: &[u8], output: &mut [u8]) -> io::Result<usize> {
        (**self).control(code, input, output)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}
