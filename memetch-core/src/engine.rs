//! The acquisition engine.
//!
//! [`AcquisitionEngine`] owns the driver handle and serves two kinds of
//! reader: random access through [`AcquisitionEngine::read_at`], and the
//! full-image producer [`AcquisitionEngine::sequential_dump`].
//!
//! Both degrade the same way when the driver refuses a bulk read: the span
//! is re-read one page at a time and any page that still fails is replaced
//! by zeroes. A single unreadable page therefore costs 4 KiB of image, never
//! the acquisition.
use crate::device::DeviceHandle;
use crate::error::{Error, Result};
use crate::info::DeviceInfo;
use crate::ioctl::{AcquisitionMode, IOCTL_GET_INFO, IOCTL_SET_MODE};
use crate::logger::Logger;
use crate::run::RunResolver;
use crate::sink::OutputSink;
use crate::{BUFFER_SIZE, PAGE_SIZE};
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Scratch space handed to the driver for the `GET_INFO` reply.
const INFO_BUFFER_SIZE: usize = 64 * 1024;

struct EngineState<D> {
    device: Option<D>,
    resolver: RunResolver,
    mode: Option<AcquisitionMode>,
}

impl<D: DeviceHandle> EngineState<D> {
    fn device(&mut self) -> Result<&mut D> {
        self.device.as_mut().ok_or(Error::Closed)
    }
}

pub struct AcquisitionEngine<D: DeviceHandle> {
    // The handle's file position and the run cache change together, so one
    // lock covers both for every seek+read.
    state: Mutex<EngineState<D>>,
    info: DeviceInfo,
    sparse_output: AtomicBool,
    logger: Arc<dyn Logger>,
}

fn query_info<D: DeviceHandle>(device: &mut D) -> Result<DeviceInfo> {
    let mut buffer = vec![0u8; INFO_BUFFER_SIZE];
    device
        .control(IOCTL_GET_INFO, &[], &mut buffer)
        .map_err(|source| Error::Ioctl {
            code: IOCTL_GET_INFO,
            source,
        })?;
    DeviceInfo::decode(&buffer)
}

fn check_running(running: &AtomicBool) -> Result<()> {
    if running.load(Ordering::SeqCst) {
        Ok(())
    } else {
        Err(Error::Cancelled)
    }
}

fn read_page<D: DeviceHandle>(device: &mut D, page: &mut [u8]) -> io::Result<()> {
    let n = device.read(page)?;
    if n == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "empty page read"));
    }
    page[n..].fill(0);
    Ok(())
}

/// Re-reads `buffer` from `base` one physical page at a time, zero-filling
/// pages the device refuses. An unaligned `base` makes the first and last
/// pieces partial pages. Returns the number of pieces actually read.
fn read_pages<D: DeviceHandle>(
    device: &mut D,
    buffer: &mut [u8],
    base: u64,
    logger: &dyn Logger,
) -> Result<u64> {
    let mut good_pages = 0;
    let mut done = 0;
    while done < buffer.len() {
        let address = base + done as u64;
        let to_boundary = PAGE_SIZE - (address % PAGE_SIZE as u64) as usize;
        let buffer_len = buffer.len();
        let page = &mut buffer[done..done + to_boundary.min(buffer_len - done)];

        device.seek(SeekFrom::Start(address))?;
        match read_page(device, page) {
            Ok(()) => good_pages += 1,
            Err(e) => {
                logger.debug(format_args!("Padding unreadable page at {address:#x}: {e}"));
                page.fill(0);
            }
        }
        done += page.len();
    }
    Ok(good_pages)
}

impl<D: DeviceHandle> AcquisitionEngine<D> {
    /// Takes ownership of an opened driver handle and queries its memory
    /// layout. The handle is closed if the query fails.
    pub fn new(mut device: D, logger: Arc<dyn Logger>) -> Result<Self> {
        let info = match query_info(&mut device) {
            Ok(info) => info,
            Err(e) => {
                device.close().ok();
                return Err(Error::Open(Box::new(e)));
            }
        };

        Ok(Self {
            state: Mutex::new(EngineState {
                device: Some(device),
                resolver: RunResolver::new(info.ranges.clone()),
                mode: None,
            }),
            info,
            sparse_output: AtomicBool::new(false),
            logger,
        })
    }

    fn lock(&self) -> MutexGuard<'_, EngineState<D>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// The mode last accepted by the driver, if any.
    pub fn mode(&self) -> Option<AcquisitionMode> {
        self.lock().mode
    }

    pub fn set_mode(&self, mode: AcquisitionMode) -> Result<()> {
        let mut state = self.lock();
        state
            .device()?
            .control(IOCTL_SET_MODE, &mode.to_le_bytes(), &mut [])
            .map_err(|source| Error::Ioctl {
                code: IOCTL_SET_MODE,
                source,
            })?;
        state.mode = Some(mode);
        Ok(())
    }

    /// Leave gaps as holes in seekable sinks instead of writing zeroes.
    pub fn set_sparse(&self, sparse: bool) {
        self.sparse_output.store(sparse, Ordering::SeqCst);
    }

    pub fn is_sparse(&self) -> bool {
        self.sparse_output.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().device.is_none()
    }

    /// Releases the driver handle. Later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        let device = self.lock().device.take();
        if let Some(mut device) = device {
            device.close()?;
        }
        Ok(())
    }

    /// Fills `buf` with physical memory starting at `offset`.
    ///
    /// Gaps between ranges read as zeroes without touching the device. The
    /// result is short only when the read runs past the last range.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut state = self.lock();
        state.device()?;

        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_run(&mut state, &mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Reads at most up to the end of the run containing `offset`.
    fn read_run(&self, state: &mut EngineState<D>, buf: &mut [u8], offset: u64) -> Result<usize> {
        let run = state.resolver.resolve(offset);
        if run.is_eof() {
            return Ok(0);
        }

        let to_read = (run.end() - offset).min(buf.len() as u64) as usize;
        let buf = &mut buf[..to_read];
        if run.sparse {
            buf.fill(0);
            return Ok(to_read);
        }

        let device = state.device()?;
        device.seek(SeekFrom::Start(offset))?;
        match device.read(buf) {
            Ok(n) if n > 0 => Ok(n),
            failed => {
                if let Err(e) = failed {
                    self.logger.debug(format_args!(
                        "Read of {to_read:#x} bytes at {offset:#x} failed ({e}), retrying by page"
                    ));
                }
                read_pages(device, buf, offset, &*self.logger)?;
                Ok(to_read)
            }
        }
    }

    /// A `Read + Seek` view of physical memory backed by [`Self::read_at`].
    pub fn reader(&self) -> ImageReader<'_, D> {
        ImageReader {
            engine: self,
            position: 0,
        }
    }

    /// Writes `size` zero bytes of gap to `sink`, or skips over them when
    /// sparse output is on and the sink can seek.
    pub fn pad<W: OutputSink + ?Sized>(
        &self,
        size: u64,
        sink: &mut W,
        running: &AtomicBool,
    ) -> Result<()> {
        if self.is_sparse() && sink.skip(size)? {
            self.logger.progress(size / PAGE_SIZE as u64);
            return Ok(());
        }

        let zeroes = vec![0u8; size.min(BUFFER_SIZE as u64) as usize];
        let mut written = 0u64;
        while written < size {
            let to_write = (size - written).min(zeroes.len() as u64) as usize;
            sink.write_all(&zeroes[..to_write])?;
            self.logger.progress((to_write / PAGE_SIZE) as u64);
            written += to_write as u64;

            check_running(running)?;
        }
        Ok(())
    }

    /// Copies `size` bytes of physical memory from `base` into `sink`.
    ///
    /// Each bulk chunk that the driver refuses is retried page by page, and
    /// pages that still fail are written as zeroes. A short bulk read writes
    /// only what the driver returned and continues from there.
    ///
    /// # Arguments
    ///
    /// * `base` - Physical address of the first byte, page aligned.
    /// * `size` - Number of bytes to copy, a multiple of the page size.
    /// * `sink` - Receives the bytes in address order.
    /// * `running` - Checked after every chunk. Clearing it stops the copy
    ///   with the chunks written so far left in `sink`.
    ///
    /// # Errors
    ///
    /// This function will return an error if:
    /// - The engine has been closed.
    /// - The device cannot seek to a chunk.
    /// - Writing to `sink` fails.
    /// - The operation is cancelled through `running`.
    pub fn copy_range<W: OutputSink + ?Sized>(
        &self,
        base: u64,
        size: u64,
        sink: &mut W,
        running: &AtomicBool,
    ) -> Result<()> {
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let end = base.saturating_add(size);
        let mut offset = base;

        while offset < end {
            let to_read = (end - offset).min(BUFFER_SIZE as u64) as usize;
            self.logger
                .debug(format_args!("Reading {to_read:#x} from {offset:#x}"));

            let chunk = &mut buffer[..to_read];
            let (produced, pages) = {
                let mut state = self.lock();
                let device = state.device()?;
                device.seek(SeekFrom::Start(offset))?;
                match device.read(chunk) {
                    Ok(n) if n > 0 => (n, (n / PAGE_SIZE) as u64),
                    failed => {
                        if let Err(e) = failed {
                            self.logger.debug(format_args!(
                                "Bulk read at {offset:#x} failed ({e}), retrying by page"
                            ));
                        }
                        let good_pages = read_pages(device, chunk, offset, &*self.logger)?;
                        (to_read, good_pages)
                    }
                }
            };

            sink.write_all(&buffer[..produced])?;
            self.logger.progress(pages);
            offset += produced as u64;

            check_running(running)?;
        }
        Ok(())
    }

    /// Streams a full image into `sink`: every reported range in order, with
    /// the gaps before each range padded. Nothing is written past the end of
    /// the last range.
    ///
    /// # Arguments
    ///
    /// * `sink` - Receives the image. Gaps become holes when sparse output is
    ///   on and the sink can skip.
    /// * `running` - Checked before every range and after every chunk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] once `running` is cleared, leaving every
    /// byte produced so far in `sink`. Device and sink failures are
    /// propagated as in [`Self::copy_range`]; unreadable pages are not
    /// errors.
    pub fn sequential_dump<W: OutputSink + ?Sized>(
        &self,
        sink: &mut W,
        running: &AtomicBool,
    ) -> Result<()> {
        let mut offset = 0u64;
        for range in &self.info.ranges {
            check_running(running)?;

            if offset < range.base_address {
                let pad_size = range.base_address - offset;
                self.logger.info(format_args!(
                    "Padding {} pages from {:#x}",
                    pad_size / PAGE_SIZE as u64,
                    offset
                ));
                self.pad(pad_size, sink, running)?;
                offset = range.base_address;
            }

            self.logger.info(format_args!(
                "Copying {} pages ({:#x}) from {:#x}",
                range.length_bytes / PAGE_SIZE as u64,
                range.length_bytes,
                offset
            ));
            self.copy_range(range.base_address, range.length_bytes, sink, running)?;
            offset = range.end();
        }
        Ok(())
    }
}

impl<D: DeviceHandle> Drop for AcquisitionEngine<D> {
    fn drop(&mut self) {
        self.close().ok();
    }
}

/// Cursor over physical memory. Reads past the last range return 0.
pub struct ImageReader<'a, D: DeviceHandle> {
    engine: &'a AcquisitionEngine<D>,
    position: u64,
}

impl<D: DeviceHandle> Read for ImageReader<'_, D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self
            .engine
            .read_at(buf, self.position)
            .map_err(|e| match e {
                Error::Io(e) => e,
                other => io::Error::new(io::ErrorKind::Other, other),
            })?;
        self.position += n as u64;
        Ok(n)
    }
}

impl<D: DeviceHandle> Seek for ImageReader<'_, D> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.engine.info.image_size().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        self.position = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of image")
        })?;
        Ok(self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::{MemoryRange, RawMemoryInfo};
    use crate::logger::SilentLogger;
    use std::io::Cursor;

    /// Flat memory that never fails.
    struct FlatDevice {
        memory: Cursor<Vec<u8>>,
        info: Vec<u8>,
    }

    impl Read for FlatDevice {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.memory.read(buf)
        }
    }

    impl Seek for FlatDevice {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.memory.seek(pos)
        }
    }

    impl DeviceHandle for FlatDevice {
        fn control(&mut self, code: u32, _input: &[u8], output: &mut [u8]) -> io::Result<usize> {
            if code == IOCTL_GET_INFO {
                output[..self.info.len()].copy_from_slice(&self.info);
                Ok(self.info.len())
            } else {
                Ok(0)
            }
        }
    }

    fn engine(ranges: &[(u64, u64)]) -> AcquisitionEngine<FlatDevice> {
        let mut raw = RawMemoryInfo {
            number_of_runs: ranges.len() as u64,
            ..Default::default()
        };
        for (slot, &(base, len)) in ranges.iter().enumerate() {
            raw.runs[slot] = MemoryRange::new(base, len);
        }
        let size = ranges.last().map_or(0, |&(base, len)| base + len) as usize;
        let memory = (0..size).map(|i| (i / PAGE_SIZE) as u8 | 0x80).collect();
        let device = FlatDevice {
            memory: Cursor::new(memory),
            info: raw.to_bytes(),
        };
        AcquisitionEngine::new(device, Arc::new(SilentLogger)).unwrap()
    }

    #[test]
    fn pad_writes_zeroes_when_not_sparse() {
        let engine = engine(&[(0x1000, 0x1000)]);
        let mut sink = Cursor::new(Vec::new());
        engine
            .pad(0x3000, &mut sink, &AtomicBool::new(true))
            .unwrap();
        assert_eq!(sink.into_inner(), vec![0u8; 0x3000]);
    }

    #[test]
    fn pad_skips_when_sparse_and_seekable() {
        let engine = engine(&[(0x1000, 0x1000)]);
        engine.set_sparse(true);
        let mut sink = Cursor::new(Vec::new());
        engine
            .pad(0x3000, &mut sink, &AtomicBool::new(true))
            .unwrap();
        assert_eq!(sink.position(), 0x3000);
        assert!(sink.into_inner().is_empty());
    }

    #[test]
    fn pad_falls_back_to_zeroes_for_unseekable_sinks() {
        let engine = engine(&[(0x1000, 0x1000)]);
        engine.set_sparse(true);
        let mut sink = Vec::new();
        engine.pad(0x2000, &mut sink, &AtomicBool::new(true)).unwrap();
        assert_eq!(sink.len(), 0x2000);
    }

    #[test]
    fn image_reader_seeks_and_reads() {
        let engine = engine(&[(0x1000, 0x2000)]);
        let mut reader = engine.reader();
        assert_eq!(reader.seek(SeekFrom::End(-16)).unwrap(), 0x2ff0);
        let mut tail = Vec::new();
        reader.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, vec![0x82u8; 16]);
        assert!(reader.seek(SeekFrom::Current(-0x4000)).is_err());
    }

    #[test]
    fn read_at_crosses_from_gap_into_range() {
        let engine = engine(&[(0x1000, 0x1000)]);
        let mut buf = vec![0xffu8; 0x100];
        assert_eq!(engine.read_at(&mut buf, 0xf80).unwrap(), 0x100);
        assert!(buf[..0x80].iter().all(|&b| b == 0));
        assert!(buf[0x80..].iter().all(|&b| b == 0x81));
    }
}
