//! Test doubles shared by the integration tests.
#![allow(dead_code)]

use memetch_core::info::{MemoryRange, RawMemoryInfo};
use memetch_core::ioctl::{IOCTL_GET_INFO, IOCTL_SET_MODE};
use memetch_core::{DeviceHandle, Logger, PAGE_SIZE};
use std::collections::HashSet;
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// The byte the mock device holds at physical address `address`.
pub fn pattern(address: u64) -> u8 {
    ((address / PAGE_SIZE as u64) as u8).wrapping_mul(31) ^ (address as u8) | 1
}

/// Everything the engine asked of a [`MockDevice`].
#[derive(Debug, Default)]
pub struct DeviceLog {
    /// `(offset, len)` of every read attempt, failed ones included.
    pub reads: Vec<(u64, usize)>,
    /// `(code, input)` of every control request.
    pub controls: Vec<(u32, Vec<u8>)>,
    pub closes: usize,
}

impl DeviceLog {
    pub fn page_reads(&self) -> usize {
        self.reads.iter().filter(|(_, len)| *len <= PAGE_SIZE).count()
    }
}

/// Physical memory simulated by a flat buffer, with pages that refuse to be
/// read.
pub struct MockDevice {
    memory_size: u64,
    info: Vec<u8>,
    position: u64,
    bad_pages: HashSet<u64>,
    fail_bulk: bool,
    max_read: usize,
    fail_get_info: bool,
    reject_set_mode: bool,
    log: Arc<Mutex<DeviceLog>>,
}

impl MockDevice {
    pub fn new(ranges: &[(u64, u64)]) -> Self {
        let mut raw = RawMemoryInfo {
            cr3: 0x1ad000,
            nt_build_number: 0xf000_4a61,
            kernel_base: 0xfffff806_2a000000,
            number_of_runs: ranges.len() as u64,
            ..Default::default()
        };
        raw.kpcr[0] = 0xfffff806_27b6c000;
        for (slot, &(base, len)) in ranges.iter().enumerate() {
            raw.runs[slot] = MemoryRange::new(base, len);
        }
        Self::with_info(raw)
    }

    pub fn with_info(raw: RawMemoryInfo) -> Self {
        let memory_size = raw.clone().into_info().image_size();
        Self {
            memory_size,
            info: raw.to_bytes(),
            position: 0,
            bad_pages: HashSet::new(),
            fail_bulk: false,
            max_read: usize::MAX,
            fail_get_info: false,
            reject_set_mode: false,
            log: Arc::new(Mutex::new(DeviceLog::default())),
        }
    }

    /// Makes the page containing `address` unreadable.
    pub fn bad_page(mut self, address: u64) -> Self {
        self.bad_pages.insert(address / PAGE_SIZE as u64);
        self
    }

    /// Makes every read larger than one page fail.
    pub fn fail_bulk(mut self) -> Self {
        self.fail_bulk = true;
        self
    }

    /// Makes every read return at most `limit` bytes.
    pub fn max_read(mut self, limit: usize) -> Self {
        self.max_read = limit;
        self
    }

    pub fn fail_get_info(mut self) -> Self {
        self.fail_get_info = true;
        self
    }

    pub fn reject_set_mode(mut self) -> Self {
        self.reject_set_mode = true;
        self
    }

    pub fn log(&self) -> Arc<Mutex<DeviceLog>> {
        self.log.clone()
    }

    fn spans_bad_page(&self, offset: u64, len: usize) -> bool {
        let first = offset / PAGE_SIZE as u64;
        let last = (offset + len as u64 - 1) / PAGE_SIZE as u64;
        (first..=last).any(|page| self.bad_pages.contains(&page))
    }
}

impl Read for MockDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let offset = self.position;
        self.log.lock().unwrap().reads.push((offset, buf.len()));
        if buf.is_empty() {
            return Ok(0);
        }

        let refused = (self.fail_bulk && buf.len() > PAGE_SIZE) || self.spans_bad_page(offset, buf.len());
        if refused {
            return Err(io::Error::new(io::ErrorKind::Other, "page not mapped"));
        }

        let wanted = buf.len().min(self.max_read) as u64;
        let available = self.memory_size.saturating_sub(offset).min(wanted) as usize;
        for (i, byte) in buf[..available].iter_mut().enumerate() {
            *byte = pattern(offset + i as u64);
        }
        self.position += available as u64;
        Ok(available)
    }
}

impl Seek for MockDevice {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match pos {
            SeekFrom::Start(offset) => self.position = offset,
            _ => return Err(io::Error::new(io::ErrorKind::Unsupported, "absolute seeks only")),
        }
        Ok(self.position)
    }
}

impl DeviceHandle for MockDevice {
    fn control(&mut self, code: u32, input: &[u8], output: &mut [u8]) -> io::Result<usize> {
        self.log.lock().unwrap().controls.push((code, input.to_vec()));
        match code {
            IOCTL_GET_INFO if self.fail_get_info => Err(io::Error::from_raw_os_error(5)),
            IOCTL_GET_INFO => {
                output[..self.info.len()].copy_from_slice(&self.info);
                Ok(self.info.len())
            }
            IOCTL_SET_MODE if self.reject_set_mode => {
                Err(io::Error::new(io::ErrorKind::InvalidInput, "mode not supported"))
            }
            _ => Ok(0),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        self.log.lock().unwrap().closes += 1;
        Ok(())
    }
}

/// Logger double that records every call.
#[derive(Default)]
pub struct RecordingLogger {
    pub infos: Mutex<Vec<String>>,
    pub debugs: Mutex<Vec<String>>,
    pub pages: Mutex<u64>,
    pub granularity: Mutex<Option<u64>>,
}

impl RecordingLogger {
    pub fn total_pages(&self) -> u64 {
        *self.pages.lock().unwrap()
    }
}

impl Logger for RecordingLogger {
    fn info(&self, message: fmt::Arguments<'_>) {
        self.infos.lock().unwrap().push(message.to_string());
    }

    fn debug(&self, message: fmt::Arguments<'_>) {
        self.debugs.lock().unwrap().push(message.to_string());
    }

    fn progress(&self, pages: u64) {
        *self.pages.lock().unwrap() += pages;
    }

    fn set_progress_granularity(&self, pages_per_tick: u64) {
        *self.granularity.lock().unwrap() = Some(pages_per_tick);
    }
}

/// Forwards to `inner` and clears `running` once `trip_after` bytes have
/// passed through.
pub struct TrippingSink<W> {
    pub inner: W,
    written: usize,
    running: Arc<AtomicBool>,
    trip_after: usize,
}

impl<W> TrippingSink<W> {
    pub fn new(inner: W, running: Arc<AtomicBool>, trip_after: usize) -> Self {
        Self {
            inner,
            written: 0,
            running,
            trip_after,
        }
    }
}

impl<W: Write> Write for TrippingSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n;
        if self.written >= self.trip_after {
            self.running.store(false, Ordering::SeqCst);
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: memetch_core::OutputSink> memetch_core::OutputSink for TrippingSink<W> {}

/// A sink whose writes always fail.
pub struct BrokenSink;

impl Write for BrokenSink {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "disk full"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl memetch_core::OutputSink for BrokenSink {}
