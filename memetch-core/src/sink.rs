//! Output sinks for acquired images.
//!
//! A sink is any [`Write`], optionally able to skip forward without writing.
//! Skipping leaves a hole in a sparse file instead of allocating zero blocks.

use std::fs::File;
use std::io::{self, Cursor, Seek, SeekFrom, Write};

pub trait OutputSink: Write {
    /// Advances the write position by `len` bytes without writing.
    ///
    /// Returns `Ok(false)` when the sink cannot skip; nothing is changed in
    /// that case and the caller must write zeroes instead.
    fn skip(&mut self, len: u64) -> io::Result<bool> {
        let _ = len;
        Ok(false)
    }
}

fn seek_forward<S: Seek>(seeker: &mut S, len: u64) -> io::Result<bool> {
    let len = i64::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "hole too large"))?;
    seeker.seek(SeekFrom::Current(len))?;
    Ok(true)
}

impl OutputSink for File {
    fn skip(&mut self, len: u64) -> io::Result<bool> {
        seek_forward(self, len)
    }
}

impl OutputSink for Cursor<Vec<u8>> {
    fn skip(&mut self, len: u64) -> io::Result<bool> {
        seek_forward(self, len)
    }
}

impl OutputSink for Cursor<&mut Vec<u8>> {
    fn skip(&mut self, len: u64) -> io::Result<bool> {
        seek_forward(self, len)
    }
}

impl OutputSink for Vec<u8> {}

impl OutputSink for io::Sink {}

impl<S: OutputSink + ?Sized> OutputSink for &mut S {
    fn skip(&mut self, len: u64) -> io::Result<bool> {
        (**self).skip(len)
    }
}

impl<S: OutputSink + ?Sized> OutputSink for Box<S> {
    fn skip(&mut self, len: u64) -> io::Result<bool> {
        (**self).skip(len)
    }
}
