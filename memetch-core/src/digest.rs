//! SHA-256 of the logical image stream.
use crate::sink::OutputSink;
use sha2::{Digest, Sha256};
use std::io::{self, Write};

const ZEROES: [u8; 64 * 1024] = [0u8; 64 * 1024];

/// Hashes everything written through it, counting skipped holes as zero
/// bytes so the digest describes the full image whether or not it was
/// written sparse.
pub struct HashingSink<W> {
    inner: W,
    hasher: Sha256,
    total: u64,
}

impl<W: OutputSink> HashingSink<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            total: 0,
        }
    }

    /// Bytes of image seen so far, holes included.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Returns the inner sink and the lowercase hex digest.
    pub fn finish(self) -> (W, String) {
        (self.inner, hex::encode(self.hasher.finalize()))
    }
}

impl<W: OutputSink> Write for HashingSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.total += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: OutputSink> OutputSink for HashingSink<W> {
    fn skip(&mut self, len: u64) -> io::Result<bool> {
        if !self.inner.skip(len)? {
            return Ok(false);
        }

        let mut remaining = len;
        while remaining > 0 {
            let chunk = remaining.min(ZEROES.len() as u64) as usize;
            self.hasher.update(&ZEROES[..chunk]);
            remaining -= chunk as u64;
        }
        self.total += len;
        Ok(true)
    }
}
