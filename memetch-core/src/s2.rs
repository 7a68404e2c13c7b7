//! S2 framed streams.
//!
//! S2 extends the Snappy framing format with larger blocks and a richer block
//! encoding (repeat-offset copies). Frames start with the stream identifier
//! `FF 06 00 00 "S2sTwO"` and carry chunks of the form
//! `type:u8 | length:u24le | masked crc32c:u32le | payload`.
//!
//! The writer emits Snappy-encoded blocks, which every S2 decoder accepts. The
//! reader decodes the full S2 block format and so also reads Snappy frames.

use snap::raw::{max_compress_len, Encoder};
use std::io::{self, Read, Write};

pub const STREAM_IDENTIFIER: &[u8] = b"\xff\x06\x00\x00S2sTwO";
const S2_BODY: &[u8] = b"S2sTwO";
const SNAPPY_BODY: &[u8] = b"sNaPpY";

const CHUNK_COMPRESSED: u8 = 0x00;
const CHUNK_UNCOMPRESSED: u8 = 0x01;
const CHUNK_STREAM_IDENTIFIER: u8 = 0xff;

/// Uncompressed bytes per block produced by the writer.
const BLOCK_SIZE: usize = 1 << 20;
/// Largest block the format allows.
const MAX_BLOCK_SIZE: usize = 4 << 20;
const CHECKSUM_SIZE: usize = 4;

fn masked_crc(data: &[u8]) -> u32 {
    let crc = crc32c::crc32c(data);
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn corrupt(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("s2: corrupt stream: {message}"))
}

fn finished() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "s2: writer already finished")
}

/// Compressing S2 stream writer. Call [`S2Writer::finish`] to flush the last
/// block; dropping the writer flushes it on a best-effort basis.
pub struct S2Writer<W: Write> {
    // Taken by `finish`.
    inner: Option<W>,
    buffer: Vec<u8>,
    compressed: Vec<u8>,
    encoder: Encoder,
    wrote_identifier: bool,
}

impl<W: Write> S2Writer<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: Some(inner),
            buffer: Vec::with_capacity(BLOCK_SIZE),
            compressed: Vec::new(),
            encoder: Encoder::new(),
            wrote_identifier: false,
        }
    }

    fn flush_block(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let inner = self.inner.as_mut().ok_or_else(finished)?;
        if !self.wrote_identifier {
            inner.write_all(STREAM_IDENTIFIER)?;
            self.wrote_identifier = true;
        }

        let checksum = masked_crc(&self.buffer);
        self.compressed.resize(max_compress_len(self.buffer.len()), 0);
        let n = self
            .encoder
            .compress(&self.buffer, &mut self.compressed)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        let (chunk_type, payload) = if n < self.buffer.len() {
            (CHUNK_COMPRESSED, &self.compressed[..n])
        } else {
            (CHUNK_UNCOMPRESSED, &self.buffer[..])
        };

        let chunk_len = (payload.len() + CHECKSUM_SIZE) as u32;
        let len = chunk_len.to_le_bytes();
        inner.write_all(&[chunk_type, len[0], len[1], len[2]])?;
        inner.write_all(&checksum.to_le_bytes())?;
        inner.write_all(payload)?;

        self.buffer.clear();
        Ok(())
    }

    /// Writes any buffered block and returns the inner writer. An empty
    /// stream still gets its identifier.
    pub fn finish(mut self) -> io::Result<W> {
        self.flush_block()?;
        let mut inner = self.inner.take().ok_or_else(finished)?;
        if !self.wrote_identifier {
            inner.write_all(STREAM_IDENTIFIER)?;
        }
        inner.flush()?;
        Ok(inner)
    }
}

impl<W: Write> Write for S2Writer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while !rest.is_empty() {
            let room = BLOCK_SIZE - self.buffer.len();
            let take = room.min(rest.len());
            self.buffer.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.buffer.len() == BLOCK_SIZE {
                self.flush_block()?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_block()?;
        self.inner.as_mut().ok_or_else(finished)?.flush()
    }
}

impl<W: Write> Drop for S2Writer<W> {
    fn drop(&mut self) {
        if self.inner.is_some() {
            self.flush().ok();
        }
    }
}

/// Decompressing S2 stream reader.
pub struct S2Reader<R: Read> {
    inner: R,
    chunk: Vec<u8>,
    decoded: Vec<u8>,
    pos: usize,
    seen_identifier: bool,
}

/// Fills `buf` completely. Returns `false` on a clean EOF before the first
/// byte; an EOF part way through is corruption.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(corrupt("truncated chunk")),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

impl<R: Read> S2Reader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            chunk: Vec::new(),
            decoded: Vec::new(),
            pos: 0,
            seen_identifier: false,
        }
    }

    /// Loads the next data chunk into `decoded`. Returns `false` at EOF.
    fn next_chunk(&mut self) -> io::Result<bool> {
        loop {
            let mut header = [0u8; 4];
            if !read_full(&mut self.inner, &mut header)? {
                return Ok(false);
            }
            let chunk_type = header[0];
            let len = u32::from_le_bytes([header[1], header[2], header[3], 0]) as usize;
            if len > max_compress_len(MAX_BLOCK_SIZE) + CHECKSUM_SIZE {
                return Err(corrupt("chunk too large"));
            }

            self.chunk.resize(len, 0);
            if !read_full(&mut self.inner, &mut self.chunk)? && len > 0 {
                return Err(corrupt("truncated chunk"));
            }

            match chunk_type {
                CHUNK_STREAM_IDENTIFIER => {
                    if self.chunk != S2_BODY && self.chunk != SNAPPY_BODY {
                        return Err(corrupt("bad stream identifier"));
                    }
                    self.seen_identifier = true;
                }
                CHUNK_COMPRESSED | CHUNK_UNCOMPRESSED => {
                    if !self.seen_identifier {
                        return Err(corrupt("missing stream identifier"));
                    }
                    if len < CHECKSUM_SIZE {
                        return Err(corrupt("chunk too short"));
                    }
                    let checksum = u32::from_le_bytes([
                        self.chunk[0],
                        self.chunk[1],
                        self.chunk[2],
                        self.chunk[3],
                    ]);
                    let payload = &self.chunk[CHECKSUM_SIZE..];
                    if chunk_type == CHUNK_COMPRESSED {
                        decode_block(payload, &mut self.decoded)?;
                    } else {
                        if payload.len() > MAX_BLOCK_SIZE {
                            return Err(corrupt("block too large"));
                        }
                        self.decoded.clear();
                        self.decoded.extend_from_slice(payload);
                    }
                    if masked_crc(&self.decoded) != checksum {
                        return Err(corrupt("checksum mismatch"));
                    }
                    self.pos = 0;
                    return Ok(true);
                }
                0x02..=0x7f => {
                    return Err(corrupt("unsupported unskippable chunk"));
                }
                // Padding and other skippable chunks.
                _ => {}
            }
        }
    }
}

impl<R: Read> Read for S2Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.decoded.len() {
                let n = buf.len().min(self.decoded.len() - self.pos);
                buf[..n].copy_from_slice(&self.decoded[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if buf.is_empty() || !self.next_chunk()? {
                return Ok(0);
            }
        }
    }
}

fn read_uvarint(src: &[u8]) -> io::Result<(usize, usize)> {
    let mut value = 0usize;
    for (i, &byte) in src.iter().take(5).enumerate() {
        value |= ((byte & 0x7f) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(corrupt("bad block length"))
}

fn le_value(bytes: &[u8]) -> usize {
    bytes
        .iter()
        .rev()
        .fold(0usize, |acc, &byte| (acc << 8) | byte as usize)
}

/// Decodes one S2 (or Snappy) block into `dst`, replacing its contents.
pub fn decode_block(src: &[u8], dst: &mut Vec<u8>) -> io::Result<()> {
    let (len, mut s) = read_uvarint(src)?;
    if len > MAX_BLOCK_SIZE {
        return Err(corrupt("block too large"));
    }
    dst.clear();
    dst.reserve(len);

    let need = |s: usize, n: usize| {
        if s + n <= src.len() {
            Ok(())
        } else {
            Err(corrupt("truncated block"))
        }
    };

    let mut offset = 0usize;
    while s < src.len() {
        let tag = src[s];
        let length;
        match tag & 0x03 {
            0x00 => {
                let x = (tag >> 2) as usize;
                let literal_len = if x < 60 {
                    s += 1;
                    x + 1
                } else {
                    let extra = x - 59;
                    need(s, 1 + extra)?;
                    let value = le_value(&src[s + 1..s + 1 + extra]);
                    s += 1 + extra;
                    value + 1
                };
                need(s, literal_len)?;
                if dst.len() + literal_len > len {
                    return Err(corrupt("literal overruns block"));
                }
                dst.extend_from_slice(&src[s..s + literal_len]);
                s += literal_len;
                continue;
            }
            0x01 => {
                need(s, 2)?;
                let code = ((tag >> 2) & 0x07) as usize;
                let copy_offset = ((tag as usize & 0xe0) << 3) | src[s + 1] as usize;
                s += 2;
                let base = if copy_offset == 0 {
                    // Repeat the previous offset.
                    match code {
                        5 => {
                            need(s, 1)?;
                            s += 1;
                            src[s - 1] as usize + 4
                        }
                        6 => {
                            need(s, 2)?;
                            s += 2;
                            le_value(&src[s - 2..s]) + (1 << 8)
                        }
                        7 => {
                            need(s, 3)?;
                            s += 3;
                            le_value(&src[s - 3..s]) + (1 << 16)
                        }
                        code => code,
                    }
                } else {
                    offset = copy_offset;
                    code
                };
                length = base + 4;
            }
            0x02 => {
                need(s, 3)?;
                length = 1 + (tag >> 2) as usize;
                offset = le_value(&src[s + 1..s + 3]);
                s += 3;
            }
            _ => {
                need(s, 5)?;
                length = 1 + (tag >> 2) as usize;
                offset = le_value(&src[s + 1..s + 5]);
                s += 5;
            }
        }

        if offset == 0 || offset > dst.len() || dst.len() + length > len {
            return Err(corrupt("bad copy"));
        }
        let start = dst.len() - offset;
        if offset >= length {
            dst.extend_from_within(start..start + length);
        } else {
            for i in 0..length {
                let byte = dst[start + i];
                dst.push(byte);
            }
        }
    }

    if dst.len() != len {
        return Err(corrupt("block length mismatch"));
    }
    Ok(())
}
