//! Compression of acquired images and sniffing of compressed ones.
//!
//! Images can be stored raw or wrapped in one of three streaming formats:
//! S2 and Snappy framed streams, and gzip. Writers are picked by name;
//! readers are picked by the magic bytes at the start of the file, so an
//! image can always be decompressed without knowing how it was written.
use crate::error::{Error, Result};
use crate::logger::Logger;
use crate::s2::{S2Reader, S2Writer};
use crate::sink::OutputSink;
use crate::{BUFFER_SIZE, PAGE_SIZE};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

pub const SNAPPY_MAGIC: &[u8] = &[0xff, 0x06, 0x00, 0x00, 0x73, 0x4e, 0x61, 0x50, 0x70, 0x59];
pub const S2_MAGIC: &[u8] = &[0xff, 0x06, 0x00, 0x00, 0x53, 0x32, 0x73, 0x54, 0x77, 0x4f];
pub const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b, 0x08];

/// Bytes needed to sniff any supported format.
pub const HEADER_LEN: usize = 10;

/// Every name accepted by [`CodecKind::from_name`].
pub const VALID_NAMES: &[&str] = &["none", "stored", "s2", "snappy", "gzip", "gz"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecKind {
    Stored,
    S2,
    Snappy,
    Gzip,
}

impl CodecKind {
    /// Looks a codec up by case-insensitive name. The empty name means
    /// stored.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "" | "stored" | "none" => Ok(CodecKind::Stored),
            "s2" => Ok(CodecKind::S2),
            "snappy" => Ok(CodecKind::Snappy),
            "gzip" | "gz" => Ok(CodecKind::Gzip),
            _ => Err(Error::UnsupportedCodec {
                name: name.to_string(),
            }),
        }
    }

    pub fn magic(self) -> Option<&'static [u8]> {
        match self {
            CodecKind::Stored => None,
            CodecKind::S2 => Some(S2_MAGIC),
            CodecKind::Snappy => Some(SNAPPY_MAGIC),
            CodecKind::Gzip => Some(GZIP_MAGIC),
        }
    }

    /// Identifies a compressed stream from its first bytes.
    pub fn sniff(header: &[u8]) -> Option<Self> {
        [CodecKind::S2, CodecKind::Snappy, CodecKind::Gzip]
            .into_iter()
            .find(|kind| kind.magic().is_some_and(|magic| header.starts_with(magic)))
    }

    pub fn is_compressed(self) -> bool {
        self != CodecKind::Stored
    }
}

impl FromStr for CodecKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        CodecKind::from_name(s)
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CodecKind::Stored => "none",
            CodecKind::S2 => "s2",
            CodecKind::Snappy => "snappy",
            CodecKind::Gzip => "gzip",
        };
        f.write_str(name)
    }
}

/// A sink wrapped in the selected compression format.
///
/// [`Compressor::finish`] must be called once writing is done: it flushes
/// buffered data, writes the format trailer and hands back the sink.
pub enum Compressor<W: Write> {
    Stored(W),
    S2(S2Writer<W>),
    Snappy(snap::write::FrameEncoder<W>),
    Gzip(GzEncoder<W>),
}

impl<W: Write> Compressor<W> {
    pub fn new(kind: CodecKind, sink: W) -> Self {
        match kind {
            CodecKind::Stored => Compressor::Stored(sink),
            CodecKind::S2 => Compressor::S2(S2Writer::new(sink)),
            CodecKind::Snappy => Compressor::Snappy(snap::write::FrameEncoder::new(sink)),
            CodecKind::Gzip => Compressor::Gzip(GzEncoder::new(sink, Compression::fast())),
        }
    }

    pub fn kind(&self) -> CodecKind {
        match self {
            Compressor::Stored(_) => CodecKind::Stored,
            Compressor::S2(_) => CodecKind::S2,
            Compressor::Snappy(_) => CodecKind::Snappy,
            Compressor::Gzip(_) => CodecKind::Gzip,
        }
    }

    pub fn finish(self) -> io::Result<W> {
        match self {
            Compressor::Stored(mut sink) => {
                sink.flush()?;
                Ok(sink)
            }
            Compressor::S2(writer) => writer.finish(),
            Compressor::Snappy(writer) => writer
                .into_inner()
                .map_err(|e| io::Error::new(e.error().kind(), e.error().to_string())),
            Compressor::Gzip(writer) => writer.finish(),
        }
    }
}

impl<W: Write> Write for Compressor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Compressor::Stored(sink) => sink.write(buf),
            Compressor::S2(writer) => writer.write(buf),
            Compressor::Snappy(writer) => writer.write(buf),
            Compressor::Gzip(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Compressor::Stored(sink) => sink.flush(),
            Compressor::S2(writer) => writer.flush(),
            Compressor::Snappy(writer) => writer.flush(),
            Compressor::Gzip(writer) => writer.flush(),
        }
    }
}

/// Only stored output can leave holes; compressed streams have no notion of
/// position.
impl<W: OutputSink> OutputSink for Compressor<W> {
    fn skip(&mut self, len: u64) -> io::Result<bool> {
        match self {
            Compressor::Stored(sink) => sink.skip(len),
            _ => Ok(false),
        }
    }
}

/// Wraps `sink` in the compressor called `name`.
///
/// # Arguments
///
/// * `name` - One of [`VALID_NAMES`], matched case-insensitively. The empty
///   name selects stored output.
/// * `sink` - Receives the compressed stream.
///
/// # Errors
///
/// Returns [`Error::UnsupportedCodec`] naming `name` and listing the valid
/// choices if the name is not recognized.
pub fn select_compressor<W: Write>(name: &str, sink: W) -> Result<Compressor<W>> {
    Ok(Compressor::new(CodecKind::from_name(name)?, sink))
}

/// A source wrapped in the decompressor matching its magic bytes.
pub enum Decompressor<R: Read> {
    S2(S2Reader<R>),
    Snappy(snap::read::FrameDecoder<R>),
    Gzip(MultiGzDecoder<R>),
}

impl<R: Read> Decompressor<R> {
    pub fn kind(&self) -> CodecKind {
        match self {
            Decompressor::S2(_) => CodecKind::S2,
            Decompressor::Snappy(_) => CodecKind::Snappy,
            Decompressor::Gzip(_) => CodecKind::Gzip,
        }
    }
}

impl<R: Read> Read for Decompressor<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Decompressor::S2(reader) => reader.read(buf),
            Decompressor::Snappy(reader) => reader.read(buf),
            Decompressor::Gzip(reader) => reader.read(buf),
        }
    }
}

/// Picks a decompressor for `source` from `header`, the first bytes of the
/// stream. `source` must still be positioned at the start of the stream.
pub fn select_decompressor<R: Read>(header: &[u8], source: R) -> Result<Decompressor<R>> {
    match CodecKind::sniff(header) {
        Some(CodecKind::S2) => Ok(Decompressor::S2(S2Reader::new(source))),
        Some(CodecKind::Snappy) => Ok(Decompressor::Snappy(snap::read::FrameDecoder::new(source))),
        Some(CodecKind::Gzip) => Ok(Decompressor::Gzip(MultiGzDecoder::new(source))),
        Some(CodecKind::Stored) | None => Err(Error::UnknownFormat),
    }
}

/// Copies `source` into `sink` in 4 MiB chunks, reporting pages to `logger`
/// and stopping between chunks if `running` is cleared. Returns the number
/// of bytes copied.
pub fn copy_with_progress<R, W>(
    source: &mut R,
    sink: &mut W,
    running: &AtomicBool,
    logger: &dyn Logger,
) -> Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut total: u64 = 0;

    loop {
        let n = match source.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };

        sink.write_all(&buffer[..n])?;
        let page = PAGE_SIZE as u64;
        logger.progress((total + n as u64) / page - total / page);
        total += n as u64;

        if !running.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
    }

    sink.flush()?;
    Ok(total)
}
