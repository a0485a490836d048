//! Compression and checksum plumbing for archive streams.
//!
//! Every archive is written as `tar -> compressor -> cipher -> checksum -> file`,
//! so the recorded checksum covers the bytes exactly as stored and can be
//! checked against the file before anything is decoded.

use appkeep_core::{Error, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

/// Default compression level (6 = balanced speed/ratio).
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Checksum algorithm recorded in every Info record.
pub const CHECKSUM_ALGORITHM: &str = "sha256";

/// Compressed container format of an archive, stored as a short tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ArchiveFormat {
    /// gzip, tag `z`
    #[default]
    Gzip,
    /// zstd, tag `zst`
    Zstd,
}

impl ArchiveFormat {
    /// Parses a stored format tag.
    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "z" => Ok(Self::Gzip),
            "zst" => Ok(Self::Zstd),
            other => Err(Error::unsupported_archive_format(other)),
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::Gzip => "z",
            Self::Zstd => "zst",
        }
    }

    /// File extension of archives in this format
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Gzip => ".tar.gz",
            Self::Zstd => ".tar.zst",
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Streaming compressor for one archive.
pub enum Compressor<W: Write> {
    Gzip(GzEncoder<W>),
    Zstd(zstd::Encoder<'static, W>),
}

impl<W: Write> Compressor<W> {
    pub fn new(format: ArchiveFormat, writer: W, level: u32) -> io::Result<Self> {
        let level = level.clamp(1, 9);
        Ok(match format {
            ArchiveFormat::Gzip => Self::Gzip(GzEncoder::new(writer, Compression::new(level))),
            ArchiveFormat::Zstd => Self::Zstd(zstd::Encoder::new(writer, level as i32)?),
        })
    }

    /// Writes the trailer and hands back the inner writer.
    pub fn finish(self) -> io::Result<W> {
        match self {
            Self::Gzip(encoder) => encoder.finish(),
            Self::Zstd(encoder) => encoder.finish(),
        }
    }
}

impl<W: Write> Write for Compressor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Gzip(encoder) => encoder.write(buf),
            Self::Zstd(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Gzip(encoder) => encoder.flush(),
            Self::Zstd(encoder) => encoder.flush(),
        }
    }
}

/// Streaming decompressor for one archive.
pub enum Decompressor<R: Read> {
    Gzip(GzDecoder<R>),
    Zstd(zstd::Decoder<'static, BufReader<R>>),
}

impl<R: Read> Decompressor<R> {
    pub fn new(format: ArchiveFormat, reader: R) -> io::Result<Self> {
        Ok(match format {
            ArchiveFormat::Gzip => Self::Gzip(GzDecoder::new(reader)),
            ArchiveFormat::Zstd => Self::Zstd(zstd::Decoder::new(reader)?),
        })
    }
}

impl<R: Read> Read for Decompressor<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Gzip(decoder) => decoder.read(buf),
            Self::Zstd(decoder) => decoder.read(buf),
        }
    }
}

/// Calculates SHA256 checksum of a file.
pub fn calculate_checksum(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Writer that calculates SHA256 checksum while writing.
pub struct ChecksumWriter<W: Write> {
    writer: W,
    hasher: Sha256,
    bytes_written: u64,
}

impl<W: Write> ChecksumWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            hasher: Sha256::new(),
            bytes_written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn checksum(&self) -> String {
        format!("{:x}", self.hasher.clone().finalize())
    }

    /// Flushes and returns the inner writer with the final checksum.
    pub fn finish(mut self) -> io::Result<(W, String)> {
        self.writer.flush()?;
        let checksum = self.checksum();
        Ok((self.writer, checksum))
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes_written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}
