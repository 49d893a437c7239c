//! Payload compression for encoded units and OTA bundles
//!
//! **Design**:
//! - Unit payloads: zlib (2-byte header + deflate + adler32), level 4 by default
//! - Bundles: 8-byte minimal gzip header + deflate body + optional CRC32/ISIZE trailer
//! - Decoding is pull-based: [`InflateStream::pull`] fills a caller buffer and
//!   returns 0 only once the compressed stream has really ended. Input that runs
//!   out before the end marker is a [`FreezeError::Decompression`].
//! - [`decompress`] inflates into memory and is meant for small payloads only.

use crate::error::{FreezeError, Result};
use flate2::write::{DeflateEncoder, ZlibEncoder};
use flate2::{Compression, Decompress, FlushDecompress, Status};
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, Read, Write};

/// Magic bytes opening a gzip stream
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Length of the minimal gzip header written by the freezer
pub const GZIP_HEADER_LEN: usize = 8;

/// Deflate compression method id in gzip headers
const GZIP_METHOD_DEFLATE: u8 = 0x08;

/// Compression level the freezer uses unless configured otherwise
pub const DEFAULT_LEVEL: u32 = 4;

/// Compression applied to unit payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    /// Payload stored as-is
    None,
    /// zlib-framed deflate
    #[default]
    Zlib,
}

/// Framing of a compressed stream handed to [`InflateStream`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// zlib header and adler32 trailer
    Zlib,
    /// Bare deflate blocks
    Deflate,
}

/// Compress data using the specified method
pub fn compress(data: &[u8], method: CompressionMethod, level: u32) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Zlib => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level));
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
    }
}

/// Decompress data fully into memory
pub fn decompress(data: &[u8], method: CompressionMethod) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Zlib => {
            let mut stream = InflateStream::new(data, Framing::Zlib);
            let mut out = Vec::new();
            let mut buf = [0u8; 512];
            loop {
                let n = stream.pull(&mut buf)?;
                if n == 0 {
                    return Ok(out);
                }
                out.extend_from_slice(&buf[..n]);
            }
        }
    }
}

/// Pull-based inflater over a buffered byte source.
///
/// Consumes exactly the compressed bytes from `inner`, so whatever follows
/// the stream (a gzip trailer, for instance) is still readable afterwards.
pub struct InflateStream<R> {
    inner: R,
    state: Decompress,
    finished: bool,
}

impl<R: BufRead> InflateStream<R> {
    pub fn new(inner: R, framing: Framing) -> Self {
        InflateStream {
            inner,
            state: Decompress::new(framing == Framing::Zlib),
            finished: false,
        }
    }

    /// Decompress into `out`; returns bytes produced, 0 at end of stream
    pub fn pull(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.finished || out.is_empty() {
            return Ok(0);
        }

        loop {
            let input = self.inner.fill_buf()?;
            let eof = input.is_empty();
            let in_before = self.state.total_in();
            let out_before = self.state.total_out();

            let status = self
                .state
                .decompress(input, out, FlushDecompress::None)
                .map_err(|e| FreezeError::decompression(e.to_string()))?;

            let consumed = (self.state.total_in() - in_before) as usize;
            let produced = (self.state.total_out() - out_before) as usize;
            self.inner.consume(consumed);

            match status {
                Status::StreamEnd => {
                    self.finished = true;
                    return Ok(produced);
                }
                Status::Ok | Status::BufError => {
                    if produced > 0 {
                        return Ok(produced);
                    }
                    if eof {
                        return Err(FreezeError::decompression(format!(
                            "compressed stream truncated after {} input bytes",
                            self.state.total_in()
                        )));
                    }
                    if consumed == 0 {
                        return Err(FreezeError::decompression("inflater made no progress"));
                    }
                }
            }
        }
    }

    /// Whether the end-of-stream marker has been reached
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Decompressed bytes produced so far
    pub fn total_out(&self) -> u64 {
        self.state.total_out()
    }

    /// Lazy iterator of decompressed chunks of at most `chunk_size` bytes
    pub fn chunks(self, chunk_size: usize) -> Chunks<R> {
        Chunks {
            stream: self,
            chunk_size: chunk_size.max(1),
            done: false,
        }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: BufRead> Read for InflateStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.pull(buf).map_err(into_io)
    }
}

/// Iterator returned by [`InflateStream::chunks`]
pub struct Chunks<R> {
    stream: InflateStream<R>,
    chunk_size: usize,
    done: bool,
}

impl<R: BufRead> Iterator for Chunks<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut buf = vec![0u8; self.chunk_size];
        match self.stream.pull(&mut buf) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(n) => {
                buf.truncate(n);
                Some(Ok(buf))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Streaming reader for gzip-wrapped bundles.
///
/// Accepts what the build host writes: the 8-byte header
/// `1F 8B 08 <flags> <mtime:4>`, then either a zlib stream (checked by its own
/// adler32) or raw deflate optionally followed by CRC32 and ISIZE, both
/// little-endian, which are verified when present.
pub struct GzipUnwrap<R> {
    stream: InflateStream<R>,
    framing: Framing,
    crc: crc32fast::Hasher,
    trailer_checked: bool,
}

impl<R: BufRead> GzipUnwrap<R> {
    pub fn new(mut inner: R) -> Result<Self> {
        let mut header = [0u8; GZIP_HEADER_LEN];
        inner.read_exact(&mut header).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => FreezeError::decompression("gzip header truncated"),
            _ => FreezeError::Io(e),
        })?;

        if header[..2] != GZIP_MAGIC {
            return Err(FreezeError::decompression("missing gzip magic"));
        }
        if header[2] != GZIP_METHOD_DEFLATE {
            return Err(FreezeError::decompression(format!(
                "unsupported gzip method {}",
                header[2]
            )));
        }

        let framing = if looks_like_zlib(inner.fill_buf()?) {
            Framing::Zlib
        } else {
            Framing::Deflate
        };

        Ok(GzipUnwrap {
            stream: InflateStream::new(inner, framing),
            framing,
            crc: crc32fast::Hasher::new(),
            trailer_checked: false,
        })
    }

    /// Body framing detected after the header
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Decompress into `out`; returns bytes produced, 0 at end of stream
    pub fn pull(&mut self, out: &mut [u8]) -> Result<usize> {
        let n = self.stream.pull(out)?;
        if n > 0 {
            self.crc.update(&out[..n]);
            return Ok(n);
        }
        if !self.trailer_checked && !out.is_empty() {
            self.trailer_checked = true;
            self.check_trailer()?;
        }
        Ok(0)
    }

    fn check_trailer(&mut self) -> Result<()> {
        if self.framing == Framing::Zlib {
            return Ok(());
        }

        let mut trailer = [0u8; 8];
        let mut filled = 0;
        let inner = self.stream.get_mut();
        while filled < trailer.len() {
            let n = inner.read(&mut trailer[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        match filled {
            0 => Ok(()),
            8 => {
                let expected_crc = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
                let expected_len = u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]);
                let actual_crc = self.crc.clone().finalize();
                let actual_len = self.stream.total_out() as u32;
                if expected_crc != actual_crc {
                    return Err(FreezeError::decompression(format!(
                        "gzip CRC32 mismatch: trailer {:08x}, computed {:08x}",
                        expected_crc, actual_crc
                    )));
                }
                if expected_len != actual_len {
                    return Err(FreezeError::decompression(format!(
                        "gzip size mismatch: trailer {}, computed {}",
                        expected_len, actual_len
                    )));
                }
                Ok(())
            }
            n => Err(FreezeError::decompression(format!(
                "gzip trailer truncated ({} of 8 bytes)",
                n
            ))),
        }
    }
}

impl<R: BufRead> Read for GzipUnwrap<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.pull(buf).map_err(into_io)
    }
}

/// Write `src` as a gzip-wrapped stream: minimal header, raw deflate, CRC32, ISIZE
pub fn gzip_wrap<R: Read, W: Write>(src: &mut R, dst: W, level: u32) -> Result<W> {
    let mut dst = dst;
    dst.write_all(&[
        GZIP_MAGIC[0],
        GZIP_MAGIC[1],
        GZIP_METHOD_DEFLATE,
        0,
        0,
        0,
        0,
        0,
    ])?;

    let mut crc = crc32fast::Hasher::new();
    let mut len: u64 = 0;
    let mut encoder = DeflateEncoder::new(dst, Compression::new(level));
    let mut buf = [0u8; 4096];
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        crc.update(&buf[..n]);
        encoder.write_all(&buf[..n])?;
        len += n as u64;
    }

    let mut dst = encoder.finish()?;
    dst.write_all(&crc.finalize().to_le_bytes())?;
    dst.write_all(&(len as u32).to_le_bytes())?;
    Ok(dst)
}

fn looks_like_zlib(peek: &[u8]) -> bool {
    if peek.len() < 2 {
        return false;
    }
    let cmf = peek[0];
    let flg = peek[1];
    cmf & 0x0f == 8 && cmf >> 4 <= 7 && ((cmf as u16) << 8 | flg as u16) % 31 == 0
}

fn into_io(err: FreezeError) -> io::Error {
    match err {
        FreezeError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}
