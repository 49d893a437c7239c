//! Minimal streaming reader for 512-byte-block archives
//!
//! Reads the subset of the portable tar layout the freezer produces:
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ header block (512 bytes)     │  name: bytes 0..100, NUL padded
//! │                              │  size: bytes 124..136, octal ASCII
//! ├──────────────────────────────┤
//! │ content, padded to 512       │
//! ├──────────────────────────────┤
//! │ next header ...              │
//! ├──────────────────────────────┤
//! │ zero block                   │  end of archive
//! └──────────────────────────────┘
//! ```
//!
//! Permission, owner, timestamp and checksum fields are never looked at.
//! The reader is forward-only and owns a single block-sized scratch buffer
//! that is reused for headers and for skipping content.

use crate::error::{FreezeError, Result};
use crate::layout::{names_root, relative_destination};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Header and alignment unit
pub const BLOCK_SIZE: usize = 512;

/// Width of the name field
pub const NAME_LEN: usize = 100;

const SIZE_FIELD: std::ops::Range<usize> = 124..136;
const TYPEFLAG: usize = 156;

/// Entry kind as seen by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// One archive member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Name exactly as stored (directories keep their trailing `/`)
    pub name: String,

    /// File or directory
    pub kind: EntryKind,

    /// Declared content length in bytes
    pub size: u64,
}

impl ArchiveEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Destination relative to the device root (rejects `..` segments)
    pub fn destination(&self) -> Result<PathBuf> {
        relative_destination(&self.name)
    }

    /// Directory entry for the archive root itself, as `tar -C dir .` writes
    pub fn is_root_dir(&self) -> bool {
        self.is_dir() && names_root(&self.name)
    }
}

/// Bytes needed to pad `size` up to the next block boundary
pub fn padding_for(size: u64) -> u64 {
    let rem = size % BLOCK_SIZE as u64;
    if rem == 0 {
        0
    } else {
        BLOCK_SIZE as u64 - rem
    }
}

/// Forward-only cursor over archive entries
pub struct ArchiveReader<R> {
    inner: R,
    block: [u8; BLOCK_SIZE],
    /// Unread content bytes of the current entry
    remaining: u64,
    /// Alignment bytes after the current entry's content
    padding: u64,
    finished: bool,
    entries: u64,
}

impl ArchiveReader<BufReader<File>> {
    /// Open an archive file on disk
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Ok(ArchiveReader::new(BufReader::with_capacity(BLOCK_SIZE, file)))
    }
}

impl<'a> ArchiveReader<&'a [u8]> {
    /// Read an archive that is already in memory
    pub fn from_bytes(bytes: &'a [u8]) -> Self {
        ArchiveReader::new(bytes)
    }
}

impl<R: Read> ArchiveReader<R> {
    pub fn new(inner: R) -> Self {
        ArchiveReader {
            inner,
            block: [0u8; BLOCK_SIZE],
            remaining: 0,
            padding: 0,
            finished: false,
            entries: 0,
        }
    }

    /// Advance to the next entry.
    ///
    /// Whatever is left of the previous entry (content and padding) is
    /// skipped first, so callers may read all, part or none of an entry.
    /// Returns `Ok(None)` on a zero header or when fewer than a block of
    /// bytes remain.
    pub fn next_entry(&mut self) -> Result<Option<ArchiveEntry>> {
        if self.finished {
            return Ok(None);
        }
        self.skip_entry()?;

        loop {
            let filled = read_block(&mut self.inner, &mut self.block)?;
            if filled < BLOCK_SIZE {
                if filled > 0 {
                    debug!("Ignoring {} trailing bytes after last entry", filled);
                }
                self.finished = true;
                return Ok(None);
            }

            if self.block[0] == 0 {
                debug!("End-of-archive block after {} entries", self.entries);
                self.finished = true;
                return Ok(None);
            }

            let name = parse_name(&self.block)?;
            let size = parse_octal(&self.block[SIZE_FIELD])?;
            let typeflag = self.block[TYPEFLAG];

            self.remaining = size;
            self.padding = padding_for(size);

            // PAX and GNU long-name records describe the next member; the
            // freezer never relies on them.
            if matches!(typeflag, b'x' | b'g' | b'L' | b'K') {
                debug!("Skipping extension header {:?} ({} bytes)", name, size);
                self.skip_entry()?;
                continue;
            }

            let kind = if name.ends_with('/') || typeflag == b'5' {
                EntryKind::Directory
            } else {
                EntryKind::File
            };

            self.entries += 1;
            return Ok(Some(ArchiveEntry { name, kind, size }));
        }
    }

    /// Bounded reader over the current entry's content
    pub fn entry_reader(&mut self) -> EntryReader<'_, R> {
        EntryReader { archive: self }
    }

    /// Discard the rest of the current entry, including its padding
    pub fn skip_entry(&mut self) -> Result<()> {
        while self.remaining > 0 || self.padding > 0 {
            let want = (self.remaining + self.padding).min(BLOCK_SIZE as u64) as usize;
            let got = read_some(&mut self.inner, &mut self.block[..want])?;
            if got == 0 {
                if self.remaining > 0 {
                    return Err(FreezeError::format(format!(
                        "archive truncated: {} content bytes missing",
                        self.remaining
                    )));
                }
                // Padding cut off at the very end of the stream
                self.padding = 0;
                self.finished = true;
                break;
            }

            let got = got as u64;
            let from_content = got.min(self.remaining);
            self.remaining -= from_content;
            self.padding -= got - from_content;
        }
        Ok(())
    }

    /// Number of entries returned so far
    pub fn entries_read(&self) -> u64 {
        self.entries
    }
}

/// Reader limited to the current entry's declared length.
///
/// Never touches padding; the archive cursor consumes it on the next call
/// to [`ArchiveReader::next_entry`].
pub struct EntryReader<'a, R> {
    archive: &'a mut ArchiveReader<R>,
}

impl<R: Read> EntryReader<'_, R> {
    /// Content bytes not yet read
    pub fn remaining(&self) -> u64 {
        self.archive.remaining
    }

    /// Stream the rest of the entry into `dst` through the caller's buffer
    pub fn copy_to<W: Write>(&mut self, dst: &mut W, buf: &mut [u8]) -> Result<u64> {
        let mut written = 0u64;
        loop {
            let n = self.read(buf).map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => FreezeError::format(e.to_string()),
                _ => FreezeError::Io(e),
            })?;
            if n == 0 {
                return Ok(written);
            }
            dst.write_all(&buf[..n])?;
            written += n as u64;
        }
    }
}

impl<R: Read> Read for EntryReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.archive.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = (buf.len() as u64).min(self.archive.remaining) as usize;
        let n = read_some(&mut self.archive.inner, &mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "archive truncated: {} content bytes missing",
                    self.archive.remaining
                ),
            ));
        }
        self.archive.remaining -= n as u64;
        Ok(n)
    }
}

fn parse_name(header: &[u8]) -> Result<String> {
    let field = &header[..NAME_LEN];
    let len = field.iter().position(|b| *b == 0).unwrap_or(NAME_LEN);
    let name = std::str::from_utf8(&field[..len])
        .map_err(|_| FreezeError::format("entry name is not valid UTF-8"))?;
    Ok(name.to_string())
}

fn parse_octal(field: &[u8]) -> Result<u64> {
    let mut out: u64 = 0;
    let mut saw_digit = false;
    for b in field {
        match *b {
            0 | b' ' if saw_digit => break,
            0 | b' ' => continue,
            b'0'..=b'7' => {
                saw_digit = true;
                out = out
                    .checked_mul(8)
                    .and_then(|v| v.checked_add((b - b'0') as u64))
                    .ok_or_else(|| FreezeError::format("entry size overflows"))?;
            }
            other => {
                return Err(FreezeError::format(format!(
                    "invalid byte {:#04x} in entry size",
                    other
                )))
            }
        }
    }
    if !saw_digit {
        return Err(FreezeError::format("missing entry size"));
    }
    Ok(out)
}

/// Fill `buf` unless the stream ends first; returns bytes filled
fn read_block<R: Read>(inner: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = read_some(inner, &mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn read_some<R: Read>(inner: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match inner.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}
