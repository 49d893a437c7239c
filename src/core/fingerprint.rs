//! Package fingerprints
//!
//! A fingerprint is the SHA-256 of every deployed file, fed in sorted path
//! order as `path \0 len(u64 le) content`, rendered as 64 lowercase hex
//! characters. The freezer ships one with the code (target); the device
//! persists one after a successful defrost (actual).

use crate::error::{FreezeError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

const READ_BLOCK: usize = 4096;

/// Fixed-length hex content hash
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hex characters in a fingerprint
    pub const HEX_LEN: usize = 64;

    /// Validate and wrap a hex string
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let valid = s.len() == Self::HEX_LEN
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(FreezeError::InvalidFingerprint(s.to_string()));
        }
        Ok(Fingerprint(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fingerprint the files at `paths` (relative to `root`) in canonical order
    pub fn of_files<I, S>(root: &Path, paths: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut paths: Vec<String> = paths.into_iter().map(|p| p.as_ref().to_string()).collect();
        paths.sort();
        paths.dedup();

        let mut builder = FingerprintBuilder::new();
        for rel in &paths {
            let full = root.join(rel.trim_start_matches('/'));
            let mut file = File::open(&full)?;
            let len = file.metadata()?.len();
            builder.add_reader(rel, len, &mut file)?;
        }
        debug!("Fingerprinted {} files under {}", builder.files(), root.display());
        Ok(builder.finish())
    }

    /// Read a persisted fingerprint; a missing file is `Ok(None)`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        match fs::read_to_string(path.as_ref()) {
            Ok(text) => Ok(Some(Self::parse(&text)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the fingerprint through a temp file and rename it into place
    pub fn persist<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(self.0.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = FreezeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for Fingerprint {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Fingerprint::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Incremental fingerprint; callers feed files in sorted path order
pub struct FingerprintBuilder {
    hasher: Sha256,
    files: u64,
}

impl FingerprintBuilder {
    pub fn new() -> Self {
        FingerprintBuilder {
            hasher: Sha256::new(),
            files: 0,
        }
    }

    /// Add one file from memory
    pub fn add_bytes(&mut self, path: &str, content: &[u8]) {
        self.add_header(path, content.len() as u64);
        self.hasher.update(content);
    }

    /// Add one file streamed in fixed-size blocks
    pub fn add_reader<R: Read>(&mut self, path: &str, len: u64, reader: &mut R) -> Result<()> {
        self.add_header(path, len);
        let mut block = [0u8; READ_BLOCK];
        let mut seen = 0u64;
        loop {
            let n = reader.read(&mut block)?;
            if n == 0 {
                break;
            }
            self.hasher.update(&block[..n]);
            seen += n as u64;
        }
        if seen != len {
            return Err(FreezeError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} changed while hashing ({} of {} bytes)", path, seen, len),
            )));
        }
        Ok(())
    }

    /// Files added so far
    pub fn files(&self) -> u64 {
        self.files
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(hex::encode(self.hasher.finalize()))
    }

    fn add_header(&mut self, path: &str, len: u64) {
        self.hasher.update(path.trim_start_matches('/').as_bytes());
        self.hasher.update([0u8]);
        self.hasher.update(len.to_le_bytes());
        self.files += 1;
    }
}

impl Default for FingerprintBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn of(files: &[(&str, &[u8])]) -> Fingerprint {
        let mut builder = FingerprintBuilder::new();
        for (path, content) in files {
            builder.add_bytes(path, content);
        }
        builder.finish()
    }

    #[test]
    fn test_fixed_length_hex() {
        let fp = of(&[("a.py", b"print(1)")]);
        assert_eq!(fp.as_str().len(), Fingerprint::HEX_LEN);
        assert!(Fingerprint::parse(fp.as_str()).is_ok());
    }

    #[test]
    fn test_content_sensitivity() {
        let base = of(&[("a.py", b"print(1)"), ("sub/b.py", b"x=1")]);
        let changed = of(&[("a.py", b"print(2)"), ("sub/b.py", b"x=1")]);
        let renamed = of(&[("a.py", b"print(1)"), ("sub/c.py", b"x=1")]);
        assert_ne!(base, changed);
        assert_ne!(base, renamed);
        assert_eq!(base, of(&[("a.py", b"print(1)"), ("sub/b.py", b"x=1")]));
    }

    #[test]
    fn test_boundaries_are_unambiguous() {
        assert_ne!(of(&[("a", b"bc")]), of(&[("ab", b"c")]));
        assert_ne!(of(&[("a", b"x"), ("b", b"")]), of(&[("a", b""), ("b", b"x")]));
    }

    #[test]
    fn test_of_files_sorts_paths() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a.py"), b"print(1)").unwrap();
        fs::write(dir.path().join("sub/b.py"), b"x=1").unwrap();

        let forward = Fingerprint::of_files(dir.path(), ["a.py", "sub/b.py"]).unwrap();
        let backward = Fingerprint::of_files(dir.path(), ["sub/b.py", "a.py"]).unwrap();
        assert_eq!(forward, backward);
        assert_eq!(forward, of(&[("a.py", b"print(1)"), ("sub/b.py", b"x=1")]));
    }

    #[test]
    fn test_builder_counts_files() {
        let mut builder = FingerprintBuilder::new();
        assert_eq!(builder.files(), 0);
        builder.add_bytes("a.py", b"1");
        builder
            .add_reader("b.py", 3, &mut &b"abc"[..])
            .unwrap();
        assert_eq!(builder.files(), 2);

        let err = builder.add_reader("c.py", 10, &mut &b"short"[..]).unwrap_err();
        assert!(matches!(err, FreezeError::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Fingerprint::parse("").is_err());
        assert!(Fingerprint::parse("abc").is_err());
        assert!(Fingerprint::parse(&"G".repeat(64)).is_err());
        assert!(Fingerprint::parse(&"A".repeat(64)).is_err());
        assert!(Fingerprint::parse(&format!("{}\n", "a".repeat(64))).is_ok());
    }

    #[test]
    fn test_persist_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("package.fingerprint");
        assert_eq!(Fingerprint::load(&path).unwrap(), None);

        let fp = of(&[("main.py", b"pass")]);
        fp.persist(&path).unwrap();
        assert_eq!(Fingerprint::load(&path).unwrap(), Some(fp));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_serde_as_string() {
        let fp = of(&[("x", b"y")]);
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, format!("\"{}\"", fp));
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);
        assert!(serde_json::from_str::<Fingerprint>("\"nope\"").is_err());
    }
}
