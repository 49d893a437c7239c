//! Encoded units and the package manifest
//!
//! One unit per source file, stored as `unit_<n>.toml`:
//!
//! ```toml
//! path = "lib/b.py"
//! data = "eJyrsNU1BAACnQEA"
//! ```
//!
//! `data` is standard base64 of the file bytes, zlib-compressed when the
//! package manifest says so. Indices start at 0 and have no gaps.

use crate::compression::{self, CompressionMethod, Framing, InflateStream};
use crate::error::{FreezeError, Result};
use crate::fingerprint::Fingerprint;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Output buffer used while inflating a unit to disk
const WRITE_CHUNK: usize = 512;

/// File name of the unit with the given index
pub fn unit_file_name(index: usize) -> String {
    format!("unit_{}.toml", index)
}

/// Path of the unit with the given index inside `dir`
pub fn unit_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(unit_file_name(index))
}

/// A destination path and the (possibly compressed) bytes to write there
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedUnit {
    pub destination_path: String,
    pub payload: Vec<u8>,
}

impl EncodedUnit {
    /// Encode file content for `destination`
    pub fn encode(
        destination: &str,
        content: &[u8],
        method: CompressionMethod,
        level: u32,
    ) -> Result<Self> {
        Ok(EncodedUnit {
            destination_path: destination.to_string(),
            payload: compression::compress(content, method, level)?,
        })
    }

    /// Decode the payload into `dst` without materializing the whole file.
    ///
    /// Returns the number of bytes written.
    pub fn write_content<W: Write>(&self, method: CompressionMethod, dst: &mut W) -> Result<u64> {
        match method {
            CompressionMethod::None => {
                dst.write_all(&self.payload)?;
                Ok(self.payload.len() as u64)
            }
            CompressionMethod::Zlib => {
                let mut stream = InflateStream::new(&self.payload[..], Framing::Zlib);
                let mut buf = [0u8; WRITE_CHUNK];
                let mut written = 0u64;
                loop {
                    let n = stream.pull(&mut buf)?;
                    if n == 0 {
                        return Ok(written);
                    }
                    dst.write_all(&buf[..n])?;
                    written += n as u64;
                }
            }
        }
    }

    /// Decode the payload fully into memory
    pub fn content(&self, method: CompressionMethod) -> Result<Vec<u8>> {
        compression::decompress(&self.payload, method)
    }

    pub fn to_file(&self) -> UnitFile {
        UnitFile {
            path: self.destination_path.clone(),
            data: BASE64.encode(&self.payload),
        }
    }
}

/// On-disk shape of `unit_<n>.toml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFile {
    pub path: String,
    pub data: String,
}

impl UnitFile {
    /// Load a unit file; a missing file is `Ok(None)`
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        toml::from_str(&text).map(Some).map_err(|e| FreezeError::Unit {
            unit: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, toml::to_string(self)?)?;
        Ok(())
    }

    /// Base64-decode the payload; `unit` names the unit in errors
    pub fn decode(&self, unit: &str) -> Result<EncodedUnit> {
        let decoded = if self.data.bytes().any(|b| b.is_ascii_whitespace()) {
            let compact: String = self.data.split_ascii_whitespace().collect();
            BASE64.decode(compact)
        } else {
            BASE64.decode(self.data.as_bytes())
        };
        let payload = decoded.map_err(|e| FreezeError::Encoding {
            unit: unit.to_string(),
            reason: e.to_string(),
        })?;

        Ok(EncodedUnit {
            destination_path: self.path.clone(),
            payload,
        })
    }
}

/// `package.toml`: target fingerprint and how payloads were compressed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageManifest {
    pub fingerprint: Fingerprint,
    #[serde(default)]
    pub compression: CompressionMethod,
}

impl PackageManifest {
    pub const FILE_NAME: &'static str = "package.toml";

    pub fn new(fingerprint: Fingerprint, compression: CompressionMethod) -> Self {
        PackageManifest {
            fingerprint,
            compression,
        }
    }

    /// Load the manifest from a defrost directory
    pub fn load(defrost_dir: &Path) -> Result<Self> {
        let text = fs::read_to_string(defrost_dir.join(Self::FILE_NAME))?;
        Ok(toml::from_str(&text)?)
    }

    /// Write the manifest into a defrost directory
    pub fn save(&self, defrost_dir: &Path) -> Result<()> {
        fs::create_dir_all(defrost_dir)?;
        fs::write(defrost_dir.join(Self::FILE_NAME), toml::to_string(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::DEFAULT_LEVEL;
    use crate::fingerprint::FingerprintBuilder;
    use tempfile::TempDir;

    #[test]
    fn test_unit_file_names() {
        assert_eq!(unit_file_name(0), "unit_0.toml");
        assert_eq!(unit_path(Path::new("/d"), 12), Path::new("/d/unit_12.toml"));
    }

    #[test]
    fn test_encode_and_write_content() {
        let content = b"import os\nprint(os.listdir())\n".repeat(40);
        for method in [CompressionMethod::Zlib, CompressionMethod::None] {
            let unit = EncodedUnit::encode("lib/x.py", &content, method, DEFAULT_LEVEL).unwrap();
            let mut out = Vec::new();
            let written = unit.write_content(method, &mut out).unwrap();
            assert_eq!(written, content.len() as u64);
            assert_eq!(out, content);
        }
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let unit = EncodedUnit::encode("a.py", b"print(1)", CompressionMethod::Zlib, DEFAULT_LEVEL).unwrap();
        let path = unit_path(dir.path(), 0);
        unit.to_file().save(&path).unwrap();

        let loaded = UnitFile::load(&path).unwrap().unwrap();
        assert_eq!(loaded.path, "a.py");
        let decoded = loaded.decode("unit_0").unwrap();
        assert_eq!(decoded, unit);
        assert_eq!(decoded.content(CompressionMethod::Zlib).unwrap(), b"print(1)");
    }

    #[test]
    fn test_missing_unit_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(UnitFile::load(&unit_path(dir.path(), 3)).unwrap().is_none());
    }

    #[test]
    fn test_garbled_unit_file() {
        let dir = TempDir::new().unwrap();
        let path = unit_path(dir.path(), 0);
        fs::write(&path, "path = \"a.py\"\n").unwrap();
        assert!(matches!(UnitFile::load(&path), Err(FreezeError::Unit { .. })));
    }

    #[test]
    fn test_bad_base64() {
        let file = UnitFile {
            path: "a.py".into(),
            data: "not*base64!".into(),
        };
        assert!(matches!(file.decode("unit_0"), Err(FreezeError::Encoding { .. })));
    }

    #[test]
    fn test_base64_with_line_breaks() {
        let file = UnitFile {
            path: "a.py".into(),
            data: "cHJp\nbnQo\nMSk=\n".into(),
        };
        let unit = file.decode("unit_0").unwrap();
        assert_eq!(unit.payload, b"print(1)");
    }

    #[test]
    fn test_manifest_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut builder = FingerprintBuilder::new();
        builder.add_bytes("a.py", b"print(1)");
        let manifest = PackageManifest::new(builder.finish(), CompressionMethod::None);
        manifest.save(dir.path()).unwrap();
        assert_eq!(PackageManifest::load(dir.path()).unwrap(), manifest);
    }
}
