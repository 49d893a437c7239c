//! Build-host configuration
//!
//! Read from a JSON file (`config.json` by default) with the keys the
//! freezer has always used:
//!
//! ```json
//! {
//!     "excludeList": [".git", "__pycache__"],
//!     "directoriesKeptInFrozen": ["frozen_lib"],
//!     "enableZlibCompression": true,
//!     "flashRootFolder": "/flash",
//!     "compressionLevel": 4
//! }
//! ```
//!
//! Every key is optional.

use crate::compression::{CompressionMethod, DEFAULT_LEVEL};
use crate::error::{FreezeError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default config file name looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Options consumed when constructing a [`Freezer`](crate::Freezer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FreezerConfig {
    /// File and directory names skipped anywhere in the walk
    ///
    /// Example: [".git", "__pycache__"]
    pub exclude_list: Vec<String>,

    /// Directory names copied verbatim instead of being encoded
    ///
    /// Ignored when building an OTA bundle.
    pub directories_kept_in_frozen: Vec<String>,

    /// zlib-compress unit payloads and gzip-wrap bundles
    pub enable_zlib_compression: bool,

    /// Device filesystem root written to `device.toml`
    pub flash_root_folder: PathBuf,

    /// zlib/deflate level, 0 to 9
    pub compression_level: u32,
}

impl Default for FreezerConfig {
    fn default() -> Self {
        FreezerConfig {
            exclude_list: Vec::new(),
            directories_kept_in_frozen: Vec::new(),
            enable_zlib_compression: true,
            flash_root_folder: PathBuf::from("/flash"),
            compression_level: DEFAULT_LEVEL,
        }
    }
}

impl FreezerConfig {
    /// Load and validate a JSON config file
    ///
    /// # Errors
    ///
    /// Returns [`FreezeError::Io`] if the file cannot be read and
    /// [`FreezeError::Config`] if it is not valid JSON or fails validation.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    /// Parse and validate JSON config text
    ///
    /// # Examples
    ///
    /// ```
    /// use microfreeze::FreezerConfig;
    ///
    /// let config = FreezerConfig::from_json(r#"{ "excludeList": [".git"] }"#).unwrap();
    /// assert!(config.is_excluded(".git"));
    /// assert!(config.enable_zlib_compression);
    /// ```
    pub fn from_json(text: &str) -> Result<Self> {
        let config: FreezerConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check field ranges
    pub fn validate(&self) -> Result<()> {
        if self.compression_level > 9 {
            return Err(FreezeError::Config(format!(
                "compressionLevel must be between 0 and 9, got {}",
                self.compression_level
            )));
        }
        if self.flash_root_folder.as_os_str().is_empty() {
            return Err(FreezeError::Config("flashRootFolder must not be empty".into()));
        }
        for name in self.exclude_list.iter().chain(&self.directories_kept_in_frozen) {
            if name.is_empty() || name.contains('/') {
                return Err(FreezeError::Config(format!(
                    "expected a plain file or directory name, got {:?}",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Payload compression implied by `enableZlibCompression`
    pub fn compression_method(&self) -> CompressionMethod {
        if self.enable_zlib_compression {
            CompressionMethod::Zlib
        } else {
            CompressionMethod::None
        }
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.exclude_list.iter().any(|n| n == name)
    }

    pub fn is_kept(&self, name: &str) -> bool {
        self.directories_kept_in_frozen.iter().any(|n| n == name)
    }

    /// Builder-style setters
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.enable_zlib_compression = enabled;
        self
    }

    pub fn exclude(mut self, name: impl Into<String>) -> Self {
        self.exclude_list.push(name.into());
        self
    }

    pub fn keep(mut self, name: impl Into<String>) -> Self {
        self.directories_kept_in_frozen.push(name.into());
        self
    }
}
