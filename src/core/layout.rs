//! Device filesystem layout
//!
//! Every device-side component receives a [`DeviceLayout`] instead of reaching
//! for a process-wide root folder. Tests build one per temporary directory;
//! the firmware builds one from `device.toml` written by the freezer.

use crate::error::{FreezeError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where the device keeps its code, its encoded units and its markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLayout {
    /// Filesystem root all destination paths are resolved against
    pub root: PathBuf,

    /// Directory holding `unit_<n>.toml` and `package.toml`
    pub defrost_dir: PathBuf,

    /// Persisted fingerprint of the last successful reconstruction
    pub fingerprint_path: PathBuf,

    /// Scratch area for the first phase of an OTA apply
    pub staging_dir: PathBuf,

    /// Delete unit files after a successful defrost
    pub remove_units: bool,
}

/// On-disk shape of `device.toml`; relative entries resolve against `root`.
#[derive(Debug, Serialize, Deserialize)]
struct LayoutFile {
    root: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    defrost_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fingerprint_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    staging_dir: Option<PathBuf>,
    #[serde(default)]
    remove_units_after: bool,
}

impl DeviceLayout {
    pub const DEFROST_DIR: &'static str = "_todefrost";
    pub const FINGERPRINT_FILE: &'static str = "package.fingerprint";
    pub const STAGING_DIR: &'static str = ".ota-staging";
    pub const CONFIG_FILE: &'static str = "device.toml";

    /// Layout with the default directory names under `root`
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref().to_path_buf();
        DeviceLayout {
            defrost_dir: root.join(Self::DEFROST_DIR),
            fingerprint_path: root.join(Self::FINGERPRINT_FILE),
            staging_dir: root.join(Self::STAGING_DIR),
            remove_units: false,
            root,
        }
    }

    /// Override the defrost directory
    pub fn with_defrost_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.defrost_dir = self.root.join(dir);
        self
    }

    /// Override the staging directory
    pub fn with_staging_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.staging_dir = self.root.join(dir);
        self
    }

    /// Remove unit files once they have all been defrosted
    pub fn with_remove_units(mut self, remove: bool) -> Self {
        self.remove_units = remove;
        self
    }

    /// Load a layout from a `device.toml` file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let file: LayoutFile = toml::from_str(text)?;
        let mut layout = DeviceLayout::new(&file.root);
        if let Some(dir) = file.defrost_dir {
            layout.defrost_dir = layout.root.join(dir);
        }
        if let Some(path) = file.fingerprint_path {
            layout.fingerprint_path = layout.root.join(path);
        }
        if let Some(dir) = file.staging_dir {
            layout.staging_dir = layout.root.join(dir);
        }
        layout.remove_units = file.remove_units_after;
        Ok(layout)
    }

    pub fn to_toml(&self) -> Result<String> {
        let relative = |p: &Path| p.strip_prefix(&self.root).unwrap_or(p).to_path_buf();
        let file = LayoutFile {
            root: self.root.clone(),
            defrost_dir: Some(relative(&self.defrost_dir)),
            fingerprint_path: Some(relative(&self.fingerprint_path)),
            staging_dir: Some(relative(&self.staging_dir)),
            remove_units_after: self.remove_units,
        };
        Ok(toml::to_string_pretty(&file)?)
    }

    /// Resolve an archive entry or unit destination against the root
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        Ok(self.root.join(relative_destination(name)?))
    }
}

/// Turn an archive/unit name into a path relative to the device root.
///
/// Leading `/` and `.` segments are dropped; any `..` segment is a format
/// error since the result would escape the root.
pub fn relative_destination(name: &str) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for part in name.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(FreezeError::format(format!(
                    "entry name escapes the target root: {}",
                    name
                )))
            }
            part => out.push(part),
        }
    }

    if out.as_os_str().is_empty() {
        return Err(FreezeError::format(format!(
            "entry name has no path component: {:?}",
            name
        )));
    }

    Ok(out)
}

/// Whether `name` refers to the root itself (`/`, `./`, `.`)
pub fn names_root(name: &str) -> bool {
    name.split('/').all(|part| part.is_empty() || part == ".")
}
