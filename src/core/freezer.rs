//! Build-host encoder
//!
//! Two modes over the same sorted source walk:
//!
//! - [`Freezer::freeze`] writes one encoded unit per file for a fresh flash:
//!
//!   ```text
//!   dest/
//!   ├── Base/device.toml                 device layout for the boot gate
//!   └── Custom/
//!       ├── _todefrost/unit_<n>.toml     encoded units
//!       ├── _todefrost/package.toml      fingerprint + compression
//!       └── <kept dirs>                  copied verbatim
//!   ```
//!
//! - [`Freezer::package`] writes `dest/<fingerprint>.tar` (or `.tar.gz`) for
//!   OTA, holding the files themselves.

use crate::archive::NAME_LEN;
use crate::compression::gzip_wrap;
use crate::config::FreezerConfig;
use crate::error::{FreezeError, Result};
use crate::fingerprint::Fingerprint;
use crate::layout::DeviceLayout;
use crate::unit::{unit_path, EncodedUnit, PackageManifest};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tar::{Builder as TarBuilder, EntryType, Header};
use tracing::{debug, info};
use walkdir::{DirEntry, WalkDir};

pub const CUSTOM_DIR: &str = "Custom";
pub const BASE_DIR: &str = "Base";

/// What a walk step found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    File,
    Directory,
    /// Directory listed in `directoriesKeptInFrozen`; not descended into
    Kept,
}

/// One item of the source walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    /// `/`-separated path relative to the source root
    pub relative: String,
    pub path: PathBuf,
    pub kind: SourceKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreezeReport {
    pub units: usize,
    pub kept_files: usize,
    pub bytes: u64,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageReport {
    pub bundle: PathBuf,
    pub files: usize,
    pub directories: usize,
    pub fingerprint: Fingerprint,
}

pub struct Freezer {
    config: FreezerConfig,
}

impl Freezer {
    pub fn new(config: FreezerConfig) -> Self {
        Freezer { config }
    }

    pub fn config(&self) -> &FreezerConfig {
        &self.config
    }

    /// Walk `source` in pre-order with entries sorted by name at each level
    pub fn walk(&self, source: &Path) -> Result<Vec<SourceEntry>> {
        let mut out = Vec::new();
        let mut walker = WalkDir::new(source)
            .min_depth(1)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !self.excluded(e));

        while let Some(entry) = walker.next() {
            let entry = entry.map_err(io::Error::from)?;
            let relative = relative_name(source, entry.path())?;
            let path = entry.path().to_path_buf();

            if entry.file_type().is_dir() {
                let kept = entry.file_name().to_str().map_or(false, |n| self.config.is_kept(n));
                if kept {
                    walker.skip_current_dir();
                    out.push(SourceEntry {
                        relative,
                        path,
                        kind: SourceKind::Kept,
                    });
                } else {
                    out.push(SourceEntry {
                        relative,
                        path,
                        kind: SourceKind::Directory,
                    });
                }
            } else {
                out.push(SourceEntry {
                    relative,
                    path,
                    kind: SourceKind::File,
                });
            }
        }
        Ok(out)
    }

    /// Excluded by name; non-UTF-8 names pass so the walk can report them
    fn excluded(&self, entry: &DirEntry) -> bool {
        let excluded = entry
            .file_name()
            .to_str()
            .map_or(false, |n| self.config.is_excluded(n));
        if excluded {
            debug!("Ignoring {}", entry.path().display());
        }
        excluded
    }

    /// Fingerprint of the files a walk would deploy
    pub fn fingerprint(&self, source: &Path, entries: &[SourceEntry]) -> Result<Fingerprint> {
        Fingerprint::of_files(
            source,
            entries
                .iter()
                .filter(|e| e.kind == SourceKind::File)
                .map(|e| e.relative.as_str()),
        )
    }

    /// Encode `source` into units under `dest` for a fresh flash
    pub fn freeze(&self, source: &Path, dest: &Path) -> Result<FreezeReport> {
        let custom = dest.join(CUSTOM_DIR);
        let base = dest.join(BASE_DIR);
        let defrost_dir = custom.join(DeviceLayout::DEFROST_DIR);

        // Units are read until the first gap, so leftovers from a previous
        // run would be picked up as part of this one.
        if defrost_dir.exists() {
            fs::remove_dir_all(&defrost_dir)?;
        }
        fs::create_dir_all(&defrost_dir)?;
        fs::create_dir_all(&base)?;

        let entries = self.walk(source)?;
        let method = self.config.compression_method();
        let mut units = 0;
        let mut bytes = 0u64;
        let mut kept_files = 0;

        for entry in &entries {
            match entry.kind {
                SourceKind::File => {
                    let content = fs::read(&entry.path)?;
                    let unit = EncodedUnit::encode(
                        &entry.relative,
                        &content,
                        method,
                        self.config.compression_level,
                    )?;
                    unit.to_file().save(&unit_path(&defrost_dir, units))?;
                    debug!("  [C] {} -> unit_{}", entry.relative, units);
                    units += 1;
                    bytes += content.len() as u64;
                }
                SourceKind::Kept => {
                    kept_files += self.copy_tree(&entry.path, &custom.join(&entry.relative))?;
                }
                SourceKind::Directory => {}
            }
        }

        let fingerprint = self.fingerprint(source, &entries)?;
        PackageManifest::new(fingerprint.clone(), method).save(&defrost_dir)?;

        let layout = DeviceLayout::new(&self.config.flash_root_folder);
        fs::write(base.join(DeviceLayout::CONFIG_FILE), layout.to_toml()?)?;

        info!(
            "Froze {} files ({} bytes), copied {} kept files, fingerprint {}",
            units, bytes, kept_files, fingerprint
        );
        Ok(FreezeReport {
            units,
            kept_files,
            bytes,
            fingerprint,
        })
    }

    fn copy_tree(&self, src: &Path, dst: &Path) -> Result<usize> {
        fs::create_dir_all(dst)?;
        let walker = WalkDir::new(src)
            .min_depth(1)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !self.excluded(e));

        let mut copied = 0;
        for entry in walker {
            let entry = entry.map_err(io::Error::from)?;
            let to = dst.join(relative_name(src, entry.path())?);
            if entry.file_type().is_dir() {
                fs::create_dir_all(&to)?;
            } else {
                fs::copy(entry.path(), &to)?;
                debug!("  [K] {}", to.display());
                copied += 1;
            }
        }
        Ok(copied)
    }

    /// Build an OTA bundle of `source` in `dest`
    pub fn package(&self, source: &Path, dest: &Path) -> Result<PackageReport> {
        let entries: Vec<SourceEntry> = self
            .walk(source)?
            .into_iter()
            .filter(|e| e.kind != SourceKind::Kept)
            .collect();

        for entry in &entries {
            let len = archive_name(entry).len();
            if len > NAME_LEN {
                return Err(FreezeError::NameTooLong {
                    name: entry.relative.clone(),
                    len,
                });
            }
        }

        let fingerprint = self.fingerprint(source, &entries)?;
        fs::create_dir_all(dest)?;
        let tar_path = dest.join(format!("{}.tar", fingerprint));

        let mut builder = TarBuilder::new(BufWriter::new(File::create(&tar_path)?));
        let mut files = 0;
        let mut directories = 0;
        for entry in &entries {
            match entry.kind {
                SourceKind::Directory => {
                    append_dir(&mut builder, &archive_name(entry))?;
                    directories += 1;
                }
                SourceKind::File => {
                    let file = File::open(&entry.path)?;
                    let len = file.metadata()?.len();
                    append_file(&mut builder, &entry.relative, len, BufReader::new(file))?;
                    files += 1;
                }
                SourceKind::Kept => {}
            }
        }
        builder
            .into_inner()?
            .into_inner()
            .map_err(|e| e.into_error())?
            .sync_all()?;

        let bundle = if self.config.enable_zlib_compression {
            let gz_path = dest.join(format!("{}.tar.gz", fingerprint));
            let mut src = BufReader::new(File::open(&tar_path)?);
            let out = BufWriter::new(File::create(&gz_path)?);
            let mut out = gzip_wrap(&mut src, out, self.config.compression_level)?;
            out.flush()?;
            fs::remove_file(&tar_path)?;
            gz_path
        } else {
            tar_path
        };

        info!(
            "Packaged {} files and {} directories into {}",
            files,
            directories,
            bundle.display()
        );
        Ok(PackageReport {
            bundle,
            files,
            directories,
            fingerprint,
        })
    }
}

/// `/`-separated path of `path` below `root`
fn relative_name(root: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(root).map_err(|_| {
        FreezeError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is outside {}", path.display(), root.display()),
        ))
    })?;
    let parts = rel
        .components()
        .map(|c| {
            c.as_os_str().to_str().ok_or_else(|| FreezeError::Encoding {
                unit: path.display().to_string(),
                reason: "file name is not valid UTF-8".into(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(parts.join("/"))
}

/// Name stored in the archive; directories carry a trailing `/`
fn archive_name(entry: &SourceEntry) -> String {
    match entry.kind {
        SourceKind::Directory | SourceKind::Kept => format!("{}/", entry.relative),
        SourceKind::File => entry.relative.clone(),
    }
}

fn append_file<W: Write, R: std::io::Read>(
    builder: &mut TarBuilder<W>,
    path: &str,
    size: u64,
    data: R,
) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_cksum();
    builder.append_data(&mut header, path, data)?;
    Ok(())
}

fn append_dir<W: Write>(builder: &mut TarBuilder<W>, path: &str) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Directory);
    header.set_size(0);
    header.set_mode(0o755);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_cksum();
    builder.append_data(&mut header, path, &[] as &[u8])?;
    Ok(())
}
