//! OTA bundle applier
//!
//! A bundle is a `.tar` or `.tar.gz` dropped next to the code by some
//! transfer mechanism. Applying it:
//!
//! 1. gzip bundles are unwrapped to a sibling `<stem>.tar` (through a `.part`
//!    file), then the `.tar.gz` is removed
//! 2. every file entry is streamed into the staging directory and synced
//! 3. directories are created and staged files renamed onto their destinations
//! 4. the archive is deleted and a restart is requested
//!
//! Any failure before step 4 leaves the bundle where it was, so the next
//! attempt starts over from the same input.

use crate::archive::{ArchiveReader, EntryKind, BLOCK_SIZE};
use crate::compression::GzipUnwrap;
use crate::error::{FreezeError, Result};
use crate::layout::DeviceLayout;
use crate::restart::{Restart, RestartReason};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

const TAR_SUFFIX: &str = ".tar";
const TAR_GZ_SUFFIX: &str = ".tar.gz";
const PART_SUFFIX: &str = ".part";

/// Bundle flavour, decided by file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleKind {
    Tar,
    TarGz,
}

impl BundleKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        if name.ends_with(TAR_GZ_SUFFIX) && name.len() > TAR_GZ_SUFFIX.len() {
            Some(BundleKind::TarGz)
        } else if name.ends_with(TAR_SUFFIX) && name.len() > TAR_SUFFIX.len() {
            Some(BundleKind::Tar)
        } else {
            None
        }
    }
}

/// Find the single pending bundle in `dir`.
///
/// A `<stem>.tar` sitting next to `<stem>.tar.gz` is the leftover of an
/// interrupted unwrap and is folded into the `.tar.gz`. More than one
/// remaining candidate is an [`FreezeError::AmbiguousBundle`].
pub fn find_pending_bundle(dir: &Path) -> Result<Option<PathBuf>> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        if BundleKind::from_path(&path).is_some() {
            candidates.push(path);
        }
    }
    candidates.sort();

    let gz: Vec<PathBuf> = candidates
        .iter()
        .filter(|p| BundleKind::from_path(p) == Some(BundleKind::TarGz))
        .cloned()
        .collect();
    candidates.retain(|p| match BundleKind::from_path(p) {
        Some(BundleKind::Tar) => !gz.iter().any(|g| unwrapped_path(g).as_deref() == Some(p.as_path())),
        _ => true,
    });

    match candidates.len() {
        0 => Ok(None),
        1 => Ok(candidates.pop()),
        _ => Err(FreezeError::AmbiguousBundle(
            candidates.iter().map(|p| p.display().to_string()).collect(),
        )),
    }
}

/// Sibling archive path a `.tar.gz` bundle unwraps to
fn unwrapped_path(bundle: &Path) -> Option<PathBuf> {
    let name = bundle.file_name()?.to_str()?;
    let stem = name.strip_suffix(TAR_GZ_SUFFIX)?;
    Some(bundle.with_file_name(format!("{}{}", stem, TAR_SUFFIX)))
}

/// Decompress a `.tar.gz` bundle into its sibling `.tar` and remove the source.
///
/// Returns the path of the plain archive.
pub fn unwrap_bundle(bundle: &Path) -> Result<PathBuf> {
    let target = unwrapped_path(bundle)
        .ok_or_else(|| FreezeError::UnsupportedBundle(bundle.display().to_string()))?;
    let mut part = target.clone().into_os_string();
    part.push(PART_SUFFIX);
    let part = PathBuf::from(part);

    info!("Unwrapping {} -> {}", bundle.display(), target.display());
    if let Err(e) = gunzip_file(bundle, &part) {
        if let Err(cleanup) = fs::remove_file(&part) {
            debug!("No partial file to clean up at {}: {}", part.display(), cleanup);
        }
        return Err(e);
    }

    fs::rename(&part, &target)?;
    fs::remove_file(bundle)?;
    Ok(target)
}

fn gunzip_file(src: &Path, dst: &Path) -> Result<u64> {
    let mut gz = GzipUnwrap::new(BufReader::new(File::open(src)?))?;
    let mut out = BufWriter::new(File::create(dst)?);
    let mut buf = [0u8; BLOCK_SIZE];
    let mut total = 0u64;
    loop {
        let n = gz.pull(&mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        total += n as u64;
    }
    out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    debug!("Unwrapped {} archive bytes", total);
    Ok(total)
}

/// Summary of an applied bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    /// Plain archive that was extracted and deleted
    pub archive: PathBuf,
    pub directories: usize,
    pub files: usize,
    pub bytes: u64,
}

/// One archive member after phase 1
#[derive(Debug)]
enum Staged {
    Directory(PathBuf),
    File { staged: PathBuf, dest: PathBuf },
}

pub struct OtaApplier<'a> {
    layout: &'a DeviceLayout,
}

impl<'a> OtaApplier<'a> {
    pub fn new(layout: &'a DeviceLayout) -> Self {
        OtaApplier { layout }
    }

    /// Apply the bundle found in the layout root, if there is exactly one
    pub fn apply_pending(&self, restart: &mut dyn Restart) -> Result<Option<ApplyReport>> {
        let bundle = match find_pending_bundle(&self.layout.root) {
            Ok(Some(bundle)) => bundle,
            Ok(None) => {
                debug!("No pending bundle in {}", self.layout.root.display());
                return Ok(None);
            }
            Err(e) => {
                error!("Bundle discovery failed: {}", e);
                return Err(e);
            }
        };
        self.apply(&bundle, restart).map(Some)
    }

    /// Apply `bundle`, delete it and request a restart
    pub fn apply(&self, bundle: &Path, restart: &mut dyn Restart) -> Result<ApplyReport> {
        info!("Applying bundle {}", bundle.display());
        match self.extract(bundle) {
            Ok(report) => {
                info!(
                    "Bundle applied: {} directories, {} files, {} bytes",
                    report.directories, report.files, report.bytes
                );
                restart.restart(RestartReason::BundleApplied);
                Ok(report)
            }
            Err(e) => {
                error!("Failed to apply bundle {}: {}", bundle.display(), e);
                Err(e)
            }
        }
    }

    fn extract(&self, bundle: &Path) -> Result<ApplyReport> {
        let archive = match BundleKind::from_path(bundle) {
            Some(BundleKind::Tar) => bundle.to_path_buf(),
            Some(BundleKind::TarGz) => unwrap_bundle(bundle)?,
            None => return Err(FreezeError::UnsupportedBundle(bundle.display().to_string())),
        };

        let staged = match self.stage(&archive) {
            Ok(staged) => staged,
            Err(e) => {
                self.clear_staging();
                return Err(e);
            }
        };
        let (directories, files) = self.commit(&staged)?;
        self.clear_staging();

        let bytes = staged_bytes(&staged);
        fs::remove_file(&archive)?;
        info!("Removed {}", archive.display());

        Ok(ApplyReport {
            archive,
            directories,
            files,
            bytes,
        })
    }

    /// Phase 1: copy every file entry into the staging directory
    fn stage(&self, archive: &Path) -> Result<Vec<(Staged, u64)>> {
        let staging = &self.layout.staging_dir;
        if staging.exists() {
            fs::remove_dir_all(staging)?;
        }
        fs::create_dir_all(staging)?;

        let mut reader = ArchiveReader::open(archive)?;
        let mut buf = [0u8; BLOCK_SIZE];
        let mut staged = Vec::new();

        while let Some(entry) = reader.next_entry()? {
            if entry.is_root_dir() {
                debug!("  dir  {} (root, exists)", entry.name);
                continue;
            }
            let dest = self.layout.root.join(entry.destination()?);
            match entry.kind {
                EntryKind::Directory => {
                    debug!("  dir  {}", entry.name);
                    staged.push((Staged::Directory(dest), 0));
                }
                EntryKind::File => {
                    let scratch = staging.join(format!("{:06}", staged.len()));
                    let mut out = BufWriter::new(File::create(&scratch)?);
                    let written = reader.entry_reader().copy_to(&mut out, &mut buf)?;
                    out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
                    debug!("  file {} ({} bytes)", entry.name, written);
                    staged.push((
                        Staged::File {
                            staged: scratch,
                            dest,
                        },
                        written,
                    ));
                }
            }
        }

        Ok(staged)
    }

    /// Phase 2: create directories and move staged files into place
    fn commit(&self, staged: &[(Staged, u64)]) -> Result<(usize, usize)> {
        let mut directories = 0;
        let mut files = 0;
        for (item, _) in staged {
            match item {
                Staged::Directory(path) => {
                    fs::create_dir_all(path)?;
                    directories += 1;
                }
                Staged::File { staged, dest } => {
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::rename(staged, dest)?;
                    info!("  {}", dest.display());
                    files += 1;
                }
            }
        }
        Ok((directories, files))
    }

    fn clear_staging(&self) {
        match fs::remove_dir_all(&self.layout.staging_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to clear staging directory {}: {}",
                self.layout.staging_dir.display(),
                e
            ),
        }
    }
}

fn staged_bytes(staged: &[(Staged, u64)]) -> u64 {
    staged.iter().map(|(_, n)| n).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restart::RecordRestart;
    use tempfile::TempDir;

    fn header(name: &str, size: usize) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        block[..name.len()].copy_from_slice(name.as_bytes());
        let size = format!("{:011o}\0", size);
        block[124..136].copy_from_slice(size.as_bytes());
        block[156] = if name.ends_with('/') { b'5' } else { b'0' };
        block
    }

    fn archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, content) in entries {
            out.extend_from_slice(&header(name, content.len()));
            out.extend_from_slice(content);
            out.resize(out.len() + crate::archive::padding_for(content.len() as u64) as usize, 0);
        }
        out.extend_from_slice(&[0u8; BLOCK_SIZE * 2]);
        out
    }

    #[test]
    fn test_bundle_kind() {
        assert_eq!(BundleKind::from_path(Path::new("/f/x.tar")), Some(BundleKind::Tar));
        assert_eq!(BundleKind::from_path(Path::new("/f/x.tar.gz")), Some(BundleKind::TarGz));
        assert_eq!(BundleKind::from_path(Path::new("/f/x.zip")), None);
        assert_eq!(BundleKind::from_path(Path::new("/f/.tar")), None);
    }

    #[test]
    fn test_unwrapped_path() {
        assert_eq!(
            unwrapped_path(Path::new("/flash/abc.tar.gz")).unwrap(),
            Path::new("/flash/abc.tar")
        );
    }

    #[test]
    fn test_find_pending_bundle() {
        let dir = TempDir::new().unwrap();
        assert_eq!(find_pending_bundle(dir.path()).unwrap(), None);

        fs::write(dir.path().join("main.py"), b"").unwrap();
        fs::write(dir.path().join("abc.tar"), b"").unwrap();
        assert_eq!(
            find_pending_bundle(dir.path()).unwrap(),
            Some(dir.path().join("abc.tar"))
        );

        fs::write(dir.path().join("def.tar.gz"), b"").unwrap();
        assert!(matches!(
            find_pending_bundle(dir.path()),
            Err(FreezeError::AmbiguousBundle(names)) if names.len() == 2
        ));
    }

    #[test]
    fn test_leftover_tar_folds_into_gz() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("abc.tar"), b"").unwrap();
        fs::write(dir.path().join("abc.tar.gz"), b"").unwrap();
        assert_eq!(
            find_pending_bundle(dir.path()).unwrap(),
            Some(dir.path().join("abc.tar.gz"))
        );
    }

    #[test]
    fn test_apply_directory_and_file() {
        let dir = TempDir::new().unwrap();
        let layout = DeviceLayout::new(dir.path());
        let bundle = dir.path().join("update.tar");
        fs::write(&bundle, archive(&[("data/", b""), ("data/f.txt", b"hello")])).unwrap();

        let mut restart = RecordRestart::new();
        let report = OtaApplier::new(&layout).apply(&bundle, &mut restart).unwrap();

        assert_eq!(report.directories, 1);
        assert_eq!(report.files, 1);
        assert_eq!(report.bytes, 5);
        assert!(dir.path().join("data").is_dir());
        assert_eq!(fs::read(dir.path().join("data/f.txt")).unwrap(), b"hello");
        assert!(!bundle.exists());
        assert!(!layout.staging_dir.exists());
        assert_eq!(restart.requests(), &[RestartReason::BundleApplied]);
    }

    #[test]
    fn test_truncated_archive_leaves_tree_untouched() {
        let dir = TempDir::new().unwrap();
        let layout = DeviceLayout::new(dir.path());
        fs::write(dir.path().join("main.py"), b"old").unwrap();

        let mut bytes = archive(&[("main.py", b"new"), ("big.bin", &[7u8; 2000])]);
        bytes.truncate(BLOCK_SIZE * 3 + 100);
        let bundle = dir.path().join("update.tar");
        fs::write(&bundle, &bytes).unwrap();

        let mut restart = RecordRestart::new();
        let err = OtaApplier::new(&layout).apply(&bundle, &mut restart).unwrap_err();
        assert!(matches!(err, FreezeError::Format(_)));
        assert_eq!(fs::read(dir.path().join("main.py")).unwrap(), b"old");
        assert!(bundle.exists());
        assert_eq!(restart.count(), 0);
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = TempDir::new().unwrap();
        let layout = DeviceLayout::new(dir.path());
        let bundle = dir.path().join("update.zip");
        fs::write(&bundle, b"PK").unwrap();
        assert!(matches!(
            OtaApplier::new(&layout).apply(&bundle, &mut RecordRestart::new()),
            Err(FreezeError::UnsupportedBundle(_))
        ));
        assert!(bundle.exists());
    }

    #[test]
    fn test_bad_gzip_keeps_bundle() {
        let dir = TempDir::new().unwrap();
        let layout = DeviceLayout::new(dir.path());
        let bundle = dir.path().join("update.tar.gz");
        fs::write(&bundle, b"definitely not gzip").unwrap();

        let err = OtaApplier::new(&layout)
            .apply(&bundle, &mut RecordRestart::new())
            .unwrap_err();
        assert!(matches!(err, FreezeError::Decompression(_)));
        assert!(bundle.exists());
        assert!(!dir.path().join("update.tar").exists());
        assert!(!dir.path().join("update.tar.part").exists());
    }
}
