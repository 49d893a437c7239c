//! Defrost reconstructor
//!
//! Rebuilds the deployed file tree from the numbered units in the defrost
//! directory. The run is all-or-nothing with respect to the fingerprint: it
//! is only persisted once every unit has been written, so an interrupted or
//! failed run is simply repeated from unit 0 on the next boot. Each file is
//! fully overwritten, which makes the repetition safe.

use crate::compression::CompressionMethod;
use crate::error::{FreezeError, Result};
use crate::fingerprint::Fingerprint;
use crate::layout::DeviceLayout;
use crate::restart::{Restart, RestartReason};
use crate::unit::{unit_file_name, unit_path, EncodedUnit, PackageManifest, UnitFile};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

const PART_SUFFIX: &str = ".part";

/// Progress of a reconstruction run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefrostState {
    NotStarted,
    /// Units below `next_unit` have been written
    InProgress { next_unit: usize },
    Completed { units: usize },
}

/// Result of a successful [`Defroster::run`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefrostOutcome {
    /// Persisted fingerprint already matched; nothing was written
    AlreadyCurrent,
    /// All units written, fingerprint persisted, restart requested
    Completed { units: usize, bytes: u64 },
}

pub struct Defroster<'a> {
    layout: &'a DeviceLayout,
    state: DefrostState,
    remove_units: bool,
}

impl<'a> Defroster<'a> {
    pub fn new(layout: &'a DeviceLayout) -> Self {
        Defroster {
            layout,
            state: DefrostState::NotStarted,
            remove_units: layout.remove_units,
        }
    }

    /// Delete the unit files once the fingerprint has been persisted.
    ///
    /// Defaults to [`DeviceLayout::remove_units`].
    pub fn remove_units_after(mut self, remove: bool) -> Self {
        self.remove_units = remove;
        self
    }

    pub fn state(&self) -> DefrostState {
        self.state
    }

    /// Manifest shipped alongside the units
    pub fn manifest(&self) -> Result<PackageManifest> {
        PackageManifest::load(&self.layout.defrost_dir)
    }

    /// Fingerprint persisted by the last successful run, if any.
    ///
    /// An unreadable or garbled fingerprint file counts as absent.
    pub fn actual_fingerprint(&self) -> Option<Fingerprint> {
        match Fingerprint::load(&self.layout.fingerprint_path) {
            Ok(fp) => fp,
            Err(e) => {
                warn!(
                    "Ignoring unreadable fingerprint {}: {}",
                    self.layout.fingerprint_path.display(),
                    e
                );
                None
            }
        }
    }

    pub fn needs_defrost(&self, target: &Fingerprint) -> bool {
        self.actual_fingerprint().as_ref() != Some(target)
    }

    /// Reconstruct unless the persisted fingerprint already matches the manifest
    pub fn run(&mut self, restart: &mut dyn Restart) -> Result<DefrostOutcome> {
        let manifest = self.manifest()?;
        if !self.needs_defrost(&manifest.fingerprint) {
            debug!("Fingerprint {} is current, nothing to defrost", manifest.fingerprint);
            return Ok(DefrostOutcome::AlreadyCurrent);
        }
        self.reconstruct(&manifest, restart)
    }

    /// Write every unit, persist the target fingerprint and request a restart
    pub fn reconstruct(
        &mut self,
        manifest: &PackageManifest,
        restart: &mut dyn Restart,
    ) -> Result<DefrostOutcome> {
        info!(
            "Starting defrost from {} (compression: {:?})",
            self.layout.defrost_dir.display(),
            manifest.compression
        );

        let mut index = 0usize;
        let mut bytes = 0u64;
        self.state = DefrostState::InProgress { next_unit: 0 };

        loop {
            let path = unit_path(&self.layout.defrost_dir, index);
            let written = match UnitFile::load(&path) {
                Ok(None) => break,
                Ok(Some(file)) => self.write_unit(index, &file, manifest.compression),
                Err(e) => Err(e),
            };

            match written {
                Ok(n) => bytes += n,
                Err(e) => {
                    error!("Defrost aborted at {}: {}", unit_file_name(index), e);
                    return Err(e);
                }
            }

            index += 1;
            self.state = DefrostState::InProgress { next_unit: index };
        }

        if index == 0 {
            let err = FreezeError::NoUnits(self.layout.defrost_dir.display().to_string());
            error!("{}", err);
            return Err(err);
        }

        manifest.fingerprint.persist(&self.layout.fingerprint_path)?;
        info!(
            "Defrosted {} units ({} bytes), fingerprint {} persisted",
            index, bytes, manifest.fingerprint
        );

        if self.remove_units {
            self.remove_unit_files(index);
        }

        self.state = DefrostState::Completed { units: index };
        restart.restart(RestartReason::DefrostCompleted);
        Ok(DefrostOutcome::Completed { units: index, bytes })
    }

    fn write_unit(&self, index: usize, file: &UnitFile, method: CompressionMethod) -> Result<u64> {
        let name = unit_file_name(index);
        let unit: EncodedUnit = file.decode(&name)?;
        let dest = self.layout.resolve(&unit.destination_path)?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        // The destination keeps its old bytes until the unit has fully decoded
        let mut part = dest.clone().into_os_string();
        part.push(PART_SUFFIX);
        let part = PathBuf::from(part);

        let written = match write_part(&unit, method, &part) {
            Ok(written) => written,
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&part) {
                    debug!("No partial file to clean up at {}: {}", part.display(), cleanup);
                }
                return Err(e);
            }
        };
        fs::rename(&part, &dest)?;

        info!("  {} -> {} ({} bytes)", name, dest.display(), written);
        Ok(written)
    }

    fn remove_unit_files(&self, count: usize) {
        for index in 0..count {
            let path = unit_path(&self.layout.defrost_dir, index);
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }
}

fn write_part(unit: &EncodedUnit, method: CompressionMethod, part: &Path) -> Result<u64> {
    let mut out = BufWriter::new(File::create(part)?);
    let written = unit.write_content(method, &mut out)?;
    out.flush()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::DEFAULT_LEVEL;
    use crate::fingerprint::FingerprintBuilder;
    use crate::restart::RecordRestart;
    use tempfile::TempDir;

    fn ship(layout: &DeviceLayout, files: &[(&str, &[u8])], method: CompressionMethod) -> Fingerprint {
        fs::create_dir_all(&layout.defrost_dir).unwrap();
        let mut builder = FingerprintBuilder::new();
        for (i, (path, content)) in files.iter().enumerate() {
            let unit = EncodedUnit::encode(path, content, method, DEFAULT_LEVEL).unwrap();
            unit.to_file().save(&unit_path(&layout.defrost_dir, i)).unwrap();
            builder.add_bytes(path, content);
        }
        let fp = builder.finish();
        PackageManifest::new(fp.clone(), method).save(&layout.defrost_dir).unwrap();
        fp
    }

    #[test]
    fn test_reconstructs_units() {
        let dir = TempDir::new().unwrap();
        let layout = DeviceLayout::new(dir.path());
        let fp = ship(&layout, &[("a.py", b"print(1)"), ("sub/b.py", b"x=1")], CompressionMethod::Zlib);

        let mut restart = RecordRestart::new();
        let mut defroster = Defroster::new(&layout);
        let outcome = defroster.run(&mut restart).unwrap();

        assert_eq!(outcome, DefrostOutcome::Completed { units: 2, bytes: 11 });
        assert_eq!(defroster.state(), DefrostState::Completed { units: 2 });
        assert_eq!(fs::read(dir.path().join("a.py")).unwrap(), b"print(1)");
        assert_eq!(fs::read(dir.path().join("sub/b.py")).unwrap(), b"x=1");
        assert_eq!(Fingerprint::load(&layout.fingerprint_path).unwrap(), Some(fp));
        assert_eq!(restart.requests(), &[RestartReason::DefrostCompleted]);
    }

    #[test]
    fn test_uncompressed_units() {
        let dir = TempDir::new().unwrap();
        let layout = DeviceLayout::new(dir.path());
        ship(&layout, &[("boot.py", b"import main")], CompressionMethod::None);

        Defroster::new(&layout).run(&mut RecordRestart::new()).unwrap();
        assert_eq!(fs::read(dir.path().join("boot.py")).unwrap(), b"import main");
    }

    #[test]
    fn test_current_fingerprint_skips() {
        let dir = TempDir::new().unwrap();
        let layout = DeviceLayout::new(dir.path());
        let fp = ship(&layout, &[("a.py", b"print(1)")], CompressionMethod::Zlib);
        fp.persist(&layout.fingerprint_path).unwrap();

        let mut restart = RecordRestart::new();
        let outcome = Defroster::new(&layout).run(&mut restart).unwrap();
        assert_eq!(outcome, DefrostOutcome::AlreadyCurrent);
        assert!(!dir.path().join("a.py").exists());
        assert_eq!(restart.count(), 0);
    }

    #[test]
    fn test_stops_at_first_gap() {
        let dir = TempDir::new().unwrap();
        let layout = DeviceLayout::new(dir.path());
        ship(&layout, &[("a.py", b"1"), ("b.py", b"2"), ("c.py", b"3")], CompressionMethod::Zlib);
        fs::remove_file(unit_path(&layout.defrost_dir, 1)).unwrap();

        let outcome = Defroster::new(&layout).run(&mut RecordRestart::new()).unwrap();
        assert_eq!(outcome, DefrostOutcome::Completed { units: 1, bytes: 1 });
        assert!(!dir.path().join("c.py").exists());
    }

    #[test]
    fn test_no_units() {
        let dir = TempDir::new().unwrap();
        let layout = DeviceLayout::new(dir.path());
        ship(&layout, &[], CompressionMethod::Zlib);

        let mut restart = RecordRestart::new();
        let err = Defroster::new(&layout).run(&mut restart).unwrap_err();
        assert!(matches!(err, FreezeError::NoUnits(_)));
        assert!(!layout.fingerprint_path.exists());
        assert_eq!(restart.count(), 0);
    }

    #[test]
    fn test_bad_unit_aborts_without_fingerprint() {
        let dir = TempDir::new().unwrap();
        let layout = DeviceLayout::new(dir.path());
        ship(&layout, &[("a.py", b"print(1)"), ("b.py", b"x=1")], CompressionMethod::Zlib);
        UnitFile {
            path: "b.py".into(),
            data: "@@@".into(),
        }
        .save(&unit_path(&layout.defrost_dir, 1))
        .unwrap();

        let mut restart = RecordRestart::new();
        let mut defroster = Defroster::new(&layout);
        let err = defroster.run(&mut restart).unwrap_err();
        assert!(matches!(err, FreezeError::Encoding { .. }));
        assert_eq!(defroster.state(), DefrostState::InProgress { next_unit: 1 });
        assert_eq!(fs::read(dir.path().join("a.py")).unwrap(), b"print(1)");
        assert!(!layout.fingerprint_path.exists());
        assert_eq!(restart.count(), 0);
    }

    #[test]
    fn test_truncated_unit_keeps_existing_file() {
        let dir = TempDir::new().unwrap();
        let layout = DeviceLayout::new(dir.path());
        let old = b"def main():\n    return 'working'\n";
        fs::write(dir.path().join("main.py"), old).unwrap();

        let content: Vec<u8> = (0..8000u32).map(|i| (i * 31 % 251) as u8).collect();
        ship(&layout, &[("main.py", content.as_slice())], CompressionMethod::Zlib);
        let unit = EncodedUnit::encode("main.py", &content, CompressionMethod::Zlib, DEFAULT_LEVEL).unwrap();
        EncodedUnit {
            destination_path: unit.destination_path.clone(),
            payload: unit.payload[..unit.payload.len() / 2].to_vec(),
        }
        .to_file()
        .save(&unit_path(&layout.defrost_dir, 0))
        .unwrap();

        let err = Defroster::new(&layout).run(&mut RecordRestart::new()).unwrap_err();
        assert!(matches!(err, FreezeError::Decompression(_)));
        assert_eq!(fs::read(dir.path().join("main.py")).unwrap(), old);
        assert!(!dir.path().join("main.py.part").exists());
        assert!(!layout.fingerprint_path.exists());
    }

    #[test]
    fn test_unit_escaping_root_is_rejected() {
        let dir = TempDir::new().unwrap();
        let layout = DeviceLayout::new(dir.path().join("flash"));
        ship(&layout, &[("../outside.py", b"nope")], CompressionMethod::Zlib);

        let err = Defroster::new(&layout).run(&mut RecordRestart::new()).unwrap_err();
        assert!(matches!(err, FreezeError::Format(_)));
        assert!(!dir.path().join("outside.py").exists());
    }

    #[test]
    fn test_remove_units_after() {
        let dir = TempDir::new().unwrap();
        let layout = DeviceLayout::new(dir.path());
        ship(&layout, &[("a.py", b"1"), ("b.py", b"2")], CompressionMethod::Zlib);

        Defroster::new(&layout)
            .remove_units_after(true)
            .run(&mut RecordRestart::new())
            .unwrap();
        assert!(!unit_path(&layout.defrost_dir, 0).exists());
        assert!(!unit_path(&layout.defrost_dir, 1).exists());
        assert!(layout.defrost_dir.join(PackageManifest::FILE_NAME).exists());
    }

    #[test]
    fn test_garbled_fingerprint_counts_as_mismatch() {
        let dir = TempDir::new().unwrap();
        let layout = DeviceLayout::new(dir.path());
        let fp = ship(&layout, &[("a.py", b"1")], CompressionMethod::Zlib);
        fs::write(&layout.fingerprint_path, "garbage").unwrap();

        let defroster = Defroster::new(&layout);
        assert!(defroster.actual_fingerprint().is_none());
        assert!(defroster.needs_defrost(&fp));
    }
}
