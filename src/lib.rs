//! # microfreeze - Deploy code to small devices as frozen units or OTA bundles
//!
//! The build host turns a source tree into either:
//!
//! - **Encoded units**: one `unit_<n>.toml` per file plus a fingerprint,
//!   flashed with the firmware and *defrosted* into real files on first boot
//! - **An OTA bundle**: `<fingerprint>.tar` or `.tar.gz`, dropped onto a
//!   running device and applied in place
//!
//! The device side never needs the whole file, archive or decompressed
//! payload in memory: archives are walked block by block and payloads are
//! inflated through a small buffer.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use microfreeze::{Freezer, FreezerConfig, Result};
//! use std::path::Path;
//!
//! # fn main() -> Result<()> {
//! let config = FreezerConfig::load("config.json")?;
//! let freezer = Freezer::new(config);
//!
//! // Units for a fresh flash
//! let report = freezer.freeze(Path::new("app"), Path::new("out"))?;
//! println!("{} units, fingerprint {}", report.units, report.fingerprint);
//!
//! // Bundle for an update
//! let bundle = freezer.package(Path::new("app"), Path::new("ota"))?;
//! println!("bundle at {}", bundle.bundle.display());
//! # Ok(())
//! # }
//! ```
//!
//! ## On the device
//!
//! ```rust,no_run
//! use microfreeze::{Device, ExitProcess, Result};
//!
//! # fn main() -> Result<()> {
//! let device = Device::from_config_file("/flash/device.toml")?;
//! let mut restart = ExitProcess;
//!
//! // Defrost if the shipped fingerprint changed, then restart
//! device.boot(&mut restart)?;
//!
//! // Apply a pending bundle if one was uploaded
//! device.apply_pending(&mut restart)?;
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use self::core::{
    archive, boot, compression, config, defrost, error, fingerprint, freezer, layout, ota, restart,
    unit,
};

// Re-export core types that users need
pub use crate::core::{
    archive::{ArchiveEntry, ArchiveReader, EntryKind},
    boot::{BootDecision, BootGate},
    compression::{CompressionMethod, Framing, GzipUnwrap, InflateStream},
    config::{FreezerConfig, DEFAULT_CONFIG_FILE},
    defrost::{DefrostOutcome, DefrostState, Defroster},
    error::{FreezeError, Result},
    fingerprint::{Fingerprint, FingerprintBuilder},
    freezer::{FreezeReport, Freezer, PackageReport},
    layout::DeviceLayout,
    ota::{find_pending_bundle, ApplyReport, BundleKind, OtaApplier},
    restart::{ExitProcess, RecordRestart, Restart, RestartReason},
    unit::{EncodedUnit, PackageManifest, UnitFile},
    VERSION,
};

use std::path::Path;
use tracing::{debug, info};

/// Device-side entry point
///
/// Owns a [`DeviceLayout`] and runs the boot gate, the defroster and the OTA
/// applier against it. Every operation that completes its work ends with a
/// call to the supplied [`Restart`].
///
/// # Examples
///
/// ```rust,no_run
/// use microfreeze::{Device, RecordRestart};
///
/// # fn main() -> microfreeze::Result<()> {
/// let device = Device::new("/flash");
/// let mut restart = RecordRestart::new();
/// let decision = device.boot(&mut restart)?;
/// println!("{:?}, {} restart(s) requested", decision, restart.count());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Device {
    layout: DeviceLayout,
}

impl Device {
    /// Device rooted at `root` with the default layout
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Device {
            layout: DeviceLayout::new(root),
        }
    }

    /// Device described by a `device.toml` written by the freezer
    pub fn from_config_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let layout = DeviceLayout::load(path.as_ref())?;
        debug!("Loaded device layout from {}", path.as_ref().display());
        Ok(Device { layout })
    }

    pub fn with_layout(layout: DeviceLayout) -> Self {
        Device { layout }
    }

    pub fn layout(&self) -> &DeviceLayout {
        &self.layout
    }

    /// Compare fingerprints and defrost on mismatch
    pub fn boot(&self, restart: &mut dyn Restart) -> Result<BootDecision> {
        info!("Boot check in {}", self.layout.root.display());
        BootGate::new(&self.layout).check(restart)
    }

    /// Defrost unless the installed fingerprint is already current
    pub fn defrost(&self, restart: &mut dyn Restart) -> Result<DefrostOutcome> {
        Defroster::new(&self.layout).run(restart)
    }

    /// Apply a specific bundle file
    pub fn apply_bundle<P: AsRef<Path>>(
        &self,
        bundle: P,
        restart: &mut dyn Restart,
    ) -> Result<ApplyReport> {
        OtaApplier::new(&self.layout).apply(bundle.as_ref(), restart)
    }

    /// Apply the single bundle waiting in the device root, if any
    pub fn apply_pending(&self, restart: &mut dyn Restart) -> Result<Option<ApplyReport>> {
        OtaApplier::new(&self.layout).apply_pending(restart)
    }

    /// Fingerprint persisted by the last successful defrost
    pub fn installed_fingerprint(&self) -> Option<Fingerprint> {
        Defroster::new(&self.layout).actual_fingerprint()
    }

    /// Fingerprint shipped with the current units
    pub fn shipped_fingerprint(&self) -> Result<Fingerprint> {
        Ok(PackageManifest::load(&self.layout.defrost_dir)?.fingerprint)
    }
}
