//! Freezer core
//!
//! Build-host encoder plus the device-side pipeline that turns its output
//! back into files.
//!
//! ## Build host
//!
//! - [`config`] - JSON options (`config.json`)
//! - [`freezer`] - source walk, unit encoding, OTA bundle creation
//!
//! ## Device
//!
//! - [`archive`] - forward-only reader for 512-byte-block archives
//! - [`compression`] - pull-based inflate and gzip unwrap
//! - [`unit`] - encoded unit files and the package manifest
//! - [`fingerprint`] - SHA-256 package identity
//! - [`defrost`] - rebuilds files from units
//! - [`ota`] - applies `.tar` / `.tar.gz` bundles
//! - [`boot`] - fingerprint check run at startup
//! - [`restart`] - restart hook every terminal operation ends with
//! - [`layout`] - where everything lives on the device
//!
//! ## Data flow
//!
//! ```text
//!            ┌──────────────┐
//!  source ──►│   Freezer    │──► Custom/_todefrost/unit_<n>.toml + package.toml
//!            │              │──► <fingerprint>.tar[.gz]
//!            └──────────────┘
//!
//!  boot ──► BootGate ── mismatch ──► Defroster ──► files + package.fingerprint ──► restart
//!
//!  bundle ──► OtaApplier ── gunzip ──► ArchiveReader ──► staging ──► rename ──► restart
//! ```

pub mod archive;
pub mod boot;
pub mod compression;
pub mod config;
pub mod defrost;
pub mod error;
pub mod fingerprint;
pub mod freezer;
pub mod layout;
pub mod ota;
pub mod restart;
pub mod unit;

// Re-export commonly used types
pub use archive::{ArchiveEntry, ArchiveReader, EntryKind};
pub use boot::{BootDecision, BootGate};
pub use compression::{CompressionMethod, Framing, GzipUnwrap, InflateStream};
pub use config::FreezerConfig;
pub use defrost::{DefrostOutcome, DefrostState, Defroster};
pub use error::{FreezeError, Result};
pub use fingerprint::{Fingerprint, FingerprintBuilder};
pub use freezer::{FreezeReport, Freezer, PackageReport};
pub use layout::DeviceLayout;
pub use ota::{find_pending_bundle, ApplyReport, BundleKind, OtaApplier};
pub use restart::{ExitProcess, RecordRestart, Restart, RestartReason};
pub use unit::{EncodedUnit, PackageManifest, UnitFile};

/// Crate version, logged by the CLI
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
