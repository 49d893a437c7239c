//! Boot gate
//!
//! Runs once, early. Compares the persisted fingerprint with the one shipped
//! in the defrost directory and defrosts on mismatch. A failed defrost does
//! not restart the device: it boots with whatever files are present and the
//! next boot tries again.

use crate::defrost::{DefrostOutcome, Defroster};
use crate::error::Result;
use crate::layout::DeviceLayout;
use crate::restart::Restart;
use crate::unit::PackageManifest;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootDecision {
    /// Fingerprints matched; nothing was touched
    UpToDate,
    /// Units were reconstructed and a restart requested
    Defrosted { units: usize },
    /// Reconstruction failed; boot continues without a restart
    DefrostFailed { reason: String },
}

pub struct BootGate<'a> {
    layout: &'a DeviceLayout,
}

impl<'a> BootGate<'a> {
    pub fn new(layout: &'a DeviceLayout) -> Self {
        BootGate { layout }
    }

    /// Errors only when the shipped manifest itself cannot be read
    pub fn check(&self, restart: &mut dyn Restart) -> Result<BootDecision> {
        let manifest = PackageManifest::load(&self.layout.defrost_dir)?;
        let mut defroster = Defroster::new(self.layout);

        let actual = defroster.actual_fingerprint();
        if actual.as_ref() == Some(&manifest.fingerprint) {
            debug!("Package fingerprint {} unchanged", manifest.fingerprint);
            return Ok(BootDecision::UpToDate);
        }

        info!(
            "Package fingerprint changed ({} -> {}), defrosting",
            actual.as_ref().map(|fp| fp.as_str()).unwrap_or("none"),
            manifest.fingerprint
        );

        match defroster.reconstruct(&manifest, restart) {
            Ok(DefrostOutcome::Completed { units, .. }) => Ok(BootDecision::Defrosted { units }),
            Ok(DefrostOutcome::AlreadyCurrent) => Ok(BootDecision::UpToDate),
            Err(e) => {
                warn!("Continuing boot with existing files: {}", e);
                Ok(BootDecision::DefrostFailed {
                    reason: e.to_string(),
                })
            }
        }
    }
}
