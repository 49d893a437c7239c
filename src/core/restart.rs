//! Device restart hook
//!
//! Every terminal device operation ends by asking for a restart. The request
//! goes through [`Restart`] so firmware can reset the board, the CLI can exit
//! and tests can simply record what was asked for.

use std::fmt;
use tracing::info;

/// Why a restart was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// All units were reconstructed and the fingerprint persisted
    DefrostCompleted,
    /// An OTA bundle was applied and deleted
    BundleApplied,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartReason::DefrostCompleted => write!(f, "defrost completed"),
            RestartReason::BundleApplied => write!(f, "bundle applied"),
        }
    }
}

pub trait Restart {
    fn restart(&mut self, reason: RestartReason);
}

/// Ends the current process with status 0
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitProcess;

impl Restart for ExitProcess {
    fn restart(&mut self, reason: RestartReason) {
        info!("Restarting: {}", reason);
        std::process::exit(0);
    }
}

/// Records restart requests instead of acting on them
#[derive(Debug, Default, Clone)]
pub struct RecordRestart {
    requests: Vec<RestartReason>,
}

impl RecordRestart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> &[RestartReason] {
        &self.requests
    }

    pub fn count(&self) -> usize {
        self.requests.len()
    }

    pub fn last(&self) -> Option<RestartReason> {
        self.requests.last().copied()
    }
}

impl Restart for RecordRestart {
    fn restart(&mut self, reason: RestartReason) {
        info!("Restart requested: {}", reason);
        self.requests.push(reason);
    }
}

impl<T: Restart + ?Sized> Restart for &mut T {
    fn restart(&mut self, reason: RestartReason) {
        (**self).restart(reason)
    }
}
