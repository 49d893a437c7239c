//! microfreeze command line
//!
//! Build host: `freeze` and `package`. Device side (or a host mirror of the
//! device filesystem): `boot` and `apply`.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use microfreeze::{
    BootDecision, Device, DeviceLayout, ExitProcess, Freezer, FreezerConfig, DEFAULT_CONFIG_FILE,
    VERSION,
};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "microfreeze")]
#[command(version, about = "Freeze application trees for constrained devices and defrost them on boot")]
struct Args {
    /// Build-host configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Encode a source tree into units for a fresh flash
    Freeze {
        /// Project directory
        source: PathBuf,
        /// Output directory (receives Base/ and Custom/)
        dest: PathBuf,
    },

    /// Build an OTA bundle from a source tree
    Package {
        /// Project directory
        source: PathBuf,
        /// Output directory for <fingerprint>.tar[.gz]
        dest: PathBuf,
    },

    /// Defrost units if the shipped fingerprint changed
    Boot {
        /// Device filesystem root
        #[arg(short, long)]
        root: PathBuf,

        /// Delete unit files after a successful defrost
        #[arg(long)]
        remove_units: bool,
    },

    /// Apply an OTA bundle
    Apply {
        /// Device filesystem root
        #[arg(short, long)]
        root: PathBuf,

        /// Bundle to apply; the root is scanned when omitted
        bundle: Option<PathBuf>,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<FreezerConfig> {
    match path {
        Some(path) => FreezerConfig::load(path)
            .with_context(|| format!("loading config {}", path.display())),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => FreezerConfig::load(DEFAULT_CONFIG_FILE)
            .with_context(|| format!("loading config {}", DEFAULT_CONFIG_FILE)),
        None => {
            info!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
            Ok(FreezerConfig::default())
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("microfreeze {}", VERSION);

    match args.command {
        Command::Freeze { source, dest } => {
            let freezer = Freezer::new(load_config(args.config.as_deref())?);
            let report = freezer
                .freeze(&source, &dest)
                .with_context(|| format!("freezing {}", source.display()))?;
            info!(
                "Wrote {} units to {} (fingerprint {})",
                report.units,
                dest.display(),
                report.fingerprint
            );
        }
        Command::Package { source, dest } => {
            let freezer = Freezer::new(load_config(args.config.as_deref())?);
            let report = freezer
                .package(&source, &dest)
                .with_context(|| format!("packaging {}", source.display()))?;
            info!("Bundle ready: {}", report.bundle.display());
        }
        Command::Boot { root, remove_units } => {
            let layout = DeviceLayout::new(&root).with_remove_units(remove_units);
            let device = Device::with_layout(layout);
            match device.boot(&mut ExitProcess)? {
                BootDecision::UpToDate => info!("Package up to date"),
                BootDecision::Defrosted { units } => info!("Defrosted {} units", units),
                BootDecision::DefrostFailed { reason } => {
                    warn!("Defrost failed, booting existing files: {}", reason)
                }
            }
        }
        Command::Apply { root, bundle } => {
            let device = Device::new(&root);
            let mut restart = ExitProcess;
            match bundle {
                Some(bundle) => {
                    if !bundle.is_file() {
                        bail!("bundle {} does not exist", bundle.display());
                    }
                    device.apply_bundle(&bundle, &mut restart)?;
                }
                None => {
                    if device.apply_pending(&mut restart)?.is_none() {
                        info!("No pending bundle in {}", root.display());
                    }
                }
            }
        }
    }

    Ok(())
}
