//! CLI, FUSE binding and control channel for CuttleFS.

mod control;
mod fuse_adapter;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use cuttlefs::{Facade, FsyncKind};
use fuse_adapter::CuttleFuse;

#[derive(Parser)]
#[command(name = "cuttlefs", version, about = "A fault-injecting FUSE filesystem for studying fsync journaling behavior")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mount a CuttleFS instance.
    Mount(Box<MountArgs>),
    /// Generate shell completion scripts.
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

#[derive(clap::Args)]
struct MountArgs {
    /// Directory whose contents back the mount's logical namespace.
    root: PathBuf,
    /// Where to mount the filesystem.
    mountpoint: PathBuf,

    /// Directory for the block-manager backing file and deferred-delete
    /// staging area. Defaults to `<mountpoint>.cuttlefs-meta`.
    #[arg(long)]
    fs_metadir: Option<PathBuf>,

    /// Fsync reporting policy to simulate.
    #[arg(long, default_value = "ext4-ordered")]
    fsync_behavior: FsyncBehavior,

    /// Path to a JSON fault-list document (see the fault-list format in the
    /// design docs).
    #[arg(long)]
    fault_list: Option<PathBuf>,

    /// TCP port the control channel listens on.
    #[arg(long, default_value_t = 7243)]
    control_port: u16,

    /// Log verbosity.
    #[arg(long, default_value = "info")]
    log_level: LogLevel,

    /// Stay attached to the controlling terminal instead of forking into
    /// the background.
    #[arg(long)]
    foreground: bool,
}

/// CLI-facing mirror of [`cuttlefs::FsyncKind`]; kept distinct so the core
/// crate carries no `clap` dependency.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum FsyncBehavior {
    /// ext4 in `data=ordered` mode.
    #[default]
    Ext4Ordered,
    /// XFS.
    Xfs,
    /// ext4 in a journaling mode with deferred error reporting.
    Ext4Data,
    /// Btrfs's copy-on-write commit-or-revert policy.
    Btrfs,
}

impl From<FsyncBehavior> for FsyncKind {
    fn from(value: FsyncBehavior) -> Self {
        match value {
            FsyncBehavior::Ext4Ordered => Self::Ext4Ordered,
            FsyncBehavior::Xfs => Self::Xfs,
            FsyncBehavior::Ext4Data => Self::Ext4Data,
            FsyncBehavior::Btrfs => Self::Btrfs,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    /// Only errors.
    Error,
    /// Errors and warnings.
    Warn,
    /// The default: errors, warnings, and informational messages.
    #[default]
    Info,
    /// Verbose, includes per-operation tracing.
    Debug,
    /// Everything, including fault-injection decisions.
    Trace,
}

impl LogLevel {
    const fn filter(self) -> log::LevelFilter {
        match self {
            Self::Error => log::LevelFilter::Error,
            Self::Warn => log::LevelFilter::Warn,
            Self::Info => log::LevelFilter::Info,
            Self::Debug => log::LevelFilter::Debug,
            Self::Trace => log::LevelFilter::Trace,
        }
    }
}

fn main() {
    if let Err(e) = Cli::parse().dispatch() {
        eprintln!("cuttlefs: {e:#}");
        std::process::exit(1);
    }
}

impl Cli {
    fn dispatch(self) -> Result<()> {
        match self.command {
            Command::Mount(args) => mount(*args),
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "cuttlefs", &mut std::io::stdout());
                Ok(())
            }
        }
    }
}

fn metadir_for(mountpoint: &Path, explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| {
        let mut name = mountpoint
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".cuttlefs-meta");
        mountpoint.with_file_name(name)
    })
}

fn mount(args: MountArgs) -> Result<()> {
    env_logger::Builder::new()
        .filter_level(args.log_level.filter())
        .init();

    let metadir = metadir_for(&args.mountpoint, args.fs_metadir);
    let fault_specs = match &args.fault_list {
        Some(path) => {
            cuttlefs::load_fault_list(path).with_context(|| format!("loading fault list {}", path.display()))?
        }
        None => Vec::new(),
    };

    let facade = Facade::new(&args.root, &metadir, args.fsync_behavior.into(), &fault_specs)
        .context("constructing CuttleFS facade")?;
    let facade = Arc::new(Mutex::new(facade));

    if !args.foreground {
        // Fork before spawning any thread: threads other than the caller
        // do not survive a fork, so the control channel must start after.
        daemonize()?;
    }

    control::spawn(Arc::clone(&facade), args.control_port).context("starting control channel")?;

    let fs = CuttleFuse::new(facade, args.root.clone());
    let options = vec![
        fuser::MountOption::FSName("cuttlefs".to_string()),
        fuser::MountOption::DefaultPermissions,
    ];
    log::info!("mounting {} at {}", args.root.display(), args.mountpoint.display());
    fuser::mount2(fs, &args.mountpoint, &options).context("FUSE mount loop exited")
}

/// Detaches from the controlling terminal by forking once, letting the
/// parent exit immediately.
#[allow(unsafe_code)]
fn daemonize() -> Result<()> {
    match unsafe { nix::unistd::fork() }.context("fork")? {
        nix::unistd::ForkResult::Parent { .. } => std::process::exit(0),
        nix::unistd::ForkResult::Child => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadir_defaults_alongside_the_mountpoint() {
        let mountpoint = PathBuf::from("/mnt/cuttle");
        assert_eq!(
            metadir_for(&mountpoint, None),
            PathBuf::from("/mnt/cuttle.cuttlefs-meta")
        );
    }

    #[test]
    fn metadir_respects_explicit_override() {
        let mountpoint = PathBuf::from("/mnt/cuttle");
        let explicit = PathBuf::from("/var/lib/cuttlefs-meta");
        assert_eq!(
            metadir_for(&mountpoint, Some(explicit.clone())),
            explicit
        );
    }

    #[test]
    fn fsync_behavior_maps_onto_fsync_kind() {
        assert!(matches!(
            FsyncKind::from(FsyncBehavior::Btrfs),
            FsyncKind::Btrfs
        ));
    }
}
