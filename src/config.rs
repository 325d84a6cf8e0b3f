//! Command-line configuration (A3): the exact flags of spec §6, parsed with
//! `clap` derive the way the teacher crate's own CLI layer does.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::{OptiError, Result};

#[derive(Debug, Parser)]
#[command(name = "optivfsd", about = "A user-space loopback deduplicating virtual filesystem")]
pub struct Cli {
    /// Where the virtual filesystem is mounted.
    pub mountpoint: PathBuf,

    /// The backing POSIX tree being presented through the mount.
    pub underlying_root: PathBuf,

    /// Enable verbose tracing.
    #[arg(long = "debug", default_value_t = false)]
    pub debug: bool,

    /// Delete the four persisted snapshot blobs before loading.
    #[arg(long = "rm-persistence", default_value_t = false)]
    pub rm_persistence: bool,

    /// Periodic snapshot interval, in seconds.
    #[arg(long = "snapshot-interval", default_value_t = 30)]
    pub snapshot_interval: u64,

    /// Administrative override for the sysadmin uid.
    #[arg(long = "sysadmin-uid")]
    pub sysadmin_uid: Option<u32>,

    /// Administrative override for the sysadmin gid.
    #[arg(long = "sysadmin-gid")]
    pub sysadmin_gid: Option<u32>,

    /// Directory the four persistence blobs live under. Defaults to the
    /// underlying root's parent.
    #[arg(long = "persistence-dir")]
    pub persistence_dir: Option<PathBuf>,
}

/// Validated configuration handed to `lifecycle::Instance::start`.
pub struct Config {
    pub mountpoint: PathBuf,
    pub underlying_root: PathBuf,
    pub debug: bool,
    pub rm_persistence: bool,
    pub snapshot_interval: Duration,
    pub sysadmin_uid: Option<u32>,
    pub sysadmin_gid: Option<u32>,
    pub persistence_dir: PathBuf,
}

impl TryFrom<Cli> for Config {
    type Error = OptiError;

    fn try_from(cli: Cli) -> Result<Self> {
        let persistence_dir = cli.persistence_dir.unwrap_or_else(|| {
            cli.underlying_root.parent().map(PathBuf::from).unwrap_or_else(|| cli.underlying_root.clone())
        });
        Ok(Config {
            mountpoint: cli.mountpoint,
            underlying_root: cli.underlying_root,
            debug: cli.debug,
            rm_persistence: cli.rm_persistence,
            snapshot_interval: Duration::from_secs(cli.snapshot_interval),
            sysadmin_uid: cli.sysadmin_uid,
            sysadmin_gid: cli.sysadmin_gid,
            persistence_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cli = Cli::parse_from(["optivfsd", "/mnt", "/data"]);
        assert!(!cli.debug);
        assert!(!cli.rm_persistence);
        assert_eq!(cli.snapshot_interval, 30);
        assert!(cli.sysadmin_uid.is_none());
    }

    #[test]
    fn persistence_dir_defaults_to_root_parent() {
        let cli = Cli::parse_from(["optivfsd", "/mnt", "/data/tree"]);
        let cfg = Config::try_from(cli).unwrap();
        assert_eq!(cfg.persistence_dir, PathBuf::from("/data"));
    }
}
