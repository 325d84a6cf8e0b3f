//! Thin external-collaborator binary (spec §6): argument parsing, log
//! initialisation, and mount-lifecycle wiring. Contains no core logic — it
//! only constructs an `optivfs::lifecycle::Instance` from parsed
//! configuration and drives it. The FUSE kernel transport itself is out of
//! scope (spec §1); a real deployment would hand `root_node` to a
//! `fuser`-shaped crate here.

use clap::Parser;

use optivfs::config::{Cli, Config};
use optivfs::lifecycle::Instance;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match Config::try_from(cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("optivfsd: invalid configuration: {}", e);
            std::process::exit(2);
        }
    };

    optivfs::logging::init(config.debug);

    let sysadmin_override = if config.sysadmin_uid.is_some() || config.sysadmin_gid.is_some() {
        Some((config.sysadmin_uid, config.sysadmin_gid))
    } else {
        None
    };

    let start = Instance::start(
        config.underlying_root.clone(),
        config.persistence_dir.clone(),
        config.snapshot_interval,
        config.rm_persistence,
        sysadmin_override,
    )
    .await;

    let (instance, _root_node) = match start {
        Ok(pair) => pair,
        Err(e) => {
            tracing::error!(error = %e, "failed to start optivfs instance");
            std::process::exit(1);
        }
    };

    tracing::info!(mountpoint = %config.mountpoint.display(), "optivfsd ready (FUSE transport not wired in this build)");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to install ctrl-c handler");
    }

    instance.shutdown().await;
}
