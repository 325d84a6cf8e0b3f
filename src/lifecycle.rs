//! Mount lifecycle (C8): the startup and shutdown sequence spec §4.8
//! describes. The FUSE kernel transport itself is out of scope (spec §1);
//! `Instance` owns the in-memory state and the background snapshotter a real
//! transport would sit on top of.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::node::{Shared, VirtualNode};
use crate::persistence::{self, Paths};
use crate::store::dir::DirStore;
use crate::store::index::NodeIndex;
use crate::store::reg::RegStore;
use crate::sysadmin::{Sysadmin, SysadminRecord};

pub struct Instance {
    pub shared: Arc<Shared>,
    paths: Arc<Paths>,
    snapshotter: JoinHandle<()>,
}

impl Instance {
    /// Startup order (spec §4.8): retrieve-or-default sysadmin, retrieve the
    /// three stores, run the integrity scan, start the snapshotter.
    pub async fn start(
        underlying_root: PathBuf,
        persistence_dir: PathBuf,
        snapshot_interval: Duration,
        rm_persistence: bool,
        sysadmin_override: Option<(Option<u32>, Option<u32>)>,
    ) -> crate::error::Result<(Self, VirtualNode)> {
        let paths = Arc::new(Paths::new(persistence_dir));
        if rm_persistence {
            paths.remove_all().map_err(crate::error::OptiError::from)?;
        }

        let sysadmin_record = persistence::retrieve_sysadmin(&paths).await.unwrap_or(None).unwrap_or_default();
        let sysadmin = Arc::new(Sysadmin::new(sysadmin_record));
        sysadmin.ensure_set().await;
        if let Some((uid, gid)) = sysadmin_override {
            if let Some(uid) = uid {
                sysadmin.set_uid(uid).await?;
            }
            if let Some(gid) = gid {
                sysadmin.set_gid(gid).await?;
            }
        }
        persistence::save_sysadmin(&paths, &sysadmin).await.ok();

        let reg = Arc::new(RegStore::new());
        let dir = Arc::new(DirStore::new());
        let node_index = Arc::new(NodeIndex::new());
        persistence::retrieve_reg(&paths, &reg).await.ok();
        persistence::retrieve_dir(&paths, &dir).await.ok();
        persistence::retrieve_node(&paths, &node_index).await.ok();

        persistence::ensure_integrity(&underlying_root, &node_index, &reg, &dir).await;

        let root_dev = {
            let root = underlying_root.clone();
            let raw = tokio::task::spawn_blocking(move || crate::fsops::lstat(&root)).await.unwrap()?;
            raw.dev
        };
        let shared = Arc::new(Shared { root: underlying_root, root_dev, reg: reg.clone(), dir: dir.clone(), node_index: node_index.clone(), sysadmin });

        let snapshotter = persistence::spawn_snapshotter(paths.clone(), node_index, reg, dir, snapshot_interval);

        let root_node = VirtualNode::root(shared.clone()).await?;
        tracing::info!("optivfs instance started");
        Ok((Instance { shared, paths, snapshotter }, root_node))
    }

    /// Shutdown: final `save_all`, then stop the snapshotter.
    pub async fn shutdown(self) {
        persistence::save_all(&self.paths, &self.shared.node_index, &self.shared.reg, &self.shared.dir).await;
        self.snapshotter.abort();
        tracing::info!("optivfs instance shut down, final snapshot written");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_and_shutdown_round_trip_s6() {
        let underlying = tempfile::tempdir().unwrap();
        let persisted = tempfile::tempdir().unwrap();

        let (instance, root) = Instance::start(
            underlying.path().to_path_buf(),
            persisted.path().to_path_buf(),
            Duration::from_secs(30),
            false,
            None,
        )
        .await
        .unwrap();

        let caller = crate::perm::Caller { uid: 1000, gid: 1000 };
        let (mut node, handle, _) = root.create("a.txt", libc::O_RDWR, 0o644, caller).await.unwrap();
        node.write(&handle, b"hi", 0).await.unwrap();
        handle.release().await.unwrap();

        instance.shutdown().await;

        let (instance2, root2) = Instance::start(
            underlying.path().to_path_buf(),
            persisted.path().to_path_buf(),
            Duration::from_secs(30),
            false,
            None,
        )
        .await
        .unwrap();
        let found = root2.lookup("a.txt").await.unwrap();
        assert_eq!(found.hash, crate::hash::hash_content(b"hi"));
        instance2.shutdown().await;
    }
}
