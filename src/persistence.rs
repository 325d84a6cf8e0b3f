//! Persistence engine (C4): encode/decode the three stores and the sysadmin
//! record to four on-disk blobs, a periodic snapshotter, and the startup
//! integrity scan.
//!
//! Encoding is `bincode` over `serde`-derived types: a compact, self
//! describing-enough binary format that round-trips the data model, as the
//! spec requires without mandating a specific wire format.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task;
use tokio::time::interval;

use crate::store::dir::DirStore;
use crate::store::index::NodeIndex;
use crate::store::reg::RegStore;
use crate::sysadmin::{Sysadmin, SysadminRecord};

/// The fixed file names of the four persisted blobs (spec §6).
pub struct Paths {
    dir: PathBuf,
}

impl Paths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn reg_blob(&self) -> PathBuf {
        self.dir.join("OptiFSRegularFileMetadataSave.gob")
    }

    pub fn dir_blob(&self) -> PathBuf {
        self.dir.join("OptiFSDirMetadataSave.gob")
    }

    pub fn node_blob(&self) -> PathBuf {
        self.dir.join("OptiFSNodePersistenceSave.gob")
    }

    pub fn sysadmin_blob(&self) -> PathBuf {
        self.dir.join("OptiFSSysadminSave.gob")
    }

    /// `-rm-persistence`: delete the four blobs before loading, if present.
    pub fn remove_all(&self) -> std::io::Result<()> {
        for path in [self.reg_blob(), self.dir_blob(), self.node_blob(), self.sysadmin_blob()] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn write_blob<T: serde::Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let bytes = bincode::serialize(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &bytes)?;
    let file = std::fs::File::open(&tmp)?;
    file.sync_all()?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn read_blob<T: serde::de::DeserializeOwned>(path: &Path) -> std::io::Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let value = bincode::deserialize(&bytes)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Persist one store's table to disk under its own exclusive lock, held for
/// the whole read-and-encode.
pub async fn save_reg(paths: &Paths, store: &RegStore) -> std::io::Result<()> {
    let table = store.snapshot().await;
    let path = paths.reg_blob();
    task::spawn_blocking(move || write_blob(&path, &table)).await.unwrap()
}

pub async fn save_dir(paths: &Paths, store: &DirStore) -> std::io::Result<()> {
    let table = store.snapshot().await;
    let path = paths.dir_blob();
    task::spawn_blocking(move || write_blob(&path, &table)).await.unwrap()
}

pub async fn save_node(paths: &Paths, store: &NodeIndex) -> std::io::Result<()> {
    let table = store.snapshot().await;
    let path = paths.node_blob();
    task::spawn_blocking(move || write_blob(&path, &table)).await.unwrap()
}

pub async fn save_sysadmin(paths: &Paths, admin: &Sysadmin) -> std::io::Result<()> {
    let record = admin.snapshot().await;
    let path = paths.sysadmin_blob();
    task::spawn_blocking(move || write_blob(&path, &record)).await.unwrap()
}

/// Missing files are not errors: a fresh start just begins with empty stores.
pub async fn retrieve_reg(paths: &Paths, store: &RegStore) -> std::io::Result<()> {
    let path = paths.reg_blob();
    if let Some(table) = task::spawn_blocking(move || read_blob(&path)).await.unwrap()? {
        store.load(table).await;
    }
    Ok(())
}

pub async fn retrieve_dir(paths: &Paths, store: &DirStore) -> std::io::Result<()> {
    let path = paths.dir_blob();
    if let Some(table) = task::spawn_blocking(move || read_blob(&path)).await.unwrap()? {
        store.load(table).await;
    }
    Ok(())
}

pub async fn retrieve_node(paths: &Paths, store: &NodeIndex) -> std::io::Result<()> {
    let path = paths.node_blob();
    if let Some(table) = task::spawn_blocking(move || read_blob(&path)).await.unwrap()? {
        store.load(table).await;
    }
    Ok(())
}

pub async fn retrieve_sysadmin(paths: &Paths) -> std::io::Result<Option<SysadminRecord>> {
    let path = paths.sysadmin_blob();
    task::spawn_blocking(move || read_blob(&path)).await.unwrap()
}

/// Save all three data stores, in the order spec §4.4 specifies: Node, Reg,
/// Dir.
pub async fn save_all(paths: &Paths, node: &NodeIndex, reg: &RegStore, dir: &DirStore) {
    if let Err(e) = save_node(paths, node).await {
        tracing::warn!(error = %e, "snapshot: failed to save node index");
    }
    if let Err(e) = save_reg(paths, reg).await {
        tracing::warn!(error = %e, "snapshot: failed to save regular-file store");
    }
    if let Err(e) = save_dir(paths, dir).await {
        tracing::warn!(error = %e, "snapshot: failed to save directory store");
    }
}

/// Spawn the background snapshotter: wakes every `interval` seconds and runs
/// `save_all`. Runs until the returned handle is aborted.
pub fn spawn_snapshotter(
    paths: Arc<Paths>,
    node: Arc<NodeIndex>,
    reg: Arc<RegStore>,
    dir: Arc<DirStore>,
    period: Duration,
) -> task::JoinHandle<()> {
    task::spawn(async move {
        let mut ticker = interval(period);
        ticker.tick().await; // first tick fires immediately; skip it.
        loop {
            ticker.tick().await;
            tracing::debug!("periodic snapshot starting");
            save_all(&paths, &node, &reg, &dir).await;
            tracing::debug!("periodic snapshot complete");
        }
    })
}

/// Startup integrity scan (spec §4.4): for each indexed path, `lstat` the
/// underlying filesystem; on failure, collect it, then purge it from the
/// owning store and finally from the index (I7). Deletes are deferred to
/// avoid mutating the index while iterating it.
pub async fn ensure_integrity(root: &Path, node: &NodeIndex, reg: &RegStore, dir: &DirStore) {
    let paths = node.all_paths().await;
    let mut dangling = Vec::new();
    for path in paths {
        let abs = root.join(&path);
        let ok = task::spawn_blocking(move || crate::fsops::exists(&abs)).await.unwrap();
        if !ok {
            dangling.push(path);
        }
    }

    for path in &dangling {
        if let Ok(info) = node.retrieve(path).await {
            if info.is_dir {
                let _ = dir.remove(path).await;
            } else if !crate::hash::is_empty_or_sentinel(&info.content_hash) {
                let _ = reg.remove_metadata(info.content_hash, info.ref_num).await;
            }
        }
        let _ = node.remove(path).await;
    }

    if !dangling.is_empty() {
        tracing::info!(count = dangling.len(), "integrity scan pruned dangling paths");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stable::StableAttr;

    #[tokio::test]
    async fn snapshot_round_trip_reg_p10() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let store = RegStore::new();
        let h = crate::hash::hash_content(b"abc");
        store.create_metadata(h).await.unwrap();
        save_reg(&paths, &store).await.unwrap();

        let restored = RegStore::new();
        retrieve_reg(&paths, &restored).await.unwrap();
        let original = store.lookup_entry(h).await.unwrap();
        let loaded = restored.lookup_entry(h).await.unwrap();
        assert_eq!(original.ref_count, loaded.ref_count);
        assert_eq!(original.index_counter, loaded.index_counter);
    }

    #[tokio::test]
    async fn missing_blob_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let store = RegStore::new();
        retrieve_reg(&paths, &store).await.unwrap();
        assert!(store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn integrity_scan_prunes_only_deleted_paths_p9() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("keep.txt"), b"x").unwrap();
        std::fs::write(tmp.path().join("gone.txt"), b"y").unwrap();

        let node = NodeIndex::new();
        let reg = RegStore::new();
        let dir = DirStore::new();
        let stable = StableAttr { ino: 1, gen: 0, mode: 0o100644 };
        node.store_regfile("keep.txt", stable, 0o644, crate::hash::ZERO64, 0).await;
        node.store_regfile("gone.txt", stable, 0o644, crate::hash::ZERO64, 0).await;

        std::fs::remove_file(tmp.path().join("gone.txt")).unwrap();

        ensure_integrity(tmp.path(), &node, &reg, &dir).await;

        assert!(node.retrieve("keep.txt").await.is_ok());
        assert!(node.retrieve("gone.txt").await.is_err());
    }
}
