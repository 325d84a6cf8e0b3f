//! Directory store (`DirStore`, spec §3): metadata keyed by underlying
//! directory path, created lazily on first attribute change or `mkdir`.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::error::{OptiError, Result};

use super::{Metadata, Timespec};

#[derive(Debug, Default)]
pub struct DirStore {
    map: RwLock<HashMap<String, Metadata>>,
}

impl DirStore {
    pub fn new() -> Self {
        Self { map: RwLock::new(HashMap::new()) }
    }

    pub async fn load(&self, table: HashMap<String, Metadata>) {
        *self.map.write().await = table;
    }

    pub async fn snapshot(&self) -> HashMap<String, Metadata> {
        self.map.read().await.clone()
    }

    /// `create(path)`: insert a default entry with an empty xattr map.
    pub async fn create(&self, path: &str) {
        let mut map = self.map.write().await;
        map.entry(path.to_string()).or_default();
    }

    pub async fn lookup(&self, path: &str) -> Result<Metadata> {
        self.map.read().await.get(path).cloned().ok_or(OptiError::NoData)
    }

    pub async fn contains(&self, path: &str) -> bool {
        self.map.read().await.contains_key(path)
    }

    pub async fn remove(&self, path: &str) -> Result<()> {
        self.map.write().await.remove(path).map(|_| ()).ok_or(OptiError::NoData)
    }

    /// Re-key an entry after a directory rename, if one exists.
    pub async fn rename(&self, old_path: &str, new_path: &str) {
        let mut map = self.map.write().await;
        if let Some(meta) = map.remove(old_path) {
            map.insert(new_path.to_string(), meta);
        }
    }

    /// `RENAME_EXCHANGE`: swap the rows at two paths in one locked step.
    pub async fn exchange(&self, path_a: &str, path_b: &str) {
        let mut map = self.map.write().await;
        let a = map.remove(path_a);
        let b = map.remove(path_b);
        if let Some(b) = b {
            map.insert(path_a.to_string(), b);
        }
        if let Some(a) = a {
            map.insert(path_b.to_string(), a);
        }
    }

    pub async fn update_full(
        &self,
        path: &str,
        stat: super::UnderlyingStat,
        stable_ino: u64,
        stable_gen: u32,
        mode: u32,
    ) -> Result<()> {
        let mut map = self.map.write().await;
        let meta = map.get_mut(path).ok_or(OptiError::NoData)?;
        meta.atim = stat.atim;
        meta.mtim = stat.mtim;
        meta.ctim = stat.ctim;
        meta.rdev = stat.rdev;
        meta.nlink = stat.nlink;
        meta.size = stat.size;
        meta.blksize = stat.blksize;
        meta.blocks = stat.blocks;
        meta.dev = stat.dev;
        meta.mode = mode;
        meta.ino = stable_ino;
        meta.gen = stable_gen;
        meta.path = path.to_string();
        Ok(())
    }

    pub async fn update_mode(&self, path: &str, mode: u32) -> Result<()> {
        self.with_metadata_mut(path, |m| m.mode = mode).await
    }

    pub async fn update_owner(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        self.with_metadata_mut(path, |m| {
            if let Some(uid) = uid {
                m.uid = uid;
            }
            if let Some(gid) = gid {
                m.gid = gid;
            }
        })
        .await
    }

    pub async fn update_time(
        &self,
        path: &str,
        atim: Option<Timespec>,
        mtim: Option<Timespec>,
        ctim: Option<Timespec>,
    ) -> Result<()> {
        self.with_metadata_mut(path, |m| {
            if let Some(v) = atim {
                m.atim = v;
            }
            if let Some(v) = mtim {
                m.mtim = v;
            }
            if let Some(v) = ctim {
                m.ctim = v;
            }
        })
        .await
    }

    pub async fn xattr_get(&self, path: &str, key: &str) -> Result<Vec<u8>> {
        self.map.read().await.get(path).ok_or(OptiError::NoData)?.xattr_get(key)
    }

    pub async fn xattr_set(&self, path: &str, key: &str, value: Vec<u8>, flags: u32) -> Result<()> {
        let mut map = self.map.write().await;
        map.get_mut(path).ok_or(OptiError::NoData)?.xattr_set(key, value, flags)
    }

    pub async fn xattr_remove(&self, path: &str, key: &str) -> Result<()> {
        let mut map = self.map.write().await;
        map.get_mut(path).ok_or(OptiError::Io)?.xattr_remove(key)
    }

    pub async fn xattr_list(&self, path: &str, buffer_len: usize) -> Result<Vec<u8>> {
        self.map.read().await.get(path).ok_or(OptiError::Io)?.xattr_list(buffer_len)
    }

    async fn with_metadata_mut(&self, path: &str, f: impl FnOnce(&mut Metadata)) -> Result<()> {
        let mut map = self.map.write().await;
        let meta = map.get_mut(path).ok_or(OptiError::NoData)?;
        f(meta);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_is_idempotent() {
        let store = DirStore::new();
        store.create("/a").await;
        store.xattr_set("/a", "k", b"v".to_vec(), 0).await.unwrap();
        store.create("/a").await; // must not clobber existing metadata
        assert_eq!(store.xattr_get("/a", "k").await.unwrap(), b"v");
    }

    #[tokio::test]
    async fn rmdir_removes_entry() {
        let store = DirStore::new();
        store.create("/a").await;
        store.remove("/a").await.unwrap();
        assert_eq!(store.lookup("/a").await.unwrap_err(), OptiError::NoData);
    }
}
