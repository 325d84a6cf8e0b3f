//! Persistence index (`NodeIndex`, spec §3): the bridge that lets a node
//! recover its `(hash, ref_num)` after restart, keyed by underlying path.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{OptiError, Result};
use crate::hash::{is_empty_or_sentinel, ContentHash};
use crate::stable::StableAttr;

/// One row of the persistence index.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NodeInfo {
    pub stable_ino: u64,
    pub stable_mode: u32,
    pub stable_gen: u32,
    pub mode: u32,
    pub is_dir: bool,
    pub content_hash: ContentHash,
    pub ref_num: u64,
}

#[derive(Debug, Default)]
pub struct NodeIndex {
    map: RwLock<HashMap<String, NodeInfo>>,
}

impl NodeIndex {
    pub fn new() -> Self {
        Self { map: RwLock::new(HashMap::new()) }
    }

    pub async fn load(&self, table: HashMap<String, NodeInfo>) {
        *self.map.write().await = table;
    }

    pub async fn snapshot(&self) -> HashMap<String, NodeInfo> {
        self.map.read().await.clone()
    }

    pub async fn store_regfile(
        &self,
        path: &str,
        stable: StableAttr,
        mode: u32,
        hash: ContentHash,
        ref_num: u64,
    ) {
        let info = NodeInfo {
            stable_ino: stable.ino,
            stable_mode: stable.mode,
            stable_gen: stable.gen,
            mode,
            is_dir: false,
            content_hash: hash,
            ref_num,
        };
        self.map.write().await.insert(path.to_string(), info);
    }

    pub async fn store_dir(&self, path: &str, stable: StableAttr, mode: u32) {
        let info = NodeInfo {
            stable_ino: stable.ino,
            stable_mode: stable.mode,
            stable_gen: stable.gen,
            mode,
            is_dir: true,
            content_hash: crate::hash::ZERO64,
            ref_num: 0,
        };
        self.map.write().await.insert(path.to_string(), info);
    }

    /// `update(path, ...)`: a missing path is a no-op, not an error.
    #[allow(clippy::too_many_arguments)]
    pub async fn update(
        &self,
        path: &str,
        is_dir: Option<bool>,
        stable: Option<StableAttr>,
        mode: Option<u32>,
        hash: Option<ContentHash>,
        ref_num: Option<u64>,
    ) {
        let mut map = self.map.write().await;
        if let Some(info) = map.get_mut(path) {
            if let Some(v) = is_dir {
                info.is_dir = v;
            }
            if let Some(v) = stable {
                info.stable_ino = v.ino;
                info.stable_mode = v.mode;
                info.stable_gen = v.gen;
            }
            if let Some(v) = mode {
                info.mode = v;
            }
            if let Some(v) = hash {
                info.content_hash = v;
            }
            if let Some(v) = ref_num {
                info.ref_num = v;
            }
        }
    }

    pub async fn retrieve(&self, path: &str) -> Result<NodeInfo> {
        self.map.read().await.get(path).copied().ok_or(OptiError::NoData)
    }

    pub async fn remove(&self, path: &str) -> Result<()> {
        self.map.write().await.remove(path).map(|_| ()).ok_or(OptiError::NoData)
    }

    pub async fn rename(&self, old_path: &str, new_path: &str) {
        let mut map = self.map.write().await;
        if let Some(info) = map.remove(old_path) {
            map.insert(new_path.to_string(), info);
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

    /// All paths currently indexed, for the startup integrity scan.
    pub async fn all_paths(&self) -> Vec<String> {
        self.map.read().await.keys().cloned().collect()
    }

    pub async fn has_written_content(&self, path: &str) -> bool {
        match self.retrieve(path).await {
            Ok(info) => !is_empty_or_sentinel(&info.content_hash),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stable() -> StableAttr {
        StableAttr { ino: 1, gen: 0, mode: 0o100644 }
    }

    #[tokio::test]
    async fn store_and_retrieve_regfile() {
        let idx = NodeIndex::new();
        idx.store_regfile("/a", stable(), 0o644, crate::hash::ZERO64, 0).await;
        let info = idx.retrieve("/a").await.unwrap();
        assert!(!info.is_dir);
    }

    #[tokio::test]
    async fn update_missing_path_is_noop() {
        let idx = NodeIndex::new();
        idx.update("/missing", Some(true), None, None, None, None).await;
        assert_eq!(idx.retrieve("/missing").await.unwrap_err(), OptiError::NoData);
    }

    #[tokio::test]
    async fn remove_then_retrieve_is_enodata() {
        let idx = NodeIndex::new();
        idx.store_dir("/d", stable(), 0o755).await;
        idx.remove("/d").await.unwrap();
        assert_eq!(idx.retrieve("/d").await.unwrap_err(), OptiError::NoData);
    }

    #[tokio::test]
    async fn exchange_swaps_both_rows() {
        let idx = NodeIndex::new();
        idx.store_regfile("/a", stable(), 0o644, crate::hash::ZERO64, 0).await;
        idx.store_dir("/b", stable(), 0o755).await;
        idx.exchange("/a", "/b").await;
        assert!(idx.retrieve("/a").await.unwrap().is_dir);
        assert!(!idx.retrieve("/b").await.unwrap().is_dir);
    }
}
