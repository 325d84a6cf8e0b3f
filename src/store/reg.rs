//! Regular-file store (`RegStore`, spec §3 "Regular-file store").
//!
//! One `ContentEntry` per live content hash, reference-counted by the
//! `Metadata` records (one per logical file sharing that content) it holds.
//! Garbage-collected to zero entries on last removal (I2).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{OptiError, Result};
use crate::hash::{is_empty_or_sentinel, ContentHash};

use super::{Metadata, UnderlyingStat};

/// All `Metadata` records sharing one content hash.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentEntry {
    pub ref_count: u32,
    pub index_counter: u64,
    pub entries: HashMap<u64, Metadata>,
    /// Inode of the hardlink target backing all references; 0 when unset.
    pub underlying_ino: u32,
}

impl ContentEntry {
    /// I1 check, exposed for tests (P1).
    pub fn is_consistent(&self) -> bool {
        self.ref_count as usize == self.entries.len()
            && self.index_counter >= self.entries.keys().copied().max().unwrap_or(0)
    }
}

/// `most_recent(&entry)`: the largest present ref_num, scanning downward
/// from `index_counter`.
pub fn most_recent_ref_num(entry: &ContentEntry) -> Option<u64> {
    (1..=entry.index_counter).rev().find(|r| entry.entries.contains_key(r))
}

#[derive(Debug, Default)]
pub struct RegStore {
    map: RwLock<HashMap<ContentHash, ContentEntry>>,
}

impl RegStore {
    pub fn new() -> Self {
        Self { map: RwLock::new(HashMap::new()) }
    }

    /// Replace the whole table (used by the persistence engine's `retrieve`).
    pub async fn load(&self, table: HashMap<ContentHash, ContentEntry>) {
        *self.map.write().await = table;
    }

    /// Clone the whole table (used by the persistence engine's `save`).
    pub async fn snapshot(&self) -> HashMap<ContentHash, ContentEntry> {
        self.map.read().await.clone()
    }

    /// `get_or_create_entry(hash)`: no-op if present, else insert empty.
    pub async fn get_or_create_entry(&self, hash: ContentHash) {
        if is_empty_or_sentinel(&hash) {
            return; // I3: the zero hash is never a key.
        }
        let mut map = self.map.write().await;
        map.entry(hash).or_default();
    }

    /// `create_metadata(&entry)`: allocate a new ref_num + default metadata,
    /// creating the entry first if needed.
    pub async fn create_metadata(&self, hash: ContentHash) -> Result<(u64, Metadata)> {
        if is_empty_or_sentinel(&hash) {
            return Err(OptiError::InvalidArgument);
        }
        let mut map = self.map.write().await;
        let entry = map.entry(hash).or_default();
        entry.index_counter += 1;
        let ref_num = entry.index_counter;
        let meta = Metadata::default();
        entry.entries.insert(ref_num, meta.clone());
        entry.ref_count += 1;
        Ok((ref_num, meta))
    }

    pub async fn lookup_metadata(&self, hash: ContentHash, ref_num: u64) -> Result<Metadata> {
        let map = self.map.read().await;
        map.get(&hash)
            .and_then(|e| e.entries.get(&ref_num))
            .cloned()
            .ok_or(OptiError::NoData)
    }

    pub async fn lookup_entry(&self, hash: ContentHash) -> Result<ContentEntry> {
        let map = self.map.read().await;
        map.get(&hash).cloned().ok_or(OptiError::NoData)
    }

    /// `remove_metadata(hash, ref_num)`: cascades to remove the whole
    /// `ContentEntry` once `ref_count` hits zero (I2).
    pub async fn remove_metadata(&self, hash: ContentHash, ref_num: u64) -> Result<()> {
        let mut map = self.map.write().await;
        let remove_entry = {
            let entry = map.get_mut(&hash).ok_or(OptiError::NoData)?;
            if entry.entries.remove(&ref_num).is_none() {
                return Err(OptiError::NoData);
            }
            entry.ref_count = entry.ref_count.saturating_sub(1);
            entry.ref_count == 0
        };
        if remove_entry {
            map.remove(&hash);
        }
        Ok(())
    }

    pub async fn most_recent(&self, hash: ContentHash) -> Result<Option<(u64, Metadata)>> {
        let map = self.map.read().await;
        let entry = map.get(&hash).ok_or(OptiError::NoData)?;
        Ok(most_recent_ref_num(entry).map(|r| (r, entry.entries[&r].clone())))
    }

    pub async fn update_full(
        &self,
        hash: ContentHash,
        ref_num: u64,
        stat: UnderlyingStat,
        stable_ino: u64,
        stable_gen: u32,
        mode: u32,
        path: String,
    ) -> Result<()> {
        let mut map = self.map.write().await;
        let meta = map
            .get_mut(&hash)
            .and_then(|e| e.entries.get_mut(&ref_num))
            .ok_or(OptiError::NoData)?;
        apply_unstable(meta, &stat);
        meta.mode = mode;
        meta.ino = stable_ino;
        meta.gen = stable_gen;
        meta.path = path;
        Ok(())
    }

    /// Write an already-migrated `Metadata` record through verbatim,
    /// replacing whatever is currently stored at `(hash, ref_num)`. Used
    /// after `migrate_regular`/`migrate_duplicate`/`initialise_new_duplicate`
    /// have computed the full record in memory, so fields like `ctim`,
    /// `dev`, and `xattr` aren't silently dropped by a narrower update.
    pub async fn apply_metadata(&self, hash: ContentHash, ref_num: u64, meta: Metadata) -> Result<()> {
        let mut map = self.map.write().await;
        let slot = map
            .get_mut(&hash)
            .and_then(|e| e.entries.get_mut(&ref_num))
            .ok_or(OptiError::NoData)?;
        *slot = meta;
        Ok(())
    }

    pub async fn update_mode(&self, hash: ContentHash, ref_num: u64, mode: u32) -> Result<()> {
        self.with_metadata_mut(hash, ref_num, |m| m.mode = mode).await
    }

    pub async fn update_owner(
        &self,
        hash: ContentHash,
        ref_num: u64,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> Result<()> {
        self.with_metadata_mut(hash, ref_num, |m| {
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
        hash: ContentHash,
        ref_num: u64,
        atim: Option<super::Timespec>,
        mtim: Option<super::Timespec>,
        ctim: Option<super::Timespec>,
    ) -> Result<()> {
        self.with_metadata_mut(hash, ref_num, |m| {
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

    pub async fn update_size(&self, hash: ContentHash, ref_num: u64, size: u64) -> Result<()> {
        self.with_metadata_mut(hash, ref_num, |m| m.size = size).await
    }

    pub async fn update_link_count(&self, hash: ContentHash, ref_num: u64, nlink: u32) -> Result<()> {
        self.with_metadata_mut(hash, ref_num, |m| m.nlink = nlink).await
    }

    pub async fn update_location(
        &self,
        hash: ContentHash,
        ref_num: u64,
        ino: Option<u64>,
        dev: Option<u64>,
    ) -> Result<()> {
        self.with_metadata_mut(hash, ref_num, |m| {
            if let Some(v) = ino {
                m.ino = v;
            }
            if let Some(v) = dev {
                m.dev = v;
            }
        })
        .await
    }

    pub async fn xattr_get(&self, hash: ContentHash, ref_num: u64, key: &str) -> Result<Vec<u8>> {
        let map = self.map.read().await;
        map.get(&hash)
            .and_then(|e| e.entries.get(&ref_num))
            .ok_or(OptiError::NoData)?
            .xattr_get(key)
    }

    pub async fn xattr_set(
        &self,
        hash: ContentHash,
        ref_num: u64,
        key: &str,
        value: Vec<u8>,
        flags: u32,
    ) -> Result<()> {
        let mut map = self.map.write().await;
        let meta = map
            .get_mut(&hash)
            .and_then(|e| e.entries.get_mut(&ref_num))
            .ok_or(OptiError::NoData)?;
        meta.xattr_set(key, value, flags)
    }

    pub async fn xattr_remove(&self, hash: ContentHash, ref_num: u64, key: &str) -> Result<()> {
        let mut map = self.map.write().await;
        let meta = map
            .get_mut(&hash)
            .and_then(|e| e.entries.get_mut(&ref_num))
            .ok_or(OptiError::Io)?;
        meta.xattr_remove(key)
    }

    pub async fn xattr_list(&self, hash: ContentHash, ref_num: u64, buffer_len: usize) -> Result<Vec<u8>> {
        let map = self.map.read().await;
        let meta = map
            .get(&hash)
            .and_then(|e| e.entries.get(&ref_num))
            .ok_or(OptiError::Io)?;
        meta.xattr_list(buffer_len)
    }

    async fn with_metadata_mut(
        &self,
        hash: ContentHash,
        ref_num: u64,
        f: impl FnOnce(&mut Metadata),
    ) -> Result<()> {
        let mut map = self.map.write().await;
        let meta = map
            .get_mut(&hash)
            .and_then(|e| e.entries.get_mut(&ref_num))
            .ok_or(OptiError::NoData)?;
        f(meta);
        Ok(())
    }
}

fn apply_unstable(meta: &mut Metadata, stat: &UnderlyingStat) {
    meta.atim = stat.atim;
    meta.mtim = stat.mtim;
    meta.rdev = stat.rdev;
    meta.nlink = stat.nlink;
    meta.size = stat.size;
    meta.blksize = stat.blksize;
    meta.blocks = stat.blocks;
}

/// `migrate_regular(old, new, underlying_stat)`: `new` inherits
/// identity-stable fields from `old`; volatile fields from `underlying_stat`.
pub fn migrate_regular(old: &Metadata, new: &mut Metadata, stat: &UnderlyingStat) {
    new.mode = old.mode;
    new.ctim = old.ctim;
    new.uid = old.uid;
    new.gid = old.gid;
    new.dev = old.dev;
    new.ino = old.ino;
    new.gen = old.gen;
    new.path = old.path.clone();
    new.xattr = old.xattr.clone();
    apply_unstable(new, stat);
}

/// `migrate_duplicate(old, new, underlying_stat)`: like [`migrate_regular`]
/// but `atim` is preserved from `old`, and only `{size, blksize, blocks}` are
/// refreshed from the underlying hardlink target.
pub fn migrate_duplicate(old: &Metadata, new: &mut Metadata, stat: &UnderlyingStat) {
    new.mode = old.mode;
    new.ctim = old.ctim;
    new.atim = old.atim;
    new.mtim = old.mtim;
    new.uid = old.uid;
    new.gid = old.gid;
    new.dev = old.dev;
    new.ino = old.ino;
    new.gen = old.gen;
    new.path = old.path.clone();
    new.xattr = old.xattr.clone();
    new.nlink = old.nlink;
    new.rdev = old.rdev;
    new.size = stat.size;
    new.blksize = stat.blksize;
    new.blocks = stat.blocks;
}

/// `initialise_new_duplicate(new, spare_stat, link_stat, path, uid, gid)`:
/// for a brand-new dedup target with no prior metadata, populate from the
/// spare `stat` but override owner, and take `{size, blksize, blocks}` from
/// the hardlink target.
pub fn initialise_new_duplicate(
    new: &mut Metadata,
    spare_stat: &UnderlyingStat,
    link_stat: &UnderlyingStat,
    path: String,
    uid: u32,
    gid: u32,
) {
    apply_unstable(new, spare_stat);
    new.size = link_stat.size;
    new.blksize = link_stat.blksize;
    new.blocks = link_stat.blocks;
    new.uid = uid;
    new.gid = gid;
    new.path = path;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> ContentHash {
        let mut h = [0u8; 64];
        h[0] = byte;
        ContentHash(h)
    }

    #[tokio::test]
    async fn create_then_lookup() {
        let store = RegStore::new();
        let h = hash(1);
        let (r, _) = store.create_metadata(h).await.unwrap();
        assert_eq!(r, 1);
        let meta = store.lookup_metadata(h, r).await.unwrap();
        assert_eq!(meta.mode, 0);
    }

    #[tokio::test]
    async fn ref_count_matches_entries_p1() {
        let store = RegStore::new();
        let h = hash(2);
        store.create_metadata(h).await.unwrap();
        store.create_metadata(h).await.unwrap();
        let entry = store.lookup_entry(h).await.unwrap();
        assert!(entry.is_consistent());
        assert_eq!(entry.ref_count, 2);
    }

    #[tokio::test]
    async fn last_removal_drops_entry_p4() {
        let store = RegStore::new();
        let h = hash(3);
        let (r, _) = store.create_metadata(h).await.unwrap();
        store.remove_metadata(h, r).await.unwrap();
        assert_eq!(store.lookup_entry(h).await.unwrap_err(), OptiError::NoData);
    }

    #[tokio::test]
    async fn most_recent_survives_after_partial_removal_p3() {
        let store = RegStore::new();
        let h = hash(4);
        let (r1, _) = store.create_metadata(h).await.unwrap();
        let (r2, _) = store.create_metadata(h).await.unwrap();
        let (r3, _) = store.create_metadata(h).await.unwrap();
        store.remove_metadata(h, r1).await.unwrap();
        store.remove_metadata(h, r2).await.unwrap();
        let (survivor, _) = store.most_recent(h).await.unwrap().unwrap();
        assert_eq!(survivor, r3);
        let entry = store.lookup_entry(h).await.unwrap();
        assert!(entry.index_counter >= 3);
    }

    #[tokio::test]
    async fn zero_hash_never_stored_i3() {
        let store = RegStore::new();
        let err = store.create_metadata(crate::hash::ZERO64).await.unwrap_err();
        assert_eq!(err, OptiError::InvalidArgument);
    }

    #[tokio::test]
    async fn ref_numbers_restart_after_entry_gc_i8() {
        let store = RegStore::new();
        let h = hash(5);
        let (r1, _) = store.create_metadata(h).await.unwrap();
        store.remove_metadata(h, r1).await.unwrap();
        let (r2, _) = store.create_metadata(h).await.unwrap();
        assert_eq!(r2, 1);
    }
}
