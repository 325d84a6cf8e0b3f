//! Metadata stores (C3): three independently lockable tables.
//!
//! Lock discipline (spec §4.3, §5): each store owns exactly one
//! `tokio::sync::RwLock`. Every public method here acquires that lock and
//! releases it before returning; no method calls into another store while
//! holding its own lock. Cross-store consistency (unlink, rmdir) is the
//! caller's (node layer's) job: acquire and release each store sequentially.

pub mod dir;
pub mod index;
pub mod reg;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{OptiError, Result};

/// Seconds + nanoseconds timestamp, matching the data model's `atim/mtim/ctim`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: u32,
}

/// XATTR_CREATE: fail EEXIST if the key is already present.
pub const XATTR_CREATE: u32 = 0x1;
/// XATTR_REPLACE: fail ENODATA if the key is absent.
pub const XATTR_REPLACE: u32 = 0x2;

/// Per-instance metadata record, shared shape between `RegStore` and
/// `DirStore` entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub atim: Timespec,
    pub mtim: Timespec,
    pub ctim: Timespec,
    pub size: u64,
    pub blocks: u64,
    pub blksize: u32,
    pub nlink: u32,
    pub dev: u64,
    pub rdev: u64,
    pub xattr: BTreeMap<String, Vec<u8>>,
    pub path: String,
    pub ino: u64,
    pub gen: u32,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            mode: 0,
            atim: Timespec::default(),
            mtim: Timespec::default(),
            ctim: Timespec::default(),
            size: 0,
            blocks: 0,
            blksize: 4096,
            nlink: 1,
            dev: 0,
            rdev: 0,
            xattr: BTreeMap::new(),
            path: String::new(),
            ino: 0,
            gen: 0,
        }
    }
}

/// Snapshot of the "unstable" (volatile) fields taken from an underlying
/// `stat`/`lstat` call, used by the migration helpers in `reg.rs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnderlyingStat {
    pub atim: Timespec,
    pub mtim: Timespec,
    pub ctim: Timespec,
    pub rdev: u64,
    pub nlink: u32,
    pub size: u64,
    pub blksize: u32,
    pub blocks: u64,
    pub dev: u64,
    pub ino: u64,
}

impl Metadata {
    /// `get(key)` — xattr lookup shared by regular and directory metadata.
    pub fn xattr_get(&self, key: &str) -> Result<Vec<u8>> {
        self.xattr.get(key).cloned().ok_or(OptiError::NoData)
    }

    /// `set(key, value, flags)`.
    pub fn xattr_set(&mut self, key: &str, value: Vec<u8>, flags: u32) -> Result<()> {
        let present = self.xattr.contains_key(key);
        if flags & XATTR_CREATE != 0 && present {
            return Err(OptiError::Exists);
        }
        if flags & XATTR_REPLACE != 0 && !present {
            return Err(OptiError::NoData);
        }
        self.xattr.insert(key.to_string(), value);
        Ok(())
    }

    /// `remove(key)`.
    pub fn xattr_remove(&mut self, key: &str) -> Result<()> {
        if self.xattr.remove(key).is_none() {
            return Err(OptiError::NoData);
        }
        Ok(())
    }

    /// `list(buffer)` — NUL-terminated names in lexicographic order
    /// (`BTreeMap` iteration is already sorted). Returns `ERANGE` with the
    /// required total length if `buffer_len` is insufficient.
    pub fn xattr_list(&self, buffer_len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for name in self.xattr.keys() {
            out.extend_from_slice(name.as_bytes());
            out.push(0);
        }
        if out.len() > buffer_len {
            return Err(OptiError::Range);
        }
        Ok(out)
    }
}

/// Null-metadata xattr operations (spec: `remove` on a null handle is EIO,
/// `list`/`get` on a null handle is EIO). Exposed as free functions so
/// callers without a `Metadata` instance in hand get the same errors.
pub fn xattr_remove_null() -> Result<()> {
    Err(OptiError::Io)
}

pub fn xattr_list_null() -> Result<Vec<u8>> {
    Err(OptiError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xattr_round_trip() {
        let mut m = Metadata::default();
        m.xattr_set("user.k", b"v".to_vec(), 0).unwrap();
        assert_eq!(m.xattr_get("user.k").unwrap(), b"v");
        m.xattr_remove("user.k").unwrap();
        assert_eq!(m.xattr_get("user.k").unwrap_err(), OptiError::NoData);
    }

    #[test]
    fn xattr_create_flag_rejects_existing() {
        let mut m = Metadata::default();
        m.xattr_set("a", b"1".to_vec(), 0).unwrap();
        let err = m.xattr_set("a", b"2".to_vec(), XATTR_CREATE).unwrap_err();
        assert_eq!(err, OptiError::Exists);
    }

    #[test]
    fn xattr_replace_flag_rejects_missing() {
        let mut m = Metadata::default();
        let err = m.xattr_set("a", b"1".to_vec(), XATTR_REPLACE).unwrap_err();
        assert_eq!(err, OptiError::NoData);
    }

    #[test]
    fn xattr_list_lexicographic_and_range() {
        let mut m = Metadata::default();
        m.xattr_set("b", vec![], 0).unwrap();
        m.xattr_set("a", vec![], 0).unwrap();
        let needed = "a\0b\0".len();
        let err = m.xattr_list(needed - 1).unwrap_err();
        assert_eq!(err, OptiError::Range);
        let ok = m.xattr_list(needed).unwrap();
        assert_eq!(ok, b"a\0b\0");
    }
}
