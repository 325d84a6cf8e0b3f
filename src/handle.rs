//! File handle (C6): per-open state, serialised by its own mutex (spec §5:
//! "a per file handle mutex serialising all operations on that handle").

use std::os::unix::io::RawFd;

use tokio::sync::Mutex;
use tokio::task;

use crate::error::{OptiError, Result};
use crate::fsops::{self, LockRange, LockType};
use crate::hash::ContentHash;
use crate::perm::{self, Caller, Op};
use crate::stable::StableAttr;
use crate::store::Metadata;

/// The mutable state guarded by the handle's mutex.
struct Inner {
    fd: RawFd,
}

/// Per-open file handle. `stable`, `hash`, and `ref_num` are set at open time
/// and updated by the node layer after a write changes content identity.
pub struct FileHandle {
    inner: Mutex<Inner>,
    pub stable: StableAttr,
    pub flags: i32,
    pub hash: std::sync::Mutex<ContentHash>,
    pub ref_num: std::sync::atomic::AtomicU64,
}

impl FileHandle {
    pub fn new(fd: RawFd, stable: StableAttr, flags: i32, hash: ContentHash, ref_num: u64) -> Self {
        Self {
            inner: Mutex::new(Inner { fd }),
            stable,
            flags,
            hash: std::sync::Mutex::new(hash),
            ref_num: std::sync::atomic::AtomicU64::new(ref_num),
        }
    }

    pub fn current_hash(&self) -> ContentHash {
        *self.hash.lock().unwrap()
    }

    pub fn current_ref_num(&self) -> u64 {
        self.ref_num.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn set_identity(&self, hash: ContentHash, ref_num: u64) {
        *self.hash.lock().unwrap() = hash;
        self.ref_num.store(ref_num, std::sync::atomic::Ordering::SeqCst);
    }

    /// `read(dest_len, offset)`: permission-checked against `meta` when
    /// present, then a positional read from the cached descriptor.
    pub async fn read(&self, len: usize, offset: u64, meta: Option<&Metadata>, caller: Caller, is_sysadmin: bool) -> Result<Vec<u8>> {
        if let Some(meta) = meta {
            if !is_sysadmin && !perm::bit_test(meta.mode, caller, meta.uid, meta.gid, Op::Read) {
                return Err(OptiError::PermissionDenied);
            }
        }
        let fd = self.inner.lock().await.fd;
        if fd < 0 {
            return Err(OptiError::BadHandle);
        }
        task::spawn_blocking(move || pread_exact(fd, len, offset))
            .await
            .map_err(|_| OptiError::Io)?
    }

    /// `write(data, off)`: positional write at an explicit offset (no
    /// implicit append — `O_APPEND` is stripped at open time, spec §4.7).
    pub async fn write(&self, data: &[u8], offset: u64) -> Result<usize> {
        let fd = self.inner.lock().await.fd;
        if fd < 0 {
            return Err(OptiError::BadHandle);
        }
        let buf = data.to_vec();
        task::spawn_blocking(move || pwrite_all(fd, &buf, offset))
            .await
            .map_err(|_| OptiError::Io)?
    }

    /// Record the handle's new content identity after a write rehashed it.
    pub fn note_rehash(&self, hash: ContentHash, ref_num: u64) {
        self.set_identity(hash, ref_num);
    }

    /// `flush`: duplicate the descriptor and close the duplicate, forcing
    /// cached data visible without invalidating the primary descriptor.
    pub async fn flush(&self) -> Result<()> {
        let fd = self.inner.lock().await.fd;
        if fd < 0 {
            return Err(OptiError::BadHandle);
        }
        task::spawn_blocking(move || {
            let dup = unsafe { libc::dup(fd) };
            if dup < 0 {
                return Err(std::io::Error::last_os_error());
            }
            let rc = unsafe { libc::close(dup) };
            if rc != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        })
        .await
        .map_err(|_| OptiError::Io)?
        .map_err(OptiError::from)
    }

    pub async fn fsync(&self, data_only: bool) -> Result<()> {
        let fd = self.inner.lock().await.fd;
        if fd < 0 {
            return Err(OptiError::BadHandle);
        }
        task::spawn_blocking(move || {
            let rc = if data_only { unsafe { libc::fdatasync(fd) } } else { unsafe { libc::fsync(fd) } };
            if rc != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        })
        .await
        .map_err(|_| OptiError::Io)?
        .map_err(OptiError::from)
    }

    /// Idempotent close: safe to call more than once.
    pub async fn release(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.fd < 0 {
            return Ok(());
        }
        let fd = inner.fd;
        inner.fd = -1;
        task::spawn_blocking(move || {
            let rc = unsafe { libc::close(fd) };
            if rc != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        })
        .await
        .map_err(|_| OptiError::Io)?
        .map_err(OptiError::from)
    }

    async fn fd(&self) -> Result<RawFd> {
        let fd = self.inner.lock().await.fd;
        if fd < 0 {
            Err(OptiError::BadHandle)
        } else {
            Ok(fd)
        }
    }

    pub async fn getlk(&self, req: LockRequest) -> Result<LockRequest> {
        let fd = self.fd().await?;
        let range = to_range(req)?;
        let result = task::spawn_blocking(move || fsops::ofd_getlk(fd, range))
            .await
            .map_err(|_| OptiError::Io)?
            .map_err(OptiError::from)?;
        Ok(from_range(result))
    }

    pub async fn setlk(&self, req: LockRequest) -> Result<()> {
        let fd = self.fd().await?;
        let range = to_range(req)?;
        task::spawn_blocking(move || fsops::ofd_setlk(fd, range))
            .await
            .map_err(|_| OptiError::Io)?
            .map_err(OptiError::from)
    }

    pub async fn setlkw(&self, req: LockRequest) -> Result<()> {
        let fd = self.fd().await?;
        let range = to_range(req)?;
        task::spawn_blocking(move || fsops::ofd_setlkw(fd, range))
            .await
            .map_err(|_| OptiError::Io)?
            .map_err(OptiError::from)
    }
}

/// Abstract lock record understood by `getlk`/`setlk`/`setlkw`.
#[derive(Debug, Clone, Copy)]
pub struct LockRequest {
    pub typ: LockKind,
    pub start: i64,
    pub len: i64,
    pub pid: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
    Unlock,
}

fn to_range(req: LockRequest) -> Result<LockRange> {
    let typ = match req.typ {
        LockKind::Read => LockType::Read,
        LockKind::Write => LockType::Write,
        LockKind::Unlock => LockType::Unlock,
    };
    Ok(LockRange { typ, start: req.start, len: req.len, pid: req.pid })
}

fn from_range(range: LockRange) -> LockRequest {
    let typ = match range.typ {
        LockType::Read => LockKind::Read,
        LockType::Write => LockKind::Write,
        LockType::Unlock => LockKind::Unlock,
    };
    LockRequest { typ, start: range.start, len: range.len, pid: range.pid }
}

fn pread_exact(fd: RawFd, len: usize, offset: u64) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let mut total = 0usize;
    while total < len {
        let rc = unsafe {
            libc::pread(
                fd,
                buf[total..].as_mut_ptr() as *mut libc::c_void,
                len - total,
                (offset as i64 + total as i64) as libc::off_t,
            )
        };
        if rc < 0 {
            return Err(OptiError::from(std::io::Error::last_os_error()));
        }
        if rc == 0 {
            break; // short read at EOF.
        }
        total += rc as usize;
    }
    buf.truncate(total);
    Ok(buf)
}

fn pwrite_all(fd: RawFd, data: &[u8], offset: u64) -> Result<usize> {
    let mut total = 0usize;
    while total < data.len() {
        let rc = unsafe {
            libc::pwrite(
                fd,
                data[total..].as_ptr() as *const libc::c_void,
                data.len() - total,
                (offset as i64 + total as i64) as libc::off_t,
            )
        };
        if rc < 0 {
            return Err(OptiError::from(std::io::Error::last_os_error()));
        }
        total += rc as usize;
    }
    Ok(total)
}
