//! Sysadmin principal (C5): a single privileged `(uid, gid)` pair with
//! blanket permission-check override, matched by uid OR gid.

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{OptiError, Result};
use crate::perm::Caller;

/// The persisted sysadmin record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysadminRecord {
    pub uid: u32,
    pub gid: u32,
    pub set: bool,
}

impl Default for SysadminRecord {
    fn default() -> Self {
        Self { uid: 0, gid: 0, set: false }
    }
}

/// Process-wide sysadmin principal, guarded by a short-critical-section
/// mutex (spec §5: "one process-wide mutex protecting the sysadmin record").
pub struct Sysadmin {
    inner: Mutex<SysadminRecord>,
}

impl Sysadmin {
    pub fn new(record: SysadminRecord) -> Self {
        Self { inner: Mutex::new(record) }
    }

    /// If not yet `set`, populate from the current process owner.
    pub async fn ensure_set(&self) {
        let mut guard = self.inner.lock().await;
        if !guard.set {
            guard.uid = unsafe { libc::getuid() };
            guard.gid = unsafe { libc::getgid() };
            guard.set = true;
            tracing::info!(uid = guard.uid, gid = guard.gid, "sysadmin defaulted to process owner");
        }
    }

    pub async fn snapshot(&self) -> SysadminRecord {
        *self.inner.lock().await
    }

    /// `uid` OR `gid` matching the stored pair confers sysadmin rights.
    /// With no caller context (startup), the process owner is consulted.
    pub async fn is_sysadmin(&self, caller: Option<Caller>) -> bool {
        let guard = self.inner.lock().await;
        let caller = caller.unwrap_or_else(|| Caller {
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        });
        caller.uid == guard.uid || caller.gid == guard.gid
    }

    /// Overwrite the uid, after validating the id exists on the host.
    pub async fn set_uid(&self, uid: u32) -> Result<()> {
        if !uid_exists(uid) {
            return Err(OptiError::InvalidArgument);
        }
        let mut guard = self.inner.lock().await;
        guard.uid = uid;
        guard.set = true;
        Ok(())
    }

    /// Overwrite the gid, after validating the id exists on the host.
    pub async fn set_gid(&self, gid: u32) -> Result<()> {
        if !gid_exists(gid) {
            return Err(OptiError::InvalidArgument);
        }
        let mut guard = self.inner.lock().await;
        guard.gid = gid;
        guard.set = true;
        Ok(())
    }
}

fn uid_exists(uid: u32) -> bool {
    unsafe {
        let mut result = std::ptr::null_mut();
        let mut buf = [0u8; 4096];
        let mut pwd: libc::passwd = std::mem::zeroed();
        libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr() as *mut libc::c_char, buf.len(), &mut result);
        !result.is_null()
    }
}

fn gid_exists(gid: u32) -> bool {
    unsafe {
        let mut result = std::ptr::null_mut();
        let mut buf = [0u8; 4096];
        let mut grp: libc::group = std::mem::zeroed();
        libc::getgrgid_r(gid, &mut grp, buf.as_mut_ptr() as *mut libc::c_char, buf.len(), &mut result);
        !result.is_null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_set_defaults_to_process_owner() {
        let admin = Sysadmin::new(SysadminRecord::default());
        admin.ensure_set().await;
        let snap = admin.snapshot().await;
        assert!(snap.set);
        assert_eq!(snap.uid, unsafe { libc::getuid() });
    }

    #[tokio::test]
    async fn match_by_uid_or_gid() {
        let admin = Sysadmin::new(SysadminRecord { uid: 50, gid: 60, set: true });
        assert!(admin.is_sysadmin(Some(Caller { uid: 50, gid: 1 })).await);
        assert!(admin.is_sysadmin(Some(Caller { uid: 1, gid: 60 })).await);
        assert!(!admin.is_sysadmin(Some(Caller { uid: 1, gid: 1 })).await);
    }

    #[tokio::test]
    async fn set_uid_rejects_nonexistent_user() {
        let admin = Sysadmin::new(SysadminRecord::default());
        let err = admin.set_uid(u32::MAX - 1).await.unwrap_err();
        assert_eq!(err, OptiError::InvalidArgument);
    }
}
