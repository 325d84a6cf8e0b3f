//! Permission evaluator (C2).
//!
//! Pure functions over `(caller uid/gid, metadata uid/gid/mode, intent)`; no
//! I/O, no locking. The virtual node layer (C7) is responsible for gathering
//! the inputs and converting [`OptiError::PermissionDenied`] into `EACCES`.

use crate::error::{OptiError, Result};

/// The operation class being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read,
    Write,
    Exec,
}

/// The caller identity carried by the kernel request context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub uid: u32,
    pub gid: u32,
}

/// Open-flag intent, derived per spec §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenIntent {
    pub read: bool,
    pub write: bool,
}

/// Derive read/write intent from open(2)-style flags.
pub fn open_intent(flags: i32) -> OpenIntent {
    let accmode = flags & libc::O_ACCMODE;
    let read = accmode == libc::O_RDONLY || accmode == libc::O_RDWR;
    let write = accmode == libc::O_WRONLY
        || accmode == libc::O_RDWR
        || (flags & libc::O_CREAT) != 0
        || (flags & libc::O_TRUNC) != 0
        || (flags & libc::O_APPEND) != 0;
    OpenIntent { read, write }
}

/// Which UGO class the caller falls into against a metadata owner record.
fn class_of(caller: Caller, uid: u32, gid: u32) -> Class {
    if caller.uid == uid {
        Class::Owner
    } else if caller.gid == gid {
        Class::Group
    } else {
        Class::Other
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    Owner,
    Group,
    Other,
}

fn bit_for(op: Op, class: Class) -> u32 {
    match (op, class) {
        (Op::Read, Class::Owner) => libc::S_IRUSR,
        (Op::Read, Class::Group) => libc::S_IRGRP,
        (Op::Read, Class::Other) => libc::S_IROTH,
        (Op::Write, Class::Owner) => libc::S_IWUSR,
        (Op::Write, Class::Group) => libc::S_IWGRP,
        (Op::Write, Class::Other) => libc::S_IWOTH,
        (Op::Exec, Class::Owner) => libc::S_IXUSR,
        (Op::Exec, Class::Group) => libc::S_IXGRP,
        (Op::Exec, Class::Other) => libc::S_IXOTH,
    }
}

/// `true` iff `mode` grants `op` to `caller` given the metadata's owner.
pub fn bit_test(mode: u32, caller: Caller, uid: u32, gid: u32, op: Op) -> bool {
    let class = class_of(caller, uid, gid);
    mode & bit_for(op, class) != 0
}

/// `access(2)`-style mask: low three bits, 4=R 2=W 1=X. All requested bits
/// must be granted.
pub fn access_mask(mode: u32, caller: Caller, uid: u32, gid: u32, mask: u32) -> bool {
    let mut required = Vec::new();
    if mask & 0b100 != 0 {
        required.push(Op::Read);
    }
    if mask & 0b010 != 0 {
        required.push(Op::Write);
    }
    if mask & 0b001 != 0 {
        required.push(Op::Exec);
    }
    required.into_iter().all(|op| bit_test(mode, caller, uid, gid, op))
}

/// Evaluate open-intent permission: both read and write intents (if set)
/// must be separately granted.
pub fn check_open(
    mode: u32,
    caller: Caller,
    uid: u32,
    gid: u32,
    intent: OpenIntent,
    is_sysadmin: bool,
) -> Result<()> {
    if is_sysadmin {
        return Ok(());
    }
    if intent.read && !bit_test(mode, caller, uid, gid, Op::Read) {
        return Err(OptiError::PermissionDenied);
    }
    if intent.write && !bit_test(mode, caller, uid, gid, Op::Write) {
        return Err(OptiError::PermissionDenied);
    }
    Ok(())
}

/// Evaluate an `access(mask)` request.
pub fn check_access(
    mode: u32,
    caller: Caller,
    uid: u32,
    gid: u32,
    mask: u32,
    is_sysadmin: bool,
) -> Result<()> {
    if is_sysadmin || access_mask(mode, caller, uid, gid, mask) {
        Ok(())
    } else {
        Err(OptiError::PermissionDenied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_intent_rdonly_is_read_only() {
        let intent = open_intent(libc::O_RDONLY);
        assert!(intent.read);
        assert!(!intent.write);
    }

    #[test]
    fn open_intent_rdwr_is_both() {
        let intent = open_intent(libc::O_RDWR);
        assert!(intent.read && intent.write);
    }

    #[test]
    fn open_intent_append_wronly_is_write_only() {
        let intent = open_intent(libc::O_APPEND | libc::O_WRONLY);
        assert!(intent.write && !intent.read);
    }

    #[test]
    fn open_intent_creat_implies_write() {
        let intent = open_intent(libc::O_CREAT | libc::O_RDONLY);
        assert!(intent.write);
    }

    #[test]
    fn owner_all_denied_is_access_denied() {
        // mode 0o000: nobody can do anything, caller is the owner.
        let caller = Caller { uid: 1000, gid: 1000 };
        assert!(check_access(0o000, caller, 1000, 1000, 0b100, false).is_err());
    }

    #[test]
    fn any_granted_bit_allows() {
        let caller = Caller { uid: 1000, gid: 1000 };
        assert!(check_access(0o400, caller, 1000, 1000, 0b100, false).is_ok());
    }

    #[test]
    fn sysadmin_overrides_everything() {
        let caller = Caller { uid: 1001, gid: 1001 };
        assert!(check_access(0o000, caller, 1000, 1000, 0b111, true).is_ok());
    }

    #[test]
    fn group_class_selected_when_uid_differs() {
        let caller = Caller { uid: 2, gid: 1000 };
        // owner bits denied, group bits granted.
        assert!(check_access(0o040, caller, 1000, 1000, 0b100, false).is_ok());
    }

    #[test]
    fn other_class_when_neither_matches() {
        let caller = Caller { uid: 2, gid: 2 };
        assert!(check_access(0o004, caller, 1000, 1000, 0b100, false).is_ok());
        assert!(check_access(0o040, caller, 1000, 1000, 0b100, false).is_err());
    }
}
