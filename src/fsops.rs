//! Thin, blocking wrappers around the underlying POSIX syscalls the core
//! needs but `tokio::fs` does not expose: `lstat`/`stat` field extraction,
//! `l*xattr`, and OFD `fcntl` locks (spec §6 "Underlying POSIX").
//!
//! Every function here is synchronous and is expected to be called through
//! `tokio::task::spawn_blocking` by its caller, mirroring how
//! `examples/shadow_fs/fs/utils.rs` wraps `std::fs::set_permissions`.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::store::{Timespec, UnderlyingStat};

fn cpath(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))
}

fn errno() -> io::Error {
    io::Error::last_os_error()
}

/// A decoded `stat`/`lstat` result carrying every field the data model needs.
#[derive(Debug, Clone, Copy)]
pub struct RawStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u32,
    pub blocks: u64,
    pub atim: Timespec,
    pub mtim: Timespec,
    pub ctim: Timespec,
}

impl RawStat {
    pub fn to_underlying(self) -> UnderlyingStat {
        UnderlyingStat {
            atim: self.atim,
            mtim: self.mtim,
            ctim: self.ctim,
            rdev: self.rdev,
            nlink: self.nlink,
            size: self.size,
            blksize: self.blksize,
            blocks: self.blocks,
            dev: self.dev,
            ino: self.ino,
        }
    }
}

fn decode(st: libc::stat) -> RawStat {
    RawStat {
        dev: st.st_dev as u64,
        ino: st.st_ino as u64,
        mode: st.st_mode as u32,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u64,
        size: st.st_size as u64,
        blksize: st.st_blksize as u32,
        blocks: st.st_blocks as u64,
        atim: Timespec { sec: st.st_atime, nsec: st.st_atime_nsec as u32 },
        mtim: Timespec { sec: st.st_mtime, nsec: st.st_mtime_nsec as u32 },
        ctim: Timespec { sec: st.st_ctime, nsec: st.st_ctime_nsec as u32 },
    }
}

/// `lstat(2)`: does not follow a trailing symlink.
pub fn lstat(path: &Path) -> io::Result<RawStat> {
    let c = cpath(path)?;
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::lstat(c.as_ptr(), &mut st) };
    if rc != 0 {
        return Err(errno());
    }
    Ok(decode(st))
}

/// `stat(2)`: follows symlinks.
pub fn stat(path: &Path) -> io::Result<RawStat> {
    let c = cpath(path)?;
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::stat(c.as_ptr(), &mut st) };
    if rc != 0 {
        return Err(errno());
    }
    Ok(decode(st))
}

/// `fstat(2)` on an already-open descriptor.
pub fn fstat(fd: i32) -> io::Result<RawStat> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::fstat(fd, &mut st) };
    if rc != 0 {
        return Err(errno());
    }
    Ok(decode(st))
}

/// Cheap existence probe used by the startup integrity scan (spec §4.4).
pub fn exists(path: &Path) -> bool {
    lstat(path).is_ok()
}

pub fn lchown(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    let c = cpath(path)?;
    let rc = unsafe {
        libc::lchown(c.as_ptr(), uid as libc::uid_t, gid as libc::gid_t)
    };
    if rc != 0 {
        return Err(errno());
    }
    Ok(())
}

pub fn chmod(path: &Path, mode: u32) -> io::Result<()> {
    let c = cpath(path)?;
    let rc = unsafe { libc::chmod(c.as_ptr(), mode as libc::mode_t) };
    if rc != 0 {
        return Err(errno());
    }
    Ok(())
}

pub fn fchmod(fd: i32, mode: u32) -> io::Result<()> {
    let rc = unsafe { libc::fchmod(fd, mode as libc::mode_t) };
    if rc != 0 {
        return Err(errno());
    }
    Ok(())
}

pub fn chown(path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
    let c = cpath(path)?;
    let uid = uid.map(|v| v as libc::uid_t).unwrap_or(u32::MAX as libc::uid_t);
    let gid = gid.map(|v| v as libc::gid_t).unwrap_or(u32::MAX as libc::gid_t);
    let rc = unsafe { libc::chown(c.as_ptr(), uid, gid) };
    if rc != 0 {
        return Err(errno());
    }
    Ok(())
}

pub fn utimens(path: &Path, atim: Timespec, mtim: Timespec) -> io::Result<()> {
    let c = cpath(path)?;
    let times = [
        libc::timespec { tv_sec: atim.sec as libc::time_t, tv_nsec: atim.nsec as i64 },
        libc::timespec { tv_sec: mtim.sec as libc::time_t, tv_nsec: mtim.nsec as i64 },
    ];
    let rc = unsafe { libc::utimensat(libc::AT_FDCWD, c.as_ptr(), times.as_ptr(), libc::AT_SYMLINK_NOFOLLOW) };
    if rc != 0 {
        return Err(errno());
    }
    Ok(())
}

pub fn futimens(fd: i32, atim: Timespec, mtim: Timespec) -> io::Result<()> {
    let times = [
        libc::timespec { tv_sec: atim.sec as libc::time_t, tv_nsec: atim.nsec as i64 },
        libc::timespec { tv_sec: mtim.sec as libc::time_t, tv_nsec: mtim.nsec as i64 },
    ];
    let rc = unsafe { libc::futimens(fd, times.as_ptr()) };
    if rc != 0 {
        return Err(errno());
    }
    Ok(())
}

pub fn truncate(path: &Path, size: u64) -> io::Result<()> {
    let c = cpath(path)?;
    let rc = unsafe { libc::truncate(c.as_ptr(), size as libc::off_t) };
    if rc != 0 {
        return Err(errno());
    }
    Ok(())
}

pub fn ftruncate(fd: i32, size: u64) -> io::Result<()> {
    let rc = unsafe { libc::ftruncate(fd, size as libc::off_t) };
    if rc != 0 {
        return Err(errno());
    }
    Ok(())
}

// --- extended attributes: the `l*xattr` family, symlink-safe. ---

pub fn lsetxattr(path: &Path, name: &str, value: &[u8], flags: i32) -> io::Result<()> {
    let c = cpath(path)?;
    let n = CString::new(name).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "xattr name has NUL"))?;
    let rc = unsafe {
        libc::lsetxattr(
            c.as_ptr(),
            n.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            flags,
        )
    };
    if rc != 0 {
        return Err(errno());
    }
    Ok(())
}

pub fn lgetxattr(path: &Path, name: &str) -> io::Result<Vec<u8>> {
    let c = cpath(path)?;
    let n = CString::new(name).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "xattr name has NUL"))?;
    let needed = unsafe { libc::lgetxattr(c.as_ptr(), n.as_ptr(), std::ptr::null_mut(), 0) };
    if needed < 0 {
        return Err(errno());
    }
    let mut buf = vec![0u8; needed as usize];
    if needed > 0 {
        let rc = unsafe {
            libc::lgetxattr(c.as_ptr(), n.as_ptr(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        if rc < 0 {
            return Err(errno());
        }
        buf.truncate(rc as usize);
    }
    Ok(buf)
}

pub fn lremovexattr(path: &Path, name: &str) -> io::Result<()> {
    let c = cpath(path)?;
    let n = CString::new(name).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "xattr name has NUL"))?;
    let rc = unsafe { libc::lremovexattr(c.as_ptr(), n.as_ptr()) };
    if rc != 0 {
        return Err(errno());
    }
    Ok(())
}

pub fn llistxattr(path: &Path) -> io::Result<Vec<u8>> {
    let c = cpath(path)?;
    let needed = unsafe { libc::llistxattr(c.as_ptr(), std::ptr::null_mut(), 0) };
    if needed < 0 {
        return Err(errno());
    }
    let mut buf = vec![0u8; needed as usize];
    if needed > 0 {
        let rc = unsafe { libc::llistxattr(c.as_ptr(), buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if rc < 0 {
            return Err(errno());
        }
        buf.truncate(rc as usize);
    }
    Ok(buf)
}

/// Raw `statvfs(2)` fields the node layer's `statfs` op needs.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawStatFs {
    pub bsize: u64,
    pub frsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub namemax: u64,
}

pub fn statfs(path: &Path) -> io::Result<RawStatFs> {
    let c = cpath(path)?;
    let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c.as_ptr(), &mut st) };
    if rc != 0 {
        return Err(errno());
    }
    Ok(RawStatFs {
        bsize: st.f_bsize as u64,
        frsize: st.f_frsize as u64,
        blocks: st.f_blocks as u64,
        bfree: st.f_bfree as u64,
        bavail: st.f_bavail as u64,
        files: st.f_files as u64,
        ffree: st.f_ffree as u64,
        namemax: st.f_namemax as u64,
    })
}

pub fn mknod(path: &Path, mode: u32, dev: u64) -> io::Result<()> {
    let c = cpath(path)?;
    let rc = unsafe { libc::mknod(c.as_ptr(), mode as libc::mode_t, dev as libc::dev_t) };
    if rc != 0 {
        return Err(errno());
    }
    Ok(())
}

/// `renameat2(..., RENAME_EXCHANGE)`: atomically swap two directory entries.
/// Linux-specific, matching the FUSE kernel bridge this core targets.
#[cfg(target_os = "linux")]
pub fn rename_exchange(old_parent: &Path, old_name: &str, new_parent: &Path, new_name: &str) -> io::Result<()> {
    let old_dir = cpath(old_parent)?;
    let new_dir = cpath(new_parent)?;
    let old = CString::new(old_name).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "name has NUL"))?;
    let new = CString::new(new_name).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "name has NUL"))?;
    let old_fd = unsafe { libc::open(old_dir.as_ptr(), libc::O_RDONLY | libc::O_DIRECTORY) };
    if old_fd < 0 {
        return Err(errno());
    }
    let new_fd = unsafe { libc::open(new_dir.as_ptr(), libc::O_RDONLY | libc::O_DIRECTORY) };
    if new_fd < 0 {
        let e = errno();
        unsafe { libc::close(old_fd) };
        return Err(e);
    }
    let rc = unsafe { libc::renameat2(old_fd, old.as_ptr(), new_fd, new.as_ptr(), libc::RENAME_EXCHANGE) };
    let result = if rc != 0 { Err(errno()) } else { Ok(()) };
    unsafe {
        libc::close(old_fd);
        libc::close(new_fd);
    }
    result
}

// --- OFD locks: fcntl codes 36/37/38 (F_OFD_GETLK/SETLK/SETLKW). ---

/// Lock type understood by `getlk`/`setlk`/`setlkw`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Read,
    Write,
    Unlock,
}

impl LockType {
    fn to_l_type(self) -> i16 {
        match self {
            LockType::Read => libc::F_RDLCK as i16,
            LockType::Write => libc::F_WRLCK as i16,
            LockType::Unlock => libc::F_UNLCK as i16,
        }
    }

    fn from_l_type(v: i16) -> Option<LockType> {
        match v as i32 {
            libc::F_RDLCK => Some(LockType::Read),
            libc::F_WRLCK => Some(LockType::Write),
            libc::F_UNLCK => Some(LockType::Unlock),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LockRange {
    pub typ: LockType,
    pub start: i64,
    pub len: i64,
    pub pid: i32,
}

const F_OFD_GETLK: i32 = 36;
const F_OFD_SETLK: i32 = 37;
const F_OFD_SETLKW: i32 = 38;

fn make_flock(range: LockRange) -> libc::flock {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = range.typ.to_l_type();
    fl.l_whence = libc::SEEK_SET as i16;
    fl.l_start = range.start as libc::off_t;
    fl.l_len = range.len as libc::off_t;
    fl.l_pid = 0; // OFD locks are not owned by a pid.
    fl
}

pub fn ofd_getlk(fd: i32, range: LockRange) -> io::Result<LockRange> {
    let mut fl = make_flock(range);
    let rc = unsafe { libc::fcntl(fd, F_OFD_GETLK, &mut fl as *mut libc::flock) };
    if rc != 0 {
        return Err(errno());
    }
    Ok(LockRange {
        typ: LockType::from_l_type(fl.l_type).unwrap_or(LockType::Unlock),
        start: fl.l_start as i64,
        len: fl.l_len as i64,
        pid: fl.l_pid,
    })
}

pub fn ofd_setlk(fd: i32, range: LockRange) -> io::Result<()> {
    let mut fl = make_flock(range);
    let rc = unsafe { libc::fcntl(fd, F_OFD_SETLK, &mut fl as *mut libc::flock) };
    if rc != 0 {
        return Err(errno());
    }
    Ok(())
}

pub fn ofd_setlkw(fd: i32, range: LockRange) -> io::Result<()> {
    let mut fl = make_flock(range);
    let rc = unsafe { libc::fcntl(fd, F_OFD_SETLKW, &mut fl as *mut libc::flock) };
    if rc != 0 {
        return Err(errno());
    }
    Ok(())
}
