//! OptiVFS core: a user-space loopback deduplicating virtual filesystem.
//!
//! This crate implements THE CORE described by the system it's built from —
//! the virtual-node layer, the content-addressed metadata stores, and the
//! snapshot/persistence engine. The FUSE kernel transport, CLI parsing, and
//! log configuration live at the edges (`config`, `logging`, the
//! `optivfsd` binary); this library contains no transport code.

pub mod config;
pub mod error;
pub mod fsops;
pub mod handle;
pub mod hash;
pub mod lifecycle;
pub mod logging;
pub mod node;
pub mod perm;
pub mod persistence;
pub mod stable;
pub mod store;
pub mod sysadmin;
