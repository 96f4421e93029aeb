//! C3 — Filesystem abstraction + update-down lock.
//!
//! Every operation here is relative to a node's root; absolute path
//! assembly happens only in this module, never upstream of it
//! (`spec.md` §4.3).

mod hash;
mod lock;
mod ops;

pub use hash::{hash_file_md5, HashError};
pub use lock::{ReadGuard, UpdateDownLock, WriteGuard};
pub use ops::{FsError, NodeRoot};
