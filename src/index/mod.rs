//! C1 — Data Index client.
//!
//! Typed accessors over the shared relational schema described in
//! `spec.md` §6, with row-level updates that retry under the
//! database's deadlock/lock-wait policy. No accessor opens a
//! long-running transaction: every logical unit of work is its own
//! short transaction, so crash recovery is bounded by the last
//! committed row.

mod client;
mod retry;
mod types;

pub use client::Pool;
pub use retry::with_retry;
pub use types::*;

use thiserror::Error;

/// Stable error boundary for callers that need to branch on failure
/// kind (C8's schema check, C1's own retry loop).
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("row not found")]
    NotFound,

    #[error("data index schema version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: i32, found: i32 },

    #[error("transaction aborted by a concurrent writer, retries exhausted")]
    Deadlock,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for IndexError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => IndexError::NotFound,
            _ => IndexError::Other(anyhow::Error::new(err)),
        }
    }
}

/// The data index schema version this daemon was built against.
/// `spec.md` §6 treats migration tooling as out of scope, but a
/// mismatch must still refuse to run (exit code 4, §6).
pub const EXPECTED_SCHEMA_VERSION: i32 = 1;
