//! C4 — I/O class framework.
//!
//! An I/O class is a capability set: a per-node or per-group object
//! instantiated once at daemon startup, holding whatever in-memory
//! session state it needs (open connections, cached quota, pending
//! transfer tables). `spec.md` §4.4 names two kinds — Node I/O and
//! Group I/O — and the provided classes Default, Transport, Polling.

mod default;
mod polling;
mod transport;

pub use default::{DefaultGroupIo, DefaultNodeIo};
pub use polling::PollingNodeIo;
pub use transport::TransportGroupIo;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::fs::NodeRoot;
use crate::importer::{ImportEngine, ImportOutcome};
use crate::index::{CopyRequest, File, FileCopy, Node, Pool as IndexPool};
use crate::transfer::TransferEngine;

/// Outcome of [`NodeIo::check_init`]. `check_init` both verifies and
/// creates the marker (`spec.md` §4.4), so `NotInitialised` means "had
/// no marker, and one was just created" rather than "still
/// uninitialised" — a second call right after sees `Initialised` and
/// makes no further changes (Testable Property 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitStatus {
    Initialised,
    NotInitialised,
}

/// Outcome of [`NodeIo::delete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// Precondition failed: fewer than two other archive copies
    /// exist. The copy stays `Released`; it is never downgraded
    /// (`spec.md` §4.4 `delete()` contract, Testable Property 1).
    RefusedTooFewArchiveCopies { found: i64 },
}

/// Per-node capability set (`spec.md` §4.4 "Required Node I/O
/// operations").
#[async_trait]
pub trait NodeIo: Send + Sync {
    /// Verify and/or create the `ALPENHORN_NODE` marker.
    async fn check_init(&self, root: &NodeRoot, node_name: &str) -> Result<InitStatus>;

    async fn available_bytes(&self, root: &NodeRoot) -> Result<u64>;

    /// How long a cached `available_bytes` reading may be reused
    /// before it must be refreshed.
    fn bytes_avail_refresh_policy(&self) -> Duration {
        Duration::from_secs(60)
    }

    /// Import `rel_path`, already known relative to `root`. Must be
    /// idempotent for the same `(node, path)` (`spec.md` §4.4).
    async fn import(
        &self,
        engine: &ImportEngine,
        index: &IndexPool,
        root: &NodeRoot,
        node_name: &str,
        rel_path: &Path,
        register_new: bool,
        completing_copy_request: Option<i64>,
    ) -> Result<ImportOutcome> {
        engine
            .import_path(index, root, node_name, rel_path, register_new, completing_copy_request)
            .await
    }

    /// Recompute size and hash; the caller is responsible for writing
    /// the resulting state back to the Index.
    async fn check(&self, root: &NodeRoot, file: &File) -> Result<crate::index::CopyState>;

    /// Delete a `Released` copy, enforcing the two-archive-copies
    /// precondition (`spec.md` §3 invariant, §4.4).
    async fn delete(&self, index: &IndexPool, root: &NodeRoot, file: &File, copy: &FileCopy) -> Result<DeleteOutcome>;

    /// Clean up leftover temp files from aborted transfers; clear
    /// stale `Missing` copies that are actually present.
    async fn tidy_up(&self, root: &NodeRoot, stale_temp_age: Duration) -> Result<usize>;

    /// Lightweight readiness check for a pull source. Default classes
    /// are always ready; HSM-like classes stage bytes first.
    async fn ready(&self, _root: &NodeRoot, _file: &File) -> Result<bool> {
        Ok(true)
    }

    /// Whether this class drives its own periodic scan instead of
    /// relying on filesystem-event auto-import (the Polling class).
    fn disables_event_watch(&self) -> bool {
        false
    }
}

/// Find `target` among `candidates`, honoring a [`CopyRequest`]'s
/// optional `target_node` override (`spec.md` §3 "target node
/// optional"): when a CLI-issued request names a specific destination
/// node, the group's usual selection policy is bypassed entirely
/// (scenario S6, "transport node still holds them until cleaned with
/// `--target`").
pub(crate) fn find_target_node<'a>(
    candidates: &'a [(Node, NodeRoot)],
    target: &str,
) -> Result<&'a (Node, NodeRoot)> {
    candidates
        .iter()
        .find(|(n, _)| n.name == target && n.active)
        .with_context(|| format!("requested target node {:?} is not an active member of this group", target))
}

/// Per-group capability set (`spec.md` §4.4 "Required Group I/O
/// operations").
#[async_trait]
pub trait GroupIo: Send + Sync {
    /// Select a destination node within the group and drive the pull
    /// to completion (or defer/fail per `spec.md` §4.7).
    async fn pull(
        &self,
        index: &IndexPool,
        transfer: &TransferEngine,
        request: &CopyRequest,
        file: &File,
        source: &(Node, NodeRoot),
        candidates: &[(Node, NodeRoot)],
    ) -> Result<()>;

    /// True iff no pulls are in flight for this group.
    fn idle(&self) -> bool;
}
