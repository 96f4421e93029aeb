//! The Default I/O class: a plain local (or NFS-mounted) filesystem
//! tree with no special transport or staging semantics (`spec.md`
//! §4.4 "Default").

use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::fs::NodeRoot;
use crate::index::{CopyRequest, CopyState, File, FileCopy, Node, Pool as IndexPool};
use crate::transfer::TransferEngine;

use super::{DeleteOutcome, GroupIo, InitStatus, NodeIo};

pub struct DefaultNodeIo;

#[async_trait]
impl NodeIo for DefaultNodeIo {
    async fn check_init(&self, root: &NodeRoot, node_name: &str) -> Result<InitStatus> {
        match root.read_marker(node_name) {
            Ok(()) => Ok(InitStatus::Initialised),
            Err(crate::fs::FsError::NotInitialised(_)) => {
                // "Verify and/or create" (`spec.md` §4.4): no marker
                // yet, so this node has never been initialised on this
                // root. `write_marker` itself is a no-op if another
                // caller raced us and created it first, which keeps
                // repeated `node init` requests a no-op (Testable
                // Property 5).
                root.write_marker(node_name)?;
                Ok(InitStatus::NotInitialised)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn available_bytes(&self, root: &NodeRoot) -> Result<u64> {
        root.bytes_available().map_err(Into::into)
    }

    async fn check(&self, root: &NodeRoot, file: &File) -> Result<CopyState> {
        let rel = Path::new(&file.acq_name).join(&file.name);
        if !root.exists(&rel)? {
            return Ok(CopyState::Missing);
        }
        let (size, digest) = root.hash(&rel).with_context(|| format!("hashing {:?}", rel))?;
        if size as i64 == file.size_b && digest == file.md5sum {
            Ok(CopyState::Healthy)
        } else {
            Ok(CopyState::Corrupt)
        }
    }

    async fn delete(&self, index: &IndexPool, root: &NodeRoot, file: &File, copy: &FileCopy) -> Result<DeleteOutcome> {
        let found = index.archive_copy_count_excluding(file.id, &copy.node_name).await?;
        if found < 2 {
            return Ok(DeleteOutcome::RefusedTooFewArchiveCopies { found });
        }

        let rel = Path::new(&file.acq_name).join(&file.name);
        if root.exists(&rel)? {
            root.remove_file(&rel)?;
            root.remove_empty_parents_up_to_root(&rel)?;
        }
        index.set_copy_state(file.id, &copy.node_name, CopyState::Removed, 0).await?;
        Ok(DeleteOutcome::Deleted)
    }

    async fn tidy_up(&self, root: &NodeRoot, stale_temp_age: Duration) -> Result<usize> {
        let mut cleaned = 0;
        for rel in root.list_dir(Path::new(""))? {
            let name = match rel.file_name() {
                Some(n) => n.to_string_lossy().to_string(),
                None => continue,
            };
            if !name.starts_with('.') || name == crate::buildcfg::NODE_MARKER_NAME {
                continue;
            }
            let meta = match root.stat(&rel) {
                Ok(m) => m,
                Err(_) => continue,
            };
            let age = meta
                .modified()
                .ok()
                .and_then(|m| SystemTime::now().duration_since(m).ok())
                .unwrap_or_default();
            if age >= stale_temp_age {
                log::info!("tidy_up: removing stale temp file {:?} (age {:?})", rel, age);
                root.remove_file(&rel)?;
                cleaned += 1;
            }
        }
        Ok(cleaned)
    }
}

/// The Default group: a single destination node per pull, chosen by
/// most available bytes among active candidates (`spec.md` §4.7 step
/// 1 — selection policy is otherwise unspecified; this is the
/// simplest policy that respects `min_avail_gb`).
pub struct DefaultGroupIo;

#[async_trait]
impl GroupIo for DefaultGroupIo {
    async fn pull(
        &self,
        index: &IndexPool,
        transfer: &TransferEngine,
        request: &CopyRequest,
        file: &File,
        source: &(Node, NodeRoot),
        candidates: &[(Node, NodeRoot)],
    ) -> Result<()> {
        let dest = if let Some(target) = &request.target_node {
            super::find_target_node(candidates, target)?
        } else {
            candidates
                .iter()
                .filter(|(n, _)| n.active)
                .max_by(|(a, _), (b, _)| a.avail_gb.partial_cmp(&b.avail_gb).unwrap_or(std::cmp::Ordering::Equal))
                .context("no active destination nodes in group")?
        };

        transfer.pull_one(index, request, file, source, dest).await
    }

    fn idle(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn check_init_creates_the_marker_on_a_fresh_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = NodeRoot::new(tmp.path());

        assert_eq!(DefaultNodeIo.check_init(&root, "n1").await.unwrap(), InitStatus::NotInitialised);
        assert!(tmp.path().join(crate::buildcfg::NODE_MARKER_NAME).exists());
        assert!(root.read_marker("n1").is_ok());
    }

    #[tokio::test]
    async fn repeated_check_init_on_an_initialised_node_is_a_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let root = NodeRoot::new(tmp.path());

        assert_eq!(DefaultNodeIo.check_init(&root, "n1").await.unwrap(), InitStatus::NotInitialised);
        let marker_path = tmp.path().join(crate::buildcfg::NODE_MARKER_NAME);
        let created_at = std::fs::metadata(&marker_path).unwrap().modified().unwrap();

        assert_eq!(DefaultNodeIo.check_init(&root, "n1").await.unwrap(), InitStatus::Initialised);
        let unchanged_at = std::fs::metadata(&marker_path).unwrap().modified().unwrap();
        assert_eq!(created_at, unchanged_at, "a second check_init must not rewrite the marker");
    }

    #[tokio::test]
    async fn check_init_rejects_a_marker_naming_a_different_node() {
        let tmp = tempfile::tempdir().unwrap();
        let root = NodeRoot::new(tmp.path());
        root.write_marker("other-node").unwrap();

        assert!(DefaultNodeIo.check_init(&root, "n1").await.is_err());
    }
}
