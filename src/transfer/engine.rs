//! Drives one pull end to end: backend selection, staging, hash
//! verification, atomic rename, and the exponential backoff ladder
//! for failed attempts (`spec.md` §4.7).

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use rand::Rng;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::fs::NodeRoot;
use crate::index::{CopyRequest, CopyState, File, Node, Pool as IndexPool};

use super::backend::{select_backend, BackendKind, RemoteSpec};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("arrived file failed verification: expected {expected_size} bytes, got {got_size}")]
    VerificationFailed { expected_size: i64, got_size: i64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

const MIN_BACKOFF_SECS: u64 = 30;
const MAX_BACKOFF_SECS: u64 = 3600;

/// Exponential backoff with jitter, floored at 30s and capped at 1h
/// (`spec.md` §4.7 "on failure"). `attempt` is the 1-based number of
/// the attempt that just failed.
pub fn backoff_for_attempt(attempt: i32) -> Duration {
    let attempt = attempt.max(1) as u32;
    let raw = MIN_BACKOFF_SECS.saturating_mul(1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX));
    let capped = raw.min(MAX_BACKOFF_SECS);
    let jittered = rand::thread_rng().gen_range(capped / 2..=capped);
    Duration::from_secs(jittered.max(1))
}

/// After this many failed attempts at a pull, the destination copy is
/// marked `Missing` and the request is left pending rather than
/// retried indefinitely at the capped backoff (`spec.md` §4.7 step 6).
const DEFAULT_MAX_PULL_ATTEMPTS: i32 = 8;

pub struct TransferEngine {
    backend_kind: BackendKind,
    bbcp_path: String,
    rsync_path: String,
    verify_on_pull: bool,
    transfer_timeout: Duration,
    node_semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
    concurrency_per_node: usize,
    max_attempts: i32,
    /// In-memory backoff clock per request id: a request popped from
    /// the Index again before its `next_attempt_at` is skipped rather
    /// than retried (`spec.md` §4.7 step 6's exponential ladder). Not
    /// persisted — a daemon restart resets backoff for any request
    /// still pending, which is safe since a fresh attempt is always a
    /// valid thing to try.
    next_attempt_at: Mutex<HashMap<i64, Instant>>,
}

impl TransferEngine {
    pub fn new(
        backend_kind: BackendKind,
        bbcp_path: impl Into<String>,
        rsync_path: impl Into<String>,
        concurrency_per_node: usize,
        verify_on_pull: bool,
        transfer_timeout: Duration,
    ) -> Self {
        TransferEngine {
            backend_kind,
            bbcp_path: bbcp_path.into(),
            rsync_path: rsync_path.into(),
            verify_on_pull,
            transfer_timeout,
            node_semaphores: Mutex::new(HashMap::new()),
            concurrency_per_node: concurrency_per_node.max(1),
            max_attempts: DEFAULT_MAX_PULL_ATTEMPTS,
            next_attempt_at: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `request_id` is past its backoff window and may be
    /// attempted again. Requests never attempted are always ready.
    pub fn ready_for_retry(&self, request_id: i64) -> bool {
        match self.next_attempt_at.lock().unwrap().get(&request_id) {
            Some(at) => Instant::now() >= *at,
            None => true,
        }
    }

    fn semaphore_for(&self, node: &str) -> Arc<Semaphore> {
        self.node_semaphores
            .lock()
            .unwrap()
            .entry(node.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.concurrency_per_node)))
            .clone()
    }

    /// Pull `file` from `source` onto `dest`, respecting the
    /// per-destination-node concurrency cap. On success, completes
    /// `request` in the Index; on failure, bumps its attempt counter
    /// and propagates the error for the caller to schedule a retry
    /// after [`backoff_for_attempt`].
    pub async fn pull_one(
        &self,
        index: &IndexPool,
        request: &CopyRequest,
        file: &File,
        source: &(Node, NodeRoot),
        dest: &(Node, NodeRoot),
    ) -> Result<()> {
        let permit = self
            .semaphore_for(&dest.0.name)
            .acquire_owned()
            .await
            .context("destination node semaphore closed")?;

        let result = self.pull_one_inner(index, request, file, source, dest).await;
        drop(permit);

        match &result {
            Ok(()) => {
                self.next_attempt_at.lock().unwrap().remove(&request.id);
            }
            Err(e) => {
                log::warn!(
                    "pull of {}/{} from {} to {} failed: {:#}",
                    file.acq_name,
                    file.name,
                    source.0.name,
                    dest.0.name,
                    e
                );
                let attempts = index.bump_request_attempts(request.id).await?;
                let backoff = backoff_for_attempt(attempts);
                self.next_attempt_at.lock().unwrap().insert(request.id, Instant::now() + backoff);

                if attempts >= self.max_attempts {
                    log::warn!(
                        "{}/{} to {} failed {} times, marking Missing and leaving request {} pending",
                        file.acq_name,
                        file.name,
                        dest.0.name,
                        attempts,
                        request.id
                    );
                    index.find_or_create_copy(file.id, &dest.0.name).await?;
                    index.mark_copy_missing(file.id, &dest.0.name).await?;
                } else {
                    log::debug!("retrying request {} in {:?} (attempt {})", request.id, backoff, attempts);
                }
            }
        }
        result
    }

    async fn pull_one_inner(
        &self,
        index: &IndexPool,
        request: &CopyRequest,
        file: &File,
        source: &(Node, NodeRoot),
        dest: &(Node, NodeRoot),
    ) -> Result<()> {
        if index.copy_state(file.id, &dest.0.name).await? == Some(CopyState::Healthy) {
            log::debug!(
                "pre-pull check: {}/{} already healthy on {}, completing request {}",
                file.acq_name,
                file.name,
                dest.0.name,
                request.id
            );
            index.complete_copy_request(request.id).await?;
            return Ok(());
        }

        index.mark_transfer_started(request.id).await?;

        let rel = Path::new(&file.acq_name).join(&file.name);
        let remote = RemoteSpec {
            user: source.0.username.clone(),
            host: source.0.address.clone(),
            abs_path: source.1.root_path().join(&rel),
        };

        let temp_name = format!(".{}.{:08x}", file.name, rand::thread_rng().gen::<u32>());
        let temp_rel = Path::new(&file.acq_name).join(&temp_name);
        let temp_abs = dest.1.root_path().join(&temp_rel);

        dest.1.mkdir_parents(&temp_rel).context("creating destination parent directories")?;

        let backend = select_backend(self.backend_kind, &remote, &self.bbcp_path, &self.rsync_path);
        backend
            .transfer(&remote, &temp_abs, self.transfer_timeout)
            .await
            .with_context(|| format!("transferring {:?} via {}", rel, backend.name()))?;

        if self.verify_on_pull {
            let (size, digest) = dest.1.hash(&temp_rel).context("hashing arrived file")?;
            if size as i64 != file.size_b || digest != file.md5sum {
                let _ = dest.1.remove_file(&temp_rel);
                bail!(TransferError::VerificationFailed { expected_size: file.size_b, got_size: size as i64 });
            }
        }

        dest.1.atomic_rename(&temp_rel, &rel).context("renaming staged file into place")?;

        index.find_or_create_copy(file.id, &dest.0.name).await?;
        index.set_copy_state(file.id, &dest.0.name, CopyState::Healthy, file.size_b).await?;
        index.complete_copy_request(request.id).await?;

        log::info!("pulled {}/{} onto {}", file.acq_name, file.name, dest.0.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_floored_and_capped() {
        for attempt in 1..20 {
            let d = backoff_for_attempt(attempt);
            assert!(d.as_secs() >= 1);
            assert!(d.as_secs() <= MAX_BACKOFF_SECS);
        }
    }

    #[test]
    fn backoff_grows_with_attempts() {
        let early = backoff_for_attempt(1);
        let late = backoff_for_attempt(10);
        assert!(late >= early);
    }
}
