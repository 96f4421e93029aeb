//! C5 — Auto-import watcher.
//!
//! Watches a node's filesystem for new files and forwards their
//! relative paths to the import engine. Nodes whose I/O class
//! disables event watching (Polling) get a periodic directory-diff
//! scan instead (`spec.md` §4.5). Grounded on the native-vs-polling
//! strategy split sketched in
//! `other_examples/ba9fe154_Lowband21-ferrex`; the `notify` crate
//! supplies the native half the way that design note anticipated.

mod poller;

pub use poller::poll_once;

use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::buildcfg::NODE_MARKER_NAME;
use crate::fs::NodeRoot;

/// One discovered path, ready for the importer.
#[derive(Debug, Clone)]
pub struct DiscoveredPath {
    pub node_name: String,
    pub rel_path: PathBuf,
}

fn is_ignorable(rel: &std::path::Path) -> bool {
    match rel.file_name() {
        Some(name) => {
            let name = name.to_string_lossy();
            name == NODE_MARKER_NAME || name.starts_with('.')
        }
        None => true,
    }
}

/// A lock-file path, `.NAME.lock`, per `rel`'s dirname. `spec.md`
/// §4.5 rule 1: while this file exists, import of `NAME` is
/// suppressed.
fn lock_path_for(rel: &std::path::Path) -> Option<PathBuf> {
    let name = rel.file_name()?.to_string_lossy().to_string();
    Some(rel.with_file_name(format!(".{}.lock", name)))
}

/// The target name a `.NAME.lock` path itself names, or `None` if
/// `rel` isn't a lock file.
fn locked_target_for(rel: &std::path::Path) -> Option<PathBuf> {
    let name = rel.file_name()?.to_string_lossy().to_string();
    let target = name.strip_prefix('.')?.strip_suffix(".lock")?;
    Some(rel.with_file_name(target))
}

fn is_locked(root: &NodeRoot, rel: &std::path::Path) -> bool {
    match lock_path_for(rel) {
        Some(lock_rel) => root.exists(&lock_rel).unwrap_or(false),
        None => false,
    }
}

/// A running watch on one node; dropping it stops the watcher.
pub enum WatchHandle {
    Event {
        _watcher: RecommendedWatcher,
        _forwarder: JoinHandle<()>,
    },
    Polling {
        task: JoinHandle<()>,
    },
}

impl WatchHandle {
    pub fn abort(self) {
        match self {
            WatchHandle::Event { _forwarder, .. } => _forwarder.abort(),
            WatchHandle::Polling { task } => task.abort(),
        }
    }
}

/// Do an initial full scan of the node's tree and push every existing
/// file through `tx`. Run once at startup before the live watch takes
/// over, so files that arrived while the daemon was down are not
/// missed (`spec.md` §4.5 "Startup behaviour").
pub async fn catch_up_scan(root: NodeRoot, node_name: String, tx: mpsc::Sender<DiscoveredPath>) -> Result<usize> {
    let root_for_blocking = root.clone();
    let paths = tokio::task::spawn_blocking(move || root_for_blocking.list_dir(std::path::Path::new("")))
        .await
        .context("catch-up scan task panicked")??;

    let mut sent = 0;
    for rel_path in paths {
        if is_ignorable(&rel_path) || is_locked(&root, &rel_path) {
            continue;
        }
        if tx.send(DiscoveredPath { node_name: node_name.clone(), rel_path }).await.is_err() {
            break;
        }
        sent += 1;
    }
    Ok(sent)
}

/// Start a native filesystem-event watch on `root`, forwarding newly
/// written files to `tx`. `notify`'s callback runs on its own thread;
/// a forwarding task bridges it into the async world.
pub fn start_event_watch(root: NodeRoot, node_name: String, tx: mpsc::Sender<DiscoveredPath>) -> Result<WatchHandle> {
    let (raw_tx, raw_rx) = std_mpsc::channel();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            let _ = raw_tx.send(event);
        }
    })
    .context("constructing native filesystem watcher")?;

    watcher
        .watch(root.root_path(), RecursiveMode::Recursive)
        .with_context(|| format!("watching {:?}", root.root_path()))?;

    let root_path = root.root_path().to_owned();
    let forwarder = tokio::task::spawn_blocking(move || {
        while let Ok(event) = raw_rx.recv() {
            let is_remove = matches!(event.kind, notify::EventKind::Remove(_));
            let is_write = matches!(event.kind, notify::EventKind::Create(_) | notify::EventKind::Modify(_));
            if !is_remove && !is_write {
                continue;
            }

            for path in event.paths {
                let rel = match path.strip_prefix(&root_path) {
                    Ok(r) => r.to_owned(),
                    Err(_) => continue,
                };

                if is_remove {
                    // A `.NAME.lock` file disappearing un-suppresses
                    // NAME; re-check it the same way a rename/close on
                    // NAME itself would (`spec.md` §4.5 rule 1).
                    if let Some(target) = locked_target_for(&rel) {
                        if !is_locked(&root, &target) && root.exists(&target).unwrap_or(false) {
                            let discovered = DiscoveredPath { node_name: node_name.clone(), rel_path: target };
                            if tx.blocking_send(discovered).is_err() {
                                return;
                            }
                        }
                    }
                    continue;
                }

                if is_ignorable(&rel) || !path.is_file() {
                    continue;
                }
                if is_locked(&root, &rel) {
                    log::info!("skipping {:?}, locked", rel);
                    continue;
                }
                let discovered = DiscoveredPath { node_name: node_name.clone(), rel_path: rel };
                if tx.blocking_send(discovered).is_err() {
                    return;
                }
            }
        }
    });

    Ok(WatchHandle::Event { _watcher: watcher, _forwarder: forwarder })
}

/// Start a periodic directory-diff scan (`spec.md` §4.5, the Polling
/// I/O class).
pub fn start_polling_watch(
    root: NodeRoot,
    node_name: String,
    interval: Duration,
    tx: mpsc::Sender<DiscoveredPath>,
) -> WatchHandle {
    let task = tokio::spawn(async move {
        let mut seen = std::collections::HashSet::new();
        loop {
            tokio::time::sleep(interval).await;
            let root = root.clone();
            let fresh = match tokio::task::spawn_blocking(move || poll_once(&root)).await {
                Ok(Ok(v)) => v,
                _ => continue,
            };
            for rel_path in fresh {
                if is_ignorable(&rel_path) || !seen.insert(rel_path.clone()) {
                    continue;
                }
                if tx
                    .send(DiscoveredPath { node_name: node_name.clone(), rel_path })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    });

    WatchHandle::Polling { task }
}
