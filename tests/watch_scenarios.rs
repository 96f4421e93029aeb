//! Filesystem-level end-to-end scenarios from `spec.md` §8.
//!
//! S1 and S2 only involve the watcher and the node root; they don't
//! touch the Data Index, so they run here against a real tempdir
//! without a database. S3-S6 additionally require Index state and are
//! covered by the Index client's own unit tests plus the engine-level
//! fixtures in `src/transfer/engine.rs` and `src/index/client.rs`.

use std::time::Duration;

use alpenhorn::fs::NodeRoot;
use alpenhorn::watch::{catch_up_scan, start_event_watch, DiscoveredPath};

async fn recv_within(rx: &mut tokio::sync::mpsc::Receiver<DiscoveredPath>, timeout: Duration) -> Option<DiscoveredPath> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

/// S1 — First import: a fresh node with one file under its root is
/// discovered by the catch-up scan, and the node marker itself is
/// never reported as a candidate path.
#[tokio::test]
async fn s1_first_import_is_discovered_by_catch_up_scan() {
    let tmp = tempfile::tempdir().unwrap();
    let root = NodeRoot::new(tmp.path());
    root.write_marker("n1").unwrap();

    std::fs::create_dir_all(tmp.path().join("2025/02/21")).unwrap();
    std::fs::write(tmp.path().join("2025/02/21/meta.txt"), vec![0u8; 52]).unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    let sent = catch_up_scan(root, "n1".to_string(), tx).await.unwrap();
    assert_eq!(sent, 1);

    let discovered = rx.try_recv().unwrap();
    assert_eq!(discovered.node_name, "n1");
    assert_eq!(discovered.rel_path, std::path::Path::new("2025/02/21/meta.txt"));
    assert!(rx.try_recv().is_err(), "the ALPENHORN_NODE marker must never be reported");
}

/// S2 — Locked write: while a `.NAME.lock` sibling exists, the write
/// underneath it must not be forwarded; once the lock is removed, the
/// write is discovered exactly once.
#[tokio::test]
async fn s2_locked_write_is_suppressed_until_lock_removed() {
    let tmp = tempfile::tempdir().unwrap();
    let root = NodeRoot::new(tmp.path());
    root.write_marker("n1").unwrap();
    std::fs::create_dir_all(tmp.path().join("2025/02/21")).unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    let handle = start_event_watch(root.clone(), "n1".to_string(), tx).unwrap();

    // Lock first, then the write underneath it.
    std::fs::write(tmp.path().join("2025/02/21/.meta.txt.lock"), b"").unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    std::fs::write(tmp.path().join("2025/02/21/meta.txt"), vec![0u8; 52]).unwrap();

    // No import should surface while the lock file is present.
    assert!(
        recv_within(&mut rx, Duration::from_millis(500)).await.is_none(),
        "a locked file must not be forwarded for import"
    );

    // Removing the lock re-enqueues the file it was guarding.
    std::fs::remove_file(tmp.path().join("2025/02/21/.meta.txt.lock")).unwrap();
    let discovered = recv_within(&mut rx, Duration::from_secs(5))
        .await
        .expect("removing the lock file must re-enqueue the file it guarded");
    assert_eq!(discovered.node_name, "n1");
    assert_eq!(discovered.rel_path, std::path::Path::new("2025/02/21/meta.txt"));

    handle.abort();
}

/// Property 3 (transfer atomicity): hidden dot-prefixed names are
/// never reported as import candidates, even once fully written.
#[tokio::test]
async fn hidden_temp_files_are_never_discovered() {
    let tmp = tempfile::tempdir().unwrap();
    let root = NodeRoot::new(tmp.path());
    root.write_marker("n1").unwrap();
    std::fs::create_dir_all(tmp.path().join("2025/02/21")).unwrap();
    std::fs::write(tmp.path().join("2025/02/21/.meta.txt.a1b2c3d4"), vec![0u8; 52]).unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    let sent = catch_up_scan(root, "n1".to_string(), tx).await.unwrap();
    assert_eq!(sent, 0);
    assert!(rx.try_recv().is_err());
}
