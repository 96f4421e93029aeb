//! The Transport group: destination nodes are removable media (tapes,
//! shuttle drives) that should be filled one at a time rather than
//! round-robined, so that a medium can be sealed and shipped once full
//! (`spec.md` §4.4 "Transport", grounded on the fill-a-medium-first
//! note in `other_examples/ba9fe154_Lowband21-ferrex`).

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::fs::NodeRoot;
use crate::index::{CopyRequest, File, Node, Pool as IndexPool};
use crate::transfer::TransferEngine;

use super::GroupIo;

pub struct TransportGroupIo;

/// Same-host check backing the Transport class's "local-only
/// transfers" requirement (`spec.md` §4.4 "picks the destination node
/// ... rejects otherwise"): a node's `daemon_host` names the machine
/// whose filesystem actually holds its root, so two nodes share a
/// host iff their `daemon_host`s match.
fn same_host(a: &Node, b: &Node) -> bool {
    a.daemon_host == b.daemon_host
}

/// Pick the destination among `candidates`, honoring both the
/// `target_node` override and the "local-only transfers" invariant
/// (`spec.md` §4.4): an explicit target must still share a host with
/// `source`, and the fill-a-medium-first policy only ever considers
/// same-host candidates. Pulled out of [`TransportGroupIo::pull`] so
/// the selection policy is testable without a live `IndexPool`.
fn select_destination<'a>(
    source: &Node,
    target_node: Option<&str>,
    file_size_b: i64,
    candidates: &'a [(Node, NodeRoot)],
) -> Result<&'a (Node, NodeRoot)> {
    if let Some(target) = target_node {
        let candidate = super::find_target_node(candidates, target)?;
        if !same_host(source, &candidate.0) {
            bail!(
                "transport group requires source and destination to share a host; {} is on {:?} but {} is on {:?}",
                source.name,
                source.daemon_host,
                candidate.0.name,
                candidate.0.daemon_host
            );
        }
        return Ok(candidate);
    }

    let needed_gb = file_size_b as f64 / 1_000_000_000.0;

    // Among active, same-host nodes with enough free space for this
    // file, prefer the one already closest to full: filling a medium
    // to capacity before starting the next one minimizes the number
    // of media that sit around partially written. Ties (equal
    // avail_gb) break on node name.
    candidates
        .iter()
        .filter(|(n, _)| n.active)
        .filter(|(n, _)| same_host(source, n))
        .filter(|(n, _)| n.avail_gb.map(|avail| avail >= needed_gb).unwrap_or(false))
        .min_by(|(a, _), (b, _)| {
            a.avail_gb
                .partial_cmp(&b.avail_gb)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        })
        .context("no same-host destination medium in group has room for this file")
}

#[async_trait]
impl GroupIo for TransportGroupIo {
    async fn pull(
        &self,
        index: &IndexPool,
        transfer: &TransferEngine,
        request: &CopyRequest,
        file: &File,
        source: &(Node, NodeRoot),
        candidates: &[(Node, NodeRoot)],
    ) -> Result<()> {
        let dest = select_destination(&source.0, request.target_node.as_deref(), file.size_b, candidates)?;
        transfer.pull_one(index, request, file, source, dest).await
    }

    fn idle(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::StorageType;

    fn node(name: &str, daemon_host: &str, avail_gb: Option<f64>) -> (Node, NodeRoot) {
        let n = Node {
            name: name.to_string(),
            group_name: "g1".to_string(),
            active: true,
            io_class: "transport".to_string(),
            storage_type: StorageType::Transport,
            root: format!("/data/{}", name),
            username: None,
            address: None,
            auto_import: false,
            auto_verify: false,
            avail_gb,
            min_avail_gb: None,
            max_total_gb: None,
            daemon_host: daemon_host.to_string(),
            io_config: None,
        };
        let root = NodeRoot::new(n.root.clone());
        (n, root)
    }

    #[test]
    fn rejects_cross_host_target() {
        let (src, _) = node("src", "host-a", None);
        let candidates = vec![node("far", "host-b", Some(100.0))];
        let err = select_destination(&src, Some("far"), 10, &candidates).unwrap_err();
        assert!(format!("{:#}", err).contains("share a host"));
    }

    #[test]
    fn picks_most_filled_same_host_candidate_with_room() {
        let (src, _) = node("src", "host-a", None);
        let candidates = vec![
            node("empty", "host-a", Some(900.0)),
            node("almost-full", "host-a", Some(50.0)),
            node("remote", "host-b", Some(10.0)),
        ];
        let (dest, _) = select_destination(&src, None, 1_000_000_000, &candidates).unwrap();
        assert_eq!(dest.name, "almost-full");
    }

    #[test]
    fn ties_on_avail_gb_break_by_node_name() {
        let (src, _) = node("src", "host-a", None);
        let candidates = vec![node("zeta", "host-a", Some(50.0)), node("alpha", "host-a", Some(50.0))];
        let (dest, _) = select_destination(&src, None, 1_000_000_000, &candidates).unwrap();
        assert_eq!(dest.name, "alpha");
    }

    #[test]
    fn excludes_cross_host_candidates_from_default_selection() {
        let (src, _) = node("src", "host-a", None);
        let candidates = vec![node("same-host-full", "host-a", Some(5.0)), node("other-host-roomy", "host-b", Some(900.0))];
        let (dest, _) = select_destination(&src, None, 1_000_000_000, &candidates).unwrap();
        assert_eq!(dest.name, "same-host-full");
    }
}
