//! Polling readiness.
//!
//! The quorum is established once enough stake is known and connected, and enough nodes
//! answered a proof request. It is sticky: it never goes back to not established. Polling
//! additionally requires a minimum number of attached nodes, which is checked every time.

use crate::{
    peers::PeerManager,
    proof::{Proof, SCORE_UNIT},
    types::{Amount, NodeId},
};
use avalanche_cryptography::Verifier;
use std::collections::HashSet;
use tracing::info;

#[derive(Clone, Debug)]
pub struct Config {
    /// Minimum total stake of bound proofs.
    pub min_quorum_stake: Amount,
    /// Minimum fraction of the total score backed by at least one node.
    pub min_connected_stake_ratio: f64,
    /// Minimum number of nodes that sent us their proofs.
    pub min_avaproofs_node_count: usize,
    /// Minimum number of attached nodes.
    pub min_node_count: usize,
}

/// Aggregate stake view used to decide whether the quorum is established.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub node_count: usize,
    pub total_score: u64,
    pub connected_score: u64,
}

impl Snapshot {
    /// Build a snapshot from the peer registry. The local proof counts as connected even when
    /// no other node uses it.
    pub fn new<V: Verifier>(peers: &PeerManager<V>, local: Option<&Proof>) -> Self {
        let mut connected_score = peers.connected_score();
        if let Some(peer) = local.and_then(|proof| peers.peer_by_proof(&proof.id())) {
            if peer.nodes.is_empty() {
                connected_score += peer.score() as u64;
            }
        }
        Self {
            node_count: peers.node_count(),
            total_score: peers.total_score(),
            connected_score,
        }
    }
}

pub struct Quorum {
    cfg: Config,
    established: bool,
    avaproofs_nodes: HashSet<NodeId>,
}

impl Quorum {
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            established: false,
            avaproofs_nodes: HashSet::new(),
        }
    }

    /// Record that `node` sent its proofs. Returns false if it already did.
    pub fn record_avaproofs(&mut self, node: NodeId) -> bool {
        self.avaproofs_nodes.insert(node)
    }

    pub fn avaproofs_node_count(&self) -> usize {
        self.avaproofs_nodes.len()
    }

    /// Whether the quorum was established by a previous call.
    pub fn is_latched(&self) -> bool {
        self.established
    }

    /// Check (and latch) whether the quorum is established.
    pub fn is_established(&mut self, snapshot: &Snapshot) -> bool {
        if self.established {
            return true;
        }
        if self.avaproofs_nodes.len() < self.cfg.min_avaproofs_node_count {
            return false;
        }
        let min_score = self.cfg.min_quorum_stake / SCORE_UNIT;
        if snapshot.total_score < min_score {
            return false;
        }
        let min_connected =
            (snapshot.total_score as f64 * self.cfg.min_connected_stake_ratio).round() as u64;
        if snapshot.connected_score < min_connected {
            return false;
        }
        info!(
            total_score = snapshot.total_score,
            connected_score = snapshot.connected_score,
            "avalanche quorum established"
        );
        self.established = true;
        true
    }

    /// Whether polling may start: the quorum is established and enough nodes are attached.
    pub fn ready_to_poll(&mut self, snapshot: &Snapshot) -> bool {
        self.is_established(snapshot) && snapshot.node_count >= self.cfg.min_node_count
    }
}
