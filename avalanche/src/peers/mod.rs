//! Peer registry.
//!
//! [PeerManager] binds verified proofs to peers and network nodes to peers. It owns every
//! proof the node knows about, split across pools:
//! - valid: proofs bound to a peer (at most one proof per staked UTXO);
//! - conflicting: valid proofs that lost a conflict, or won one while the bound proof was
//!   still cooling down ([PeerManager::promote_conflicting]);
//! - immature: proofs whose stakes lack confirmations;
//! - orphan: proofs whose stakes are not in the UTXO set;
//! - dangling: proofs evicted because no node backed them for too long.
//!
//! Immature and orphan proofs are retried on every new tip ([PeerManager::updated_block_tip]).
//! Nodes announcing a proof that is not bound yet wait as pending nodes until it is.
//!
//! Peers that have at least one node own a slot in a score-weighted table used to pick the
//! next node to poll ([PeerManager::select_node]).

pub mod pool;
pub mod slot;

use crate::{
    chain::CoinView,
    contenders::reward_rank,
    proof::{self, Proof, StakeParams, Verification},
    types::{BlockHash, ContenderId, NodeId, PeerId, ProofId},
    vote::{ItemKind, ProofVote},
};
use avalanche_cryptography::{Digest, Verifier};
use pool::{AddStatus, ProofPool};
use rand::Rng;
use slot::Slots;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tracing::{debug, info};

/// How long a proof may stay bound without any node before it is considered dangling.
pub const DANGLING_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Maximum number of proofs kept in the immature pool.
pub const MAX_IMMATURE_PROOFS: usize = 4000;

const SELECT_PEER_MAX_RETRY: usize = 3;
const SELECT_NODE_MAX_RETRY: usize = 3;
const AVAILABILITY_DECAY: f64 = 0.1;

/// Configuration for the [PeerManager].
#[derive(Clone, Debug)]
pub struct Config {
    /// Parameters used to verify proof stakes.
    pub stake: StakeParams,

    /// Minimum time between two conflicting proofs replacing a peer.
    pub conflicting_proof_cooldown: Duration,

    /// How long a proof may stay without nodes before being evicted.
    pub dangling_timeout: Duration,

    /// Capacity of the immature pool.
    pub max_immature_proofs: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistrationMode {
    Default,
    /// Evict every conflicting proof regardless of preference and cooldown.
    ForceAccept,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectionMode {
    /// Keep the proof around as a conflicting proof.
    Default,
    /// Drop the proof entirely.
    Invalidate,
}

/// Reasons a proof is not bound to a peer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("proof-already-registered")]
    AlreadyRegistered,
    #[error("invalid-proof: {0}")]
    Invalid(proof::Error),
    #[error("proof was invalidated")]
    Invalidated,
    #[error("dangling-proof")]
    Dangling,
    #[error("immature-proof")]
    Immature,
    #[error("utxo-missing-or-spent")]
    Orphan,
    #[error("cooldown-not-elapsed")]
    CooldownNotElapsed,
    #[error("conflicting-utxos")]
    Conflicting,
    #[error("rejected-proof")]
    Rejected,
}

/// A proof bound to the network nodes announcing it.
#[derive(Clone, Debug)]
pub struct Peer {
    pub id: PeerId,
    pub proof: Arc<Proof>,
    pub nodes: BTreeSet<NodeId>,
    pub registration_time: SystemTime,
    pub next_possible_conflict_time: SystemTime,
    /// Whether avalanche finalized this proof.
    pub has_finalized: bool,
    /// Moving average of answered polls (1.0 when every poll is answered).
    pub availability_score: f64,
    slot: Option<usize>,
}

impl Peer {
    pub fn score(&self) -> u32 {
        self.proof.score()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// A network node attached to a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeEntry {
    pub id: NodeId,
    pub peer: PeerId,
    /// The node is not polled before this time.
    pub next_request_time: SystemTime,
}

/// Registry of proofs, peers and nodes.
pub struct PeerManager<V: Verifier> {
    cfg: Config,
    verifier: V,

    peers: BTreeMap<PeerId, Peer>,
    by_proof: HashMap<ProofId, PeerId>,
    next_peer_id: PeerId,

    nodes: HashMap<NodeId, NodeEntry>,
    pending: HashMap<NodeId, ProofId>,

    valid: ProofPool,
    conflicting: ProofPool,
    immature: ProofPool,
    orphans: ProofPool,
    dangling: ProofPool,
    invalid: HashSet<ProofId>,

    slots: Slots,
    now: SystemTime,
}

impl<V: Verifier> PeerManager<V> {
    pub fn new(cfg: Config, verifier: V) -> Self {
        Self {
            cfg,
            verifier,
            peers: BTreeMap::new(),
            by_proof: HashMap::new(),
            next_peer_id: 0,
            nodes: HashMap::new(),
            pending: HashMap::new(),
            valid: ProofPool::default(),
            conflicting: ProofPool::default(),
            immature: ProofPool::default(),
            orphans: ProofPool::default(),
            dangling: ProofPool::default(),
            invalid: HashSet::new(),
            slots: Slots::default(),
            now: UNIX_EPOCH,
        }
    }

    pub fn verifier(&self) -> &V {
        &self.verifier
    }

    pub fn stake_params(&self) -> &StakeParams {
        &self.cfg.stake
    }

    /// Record the latest known time (used by vote callbacks, which carry no clock).
    pub fn observe(&mut self, now: SystemTime) {
        self.now = self.now.max(now);
    }

    /// Verify `proof` against the chain and bind it to a new peer.
    pub fn register_proof(
        &mut self,
        proof: Arc<Proof>,
        coins: &impl CoinView,
        mode: RegistrationMode,
        now: SystemTime,
    ) -> Result<PeerId, RegistrationError> {
        self.observe(now);
        let id = proof.id();
        if self.by_proof.contains_key(&id) {
            return Err(RegistrationError::AlreadyRegistered);
        }
        if self.invalid.contains(&id) {
            return Err(RegistrationError::Invalidated);
        }
        if self.dangling.contains(&id) && !self.has_pending_nodes(&id) {
            return Err(RegistrationError::Dangling);
        }
        match proof.verify(&self.verifier, coins, &self.cfg.stake) {
            Verification::Valid => {}
            Verification::Immature(utxo) => {
                debug!(proof = %id, %utxo, "immature proof");
                self.add_immature(proof);
                return Err(RegistrationError::Immature);
            }
            Verification::Orphan(utxo) => {
                debug!(proof = %id, %utxo, "orphan proof");
                self.orphans.add_if_preferred(proof);
                return Err(RegistrationError::Orphan);
            }
            Verification::Invalid(err) => {
                debug!(proof = %id, ?err, "invalid proof");
                self.invalid.insert(id);
                return Err(RegistrationError::Invalid(err));
            }
        }
        self.bind(proof, mode, now)
    }

    /// Bind an already verified proof, resolving conflicts with bound proofs.
    fn bind(
        &mut self,
        proof: Arc<Proof>,
        mode: RegistrationMode,
        now: SystemTime,
    ) -> Result<PeerId, RegistrationError> {
        let id = proof.id();
        let cooldown_end = now + self.cfg.conflicting_proof_cooldown;
        match self.valid.add_if_no_conflict(proof.clone()) {
            AddStatus::Added => {}
            AddStatus::Duplicated => return Err(RegistrationError::AlreadyRegistered),
            AddStatus::Rejected => {
                let conflicts = self.valid.conflicts(&proof);
                if mode == RegistrationMode::Default {
                    let preferred = conflicts
                        .first()
                        .map_or(true, |best| proof.is_preferred_to(best));
                    if !preferred {
                        debug!(proof = %id, "proof conflicts with a preferred proof");
                        return match self.conflicting.add_if_preferred(proof).0 {
                            AddStatus::Rejected => Err(RegistrationError::Rejected),
                            _ => Err(RegistrationError::Conflicting),
                        };
                    }

                    // The winner is kept aside until the bound proofs may be replaced.
                    if self.is_cooling_down(&conflicts, now) {
                        debug!(proof = %id, "conflicting proof cooldown not elapsed");
                        return match self.conflicting.add_if_preferred(proof).0 {
                            AddStatus::Rejected => Err(RegistrationError::Rejected),
                            _ => Err(RegistrationError::CooldownNotElapsed),
                        };
                    }
                }
                for conflict in &conflicts {
                    info!(proof = %conflict.id(), replacement = %id, "proof replaced by conflicting proof");
                    self.move_to_conflicting(&conflict.id());
                }
                self.valid.add_if_no_conflict(proof.clone());
            }
        }

        self.conflicting.remove(&id);
        self.immature.remove(&id);
        self.orphans.remove(&id);
        self.dangling.remove(&id);

        let peer_id = self.next_peer_id;
        self.next_peer_id += 1;
        self.peers.insert(
            peer_id,
            Peer {
                id: peer_id,
                proof: proof.clone(),
                nodes: BTreeSet::new(),
                registration_time: now,
                next_possible_conflict_time: cooldown_end,
                has_finalized: false,
                availability_score: 0.0,
                slot: None,
            },
        );
        self.by_proof.insert(id, peer_id);

        let pending: Vec<NodeId> = self
            .pending
            .iter()
            .filter(|(_, proof)| **proof == id)
            .map(|(node, _)| *node)
            .collect();
        for node in pending {
            self.pending.remove(&node);
            self.attach(node, peer_id, now);
        }

        info!(proof = %id, peer = peer_id, score = proof.score(), "registered proof");
        Ok(peer_id)
    }

    /// Whether any of the bound `conflicts` was bound too recently to be replaced.
    fn is_cooling_down(&self, conflicts: &[Arc<Proof>], now: SystemTime) -> bool {
        conflicts
            .iter()
            .filter_map(|conflict| self.peer_by_proof(&conflict.id()))
            .any(|peer| peer.next_possible_conflict_time > now)
    }

    /// Bind conflicting proofs preferred to the bound proofs they conflict with, once the
    /// cooldown of those bound proofs has elapsed.
    ///
    /// Returns the proofs bound by this call.
    pub fn promote_conflicting(&mut self, now: SystemTime) -> Vec<ProofId> {
        self.observe(now);
        let candidates: Vec<Arc<Proof>> = self
            .conflicting
            .proofs()
            .filter(|proof| {
                let conflicts = self.valid.conflicts(proof);
                conflicts
                    .first()
                    .is_some_and(|best| proof.is_preferred_to(best))
                    && !self.is_cooling_down(&conflicts, now)
            })
            .cloned()
            .collect();

        let mut promoted = Vec::new();
        for proof in candidates {
            let id = proof.id();
            if self.conflicting.remove(&id).is_none() {
                continue;
            }
            match self.bind(proof, RegistrationMode::Default, now) {
                Ok(_) => promoted.push(id),
                Err(err) => debug!(proof = %id, ?err, "unable to promote conflicting proof"),
            }
        }
        promoted
    }

    fn add_immature(&mut self, proof: Arc<Proof>) {
        self.immature.add_if_preferred(proof);
        while self.immature.len() > self.cfg.max_immature_proofs {
            let Some(lowest) = self.immature.lowest_score() else {
                break;
            };
            self.immature.remove(&lowest);
        }
    }

    fn move_to_conflicting(&mut self, id: &ProofId) {
        let Some(proof) = self.valid.get(id).cloned() else {
            return;
        };
        if let Some(peer) = self.by_proof.get(id).copied() {
            self.remove_peer(peer);
        }
        self.conflicting.add_if_preferred(proof);
    }

    /// Remove a peer, returning its nodes to the pending set.
    fn remove_peer(&mut self, peer_id: PeerId) -> Option<Arc<Proof>> {
        let peer = self.peers.remove(&peer_id)?;
        let id = peer.proof.id();
        self.by_proof.remove(&id);
        self.valid.remove(&id);
        if let Some(slot) = peer.slot {
            self.slots.release(slot);
            self.maybe_compact();
        }
        for node in &peer.nodes {
            self.nodes.remove(node);
            self.pending.insert(*node, id);
        }
        Some(peer.proof)
    }

    /// Remove a proof from wherever it is.
    ///
    /// A bound proof gives its stakes back: conflicting proofs staking the same UTXOs are
    /// bound again. In [RejectionMode::Default] the rejected proof becomes a conflicting proof.
    pub fn reject_proof(&mut self, id: &ProofId, mode: RejectionMode) -> bool {
        if mode == RejectionMode::Invalidate && self.dangling.remove(id).is_some() {
            return true;
        }
        if self.immature.remove(id).is_some() || self.orphans.remove(id).is_some() {
            return true;
        }
        if self.conflicting.contains(id) {
            if mode == RejectionMode::Invalidate {
                self.conflicting.remove(id);
            }
            return true;
        }
        let Some(peer) = self.by_proof.get(id).copied() else {
            return false;
        };
        let Some(proof) = self.remove_peer(peer) else {
            return false;
        };
        info!(proof = %id, ?mode, "rejected proof");

        for utxo in proof.utxos() {
            let Some(conflict) = self.conflicting.get_by_utxo(utxo).cloned() else {
                continue;
            };
            self.conflicting.remove(&conflict.id());
            if let Err(err) = self.bind(conflict.clone(), RegistrationMode::Default, self.now) {
                debug!(proof = %conflict.id(), ?err, "unable to pull back conflicting proof");
            }
        }
        if mode == RejectionMode::Default {
            self.conflicting.add_if_preferred(proof);
        }
        true
    }

    /// Mark a proof invalid so it is never registered again.
    pub fn set_invalid(&mut self, id: ProofId) {
        self.invalid.insert(id);
    }

    /// Mark a bound proof as finalized.
    pub fn set_finalized(&mut self, id: &ProofId) -> bool {
        let Some(peer) = self.by_proof.get(id).and_then(|peer| self.peers.get_mut(peer)) else {
            return false;
        };
        peer.has_finalized = true;
        true
    }

    /// Re-verify bound proofs and retry immature and orphan proofs against a new tip.
    ///
    /// Returns the proofs bound by this update.
    pub fn updated_block_tip(&mut self, coins: &impl CoinView, now: SystemTime) -> Vec<ProofId> {
        self.observe(now);

        // Conflicting proofs must stay valid to be pulled back.
        for proof in self.conflicting.take_all() {
            match proof.verify(&self.verifier, coins, &self.cfg.stake) {
                Verification::Valid => {
                    self.conflicting.add_if_preferred(proof);
                }
                Verification::Immature(_) => self.add_immature(proof),
                Verification::Orphan(_) => {
                    self.orphans.add_if_preferred(proof);
                }
                Verification::Invalid(err) => {
                    debug!(proof = %proof.id(), ?err, "dropping invalid conflicting proof");
                    self.invalid.insert(proof.id());
                }
            }
        }

        let mut invalid = Vec::new();
        let mut immature = Vec::new();
        let mut orphans = Vec::new();
        for peer in self.peers.values() {
            match peer.proof.verify(&self.verifier, coins, &self.cfg.stake) {
                Verification::Valid => {}
                Verification::Immature(_) => immature.push(peer.proof.clone()),
                Verification::Orphan(_) => orphans.push(peer.proof.clone()),
                Verification::Invalid(err) => invalid.push((peer.proof.id(), err)),
            }
        }
        for (id, err) in invalid {
            info!(proof = %id, ?err, "bound proof became invalid");
            self.reject_proof(&id, RejectionMode::Invalidate);
            self.invalid.insert(id);
        }
        for proof in immature.iter().chain(orphans.iter()) {
            self.reject_proof(&proof.id(), RejectionMode::Invalidate);
        }

        let mut registered = Vec::new();
        let retry: Vec<Arc<Proof>> = self
            .immature
            .take_all()
            .into_iter()
            .chain(self.orphans.take_all())
            .collect();
        for proof in retry {
            let id = proof.id();
            if self
                .register_proof(proof, coins, RegistrationMode::Default, now)
                .is_ok()
            {
                registered.push(id);
            }
        }

        for proof in immature {
            self.add_immature(proof);
        }
        for proof in orphans {
            self.orphans.add_if_preferred(proof);
        }
        registered
    }

    /// Evict proofs that had no node for too long. Returns the evicted proofs.
    ///
    /// Dangling proofs that gained a pending node since are bound again.
    pub fn cleanup_dangling_proofs(
        &mut self,
        local: Option<ProofId>,
        coins: &impl CoinView,
        now: SystemTime,
    ) -> Vec<ProofId> {
        self.observe(now);
        let timeout = self.cfg.dangling_timeout;
        let newly_dangling: Vec<Arc<Proof>> = self
            .peers
            .values()
            .filter(|peer| {
                Some(peer.proof.id()) != local
                    && peer.nodes.is_empty()
                    && peer.registration_time + timeout <= now
            })
            .map(|peer| peer.proof.clone())
            .collect();
        let mut evicted = Vec::with_capacity(newly_dangling.len());
        for proof in newly_dangling {
            if self.reject_proof(&proof.id(), RejectionMode::Invalidate) {
                info!(proof = %proof.id(), "evicting dangling proof");
                evicted.push(proof.id());
                self.dangling.add_if_preferred(proof);
            }
        }

        let revived: Vec<Arc<Proof>> = self
            .dangling
            .proofs()
            .filter(|proof| self.has_pending_nodes(&proof.id()))
            .cloned()
            .collect();
        for proof in revived {
            let id = proof.id();
            if let Err(err) = self.register_proof(proof, coins, RegistrationMode::Default, now) {
                debug!(proof = %id, ?err, "unable to revive dangling proof");
            }
        }
        evicted
    }

    /// Attach a node to the peer of `proof_id`, or keep it pending until the proof is bound.
    ///
    /// Returns whether the node is attached to a peer.
    pub fn add_node(&mut self, node: NodeId, proof_id: ProofId, now: SystemTime) -> bool {
        self.observe(now);
        let target = self.by_proof.get(&proof_id).copied();
        if let Some(existing) = self.nodes.get(&node) {
            if Some(existing.peer) == target {
                return true;
            }
        }
        self.remove_node(node);
        match target {
            Some(peer) => {
                self.attach(node, peer, now);
                true
            }
            None => {
                self.pending.insert(node, proof_id);
                false
            }
        }
    }

    fn attach(&mut self, node: NodeId, peer_id: PeerId, now: SystemTime) {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        peer.nodes.insert(node);
        if peer.slot.is_none() {
            peer.slot = Some(self.slots.allocate(peer_id, peer.proof.score() as u64));
        }
        self.nodes.insert(
            node,
            NodeEntry {
                id: node,
                peer: peer_id,
                next_request_time: now,
            },
        );
        debug!(node, peer = peer_id, "attached node");
    }

    /// Detach a node (attached or pending).
    pub fn remove_node(&mut self, node: NodeId) -> bool {
        if self.pending.remove(&node).is_some() {
            return true;
        }
        let Some(entry) = self.nodes.remove(&node) else {
            return false;
        };
        if let Some(peer) = self.peers.get_mut(&entry.peer) {
            peer.nodes.remove(&node);
            if peer.nodes.is_empty() {
                if let Some(slot) = peer.slot.take() {
                    self.slots.release(slot);
                }
            }
        }
        self.maybe_compact();
        true
    }

    fn maybe_compact(&mut self) {
        if self.slots.fragmentation() * 2 <= self.slots.count() {
            return;
        }
        for (peer, index) in self.slots.compact() {
            if let Some(peer) = self.peers.get_mut(&peer) {
                peer.slot = Some(index);
            }
        }
    }

    pub fn update_next_request_time(&mut self, node: NodeId, time: SystemTime) -> bool {
        match self.nodes.get_mut(&node) {
            Some(entry) => {
                entry.next_request_time = time;
                true
            }
            None => false,
        }
    }

    /// Fold a poll outcome into the availability score of the node's peer.
    pub fn record_availability(&mut self, node: NodeId, answered: bool) {
        let Some(peer) = self
            .nodes
            .get(&node)
            .and_then(|entry| self.peers.get_mut(&entry.peer))
        else {
            return;
        };
        let sample = if answered { 1.0 } else { 0.0 };
        peer.availability_score += AVAILABILITY_DECAY * (sample - peer.availability_score);
    }

    /// Pick a peer with probability proportional to its score.
    pub fn select_peer(&self, rng: &mut impl Rng) -> Option<PeerId> {
        let max = self.slots.count();
        if max == 0 {
            return None;
        }
        (0..SELECT_PEER_MAX_RETRY).find_map(|_| self.slots.select(rng.gen_range(0..max)))
    }

    /// Pick a node that may be polled at `now`.
    pub fn select_node(&self, rng: &mut impl Rng, now: SystemTime) -> Option<NodeId> {
        for _ in 0..SELECT_NODE_MAX_RETRY {
            let peer = self.select_peer(rng)?;
            let Some(peer) = self.peers.get(&peer) else {
                continue;
            };
            let available = peer
                .nodes
                .iter()
                .filter_map(|node| self.nodes.get(node))
                .filter(|entry| entry.next_request_time <= now)
                .min_by_key(|entry| (entry.next_request_time, entry.id));
            if let Some(entry) = available {
                return Some(entry.id);
            }
        }
        None
    }

    /// Restore metadata of a bound proof (after loading persisted peers).
    pub fn restore_peer(
        &mut self,
        id: &ProofId,
        has_finalized: bool,
        registration_time: SystemTime,
        next_possible_conflict_time: SystemTime,
    ) -> bool {
        let Some(peer) = self.by_proof.get(id).and_then(|peer| self.peers.get_mut(peer)) else {
            return false;
        };
        peer.has_finalized = has_finalized;
        peer.registration_time = registration_time;
        peer.next_possible_conflict_time = next_possible_conflict_time;
        true
    }

    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn peer_by_proof(&self, id: &ProofId) -> Option<&Peer> {
        self.by_proof.get(id).and_then(|peer| self.peers.get(peer))
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Proofs of every peer.
    pub fn bound_proofs(&self) -> impl Iterator<Item = &Arc<Proof>> {
        self.peers.values().map(|peer| &peer.proof)
    }

    /// Best ranked proof entitled to the staking reward of the block after `prev`.
    ///
    /// Only finalized proofs registered more than twice the dangling timeout before the
    /// earliest of `block_time` (the time of `prev`) and `now` are eligible. Ties go to the
    /// lower contender id, then to the lower proof id.
    pub fn select_staking_reward_winner(
        &self,
        prev: &BlockHash,
        block_time: SystemTime,
        now: SystemTime,
    ) -> Option<Arc<Proof>> {
        let cutoff = block_time
            .min(now)
            .checked_sub(2 * self.cfg.dangling_timeout)?;
        self.peers
            .values()
            .filter(|peer| peer.has_finalized && peer.registration_time < cutoff)
            .filter_map(|peer| {
                let id = ContenderId::new(prev, &peer.proof.id());
                if id.0 == Digest::ZERO {
                    debug!(proof = %peer.proof.id(), %prev, "skipping zero contender id");
                    return None;
                }
                Some((reward_rank(&id, peer.score()), id, peer))
            })
            .min_by(|a, b| {
                a.0.total_cmp(&b.0)
                    .then_with(|| a.1.cmp(&b.1))
                    .then_with(|| a.2.proof.id().cmp(&b.2.proof.id()))
            })
            .map(|(_, _, peer)| peer.proof.clone())
    }

    pub fn node(&self, node: NodeId) -> Option<&NodeEntry> {
        self.nodes.get(&node)
    }

    /// Proof a node is attached to (or pending on).
    pub fn node_proof(&self, node: NodeId) -> Option<ProofId> {
        match self.nodes.get(&node) {
            Some(entry) => self.peers.get(&entry.peer).map(|peer| peer.proof.id()),
            None => self.pending.get(&node).copied(),
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn pending_node_count(&self) -> usize {
        self.pending.len()
    }

    fn has_pending_nodes(&self, id: &ProofId) -> bool {
        self.pending.values().any(|proof| proof == id)
    }

    pub fn is_bound(&self, id: &ProofId) -> bool {
        self.by_proof.contains_key(id)
    }

    pub fn is_conflicting(&self, id: &ProofId) -> bool {
        self.conflicting.contains(id)
    }

    pub fn is_immature(&self, id: &ProofId) -> bool {
        self.immature.contains(id)
    }

    pub fn is_orphan(&self, id: &ProofId) -> bool {
        self.orphans.contains(id)
    }

    pub fn is_dangling(&self, id: &ProofId) -> bool {
        self.dangling.contains(id)
    }

    pub fn is_invalid(&self, id: &ProofId) -> bool {
        self.invalid.contains(id)
    }

    /// Any known proof, whatever its pool.
    pub fn proof(&self, id: &ProofId) -> Option<Arc<Proof>> {
        [
            &self.valid,
            &self.conflicting,
            &self.immature,
            &self.orphans,
            &self.dangling,
        ]
        .into_iter()
        .find_map(|pool| pool.get(id).cloned())
    }

    /// Bound proofs, which may be relayed to other nodes.
    pub fn shareable_proofs(&self) -> Vec<Arc<Proof>> {
        let mut proofs: Vec<Arc<Proof>> = self.valid.proofs().cloned().collect();
        proofs.sort_by_key(|proof| proof.id());
        proofs
    }

    pub fn conflicting_proofs(&self) -> Vec<ProofId> {
        let mut ids: Vec<ProofId> = self.conflicting.ids().copied().collect();
        ids.sort();
        ids
    }

    pub fn immature_proofs(&self) -> Vec<ProofId> {
        let mut ids: Vec<ProofId> = self.immature.ids().copied().collect();
        ids.sort();
        ids
    }

    pub fn conflicting_proof_count(&self) -> usize {
        self.conflicting.len()
    }

    pub fn immature_proof_count(&self) -> usize {
        self.immature.len()
    }

    pub fn orphan_proof_count(&self) -> usize {
        self.orphans.len()
    }

    pub fn dangling_proof_count(&self) -> usize {
        self.dangling.len()
    }

    /// Sum of the scores of every bound proof.
    pub fn total_score(&self) -> u64 {
        self.peers.values().map(|peer| peer.score() as u64).sum()
    }

    /// Sum of the scores of bound proofs with at least one node.
    pub fn connected_score(&self) -> u64 {
        self.peers
            .values()
            .filter(|peer| !peer.nodes.is_empty())
            .map(|peer| peer.score() as u64)
            .sum()
    }
}

impl<V: Verifier> ItemKind for PeerManager<V> {
    type Id = ProofId;
    type Vote = ProofVote;

    fn local_vote(&self, id: &ProofId) -> ProofVote {
        if self.immature.contains(id) || self.orphans.contains(id) {
            ProofVote::Orphan
        } else if self.conflicting.contains(id) {
            ProofVote::Conflict
        } else if self.invalid.contains(id) {
            ProofVote::Rejected
        } else if self.by_proof.contains_key(id) {
            ProofVote::Active
        } else {
            ProofVote::Unknown
        }
    }

    fn is_worth_polling(&self, id: &ProofId) -> bool {
        self.by_proof.contains_key(id) || self.conflicting.contains(id)
    }

    fn on_accepted(&mut self, id: &ProofId) {
        let Some(proof) = self.conflicting.remove(id) else {
            return;
        };
        if let Err(err) = self.bind(proof, RegistrationMode::ForceAccept, self.now) {
            debug!(proof = %id, ?err, "unable to accept conflicting proof");
        }
    }

    fn on_rejected(&mut self, id: &ProofId) {
        if self.by_proof.contains_key(id) {
            self.reject_proof(id, RejectionMode::Default);
        }
    }

    fn on_finalized(&mut self, id: &ProofId) {
        if self.set_finalized(id) {
            info!(proof = %id, "finalized proof");
        }
    }

    fn on_invalidated(&mut self, id: &ProofId) {
        info!(proof = %id, "proof invalidated by avalanche");
        self.reject_proof(id, RejectionMode::Invalidate);
        self.invalid.insert(*id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::Chainstate,
        mocks::{self, STAKE_AMOUNT},
        types::OutPoint,
    };
    use avalanche_cryptography::{Ed25519, PrivateKey};
    use rand::{rngs::StdRng, SeedableRng};

    fn config(cooldown: Duration) -> Config {
        Config {
            stake: mocks::stake_params(1),
            conflicting_proof_cooldown: cooldown,
            dangling_timeout: DANGLING_TIMEOUT,
            max_immature_proofs: MAX_IMMATURE_PROOFS,
        }
    }

    fn manager(cooldown: Duration) -> PeerManager<Ed25519> {
        PeerManager::new(config(cooldown), Ed25519)
    }

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    struct Setup {
        chain: Chainstate,
        stakers: Vec<PrivateKey>,
        utxos: Vec<OutPoint>,
    }

    fn setup(count: usize) -> Setup {
        let stakers = mocks::keys(100, count);
        let (chain, utxos) = mocks::chain(&stakers, STAKE_AMOUNT, 1);
        Setup {
            chain,
            stakers,
            utxos,
        }
    }

    impl Setup {
        fn proof(&self, master: u64, sequence: u64, stakes: &[usize]) -> Arc<Proof> {
            let stakes: Vec<_> = stakes
                .iter()
                .map(|i| (self.utxos[*i], &self.stakers[*i]))
                .collect();
            mocks::proof(&PrivateKey::from_seed(master), sequence, &stakes, STAKE_AMOUNT)
        }
    }

    #[test]
    fn test_register_and_duplicate() {
        let s = setup(1);
        let mut peers = manager(Duration::ZERO);
        let proof = s.proof(0, 0, &[0]);
        let peer = peers
            .register_proof(proof.clone(), &s.chain, RegistrationMode::Default, at(0))
            .unwrap();
        assert_eq!(peers.peer(peer).unwrap().proof.id(), proof.id());
        assert_eq!(peers.local_vote(&proof.id()), ProofVote::Active);
        assert_eq!(
            peers.register_proof(proof, &s.chain, RegistrationMode::Default, at(0)),
            Err(RegistrationError::AlreadyRegistered)
        );
        assert_eq!(peers.total_score(), (STAKE_AMOUNT / proof::SCORE_UNIT));
        assert_eq!(peers.connected_score(), 0);
    }

    #[test]
    fn test_conflict_order_independent() {
        let s = setup(1);
        let low = s.proof(0, 1, &[0]);
        let high = s.proof(1, 2, &[0]);

        for order in [[&low, &high], [&high, &low]] {
            let mut peers = manager(Duration::ZERO);
            for proof in order {
                let _ = peers.register_proof(
                    (*proof).clone(),
                    &s.chain,
                    RegistrationMode::Default,
                    at(0),
                );
            }
            assert_eq!(peers.local_vote(&high.id()), ProofVote::Active);
            assert_eq!(peers.local_vote(&low.id()), ProofVote::Conflict);
            assert!(peers.is_bound(&high.id()));
            assert!(peers.is_conflicting(&low.id()));
        }
    }

    #[test]
    fn test_conflict_cooldown() {
        let s = setup(1);
        let mut peers = manager(Duration::from_secs(60));
        let low = s.proof(0, 1, &[0]);
        let high = s.proof(1, 2, &[0]);
        peers
            .register_proof(low.clone(), &s.chain, RegistrationMode::Default, at(0))
            .unwrap();
        assert_eq!(
            peers.register_proof(high.clone(), &s.chain, RegistrationMode::Default, at(30)),
            Err(RegistrationError::CooldownNotElapsed)
        );
        // Kept aside, not dropped.
        assert!(peers.is_bound(&low.id()));
        assert!(peers.is_conflicting(&high.id()));
        assert_eq!(peers.local_vote(&high.id()), ProofVote::Conflict);
        assert!(peers.promote_conflicting(at(59)).is_empty());

        assert_eq!(peers.promote_conflicting(at(60)), vec![high.id()]);
        assert!(peers.is_bound(&high.id()));
        assert!(peers.is_conflicting(&low.id()));
        assert_eq!(peers.local_vote(&high.id()), ProofVote::Active);
        assert_eq!(peers.local_vote(&low.id()), ProofVote::Conflict);
        assert!(peers.promote_conflicting(at(200)).is_empty());

        // Accepting the conflicting proof ignores both preference and cooldown.
        peers.on_accepted(&low.id());
        assert!(peers.is_bound(&low.id()));
        assert!(peers.is_conflicting(&high.id()));
    }

    #[test]
    fn test_losing_proof_kept_during_cooldown() {
        let s = setup(1);
        let mut peers = manager(Duration::from_secs(60));
        let low = s.proof(0, 1, &[0]);
        let high = s.proof(1, 2, &[0]);
        peers
            .register_proof(high.clone(), &s.chain, RegistrationMode::Default, at(0))
            .unwrap();
        assert_eq!(
            peers.register_proof(low.clone(), &s.chain, RegistrationMode::Default, at(1)),
            Err(RegistrationError::Conflicting)
        );
        assert_eq!(peers.local_vote(&high.id()), ProofVote::Active);
        assert_eq!(peers.local_vote(&low.id()), ProofVote::Conflict);
        assert!(peers.promote_conflicting(at(120)).is_empty());
        assert!(peers.is_bound(&high.id()));
    }

    #[test]
    fn test_reject_pulls_back_conflicting() {
        let s = setup(1);
        let mut peers = manager(Duration::ZERO);
        let low = s.proof(0, 1, &[0]);
        let high = s.proof(1, 2, &[0]);
        for proof in [&high, &low] {
            let _ = peers.register_proof(proof.clone(), &s.chain, RegistrationMode::Default, at(0));
        }

        assert!(peers.reject_proof(&high.id(), RejectionMode::Default));
        assert!(peers.is_bound(&low.id()));
        assert!(peers.is_conflicting(&high.id()));

        assert!(peers.reject_proof(&low.id(), RejectionMode::Invalidate));
        assert!(peers.is_bound(&high.id()));
        assert!(!peers.is_conflicting(&low.id()));
        assert_eq!(peers.local_vote(&low.id()), ProofVote::Unknown);
    }

    #[test]
    fn test_pending_nodes_attach_on_registration() {
        let s = setup(1);
        let mut peers = manager(Duration::ZERO);
        let proof = s.proof(0, 0, &[0]);
        assert!(!peers.add_node(7, proof.id(), at(0)));
        assert_eq!(peers.pending_node_count(), 1);

        let peer = peers
            .register_proof(proof.clone(), &s.chain, RegistrationMode::Default, at(0))
            .unwrap();
        assert_eq!(peers.pending_node_count(), 0);
        assert_eq!(peers.node(7).unwrap().peer, peer);
        assert_eq!(peers.connected_score(), peers.total_score());

        // Rejecting the proof sends the node back to pending.
        peers.reject_proof(&proof.id(), RejectionMode::Default);
        assert_eq!(peers.node_count(), 0);
        assert_eq!(peers.node_proof(7), Some(proof.id()));
    }

    #[test]
    fn test_select_node_respects_request_time() {
        let s = setup(2);
        let mut peers = manager(Duration::ZERO);
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(peers.select_node(&mut rng, at(0)), None);

        let a = s.proof(0, 0, &[0]);
        let b = s.proof(1, 0, &[1]);
        for proof in [&a, &b] {
            peers
                .register_proof(proof.clone(), &s.chain, RegistrationMode::Default, at(0))
                .unwrap();
        }
        peers.add_node(1, a.id(), at(0));
        peers.add_node(2, b.id(), at(0));

        let mut seen = HashSet::new();
        for _ in 0..100 {
            if let Some(node) = peers.select_node(&mut rng, at(0)) {
                seen.insert(node);
            }
        }
        assert_eq!(seen, HashSet::from([1, 2]));

        peers.update_next_request_time(1, at(10));
        for _ in 0..100 {
            assert_ne!(peers.select_node(&mut rng, at(5)), Some(1));
        }
        peers.remove_node(2);
        assert_eq!(peers.select_node(&mut rng, at(5)), None);
        assert_eq!(peers.select_node(&mut rng, at(10)), Some(1));
    }

    #[test]
    fn test_orphan_then_active() {
        let stakers = mocks::keys(100, 1);
        let (mut chain, utxos) = mocks::chain(&stakers, STAKE_AMOUNT, 1);
        let mut peers = manager(Duration::ZERO);

        // Stake a UTXO created by a block that is not mined yet.
        let (block, outpoint) = mocks::funding_block(&chain, &stakers[0], STAKE_AMOUNT);
        let proof = mocks::proof_at(
            &PrivateKey::from_seed(0),
            0,
            &[(outpoint, &stakers[0], block.height())],
            STAKE_AMOUNT,
        );
        assert_eq!(
            peers.register_proof(proof.clone(), &chain, RegistrationMode::Default, at(0)),
            Err(RegistrationError::Orphan)
        );
        assert_eq!(peers.local_vote(&proof.id()), ProofVote::Orphan);
        let _ = utxos;

        chain.submit_block(block).unwrap();
        assert_eq!(peers.updated_block_tip(&chain, at(1)), vec![proof.id()]);
        assert_eq!(peers.local_vote(&proof.id()), ProofVote::Active);

        // Further tips keep the proof active.
        mocks::mine(&mut chain, 3);
        assert!(peers.updated_block_tip(&chain, at(2)).is_empty());
        assert_eq!(peers.local_vote(&proof.id()), ProofVote::Active);
    }

    #[test]
    fn test_immature_until_confirmed() {
        let stakers = mocks::keys(100, 1);
        let (mut chain, _) = mocks::chain(&stakers, STAKE_AMOUNT, 1);
        let mut cfg = config(Duration::ZERO);
        cfg.stake.confirmations = 3;
        let mut peers = PeerManager::new(cfg, Ed25519);

        let (block, outpoint) = mocks::funding_block(&chain, &stakers[0], STAKE_AMOUNT);
        let height = block.height();
        chain.submit_block(block).unwrap();
        let proof = mocks::proof_at(
            &PrivateKey::from_seed(0),
            0,
            &[(outpoint, &stakers[0], height)],
            STAKE_AMOUNT,
        );
        assert_eq!(
            peers.register_proof(proof.clone(), &chain, RegistrationMode::Default, at(0)),
            Err(RegistrationError::Immature)
        );
        assert!(peers.is_immature(&proof.id()));

        mocks::mine(&mut chain, 1);
        assert!(peers.updated_block_tip(&chain, at(1)).is_empty());
        mocks::mine(&mut chain, 1);
        assert_eq!(peers.updated_block_tip(&chain, at(2)), vec![proof.id()]);
    }

    #[test]
    fn test_spent_stake_orphans_bound_proof() {
        let stakers = mocks::keys(100, 1);
        let (mut chain, utxos) = mocks::chain(&stakers, STAKE_AMOUNT, 1);
        let mut peers = manager(Duration::ZERO);
        let proof = mocks::proof(&PrivateKey::from_seed(0), 0, &[(utxos[0], &stakers[0])], STAKE_AMOUNT);
        peers
            .register_proof(proof.clone(), &chain, RegistrationMode::Default, at(0))
            .unwrap();

        mocks::mine_with(&mut chain, vec![mocks::spend(utxos[0], STAKE_AMOUNT, &stakers[0])]);
        assert!(peers.updated_block_tip(&chain, at(1)).is_empty());
        assert!(!peers.is_bound(&proof.id()));
        assert_eq!(peers.local_vote(&proof.id()), ProofVote::Orphan);
    }

    #[test]
    fn test_invalid_proof_remembered() {
        let s = setup(1);
        let mut peers = manager(Duration::ZERO);
        // Staked by a key that does not own the UTXO.
        let proof = mocks::proof(
            &PrivateKey::from_seed(0),
            0,
            &[(s.utxos[0], &PrivateKey::from_seed(999))],
            STAKE_AMOUNT,
        );
        assert!(matches!(
            peers.register_proof(proof.clone(), &s.chain, RegistrationMode::Default, at(0)),
            Err(RegistrationError::Invalid(_))
        ));
        assert_eq!(peers.local_vote(&proof.id()), ProofVote::Rejected);
        assert_eq!(
            peers.register_proof(proof, &s.chain, RegistrationMode::Default, at(0)),
            Err(RegistrationError::Invalidated)
        );
    }

    #[test]
    fn test_dangling_cleanup() {
        let s = setup(2);
        let mut peers = manager(Duration::ZERO);
        let local = s.proof(0, 0, &[0]);
        let remote = s.proof(1, 0, &[1]);
        for proof in [&local, &remote] {
            peers
                .register_proof(proof.clone(), &s.chain, RegistrationMode::Default, at(0))
                .unwrap();
        }

        let early = at(DANGLING_TIMEOUT.as_secs() - 1);
        assert!(peers
            .cleanup_dangling_proofs(Some(local.id()), &s.chain, early)
            .is_empty());

        let late = at(DANGLING_TIMEOUT.as_secs());
        assert_eq!(
            peers.cleanup_dangling_proofs(Some(local.id()), &s.chain, late),
            vec![remote.id()]
        );
        assert!(peers.is_bound(&local.id()));
        assert!(peers.is_dangling(&remote.id()));
        assert_eq!(
            peers.register_proof(remote.clone(), &s.chain, RegistrationMode::Default, late),
            Err(RegistrationError::Dangling)
        );

        // A node announcing the proof brings it back.
        peers.add_node(3, remote.id(), late);
        assert!(peers
            .cleanup_dangling_proofs(Some(local.id()), &s.chain, late)
            .is_empty());
        assert!(peers.is_bound(&remote.id()));
        assert_eq!(peers.node(3).map(|n| n.id), Some(3));
    }

    #[test]
    fn test_staking_reward_winner() {
        let s = setup(3);
        let mut peers = manager(Duration::ZERO);
        let proofs: Vec<Arc<Proof>> = (0..3).map(|i| s.proof(i as u64, 0, &[i])).collect();
        for proof in &proofs {
            peers
                .register_proof(proof.clone(), &s.chain, RegistrationMode::Default, at(0))
                .unwrap();
        }
        let prev = s.chain.tip();
        let eligible = at(2 * DANGLING_TIMEOUT.as_secs() + 1);

        // Nothing finalized yet.
        assert!(peers
            .select_staking_reward_winner(&prev, eligible, eligible)
            .is_none());

        peers.set_finalized(&proofs[0].id());
        peers.set_finalized(&proofs[1].id());
        let rank = |proof: &Proof| reward_rank(&ContenderId::new(&prev, &proof.id()), proof.score());
        let expected = if rank(&proofs[0]) <= rank(&proofs[1]) {
            proofs[0].id()
        } else {
            proofs[1].id()
        };
        let winner = peers
            .select_staking_reward_winner(&prev, eligible, at(u32::MAX as u64))
            .unwrap();
        assert_eq!(winner.id(), expected);

        // Registered too recently, whether the block or the clock is early.
        let early = at(2 * DANGLING_TIMEOUT.as_secs());
        assert!(peers
            .select_staking_reward_winner(&prev, early, eligible)
            .is_none());
        assert!(peers
            .select_staking_reward_winner(&prev, eligible, early)
            .is_none());
    }

    #[test]
    fn test_availability_score() {
        let s = setup(1);
        let mut peers = manager(Duration::ZERO);
        let proof = s.proof(0, 0, &[0]);
        let peer = peers
            .register_proof(proof.clone(), &s.chain, RegistrationMode::Default, at(0))
            .unwrap();
        peers.add_node(1, proof.id(), at(0));
        for _ in 0..10 {
            peers.record_availability(1, true);
        }
        let answered = peers.peer(peer).unwrap().availability_score;
        assert!(answered > 0.5);
        peers.record_availability(1, false);
        assert!(peers.peer(peer).unwrap().availability_score < answered);
    }
}
