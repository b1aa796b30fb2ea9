//! Sets of proofs indexed by the UTXOs they stake.

use crate::{
    proof::Proof,
    types::{OutPoint, ProofId},
};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

/// Result of adding a proof to a [ProofPool].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddStatus {
    Added,
    Duplicated,
    Rejected,
}

/// Proofs keyed by id, with at most one proof per staked UTXO.
#[derive(Clone, Debug, Default)]
pub struct ProofPool {
    proofs: HashMap<ProofId, Arc<Proof>>,
    utxos: HashMap<OutPoint, ProofId>,
}

impl ProofPool {
    pub fn len(&self) -> usize {
        self.proofs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proofs.is_empty()
    }

    pub fn contains(&self, id: &ProofId) -> bool {
        self.proofs.contains_key(id)
    }

    pub fn get(&self, id: &ProofId) -> Option<&Arc<Proof>> {
        self.proofs.get(id)
    }

    /// Proof staking `utxo`.
    pub fn get_by_utxo(&self, utxo: &OutPoint) -> Option<&Arc<Proof>> {
        self.utxos.get(utxo).and_then(|id| self.proofs.get(id))
    }

    pub fn ids(&self) -> impl Iterator<Item = &ProofId> {
        self.proofs.keys()
    }

    pub fn proofs(&self) -> impl Iterator<Item = &Arc<Proof>> {
        self.proofs.values()
    }

    /// Pool proofs sharing a UTXO with `proof`, most preferred first.
    pub fn conflicts(&self, proof: &Proof) -> Vec<Arc<Proof>> {
        let mut seen = HashSet::new();
        let mut conflicts: Vec<Arc<Proof>> = proof
            .utxos()
            .filter_map(|utxo| self.utxos.get(utxo))
            .filter(|id| **id != proof.id() && seen.insert(**id))
            .filter_map(|id| self.proofs.get(id).cloned())
            .collect();
        conflicts.sort_by(|a, b| {
            if a.is_preferred_to(b) {
                std::cmp::Ordering::Less
            } else if b.is_preferred_to(a) {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            }
        });
        conflicts
    }

    /// Add `proof` unless it conflicts with a pool proof.
    pub fn add_if_no_conflict(&mut self, proof: Arc<Proof>) -> AddStatus {
        if self.proofs.contains_key(&proof.id()) {
            return AddStatus::Duplicated;
        }
        if !self.conflicts(&proof).is_empty() {
            return AddStatus::Rejected;
        }
        self.insert(proof);
        AddStatus::Added
    }

    /// Add `proof` if it is preferred to every conflicting pool proof, evicting them.
    ///
    /// Returns the evicted proofs.
    pub fn add_if_preferred(&mut self, proof: Arc<Proof>) -> (AddStatus, Vec<Arc<Proof>>) {
        if self.proofs.contains_key(&proof.id()) {
            return (AddStatus::Duplicated, Vec::new());
        }
        let conflicts = self.conflicts(&proof);
        if conflicts.iter().any(|other| !proof.is_preferred_to(other)) {
            return (AddStatus::Rejected, Vec::new());
        }
        for other in &conflicts {
            self.remove(&other.id());
        }
        self.insert(proof);
        (AddStatus::Added, conflicts)
    }

    pub fn remove(&mut self, id: &ProofId) -> Option<Arc<Proof>> {
        let proof = self.proofs.remove(id)?;
        for utxo in proof.utxos() {
            if self.utxos.get(utxo) == Some(id) {
                self.utxos.remove(utxo);
            }
        }
        Some(proof)
    }

    /// Empty the pool, returning its proofs.
    pub fn take_all(&mut self) -> Vec<Arc<Proof>> {
        self.utxos.clear();
        self.proofs.drain().map(|(_, proof)| proof).collect()
    }

    /// Id of the proof with the lowest score.
    pub fn lowest_score(&self) -> Option<ProofId> {
        self.proofs
            .values()
            .min_by_key(|proof| (proof.score(), proof.id()))
            .map(|proof| proof.id())
    }

    fn insert(&mut self, proof: Arc<Proof>) {
        for utxo in proof.utxos() {
            self.utxos.insert(*utxo, proof.id());
        }
        self.proofs.insert(proof.id(), proof);
    }
}
