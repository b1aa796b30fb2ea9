//! Unconfirmed transactions.
//!
//! The mempool keeps a graph of unconfirmed transactions (parents and children within the
//! pool) and the side pools needed to answer transaction polls: conflicting transactions,
//! orphans (unknown inputs) and rejected ids.
//!
//! Preconsensus finality lives here too. Finalizing a transaction finalizes its in-pool
//! ancestors, never its descendants. The flag survives the transaction being mined and is
//! dropped once the containing block is itself finalized.

use crate::{
    chain::{Block, CoinView, Transaction},
    types::{Amount, OutPoint, TxId},
    vote::{ItemKind, TxVote},
};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;
use tracing::{debug, info};

/// Reasons a transaction is not admitted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("transaction already in mempool")]
    AlreadyKnown,
    #[error("coinbase transactions cannot be relayed")]
    Coinbase,
    #[error("transaction was previously rejected")]
    Rejected,
    #[error("transaction conflicts with {0}")]
    Conflict(TxId),
    #[error("missing inputs")]
    MissingInputs,
    #[error("outputs exceed inputs")]
    Overspend,
}

struct Entry {
    tx: Transaction,
    fee: Amount,
    sequence: u64,
    parents: HashSet<TxId>,
    children: HashSet<TxId>,
}

/// Pool of unconfirmed transactions.
#[derive(Default)]
pub struct Mempool {
    entries: HashMap<TxId, Entry>,
    spent: HashMap<OutPoint, TxId>,
    conflicting: HashMap<TxId, Transaction>,
    orphans: HashMap<TxId, Transaction>,
    rejected: HashSet<TxId>,
    finalized: HashSet<TxId>,
    invalidated: HashSet<TxId>,
    next_sequence: u64,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, txid: &TxId) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &TxId) -> Option<&Transaction> {
        self.entries.get(txid).map(|entry| &entry.tx)
    }

    pub fn fee(&self, txid: &TxId) -> Option<Amount> {
        self.entries.get(txid).map(|entry| entry.fee)
    }

    /// Transaction ids in admission order.
    pub fn txids(&self) -> Vec<TxId> {
        let mut txids: Vec<_> = self
            .entries
            .iter()
            .map(|(txid, entry)| (entry.sequence, *txid))
            .collect();
        txids.sort();
        txids.into_iter().map(|(_, txid)| txid).collect()
    }

    /// Whether the transaction was finalized by preconsensus.
    pub fn is_finalized(&self, txid: &TxId) -> bool {
        self.finalized.contains(txid)
    }

    /// Admit a transaction spending confirmed or in-pool outputs.
    pub fn accept(&mut self, tx: Transaction, coins: &impl CoinView) -> Result<TxId, Error> {
        let txid = tx.id();
        if tx.is_coinbase() {
            return Err(Error::Coinbase);
        }
        if self.entries.contains_key(&txid) {
            return Err(Error::AlreadyKnown);
        }
        if self.rejected.contains(&txid) {
            return Err(Error::Rejected);
        }
        if let Some(other) = tx.inputs.iter().find_map(|input| self.spent.get(input)) {
            let other = *other;
            debug!(%txid, conflict = %other, "conflicting transaction");
            self.conflicting.insert(txid, tx);
            return Err(Error::Conflict(other));
        }

        let mut parents = HashSet::new();
        let mut input_value: Amount = 0;
        let mut missing = None;
        for input in &tx.inputs {
            let amount = match self.entries.get(&input.txid) {
                Some(parent) => {
                    parents.insert(input.txid);
                    parent
                        .tx
                        .outputs
                        .get(input.index as usize)
                        .map(|output| output.amount)
                }
                None => coins.coin(input).map(|coin| coin.output.amount),
            };
            match amount {
                Some(amount) => input_value = input_value.saturating_add(amount),
                None => {
                    missing = Some(*input);
                    break;
                }
            }
        }
        if let Some(missing) = missing {
            debug!(%txid, %missing, "orphan transaction");
            self.orphans.insert(txid, tx);
            return Err(Error::MissingInputs);
        }
        let output_value = tx.output_value();
        if output_value > input_value {
            self.rejected.insert(txid);
            return Err(Error::Overspend);
        }

        for input in &tx.inputs {
            self.spent.insert(*input, txid);
        }
        for parent in &parents {
            if let Some(parent) = self.entries.get_mut(parent) {
                parent.children.insert(txid);
            }
        }

        // Pool transactions may already spend our outputs (re-admission after a reorg).
        let mut children = HashSet::new();
        for (outpoint, _) in tx.outpoints() {
            if let Some(child) = self.spent.get(&outpoint) {
                children.insert(*child);
            }
        }
        for child in &children {
            if let Some(child) = self.entries.get_mut(child) {
                child.parents.insert(txid);
            }
        }

        self.orphans.remove(&txid);
        self.conflicting.remove(&txid);
        self.entries.insert(
            txid,
            Entry {
                tx,
                fee: input_value - output_value,
                sequence: self.next_sequence,
                parents,
                children,
            },
        );
        self.next_sequence += 1;
        debug!(%txid, "accepted transaction");
        Ok(txid)
    }

    /// Retry orphans whose inputs may now be known. Returns the admitted ids.
    pub fn retry_orphans(&mut self, coins: &impl CoinView) -> Vec<TxId> {
        let mut admitted = Vec::new();
        loop {
            let orphans: Vec<Transaction> = self.orphans.drain().map(|(_, tx)| tx).collect();
            let before = admitted.len();
            for tx in orphans {
                if let Ok(txid) = self.accept(tx, coins) {
                    admitted.push(txid);
                }
            }
            if admitted.len() == before {
                return admitted;
            }
        }
    }

    /// In-pool ancestors of `txid`, including itself.
    pub fn ancestors(&self, txid: &TxId) -> Vec<TxId> {
        if !self.entries.contains_key(txid) {
            return Vec::new();
        }
        let mut seen = HashSet::from([*txid]);
        let mut queue = VecDeque::from([*txid]);
        let mut result = Vec::new();
        while let Some(next) = queue.pop_front() {
            result.push(next);
            if let Some(entry) = self.entries.get(&next) {
                for parent in &entry.parents {
                    if seen.insert(*parent) {
                        queue.push_back(*parent);
                    }
                }
            }
        }
        result
    }

    /// In-pool descendants of `txid`, excluding itself.
    pub fn descendants(&self, txid: &TxId) -> Vec<TxId> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<TxId> = self
            .entries
            .get(txid)
            .map(|entry| entry.children.iter().copied().collect())
            .unwrap_or_default();
        let mut result = Vec::new();
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next) {
                continue;
            }
            result.push(next);
            if let Some(entry) = self.entries.get(&next) {
                queue.extend(entry.children.iter().copied());
            }
        }
        result
    }

    /// Finalize a transaction and its in-pool ancestors. Returns the newly finalized ids.
    pub fn finalize(&mut self, txid: &TxId) -> Vec<TxId> {
        let finalized: Vec<TxId> = self
            .ancestors(txid)
            .into_iter()
            .filter(|id| self.finalized.insert(*id))
            .collect();
        if !finalized.is_empty() {
            info!(%txid, count = finalized.len(), "finalized transaction");
        }
        finalized
    }

    /// Transactions in an order where parents precede children.
    pub fn template(&self) -> Vec<Transaction> {
        let mut pending: HashMap<TxId, usize> = self
            .entries
            .iter()
            .map(|(txid, entry)| (*txid, entry.parents.len()))
            .collect();
        let mut ready: Vec<(u64, TxId)> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(txid, _)| (self.entries[txid].sequence, *txid))
            .collect();
        let mut result = Vec::with_capacity(self.entries.len());
        while !ready.is_empty() {
            ready.sort_by(|a, b| b.cmp(a));
            let Some((_, txid)) = ready.pop() else {
                break;
            };
            let Some(entry) = self.entries.get(&txid) else {
                continue;
            };
            result.push(entry.tx.clone());
            for child in &entry.children {
                if let Some(count) = pending.get_mut(child) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push((self.entries[child].sequence, *child));
                    }
                }
            }
        }
        result
    }

    /// Remove the transactions of a newly connected block and everything conflicting with them.
    pub fn remove_for_block(&mut self, block: &Block) {
        for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
            let txid = tx.id();
            self.orphans.remove(&txid);
            self.conflicting.remove(&txid);
            if let Some(entry) = self.entries.remove(&txid) {
                for input in &entry.tx.inputs {
                    self.spent.remove(input);
                }
                for child in &entry.children {
                    if let Some(child) = self.entries.get_mut(child) {
                        child.parents.remove(&txid);
                    }
                }
                for parent in &entry.parents {
                    if let Some(parent) = self.entries.get_mut(parent) {
                        parent.children.remove(&txid);
                    }
                }
                continue;
            }
            for input in &tx.inputs {
                if let Some(conflict) = self.spent.get(input).copied() {
                    debug!(%txid, %conflict, "removing transaction conflicting with block");
                    self.remove_recursive(&conflict);
                }
            }
        }
    }

    /// Remove transactions whose inputs are neither confirmed nor in the pool.
    pub fn remove_unspendable(&mut self, coins: &impl CoinView) {
        let unspendable: Vec<TxId> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.tx.inputs.iter().any(|input| {
                    !self.entries.contains_key(&input.txid) && coins.coin(input).is_none()
                })
            })
            .map(|(txid, _)| *txid)
            .collect();
        for txid in unspendable {
            self.remove_recursive(&txid);
        }
    }

    /// Drop preconsensus flags for transactions whose block was finalized.
    pub fn block_finalized(&mut self, block: &Block) {
        for tx in &block.transactions {
            self.finalized.remove(&tx.id());
        }
    }

    /// Remove a transaction and its descendants.
    pub fn remove_recursive(&mut self, txid: &TxId) {
        let mut doomed = self.descendants(txid);
        doomed.push(*txid);
        for txid in doomed {
            let Some(entry) = self.entries.remove(&txid) else {
                continue;
            };
            for input in &entry.tx.inputs {
                if self.spent.get(input) == Some(&txid) {
                    self.spent.remove(input);
                }
            }
            for parent in &entry.parents {
                if let Some(parent) = self.entries.get_mut(parent) {
                    parent.children.remove(&txid);
                }
            }
            self.finalized.remove(&txid);
            self.invalidated.remove(&txid);
        }
    }
}

impl ItemKind for Mempool {
    type Id = TxId;
    type Vote = TxVote;

    fn local_vote(&self, txid: &TxId) -> TxVote {
        if self.entries.contains_key(txid) {
            TxVote::Accepted
        } else if self.conflicting.contains_key(txid) {
            TxVote::Conflicting
        } else if self.orphans.contains_key(txid) {
            TxVote::Orphan
        } else if self.rejected.contains(txid) {
            TxVote::Invalid
        } else {
            TxVote::Unknown
        }
    }

    fn is_worth_polling(&self, txid: &TxId) -> bool {
        self.entries.contains_key(txid)
            && !self.finalized.contains(txid)
            && !self.invalidated.contains(txid)
    }

    fn on_finalized(&mut self, txid: &TxId) {
        self.finalize(txid);
    }

    fn on_invalidated(&mut self, txid: &TxId) {
        info!(%txid, "transaction invalidated by avalanche");
        self.invalidated.insert(*txid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Chainstate, TxOut, BLOCK_SUBSIDY};
    use avalanche_cryptography::PrivateKey;

    fn owner() -> avalanche_cryptography::PublicKey {
        PrivateKey::from_seed(1).public_key()
    }

    fn chain() -> (Chainstate, OutPoint) {
        let coinbase = Transaction::coinbase(
            0,
            vec![TxOut {
                amount: BLOCK_SUBSIDY,
                owner: owner(),
            }],
        );
        let outpoint = OutPoint::new(coinbase.id(), 0);
        let genesis = Block::new(Default::default(), 0, 1_000, 1, 0, vec![coinbase]);
        (Chainstate::new(genesis, None), outpoint)
    }

    fn spend(input: OutPoint, amount: Amount) -> Transaction {
        Transaction {
            inputs: vec![input],
            outputs: vec![TxOut {
                amount,
                owner: owner(),
            }],
            lock_time: 0,
        }
    }

    /// A chain of `count` transactions, each spending the previous one.
    fn spend_chain(input: OutPoint, count: usize) -> Vec<Transaction> {
        let mut txs = Vec::new();
        let mut input = input;
        let mut amount = BLOCK_SUBSIDY;
        for _ in 0..count {
            amount -= 1_000;
            let tx = spend(input, amount);
            input = OutPoint::new(tx.id(), 0);
            txs.push(tx);
        }
        txs
    }

    #[test]
    fn test_accept_chain() {
        let (chain, outpoint) = chain();
        let mut mempool = Mempool::new();
        let txs = spend_chain(outpoint, 3);
        for tx in txs.iter().cloned() {
            mempool.accept(tx, &chain).unwrap();
        }
        assert_eq!(mempool.len(), 3);
        assert_eq!(mempool.fee(&txs[0].id()), Some(1_000));
        assert_eq!(mempool.local_vote(&txs[2].id()), TxVote::Accepted);
        assert_eq!(
            mempool.accept(txs[0].clone(), &chain),
            Err(Error::AlreadyKnown)
        );
    }

    #[test]
    fn test_conflict_and_orphan_votes() {
        let (chain, outpoint) = chain();
        let mut mempool = Mempool::new();
        let first = spend(outpoint, 10);
        let second = spend(outpoint, 20);
        mempool.accept(first.clone(), &chain).unwrap();
        assert_eq!(
            mempool.accept(second.clone(), &chain),
            Err(Error::Conflict(first.id()))
        );
        assert_eq!(mempool.local_vote(&second.id()), TxVote::Conflicting);

        let orphan = spend(OutPoint::new(TxId::default(), 0), 1);
        assert_eq!(mempool.accept(orphan.clone(), &chain), Err(Error::MissingInputs));
        assert_eq!(mempool.local_vote(&orphan.id()), TxVote::Orphan);

        let overspend = spend(OutPoint::new(first.id(), 0), 11);
        assert_eq!(mempool.accept(overspend.clone(), &chain), Err(Error::Overspend));
        assert_eq!(mempool.local_vote(&overspend.id()), TxVote::Invalid);
        assert_eq!(mempool.local_vote(&TxId::default()), TxVote::Unknown);
    }

    #[test]
    fn test_orphans_resolved() {
        let (chain, outpoint) = chain();
        let mut mempool = Mempool::new();
        let txs = spend_chain(outpoint, 2);
        assert_eq!(
            mempool.accept(txs[1].clone(), &chain),
            Err(Error::MissingInputs)
        );
        mempool.accept(txs[0].clone(), &chain).unwrap();
        assert_eq!(mempool.retry_orphans(&chain), vec![txs[1].id()]);
        assert_eq!(mempool.len(), 2);
    }

    #[test]
    fn test_finalize_ancestors_not_descendants() {
        let (chain, outpoint) = chain();
        let mut mempool = Mempool::new();
        let txs = spend_chain(outpoint, 4);
        for tx in txs.iter().cloned() {
            mempool.accept(tx, &chain).unwrap();
        }
        let ids: Vec<TxId> = txs.iter().map(Transaction::id).collect();

        let finalized = mempool.finalize(&ids[2]);
        assert_eq!(finalized.len(), 3);
        assert!(mempool.is_finalized(&ids[0]));
        assert!(mempool.is_finalized(&ids[1]));
        assert!(mempool.is_finalized(&ids[2]));
        assert!(!mempool.is_finalized(&ids[3]));
        assert!(!mempool.is_worth_polling(&ids[2]));
        assert!(mempool.is_worth_polling(&ids[3]));

        // Already finalized ancestors are not reported twice.
        assert_eq!(mempool.finalize(&ids[3]), vec![ids[3]]);
    }

    #[test]
    fn test_finality_survives_mining() {
        let (mut chain, outpoint) = chain();
        let mut mempool = Mempool::new();
        let txs = spend_chain(outpoint, 2);
        for tx in txs.iter().cloned() {
            mempool.accept(tx, &chain).unwrap();
        }
        mempool.finalize(&txs[0].id());

        let coinbase = Transaction::coinbase(1, vec![TxOut { amount: 1, owner: owner() }]);
        let block = Block::new(chain.tip(), 1, 2_000, 1, 1, vec![coinbase, txs[0].clone()]);
        chain.submit_block(block.clone()).unwrap();
        mempool.remove_for_block(&block);

        assert!(!mempool.contains(&txs[0].id()));
        assert!(mempool.is_finalized(&txs[0].id()));
        assert_eq!(mempool.template(), vec![txs[1].clone()]);

        mempool.block_finalized(&block);
        assert!(!mempool.is_finalized(&txs[0].id()));
    }

    #[test]
    fn test_block_conflicts_removed() {
        let (mut chain, outpoint) = chain();
        let mut mempool = Mempool::new();
        let txs = spend_chain(outpoint, 2);
        for tx in txs.iter().cloned() {
            mempool.accept(tx, &chain).unwrap();
        }
        let double_spend = spend(outpoint, 5);
        let coinbase = Transaction::coinbase(1, vec![TxOut { amount: 1, owner: owner() }]);
        let block = Block::new(chain.tip(), 1, 2_000, 1, 1, vec![coinbase, double_spend]);
        chain.submit_block(block.clone()).unwrap();
        mempool.remove_for_block(&block);
        assert!(mempool.is_empty());
    }

    #[test]
    fn test_template_orders_parents_first() {
        let (chain, outpoint) = chain();
        let mut mempool = Mempool::new();
        let txs = spend_chain(outpoint, 3);
        for tx in txs.iter().cloned() {
            mempool.accept(tx, &chain).unwrap();
        }
        assert_eq!(mempool.template(), txs);
        assert_eq!(
            mempool.txids(),
            txs.iter().map(Transaction::id).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_invalidated_stays_in_pool() {
        let (chain, outpoint) = chain();
        let mut mempool = Mempool::new();
        let txid = mempool.accept(spend(outpoint, 1), &chain).unwrap();
        mempool.on_invalidated(&txid);
        assert!(mempool.contains(&txid));
        assert!(!mempool.is_worth_polling(&txid));
    }
}
