//! In-memory chain state.
//!
//! [Chainstate] keeps every accepted block in a tree, the active chain, the UTXO set at the
//! active tip (with undo data for disconnection) and two independent flags per block:
//! validity (`invalidateblock` / `reconsiderblock`) and parking (`parkblock` / `unparkblock`).
//! Each flag is tracked on the block itself and inherited by its descendants.
//!
//! Chain selection picks the most cumulative work among usable blocks, with two overrides:
//! - a fork point below the finalized block parks the first block of the competing branch;
//! - a reorg disconnecting at least `park_deep_reorg_depth` blocks parks the first block of
//!   the competing branch, unless a block on that branch was explicitly unparked.

pub mod block;

pub use block::{Block, Coin, Header, Transaction, TxOut, BLOCK_SUBSIDY};

use crate::{
    types::{Amount, BlockHash, OutPoint, TxId},
    vote::{BlockVote, ItemKind},
};
use std::{
    cmp::Reverse,
    collections::{HashMap, HashSet, VecDeque},
    fmt::Display,
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors returned by [Chainstate] operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("block already known: {0}")]
    Duplicate(BlockHash),
    #[error("unknown parent: {0}")]
    UnknownParent(BlockHash),
    #[error("block not found: {0}")]
    UnknownBlock(BlockHash),
    #[error("bad height: expected {expected}, got {got}")]
    BadHeight { expected: u32, got: u32 },
    #[error("genesis block cannot be invalidated or parked")]
    Genesis,
    #[error("finalize-invalid-block")]
    FinalizeInvalid,
}

/// Reasons a block fails to connect to the active chain.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("first transaction is not a coinbase")]
    NoCoinbase,
    #[error("unexpected coinbase")]
    ExtraCoinbase,
    #[error("missing or spent input: {0}")]
    MissingInput(OutPoint),
    #[error("outputs exceed inputs: {0}")]
    Overspend(TxId),
    #[error("coinbase pays more than subsidy and fees")]
    CoinbaseOverpay,
}

/// Validity and parking flags of a block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Status {
    failed: bool,
    failed_parent: bool,
    parked: bool,
    parked_parent: bool,
    unparked: bool,
}

impl Status {
    /// The block or one of its ancestors is invalid.
    pub fn is_invalid(&self) -> bool {
        self.failed || self.failed_parent
    }

    /// The block or one of its ancestors is parked.
    pub fn is_parked(&self) -> bool {
        self.parked || self.parked_parent
    }
}

/// Status of a chain tip, as reported by `getchaintips`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TipStatus {
    Active,
    Invalid,
    Parked,
    ValidFork,
}

impl TipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Invalid => "invalid",
            Self::Parked => "parked",
            Self::ValidFork => "valid-fork",
        }
    }
}

impl Display for TipStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A leaf of the block tree (or the active tip).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainTip {
    pub hash: BlockHash,
    pub height: u32,
    /// Distance to the fork point with the active chain.
    pub branchlen: u32,
    pub status: TipStatus,
}

/// Changes to the active chain since the last call to [Chainstate::take_reorg].
#[derive(Clone, Debug, Default)]
pub struct Reorg {
    /// Blocks removed from the active chain, tip first.
    pub disconnected: Vec<Block>,
    /// Blocks added to the active chain, in connection order.
    pub connected: Vec<BlockHash>,
    /// Blocks parked automatically by chain selection.
    pub parked: Vec<BlockHash>,
}

impl Reorg {
    pub fn is_empty(&self) -> bool {
        self.disconnected.is_empty() && self.connected.is_empty() && self.parked.is_empty()
    }
}

/// Read access to the UTXO set of the active tip.
pub trait CoinView {
    /// Unspent output at `outpoint`, if any.
    fn coin(&self, outpoint: &OutPoint) -> Option<&Coin>;

    /// Height of the active tip.
    fn tip_height(&self) -> u32;

    /// Timestamp of the active tip.
    fn tip_time(&self) -> u64;
}

struct Entry {
    block: Block,
    chain_work: u128,
    sequence: u64,
    status: Status,
    children: Vec<BlockHash>,
    undo: Option<Vec<(OutPoint, Coin)>>,
}

/// Block tree, active chain and UTXO set.
pub struct Chainstate {
    entries: HashMap<BlockHash, Entry>,
    active: Vec<BlockHash>,
    utxos: HashMap<OutPoint, Coin>,
    tx_index: HashMap<TxId, BlockHash>,
    finalized: Option<BlockHash>,
    park_deep_reorg_depth: Option<u32>,
    next_sequence: u64,
    reorg: Reorg,
}

impl Chainstate {
    /// Create a chain from its genesis block (which is connected without validation).
    pub fn new(genesis: Block, park_deep_reorg_depth: Option<u32>) -> Self {
        let hash = genesis.hash();
        let mut utxos = HashMap::new();
        let mut tx_index = HashMap::new();
        for tx in &genesis.transactions {
            for (outpoint, output) in tx.outpoints() {
                utxos.insert(
                    outpoint,
                    Coin {
                        output: output.clone(),
                        height: genesis.height(),
                        is_coinbase: tx.is_coinbase(),
                    },
                );
            }
            tx_index.insert(tx.id(), hash);
        }
        let work = genesis.header.work as u128;
        let mut entries = HashMap::new();
        entries.insert(
            hash,
            Entry {
                block: genesis,
                chain_work: work,
                sequence: 0,
                status: Status::default(),
                children: Vec::new(),
                undo: Some(Vec::new()),
            },
        );
        Self {
            entries,
            active: vec![hash],
            utxos,
            tx_index,
            finalized: None,
            park_deep_reorg_depth,
            next_sequence: 1,
            reorg: Reorg::default(),
        }
    }

    pub fn genesis(&self) -> BlockHash {
        self.active[0]
    }

    /// Hash of the active tip.
    pub fn tip(&self) -> BlockHash {
        self.active[self.active.len() - 1]
    }

    /// Height of the active tip.
    pub fn height(&self) -> u32 {
        (self.active.len() - 1) as u32
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn block(&self, hash: &BlockHash) -> Option<&Block> {
        self.entries.get(hash).map(|entry| &entry.block)
    }

    pub fn status(&self, hash: &BlockHash) -> Option<Status> {
        self.entries.get(hash).map(|entry| entry.status)
    }

    pub fn chain_work(&self, hash: &BlockHash) -> Option<u128> {
        self.entries.get(hash).map(|entry| entry.chain_work)
    }

    /// Block of the active chain at `height`.
    pub fn at_height(&self, height: u32) -> Option<BlockHash> {
        self.active.get(height as usize).copied()
    }

    pub fn is_active(&self, hash: &BlockHash) -> bool {
        self.entries
            .get(hash)
            .is_some_and(|entry| self.at_height(entry.block.height()) == Some(*hash))
    }

    /// Active block containing `txid`.
    pub fn block_containing(&self, txid: &TxId) -> Option<BlockHash> {
        self.tx_index.get(txid).copied()
    }

    /// Iterate over the UTXO set of the active tip.
    pub fn coins(&self) -> impl Iterator<Item = (&OutPoint, &Coin)> {
        self.utxos.iter()
    }

    /// The block finalized by avalanche, if any.
    pub fn finalized(&self) -> Option<BlockHash> {
        self.finalized
    }

    /// Whether `hash` is the finalized block or one of its ancestors.
    pub fn is_finalized(&self, hash: &BlockHash) -> bool {
        let Some(finalized) = self.finalized.and_then(|f| self.entries.get(&f)) else {
            return false;
        };
        match self.entries.get(hash) {
            Some(entry) => {
                self.is_active(hash) && entry.block.height() <= finalized.block.height()
            }
            None => false,
        }
    }

    /// Drain the changes made to the active chain.
    pub fn take_reorg(&mut self) -> Reorg {
        std::mem::take(&mut self.reorg)
    }

    /// Accept a block into the tree and activate the best chain.
    pub fn submit_block(&mut self, block: Block) -> Result<BlockHash, Error> {
        let hash = self.accept_block(block)?;
        self.activate_best_chain();
        Ok(hash)
    }

    /// Add a block to the tree without changing the active chain.
    pub fn accept_block(&mut self, block: Block) -> Result<BlockHash, Error> {
        let hash = block.hash();
        if self.entries.contains_key(&hash) {
            return Err(Error::Duplicate(hash));
        }
        let parent = self
            .entries
            .get_mut(&block.parent())
            .ok_or(Error::UnknownParent(block.parent()))?;
        let expected = parent.block.height() + 1;
        if block.height() != expected {
            return Err(Error::BadHeight {
                expected,
                got: block.height(),
            });
        }
        let status = Status {
            failed_parent: parent.status.is_invalid(),
            parked_parent: parent.status.is_parked(),
            ..Status::default()
        };
        let chain_work = parent.chain_work + block.header.work as u128;
        parent.children.push(hash);
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        debug!(%hash, height = expected, "accepted block");
        self.entries.insert(
            hash,
            Entry {
                block,
                chain_work,
                sequence,
                status,
                children: Vec::new(),
                undo: None,
            },
        );
        Ok(hash)
    }

    /// Switch the active chain to the most-work usable block.
    pub fn activate_best_chain(&mut self) {
        while let Some(candidate) = self.best_candidate() {
            let fork = self.find_fork(&candidate);
            let path = self.path(&fork, &candidate);
            let Some(&first) = path.first() else {
                return;
            };
            let fork_height = self.entries[&fork].block.height();

            // Never reorg below the finalized block.
            if let Some(finalized) = self.finalized.and_then(|f| self.entries.get(&f)) {
                if fork_height < finalized.block.height() {
                    info!(block = %first, fork_height, "parking block forking below finalized block");
                    self.park_automatically(first);
                    continue;
                }
            }

            let depth = self.height() - fork_height;
            if let Some(threshold) = self.park_deep_reorg_depth {
                let unparked = path.iter().any(|hash| self.entries[hash].status.unparked);
                if depth > 0 && depth >= threshold && !unparked {
                    info!(block = %first, depth, "parking deep reorg");
                    self.park_automatically(first);
                    continue;
                }
            }

            while self.tip() != fork {
                self.disconnect_tip();
            }
            for hash in path {
                if let Err(err) = self.connect(hash) {
                    warn!(%hash, ?err, "block failed to connect");
                    self.mark_invalid(hash);
                    break;
                }
            }
        }
    }

    /// Mark a block (and its descendants) invalid.
    pub fn invalidate_block(&mut self, hash: &BlockHash) -> Result<(), Error> {
        self.check_mutable(hash)?;
        self.revoke_finality(hash);
        self.mark_invalid(*hash);
        self.rewind_before(hash);
        self.activate_best_chain();
        info!(%hash, "invalidated block");
        Ok(())
    }

    /// Clear the invalid flag from a block, its descendants and its ancestors.
    pub fn reconsider_block(&mut self, hash: &BlockHash) -> Result<(), Error> {
        if !self.entries.contains_key(hash) {
            return Err(Error::UnknownBlock(*hash));
        }
        for hash in self.lineage(hash) {
            if let Some(entry) = self.entries.get_mut(&hash) {
                entry.status.failed = false;
                entry.status.failed_parent = false;
            }
        }
        self.activate_best_chain();
        info!(%hash, "reconsidered block");
        Ok(())
    }

    /// Park a block (and its descendants).
    pub fn park_block(&mut self, hash: &BlockHash) -> Result<(), Error> {
        self.check_mutable(hash)?;
        self.revoke_finality(hash);
        self.mark_parked(*hash);
        self.rewind_before(hash);
        self.activate_best_chain();
        info!(%hash, "parked block");
        Ok(())
    }

    /// Clear the parked flag from a block, its descendants and its ancestors.
    ///
    /// An unparked block is exempt from deep reorg parking until it is parked again.
    pub fn unpark_block(&mut self, hash: &BlockHash) -> Result<(), Error> {
        if !self.entries.contains_key(hash) {
            return Err(Error::UnknownBlock(*hash));
        }
        for hash in self.lineage(hash) {
            if let Some(entry) = self.entries.get_mut(&hash) {
                entry.status.parked = false;
                entry.status.parked_parent = false;
            }
        }
        if let Some(entry) = self.entries.get_mut(hash) {
            entry.status.unparked = true;
        }
        self.activate_best_chain();
        info!(%hash, "unparked block");
        Ok(())
    }

    /// Finalize a block of the active chain.
    pub fn finalize_block(&mut self, hash: &BlockHash) -> Result<(), Error> {
        let entry = self.entries.get(hash).ok_or(Error::UnknownBlock(*hash))?;
        if entry.status.is_invalid() || !self.is_active(hash) {
            return Err(Error::FinalizeInvalid);
        }
        if self.is_finalized(hash) {
            return Ok(());
        }
        self.finalized = Some(*hash);
        info!(%hash, height = entry.block.height(), "finalized block");
        Ok(())
    }

    /// Report every leaf of the block tree plus the active tip.
    pub fn chain_tips(&self) -> Vec<ChainTip> {
        let tip = self.tip();
        let mut tips: Vec<ChainTip> = self
            .entries
            .iter()
            .filter(|(hash, entry)| entry.children.is_empty() || **hash == tip)
            .map(|(hash, entry)| {
                let fork = self.find_fork(hash);
                let height = entry.block.height();
                let status = if *hash == tip {
                    TipStatus::Active
                } else if entry.status.is_invalid() {
                    TipStatus::Invalid
                } else if entry.status.is_parked() {
                    TipStatus::Parked
                } else {
                    TipStatus::ValidFork
                };
                ChainTip {
                    hash: *hash,
                    height,
                    branchlen: height - self.entries[&fork].block.height(),
                    status,
                }
            })
            .collect();
        tips.sort_by_key(|tip| (Reverse(tip.height), tip.hash));
        tips
    }

    fn check_mutable(&self, hash: &BlockHash) -> Result<(), Error> {
        if !self.entries.contains_key(hash) {
            return Err(Error::UnknownBlock(*hash));
        }
        if *hash == self.genesis() {
            return Err(Error::Genesis);
        }
        Ok(())
    }

    fn best_candidate(&self) -> Option<BlockHash> {
        let tip = self.tip();
        let key = |entry: &Entry| (entry.chain_work, Reverse(entry.sequence));
        let mut best = (key(&self.entries[&tip]), tip);
        for (hash, entry) in &self.entries {
            let candidate = (key(entry), *hash);
            if candidate.0 > best.0 && self.is_usable(hash) {
                best = candidate;
            }
        }
        (best.1 != tip).then_some(best.1)
    }

    fn is_usable(&self, hash: &BlockHash) -> bool {
        let mut current = *hash;
        while !self.is_active(&current) {
            let Some(entry) = self.entries.get(&current) else {
                return false;
            };
            if entry.status.is_invalid() || entry.status.is_parked() {
                return false;
            }
            current = entry.block.parent();
        }
        true
    }

    /// Last block of the active chain that is an ancestor of (or equal to) `hash`.
    fn find_fork(&self, hash: &BlockHash) -> BlockHash {
        let mut current = *hash;
        while !self.is_active(&current) {
            match self.entries.get(&current) {
                Some(entry) => current = entry.block.parent(),
                None => return self.genesis(),
            }
        }
        current
    }

    /// Blocks after `fork` up to and including `to`, in ascending height.
    fn path(&self, fork: &BlockHash, to: &BlockHash) -> Vec<BlockHash> {
        let mut path = Vec::new();
        let mut current = *to;
        while current != *fork {
            path.push(current);
            match self.entries.get(&current) {
                Some(entry) => current = entry.block.parent(),
                None => break,
            }
        }
        path.reverse();
        path
    }

    fn descendants(&self, hash: &BlockHash) -> Vec<BlockHash> {
        let mut result = Vec::new();
        let mut queue: VecDeque<BlockHash> = self
            .entries
            .get(hash)
            .map(|entry| entry.children.iter().copied().collect())
            .unwrap_or_default();
        while let Some(next) = queue.pop_front() {
            if let Some(entry) = self.entries.get(&next) {
                queue.extend(entry.children.iter().copied());
            }
            result.push(next);
        }
        result
    }

    /// The block, its descendants and its ancestors.
    fn lineage(&self, hash: &BlockHash) -> Vec<BlockHash> {
        let mut result = self.descendants(hash);
        let mut current = Some(*hash);
        while let Some(hash) = current {
            result.push(hash);
            current = self
                .entries
                .get(&hash)
                .filter(|_| hash != self.genesis())
                .map(|entry| entry.block.parent());
        }
        result
    }

    fn mark_invalid(&mut self, hash: BlockHash) {
        for descendant in self.descendants(&hash) {
            if let Some(entry) = self.entries.get_mut(&descendant) {
                entry.status.failed_parent = true;
            }
        }
        if let Some(entry) = self.entries.get_mut(&hash) {
            entry.status.failed = true;
        }
    }

    fn mark_parked(&mut self, hash: BlockHash) {
        for descendant in self.descendants(&hash) {
            if let Some(entry) = self.entries.get_mut(&descendant) {
                entry.status.parked_parent = true;
            }
        }
        if let Some(entry) = self.entries.get_mut(&hash) {
            entry.status.parked = true;
            entry.status.unparked = false;
        }
    }

    fn park_automatically(&mut self, hash: BlockHash) {
        self.mark_parked(hash);
        self.reorg.parked.push(hash);
    }

    /// Move the finalization point below `hash` if `hash` is finalized.
    fn revoke_finality(&mut self, hash: &BlockHash) {
        if !self.is_finalized(hash) {
            return;
        }
        let parent = self.entries.get(hash).map(|entry| entry.block.parent());
        info!(%hash, "finalization revoked");
        self.finalized = parent;
    }

    /// Disconnect blocks until `hash` is no longer on the active chain.
    fn rewind_before(&mut self, hash: &BlockHash) {
        while self.is_active(hash) && self.tip() != self.genesis() {
            self.disconnect_tip();
        }
    }

    fn disconnect_tip(&mut self) {
        if self.active.len() <= 1 {
            return;
        }
        let Some(hash) = self.active.pop() else {
            return;
        };
        let Some(entry) = self.entries.get_mut(&hash) else {
            return;
        };
        let undo = entry.undo.take().unwrap_or_default();
        for tx in entry.block.transactions.iter().rev() {
            for (outpoint, _) in tx.outpoints() {
                self.utxos.remove(&outpoint);
            }
            self.tx_index.remove(&tx.id());
        }
        for (outpoint, coin) in undo {
            self.utxos.insert(outpoint, coin);
        }
        debug!(%hash, "disconnected block");
        self.reorg.disconnected.push(entry.block.clone());
    }

    fn check_block(&self, block: &Block) -> Result<(), ConnectError> {
        let mut spent = HashSet::new();
        let mut created: HashMap<OutPoint, Amount> = HashMap::new();
        let mut fees: Amount = 0;
        for (i, tx) in block.transactions.iter().enumerate() {
            match (i, tx.is_coinbase()) {
                (0, false) => return Err(ConnectError::NoCoinbase),
                (0, true) => {}
                (_, true) => return Err(ConnectError::ExtraCoinbase),
                (_, false) => {
                    let mut input_value: Amount = 0;
                    for input in &tx.inputs {
                        if !spent.insert(*input) {
                            return Err(ConnectError::MissingInput(*input));
                        }
                        let amount = match created.get(input) {
                            Some(amount) => *amount,
                            None => {
                                self.utxos
                                    .get(input)
                                    .ok_or(ConnectError::MissingInput(*input))?
                                    .output
                                    .amount
                            }
                        };
                        input_value = input_value.saturating_add(amount);
                    }
                    let output_value = tx.output_value();
                    if output_value > input_value {
                        return Err(ConnectError::Overspend(tx.id()));
                    }
                    fees = fees.saturating_add(input_value - output_value);
                }
            }
            for (outpoint, output) in tx.outpoints() {
                created.insert(outpoint, output.amount);
            }
        }
        let coinbase = block
            .transactions
            .first()
            .ok_or(ConnectError::NoCoinbase)?;
        if coinbase.output_value() > BLOCK_SUBSIDY.saturating_add(fees) {
            return Err(ConnectError::CoinbaseOverpay);
        }
        Ok(())
    }

    fn connect(&mut self, hash: BlockHash) -> Result<(), ConnectError> {
        let Some(entry) = self.entries.get(&hash) else {
            return Ok(());
        };
        self.check_block(&entry.block)?;
        let height = entry.block.height();
        let mut undo = Vec::new();
        let mut created_here = HashSet::new();
        for tx in &entry.block.transactions {
            for input in &tx.inputs {
                if let Some(coin) = self.utxos.remove(input) {
                    if !created_here.contains(&input.txid) {
                        undo.push((*input, coin));
                    }
                }
            }
            let txid = tx.id();
            for (outpoint, output) in tx.outpoints() {
                self.utxos.insert(
                    outpoint,
                    Coin {
                        output: output.clone(),
                        height,
                        is_coinbase: tx.is_coinbase(),
                    },
                );
            }
            created_here.insert(txid);
            self.tx_index.insert(txid, hash);
        }
        if let Some(entry) = self.entries.get_mut(&hash) {
            entry.undo = Some(undo);
        }
        self.active.push(hash);
        self.reorg.connected.push(hash);
        debug!(%hash, height, "connected block");
        Ok(())
    }
}

impl CoinView for Chainstate {
    fn coin(&self, outpoint: &OutPoint) -> Option<&Coin> {
        self.utxos.get(outpoint)
    }

    fn tip_height(&self) -> u32 {
        self.height()
    }

    fn tip_time(&self) -> u64 {
        self.entries
            .get(&self.tip())
            .map_or(0, |entry| entry.block.header.timestamp)
    }
}

impl ItemKind for Chainstate {
    type Id = BlockHash;
    type Vote = BlockVote;

    fn local_vote(&self, hash: &BlockHash) -> BlockVote {
        let Some(entry) = self.entries.get(hash) else {
            return BlockVote::Unknown;
        };
        if entry.status.is_invalid() {
            BlockVote::Invalid
        } else if entry.status.is_parked() {
            BlockVote::Parked
        } else if self.is_active(hash) {
            BlockVote::Accepted
        } else {
            BlockVote::Fork
        }
    }

    fn is_worth_polling(&self, hash: &BlockHash) -> bool {
        self.entries
            .get(hash)
            .is_some_and(|entry| !entry.status.is_invalid())
            && !self.is_finalized(hash)
    }

    fn on_accepted(&mut self, hash: &BlockHash) {
        if self.status(hash).is_some_and(|status| status.is_parked()) {
            if let Err(err) = self.unpark_block(hash) {
                debug!(%hash, ?err, "unable to unpark accepted block");
            }
        }
    }

    fn on_rejected(&mut self, hash: &BlockHash) {
        if self.status(hash).is_some_and(|status| !status.parked) {
            if let Err(err) = self.park_block(hash) {
                debug!(%hash, ?err, "unable to park rejected block");
            }
        }
    }

    fn on_finalized(&mut self, hash: &BlockHash) {
        if let Err(err) = self.finalize_block(hash) {
            warn!(%hash, ?err, "unable to finalize block");
        }
    }

    fn on_invalidated(&mut self, hash: &BlockHash) {
        if let Err(err) = self.park_block(hash) {
            debug!(%hash, ?err, "unable to park invalidated block");
        }
    }

    fn on_stale(&mut self, hash: &BlockHash) {
        // Fall back to proof of work.
        if self.status(hash).is_some_and(|status| status.is_parked()) {
            if let Err(err) = self.unpark_block(hash) {
                debug!(%hash, ?err, "unable to unpark stale block");
            }
        }
    }
}
