//! Poll bookkeeping.
//!
//! The [Processor] owns the vote records of every item under reconciliation and the polls in
//! flight. It does not know what the items are: the owner decides which items are worth
//! polling (through a predicate) and applies the returned [Update]s.
//!
//! Items are polled in a fixed priority order: blocks (most work first), then transactions,
//! then proofs (highest score first), then stake contenders (best reward rank first).

pub mod config;
pub mod metrics;

pub use config::{Config, ConfigError};

use crate::{
    types::{BlockHash, ContenderId, NodeId, ProofId, TxId},
    vote::{VoteClass, VoteKind},
    voting::{Thresholds, VoteRecord, VoteStatus},
    wire::{Inv, InvKind, Response},
};
use metrics::{Item, Metrics};
use prometheus_client::registry::Registry;
use std::{
    cmp::Reverse,
    collections::{BTreeMap, HashMap, HashSet},
    time::SystemTime,
};
use thiserror::Error;
use tracing::{debug, trace};

/// An item under reconciliation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VoteItem {
    Block(BlockHash),
    Tx(TxId),
    Proof(ProofId),
    Contender(ContenderId),
}

impl VoteItem {
    pub fn kind(&self) -> InvKind {
        match self {
            Self::Block(_) => InvKind::Block,
            Self::Tx(_) => InvKind::Tx,
            Self::Proof(_) => InvKind::Proof,
            Self::Contender(_) => InvKind::Contender,
        }
    }

    pub fn inv(&self) -> Inv {
        match self {
            Self::Block(hash) => Inv::block(*hash),
            Self::Tx(txid) => Inv::tx(*txid),
            Self::Proof(id) => Inv::proof(*id),
            Self::Contender(id) => Inv::contender(*id),
        }
    }

    pub fn from_inv(inv: &Inv) -> Self {
        match inv.kind {
            InvKind::Block => Self::Block(BlockHash(inv.hash)),
            InvKind::Tx => Self::Tx(TxId(inv.hash)),
            InvKind::Proof => Self::Proof(ProofId(inv.hash)),
            InvKind::Contender => Self::Contender(ContenderId(inv.hash)),
        }
    }
}

/// A change in the vote state of an item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Update {
    pub item: VoteItem,
    pub status: VoteStatus,
}

/// A protocol violation by a remote node.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("{reason} (score {score})")]
pub struct Misbehavior {
    pub score: u32,
    pub reason: &'static str,
}

impl Misbehavior {
    pub const UNEXPECTED_RESPONSE: Self = Self::new(2, "unexpected-ava-response");
    pub const RESPONSE_SIZE: Self = Self::new(100, "invalid-ava-response-size");
    pub const RESPONSE_CONTENT: Self = Self::new(100, "invalid-ava-response-content");
    pub const RESPONSE_SIGNATURE: Self = Self::new(100, "invalid-ava-response-signature");
    pub const POLL: Self = Self::new(20, "invalid-ava-poll");
    pub const HELLO_SIGNATURE: Self = Self::new(100, "invalid-avahello-signature");
    pub const DELEGATION: Self = Self::new(100, "invalid-delegation");
    pub const PROOF: Self = Self::new(100, "invalid-proof");
    pub const MALFORMED: Self = Self::new(100, "malformed-message");

    pub const fn new(score: u32, reason: &'static str) -> Self {
        Self { score, reason }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Key {
    rank: u8,
    priority: Reverse<u128>,
    item: VoteItem,
}

impl Key {
    fn new(item: VoteItem, priority: u128) -> Self {
        let rank = match item {
            VoteItem::Block(_) => 0,
            VoteItem::Tx(_) => 1,
            VoteItem::Proof(_) => 2,
            VoteItem::Contender(_) => 3,
        };
        Self {
            rank,
            priority: Reverse(priority),
            item,
        }
    }
}

struct Query {
    invs: Vec<Inv>,
    deadline: SystemTime,
}

/// Vote records and polls in flight.
pub struct Processor {
    thresholds: Thresholds,
    max_element_poll: usize,

    records: BTreeMap<Key, VoteRecord>,
    keys: HashMap<VoteItem, Key>,
    queries: HashMap<(NodeId, u64), Query>,
    round: u64,

    metrics: Metrics,
}

impl Processor {
    pub fn new(cfg: &Config, registry: &mut Registry) -> Self {
        Self {
            thresholds: cfg.thresholds(),
            max_element_poll: cfg.max_element_poll,
            records: BTreeMap::new(),
            keys: HashMap::new(),
            queries: HashMap::new(),
            round: 0,
            metrics: Metrics::new(registry),
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Start polling `item`. Returns false if it is already being polled.
    ///
    /// `priority` orders items of the same kind (higher first).
    pub fn add_to_reconcile(&mut self, item: VoteItem, priority: u128, accepted: bool) -> bool {
        if self.keys.contains_key(&item) {
            return false;
        }
        let key = Key::new(item, priority);
        self.keys.insert(item, key);
        self.records.insert(key, VoteRecord::new(accepted));
        self.metrics.records.set(self.records.len() as i64);
        debug!(?item, accepted, "added item to reconcile");
        true
    }

    /// Stop polling `item`.
    pub fn remove(&mut self, item: &VoteItem) -> bool {
        let Some(key) = self.keys.remove(item) else {
            return false;
        };
        self.records.remove(&key);
        self.metrics.records.set(self.records.len() as i64);
        true
    }

    pub fn contains(&self, item: &VoteItem) -> bool {
        self.keys.contains_key(item)
    }

    pub fn record(&self, item: &VoteItem) -> Option<&VoteRecord> {
        self.keys.get(item).and_then(|key| self.records.get(key))
    }

    pub fn is_accepted(&self, item: &VoteItem) -> Option<bool> {
        self.record(item).map(VoteRecord::is_accepted)
    }

    pub fn confidence(&self, item: &VoteItem) -> Option<u16> {
        self.record(item).map(VoteRecord::confidence)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Items under reconciliation, in poll order.
    pub fn items(&self) -> impl Iterator<Item = &VoteItem> {
        self.records.keys().map(|key| &key.item)
    }

    /// Number of polls awaiting a response.
    pub fn query_count(&self) -> usize {
        self.queries.len()
    }

    /// Items to include in the next poll.
    ///
    /// Records no longer worth polling are dropped first. When `register` is set every
    /// returned item counts one more poll in flight; items at their in-flight limit are
    /// skipped.
    pub fn invs_for_poll(
        &mut self,
        worth_polling: impl Fn(&VoteItem) -> bool,
        register: bool,
    ) -> Vec<Inv> {
        let stale: Vec<VoteItem> = self
            .keys
            .keys()
            .filter(|item| !worth_polling(item))
            .copied()
            .collect();
        for item in &stale {
            self.remove(item);
        }

        let mut invs = Vec::new();
        for (key, record) in self.records.iter_mut() {
            if invs.len() >= self.max_element_poll {
                break;
            }
            let poll = if register {
                record.register_poll(&self.thresholds)
            } else {
                record.inflight() < self.thresholds.max_inflight_poll
            };
            if poll {
                invs.push(key.item.inv());
            }
        }
        invs
    }

    /// Allocate the id of a new poll.
    pub fn next_round(&mut self) -> u64 {
        let round = self.round;
        self.round += 1;
        round
    }

    /// Current value of the round counter.
    pub fn round(&self) -> u64 {
        self.round
    }

    /// Remember a poll sent to `node` until `deadline`.
    pub fn register_query(&mut self, node: NodeId, round: u64, invs: Vec<Inv>, deadline: SystemTime) {
        self.metrics.polls.inc();
        self.queries.insert((node, round), Query { invs, deadline });
    }

    /// Drop polls whose deadline passed, releasing their in-flight slots.
    ///
    /// Returns the nodes that did not answer in time.
    pub fn clear_timed_out(&mut self, now: SystemTime) -> Vec<NodeId> {
        let expired: Vec<(NodeId, u64)> = self
            .queries
            .iter()
            .filter(|(_, query)| query.deadline < now)
            .map(|(id, _)| *id)
            .collect();
        let mut nodes = Vec::with_capacity(expired.len());
        for id in expired {
            let Some(query) = self.queries.remove(&id) else {
                continue;
            };
            self.metrics.timeouts.inc();
            for inv in &query.invs {
                let item = VoteItem::from_inv(inv);
                if let Some(record) = self
                    .keys
                    .get(&item)
                    .and_then(|key| self.records.get_mut(key))
                {
                    record.clear_inflight(1);
                }
            }
            debug!(node = id.0, round = id.1, "poll timed out");
            nodes.push(id.0);
        }
        nodes
    }

    /// Fold the votes of a response from `node`.
    ///
    /// The response must answer a poll still in flight, vote on the same items in the same
    /// order. Items no longer worth polling are skipped.
    pub fn register_votes(
        &mut self,
        node: NodeId,
        response: &Response,
        worth_polling: impl Fn(&VoteItem) -> bool,
    ) -> Result<Vec<Update>, Misbehavior> {
        let query = self
            .queries
            .remove(&(node, response.round))
            .ok_or(Misbehavior::UNEXPECTED_RESPONSE)?;
        if query.invs.len() != response.votes.len() {
            return Err(Misbehavior::RESPONSE_SIZE);
        }
        if query
            .invs
            .iter()
            .zip(&response.votes)
            .any(|(inv, vote)| inv.hash != vote.hash)
        {
            return Err(Misbehavior::RESPONSE_CONTENT);
        }
        self.metrics.responses.inc();

        let mut seen = HashSet::new();
        let mut updates = Vec::new();
        for (inv, vote) in query.invs.iter().zip(&response.votes) {
            let item = VoteItem::from_inv(inv);
            if !seen.insert(item) || !worth_polling(&item) {
                continue;
            }
            let Some(key) = self.keys.get(&item).copied() else {
                continue;
            };
            let Some(record) = self.records.get_mut(&key) else {
                continue;
            };
            // Codes this kind does not define carry no opinion.
            let class = VoteKind::from_code(inv.kind, vote.code)
                .map_or(VoteClass::Neutral, VoteKind::class);
            self.metrics.votes.get_or_create(&Item::new(inv.kind)).inc();
            trace!(node, ?item, code = vote.code, "vote");

            if !record.register_vote(node, class, &self.thresholds) {
                if record.is_stale(&self.thresholds) {
                    debug!(?item, votes = record.successful_votes(), "vote record is stale");
                    updates.push(Update {
                        item,
                        status: VoteStatus::Stale,
                    });
                    self.remove(&item);
                }
                continue;
            }

            let accepted = record.is_accepted();
            if !record.has_finalized(&self.thresholds) {
                updates.push(Update {
                    item,
                    status: if accepted {
                        VoteStatus::Accepted
                    } else {
                        VoteStatus::Rejected
                    },
                });
                continue;
            }

            let (status, counter) = if accepted {
                (VoteStatus::Finalized, &self.metrics.finalized)
            } else {
                (VoteStatus::Invalid, &self.metrics.invalidated)
            };
            counter.get_or_create(&Item::new(inv.kind)).inc();
            debug!(?item, status = status.as_str(), "vote record concluded");
            updates.push(Update { item, status });
            self.remove(&item);
        }
        Ok(updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Vote;
    use avalanche_cryptography::hash;
    use std::time::{Duration, UNIX_EPOCH};

    fn processor() -> Processor {
        Processor::new(&Config::default(), &mut Registry::default())
    }

    fn block(seed: &[u8]) -> VoteItem {
        VoteItem::Block(BlockHash(hash(seed)))
    }

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn always(_: &VoteItem) -> bool {
        true
    }

    /// Poll `node` and answer with `code` for every item.
    fn poll_and_answer(
        processor: &mut Processor,
        node: NodeId,
        code: i32,
    ) -> Result<Vec<Update>, Misbehavior> {
        let invs = processor.invs_for_poll(always, true);
        let round = processor.next_round();
        processor.register_query(node, round, invs.clone(), at(100));
        let response = Response {
            round,
            cooldown: 0,
            votes: invs
                .iter()
                .map(|inv| Vote {
                    code,
                    hash: inv.hash,
                })
                .collect(),
        };
        processor.register_votes(node, &response, always)
    }

    #[test]
    fn test_poll_order_and_limit() {
        let mut processor = processor();
        let proof = VoteItem::Proof(ProofId(hash(b"proof")));
        let contender = VoteItem::Contender(ContenderId(hash(b"contender")));
        let tx = VoteItem::Tx(TxId(hash(b"tx")));
        let light = block(b"light");
        let heavy = block(b"heavy");
        assert!(processor.add_to_reconcile(contender, u128::MAX, true));
        assert!(processor.add_to_reconcile(proof, 10, true));
        assert!(processor.add_to_reconcile(tx, 0, true));
        assert!(processor.add_to_reconcile(light, 1, true));
        assert!(processor.add_to_reconcile(heavy, 2, true));
        assert!(!processor.add_to_reconcile(heavy, 2, false));

        let invs = processor.invs_for_poll(always, false);
        let order: Vec<VoteItem> = invs.iter().map(VoteItem::from_inv).collect();
        assert_eq!(order, vec![heavy, light, tx, proof, contender]);

        for i in 0..20u8 {
            processor.add_to_reconcile(block(&[i]), 0, true);
        }
        assert_eq!(processor.invs_for_poll(always, false).len(), 16);
    }

    #[test]
    fn test_items_not_worth_polling_dropped() {
        let mut processor = processor();
        let a = block(b"a");
        let b = block(b"b");
        processor.add_to_reconcile(a, 0, true);
        processor.add_to_reconcile(b, 0, true);
        let invs = processor.invs_for_poll(|item| *item != a, false);
        assert_eq!(invs, vec![b.inv()]);
        assert!(!processor.contains(&a));
    }

    #[test]
    fn test_finalize_after_enough_rounds() {
        let mut processor = processor();
        let item = block(b"tip");
        processor.add_to_reconcile(item, 0, true);

        let mut updates = Vec::new();
        for node in 0..200 {
            updates.extend(poll_and_answer(&mut processor, node, 0).unwrap());
            if !processor.contains(&item) {
                break;
            }
        }
        assert_eq!(
            updates,
            vec![Update {
                item,
                status: VoteStatus::Finalized
            }]
        );

        // Finalized items are never polled again.
        assert!(processor.invs_for_poll(always, true).is_empty());
    }

    #[test]
    fn test_reject_then_invalidate() {
        let mut processor = processor();
        let item = block(b"bad");
        processor.add_to_reconcile(item, 0, true);

        let mut statuses = Vec::new();
        for node in 0..200 {
            for update in poll_and_answer(&mut processor, node, 1).unwrap() {
                statuses.push(update.status);
            }
        }
        assert_eq!(statuses, vec![VoteStatus::Rejected, VoteStatus::Invalid]);
    }

    #[test]
    fn test_response_validation() {
        let mut processor = processor();
        let item = block(b"item");
        processor.add_to_reconcile(item, 0, true);
        let invs = processor.invs_for_poll(always, true);
        let round = processor.next_round();
        processor.register_query(1, round, invs.clone(), at(100));

        let vote = Vote {
            code: 0,
            hash: invs[0].hash,
        };
        let response = |round, votes| Response {
            round,
            cooldown: 0,
            votes,
        };

        // Wrong node or round.
        assert_eq!(
            processor.register_votes(2, &response(round, vec![vote]), always),
            Err(Misbehavior::UNEXPECTED_RESPONSE)
        );
        assert_eq!(
            processor.register_votes(1, &response(round + 1, vec![vote]), always),
            Err(Misbehavior::UNEXPECTED_RESPONSE)
        );

        // A bad answer consumes the query.
        assert_eq!(
            processor.register_votes(1, &response(round, vec![vote, vote]), always),
            Err(Misbehavior::RESPONSE_SIZE)
        );
        assert_eq!(
            processor.register_votes(1, &response(round, vec![vote]), always),
            Err(Misbehavior::UNEXPECTED_RESPONSE)
        );

        let round = processor.next_round();
        processor.register_query(1, round, invs, at(100));
        let wrong = Vote {
            code: 0,
            hash: hash(b"other"),
        };
        assert_eq!(
            processor.register_votes(1, &response(round, vec![wrong]), always),
            Err(Misbehavior::RESPONSE_CONTENT)
        );
    }

    #[test]
    fn test_timeouts_release_inflight() {
        let mut processor = processor();
        let item = block(b"item");
        processor.add_to_reconcile(item, 0, true);
        for node in 0..10 {
            let invs = processor.invs_for_poll(always, true);
            assert_eq!(invs.len(), 1);
            let round = processor.next_round();
            processor.register_query(node, round, invs, at(10));
        }
        // Ten polls in flight: the item is not polled again.
        assert!(processor.invs_for_poll(always, true).is_empty());

        assert!(processor.clear_timed_out(at(10)).is_empty());
        let mut timed_out = processor.clear_timed_out(at(11));
        timed_out.sort_unstable();
        assert_eq!(timed_out, (0..10).collect::<Vec<_>>());
        assert_eq!(processor.query_count(), 0);
        assert_eq!(processor.invs_for_poll(always, true).len(), 1);
    }

    #[test]
    fn test_rounds_strictly_increase() {
        let mut processor = processor();
        let rounds: Vec<u64> = (0..5).map(|_| processor.next_round()).collect();
        assert!(rounds.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(processor.round(), 5);
    }
}
