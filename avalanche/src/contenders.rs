//! Stake contenders.
//!
//! Once the chain has a finalized block, every bound proof contends for the staking reward of
//! the block built on the active tip. A contender is identified by `H(prev_block, proof_id)`
//! ([ContenderId::new]) and ranked by [reward_rank], lower being better. Each node computes its
//! own winner from its peers ([crate::peers::PeerManager::select_staking_reward_winner]) and
//! then polls the best ranked contenders so the network converges on the same winner set.
//!
//! [Contenders] keeps the contenders of recent blocks, the winners set manually for a block,
//! and the staking rewards computed locally. Answers to polls follow these rules:
//! - unknown contenders are [ContenderVote::Unknown];
//! - contenders of a block without a computed reward are [ContenderVote::Pending];
//! - a contender paying a manual winner is [ContenderVote::Accepted];
//! - otherwise the contender is accepted only if it was accepted locally or by the network.

use crate::{
    proof::Proof,
    types::{BlockHash, ContenderId, ProofId},
    vote::{ContenderVote, ItemKind},
};
use avalanche_cryptography::Hasher;
use bytes::Bytes;
use std::{cmp::Ordering, collections::HashMap, sync::Arc};
use tracing::{debug, info};

/// Maximum number of contenders polled for one block.
pub const MAX_POLLABLE_CONTENDERS: usize = 12;

impl ContenderId {
    pub fn new(prev: &BlockHash, proof: &ProofId) -> Self {
        let mut hasher = Hasher::new();
        hasher.write(prev);
        hasher.write(proof);
        Self(hasher.finalize())
    }
}

/// Rank of a contender staking `score`. A zero id or score ranks last.
pub fn reward_rank(id: &ContenderId, score: u32) -> f64 {
    // Little-endian 256-bit integer.
    let value = id
        .0
        .as_ref()
        .iter()
        .rev()
        .fold(0.0_f64, |acc, byte| acc * 256.0 + f64::from(*byte));
    if value == 0.0 || score == 0 {
        return f64::MAX;
    }
    (256.0 - value.log2()) / f64::from(score)
}

/// Poll priority of a rank: better ranks are polled first.
///
/// The bit pattern of a non-negative float orders like its value.
pub fn rank_priority(rank: f64) -> u128 {
    u128::MAX - u128::from(rank.max(0.0).to_bits())
}

/// Local state of a contender.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContenderStatus {
    pub accepted: bool,
    pub in_winner_set: bool,
}

#[derive(Clone, Debug)]
pub struct Contender {
    pub id: ContenderId,
    pub prev: BlockHash,
    pub height: u32,
    pub proof: ProofId,
    pub payout: Bytes,
    pub score: u32,
    pub status: ContenderStatus,
}

impl Contender {
    pub fn rank(&self) -> f64 {
        reward_rank(&self.id, self.score)
    }
}

/// A proof entitled to the staking reward, or a manual winner (zero proof id).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Winner {
    pub proof: ProofId,
    pub payout: Bytes,
}

/// Staking reward winners of the block built on top of a given block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reward {
    /// Height of the previous block.
    pub height: u32,
    pub winners: Vec<Winner>,
}

struct ManualWinners {
    height: u32,
    payouts: Vec<Bytes>,
}

/// Contenders, manual winners and staking rewards, indexed by previous block.
#[derive(Default)]
pub struct Contenders {
    contenders: HashMap<ContenderId, Contender>,
    manual: HashMap<BlockHash, ManualWinners>,
    rewards: HashMap<BlockHash, Reward>,
    promoted_height: Option<u32>,
}

fn by_rank(a: &Contender, b: &Contender) -> Ordering {
    a.rank()
        .total_cmp(&b.rank())
        .then_with(|| a.id.cmp(&b.id))
}

impl Contenders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.contenders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contenders.is_empty()
    }

    pub fn get(&self, id: &ContenderId) -> Option<&Contender> {
        self.contenders.get(id)
    }

    /// Height of the last block contenders were promoted to.
    pub fn promoted_height(&self) -> Option<u32> {
        self.promoted_height
    }

    /// Add the contender of `proof` for the block after `prev`. Returns false if it exists.
    pub fn add(
        &mut self,
        prev: BlockHash,
        height: u32,
        proof: &Proof,
        status: ContenderStatus,
    ) -> bool {
        let proof_id = proof.id();
        let id = ContenderId::new(&prev, &proof_id);
        if self.contenders.contains_key(&id) {
            return false;
        }
        self.contenders.insert(
            id,
            Contender {
                id,
                prev,
                height,
                proof: proof_id,
                payout: proof.payout_script().clone(),
                score: proof.score(),
                status,
            },
        );
        true
    }

    /// Add a contender for every `proof` on top of `tip`.
    pub fn promote<'a>(
        &mut self,
        tip: BlockHash,
        height: u32,
        proofs: impl IntoIterator<Item = &'a Arc<Proof>>,
    ) -> usize {
        let added = proofs
            .into_iter()
            .filter(|proof| self.add(tip, height, proof, ContenderStatus::default()))
            .count();
        self.promoted_height = Some(height);
        debug!(%tip, height, added, "promoted stake contenders");
        added
    }

    pub fn accept(&mut self, id: &ContenderId) -> bool {
        self.update(id, |status| status.accepted = true)
    }

    pub fn reject(&mut self, id: &ContenderId) -> bool {
        self.update(id, |status| status.accepted = false)
    }

    pub fn finalize(&mut self, id: &ContenderId) -> bool {
        self.update(id, |status| {
            status.accepted = true;
            status.in_winner_set = true;
        })
    }

    pub fn invalidate(&mut self, id: &ContenderId) -> bool {
        self.update(id, |status| *status = ContenderStatus::default())
    }

    fn update(&mut self, id: &ContenderId, f: impl FnOnce(&mut ContenderStatus)) -> bool {
        match self.contenders.get_mut(id) {
            Some(contender) => {
                f(&mut contender.status);
                true
            }
            None => false,
        }
    }

    /// Cache status of a contender, ignoring whether a reward was computed for its block.
    fn cached_vote(&self, contender: &Contender) -> ContenderVote {
        let manual = self
            .manual
            .get(&contender.prev)
            .is_some_and(|manual| manual.payouts.contains(&contender.payout));
        if manual || contender.status.accepted {
            ContenderVote::Accepted
        } else {
            ContenderVote::Invalid
        }
    }

    /// Our answer to a poll about `id`.
    pub fn vote(&self, id: &ContenderId) -> ContenderVote {
        let Some(contender) = self.contenders.get(id) else {
            return ContenderVote::Unknown;
        };
        if !self
            .rewards
            .get(&contender.prev)
            .is_some_and(|reward| !reward.winners.is_empty())
        {
            return ContenderVote::Pending;
        }
        self.cached_vote(contender)
    }

    /// Set the winners of the block after `prev` by payout. Replaces the computed reward.
    pub fn set_winners(&mut self, prev: BlockHash, height: u32, payouts: Vec<Bytes>) -> bool {
        if payouts.is_empty() {
            return false;
        }
        let winners = payouts
            .iter()
            .map(|payout| Winner {
                proof: ProofId::default(),
                payout: payout.clone(),
            })
            .collect();
        self.manual.insert(prev, ManualWinners { height, payouts });
        self.rewards.insert(prev, Reward { height, winners });
        true
    }

    /// Winners of the block after `prev`: manual winners first, then finalized contenders by
    /// rank.
    pub fn winners(&self, prev: &BlockHash) -> Option<Vec<Winner>> {
        let mut winners: Vec<Winner> = self
            .manual
            .get(prev)
            .map(|manual| {
                manual
                    .payouts
                    .iter()
                    .map(|payout| Winner {
                        proof: ProofId::default(),
                        payout: payout.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let mut finalized: Vec<&Contender> = self
            .contenders
            .values()
            .filter(|contender| contender.prev == *prev && contender.status.in_winner_set)
            .collect();
        finalized.sort_by(|a, b| by_rank(a, b));
        winners.extend(finalized.into_iter().map(|contender| Winner {
            proof: contender.proof,
            payout: contender.payout.clone(),
        }));
        (!winners.is_empty()).then_some(winners)
    }

    pub fn reward(&self, prev: &BlockHash) -> Option<&Reward> {
        self.rewards.get(prev)
    }

    /// Forget the reward of the block after `prev`. Manual winners still vote.
    pub fn erase_reward(&mut self, prev: &BlockHash) -> bool {
        self.rewards.remove(prev).is_some()
    }

    /// Record the locally computed `winner` of the block after `prev`. Returns false if a
    /// reward is already known.
    pub fn set_reward(&mut self, prev: BlockHash, height: u32, winner: Winner) -> bool {
        if self.rewards.contains_key(&prev) {
            return false;
        }
        info!(%prev, height, proof = %winner.proof, "computed staking reward winner");
        self.rewards.insert(
            prev,
            Reward {
                height,
                winners: vec![winner],
            },
        );
        true
    }

    /// Mark the local winners of the block after `prev` accepted and return the contenders
    /// worth polling: the best ranked ones, always including the local winners.
    pub fn local_winners(&mut self, prev: &BlockHash) -> Vec<ContenderId> {
        let Some(reward) = self.rewards.get(prev) else {
            return Vec::new();
        };
        let local: Vec<ProofId> = reward.winners.iter().map(|winner| winner.proof).collect();

        let mut candidates: Vec<&mut Contender> = self
            .contenders
            .values_mut()
            .filter(|contender| contender.prev == *prev)
            .collect();
        if candidates.is_empty() {
            return Vec::new();
        }
        candidates.sort_by(|a, b| by_rank(a, b));

        let mut pollable = Vec::new();
        for contender in candidates {
            if local.contains(&contender.proof) {
                contender.status = ContenderStatus {
                    accepted: true,
                    in_winner_set: true,
                };
                pollable.push(contender.id);
            } else if pollable.len() < MAX_POLLABLE_CONTENDERS {
                pollable.push(contender.id);
            }
        }
        // Local winners beyond the limit displace the worst ranked others.
        while pollable.len() > MAX_POLLABLE_CONTENDERS {
            let Some(position) = pollable.iter().rposition(|id| {
                self.contenders
                    .get(id)
                    .is_some_and(|contender| !local.contains(&contender.proof))
            }) else {
                break;
            };
            pollable.remove(position);
        }
        pollable
    }

    /// Drop rewards, manual winners and contenders below `min_height`, keeping anything at or
    /// above the last promoted height.
    pub fn cleanup(&mut self, min_height: u32) {
        let floor = self
            .promoted_height
            .map_or(min_height, |promoted| promoted.min(min_height));
        let before = self.contenders.len();
        self.contenders.retain(|_, contender| contender.height >= floor);
        self.manual.retain(|_, manual| manual.height >= floor);
        self.rewards.retain(|_, reward| reward.height >= min_height);
        debug!(
            min_height,
            removed = before - self.contenders.len(),
            "cleaned up stake contenders"
        );
    }
}

impl ItemKind for Contenders {
    type Id = ContenderId;
    type Vote = ContenderVote;

    fn local_vote(&self, id: &ContenderId) -> ContenderVote {
        self.vote(id)
    }

    fn is_worth_polling(&self, id: &ContenderId) -> bool {
        self.vote(id) != ContenderVote::Unknown
    }

    fn on_accepted(&mut self, id: &ContenderId) {
        self.accept(id);
    }

    fn on_rejected(&mut self, id: &ContenderId) {
        self.reject(id);
    }

    fn on_finalized(&mut self, id: &ContenderId) {
        if !self.finalize(id) {
            return;
        }
        let Some(contender) = self.contenders.get(id) else {
            return;
        };
        let (prev, height, proof) = (contender.prev, contender.height, contender.proof);
        info!(contender = %id, %proof, "finalized contender");
        if let Some(winners) = self.winners(&prev) {
            self.rewards.insert(prev, Reward { height, winners });
        }
    }

    fn on_invalidated(&mut self, id: &ContenderId) {
        if self.invalidate(id) {
            info!(contender = %id, "invalidated contender");
        }
    }

    fn on_stale(&mut self, id: &ContenderId) {
        info!(contender = %id, "stalled contender");
    }
}
