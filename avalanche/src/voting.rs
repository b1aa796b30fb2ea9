//! Per-item vote records.
//!
//! A [VoteRecord] keeps the last [VOTE_WINDOW] votes received for an item, each from a
//! different node. The item flips to accepted (or rejected) once more than six of those votes
//! agree. Every further conclusive vote in the same direction adds one to the confidence, and
//! the record is final once the confidence reaches the finalization (or invalidation) score.
//! A flip resets the confidence.
//!
//! Neutral votes (unknown item, fork...) occupy a window slot without supporting either side,
//! so they only delay the outcome and count toward staleness.

use crate::{types::NodeId, vote::VoteClass};
use std::collections::VecDeque;

/// Number of votes (and distinct voters) considered at once.
pub const VOTE_WINDOW: usize = 8;

/// Number of agreeing votes in the window needed to move the record.
pub const VOTE_QUORUM: u32 = 7;

/// Outcome of folding votes into a record, reported to the owner of the item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VoteStatus {
    /// Rejected for good.
    Invalid,
    /// Currently leaning toward rejection.
    Rejected,
    /// Currently leaning toward acceptance.
    Accepted,
    /// Accepted for good.
    Finalized,
    /// Too many votes without reaching a decision.
    Stale,
}

impl VoteStatus {
    /// Whether the record is discarded after this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Invalid | Self::Finalized | Self::Stale)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Rejected => "rejected",
            Self::Accepted => "accepted",
            Self::Finalized => "finalized",
            Self::Stale => "stale",
        }
    }
}

/// Scores and limits applied to every record.
#[derive(Clone, Copy, Debug)]
pub struct Thresholds {
    pub finalization_score: u16,
    pub invalidation_score: u16,
    pub stale_vote_threshold: u32,
    pub stale_vote_factor: u32,
    pub max_inflight_poll: u8,
}

/// Vote state of one polled item.
#[derive(Clone, Debug)]
pub struct VoteRecord {
    accepted: bool,
    confidence: u16,
    votes: u8,
    consider: u8,
    successful_votes: u32,
    inflight: u8,
    voters: VecDeque<NodeId>,
}

impl VoteRecord {
    pub fn new(accepted: bool) -> Self {
        Self {
            accepted,
            confidence: 0,
            votes: 0,
            consider: 0,
            successful_votes: 0,
            inflight: 0,
            voters: VecDeque::with_capacity(VOTE_WINDOW),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    pub fn confidence(&self) -> u16 {
        self.confidence
    }

    /// Votes counted so far (duplicate voters excluded).
    pub fn successful_votes(&self) -> u32 {
        self.successful_votes
    }

    pub fn inflight(&self) -> u8 {
        self.inflight
    }

    /// Whether the record reached its final state.
    pub fn has_finalized(&self, thresholds: &Thresholds) -> bool {
        let score = if self.accepted {
            thresholds.finalization_score
        } else {
            thresholds.invalidation_score
        };
        self.confidence >= score
    }

    /// Whether the record should be given up on.
    pub fn is_stale(&self, thresholds: &Thresholds) -> bool {
        self.successful_votes > thresholds.stale_vote_threshold
            && self.successful_votes
                > (self.confidence as u32).saturating_mul(thresholds.stale_vote_factor)
    }

    /// Account for a poll including this item. Returns false when too many polls are in flight.
    pub fn register_poll(&mut self, thresholds: &Thresholds) -> bool {
        if self.inflight >= thresholds.max_inflight_poll {
            return false;
        }
        self.inflight += 1;
        true
    }

    /// Forget `count` polls that will never be answered.
    pub fn clear_inflight(&mut self, count: u8) {
        self.inflight = self.inflight.saturating_sub(count);
    }

    /// Fold the vote of `node`.
    ///
    /// Returns true when the vote changed the outcome: the record flipped or just reached its
    /// final state. Votes from a node already in the window are ignored.
    pub fn register_vote(&mut self, node: NodeId, class: VoteClass, thresholds: &Thresholds) -> bool {
        self.clear_inflight(1);
        if self.voters.contains(&node) {
            return false;
        }
        if self.voters.len() == VOTE_WINDOW {
            self.voters.pop_front();
        }
        self.voters.push_back(node);
        self.successful_votes = self.successful_votes.saturating_add(1);

        self.votes = (self.votes << 1) | (class == VoteClass::Yes) as u8;
        self.consider = (self.consider << 1) | (class != VoteClass::Neutral) as u8;

        let yes = (self.votes & self.consider).count_ones() >= VOTE_QUORUM;
        if !yes {
            let no = (!self.votes & self.consider).count_ones() >= VOTE_QUORUM;
            if !no {
                return false;
            }
        }

        if self.accepted == yes {
            self.confidence = self.confidence.saturating_add(1);
            let score = if yes {
                thresholds.finalization_score
            } else {
                thresholds.invalidation_score
            };
            return self.confidence == score;
        }

        self.accepted = yes;
        self.confidence = 0;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    const THRESHOLDS: Thresholds = Thresholds {
        finalization_score: 128,
        invalidation_score: 128,
        stale_vote_threshold: 4096,
        stale_vote_factor: 64,
        max_inflight_poll: 10,
    };

    /// Feed `count` votes of `class` from rotating voters starting at `first`.
    fn feed(record: &mut VoteRecord, first: NodeId, count: usize, class: VoteClass) -> Vec<bool> {
        (0..count as u64)
            .map(|i| record.register_vote(first + i, class, &THRESHOLDS))
            .collect()
    }

    #[test]
    fn test_accept_then_finalize() {
        let mut record = VoteRecord::new(true);

        // Six agreeing votes are not enough.
        assert!(feed(&mut record, 0, 6, VoteClass::Yes).iter().all(|changed| !changed));
        assert_eq!(record.confidence(), 0);

        // Then each vote adds confidence.
        assert!(!record.register_vote(6, VoteClass::Yes, &THRESHOLDS));
        assert_eq!(record.confidence(), 1);

        let changes = feed(&mut record, 7, 127, VoteClass::Yes);
        assert_eq!(changes.iter().filter(|changed| **changed).count(), 1);
        assert!(*changes.last().unwrap());
        assert_eq!(record.confidence(), 128);
        assert!(record.has_finalized(&THRESHOLDS));
    }

    #[test]
    fn test_flip_resets_confidence() {
        let mut record = VoteRecord::new(true);
        feed(&mut record, 0, 20, VoteClass::Yes);
        assert_eq!(record.confidence(), 14);

        let changes = feed(&mut record, 100, 7, VoteClass::No);
        assert_eq!(changes, vec![false, false, false, false, false, false, true]);
        assert!(!record.is_accepted());
        assert_eq!(record.confidence(), 0);

        assert!(!record.register_vote(200, VoteClass::No, &THRESHOLDS));
        assert_eq!(record.confidence(), 1);
    }

    #[test]
    fn test_duplicate_voter_ignored() {
        let mut record = VoteRecord::new(true);
        for _ in 0..20 {
            record.register_vote(1, VoteClass::Yes, &THRESHOLDS);
        }
        assert_eq!(record.successful_votes(), 1);

        // Once pushed out of the window, the voter counts again.
        feed(&mut record, 10, VOTE_WINDOW, VoteClass::Yes);
        record.register_vote(1, VoteClass::Yes, &THRESHOLDS);
        assert_eq!(record.successful_votes(), 2 + VOTE_WINDOW as u32);
    }

    #[test]
    fn test_neutral_votes_delay() {
        let mut record = VoteRecord::new(true);
        feed(&mut record, 0, 7, VoteClass::Yes);
        assert_eq!(record.confidence(), 1);

        // Two neutral votes in the window leave only six supporting votes.
        record.register_vote(7, VoteClass::Neutral, &THRESHOLDS);
        assert_eq!(record.confidence(), 2);
        record.register_vote(8, VoteClass::Neutral, &THRESHOLDS);
        assert_eq!(record.confidence(), 2);
        feed(&mut record, 9, 6, VoteClass::Yes);
        assert_eq!(record.confidence(), 2);
        record.register_vote(15, VoteClass::Yes, &THRESHOLDS);
        assert_eq!(record.confidence(), 3);
    }

    #[test_case(0, 140 => false; "at threshold")]
    #[test_case(0, 141 => true; "past threshold")]
    #[test_case(132, 122 => false; "confidence keeps record alive")]
    #[test_case(132, 123 => true; "past factor")]
    fn test_stale(yes: usize, neutral: usize) -> bool {
        let thresholds = Thresholds {
            stale_vote_threshold: 140,
            stale_vote_factor: 2,
            ..THRESHOLDS
        };
        let mut record = VoteRecord::new(true);
        for i in 0..yes as u64 {
            record.register_vote(i, VoteClass::Yes, &thresholds);
        }
        for i in 0..neutral as u64 {
            record.register_vote(10_000 + i, VoteClass::Neutral, &thresholds);
        }
        record.is_stale(&thresholds)
    }

    #[test]
    fn test_inflight_limit() {
        let mut record = VoteRecord::new(false);
        for _ in 0..10 {
            assert!(record.register_poll(&THRESHOLDS));
        }
        assert!(!record.register_poll(&THRESHOLDS));
        record.clear_inflight(3);
        assert_eq!(record.inflight(), 7);
        record.register_vote(0, VoteClass::No, &THRESHOLDS);
        assert_eq!(record.inflight(), 6);
    }

    #[test]
    fn test_separate_invalidation_score() {
        let thresholds = Thresholds {
            invalidation_score: 4,
            ..THRESHOLDS
        };
        let mut record = VoteRecord::new(false);
        let changes: Vec<bool> = (0..10)
            .map(|i| record.register_vote(i, VoteClass::No, &thresholds))
            .collect();
        // Conclusive from the 7th vote, final at confidence 4.
        assert_eq!(changes.iter().position(|c| *c), Some(9));
        assert!(record.has_finalized(&thresholds));
    }
}
