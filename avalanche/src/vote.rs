//! Per-kind vote taxonomies.
//!
//! Blocks, transactions, proofs and stake contenders each answer a poll with their own closed
//! set of codes. A
//! code only means something relative to the kind of item being voted on, so the wire value
//! is decoded into [VoteKind] using the inventory type the vote answers.
//!
//! Every code maps to a [VoteClass]: `Yes` and `No` move a vote record, `Neutral` codes
//! (unknown, fork, pending, orphan transaction) only count toward staleness.

use crate::wire::InvKind;
use std::fmt::Debug;

/// Effect of a vote on a vote record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoteClass {
    Yes,
    No,
    Neutral,
}

/// A closed set of vote codes for one kind of item.
pub trait VoteCode: Copy + Debug + Eq {
    /// Wire value of this vote.
    fn code(self) -> i32;

    /// Parse a wire value, returning `None` for codes this kind does not define.
    fn from_code(code: i32) -> Option<Self>;

    /// How this vote moves a vote record.
    fn class(self) -> VoteClass;
}

/// Vote on a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockVote {
    /// The block is on the active chain.
    Accepted,
    /// The block (or one of its ancestors) failed validation.
    Invalid,
    /// The block is on a parked chain.
    Parked,
    /// The block is known but on a fork of the active chain.
    Fork,
    /// The block is not known.
    Unknown,
    /// The block builds on the active chain but is not connected yet.
    Pending,
}

impl VoteCode for BlockVote {
    fn code(self) -> i32 {
        match self {
            Self::Accepted => 0,
            Self::Invalid => 1,
            Self::Parked => 2,
            Self::Fork => 3,
            Self::Unknown => -1,
            Self::Pending => -3,
        }
    }

    fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Accepted),
            1 => Some(Self::Invalid),
            2 => Some(Self::Parked),
            3 => Some(Self::Fork),
            -1 => Some(Self::Unknown),
            -3 => Some(Self::Pending),
            _ => None,
        }
    }

    fn class(self) -> VoteClass {
        match self {
            Self::Accepted => VoteClass::Yes,
            Self::Invalid | Self::Parked => VoteClass::No,
            Self::Fork | Self::Unknown | Self::Pending => VoteClass::Neutral,
        }
    }
}

/// Vote on a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxVote {
    /// The transaction is in the mempool.
    Accepted,
    /// The transaction was rejected.
    Invalid,
    /// The transaction double spends a mempool transaction.
    Conflicting,
    /// The transaction is not known.
    Unknown,
    /// Some inputs of the transaction are not known.
    Orphan,
}

impl VoteCode for TxVote {
    fn code(self) -> i32 {
        match self {
            Self::Accepted => 0,
            Self::Invalid => 1,
            Self::Conflicting => 2,
            Self::Unknown => -1,
            Self::Orphan => -2,
        }
    }

    fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Accepted),
            1 => Some(Self::Invalid),
            2 => Some(Self::Conflicting),
            -1 => Some(Self::Unknown),
            -2 => Some(Self::Orphan),
            _ => None,
        }
    }

    fn class(self) -> VoteClass {
        match self {
            Self::Accepted => VoteClass::Yes,
            Self::Invalid | Self::Conflicting => VoteClass::No,
            Self::Unknown | Self::Orphan => VoteClass::Neutral,
        }
    }
}

/// Vote on a proof.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProofVote {
    /// The proof is bound to a peer.
    Active,
    /// The proof was rejected.
    Rejected,
    /// The proof stakes are immature or not known yet.
    Orphan,
    /// The proof conflicts with a preferred proof.
    Conflict,
    /// The proof is not known.
    Unknown,
}

impl VoteCode for ProofVote {
    fn code(self) -> i32 {
        match self {
            Self::Active => 0,
            Self::Rejected => 1,
            Self::Orphan => 2,
            Self::Conflict => 3,
            Self::Unknown => -1,
        }
    }

    fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Active),
            1 => Some(Self::Rejected),
            2 => Some(Self::Orphan),
            3 => Some(Self::Conflict),
            -1 => Some(Self::Unknown),
            _ => None,
        }
    }

    fn class(self) -> VoteClass {
        match self {
            Self::Active => VoteClass::Yes,
            Self::Rejected | Self::Orphan | Self::Conflict => VoteClass::No,
            Self::Unknown => VoteClass::Neutral,
        }
    }
}

/// Vote on a stake contender.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContenderVote {
    /// The contender is a staking reward winner.
    Accepted,
    /// The contender is not a winner.
    Invalid,
    /// The contender is not known.
    Unknown,
    /// The staking reward winner of the contender's block is not computed yet.
    Pending,
}

impl VoteCode for ContenderVote {
    fn code(self) -> i32 {
        match self {
            Self::Accepted => 0,
            Self::Invalid => 1,
            Self::Unknown => -1,
            Self::Pending => -2,
        }
    }

    fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Accepted),
            1 => Some(Self::Invalid),
            -1 => Some(Self::Unknown),
            -2 => Some(Self::Pending),
            _ => None,
        }
    }

    fn class(self) -> VoteClass {
        match self {
            Self::Accepted => VoteClass::Yes,
            Self::Invalid => VoteClass::No,
            Self::Unknown | Self::Pending => VoteClass::Neutral,
        }
    }
}

/// A vote tagged with the kind of item it answers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoteKind {
    Block(BlockVote),
    Tx(TxVote),
    Proof(ProofVote),
    Contender(ContenderVote),
}

impl VoteKind {
    /// Decode a wire code for an item of the given kind.
    pub fn from_code(kind: InvKind, code: i32) -> Option<Self> {
        match kind {
            InvKind::Block => BlockVote::from_code(code).map(Self::Block),
            InvKind::Tx => TxVote::from_code(code).map(Self::Tx),
            InvKind::Proof => ProofVote::from_code(code).map(Self::Proof),
            InvKind::Contender => ContenderVote::from_code(code).map(Self::Contender),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Block(v) => v.code(),
            Self::Tx(v) => v.code(),
            Self::Proof(v) => v.code(),
            Self::Contender(v) => v.code(),
        }
    }

    pub fn class(self) -> VoteClass {
        match self {
            Self::Block(v) => v.class(),
            Self::Tx(v) => v.class(),
            Self::Proof(v) => v.class(),
            Self::Contender(v) => v.class(),
        }
    }
}

/// A collaborator owning one kind of votable item.
///
/// The poll engine never inspects items itself: it asks the owner for the local opinion and
/// reports the outcome of polling back to it.
pub trait ItemKind {
    /// Identifier of an item.
    type Id: Copy + Debug + Eq;

    /// Votes this kind answers with.
    type Vote: VoteCode;

    /// The local opinion on an item, sent in response to polls.
    fn local_vote(&self, id: &Self::Id) -> Self::Vote;

    /// Whether the network should still be asked about this item.
    fn is_worth_polling(&self, id: &Self::Id) -> bool;

    /// Whether the item starts out accepted when first entered for polling.
    fn is_accepted(&self, id: &Self::Id) -> bool {
        self.local_vote(id).class() == VoteClass::Yes
    }

    /// The network currently leans toward accepting the item.
    fn on_accepted(&mut self, _id: &Self::Id) {}

    /// The network currently leans toward rejecting the item.
    fn on_rejected(&mut self, _id: &Self::Id) {}

    /// The network accepted the item for good.
    fn on_finalized(&mut self, id: &Self::Id);

    /// The network rejected the item for good.
    fn on_invalidated(&mut self, id: &Self::Id);

    /// Polling gave up without a decision.
    fn on_stale(&mut self, _id: &Self::Id) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_kind_specific() {
        // Code 2 is a rejection for every kind but names a different reason.
        assert_eq!(
            VoteKind::from_code(InvKind::Block, 2),
            Some(VoteKind::Block(BlockVote::Parked))
        );
        assert_eq!(
            VoteKind::from_code(InvKind::Tx, 2),
            Some(VoteKind::Tx(TxVote::Conflicting))
        );
        assert_eq!(
            VoteKind::from_code(InvKind::Proof, 2),
            Some(VoteKind::Proof(ProofVote::Orphan))
        );

        // Code 3 means fork for blocks and is not defined for transactions.
        assert_eq!(VoteKind::from_code(InvKind::Block, 3).unwrap().class(), VoteClass::Neutral);
        assert_eq!(VoteKind::from_code(InvKind::Tx, 3), None);
        assert_eq!(VoteKind::from_code(InvKind::Proof, 3).unwrap().class(), VoteClass::No);

        // Code -2 is an orphan transaction but a pending contender; both are neutral.
        assert_eq!(
            VoteKind::from_code(InvKind::Contender, -2),
            Some(VoteKind::Contender(ContenderVote::Pending))
        );
        assert_eq!(VoteKind::from_code(InvKind::Contender, 2), None);
    }

    #[test]
    fn test_code_roundtrip() {
        for vote in [
            BlockVote::Accepted,
            BlockVote::Invalid,
            BlockVote::Parked,
            BlockVote::Fork,
            BlockVote::Unknown,
            BlockVote::Pending,
        ] {
            assert_eq!(BlockVote::from_code(vote.code()), Some(vote));
        }
        for vote in [
            TxVote::Accepted,
            TxVote::Invalid,
            TxVote::Conflicting,
            TxVote::Unknown,
            TxVote::Orphan,
        ] {
            assert_eq!(TxVote::from_code(vote.code()), Some(vote));
        }
        for vote in [
            ProofVote::Active,
            ProofVote::Rejected,
            ProofVote::Orphan,
            ProofVote::Conflict,
            ProofVote::Unknown,
        ] {
            assert_eq!(ProofVote::from_code(vote.code()), Some(vote));
        }
        for vote in [
            ContenderVote::Accepted,
            ContenderVote::Invalid,
            ContenderVote::Unknown,
            ContenderVote::Pending,
        ] {
            assert_eq!(ContenderVote::from_code(vote.code()), Some(vote));
        }
    }

    #[test]
    fn test_unknown_is_neutral() {
        assert_eq!(BlockVote::Unknown.class(), VoteClass::Neutral);
        assert_eq!(TxVote::Unknown.class(), VoteClass::Neutral);
        assert_eq!(ProofVote::Unknown.class(), VoteClass::Neutral);
        assert_eq!(ContenderVote::Unknown.class(), VoteClass::Neutral);
    }
}
