//! Avalanche proofs.
//!
//! A [Proof] claims that a set of UTXOs ([Stake]s) backs a master public key. Each stake is
//! signed by the key owning the UTXO over a commitment to the proof expiration and master key,
//! and the master key signs the limited proof id.
//!
//! Identifiers:
//! - `limited_id = H(sequence, expiration, payout_script, stakes without signatures)`
//! - `id = H(limited_id, master)`
//!
//! Verification is split in two: [Proof::verify_structure] checks everything that does not
//! depend on the chain (ordering, dust, signatures) and [Proof::verify] additionally resolves
//! every stake against the UTXO set, distinguishing proofs that may become valid later
//! (orphan or immature stakes) from invalid ones.

mod builder;
pub mod stake;

pub use builder::ProofBuilder;
pub use stake::{SignedStake, Stake};

use crate::{
    chain::CoinView,
    types::{Amount, LimitedProofId, OutPoint, ProofId, StakeId},
};
use avalanche_codec::{
    compact, EncodeSize, Error as CodecError, FixedSize, Read, ReadExt, ReadRangeExt,
    Write,
};
use avalanche_cryptography::{hash, Digest, Hasher, PublicKey, Signature, Verifier};
use bytes::{Buf, BufMut, Bytes};
use std::{cmp::Reverse, collections::HashSet};
use thiserror::Error;

/// Maximum number of stakes in a proof.
pub const MAX_PROOF_STAKES: usize = 1000;

/// Maximum length of a payout script.
pub const MAX_PAYOUT_SCRIPT: usize = 10_000;

/// Staked amount worth one point of score.
pub const SCORE_UNIT: Amount = 1_000_000;

/// Reasons a proof is rejected or not yet usable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("no-stake")]
    NoStake,
    #[error("too-many-utxos: {0}")]
    TooManyStakes(usize),
    #[error("amount-below-dust-threshold: {0}")]
    DustThreshold(Amount),
    #[error("wrong-stake-ordering")]
    WrongStakeOrdering,
    #[error("duplicated-stake: {0}")]
    DuplicateStake(OutPoint),
    #[error("invalid-stake-signature: {0}")]
    InvalidStakeSignature(OutPoint),
    #[error("invalid-proof-signature")]
    InvalidSignature,
    #[error("expired-proof")]
    Expired,
    #[error("utxo-missing-or-spent: {0}")]
    MissingUtxo(OutPoint),
    #[error("immature-utxo: {0}")]
    ImmatureUtxo(OutPoint),
    #[error("amount-mismatch: {0}")]
    AmountMismatch(OutPoint),
    #[error("height-mismatch: {0}")]
    HeightMismatch(OutPoint),
    #[error("coinbase-mismatch: {0}")]
    CoinbaseMismatch(OutPoint),
    #[error("destination-mismatch: {0}")]
    KeyMismatch(OutPoint),
}

/// Outcome of verifying a proof against the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Valid,
    /// A stake does not have enough confirmations yet.
    Immature(OutPoint),
    /// A stake is not in the UTXO set.
    Orphan(OutPoint),
    Invalid(Error),
}

impl Verification {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Chain-dependent verification parameters.
#[derive(Clone, Debug)]
pub struct StakeParams {
    /// Minimum amount of every stake.
    pub dust_threshold: Amount,
    /// Minimum confirmations of every stake (the block containing it counts as one).
    pub confirmations: u32,
}

/// Commitment signed by every stake of a proof.
pub fn stake_commitment(expiration: i64, master: &PublicKey) -> Digest {
    let mut hasher = Hasher::new();
    hasher.write(&expiration);
    hasher.write(master);
    hasher.finalize()
}

/// A verifiable claim that stakes back a master key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proof {
    sequence: u64,
    expiration: i64,
    master: PublicKey,
    payout_script: Bytes,
    stakes: Vec<SignedStake>,
    signature: Signature,

    limited_id: LimitedProofId,
    id: ProofId,
    amount: Amount,
}

impl Proof {
    pub fn new(
        sequence: u64,
        expiration: i64,
        master: PublicKey,
        payout_script: Bytes,
        stakes: Vec<SignedStake>,
        signature: Signature,
    ) -> Self {
        let limited_id = Self::compute_limited_id(sequence, expiration, &payout_script, &stakes);
        let id = Self::compute_id(&limited_id, &master);
        let amount = stakes
            .iter()
            .fold(0, |total: Amount, s| total.saturating_add(s.stake.amount));
        Self {
            sequence,
            expiration,
            master,
            payout_script,
            stakes,
            signature,
            limited_id,
            id,
            amount,
        }
    }

    pub(crate) fn compute_limited_id(
        sequence: u64,
        expiration: i64,
        payout_script: &Bytes,
        stakes: &[SignedStake],
    ) -> LimitedProofId {
        let mut buf = Vec::new();
        sequence.write(&mut buf);
        expiration.write(&mut buf);
        payout_script.write(&mut buf);
        compact::write(stakes.len() as u64, &mut buf);
        for signed in stakes {
            signed.stake.write(&mut buf);
        }
        LimitedProofId(hash(&buf))
    }

    pub(crate) fn compute_id(limited_id: &LimitedProofId, master: &PublicKey) -> ProofId {
        let mut hasher = Hasher::new();
        hasher.write(limited_id);
        hasher.write(master);
        ProofId(hasher.finalize())
    }

    pub fn id(&self) -> ProofId {
        self.id
    }

    pub fn limited_id(&self) -> LimitedProofId {
        self.limited_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn expiration(&self) -> i64 {
        self.expiration
    }

    pub fn master(&self) -> &PublicKey {
        &self.master
    }

    pub fn payout_script(&self) -> &Bytes {
        &self.payout_script
    }

    pub fn stakes(&self) -> &[SignedStake] {
        &self.stakes
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Total staked amount.
    pub fn staked_amount(&self) -> Amount {
        self.amount
    }

    /// Voting weight of the proof.
    pub fn score(&self) -> u32 {
        (self.amount / SCORE_UNIT).min(u32::MAX as Amount) as u32
    }

    pub fn utxos(&self) -> impl Iterator<Item = &OutPoint> {
        self.stakes.iter().map(|s| &s.stake.utxo)
    }

    /// Whether the proof expired at the given chain time (an expiration of zero never expires).
    pub fn is_expired(&self, time: u64) -> bool {
        self.expiration > 0 && time >= self.expiration as u64
    }

    /// Conflict resolution order: higher sequence, then fewer stakes, then larger amount,
    /// then lower id.
    pub fn is_preferred_to(&self, other: &Proof) -> bool {
        let key = |p: &Proof| (p.sequence, Reverse(p.stakes.len()), p.amount, Reverse(p.id));
        key(self) > key(other)
    }

    /// Check the proof without looking at the chain.
    pub fn verify_structure<V: Verifier>(
        &self,
        verifier: &V,
        dust_threshold: Amount,
    ) -> Result<(), Error> {
        if self.stakes.is_empty() {
            return Err(Error::NoStake);
        }
        if self.stakes.len() > MAX_PROOF_STAKES {
            return Err(Error::TooManyStakes(self.stakes.len()));
        }

        let commitment = stake_commitment(self.expiration, &self.master);
        let mut previous: Option<StakeId> = None;
        let mut utxos = HashSet::with_capacity(self.stakes.len());
        for signed in &self.stakes {
            let stake = &signed.stake;
            if stake.amount < dust_threshold {
                return Err(Error::DustThreshold(stake.amount));
            }
            let id = stake.id();
            if previous.is_some_and(|previous| id < previous) {
                return Err(Error::WrongStakeOrdering);
            }
            if !utxos.insert(stake.utxo) {
                return Err(Error::DuplicateStake(stake.utxo));
            }
            if !signed.verify(verifier, &commitment) {
                return Err(Error::InvalidStakeSignature(stake.utxo));
            }
            previous = Some(id);
        }

        if !verifier.verify(&self.master, &self.limited_id, &self.signature) {
            return Err(Error::InvalidSignature);
        }
        Ok(())
    }

    /// Check the proof against the UTXO set.
    pub fn verify<V: Verifier>(
        &self,
        verifier: &V,
        coins: &impl CoinView,
        params: &StakeParams,
    ) -> Verification {
        if let Err(err) = self.verify_structure(verifier, params.dust_threshold) {
            return Verification::Invalid(err);
        }
        if self.is_expired(coins.tip_time()) {
            return Verification::Invalid(Error::Expired);
        }
        for signed in &self.stakes {
            let stake = &signed.stake;
            let Some(coin) = coins.coin(&stake.utxo) else {
                return Verification::Orphan(stake.utxo);
            };
            if coin.is_coinbase != stake.is_coinbase {
                return Verification::Invalid(Error::CoinbaseMismatch(stake.utxo));
            }
            if coin.height != stake.height {
                return Verification::Invalid(Error::HeightMismatch(stake.utxo));
            }
            if coin.output.amount != stake.amount {
                return Verification::Invalid(Error::AmountMismatch(stake.utxo));
            }
            if coin.output.owner != stake.pubkey {
                return Verification::Invalid(Error::KeyMismatch(stake.utxo));
            }
            let mature_at = coin
                .height
                .saturating_add(params.confirmations)
                .saturating_sub(1);
            if mature_at > coins.tip_height() {
                return Verification::Immature(stake.utxo);
            }
        }
        Verification::Valid
    }
}

impl Write for Proof {
    fn write(&self, buf: &mut impl BufMut) {
        self.sequence.write(buf);
        self.expiration.write(buf);
        self.master.write(buf);
        self.stakes.write(buf);
        self.payout_script.write(buf);
        self.signature.write(buf);
    }
}

impl EncodeSize for Proof {
    fn encode_size(&self) -> usize {
        u64::SIZE
            + i64::SIZE
            + PublicKey::SIZE
            + self.stakes.encode_size()
            + self.payout_script.encode_size()
            + Signature::SIZE
    }
}

impl Read for Proof {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let sequence = u64::read(buf)?;
        let expiration = i64::read(buf)?;
        let master = PublicKey::read(buf)?;
        let stakes = Vec::<SignedStake>::read_range(buf, ..=MAX_PROOF_STAKES)?;
        let payout_script = Bytes::read_cfg(buf, &(..=MAX_PAYOUT_SCRIPT).into())?;
        let signature = Signature::read(buf)?;
        Ok(Self::new(
            sequence,
            expiration,
            master,
            payout_script,
            stakes,
            signature,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::{Block, Chainstate, Transaction, TxOut},
        types::{TxId, COIN},
    };
    use avalanche_codec::{DecodeExt, Encode};
    use avalanche_cryptography::{Ed25519, PrivateKey};
    use test_case::test_case;

    const AMOUNT: Amount = 1_000_000 * COIN;

    fn params(confirmations: u32) -> StakeParams {
        StakeParams {
            dust_threshold: 10 * COIN,
            confirmations,
        }
    }

    /// A chain of `height` blocks whose genesis pays `AMOUNT` to each staker.
    fn chain(stakers: &[PrivateKey], height: u32) -> (Chainstate, Vec<OutPoint>) {
        let outputs = stakers
            .iter()
            .map(|key| TxOut {
                amount: AMOUNT,
                owner: key.public_key(),
            })
            .collect();
        let coinbase = Transaction::coinbase(0, outputs);
        let utxos = (0..stakers.len() as u32)
            .map(|i| OutPoint::new(coinbase.id(), i))
            .collect();
        let genesis = Block::new(Default::default(), 0, 1_000, 1, 0, vec![coinbase]);
        let mut chain = Chainstate::new(genesis, None);
        for h in 1..=height {
            let coinbase = Transaction::coinbase(
                h,
                vec![TxOut {
                    amount: 1,
                    owner: stakers[0].public_key(),
                }],
            );
            let block = Block::new(chain.tip(), h, 1_000 + h as u64, 1, 0, vec![coinbase]);
            chain.submit_block(block).unwrap();
        }
        (chain, utxos)
    }

    fn build(master: &PrivateKey, sequence: u64, stakers: &[(OutPoint, &PrivateKey)]) -> Proof {
        let mut builder = ProofBuilder::new(sequence, 0, master.clone(), Bytes::new());
        for (utxo, key) in stakers {
            assert!(builder.add_utxo(*utxo, AMOUNT, 0, true, (*key).clone()));
        }
        builder.build()
    }

    #[test]
    fn test_valid_proof() {
        let master = PrivateKey::from_seed(0);
        let staker = PrivateKey::from_seed(1);
        let (chain, utxos) = chain(&[staker.clone()], 10);
        let proof = build(&master, 0, &[(utxos[0], &staker)]);
        assert_eq!(proof.verify(&Ed25519, &chain, &params(10)), Verification::Valid);
        assert_eq!(proof.score(), (AMOUNT / SCORE_UNIT) as u32);
        assert_eq!(proof.staked_amount(), AMOUNT);
    }

    #[test_case(11 => Verification::Immature(OutPoint::new(TxId::default(), 0)); "immature")]
    #[test_case(10 => Verification::Valid; "just mature")]
    fn test_confirmations(confirmations: u32) -> Verification {
        let master = PrivateKey::from_seed(0);
        let staker = PrivateKey::from_seed(1);
        let (chain, utxos) = chain(&[staker.clone()], 9);
        let proof = build(&master, 0, &[(utxos[0], &staker)]);
        match proof.verify(&Ed25519, &chain, &params(confirmations)) {
            // Normalize the outpoint so the expectation does not depend on the chain.
            Verification::Immature(_) => Verification::Immature(OutPoint::new(TxId::default(), 0)),
            other => other,
        }
    }

    #[test]
    fn test_orphan_and_mismatch() {
        let master = PrivateKey::from_seed(0);
        let staker = PrivateKey::from_seed(1);
        let (chain, utxos) = chain(&[staker.clone()], 1);

        let missing = OutPoint::new(TxId::default(), 0);
        let proof = build(&master, 0, &[(missing, &staker)]);
        assert_eq!(
            proof.verify(&Ed25519, &chain, &params(1)),
            Verification::Orphan(missing)
        );

        // Correctly signed by a key that does not own the UTXO.
        let thief = PrivateKey::from_seed(9);
        let proof = build(&master, 0, &[(utxos[0], &thief)]);
        assert_eq!(
            proof.verify(&Ed25519, &chain, &params(1)),
            Verification::Invalid(Error::KeyMismatch(utxos[0]))
        );
    }

    #[test]
    fn test_structure_errors() {
        let master = PrivateKey::from_seed(0);
        let staker = PrivateKey::from_seed(1);
        let utxo = OutPoint::new(TxId::default(), 0);

        let empty = ProofBuilder::new(0, 0, master.clone(), Bytes::new()).build();
        assert_eq!(empty.verify_structure(&Ed25519, 0), Err(Error::NoStake));

        let proof = build(&master, 0, &[(utxo, &staker)]);
        assert_eq!(
            proof.verify_structure(&Ed25519, AMOUNT + 1),
            Err(Error::DustThreshold(AMOUNT))
        );

        // Replace the master signature.
        let forged = Proof::new(
            proof.sequence(),
            proof.expiration(),
            *proof.master(),
            proof.payout_script().clone(),
            proof.stakes().to_vec(),
            staker.sign(&proof.limited_id()),
        );
        assert_eq!(forged.verify_structure(&Ed25519, 0), Err(Error::InvalidSignature));

        // Stakes signed for another master key.
        let other = build(&PrivateKey::from_seed(5), 0, &[(utxo, &staker)]);
        let limited_id =
            Proof::compute_limited_id(0, 0, &Bytes::new(), other.stakes());
        let moved = Proof::new(
            0,
            0,
            master.public_key(),
            Bytes::new(),
            other.stakes().to_vec(),
            master.sign(&limited_id),
        );
        assert_eq!(
            moved.verify_structure(&Ed25519, 0),
            Err(Error::InvalidStakeSignature(utxo))
        );
    }

    #[test]
    fn test_stake_ordering_enforced() {
        let master = PrivateKey::from_seed(0);
        let a = PrivateKey::from_seed(1);
        let b = PrivateKey::from_seed(2);
        let proof = build(
            &master,
            0,
            &[
                (OutPoint::new(TxId::default(), 0), &a),
                (OutPoint::new(TxId::default(), 1), &b),
            ],
        );
        assert_eq!(proof.verify_structure(&Ed25519, 0), Ok(()));

        let mut stakes = proof.stakes().to_vec();
        stakes.reverse();
        let limited_id = Proof::compute_limited_id(0, 0, &Bytes::new(), &stakes);
        let reordered = Proof::new(
            0,
            0,
            master.public_key(),
            Bytes::new(),
            stakes,
            master.sign(&limited_id),
        );
        assert_eq!(
            reordered.verify_structure(&Ed25519, 0),
            Err(Error::WrongStakeOrdering)
        );
    }

    #[test]
    fn test_expiration() {
        let master = PrivateKey::from_seed(0);
        let staker = PrivateKey::from_seed(1);
        let (chain, utxos) = chain(&[staker.clone()], 2);
        let mut builder = ProofBuilder::new(0, 1_002, master, Bytes::new());
        builder.add_utxo(utxos[0], AMOUNT, 0, true, staker);
        let proof = builder.build();
        assert!(proof.is_expired(1_002));
        assert!(!proof.is_expired(1_001));
        assert_eq!(
            proof.verify(&Ed25519, &chain, &params(1)),
            Verification::Invalid(Error::Expired)
        );
    }

    #[test]
    fn test_id_excludes_signatures() {
        let master = PrivateKey::from_seed(0);
        let staker = PrivateKey::from_seed(1);
        let proof = build(&master, 3, &[(OutPoint::new(TxId::default(), 0), &staker)]);
        let decoded = Proof::decode(proof.encode()).unwrap();
        assert_eq!(decoded, proof);
        assert_eq!(decoded.id(), proof.id());

        // The limited id does not commit to the master key, the proof id does.
        let other = build(&PrivateKey::from_seed(7), 3, &[(OutPoint::new(TxId::default(), 0), &staker)]);
        assert_eq!(other.limited_id(), proof.limited_id());
        assert_ne!(other.id(), proof.id());
    }

    #[test]
    fn test_conflict_preference() {
        let staker = PrivateKey::from_seed(1);
        let extra = PrivateKey::from_seed(2);
        let utxo = OutPoint::new(TxId::default(), 0);
        let low = build(&PrivateKey::from_seed(0), 1, &[(utxo, &staker)]);
        let high = build(&PrivateKey::from_seed(0), 2, &[(utxo, &staker)]);
        assert!(high.is_preferred_to(&low));
        assert!(!low.is_preferred_to(&high));

        // Same sequence: fewer stakes wins.
        let bigger = build(
            &PrivateKey::from_seed(0),
            2,
            &[(utxo, &staker), (OutPoint::new(TxId::default(), 1), &extra)],
        );
        assert!(high.is_preferred_to(&bigger));
    }
}
