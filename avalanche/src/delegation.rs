//! Delegations of a proof's master key.
//!
//! A delegation starts at a proof (identified by its limited id and master key) and appends
//! levels, each handing authority from the current key to a new one. Level `i` is signed by
//! the previous key over `H(id_i, pubkey_i)` where `id_0` is the proof id; the result becomes
//! `id_{i+1}` and the final id identifies the delegation.

use crate::{
    proof::Proof,
    types::{DelegationId, LimitedProofId, ProofId},
};
use avalanche_codec::{
    EncodeSize, Error as CodecError, FixedSize, Read, ReadExt, ReadRangeExt, Write,
};
use avalanche_cryptography::{Digest, Hasher, PrivateKey, PublicKey, Signature, Verifier};
use bytes::{Buf, BufMut};
use thiserror::Error;

/// Maximum number of levels in a delegation.
pub const MAX_DELEGATION_LEVELS: usize = 20;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("too-many-levels")]
    TooManyLevels,
    #[error("invalid-signature at level {0}")]
    InvalidSignature(usize),
    #[error("delegating key is not the delegated key")]
    WrongKey,
}

/// One step of a delegation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Level {
    pub pubkey: PublicKey,
    pub signature: Signature,
}

impl Write for Level {
    fn write(&self, buf: &mut impl BufMut) {
        self.pubkey.write(buf);
        self.signature.write(buf);
    }
}

impl Read for Level {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let pubkey = PublicKey::read(buf)?;
        let signature = Signature::read(buf)?;
        Ok(Self { pubkey, signature })
    }
}

impl FixedSize for Level {
    const SIZE: usize = PublicKey::SIZE + Signature::SIZE;
}

/// A chain of keys rooted at a proof's master key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delegation {
    limited_proof_id: LimitedProofId,
    master: PublicKey,
    levels: Vec<Level>,
    id: DelegationId,
}

fn chain_id(previous: &Digest, pubkey: &PublicKey) -> Digest {
    let mut hasher = Hasher::new();
    hasher.write(previous);
    hasher.write(pubkey);
    hasher.finalize()
}

impl Delegation {
    fn new(limited_proof_id: LimitedProofId, master: PublicKey, levels: Vec<Level>) -> Self {
        let mut id = *Proof::compute_id(&limited_proof_id, &master);
        for level in &levels {
            id = chain_id(&id, &level.pubkey);
        }
        Self {
            limited_proof_id,
            master,
            levels,
            id: DelegationId(id),
        }
    }

    /// An empty delegation: the master key itself.
    pub fn from_proof(proof: &Proof) -> Self {
        Self::new(proof.limited_id(), *proof.master(), Vec::new())
    }

    /// An empty delegation from raw proof parts.
    pub fn from_parts(limited_proof_id: LimitedProofId, master: PublicKey) -> Self {
        Self::new(limited_proof_id, master, Vec::new())
    }

    pub fn id(&self) -> DelegationId {
        self.id
    }

    pub fn limited_proof_id(&self) -> LimitedProofId {
        self.limited_proof_id
    }

    pub fn proof_id(&self) -> ProofId {
        Proof::compute_id(&self.limited_proof_id, &self.master)
    }

    pub fn master(&self) -> &PublicKey {
        &self.master
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// Key currently holding authority (the master key if there are no levels).
    pub fn delegated_pubkey(&self) -> &PublicKey {
        self.levels
            .last()
            .map(|level| &level.pubkey)
            .unwrap_or(&self.master)
    }

    /// Append a level handing authority from `current` (the delegated key) to `next`.
    pub fn delegate(&self, current: &PrivateKey, next: PublicKey) -> Result<Self, Error> {
        if current.public_key() != *self.delegated_pubkey() {
            return Err(Error::WrongKey);
        }
        if self.levels.len() >= MAX_DELEGATION_LEVELS {
            return Err(Error::TooManyLevels);
        }
        let signature = current.sign(&chain_id(&self.id, &next));
        let mut levels = self.levels.clone();
        levels.push(Level {
            pubkey: next,
            signature,
        });
        Ok(Self::new(self.limited_proof_id, self.master, levels))
    }

    /// Walk the chain, returning the delegated key if every level is correctly signed.
    pub fn verify<V: Verifier>(&self, verifier: &V) -> Result<PublicKey, Error> {
        if self.levels.len() > MAX_DELEGATION_LEVELS {
            return Err(Error::TooManyLevels);
        }
        let mut id = *self.proof_id();
        let mut key = self.master;
        for (i, level) in self.levels.iter().enumerate() {
            id = chain_id(&id, &level.pubkey);
            if !verifier.verify(&key, &id, &level.signature) {
                return Err(Error::InvalidSignature(i));
            }
            key = level.pubkey;
        }
        Ok(key)
    }
}

impl Write for Delegation {
    fn write(&self, buf: &mut impl BufMut) {
        self.limited_proof_id.write(buf);
        self.master.write(buf);
        self.levels.write(buf);
    }
}

impl EncodeSize for Delegation {
    fn encode_size(&self) -> usize {
        LimitedProofId::SIZE + PublicKey::SIZE + self.levels.encode_size()
    }
}

impl Read for Delegation {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let limited_proof_id = LimitedProofId::read(buf)?;
        let master = PublicKey::read(buf)?;
        let levels = Vec::<Level>::read_range(buf, ..=MAX_DELEGATION_LEVELS)?;
        Ok(Self::new(limited_proof_id, master, levels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{proof::ProofBuilder, types::OutPoint};
    use avalanche_codec::{DecodeExt, Encode};
    use avalanche_cryptography::Ed25519;
    use bytes::Bytes;

    fn proof(master: &PrivateKey) -> Proof {
        let mut builder = ProofBuilder::new(0, 0, master.clone(), Bytes::new());
        builder.add_utxo(OutPoint::default(), 1, 0, false, PrivateKey::from_seed(100));
        builder.build()
    }

    #[test]
    fn test_empty_delegation() {
        let master = PrivateKey::from_seed(0);
        let proof = proof(&master);
        let delegation = Delegation::from_proof(&proof);
        assert_eq!(delegation.proof_id(), proof.id());
        assert_eq!(*delegation.id(), *proof.id());
        assert_eq!(delegation.verify(&Ed25519), Ok(master.public_key()));
    }

    #[test]
    fn test_multi_level() {
        let master = PrivateKey::from_seed(0);
        let keys: Vec<PrivateKey> = (1..=3).map(PrivateKey::from_seed).collect();
        let mut delegation = Delegation::from_proof(&proof(&master));
        let mut current = master.clone();
        for key in &keys {
            delegation = delegation.delegate(&current, key.public_key()).unwrap();
            current = key.clone();
        }
        assert_eq!(delegation.levels().len(), 3);
        assert_eq!(delegation.verify(&Ed25519), Ok(keys[2].public_key()));
        assert_eq!(*delegation.delegated_pubkey(), keys[2].public_key());

        let decoded = Delegation::decode(delegation.encode()).unwrap();
        assert_eq!(decoded.id(), delegation.id());
        assert_eq!(decoded.verify(&Ed25519), Ok(keys[2].public_key()));
    }

    #[test]
    fn test_wrong_delegating_key() {
        let master = PrivateKey::from_seed(0);
        let delegation = Delegation::from_proof(&proof(&master));
        let other = PrivateKey::from_seed(9);
        assert_eq!(
            delegation.delegate(&other, other.public_key()),
            Err(Error::WrongKey)
        );
    }

    #[test]
    fn test_tampered_level() {
        let master = PrivateKey::from_seed(0);
        let first = PrivateKey::from_seed(1);
        let delegation = Delegation::from_proof(&proof(&master))
            .delegate(&master, first.public_key())
            .unwrap()
            .delegate(&first, PrivateKey::from_seed(2).public_key())
            .unwrap();

        // Swap the last delegated key while keeping the signature.
        let mut levels = delegation.levels().to_vec();
        levels[1].pubkey = PrivateKey::from_seed(3).public_key();
        let tampered = Delegation::new(delegation.limited_proof_id(), *delegation.master(), levels);
        assert_eq!(tampered.verify(&Ed25519), Err(Error::InvalidSignature(1)));
        assert_ne!(tampered.id(), delegation.id());
    }

    #[test]
    fn test_level_limit() {
        let master = PrivateKey::from_seed(0);
        let mut delegation = Delegation::from_proof(&proof(&master));
        let mut current = master;
        for seed in 1..=MAX_DELEGATION_LEVELS as u64 {
            let next = PrivateKey::from_seed(seed);
            delegation = delegation.delegate(&current, next.public_key()).unwrap();
            current = next;
        }
        assert_eq!(
            delegation.delegate(&current, PrivateKey::from_seed(99).public_key()),
            Err(Error::TooManyLevels)
        );
        assert!(delegation.verify(&Ed25519).is_ok());
    }
}
