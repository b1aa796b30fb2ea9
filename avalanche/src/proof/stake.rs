//! Stakes: UTXOs committed to a proof.

use crate::types::{Amount, OutPoint, StakeId};
use avalanche_codec::{Encode, Error as CodecError, FixedSize, Read, ReadExt, Write};
use avalanche_cryptography::{hash, Digest, Hasher, PrivateKey, PublicKey, Signature, Verifier};
use bytes::{Buf, BufMut};

/// A UTXO claimed by a proof.
///
/// The height and coinbase flag are packed together on the wire (`height << 1 | coinbase`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stake {
    pub utxo: OutPoint,
    pub amount: Amount,
    pub height: u32,
    pub is_coinbase: bool,
    /// Key owning the UTXO.
    pub pubkey: PublicKey,
}

impl Stake {
    pub fn id(&self) -> StakeId {
        StakeId(hash(&self.encode()))
    }

    /// Digest signed by the stake key, binding the stake to a proof commitment.
    pub fn signing_digest(&self, commitment: &Digest) -> Digest {
        let mut hasher = Hasher::new();
        hasher.write(commitment);
        hasher.write(self);
        hasher.finalize()
    }
}

impl Write for Stake {
    fn write(&self, buf: &mut impl BufMut) {
        self.utxo.write(buf);
        self.amount.write(buf);
        ((self.height << 1) | self.is_coinbase as u32).write(buf);
        self.pubkey.write(buf);
    }
}

impl Read for Stake {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let utxo = OutPoint::read(buf)?;
        let amount = Amount::read(buf)?;
        let packed = u32::read(buf)?;
        let pubkey = PublicKey::read(buf)?;
        Ok(Self {
            utxo,
            amount,
            height: packed >> 1,
            is_coinbase: packed & 1 == 1,
            pubkey,
        })
    }
}

impl FixedSize for Stake {
    const SIZE: usize = OutPoint::SIZE + Amount::SIZE + u32::SIZE + PublicKey::SIZE;
}

/// A stake with the signature of its owning key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedStake {
    pub stake: Stake,
    pub signature: Signature,
}

impl SignedStake {
    /// Sign `stake` for the proof identified by `commitment`.
    pub fn sign(stake: Stake, key: &PrivateKey, commitment: &Digest) -> Self {
        let signature = key.sign(&stake.signing_digest(commitment));
        Self { stake, signature }
    }

    pub fn verify<V: Verifier>(&self, verifier: &V, commitment: &Digest) -> bool {
        verifier.verify(
            &self.stake.pubkey,
            &self.stake.signing_digest(commitment),
            &self.signature,
        )
    }
}

impl Write for SignedStake {
    fn write(&self, buf: &mut impl BufMut) {
        self.stake.write(buf);
        self.signature.write(buf);
    }
}

impl Read for SignedStake {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let stake = Stake::read(buf)?;
        let signature = Signature::read(buf)?;
        Ok(Self { stake, signature })
    }
}

impl FixedSize for SignedStake {
    const SIZE: usize = Stake::SIZE + Signature::SIZE;
}
