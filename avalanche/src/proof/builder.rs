use super::{stake_commitment, Proof, SignedStake, Stake};
use crate::types::{Amount, OutPoint};
use avalanche_cryptography::PrivateKey;
use bytes::Bytes;
use std::collections::BTreeMap;

/// Assembles and signs a [Proof].
pub struct ProofBuilder {
    sequence: u64,
    expiration: i64,
    master: PrivateKey,
    payout_script: Bytes,
    stakes: BTreeMap<OutPoint, (Stake, PrivateKey)>,
}

impl ProofBuilder {
    pub fn new(sequence: u64, expiration: i64, master: PrivateKey, payout_script: Bytes) -> Self {
        Self {
            sequence,
            expiration,
            master,
            payout_script,
            stakes: BTreeMap::new(),
        }
    }

    /// Add a stake signed by `key`. Returns false if the UTXO was already added.
    pub fn add_utxo(
        &mut self,
        utxo: OutPoint,
        amount: Amount,
        height: u32,
        is_coinbase: bool,
        key: PrivateKey,
    ) -> bool {
        if self.stakes.contains_key(&utxo) {
            return false;
        }
        let stake = Stake {
            utxo,
            amount,
            height,
            is_coinbase,
            pubkey: key.public_key(),
        };
        self.stakes.insert(utxo, (stake, key));
        true
    }

    /// Sign every stake, order them by stake id and sign the proof with the master key.
    pub fn build(self) -> Proof {
        let master = self.master.public_key();
        let commitment = stake_commitment(self.expiration, &master);
        let mut stakes: Vec<SignedStake> = self
            .stakes
            .into_values()
            .map(|(stake, key)| SignedStake::sign(stake, &key, &commitment))
            .collect();
        stakes.sort_by_cached_key(|signed| signed.stake.id());
        let limited_id =
            Proof::compute_limited_id(self.sequence, self.expiration, &self.payout_script, &stakes);
        let signature = self.master.sign(&limited_id);
        Proof::new(
            self.sequence,
            self.expiration,
            master,
            self.payout_script,
            stakes,
            signature,
        )
    }
}
