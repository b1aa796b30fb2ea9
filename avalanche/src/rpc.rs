//! Command surface of an avalanche node.
//!
//! Each function implements one command over a [Node] and returns a serializable result.
//! Failures carry the numeric codes clients expect:
//!
//! | code | meaning |
//! |------|---------|
//! | -1 | miscellaneous (polling not ready) |
//! | -5 | unknown block or transaction |
//! | -8 | invalid parameter |
//! | -20 | chain database refused the operation |
//! | -22 | undecodable hex or payload |
//! | -25 | verification failed |
//! | -32603 | internal error (no staking reward winner) |

use crate::{
    chain::{self, Transaction},
    delegation::Delegation,
    node::Node,
    peers::RegistrationError,
    proof::{Proof, ProofBuilder, Verification},
    types::{Amount, BlockHash, ContenderId, LimitedProofId, OutPoint, ProofId, TxId},
    wire::Inv,
};
use avalanche_codec::{DecodeExt, Encode};
use avalanche_cryptography::{PrivateKey, PublicKey, Verifier};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::SystemTime};
use thiserror::Error;

pub const RPC_MISC_ERROR: i32 = -1;
pub const RPC_INVALID_ADDRESS_OR_KEY: i32 = -5;
pub const RPC_INVALID_PARAMETER: i32 = -8;
pub const RPC_DATABASE_ERROR: i32 = -20;
pub const RPC_DESERIALIZATION_ERROR: i32 = -22;
pub const RPC_VERIFY_ERROR: i32 = -25;
pub const RPC_INTERNAL_ERROR: i32 = -32603;

/// A failed command.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize)]
#[error("{message} ({code})")]
pub struct Error {
    pub code: i32,
    pub message: String,
}

impl Error {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

fn parse<T: FromStr>(value: &str, name: &str) -> Result<T, Error> {
    value
        .parse()
        .map_err(|_| Error::new(RPC_INVALID_PARAMETER, format!("Invalid {name}: {value}")))
}

fn from_hex<T: DecodeExt>(value: &str, name: &str) -> Result<T, Error> {
    let bytes = hex::decode(value).map_err(|_| {
        Error::new(
            RPC_DESERIALIZATION_ERROR,
            format!("{name} must be an hexadecimal string"),
        )
    })?;
    T::decode(Bytes::from(bytes))
        .map_err(|err| Error::new(RPC_DESERIALIZATION_ERROR, format!("{name} has invalid format: {err}")))
}

fn to_hex(value: &impl Encode) -> String {
    hex::encode(value.encode())
}

fn chain_error(err: chain::Error) -> Error {
    match err {
        chain::Error::UnknownBlock(_) => Error::new(RPC_INVALID_ADDRESS_OR_KEY, "Block not found"),
        chain::Error::FinalizeInvalid => Error::new(RPC_DATABASE_ERROR, err.to_string()),
        err => Error::new(RPC_INVALID_PARAMETER, err.to_string()),
    }
}

fn known_block<V: Verifier>(node: &Node<V>, hash: &str) -> Result<BlockHash, Error> {
    let hash: BlockHash = parse(hash, "blockhash")?;
    if !node.chain().contains(&hash) {
        return Err(Error::new(RPC_INVALID_ADDRESS_OR_KEY, "Block not found"));
    }
    Ok(hash)
}

fn not_ready() -> Error {
    Error::new(RPC_MISC_ERROR, "Avalanche is not ready to poll yet.")
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LocalInfo {
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_status: Option<String>,
    pub proofid: String,
    pub limited_proofid: String,
    pub master: String,
    pub stake_amount: Amount,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NetworkInfo {
    pub proof_count: usize,
    pub connected_proof_count: usize,
    pub dangling_proof_count: usize,
    pub finalized_proof_count: usize,
    pub conflicting_proof_count: usize,
    pub immature_proof_count: usize,
    pub total_stake_amount: Amount,
    pub connected_stake_amount: Amount,
    pub node_count: usize,
    pub connected_node_count: usize,
    pub pending_node_count: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AvalancheInfo {
    pub ready_to_poll: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalInfo>,
    pub network: NetworkInfo,
}

/// `getavalancheinfo`
pub fn get_avalanche_info<V: Verifier>(node: &mut Node<V>) -> AvalancheInfo {
    let ready_to_poll = node.ready_to_poll();
    let peers = node.peers();
    let local = node.local_proof().map(|proof| {
        let verified = peers.is_bound(&proof.id());
        let verification_status = match node.local_proof_error() {
            _ if verified => None,
            Some(err) => Some(err.to_string()),
            None => Some("pending verification".to_string()),
        };
        LocalInfo {
            verified,
            verification_status,
            proofid: proof.id().to_string(),
            limited_proofid: proof.limited_id().to_string(),
            master: proof.master().to_string(),
            stake_amount: proof.staked_amount(),
        }
    });

    let mut network = NetworkInfo {
        proof_count: 0,
        connected_proof_count: 0,
        dangling_proof_count: peers.dangling_proof_count(),
        finalized_proof_count: 0,
        conflicting_proof_count: peers.conflicting_proof_count(),
        immature_proof_count: peers.immature_proof_count(),
        total_stake_amount: 0,
        connected_stake_amount: 0,
        node_count: peers.node_count() + peers.pending_node_count(),
        connected_node_count: peers.node_count(),
        pending_node_count: peers.pending_node_count(),
    };
    for peer in peers.peers() {
        let amount = peer.proof.staked_amount();
        network.proof_count += 1;
        network.total_stake_amount += amount;
        if peer.has_finalized {
            network.finalized_proof_count += 1;
        }
        if peer.node_count() > 0 {
            network.connected_proof_count += 1;
            network.connected_stake_amount += amount;
        }
    }
    AvalancheInfo {
        ready_to_poll,
        local,
        network,
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PeerInfo {
    pub avalanche_peerid: u32,
    pub availability_score: f64,
    pub proofid: String,
    pub proof: String,
    pub nodecount: usize,
    pub node_list: Vec<u64>,
}

/// `getavalanchepeerinfo`, optionally restricted to one proof.
pub fn get_avalanche_peer_info<V: Verifier>(
    node: &Node<V>,
    proofid: Option<&str>,
) -> Result<Vec<PeerInfo>, Error> {
    let filter: Option<ProofId> = proofid.map(|id| parse(id, "proofid")).transpose()?;
    let peers = node.peers();
    if let Some(id) = &filter {
        if !peers.is_bound(id) {
            return Err(Error::new(RPC_INVALID_PARAMETER, "Proofid not found"));
        }
    }
    Ok(peers
        .peers()
        .filter(|peer| filter.map_or(true, |id| peer.proof.id() == id))
        .map(|peer| PeerInfo {
            avalanche_peerid: peer.id,
            availability_score: peer.availability_score,
            proofid: peer.proof.id().to_string(),
            proof: to_hex(peer.proof.as_ref()),
            nodecount: peer.node_count(),
            node_list: peer.nodes.iter().copied().collect(),
        })
        .collect())
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RawProof {
    pub proof: String,
    pub immature: bool,
    #[serde(rename = "boundToPeer")]
    pub bound_to_peer: bool,
    pub conflicting: bool,
    pub finalized: bool,
}

/// `getrawavalancheproof`
pub fn get_raw_avalanche_proof<V: Verifier>(node: &Node<V>, proofid: &str) -> Result<RawProof, Error> {
    let id: ProofId = parse(proofid, "proofid")?;
    let peers = node.peers();
    let proof = peers
        .proof(&id)
        .ok_or_else(|| Error::new(RPC_INVALID_PARAMETER, "Proof not found"))?;
    Ok(RawProof {
        proof: to_hex(proof.as_ref()),
        immature: peers.is_immature(&id),
        bound_to_peer: peers.is_bound(&id),
        conflicting: peers.is_conflicting(&id),
        finalized: peers.peer_by_proof(&id).is_some_and(|peer| peer.has_finalized),
    })
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AvalancheProofs {
    pub valid: Vec<String>,
    pub conflicting: Vec<String>,
    pub immature: Vec<String>,
}

/// `getavalancheproofs`: proof ids per pool, sorted.
pub fn get_avalanche_proofs<V: Verifier>(node: &Node<V>) -> AvalancheProofs {
    let peers = node.peers();
    let mut valid: Vec<ProofId> = peers.peers().map(|peer| peer.proof.id()).collect();
    valid.sort();
    let strings = |ids: Vec<ProofId>| ids.iter().map(ToString::to_string).collect();
    AvalancheProofs {
        valid: strings(valid),
        conflicting: strings(peers.conflicting_proofs()),
        immature: strings(peers.immature_proofs()),
    }
}

/// `getavalanchekey`: the key signing our hellos and responses.
pub fn get_avalanche_key<V: Verifier>(node: &Node<V>) -> String {
    node.session_key().to_string()
}

/// `isfinalblock`
pub fn is_final_block<V: Verifier>(node: &mut Node<V>, blockhash: &str) -> Result<bool, Error> {
    let hash = known_block(node, blockhash)?;
    if node.chain().is_finalized(&hash) {
        return Ok(true);
    }
    if !node.ready_to_poll() {
        return Err(not_ready());
    }
    Ok(false)
}

/// `isfinaltransaction`, optionally looking the transaction up in a given block.
pub fn is_final_transaction<V: Verifier>(
    node: &mut Node<V>,
    txid: &str,
    blockhash: Option<&str>,
) -> Result<bool, Error> {
    let txid: TxId = parse(txid, "txid")?;
    let finalized = match blockhash {
        Some(blockhash) => {
            let hash = known_block(node, blockhash)?;
            let contained = node
                .chain()
                .block(&hash)
                .is_some_and(|block| block.transactions.iter().any(|tx| tx.id() == txid));
            if !contained {
                return Err(Error::new(
                    RPC_INVALID_ADDRESS_OR_KEY,
                    "No such transaction found in the provided block.",
                ));
            }
            node.chain().is_finalized(&hash) || node.mempool().is_finalized(&txid)
        }
        None => {
            let known = node.mempool().contains(&txid)
                || node.mempool().is_finalized(&txid)
                || node.chain().block_containing(&txid).is_some();
            if !known {
                return Err(Error::new(
                    RPC_INVALID_ADDRESS_OR_KEY,
                    "No such transaction. Use -txindex or provide a block hash.",
                ));
            }
            node.is_final_transaction(&txid)
        }
    };
    if !finalized && !node.ready_to_poll() {
        return Err(not_ready());
    }
    Ok(finalized)
}

/// `finalizeblock`
pub fn finalize_block<V: Verifier>(node: &mut Node<V>, blockhash: &str) -> Result<(), Error> {
    let hash = known_block(node, blockhash)?;
    node.finalize_block(hash).map_err(chain_error)
}

/// `invalidateblock`
pub fn invalidate_block<V: Verifier>(
    node: &mut Node<V>,
    blockhash: &str,
    now: SystemTime,
) -> Result<(), Error> {
    let hash = known_block(node, blockhash)?;
    node.invalidate_block(hash, now).map_err(chain_error)
}

/// `reconsiderblock`
pub fn reconsider_block<V: Verifier>(
    node: &mut Node<V>,
    blockhash: &str,
    now: SystemTime,
) -> Result<(), Error> {
    let hash = known_block(node, blockhash)?;
    node.reconsider_block(hash, now).map_err(chain_error)
}

/// `parkblock`
pub fn park_block<V: Verifier>(
    node: &mut Node<V>,
    blockhash: &str,
    now: SystemTime,
) -> Result<(), Error> {
    let hash = known_block(node, blockhash)?;
    node.park_block(hash, now).map_err(chain_error)
}

/// `unparkblock`
pub fn unpark_block<V: Verifier>(
    node: &mut Node<V>,
    blockhash: &str,
    now: SystemTime,
) -> Result<(), Error> {
    let hash = known_block(node, blockhash)?;
    node.unpark_block(hash, now).map_err(chain_error)
}

/// `getbestblockhash`
pub fn get_best_block_hash<V: Verifier>(node: &Node<V>) -> String {
    node.chain().tip().to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChainTipInfo {
    pub height: u32,
    pub hash: String,
    pub branchlen: u32,
    pub status: String,
}

/// `getchaintips`
pub fn get_chain_tips<V: Verifier>(node: &Node<V>) -> Vec<ChainTipInfo> {
    node.chain()
        .chain_tips()
        .into_iter()
        .map(|tip| ChainTipInfo {
            height: tip.height,
            hash: tip.hash.to_string(),
            branchlen: tip.branchlen,
            status: tip.status.as_str().to_string(),
        })
        .collect()
}

/// `getrawmempool`, in admission order.
pub fn get_raw_mempool<V: Verifier>(node: &Node<V>) -> Vec<String> {
    node.mempool()
        .txids()
        .iter()
        .map(ToString::to_string)
        .collect()
}

/// `generate`
pub fn generate<V: Verifier>(node: &mut Node<V>, count: usize, now: SystemTime) -> Vec<String> {
    node.generate(count, now)
        .iter()
        .map(ToString::to_string)
        .collect()
}

/// `sendrawtransaction`
pub fn send_raw_transaction<V: Verifier>(node: &mut Node<V>, hex: &str) -> Result<String, Error> {
    let tx: Transaction = from_hex(hex, "Transaction")?;
    node.send_transaction(tx)
        .map(|txid| txid.to_string())
        .map_err(|err| Error::new(RPC_VERIFY_ERROR, err.to_string()))
}

/// One stake of [build_avalanche_proof].
#[derive(Clone, Debug, Deserialize)]
pub struct StakeRequest {
    pub txid: String,
    pub vout: u32,
    pub amount: Amount,
    pub height: u32,
    #[serde(default)]
    pub iscoinbase: bool,
    pub privatekey: String,
}

/// `buildavalancheproof`: sign a proof and check it is well formed.
pub fn build_avalanche_proof<V: Verifier>(
    node: &Node<V>,
    sequence: u64,
    expiration: i64,
    master: &str,
    stakes: &[StakeRequest],
    payout_script: &str,
) -> Result<String, Error> {
    let master: PrivateKey = parse(master, "master key")?;
    let payout_script = hex::decode(payout_script).map_err(|_| {
        Error::new(
            RPC_INVALID_PARAMETER,
            "payoutscript must be an hexadecimal string",
        )
    })?;
    let mut builder = ProofBuilder::new(sequence, expiration, master, Bytes::from(payout_script));
    for stake in stakes {
        let txid: TxId = parse(&stake.txid, "txid")?;
        let key: PrivateKey = parse(&stake.privatekey, "private key")?;
        let utxo = OutPoint::new(txid, stake.vout);
        if !builder.add_utxo(utxo, stake.amount, stake.height, stake.iscoinbase, key) {
            return Err(Error::new(RPC_INVALID_PARAMETER, "Duplicated stake"));
        }
    }
    let proof = builder.build();
    let dust = node.config().stake_utxo_dust_threshold;
    proof
        .verify_structure(node.peers().verifier(), dust)
        .map_err(|err| Error::new(RPC_INVALID_PARAMETER, err.to_string()))?;
    Ok(to_hex(&proof))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DecodedStake {
    pub txid: String,
    pub vout: u32,
    pub amount: Amount,
    pub height: u32,
    pub iscoinbase: bool,
    pub pubkey: String,
    pub signature: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DecodedProof {
    pub sequence: u64,
    pub expiration: i64,
    pub master: String,
    pub signature: String,
    pub payoutscript: String,
    pub limitedid: String,
    pub proofid: String,
    pub staked_amount: Amount,
    pub score: u32,
    pub stakes: Vec<DecodedStake>,
}

/// `decodeavalancheproof`
pub fn decode_avalanche_proof(proof: &str) -> Result<DecodedProof, Error> {
    let proof: Proof = from_hex(proof, "Proof")?;
    let stakes = proof
        .stakes()
        .iter()
        .map(|signed| DecodedStake {
            txid: signed.stake.utxo.txid.to_string(),
            vout: signed.stake.utxo.index,
            amount: signed.stake.amount,
            height: signed.stake.height,
            iscoinbase: signed.stake.is_coinbase,
            pubkey: signed.stake.pubkey.to_string(),
            signature: signed.signature.to_string(),
        })
        .collect();
    Ok(DecodedProof {
        sequence: proof.sequence(),
        expiration: proof.expiration(),
        master: proof.master().to_string(),
        signature: proof.signature().to_string(),
        payoutscript: hex::encode(proof.payout_script()),
        limitedid: proof.limited_id().to_string(),
        proofid: proof.id().to_string(),
        staked_amount: proof.staked_amount(),
        score: proof.score(),
        stakes,
    })
}

/// `verifyavalancheproof`: check a proof against the active chain.
pub fn verify_avalanche_proof<V: Verifier>(node: &Node<V>, proof: &str) -> Result<bool, Error> {
    let proof: Proof = from_hex(proof, "Proof")?;
    let params = node.config().stake_params();
    match proof.verify(node.peers().verifier(), node.chain(), &params) {
        Verification::Valid => Ok(true),
        Verification::Immature(utxo) => Err(Error::new(
            RPC_VERIFY_ERROR,
            format!("immature-utxo: {utxo}"),
        )),
        Verification::Orphan(utxo) => Err(Error::new(
            RPC_VERIFY_ERROR,
            format!("utxo-missing-or-spent: {utxo}"),
        )),
        Verification::Invalid(err) => Err(Error::new(RPC_VERIFY_ERROR, err.to_string())),
    }
}

/// `sendavalancheproof`: register a proof and relay it.
///
/// Returns false when the proof is kept aside (immature, orphan or losing a conflict).
pub fn send_avalanche_proof<V: Verifier>(
    node: &mut Node<V>,
    proof: &str,
    now: SystemTime,
) -> Result<bool, Error> {
    let proof: Proof = from_hex(proof, "Proof")?;
    match node.register_proof(proof.into(), now) {
        Ok(_) => Ok(true),
        Err(
            RegistrationError::Immature
            | RegistrationError::Orphan
            | RegistrationError::Conflicting
            | RegistrationError::CooldownNotElapsed,
        ) => Ok(false),
        Err(RegistrationError::Invalid(err)) => Err(Error::new(
            RPC_INVALID_PARAMETER,
            format!("The proof is invalid: {err}"),
        )),
        Err(err) => Err(Error::new(RPC_INVALID_PARAMETER, err.to_string())),
    }
}

/// `delegateavalancheproof`: delegate from `privatekey` to `pubkey`, starting a new
/// delegation or extending `delegation`.
pub fn delegate_avalanche_proof(
    limited_proofid: &str,
    privatekey: &str,
    pubkey: &str,
    delegation: Option<&str>,
) -> Result<String, Error> {
    let limited: LimitedProofId = parse(limited_proofid, "limitedproofid")?;
    let key: PrivateKey = parse(privatekey, "private key")?;
    let pubkey: PublicKey = parse(pubkey, "public key")?;
    let base = match delegation {
        Some(delegation) => {
            let delegation: Delegation = from_hex(delegation, "Delegation")?;
            if delegation.limited_proof_id() != limited {
                return Err(Error::new(
                    RPC_INVALID_PARAMETER,
                    "The delegation does not match the proof",
                ));
            }
            delegation
        }
        None => Delegation::from_parts(limited, key.public_key()),
    };
    let delegated = base.delegate(&key, pubkey).map_err(|_| {
        Error::new(
            RPC_INVALID_PARAMETER,
            "The private key does not match the delegation",
        )
    })?;
    Ok(to_hex(&delegated))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StakingRewardWinner {
    pub proofid: String,
    pub hex: String,
}

fn staking_rewards_enabled<V: Verifier>(node: &Node<V>) -> Result<(), Error> {
    if !node.config().staking_rewards {
        return Err(Error::new(RPC_INTERNAL_ERROR, "Staking rewards are not activated"));
    }
    Ok(())
}

/// `getstakingreward`: winners of the staking reward of the block after `blockhash`,
/// recomputing them when asked to.
pub fn get_staking_reward<V: Verifier>(
    node: &mut Node<V>,
    blockhash: &str,
    recompute: bool,
    now: SystemTime,
) -> Result<Vec<StakingRewardWinner>, Error> {
    staking_rewards_enabled(node)?;
    let hash = known_block(node, blockhash)?;
    if recompute {
        node.recompute_staking_reward(hash, now);
    }
    let reward = node.staking_reward(&hash).ok_or_else(|| {
        Error::new(
            RPC_INTERNAL_ERROR,
            format!("Unable to determine a staking reward winner for block {hash}"),
        )
    })?;
    Ok(reward
        .winners
        .iter()
        .map(|winner| StakingRewardWinner {
            proofid: winner.proof.to_string(),
            hex: hex::encode(&winner.payout),
        })
        .collect())
}

/// `setstakingreward`: force the staking reward winner of the block after `blockhash`, or add
/// one when `append` is set.
pub fn set_staking_reward<V: Verifier>(
    node: &mut Node<V>,
    blockhash: &str,
    payoutscript: &str,
    append: bool,
) -> Result<bool, Error> {
    staking_rewards_enabled(node)?;
    let hash = known_block(node, blockhash)?;
    let payout = hex::decode(payoutscript).map_err(|_| {
        Error::new(
            RPC_DESERIALIZATION_ERROR,
            "payoutscript must be an hexadecimal string",
        )
    })?;
    let mut payouts: Vec<Bytes> = match (append, node.staking_reward(&hash)) {
        (true, Some(reward)) => reward
            .winners
            .iter()
            .map(|winner| winner.payout.clone())
            .collect(),
        _ => Vec::new(),
    };
    payouts.push(Bytes::from(payout));
    node.set_staking_reward(hash, payouts).map_err(chain_error)
}

/// `getstakecontendervote`: our vote on the contender of `proofid` for the block after
/// `prevblockhash`.
pub fn get_stake_contender_vote<V: Verifier>(
    node: &Node<V>,
    prevblockhash: &str,
    proofid: &str,
) -> Result<i32, Error> {
    let prev: BlockHash = parse(prevblockhash, "prevblockhash")?;
    let proof: ProofId = parse(proofid, "proofid")?;
    Ok(node.local_vote(&Inv::contender(ContenderId::new(&prev, &proof))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mocks::{self, STAKE_AMOUNT},
        processor::Config,
    };
    use avalanche_cryptography::{hash, Ed25519};
    use serde_json::json;
    use std::time::{Duration, UNIX_EPOCH};

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    struct Setup {
        node: Node<Ed25519>,
        stakers: Vec<PrivateKey>,
        utxos: Vec<OutPoint>,
    }

    fn setup() -> Setup {
        let stakers = mocks::keys(100, 2);
        let (genesis, utxos) = mocks::genesis(&stakers, STAKE_AMOUNT);
        Setup {
            node: mocks::node(mocks::node_config(), genesis),
            stakers,
            utxos,
        }
    }

    impl Setup {
        fn stake(&self, i: usize) -> StakeRequest {
            serde_json::from_value(json!({
                "txid": self.utxos[i].txid.to_string(),
                "vout": self.utxos[i].index,
                "amount": STAKE_AMOUNT,
                "height": 0,
                "iscoinbase": true,
                "privatekey": self.stakers[i].to_hex(),
            }))
            .unwrap()
        }

        fn build(&self, sequence: u64, stakes: &[usize]) -> Result<String, Error> {
            let stakes: Vec<StakeRequest> = stakes.iter().map(|i| self.stake(*i)).collect();
            let master = PrivateKey::from_seed(7).to_hex();
            build_avalanche_proof(&self.node, sequence, 0, &master, &stakes, "")
        }
    }

    #[test]
    fn test_build_decode_verify_send() {
        let mut s = setup();
        let proof = s.build(3, &[0]).unwrap();

        let decoded = decode_avalanche_proof(&proof).unwrap();
        assert_eq!(decoded.sequence, 3);
        assert_eq!(decoded.stakes.len(), 1);
        assert_eq!(decoded.staked_amount, STAKE_AMOUNT);
        assert_eq!(decoded.master, PrivateKey::from_seed(7).public_key().to_string());

        assert_eq!(verify_avalanche_proof(&s.node, &proof), Ok(true));
        assert_eq!(send_avalanche_proof(&mut s.node, &proof, at(1)), Ok(true));

        let proofs = get_avalanche_proofs(&s.node);
        assert_eq!(proofs.valid, vec![decoded.proofid.clone()]);
        assert!(proofs.conflicting.is_empty());

        let raw = get_raw_avalanche_proof(&s.node, &decoded.proofid).unwrap();
        assert!(raw.bound_to_peer);
        assert!(!raw.finalized);
        assert_eq!(raw.proof, proof);
        let value = serde_json::to_value(&raw).unwrap();
        assert_eq!(value["boundToPeer"], json!(true));
    }

    #[test]
    fn test_conflicting_proof_reported() {
        let mut s = setup();
        let low = s.build(1, &[0]).unwrap();
        let high = s.build(2, &[0]).unwrap();
        assert_eq!(send_avalanche_proof(&mut s.node, &high, at(1)), Ok(true));
        assert_eq!(send_avalanche_proof(&mut s.node, &low, at(100)), Ok(false));
        let proofs = get_avalanche_proofs(&s.node);
        assert_eq!(proofs.valid, vec![decode_avalanche_proof(&high).unwrap().proofid]);
        assert_eq!(
            proofs.conflicting,
            vec![decode_avalanche_proof(&low).unwrap().proofid]
        );
    }

    #[test]
    fn test_build_rejections() {
        let s = setup();
        let err = s.build(0, &[0, 0]).unwrap_err();
        assert_eq!(err, Error::new(RPC_INVALID_PARAMETER, "Duplicated stake"));
        assert_eq!(s.build(0, &[]).unwrap_err().code, RPC_INVALID_PARAMETER);

        let mut stake = s.stake(0);
        stake.amount = STAKE_AMOUNT - 1;
        let master = PrivateKey::from_seed(7).to_hex();
        let err = build_avalanche_proof(&s.node, 0, 0, &master, &[stake], "").unwrap_err();
        assert_eq!(err.code, RPC_INVALID_PARAMETER);

        let err = build_avalanche_proof(&s.node, 0, 0, "zz", &[], "").unwrap_err();
        assert_eq!(err.code, RPC_INVALID_PARAMETER);
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(
            decode_avalanche_proof("not hex").unwrap_err().code,
            RPC_DESERIALIZATION_ERROR
        );
        assert_eq!(
            decode_avalanche_proof("00").unwrap_err().code,
            RPC_DESERIALIZATION_ERROR
        );
    }

    #[test]
    fn test_verify_reports_missing_utxo() {
        let s = setup();
        let mut stake = s.stake(0);
        stake.txid = TxId(hash(b"elsewhere")).to_string();
        let master = PrivateKey::from_seed(7).to_hex();
        let proof = build_avalanche_proof(&s.node, 0, 0, &master, &[stake], "").unwrap();
        let err = verify_avalanche_proof(&s.node, &proof).unwrap_err();
        assert_eq!(err.code, RPC_VERIFY_ERROR);
        assert!(err.message.starts_with("utxo-missing-or-spent"));
    }

    #[test]
    fn test_is_final_block() {
        let mut s = setup();
        let unknown = BlockHash(hash(b"unknown")).to_string();
        assert_eq!(
            is_final_block(&mut s.node, &unknown).unwrap_err().code,
            RPC_INVALID_ADDRESS_OR_KEY
        );
        let hashes = generate(&mut s.node, 2, at(1));
        assert_eq!(is_final_block(&mut s.node, &hashes[0]), Err(not_ready()));

        finalize_block(&mut s.node, &hashes[0]).unwrap();
        assert_eq!(is_final_block(&mut s.node, &hashes[0]), Ok(true));
        let best = get_best_block_hash(&s.node);
        assert_eq!(is_final_block(&mut s.node, &best), Err(not_ready()));
    }

    #[test]
    fn test_finalize_invalid_block() {
        let mut s = setup();
        let hashes = generate(&mut s.node, 1, at(1));
        invalidate_block(&mut s.node, &hashes[0], at(2)).unwrap();
        assert_eq!(
            finalize_block(&mut s.node, &hashes[0]),
            Err(Error::new(RPC_DATABASE_ERROR, "finalize-invalid-block"))
        );
    }

    #[test]
    fn test_is_final_transaction() {
        let mut s = setup();
        let hashes = generate(&mut s.node, 1, at(1));
        let block: BlockHash = hashes[0].parse().unwrap();
        let coinbase = s.node.chain().block(&block).unwrap().transactions[0].id().to_string();

        assert_eq!(
            is_final_transaction(&mut s.node, &coinbase, None),
            Err(not_ready())
        );
        let genesis = s.node.chain().genesis().to_string();
        assert_eq!(
            is_final_transaction(&mut s.node, &coinbase, Some(&genesis))
                .unwrap_err()
                .code,
            RPC_INVALID_ADDRESS_OR_KEY
        );
        finalize_block(&mut s.node, &hashes[0]).unwrap();
        assert_eq!(
            is_final_transaction(&mut s.node, &coinbase, Some(&hashes[0])),
            Ok(true)
        );
        let unknown = TxId(hash(b"unknown")).to_string();
        assert_eq!(
            is_final_transaction(&mut s.node, &unknown, None)
                .unwrap_err()
                .code,
            RPC_INVALID_ADDRESS_OR_KEY
        );
    }

    #[test]
    fn test_delegate() {
        let master = PrivateKey::from_seed(7);
        let first = PrivateKey::from_seed(8);
        let second = PrivateKey::from_seed(9);
        let limited = LimitedProofId(hash(b"limited")).to_string();

        let delegation = delegate_avalanche_proof(
            &limited,
            &master.to_hex(),
            &first.public_key().to_string(),
            None,
        )
        .unwrap();
        let extended = delegate_avalanche_proof(
            &limited,
            &first.to_hex(),
            &second.public_key().to_string(),
            Some(&delegation),
        )
        .unwrap();
        let decoded: Delegation = from_hex(&extended, "Delegation").unwrap();
        assert_eq!(decoded.levels().len(), 2);
        assert_eq!(decoded.delegated_pubkey(), &second.public_key());
        assert_eq!(decoded.verify(&Ed25519), Ok(second.public_key()));

        // Only the last delegated key may extend the chain.
        let err = delegate_avalanche_proof(
            &limited,
            &master.to_hex(),
            &second.public_key().to_string(),
            Some(&delegation),
        )
        .unwrap_err();
        assert_eq!(err.code, RPC_INVALID_PARAMETER);

        let other = LimitedProofId(hash(b"other")).to_string();
        let err = delegate_avalanche_proof(
            &other,
            &first.to_hex(),
            &second.public_key().to_string(),
            Some(&delegation),
        )
        .unwrap_err();
        assert_eq!(err.code, RPC_INVALID_PARAMETER);
    }

    #[test]
    fn test_info_without_local_proof() {
        let mut s = setup();
        let proof = s.build(0, &[1]).unwrap();
        send_avalanche_proof(&mut s.node, &proof, at(1)).unwrap();
        let info = get_avalanche_info(&mut s.node);
        assert!(!info.ready_to_poll);
        assert!(info.local.is_none());
        assert_eq!(info.network.proof_count, 1);
        assert_eq!(info.network.connected_proof_count, 0);
        assert_eq!(info.network.total_stake_amount, STAKE_AMOUNT);

        let value = serde_json::to_value(&info).unwrap();
        assert!(value.get("local").is_none());
        assert_eq!(value["network"]["finalized_proof_count"], json!(0));
    }

    #[test]
    fn test_peer_info_filter() {
        let mut s = setup();
        let proof = s.build(0, &[0]).unwrap();
        send_avalanche_proof(&mut s.node, &proof, at(1)).unwrap();
        let id = decode_avalanche_proof(&proof).unwrap().proofid;
        let peers = get_avalanche_peer_info(&s.node, Some(&id)).unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].nodecount, 0);
        assert_eq!(peers[0].proof, proof);

        let unknown = ProofId(hash(b"unknown")).to_string();
        assert_eq!(
            get_avalanche_peer_info(&s.node, Some(&unknown))
                .unwrap_err()
                .code,
            RPC_INVALID_PARAMETER
        );
    }

    #[test]
    fn test_staking_reward() {
        let s = setup();
        let mut node = s.node;
        let genesis = node.chain().tip().to_string();
        assert_eq!(
            get_staking_reward(&mut node, &genesis, false, at(1)),
            Err(Error::new(RPC_INTERNAL_ERROR, "Staking rewards are not activated"))
        );

        let (block, _) = mocks::genesis(&s.stakers, STAKE_AMOUNT);
        let cfg = Config {
            staking_rewards: true,
            ..mocks::node_config()
        };
        let mut node = mocks::node(cfg, block);

        // No quorum, no winner.
        let err = get_staking_reward(&mut node, &genesis, false, at(1)).unwrap_err();
        assert_eq!(err.code, RPC_INTERNAL_ERROR);

        let payouts = |node: &mut Node<Ed25519>| -> Vec<String> {
            get_staking_reward(node, &genesis, false, at(1))
                .unwrap()
                .into_iter()
                .map(|winner| winner.hex)
                .collect()
        };
        assert_eq!(set_staking_reward(&mut node, &genesis, "51", false), Ok(true));
        let winners = get_staking_reward(&mut node, &genesis, false, at(1)).unwrap();
        assert_eq!(
            winners,
            vec![StakingRewardWinner {
                proofid: ProofId::default().to_string(),
                hex: "51".to_string(),
            }]
        );
        assert_eq!(set_staking_reward(&mut node, &genesis, "52", true), Ok(true));
        assert_eq!(payouts(&mut node), vec!["51", "52"]);
        assert_eq!(set_staking_reward(&mut node, &genesis, "53", false), Ok(true));
        assert_eq!(payouts(&mut node), vec!["53"]);

        // Recomputing drops the forced winners from the reward.
        let err = get_staking_reward(&mut node, &genesis, true, at(1)).unwrap_err();
        assert_eq!(err.code, RPC_INTERNAL_ERROR);

        let unknown = BlockHash(hash(b"unknown")).to_string();
        assert_eq!(
            set_staking_reward(&mut node, &unknown, "51", false)
                .unwrap_err()
                .code,
            RPC_INVALID_ADDRESS_OR_KEY
        );
        assert_eq!(
            set_staking_reward(&mut node, &genesis, "zz", false)
                .unwrap_err()
                .code,
            RPC_DESERIALIZATION_ERROR
        );
    }

    #[test]
    fn test_stake_contender_vote() {
        let s = setup();
        let genesis = s.node.chain().tip().to_string();
        let proof = ProofId(hash(b"proof")).to_string();
        assert_eq!(get_stake_contender_vote(&s.node, &genesis, &proof), Ok(-1));
        assert_eq!(
            get_stake_contender_vote(&s.node, &genesis, "nope")
                .unwrap_err()
                .code,
            RPC_INVALID_PARAMETER
        );
    }
}
