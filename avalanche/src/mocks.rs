//! Chain, proof and voter fixtures for tests.

use crate::{
    chain::{Block, Chainstate, Transaction, TxOut},
    delegation::Delegation,
    node::{Action, Node},
    processor::{Config, Misbehavior},
    proof::{Proof, ProofBuilder, StakeParams},
    types::{Amount, BlockHash, NodeId, OutPoint, COIN},
    wire::{Hello, Inv, Message, Poll, Response, Vote},
};
use avalanche_cryptography::{Ed25519, PrivateKey};
use bytes::Bytes;
use prometheus_client::registry::Registry;
use rand::{rngs::StdRng, SeedableRng};
use std::{sync::Arc, time::SystemTime};

/// Nonce the node under test uses on every connection.
pub const NODE_NONCE: u64 = 0;

/// Amount of every genesis stake (also the dust threshold of [stake_params]).
pub const STAKE_AMOUNT: Amount = 100_000_000 * COIN;

/// Timestamp of the genesis block.
pub const GENESIS_TIME: u64 = 1_700_000_000;

/// `count` keys derived from consecutive seeds.
pub fn keys(first_seed: u64, count: usize) -> Vec<PrivateKey> {
    (first_seed..first_seed + count as u64)
        .map(PrivateKey::from_seed)
        .collect()
}

pub fn stake_params(confirmations: u32) -> StakeParams {
    StakeParams {
        dust_threshold: STAKE_AMOUNT,
        confirmations,
    }
}

/// A genesis block paying `amount` to each staker, in order.
pub fn genesis(stakers: &[PrivateKey], amount: Amount) -> (Block, Vec<OutPoint>) {
    let outputs = stakers
        .iter()
        .map(|key| TxOut {
            amount,
            owner: key.public_key(),
        })
        .collect();
    let coinbase = Transaction::coinbase(0, outputs);
    let utxos = (0..stakers.len() as u32)
        .map(|i| OutPoint::new(coinbase.id(), i))
        .collect();
    let block = Block::new(BlockHash::default(), 0, GENESIS_TIME, 1, 0, vec![coinbase]);
    (block, utxos)
}

/// A chain of `height` blocks on top of [genesis].
pub fn chain(stakers: &[PrivateKey], amount: Amount, height: u32) -> (Chainstate, Vec<OutPoint>) {
    let (genesis, utxos) = genesis(stakers, amount);
    let mut chain = Chainstate::new(genesis, None);
    mine(&mut chain, height);
    (chain, utxos)
}

/// A block on top of `parent` whose coinbase pays nothing useful. `nonce` separates siblings.
pub fn next_block(
    chain: &Chainstate,
    parent: &BlockHash,
    work: u64,
    nonce: u64,
    txs: Vec<Transaction>,
) -> Block {
    let height = chain
        .block(parent)
        .map_or(0, |block| block.height() + 1);
    let coinbase = Transaction::coinbase(
        height,
        vec![TxOut {
            amount: 1,
            owner: PrivateKey::from_seed(nonce).public_key(),
        }],
    );
    let mut transactions = vec![coinbase];
    transactions.extend(txs);
    Block::new(
        *parent,
        height,
        GENESIS_TIME + height as u64,
        work,
        nonce,
        transactions,
    )
}

/// Extend the active tip by `count` empty blocks.
pub fn mine(chain: &mut Chainstate, count: u32) -> Vec<BlockHash> {
    (0..count)
        .map(|_| {
            let block = next_block(chain, &chain.tip(), 1, 0, Vec::new());
            chain.submit_block(block).expect("mined block")
        })
        .collect()
}

/// Extend the active tip with a block containing `txs`.
pub fn mine_with(chain: &mut Chainstate, txs: Vec<Transaction>) -> BlockHash {
    let block = next_block(chain, &chain.tip(), 1, 0, txs);
    chain.submit_block(block).expect("mined block")
}

/// A block on the active tip whose coinbase pays `amount` to `key`, and the new output.
pub fn funding_block(chain: &Chainstate, key: &PrivateKey, amount: Amount) -> (Block, OutPoint) {
    let height = chain.height() + 1;
    let coinbase = Transaction::coinbase(
        height,
        vec![TxOut {
            amount,
            owner: key.public_key(),
        }],
    );
    let outpoint = OutPoint::new(coinbase.id(), 0);
    let block = Block::new(
        chain.tip(),
        height,
        GENESIS_TIME + height as u64,
        1,
        0,
        vec![coinbase],
    );
    (block, outpoint)
}

/// A transaction moving `amount` from `utxo` to `to`.
pub fn spend(utxo: OutPoint, amount: Amount, to: &PrivateKey) -> Transaction {
    Transaction {
        inputs: vec![utxo],
        outputs: vec![TxOut {
            amount,
            owner: to.public_key(),
        }],
        lock_time: 0,
    }
}

/// A proof staking coinbase outputs created at `height`.
pub fn proof_at(
    master: &PrivateKey,
    sequence: u64,
    stakes: &[(OutPoint, &PrivateKey, u32)],
    amount: Amount,
) -> Arc<Proof> {
    let mut builder = ProofBuilder::new(sequence, 0, master.clone(), Bytes::new());
    for (utxo, key, height) in stakes {
        builder.add_utxo(*utxo, amount, *height, true, (*key).clone());
    }
    Arc::new(builder.build())
}

/// A proof staking genesis outputs.
pub fn proof(
    master: &PrivateKey,
    sequence: u64,
    stakes: &[(OutPoint, &PrivateKey)],
    amount: Amount,
) -> Arc<Proof> {
    let stakes: Vec<_> = stakes.iter().map(|(utxo, key)| (*utxo, *key, 0)).collect();
    proof_at(master, sequence, &stakes, amount)
}

/// A remote node backed by a genesis stake, answering polls as told.
///
/// Its node id doubles as its connection nonce.
pub struct Voter {
    pub node: NodeId,
    pub key: PrivateKey,
    pub proof: Arc<Proof>,
}

impl Voter {
    /// Hello addressed to a receiver using `receiver_nonce`.
    pub fn hello(&self, receiver_nonce: u64) -> Message {
        let delegation = Delegation::from_proof(&self.proof);
        Message::Hello(Hello::sign(delegation, &self.key, self.node, receiver_nonce))
    }

    /// Signed response to `poll`, voting `vote(inv)` on each item.
    pub fn respond(&self, poll: &Poll, vote: impl Fn(&Inv) -> i32) -> Message {
        let votes = poll
            .invs
            .iter()
            .map(|inv| Vote {
                code: vote(inv),
                hash: inv.hash,
            })
            .collect();
        let response = Response {
            round: poll.round,
            cooldown: 0,
            votes,
        };
        Message::Response(response.sign(&self.key))
    }
}

/// A genesis block funding `count` voters, ids starting at 1.
pub fn voters(count: usize) -> (Block, Vec<Voter>) {
    let stakers = keys(100, count);
    let (genesis, utxos) = genesis(&stakers, STAKE_AMOUNT);
    let voters = stakers
        .iter()
        .zip(utxos)
        .enumerate()
        .map(|(i, (staker, utxo))| {
            let key = PrivateKey::from_seed(1_000 + i as u64);
            let proof = proof(&key, 0, &[(utxo, staker)], STAKE_AMOUNT);
            Voter {
                node: i as NodeId + 1,
                key,
                proof,
            }
        })
        .collect();
    (genesis, voters)
}

/// Node configuration accepting the genesis stakes of [voters].
pub fn node_config() -> Config {
    Config {
        stake_utxo_dust_threshold: STAKE_AMOUNT,
        stake_utxo_confirmations: 1,
        ..Config::default()
    }
}

/// A node on top of `genesis`.
pub fn node(cfg: Config, genesis: Block) -> Node<Ed25519> {
    Node::new(
        cfg,
        genesis,
        Ed25519,
        &mut Registry::default(),
        StdRng::seed_from_u64(0),
    )
    .expect("valid config")
}

/// Connect every voter: hello first, then its proof.
pub fn join(node: &mut Node<Ed25519>, voters: &[Voter], now: SystemTime) {
    for voter in voters {
        node.connect(voter.node, NODE_NONCE, voter.node);
        node.handle(voter.node, voter.hello(NODE_NONCE), now);
        node.handle(
            voter.node,
            Message::AvaProofs(vec![voter.proof.as_ref().clone()]),
            now,
        );
    }
}

/// Tick the node and have the voters answer every poll with `vote(voter, inv)`.
///
/// Returns the items polled, in poll order, and the punishments issued.
pub fn poll_round(
    node: &mut Node<Ed25519>,
    voters: &[Voter],
    now: SystemTime,
    vote: impl Fn(&Voter, &Inv) -> i32,
) -> (Vec<Inv>, Vec<Misbehavior>) {
    node.tick(now);
    let mut polled = Vec::new();
    let mut punished = Vec::new();
    for action in node.take_actions() {
        match action {
            Action::Send {
                node: id,
                message: Message::Poll(poll),
            } => {
                let Some(voter) = voters.iter().find(|voter| voter.node == id) else {
                    continue;
                };
                polled.extend(poll.invs.iter().copied());
                node.handle(id, voter.respond(&poll, |inv| vote(voter, inv)), now);
            }
            Action::Punish { misbehavior, .. } => punished.push(misbehavior),
            Action::Send { .. } => {}
        }
    }
    for action in node.take_actions() {
        if let Action::Punish { misbehavior, .. } = action {
            punished.push(misbehavior);
        }
    }
    (polled, punished)
}
