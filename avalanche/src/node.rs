//! A full avalanche participant.
//!
//! [Node] owns the chain, the mempool, the peer registry and the poll bookkeeping, and wires
//! them together: it answers polls with its local view, folds responses into vote records and
//! hands every outcome to the owner of the item. It performs no I/O. Handlers queue [Action]s
//! that the caller drains with [Node::take_actions], and every handler takes the current time
//! so the whole node can be driven by a fake clock.
//!
//! While the quorum is not established the node also asks its connections for the addresses of
//! available avalanche nodes (`getavaaddr`), at most once per [GETAVAADDR_INTERVAL].

use crate::{
    chain::{self, Block, Chainstate, CoinView, Transaction, TxOut, BLOCK_SUBSIDY},
    contenders::{rank_priority, Contenders, Reward, Winner},
    delegation::Delegation,
    mempool::{self, Mempool},
    peers::{Peer, PeerManager, RegistrationError, RegistrationMode},
    persist,
    processor::{Config, ConfigError, Misbehavior, Processor, Update, VoteItem},
    proof::Proof,
    quorum::{Quorum, Snapshot},
    types::{BlockHash, NodeId, PeerId, ProofId, TxId},
    vote::{ItemKind, TxVote, VoteCode},
    voting::VoteStatus,
    wire::{
        Hello, Inv, Message, Poll, Response, SignedResponse, Vote, MAX_ADDR_TO_SEND, MAX_AVAPROOFS,
    },
};
use avalanche_codec::DecodeExt;
use avalanche_cryptography::{PrivateKey, PublicKey, Verifier};
use bytes::Bytes;
use prometheus_client::registry::Registry;
use rand::rngs::StdRng;
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    path::Path,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::{debug, info, trace, warn};

/// Minimum delay between two `getavaaddr` requests, sent or answered, per connection.
pub const GETAVAADDR_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// Maximum number of addresses remembered from `avaaddr` messages.
pub const MAX_KNOWN_ADDRESSES: usize = 10 * MAX_ADDR_TO_SEND;

/// Something the caller must do on behalf of the node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Deliver a message to a connected node.
    Send { node: NodeId, message: Message },
    /// A node broke the protocol.
    Punish {
        node: NodeId,
        misbehavior: Misbehavior,
    },
}

struct Connection {
    local_nonce: u64,
    remote_nonce: u64,
    /// Key proven by the node's hello.
    session: Option<PublicKey>,
    /// When the node last asked for our addresses.
    last_addr_request: Option<SystemTime>,
}

struct Local {
    proof: Arc<Proof>,
    delegation: Delegation,
    attempted: bool,
    error: Option<RegistrationError>,
}

/// Read-only view over the owners of votable items.
struct Items<'a, V: Verifier> {
    chain: &'a Chainstate,
    mempool: &'a Mempool,
    peers: &'a PeerManager<V>,
    contenders: &'a Contenders,
    invalidated: &'a HashSet<BlockHash>,
    preconsensus: bool,
    staking_preconsensus: bool,
}

impl<V: Verifier> Items<'_, V> {
    fn is_worth_polling(&self, item: &VoteItem) -> bool {
        match item {
            VoteItem::Block(hash) => {
                !self.invalidated.contains(hash) && self.chain.is_worth_polling(hash)
            }
            VoteItem::Tx(txid) => self.preconsensus && self.mempool.is_worth_polling(txid),
            VoteItem::Proof(id) => self.peers.is_worth_polling(id),
            VoteItem::Contender(id) => {
                self.staking_preconsensus && self.contenders.is_worth_polling(id)
            }
        }
    }

    fn local_vote(&self, inv: &Inv) -> i32 {
        match VoteItem::from_inv(inv) {
            VoteItem::Block(hash) => self.chain.local_vote(&hash).code(),
            VoteItem::Tx(txid) if self.preconsensus => self.mempool.local_vote(&txid).code(),
            VoteItem::Tx(_) => TxVote::Unknown.code(),
            VoteItem::Proof(id) => self.peers.local_vote(&id).code(),
            VoteItem::Contender(id) => self.contenders.local_vote(&id).code(),
        }
    }
}

fn apply<K: ItemKind>(owner: &mut K, id: &K::Id, status: VoteStatus) {
    match status {
        VoteStatus::Accepted => owner.on_accepted(id),
        VoteStatus::Rejected => owner.on_rejected(id),
        VoteStatus::Finalized => owner.on_finalized(id),
        VoteStatus::Invalid => owner.on_invalidated(id),
        VoteStatus::Stale => owner.on_stale(id),
    }
}

/// Chain, mempool, peers and polls of one node.
pub struct Node<V: Verifier> {
    cfg: Config,
    chain: Chainstate,
    mempool: Mempool,
    peers: PeerManager<V>,
    processor: Processor,
    quorum: Quorum,
    contenders: Contenders,

    local: Option<Local>,
    session: PrivateKey,
    connections: BTreeMap<NodeId, Connection>,

    /// Blocks invalidated by avalanche, never polled again.
    invalidated: HashSet<BlockHash>,

    /// Nodes learned from `avaaddr` messages.
    addresses: BTreeSet<NodeId>,
    last_addr_broadcast: Option<SystemTime>,

    actions: Vec<Action>,
    rng: StdRng,
}

impl<V: Verifier> Node<V> {
    /// Create a node from a validated configuration and a genesis block.
    pub fn new(
        cfg: Config,
        genesis: Block,
        verifier: V,
        registry: &mut Registry,
        mut rng: StdRng,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let (local, session) = match (&cfg.proof, &cfg.delegation) {
            (Some(proof), delegation) => {
                let session = match delegation {
                    Some(_) => cfg.session_key.clone(),
                    None => cfg.master_key.clone(),
                }
                .ok_or(ConfigError::MissingMasterKey)?;
                let delegation = delegation
                    .clone()
                    .unwrap_or_else(|| Delegation::from_proof(proof));
                let local = Local {
                    proof: Arc::new(proof.clone()),
                    delegation,
                    attempted: false,
                    error: None,
                };
                (Some(local), session)
            }
            (None, _) => {
                let session = cfg
                    .session_key
                    .clone()
                    .unwrap_or_else(|| PrivateKey::from_rng(&mut rng));
                (None, session)
            }
        };

        let chain = Chainstate::new(genesis, cfg.park_deep_reorg_depth);
        let peers = PeerManager::new(cfg.peers(), verifier);
        let processor = Processor::new(&cfg, registry);
        let quorum = Quorum::new(cfg.quorum());
        Ok(Self {
            cfg,
            chain,
            mempool: Mempool::new(),
            peers,
            processor,
            quorum,
            contenders: Contenders::new(),
            local,
            session,
            connections: BTreeMap::new(),
            invalidated: HashSet::new(),
            addresses: BTreeSet::new(),
            last_addr_broadcast: None,
            actions: Vec::new(),
            rng,
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn chain(&self) -> &Chainstate {
        &self.chain
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    pub fn peers(&self) -> &PeerManager<V> {
        &self.peers
    }

    pub fn processor(&self) -> &Processor {
        &self.processor
    }

    pub fn contenders(&self) -> &Contenders {
        &self.contenders
    }

    /// Addresses of avalanche nodes learned from the network.
    pub fn known_addresses(&self) -> &BTreeSet<NodeId> {
        &self.addresses
    }

    /// Key signing our hellos and responses.
    pub fn session_key(&self) -> PublicKey {
        self.session.public_key()
    }

    pub fn local_proof(&self) -> Option<&Arc<Proof>> {
        self.local.as_ref().map(|local| &local.proof)
    }

    /// Why the local proof is not bound, if it is not.
    pub fn local_proof_error(&self) -> Option<&RegistrationError> {
        self.local.as_ref().and_then(|local| local.error.as_ref())
    }

    pub fn connected_nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.connections.keys()
    }

    /// Drain the actions queued by previous calls.
    pub fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    /// Whether the quorum is established and enough nodes are attached to poll.
    pub fn ready_to_poll(&mut self) -> bool {
        let local = self.local.as_ref().map(|local| local.proof.as_ref());
        let snapshot = Snapshot::new(&self.peers, local);
        let ready = self.quorum.ready_to_poll(&snapshot);
        self.processor
            .metrics()
            .quorum
            .set(self.quorum.is_latched() as i64);
        ready
    }

    pub fn avaproofs_node_count(&self) -> usize {
        self.quorum.avaproofs_node_count()
    }

    fn items(&self) -> Items<'_, V> {
        Items {
            chain: &self.chain,
            mempool: &self.mempool,
            peers: &self.peers,
            contenders: &self.contenders,
            invalidated: &self.invalidated,
            preconsensus: self.cfg.preconsensus,
            staking_preconsensus: self.cfg.staking_preconsensus,
        }
    }

    /// Whether the network should still be asked about `item`.
    pub fn is_worth_polling(&self, item: &VoteItem) -> bool {
        self.items().is_worth_polling(item)
    }

    /// Our vote on `inv`, as sent in responses.
    pub fn local_vote(&self, inv: &Inv) -> i32 {
        self.items().local_vote(inv)
    }

    fn send(&mut self, node: NodeId, message: Message) {
        trace!(node, command = message.command(), "queueing message");
        self.actions.push(Action::Send { node, message });
    }

    fn punish(&mut self, node: NodeId, misbehavior: Misbehavior) {
        warn!(
            node,
            reason = misbehavior.reason,
            score = misbehavior.score,
            "node misbehaving"
        );
        self.processor.metrics().misbehaviors.inc();
        self.actions.push(Action::Punish { node, misbehavior });
    }

    /// Start talking to `node`. Nonces identify both ends of the connection in hellos.
    pub fn connect(&mut self, node: NodeId, local_nonce: u64, remote_nonce: u64) {
        self.connections.insert(
            node,
            Connection {
                local_nonce,
                remote_nonce,
                session: None,
                last_addr_request: None,
            },
        );
        if let Some(local) = &self.local {
            let hello = Hello::sign(
                local.delegation.clone(),
                &self.session,
                local_nonce,
                remote_nonce,
            );
            self.send(node, Message::Hello(hello));
        }
        self.send(node, Message::GetAvaProofs);
        debug!(node, "connected");
    }

    pub fn disconnect(&mut self, node: NodeId) {
        if self.connections.remove(&node).is_some() {
            self.peers.remove_node(node);
            debug!(node, "disconnected");
        }
    }

    /// Decode and handle a message from `node`.
    pub fn handle_bytes(&mut self, node: NodeId, bytes: Bytes, now: SystemTime) {
        match Message::decode(bytes) {
            Ok(message) => self.handle(node, message, now),
            Err(err) => {
                debug!(node, ?err, "undecodable message");
                self.punish(node, Misbehavior::MALFORMED);
            }
        }
    }

    /// Handle a message from `node`.
    pub fn handle(&mut self, node: NodeId, message: Message, now: SystemTime) {
        if !self.connections.contains_key(&node) {
            debug!(node, command = message.command(), "message from unknown node");
            return;
        }
        self.peers.observe(now);
        match message {
            Message::Hello(hello) => self.on_hello(node, hello, now),
            Message::Proof(proof) => self.on_proof(node, proof, now),
            Message::GetAvaProofs => self.on_get_proofs(node),
            Message::AvaProofs(proofs) => {
                self.quorum.record_avaproofs(node);
                for proof in proofs {
                    self.on_proof(node, proof, now);
                }
            }
            Message::Poll(poll) => self.on_poll(node, poll),
            Message::Response(response) => self.on_response(node, response, now),
            Message::GetAvaAddr => self.on_get_addr(node, now),
            Message::AvaAddr(addresses) => self.on_addr(node, addresses),
        }
    }

    fn on_hello(&mut self, node: NodeId, hello: Hello, now: SystemTime) {
        let Some(connection) = self.connections.get_mut(&node) else {
            return;
        };
        if connection.session.is_some() {
            debug!(node, "ignoring repeated hello");
            return;
        }
        let verifier = self.peers.verifier();
        let key = match hello.delegation.verify(verifier) {
            Ok(key) => key,
            Err(err) => {
                debug!(node, ?err, "invalid delegation");
                self.punish(node, Misbehavior::DELEGATION);
                return;
            }
        };
        let challenge = Hello::challenge(
            &hello.delegation,
            connection.remote_nonce,
            connection.local_nonce,
        );
        if !verifier.verify(&key, &challenge, &hello.signature) {
            self.punish(node, Misbehavior::HELLO_SIGNATURE);
            return;
        }
        connection.session = Some(key);

        let proof_id = hello.delegation.proof_id();
        if !self.peers.add_node(node, proof_id, now) {
            debug!(node, proof = %proof_id, "node waiting for its proof");
            if self.peers.proof(&proof_id).is_none() {
                self.send(node, Message::GetAvaProofs);
            }
        }
    }

    fn on_proof(&mut self, node: NodeId, proof: Proof, now: SystemTime) {
        match self.accept_proof(Arc::new(proof), Some(node), now) {
            Err(RegistrationError::Invalid(err)) => {
                debug!(node, ?err, "invalid proof");
                self.punish(node, Misbehavior::PROOF);
            }
            Err(err) => trace!(node, ?err, "proof not registered"),
            Ok(_) => {}
        }
    }

    fn on_get_proofs(&mut self, node: NodeId) {
        let proofs = self
            .peers
            .shareable_proofs()
            .into_iter()
            .take(MAX_AVAPROOFS)
            .map(|proof| proof.as_ref().clone())
            .collect();
        self.send(node, Message::AvaProofs(proofs));
    }

    fn on_get_addr(&mut self, node: NodeId, now: SystemTime) {
        let Some(connection) = self.connections.get_mut(&node) else {
            return;
        };
        if connection
            .last_addr_request
            .is_some_and(|last| now < last + GETAVAADDR_INTERVAL)
        {
            debug!(node, "ignoring repeated getavaaddr");
            return;
        }
        connection.last_addr_request = Some(now);

        // Most available peers first.
        let mut available: Vec<&Peer> = self
            .peers
            .peers()
            .filter(|peer| peer.availability_score > 0.0)
            .collect();
        available.sort_by(|a, b| b.availability_score.total_cmp(&a.availability_score));
        let addresses: Vec<NodeId> = available
            .iter()
            .flat_map(|peer| peer.nodes.iter().copied())
            .filter(|address| *address != node)
            .take(self.cfg.max_addr_to_send.min(MAX_ADDR_TO_SEND))
            .collect();
        self.send(node, Message::AvaAddr(addresses));
    }

    fn on_addr(&mut self, node: NodeId, addresses: Vec<NodeId>) {
        let before = self.addresses.len();
        for address in addresses {
            if self.addresses.len() >= MAX_KNOWN_ADDRESSES {
                break;
            }
            self.addresses.insert(address);
        }
        debug!(node, added = self.addresses.len() - before, "received avalanche addresses");
    }

    /// Ask every connection for addresses, at most once per interval.
    fn request_addresses(&mut self, now: SystemTime) {
        if self
            .last_addr_broadcast
            .is_some_and(|last| now < last + GETAVAADDR_INTERVAL)
        {
            return;
        }
        self.last_addr_broadcast = Some(now);
        let nodes: Vec<NodeId> = self.connections.keys().copied().collect();
        for node in nodes {
            self.send(node, Message::GetAvaAddr);
        }
    }

    fn on_poll(&mut self, node: NodeId, poll: Poll) {
        if poll.invs.len() > self.cfg.max_element_poll {
            self.punish(node, Misbehavior::POLL);
            return;
        }
        let items = self.items();
        let votes = poll
            .invs
            .iter()
            .map(|inv| Vote {
                code: items.local_vote(inv),
                hash: inv.hash,
            })
            .collect();
        let cooldown = self.cfg.cooldown.as_millis().min(u32::MAX as u128) as u32;
        let response = Response {
            round: poll.round,
            cooldown,
            votes,
        }
        .sign(&self.session);
        self.send(node, Message::Response(response));
    }

    fn on_response(&mut self, node: NodeId, signed: SignedResponse, now: SystemTime) {
        let key = self
            .connections
            .get(&node)
            .and_then(|connection| connection.session);
        let authentic = key.is_some_and(|key| signed.verify(self.peers.verifier(), &key));
        if !authentic {
            self.punish(node, Misbehavior::RESPONSE_SIGNATURE);
            return;
        }
        let response = signed.response;
        let cooldown = Duration::from_millis(response.cooldown as u64);
        self.peers.update_next_request_time(node, now + cooldown);

        let Self {
            processor,
            chain,
            mempool,
            peers,
            contenders,
            invalidated,
            cfg,
            ..
        } = self;
        let items = Items {
            chain: &*chain,
            mempool: &*mempool,
            peers: &*peers,
            contenders: &*contenders,
            invalidated: &*invalidated,
            preconsensus: cfg.preconsensus,
            staking_preconsensus: cfg.staking_preconsensus,
        };
        let result = processor.register_votes(node, &response, |item| items.is_worth_polling(item));
        match result {
            Ok(updates) => {
                self.peers.record_availability(node, true);
                self.apply_updates(updates, now);
            }
            Err(misbehavior) => self.punish(node, misbehavior),
        }
    }

    fn apply_updates(&mut self, updates: Vec<Update>, now: SystemTime) {
        if updates.is_empty() {
            return;
        }
        self.peers.observe(now);
        for Update { item, status } in updates {
            debug!(?item, status = status.as_str(), "vote update");
            match item {
                VoteItem::Block(hash) => self.apply_block_update(hash, status),
                VoteItem::Tx(txid) => apply(&mut self.mempool, &txid, status),
                VoteItem::Proof(id) => apply(&mut self.peers, &id, status),
                VoteItem::Contender(id) => apply(&mut self.contenders, &id, status),
            }
        }
        self.process_reorg(now);
    }

    fn apply_block_update(&mut self, hash: BlockHash, status: VoteStatus) {
        match status {
            VoteStatus::Finalized => {
                let previous = self.finalized_height();
                apply(&mut self.chain, &hash, status);
                self.blocks_finalized(previous);
            }
            VoteStatus::Invalid => {
                self.invalidated.insert(hash);
                apply(&mut self.chain, &hash, status);
            }
            _ => apply(&mut self.chain, &hash, status),
        }
    }

    fn finalized_height(&self) -> Option<u32> {
        self.chain
            .finalized()
            .and_then(|hash| self.chain.block(&hash))
            .map(Block::height)
    }

    /// Clear preconsensus state for transactions in blocks finalized since `previous`.
    fn blocks_finalized(&mut self, previous: Option<u32>) {
        let Some(height) = self.finalized_height() else {
            return;
        };
        let first = previous.map_or(0, |previous| previous + 1);
        for height in first..=height {
            let Some(block) = self
                .chain
                .at_height(height)
                .and_then(|hash| self.chain.block(&hash))
            else {
                continue;
            };
            for tx in &block.transactions {
                self.processor.remove(&VoteItem::Tx(tx.id()));
            }
            self.mempool.block_finalized(block);
        }
        self.contenders.cleanup(height);
    }

    /// Propagate chain changes to the mempool, the peers and the polling set.
    fn process_reorg(&mut self, now: SystemTime) {
        let reorg = self.chain.take_reorg();
        if reorg.is_empty() {
            return;
        }

        let mut readmitted = Vec::new();
        for block in reorg.disconnected.iter().rev() {
            for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
                if let Ok(txid) = self.mempool.accept(tx.clone(), &self.chain) {
                    readmitted.push(txid);
                }
            }
        }
        for hash in &reorg.connected {
            if let Some(block) = self.chain.block(hash) {
                self.mempool.remove_for_block(block);
            }
        }
        self.mempool.remove_unspendable(&self.chain);
        readmitted.extend(self.mempool.retry_orphans(&self.chain));
        for txid in readmitted {
            self.reconcile_tx(txid);
        }

        for hash in reorg.parked {
            self.reconcile_block(hash);
        }

        if !reorg.connected.is_empty() || !reorg.disconnected.is_empty() {
            for id in self.peers.updated_block_tip(&self.chain, now) {
                self.reconcile_proof(id);
            }
            self.register_local_proof(now);
            self.reconcile_block(self.chain.tip());
            self.promote_contenders();
            self.compute_staking_reward(self.chain.tip(), now);
        }
    }

    /// Make every bound proof a contender for the block after the tip, once some block is
    /// final.
    fn promote_contenders(&mut self) {
        if !self.cfg.staking_preconsensus || self.chain.finalized().is_none() {
            return;
        }
        let tip = self.chain.tip();
        let height = self.chain.height();
        self.contenders.promote(tip, height, self.peers.bound_proofs());
        self.reconcile_contenders(tip);
    }

    /// Pick the staking reward winner of the block after `prev`. Requires the quorum.
    ///
    /// Returns whether a reward is known for `prev`.
    fn compute_staking_reward(&mut self, prev: BlockHash, now: SystemTime) -> bool {
        if !self.cfg.staking_rewards || !self.quorum.is_latched() {
            return false;
        }
        if self.contenders.reward(&prev).is_some() {
            return true;
        }
        let Some(block) = self.chain.block(&prev) else {
            return false;
        };
        let height = block.height();
        let block_time = UNIX_EPOCH + Duration::from_secs(block.header.timestamp);
        let Some(proof) = self.peers.select_staking_reward_winner(&prev, block_time, now) else {
            trace!(%prev, "no staking reward winner yet");
            return false;
        };
        self.contenders.set_reward(
            prev,
            height,
            Winner {
                proof: proof.id(),
                payout: proof.payout_script().clone(),
            },
        );
        if self.cfg.staking_preconsensus {
            self.reconcile_contenders(prev);
        }
        true
    }

    /// Forget the staking reward of the block after `prev` and select its winner again.
    pub fn recompute_staking_reward(&mut self, prev: BlockHash, now: SystemTime) -> bool {
        self.contenders.erase_reward(&prev);
        self.compute_staking_reward(prev, now)
    }

    /// Poll the best contenders of the block after `prev`, local winners included.
    fn reconcile_contenders(&mut self, prev: BlockHash) {
        for id in self.contenders.local_winners(&prev) {
            let item = VoteItem::Contender(id);
            if !self.is_worth_polling(&item) {
                continue;
            }
            let priority = self
                .contenders
                .get(&id)
                .map_or(0, |contender| rank_priority(contender.rank()));
            let accepted = self.contenders.is_accepted(&id);
            self.processor.add_to_reconcile(item, priority, accepted);
        }
    }

    /// Staking reward winners of the block after `prev`.
    pub fn staking_reward(&self, prev: &BlockHash) -> Option<&Reward> {
        self.contenders.reward(prev)
    }

    /// Force the staking reward winners of the block after `prev`.
    pub fn set_staking_reward(
        &mut self,
        prev: BlockHash,
        payouts: Vec<Bytes>,
    ) -> Result<bool, chain::Error> {
        let height = self
            .chain
            .block(&prev)
            .map(Block::height)
            .ok_or(chain::Error::UnknownBlock(prev))?;
        Ok(self.contenders.set_winners(prev, height, payouts))
    }

    fn reconcile_block(&mut self, hash: BlockHash) {
        let item = VoteItem::Block(hash);
        if !self.is_worth_polling(&item) {
            return;
        }
        let priority = self.chain.chain_work(&hash).unwrap_or_default();
        let accepted = self.chain.is_accepted(&hash);
        self.processor.add_to_reconcile(item, priority, accepted);
    }

    fn reconcile_tx(&mut self, txid: TxId) {
        let item = VoteItem::Tx(txid);
        if !self.is_worth_polling(&item) {
            return;
        }
        let priority = self.mempool.fee(&txid).unwrap_or_default() as u128;
        self.processor.add_to_reconcile(item, priority, true);
    }

    fn reconcile_proof(&mut self, id: ProofId) {
        let item = VoteItem::Proof(id);
        if !self.is_worth_polling(&item) {
            return;
        }
        let priority = self.peers.proof(&id).map_or(0, |proof| proof.score() as u128);
        let accepted = self.peers.is_bound(&id);
        self.processor.add_to_reconcile(item, priority, accepted);
    }

    fn register_local_proof(&mut self, now: SystemTime) {
        let Some(proof) = self.local.as_ref().map(|local| local.proof.clone()) else {
            return;
        };
        let id = proof.id();
        if self.peers.is_bound(&id) {
            return;
        }
        let result = self
            .peers
            .register_proof(proof.clone(), &self.chain, RegistrationMode::Default, now);
        match &result {
            Ok(_) => info!(proof = %id, "local proof registered"),
            Err(err) => debug!(proof = %id, ?err, "local proof not registered"),
        }
        if let Some(local) = &mut self.local {
            local.attempted = true;
            local.error = result.as_ref().err().cloned();
        }
        if result.is_ok() {
            self.reconcile_proof(id);
            let nodes: Vec<NodeId> = self.connections.keys().copied().collect();
            for node in nodes {
                self.send(node, Message::Proof(proof.as_ref().clone()));
            }
        }
    }

    /// Register a proof received from `origin` (or submitted locally), relaying it to the
    /// other nodes once bound.
    fn accept_proof(
        &mut self,
        proof: Arc<Proof>,
        origin: Option<NodeId>,
        now: SystemTime,
    ) -> Result<PeerId, RegistrationError> {
        let id = proof.id();
        let result = self
            .peers
            .register_proof(proof.clone(), &self.chain, RegistrationMode::Default, now);
        match &result {
            Ok(_) => {
                self.reconcile_proof(id);
                let others: Vec<NodeId> = self
                    .connections
                    .keys()
                    .filter(|node| Some(**node) != origin)
                    .copied()
                    .collect();
                for node in others {
                    self.send(node, Message::Proof(proof.as_ref().clone()));
                }
            }
            Err(_) if self.peers.is_conflicting(&id) => self.reconcile_proof(id),
            Err(_) => {}
        }
        result
    }

    /// Register a locally submitted proof.
    pub fn register_proof(
        &mut self,
        proof: Arc<Proof>,
        now: SystemTime,
    ) -> Result<PeerId, RegistrationError> {
        self.accept_proof(proof, None, now)
    }

    /// Poll every node that is due, if the quorum allows it.
    pub fn tick(&mut self, now: SystemTime) {
        self.peers.observe(now);
        if self.local.as_ref().is_some_and(|local| !local.attempted) {
            self.register_local_proof(now);
        }
        for id in self.peers.promote_conflicting(now) {
            self.reconcile_proof(id);
        }
        for node in self.processor.clear_timed_out(now) {
            self.peers.record_availability(node, false);
        }
        if !self.ready_to_poll() {
            self.request_addresses(now);
            return;
        }
        self.compute_staking_reward(self.chain.tip(), now);

        let Self {
            processor,
            chain,
            mempool,
            peers,
            contenders,
            invalidated,
            cfg,
            rng,
            actions,
            ..
        } = self;
        for _ in 0..peers.node_count() {
            let Some(node) = peers.select_node(&mut *rng, now) else {
                break;
            };
            let invs = {
                let items = Items {
                    chain: &*chain,
                    mempool: &*mempool,
                    peers: &*peers,
                    contenders: &*contenders,
                    invalidated: &*invalidated,
                    preconsensus: cfg.preconsensus,
                    staking_preconsensus: cfg.staking_preconsensus,
                };
                processor.invs_for_poll(|item| items.is_worth_polling(item), true)
            };
            if invs.is_empty() {
                break;
            }
            let round = processor.next_round();
            let deadline = now + cfg.query_timeout;
            processor.register_query(node, round, invs.clone(), deadline);
            peers.update_next_request_time(node, deadline);
            trace!(node, round, count = invs.len(), "polling node");
            actions.push(Action::Send {
                node,
                message: Message::Poll(Poll { round, invs }),
            });
        }
    }

    /// Evict dangling proofs.
    pub fn cleanup(&mut self, now: SystemTime) {
        let local = self.local.as_ref().map(|local| local.proof.id());
        for id in self.peers.cleanup_dangling_proofs(local, &self.chain, now) {
            self.processor.remove(&VoteItem::Proof(id));
        }
    }

    /// Add a block to the chain and poll it.
    pub fn submit_block(&mut self, block: Block, now: SystemTime) -> Result<BlockHash, chain::Error> {
        let hash = self.chain.submit_block(block)?;
        self.process_reorg(now);
        self.reconcile_block(hash);
        Ok(hash)
    }

    /// Mine `count` blocks on the active tip, including the mempool.
    pub fn generate(&mut self, count: usize, now: SystemTime) -> Vec<BlockHash> {
        let mut hashes = Vec::with_capacity(count);
        for _ in 0..count {
            let height = self.chain.height() + 1;
            let coinbase = Transaction::coinbase(
                height,
                vec![TxOut {
                    amount: BLOCK_SUBSIDY,
                    owner: self.session.public_key(),
                }],
            );
            let mut transactions = vec![coinbase];
            transactions.extend(self.mempool.template());
            let block = Block::new(
                self.chain.tip(),
                height,
                self.chain.tip_time() + 1,
                1,
                0,
                transactions,
            );
            match self.submit_block(block, now) {
                Ok(hash) => hashes.push(hash),
                Err(err) => {
                    warn!(?err, "generated block rejected");
                    break;
                }
            }
        }
        hashes
    }

    /// Admit a transaction to the mempool and poll it when preconsensus is enabled.
    pub fn send_transaction(&mut self, tx: Transaction) -> Result<TxId, mempool::Error> {
        let txid = self.mempool.accept(tx, &self.chain)?;
        self.reconcile_tx(txid);
        for txid in self.mempool.retry_orphans(&self.chain) {
            self.reconcile_tx(txid);
        }
        Ok(txid)
    }

    /// Mark a block invalid. Its vote record is dropped.
    pub fn invalidate_block(&mut self, hash: BlockHash, now: SystemTime) -> Result<(), chain::Error> {
        self.chain.invalidate_block(&hash)?;
        self.processor.remove(&VoteItem::Block(hash));
        self.process_reorg(now);
        Ok(())
    }

    /// Clear the invalid flag of a block. Polling starts over from a fresh record.
    pub fn reconsider_block(&mut self, hash: BlockHash, now: SystemTime) -> Result<(), chain::Error> {
        self.chain.reconsider_block(&hash)?;
        self.invalidated.remove(&hash);
        self.processor.remove(&VoteItem::Block(hash));
        self.process_reorg(now);
        self.reconcile_block(hash);
        Ok(())
    }

    /// Park a block. Its vote record is dropped.
    pub fn park_block(&mut self, hash: BlockHash, now: SystemTime) -> Result<(), chain::Error> {
        self.chain.park_block(&hash)?;
        self.processor.remove(&VoteItem::Block(hash));
        self.process_reorg(now);
        Ok(())
    }

    /// Unpark a block. Polling starts over from a fresh record.
    pub fn unpark_block(&mut self, hash: BlockHash, now: SystemTime) -> Result<(), chain::Error> {
        self.chain.unpark_block(&hash)?;
        self.processor.remove(&VoteItem::Block(hash));
        self.process_reorg(now);
        self.reconcile_block(hash);
        Ok(())
    }

    /// Finalize a block of the active chain without polling.
    pub fn finalize_block(&mut self, hash: BlockHash) -> Result<(), chain::Error> {
        let previous = self.finalized_height();
        self.chain.finalize_block(&hash)?;
        self.blocks_finalized(previous);
        Ok(())
    }

    /// Whether `txid` is final: finalized by preconsensus or mined in a finalized block.
    pub fn is_final_transaction(&self, txid: &TxId) -> bool {
        self.mempool.is_finalized(txid)
            || self
                .chain
                .block_containing(txid)
                .is_some_and(|block| self.chain.is_finalized(&block))
    }

    /// Write every bound proof to `path`. Returns the number of proofs written.
    pub fn dump_peers(&self, path: &Path) -> Result<usize, persist::Error> {
        let records = persist::records(&self.peers);
        persist::dump(path, &records)?;
        Ok(records.len())
    }

    /// Register the proofs stored in `path`. Returns the number of proofs bound.
    pub fn load_peers(&mut self, path: &Path, now: SystemTime) -> Result<usize, persist::Error> {
        let mut bound = 0;
        for record in persist::load(path)? {
            let id = record.proof.id();
            match self.accept_proof(Arc::new(record.proof), None, now) {
                Ok(_) => {
                    self.peers.restore_peer(
                        &id,
                        record.has_finalized,
                        record.registration_time,
                        record.next_possible_conflict_time,
                    );
                    bound += 1;
                }
                Err(err) => debug!(proof = %id, ?err, "persisted proof not registered"),
            }
        }
        info!(path = %path.display(), bound, "loaded avalanche peers");
        Ok(bound)
    }
}
