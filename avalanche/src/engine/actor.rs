use super::{ingress::Message, Config, Mailbox};
use crate::{
    node::{Action, Node},
    p2p::{Blocker, Receiver, Sender},
    processor::Misbehavior,
    types::NodeId,
};
use avalanche_codec::Encode;
use avalanche_cryptography::Verifier;
use futures::{channel::mpsc, StreamExt};
use std::{
    collections::HashMap,
    path::PathBuf,
    time::{Duration, SystemTime},
};
use tokio::{
    select,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

/// Drives a [Node] from a clock, a mailbox and the network.
pub struct Actor<V: Verifier> {
    node: Node<V>,

    id: NodeId,
    peers: Vec<NodeId>,
    tick_interval: Duration,
    cleanup_interval: Duration,
    ban_score: u32,
    peers_file: Option<PathBuf>,

    mailbox: mpsc::Receiver<Message<V>>,

    /// Accumulated misbehavior per node.
    scores: HashMap<NodeId, u32>,
}

impl<V: Verifier> Actor<V> {
    /// Create a new actor around `node`.
    /// Returns the actor and a mailbox for sending requests to it.
    pub fn new(node: Node<V>, cfg: Config) -> (Self, Mailbox<V>) {
        let (sender, mailbox) = mpsc::channel(cfg.mailbox_size);
        (
            Self {
                node,
                id: cfg.id,
                peers: cfg.peers,
                tick_interval: cfg.tick_interval,
                cleanup_interval: cfg.cleanup_interval,
                ban_score: cfg.ban_score,
                peers_file: cfg.peers_file,
                mailbox,
                scores: HashMap::new(),
            },
            Mailbox::new(sender),
        )
    }

    /// Spawn the run loop on the current tokio runtime.
    pub fn start(
        self,
        sender: impl Sender,
        receiver: impl Receiver,
        blocker: impl Blocker,
    ) -> JoinHandle<Node<V>> {
        tokio::spawn(self.run(sender, receiver, blocker))
    }

    /// Run until stopped (or until the network or the mailbox closes) and hand back the node.
    pub async fn run(
        mut self,
        mut sender: impl Sender,
        mut receiver: impl Receiver,
        mut blocker: impl Blocker,
    ) -> Node<V> {
        if let Some(path) = self.peers_file.clone().filter(|_| self.persist()) {
            if path.exists() {
                if let Err(err) = self.node.load_peers(&path, SystemTime::now()) {
                    warn!(?err, path = %path.display(), "failed to load avalanche peers");
                }
            }
        }
        for peer in self.peers.clone() {
            self.node.connect(peer, self.id, peer);
        }
        self.flush(&mut sender, &mut blocker).await;

        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut next_cleanup = SystemTime::now() + self.cleanup_interval;
        let mut stopped = None;
        loop {
            select! {
                _ = ticker.tick() => {
                    let now = SystemTime::now();
                    if now >= next_cleanup {
                        self.node.cleanup(now);
                        next_cleanup = now + self.cleanup_interval;
                    }
                    self.node.tick(now);
                },

                mail = self.mailbox.next() => {
                    let Some(mail) = mail else {
                        debug!(id = self.id, "mailbox closed");
                        break;
                    };
                    if let Message::Stop { responder } = mail {
                        stopped = Some(responder);
                        break;
                    }
                    self.handle_mail(mail);
                },

                message = receiver.recv() => {
                    let (node, bytes) = match message {
                        Ok(message) => message,
                        Err(err) => {
                            error!(?err, "receiver failed");
                            break;
                        }
                    };
                    self.node.handle_bytes(node, bytes, SystemTime::now());
                },
            }
            self.flush(&mut sender, &mut blocker).await;
        }

        self.shutdown();
        if let Some(responder) = stopped {
            let _ = responder.send(());
        }
        self.node
    }

    fn persist(&self) -> bool {
        self.node.config().persist_peers
    }

    fn handle_mail(&mut self, mail: Message<V>) {
        let now = SystemTime::now();
        match mail {
            Message::SubmitBlock { block, responder } => {
                let _ = responder.send(self.node.submit_block(block, now));
            }
            Message::Generate { count, responder } => {
                let _ = responder.send(self.node.generate(count, now));
            }
            Message::SendTransaction { tx, responder } => {
                let _ = responder.send(self.node.send_transaction(tx));
            }
            Message::RegisterProof { proof, responder } => {
                let _ = responder.send(self.node.register_proof(proof, now));
            }
            Message::IsFinalBlock { hash, responder } => {
                let chain = self.node.chain();
                let status = chain.block(&hash).map(|_| chain.is_finalized(&hash));
                let _ = responder.send(status);
            }
            Message::Call { call } => call(&mut self.node),
            Message::Stop { .. } => {}
        }
    }

    /// Deliver every queued action.
    async fn flush(&mut self, sender: &mut impl Sender, blocker: &mut impl Blocker) {
        for action in self.node.take_actions() {
            match action {
                Action::Send { node, message } => {
                    let bytes = message.encode().freeze();
                    if let Err(err) = sender.send(node, bytes).await {
                        warn!(node, ?err, command = message.command(), "failed to send");
                    }
                }
                Action::Punish { node, misbehavior } => {
                    if self.punish(node, misbehavior) {
                        blocker.block(node).await;
                        self.node.disconnect(node);
                    }
                }
            }
        }
    }

    /// Add to the score of `node`. Returns whether it crossed the ban score.
    fn punish(&mut self, node: NodeId, misbehavior: Misbehavior) -> bool {
        let score = self.scores.entry(node).or_default();
        *score = score.saturating_add(misbehavior.score);
        warn!(
            node,
            reason = misbehavior.reason,
            added = misbehavior.score,
            score = *score,
            "node misbehaved"
        );
        if *score < self.ban_score {
            return false;
        }
        info!(node, score = *score, "blocking node");
        true
    }

    fn shutdown(&mut self) {
        let Some(path) = self.peers_file.as_ref().filter(|_| self.persist()) else {
            return;
        };
        match self.node.dump_peers(path) {
            Ok(count) => info!(count, path = %path.display(), "dumped avalanche peers"),
            Err(err) => error!(?err, path = %path.display(), "failed to dump avalanche peers"),
        }
    }
}
