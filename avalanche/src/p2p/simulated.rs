//! In-memory network connecting nodes of the same process.
//!
//! Every registered node gets an unbounded inbox. Frames are delivered in send order, without
//! latency or loss. A node can block another one, after which frames between the two are
//! dropped in both directions.

use super::Message;
use crate::types::NodeId;
use bytes::Bytes;
use futures::{channel::mpsc, StreamExt};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum Error {
    #[error("message too large: {0}")]
    MessageTooLarge(usize),
    #[error("network closed")]
    NetworkClosed,
    #[error("node already registered: {0}")]
    AlreadyRegistered(NodeId),
}

/// Configuration for a [Network].
#[derive(Clone, Debug)]
pub struct Config {
    /// Largest frame accepted by [Sender::send](super::Sender::send).
    pub max_message_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_message_len: 4 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct Peer {
    peer: String,
}

impl Peer {
    fn new(node: NodeId) -> Self {
        Self {
            peer: node.to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    agents: BTreeMap<NodeId, mpsc::UnboundedSender<Message>>,
    /// Ordered `(blocker, blocked)` pairs.
    blocked: HashSet<(NodeId, NodeId)>,
}

impl State {
    fn is_blocked(&self, a: NodeId, b: NodeId) -> bool {
        self.blocked.contains(&(a, b)) || self.blocked.contains(&(b, a))
    }
}

/// Handle to a shared in-memory network.
#[derive(Clone, Debug)]
pub struct Network {
    max_message_len: usize,
    state: Arc<Mutex<State>>,

    sent_messages: Family<Peer, Counter>,
    received_messages: Family<Peer, Counter>,
    dropped_messages: Counter,
}

impl Network {
    pub fn new(cfg: Config, registry: &mut Registry) -> Self {
        let sent_messages = Family::<Peer, Counter>::default();
        let received_messages = Family::<Peer, Counter>::default();
        let dropped_messages = Counter::default();
        registry.register(
            "messages_sent",
            "messages sent, by sender",
            sent_messages.clone(),
        );
        registry.register(
            "messages_received",
            "messages received, by recipient",
            received_messages.clone(),
        );
        registry.register(
            "messages_dropped",
            "messages dropped before delivery",
            dropped_messages.clone(),
        );
        Self {
            max_message_len: cfg.max_message_len,
            state: Arc::new(Mutex::new(State::default())),
            sent_messages,
            received_messages,
            dropped_messages,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a node. Returns its sending half, its inbox and its blocker.
    pub fn register(&self, node: NodeId) -> Result<(Sender, Receiver, Control), Error> {
        let mut state = self.state();
        if state.agents.contains_key(&node) {
            return Err(Error::AlreadyRegistered(node));
        }
        let (sender, receiver) = mpsc::unbounded();
        state.agents.insert(node, sender);
        debug!(node, "registered node");
        Ok((
            Sender {
                me: node,
                network: self.clone(),
            },
            Receiver { receiver },
            Control {
                me: node,
                network: self.clone(),
            },
        ))
    }

    /// Nodes currently registered.
    pub fn nodes(&self) -> Vec<NodeId> {
        self.state().agents.keys().copied().collect()
    }

    /// Close the inbox of `node`. Its pending frames can still be received.
    pub fn deregister(&self, node: NodeId) {
        self.state().agents.remove(&node);
    }

    fn deliver(&self, origin: NodeId, recipient: NodeId, message: Bytes) -> Result<(), Error> {
        if message.len() > self.max_message_len {
            return Err(Error::MessageTooLarge(message.len()));
        }
        self.sent_messages.get_or_create(&Peer::new(origin)).inc();

        let state = self.state();
        if state.is_blocked(origin, recipient) {
            debug!(origin, recipient, reason = "blocked", "dropping message");
            self.dropped_messages.inc();
            return Ok(());
        }
        let Some(inbox) = state.agents.get(&recipient) else {
            debug!(origin, recipient, reason = "no agent", "dropping message");
            self.dropped_messages.inc();
            return Ok(());
        };
        if inbox.unbounded_send((origin, message)).is_err() {
            debug!(origin, recipient, reason = "inbox closed", "dropping message");
            self.dropped_messages.inc();
            return Ok(());
        }
        self.received_messages
            .get_or_create(&Peer::new(recipient))
            .inc();
        Ok(())
    }

    fn block(&self, blocker: NodeId, blocked: NodeId) {
        self.state().blocked.insert((blocker, blocked));
        debug!(blocker, blocked, "blocked node");
    }
}

/// Implementation of a [super::Sender] for the simulated network.
#[derive(Clone, Debug)]
pub struct Sender {
    me: NodeId,
    network: Network,
}

impl super::Sender for Sender {
    type Error = Error;

    async fn send(&mut self, recipient: NodeId, message: Bytes) -> Result<(), Error> {
        self.network.deliver(self.me, recipient, message)
    }
}

/// Implementation of a [super::Receiver] for the simulated network.
#[derive(Debug)]
pub struct Receiver {
    receiver: mpsc::UnboundedReceiver<Message>,
}

impl super::Receiver for Receiver {
    type Error = Error;

    async fn recv(&mut self) -> Result<Message, Error> {
        self.receiver.next().await.ok_or(Error::NetworkClosed)
    }
}

/// Implementation of a [super::Blocker] for the simulated network.
#[derive(Clone, Debug)]
pub struct Control {
    me: NodeId,
    network: Network,
}

impl super::Blocker for Control {
    async fn block(&mut self, node: NodeId) {
        self.network.block(self.me, node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::{Blocker, Receiver as _, Sender as _};
    use futures::{executor::block_on, FutureExt};

    fn network(max_message_len: usize) -> Network {
        Network::new(Config { max_message_len }, &mut Registry::default())
    }

    #[test]
    fn test_send_and_receive() {
        let network = network(1024);
        let (mut a, _, _) = network.register(1).unwrap();
        let (_, mut b, _) = network.register(2).unwrap();
        block_on(async {
            a.send(2, Bytes::from_static(b"one")).await.unwrap();
            a.send(2, Bytes::from_static(b"two")).await.unwrap();
            assert_eq!(b.recv().await.unwrap(), (1, Bytes::from_static(b"one")));
            assert_eq!(b.recv().await.unwrap(), (1, Bytes::from_static(b"two")));
        });
    }

    #[test]
    fn test_message_too_large() {
        let network = network(2);
        let (mut a, _, _) = network.register(1).unwrap();
        network.register(2).unwrap();
        let result = block_on(a.send(2, Bytes::from_static(b"abc")));
        assert!(matches!(result, Err(Error::MessageTooLarge(3))));
    }

    #[test]
    fn test_duplicate_registration() {
        let network = network(1024);
        network.register(1).unwrap();
        assert!(matches!(
            network.register(1),
            Err(Error::AlreadyRegistered(1))
        ));
        assert_eq!(network.nodes(), vec![1]);
    }

    #[test]
    fn test_unknown_recipient_is_dropped() {
        let network = network(1024);
        let (mut a, _, _) = network.register(1).unwrap();
        block_on(a.send(9, Bytes::from_static(b"lost"))).unwrap();
    }

    #[test]
    fn test_block_drops_both_directions() {
        let network = network(1024);
        let (mut a, mut a_inbox, mut a_control) = network.register(1).unwrap();
        let (mut b, mut b_inbox, _) = network.register(2).unwrap();
        block_on(async {
            a_control.block(2).await;
            a.send(2, Bytes::from_static(b"a")).await.unwrap();
            b.send(1, Bytes::from_static(b"b")).await.unwrap();
        });
        assert!(a_inbox.recv().now_or_never().is_none());
        assert!(b_inbox.recv().now_or_never().is_none());
    }

    #[test]
    fn test_deregistered_inbox_closes() {
        let network = network(1024);
        let (mut a, _, _) = network.register(1).unwrap();
        let (_, mut b, _) = network.register(2).unwrap();
        block_on(a.send(2, Bytes::from_static(b"last"))).unwrap();
        network.deregister(2);
        block_on(async {
            assert_eq!(b.recv().await.unwrap().1, Bytes::from_static(b"last"));
            assert!(matches!(b.recv().await, Err(Error::NetworkClosed)));
        });
    }
}
