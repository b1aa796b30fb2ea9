use crate::types::NodeId;
use std::{path::PathBuf, time::Duration};

/// Configuration for the [Actor](super::Actor).
#[derive(Clone, Debug)]
pub struct Config {
    /// Identity of this node on the network. Doubles as its connection nonce.
    pub id: NodeId,

    /// Nodes to connect to on startup.
    pub peers: Vec<NodeId>,

    /// Interval between two polling rounds.
    pub tick_interval: Duration,

    /// Interval between two sweeps of dangling proofs.
    pub cleanup_interval: Duration,

    /// The maximum size of the mailbox backlog.
    pub mailbox_size: usize,

    /// Accumulated misbehavior score at which a node is blocked.
    pub ban_score: u32,

    /// Where the peer set is loaded from on startup and dumped to on shutdown.
    pub peers_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: 0,
            peers: Vec::new(),
            tick_interval: Duration::from_millis(10),
            cleanup_interval: Duration::from_secs(60),
            mailbox_size: 1024,
            ban_score: 100,
            peers_file: None,
        }
    }
}
