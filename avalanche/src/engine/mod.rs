//! Run a [Node](crate::node::Node) as an asynchronous service.
//!
//! # Overview
//!
//! The [Actor] owns the node and multiplexes three inputs on a single task:
//! - a tick every [Config::tick_interval] that sends due polls (and, less often, evicts
//!   dangling proofs)
//! - frames from the network, decoded and dispatched to the node
//! - requests from the [Mailbox] (new blocks, transactions, proofs, RPC calls)
//!
//! After each input the actor drains the node's actions: messages are encoded and sent, and
//! misbehavior accumulates per node until it reaches [Config::ban_score], at which point the
//! node is blocked and disconnected.
//!
//! On shutdown the peer set is written to [Config::peers_file] (when persistence is enabled)
//! and the node is handed back to the caller.

mod actor;
pub use actor::Actor;
mod config;
pub use config::Config;
mod ingress;
pub use ingress::Mailbox;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("engine stopped")]
    Stopped,
}
