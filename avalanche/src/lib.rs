//! Finalize blocks, transactions and stake proofs by repeated stake-weighted polling.
//!
//! # Overview
//!
//! Nodes back their participation with a [proof](proof::Proof): a signed bundle of unspent
//! outputs whose total amount becomes the node's weight. Connected nodes introduce themselves
//! with a [delegation](delegation::Delegation) of that proof (`avahello`), exchange proofs, and
//! then repeatedly poll each other about the blocks, transactions and proofs they are
//! uncertain about. Every answer is folded into a per-item [vote record](voting::VoteRecord);
//! once an item has gathered enough consecutive agreeing votes it is finalized (or
//! invalidated) and handed back to its owner:
//! - blocks to the [chain](chain::Chainstate), which finalizes, parks or invalidates them
//! - transactions to the [mempool](mempool::Mempool) (only with preconsensus enabled)
//! - proofs to the [peer manager](peers::PeerManager), which binds or rejects them
//! - stake contenders to the [contender cache](contenders::Contenders), which settles the
//!   staking reward winners of the next block
//!
//! # Layout
//!
//! [node::Node] wires the pieces together without performing any I/O: every handler takes
//! the current time and queues [actions](node::Action) for the caller. [engine::Actor] drives a
//! node from a tokio interval, a [p2p] transport and a mailbox. [rpc] exposes the node's
//! JSON-RPC surface as plain functions.
//!
//! # Status
//!
//! `avalanche` is **ALPHA** software and is not yet recommended for production use. Developers
//! should expect breaking changes and occasional instability.

pub mod chain;
pub mod contenders;
pub mod delegation;
pub mod engine;
pub mod mempool;
pub mod node;
pub mod p2p;
pub mod peers;
pub mod persist;
pub mod processor;
pub mod proof;
pub mod quorum;
pub mod rpc;
pub mod types;
pub mod vote;
pub mod voting;
pub mod wire;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;
