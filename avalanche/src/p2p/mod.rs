//! Transport seams used by the [engine](crate::engine).
//!
//! The node only needs to exchange opaque frames with connected nodes and to drop nodes that
//! misbehave. Anything implementing these traits can carry it: the in-memory [simulated]
//! network ships with the crate.

use crate::types::NodeId;
use bytes::Bytes;
use std::{error::Error as StdError, fmt::Debug, future::Future};

pub mod simulated;

/// A frame and the node that sent it.
pub type Message = (NodeId, Bytes);

/// Interface for sending frames to a connected node.
pub trait Sender: Clone + Debug + Send + 'static {
    /// Error that can occur when sending a frame.
    type Error: Debug + StdError + Send + Sync;

    /// Send `message` to `recipient`.
    ///
    /// Success does not imply delivery.
    fn send(
        &mut self,
        recipient: NodeId,
        message: Bytes,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Interface for receiving frames from any connected node.
pub trait Receiver: Debug + Send + 'static {
    /// Error that can occur when receiving a frame.
    type Error: Debug + StdError + Send + Sync;

    /// Receive the next frame.
    fn recv(&mut self) -> impl Future<Output = Result<Message, Self::Error>> + Send;
}

/// Interface for cutting off a misbehaving node.
pub trait Blocker: Clone + Send + 'static {
    /// Drop every frame exchanged with `node` from now on.
    fn block(&mut self, node: NodeId) -> impl Future<Output = ()> + Send;
}
