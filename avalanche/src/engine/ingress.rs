use super::Error;
use crate::{
    chain::{self, Block, Transaction},
    mempool,
    node::Node,
    proof::Proof,
    peers::RegistrationError,
    types::{BlockHash, PeerId, TxId},
};
use avalanche_cryptography::Verifier;
use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};
use std::sync::Arc;

type Call<V> = Box<dyn FnOnce(&mut Node<V>) + Send>;

/// Message types that can be sent to the [Mailbox].
pub enum Message<V: Verifier> {
    /// Add a block to the chain.
    SubmitBlock {
        block: Block,
        responder: oneshot::Sender<Result<BlockHash, chain::Error>>,
    },

    /// Mine blocks on the active tip.
    Generate {
        count: usize,
        responder: oneshot::Sender<Vec<BlockHash>>,
    },

    /// Admit a transaction to the mempool.
    SendTransaction {
        tx: Transaction,
        responder: oneshot::Sender<Result<TxId, mempool::Error>>,
    },

    /// Register a proof submitted locally.
    RegisterProof {
        proof: Arc<Proof>,
        responder: oneshot::Sender<Result<PeerId, RegistrationError>>,
    },

    /// Whether a block is finalized. `None` for an unknown block.
    IsFinalBlock {
        hash: BlockHash,
        responder: oneshot::Sender<Option<bool>>,
    },

    /// Run a closure against the node (used by RPC handlers).
    Call { call: Call<V> },

    /// Stop the actor. The responder fires once the peer set has been persisted.
    Stop { responder: oneshot::Sender<()> },
}

/// Ingress mailbox for the [Actor](super::Actor).
pub struct Mailbox<V: Verifier> {
    sender: mpsc::Sender<Message<V>>,
}

impl<V: Verifier> Clone for Mailbox<V> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<V: Verifier> Mailbox<V> {
    pub(super) fn new(sender: mpsc::Sender<Message<V>>) -> Self {
        Self { sender }
    }

    async fn request<T>(
        &mut self,
        message: impl FnOnce(oneshot::Sender<T>) -> Message<V>,
    ) -> Result<T, Error> {
        let (responder, receiver) = oneshot::channel();
        self.sender
            .send(message(responder))
            .await
            .map_err(|_| Error::Stopped)?;
        receiver.await.map_err(|_| Error::Stopped)
    }

    pub async fn submit_block(&mut self, block: Block) -> Result<Result<BlockHash, chain::Error>, Error> {
        self.request(|responder| Message::SubmitBlock { block, responder })
            .await
    }

    pub async fn generate(&mut self, count: usize) -> Result<Vec<BlockHash>, Error> {
        self.request(|responder| Message::Generate { count, responder })
            .await
    }

    pub async fn send_transaction(
        &mut self,
        tx: Transaction,
    ) -> Result<Result<TxId, mempool::Error>, Error> {
        self.request(|responder| Message::SendTransaction { tx, responder })
            .await
    }

    pub async fn register_proof(
        &mut self,
        proof: Arc<Proof>,
    ) -> Result<Result<PeerId, RegistrationError>, Error> {
        self.request(|responder| Message::RegisterProof { proof, responder })
            .await
    }

    pub async fn is_final_block(&mut self, hash: BlockHash) -> Result<Option<bool>, Error> {
        self.request(|responder| Message::IsFinalBlock { hash, responder })
            .await
    }

    /// Run `f` on the actor's task and return its output.
    pub async fn call<T: Send + 'static>(
        &mut self,
        f: impl FnOnce(&mut Node<V>) -> T + Send + 'static,
    ) -> Result<T, Error> {
        self.request(|responder| Message::Call {
            call: Box::new(move |node| {
                let _ = responder.send(f(node));
            }),
        })
        .await
    }

    /// Stop the actor and wait for it to persist its peers.
    pub async fn stop(&mut self) -> Result<(), Error> {
        self.request(|responder| Message::Stop { responder }).await
    }
}
