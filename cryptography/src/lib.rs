//! Hash avalanche objects, sign digests, and verify signatures.
//!
//! Proofs, delegations, `avahello` handshakes and poll responses are all authenticated with
//! signatures over a double SHA-256 [Digest]. Components that check signatures take a
//! [Verifier] rather than a concrete scheme.

use thiserror::Error;

pub mod ed25519;
pub mod sha256;

pub use ed25519::{Ed25519, PrivateKey, PublicKey, Signature};
pub use sha256::{hash, Digest, Hasher};

/// Errors that can occur when parsing cryptographic material.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("invalid digest length")]
    InvalidDigestLength,
    #[error("invalid hex")]
    InvalidHex,
    #[error("invalid private key")]
    InvalidPrivateKey,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid public key length")]
    InvalidPublicKeyLength,
}

/// Checks signatures over digests.
///
/// Every signature the engine accepts (stake signatures, proof master signatures, delegation
/// levels, `avahello` handshakes and poll responses) flows through this capability.
pub trait Verifier: Clone + Send + Sync + 'static {
    /// Returns whether `signature` is a valid signature of `digest` by `public_key`.
    fn verify(&self, public_key: &PublicKey, digest: &Digest, signature: &Signature) -> bool;
}
