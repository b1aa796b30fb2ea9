//! Ed25519 keys and signatures over digests.
//!
//! Session keys, proof master keys, stake keys and delegated keys all use this scheme. Keys
//! sign a 32-byte [Digest] (never a raw message): callers hash the object being committed to
//! first.

use crate::{sha256::Digest, Error, Verifier};
use avalanche_codec::{Error as CodecError, FixedSize, Read, ReadExt, Write};
use bytes::{Buf, BufMut};
use rand::{rngs::StdRng, CryptoRng, RngCore, SeedableRng};
use std::{
    fmt::{Debug, Display},
    hash::{Hash, Hasher},
    str::FromStr,
};
use zeroize::Zeroizing;

const PRIVATE_KEY_LENGTH: usize = 32;
const PUBLIC_KEY_LENGTH: usize = 32;
const SIGNATURE_LENGTH: usize = 64;

/// Ed25519 private key.
#[derive(Clone)]
pub struct PrivateKey {
    key: ed25519_consensus::SigningKey,
}

impl PrivateKey {
    /// Create a fresh key using the supplied RNG.
    pub fn from_rng<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            key: ed25519_consensus::SigningKey::new(rng),
        }
    }

    /// Create a key from a seed.
    ///
    /// # Warning
    ///
    /// This function is insecure and should only be used for examples and testing.
    pub fn from_seed(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::from_rng(&mut rng)
    }

    /// Returns the corresponding [PublicKey].
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(self.key.verification_key())
    }

    /// Sign a digest.
    pub fn sign(&self, digest: &Digest) -> Signature {
        Signature::from(self.key.sign(digest.as_ref()))
    }

    /// Serialize the key as hex (for configuration files and command-line flags).
    pub fn to_hex(&self) -> String {
        let raw = Zeroizing::new(self.key.to_bytes());
        hex::encode(*raw)
    }
}

impl FromStr for PrivateKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut raw = Zeroizing::new([0u8; PRIVATE_KEY_LENGTH]);
        hex::decode_to_slice(s, &mut raw[..]).map_err(|_| Error::InvalidPrivateKey)?;
        Ok(Self {
            key: ed25519_consensus::SigningKey::from(*raw),
        })
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.key.to_bytes() == other.key.to_bytes()
    }
}

impl Eq for PrivateKey {}

impl Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKey({})", self.public_key())
    }
}

/// Ed25519 public key.
#[derive(Clone, Copy)]
pub struct PublicKey {
    raw: [u8; PUBLIC_KEY_LENGTH],
    key: ed25519_consensus::VerificationKey,
}

impl PublicKey {
    /// Verify a signature over a digest.
    pub fn verify(&self, digest: &Digest, signature: &Signature) -> bool {
        self.key.verify(&signature.signature, digest.as_ref()).is_ok()
    }

    /// Raw key bytes.
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.raw
    }
}

impl From<ed25519_consensus::VerificationKey> for PublicKey {
    fn from(key: ed25519_consensus::VerificationKey) -> Self {
        let raw = key.to_bytes();
        Self { raw, key }
    }
}

impl TryFrom<[u8; PUBLIC_KEY_LENGTH]> for PublicKey {
    type Error = Error;
    fn try_from(raw: [u8; PUBLIC_KEY_LENGTH]) -> Result<Self, Self::Error> {
        let key = ed25519_consensus::VerificationKey::try_from(raw)
            .map_err(|_| Error::InvalidPublicKey)?;
        Ok(Self { raw, key })
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = Error;
    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let raw: [u8; PUBLIC_KEY_LENGTH] =
            value.try_into().map_err(|_| Error::InvalidPublicKeyLength)?;
        Self::try_from(raw)
    }
}

impl FromStr for PublicKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut raw = [0u8; PUBLIC_KEY_LENGTH];
        hex::decode_to_slice(s, &mut raw).map_err(|_| Error::InvalidHex)?;
        Self::try_from(raw)
    }
}

impl Write for PublicKey {
    fn write(&self, buf: &mut impl BufMut) {
        self.raw.write(buf);
    }
}

impl Read for PublicKey {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let raw = <[u8; PUBLIC_KEY_LENGTH]>::read(buf)?;
        Self::try_from(raw).map_err(|_| CodecError::Invalid("PublicKey", "not a curve point"))
    }
}

impl FixedSize for PublicKey {
    const SIZE: usize = PUBLIC_KEY_LENGTH;
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for PublicKey {}

impl Hash for PublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.raw.cmp(&other.raw)
    }
}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.raw
    }
}

impl Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.raw))
    }
}

impl Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.raw))
    }
}

/// Ed25519 signature.
#[derive(Clone, Copy)]
pub struct Signature {
    raw: [u8; SIGNATURE_LENGTH],
    signature: ed25519_consensus::Signature,
}

impl From<ed25519_consensus::Signature> for Signature {
    fn from(signature: ed25519_consensus::Signature) -> Self {
        let raw = signature.to_bytes();
        Self { raw, signature }
    }
}

impl From<[u8; SIGNATURE_LENGTH]> for Signature {
    fn from(raw: [u8; SIGNATURE_LENGTH]) -> Self {
        Self {
            raw,
            signature: ed25519_consensus::Signature::from(raw),
        }
    }
}

impl Write for Signature {
    fn write(&self, buf: &mut impl BufMut) {
        self.raw.write(buf);
    }
}

impl Read for Signature {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self::from(<[u8; SIGNATURE_LENGTH]>::read(buf)?))
    }
}

impl FixedSize for Signature {
    const SIZE: usize = SIGNATURE_LENGTH;
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Signature {}

impl Hash for Signature {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        &self.raw
    }
}

impl Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.raw))
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.raw))
    }
}

/// [Verifier] backed by ed25519.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ed25519;

impl Verifier for Ed25519 {
    fn verify(&self, public_key: &PublicKey, digest: &Digest, signature: &Signature) -> bool {
        public_key.verify(digest, signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sha256::hash;
    use avalanche_codec::{DecodeExt, Encode};

    #[test]
    fn test_sign_verify() {
        let signer = PrivateKey::from_seed(0);
        let digest = hash(b"message");
        let signature = signer.sign(&digest);
        assert!(Ed25519.verify(&signer.public_key(), &digest, &signature));

        // Wrong digest
        assert!(!Ed25519.verify(&signer.public_key(), &hash(b"other"), &signature));

        // Wrong key
        let other = PrivateKey::from_seed(1);
        assert!(!Ed25519.verify(&other.public_key(), &digest, &signature));
    }

    #[test]
    fn test_deterministic_seed() {
        assert_eq!(PrivateKey::from_seed(7), PrivateKey::from_seed(7));
        assert_ne!(
            PrivateKey::from_seed(7).public_key(),
            PrivateKey::from_seed(8).public_key()
        );
    }

    #[test]
    fn test_private_key_hex() {
        let key = PrivateKey::from_seed(3);
        let parsed: PrivateKey = key.to_hex().parse().unwrap();
        assert_eq!(parsed, key);
        assert!("abcd".parse::<PrivateKey>().is_err());
    }

    #[test]
    fn test_public_key_codec() {
        let public_key = PrivateKey::from_seed(4).public_key();
        let decoded = PublicKey::decode(public_key.encode()).unwrap();
        assert_eq!(decoded, public_key);
        let parsed: PublicKey = public_key.to_string().parse().unwrap();
        assert_eq!(parsed, public_key);
    }

    #[test]
    fn test_signature_codec() {
        let signature = PrivateKey::from_seed(5).sign(&hash(b"x"));
        let decoded = Signature::decode(signature.encode()).unwrap();
        assert_eq!(decoded, signature);
    }
}
