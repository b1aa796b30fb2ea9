//! Double SHA-256 digests.
//!
//! Every identifier on the network (block hashes, transaction ids, proof ids, delegation ids)
//! is the double SHA-256 of an object's canonical serialization. Identifiers are displayed as
//! byte-reversed hex, the same way the node prints them.
//!
//! # Example
//! ```rust
//! use avalanche_cryptography::sha256::{hash, Hasher};
//!
//! let mut hasher = Hasher::new();
//! hasher.update(b"hello,");
//! hasher.update(b"world!");
//! assert_eq!(hasher.finalize(), hash(b"hello,world!"));
//! ```

use crate::Error;
use avalanche_codec::{Encode, Error as CodecError, FixedSize, Read, ReadExt, Write};
use bytes::{Buf, BufMut};
use rand::{CryptoRng, Rng};
use sha2::{Digest as _, Sha256};
use std::{
    fmt::{Debug, Display},
    ops::Deref,
    str::FromStr,
};

/// Length of a [Digest] in bytes.
pub const DIGEST_LENGTH: usize = 32;

/// Compute the double SHA-256 digest of a message.
pub fn hash(message: &[u8]) -> Digest {
    let mut hasher = Hasher::new();
    hasher.update(message);
    hasher.finalize()
}

/// Incremental double SHA-256 hasher.
#[derive(Clone, Default)]
pub struct Hasher {
    hasher: Sha256,
}

impl Hasher {
    /// Create a new hasher.
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    /// Append raw bytes.
    pub fn update(&mut self, message: &[u8]) {
        self.hasher.update(message);
    }

    /// Append the canonical serialization of `value`.
    pub fn write(&mut self, value: &impl Encode) {
        self.hasher.update(value.encode());
    }

    /// Consume the hasher and return the digest.
    pub fn finalize(self) -> Digest {
        let first = self.hasher.finalize();
        Digest(Sha256::digest(first).into())
    }
}

/// A double SHA-256 digest.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct Digest([u8; DIGEST_LENGTH]);

impl Digest {
    /// The all-zero digest.
    pub const ZERO: Self = Self([0; DIGEST_LENGTH]);

    /// Generate a random digest.
    pub fn random<R: Rng + CryptoRng>(rng: &mut R) -> Self {
        let mut digest = [0u8; DIGEST_LENGTH];
        rng.fill_bytes(&mut digest);
        Self(digest)
    }

    /// Little-endian interpretation of the first 8 bytes.
    pub fn low_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(bytes)
    }
}

impl Write for Digest {
    fn write(&self, buf: &mut impl BufMut) {
        self.0.write(buf);
    }
}

impl Read for Digest {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self(<[u8; DIGEST_LENGTH]>::read(buf)?))
    }
}

impl FixedSize for Digest {
    const SIZE: usize = DIGEST_LENGTH;
}

impl From<[u8; DIGEST_LENGTH]> for Digest {
    fn from(value: [u8; DIGEST_LENGTH]) -> Self {
        Self(value)
    }
}

impl TryFrom<&[u8]> for Digest {
    type Error = Error;
    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let array: [u8; DIGEST_LENGTH] = value.try_into().map_err(|_| Error::InvalidDigestLength)?;
        Ok(Self(array))
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Deref for Digest {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut reversed = self.0;
        reversed.reverse();
        write!(f, "{}", hex::encode(reversed))
    }
}

impl FromStr for Digest {
    type Err = Error;

    /// Parse a byte-reversed hex string.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; DIGEST_LENGTH];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| Error::InvalidHex)?;
        bytes.reverse();
        Ok(Self(bytes))
    }
}
