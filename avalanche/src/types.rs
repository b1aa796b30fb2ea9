//! Identifiers and primitive values shared across the engine.

use avalanche_codec::{Error as CodecError, FixedSize, Read, ReadExt, Write};
use avalanche_cryptography::Digest;
use bytes::{Buf, BufMut};
use std::{
    fmt::{Debug, Display},
    ops::Deref,
    str::FromStr,
};

/// Amount in satoshis.
pub type Amount = u64;

/// Satoshis per coin.
pub const COIN: Amount = 100;

/// Identifier of a network connection.
pub type NodeId = u64;

/// Identifier of a registered avalanche peer (one per bound proof).
pub type PeerId = u32;

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Digest);

        impl From<Digest> for $name {
            fn from(digest: Digest) -> Self {
                Self(digest)
            }
        }

        impl Deref for $name {
            type Target = Digest;
            fn deref(&self) -> &Digest {
                &self.0
            }
        }

        impl Write for $name {
            fn write(&self, buf: &mut impl BufMut) {
                self.0.write(buf);
            }
        }

        impl Read for $name {
            type Cfg = ();

            fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
                Ok(Self(Digest::read(buf)?))
            }
        }

        impl FixedSize for $name {
            const SIZE: usize = Digest::SIZE;
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = avalanche_cryptography::Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

define_id!(
    /// Hash of a block header.
    BlockHash
);
define_id!(
    /// Hash of a transaction.
    TxId
);
define_id!(
    /// Identifier of a proof, committing to its master key.
    ProofId
);
define_id!(
    /// Identifier of a proof excluding its master key.
    LimitedProofId
);
define_id!(
    /// Identifier of a delegation (the final id of its key chain).
    DelegationId
);
define_id!(
    /// Identifier of a stake, used to order stakes inside a proof.
    StakeId
);
define_id!(
    /// Identifier of a proof contending for the staking reward of the block after a given one.
    ContenderId
);

/// Reference to a transaction output.
#[derive(Clone, Copy, Default, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OutPoint {
    pub txid: TxId,
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: TxId, index: u32) -> Self {
        Self { txid, index }
    }
}

impl Write for OutPoint {
    fn write(&self, buf: &mut impl BufMut) {
        self.txid.write(buf);
        self.index.write(buf);
    }
}

impl Read for OutPoint {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let txid = TxId::read(buf)?;
        let index = u32::read(buf)?;
        Ok(Self { txid, index })
    }
}

impl FixedSize for OutPoint {
    const SIZE: usize = TxId::SIZE + u32::SIZE;
}

impl Display for OutPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avalanche_codec::{DecodeExt, Encode};
    use avalanche_cryptography::hash;

    #[test]
    fn test_id_display_roundtrip() {
        let id = ProofId(hash(b"proof"));
        let parsed: ProofId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not hex".parse::<BlockHash>().is_err());
    }

    #[test]
    fn test_outpoint_codec() {
        let outpoint = OutPoint::new(TxId(hash(b"tx")), 3);
        let encoded = outpoint.encode();
        assert_eq!(encoded.len(), 36);
        assert_eq!(&encoded[32..], &[3, 0, 0, 0]);
        assert_eq!(OutPoint::decode(encoded).unwrap(), outpoint);
    }
}
