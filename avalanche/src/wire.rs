//! Avalanche protocol messages.
//!
//! Every message is a one byte tag followed by its body:
//!
//! | tag | message | body |
//! |-----|---------|------|
//! | 0 | `avahello` | delegation, signature |
//! | 1 | `avaproof` | proof |
//! | 2 | `getavaproofs` | (empty) |
//! | 3 | `avaproofs` | proofs |
//! | 4 | `avapoll` | round, invs |
//! | 5 | `avaresponse` | round, cooldown, votes, signature |
//! | 6 | `getavaaddr` | (empty) |
//! | 7 | `avaaddr` | node ids |

use crate::{
    delegation::Delegation,
    proof::Proof,
    types::{BlockHash, ContenderId, NodeId, ProofId, TxId},
};
use avalanche_codec::{
    EncodeSize, Error as CodecError, FixedSize, Read, ReadExt, ReadRangeExt, Write,
};
use avalanche_cryptography::{Digest, Hasher, PrivateKey, PublicKey, Signature, Verifier};
use bytes::{Buf, BufMut};

/// Maximum number of entries in an inventory list on the wire.
pub const MAX_INV_SIZE: usize = 50_000;

/// Maximum number of proofs in an `avaproofs` message.
pub const MAX_AVAPROOFS: usize = 1_000;

/// Maximum number of addresses in an `avaaddr` message.
pub const MAX_ADDR_TO_SEND: usize = 1_000;

/// Type of an inventory entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InvKind {
    Tx,
    Block,
    Proof,
    Contender,
}

impl InvKind {
    pub fn code(self) -> u32 {
        match self {
            Self::Tx => 1,
            Self::Block => 2,
            Self::Proof => 0x1f00_0001,
            Self::Contender => 0x1f00_0002,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Tx),
            2 => Some(Self::Block),
            0x1f00_0001 => Some(Self::Proof),
            0x1f00_0002 => Some(Self::Contender),
            _ => None,
        }
    }
}

/// An inventory entry: a typed hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Inv {
    pub kind: InvKind,
    pub hash: Digest,
}

impl Inv {
    pub fn block(hash: BlockHash) -> Self {
        Self {
            kind: InvKind::Block,
            hash: hash.0,
        }
    }

    pub fn tx(txid: TxId) -> Self {
        Self {
            kind: InvKind::Tx,
            hash: txid.0,
        }
    }

    pub fn proof(id: ProofId) -> Self {
        Self {
            kind: InvKind::Proof,
            hash: id.0,
        }
    }

    pub fn contender(id: ContenderId) -> Self {
        Self {
            kind: InvKind::Contender,
            hash: id.0,
        }
    }
}

impl Write for Inv {
    fn write(&self, buf: &mut impl BufMut) {
        self.kind.code().write(buf);
        self.hash.write(buf);
    }
}

impl Read for Inv {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let code = u32::read(buf)?;
        let kind = InvKind::from_code(code).ok_or(CodecError::InvalidEnum(code))?;
        let hash = Digest::read(buf)?;
        Ok(Self { kind, hash })
    }
}

impl FixedSize for Inv {
    const SIZE: usize = u32::SIZE + Digest::SIZE;
}

/// A request for votes on a list of items.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Poll {
    pub round: u64,
    pub invs: Vec<Inv>,
}

impl Write for Poll {
    fn write(&self, buf: &mut impl BufMut) {
        self.round.write(buf);
        self.invs.write(buf);
    }
}

impl EncodeSize for Poll {
    fn encode_size(&self) -> usize {
        u64::SIZE + self.invs.encode_size()
    }
}

impl Read for Poll {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let round = u64::read(buf)?;
        let invs = Vec::<Inv>::read_range(buf, ..=MAX_INV_SIZE)?;
        Ok(Self { round, invs })
    }
}

/// A vote on one item: the wire code of the vote and the hash of the item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Vote {
    pub code: i32,
    pub hash: Digest,
}

impl Write for Vote {
    fn write(&self, buf: &mut impl BufMut) {
        self.code.write(buf);
        self.hash.write(buf);
    }
}

impl Read for Vote {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let code = i32::read(buf)?;
        let hash = Digest::read(buf)?;
        Ok(Self { code, hash })
    }
}

impl FixedSize for Vote {
    const SIZE: usize = i32::SIZE + Digest::SIZE;
}

/// Votes answering a [Poll], in the order of its invs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub round: u64,
    /// Milliseconds the poller should wait before polling us again.
    pub cooldown: u32,
    pub votes: Vec<Vote>,
}

impl Response {
    /// Digest signed by the responder.
    pub fn digest(&self) -> Digest {
        let mut hasher = Hasher::new();
        hasher.write(&self.round);
        hasher.write(&self.cooldown);
        hasher.write(&self.votes);
        hasher.finalize()
    }

    pub fn sign(self, key: &PrivateKey) -> SignedResponse {
        let signature = key.sign(&self.digest());
        SignedResponse {
            response: self,
            signature,
        }
    }
}

impl Write for Response {
    fn write(&self, buf: &mut impl BufMut) {
        self.round.write(buf);
        self.cooldown.write(buf);
        self.votes.write(buf);
    }
}

impl EncodeSize for Response {
    fn encode_size(&self) -> usize {
        u64::SIZE + u32::SIZE + self.votes.encode_size()
    }
}

impl Read for Response {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let round = u64::read(buf)?;
        let cooldown = u32::read(buf)?;
        let votes = Vec::<Vote>::read_range(buf, ..=MAX_INV_SIZE)?;
        Ok(Self {
            round,
            cooldown,
            votes,
        })
    }
}

/// A [Response] signed by the responder's session key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedResponse {
    pub response: Response,
    pub signature: Signature,
}

impl SignedResponse {
    pub fn verify<V: Verifier>(&self, verifier: &V, key: &PublicKey) -> bool {
        verifier.verify(key, &self.response.digest(), &self.signature)
    }
}

impl Write for SignedResponse {
    fn write(&self, buf: &mut impl BufMut) {
        self.response.write(buf);
        self.signature.write(buf);
    }
}

impl EncodeSize for SignedResponse {
    fn encode_size(&self) -> usize {
        self.response.encode_size() + Signature::SIZE
    }
}

impl Read for SignedResponse {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let response = Response::read(buf)?;
        let signature = Signature::read(buf)?;
        Ok(Self {
            response,
            signature,
        })
    }
}

/// Handshake proving control of a proof's delegated key on one connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hello {
    pub delegation: Delegation,
    pub signature: Signature,
}

impl Hello {
    /// Digest signed by the sender: binds the delegation to both ends of the connection.
    pub fn challenge(delegation: &Delegation, sender_nonce: u64, receiver_nonce: u64) -> Digest {
        let mut hasher = Hasher::new();
        hasher.write(&delegation.id());
        hasher.write(&sender_nonce);
        hasher.write(&receiver_nonce);
        hasher.finalize()
    }

    pub fn sign(
        delegation: Delegation,
        key: &PrivateKey,
        sender_nonce: u64,
        receiver_nonce: u64,
    ) -> Self {
        let signature = key.sign(&Self::challenge(&delegation, sender_nonce, receiver_nonce));
        Self {
            delegation,
            signature,
        }
    }

    /// Verify the delegation and the handshake signature, returning the delegated key.
    pub fn verify<V: Verifier>(
        &self,
        verifier: &V,
        sender_nonce: u64,
        receiver_nonce: u64,
    ) -> Option<PublicKey> {
        let key = self.delegation.verify(verifier).ok()?;
        let challenge = Self::challenge(&self.delegation, sender_nonce, receiver_nonce);
        verifier
            .verify(&key, &challenge, &self.signature)
            .then_some(key)
    }
}

impl Write for Hello {
    fn write(&self, buf: &mut impl BufMut) {
        self.delegation.write(buf);
        self.signature.write(buf);
    }
}

impl EncodeSize for Hello {
    fn encode_size(&self) -> usize {
        self.delegation.encode_size() + Signature::SIZE
    }
}

impl Read for Hello {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let delegation = Delegation::read(buf)?;
        let signature = Signature::read(buf)?;
        Ok(Self {
            delegation,
            signature,
        })
    }
}

/// A message of the avalanche protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Hello(Hello),
    Proof(Proof),
    GetAvaProofs,
    AvaProofs(Vec<Proof>),
    Poll(Poll),
    Response(SignedResponse),
    GetAvaAddr,
    AvaAddr(Vec<NodeId>),
}

impl Message {
    /// Name of the message on the wire.
    pub fn command(&self) -> &'static str {
        match self {
            Self::Hello(_) => "avahello",
            Self::Proof(_) => "avaproof",
            Self::GetAvaProofs => "getavaproofs",
            Self::AvaProofs(_) => "avaproofs",
            Self::Poll(_) => "avapoll",
            Self::Response(_) => "avaresponse",
            Self::GetAvaAddr => "getavaaddr",
            Self::AvaAddr(_) => "avaaddr",
        }
    }
}

impl Write for Message {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Self::Hello(hello) => {
                buf.put_u8(0);
                hello.write(buf);
            }
            Self::Proof(proof) => {
                buf.put_u8(1);
                proof.write(buf);
            }
            Self::GetAvaProofs => buf.put_u8(2),
            Self::AvaProofs(proofs) => {
                buf.put_u8(3);
                proofs.write(buf);
            }
            Self::Poll(poll) => {
                buf.put_u8(4);
                poll.write(buf);
            }
            Self::Response(response) => {
                buf.put_u8(5);
                response.write(buf);
            }
            Self::GetAvaAddr => buf.put_u8(6),
            Self::AvaAddr(nodes) => {
                buf.put_u8(7);
                nodes.write(buf);
            }
        }
    }
}

impl EncodeSize for Message {
    fn encode_size(&self) -> usize {
        1 + match self {
            Self::Hello(hello) => hello.encode_size(),
            Self::Proof(proof) => proof.encode_size(),
            Self::GetAvaProofs => 0,
            Self::AvaProofs(proofs) => proofs.encode_size(),
            Self::Poll(poll) => poll.encode_size(),
            Self::Response(response) => response.encode_size(),
            Self::GetAvaAddr => 0,
            Self::AvaAddr(nodes) => nodes.encode_size(),
        }
    }
}

impl Read for Message {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            0 => Ok(Self::Hello(Hello::read(buf)?)),
            1 => Ok(Self::Proof(Proof::read(buf)?)),
            2 => Ok(Self::GetAvaProofs),
            3 => Ok(Self::AvaProofs(Vec::<Proof>::read_range(
                buf,
                ..=MAX_AVAPROOFS,
            )?)),
            4 => Ok(Self::Poll(Poll::read(buf)?)),
            5 => Ok(Self::Response(SignedResponse::read(buf)?)),
            6 => Ok(Self::GetAvaAddr),
            7 => Ok(Self::AvaAddr(Vec::<NodeId>::read_range(
                buf,
                ..=MAX_ADDR_TO_SEND,
            )?)),
            tag => Err(CodecError::InvalidEnum(tag as u32)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proof::ProofBuilder;
    use crate::types::OutPoint;
    use avalanche_codec::{DecodeExt, Encode};
    use avalanche_cryptography::{hash, Ed25519};
    use bytes::Bytes;

    fn proof(master: &PrivateKey) -> Proof {
        let mut builder = ProofBuilder::new(0, 0, master.clone(), Bytes::new());
        builder.add_utxo(OutPoint::default(), 1, 0, false, PrivateKey::from_seed(50));
        builder.build()
    }

    #[test]
    fn test_inv_layout() {
        let inv = Inv::proof(ProofId(hash(b"proof")));
        let encoded = inv.encode();
        assert_eq!(&encoded[..4], &[0x01, 0x00, 0x00, 0x1f]);
        assert_eq!(Inv::decode(encoded).unwrap(), inv);

        let mut unknown = Vec::new();
        3u32.write(&mut unknown);
        Digest::ZERO.write(&mut unknown);
        assert_eq!(
            Inv::decode(Bytes::from(unknown)),
            Err(CodecError::InvalidEnum(3))
        );

        let contender = Inv::contender(ContenderId(hash(b"contender")));
        assert_eq!(&contender.encode()[..4], &[0x02, 0x00, 0x00, 0x1f]);
    }

    #[test]
    fn test_message_codec() {
        let master = PrivateKey::from_seed(0);
        let messages = vec![
            Message::Proof(proof(&master)),
            Message::GetAvaProofs,
            Message::AvaProofs(vec![proof(&master), proof(&PrivateKey::from_seed(1))]),
            Message::Poll(Poll {
                round: 7,
                invs: vec![Inv::block(BlockHash(hash(b"block"))), Inv::tx(TxId(hash(b"tx")))],
            }),
            Message::Response(
                Response {
                    round: 7,
                    cooldown: 100,
                    votes: vec![Vote {
                        code: -1,
                        hash: hash(b"block"),
                    }],
                }
                .sign(&master),
            ),
            Message::GetAvaAddr,
            Message::AvaAddr(vec![3, 1 << 40]),
        ];
        for message in messages {
            let decoded = Message::decode(message.encode()).unwrap();
            assert_eq!(decoded, message, "{}", message.command());
        }
    }

    #[test]
    fn test_response_signature_covers_content() {
        let key = PrivateKey::from_seed(3);
        let signed = Response {
            round: 1,
            cooldown: 0,
            votes: vec![Vote {
                code: 0,
                hash: hash(b"item"),
            }],
        }
        .sign(&key);
        assert!(signed.verify(&Ed25519, &key.public_key()));
        assert!(!signed.verify(&Ed25519, &PrivateKey::from_seed(4).public_key()));

        let mut tampered = signed.clone();
        tampered.response.votes[0].code = 1;
        assert!(!tampered.verify(&Ed25519, &key.public_key()));
        tampered = signed;
        tampered.response.round = 2;
        assert!(!tampered.verify(&Ed25519, &key.public_key()));
    }

    #[test]
    fn test_hello_binds_nonces() {
        let master = PrivateKey::from_seed(0);
        let session = PrivateKey::from_seed(1);
        let delegation = Delegation::from_proof(&proof(&master))
            .delegate(&master, session.public_key())
            .unwrap();
        let hello = Hello::sign(delegation, &session, 10, 20);
        assert_eq!(hello.verify(&Ed25519, 10, 20), Some(session.public_key()));
        assert_eq!(hello.verify(&Ed25519, 20, 10), None);

        let decoded = Message::decode(Message::Hello(hello.clone()).encode()).unwrap();
        assert_eq!(decoded, Message::Hello(hello));

        // Signed by a key that is not delegated.
        let forged = Hello::sign(
            Delegation::from_proof(&proof(&master)),
            &session,
            10,
            20,
        );
        assert_eq!(forged.verify(&Ed25519, 10, 20), None);
    }

    #[test]
    fn test_unknown_tag() {
        assert_eq!(
            Message::decode(Bytes::from_static(&[9])),
            Err(CodecError::InvalidEnum(9))
        );
    }
}
