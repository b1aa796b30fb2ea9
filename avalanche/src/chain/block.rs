//! Blocks and transactions.
//!
//! Outputs are locked to a public key rather than a script: the stake signatures inside a
//! proof are checked against that key. Script and signature validation of spends is not
//! performed.

use crate::types::{Amount, BlockHash, OutPoint, TxId};
use avalanche_codec::{
    Encode, EncodeSize, Error as CodecError, FixedSize, Read, ReadExt, ReadRangeExt, Write,
};
use avalanche_cryptography::{hash, Digest, Hasher, PublicKey};
use bytes::{Buf, BufMut};

/// Maximum number of inputs or outputs in a transaction.
pub const MAX_TX_IO: usize = 10_000;

/// Maximum number of transactions in a block.
pub const MAX_BLOCK_TXS: usize = 100_000;

/// Amount created by each coinbase (before fees).
pub const BLOCK_SUBSIDY: Amount = 3_125_000_000_000;

/// A transaction output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub amount: Amount,
    pub owner: PublicKey,
}

impl Write for TxOut {
    fn write(&self, buf: &mut impl BufMut) {
        self.amount.write(buf);
        self.owner.write(buf);
    }
}

impl Read for TxOut {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let amount = Amount::read(buf)?;
        let owner = PublicKey::read(buf)?;
        Ok(Self { amount, owner })
    }
}

impl FixedSize for TxOut {
    const SIZE: usize = Amount::SIZE + PublicKey::SIZE;
}

/// A transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub inputs: Vec<OutPoint>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// Create a coinbase paying `outputs`. The height makes every coinbase unique.
    pub fn coinbase(height: u32, outputs: Vec<TxOut>) -> Self {
        Self {
            inputs: Vec::new(),
            outputs,
            lock_time: height,
        }
    }

    pub fn id(&self) -> TxId {
        TxId(hash(&self.encode()))
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Sum of output amounts, saturating on overflow.
    pub fn output_value(&self) -> Amount {
        self.outputs
            .iter()
            .fold(0, |total: Amount, o| total.saturating_add(o.amount))
    }

    /// Outpoints created by this transaction.
    pub fn outpoints(&self) -> impl Iterator<Item = (OutPoint, &TxOut)> + '_ {
        let txid = self.id();
        self.outputs
            .iter()
            .enumerate()
            .map(move |(i, out)| (OutPoint::new(txid, i as u32), out))
    }
}

impl Write for Transaction {
    fn write(&self, buf: &mut impl BufMut) {
        self.inputs.write(buf);
        self.outputs.write(buf);
        self.lock_time.write(buf);
    }
}

impl EncodeSize for Transaction {
    fn encode_size(&self) -> usize {
        self.inputs.encode_size() + self.outputs.encode_size() + u32::SIZE
    }
}

impl Read for Transaction {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let inputs = Vec::<OutPoint>::read_range(buf, ..=MAX_TX_IO)?;
        let outputs = Vec::<TxOut>::read_range(buf, 1..=MAX_TX_IO)?;
        let lock_time = u32::read(buf)?;
        Ok(Self {
            inputs,
            outputs,
            lock_time,
        })
    }
}

/// A block header.
///
/// `work` stands in for the proof-of-work target: chain selection sums it along each branch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub parent: BlockHash,
    pub height: u32,
    pub timestamp: u64,
    pub work: u64,
    pub nonce: u64,
    pub merkle_root: Digest,
}

impl Write for Header {
    fn write(&self, buf: &mut impl BufMut) {
        self.parent.write(buf);
        self.height.write(buf);
        self.timestamp.write(buf);
        self.work.write(buf);
        self.nonce.write(buf);
        self.merkle_root.write(buf);
    }
}

impl Read for Header {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            parent: BlockHash::read(buf)?,
            height: u32::read(buf)?,
            timestamp: u64::read(buf)?,
            work: u64::read(buf)?,
            nonce: u64::read(buf)?,
            merkle_root: Digest::read(buf)?,
        })
    }
}

impl FixedSize for Header {
    const SIZE: usize =
        BlockHash::SIZE + u32::SIZE + u64::SIZE + u64::SIZE + u64::SIZE + Digest::SIZE;
}

/// A block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Build a block, computing its transaction commitment.
    pub fn new(
        parent: BlockHash,
        height: u32,
        timestamp: u64,
        work: u64,
        nonce: u64,
        transactions: Vec<Transaction>,
    ) -> Self {
        let merkle_root = Self::commitment(&transactions);
        Self {
            header: Header {
                parent,
                height,
                timestamp,
                work,
                nonce,
                merkle_root,
            },
            transactions,
        }
    }

    /// Commitment to an ordered list of transactions.
    pub fn commitment(transactions: &[Transaction]) -> Digest {
        let mut hasher = Hasher::new();
        for tx in transactions {
            hasher.write(&tx.id());
        }
        hasher.finalize()
    }

    pub fn hash(&self) -> BlockHash {
        BlockHash(hash(&self.header.encode()))
    }

    pub fn parent(&self) -> BlockHash {
        self.header.parent
    }

    pub fn height(&self) -> u32 {
        self.header.height
    }
}

impl Write for Block {
    fn write(&self, buf: &mut impl BufMut) {
        self.header.write(buf);
        self.transactions.write(buf);
    }
}

impl EncodeSize for Block {
    fn encode_size(&self) -> usize {
        Header::SIZE + self.transactions.encode_size()
    }
}

impl Read for Block {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let header = Header::read(buf)?;
        let transactions = Vec::<Transaction>::read_range(buf, 1..=MAX_BLOCK_TXS)?;
        if Self::commitment(&transactions) != header.merkle_root {
            return Err(CodecError::Invalid("Block", "commitment mismatch"));
        }
        Ok(Self {
            header,
            transactions,
        })
    }
}

/// An unspent output, as seen by the active chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Coin {
    pub output: TxOut,
    pub height: u32,
    pub is_coinbase: bool,
}
