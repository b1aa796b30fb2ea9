//! Serialize avalanche wire and storage structures.
//!
//! # Overview
//!
//! A binary serialization library that:
//! - Serializes structured data with the node's peer-to-peer layout (little-endian integers,
//!   CompactSize length prefixes)
//! - Deserializes untrusted binary input with explicit bounds on every collection
//!
//! # Example
//!
//! ```
//! use bytes::{Buf, BufMut};
//! use avalanche_codec::{DecodeExt, Encode, EncodeSize, Error, ReadExt, ReadRangeExt, Read, Write};
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Item {
//!     height: u32,
//!     ids: Vec<u64>,
//! }
//!
//! impl Write for Item {
//!     fn write(&self, buf: &mut impl BufMut) {
//!         self.height.write(buf);
//!         self.ids.write(buf);
//!     }
//! }
//!
//! impl EncodeSize for Item {
//!     fn encode_size(&self) -> usize {
//!         self.height.encode_size() + self.ids.encode_size()
//!     }
//! }
//!
//! impl Read for Item {
//!     type Cfg = ();
//!
//!     fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
//!         let height = u32::read(buf)?;
//!         let ids = Vec::<u64>::read_range(buf, ..=16)?;
//!         Ok(Self { height, ids })
//!     }
//! }
//!
//! let item = Item { height: 7, ids: vec![1, 2] };
//! assert_eq!(Item::decode(item.encode()).unwrap(), item);
//! ```

pub mod codec;
pub mod compact;
pub mod config;
pub mod error;
pub mod types;

pub use codec::{
    Codec, Decode, DecodeExt, Encode, EncodeSize, FixedSize, Read, ReadExt, ReadRangeExt, Write,
};
pub use config::RangeCfg;
pub use error::Error;
