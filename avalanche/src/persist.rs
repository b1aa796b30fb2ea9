//! Persistence of the peer set (`avapeers.dat`).
//!
//! Layout (version 1): the version as a u64, then a length-prefixed list of records, each
//! made of a proof, a finalized flag and two timestamps in seconds since the unix epoch
//! (registration time and next possible conflict time).
//!
//! The file is a hint, not a trusted cache: loaded proofs go through the normal registration
//! path.

use crate::{peers::PeerManager, proof::Proof};
use avalanche_codec::{
    DecodeExt, EncodeSize, Error as CodecError, FixedSize, Read, ReadExt, ReadRangeExt, Write,
};
use avalanche_cryptography::Verifier;
use bytes::{Buf, BufMut, Bytes};
use std::{
    fs,
    path::Path,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tracing::debug;

/// Version written by [dump].
pub const VERSION: u64 = 1;

/// Maximum number of records read from a file.
pub const MAX_RECORDS: usize = 100_000;

/// Default file name, relative to the data directory.
pub const FILE_NAME: &str = "avapeers.dat";

#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("unsupported avapeers.dat version: {0}")]
    UnsupportedVersion(u64),
}

/// A bound proof and the metadata needed to restore its peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerRecord {
    pub proof: Proof,
    pub has_finalized: bool,
    pub registration_time: SystemTime,
    pub next_possible_conflict_time: SystemTime,
}

fn to_secs(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs().min(i64::MAX as u64) as i64,
        Err(_) => 0,
    }
}

fn from_secs(secs: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

impl Write for PeerRecord {
    fn write(&self, buf: &mut impl BufMut) {
        self.proof.write(buf);
        self.has_finalized.write(buf);
        to_secs(self.registration_time).write(buf);
        to_secs(self.next_possible_conflict_time).write(buf);
    }
}

impl EncodeSize for PeerRecord {
    fn encode_size(&self) -> usize {
        self.proof.encode_size() + bool::SIZE + 2 * i64::SIZE
    }
}

impl Read for PeerRecord {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let proof = Proof::read(buf)?;
        let has_finalized = bool::read(buf)?;
        let registration_time = from_secs(i64::read(buf)?);
        let next_possible_conflict_time = from_secs(i64::read(buf)?);
        Ok(Self {
            proof,
            has_finalized,
            registration_time,
            next_possible_conflict_time,
        })
    }
}

/// Records for every bound proof, ordered by proof id.
pub fn records<V: Verifier>(peers: &PeerManager<V>) -> Vec<PeerRecord> {
    let mut records: Vec<PeerRecord> = peers
        .peers()
        .map(|peer| PeerRecord {
            proof: peer.proof.as_ref().clone(),
            has_finalized: peer.has_finalized,
            registration_time: peer.registration_time,
            next_possible_conflict_time: peer.next_possible_conflict_time,
        })
        .collect();
    records.sort_by_key(|record| record.proof.id());
    records
}

/// Serialize a peer set.
pub fn encode(records: &[PeerRecord]) -> Bytes {
    let mut buf = Vec::new();
    VERSION.write(&mut buf);
    records.to_vec().write(&mut buf);
    Bytes::from(buf)
}

struct File {
    records: Vec<PeerRecord>,
}

impl Read for File {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        // Checked by [decode] before the body is parsed.
        u64::read(buf)?;
        let records = Vec::<PeerRecord>::read_range(buf, ..=MAX_RECORDS)?;
        Ok(Self { records })
    }
}

/// Deserialize a peer set.
pub fn decode(bytes: Bytes) -> Result<Vec<PeerRecord>, Error> {
    let mut peek = bytes.clone();
    let version = u64::read(&mut peek)?;
    if version != VERSION {
        return Err(Error::UnsupportedVersion(version));
    }
    Ok(File::decode(bytes)?.records)
}

/// Write `records` to `path` atomically (through a temporary file).
pub fn dump(path: &Path, records: &[PeerRecord]) -> Result<(), Error> {
    let temp = path.with_extension("dat.new");
    fs::write(&temp, encode(records))?;
    fs::rename(&temp, path)?;
    debug!(path = %path.display(), count = records.len(), "dumped avalanche peers");
    Ok(())
}

/// Read the records stored at `path`.
pub fn load(path: &Path) -> Result<Vec<PeerRecord>, Error> {
    let bytes = fs::read(path)?;
    decode(Bytes::from(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{self, STAKE_AMOUNT};
    use avalanche_cryptography::PrivateKey;

    fn record(seed: u64, finalized: bool) -> PeerRecord {
        let stakers = mocks::keys(200 + seed, 1);
        let (_, utxos) = mocks::genesis(&stakers, STAKE_AMOUNT);
        let proof = mocks::proof(
            &PrivateKey::from_seed(seed),
            seed,
            &[(utxos[0], &stakers[0])],
            STAKE_AMOUNT,
        );
        PeerRecord {
            proof: proof.as_ref().clone(),
            has_finalized: finalized,
            registration_time: from_secs(1_000 + seed as i64),
            next_possible_conflict_time: from_secs(1_060 + seed as i64),
        }
    }

    #[test]
    fn test_layout() {
        let records = vec![record(1, true), record(2, false)];
        let encoded = encode(&records);
        assert_eq!(&encoded[..8], &1u64.to_le_bytes());
        assert_eq!(encoded[8], 2);
        assert_eq!(decode(encoded).unwrap(), records);
    }

    #[test]
    fn test_unsupported_version() {
        let mut buf = Vec::new();
        2u64.write(&mut buf);
        Vec::<PeerRecord>::new().write(&mut buf);
        assert!(matches!(
            decode(Bytes::from(buf)),
            Err(Error::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_truncated_file() {
        let encoded = encode(&[record(1, false)]);
        let truncated = encoded.slice(..encoded.len() - 1);
        assert!(matches!(decode(truncated), Err(Error::Codec(_))));
    }

    #[test]
    fn test_dump_and_load() {
        let dir = std::env::temp_dir().join(format!("avapeers-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(FILE_NAME);
        let records = vec![record(3, false)];
        dump(&path, &records).unwrap();
        assert!(!path.with_extension("dat.new").exists());
        assert_eq!(load(&path).unwrap(), records);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_negative_times_clamp_to_epoch() {
        assert_eq!(from_secs(-5), UNIX_EPOCH);
        assert_eq!(to_secs(UNIX_EPOCH), 0);
    }
}
