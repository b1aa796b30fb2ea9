//! CompactSize length prefixes.
//!
//! Values below `0xfd` occupy a single byte. Larger values are written as a marker byte
//! followed by a little-endian `u16` (`0xfd`), `u32` (`0xfe`) or `u64` (`0xff`). Decoding
//! rejects encodings that are not the shortest possible and values above [MAX_SIZE].

use crate::{codec::at_least, Error};
use bytes::{Buf, BufMut};

/// Largest length accepted when decoding.
pub const MAX_SIZE: u64 = 0x0200_0000;

/// Writes `value` as a CompactSize.
pub fn write(value: u64, buf: &mut impl BufMut) {
    match value {
        0..=0xfc => buf.put_u8(value as u8),
        0xfd..=0xffff => {
            buf.put_u8(0xfd);
            buf.put_u16_le(value as u16);
        }
        0x1_0000..=0xffff_ffff => {
            buf.put_u8(0xfe);
            buf.put_u32_le(value as u32);
        }
        _ => {
            buf.put_u8(0xff);
            buf.put_u64_le(value);
        }
    }
}

/// Returns the number of bytes needed to encode `value`.
pub fn size(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Reads a CompactSize, enforcing canonical encoding and [MAX_SIZE].
pub fn read(buf: &mut impl Buf) -> Result<u64, Error> {
    at_least(buf, 1)?;
    let value = match buf.get_u8() {
        0xfd => {
            at_least(buf, 2)?;
            let value = buf.get_u16_le() as u64;
            if value < 0xfd {
                return Err(Error::NonCanonicalCompactSize);
            }
            value
        }
        0xfe => {
            at_least(buf, 4)?;
            let value = buf.get_u32_le() as u64;
            if value < 0x1_0000 {
                return Err(Error::NonCanonicalCompactSize);
            }
            value
        }
        0xff => {
            at_least(buf, 8)?;
            let value = buf.get_u64_le();
            if value < 0x1_0000_0000 {
                return Err(Error::NonCanonicalCompactSize);
            }
            value
        }
        value => value as u64,
    };
    if value > MAX_SIZE {
        return Err(Error::CompactSizeTooLarge(value));
    }
    Ok(value)
}

/// Reads a CompactSize and converts it to a collection length.
pub fn read_len(buf: &mut impl Buf) -> Result<usize, Error> {
    let value = read(buf)?;
    usize::try_from(value).map_err(|_| Error::CompactSizeTooLarge(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0, &[0x00]; "zero")]
    #[test_case(0xfc, &[0xfc]; "largest single byte")]
    #[test_case(0xfd, &[0xfd, 0xfd, 0x00]; "smallest u16")]
    #[test_case(0xffff, &[0xfd, 0xff, 0xff]; "largest u16")]
    #[test_case(0x1_0000, &[0xfe, 0x00, 0x00, 0x01, 0x00]; "smallest u32")]
    fn test_encoding(value: u64, expected: &[u8]) {
        let mut buf = Vec::new();
        write(value, &mut buf);
        assert_eq!(buf, expected);
        assert_eq!(size(value), expected.len());
        assert_eq!(read(&mut &buf[..]).unwrap(), value);
    }

    #[test]
    fn test_non_canonical() {
        let buf = [0xfd, 0x10, 0x00];
        assert_eq!(read(&mut &buf[..]), Err(Error::NonCanonicalCompactSize));
        let buf = [0xfe, 0xff, 0x00, 0x00, 0x00];
        assert_eq!(read(&mut &buf[..]), Err(Error::NonCanonicalCompactSize));
    }

    #[test]
    fn test_too_large() {
        let mut buf = Vec::new();
        write(MAX_SIZE + 1, &mut buf);
        assert_eq!(
            read(&mut &buf[..]),
            Err(Error::CompactSizeTooLarge(MAX_SIZE + 1))
        );
    }

    #[test]
    fn test_truncated() {
        let buf = [0xfe, 0x00, 0x00];
        assert_eq!(read(&mut &buf[..]), Err(Error::EndOfBuffer));
        let buf: [u8; 0] = [];
        assert_eq!(read(&mut &buf[..]), Err(Error::EndOfBuffer));
    }
}
