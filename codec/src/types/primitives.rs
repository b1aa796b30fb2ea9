//! Codec implementations for Rust primitive types.
//!
//! All integers are written little-endian. Booleans occupy one byte and must decode to
//! exactly `0` or `1`.

use crate::{codec::at_least, Error, FixedSize, Read, Write};
use bytes::{Buf, BufMut};
use paste::paste;

macro_rules! impl_numeric {
    ($type:ty) => {
        paste! {
            impl Write for $type {
                #[inline]
                fn write(&self, buf: &mut impl BufMut) {
                    buf.[<put_ $type _le>](*self);
                }
            }

            impl Read for $type {
                type Cfg = ();

                #[inline]
                fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
                    at_least(buf, std::mem::size_of::<$type>())?;
                    Ok(buf.[<get_ $type _le>]())
                }
            }

            impl FixedSize for $type {
                const SIZE: usize = std::mem::size_of::<$type>();
            }
        }
    };
}

impl_numeric!(u16);
impl_numeric!(u32);
impl_numeric!(u64);
impl_numeric!(i16);
impl_numeric!(i32);
impl_numeric!(i64);

impl Write for u8 {
    #[inline]
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u8(*self);
    }
}

impl Read for u8 {
    type Cfg = ();

    #[inline]
    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
        at_least(buf, 1)?;
        Ok(buf.get_u8())
    }
}

impl FixedSize for u8 {
    const SIZE: usize = 1;
}

impl Write for bool {
    #[inline]
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u8(u8::from(*self));
    }
}

impl Read for bool {
    type Cfg = ();

    #[inline]
    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
        match u8::read_cfg(buf, &())? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(Error::InvalidBool),
        }
    }
}

impl FixedSize for bool {
    const SIZE: usize = 1;
}

impl<const N: usize> Write for [u8; N] {
    #[inline]
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_slice(self);
    }
}

impl<const N: usize> Read for [u8; N] {
    type Cfg = ();

    #[inline]
    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
        at_least(buf, N)?;
        let mut dst = [0; N];
        buf.copy_to_slice(&mut dst);
        Ok(dst)
    }
}

impl<const N: usize> FixedSize for [u8; N] {
    const SIZE: usize = N;
}
