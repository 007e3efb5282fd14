//! Little-endian buffer primitives shared by the ASDU and frame codecs
//!
//! All multi-octet scalars on the wire are little-endian; floats are
//! IEEE-754 binary32. The reader is a bounds-checked cursor that fails with
//! [`AsduDecodeError::TruncatedObject`] instead of panicking.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};

use crate::common::AsduDecodeError;
use crate::params::InfoObjAddrSize;

/// Bounds-checked little-endian reader over a byte slice
#[derive(Debug)]
pub(crate) struct Reader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    pub fn remaining(&self) -> usize {
        self.cursor.get_ref().len() - self.cursor.position() as usize
    }

    pub fn read_u8(&mut self) -> Result<u8, AsduDecodeError> {
        self.cursor
            .read_u8()
            .map_err(|_| AsduDecodeError::TruncatedObject)
    }

    pub fn read_u16_le(&mut self) -> Result<u16, AsduDecodeError> {
        self.cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| AsduDecodeError::TruncatedObject)
    }

    pub fn read_i16_le(&mut self) -> Result<i16, AsduDecodeError> {
        self.cursor
            .read_i16::<LittleEndian>()
            .map_err(|_| AsduDecodeError::TruncatedObject)
    }

    pub fn read_i32_le(&mut self) -> Result<i32, AsduDecodeError> {
        self.cursor
            .read_i32::<LittleEndian>()
            .map_err(|_| AsduDecodeError::TruncatedObject)
    }

    pub fn read_u32_le(&mut self) -> Result<u32, AsduDecodeError> {
        self.cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| AsduDecodeError::TruncatedObject)
    }

    pub fn read_f32_le(&mut self) -> Result<f32, AsduDecodeError> {
        self.cursor
            .read_f32::<LittleEndian>()
            .map_err(|_| AsduDecodeError::TruncatedObject)
    }

    /// Three-octet little-endian unsigned value (IOA, file length)
    pub fn read_u24_le(&mut self) -> Result<u32, AsduDecodeError> {
        self.cursor
            .read_u24::<LittleEndian>()
            .map_err(|_| AsduDecodeError::TruncatedObject)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], AsduDecodeError> {
        if self.remaining() < len {
            return Err(AsduDecodeError::TruncatedObject);
        }
        let pos = self.cursor.position() as usize;
        let data = *self.cursor.get_ref();
        self.cursor.set_position((pos + len) as u64);
        Ok(&data[pos..pos + len])
    }

    /// Information object address sized per the active parameter set
    pub fn read_ioa(&mut self, size: InfoObjAddrSize) -> Result<u32, AsduDecodeError> {
        match size {
            InfoObjAddrSize::OneOctet => Ok(self.read_u8()? as u32),
            InfoObjAddrSize::TwoOctets => Ok(self.read_u16_le()? as u32),
            InfoObjAddrSize::ThreeOctets => self.read_u24_le(),
        }
    }
}

/// Write a three-octet little-endian unsigned value
pub(crate) fn put_u24_le(buf: &mut BytesMut, value: u32) {
    buf.put_u8((value & 0xFF) as u8);
    buf.put_u8(((value >> 8) & 0xFF) as u8);
    buf.put_u8(((value >> 16) & 0xFF) as u8);
}

/// Write an information object address sized per the active parameter set.
/// The caller has already validated that the address fits.
pub(crate) fn put_ioa(buf: &mut BytesMut, ioa: u32, size: InfoObjAddrSize) {
    match size {
        InfoObjAddrSize::OneOctet => buf.put_u8(ioa as u8),
        InfoObjAddrSize::TwoOctets => buf.put_u16_le(ioa as u16),
        InfoObjAddrSize::ThreeOctets => put_u24_le(buf, ioa),
    }
}

/// Largest address representable with the given IOA size
pub(crate) fn max_ioa(size: InfoObjAddrSize) -> u32 {
    match size {
        InfoObjAddrSize::OneOctet => 0xFF,
        InfoObjAddrSize::TwoOctets => 0xFFFF,
        InfoObjAddrSize::ThreeOctets => 0xFF_FFFF,
    }
}

/// Interpret a raw 16-bit normalized value as a fraction in [-1, 1)
pub fn normalized_from_raw(raw: i16) -> f32 {
    raw as f32 / 32768.0
}

/// Convert a fraction to the raw 16-bit normalized representation, saturating
pub fn normalized_to_raw(value: f32) -> i16 {
    let scaled = value * 32768.0;
    if scaled >= 32767.0 {
        32767
    } else if scaled <= -32768.0 {
        -32768
    } else {
        scaled as i16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_le_scalars() {
        let data = [0x01, 0x34, 0x12, 0x00, 0x00, 0x80, 0x3F];
        let mut r = Reader::new(&data);
        assert_eq!(r.read_u8().unwrap(), 0x01);
        assert_eq!(r.read_u16_le().unwrap(), 0x1234);
        assert_eq!(r.read_f32_le().unwrap(), 1.0);
        assert_eq!(r.remaining(), 0);
        assert_eq!(r.read_u8(), Err(AsduDecodeError::TruncatedObject));
    }

    #[test]
    fn reader_u24() {
        let data = [0x64, 0x00, 0x00];
        let mut r = Reader::new(&data);
        assert_eq!(r.read_u24_le().unwrap(), 100);
    }

    #[test]
    fn ioa_round_trip_all_sizes() {
        for (size, ioa) in [
            (InfoObjAddrSize::OneOctet, 0xAB),
            (InfoObjAddrSize::TwoOctets, 0xBEEF),
            (InfoObjAddrSize::ThreeOctets, 0x01_0203),
        ] {
            let mut buf = BytesMut::new();
            put_ioa(&mut buf, ioa, size);
            assert_eq!(buf.len(), size as usize);
            let mut r = Reader::new(&buf);
            assert_eq!(r.read_ioa(size).unwrap(), ioa);
        }
    }

    #[test]
    fn normalized_conversions_saturate() {
        assert_eq!(normalized_to_raw(1.0), 32767);
        assert_eq!(normalized_to_raw(-1.0), -32768);
        assert_eq!(normalized_to_raw(0.0), 0);
        let half = normalized_from_raw(16384);
        assert!((half - 0.5).abs() < 1e-6);
    }
}
