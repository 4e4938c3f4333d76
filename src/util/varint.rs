//! Variable-length integer encoding.
//!
//! Seven bits per byte, least significant group first, high bit set on every
//! byte except the last. Used by the prefix-coded term lists and by the
//! structured file writer.

use crate::error::{PalisadeError, Result};

/// Append the varint encoding of `value` to `buf`, returning the number of bytes written.
pub fn write_u64(buf: &mut Vec<u8>, value: u64) -> usize {
    let start = buf.len();
    let mut val = value;

    loop {
        let mut byte = (val & 0x7F) as u8;
        val >>= 7;

        if val != 0 {
            byte |= 0x80; // continuation
        }

        buf.push(byte);

        if val == 0 {
            break;
        }
    }

    buf.len() - start
}

/// Append the varint encoding of `value` to `buf`.
pub fn write_u32(buf: &mut Vec<u8>, value: u32) -> usize {
    write_u64(buf, value as u64)
}

/// Encode `value` into a fresh buffer.
pub fn encode_u64(value: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(10);
    write_u64(&mut bytes, value);
    bytes
}

/// Decode a varint from the start of `bytes`, returning the value and the bytes consumed.
pub fn decode_u64(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut pos = 0;
    let value = read_u64(bytes, &mut pos)?;
    Ok((value, pos))
}

/// Decode a varint at `*pos`, advancing `pos` past it.
pub fn read_u64(bytes: &[u8], pos: &mut usize) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0;

    loop {
        let byte = *bytes
            .get(*pos)
            .ok_or_else(|| PalisadeError::serialization("Incomplete VarInt"))?;
        *pos += 1;

        if shift >= 64 {
            return Err(PalisadeError::serialization("VarInt overflow"));
        }

        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok(result);
        }

        shift += 7;
    }
}

/// Decode a varint that must fit in 32 bits.
pub fn read_u32(bytes: &[u8], pos: &mut usize) -> Result<u32> {
    let value = read_u64(bytes, pos)?;
    u32::try_from(value).map_err(|_| PalisadeError::serialization("VarInt overflow"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_reads() {
        let mut buf = Vec::new();
        write_u32(&mut buf, 3);
        write_u32(&mut buf, 300);
        write_u64(&mut buf, u64::MAX);

        let mut pos = 0;
        assert_eq!(read_u32(&buf, &mut pos).unwrap(), 3);
        assert_eq!(read_u32(&buf, &mut pos).unwrap(), 300);
        assert_eq!(read_u64(&buf, &mut pos).unwrap(), u64::MAX);
        assert_eq!(pos, buf.len());
    }

    #[test]
    fn test_encoding_efficiency() {
        assert_eq!(encode_u64(0).len(), 1);
        assert_eq!(encode_u64(127).len(), 1);
        assert_eq!(encode_u64(128).len(), 2);
        assert_eq!(encode_u64(16384).len(), 3);
        assert_eq!(encode_u64(u64::MAX).len(), 10);
    }

    #[test]
    fn test_incomplete_varint() {
        let incomplete = vec![0x80];
        assert!(decode_u64(&incomplete).is_err());
    }

    #[test]
    fn test_u32_overflow() {
        let mut buf = Vec::new();
        write_u64(&mut buf, u32::MAX as u64 + 1);
        let mut pos = 0;
        assert!(read_u32(&buf, &mut pos).is_err());
    }
}
