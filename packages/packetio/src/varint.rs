//! Variable-length unsigned integers used in snapshots.
//!
//! Big-endian base-128: seven value bits per byte, most significant group
//! first, with the 0x80 bit set on every byte except the last.

use gate_packet::{Error, Result};

const MAX_LEN: usize = 5;

/// Append `value` to `out`.
pub fn put(out: &mut Vec<u8>, mut value: u32) {
    let mut tmp = [0u8; MAX_LEN];
    let mut i = MAX_LEN;
    loop {
        i -= 1;
        tmp[i] = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            break;
        }
    }
    for b in &mut tmp[i..MAX_LEN - 1] {
        *b |= 0x80;
    }
    out.extend_from_slice(&tmp[i..]);
}

/// Encoded length of `value`.
pub fn len(value: u32) -> usize {
    let bits = 32 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

/// Decode one value from the front of `input`, returning it and the rest.
pub fn scan(input: &[u8]) -> Result<(u32, &[u8])> {
    let mut value: u64 = 0;
    for (i, &b) in input.iter().enumerate().take(MAX_LEN) {
        value = (value << 7) | u64::from(b & 0x7f);
        if value > u64::from(u32::MAX) {
            return Err(invalid("varint overflows u32"));
        }
        if b & 0x80 == 0 {
            return Ok((value as u32, &input[i + 1..]));
        }
    }
    if input.len() >= MAX_LEN {
        Err(invalid("varint is too long"))
    } else {
        Err(invalid("varint is truncated"))
    }
}

/// Decode a value that must fit in an `i32`.
pub fn scan_i32(input: &[u8]) -> Result<(i32, &[u8])> {
    let (value, rest) = scan(input)?;
    let value = i32::try_from(value).map_err(|_| invalid("varint overflows i32"))?;
    Ok((value, rest))
}

/// Decode a length prefix and split off that many bytes.
pub fn scan_bytes(input: &[u8]) -> Result<(&[u8], &[u8])> {
    let (n, rest) = scan(input)?;
    let n = n as usize;
    if rest.len() < n {
        return Err(invalid("snapshot field is truncated"));
    }
    Ok(rest.split_at(n))
}

pub(crate) fn invalid(detail: &str) -> Error {
    Error::internal("snapshot is invalid", detail)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: u32) -> Vec<u8> {
        let mut out = Vec::new();
        put(&mut out, value);
        out
    }

    #[test]
    fn small_values_are_one_byte() {
        assert_eq!(encode(0), vec![0]);
        assert_eq!(encode(127), vec![0x7f]);
    }

    #[test]
    fn big_endian_groups() {
        assert_eq!(encode(128), vec![0x81, 0x00]);
        assert_eq!(encode(300), vec![0x82, 0x2c]);
        assert_eq!(encode(u32::MAX), vec![0x8f, 0xff, 0xff, 0xff, 0x7f]);
    }

    #[test]
    fn len_matches_encoding() {
        for value in [0, 1, 127, 128, 16383, 16384, u32::MAX] {
            assert_eq!(len(value), encode(value).len(), "value {value}");
        }
    }

    #[test]
    fn scan_returns_rest() {
        let mut buf = encode(300);
        buf.extend_from_slice(b"xy");
        let (value, rest) = scan(&buf).unwrap();
        assert_eq!(value, 300);
        assert_eq!(rest, b"xy");
    }

    #[test]
    fn scan_rejects_truncated() {
        assert!(scan(&[0x81]).is_err());
        assert!(scan(&[]).is_err());
    }

    #[test]
    fn scan_rejects_overflow() {
        assert!(scan(&[0x90, 0x80, 0x80, 0x80, 0x00]).is_err());
        assert!(scan(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x00]).is_err());
    }

    #[test]
    fn scan_i32_bounds() {
        assert_eq!(scan_i32(&encode(i32::MAX as u32)).unwrap().0, i32::MAX);
        assert!(scan_i32(&encode(i32::MAX as u32 + 1)).is_err());
    }

    #[test]
    fn scan_bytes_splits() {
        let mut buf = encode(3);
        buf.extend_from_slice(b"abcd");
        let (field, rest) = scan_bytes(&buf).unwrap();
        assert_eq!(field, b"abc");
        assert_eq!(rest, b"d");
        assert!(scan_bytes(&[5, 1]).is_err());
    }
}
