//! Variable-length integers.
//!
//! Seven data bits per byte, least significant group first, bit 7 set on
//! every byte except the last. A `u32` takes at most five bytes.

/// Longest encoding of a `u32`
pub const MAX_VARINT_LEN: usize = 5;

/// Encode `value` into `out`, returning the number of bytes used
pub fn encode_u32(mut value: u32, out: &mut [u8; MAX_VARINT_LEN]) -> usize {
    let mut n = 0;
    while value > 0x7F {
        out[n] = (value as u8 & 0x7F) | 0x80;
        value >>= 7;
        n += 1;
    }
    out[n] = value as u8;
    n + 1
}

/// Append the encoding of `value` to a bounded buffer
pub(crate) fn push_u32<const N: usize>(buf: &mut heapless::Vec<u8, N>, value: u32) -> Result<(), ()> {
    let mut raw = [0u8; MAX_VARINT_LEN];
    let n = encode_u32(value, &mut raw);
    buf.extend_from_slice(&raw[..n])
}

/// Decode a value from the front of `input`.
///
/// Returns the value and the number of bytes consumed, or `None` when the
/// input ends early or the encoding does not fit in 32 bits.
pub fn decode_u32(input: &[u8]) -> Option<(u32, usize)> {
    let mut value = 0u32;
    for (i, &byte) in input.iter().enumerate().take(MAX_VARINT_LEN) {
        let bits = u32::from(byte & 0x7F);
        if i == MAX_VARINT_LEN - 1 && bits > 0x0F {
            return None;
        }
        value |= bits << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_encodings() {
        let mut out = [0u8; MAX_VARINT_LEN];
        assert_eq!(encode_u32(0, &mut out), 1);
        assert_eq!(out[0], 0);

        assert_eq!(encode_u32(300, &mut out), 2);
        assert_eq!(&out[..2], &[0xAC, 0x02]);

        assert_eq!(encode_u32(u32::MAX, &mut out), 5);
        assert_eq!(out, [0xFF, 0xFF, 0xFF, 0xFF, 0x0F]);
    }

    #[test]
    fn decode_reports_consumed_bytes() {
        assert_eq!(decode_u32(&[0xAC, 0x02, 0x99]), Some((300, 2)));
        assert_eq!(decode_u32(&[0xFF, 0xFF, 0xFF, 0xFF, 0x0F]), Some((u32::MAX, 5)));
    }

    #[test]
    fn decode_rejects_truncated_and_overlong() {
        assert_eq!(decode_u32(&[]), None);
        assert_eq!(decode_u32(&[0x80]), None);
        assert_eq!(decode_u32(&[0xFF, 0xFF, 0xFF, 0xFF, 0x1F]), None);
    }
}
