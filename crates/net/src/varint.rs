//! Variable-width integers.
//!
//! Seven payload bits per byte, least significant group first, with the top
//! bit set on every byte except the last. Signed values are zig-zag mapped
//! first so small negative numbers stay short.

use crate::error::DecodeError;

const CONTINUATION: u8 = 0x80;
const PAYLOAD: u8 = 0x7F;

/// Maximum encoded length of a 32-bit value.
pub const MAX_LEN_32: usize = 5;
/// Maximum encoded length of a 64-bit value.
pub const MAX_LEN_64: usize = 10;

/// Append the minimal encoding of `value`.
pub fn encode_u64(mut value: u64, out: &mut Vec<u8>) {
    while value >= u64::from(CONTINUATION) {
        out.push((value as u8 & PAYLOAD) | CONTINUATION);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Append the minimal encoding of `value`.
pub fn encode_u32(value: u32, out: &mut Vec<u8>) {
    encode_u64(u64::from(value), out);
}

/// Number of bytes [`encode_u64`] produces for `value`.
pub fn encoded_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

/// Decode a 32-bit value, returning it with the number of bytes consumed.
pub fn decode_u32(bytes: &[u8]) -> Result<(u32, usize), DecodeError> {
    let (value, used) = decode(bytes, 32)?;
    Ok((value as u32, used))
}

/// Decode a 64-bit value, returning it with the number of bytes consumed.
pub fn decode_u64(bytes: &[u8]) -> Result<(u64, usize), DecodeError> {
    decode(bytes, 64)
}

fn decode(bytes: &[u8], bits: u32) -> Result<(u64, usize), DecodeError> {
    let max_bytes = bits.div_ceil(7) as usize;
    // Bits the last permitted byte may still carry.
    let last_bits = bits - 7 * (max_bytes as u32 - 1);

    let mut value = 0u64;
    for index in 0..max_bytes {
        let Some(&byte) = bytes.get(index) else {
            return Err(DecodeError::UnexpectedEnd {
                needed: index + 1,
                remaining: bytes.len(),
            });
        };
        let group = byte & PAYLOAD;
        if index == max_bytes - 1 {
            if byte & CONTINUATION != 0 {
                return Err(DecodeError::VarIntTooLong { max_bytes });
            }
            if u32::from(group) >> last_bits != 0 {
                return Err(DecodeError::VarIntOverflow { bits });
            }
        }
        value |= u64::from(group) << (7 * index);
        if byte & CONTINUATION == 0 {
            return Ok((value, index + 1));
        }
    }
    Err(DecodeError::VarIntTooLong { max_bytes })
}

/// Map a signed value onto the unsigned range: 0, -1, 1, -2, ... => 0, 1, 2, 3, ...
pub fn zigzag_32(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

/// Inverse of [`zigzag_32`].
pub fn unzigzag_32(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

/// Map a signed value onto the unsigned range.
pub fn zigzag_64(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

/// Inverse of [`zigzag_64`].
pub fn unzigzag_64(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encoded(value: u64) -> Vec<u8> {
        let mut out = Vec::new();
        encode_u64(value, &mut out);
        out
    }

    #[test]
    fn boundary_lengths() {
        assert_eq!(encoded(0), vec![0x00]);
        assert_eq!(encoded(127), vec![0x7F]);
        assert_eq!(encoded(128), vec![0x80, 0x01]);
        assert_eq!(encoded(16_383).len(), 2);
        assert_eq!(encoded(16_384).len(), 3);
        assert_eq!(encoded(u64::from(u32::MAX)).len(), MAX_LEN_32);
        assert_eq!(encoded(u64::MAX).len(), MAX_LEN_64);
    }

    #[test]
    fn zigzag_keeps_small_negatives_short() {
        assert_eq!(zigzag_32(0), 0);
        assert_eq!(zigzag_32(-1), 1);
        assert_eq!(zigzag_32(1), 2);
        assert_eq!(zigzag_32(i32::MIN), u32::MAX);
        assert_eq!(zigzag_64(i64::MIN), u64::MAX);
        assert_eq!(encoded(u64::from(zigzag_32(-64))).len(), 1);
    }

    #[test]
    fn rejects_too_long() {
        let six = [0xFF, 0xFF, 0xFF, 0xFF, 0x8F, 0x00];
        assert_eq!(
            decode_u32(&six),
            Err(DecodeError::VarIntTooLong { max_bytes: 5 })
        );
        let eleven = [0xFF; 11];
        assert_eq!(
            decode_u64(&eleven),
            Err(DecodeError::VarIntTooLong { max_bytes: 10 })
        );
    }

    #[test]
    fn rejects_overflowing_last_byte() {
        assert_eq!(
            decode_u32(&[0xFF, 0xFF, 0xFF, 0xFF, 0x1F]),
            Err(DecodeError::VarIntOverflow { bits: 32 })
        );
        assert_eq!(
            decode_u32(&[0xFF, 0xFF, 0xFF, 0xFF, 0x0F]),
            Ok((u32::MAX, 5))
        );
        let mut max64 = vec![0xFF; 9];
        max64.push(0x02);
        assert_eq!(decode_u64(&max64), Err(DecodeError::VarIntOverflow { bits: 64 }));
    }

    #[test]
    fn truncated_input_is_a_fault() {
        assert!(matches!(
            decode_u32(&[0x80]),
            Err(DecodeError::UnexpectedEnd { needed: 2, remaining: 1 })
        ));
        assert!(matches!(decode_u64(&[]), Err(DecodeError::UnexpectedEnd { .. })));
    }

    proptest! {
        #[test]
        fn u64_round_trips_minimally(value in any::<u64>()) {
            let bytes = encoded(value);
            prop_assert_eq!(bytes.len(), encoded_len(value));
            prop_assert_eq!(decode_u64(&bytes), Ok((value, bytes.len())));
        }

        #[test]
        fn signed_round_trips(a in any::<i32>(), b in any::<i64>()) {
            prop_assert_eq!(unzigzag_32(zigzag_32(a)), a);
            prop_assert_eq!(unzigzag_64(zigzag_64(b)), b);
        }
    }
}
