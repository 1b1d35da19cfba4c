//! Property-based tests for the BitStream ordering laws.
//!
//! Uses `proptest` to generate random values, widths, and binary strings
//! and verify the LSB-at-front contract survives every conversion.

use proptest::prelude::*;
use xsio::bits::BitStream;

/// Generate a binary-digit string of arbitrary length.
fn binary_string() -> impl Strategy<Value = String> {
    "[01]{0,200}"
}

proptest! {
    /// Constructing from a value keeps exactly the low `width` bits.
    #[test]
    fn value_round_trip(value in any::<u64>(), width in 0usize..=64) {
        let stream = BitStream::from_word(value, width);
        prop_assert_eq!(stream.len(), width);
        let expected = if width == 64 { value } else { value & ((1u64 << width) - 1) };
        prop_assert_eq!(stream.to_u64(), expected);
    }

    /// A binary string survives a round trip through the stream.
    #[test]
    fn string_round_trip(s in binary_string()) {
        let stream: BitStream = s.parse().unwrap();
        prop_assert_eq!(stream.len(), s.len());
        prop_assert_eq!(stream.to_string(), s);
    }

    /// Pushing a word and popping it from the same end is the identity.
    #[test]
    fn push_pop_back_round_trip(
        prefix in binary_string(),
        value in any::<u64>(),
        width in 1usize..=64,
    ) {
        let original: BitStream = prefix.parse().unwrap();
        let value = if width == 64 { value } else { value & ((1u64 << width) - 1) };
        let mut stream = original.clone();
        stream.push_back(value, width);
        prop_assert_eq!(stream.back(width), value);
        stream.pop_back(width);
        prop_assert_eq!(stream, original);
    }

    #[test]
    fn push_pop_front_round_trip(
        prefix in binary_string(),
        value in any::<u64>(),
        width in 1usize..=64,
    ) {
        let original: BitStream = prefix.parse().unwrap();
        let value = if width == 64 { value } else { value & ((1u64 << width) - 1) };
        let mut stream = original.clone();
        stream.push_front(value, width);
        prop_assert_eq!(stream.front(width), value);
        stream.pop_front(width);
        prop_assert_eq!(stream, original);
    }

    /// `a + b` keeps `a` at the LSB end: the combined value is
    /// `(b << a.len()) | a` whenever the widths fit in one word.
    #[test]
    fn concatenation_law(
        a_value in any::<u64>(), a_width in 0usize..=32,
        b_value in any::<u64>(), b_width in 0usize..=32,
    ) {
        let a = BitStream::from_word(a_value, a_width);
        let b = BitStream::from_word(b_value, b_width);
        let sum = a.clone() + b.clone();
        prop_assert_eq!(sum.len(), a_width + b_width);
        prop_assert_eq!(sum.to_u64(), (b.to_u64() << a_width) | a.to_u64());
    }

    /// Byte packing and unpacking are inverses at any bit length.
    #[test]
    fn byte_round_trip(s in binary_string()) {
        let stream: BitStream = s.parse().unwrap();
        let bytes = stream.to_bytes();
        let mut unpacked = BitStream::new();
        unpacked.push_back_bytes(&bytes, stream.len());
        prop_assert_eq!(unpacked, stream);
    }
}
