//! Bloom filter summarizing the keys held by a near-cache.

use bytes::Bytes;
use hotrod_core::hash::{murmur_hash3_x86_32, DEFAULT_MURMUR_SEED};

/// Probes per key.
const HASH_FUNCTIONS: u32 = 3;

/// A fixed-length bloom filter over key bytes.
///
/// Bit positions come from two murmur hashes combined with the
/// Kirsch-Mitzenmacher scheme. Bit `i` lives in byte `i / 8` at position
/// `i % 8`, which is also the layout shipped to the server.
#[derive(Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u32,
}

impl BloomFilter {
    /// Creates an empty filter of `num_bits` bits (at least one).
    pub fn new(num_bits: u32) -> Self {
        let num_bits = num_bits.max(1);
        Self {
            bits: vec![0; num_bits.div_ceil(8) as usize],
            num_bits,
        }
    }

    /// Creates a filter holding every key in `keys`.
    pub fn from_keys<'a>(num_bits: u32, keys: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut filter = Self::new(num_bits);
        for key in keys {
            filter.insert(key);
        }
        filter
    }

    /// Returns the filter length in bits.
    pub fn num_bits(&self) -> u32 {
        self.num_bits
    }

    /// Adds a key.
    pub fn insert(&mut self, key: &[u8]) {
        for bit in self.positions(key) {
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// Returns `false` only if the key was never inserted.
    pub fn might_contain(&self, key: &[u8]) -> bool {
        self.positions(key)
            .all(|bit| self.bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0)
    }

    /// Resets every bit.
    pub fn clear(&mut self) {
        self.bits.fill(0);
    }

    /// Returns the number of set bits.
    pub fn set_bits(&self) -> u32 {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }

    /// Serializes the bit set for an update request.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    fn positions(&self, key: &[u8]) -> impl Iterator<Item = u32> {
        let h1 = murmur_hash3_x86_32(key, DEFAULT_MURMUR_SEED) as u32;
        let h2 = murmur_hash3_x86_32(key, h1) as u32;
        let m = self.num_bits;
        (0..HASH_FUNCTIONS).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % m)
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("num_bits", &self.num_bits)
            .field("set_bits", &self.set_bits())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inserted_keys_are_always_reported() {
        let keys: Vec<Vec<u8>> = (0..500).map(|i| format!("key-{}", i).into_bytes()).collect();
        let filter = BloomFilter::from_keys(8_192, keys.iter().map(|k| k.as_slice()));

        for key in &keys {
            assert!(filter.might_contain(key));
        }
    }

    #[test]
    fn test_false_positive_rate_is_low_when_sized() {
        let keys: Vec<String> = (0..1_000).map(|i| format!("in-{}", i)).collect();
        let filter = BloomFilter::from_keys(16_000, keys.iter().map(|k| k.as_bytes()));
        let false_positives = (0..1_000)
            .filter(|i| filter.might_contain(format!("out-{}", i).as_bytes()))
            .count();
        assert!(false_positives < 50, "too many false positives: {}", false_positives);
    }

    #[test]
    fn test_empty_filter_contains_nothing() {
        let filter = BloomFilter::new(64);
        assert!(!filter.might_contain(b"anything"));
        assert_eq!(filter.set_bits(), 0);
    }

    #[test]
    fn test_byte_layout_and_length() {
        let mut filter = BloomFilter::new(10);
        assert_eq!(filter.to_bytes().len(), 2);

        filter.insert(b"k");
        let bytes = filter.to_bytes();
        let ones: u32 = bytes.iter().map(|b| b.count_ones()).sum();
        assert!((1..=HASH_FUNCTIONS).contains(&ones));
        // Bits beyond num_bits are never set.
        assert_eq!(bytes[1] & 0b1111_1100, 0);
    }

    #[test]
    fn test_clear_resets_bits() {
        let mut filter = BloomFilter::new(128);
        filter.insert(b"a");
        filter.clear();
        assert!(!filter.might_contain(b"a"));
    }

    #[test]
    fn test_zero_bits_is_clamped() {
        let mut filter = BloomFilter::new(0);
        filter.insert(b"a");
        assert_eq!(filter.num_bits(), 1);
        assert!(filter.might_contain(b"b"));
    }
}
