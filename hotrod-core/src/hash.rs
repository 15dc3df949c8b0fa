//! Key hashing used to map keys onto segments.

use std::fmt::Debug;

/// Seed used by the default murmur hasher.
pub const DEFAULT_MURMUR_SEED: u32 = 0x9747_B28C;

/// A hash function shared by client and servers.
///
/// Client and servers must agree on the function, otherwise requests land on
/// non-owners and cost the cluster an extra hop.
pub trait KeyHasher: Send + Sync + Debug {
    /// Hashes the key bytes.
    fn hash(&self, key: &[u8]) -> i32;

    /// Hash function version, matched against the version the server announces.
    fn version(&self) -> u8 {
        0
    }
}

/// Maps a key to its segment: `hash(key) mod segment_count`.
///
/// The hash is made non-negative before the modulo. Returns `None` when the
/// segment count is zero.
pub fn segment_of(hasher: &dyn KeyHasher, key: &[u8], segment_count: u32) -> Option<u32> {
    if segment_count == 0 {
        return None;
    }
    let normalized = (hasher.hash(key) & i32::MAX) as u32;
    Some(normalized % segment_count)
}

/// MurmurHash3 x86 32-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Murmur3Hasher {
    seed: u32,
}

impl Murmur3Hasher {
    /// Creates a hasher with an explicit seed.
    pub fn with_seed(seed: u32) -> Self {
        Self { seed }
    }
}

impl Default for Murmur3Hasher {
    fn default() -> Self {
        Self::with_seed(DEFAULT_MURMUR_SEED)
    }
}

impl KeyHasher for Murmur3Hasher {
    fn hash(&self, key: &[u8]) -> i32 {
        murmur_hash3_x86_32(key, self.seed)
    }

    fn version(&self) -> u8 {
        3
    }
}

/// MurmurHash3 x86 32-bit implementation.
pub fn murmur_hash3_x86_32(data: &[u8], seed: u32) -> i32 {
    let len = data.len();
    let mut h1 = seed;
    let nblocks = len / 4;

    for i in 0..nblocks {
        let offset = i * 4;
        let k1 = u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]);

        h1 ^= mix_k1(k1);
        h1 = h1.rotate_left(13);
        h1 = h1.wrapping_mul(5).wrapping_add(0xe6546b64);
    }

    let tail = &data[nblocks * 4..];
    let mut k1: u32 = 0;
    for (i, byte) in tail.iter().enumerate().rev() {
        k1 ^= u32::from(*byte) << (8 * i);
    }
    if !tail.is_empty() {
        h1 ^= mix_k1(k1);
    }

    h1 ^= len as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85ebca6b);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xc2b2ae35);
    h1 ^= h1 >> 16;

    h1 as i32
}

fn mix_k1(k1: u32) -> u32 {
    k1.wrapping_mul(0xcc9e2d51)
        .rotate_left(15)
        .wrapping_mul(0x1b873593)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_murmur_reference_vectors() {
        assert_eq!(murmur_hash3_x86_32(b"", 0), 0);
        assert_eq!(murmur_hash3_x86_32(b"", 1) as u32, 0x514E28B7);
        assert_eq!(murmur_hash3_x86_32(b"hello", 0) as u32, 0x248BFA47);
        assert_eq!(
            murmur_hash3_x86_32(b"The quick brown fox jumps over the lazy dog", 0x9747b28c) as u32,
            0x2FA826CD
        );
    }

    #[test]
    fn test_murmur_tail_lengths() {
        let data = b"abcdefg";
        let mut seen = std::collections::HashSet::new();
        for len in 0..=data.len() {
            seen.insert(murmur_hash3_x86_32(&data[..len], 0));
        }
        assert_eq!(seen.len(), data.len() + 1);
    }

    #[test]
    fn test_segment_of_is_stable_and_in_range() {
        let hasher = Murmur3Hasher::default();
        for i in 0..1000u32 {
            let key = i.to_be_bytes();
            let segment = segment_of(&hasher, &key, 256).unwrap();
            assert!(segment < 256);
            assert_eq!(segment_of(&hasher, &key, 256), Some(segment));
        }
    }

    #[test]
    fn test_segment_of_handles_negative_hashes() {
        #[derive(Debug)]
        struct Negative;
        impl KeyHasher for Negative {
            fn hash(&self, _key: &[u8]) -> i32 {
                i32::MIN + 5
            }
        }
        assert_eq!(segment_of(&Negative, b"k", 4), Some(1));
    }

    #[test]
    fn test_segment_of_zero_segments() {
        assert_eq!(segment_of(&Murmur3Hasher::default(), b"k", 0), None);
    }

    #[test]
    fn test_hasher_is_object_safe() {
        let hasher: Box<dyn KeyHasher> = Box::new(Murmur3Hasher::with_seed(1));
        assert_eq!(hasher.version(), 3);
        assert_eq!(hasher.hash(b"abc"), murmur_hash3_x86_32(b"abc", 1));
    }
}
