//! Hash functions for rule-ID derivation
//!
//! Uses Murmur3 32-bit salted by the index of each requested ID, so a site
//! origin maps to a stable sequence of rule IDs without a central counter.
//!
//! # Sentinel Handling
//!
//! Rule ID 0 is invalid in the declarative engine. A hash that evaluates to
//! 0 is replaced by `index + 1`.

// Seed for index 0; later indices are salted from it.
const SEED_BASE: u32 = 0x9e3779b9; // Golden ratio
const SEED_STEP: u32 = 0x85ebca6b; // Murmur3 constant

/// Murmur3 32-bit hash implementation.
/// Optimized for short strings (typical origin lengths).
#[inline]
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    let mut h = seed;

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        h ^= scramble(k);
        h = h.rotate_left(13);
        h = h.wrapping_mul(5).wrapping_add(0xe6546b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k: u32 = 0;
        for (i, &b) in tail.iter().enumerate() {
            k ^= (b as u32) << (8 * i);
        }
        h ^= scramble(k);
    }

    // Finalization
    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85ebca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2ae35);
    h ^= h >> 16;

    h
}

#[inline]
fn scramble(k: u32) -> u32 {
    k.wrapping_mul(0xcc9e2d51)
        .rotate_left(15)
        .wrapping_mul(0x1b873593)
}

/// Seed used for the ID at `index`.
#[inline]
fn index_seed(index: u32) -> u32 {
    SEED_BASE ^ index.wrapping_mul(SEED_STEP)
}

/// Derive `count` rule IDs for a site origin.
///
/// The sequence is deterministic for a given origin, every value is in
/// `1..=u32::MAX`, and `count == 0` yields an empty vector.
pub fn derive_rule_ids(origin: &str, count: usize) -> Vec<u32> {
    let bytes = origin.as_bytes();
    (0..count as u32)
        .map(|index| match murmur3_32(bytes, index_seed(index)) {
            0 => index + 1,
            h => h,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_murmur3_consistent() {
        let h1 = murmur3_32(b"https://example.com", 0);
        let h2 = murmur3_32(b"https://example.com", 0);
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_murmur3_different_seeds() {
        let h1 = murmur3_32(b"https://example.com", 0);
        let h2 = murmur3_32(b"https://example.com", 1);
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_murmur3_known_vectors() {
        // Reference values of the canonical Murmur3 x86_32.
        assert_eq!(murmur3_32(b"", 0), 0);
        assert_eq!(murmur3_32(b"", 1), 0x514e28b7);
        assert_eq!(murmur3_32(b"test", 0), 0xba6bd213);
    }

    #[test]
    fn test_derive_is_repeatable() {
        let a = derive_rule_ids("https://example.com", 16);
        let b = derive_rule_ids("https://example.com", 16);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_derive_prefix_stable() {
        let short = derive_rule_ids("https://example.com", 4);
        let long = derive_rule_ids("https://example.com", 10);
        assert_eq!(short[..], long[..4]);
    }

    #[test]
    fn test_derive_differs_between_origins() {
        let a = derive_rule_ids("https://example.com", 8);
        let b = derive_rule_ids("https://example.org", 8);
        assert_ne!(a, b);
    }

    #[test]
    fn test_derive_zero_count() {
        assert!(derive_rule_ids("https://example.com", 0).is_empty());
    }

    #[test]
    fn test_derive_never_zero_and_mostly_unique() {
        let origins = [
            "",
            "https://a.com",
            "https://news.example.co.uk",
            "http://localhost:8080",
        ];
        for origin in origins {
            let ids = derive_rule_ids(origin, 100);
            assert!(ids.iter().all(|&id| id >= 1));
            let unique: HashSet<_> = ids.iter().collect();
            assert!(unique.len() >= 99, "too many collisions for {origin:?}");
        }
    }
}
