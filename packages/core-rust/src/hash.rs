//! FNV-1a hashing used to route cache keys onto partitions.
//!
//! The hash iterates over UTF-16 code units so that the same key maps to the
//! same partition regardless of which client produced it.

/// FNV-1a offset basis (32-bit).
const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;

/// FNV-1a prime (32-bit).
const FNV_PRIME: u32 = 0x0100_0193;

/// Computes a 32-bit FNV-1a hash of a string, iterating over UTF-16 code units.
///
/// # Examples
///
/// ```
/// use partex_core::hash::fnv1a_hash;
///
/// assert_eq!(fnv1a_hash("hello"), 1_335_831_723);
/// assert_eq!(fnv1a_hash(""), 2_166_136_261); // FNV offset basis
/// ```
#[must_use]
pub fn fnv1a_hash(s: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for code_unit in s.encode_utf16() {
        hash ^= u32::from(code_unit);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Maps a key onto one of `partitions` partitions.
///
/// Returns 0 when `partitions` is 0 so callers never divide by zero; a cache
/// group with no partitions is rejected long before keys are routed.
///
/// # Examples
///
/// ```
/// use partex_core::hash::key_partition;
///
/// assert_eq!(key_partition("hello", 271), 95);
/// assert_eq!(key_partition("key1", 271), 268);
/// ```
#[must_use]
pub fn key_partition(key: &str, partitions: u32) -> u32 {
    if partitions == 0 {
        return 0;
    }
    fnv1a_hash(key) % partitions
}
