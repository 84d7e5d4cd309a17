//! Key hashing and bucket assignment.
//!
//! Four hash functions are registered by name, matching the original BeansDB
//! proxy byte-for-byte: `fnv1a`, `fnv1a1` (a legacy variant that sign-extends
//! each byte before folding it in), `crc32` (IEEE), and `md5` (first four
//! digest bytes, little-endian).

use std::collections::HashMap;

const FNV1A_INIT: u32 = 0x811c_9dc5;
const FNV1A_PRIME: u32 = 0x0100_0193;

/// Standard 32-bit FNV-1a.
pub fn fnv1a(data: &[u8]) -> u32 {
    let mut h = FNV1A_INIT;
    for &b in data {
        h ^= b as u32;
        h = h.wrapping_mul(FNV1A_PRIME);
    }
    h
}

/// Legacy FNV-1a variant: each byte is sign-extended through `i8` before
/// being folded in. This differs from `fnv1a` for any byte >= 0x80 and must
/// be preserved exactly for compatibility with existing bucket assignments.
pub fn fnv1a1(data: &[u8]) -> u32 {
    let mut h = FNV1A_INIT;
    for &b in data {
        h ^= (b as i8) as u32;
        h = h.wrapping_mul(FNV1A_PRIME);
    }
    h
}

/// IEEE CRC-32.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// First four bytes of the MD5 digest, interpreted little-endian.
pub fn md5(data: &[u8]) -> u32 {
    use md5::{Digest, Md5};
    let digest = Md5::digest(data);
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

pub type HashFn = fn(&[u8]) -> u32;

/// Look up a hash function by its configured name.
pub fn by_name(name: &str) -> Option<HashFn> {
    match name {
        "fnv1a" => Some(fnv1a as HashFn),
        "fnv1a1" => Some(fnv1a1 as HashFn),
        "crc32" => Some(crc32 as HashFn),
        "md5" => Some(md5 as HashFn),
        _ => None,
    }
}

/// log2 of `n`, assuming `n` is a power of two. Used to derive `bucket_width`
/// from `num_buckets`.
pub fn bit_width(mut n: u32) -> u32 {
    let mut w = 0;
    while n > 1 {
        n >>= 1;
        w += 1;
    }
    w
}

/// Maps a key to a bucket index in `[0, 2^bucket_width)`.
///
/// Two syntactic overrides take priority over hashing:
/// - `@HEX…`: the bucket index is read directly as a hex integer from the
///   `bucket_width/4` characters following the `@`. Lets a caller address a
///   bucket (or a BeansDB directory path) directly.
/// - `?…`: the leading `?` is stripped before hashing (but the rest of the
///   key, including any further `?`, hashes normally).
pub fn bucket_of(hash_fn: HashFn, bucket_width: u32, key: &[u8]) -> u32 {
    let hex_len = (bucket_width / 4) as usize;
    if key.len() > hex_len && key[0] == b'@' {
        if let Some(idx) = parse_hex(&key[1..1 + hex_len]) {
            return idx;
        }
    }
    let effective = if key.first() == Some(&b'?') { &key[1..] } else { key };
    hash_fn(effective) >> (32 - bucket_width)
}

fn parse_hex(digits: &[u8]) -> Option<u32> {
    let mut v: u32 = 0;
    for &c in digits {
        let d = match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'f' => c - b'a' + 10,
            b'A'..=b'F' => c - b'A' + 10,
            _ => return None,
        };
        v = v.checked_shl(4)?.checked_add(d as u32)?;
    }
    Some(v)
}

/// Groups keys by the bucket they hash to. The returned map always has an
/// entry (possibly empty) for every bucket in `0..num_buckets` that at least
/// one key mapped to; callers that need every bucket represented should size
/// a `Vec` of `num_buckets` and index into it instead.
pub fn divide_keys_by_bucket<'a>(
    hash_fn: HashFn,
    bucket_width: u32,
    keys: &[&'a str],
) -> HashMap<u32, Vec<&'a str>> {
    let mut groups: HashMap<u32, Vec<&'a str>> = HashMap::new();
    for &key in keys {
        let b = bucket_of(hash_fn, bucket_width, key.as_bytes());
        groups.entry(b).or_default().push(key);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors_empty_string() {
        assert_eq!(md5(b""), 3649838548);
        assert_eq!(crc32(b""), 0);
        assert_eq!(fnv1a(b""), 2166136261);
        assert_eq!(fnv1a1(b""), 2166136261);
    }

    #[test]
    fn known_vectors_hello() {
        assert_eq!(md5(b"hello"), 708854109);
        assert_eq!(crc32(b"hello"), 907060870);
        assert_eq!(fnv1a(b"hello"), 1335831723);
    }

    #[test]
    fn fnv1a1_diverges_from_fnv1a_on_high_bytes() {
        assert_eq!(fnv1a("你好".as_bytes()), 2257816995);
        assert_eq!(fnv1a1("你好".as_bytes()), 718964643);
        assert_ne!(fnv1a1("你好".as_bytes()), fnv1a("你好".as_bytes()));
    }

    #[test]
    fn fnv1a1_matches_fnv1a_on_ascii() {
        // Sign extension of a byte < 0x80 is a no-op, so pure-ASCII keys
        // hash identically under both variants.
        assert_eq!(fnv1a1(b"hello"), fnv1a(b"hello"));
    }

    #[test]
    fn crc32_is_ieee_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn bucket_of_respects_at_override() {
        // bucket_width = 16 -> 4 hex digits read after '@'
        let b = bucket_of(fnv1a, 16, b"@00ffrest-of-key");
        assert_eq!(b, 0x00ff);
    }

    #[test]
    fn bucket_of_strips_question_mark_before_hashing() {
        let with = bucket_of(fnv1a, 16, b"?abc");
        let without = bucket_of(fnv1a, 16, b"abc");
        assert_eq!(with, without);
    }

    #[test]
    fn bucket_of_is_pure() {
        let a = bucket_of(fnv1a1, 16, b"some-key");
        let b = bucket_of(fnv1a1, 16, b"some-key");
        assert_eq!(a, b);
    }

    #[test]
    fn divide_keys_by_bucket_groups_all_keys() {
        let keys = ["a", "b", "c", "d"];
        let groups = divide_keys_by_bucket(fnv1a, 8, &keys);
        let total: usize = groups.values().map(|v| v.len()).sum();
        assert_eq!(total, keys.len());
    }

    #[test]
    fn bit_width_of_powers_of_two() {
        assert_eq!(bit_width(1), 0);
        assert_eq!(bit_width(16), 4);
        assert_eq!(bit_width(65536), 16);
    }
}
