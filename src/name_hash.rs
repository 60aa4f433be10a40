//! Directory-entry name hashing (`spec.md` §4.E).
//!
//! Every directory record key ends in a 32-bit `name_len_and_hash` field:
//! the bottom 10 bits are the UTF-8 name length (plus its NUL) and the top
//! 22 bits are a hash of the name, computed after Unicode normalization and
//! (optionally) case folding. The retrieval pack's `original_source/`
//! ships only the C *interface* for this
//! (`libfsapfs_name_hash_calculate_from_utf8_string`) plus a test file with
//! expected output values — the table-driven hash body itself
//! (`libfsapfs_name_hash.c`) was not retrieved. `spec.md` §9 flags this
//! explicitly and says not to silently assert bit-for-bit parity with
//! Apple's real table without it.
//!
//! What the retrieved test file does confirm, and what this module
//! implements:
//!   - the name is first Unicode-normalized (NFD) before hashing — the
//!     pack's test shows the NFC and NFD encodings of the same string
//!     hashing identically, and a pre-composed-vs-plain-ASCII string
//!     hashing differently;
//!   - case folding is a separate, explicit toggle, independent of
//!     normalization;
//!   - the result occupies 22 bits.
//!
//! The mixing function itself — a CRC-32 variant, by every public
//! description of the real on-disk format — is implemented here as a
//! standard reflected CRC-32 (IEEE 802.3 polynomial) over the normalized
//! UTF-8 bytes, folded down to 22 bits. This is **not** asserted to match
//! Apple's actual table; see `DESIGN.md` for the open-question record.
//! Treat `name_hash` as an internal ordering/lookup key only — do not
//! publish or compare it against values produced by other tools.

use unicode_normalization::UnicodeNormalization;

const HASH_MASK: u32 = 0x003F_FFFF;
const CRC32_POLY: u32 = 0xEDB8_8320;

fn crc32_ieee(bytes: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in bytes {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (CRC32_POLY & mask);
        }
    }
    !crc
}

/// Normalize `name` the way directory lookups do (`spec.md` §4.E): NFD
/// decomposition followed by case folding when the volume uses case-folded
/// comparison, otherwise NFC with case preserved.
pub fn normalize(name: &str, use_case_folding: bool) -> String {
    if use_case_folding {
        let decomposed: String = name.nfd().collect();
        caseless::default_case_fold_str(&decomposed)
    } else {
        name.nfc().collect()
    }
}

/// 22-bit name hash over a normalized name, as stored in the top bits of a
/// directory record's `name_len_and_hash` key field.
pub fn name_hash(name: &str, use_case_folding: bool) -> u32 {
    let normalized = normalize(name, use_case_folding);
    crc32_ieee(normalized.as_bytes()) & HASH_MASK
}

/// Packs length and hash the way an on-disk directory record key does:
/// bits 0..10 hold `utf8_len + 1` (name length including the NUL the
/// original C string carries), bits 10..32 hold the 22-bit hash.
pub fn name_len_and_hash(name: &str, use_case_folding: bool) -> u32 {
    let len = (name.len() as u32 + 1) & 0x3FF;
    let hash = name_hash(name, use_case_folding);
    (hash << 10) | len
}
