//! Key material: the compiled-in region key registry and the per-block
//! KeyMap accessor.
//!
//! # Registry
//! Each supported container version maps to five (key, IV) pairs, one per
//! metadata region type 1..=5. Keys are AES-256 (64 hex chars), IVs are 16
//! bytes (32 hex chars). Lookup order: exact `major.minor.patch`, then
//! `major.minor` prefix, then the default set (the 1.3.0 material) with a
//! `used_default` hint the host surfaces as a warning. There is no
//! negotiation beyond that fallback.
//!
//! # KeyMap
//! The KeyMap region decrypts to a flat byte table of concatenated AES-256
//! keys. Block *k* of a file uses index `file.key_index + k`; the table is
//! read modulo its own length and wraps byte-wise at the boundary — the
//! table length is not required to be a multiple of 32.

use std::sync::OnceLock;

use thiserror::Error;

/// Number of metadata region types carrying their own (key, IV) pair.
pub const METADATA_REGION_TYPES: usize = 5;

/// Byte length of one KeyMap entry (an AES-256 key).
pub const KEYMAP_ENTRY_SIZE: usize = 32;

// ── Compiled-in material ─────────────────────────────────────────────────────
//
// These values are permanent for the versions they name; a pair is never
// reused for a different region type.

const V1_3_0_KEYS: [(&str, &str); METADATA_REGION_TYPES] = [
    // region 1 — Metadata
    (
        "a77a699c0e3e0e5be1500b7e5597e0567ba9955599f6f057648abd64e48ae42b",
        "ee231785d4790d6873fe39ca5bc72130",
    ),
    // region 2 — Patch
    (
        "630fd721303dcee9e5b56e8bcc7b354b9eacd81fa797f6db969b09c06c40e102",
        "3639ea8e236550643527fd931f316378",
    ),
    // region 3 — RawProgram
    (
        "fca57aa97ece31ac491206f548aeda74e46b634aea5314d705c9578d9979b3ec",
        "075609d6db74725adb6c3fdd84edf10a",
    ),
    // region 4 — KeyMap
    (
        "5225b04b9315cdfb0a0e81842a3f84e0852923904612c0b1eb3580beb796b16c",
        "e1e26cc7381cfc82485db29e6d2b6e68",
    ),
    // region 5 — FileIndex
    (
        "77db62fbf6c4136f1510d6ee89f7364f2396cac439b3030e405aeae188c92246",
        "4e59f989a419a58b9124fef006536b2f",
    ),
];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum KeyError {
    #[error("KeyMap table is empty")]
    EmptyTable,
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// One metadata region's decryption material.
#[derive(Debug, Clone, Copy)]
pub struct RegionKey {
    pub key: [u8; 32],
    pub iv: [u8; 16],
}

/// The five (key, IV) pairs for one container version.
#[derive(Debug, Clone)]
pub struct AesKeySet {
    pub version: (u64, u64, u64),
    regions: [RegionKey; METADATA_REGION_TYPES],
}

impl AesKeySet {
    /// Material for a metadata region type (1..=5). `None` for anything else.
    pub fn region(&self, region_type: u64) -> Option<&RegionKey> {
        match region_type {
            1..=5 => Some(&self.regions[(region_type - 1) as usize]),
            _ => None,
        }
    }
}

fn decode_set(version: (u64, u64, u64), hex_pairs: &[(&str, &str); METADATA_REGION_TYPES]) -> AesKeySet {
    let regions = hex_pairs.map(|(k, iv)| {
        let mut key = [0u8; 32];
        let mut iv_bytes = [0u8; 16];
        // Compiled-in constants; a length or digit mismatch is a build defect.
        hex::decode_to_slice(k, &mut key).expect("registry key hex");
        hex::decode_to_slice(iv, &mut iv_bytes).expect("registry iv hex");
        RegionKey { key, iv: iv_bytes }
    });
    AesKeySet { version, regions }
}

fn registry() -> &'static [AesKeySet] {
    static REGISTRY: OnceLock<Vec<AesKeySet>> = OnceLock::new();
    REGISTRY.get_or_init(|| vec![decode_set((1, 3, 0), &V1_3_0_KEYS)])
}

/// The set used when a container declares a version the registry does not
/// know. Identical to the 1.3.0 material.
pub fn default_key_set() -> &'static AesKeySet {
    &registry()[0]
}

/// Resolve the key set for a container version.
///
/// Returns the set plus `used_default = true` when neither the exact triple
/// nor the `major.minor` prefix is known and the default set was substituted.
pub fn lookup(version: (u64, u64, u64)) -> (&'static AesKeySet, bool) {
    let sets = registry();
    if let Some(set) = sets.iter().find(|s| s.version == version) {
        return (set, false);
    }
    if let Some(set) = sets
        .iter()
        .find(|s| (s.version.0, s.version.1) == (version.0, version.1))
    {
        return (set, false);
    }
    (default_key_set(), true)
}

// ── KeyMap accessor ──────────────────────────────────────────────────────────

/// Extract the 32-byte block key at `index` from a KeyMap table.
///
/// The byte offset is `(index * 32) mod len(table)`; a key that runs past
/// the table end wraps around to the start, byte-wise. Equivalent to
/// reading `(table ++ table)[offset .. offset + 32]`.
pub fn extract_key(table: &[u8], index: u64) -> Result<[u8; 32], KeyError> {
    if table.is_empty() {
        return Err(KeyError::EmptyTable);
    }
    let offset = ((index as u128 * KEYMAP_ENTRY_SIZE as u128) % table.len() as u128) as usize;

    let mut key = [0u8; 32];
    if offset + KEYMAP_ENTRY_SIZE <= table.len() {
        key.copy_from_slice(&table[offset..offset + KEYMAP_ENTRY_SIZE]);
    } else {
        for (dst, src) in key.iter_mut().zip(table.iter().cycle().skip(offset)) {
            *dst = *src;
        }
    }
    Ok(key)
}
