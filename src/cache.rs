//! Code cache: a bounded, in-memory retention of previously emitted native
//! bytes keyed by function identity (spec §3 "Code cache", §6 wire format).
//!
//! Grounded on the teacher's own `CodeCache` (reconstructed here from its
//! usage in `atlas-jit/tests/jit_tests.rs`, since the source file itself was
//! filtered out of the retrieved pack): `insert`/`contains`/`get`, a
//! byte-and-entry-count limit, and no implicit eviction.

use std::collections::HashMap;

use crate::{JitError, JitResult, CODE_CACHE_MAX_BYTES, CODE_CACHE_MAX_ENTRIES};

#[derive(Debug, Clone)]
struct Entry {
    bytes: Vec<u8>,
}

/// Bounded mapping from function identity (bytecode address) to emitted
/// bytes. Insertion is skipped once either limit would be exceeded; entries
/// are never evicted except by [`CodeCache::clear`].
#[derive(Debug, Default)]
pub struct CodeCache {
    entries: HashMap<u32, Entry>,
    total_bytes: usize,
}

impl CodeCache {
    pub fn new() -> Self {
        CodeCache::default()
    }

    pub fn contains(&self, function_address: u32) -> bool {
        self.entries.contains_key(&function_address)
    }

    pub fn get(&self, function_address: u32) -> Option<&[u8]> {
        self.entries.get(&function_address).map(|e| e.bytes.as_slice())
    }

    /// Inserts `bytes` under `function_address`. Fails with [`JitError::PoolExhausted`]
    /// (reused here as "cache full") if the entry count or byte budget would
    /// be exceeded; the caller treats this as non-fatal (the function is
    /// still compiled and published, just not retained for reuse).
    pub fn insert(&mut self, function_address: u32, bytes: &[u8]) -> JitResult<()> {
        if self.entries.len() >= CODE_CACHE_MAX_ENTRIES {
            return Err(JitError::PoolExhausted { requested: bytes.len() as u32 });
        }
        if self.total_bytes + bytes.len() > CODE_CACHE_MAX_BYTES {
            return Err(JitError::PoolExhausted { requested: bytes.len() as u32 });
        }
        self.total_bytes += bytes.len();
        self.entries.insert(function_address, Entry { bytes: bytes.to_vec() });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_bytes = 0;
    }

    /// Flattens the cache to the wire format of spec §6: a small header
    /// (entry count, total bytes) followed by a concatenation of entries,
    /// each `(function_identity: u64, length: u32, bytes)`. Not version
    /// stable across JIT implementations, per spec.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.total_bytes as u32).to_le_bytes());
        for (&addr, entry) in &self.entries {
            out.extend_from_slice(&(addr as u64).to_le_bytes());
            out.extend_from_slice(&(entry.bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(&entry.bytes);
        }
        out
    }

    /// Restores a cache from bytes produced by [`CodeCache::serialize`].
    pub fn deserialize(data: &[u8]) -> JitResult<CodeCache> {
        let invalid = || JitError::BytecodeInvalid("truncated code cache blob".to_string());
        if data.len() < 8 {
            return Err(invalid());
        }
        let entry_count = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
        let mut cursor = 8usize;
        let mut cache = CodeCache::new();
        for _ in 0..entry_count {
            if data.len() < cursor + 12 {
                return Err(invalid());
            }
            let addr = u64::from_le_bytes(data[cursor..cursor + 8].try_into().unwrap()) as u32;
            let len = u32::from_le_bytes(data[cursor + 8..cursor + 12].try_into().unwrap()) as usize;
            cursor += 12;
            if data.len() < cursor + len {
                return Err(invalid());
            }
            let bytes = &data[cursor..cursor + len];
            cache.insert(addr, bytes)?;
            cursor += len;
        }
        Ok(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_contains() {
        let mut cache = CodeCache::new();
        cache.insert(0x1000, &[1, 2, 3]).unwrap();
        assert!(cache.contains(0x1000));
        assert_eq!(cache.get(0x1000), Some([1u8, 2, 3].as_slice()));
        assert!(!cache.contains(0x2000));
    }

    #[test]
    fn insertion_skipped_past_byte_budget() {
        let mut cache = CodeCache::new();
        let big = vec![0u8; CODE_CACHE_MAX_BYTES];
        cache.insert(1, &big).unwrap();
        assert!(cache.insert(2, &[1, 2, 3]).is_err());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn insertion_skipped_past_entry_limit() {
        let mut cache = CodeCache::new();
        for i in 0..CODE_CACHE_MAX_ENTRIES as u32 {
            cache.insert(i, &[0]).unwrap();
        }
        assert!(cache.insert(CODE_CACHE_MAX_ENTRIES as u32, &[0]).is_err());
    }

    #[test]
    fn serialize_round_trips() {
        let mut cache = CodeCache::new();
        cache.insert(0x10, &[1, 2, 3]).unwrap();
        cache.insert(0x20, &[4, 5]).unwrap();
        let blob = cache.serialize();
        let restored = CodeCache::deserialize(&blob).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.get(0x10), Some([1u8, 2, 3].as_slice()));
        assert_eq!(restored.get(0x20), Some([4u8, 5].as_slice()));
    }

    #[test]
    fn clear_resets_byte_budget() {
        let mut cache = CodeCache::new();
        cache.insert(1, &[0u8; 16]).unwrap();
        cache.clear();
        assert_eq!(cache.total_bytes(), 0);
        assert!(cache.is_empty());
    }
}
