//! Inline-cache table: per-site shape/slot records populated by the host
//! before each compile attempt (spec §3 "Inline-cache table", §4.9).
//!
//! Keys are composite (instruction address, atom) pairs for property
//! read/write, or bare instruction address for array access — expressed here
//! as plain hash-map keys, per spec §9's note that the spec does not
//! prescribe a data structure beyond O(1) expected lookup.

use std::collections::HashMap;

/// A cached property read: the guarded shape and the byte offset to load from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadEntry {
    pub shape: u32,
    pub slot_offset: u32,
}

/// A cached property write: the guarded shape, the slot offset, and whether
/// the slot is writable (a non-writable hit still bails at emission, since the
/// integer tier has no path to signal a runtime property-write failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteEntry {
    pub shape: u32,
    pub slot_offset: u32,
    pub writable: bool,
}

/// A cached array access: field offsets needed to compute `data_ptr + index * stride`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayEntry {
    pub length_field_offset: u32,
    pub data_ptr_offset: u32,
    pub element_stride: u32,
}

/// Per-function inline-cache state. One instance lives per control block and
/// is repopulated by [`crate::host::Host::probe_inline_caches`] before every
/// compile attempt.
#[derive(Debug, Default, Clone)]
pub struct IcTable {
    reads: HashMap<(u32, u32), ReadEntry>,
    writes: HashMap<(u32, u32), WriteEntry>,
    arrays: HashMap<u32, ArrayEntry>,
}

impl IcTable {
    pub fn new() -> Self {
        IcTable::default()
    }

    pub fn set_read(&mut self, instr_addr: u32, atom: u32, shape: u32, slot_offset: u32) {
        self.reads.insert((instr_addr, atom), ReadEntry { shape, slot_offset });
    }

    pub fn get_read(&self, instr_addr: u32, atom: u32) -> Option<ReadEntry> {
        self.reads.get(&(instr_addr, atom)).copied()
    }

    pub fn set_write(&mut self, instr_addr: u32, atom: u32, shape: u32, slot_offset: u32, writable: bool) {
        self.writes.insert((instr_addr, atom), WriteEntry { shape, slot_offset, writable });
    }

    pub fn get_write(&self, instr_addr: u32, atom: u32) -> Option<WriteEntry> {
        self.writes.get(&(instr_addr, atom)).copied()
    }

    pub fn set_array(&mut self, instr_addr: u32, length_field_offset: u32, data_ptr_offset: u32, element_stride: u32) {
        self.arrays.insert(
            instr_addr,
            ArrayEntry { length_field_offset, data_ptr_offset, element_stride },
        );
    }

    pub fn get_array(&self, instr_addr: u32) -> Option<ArrayEntry> {
        self.arrays.get(&instr_addr).copied()
    }

    /// Whether any site at all has been populated. Used by the controller to
    /// distinguish "no IC data yet" (bail without consuming a bail slot, spec
    /// §4.9) from a genuinely missing site in a table that has other entries.
    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty() && self.arrays.is_empty()
    }

    pub fn clear(&mut self) {
        self.reads.clear();
        self.writes.clear();
        self.arrays.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_array_round_trip() {
        let mut ic = IcTable::new();
        assert!(ic.is_empty());
        ic.set_read(0x10, 7, 0xA1, 12);
        ic.set_write(0x20, 7, 0xA1, 12, true);
        ic.set_array(0x30, 0, 4, 8);

        assert_eq!(ic.get_read(0x10, 7), Some(ReadEntry { shape: 0xA1, slot_offset: 12 }));
        assert_eq!(ic.get_read(0x10, 8), None);
        assert_eq!(
            ic.get_write(0x20, 7),
            Some(WriteEntry { shape: 0xA1, slot_offset: 12, writable: true })
        );
        assert_eq!(
            ic.get_array(0x30),
            Some(ArrayEntry { length_field_offset: 0, data_ptr_offset: 4, element_stride: 8 })
        );
        assert!(!ic.is_empty());
    }

    #[test]
    fn distinct_atoms_at_same_site_are_independent() {
        let mut ic = IcTable::new();
        ic.set_read(0x10, 1, 1, 1);
        ic.set_read(0x10, 2, 2, 2);
        assert_eq!(ic.get_read(0x10, 1).unwrap().shape, 1);
        assert_eq!(ic.get_read(0x10, 2).unwrap().shape, 2);
    }
}
