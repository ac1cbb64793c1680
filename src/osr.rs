//! On-stack replacement: a per-function map from loop-header bytecode offset
//! to the native offset inside the compiled body, published to the host so
//! it can re-enter compiled code mid-loop (spec §3 "OSR entry map", §4.10).

use crate::host::Host;

/// Body-relative OSR entries recorded by the integer code generator during
/// emission — one per backward `goto`, at the native offset the jump would
/// have landed at.
#[derive(Debug, Default, Clone)]
pub struct OsrMap {
    entries: Vec<(u32, u32)>,
}

impl OsrMap {
    pub fn new() -> Self {
        OsrMap::default()
    }

    /// Records `bytecode_offset -> native_offset`, where `native_offset` is
    /// relative to the start of the function body (not yet pool-based).
    pub fn record(&mut self, bytecode_offset: u32, native_offset: u32) {
        self.entries.push((bytecode_offset, native_offset));
    }

    pub fn entries(&self) -> &[(u32, u32)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Publishes every entry to the host, rebasing each body-relative native
    /// offset by `pool_base` (the address the function's bytes were written
    /// to). Must be called only after the native pointer has already been
    /// published (spec §5 ordering guarantees).
    pub fn install(&self, host: &mut dyn Host, function_address: u32, pool_base: u32) {
        for &(bytecode_offset, native_offset) in &self.entries {
            host.install_osr_entry(function_address, bytecode_offset, pool_base + native_offset);
        }
    }
}
