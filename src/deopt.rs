//! Deopt trampoline: a shared, memory-mapped flag page written by generated
//! code and polled by the controller (spec §3 "Deopt page", §4.11).

use crate::host::Host;
use crate::{JitError, JitResult, DEOPT_PAGE_SIZE};

/// Owns the 256-byte deopt page and the dense per-function slot counter.
/// Allocated lazily from the code pool on first need, never freed until the
/// next pool reset (at which point a fresh page is allocated on next need).
#[derive(Debug, Default)]
pub struct DeoptPage {
    address: Option<u32>,
    next_slot: u32,
}

impl DeoptPage {
    pub fn new() -> Self {
        DeoptPage::default()
    }

    /// Invalidates the page after a pool reset; the next `ensure_allocated`
    /// call will re-allocate a fresh, zeroed page.
    pub fn invalidate(&mut self) {
        self.address = None;
        self.next_slot = 0;
    }

    pub fn address(&self) -> Option<u32> {
        self.address
    }

    /// Allocates the page from the main pool the first time it is needed.
    pub fn ensure_allocated(&mut self, host: &mut dyn Host) -> JitResult<u32> {
        if let Some(addr) = self.address {
            return Ok(addr);
        }
        let addr = host
            .jit_alloc(DEOPT_PAGE_SIZE)
            .ok_or(JitError::PoolExhausted { requested: DEOPT_PAGE_SIZE })?;
        host.jit_write(addr, &vec![0u8; DEOPT_PAGE_SIZE as usize]);
        self.address = Some(addr);
        Ok(addr)
    }

    /// Claims the next dense slot for a newly compiling function. Slots are
    /// never reclaimed individually; the whole page resets with the pool.
    pub fn assign_slot(&mut self) -> JitResult<u32> {
        if self.next_slot >= DEOPT_PAGE_SIZE {
            return Err(JitError::PoolExhausted { requested: DEOPT_PAGE_SIZE });
        }
        let slot = self.next_slot;
        self.next_slot += 1;
        Ok(slot)
    }

    /// Reads the byte at `slot`, clears it to zero if non-zero, and reports
    /// whether a deopt was signalled. The controller calls this once per
    /// hook invocation for every function with an assigned slot.
    pub fn check_and_clear(&self, host: &mut dyn Host, slot: u32) -> JitResult<bool> {
        let addr = self.address.ok_or(JitError::PoolExhausted { requested: 0 })?;
        let byte_addr = addr + slot;
        let bytes = host
            .read_physical_memory(byte_addr, 1)
            .ok_or(JitError::ProbeFailed { address: byte_addr, length: 1 })?;
        let was_set = bytes[0] != 0;
        if was_set {
            host.jit_write(byte_addr, &[0]);
        }
        Ok(was_set)
    }
}
