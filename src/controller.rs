//! The JIT controller: the per-function state machine that decides whether to
//! compile, deoptimise, or keep interpreting (spec §4.12).
//!
//! `JitController::hook` is the single entry point the embedding interpreter
//! calls on every invocation of a bytecode function. Everything else in this
//! module exists to serve that one call: per-function bookkeeping
//! ([`ControlBlock`]), tunables ([`JitConfig`]), and observability
//! ([`JitStats`]).

use std::collections::HashMap;

use log::{debug, info, trace, warn};

use crate::bytecode::BytecodeReader;
use crate::cache::CodeCache;
use crate::codegen::{float_tier, int_tier};
use crate::deopt::DeoptPage;
use crate::host::Host;
use crate::ic::IcTable;
use crate::preanalysis;
use crate::regalloc;
use crate::speculator::{ObservedTag, TypeSpeculator};
use crate::{JitResult, ANY_BLACKLIST_MULTIPLIER, DEOPT_SENTINEL, INT_COMPILE_THRESHOLD, MAX_BAILS, MAX_DEOPTS};

/// Tunable thresholds, collected into one `Copy` struct the way the teacher's
/// own `JitConfig` does (SPEC_FULL §10.3). `Default` reproduces the values
/// spec §4.12 fixes.
#[derive(Debug, Clone, Copy)]
pub struct JitConfig {
    pub int_compile_threshold: u64,
    pub any_blacklist_multiplier: u64,
    pub max_deopts: u32,
    pub max_bails: u32,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            int_compile_threshold: INT_COMPILE_THRESHOLD,
            any_blacklist_multiplier: ANY_BLACKLIST_MULTIPLIER,
            max_deopts: MAX_DEOPTS,
            max_bails: MAX_BAILS,
        }
    }
}

/// Observability counters (SPEC_FULL §11), incremented as the controller
/// works; read-only to callers via [`JitController::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JitStats {
    pub compiled: u64,
    pub bailed: u64,
    pub deopts: u64,
    pub pool_resets: u64,
    pub float_compiled: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// How each argument slot at `arguments_pointer` is tagged: an 8-byte record,
/// 4-byte payload followed by a 4-byte tag (the same payload-then-tag shape
/// `ConstTag` uses for the constant pool, applied here to runtime call
/// arguments — a host convention this crate documents since spec.md leaves
/// the wire format of the argument vector unspecified).
fn read_arg_tags(host: &dyn Host, arguments_pointer: u32, argument_count: u16) -> Vec<ObservedTag> {
    let mut tags = Vec::with_capacity(argument_count as usize);
    for i in 0..argument_count as u32 {
        let addr = arguments_pointer + 8 * i;
        let tag = host
            .read_physical_memory(addr + 4, 4)
            .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
            .unwrap_or(3);
        tags.push(match tag {
            0 => ObservedTag::Int32,
            1 => ObservedTag::Bool,
            2 => ObservedTag::Float64,
            _ => ObservedTag::Other,
        });
    }
    tags
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BlockState {
    Unobserved,
    Observed,
    Compiled,
    Blacklisted,
}

/// Per-function state the controller keeps across hook invocations (spec §3
/// "control block", §4.12).
struct ControlBlock {
    state: BlockState,
    speculator: TypeSpeculator,
    ic: IcTable,
    deopt_slot: Option<u32>,
    deopt_count: u32,
    bail_count: u32,
    last_access_ticks: u64,
}

impl ControlBlock {
    fn new(argument_count: usize) -> Self {
        ControlBlock {
            state: BlockState::Unobserved,
            speculator: TypeSpeculator::new(argument_count),
            ic: IcTable::new(),
            deopt_slot: None,
            deopt_count: 0,
            bail_count: 0,
            last_access_ticks: 0,
        }
    }
}

/// The primary JIT controller, owning every function's control block, the
/// shared deopt page, and the code cache (spec §4.12).
pub struct JitController {
    config: JitConfig,
    blocks: HashMap<u32, ControlBlock>,
    float_native: HashMap<u32, u32>,
    deopt_page: DeoptPage,
    cache: CodeCache,
    stats: JitStats,
}

impl JitController {
    pub fn new(config: JitConfig) -> Self {
        JitController {
            config,
            blocks: HashMap::new(),
            float_native: HashMap::new(),
            deopt_page: DeoptPage::new(),
            cache: CodeCache::new(),
            stats: JitStats::default(),
        }
    }

    pub fn stats(&self) -> JitStats {
        self.stats
    }

    /// The address of a previously compiled float-tier body for `function_address`,
    /// if one exists. Never published through `Host::set_native_pointer` (§4.8).
    pub fn float_native_address(&self, function_address: u32) -> Option<u32> {
        self.float_native.get(&function_address).copied()
    }

    /// The shared deopt page's base address, once allocated. Exposed for
    /// introspection/testing the same way `stats()` and
    /// `float_native_address()` are — the emitted MISS path is the only
    /// writer in production, but harnesses that can't execute the emitted
    /// i686 bytes directly need this to simulate that write.
    pub fn deopt_page_address(&self) -> Option<u32> {
        self.deopt_page.address()
    }

    /// The dense deopt-page slot assigned to `function_address`, once a
    /// compile attempt has claimed one.
    pub fn deopt_slot_of(&self, function_address: u32) -> Option<u32> {
        self.blocks.get(&function_address).and_then(|b| b.deopt_slot)
    }

    /// Entry point: `hook(function, arguments, argument_count)` (spec §4.12).
    /// Returns `1` when native code is installed and the interpreter should
    /// dispatch to it immediately, `0` to continue interpreting.
    pub fn hook(&mut self, host: &mut dyn Host, function_address: u32, arguments_pointer: u32, argument_count: u16) -> u32 {
        let now = host.now_ticks();
        {
            let block = self
                .blocks
                .entry(function_address)
                .or_insert_with(|| ControlBlock::new(argument_count as usize));
            block.last_access_ticks = now;
        }

        let block = self.blocks.get(&function_address).unwrap();
        if block.state == BlockState::Blacklisted {
            debug!("hook: 0x{function_address:08x} blacklisted");
            return 0;
        }

        // Polled before the "already compiled" fast path: a deopt can be
        // signalled by code installed from a previous compile, and must be
        // caught on the very next call regardless of whether the block still
        // looks Compiled at this point.
        let deopt_slot = block.deopt_slot;
        if let Some(slot) = deopt_slot {
            if self.deopt_page.check_and_clear(host, slot).unwrap_or(false) {
                self.deoptimize(host, function_address);
                return 0;
            }
        }

        let block = self.blocks.get(&function_address).unwrap();
        if block.state == BlockState::Compiled {
            return 1;
        }

        let tags = read_arg_tags(host, arguments_pointer, argument_count);
        let block = self.blocks.get_mut(&function_address).unwrap();
        block.speculator.observe(&tags);
        block.state = BlockState::Observed;

        let block = self.blocks.get(&function_address).unwrap();
        let call_count = block.speculator.call_count();
        if call_count < self.config.int_compile_threshold {
            return 0;
        }

        if block.speculator.all_integer_like() {
            debug!("hook: 0x{function_address:08x} eligible for int-tier compile after {call_count} calls");
            self.try_compile_int(host, function_address)
        } else if block.speculator.has_float64() {
            debug!("hook: 0x{function_address:08x} has float args, attempting float-tier compile");
            let _ = self.try_compile_float(host, function_address);
            0
        } else {
            if call_count < self.config.int_compile_threshold * self.config.any_blacklist_multiplier {
                return 0;
            }
            warn!("hook: 0x{function_address:08x} blacklisted (all-Any after {call_count} calls)");
            self.blocks.get_mut(&function_address).unwrap().state = BlockState::Blacklisted;
            0
        }
    }

    fn try_compile_int(&mut self, host: &mut dyn Host, function_address: u32) -> u32 {
        if let Some(bytes) = self.cache.get(function_address) {
            let bytes = bytes.to_vec();
            self.stats.cache_hits += 1;
            return self.publish(host, function_address, &bytes, None);
        }
        self.stats.cache_misses += 1;

        let reader = match BytecodeReader::new(host, function_address) {
            Ok(r) => r,
            Err(e @ crate::JitError::ProbeFailed { .. }) => {
                // Spec §7 "Probe failure": the host couldn't be read this
                // attempt; no counter changes, just wait for the next call.
                warn!("hook: 0x{function_address:08x} bail (reader): {e}");
                return 0;
            }
            Err(e @ crate::JitError::BytecodeInvalid(_)) => {
                // Spec §7 "Bytecode invalid": blacklisted immediately, never
                // worth a recompile attempt.
                warn!("hook: 0x{function_address:08x} blacklisted (reader): {e}");
                self.blocks.get_mut(&function_address).unwrap().state = BlockState::Blacklisted;
                return 0;
            }
            Err(e) => {
                warn!("hook: 0x{function_address:08x} bail (reader): {e}");
                self.record_bail(function_address, false);
                return 0;
            }
        };

        let block = self.blocks.get_mut(&function_address).unwrap();
        block.ic.clear();
        host.probe_inline_caches(function_address, &mut block.ic);
        let ic_was_empty = block.ic.is_empty();

        let analysis = preanalysis::analyze(&reader);
        let reg_binding = regalloc::allocate(&reader, &analysis);

        let deopt_address = match self.deopt_page.ensure_allocated(host) {
            Ok(addr) => addr,
            Err(e) => {
                warn!("hook: 0x{function_address:08x} bail (deopt page): {e}");
                self.record_bail(function_address, false);
                return 0;
            }
        };
        let block = self.blocks.get_mut(&function_address).unwrap();
        let deopt_slot = match block.deopt_slot {
            Some(slot) => slot,
            None => match self.deopt_page.assign_slot() {
                Ok(slot) => {
                    block.deopt_slot = Some(slot);
                    slot
                }
                Err(e) => {
                    warn!("hook: 0x{function_address:08x} bail (deopt slot): {e}");
                    self.record_bail(function_address, false);
                    return 0;
                }
            },
        };

        let block = self.blocks.get(&function_address).unwrap();
        let compiled = int_tier::compile(&reader, &analysis, &block.ic, reg_binding, deopt_address, deopt_slot, &block.speculator);

        match compiled {
            Ok(body) => {
                self.blocks.get_mut(&function_address).unwrap().bail_count = 0;
                let code = body.code.clone();
                let published = self.publish(host, function_address, &code, Some(&body.osr));
                if published == 1 {
                    self.stats.compiled += 1;
                    let _ = self.cache.insert(function_address, &code);
                    info!("hook: 0x{function_address:08x} compiled ({} bytes)", code.len());
                }
                published
            }
            Err(e) => {
                warn!("hook: 0x{function_address:08x} bail (compile): {e}");
                // Spec §8 invariant 10: a bail caused solely by missing IC data
                // (the profile hasn't accrued entries yet) doesn't consume a
                // bail slot. Any other reason — unsupported opcode, stack
                // overflow, etc. — always counts.
                let missing_ic_data = ic_was_empty && matches!(e, crate::JitError::MissingIcEntry { .. });
                self.record_bail(function_address, missing_ic_data);
                0
            }
        }
    }

    fn try_compile_float(&mut self, host: &mut dyn Host, function_address: u32) -> JitResult<()> {
        let reader = BytecodeReader::new(host, function_address)?;
        let analysis = preanalysis::analyze(&reader);
        let body = float_tier::compile(&reader, &analysis)?;

        let addr = host
            .jit_alloc(body.code.len() as u32)
            .ok_or(crate::JitError::PoolExhausted { requested: body.code.len() as u32 })?;
        host.jit_write(addr, &body.code);
        self.float_native.insert(function_address, addr);
        self.stats.float_compiled += 1;
        info!("hook: 0x{function_address:08x} float-tier compiled ({} bytes)", body.code.len());
        Ok(())
    }

    /// Allocates a pool slot (retrying once after a GC on exhaustion), writes
    /// the bytes, publishes the native pointer, and installs OSR entries.
    fn publish(&mut self, host: &mut dyn Host, function_address: u32, code: &[u8], osr: Option<&crate::osr::OsrMap>) -> u32 {
        let mut addr = host.jit_alloc(code.len() as u32);
        if addr.is_none() {
            self.pool_gc(host);
            addr = host.jit_alloc(code.len() as u32);
        }
        let Some(addr) = addr else {
            warn!("hook: 0x{function_address:08x} blacklisted (pool exhausted after GC)");
            self.blocks.get_mut(&function_address).unwrap().state = BlockState::Blacklisted;
            return 0;
        };

        host.jit_write(addr, code);
        host.set_native_pointer(function_address, addr);
        if let Some(osr) = osr {
            osr.install(host, function_address, addr);
            trace!("hook: 0x{function_address:08x} installed {} OSR entries", osr.entries().len());
        }
        self.blocks.get_mut(&function_address).unwrap().state = BlockState::Compiled;
        1
    }

    /// Pool-GC (spec §4.12): clears every control block's installed native
    /// pointer, un-blacklists them so they may recompile, then rewinds the
    /// bump allocator.
    fn pool_gc(&mut self, host: &mut dyn Host) {
        for (&addr, block) in self.blocks.iter_mut() {
            if block.state == BlockState::Compiled {
                host.set_native_pointer(addr, 0);
            }
            block.state = BlockState::Observed;
        }
        let reclaimed = host.jit_main_reset();
        self.deopt_page.invalidate();
        self.stats.pool_resets += 1;
        debug!("pool_gc: reclaimed {reclaimed} bytes");
    }

    /// Records a compile bail. `skip_bail_count` is set only for the case
    /// spec §8 invariant 10 exempts: a `MissingIcEntry` failure while the IC
    /// table is still empty, since that data may simply not have accrued yet.
    fn record_bail(&mut self, function_address: u32, skip_bail_count: bool) {
        self.stats.bailed += 1;
        if skip_bail_count {
            return;
        }
        let block = self.blocks.get_mut(&function_address).unwrap();
        block.bail_count += 1;
        if block.bail_count >= self.config.max_bails {
            warn!("hook: 0x{function_address:08x} blacklisted (bail limit reached)");
            block.state = BlockState::Blacklisted;
        }
    }

    /// Deoptimises `function_address`: clears the native pointer, increments
    /// the deopt counter, and blacklists with the deopt sentinel once the
    /// limit is exceeded (spec §4.12).
    pub fn deoptimize(&mut self, host: &mut dyn Host, function_address: u32) {
        host.set_native_pointer(function_address, 0);
        self.stats.deopts += 1;
        let Some(block) = self.blocks.get_mut(&function_address) else { return };
        block.state = BlockState::Observed;
        block.deopt_count += 1;
        warn!("deoptimize: 0x{function_address:08x} (deopt #{})", block.deopt_count);
        if block.deopt_count >= self.config.max_deopts {
            host.set_native_pointer(function_address, DEOPT_SENTINEL);
            block.state = BlockState::Blacklisted;
            warn!("deoptimize: 0x{function_address:08x} permanently blacklisted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::TestHost;

    fn host_with(code: &[u8], arg_count: u16, local_count: u16) -> TestHost {
        let mut host = TestHost::new(1 << 16, 4096);
        let code_ptr = 2000u32;
        host.write(code_ptr, code);
        host.write(0, &code_ptr.to_le_bytes());
        host.write(4, &(code.len() as u32).to_le_bytes());
        host.write(8, &arg_count.to_le_bytes());
        host.write(10, &local_count.to_le_bytes());
        host.write(12, &0u32.to_le_bytes());
        host.write(16, &0u16.to_le_bytes());
        host
    }

    fn write_int_arg(host: &mut TestHost, args_ptr: u32, slot: u32, value: i32) {
        host.write(args_ptr + 8 * slot, &value.to_le_bytes());
        host.write(args_ptr + 8 * slot + 4, &0u32.to_le_bytes());
    }

    #[test]
    fn stays_interpreted_below_threshold() {
        let mut host = host_with(&[0x01, 1, 0, 0, 0, 0x80], 0, 0);
        let mut controller = JitController::new(JitConfig::default());
        for _ in 0..5 {
            assert_eq!(controller.hook(&mut host, 0, 5000, 0), 0);
        }
    }

    #[test]
    fn compiles_after_threshold_with_all_integer_args() {
        let mut host = host_with(
            &[
                0x18, 0, 0, // get_arg 0
                0x80, // return_val
            ],
            1,
            0,
        );
        let args_ptr = 5000u32;
        write_int_arg(&mut host, args_ptr, 0, 7);
        let mut controller = JitController::new(JitConfig::default());
        let mut last = 0;
        for _ in 0..(INT_COMPILE_THRESHOLD + 1) {
            last = controller.hook(&mut host, 0, args_ptr, 1);
        }
        assert_eq!(last, 1);
        assert_ne!(host.native_pointer_of(0), 0);
        assert_eq!(controller.stats().compiled, 1);
    }

    #[test]
    fn blacklists_after_repeated_deopt() {
        let mut host = host_with(
            &[
                0x18, 0, 0, // get_arg 0
                0x60, 7, 0, 0, 0, // get_field atom=7
                0x80, // return_val
            ],
            1,
            0,
        );
        let args_ptr = 5000u32;
        write_int_arg(&mut host, args_ptr, 0, 0);
        let mut controller = JitController::new(JitConfig::default());

        // Bails repeatedly: no IC entries are ever probed (TestHost's
        // probe_inline_caches is a no-op), so the IC table stays empty and
        // the bail counter never increments past zero; this only exercises
        // that the controller keeps returning 0 without panicking.
        for _ in 0..(INT_COMPILE_THRESHOLD + 5) {
            assert_eq!(controller.hook(&mut host, 0, args_ptr, 1), 0);
        }
        assert_eq!(controller.stats().compiled, 0);
    }

    #[test]
    fn probe_failure_does_not_bail_or_blacklist() {
        // function_address points past TestHost's memory entirely, so every
        // descriptor field read fails with ProbeFailed.
        let mut host = TestHost::new(1 << 16, 4096);
        let args_ptr = 5000u32;
        write_int_arg(&mut host, args_ptr, 0, 1);
        let bogus_function = 1_000_000u32;
        let mut controller = JitController::new(JitConfig::default());

        for _ in 0..(INT_COMPILE_THRESHOLD + 5) {
            assert_eq!(controller.hook(&mut host, bogus_function, args_ptr, 1), 0);
        }
        // Spec §7 "Probe failure": no counter change at all, not even a bail.
        assert_eq!(controller.stats().bailed, 0);
    }

    #[test]
    fn bytecode_invalid_blacklists_on_first_attempt() {
        let mut host = host_with(&[], 0, 0);
        let mut controller = JitController::new(JitConfig::default());

        for _ in 0..(INT_COMPILE_THRESHOLD + 5) {
            assert_eq!(controller.hook(&mut host, 0, 5000, 0), 0);
        }
        // Blacklisted on the very first compile attempt: the bail path (which
        // would require MAX_BAILS attempts) is never entered.
        assert_eq!(controller.stats().bailed, 0);
    }

    #[test]
    fn blacklists_all_any_function_after_extended_threshold() {
        let mut host = host_with(&[0x18, 0, 0, 0x80], 1, 0);
        let args_ptr = 5000u32;
        host.write(args_ptr, &0i32.to_le_bytes());
        host.write(args_ptr + 4, &3u32.to_le_bytes()); // tag 3 = Other/Any
        let mut controller = JitController::new(JitConfig::default());
        for _ in 0..(INT_COMPILE_THRESHOLD * ANY_BLACKLIST_MULTIPLIER + 1) {
            controller.hook(&mut host, 0, args_ptr, 1);
        }
        assert_eq!(controller.hook(&mut host, 0, args_ptr, 1), 0);
    }
}
