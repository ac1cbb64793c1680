//! Per-isolate JIT (spec §4.13): a reduced controller for an isolated
//! secondary runtime that cannot reach back into the primary
//! [`crate::controller::JitController`]'s state. Shares the integer code
//! generator but keeps its own compiled map, blacklist, and bail counts, and
//! allocates from a distinct per-isolate pool.

use std::collections::{HashMap, HashSet};

use log::{info, warn};

use crate::bytecode::BytecodeReader;
use crate::codegen::int_tier;
use crate::controller::JitConfig;
use crate::host::Host;
use crate::ic::IcTable;
use crate::preanalysis;
use crate::regalloc;
use crate::speculator::TypeSpeculator;

struct IsolateBlock {
    speculator: TypeSpeculator,
    bail_count: u32,
}

/// A reduced controller bound to one isolate id. The host scheduler polls
/// each live isolate for a "pending JIT" bytecode address and drives a
/// single compile attempt through [`IsolateJit::service`].
pub struct IsolateJit {
    isolate_id: u32,
    config: JitConfig,
    blocks: HashMap<u32, IsolateBlock>,
    blacklisted: HashSet<u32>,
    compiled: HashSet<u32>,
}

impl IsolateJit {
    pub fn new(isolate_id: u32, config: JitConfig) -> Self {
        IsolateJit {
            isolate_id,
            config,
            blocks: HashMap::new(),
            blacklisted: HashSet::new(),
            compiled: HashSet::new(),
        }
    }

    pub fn isolate_id(&self) -> u32 {
        self.isolate_id
    }

    pub fn is_blacklisted(&self, function_address: u32) -> bool {
        self.blacklisted.contains(&function_address)
    }

    pub fn is_compiled(&self, function_address: u32) -> bool {
        self.compiled.contains(&function_address)
    }

    /// Runs a single compile attempt for `function_address` against this
    /// isolate's own pool. Returns `true` if native code was installed.
    pub fn service(&mut self, host: &mut dyn Host, function_address: u32, argument_tags: &[crate::speculator::ObservedTag]) -> bool {
        if self.blacklisted.contains(&function_address) || self.compiled.contains(&function_address) {
            return self.compiled.contains(&function_address);
        }

        let block = self
            .blocks
            .entry(function_address)
            .or_insert_with(|| IsolateBlock { speculator: TypeSpeculator::new(argument_tags.len()), bail_count: 0 });
        block.speculator.observe(argument_tags);

        if block.speculator.call_count() < self.config.int_compile_threshold {
            return false;
        }
        if !block.speculator.all_integer_like() {
            return false;
        }

        let reader = match BytecodeReader::new(host, function_address) {
            Ok(r) => r,
            Err(e @ crate::JitError::ProbeFailed { .. }) => {
                // Spec §7 "Probe failure": no counter change, just try again
                // on a later poll.
                warn!("isolate {}: 0x{function_address:08x} bail (reader): {e}", self.isolate_id);
                return false;
            }
            Err(e @ crate::JitError::BytecodeInvalid(_)) => {
                // Spec §7 "Bytecode invalid": blacklisted immediately.
                warn!("isolate {}: 0x{function_address:08x} blacklisted (reader): {e}", self.isolate_id);
                self.blacklisted.insert(function_address);
                return false;
            }
            Err(e) => {
                warn!("isolate {}: 0x{function_address:08x} bail (reader): {e}", self.isolate_id);
                self.bail(function_address);
                return false;
            }
        };

        let mut ic = IcTable::new();
        host.probe_inline_caches(function_address, &mut ic);
        let ic_was_empty = ic.is_empty();

        let analysis = preanalysis::analyze(&reader);
        let reg_binding = regalloc::allocate(&reader, &analysis);
        let speculator = self.blocks.get(&function_address).unwrap().speculator.clone();

        match int_tier::compile(&reader, &analysis, &ic, reg_binding, 0, 0, &speculator) {
            Ok(body) => match host.jit_alloc_per_isolate(self.isolate_id, body.code.len() as u32) {
                Some(addr) => {
                    host.jit_write(addr, &body.code);
                    host.set_native_pointer(function_address, addr);
                    self.compiled.insert(function_address);
                    info!(
                        "isolate {}: 0x{function_address:08x} compiled ({} bytes)",
                        self.isolate_id,
                        body.code.len()
                    );
                    true
                }
                None => {
                    warn!("isolate {}: 0x{function_address:08x} pool exhausted", self.isolate_id);
                    self.blacklisted.insert(function_address);
                    false
                }
            },
            Err(e) => {
                warn!("isolate {}: 0x{function_address:08x} bail (compile): {e}", self.isolate_id);
                if !ic_was_empty {
                    self.bail(function_address);
                }
                false
            }
        }
    }

    fn bail(&mut self, function_address: u32) {
        let block = self.blocks.get_mut(&function_address).unwrap();
        block.bail_count += 1;
        if block.bail_count >= self.config.max_bails {
            self.blacklisted.insert(function_address);
        }
    }

    /// Drops all JIT state for this isolate (spec §4.13: "may be purged when
    /// the isolate is destroyed").
    pub fn purge(&mut self) {
        self.blocks.clear();
        self.blacklisted.clear();
        self.compiled.clear();
    }
}
