//! End-to-end seed scenarios (spec §8 "Concrete end-to-end scenarios").
//!
//! This crate targets i686/cdecl native codegen, but the toolchain this test
//! suite runs under is x86_64 with no i686 target installed — the same
//! reason `host::mmap` is gated `cfg(target_arch = "x86")` and not exercised
//! here. These scenarios therefore drive the controller's decision plane
//! (`JitController::hook`) the way a real interpreter would, and assert on
//! what the controller itself is responsible for: compilation, native
//! pointer publication, OSR bookkeeping, deopt/blacklist transitions, and
//! bail accounting. Where a scenario's observable effect is something only
//! the *emitted* native code could produce (the inline-cache MISS path's
//! deopt-flag write), the test writes that byte directly through the
//! introspection accessors the controller exposes for exactly this purpose.

use tierjit::controller::{JitConfig, JitController};
use tierjit::host::{FunctionOffsets, Host, TestHost};
use tierjit::ic::IcTable;
use tierjit::{DEOPT_SENTINEL, INT_COMPILE_THRESHOLD};

/// Wraps a [`TestHost`] and answers `probe_inline_caches` from a list of read
/// entries the test populates up front, the way a real host's
/// interpreter-side profiler would have accumulated entries by the time the
/// JIT asks.
struct ScenarioHost {
    inner: TestHost,
    reads: Vec<(u32, u32, u32, u32)>, // (instr_addr, atom, shape, slot_offset)
}

impl ScenarioHost {
    fn new(inner: TestHost, reads: Vec<(u32, u32, u32, u32)>) -> Self {
        ScenarioHost { inner, reads }
    }
}

impl Host for ScenarioHost {
    fn read_physical_memory(&self, address: u32, length: u32) -> Option<Vec<u8>> {
        self.inner.read_physical_memory(address, length)
    }

    fn probe_inline_caches(&self, _function_address: u32, ic_table: &mut IcTable) {
        for &(instr_addr, atom, shape, slot_offset) in &self.reads {
            ic_table.set_read(instr_addr, atom, shape, slot_offset);
        }
    }

    fn jit_alloc(&mut self, size: u32) -> Option<u32> {
        self.inner.jit_alloc(size)
    }

    fn jit_alloc_per_isolate(&mut self, isolate_id: u32, size: u32) -> Option<u32> {
        self.inner.jit_alloc_per_isolate(isolate_id, size)
    }

    fn jit_write(&mut self, native_address: u32, bytes: &[u8]) {
        self.inner.jit_write(native_address, bytes);
    }

    fn jit_main_reset(&mut self) -> u32 {
        self.inner.jit_main_reset()
    }

    fn set_native_pointer(&mut self, function_address: u32, native_address: u32) {
        self.inner.set_native_pointer(function_address, native_address);
    }

    fn install_osr_entry(&mut self, function_address: u32, loop_header_bytecode_offset: u32, native_address: u32) {
        self.inner.install_osr_entry(function_address, loop_header_bytecode_offset, native_address);
    }

    fn function_offsets(&self) -> FunctionOffsets {
        self.inner.function_offsets()
    }

    fn now_ticks(&self) -> u64 {
        self.inner.now_ticks()
    }
}

fn descriptor_host(code: &[u8], arg_count: u16, local_count: u16, memory_size: u32, pool_len: u32) -> TestHost {
    let mut host = TestHost::new(memory_size, pool_len);
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

fn write_arg(host: &mut TestHost, args_ptr: u32, slot: u32, payload: i32, tag: u32) {
    host.write(args_ptr + 8 * slot, &payload.to_le_bytes());
    host.write(args_ptr + 8 * slot + 4, &tag.to_le_bytes());
}

/// (a) Trivial integer function: `push_i32 5; push_i32 7; add; return_val`.
/// After 10 interpreted calls the hook compiles and publishes a native
/// pointer.
#[test]
fn seed_a_trivial_integer_function_compiles_and_publishes() {
    let code: Vec<u8> = vec![
        0x01, 5, 0, 0, 0, // push_i32 5
        0x01, 7, 0, 0, 0, // push_i32 7
        0x40, // add
        0x80, // return_val
    ];
    let mut host = descriptor_host(&code, 0, 0, 1 << 16, 4096);
    let mut controller = JitController::new(JitConfig::default());

    let mut last = 0;
    for _ in 0..(INT_COMPILE_THRESHOLD + 1) {
        last = controller.hook(&mut host, 0, 9000, 0);
    }

    assert_eq!(last, 1);
    assert_ne!(host.native_pointer_of(0), 0);
    assert_eq!(controller.stats().compiled, 1);
}

/// (b) Tight integer loop summing `0..n-1`. After 10 calls with arg 100,
/// compilation succeeds and the OSR entry map contains exactly one entry at
/// the loop header's bytecode offset.
#[test]
fn seed_b_tight_loop_compiles_with_one_osr_entry() {
    // arg0 = n, loc0 = accumulator, loc1 = i.
    let code: Vec<u8> = {
        let mut code: Vec<u8> = vec![
            0x01, 0, 0, 0, 0, // push_i32 0
            0x11, 0, 0, // put_loc 0
            0x01, 0, 0, 0, 0, // push_i32 0
            0x11, 1, 0, // put_loc 1
            0x10, 1, 0, // get_loc 1      <- loop header, pc 16
            0x18, 0, 0, // get_arg 0
            0x54, // lt
            0x74, 0, 0, 0, 0, // if_false32 -> end
            0x10, 0, 0, // get_loc 0
            0x10, 1, 0, // get_loc 1
            0x40, // add
            0x11, 0, 0, // put_loc 0
            0x1e, 1, 0, // inc_loc16 1
            0x72, 0, 0, 0, 0, // goto32 -> loop header
            0x10, 0, 0, // get_loc 0
            0x80, // return_val
        ];
        let loop_header = 16u32;
        let if_false_pc = 16 + 3 + 3 + 1;
        let goto_pc = (code.len() - 1 - 3 - 5) as u32;
        let end_pc = goto_pc + 5; // the get_loc0/return_val exit sequence
        let rel_end = end_pc as i32 - (if_false_pc + 5);
        code[if_false_pc as usize + 1..if_false_pc as usize + 5].copy_from_slice(&rel_end.to_le_bytes());
        let rel_loop = loop_header as i32 - (goto_pc as i32 + 5);
        code[goto_pc as usize + 1..goto_pc as usize + 5].copy_from_slice(&rel_loop.to_le_bytes());
        code
    };

    let mut host = descriptor_host(&code, 1, 2, 1 << 16, 4096);
    let args_ptr = 9000u32;
    write_arg(&mut host, args_ptr, 0, 100, 0);
    let mut controller = JitController::new(JitConfig::default());

    let mut last = 0;
    for _ in 0..(INT_COMPILE_THRESHOLD + 1) {
        last = controller.hook(&mut host, 0, args_ptr, 1);
    }

    assert_eq!(last, 1);
    assert_ne!(host.native_pointer_of(0), 0);
    let osr = host.osr_entries_for(0);
    assert_eq!(osr.len(), 1);
    assert_eq!(osr[0].0, 16);
}

/// (c) Deopt on IC miss. `get_arg 0; get_field <atom=7>; return_val`, with
/// one IC read entry (shape 0xA1, slot +12). After compilation, the next
/// hook call following a simulated MISS-path flag write observes the flag,
/// clears it, and deopts (deopt counter becomes 1), returning 0.
#[test]
fn seed_c_ic_miss_triggers_deopt() {
    let code: Vec<u8> = vec![
        0x18, 0, 0, // get_arg 0       (pc 0)
        0x60, 7, 0, 0, 0, // get_field atom=7   (pc 3)
        0x80, // return_val
    ];
    let inner = descriptor_host(&code, 1, 0, 1 << 16, 4096);
    let mut host = ScenarioHost::new(inner, vec![(3, 7, 0xA1, 12)]);

    // An object with shape 0xA1 (offset 4) and field value 99 at offset 12.
    let obj_addr = 10_000u32;
    host.inner.write(obj_addr, &0u32.to_le_bytes());
    host.inner.write(obj_addr + 4, &0xA1u32.to_le_bytes());
    host.inner.write(obj_addr + 12, &99i32.to_le_bytes());

    let args_ptr = 9000u32;
    write_arg(&mut host.inner, args_ptr, 0, obj_addr as i32, 0);

    let mut controller = JitController::new(JitConfig::default());
    let mut last = 0;
    for _ in 0..(INT_COMPILE_THRESHOLD + 1) {
        last = controller.hook(&mut host, 0, args_ptr, 1);
    }
    assert_eq!(last, 1);
    assert_ne!(host.inner.native_pointer_of(0), 0);
    assert_eq!(controller.stats().deopts, 0);

    // Simulate the emitted MISS path's side effect: a call with an object of
    // a different shape would have written a non-zero byte to this
    // function's deopt slot instead of returning a value.
    let page_addr = controller.deopt_page_address().expect("deopt page allocated during compile");
    let slot = controller.deopt_slot_of(0).expect("deopt slot assigned during compile");
    host.inner.write(page_addr + slot, &[1]);

    let result = controller.hook(&mut host, 0, args_ptr, 1);
    assert_eq!(result, 0);
    assert_eq!(controller.stats().deopts, 1);
    // The flag is consumed: a further hook call with no new MISS doesn't
    // deopt again just because the slot was visited.
    assert_eq!(host.inner.read_physical_memory(page_addr + slot, 1).unwrap(), vec![0]);
}

/// (d) Blacklist after repeated deopt. Repeating scenario (c) three times
/// (recompiling between each, since a deopt reverts the function to
/// `Observed`) ends with the native pointer set to the deopt sentinel and
/// the function permanently blacklisted.
#[test]
fn seed_d_blacklists_after_repeated_deopt() {
    let code: Vec<u8> = vec![
        0x18, 0, 0, // get_arg 0
        0x60, 7, 0, 0, 0, // get_field atom=7
        0x80, // return_val
    ];
    let inner = descriptor_host(&code, 1, 0, 1 << 16, 4096);
    let mut host = ScenarioHost::new(inner, vec![(3, 7, 0xA1, 12)]);

    let obj_addr = 10_000u32;
    host.inner.write(obj_addr, &0u32.to_le_bytes());
    host.inner.write(obj_addr + 4, &0xA1u32.to_le_bytes());
    host.inner.write(obj_addr + 12, &99i32.to_le_bytes());
    let args_ptr = 9000u32;
    write_arg(&mut host.inner, args_ptr, 0, obj_addr as i32, 0);

    let mut controller = JitController::new(JitConfig::default());
    for _ in 0..(INT_COMPILE_THRESHOLD + 1) {
        controller.hook(&mut host, 0, args_ptr, 1);
    }

    for round in 1..=3u32 {
        let page_addr = controller.deopt_page_address().expect("deopt page present");
        let slot = controller.deopt_slot_of(0).expect("deopt slot assigned");
        host.inner.write(page_addr + slot, &[1]);
        let result = controller.hook(&mut host, 0, args_ptr, 1);
        assert_eq!(result, 0, "round {round}");
        assert_eq!(controller.stats().deopts, round as u64);

        if round < 3 {
            // Below the deopt limit: the function is merely un-compiled, not
            // blacklisted, so it recompiles on the next threshold crossing.
            assert_ne!(host.inner.native_pointer_of(0), DEOPT_SENTINEL);
            for _ in 0..(INT_COMPILE_THRESHOLD + 1) {
                controller.hook(&mut host, 0, args_ptr, 1);
            }
        }
    }

    assert_eq!(host.inner.native_pointer_of(0), DEOPT_SENTINEL);
    assert_eq!(controller.hook(&mut host, 0, args_ptr, 1), 0);
}

/// (e) Unsupported opcode. A function containing a `call` opcode bails at
/// emission every attempt; after three bails in a row the function is
/// blacklisted.
#[test]
fn seed_e_unsupported_opcode_blacklists_after_three_bails() {
    let code: Vec<u8> = vec![
        0x18, 0, 0, // get_arg 0
        0x90, 0, // call <unsupported>
        0x80, // return_val
    ];
    let mut host = descriptor_host(&code, 1, 0, 1 << 16, 4096);
    let args_ptr = 9000u32;
    write_arg(&mut host, args_ptr, 0, 1, 0);
    let mut controller = JitController::new(JitConfig::default());

    // Cross the compile threshold, then keep calling: every attempt past the
    // threshold bails on the same unsupported opcode.
    for _ in 0..(INT_COMPILE_THRESHOLD + 10) {
        controller.hook(&mut host, 0, args_ptr, 1);
    }

    assert_eq!(controller.stats().compiled, 0);
    assert!(controller.stats().bailed >= 3);
    assert_eq!(controller.hook(&mut host, 0, args_ptr, 1), 0);
    let bailed_before = controller.stats().bailed;
    controller.hook(&mut host, 0, args_ptr, 1);
    // Blacklisted: the hook returns immediately without attempting another
    // compile, so the bail counter does not move.
    assert_eq!(controller.stats().bailed, bailed_before);
}

/// (f) Float tier. `get_arg 0; get_arg 1; add; return_val` invoked with
/// double arguments: the integer tier refuses, the float tier succeeds, and
/// the result is reachable only through `float_native_address` — never
/// through the interpreter's native pointer slot (spec §4.8, §8 invariant
/// 12).
#[test]
fn seed_f_float_tier_compiles_without_publishing_native_pointer() {
    let code: Vec<u8> = vec![
        0x18, 0, 0, // get_arg 0
        0x18, 1, 0, // get_arg 1
        0x40, // add
        0x80, // return_val
    ];
    let mut host = descriptor_host(&code, 2, 0, 1 << 16, 4096);
    let args_ptr = 9000u32;
    write_arg(&mut host, args_ptr, 0, 0, 2);
    write_arg(&mut host, args_ptr, 1, 0, 2);
    let mut controller = JitController::new(JitConfig::default());

    // Exactly the threshold: a float-tier attempt runs once the speculator
    // has enough samples, and (unlike the integer tier) the block never
    // flips to Compiled, so further calls would attempt it again.
    for _ in 0..INT_COMPILE_THRESHOLD {
        controller.hook(&mut host, 0, args_ptr, 2);
    }

    assert_eq!(controller.stats().compiled, 0);
    assert_eq!(controller.stats().float_compiled, 1);
    assert_eq!(host.native_pointer_of(0), 0);
    assert!(controller.float_native_address(0).is_some());
}
