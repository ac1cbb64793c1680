//! Integer code generator (spec §4.7): translates the JIT-supported opcode
//! set into i686 machine code through [`crate::emitter::CodeEmitter`].
//!
//! Frame layout: declared locals occupy `[ebp-4, ebp-4*local_count]`, followed
//! by [`SCRATCH_SLOTS`] internal dwords used only by the array-IC opcodes to
//! juggle index/array-pointer/value across the bounds check (the accumulator
//! and count register alone aren't enough to carry three live values through
//! a multiply). Arguments sit at their cdecl offsets, `ebp+8, ebp+12, ...`.

use crate::bytecode::{BytecodeReader, ConstValue};
use crate::codegen::CompiledBody;
use crate::emitter::{CodeEmitter, Cc};
use crate::ic::IcTable;
use crate::opcode::Opcode;
use crate::osr::OsrMap;
use crate::preanalysis::{self, PreAnalysis};
use crate::regalloc::RegisterBinding;
use crate::speculator::TypeSpeculator;
use crate::{JitError, JitResult};

/// Internal scratch dwords reserved beyond declared locals, used only by the
/// array-IC opcodes (spec does not name these; an implementation detail of
/// this emitter, recorded in DESIGN.md).
const SCRATCH_SLOTS: u32 = 3;

/// Atom id convention the embedding host assigns to the string `"number"`.
/// Used only by the `typeof`/`strict_eq` fusion (spec §13).
const NUMBER_ATOM_ID: i32 = 1;

fn local_disp(index: u32) -> i32 {
    -4 * (index as i32 + 1)
}

fn arg_disp(index: u32) -> i32 {
    8 + 4 * index as i32
}

fn scratch_disp(local_count: u32, slot: u32) -> i32 {
    -4 * (local_count as i32 + 1 + slot as i32)
}

fn is_bound(reg: Option<RegisterBinding>, is_argument: bool, index: u32) -> bool {
    matches!(reg, Some(b) if b.is_argument == is_argument && b.var_index == index)
}

/// Translates `reader`'s bytecode to native i686 code. Bails with a
/// [`JitError`] the first time it encounters an opcode, IC site, or constant
/// tag it cannot represent; never panics on a well-formed reader.
#[allow(clippy::too_many_arguments)]
pub fn compile(
    reader: &BytecodeReader,
    analysis: &PreAnalysis,
    ic: &IcTable,
    reg_binding: Option<RegisterBinding>,
    deopt_address: u32,
    deopt_slot: u32,
    speculator: &TypeSpeculator,
) -> JitResult<CompiledBody> {
    let mut e = CodeEmitter::new();
    let local_count = reader.local_count as u32;
    let frame_bytes = 4 * (local_count + SCRATCH_SLOTS);

    e.emit_prologue(frame_bytes, reg_binding.is_some());

    for i in 0..local_count {
        e.zero_eax();
        e.store_eax_to_local(local_disp(i));
    }

    if let Some(binding) = reg_binding {
        if binding.is_argument {
            e.load_local_to_eax(arg_disp(binding.var_index));
            e.mov_eax_to_ebx();
        } else {
            e.zero_eax();
            e.mov_eax_to_ebx();
        }
    }

    let mut osr = OsrMap::new();
    let len = reader.len() as u32;
    let mut pc = 0u32;

    while pc < len {
        let byte = reader
            .u8_at(pc as usize)
            .ok_or_else(|| JitError::BytecodeInvalid("pc ran past the end of the function".to_string()))?;
        let op = Opcode::try_from_byte(byte).ok_or(JitError::UnsupportedOpcode(byte))?;
        if !op.is_jit_supported() {
            return Err(JitError::UnsupportedOpcode(byte));
        }
        e.mark_pc(pc);
        let mut advance = op.info().width;

        match op {
            Opcode::PushI32 => {
                let v = reader
                    .i32_at(pc as usize + 1)
                    .ok_or_else(|| JitError::BytecodeInvalid("truncated push_i32".to_string()))?;
                e.mov_imm_to_eax(v);
                e.push_eax()?;
            }
            Opcode::PushConst => {
                let idx = reader
                    .u16_at(pc as usize + 1)
                    .ok_or_else(|| JitError::BytecodeInvalid("truncated push_const".to_string()))?;
                match reader.const_at(idx as u32)? {
                    ConstValue::Integer(v) => e.mov_imm_to_eax(v),
                    ConstValue::Boolean(b) => e.mov_imm_to_eax(b as i32),
                    _ => return Err(JitError::UnsupportedConstantTag { index: idx as u32 }),
                }
                e.push_eax()?;
            }
            Opcode::PushTrue => {
                e.mov_imm_to_eax(1);
                e.push_eax()?;
            }
            Opcode::PushFalse | Opcode::PushNull | Opcode::PushUndefined => {
                e.zero_eax();
                e.push_eax()?;
            }

            Opcode::GetLoc | Opcode::GetLoc0 | Opcode::GetLoc1 | Opcode::GetLoc2 | Opcode::GetLoc3 => {
                let idx = match op {
                    Opcode::GetLoc => reader
                        .u16_at(pc as usize + 1)
                        .ok_or_else(|| JitError::BytecodeInvalid("truncated get_loc".to_string()))?
                        as u32,
                    Opcode::GetLoc0 => 0,
                    Opcode::GetLoc1 => 1,
                    Opcode::GetLoc2 => 2,
                    _ => 3,
                };
                if is_bound(reg_binding, false, idx) {
                    e.mov_ebx_to_eax();
                } else {
                    e.load_local_to_eax(local_disp(idx));
                }
                e.push_eax()?;
            }
            Opcode::PutLoc => {
                let idx = reader
                    .u16_at(pc as usize + 1)
                    .ok_or_else(|| JitError::BytecodeInvalid("truncated put_loc".to_string()))? as u32;
                e.pop_eax();
                e.store_eax_to_local(local_disp(idx));
                if is_bound(reg_binding, false, idx) {
                    e.mov_eax_to_ebx();
                }
            }
            Opcode::SetLoc => {
                let idx = reader
                    .u16_at(pc as usize + 1)
                    .ok_or_else(|| JitError::BytecodeInvalid("truncated set_loc".to_string()))? as u32;
                e.peek_tos_to_eax();
                e.store_eax_to_local(local_disp(idx));
                if is_bound(reg_binding, false, idx) {
                    e.mov_eax_to_ebx();
                }
            }
            Opcode::GetArg => {
                let idx = reader
                    .u16_at(pc as usize + 1)
                    .ok_or_else(|| JitError::BytecodeInvalid("truncated get_arg".to_string()))? as u32;
                if is_bound(reg_binding, true, idx) {
                    e.mov_ebx_to_eax();
                } else {
                    e.load_local_to_eax(arg_disp(idx));
                }
                e.push_eax()?;
            }
            Opcode::PutArg => {
                let idx = reader
                    .u16_at(pc as usize + 1)
                    .ok_or_else(|| JitError::BytecodeInvalid("truncated put_arg".to_string()))? as u32;
                e.pop_eax();
                e.store_eax_to_local(arg_disp(idx));
                if is_bound(reg_binding, true, idx) {
                    e.mov_eax_to_ebx();
                }
            }
            Opcode::SetArg => {
                let idx = reader
                    .u16_at(pc as usize + 1)
                    .ok_or_else(|| JitError::BytecodeInvalid("truncated set_arg".to_string()))? as u32;
                e.peek_tos_to_eax();
                e.store_eax_to_local(arg_disp(idx));
                if is_bound(reg_binding, true, idx) {
                    e.mov_eax_to_ebx();
                }
            }

            Opcode::IncLoc8 | Opcode::DecLoc8 => {
                let idx = reader
                    .u8_at(pc as usize + 1)
                    .ok_or_else(|| JitError::BytecodeInvalid("truncated inc/dec_loc8".to_string()))? as u32;
                let delta = if op == Opcode::IncLoc8 { 1 } else { -1 };
                e.load_local_to_eax(local_disp(idx));
                e.add_eax_imm(delta);
                e.store_eax_to_local(local_disp(idx));
                if is_bound(reg_binding, false, idx) {
                    e.mov_eax_to_ebx();
                }
            }
            Opcode::IncLoc16 | Opcode::DecLoc16 => {
                let idx = reader
                    .u16_at(pc as usize + 1)
                    .ok_or_else(|| JitError::BytecodeInvalid("truncated inc/dec_loc16".to_string()))? as u32;
                let delta = if op == Opcode::IncLoc16 { 1 } else { -1 };
                e.load_local_to_eax(local_disp(idx));
                e.add_eax_imm(delta);
                e.store_eax_to_local(local_disp(idx));
                if is_bound(reg_binding, false, idx) {
                    e.mov_eax_to_ebx();
                }
            }
            Opcode::AddLoc => {
                let idx = reader
                    .u16_at(pc as usize + 1)
                    .ok_or_else(|| JitError::BytecodeInvalid("truncated add_loc".to_string()))? as u32;
                e.pop_eax();
                e.mov_eax_to_ecx();
                e.load_local_to_eax(local_disp(idx));
                e.add_eax_ecx();
                e.store_eax_to_local(local_disp(idx));
                if is_bound(reg_binding, false, idx) {
                    e.mov_eax_to_ebx();
                }
            }

            Opcode::Drop => {
                e.pop_eax();
            }
            Opcode::Dup => {
                e.peek_tos_to_eax();
                e.push_eax()?;
            }
            Opcode::DupN => {
                let n = reader
                    .u8_at(pc as usize + 1)
                    .ok_or_else(|| JitError::BytecodeInvalid("truncated dup_n".to_string()))? as u32;
                e.peek_n_to_eax(n);
                e.push_eax()?;
            }
            Opcode::Nip => {
                e.peek_tos_to_eax();
                e.poke_eax_at(1);
                e.pop_eax();
            }
            Opcode::Swap => {
                e.peek_tos_to_eax();
                e.mov_eax_to_ecx();
                e.peek_n_to_eax(1);
                e.poke_eax_at(0);
                e.mov_ecx_to_eax();
                e.poke_eax_at(1);
            }
            Opcode::Rot3L => {
                e.peek_n_to_eax(2);
                e.mov_eax_to_ecx();
                e.peek_n_to_eax(1);
                e.poke_eax_at(2);
                e.peek_tos_to_eax();
                e.poke_eax_at(1);
                e.mov_ecx_to_eax();
                e.poke_eax_at(0);
            }
            Opcode::Rot3R => {
                e.peek_tos_to_eax();
                e.mov_eax_to_ecx();
                e.peek_n_to_eax(1);
                e.poke_eax_at(0);
                e.peek_n_to_eax(2);
                e.poke_eax_at(1);
                e.mov_ecx_to_eax();
                e.poke_eax_at(2);
            }
            Opcode::PostInc | Opcode::PostDec => {
                let delta = if op == Opcode::PostInc { 1 } else { -1 };
                e.peek_tos_to_eax();
                e.push_eax()?;
                e.peek_n_to_eax(1);
                e.add_eax_imm(delta);
                e.poke_eax_at(1);
            }

            Opcode::Add | Opcode::Sub | Opcode::Mul => {
                e.pop_to_ecx();
                e.pop_eax();
                match op {
                    Opcode::Add => e.add_eax_ecx(),
                    Opcode::Sub => e.sub_eax_ecx(),
                    _ => e.imul_eax_ecx(),
                }
                e.push_eax()?;
            }
            Opcode::Div | Opcode::Mod => {
                e.pop_to_ecx();
                e.pop_eax();
                e.cdq();
                e.idiv_ecx();
                if op == Opcode::Mod {
                    e.mov_edx_to_eax();
                }
                e.push_eax()?;
            }
            Opcode::Neg => {
                e.pop_eax();
                e.neg_eax();
                e.push_eax()?;
            }
            Opcode::BitNot => {
                e.pop_eax();
                e.not_eax();
                e.push_eax()?;
            }
            Opcode::LNot => {
                e.pop_eax();
                e.test_eax_eax();
                e.setcc_eax(Cc::Eq);
                e.push_eax()?;
            }
            Opcode::BitAnd | Opcode::BitOr | Opcode::BitXor | Opcode::Shl | Opcode::Sar | Opcode::Shr => {
                e.pop_to_ecx();
                e.pop_eax();
                match op {
                    Opcode::BitAnd => e.and_eax_ecx(),
                    Opcode::BitOr => e.or_eax_ecx(),
                    Opcode::BitXor => e.xor_eax_ecx(),
                    Opcode::Shl => e.shl_eax_cl(),
                    Opcode::Sar => e.sar_eax_cl(),
                    _ => e.shr_eax_cl(),
                }
                e.push_eax()?;
            }

            Opcode::Eq | Opcode::Ne | Opcode::StrictEq | Opcode::StrictNe | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                e.pop_to_ecx();
                e.pop_eax();
                e.cmp_eax_ecx();
                let cc = match op {
                    Opcode::Eq | Opcode::StrictEq => Cc::Eq,
                    Opcode::Ne | Opcode::StrictNe => Cc::Ne,
                    Opcode::Lt => Cc::Lt,
                    Opcode::Le => Cc::Le,
                    Opcode::Gt => Cc::Gt,
                    _ => Cc::Ge,
                };
                e.setcc_eax(cc);
                e.push_eax()?;
            }

            Opcode::GetField => {
                let atom = reader
                    .u32_at(pc as usize + 1)
                    .ok_or_else(|| JitError::BytecodeInvalid("truncated get_field".to_string()))?;
                let instr_addr = reader.function_address + pc;
                let entry = ic.get_read(instr_addr, atom).ok_or(JitError::MissingIcEntry { instr_addr, atom })?;
                e.pop_to_ecx();
                e.load_mem32_disp_from_ecx_to_eax(4);
                e.cmp_eax_imm(entry.shape as i32);
                let miss = e.emit_jcc(Cc::Ne);
                e.load_mem32_disp_from_ecx_to_eax(entry.slot_offset as i32);
                let done = e.emit_jmp();
                let miss_native = e.len();
                e.patch_rel32(miss, miss_native);
                e.store_imm8_to_absolute(deopt_address + deopt_slot, 1);
                e.zero_eax();
                let done_native = e.len();
                e.patch_rel32(done, done_native);
                e.push_eax()?;
            }
            Opcode::SetField => {
                let atom = reader
                    .u32_at(pc as usize + 1)
                    .ok_or_else(|| JitError::BytecodeInvalid("truncated set_field".to_string()))?;
                let instr_addr = reader.function_address + pc;
                let entry = ic.get_write(instr_addr, atom).ok_or(JitError::MissingIcEntry { instr_addr, atom })?;
                if !entry.writable {
                    return Err(JitError::MissingIcEntry { instr_addr, atom });
                }
                e.peek_n_to_eax(1);
                e.mov_eax_to_ecx();
                e.load_mem32_disp_from_ecx_to_eax(4);
                e.cmp_eax_imm(entry.shape as i32);
                let miss = e.emit_jcc(Cc::Ne);
                e.peek_tos_to_eax();
                e.store_eax_to_mem32_disp_at_ecx(entry.slot_offset as i32);
                let done = e.emit_jmp();
                let miss_native = e.len();
                e.patch_rel32(miss, miss_native);
                e.store_imm8_to_absolute(deopt_address + deopt_slot, 1);
                let done_native = e.len();
                e.patch_rel32(done, done_native);
                e.pop_eax();
                e.pop_eax();
            }
            Opcode::GetIndex => {
                let instr_addr = reader.function_address + pc;
                let entry = ic.get_array(instr_addr).ok_or(JitError::MissingIcEntry { instr_addr, atom: 0 })?;
                let sc_index = scratch_disp(local_count, 0);
                let sc_array = scratch_disp(local_count, 1);
                e.pop_to_ecx();
                e.mov_ecx_to_eax();
                e.store_eax_to_local(sc_index);
                e.pop_eax();
                e.store_eax_to_local(sc_array);
                e.mov_eax_to_ecx();
                e.load_mem32_disp_from_ecx_to_eax(entry.length_field_offset as i32);
                e.mov_eax_to_ecx();
                e.load_local_to_eax(sc_index);
                e.cmp_eax_ecx();
                let miss = e.emit_jcc(Cc::AboveEq);
                e.load_local_to_eax(sc_index);
                e.mov_eax_to_ecx();
                e.mov_imm_to_eax(entry.element_stride as i32);
                e.imul_eax_ecx();
                e.store_eax_to_local(sc_index);
                e.load_local_to_eax(sc_array);
                e.mov_eax_to_ecx();
                e.load_mem32_disp_from_ecx_to_eax(entry.data_ptr_offset as i32);
                e.mov_eax_to_ecx();
                e.load_local_to_eax(sc_index);
                e.add_eax_ecx();
                e.mov_eax_to_ecx();
                e.load_mem32_from_ecx_to_eax();
                let done = e.emit_jmp();
                let miss_native = e.len();
                e.patch_rel32(miss, miss_native);
                e.store_imm8_to_absolute(deopt_address + deopt_slot, 1);
                e.zero_eax();
                let done_native = e.len();
                e.patch_rel32(done, done_native);
                e.push_eax()?;
            }
            Opcode::SetIndex => {
                let instr_addr = reader.function_address + pc;
                let entry = ic.get_array(instr_addr).ok_or(JitError::MissingIcEntry { instr_addr, atom: 0 })?;
                let sc_index = scratch_disp(local_count, 0);
                let sc_array = scratch_disp(local_count, 1);
                let sc_value = scratch_disp(local_count, 2);
                e.pop_eax();
                e.store_eax_to_local(sc_value);
                e.pop_to_ecx();
                e.mov_ecx_to_eax();
                e.store_eax_to_local(sc_index);
                e.pop_eax();
                e.store_eax_to_local(sc_array);
                e.mov_eax_to_ecx();
                e.load_mem32_disp_from_ecx_to_eax(entry.length_field_offset as i32);
                e.mov_eax_to_ecx();
                e.load_local_to_eax(sc_index);
                e.cmp_eax_ecx();
                let miss = e.emit_jcc(Cc::AboveEq);
                e.load_local_to_eax(sc_index);
                e.mov_eax_to_ecx();
                e.mov_imm_to_eax(entry.element_stride as i32);
                e.imul_eax_ecx();
                e.store_eax_to_local(sc_index);
                e.load_local_to_eax(sc_array);
                e.mov_eax_to_ecx();
                e.load_mem32_disp_from_ecx_to_eax(entry.data_ptr_offset as i32);
                e.mov_eax_to_ecx();
                e.load_local_to_eax(sc_index);
                e.add_eax_ecx();
                e.mov_eax_to_ecx();
                e.load_local_to_eax(sc_value);
                e.store_eax_to_mem32_at_ecx();
                let done = e.emit_jmp();
                let miss_native = e.len();
                e.patch_rel32(miss, miss_native);
                e.store_imm8_to_absolute(deopt_address + deopt_slot, 1);
                let done_native = e.len();
                e.patch_rel32(done, done_native);
            }

            Opcode::TypeOf => {
                if !speculator.all_integer_like() {
                    return Err(JitError::UnsupportedOpcode(byte));
                }
                let push_pc = pc + 1;
                let streq_pc = push_pc + 3;
                let fuses = reader.u8_at(push_pc as usize) == Some(Opcode::PushConst as u8)
                    && reader.u8_at(streq_pc as usize) == Some(Opcode::StrictEq as u8)
                    && !analysis.jump_targets.contains(&push_pc)
                    && !analysis.jump_targets.contains(&streq_pc);
                if fuses {
                    let const_idx = reader
                        .u16_at(push_pc as usize + 1)
                        .ok_or_else(|| JitError::BytecodeInvalid("truncated push_const operand".to_string()))?;
                    let result = match reader.const_at(const_idx as u32)? {
                        ConstValue::Integer(atom_val) => (atom_val == NUMBER_ATOM_ID) as i32,
                        _ => return Err(JitError::UnsupportedConstantTag { index: const_idx as u32 }),
                    };
                    e.mov_imm_to_eax(result);
                    e.push_eax()?;
                    advance = 1 + 3 + 1;
                } else {
                    e.mov_imm_to_eax(1);
                    e.push_eax()?;
                }
            }

            Opcode::Goto8 | Opcode::Goto16 | Opcode::Goto32 => {
                let target = preanalysis::branch_target(reader, pc, op)
                    .ok_or_else(|| JitError::BytecodeInvalid("truncated goto".to_string()))?;
                let at = e.emit_jmp();
                e.defer_fixup(at, target);
                if target < pc {
                    if let Some(&native_header) = e.pc_map().get(&target) {
                        osr.record(target, native_header);
                    }
                }
            }
            Opcode::IfFalse8 | Opcode::IfFalse32 | Opcode::IfTrue8 | Opcode::IfTrue32 => {
                let target = preanalysis::branch_target(reader, pc, op)
                    .ok_or_else(|| JitError::BytecodeInvalid("truncated conditional branch".to_string()))?;
                e.pop_eax();
                e.test_eax_eax();
                let cc = if matches!(op, Opcode::IfFalse8 | Opcode::IfFalse32) { Cc::Eq } else { Cc::Ne };
                let at = e.emit_jcc(cc);
                e.defer_fixup(at, target);
            }

            Opcode::ReturnVal => {
                e.pop_eax();
                e.emit_epilogue(reg_binding.is_some());
            }
            Opcode::ReturnUndef => {
                e.zero_eax();
                e.emit_epilogue(reg_binding.is_some());
            }
            Opcode::Nop | Opcode::Label => {}

            Opcode::Call | Opcode::GetGlobal | Opcode::SetGlobal | Opcode::And | Opcode::Or | Opcode::NewArray => {
                unreachable!("is_jit_supported already rejected this opcode");
            }
        }

        pc += advance;
    }

    e.resolve_fixups()?;
    Ok(CompiledBody { code: e.into_bytes(), osr, deopt_slot })
}
