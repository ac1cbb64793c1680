//! Float code generator (spec §4.8): a narrower parallel tier used only when
//! the type speculator observed at least one `Float64` argument and every
//! opcode in the function is in [`Opcode::is_float_safe`]'s subset.
//!
//! Representation: every virtual-stack slot is an 8-byte double living on the
//! host stack below `esp` (pushed/popped via explicit `sub esp,8`/`add esp,8`
//! plus an x87 load/store, since [`CodeEmitter`]'s native push/pop only move
//! 4-byte words). Locals live at `ebp-8-8*i`, arguments at `ebp+8+8*i`. One
//! extra scratch qword past the declared locals holds values the x87 stack
//! needs discarded (the loser of a comparison) or a converted boolean.
//!
//! This tier never touches inline caches, so it has no deopt path of its own;
//! a site outside the float-safe opcode set is simply a bail, same as the
//! integer tier bailing on an unsupported opcode.

use crate::bytecode::BytecodeReader;
use crate::codegen::CompiledBody;
use crate::emitter::{CodeEmitter, Cc};
use crate::opcode::Opcode;
use crate::osr::OsrMap;
use crate::preanalysis::{self, PreAnalysis};
use crate::{JitError, JitResult};

fn local_disp(index: u32) -> i32 {
    -8 * (index as i32 + 1)
}

fn arg_disp(index: u32) -> i32 {
    8 + 8 * index as i32
}

/// Translates `reader`'s bytecode, which the caller has already restricted to
/// [`Opcode::is_float_safe`], to i686 code returning its result in x87 `ST(0)`.
pub fn compile(reader: &BytecodeReader, _analysis: &PreAnalysis) -> JitResult<CompiledBody> {
    let mut e = CodeEmitter::new();
    let local_count = reader.local_count as u32;
    let scratch_disp = local_disp(local_count);
    let frame_bytes = 8 * (local_count + 1);

    e.emit_prologue(frame_bytes, false);

    for i in 0..local_count {
        e.fldz();
        e.fstp_qword(false, local_disp(i));
    }

    let len = reader.len() as u32;
    let mut pc = 0u32;

    while pc < len {
        let byte = reader
            .u8_at(pc as usize)
            .ok_or_else(|| JitError::BytecodeInvalid("pc ran past the end of the function".to_string()))?;
        let op = Opcode::try_from_byte(byte).ok_or(JitError::UnsupportedOpcode(byte))?;
        if !op.is_float_safe() {
            return Err(JitError::UnsupportedOpcode(byte));
        }
        e.mark_pc(pc);

        match op {
            Opcode::PushI32 => {
                let v = reader
                    .i32_at(pc as usize + 1)
                    .ok_or_else(|| JitError::BytecodeInvalid("truncated push_i32".to_string()))?;
                e.mov_imm_to_eax(v);
                e.push_eax()?;
                e.fild_dword(true, 0);
                e.pop_eax();
                e.sub_esp_imm(8);
                e.fstp_qword(true, 0);
            }
            Opcode::PushTrue => {
                e.fld1();
                e.sub_esp_imm(8);
                e.fstp_qword(true, 0);
            }
            Opcode::PushFalse | Opcode::PushNull | Opcode::PushUndefined => {
                e.fldz();
                e.sub_esp_imm(8);
                e.fstp_qword(true, 0);
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
                e.fld_qword(false, local_disp(idx));
                e.sub_esp_imm(8);
                e.fstp_qword(true, 0);
            }
            Opcode::PutLoc => {
                let idx = reader
                    .u16_at(pc as usize + 1)
                    .ok_or_else(|| JitError::BytecodeInvalid("truncated put_loc".to_string()))? as u32;
                e.fld_qword(true, 0);
                e.add_esp_imm(8);
                e.fstp_qword(false, local_disp(idx));
            }
            Opcode::SetLoc => {
                let idx = reader
                    .u16_at(pc as usize + 1)
                    .ok_or_else(|| JitError::BytecodeInvalid("truncated set_loc".to_string()))? as u32;
                e.fld_qword(true, 0);
                e.fstp_qword(false, local_disp(idx));
            }
            Opcode::GetArg => {
                let idx = reader
                    .u16_at(pc as usize + 1)
                    .ok_or_else(|| JitError::BytecodeInvalid("truncated get_arg".to_string()))? as u32;
                e.fld_qword(false, arg_disp(idx));
                e.sub_esp_imm(8);
                e.fstp_qword(true, 0);
            }
            Opcode::PutArg => {
                let idx = reader
                    .u16_at(pc as usize + 1)
                    .ok_or_else(|| JitError::BytecodeInvalid("truncated put_arg".to_string()))? as u32;
                e.fld_qword(true, 0);
                e.add_esp_imm(8);
                e.fstp_qword(false, arg_disp(idx));
            }
            Opcode::SetArg => {
                let idx = reader
                    .u16_at(pc as usize + 1)
                    .ok_or_else(|| JitError::BytecodeInvalid("truncated set_arg".to_string()))? as u32;
                e.fld_qword(true, 0);
                e.fstp_qword(false, arg_disp(idx));
            }

            Opcode::IncLoc8 | Opcode::DecLoc8 => {
                let idx = reader
                    .u8_at(pc as usize + 1)
                    .ok_or_else(|| JitError::BytecodeInvalid("truncated inc/dec_loc8".to_string()))? as u32;
                e.fld_qword(false, local_disp(idx));
                e.fld1();
                if op == Opcode::DecLoc8 {
                    e.fchs();
                }
                e.faddp();
                e.fstp_qword(false, local_disp(idx));
            }
            Opcode::IncLoc16 | Opcode::DecLoc16 => {
                let idx = reader
                    .u16_at(pc as usize + 1)
                    .ok_or_else(|| JitError::BytecodeInvalid("truncated inc/dec_loc16".to_string()))? as u32;
                e.fld_qword(false, local_disp(idx));
                e.fld1();
                if op == Opcode::DecLoc16 {
                    e.fchs();
                }
                e.faddp();
                e.fstp_qword(false, local_disp(idx));
            }
            Opcode::AddLoc => {
                let idx = reader
                    .u16_at(pc as usize + 1)
                    .ok_or_else(|| JitError::BytecodeInvalid("truncated add_loc".to_string()))? as u32;
                e.fld_qword(true, 0);
                e.add_esp_imm(8);
                e.fld_qword(false, local_disp(idx));
                e.faddp();
                e.fstp_qword(false, local_disp(idx));
            }
            Opcode::PostInc | Opcode::PostDec => {
                e.fld_qword(true, 0);
                e.sub_esp_imm(8);
                e.fstp_qword(true, 0);
                e.fld_qword(true, 8);
                e.fld1();
                if op == Opcode::PostDec {
                    e.fchs();
                }
                e.faddp();
                e.fstp_qword(true, 8);
            }

            Opcode::Drop => {
                e.add_esp_imm(8);
            }
            Opcode::Dup => {
                e.fld_qword(true, 0);
                e.sub_esp_imm(8);
                e.fstp_qword(true, 0);
            }
            Opcode::Swap => {
                e.fld_qword(true, 0);
                e.fstp_qword(false, scratch_disp);
                e.fld_qword(true, 8);
                e.fstp_qword(true, 0);
                e.fld_qword(false, scratch_disp);
                e.fstp_qword(true, 8);
            }

            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div => {
                e.fld_qword(true, 0);
                e.add_esp_imm(8);
                e.fld_qword(true, 0);
                e.add_esp_imm(8);
                match op {
                    Opcode::Add => e.faddp(),
                    Opcode::Sub => e.fsubrp(),
                    Opcode::Mul => e.fmulp(),
                    _ => e.fdivrp(),
                }
                e.sub_esp_imm(8);
                e.fstp_qword(true, 0);
            }

            Opcode::Eq | Opcode::Ne | Opcode::StrictEq | Opcode::StrictNe | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                e.fld_qword(true, 0);
                e.add_esp_imm(8);
                e.fld_qword(true, 0);
                e.add_esp_imm(8);
                e.fcomip();
                e.fstp_qword(false, scratch_disp);
                let cc = match op {
                    Opcode::Eq | Opcode::StrictEq => Cc::Eq,
                    Opcode::Ne | Opcode::StrictNe => Cc::Ne,
                    Opcode::Lt => Cc::Below,
                    Opcode::Le => Cc::BelowEq,
                    Opcode::Gt => Cc::Above,
                    _ => Cc::AboveEq,
                };
                e.setcc_eax(cc);
                e.push_eax()?;
                e.fild_dword(true, 0);
                e.pop_eax();
                e.sub_esp_imm(8);
                e.fstp_qword(true, 0);
            }

            Opcode::Goto8 | Opcode::Goto16 | Opcode::Goto32 => {
                let target = preanalysis::branch_target(reader, pc, op)
                    .ok_or_else(|| JitError::BytecodeInvalid("truncated goto".to_string()))?;
                let at = e.emit_jmp();
                e.defer_fixup(at, target);
            }
            Opcode::IfFalse8 | Opcode::IfFalse32 | Opcode::IfTrue8 | Opcode::IfTrue32 => {
                let target = preanalysis::branch_target(reader, pc, op)
                    .ok_or_else(|| JitError::BytecodeInvalid("truncated conditional branch".to_string()))?;
                e.fld_qword(true, 0);
                e.add_esp_imm(8);
                e.fldz();
                e.fcomip();
                e.fstp_qword(false, scratch_disp);
                let cc = if matches!(op, Opcode::IfFalse8 | Opcode::IfFalse32) { Cc::Eq } else { Cc::Ne };
                let at = e.emit_jcc(cc);
                e.defer_fixup(at, target);
            }

            Opcode::ReturnVal => {
                e.fld_qword(true, 0);
                e.add_esp_imm(8);
                e.emit_epilogue(false);
            }
            Opcode::ReturnUndef => {
                e.fldz();
                e.emit_epilogue(false);
            }
            Opcode::Nop | Opcode::Label => {}

            _ => return Err(JitError::UnsupportedOpcode(byte)),
        }

        pc += op.info().width;
    }

    e.resolve_fixups()?;
    Ok(CompiledBody { code: e.into_bytes(), osr: OsrMap::new(), deopt_slot: 0 })
}
