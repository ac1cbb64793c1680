//! Pre-analysis: a single linear walk over a function's bytecode computing
//! jump targets, loop headers, dead ranges, per-local access counts, and
//! eliminable `typeof` sites (spec §4.3).

use std::collections::HashSet;

use crate::bytecode::BytecodeReader;
use crate::opcode::Opcode;

/// The computed result of one pre-analysis pass, recomputed fresh for every
/// compile attempt (function bytecode is immutable once published, but the
/// type speculator and IC state that feed later stages are not, so nothing
/// here is cached across attempts).
#[derive(Debug, Default, Clone)]
pub struct PreAnalysis {
    pub jump_targets: HashSet<u32>,
    pub loop_headers: HashSet<u32>,
    pub dead_ranges: Vec<(u32, u32)>,
    /// Flat per-variable reference counts: the first `arg_count` entries are
    /// arguments, the remaining `local_count` entries are declared locals.
    pub local_access_counts: Vec<u32>,
    pub typeof_eliminable: HashSet<u32>,
}

/// Computes the absolute bytecode target of a branch opcode at `pc`. Shared
/// with [`crate::codegen::int_tier`], which needs the identical arithmetic to
/// emit the same fixup target pre-analysis already classified as a jump target.
pub(crate) fn branch_target(reader: &BytecodeReader, pc: u32, op: Opcode) -> Option<u32> {
    let offset_at = pc as usize;
    match op {
        Opcode::Goto8 | Opcode::IfFalse8 | Opcode::IfTrue8 => {
            let rel = reader.i8_at(offset_at + 1)? as i32;
            Some((pc as i32 + op.info().width as i32 + rel) as u32)
        }
        Opcode::Goto16 => {
            let rel = reader.i16_at(offset_at + 1)? as i32;
            Some((pc as i32 + op.info().width as i32 + rel) as u32)
        }
        Opcode::Goto32 | Opcode::IfFalse32 | Opcode::IfTrue32 => {
            let rel = reader.i32_at(offset_at + 1)?;
            Some((pc as i32 + op.info().width as i32 + rel) as u32)
        }
        _ => None,
    }
}

/// A reference to a declared argument or a declared local, in the opcode's
/// own index space — the two are kept distinct here and combined only when
/// writing into a single flat `local_access_counts` vector (args first, then
/// locals), since bytecode indices for `get_arg 0` and `get_loc 0` name
/// different storage.
enum VarRef {
    Arg(u32),
    Local(u32),
}

fn var_ref(reader: &BytecodeReader, pc: u32, op: Opcode) -> Option<VarRef> {
    let offset_at = pc as usize;
    match op {
        Opcode::GetLoc | Opcode::PutLoc | Opcode::SetLoc => reader.u16_at(offset_at + 1).map(|v| VarRef::Local(v as u32)),
        Opcode::GetArg | Opcode::PutArg | Opcode::SetArg => reader.u16_at(offset_at + 1).map(|v| VarRef::Arg(v as u32)),
        Opcode::GetLoc0 => Some(VarRef::Local(0)),
        Opcode::GetLoc1 => Some(VarRef::Local(1)),
        Opcode::GetLoc2 => Some(VarRef::Local(2)),
        Opcode::GetLoc3 => Some(VarRef::Local(3)),
        Opcode::IncLoc8 | Opcode::DecLoc8 => reader.u8_at(offset_at + 1).map(|v| VarRef::Local(v as u32)),
        Opcode::IncLoc16 | Opcode::DecLoc16 | Opcode::AddLoc => {
            reader.u16_at(offset_at + 1).map(|v| VarRef::Local(v as u32))
        }
        _ => None,
    }
}

/// Walks `reader`'s bytecode once using [`Opcode::info`] as the sole width
/// authority (spec §8 invariant 1), then a short second pass to compute dead
/// ranges from the already-known jump-target set.
pub fn analyze(reader: &BytecodeReader) -> PreAnalysis {
    let mut result = PreAnalysis {
        local_access_counts: vec![0; reader.local_count as usize + reader.arg_count as usize],
        ..Default::default()
    };

    let len = reader.len() as u32;
    let mut pc = 0u32;
    let mut unconditional_transfer_at: Vec<u32> = Vec::new();

    while pc < len {
        let Some(byte) = reader.u8_at(pc as usize) else { break };
        let Some(op) = Opcode::try_from_byte(byte) else {
            // An opcode outside the known table is not walked further by
            // pre-analysis; the code generator is the one that bails on it.
            break;
        };

        if let Some(target) = branch_target(reader, pc, op) {
            result.jump_targets.insert(target);
            if target < pc {
                result.loop_headers.insert(target);
            }
        }

        if let Some(var) = var_ref(reader, pc, op) {
            let flat_index = match var {
                VarRef::Arg(i) => i,
                VarRef::Local(i) => reader.arg_count as u32 + i,
            };
            if let Some(slot) = result.local_access_counts.get_mut(flat_index as usize) {
                *slot += 1;
            }
        }

        if op == Opcode::TypeOf {
            result.typeof_eliminable.insert(pc);
        }

        if matches!(op, Opcode::Goto8 | Opcode::Goto16 | Opcode::Goto32 | Opcode::ReturnVal | Opcode::ReturnUndef) {
            unconditional_transfer_at.push(pc + op.info().width);
        }

        pc += op.info().width;
    }

    for start in unconditional_transfer_at {
        if start >= len {
            continue;
        }
        let mut next_target = len;
        let mut sorted: Vec<u32> = result.jump_targets.iter().copied().filter(|&t| t > start).collect();
        sorted.sort_unstable();
        if let Some(&t) = sorted.first() {
            next_target = t;
        }
        if next_target > start {
            result.dead_ranges.push((start, next_target));
        }
    }

    result
}
