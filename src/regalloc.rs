//! Register allocator: a trivial pass binding at most one hot local to a
//! reserved callee-saved host register (spec §4.4).

use crate::bytecode::BytecodeReader;
use crate::preanalysis::PreAnalysis;

/// Minimum reference count a local needs before it is worth binding to a
/// register; below this the save/restore overhead isn't worth it.
pub const MIN_REFERENCES_FOR_BINDING: u32 = 4;

/// The single register binding this pass may produce. On i686 this is the
/// `ebx` register — the one general-purpose callee-saved register cdecl
/// leaves free for a function to use across calls without its own save.
/// `var_index` is in the variable's own space (an argument index if
/// `is_argument`, otherwise a declared-local index).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterBinding {
    pub var_index: u32,
    pub is_argument: bool,
}

/// Picks the most-referenced local or argument, if it clears
/// [`MIN_REFERENCES_FOR_BINDING`]. Only one binding is ever produced (spec:
/// "the allocator records only this single binding"). `analysis.local_access_counts`
/// is flat with arguments first, then locals (see [`crate::preanalysis`]).
pub fn allocate(reader: &BytecodeReader, analysis: &PreAnalysis) -> Option<RegisterBinding> {
    let (flat_index, &count) = analysis
        .local_access_counts
        .iter()
        .enumerate()
        .max_by_key(|(_, &count)| count)?;

    if count < MIN_REFERENCES_FOR_BINDING {
        return None;
    }

    let arg_count = reader.arg_count as u32;
    let is_argument = (flat_index as u32) < arg_count;
    let var_index = if is_argument { flat_index as u32 } else { flat_index as u32 - arg_count };

    Some(RegisterBinding { var_index, is_argument })
}
