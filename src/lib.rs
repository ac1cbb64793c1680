//! Speculative tiered method JIT for a stack-based bytecode VM (i686, cdecl).
//!
//! Observes calls to interpreted functions through [`controller::JitController::hook`],
//! infers argument types by profiling ([`speculator`]), translates hot functions to
//! native i686 machine code ([`codegen`]) once argument types and inline-cache data
//! justify it, and publishes the resulting code pointer back into the interpreter's
//! function descriptor through the [`host::Host`] interface. Compiled functions can
//! deoptimise back to the interpreter when a speculative assumption — an inline-cache
//! shape guard, most commonly — is invalidated at runtime.
//!
//! # Scope
//!
//! This crate is the JIT core only. The interpreter, garbage collector, scheduler,
//! device drivers, filesystem, and any REPL or UI are external collaborators reached
//! through [`host::Host`]; this crate never assumes anything about their internals
//! beyond the contract in that trait.
//!
//! # Supported opcodes
//!
//! See [`opcode::Opcode`] for the full table. The JIT-supported subset (the integer
//! tier) covers literal pushes, local/argument access, stack shuffling, arithmetic,
//! comparisons, inline-cache-backed property/array access, and branches/returns. The
//! float tier (see [`codegen::float_tier`]) covers a narrower subset restricted to
//! functions observed to take at least one `Float64` argument.
//!
//! Any opcode outside the supported set causes the compiler to bail; the function
//! falls back to interpreted dispatch, never to a panic or a host-visible exception.

pub mod bytecode;
pub mod cache;
pub mod codegen;
pub mod controller;
pub mod deopt;
pub mod emitter;
pub mod host;
pub mod ic;
pub mod isolate;
pub mod opcode;
pub mod osr;
pub mod preanalysis;
pub mod regalloc;
pub mod speculator;

use thiserror::Error;

/// Maximum bytecode length the JIT will ever attempt to read or compile.
pub const MAX_BYTECODE_LEN: u32 = 4096;

/// Call count at which the hook first attempts an integer-tier compile.
pub const INT_COMPILE_THRESHOLD: u64 = 10;

/// Multiplier applied to [`INT_COMPILE_THRESHOLD`] before an all-`Any` function
/// is given up on and blacklisted.
pub const ANY_BLACKLIST_MULTIPLIER: u64 = 16;

/// Consecutive deopts after which a function is permanently blacklisted.
pub const MAX_DEOPTS: u32 = 3;

/// Consecutive compile bails after which a function is permanently blacklisted.
pub const MAX_BAILS: u32 = 3;

/// Size of the main code pool, in bytes.
pub const MAIN_POOL_SIZE: u32 = 8 * 1024 * 1024;

/// Size of a per-isolate code pool, in bytes.
pub const ISOLATE_POOL_SIZE: u32 = 512 * 1024;

/// Maximum number of entries retained in the code cache.
pub const CODE_CACHE_MAX_ENTRIES: usize = 256;

/// Maximum total bytes retained in the code cache.
pub const CODE_CACHE_MAX_BYTES: usize = 2 * 1024 * 1024;

/// Size, in bytes, of the shared deopt flag page.
pub const DEOPT_PAGE_SIZE: u32 = 256;

/// Number of eval-stack slots the prologue reserves beyond declared locals.
pub const EVAL_STACK_RESERVED_SLOTS: usize = 8;

/// Native pointer value meaning "still interpreted".
pub const NATIVE_POINTER_INTERPRETED: u32 = 0;

/// Native pointer sentinel meaning "permanently deoptimised".
pub const DEOPT_SENTINEL: u32 = 0x7FFF_DEAD;

/// Errors the JIT can produce. Every one of these is handled locally: the hook
/// always returns `0`/`1` to the interpreter, never an exception (see spec §7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JitError {
    #[error("host memory probe failed at 0x{address:08x} (len {length})")]
    ProbeFailed { address: u32, length: u32 },

    #[error("invalid bytecode: {0}")]
    BytecodeInvalid(String),

    #[error("unsupported opcode 0x{0:02x}")]
    UnsupportedOpcode(u8),

    #[error("forward branch target 0x{bytecode_target:04x} is unresolved")]
    UnresolvedBranch { bytecode_target: u32 },

    #[error("no inline-cache entry for site 0x{instr_addr:08x}, atom {atom}")]
    MissingIcEntry { instr_addr: u32, atom: u32 },

    #[error("code pool exhausted (requested {requested} bytes)")]
    PoolExhausted { requested: u32 },

    #[error("simulated eval-stack depth exceeded the reserved slot count")]
    StackOverflow,

    #[error("invalid constant-pool index {index}")]
    InvalidConstant { index: u32 },

    #[error("constant-pool entry {index} has a tag the JIT cannot push")]
    UnsupportedConstantTag { index: u32 },
}

/// Result type used throughout the crate.
pub type JitResult<T> = Result<T, JitError>;
