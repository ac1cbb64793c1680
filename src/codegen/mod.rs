//! Code generation: the integer tier ([`int_tier`]) and the float tier
//! ([`float_tier`]), both built on [`crate::emitter::CodeEmitter`] (spec §4.7,
//! §4.8).

pub mod float_tier;
pub mod int_tier;

use crate::osr::OsrMap;

/// The result of a successful compile: the emitted native bytes, the OSR map
/// (body-relative; the controller rebases it once the bytes are installed in
/// the pool), and the deopt-page slot this function was assigned, if any.
#[derive(Debug, Clone)]
pub struct CompiledBody {
    pub code: Vec<u8>,
    pub osr: OsrMap,
    pub deopt_slot: u32,
}
