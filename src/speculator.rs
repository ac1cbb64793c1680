//! Type speculator: accumulates observed argument types across interpreted
//! calls so the controller can decide which tier (if any) to compile for
//! (spec §3 "Type speculator", §4.5).

/// Four-state type lattice for one observed argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArgType {
    #[default]
    Unknown,
    Int32,
    Bool,
    Float64,
    Any,
}

impl ArgType {
    /// Monotonic lattice join: `Unknown ⊔ X = X`; `X ⊔ X = X`;
    /// `X ⊔ Y` (distinct concrete types) `= Any`. Once `Any`, a type never
    /// returns to anything more specific (spec §8 invariant 8).
    pub fn join(self, observed: ArgType) -> ArgType {
        match (self, observed) {
            (ArgType::Unknown, x) => x,
            (x, ArgType::Unknown) => x,
            (a, b) if a == b => a,
            _ => ArgType::Any,
        }
    }
}

/// Native-ABI argument tag byte values the host reader classifies by. These
/// mirror the constant-pool tags (spec §3) but apply to runtime argument
/// slots rather than compile-time constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedTag {
    Int32,
    Bool,
    Float64,
    Other,
}

/// Per-function argument-type profile, one entry per declared argument.
#[derive(Debug, Clone, Default)]
pub struct TypeSpeculator {
    states: Vec<ArgType>,
    samples: u64,
}

impl TypeSpeculator {
    pub fn new(arg_count: usize) -> Self {
        TypeSpeculator { states: vec![ArgType::Unknown; arg_count], samples: 0 }
    }

    /// Classifies each observed argument tag and joins it into that
    /// argument's running state; increments the sample count once per call.
    pub fn observe(&mut self, tags: &[ObservedTag]) {
        for (slot, tag) in self.states.iter_mut().zip(tags.iter()) {
            let observed = match tag {
                ObservedTag::Int32 => ArgType::Int32,
                ObservedTag::Bool => ArgType::Bool,
                ObservedTag::Float64 => ArgType::Float64,
                ObservedTag::Other => ArgType::Any,
            };
            *slot = slot.join(observed);
        }
        self.samples += 1;
    }

    pub fn arg_type(&self, index: usize) -> ArgType {
        self.states.get(index).copied().unwrap_or(ArgType::Unknown)
    }

    pub fn all_integer_like(&self) -> bool {
        self.states.iter().all(|s| matches!(s, ArgType::Int32 | ArgType::Bool | ArgType::Unknown))
    }

    pub fn has_float64(&self) -> bool {
        self.states.contains(&ArgType::Float64)
    }

    pub fn call_count(&self) -> u64 {
        self.samples
    }
}
