//! VM-level errors. Grounded on `raya-core/src/lib.rs`'s `VmError`
//! (`thiserror::Error` enum of stack/opcode/type faults), extended to cover
//! the full precondition-violation list spec.md §7 names.
//!
//! `ABORT <code>` and foreign-function-level failures are deliberately
//! *not* represented here: §7 says user aborts surface as a halt code and
//! foreign errors are ordinary data values, never VM-level errors. See
//! [`InterpretResult`].

use thiserror::Error;

/// A fatal precondition violation (spec.md §7): "bug in the bytecode or the
/// interpreter... these are fatal: the interpreter aborts with a
/// diagnostic." This crate renders that as a library-boundary `Result::Err`
/// rather than a process abort, since a library must never exit the host
/// process on a caller's behalf.
#[derive(Debug, Error)]
pub enum VmError {
    /// The value stack had fewer elements than an operation required.
    #[error("value stack underflow: needed {needed}, had {available}")]
    ValueStackUnderflow { needed: usize, available: usize },

    /// The value stack has no room left for its configured capacity.
    #[error("value stack overflow: capacity {capacity}")]
    ValueStackOverflow { capacity: usize },

    /// The frame stack had fewer elements than an operation required.
    #[error("frame stack underflow: needed {needed}, had {available}")]
    FrameStackUnderflow { needed: usize, available: usize },

    /// The frame stack has no room left for its configured capacity.
    #[error("frame stack overflow: capacity {capacity}")]
    FrameStackOverflow { capacity: usize },

    /// The root stack has no room left for its configured capacity.
    #[error("root stack overflow: capacity {capacity}")]
    RootStackOverflow { capacity: usize },

    /// The root stack had fewer elements than a pop required.
    #[error("root stack underflow")]
    RootStackUnderflow,

    /// The frame at the top of the frame stack was not the variant an
    /// opcode required (e.g. `COMPLETE` found a plain `CallFrame` instead
    /// of a `HandleFrame`).
    #[error("frame type mismatch: expected {expected}, found {found}")]
    FrameTypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// A `FIND (frame, slot)` pair named a slot outside the frame's bounds.
    #[error("slot index {index} out of range (frame has {len} slots)")]
    SlotOutOfRange { index: usize, len: usize },

    /// `EJECT id` was executed with no corresponding outstanding `INJECT id`.
    #[error("EJECT {0} with no matching INJECT")]
    EjectUnderflow(u32),

    /// `findFreeHandler` walked the whole frame stack without finding an
    /// unnested `HandleFrame` matching the requested id.
    #[error("no free handler for handle id {0}")]
    NoFreeHandler(u32),

    /// A `Ref` was read or written before it had ever been stored in the
    /// reference table, or after it had been removed.
    #[error("use of uninitialized or freed Ref (key {0})")]
    UninitializedRef(u64),

    /// The opcode byte at the instruction pointer did not decode to any
    /// known [`weft_bytecode::Opcode`].
    #[error("invalid opcode byte {0:#04x} at offset {1}")]
    InvalidOpcode(u8, usize),

    /// A binary/unary operator was applied to operand(s) of the wrong type.
    #[error("type error: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// A constant-pool, foreign-table, or struct-field index fell outside
    /// its table's bounds.
    #[error("index {index} out of range (table has {len} entries)")]
    IndexOutOfRange { index: usize, len: usize },

    /// `CALL_FOREIGN` named an index with no registered function.
    #[error("no foreign function registered at index {0}")]
    UnknownForeignFunction(u16),

    /// An array/byte-array/slice bounds check failed (Invariant 5).
    #[error("bounds violation: index {index}, length {length}")]
    BoundsViolation { index: usize, length: usize },
}

/// Shorthand for a fallible VM operation.
pub type VmResult<T> = Result<T, VmError>;

/// The outcome of running a fiber to completion or to a halt (spec.md §6).
///
/// `ABORT <code>` is a user-level halt, not an error: it is modeled as
/// `Halted`, distinct from `RuntimeError`'s fatal precondition violations.
#[derive(Debug)]
pub enum InterpretResult {
    /// Execution ran past the top-level frame with no `ABORT`.
    Success,
    /// `ABORT <code>` executed; the code is carried through unchanged.
    Halted(u8),
    /// A precondition violation aborted execution.
    RuntimeError(VmError),
}

impl InterpretResult {
    /// Whether this result represents a clean stop (`Success` or `Halted`).
    pub fn is_ok(&self) -> bool {
        !matches!(self, InterpretResult::RuntimeError(_))
    }
}
