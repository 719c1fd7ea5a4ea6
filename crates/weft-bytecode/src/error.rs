use thiserror::Error;

/// Errors that can arise while assembling a [`crate::CodeBlock`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodeBlockError {
    /// A `CodeBlock`'s constant pool is addressed by a single byte (Invariant 7
    /// in the data model: at most 256 constants per block).
    #[error("constant pool full: cannot hold more than 256 constants")]
    ConstantPoolFull,
}

/// Convenience alias for fallible `weft-bytecode` operations.
pub type Result<T> = std::result::Result<T, CodeBlockError>;
