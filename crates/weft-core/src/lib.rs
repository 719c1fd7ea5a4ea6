//! Value representation, object heap, garbage collector, fiber model, and
//! interpreter dispatch loop for the Weft VM (spec.md §§2-4).
//!
//! This crate accepts an already-built [`weft_bytecode::CodeBlock`] (the
//! bytecode *producer* — an assembler or compiler — is out of scope, per
//! spec.md §1) and provides everything the embedding contract in spec.md §6
//! enumerates: [`Vm::new`], [`Vm::add_constant`]/[`Vm::write_chunk`]/
//! [`Vm::write_label`], [`Vm::add_foreign`], [`Vm::new_fiber`],
//! [`Vm::interpret`], and [`Vm::collect_garbage`].

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod closure;
mod config;
mod error;
mod fiber;
mod foreign;
mod handler;
mod heap;
mod interpreter;
mod refs;
mod value;
mod vm;

pub use config::{ErrorFn, VmConfig};
pub use error::{InterpretResult, VmError, VmResult};
pub use foreign::ForeignFn;
pub use heap::{
    BoxedNumber, CPointer, CallFrame, Closure, Continuation, Fiber, ForeignResume, GcPtr, GcStats,
    HandleFrame, ListCell, Object, ResumeLimit, VarFrame, WeftArray, WeftByteArray, WeftByteSlice,
    WeftForeign, WeftRef, WeftSlice, WeftString, WeftStruct,
};
pub use value::Value;
pub use vm::Vm;
