//! The closed set of heap object variants from spec.md §3.
//!
//! Every variant here is a plain data struct; the VM-level *behavior*
//! (closure construction, the handler protocol, array/slice bounds checks,
//! ...) lives in `fiber.rs`/`closure.rs`/`handler.rs`/`interpreter.rs` so
//! that this module stays a pure data model, mirroring how the teacher keeps
//! `raya-core::object` free of interpreter control flow.

use weft_bytecode::CodeBlock as BytecodeBlock;

use super::gcptr::GcPtr;
use crate::value::Value;

/// A resumption-limit hint attached to a [`Closure`] (spec.md §4.6). `ESCAPE`
/// consults this to decide whether continuation capture can be skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResumeLimit {
    /// The handler never resumes; `ESCAPE` drops the handle context entirely.
    None,
    /// The handler resumes at most once; `ESCAPE` still captures a
    /// continuation unless it is also `ONCE_TAIL`-eligible.
    Once,
    /// The handler resumes at most once, in tail position; when the handle
    /// frame carries no parameters this degrades to a plain call with no
    /// continuation capture.
    OnceTail,
    /// The handler may resume any number of times (the default).
    #[default]
    Many,
}

/// An immutable, nul-terminated byte string (spec.md §3: "length +
/// immutable byte array (nul-terminated for foreign interop)").
#[derive(Debug)]
pub struct WeftString {
    bytes: Vec<u8>,
}

impl WeftString {
    pub fn new(s: impl AsRef<str>) -> Self {
        let mut bytes = s.as_ref().as_bytes().to_vec();
        bytes.push(0);
        WeftString { bytes }
    }

    /// The string contents, excluding the trailing NUL.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.bytes.len() - 1]).expect("WeftString is valid utf8")
    }

    pub fn len(&self) -> usize {
        self.bytes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The nul-terminated byte representation, for foreign interop.
    pub fn as_bytes_with_nul(&self) -> &[u8] {
        &self.bytes
    }
}

/// A frame holding only local variable slots (spec.md §3: `VarFrame`).
#[derive(Debug, Default)]
pub struct VarFrame {
    pub slots: Vec<Value>,
}

/// A `VarFrame` plus a return instruction pointer (spec.md §3: `CallFrame`).
#[derive(Debug)]
pub struct CallFrame {
    pub vars: VarFrame,
    pub after_location: usize,
}

/// A `CallFrame` plus the installed handler set (spec.md §3: `HandleFrame`).
#[derive(Debug)]
pub struct HandleFrame {
    pub call: CallFrame,
    pub handle_id: u32,
    pub nesting: i32,
    pub after_closure: GcPtr,
    pub handlers: Vec<GcPtr>,
}

/// A lexically-captured function (spec.md §3: `Closure`).
#[derive(Debug)]
pub struct Closure {
    pub func_location: usize,
    pub param_count: u8,
    pub captured: Vec<Value>,
    pub resume_limit: ResumeLimit,
}

/// A reified, potentially multi-shot delimited continuation (spec.md §3:
/// `Continuation`).
#[derive(Debug)]
pub struct Continuation {
    pub resume_location: usize,
    pub param_count: usize,
    pub saved_stack: Vec<Value>,
    /// `saved_frames[0]` is always a `HandleFrame` (Invariant 4).
    pub saved_frames: Vec<GcPtr>,
}

/// A singly-linked cons cell (spec.md §3: `List`). The empty list is
/// represented as `Value::nil()`, not as an `Object` variant, mirroring the
/// original's `OBJ_VAL(NULL)` encoding of `'()'`.
#[derive(Debug)]
pub struct ListCell {
    pub elem: Value,
    pub next: Value,
}

/// A growable value vector (spec.md §3: `Array`).
#[derive(Debug, Default)]
pub struct WeftArray {
    pub values: Vec<Value>,
}

/// A non-owning view into an `Array` (spec.md §3: `Slice`). Invariant 5:
/// `start + length <= source.length` at all times the slice is live.
#[derive(Debug)]
pub struct WeftSlice {
    pub start: usize,
    pub length: usize,
    pub source: GcPtr,
}

/// A growable byte vector (spec.md §3: `ByteArray`).
#[derive(Debug, Default)]
pub struct WeftByteArray {
    pub bytes: Vec<u8>,
}

/// A non-owning view into a `ByteArray` (spec.md §3: `ByteSlice`).
#[derive(Debug)]
pub struct WeftByteSlice {
    pub start: usize,
    pub length: usize,
    pub source: GcPtr,
}

/// A tagged aggregate (spec.md §3: `Struct`).
#[derive(Debug)]
pub struct WeftStruct {
    pub struct_id: u32,
    pub values: Vec<Value>,
}

/// A stable handle into the VM's mutable reference table (spec.md §3: `Ref`,
/// §4.9).
#[derive(Debug, Clone, Copy)]
pub struct WeftRef {
    pub key: u64,
}

/// An opaque byte blob for foreign interop (spec.md §3: `Foreign`).
#[derive(Debug, Default)]
pub struct WeftForeign {
    pub bytes: Vec<u8>,
}

/// An untyped pointer held for foreign-function interop (spec.md §3:
/// `CPointer`). Never traced, never dereferenced by the core itself.
#[derive(Debug, Clone, Copy)]
pub struct CPointer {
    pub addr: usize,
}

/// A `(vm, fiber)` handle passed to foreign callbacks so they can un-suspend
/// a fiber from outside the interpreter (spec.md §3: `ForeignResume`, §4.5).
#[derive(Debug, Clone, Copy)]
pub struct ForeignResume {
    pub vm: *mut crate::vm::Vm,
    pub fiber: GcPtr,
}

/// The fiber's three stacks plus its instruction pointer and flags (spec.md
/// §3/§4.4: `Fiber`). Tracing/stack-manipulation methods live on
/// [`crate::fiber`] via inherent `impl` blocks kept separate from this data
/// declaration.
#[derive(Debug)]
pub struct Fiber {
    pub value_stack: Vec<Value>,
    pub value_capacity: usize,
    pub frame_stack: Vec<GcPtr>,
    pub frame_capacity: usize,
    pub root_stack: Vec<GcPtr>,
    pub root_capacity: usize,
    pub ip: usize,
    pub is_root: bool,
    pub is_suspended: bool,
    pub caller: Option<GcPtr>,
}

/// A boxed numeric the uniform `Value` encoding cannot cover directly
/// (spec.md §3: `I64`, `U64`, `Double`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoxedNumber {
    I64(i64),
    U64(u64),
    Double(f64),
}

/// The closed set of heap object variants (spec.md §3).
#[derive(Debug)]
pub enum Object {
    String(WeftString),
    CodeBlock(BytecodeBlock),
    VarFrame(VarFrame),
    CallFrame(CallFrame),
    HandleFrame(HandleFrame),
    Closure(Closure),
    Continuation(Continuation),
    Fiber(Fiber),
    List(ListCell),
    Array(WeftArray),
    Slice(WeftSlice),
    ByteArray(WeftByteArray),
    ByteSlice(WeftByteSlice),
    Struct(WeftStruct),
    Ref(WeftRef),
    Foreign(WeftForeign),
    CPointer(CPointer),
    ForeignResume(ForeignResume),
    Number(BoxedNumber),
}

impl Object {
    /// A short type name, used in diagnostics and `VmError` messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Object::String(_) => "String",
            Object::CodeBlock(_) => "CodeBlock",
            Object::VarFrame(_) => "VarFrame",
            Object::CallFrame(_) => "CallFrame",
            Object::HandleFrame(_) => "HandleFrame",
            Object::Closure(_) => "Closure",
            Object::Continuation(_) => "Continuation",
            Object::Fiber(_) => "Fiber",
            Object::List(_) => "List",
            Object::Array(_) => "Array",
            Object::Slice(_) => "Slice",
            Object::ByteArray(_) => "ByteArray",
            Object::ByteSlice(_) => "ByteSlice",
            Object::Struct(_) => "Struct",
            Object::Ref(_) => "Ref",
            Object::Foreign(_) => "Foreign",
            Object::CPointer(_) => "CPointer",
            Object::ForeignResume(_) => "ForeignResume",
            Object::Number(_) => "Number",
        }
    }

    /// The variable slots of a `VarFrame`/`CallFrame`/`HandleFrame`, the
    /// common view `FIND <frame> <slot>` needs regardless of which of the
    /// three frame-stack variants it lands on (spec.md §4.6's `FIND`
    /// primitive reads through all of them uniformly, mirroring the
    /// original's `ObjVarFrame` base-struct inheritance).
    pub fn as_var_slots(&self) -> Option<&[Value]> {
        match self {
            Object::VarFrame(v) => Some(&v.slots),
            Object::CallFrame(c) => Some(&c.vars.slots),
            Object::HandleFrame(h) => Some(&h.call.vars.slots),
            _ => None,
        }
    }

    /// A rough byte-size estimate used for GC accounting (spec.md §4.2:
    /// "account its bytes" during blackening).
    pub fn approx_size(&self) -> usize {
        let base = std::mem::size_of::<Object>();
        base + match self {
            Object::String(s) => s.as_bytes_with_nul().len(),
            Object::CodeBlock(c) => c.len() + c.constants().len() * std::mem::size_of::<Value>(),
            Object::VarFrame(v) => v.slots.len() * std::mem::size_of::<Value>(),
            Object::CallFrame(c) => c.vars.slots.len() * std::mem::size_of::<Value>(),
            Object::HandleFrame(h) => {
                h.call.vars.slots.len() * std::mem::size_of::<Value>()
                    + h.handlers.len() * std::mem::size_of::<GcPtr>()
            }
            Object::Closure(c) => c.captured.len() * std::mem::size_of::<Value>(),
            Object::Continuation(c) => {
                c.saved_stack.len() * std::mem::size_of::<Value>()
                    + c.saved_frames.len() * std::mem::size_of::<GcPtr>()
            }
            Object::Fiber(f) => {
                f.value_stack.capacity() * std::mem::size_of::<Value>()
                    + f.frame_stack.capacity() * std::mem::size_of::<GcPtr>()
                    + f.root_stack.capacity() * std::mem::size_of::<GcPtr>()
            }
            Object::List(_) => 0,
            Object::Array(a) => a.values.len() * std::mem::size_of::<Value>(),
            Object::Slice(_) => 0,
            Object::ByteArray(b) => b.bytes.len(),
            Object::ByteSlice(_) => 0,
            Object::Struct(s) => s.values.len() * std::mem::size_of::<Value>(),
            Object::Ref(_) => 0,
            Object::Foreign(f) => f.bytes.len(),
            Object::CPointer(_) => 0,
            Object::ForeignResume(_) => 0,
            Object::Number(_) => 0,
        }
    }
}
