//! The `Vm` type: owns the heap, reference table, foreign registry, and
//! installed `CodeBlock`, and exposes the embedding API spec.md §6
//! enumerates (`newVM`/`addConstant`/`writeChunk`/`writeLabel`/
//! `addForeign`/`newFiber`/`interpret`/`collectGarbage`). Grounded on
//! `raya-core/src/vm/context.rs`'s `VmContext` (the type that composes a
//! `GarbageCollector`, globals, limits, and counters behind one embedding
//! handle) but without that type's multi-tenant `VmContextId`/
//! `ContextRegistry` machinery — this spec has exactly one VM per process,
//! never several sharing a registry.

use parking_lot::Mutex;

use weft_bytecode::{CodeBlock as BytecodeBlock, Constant};

use crate::config::VmConfig;
use crate::error::{InterpretResult, VmResult};
use crate::foreign::{ForeignFn, ForeignTable};
use crate::heap::{Fiber, GcPtr, GcStats, Heap, Object, Roots};
use crate::interpreter;
use crate::refs::RefTable;
use crate::value::Value;

/// The embedding handle (spec.md §6's `vm`). Foreign functions receive only
/// a shared `&Vm` (they run interleaved with dispatch, never owning the
/// fiber they're handed), so every field a foreign function might touch is
/// behind interior mutability; fields only the embedder touches during setup
/// (the foreign table) are plain and gated by `&mut self`.
pub struct Vm {
    heap: Heap,
    ref_table: Mutex<RefTable>,
    foreign_table: ForeignTable,
    code_block: GcPtr,
    config: VmConfig,
    /// The fiber GC roots from when none is otherwise in hand (spec.md §6:
    /// `collectGarbage(vm)` takes no fiber argument), updated whenever
    /// [`Vm::new_fiber`] creates a root fiber and while [`Vm::interpret`]
    /// runs one.
    root_fiber: Mutex<Option<GcPtr>>,
}

// Safety: `code_block` is exclusively owned and mutated only through `Vm`'s
// own methods, which take `&mut self` for every call that mutates it before
// `interpret` begins; `ref_table` and `foreign_table` are behind interior
// mutability or are read-only after setup.
unsafe impl Send for Vm {}
unsafe impl Sync for Vm {}

impl Vm {
    /// `newVM(config?)` (spec.md §6). Installs a fresh, empty `CodeBlock`.
    pub fn new(config: VmConfig) -> Self {
        let heap = Heap::new(config.initial_heap_size, config.min_heap_size, config.heap_growth_percent);
        let code_block = heap.alloc(Object::CodeBlock(BytecodeBlock::new()));
        Vm {
            heap,
            ref_table: Mutex::new(RefTable::new()),
            foreign_table: ForeignTable::new(),
            code_block,
            config,
            root_fiber: Mutex::new(None),
        }
    }

    /// The configuration this VM was built with.
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// The heap this VM allocates on, for modules that need to allocate
    /// outside the interpreter's own dispatch loop (e.g. a foreign function
    /// materializing a string).
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    fn code_block_ref(&self) -> &BytecodeBlock {
        // Safety: `code_block` always points at the `Object::CodeBlock` this
        // VM installed in `new` and never frees it directly (it is only
        // reclaimed by a sweep that finds it unreachable, which cannot
        // happen while `self` is alive since `collect`/`interpret` always
        // root it).
        match unsafe { self.code_block.as_ref() } {
            Object::CodeBlock(block) => block,
            other => unreachable!("Vm::code_block must stay a CodeBlock, found {}", other.type_name()),
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn code_block_mut(&self) -> &mut BytecodeBlock {
        // Safety: see `code_block_ref`; construction-time mutation
        // (`add_constant`/`write_chunk`/`write_label`) and read-only
        // interpreter access never overlap since the embedder finishes
        // assembling before calling `interpret`.
        match unsafe { self.code_block.as_mut() } {
            Object::CodeBlock(block) => block,
            other => unreachable!("Vm::code_block must stay a CodeBlock, found {}", other.type_name()),
        }
    }

    /// `addConstant(vm, v)` (spec.md §6). Returns `weft_bytecode`'s own
    /// error directly rather than folding it into `VmError`: a full constant
    /// pool is a construction-time producer mistake, not one of the
    /// dispatch-time precondition violations `VmError` covers.
    pub fn add_constant(&self, value: impl Into<Constant>) -> weft_bytecode::Result<u8> {
        self.code_block_mut().add_constant(value)
    }

    /// `writeChunk(vm, byte, line)` (spec.md §6).
    pub fn write_chunk(&self, byte: u8, line: u32) {
        self.code_block_mut().write_chunk(byte, line);
    }

    /// Appends a multi-byte big-endian operand (spec.md §6's bytecode
    /// format table).
    pub fn write_operand(&self, bytes: &[u8], line: u32) {
        self.code_block_mut().write_operand(bytes, line);
    }

    /// `writeLabel(vm, idx, text)` (spec.md §6).
    pub fn write_label(&self, byte_index: usize, text: impl Into<String>) {
        self.code_block_mut().write_label(byte_index, text);
    }

    /// `addForeign(vm, fn)` (spec.md §6).
    pub fn add_foreign(&mut self, f: ForeignFn) -> u16 {
        self.foreign_table.register(f)
    }

    pub(crate) fn foreign_table(&self) -> &ForeignTable {
        &self.foreign_table
    }

    pub(crate) fn ref_table(&self) -> &Mutex<RefTable> {
        &self.ref_table
    }

    pub(crate) fn code_block(&self) -> GcPtr {
        self.code_block
    }

    /// The raw bytecode bytes the dispatch loop reads from.
    pub(crate) fn code_bytes(&self) -> &[u8] {
        self.code_block_ref().code()
    }

    /// Looks up a constant-pool entry by index (spec.md §6: `CONSTANT <u8>`).
    pub(crate) fn constant(&self, index: u8) -> Option<&Constant> {
        self.code_block_ref().constant(index)
    }

    /// `newFiber(vm, ip, initialStack, count)` (spec.md §6): allocates a
    /// fiber with this VM's configured stack capacities, seeded with
    /// `initial_stack`, starting execution at `ip`.
    pub fn new_fiber(&self, ip: usize, initial_stack: &[Value], is_root: bool) -> VmResult<GcPtr> {
        let mut fiber = Fiber::new(
            self.config.value_stack_capacity,
            self.config.frame_stack_capacity,
            self.config.root_stack_capacity,
            is_root,
        );
        fiber.ip = ip;
        for &value in initial_stack {
            fiber.push_value(value)?;
        }
        let ptr = self.heap.alloc(Object::Fiber(fiber));
        if is_root {
            *self.root_fiber.lock() = Some(ptr);
        }
        Ok(ptr)
    }

    /// `interpret(vm, fiber)` (spec.md §6): runs `fiber` to completion, to a
    /// `ABORT`, or to a precondition violation.
    pub fn interpret(&mut self, fiber: GcPtr) -> InterpretResult {
        *self.root_fiber.lock() = Some(fiber);
        interpreter::run(self, fiber)
    }

    /// `collectGarbage(vm)` (spec.md §6): runs a collection rooted at the
    /// installed CodeBlock and the most recently interpreted/created root
    /// fiber, if any.
    pub fn collect_garbage(&self) -> GcStats {
        let fiber = self.root_fiber.lock();
        match *fiber {
            Some(fiber_ptr) => {
                let mut ref_table = self.ref_table.lock();
                self.heap.collect(
                    Roots {
                        code_block: self.code_block,
                        fiber: fiber_ptr,
                    },
                    &[],
                    &mut ref_table,
                )
            }
            None => GcStats::default(),
        }
    }

    /// Runs a collection with additional temporary roots beyond the
    /// installed CodeBlock and fiber (spec.md §4.2's rooting protocol: a
    /// just-allocated, not-yet-installed object the interpreter is holding
    /// across a further allocation).
    pub(crate) fn collect_garbage_with_roots(&self, fiber: GcPtr, extra_roots: &[GcPtr]) -> GcStats {
        let mut ref_table = self.ref_table.lock();
        self.heap.collect(
            Roots {
                code_block: self.code_block,
                fiber,
            },
            extra_roots,
            &mut ref_table,
        )
    }

    /// Whether the heap has crossed its `nextGC` threshold (consulted by the
    /// interpreter around allocation-heavy opcodes).
    pub(crate) fn should_collect(&self) -> bool {
        self.heap.should_collect()
    }

    /// Allocates a fresh `Ref` cell holding `value` and returns a heap
    /// pointer to the `Object::Ref` handle for it (spec.md §3/§4.9). There is
    /// no dedicated bytecode opcode for this in spec.md §4.8's instruction
    /// list — foreign functions are the only producers of `Ref`s, mirroring
    /// how the embedding contract (§4.5) gives foreign code direct access to
    /// VM-level facilities bytecode itself never addresses.
    pub fn new_ref(&self, value: Value) -> GcPtr {
        let key = self.ref_table.lock().insert(value);
        self.heap.alloc(Object::Ref(crate::heap::WeftRef { key }))
    }

    /// Reads the current value stored under `reference`'s key. Returns
    /// `Err(VmError::UninitializedRef)` if the key is not present (spec.md
    /// §7: "use of uninitialized or freed Ref").
    pub fn ref_get(&self, reference: GcPtr) -> VmResult<Value> {
        let key = self.ref_key(reference)?;
        self.ref_table
            .lock()
            .get(key)
            .ok_or(crate::error::VmError::UninitializedRef(key))
    }

    /// Overwrites the value stored under `reference`'s key (Invariant 8: a
    /// `Ref`'s reads always see the last value written).
    pub fn ref_set(&self, reference: GcPtr, value: Value) -> VmResult<()> {
        let key = self.ref_key(reference)?;
        self.ref_table.lock().set(key, value);
        Ok(())
    }

    fn ref_key(&self, reference: GcPtr) -> VmResult<u64> {
        // Safety: `reference` is held live by whatever caller-side root kept
        // it reachable across the lookup.
        match unsafe { reference.as_ref() } {
            Object::Ref(r) => Ok(r.key),
            other => Err(crate::error::VmError::FrameTypeMismatch {
                expected: "Ref",
                found: other.type_name(),
            }),
        }
    }
}
