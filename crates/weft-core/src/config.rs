//! VM configuration (spec.md §6's `newVM(config?)` record). Grounded on
//! `raya-core/src/vm/context.rs`'s `VmOptions`/`ResourceLimits`: a plain,
//! `Default`-driven struct with documented numeric defaults rather than a
//! builder-with-validation type, since every field here is independently
//! valid at any value.

/// Diagnostic sink invoked by the interpreter on user-visible error paths
/// (spec.md §6: `errorFn`). Defaults to a no-op; embedders that want
/// diagnostics surfaced (logging, a REPL's error channel, ...) install their
/// own.
pub type ErrorFn = fn(&str);

fn default_error_fn(_message: &str) {}

/// Configuration for [`crate::vm::Vm::new`] (spec.md §6's `newVM` config
/// record). Every field has a default matching the documented values;
/// embedders construct via `VmConfig { value_stack_capacity: 256,
/// ..Default::default() }`-style partial overrides, mirroring how
/// `raya-core::VmOptions` is consumed.
///
/// `reallocateFn` (spec.md §6) has no counterpart here: a custom allocator
/// hook only matters when the host controls raw memory directly, which this
/// crate does not expose — allocation goes through `Heap`'s `Box`-backed
/// `GcBox` nodes, not a pluggable realloc.
#[derive(Clone)]
pub struct VmConfig {
    /// Capacity of a fiber's value stack (spec.md §6, default 128).
    pub value_stack_capacity: usize,
    /// Capacity of a fiber's frame stack (spec.md §6, default 512).
    pub frame_stack_capacity: usize,
    /// Capacity of a fiber's root stack (spec.md §6, default 16).
    pub root_stack_capacity: usize,
    /// Byte threshold that triggers the first collection (spec.md §6,
    /// default 10 MiB).
    pub initial_heap_size: usize,
    /// Floor `nextGC` never drops below, however much a collection frees
    /// (spec.md §6, default 1 MiB).
    pub min_heap_size: usize,
    /// Percentage headroom added above live bytes when recomputing `nextGC`
    /// after a collection (spec.md §6, default 50).
    pub heap_growth_percent: u32,
    /// Diagnostic sink (spec.md §6: `errorFn`).
    pub error_fn: ErrorFn,
    /// Opaque embedder data threaded through unmodified (spec.md §6:
    /// `userData`). Not used by the core itself; foreign functions recover
    /// it through the `Vm` they are called with.
    pub user_data: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            value_stack_capacity: 128,
            frame_stack_capacity: 512,
            root_stack_capacity: 16,
            initial_heap_size: 10 * 1024 * 1024,
            min_heap_size: 1024 * 1024,
            heap_growth_percent: 50,
            error_fn: default_error_fn,
            user_data: 0,
        }
    }
}
