//! Fiber stack operations (spec.md §4.4, capability C5 infrastructure).
//!
//! `heap::Fiber` is the plain data declaration; this module supplies the
//! constant-time push/pop/peek operations spec.md requires, plus
//! construction, styled after `raya-core::stack::Stack`'s push/pop/overflow
//! idiom but widened to the three parallel stacks (value, frame, root) a
//! Weft fiber owns instead of one.

use crate::error::{VmError, VmResult};
use crate::heap::{Fiber, GcPtr};
use crate::value::Value;

impl Fiber {
    /// Creates a fresh, non-suspended fiber with the given stack
    /// capacities (spec.md §5's configurable `valueStack`/`frameStack`/
    /// `rootStack` sizes).
    pub fn new(value_capacity: usize, frame_capacity: usize, root_capacity: usize, is_root: bool) -> Self {
        Fiber {
            value_stack: Vec::with_capacity(value_capacity),
            value_capacity,
            frame_stack: Vec::with_capacity(frame_capacity),
            frame_capacity,
            root_stack: Vec::with_capacity(root_capacity),
            root_capacity,
            ip: 0,
            is_root,
            is_suspended: false,
            caller: None,
        }
    }

    /// `pushValue` (spec.md §4.4).
    pub fn push_value(&mut self, value: Value) -> VmResult<()> {
        if self.value_stack.len() >= self.value_capacity {
            return Err(VmError::ValueStackOverflow {
                capacity: self.value_capacity,
            });
        }
        self.value_stack.push(value);
        Ok(())
    }

    /// `popValue` (spec.md §4.4).
    pub fn pop_value(&mut self) -> VmResult<Value> {
        self.value_stack
            .pop()
            .ok_or(VmError::ValueStackUnderflow {
                needed: 1,
                available: 0,
            })
    }

    /// Pops `n` values without returning them, in the order `POP_VAL` would
    /// (used by `DROP_VALS`-equivalent call sites, e.g. `COMPLETE`'s handle
    /// parameter consumption).
    pub fn drop_values(&mut self, n: usize) -> VmResult<()> {
        if self.value_stack.len() < n {
            return Err(VmError::ValueStackUnderflow {
                needed: n,
                available: self.value_stack.len(),
            });
        }
        self.value_stack.truncate(self.value_stack.len() - n);
        Ok(())
    }

    /// Reads the value `offset` slots from the top without popping it
    /// (`offset = 0` is the top element).
    pub fn peek_value(&self, offset: usize) -> VmResult<Value> {
        let len = self.value_stack.len();
        if offset >= len {
            return Err(VmError::ValueStackUnderflow {
                needed: offset + 1,
                available: len,
            });
        }
        Ok(self.value_stack[len - 1 - offset])
    }

    pub fn value_count(&self) -> usize {
        self.value_stack.len()
    }

    /// The bottommost `n` values, in bottom-to-top order. Used by
    /// `REACT`/`ESCAPE`'s continuation-capture path to snapshot the portion
    /// of the stack that sits below the handler's own arguments.
    pub fn values_prefix(&self, n: usize) -> VmResult<Vec<Value>> {
        if n > self.value_stack.len() {
            return Err(VmError::ValueStackUnderflow {
                needed: n,
                available: self.value_stack.len(),
            });
        }
        Ok(self.value_stack[..n].to_vec())
    }

    /// Takes ownership of every value currently on the stack, leaving it
    /// empty, preserving bottom-to-top order.
    pub fn take_values(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.value_stack)
    }

    /// Replaces the value stack wholesale (`CALL_CONTINUATION`'s splice
    /// step). Errors if `values` would exceed this fiber's configured
    /// capacity.
    pub fn set_values(&mut self, values: Vec<Value>) -> VmResult<()> {
        if values.len() > self.value_capacity {
            return Err(VmError::ValueStackOverflow {
                capacity: self.value_capacity,
            });
        }
        self.value_stack = values;
        Ok(())
    }

    /// `pushFrame` (spec.md §4.4).
    pub fn push_frame(&mut self, frame: GcPtr) -> VmResult<()> {
        if self.frame_stack.len() >= self.frame_capacity {
            return Err(VmError::FrameStackOverflow {
                capacity: self.frame_capacity,
            });
        }
        self.frame_stack.push(frame);
        Ok(())
    }

    /// `popFrame` (spec.md §4.4).
    pub fn pop_frame(&mut self) -> VmResult<GcPtr> {
        self.frame_stack
            .pop()
            .ok_or(VmError::FrameStackUnderflow {
                needed: 1,
                available: 0,
            })
    }

    /// Pops and discards `n` frames, returning them in pop order (top
    /// first) — used by `ESCAPE`/`REACT`/`CALL_CONTINUATION` to unwind
    /// multiple frames at once.
    pub fn drop_frames(&mut self, n: usize) -> VmResult<Vec<GcPtr>> {
        if self.frame_stack.len() < n {
            return Err(VmError::FrameStackUnderflow {
                needed: n,
                available: self.frame_stack.len(),
            });
        }
        let mut dropped = Vec::with_capacity(n);
        for _ in 0..n {
            dropped.push(self.frame_stack.pop().unwrap());
        }
        Ok(dropped)
    }

    /// Reads the frame `offset` slots from the top without popping it.
    pub fn peek_frame(&self, offset: usize) -> VmResult<GcPtr> {
        let len = self.frame_stack.len();
        if offset >= len {
            return Err(VmError::FrameStackUnderflow {
                needed: offset + 1,
                available: len,
            });
        }
        Ok(self.frame_stack[len - 1 - offset])
    }

    pub fn frame_count(&self) -> usize {
        self.frame_stack.len()
    }

    /// `pushRoot` (spec.md §4.4): the GC-visible scratchpad a mutator uses
    /// to keep a just-allocated, not-yet-installed object alive across a
    /// subsequent allocation (spec.md §4.2's rooting protocol).
    pub fn push_root(&mut self, obj: GcPtr) -> VmResult<()> {
        if self.root_stack.len() >= self.root_capacity {
            return Err(VmError::RootStackOverflow {
                capacity: self.root_capacity,
            });
        }
        self.root_stack.push(obj);
        Ok(())
    }

    /// `popRoot` (spec.md §4.4).
    pub fn pop_root(&mut self) -> VmResult<GcPtr> {
        self.root_stack.pop().ok_or(VmError::RootStackUnderflow)
    }
}
