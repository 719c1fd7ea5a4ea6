//! The fetch-decode-execute dispatch loop (spec.md §4.8, capability C9),
//! grounded directly on `original_source/src/vm_interpreter.c`'s
//! `runInterpreter` threaded-dispatch loop (operand-read order, `ip`
//! bookkeeping, and the exact pop order of each opcode's stack effect all
//! follow that C switch statement; the handler-protocol opcodes themselves
//! are implemented in `handler.rs`/`closure.rs`, this module only decodes
//! their operands and calls through).
//!
//! Garbage collection is checked once per dispatched instruction, before any
//! of that instruction's own allocations begin (`Heap::should_collect`) —
//! every allocation an opcode's body performs therefore runs between two
//! collection points, never across one, so none of the handler/closure
//! helpers need to thread extra GC roots through individual `Heap::alloc`
//! calls (spec.md §4.2's rooting protocol collapses to "nothing extra to
//! root" at this granularity).

use weft_bytecode::{Constant, Opcode};

use crate::closure::{build_closure, build_mutual_closures, build_recursive_closure, call_closure_frame, find, set_resume_limit};
use crate::error::{InterpretResult, VmError, VmResult};
use crate::handler;
use crate::heap::{
    Fiber, GcPtr, Heap, ListCell, Object, ResumeLimit, WeftArray, WeftByteArray, WeftByteSlice, WeftSlice,
    WeftString,
};
use crate::value::Value;
use crate::vm::Vm;

/// What the dispatch loop should do after one instruction.
enum Step {
    Continue,
    Halted(u8),
    Done,
}

/// Runs `fiber` until it completes, aborts, suspends, or hits a fatal error
/// (spec.md §6's `interpret(vm, fiber)`).
pub fn run(vm: &Vm, fiber_ptr: GcPtr) -> InterpretResult {
    loop {
        match dispatch_one(vm, fiber_ptr) {
            Ok(Step::Continue) => {}
            Ok(Step::Halted(code)) => return InterpretResult::Halted(code),
            Ok(Step::Done) => return InterpretResult::Success,
            Err(e) => return InterpretResult::RuntimeError(e),
        }
    }
}

/// A read-only cursor over the installed `CodeBlock`'s bytes, reading
/// big-endian multi-byte operands (spec.md §6's bytecode format).
struct Cursor<'a> {
    code: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn u8(&mut self) -> VmResult<u8> {
        let byte = self.code.get(self.pos).copied().ok_or(VmError::IndexOutOfRange {
            index: self.pos,
            len: self.code.len(),
        })?;
        self.pos += 1;
        Ok(byte)
    }

    fn u16(&mut self) -> VmResult<u16> {
        let hi = self.u8()?;
        let lo = self.u8()?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    fn u32(&mut self) -> VmResult<u32> {
        let b0 = self.u8()?;
        let b1 = self.u8()?;
        let b2 = self.u8()?;
        let b3 = self.u8()?;
        Ok(u32::from_be_bytes([b0, b1, b2, b3]))
    }

    fn i16(&mut self) -> VmResult<i16> {
        Ok(self.u16()? as i16)
    }
}

fn pop_number(fiber: &mut Fiber) -> VmResult<f64> {
    let v = fiber.pop_value()?;
    if !v.is_number() {
        return Err(VmError::TypeMismatch {
            expected: "number",
            found: v.type_name(),
        });
    }
    Ok(v.as_number())
}

fn pop_bool(fiber: &mut Fiber) -> VmResult<bool> {
    let v = fiber.pop_value()?;
    if !v.is_bool() {
        return Err(VmError::TypeMismatch {
            expected: "bool",
            found: v.type_name(),
        });
    }
    Ok(v.as_bool())
}

/// Pops a value expected to hold a non-negative integral index (array/slice
/// lengths, offsets, indices — spec.md §4.8 has no dedicated integer value
/// kind, so these ride on the same double-backed `Value::number`).
fn pop_index(fiber: &mut Fiber) -> VmResult<usize> {
    let n = pop_number(fiber)?;
    if n < 0.0 || n.fract() != 0.0 {
        return Err(VmError::TypeMismatch {
            expected: "non-negative integer",
            found: "number",
        });
    }
    Ok(n as usize)
}

fn pop_byte(fiber: &mut Fiber) -> VmResult<u8> {
    let n = pop_number(fiber)?;
    if !(0.0..=255.0).contains(&n) || n.fract() != 0.0 {
        return Err(VmError::TypeMismatch {
            expected: "byte (0..=255)",
            found: "number",
        });
    }
    Ok(n as u8)
}

fn pop_string_ptr(fiber: &mut Fiber) -> VmResult<GcPtr> {
    let ptr = fiber.pop_value()?.as_obj();
    // Safety: the value just popped is reachable for the duration of this
    // check (it is still rooted by whatever the caller's caller roots it
    // through, per this module's single-collection-point-per-opcode
    // discipline).
    match unsafe { ptr.as_ref() } {
        Object::String(_) => Ok(ptr),
        other => Err(VmError::TypeMismatch {
            expected: "String",
            found: other.type_name(),
        }),
    }
}

/// `LIST_APPEND`: copies `a`'s cells onto a fresh chain terminating in `b`
/// (spec.md §4.8: "copies the prefix because the suffix may be shared").
fn list_append(heap: &Heap, a: Value, b: Value) -> VmResult<Value> {
    let mut elems = Vec::new();
    let mut cursor = a;
    while !cursor.is_nil() {
        let ptr = cursor.as_obj();
        // Safety: every cell visited here is reachable through `a`, which
        // the caller holds live for the duration of this call.
        match unsafe { ptr.as_ref() } {
            Object::List(cell) => {
                elems.push(cell.elem);
                cursor = cell.next;
            }
            other => {
                return Err(VmError::TypeMismatch {
                    expected: "List",
                    found: other.type_name(),
                })
            }
        }
    }
    let mut result = b;
    for elem in elems.into_iter().rev() {
        let ptr = heap.alloc(Object::List(ListCell { elem, next: result }));
        result = Value::object(ptr);
    }
    Ok(result)
}

fn dispatch_one(vm: &Vm, fiber_ptr: GcPtr) -> VmResult<Step> {
    if vm.should_collect() {
        vm.collect_garbage_with_roots(fiber_ptr, &[]);
    }

    // Safety: `fiber_ptr` is the fiber `Vm::interpret` was handed and is
    // rooted for the duration of this call (it is one of `collect`'s two
    // mandatory roots, see `collect_garbage_with_roots` above).
    let fiber = match unsafe { fiber_ptr.as_mut() } {
        Object::Fiber(f) => f,
        other => {
            return Err(VmError::FrameTypeMismatch {
                expected: "Fiber",
                found: other.type_name(),
            })
        }
    };

    if fiber.is_suspended {
        return Ok(Step::Done);
    }

    let code = vm.code_bytes();
    if fiber.ip >= code.len() {
        return Ok(Step::Done);
    }

    let mut cur = Cursor { code, pos: fiber.ip };
    let opcode_byte = cur.u8()?;
    let opcode = Opcode::from_u8(opcode_byte).ok_or(VmError::InvalidOpcode(opcode_byte, fiber.ip))?;
    let heap = vm.heap();
    let mut halted = None;

    match opcode {
        Opcode::Nop => {
            fiber.ip = cur.pos;
        }
        Opcode::Abort => {
            let code_val = cur.u8()?;
            fiber.ip = cur.pos;
            halted = Some(code_val);
        }
        Opcode::Offset => {
            let delta = cur.i16()?;
            fiber.ip = (cur.pos as i64 + delta as i64) as usize;
        }
        Opcode::Call => {
            let target = cur.u32()?;
            let frame = heap.alloc(Object::CallFrame(crate::heap::CallFrame {
                vars: crate::heap::VarFrame { slots: Vec::new() },
                after_location: cur.pos,
            }));
            fiber.push_frame(frame)?;
            fiber.ip = target as usize;
        }
        Opcode::TailCall => {
            let target = cur.u32()?;
            fiber.ip = target as usize;
        }
        Opcode::Return => {
            let frame_ptr = fiber.pop_frame()?;
            // Safety: the popped frame was live on the fiber's own frame
            // stack.
            let after = match unsafe { frame_ptr.as_ref() } {
                Object::CallFrame(c) => c.after_location,
                other => {
                    return Err(VmError::FrameTypeMismatch {
                        expected: "CallFrame",
                        found: other.type_name(),
                    })
                }
            };
            fiber.ip = after;
        }
        Opcode::Constant => {
            let index = cur.u8()?;
            let constant = vm
                .constant(index)
                .ok_or(VmError::IndexOutOfRange {
                    index: index as usize,
                    len: 256,
                })?
                .clone();
            let value = match constant {
                Constant::Double(d) => Value::number(d),
                Constant::Bool(b) => Value::bool(b),
                Constant::Null => Value::nil(),
                Constant::Str(s) => Value::object(heap.alloc(Object::String(WeftString::new(s)))),
            };
            fiber.push_value(value)?;
            fiber.ip = cur.pos;
        }
        Opcode::True => {
            fiber.push_value(Value::bool(true))?;
            fiber.ip = cur.pos;
        }
        Opcode::False => {
            fiber.push_value(Value::bool(false))?;
            fiber.ip = cur.pos;
        }
        Opcode::Not => {
            let b = pop_bool(fiber)?;
            fiber.push_value(Value::bool(!b))?;
            fiber.ip = cur.pos;
        }
        Opcode::Zap => {
            fiber.pop_value()?;
            fiber.ip = cur.pos;
        }
        Opcode::Swap => {
            let top = fiber.pop_value()?;
            let below = fiber.pop_value()?;
            fiber.push_value(top)?;
            fiber.push_value(below)?;
            fiber.ip = cur.pos;
        }
        Opcode::Store => {
            let n = cur.u8()? as usize;
            let mut slots = Vec::with_capacity(n);
            for i in 0..n {
                slots.push(fiber.peek_value(i)?);
            }
            fiber.drop_values(n)?;
            let frame = heap.alloc(Object::VarFrame(crate::heap::VarFrame { slots }));
            fiber.push_frame(frame)?;
            fiber.ip = cur.pos;
        }
        Opcode::Find => {
            let frame_idx = cur.u16()?;
            let slot_idx = cur.u16()?;
            let value = find(fiber, frame_idx, slot_idx)?;
            fiber.push_value(value)?;
            fiber.ip = cur.pos;
        }
        Opcode::Forget => {
            fiber.pop_frame()?;
            fiber.ip = cur.pos;
        }
        Opcode::Negate => {
            let a = pop_number(fiber)?;
            fiber.push_value(Value::number(-a))?;
            fiber.ip = cur.pos;
        }
        Opcode::Add => {
            let b = pop_number(fiber)?;
            let a = pop_number(fiber)?;
            fiber.push_value(Value::number(a + b))?;
            fiber.ip = cur.pos;
        }
        Opcode::Subtract => {
            let b = pop_number(fiber)?;
            let a = pop_number(fiber)?;
            fiber.push_value(Value::number(a - b))?;
            fiber.ip = cur.pos;
        }
        Opcode::Multiply => {
            let b = pop_number(fiber)?;
            let a = pop_number(fiber)?;
            fiber.push_value(Value::number(a * b))?;
            fiber.ip = cur.pos;
        }
        Opcode::Divide => {
            let b = pop_number(fiber)?;
            let a = pop_number(fiber)?;
            fiber.push_value(Value::number(a / b))?;
            fiber.ip = cur.pos;
        }
        Opcode::Equal => {
            let b = pop_number(fiber)?;
            let a = pop_number(fiber)?;
            fiber.push_value(Value::bool(a == b))?;
            fiber.ip = cur.pos;
        }
        Opcode::Greater => {
            let b = pop_number(fiber)?;
            let a = pop_number(fiber)?;
            fiber.push_value(Value::bool(a > b))?;
            fiber.ip = cur.pos;
        }
        Opcode::Less => {
            let b = pop_number(fiber)?;
            let a = pop_number(fiber)?;
            fiber.push_value(Value::bool(a < b))?;
            fiber.ip = cur.pos;
        }
        Opcode::BoolAnd => {
            let b = pop_bool(fiber)?;
            let a = pop_bool(fiber)?;
            fiber.push_value(Value::bool(a && b))?;
            fiber.ip = cur.pos;
        }
        Opcode::BoolOr => {
            let b = pop_bool(fiber)?;
            let a = pop_bool(fiber)?;
            fiber.push_value(Value::bool(a || b))?;
            fiber.ip = cur.pos;
        }
        Opcode::BoolEq => {
            let b = pop_bool(fiber)?;
            let a = pop_bool(fiber)?;
            fiber.push_value(Value::bool(a == b))?;
            fiber.ip = cur.pos;
        }
        Opcode::BoolNeq => {
            let b = pop_bool(fiber)?;
            let a = pop_bool(fiber)?;
            fiber.push_value(Value::bool(a != b))?;
            fiber.ip = cur.pos;
        }
        Opcode::Concat => {
            let b_ptr = pop_string_ptr(fiber)?;
            let a_ptr = pop_string_ptr(fiber)?;
            // Safety: both were just type-checked above and remain
            // reachable (popped but not yet collected, per this module's
            // single-collection-point-per-opcode discipline).
            let joined = match (unsafe { a_ptr.as_ref() }, unsafe { b_ptr.as_ref() }) {
                (Object::String(a), Object::String(b)) => format!("{}{}", a.as_str(), b.as_str()),
                _ => unreachable!("pop_string_ptr already validated both operands"),
            };
            let ptr = heap.alloc(Object::String(WeftString::new(joined)));
            fiber.push_value(Value::object(ptr))?;
            fiber.ip = cur.pos;
        }
        Opcode::Closure => {
            let body = cur.u32()? as usize;
            let param_count = cur.u8()?;
            let captured_count = cur.u16()?;
            let mut captures = Vec::with_capacity(captured_count as usize);
            for _ in 0..captured_count {
                let frame = cur.u16()?;
                let slot = cur.u16()?;
                captures.push((frame, slot));
            }
            let ptr = build_closure(heap, fiber, body, param_count, &captures)?;
            fiber.push_value(Value::object(ptr))?;
            fiber.ip = cur.pos;
        }
        Opcode::Recursive => {
            let body = cur.u32()? as usize;
            let param_count = cur.u8()?;
            let captured_count = cur.u16()?;
            let mut captures = Vec::with_capacity(captured_count as usize);
            for _ in 0..captured_count {
                let frame = cur.u16()?;
                let slot = cur.u16()?;
                captures.push((frame, slot));
            }
            let ptr = build_recursive_closure(heap, fiber, body, param_count, &captures)?;
            fiber.push_value(Value::object(ptr))?;
            fiber.ip = cur.pos;
        }
        Opcode::Mutual => {
            let n = cur.u8()? as usize;
            let mut top_first = Vec::with_capacity(n);
            for _ in 0..n {
                top_first.push(fiber.pop_value()?.as_obj());
            }
            top_first.reverse();
            let rebuilt = build_mutual_closures(heap, &top_first)?;
            for ptr in rebuilt {
                fiber.push_value(Value::object(ptr))?;
            }
            fiber.ip = cur.pos;
        }
        Opcode::ClosureOnce => {
            let ptr = fiber.peek_value(0)?.as_obj();
            set_resume_limit(ptr, ResumeLimit::Once)?;
            fiber.ip = cur.pos;
        }
        Opcode::ClosureOnceTail => {
            let ptr = fiber.peek_value(0)?.as_obj();
            set_resume_limit(ptr, ResumeLimit::OnceTail)?;
            fiber.ip = cur.pos;
        }
        Opcode::ClosureMany => {
            let ptr = fiber.peek_value(0)?.as_obj();
            set_resume_limit(ptr, ResumeLimit::Many)?;
            fiber.ip = cur.pos;
        }
        Opcode::CallClosure => {
            let closure_ptr = fiber.pop_value()?.as_obj();
            let entry = closure_func_location(closure_ptr)?;
            let frame = call_closure_frame(heap, fiber, closure_ptr, None, None, cur.pos)?;
            fiber.push_frame(frame)?;
            fiber.ip = entry;
        }
        Opcode::TailCallClosure => {
            let closure_ptr = fiber.pop_value()?.as_obj();
            let entry = closure_func_location(closure_ptr)?;
            let old_frame_ptr = fiber.peek_frame(0)?;
            // Safety: the top frame is reachable for the duration of this
            // read.
            let old_after = match unsafe { old_frame_ptr.as_ref() } {
                Object::CallFrame(c) => c.after_location,
                Object::HandleFrame(h) => h.call.after_location,
                other => {
                    return Err(VmError::FrameTypeMismatch {
                        expected: "CallFrame",
                        found: other.type_name(),
                    })
                }
            };
            let frame = call_closure_frame(heap, fiber, closure_ptr, None, None, old_after)?;
            fiber.drop_frames(1)?;
            fiber.push_frame(frame)?;
            fiber.ip = entry;
        }
        Opcode::Handle => {
            let after_delta = cur.i16()?;
            let handle_id = cur.u32()?;
            let param_count = cur.u8()?;
            let handler_count = cur.u8()?;
            let after_location = (cur.pos as i64 + after_delta as i64) as usize;
            handler::handle(heap, fiber, handle_id, param_count, handler_count, after_location)?;
            fiber.ip = cur.pos;
        }
        Opcode::Inject => {
            let handle_id = cur.u32()?;
            handler::inject(fiber, handle_id)?;
            fiber.ip = cur.pos;
        }
        Opcode::Eject => {
            let handle_id = cur.u32()?;
            handler::eject(fiber, handle_id)?;
            fiber.ip = cur.pos;
        }
        Opcode::Escape => {
            let handle_id = cur.u32()?;
            let handler_idx = cur.u8()?;
            fiber.ip = handler::escape(heap, fiber, cur.pos, handle_id, handler_idx)?;
        }
        Opcode::React => {
            let handle_id = cur.u32()?;
            let handler_idx = cur.u8()?;
            fiber.ip = handler::react(heap, fiber, cur.pos, handle_id, handler_idx)?;
        }
        Opcode::Complete => {
            fiber.ip = handler::complete(heap, fiber)?;
        }
        Opcode::CallContinuation => {
            fiber.ip = handler::call_continuation(heap, fiber, cur.pos)?;
        }
        Opcode::TailCallContinuation => {
            fiber.ip = handler::tailcall_continuation(heap, fiber, cur.pos)?;
        }
        Opcode::ListNil => {
            fiber.push_value(Value::nil())?;
            fiber.ip = cur.pos;
        }
        Opcode::ListCons => {
            let tail = fiber.pop_value()?;
            let elem = fiber.pop_value()?;
            let ptr = heap.alloc(Object::List(ListCell { elem, next: tail }));
            fiber.push_value(Value::object(ptr))?;
            fiber.ip = cur.pos;
        }
        Opcode::ListHead => {
            let list = fiber.pop_value()?;
            if list.is_nil() {
                return Err(VmError::TypeMismatch {
                    expected: "non-empty List",
                    found: "nil",
                });
            }
            // Safety: `list` was just checked non-nil and was live on the
            // fiber's own value stack.
            match unsafe { list.as_obj().as_ref() } {
                Object::List(cell) => {
                    let elem = cell.elem;
                    fiber.push_value(elem)?;
                }
                other => {
                    return Err(VmError::TypeMismatch {
                        expected: "List",
                        found: other.type_name(),
                    })
                }
            }
            fiber.ip = cur.pos;
        }
        Opcode::ListTail => {
            let list = fiber.pop_value()?;
            if list.is_nil() {
                return Err(VmError::TypeMismatch {
                    expected: "non-empty List",
                    found: "nil",
                });
            }
            match unsafe { list.as_obj().as_ref() } {
                Object::List(cell) => {
                    let next = cell.next;
                    fiber.push_value(next)?;
                }
                other => {
                    return Err(VmError::TypeMismatch {
                        expected: "List",
                        found: other.type_name(),
                    })
                }
            }
            fiber.ip = cur.pos;
        }
        Opcode::ListIsEmpty => {
            let list = fiber.pop_value()?;
            fiber.push_value(Value::bool(list.is_nil()))?;
            fiber.ip = cur.pos;
        }
        Opcode::ListAppend => {
            let b = fiber.pop_value()?;
            let a = fiber.pop_value()?;
            let result = list_append(heap, a, b)?;
            fiber.push_value(result)?;
            fiber.ip = cur.pos;
        }
        Opcode::ArrayFill => {
            let length = pop_index(fiber)?;
            let fill = fiber.pop_value()?;
            let ptr = heap.alloc(Object::Array(WeftArray {
                values: vec![fill; length],
            }));
            fiber.push_value(Value::object(ptr))?;
            fiber.ip = cur.pos;
        }
        Opcode::ArraySnoc => {
            let value = fiber.pop_value()?;
            let array_ptr = fiber.pop_value()?.as_obj();
            // Safety: `array_ptr` was just popped off the live value stack.
            match unsafe { array_ptr.as_mut() } {
                Object::Array(a) => a.values.push(value),
                other => {
                    return Err(VmError::TypeMismatch {
                        expected: "Array",
                        found: other.type_name(),
                    })
                }
            }
            fiber.push_value(value)?;
            fiber.ip = cur.pos;
        }
        Opcode::ArrayGet => {
            let index = pop_index(fiber)?;
            let array_ptr = fiber.pop_value()?.as_obj();
            let value = match unsafe { array_ptr.as_ref() } {
                Object::Array(a) => a.values.get(index).copied().ok_or(VmError::BoundsViolation {
                    index,
                    length: a.values.len(),
                })?,
                other => {
                    return Err(VmError::TypeMismatch {
                        expected: "Array",
                        found: other.type_name(),
                    })
                }
            };
            fiber.push_value(value)?;
            fiber.ip = cur.pos;
        }
        Opcode::ArraySet => {
            let value = fiber.pop_value()?;
            let index = pop_index(fiber)?;
            let array_ptr = fiber.pop_value()?.as_obj();
            match unsafe { array_ptr.as_mut() } {
                Object::Array(a) => {
                    let len = a.values.len();
                    let slot = a.values.get_mut(index).ok_or(VmError::BoundsViolation { index, length: len })?;
                    *slot = value;
                }
                other => {
                    return Err(VmError::TypeMismatch {
                        expected: "Array",
                        found: other.type_name(),
                    })
                }
            }
            fiber.ip = cur.pos;
        }
        Opcode::ArrayLength => {
            let array_ptr = fiber.pop_value()?.as_obj();
            let len = match unsafe { array_ptr.as_ref() } {
                Object::Array(a) => a.values.len(),
                other => {
                    return Err(VmError::TypeMismatch {
                        expected: "Array",
                        found: other.type_name(),
                    })
                }
            };
            fiber.push_value(Value::number(len as f64))?;
            fiber.ip = cur.pos;
        }
        Opcode::ArrayCopy => {
            let array_ptr = fiber.pop_value()?.as_obj();
            let values = match unsafe { array_ptr.as_ref() } {
                Object::Array(a) => a.values.clone(),
                other => {
                    return Err(VmError::TypeMismatch {
                        expected: "Array",
                        found: other.type_name(),
                    })
                }
            };
            let ptr = heap.alloc(Object::Array(WeftArray { values }));
            fiber.push_value(Value::object(ptr))?;
            fiber.ip = cur.pos;
        }
        Opcode::SliceNew => {
            let length = pop_index(fiber)?;
            let start = pop_index(fiber)?;
            let array_ptr = fiber.pop_value()?.as_obj();
            let source_len = match unsafe { array_ptr.as_ref() } {
                Object::Array(a) => a.values.len(),
                other => {
                    return Err(VmError::TypeMismatch {
                        expected: "Array",
                        found: other.type_name(),
                    })
                }
            };
            if start + length > source_len {
                return Err(VmError::BoundsViolation {
                    index: start + length,
                    length: source_len,
                });
            }
            let ptr = heap.alloc(Object::Slice(WeftSlice {
                start,
                length,
                source: array_ptr,
            }));
            fiber.push_value(Value::object(ptr))?;
            fiber.ip = cur.pos;
        }
        Opcode::ByteArrayFill => {
            let length = pop_index(fiber)?;
            let fill = pop_byte(fiber)?;
            let ptr = heap.alloc(Object::ByteArray(WeftByteArray {
                bytes: vec![fill; length],
            }));
            fiber.push_value(Value::object(ptr))?;
            fiber.ip = cur.pos;
        }
        Opcode::ByteArraySnoc => {
            let value = pop_byte(fiber)?;
            let array_ptr = fiber.pop_value()?.as_obj();
            match unsafe { array_ptr.as_mut() } {
                Object::ByteArray(b) => b.bytes.push(value),
                other => {
                    return Err(VmError::TypeMismatch {
                        expected: "ByteArray",
                        found: other.type_name(),
                    })
                }
            }
            fiber.push_value(Value::number(value as f64))?;
            fiber.ip = cur.pos;
        }
        Opcode::ByteArrayGet => {
            let index = pop_index(fiber)?;
            let array_ptr = fiber.pop_value()?.as_obj();
            let byte = match unsafe { array_ptr.as_ref() } {
                Object::ByteArray(b) => *b.bytes.get(index).ok_or(VmError::BoundsViolation {
                    index,
                    length: b.bytes.len(),
                })?,
                other => {
                    return Err(VmError::TypeMismatch {
                        expected: "ByteArray",
                        found: other.type_name(),
                    })
                }
            };
            fiber.push_value(Value::number(byte as f64))?;
            fiber.ip = cur.pos;
        }
        Opcode::ByteArraySet => {
            let value = pop_byte(fiber)?;
            let index = pop_index(fiber)?;
            let array_ptr = fiber.pop_value()?.as_obj();
            match unsafe { array_ptr.as_mut() } {
                Object::ByteArray(b) => {
                    let len = b.bytes.len();
                    let slot = b.bytes.get_mut(index).ok_or(VmError::BoundsViolation { index, length: len })?;
                    *slot = value;
                }
                other => {
                    return Err(VmError::TypeMismatch {
                        expected: "ByteArray",
                        found: other.type_name(),
                    })
                }
            }
            fiber.ip = cur.pos;
        }
        Opcode::ByteArrayLength => {
            let array_ptr = fiber.pop_value()?.as_obj();
            let len = match unsafe { array_ptr.as_ref() } {
                Object::ByteArray(b) => b.bytes.len(),
                other => {
                    return Err(VmError::TypeMismatch {
                        expected: "ByteArray",
                        found: other.type_name(),
                    })
                }
            };
            fiber.push_value(Value::number(len as f64))?;
            fiber.ip = cur.pos;
        }
        Opcode::ByteSliceNew => {
            let length = pop_index(fiber)?;
            let start = pop_index(fiber)?;
            let array_ptr = fiber.pop_value()?.as_obj();
            let source_len = match unsafe { array_ptr.as_ref() } {
                Object::ByteArray(b) => b.bytes.len(),
                other => {
                    return Err(VmError::TypeMismatch {
                        expected: "ByteArray",
                        found: other.type_name(),
                    })
                }
            };
            if start + length > source_len {
                return Err(VmError::BoundsViolation {
                    index: start + length,
                    length: source_len,
                });
            }
            let ptr = heap.alloc(Object::ByteSlice(WeftByteSlice {
                start,
                length,
                source: array_ptr,
            }));
            fiber.push_value(Value::object(ptr))?;
            fiber.ip = cur.pos;
        }
        Opcode::CallForeign => {
            let index = cur.u16()?;
            fiber.ip = cur.pos;
            let f = vm
                .foreign_table()
                .get(index)
                .ok_or(VmError::UnknownForeignFunction(index))?;
            f(vm, fiber_ptr);
            return Ok(Step::Continue);
        }
    }

    match halted {
        Some(code_val) => Ok(Step::Halted(code_val)),
        None => Ok(Step::Continue),
    }
}

fn closure_func_location(closure: GcPtr) -> VmResult<usize> {
    // Safety: `closure` was just popped off a live value stack by the
    // caller.
    match unsafe { closure.as_ref() } {
        Object::Closure(c) => Ok(c.func_location),
        other => Err(VmError::FrameTypeMismatch {
            expected: "Closure",
            found: other.type_name(),
        }),
    }
}
