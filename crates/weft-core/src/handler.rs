//! The algebraic-effects handler protocol (spec.md §4.7, part of capability
//! C9): `HANDLE` / `INJECT` / `EJECT` / `COMPLETE` / `ESCAPE` / `REACT` /
//! `CALL_CONTINUATION` / `TAILCALL_CONTINUATION`.
//!
//! Grounded directly on `original_source/src/vm_interpreter.c`'s
//! `CASE_CODE(HANDLE/INJECT/EJECT/COMPLETE/ESCAPE/REACT/CALL_CONTINUATION/
//! TAILCALL_CONTINUATION)` and its `findFreeHandler` helper — spec.md §4.7
//! narrates the algorithm in prose, but operand-popping order, the exact
//! saved-stack boundary, and the frame-splice order on resume are pinned
//! down by the original C, which is treated as the ground truth for those
//! details (see DESIGN.md Open Question decisions).

use crate::closure::call_closure_frame;
use crate::error::{VmError, VmResult};
use crate::heap::{CallFrame, Continuation, Fiber, GcPtr, HandleFrame, Heap, Object, ResumeLimit, VarFrame};
use crate::value::Value;

/// `HANDLE afterOffset, id, p, h` (spec.md §4.7). Pops, top-down: `h`
/// handler closures, one after-closure, then `p` handle parameters, and
/// pushes the resulting `HandleFrame`. `after_location` is the *absolute*
/// byte index the frame resumes at on `COMPLETE` (`ip + afterOffset`,
/// computed by the caller since only the interpreter knows the current
/// `ip`).
pub fn handle(
    heap: &Heap,
    fiber: &mut Fiber,
    handle_id: u32,
    param_count: u8,
    handler_count: u8,
    after_location: usize,
) -> VmResult<()> {
    let needed = handler_count as usize + param_count as usize + 1;
    if fiber.value_count() < needed {
        return Err(VmError::ValueStackUnderflow {
            needed,
            available: fiber.value_count(),
        });
    }
    let mut handlers = Vec::with_capacity(handler_count as usize);
    for _ in 0..handler_count {
        handlers.push(fiber.pop_value()?.as_obj());
    }
    let after_closure = fiber.pop_value()?.as_obj();
    let mut slots = Vec::with_capacity(param_count as usize);
    for _ in 0..param_count {
        slots.push(fiber.pop_value()?);
    }
    let frame = heap.alloc(Object::HandleFrame(HandleFrame {
        call: CallFrame {
            vars: VarFrame { slots },
            after_location,
        },
        handle_id,
        nesting: 0,
        after_closure,
        handlers,
    }));
    fiber.push_frame(frame)
}

/// `INJECT id` (spec.md §4.7): increments the nesting of the nearest
/// `HandleFrame` with matching `id`, stopping at the first 0→1 transition
/// (a frame already nested continues to be visible to a later `INJECT`).
pub fn inject(fiber: &Fiber, handle_id: u32) -> VmResult<()> {
    for depth in 0..fiber.frame_count() {
        let ptr = fiber.peek_frame(depth)?;
        // Safety: every frame on the frame stack is reachable for the
        // duration of this call.
        let obj = unsafe { ptr.as_mut() };
        if let Object::HandleFrame(h) = obj {
            if h.handle_id == handle_id {
                h.nesting += 1;
                if h.nesting == 1 {
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

/// `EJECT id` (spec.md §4.7): decrements the nesting of the nearest
/// matching `HandleFrame`. Underflow past 0 is a precondition violation
/// (Invariant 3).
pub fn eject(fiber: &Fiber, handle_id: u32) -> VmResult<()> {
    for depth in 0..fiber.frame_count() {
        let ptr = fiber.peek_frame(depth)?;
        // Safety: every frame on the frame stack is reachable for the
        // duration of this call.
        let obj = unsafe { ptr.as_mut() };
        if let Object::HandleFrame(h) = obj {
            if h.handle_id == handle_id {
                if h.nesting <= 0 {
                    return Err(VmError::EjectUnderflow(handle_id));
                }
                h.nesting -= 1;
                return Ok(());
            }
        }
    }
    Ok(())
}

/// `findFreeHandler(id)` (spec.md §4.7): the depth (0 = top) of the nearest
/// `HandleFrame` with matching `id` and `nesting == 0`. A program that
/// raises an operation with no free handler is ill-formed; §7 treats that
/// as fatal.
pub fn find_free_handler(fiber: &Fiber, handle_id: u32) -> VmResult<usize> {
    for depth in 0..fiber.frame_count() {
        let ptr = fiber.peek_frame(depth)?;
        // Safety: every frame on the frame stack is reachable for the
        // duration of this call.
        let obj = unsafe { ptr.as_ref() };
        if let Object::HandleFrame(h) = obj {
            if h.handle_id == handle_id && h.nesting == 0 {
                return Ok(depth);
            }
        }
    }
    Err(VmError::NoFreeHandler(handle_id))
}

/// Snapshot of the fields `COMPLETE`/`ESCAPE`/`REACT` need out of a
/// `HandleFrame`, cloned up front so the rest of each opcode body is free to
/// mutate the fiber's frame stack without juggling a borrow into the heap.
struct HandleFrameView {
    after_closure: GcPtr,
    after_location: usize,
    handle_id: u32,
    handlers: Vec<GcPtr>,
    vars: Vec<Value>,
}

fn read_handle_frame(ptr: GcPtr) -> VmResult<HandleFrameView> {
    // Safety: `ptr` is a frame the caller just peeked off a live fiber.
    match unsafe { ptr.as_ref() } {
        Object::HandleFrame(h) => Ok(HandleFrameView {
            after_closure: h.after_closure,
            after_location: h.call.after_location,
            handle_id: h.handle_id,
            handlers: h.handlers.clone(),
            vars: h.call.vars.slots.clone(),
        }),
        other => Err(VmError::FrameTypeMismatch {
            expected: "HandleFrame",
            found: other.type_name(),
        }),
    }
}

fn closure_entry(closure: GcPtr) -> VmResult<usize> {
    // Safety: `closure` was just read off a live frame above.
    match unsafe { closure.as_ref() } {
        Object::Closure(c) => Ok(c.func_location),
        other => Err(VmError::FrameTypeMismatch {
            expected: "Closure",
            found: other.type_name(),
        }),
    }
}

/// `COMPLETE` (spec.md §4.7): runs the handle frame's after-closure on
/// normal completion of its body. Replaces the top frame (which must be a
/// `HandleFrame`) with a call frame for the after-closure. Returns the new
/// instruction pointer.
pub fn complete(heap: &Heap, fiber: &mut Fiber) -> VmResult<usize> {
    let frame_ptr = fiber.peek_frame(0)?;
    let view = read_handle_frame(frame_ptr)?;
    let new_frame = call_closure_frame(
        heap,
        fiber,
        view.after_closure,
        Some(&view.vars),
        None,
        view.after_location,
    )?;
    fiber.pop_frame()?;
    fiber.push_frame(new_frame)?;
    closure_entry(view.after_closure)
}

/// The three-way resumption-limit branch `ESCAPE id, h` implements (spec.md
/// §4.7 point 3 / §4.6's resumption-limit table). Shared by [`escape`]
/// (which honors the handler's hint) and [`react`] (which always takes the
/// capturing branch regardless of the hint, per `original_source`'s
/// unconditionally-capturing `REACT`).
fn raise(
    heap: &Heap,
    fiber: &mut Fiber,
    ip: usize,
    handle_id: u32,
    handler_idx: u8,
    force_capture: bool,
) -> VmResult<usize> {
    let depth = find_free_handler(fiber, handle_id)?;
    let frame_ptr = fiber.peek_frame(depth)?;
    let view = read_handle_frame(frame_ptr)?;
    let handler_idx_usize = handler_idx as usize;
    if handler_idx_usize >= view.handlers.len() {
        return Err(VmError::IndexOutOfRange {
            index: handler_idx_usize,
            len: view.handlers.len(),
        });
    }
    let handler = view.handlers[handler_idx_usize];

    let (resume_limit, handler_param_count) = match unsafe { handler.as_ref() } {
        Object::Closure(c) => (c.resume_limit, c.param_count as usize),
        other => {
            return Err(VmError::FrameTypeMismatch {
                expected: "Closure",
                found: other.type_name(),
            })
        }
    };

    // `NONE`: the handler never resumes, so the whole handle context
    // (including its value-stack contents) is discarded.
    if !force_capture && resume_limit == ResumeLimit::None {
        fiber.take_values();
        let new_frame = call_closure_frame(heap, fiber, handler, Some(&view.vars), None, view.after_location)?;
        fiber.drop_frames(depth + 1)?;
        fiber.push_frame(new_frame)?;
        return closure_entry(handler);
    }

    // `ONCE_TAIL` with no handle parameters: degrades to a plain in-place
    // call, capturing nothing and dropping nothing (spec.md §4.6).
    if !force_capture && resume_limit == ResumeLimit::OnceTail && view.vars.is_empty() {
        let new_frame = call_closure_frame(heap, fiber, handler, Some(&view.vars), None, view.after_location)?;
        fiber.push_frame(new_frame)?;
        return closure_entry(handler);
    }

    // Otherwise: capture a multi-shot continuation over the handle frame and
    // everything above it.
    let total = fiber.value_count();
    if total < handler_param_count {
        return Err(VmError::ValueStackUnderflow {
            needed: handler_param_count,
            available: total,
        });
    }
    let saved_stack_count = total - handler_param_count;
    let saved_stack = fiber.values_prefix(saved_stack_count)?;
    let frame_count = depth + 1;
    let dropped = fiber.drop_frames(frame_count)?;
    // `drop_frames` returns pop order (top-first); `saved_frames[0]` must be
    // the deepest frame, the HandleFrame itself (Invariant 4).
    let saved_frames: Vec<GcPtr> = dropped.into_iter().rev().collect();

    let cont = heap.alloc(Object::Continuation(Continuation {
        resume_location: ip,
        param_count: view.vars.len(),
        saved_stack,
        saved_frames,
    }));
    fiber.push_root(cont)?;
    let new_frame = call_closure_frame(heap, fiber, handler, Some(&view.vars), Some(cont), view.after_location);
    fiber.pop_root()?;
    let new_frame = new_frame?;

    fiber.take_values();
    fiber.push_frame(new_frame)?;
    closure_entry(handler)
}

/// `ESCAPE id, h` (spec.md §4.7): raises operation `h`, honoring the
/// handler's resumption-limit hint to decide whether a continuation needs
/// capturing at all (§4.6).
pub fn escape(heap: &Heap, fiber: &mut Fiber, ip: usize, handle_id: u32, handler_idx: u8) -> VmResult<usize> {
    raise(heap, fiber, ip, handle_id, handler_idx, false)
}

/// `REACT id, h`: like `ESCAPE`, but always captures a continuation
/// regardless of the handler's resumption-limit hint. Grounded on
/// `original_source`'s `CASE_CODE(REACT)`, which never consults a
/// resumption-limit field at all (see DESIGN.md Open Question decisions).
pub fn react(heap: &Heap, fiber: &mut Fiber, ip: usize, handle_id: u32, handler_idx: u8) -> VmResult<usize> {
    raise(heap, fiber, ip, handle_id, handler_idx, true)
}

/// Shared resumption logic for `CALL_CONTINUATION`/`TAILCALL_CONTINUATION`
/// (spec.md §4.7). `current_after_location` is `Some(after)` for the
/// tail-call variant (the popped call frame's own `afterLocation`, reused
/// for the rebuilt `HandleFrame`) or `None` for the non-tail variant (the
/// rebuilt frame's `afterLocation` is the current `ip`).
fn resume(heap: &Heap, fiber: &mut Fiber, ip: usize, current_after_location: Option<usize>) -> VmResult<usize> {
    let cont_ptr = fiber.pop_value()?.as_obj();
    fiber.push_root(cont_ptr)?;

    let resumed = (|| -> VmResult<usize> {
        let (resume_location, param_count, saved_stack, saved_frames) = match unsafe { cont_ptr.as_ref() } {
            Object::Continuation(c) => (
                c.resume_location,
                c.param_count,
                c.saved_stack.clone(),
                c.saved_frames.clone(),
            ),
            other => {
                return Err(VmError::FrameTypeMismatch {
                    expected: "Continuation",
                    found: other.type_name(),
                })
            }
        };

        let mark_ptr = saved_frames[0];
        let view = read_handle_frame(mark_ptr)?;

        let new_after_location = current_after_location.unwrap_or(ip);

        if fiber.value_count() <= param_count {
            return Err(VmError::ValueStackUnderflow {
                needed: param_count + 1,
                available: fiber.value_count(),
            });
        }
        let mut slots = Vec::with_capacity(param_count);
        for _ in 0..param_count {
            slots.push(fiber.pop_value()?);
        }

        let remaining = fiber.take_values();
        let mut spliced = Vec::with_capacity(saved_stack.len() + remaining.len());
        spliced.extend(saved_stack);
        spliced.extend(remaining);
        fiber.set_values(spliced)?;

        let updated = heap.alloc(Object::HandleFrame(HandleFrame {
            call: CallFrame {
                vars: VarFrame { slots },
                after_location: new_after_location,
            },
            handle_id: view.handle_id,
            nesting: 0,
            after_closure: view.after_closure,
            handlers: view.handlers,
        }));
        fiber.push_frame(updated)?;
        for &frame in &saved_frames[1..] {
            fiber.push_frame(frame)?;
        }

        Ok(resume_location)
    })();

    fiber.pop_root()?;
    resumed
}

/// `CALL_CONTINUATION` (spec.md §4.7): resumes a continuation, pushing a
/// fresh `HandleFrame` with `afterLocation = ip` (the instruction after
/// `CALL_CONTINUATION` itself).
pub fn call_continuation(heap: &Heap, fiber: &mut Fiber, ip: usize) -> VmResult<usize> {
    resume(heap, fiber, ip, None)
}

/// `TAILCALL_CONTINUATION` (spec.md §4.7): pops the current call frame
/// first, reusing its `afterLocation` for the rebuilt `HandleFrame`.
pub fn tailcall_continuation(heap: &Heap, fiber: &mut Fiber, ip: usize) -> VmResult<usize> {
    let current = fiber.pop_frame()?;
    let after = match unsafe { current.as_ref() } {
        Object::CallFrame(c) => c.after_location,
        Object::HandleFrame(h) => h.call.after_location,
        other => {
            return Err(VmError::FrameTypeMismatch {
                expected: "CallFrame",
                found: other.type_name(),
            })
        }
    };
    resume(heap, fiber, ip, Some(after))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{Closure, ResumeLimit as RL};

    fn fresh_heap() -> Heap {
        Heap::new(1 << 20, 1 << 16, 50)
    }

    fn make_closure(heap: &Heap, func_location: usize, param_count: u8, limit: RL) -> GcPtr {
        heap.alloc(Object::Closure(Closure {
            func_location,
            param_count,
            captured: vec![],
            resume_limit: limit,
        }))
    }

    #[test]
    fn inject_then_eject_restores_nesting_to_zero() {
        let heap = fresh_heap();
        let mut fiber = Fiber::new(16, 16, 16, true);
        let after = make_closure(&heap, 0, 0, RL::Many);
        let handler = make_closure(&heap, 1, 0, RL::None);
        fiber.push_value(Value::object(handler)).unwrap();
        fiber.push_value(Value::object(after)).unwrap();
        handle(&heap, &mut fiber, 3, 0, 1, 100).unwrap();

        inject(&fiber, 3).unwrap();
        let frame = fiber.peek_frame(0).unwrap();
        match unsafe { frame.as_ref() } {
            Object::HandleFrame(h) => assert_eq!(h.nesting, 1),
            _ => panic!("expected HandleFrame"),
        }
        eject(&fiber, 3).unwrap();
        match unsafe { frame.as_ref() } {
            Object::HandleFrame(h) => assert_eq!(h.nesting, 0),
            _ => panic!("expected HandleFrame"),
        }
    }

    #[test]
    fn eject_without_inject_is_underflow() {
        let heap = fresh_heap();
        let mut fiber = Fiber::new(16, 16, 16, true);
        let after = make_closure(&heap, 0, 0, RL::Many);
        let handler = make_closure(&heap, 1, 0, RL::None);
        fiber.push_value(Value::object(handler)).unwrap();
        fiber.push_value(Value::object(after)).unwrap();
        handle(&heap, &mut fiber, 3, 0, 1, 100).unwrap();
        assert!(matches!(eject(&fiber, 3), Err(VmError::EjectUnderflow(3))));
    }

    #[test]
    fn find_free_handler_skips_nested_frames() {
        let heap = fresh_heap();
        let mut fiber = Fiber::new(16, 16, 16, true);
        let after_outer = make_closure(&heap, 0, 0, RL::Many);
        let handler_outer = make_closure(&heap, 1, 0, RL::None);
        fiber.push_value(Value::object(handler_outer)).unwrap();
        fiber.push_value(Value::object(after_outer)).unwrap();
        handle(&heap, &mut fiber, 3, 0, 1, 100).unwrap();

        let after_inner = make_closure(&heap, 2, 0, RL::Many);
        let handler_inner = make_closure(&heap, 3, 0, RL::None);
        fiber.push_value(Value::object(handler_inner)).unwrap();
        fiber.push_value(Value::object(after_inner)).unwrap();
        handle(&heap, &mut fiber, 3, 0, 1, 200).unwrap();

        assert_eq!(find_free_handler(&fiber, 3).unwrap(), 0);
        inject(&fiber, 3).unwrap();
        assert_eq!(find_free_handler(&fiber, 3).unwrap(), 1);
    }

    #[test]
    fn escape_with_none_limit_clears_value_stack_and_drops_frame() {
        let heap = fresh_heap();
        let mut fiber = Fiber::new(16, 16, 16, true);
        let after = make_closure(&heap, 0, 0, RL::Many);
        let handler = make_closure(&heap, 42, 1, RL::None);
        fiber.push_value(Value::object(handler)).unwrap();
        fiber.push_value(Value::object(after)).unwrap();
        handle(&heap, &mut fiber, 7, 0, 1, 100).unwrap();

        fiber.push_value(Value::number(5.0)).unwrap();
        let new_ip = escape(&heap, &mut fiber, 10, 7, 0).unwrap();
        assert_eq!(new_ip, 42);
        assert_eq!(fiber.frame_count(), 1);
        let frame = fiber.peek_frame(0).unwrap();
        match unsafe { frame.as_ref() } {
            Object::CallFrame(c) => assert_eq!(c.vars.slots[0].as_number(), 5.0),
            other => panic!("expected CallFrame, found {:?}", other),
        }
    }

    #[test]
    fn escape_with_many_limit_captures_continuation_resumable_later() {
        let heap = fresh_heap();
        let mut fiber = Fiber::new(16, 16, 16, true);
        let after = make_closure(&heap, 0, 0, RL::Many);
        let handler = make_closure(&heap, 42, 1, RL::Many);
        fiber.push_value(Value::object(handler)).unwrap();
        fiber.push_value(Value::object(after)).unwrap();
        handle(&heap, &mut fiber, 7, 0, 1, 100).unwrap();

        fiber.push_value(Value::number(9.0)).unwrap();
        let new_ip = escape(&heap, &mut fiber, 10, 7, 0).unwrap();
        assert_eq!(new_ip, 42);
        // The call frame built for the handler carries the continuation as
        // its first slot, then the handler's own popped argument.
        let frame = fiber.peek_frame(0).unwrap();
        match unsafe { frame.as_ref() } {
            Object::CallFrame(c) => {
                assert!(c.vars.slots[0].is_obj());
                assert_eq!(c.vars.slots[1].as_number(), 9.0);
            }
            other => panic!("expected CallFrame, found {:?}", other),
        }
    }
}
