//! Closure construction (spec.md §4.6, capability C6): the `CLOSURE`,
//! `RECURSIVE`, and `MUTUAL` opcode bodies, plus the `FIND` primitive they
//! and the handler protocol both rely on. Grounded directly on
//! `vm_interpreter.c`'s `CASE_CODE(CLOSURE)` / `CASE_CODE(RECURSIVE)` /
//! `CASE_CODE(MUTUAL)` / `FIND` macro.

use crate::error::{VmError, VmResult};
use crate::heap::{CallFrame, Closure, Fiber, GcPtr, Heap, Object, ResumeLimit, VarFrame};
use crate::value::Value;

/// Builds a `CallFrame` for invoking `closure`, the shared helper behind
/// `CALL_CLOSURE`/`TAILCALL_CLOSURE` and every handler-protocol opcode that
/// hands control to a closure (`COMPLETE`, `ESCAPE`, `REACT`). Mirrors the
/// original's `callClosureFrame`: the resulting frame's variable slots are,
/// in order, an optional continuation, the closure's parameters (popped off
/// the value stack), an optional spliced-in `frame_vars` (the handle
/// frame's own parameters, when called from the handler protocol), then the
/// closure's captured values.
pub fn call_closure_frame(
    heap: &Heap,
    fiber: &mut Fiber,
    closure: GcPtr,
    frame_vars: Option<&[Value]>,
    cont: Option<GcPtr>,
    after_location: usize,
) -> VmResult<GcPtr> {
    // Safety: `closure` is reachable for the duration of this call (it was
    // just popped off the value stack or read from a live frame).
    let (param_count, captured) = match unsafe { closure.as_ref() } {
        Object::Closure(c) => (c.param_count as usize, c.captured.clone()),
        other => {
            return Err(VmError::FrameTypeMismatch {
                expected: "Closure",
                found: other.type_name(),
            })
        }
    };
    if fiber.value_count() < param_count {
        return Err(VmError::ValueStackUnderflow {
            needed: param_count,
            available: fiber.value_count(),
        });
    }
    let extra = frame_vars.map_or(0, |v| v.len());
    let mut slots = Vec::with_capacity(cont.is_some() as usize + param_count + extra + captured.len());
    if let Some(cont_ptr) = cont {
        slots.push(Value::object(cont_ptr));
    }
    for _ in 0..param_count {
        slots.push(fiber.pop_value()?);
    }
    if let Some(fv) = frame_vars {
        slots.extend_from_slice(fv);
    }
    slots.extend(captured);
    Ok(heap.alloc(Object::CallFrame(CallFrame {
        vars: VarFrame { slots },
        after_location,
    })))
}

/// `FIND <frame> <slot>` (spec.md §4.6): reads a slot out of the frame
/// `frame` steps below the top of the frame stack (`frame = 0` is the top
/// frame itself), matching the original's
/// `(*(frameStackTop - 1 - frame))->slots[slot]`.
pub fn find(fiber: &Fiber, frame: u16, slot: u16) -> VmResult<Value> {
    let frame_obj = fiber.peek_frame(frame as usize)?;
    // Safety: frames on the fiber's frame stack are always reachable roots
    // for the duration of this call.
    let payload = unsafe { frame_obj.as_ref() };
    let slots = payload.as_var_slots().ok_or(VmError::FrameTypeMismatch {
        expected: "VarFrame/CallFrame/HandleFrame",
        found: payload.type_name(),
    })?;
    slots
        .get(slot as usize)
        .copied()
        .ok_or(VmError::SlotOutOfRange {
            index: slot as usize,
            len: slots.len(),
        })
}

/// `CLOSURE body, p, c, [(f,s)...]`: straightforward capture. `captures`
/// lists the `(frame, slot)` pairs to read via [`find`], in capture order.
pub fn build_closure(
    heap: &Heap,
    fiber: &Fiber,
    func_location: usize,
    param_count: u8,
    captures: &[(u16, u16)],
) -> VmResult<GcPtr> {
    let mut captured = Vec::with_capacity(captures.len());
    for &(frame, slot) in captures {
        captured.push(find(fiber, frame, slot)?);
    }
    Ok(heap.alloc(Object::Closure(Closure {
        func_location,
        param_count,
        captured,
        resume_limit: ResumeLimit::default(),
    })))
}

/// `RECURSIVE body, p, c, [...]`: allocates with `c+1` slots, storing a
/// self-reference at slot 0 so the body can refer to itself by name.
///
/// The original allocates the closure first and then backpatches slot 0
/// with `OBJ_VAL(closure)` because C can take an object's own address before
/// it is fully captured; here the closure is built in two steps for the same
/// effect (allocate with a placeholder self-slot, then overwrite it once the
/// `GcPtr` is known) since `Heap::alloc` needs a complete `Object` up front.
pub fn build_recursive_closure(
    heap: &Heap,
    fiber: &Fiber,
    func_location: usize,
    param_count: u8,
    captures: &[(u16, u16)],
) -> VmResult<GcPtr> {
    let mut captured = Vec::with_capacity(captures.len() + 1);
    captured.push(Value::nil());
    for &(frame, slot) in captures {
        captured.push(find(fiber, frame, slot)?);
    }
    let ptr = heap.alloc(Object::Closure(Closure {
        func_location,
        param_count,
        captured,
        resume_limit: ResumeLimit::default(),
    }));
    // Safety: `ptr` was just allocated above and is not yet shared.
    let obj = unsafe { ptr.as_mut() };
    if let Object::Closure(c) = obj {
        c.captured[0] = Value::object(ptr);
    }
    Ok(ptr)
}

/// `MUTUAL n`: given `n` already-built closures on top of the value stack
/// (bottom-to-top in the order they appear in source), rebuilds each to
/// additionally hold references to all `n` siblings (including itself),
/// preserving order, so the final `n` closures refer to each other
/// mutually. Mirrors the original's two-pass approach: first widen every
/// closure's captured array by `n` slots (copying its old captures after
/// the reserved slots), then fill the first `n` slots of each with all `n`
/// sibling pointers.
pub fn build_mutual_closures(heap: &Heap, originals: &[GcPtr]) -> VmResult<Vec<GcPtr>> {
    let mut rebuilt = Vec::with_capacity(originals.len());
    for &orig in originals {
        // Safety: `orig` is one of the live closures the caller just popped
        // off the value stack.
        let old = unsafe { orig.as_ref() };
        let (func_location, param_count, old_captured, resume_limit) = match old {
            Object::Closure(c) => (
                c.func_location,
                c.param_count,
                c.captured.clone(),
                c.resume_limit,
            ),
            other => {
                return Err(VmError::FrameTypeMismatch {
                    expected: "Closure",
                    found: other.type_name(),
                })
            }
        };
        let mut captured = Vec::with_capacity(originals.len() + old_captured.len());
        captured.extend(std::iter::repeat(Value::nil()).take(originals.len()));
        captured.extend(old_captured);
        rebuilt.push(heap.alloc(Object::Closure(Closure {
            func_location,
            param_count,
            captured,
            resume_limit,
        })));
    }
    for new_ptr in &rebuilt {
        // Safety: `new_ptr` was just allocated above and is not yet shared.
        let obj = unsafe { new_ptr.as_mut() };
        if let Object::Closure(c) = obj {
            for (i, sibling) in rebuilt.iter().enumerate() {
                c.captured[i] = Value::object(*sibling);
            }
        }
    }
    Ok(rebuilt)
}

/// Overwrites the top-of-stack closure's resumption-limit hint
/// (`CLOSURE_ONCE` / `CLOSURE_ONCE_TAIL` / `CLOSURE_MANY`, spec.md §4.6).
pub fn set_resume_limit(closure: GcPtr, limit: ResumeLimit) -> VmResult<()> {
    // Safety: the interpreter only calls this with a pointer it just peeked
    // off the value stack, which stays reachable for the call's duration.
    let obj = unsafe { closure.as_mut() };
    match obj {
        Object::Closure(c) => {
            c.resume_limit = limit;
            Ok(())
        }
        other => Err(VmError::FrameTypeMismatch {
            expected: "Closure",
            found: other.type_name(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{Continuation, Heap};

    fn fresh_heap() -> Heap {
        Heap::new(1 << 20, 1 << 16, 50)
    }

    fn make_closure(heap: &Heap, func_location: usize, param_count: u8, captured: Vec<Value>) -> GcPtr {
        heap.alloc(Object::Closure(Closure {
            func_location,
            param_count,
            captured,
            resume_limit: ResumeLimit::default(),
        }))
    }

    #[test]
    fn find_reads_the_requested_slot_of_a_frame_steps_below_the_top() {
        let heap = fresh_heap();
        let mut fiber = Fiber::new(16, 16, 16, true);
        let frame = heap.alloc(Object::CallFrame(CallFrame {
            vars: VarFrame {
                slots: vec![Value::number(1.0), Value::number(2.0)],
            },
            after_location: 0,
        }));
        fiber.push_frame(frame).unwrap();
        assert_eq!(find(&fiber, 0, 0).unwrap().as_number(), 1.0);
        assert_eq!(find(&fiber, 0, 1).unwrap().as_number(), 2.0);
        assert!(find(&fiber, 0, 2).is_err());
        assert!(find(&fiber, 1, 0).is_err());
    }

    #[test]
    fn build_closure_captures_named_slots_in_order() {
        let heap = fresh_heap();
        let mut fiber = Fiber::new(16, 16, 16, true);
        let frame = heap.alloc(Object::CallFrame(CallFrame {
            vars: VarFrame {
                slots: vec![Value::number(10.0), Value::number(20.0)],
            },
            after_location: 0,
        }));
        fiber.push_frame(frame).unwrap();

        let closure = build_closure(&heap, &fiber, 99, 1, &[(0, 1), (0, 0)]).unwrap();
        match unsafe { closure.as_ref() } {
            Object::Closure(c) => {
                assert_eq!(c.func_location, 99);
                assert_eq!(c.param_count, 1);
                assert_eq!(c.captured.len(), 2);
                assert_eq!(c.captured[0].as_number(), 20.0);
                assert_eq!(c.captured[1].as_number(), 10.0);
                assert_eq!(c.resume_limit, ResumeLimit::Many);
            }
            other => panic!("expected Closure, found {:?}", other),
        }
    }

    #[test]
    fn build_recursive_closure_stores_a_self_reference_in_slot_zero() {
        let heap = fresh_heap();
        let fiber = Fiber::new(16, 16, 16, true);
        let closure = build_recursive_closure(&heap, &fiber, 7, 0, &[]).unwrap();
        match unsafe { closure.as_ref() } {
            Object::Closure(c) => {
                assert_eq!(c.captured.len(), 1);
                assert!(c.captured[0].is_obj());
                assert_eq!(c.captured[0].as_obj().addr(), closure.addr());
            }
            other => panic!("expected Closure, found {:?}", other),
        }
    }

    #[test]
    fn build_mutual_closures_lets_every_sibling_reach_every_other() {
        let heap = fresh_heap();
        let a = make_closure(&heap, 1, 0, vec![Value::number(1.0)]);
        let b = make_closure(&heap, 2, 0, vec![Value::number(2.0)]);
        let rebuilt = build_mutual_closures(&heap, &[a, b]).unwrap();
        assert_eq!(rebuilt.len(), 2);
        match unsafe { rebuilt[0].as_ref() } {
            Object::Closure(c) => {
                assert_eq!(c.captured.len(), 3);
                assert_eq!(c.captured[0].as_obj().addr(), rebuilt[0].addr());
                assert_eq!(c.captured[1].as_obj().addr(), rebuilt[1].addr());
                assert_eq!(c.captured[2].as_number(), 1.0);
            }
            other => panic!("expected Closure, found {:?}", other),
        }
        match unsafe { rebuilt[1].as_ref() } {
            Object::Closure(c) => {
                assert_eq!(c.captured[0].as_obj().addr(), rebuilt[0].addr());
                assert_eq!(c.captured[1].as_obj().addr(), rebuilt[1].addr());
                assert_eq!(c.captured[2].as_number(), 2.0);
            }
            other => panic!("expected Closure, found {:?}", other),
        }
    }

    #[test]
    fn set_resume_limit_overwrites_an_existing_closures_hint() {
        let heap = fresh_heap();
        let closure = make_closure(&heap, 0, 0, vec![]);
        set_resume_limit(closure, ResumeLimit::Once).unwrap();
        match unsafe { closure.as_ref() } {
            Object::Closure(c) => assert_eq!(c.resume_limit, ResumeLimit::Once),
            other => panic!("expected Closure, found {:?}", other),
        }
    }

    #[test]
    fn set_resume_limit_on_non_closure_is_a_type_mismatch() {
        let heap = fresh_heap();
        let not_a_closure = heap.alloc(Object::Number(crate::heap::BoxedNumber::Double(1.0)));
        assert!(matches!(
            set_resume_limit(not_a_closure, ResumeLimit::Once),
            Err(VmError::FrameTypeMismatch { expected: "Closure", .. })
        ));
    }

    #[test]
    fn call_closure_frame_orders_slots_as_continuation_then_params_then_frame_vars_then_captures() {
        let heap = fresh_heap();
        let mut fiber = Fiber::new(16, 16, 16, true);
        fiber.push_value(Value::number(5.0)).unwrap();
        let closure = make_closure(&heap, 3, 1, vec![Value::number(9.0)]);
        let cont = heap.alloc(Object::Continuation(Continuation {
            resume_location: 0,
            param_count: 0,
            saved_stack: vec![],
            saved_frames: vec![],
        }));
        let frame = call_closure_frame(&heap, &mut fiber, closure, Some(&[Value::number(4.0)]), Some(cont), 42).unwrap();
        match unsafe { frame.as_ref() } {
            Object::CallFrame(c) => {
                assert_eq!(c.after_location, 42);
                assert!(c.vars.slots[0].is_obj());
                assert_eq!(c.vars.slots[1].as_number(), 5.0);
                assert_eq!(c.vars.slots[2].as_number(), 4.0);
                assert_eq!(c.vars.slots[3].as_number(), 9.0);
            }
            other => panic!("expected CallFrame, found {:?}", other),
        }
        assert_eq!(fiber.value_count(), 0);
    }
}
