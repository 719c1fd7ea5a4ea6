//! End-to-end dispatch-loop scenarios (spec.md §8): assembles a small
//! program by hand, byte by byte, and runs it through [`Vm::interpret`]
//! rather than exercising individual opcode helpers in isolation. Mirrors
//! how `raya-core`'s own integration suite drives its interpreter through
//! `tests/` rather than `#[cfg(test)]` modules, since these scenarios span
//! several opcodes working together rather than one module's internals.

use weft_bytecode::Opcode;
use weft_core::{Closure, Object, ResumeLimit, Value, Vm, VmConfig};

fn emit_op(vm: &Vm, op: Opcode) {
    vm.write_chunk(op as u8, 0);
}

fn emit_u8(vm: &Vm, v: u8) {
    vm.write_chunk(v, 0);
}

fn emit_u16(vm: &Vm, v: u16) {
    vm.write_operand(&v.to_be_bytes(), 0);
}

fn emit_u32(vm: &Vm, v: u32) {
    vm.write_operand(&v.to_be_bytes(), 0);
}

fn emit_i16(vm: &Vm, v: i16) {
    vm.write_operand(&(v as u16).to_be_bytes(), 0);
}

fn emit_constant(vm: &Vm, n: f64) {
    let idx = vm.add_constant(n).unwrap();
    emit_op(vm, Opcode::Constant);
    emit_u8(vm, idx);
}

fn emit_constant_str(vm: &Vm, s: &str) {
    let idx = vm.add_constant(s).unwrap();
    emit_op(vm, Opcode::Constant);
    emit_u8(vm, idx);
}

fn emit_abort(vm: &Vm, code: u8) {
    emit_op(vm, Opcode::Abort);
    emit_u8(vm, code);
}

fn emit_handle(vm: &Vm, after_delta: i16, handle_id: u32, param_count: u8, handler_count: u8) {
    emit_op(vm, Opcode::Handle);
    emit_i16(vm, after_delta);
    emit_u32(vm, handle_id);
    emit_u8(vm, param_count);
    emit_u8(vm, handler_count);
}

fn emit_escape(vm: &Vm, handle_id: u32, handler_idx: u8) {
    emit_op(vm, Opcode::Escape);
    emit_u32(vm, handle_id);
    emit_u8(vm, handler_idx);
}

fn emit_inject(vm: &Vm, handle_id: u32) {
    emit_op(vm, Opcode::Inject);
    emit_u32(vm, handle_id);
}

fn emit_find(vm: &Vm, frame: u16, slot: u16) {
    emit_op(vm, Opcode::Find);
    emit_u16(vm, frame);
    emit_u16(vm, slot);
}

fn make_closure(vm: &Vm, func_location: usize, param_count: u8, limit: ResumeLimit) -> Value {
    let ptr = vm.heap().alloc(Object::Closure(Closure {
        func_location,
        param_count,
        captured: vec![],
        resume_limit: limit,
    }));
    Value::object(ptr)
}

fn fiber_values(vm: &Vm, fiber: weft_core::GcPtr) -> Vec<Value> {
    // Safety: `fiber` is the handle `interpret` was just run on and is still
    // rooted by the VM's `root_fiber` slot.
    match unsafe { fiber.as_ref() } {
        Object::Fiber(f) => f.value_stack.clone(),
        other => panic!("expected a Fiber, found {:?}", other),
    }
}

#[test]
fn arithmetic_scenario_computes_negated_quotient() {
    let mut vm = Vm::new(VmConfig::default());
    emit_constant(&vm, 1.2);
    emit_constant(&vm, 3.4);
    emit_op(&vm, Opcode::Add);
    emit_constant(&vm, 5.6);
    emit_op(&vm, Opcode::Divide);
    emit_op(&vm, Opcode::Negate);
    emit_abort(&vm, 0);

    let fiber = vm.new_fiber(0, &[], true).unwrap();
    let result = vm.interpret(fiber);
    assert!(matches!(result, weft_core::InterpretResult::Halted(0)));
    let values = fiber_values(&vm, fiber);
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].as_number(), -((1.2f64 + 3.4) / 5.6));
}

#[test]
fn string_concat_scenario_joins_and_lengths_match() {
    let mut vm = Vm::new(VmConfig::default());
    emit_constant_str(&vm, "Hello,");
    emit_constant_str(&vm, " world!");
    emit_op(&vm, Opcode::Concat);
    emit_abort(&vm, 0);

    let fiber = vm.new_fiber(0, &[], true).unwrap();
    let result = vm.interpret(fiber);
    assert!(matches!(result, weft_core::InterpretResult::Halted(0)));
    let values = fiber_values(&vm, fiber);
    assert_eq!(values.len(), 1);
    match unsafe { values[0].as_obj().as_ref() } {
        Object::String(s) => {
            assert_eq!(s.as_str(), "Hello, world!");
            assert_eq!(s.len(), 13);
        }
        other => panic!("expected a String, found {:?}", other),
    }
}

#[test]
fn store_forget_scenario_leaves_both_stacks_empty() {
    let mut vm = Vm::new(VmConfig::default());
    emit_constant(&vm, 1.0);
    emit_constant(&vm, 2.0);
    emit_op(&vm, Opcode::Store);
    emit_u8(&vm, 2);
    emit_op(&vm, Opcode::Forget);
    emit_abort(&vm, 0);

    let fiber = vm.new_fiber(0, &[], true).unwrap();
    let result = vm.interpret(fiber);
    assert!(matches!(result, weft_core::InterpretResult::Halted(0)));
    match unsafe { fiber.as_ref() } {
        Object::Fiber(f) => {
            assert_eq!(f.value_stack.len(), 0);
            assert_eq!(f.frame_stack.len(), 0);
        }
        other => panic!("expected a Fiber, found {:?}", other),
    }
}

#[test]
fn tailcall_jumps_over_dead_code_to_its_target() {
    let mut vm = Vm::new(VmConfig::default());
    // byte 0: TAILCALL <target>  (1 opcode byte + 4-byte operand = 5 bytes)
    // byte 5: CONSTANT 0.0       (dead, skipped)
    // byte 7: ABORT 0            (dead, skipped)
    // byte 9: ABORT 0            (the tailcall's target)
    let target: u32 = 9;
    emit_op(&vm, Opcode::TailCall);
    emit_u32(&vm, target);
    emit_constant(&vm, 0.0);
    emit_abort(&vm, 0);
    emit_abort(&vm, 0);

    let fiber = vm.new_fiber(0, &[], true).unwrap();
    let result = vm.interpret(fiber);
    assert!(matches!(result, weft_core::InterpretResult::Halted(0)));
    let values = fiber_values(&vm, fiber);
    assert!(values.is_empty(), "the dead CONSTANT must never have executed");
}

/// A `NONE`-limit handler never resumes: `ESCAPE` drops the whole handle
/// context (including the never-invoked after-closure) and jumps straight to
/// the handler body, which is free to halt the fiber outright.
#[test]
fn handler_with_none_limit_never_resumes() {
    let mut vm = Vm::new(VmConfig::default());

    // Byte layout, computed up front so the forward-referencing HANDLE
    // operand can be written correctly in a single assembly pass:
    //   [0, 9)   HANDLE afterDelta, id=7, p=0, h=1
    //   [9, 15)  ESCAPE id=7, handler_idx=0
    //   [15, 19) handler body: CONSTANT 42.0; ABORT 0
    //   [19, 23) after body (dead): CONSTANT 0.0; ABORT 99
    const HANDLE_END: i64 = 9;
    const HANDLER_LOC: usize = 15;
    const AFTER_LOC: usize = 19;
    let after_delta = (AFTER_LOC as i64 - HANDLE_END) as i16;

    emit_handle(&vm, after_delta, 7, 0, 1);
    emit_escape(&vm, 7, 0);
    emit_constant(&vm, 42.0);
    emit_abort(&vm, 0);
    emit_constant(&vm, 0.0);
    emit_abort(&vm, 99);

    let handler_clo = make_closure(&vm, HANDLER_LOC, 0, ResumeLimit::None);
    let after_clo = make_closure(&vm, AFTER_LOC, 0, ResumeLimit::Many);

    let fiber = vm.new_fiber(0, &[after_clo, handler_clo], true).unwrap();
    let result = vm.interpret(fiber);
    assert!(matches!(result, weft_core::InterpretResult::Halted(0)));
    let values = fiber_values(&vm, fiber);
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].as_number(), 42.0);
}

/// A `MANY`-limit handler may invoke `CALL_CONTINUATION` any number of
/// times; each invocation re-enters the handled region (which here is just
/// `COMPLETE`, so each resume is a transparent pass-through of whatever the
/// handler left on the value stack) and returns control to the handler right
/// after the `CALL_CONTINUATION` that triggered it. The handler here calls
/// the continuation twice and sums the two round-tripped values.
#[test]
fn multi_shot_continuation_can_be_resumed_more_than_once() {
    let mut vm = Vm::new(VmConfig::default());

    // main entry:
    //   [0, 9)   HANDLE afterDelta, id=9, p=0, h=1
    //   [9, 11)  CONSTANT 10.0           (the operation's argument, v)
    //   [11, 17) ESCAPE id=9, handler_idx=0
    //   [17, 18) COMPLETE                (the continuation's resume point)
    const HANDLE_END: i64 = 9;

    // handler body, at offset 18:
    //   [18, 23) FIND 0, 1   (push v)
    //   [23, 28) FIND 0, 0   (push the continuation)
    //   [28, 29) CALL_CONTINUATION
    //   [29, 34) FIND 0, 1   (push v again)
    //   [34, 35) ADD
    //   [35, 40) FIND 0, 0   (push the continuation again)
    //   [40, 41) CALL_CONTINUATION
    //   [41, 43) ABORT 0
    const HANDLER_LOC: usize = 18;

    // after-closure body, at offset 43: a transparent pass-through.
    const AFTER_LOC: usize = 43;

    let after_delta = (AFTER_LOC as i64 - HANDLE_END) as i16;
    emit_handle(&vm, after_delta, 9, 0, 1);
    emit_constant(&vm, 10.0);
    emit_escape(&vm, 9, 0);
    emit_op(&vm, Opcode::Complete);

    emit_find(&vm, 0, 1);
    emit_find(&vm, 0, 0);
    emit_op(&vm, Opcode::CallContinuation);
    emit_find(&vm, 0, 1);
    emit_op(&vm, Opcode::Add);
    emit_find(&vm, 0, 0);
    emit_op(&vm, Opcode::CallContinuation);
    emit_abort(&vm, 0);

    emit_op(&vm, Opcode::Return);

    let handler_clo = make_closure(&vm, HANDLER_LOC, 1, ResumeLimit::Many);
    let after_clo = make_closure(&vm, AFTER_LOC, 0, ResumeLimit::Many);

    let fiber = vm.new_fiber(0, &[after_clo, handler_clo], true).unwrap();
    let result = vm.interpret(fiber);
    assert!(matches!(result, weft_core::InterpretResult::Halted(0)));
    let values = fiber_values(&vm, fiber);
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].as_number(), 20.0);
}

/// `INJECT` temporarily hides the nearest matching `HandleFrame` so that an
/// `ESCAPE` with the same handle id is routed to the next-nearest free one
/// instead (spec.md §4.7's nesting rule).
#[test]
fn inject_hides_the_inner_handler_so_escape_reaches_the_outer_one() {
    let mut vm = Vm::new(VmConfig::default());

    // main entry:
    //   [0, 9)   HANDLE afterDeltaOuter, id=5, p=0, h=1   (outer)
    //   [9, 18)  HANDLE afterDeltaInner, id=5, p=0, h=1   (inner)
    //   [18, 23) INJECT 5
    //   [23, 29) ESCAPE id=5, handler_idx=0
    const OUTER_HANDLE_END: i64 = 9;
    const INNER_HANDLE_END: i64 = 18;

    // outer handler body, at offset 29: CONSTANT 100.0; ABORT 0
    const OUTER_HANDLER_LOC: usize = 29;
    // dead outer after-closure, at offset 33
    const OUTER_AFTER_LOC: usize = 33;
    // dead inner handler body, at offset 35 (never reached)
    const INNER_HANDLER_LOC: usize = 35;
    // dead inner after-closure, at offset 39
    const INNER_AFTER_LOC: usize = 39;

    let outer_after_delta = (OUTER_AFTER_LOC as i64 - OUTER_HANDLE_END) as i16;
    let inner_after_delta = (INNER_AFTER_LOC as i64 - INNER_HANDLE_END) as i16;

    emit_handle(&vm, outer_after_delta, 5, 0, 1);
    emit_handle(&vm, inner_after_delta, 5, 0, 1);
    emit_inject(&vm, 5);
    emit_escape(&vm, 5, 0);

    emit_constant(&vm, 100.0);
    emit_abort(&vm, 0);
    emit_abort(&vm, 111); // dead outer after-closure
    emit_constant(&vm, 200.0);
    emit_abort(&vm, 0); // dead inner handler body
    emit_abort(&vm, 222); // dead inner after-closure

    let handler_outer = make_closure(&vm, OUTER_HANDLER_LOC, 0, ResumeLimit::None);
    let after_outer = make_closure(&vm, OUTER_AFTER_LOC, 0, ResumeLimit::Many);
    let handler_inner = make_closure(&vm, INNER_HANDLER_LOC, 0, ResumeLimit::None);
    let after_inner = make_closure(&vm, INNER_AFTER_LOC, 0, ResumeLimit::Many);

    let initial_stack = [after_inner, handler_inner, after_outer, handler_outer];
    let fiber = vm.new_fiber(0, &initial_stack, true).unwrap();
    let result = vm.interpret(fiber);
    assert!(matches!(result, weft_core::InterpretResult::Halted(0)));
    let values = fiber_values(&vm, fiber);
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].as_number(), 100.0, "ESCAPE must reach the outer handler, not the injected inner one");
}

#[test]
fn ref_value_survives_a_collection_reachable_only_through_the_ref_table() {
    let vm = Vm::new(VmConfig::default());
    let boxed = vm.heap().alloc(Object::String(weft_core::WeftString::new("kept")));
    let r = vm.new_ref(Value::object(boxed));

    // An unrooted, unreferenced allocation the same collection must reclaim,
    // so a passing assertion below can only mean a real sweep ran.
    vm.heap().alloc(Object::String(weft_core::WeftString::new("garbage")));

    // The Ref itself has to be reachable for the collector to trace into the
    // ref table at all; root it on a fiber's value stack, not directly
    // alongside `boxed`, so the only path to the string is Ref -> ref table.
    let fiber = vm.new_fiber(0, &[Value::object(r)], true).unwrap();

    let stats = vm.collect_garbage();
    assert!(stats.last_freed >= 1, "the unrooted string must have been swept");

    match unsafe { r.as_ref() } {
        Object::Ref(_) => {}
        other => panic!("expected the Ref to survive the sweep, found {:?}", other),
    }
    let surviving = vm.ref_get(r).unwrap();
    match unsafe { surviving.as_obj().as_ref() } {
        Object::String(s) => assert_eq!(s.as_str(), "kept"),
        other => panic!("expected the ref table's String to survive, found {:?}", other),
    }

    vm.ref_set(r, Value::number(8.0)).unwrap();
    assert_eq!(vm.ref_get(r).unwrap().as_number(), 8.0);

    // Keep the root fiber reachable for the duration of the assertions above.
    let _ = fiber;
}
