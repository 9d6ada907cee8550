//! Generator protocol: next/return/throw resumption, closing, delegation,
//! and frame snapshots.

use std::cell::RefCell;
use std::rc::Rc;

use protovm::{
    Chunk, ChunkBuilder, FunctionInfo, GeneratorFault, GeneratorState, Interpreter, Op, ResumeMode,
    Str, Value, VmError,
};

use super::init_tracing;

fn generator_info(name: &str) -> FunctionInfo {
    FunctionInfo {
        name: Some(Str::from(name)),
        param_count: 0,
        is_generator: true,
        strict: false,
    }
}

/// Instantiate a generator from its body chunk and hand back the state
/// cell for driving it from the test.
fn spawn(interp: &mut Interpreter, body: Chunk) -> Rc<RefCell<GeneratorState>> {
    init_tracing();
    let mut b = ChunkBuilder::new();
    let chunk = b.add_chunk(body);
    b.emit(Op::MakeClosure { chunk });
    b.emit(Op::LoadUndefined);
    b.emit(Op::Call { argc: 0 });
    b.emit(Op::Return);
    let value = interp.run(Rc::new(b.finish().unwrap())).unwrap();
    match value {
        Value::Object(obj) => obj.borrow().generator_state().unwrap(),
        other => panic!("expected a generator object, got {other:?}"),
    }
}

fn next(
    interp: &mut Interpreter,
    state: &Rc<RefCell<GeneratorState>>,
) -> Result<(Value, bool), VmError> {
    interp.resume_generator(state, ResumeMode::Next(Value::Undefined))
}

#[test]
fn yields_in_order_then_completes_idempotently() {
    let mut body = ChunkBuilder::for_function(generator_info("gen"));
    for v in [0.0, 1.0, 2.0] {
        body.emit_number(v);
        body.emit(Op::Yield);
        body.emit(Op::Pop);
    }
    body.emit_number(-1.0);
    body.emit(Op::Return);

    let mut interp = Interpreter::new();
    let state = spawn(&mut interp, body.finish().unwrap());
    assert_eq!(next(&mut interp, &state).unwrap(), (Value::Number(0.0), false));
    assert_eq!(next(&mut interp, &state).unwrap(), (Value::Number(1.0), false));
    assert_eq!(next(&mut interp, &state).unwrap(), (Value::Number(2.0), false));
    assert_eq!(next(&mut interp, &state).unwrap(), (Value::Number(-1.0), true));
    // Completed generators answer every further next() the same way.
    assert_eq!(next(&mut interp, &state).unwrap(), (Value::Undefined, true));
    assert_eq!(next(&mut interp, &state).unwrap(), (Value::Undefined, true));
}

#[test]
fn resume_value_becomes_the_yield_result() {
    let mut body = ChunkBuilder::for_function(generator_info("gen"));
    body.emit_number(1.0);
    body.emit(Op::Yield);
    body.emit(Op::Return);

    let mut interp = Interpreter::new();
    let state = spawn(&mut interp, body.finish().unwrap());
    assert_eq!(next(&mut interp, &state).unwrap(), (Value::Number(1.0), false));
    let result = interp
        .resume_generator(&state, ResumeMode::Next(Value::Number(42.0)))
        .unwrap();
    assert_eq!(result, (Value::Number(42.0), true));
}

#[test]
fn generator_protocol_works_from_bytecode() {
    let mut body = ChunkBuilder::for_function(generator_info("gen"));
    body.emit_number(5.0);
    body.emit(Op::Yield);
    body.emit(Op::Return);

    let mut b = ChunkBuilder::new();
    let next_name = b.add_str("next");
    let value_name = b.add_str("value");
    let chunk = b.add_chunk(body.finish().unwrap());
    let g = b.alloc_local();
    b.emit(Op::MakeClosure { chunk });
    b.emit(Op::LoadUndefined);
    b.emit(Op::Call { argc: 0 });
    b.emit(Op::StoreLocal { slot: g });
    b.emit(Op::LoadLocal { slot: g });
    b.emit(Op::CallMethod {
        name: next_name,
        argc: 0,
    });
    b.emit(Op::GetProp { name: value_name });
    b.emit(Op::Return);

    init_tracing();
    let mut interp = Interpreter::new();
    let result = interp.run(Rc::new(b.finish().unwrap())).unwrap();
    assert_eq!(result, Value::Number(5.0));
}

#[test]
fn thrown_resumption_lands_in_the_body_catch() {
    let mut body = ChunkBuilder::for_function(generator_info("gen"));
    let region = body.open_region(0);
    body.emit_number(1.0);
    body.emit(Op::Yield);
    body.emit(Op::Pop);
    body.emit_number(2.0);
    body.emit(Op::Return);
    let handler = body.current_offset();
    body.close_catch(region, handler);
    body.emit(Op::Return);

    let mut interp = Interpreter::new();
    let state = spawn(&mut interp, body.finish().unwrap());
    assert_eq!(next(&mut interp, &state).unwrap(), (Value::Number(1.0), false));
    let result = interp
        .resume_generator(&state, ResumeMode::Throw(Value::from_string("x")))
        .unwrap();
    assert_eq!(result, (Value::from_string("x"), true));
    assert_eq!(next(&mut interp, &state).unwrap(), (Value::Undefined, true));
}

#[test]
fn throw_before_start_completes_the_generator() {
    let mut body = ChunkBuilder::for_function(generator_info("gen"));
    body.emit_number(1.0);
    body.emit(Op::Yield);
    body.emit(Op::Return);

    let mut interp = Interpreter::new();
    let state = spawn(&mut interp, body.finish().unwrap());
    let err = interp
        .resume_generator(&state, ResumeMode::Throw(Value::from_string("x")))
        .unwrap_err();
    assert!(matches!(err, VmError::Thrown { value } if value == Value::from_string("x")));
    assert_eq!(next(&mut interp, &state).unwrap(), (Value::Undefined, true));
}

#[test]
fn return_before_start_completes_with_the_value() {
    let mut body = ChunkBuilder::for_function(generator_info("gen"));
    body.emit_number(1.0);
    body.emit(Op::Yield);
    body.emit(Op::Return);

    let mut interp = Interpreter::new();
    let state = spawn(&mut interp, body.finish().unwrap());
    let result = interp
        .resume_generator(&state, ResumeMode::Return(Value::Number(9.0)))
        .unwrap();
    assert_eq!(result, (Value::Number(9.0), true));
}

/// Body shape: try { for (;;) yield 1 } finally { yield "x" }
fn yielding_finally_body() -> Chunk {
    let mut body = ChunkBuilder::for_function(generator_info("gen"));
    let region = body.open_region(0);
    let head = body.current_offset();
    body.emit_number(1.0);
    body.emit(Op::Yield);
    body.emit(Op::Pop);
    let back = body.emit_jump();
    body.patch_jump_to(back, head as u32);
    let entry = body.close_finally(region);
    body.emit(Op::EnterFinally { entry });
    let handler = body.current_offset();
    body.emit_str("x");
    body.emit(Op::Yield);
    body.emit(Op::Pop);
    body.emit(Op::EndFinally);
    body.set_finally_handler(entry, handler, body.current_offset());
    body.emit(Op::ReturnUndefined);
    body.finish().unwrap()
}

#[test]
fn return_resumption_can_suspend_inside_finally() {
    let mut interp = Interpreter::new();
    let state = spawn(&mut interp, yielding_finally_body());
    assert_eq!(next(&mut interp, &state).unwrap(), (Value::Number(1.0), false));
    // return() enters the finally, which yields once more.
    let result = interp
        .resume_generator(&state, ResumeMode::Return(Value::Undefined))
        .unwrap();
    assert_eq!(result, (Value::from_string("x"), false));
    // The pending return survives the suspension and replays at
    // EndFinally.
    assert_eq!(next(&mut interp, &state).unwrap(), (Value::Undefined, true));
}

#[test]
fn closing_a_generator_whose_finally_yields_is_a_fault() {
    let mut interp = Interpreter::new();
    let state = spawn(&mut interp, yielding_finally_body());
    assert_eq!(next(&mut interp, &state).unwrap(), (Value::Number(1.0), false));
    let err = interp.close_generator(&state).unwrap_err();
    assert!(matches!(
        err,
        VmError::Generator(GeneratorFault::YieldFromClosing)
    ));
    assert_eq!(next(&mut interp, &state).unwrap(), (Value::Undefined, true));
}

#[test]
fn closing_before_start_is_quiet() {
    let mut interp = Interpreter::new();
    let state = spawn(&mut interp, yielding_finally_body());
    interp.close_generator(&state).unwrap();
    assert_eq!(next(&mut interp, &state).unwrap(), (Value::Undefined, true));
}

#[test]
fn delegation_drains_the_inner_generator() {
    let mut inner = ChunkBuilder::for_function(generator_info("inner"));
    for v in [1.0, 2.0] {
        inner.emit_number(v);
        inner.emit(Op::Yield);
        inner.emit(Op::Pop);
    }
    inner.emit_number(3.0);
    inner.emit(Op::Return);

    let mut outer = ChunkBuilder::for_function(generator_info("outer"));
    let inner_chunk = outer.add_chunk(inner.finish().unwrap());
    outer.emit(Op::MakeClosure { chunk: inner_chunk });
    outer.emit(Op::LoadUndefined);
    outer.emit(Op::Call { argc: 0 });
    outer.emit(Op::YieldDelegate);
    outer.emit(Op::Return);

    let mut interp = Interpreter::new();
    let state = spawn(&mut interp, outer.finish().unwrap());
    assert_eq!(next(&mut interp, &state).unwrap(), (Value::Number(1.0), false));
    assert_eq!(next(&mut interp, &state).unwrap(), (Value::Number(2.0), false));
    // The inner return value is the value of the yield* expression.
    assert_eq!(next(&mut interp, &state).unwrap(), (Value::Number(3.0), true));
}

#[test]
fn delegation_forwards_throw_to_the_inner_generator() {
    let mut inner = ChunkBuilder::for_function(generator_info("inner"));
    let region = inner.open_region(0);
    inner.emit_number(1.0);
    inner.emit(Op::Yield);
    inner.emit(Op::Pop);
    inner.emit_number(2.0);
    inner.emit(Op::Return);
    let handler = inner.current_offset();
    inner.close_catch(region, handler);
    inner.emit(Op::Return);

    let mut outer = ChunkBuilder::for_function(generator_info("outer"));
    let inner_chunk = outer.add_chunk(inner.finish().unwrap());
    outer.emit(Op::MakeClosure { chunk: inner_chunk });
    outer.emit(Op::LoadUndefined);
    outer.emit(Op::Call { argc: 0 });
    outer.emit(Op::YieldDelegate);
    outer.emit(Op::Return);

    let mut interp = Interpreter::new();
    let state = spawn(&mut interp, outer.finish().unwrap());
    assert_eq!(next(&mut interp, &state).unwrap(), (Value::Number(1.0), false));
    // The inner catch absorbs the throw and finishes, which finishes the
    // delegation and the outer generator with it.
    let result = interp
        .resume_generator(&state, ResumeMode::Throw(Value::from_string("t")))
        .unwrap();
    assert_eq!(result, (Value::from_string("t"), true));
}

#[test]
fn delegate_without_return_hook_completes_with_the_sent_value() {
    // The delegate is a plain iterator object exposing only next().
    let mut mknext = ChunkBuilder::for_function(FunctionInfo {
        name: Some(Str::from("n")),
        param_count: 0,
        is_generator: false,
        strict: false,
    });
    let value_name = mknext.add_str("value");
    let done_name = mknext.add_str("done");
    mknext.emit(Op::NewObject);
    mknext.emit(Op::Dup);
    mknext.emit_number(1.0);
    mknext.emit(Op::SetProp { name: value_name });
    mknext.emit(Op::Dup);
    mknext.emit(Op::LoadBool { value: false });
    mknext.emit(Op::SetProp { name: done_name });
    mknext.emit(Op::Return);

    let mut outer = ChunkBuilder::for_function(generator_info("outer"));
    let next_name = outer.add_str("next");
    let mknext_chunk = outer.add_chunk(mknext.finish().unwrap());
    outer.emit(Op::NewObject);
    outer.emit(Op::Dup);
    outer.emit(Op::MakeClosure {
        chunk: mknext_chunk,
    });
    outer.emit(Op::SetProp { name: next_name });
    outer.emit(Op::YieldDelegate);
    outer.emit(Op::Return);

    let mut interp = Interpreter::new();
    let state = spawn(&mut interp, outer.finish().unwrap());
    assert_eq!(next(&mut interp, &state).unwrap(), (Value::Number(1.0), false));
    let result = interp
        .resume_generator(&state, ResumeMode::Return(Value::Number(7.0)))
        .unwrap();
    assert_eq!(result, (Value::Number(7.0), true));
    assert_eq!(next(&mut interp, &state).unwrap(), (Value::Undefined, true));
}

#[test]
fn nullish_return_hook_result_completes_with_the_sent_value() {
    // The delegate has a return hook, but it answers undefined instead of
    // an iterator result; the sent value still completes the delegation.
    let mut mknext = ChunkBuilder::for_function(FunctionInfo {
        name: Some(Str::from("n")),
        param_count: 0,
        is_generator: false,
        strict: false,
    });
    let value_name = mknext.add_str("value");
    let done_name = mknext.add_str("done");
    mknext.emit(Op::NewObject);
    mknext.emit(Op::Dup);
    mknext.emit_number(1.0);
    mknext.emit(Op::SetProp { name: value_name });
    mknext.emit(Op::Dup);
    mknext.emit(Op::LoadBool { value: false });
    mknext.emit(Op::SetProp { name: done_name });
    mknext.emit(Op::Return);

    let mut mkret = ChunkBuilder::for_function(FunctionInfo {
        name: Some(Str::from("r")),
        param_count: 0,
        is_generator: false,
        strict: false,
    });
    mkret.emit(Op::ReturnUndefined);

    let mut outer = ChunkBuilder::for_function(generator_info("outer"));
    let next_name = outer.add_str("next");
    let return_name = outer.add_str("return");
    let mknext_chunk = outer.add_chunk(mknext.finish().unwrap());
    let mkret_chunk = outer.add_chunk(mkret.finish().unwrap());
    outer.emit(Op::NewObject);
    outer.emit(Op::Dup);
    outer.emit(Op::MakeClosure {
        chunk: mknext_chunk,
    });
    outer.emit(Op::SetProp { name: next_name });
    outer.emit(Op::Dup);
    outer.emit(Op::MakeClosure { chunk: mkret_chunk });
    outer.emit(Op::SetProp { name: return_name });
    outer.emit(Op::YieldDelegate);
    outer.emit(Op::Return);

    let mut interp = Interpreter::new();
    let state = spawn(&mut interp, outer.finish().unwrap());
    assert_eq!(next(&mut interp, &state).unwrap(), (Value::Number(1.0), false));
    let result = interp
        .resume_generator(&state, ResumeMode::Return(Value::Number(7.0)))
        .unwrap();
    assert_eq!(result, (Value::Number(7.0), true));
    assert_eq!(next(&mut interp, &state).unwrap(), (Value::Undefined, true));
}

#[test]
fn reentrant_resume_is_a_fault() {
    let mut body = ChunkBuilder::for_function(generator_info("gen"));
    let g_name = body.add_str("g");
    let next_name = body.add_str("next");
    body.emit(Op::LoadName { name: g_name });
    body.emit(Op::CallMethod {
        name: next_name,
        argc: 0,
    });
    body.emit(Op::Return);

    let mut b = ChunkBuilder::new();
    let g_name = b.add_str("g");
    let chunk = b.add_chunk(body.finish().unwrap());
    b.emit(Op::MakeClosure { chunk });
    b.emit(Op::LoadUndefined);
    b.emit(Op::Call { argc: 0 });
    b.emit(Op::Dup);
    b.emit(Op::DeclareName { name: g_name });
    b.emit(Op::Return);

    init_tracing();
    let mut interp = Interpreter::new();
    let value = interp.run(Rc::new(b.finish().unwrap())).unwrap();
    let state = match value {
        Value::Object(obj) => obj.borrow().generator_state().unwrap(),
        other => panic!("expected a generator object, got {other:?}"),
    };
    let err = next(&mut interp, &state).unwrap_err();
    assert!(matches!(
        err,
        VmError::Generator(GeneratorFault::AlreadyRunning)
    ));
}

#[test]
fn suspended_frames_expose_a_diagnostic_snapshot() {
    let mut body = ChunkBuilder::for_function(generator_info("gen"));
    let slot = body.alloc_local();
    body.set_line(3);
    body.emit_number(7.0);
    body.emit(Op::StoreLocal { slot });
    body.emit_number(1.0);
    body.emit(Op::Yield);
    body.emit(Op::Return);

    let mut interp = Interpreter::new();
    let state = spawn(&mut interp, body.finish().unwrap());
    next(&mut interp, &state).unwrap();
    let dump = state.borrow().dump().expect("suspended frame");
    assert_eq!(dump.function_name.as_ref().map(Str::as_str), Some("gen"));
    assert_eq!(dump.line, Some(3));
    assert_eq!(dump.locals[slot as usize], Value::Number(7.0));
    // The suspended state is stable: snapshotting again sees the same
    // frame.
    let again = state.borrow().dump().expect("suspended frame");
    assert_eq!(again.locals, dump.locals);
    assert_eq!(again.pc, dump.pc);
}

#[test]
fn operand_stack_survives_suspension() {
    // A value sits below the yield on the operand stack; the resumed frame
    // still consumes it.
    let mut body = ChunkBuilder::for_function(generator_info("gen"));
    body.emit_number(40.0);
    body.emit_number(1.0);
    body.emit(Op::Yield);
    body.emit(Op::Add);
    body.emit(Op::Return);

    let mut interp = Interpreter::new();
    let state = spawn(&mut interp, body.finish().unwrap());
    assert_eq!(next(&mut interp, &state).unwrap(), (Value::Number(1.0), false));
    let result = interp
        .resume_generator(&state, ResumeMode::Next(Value::Number(2.0)))
        .unwrap();
    assert_eq!(result, (Value::Number(42.0), true));
}

#[test]
fn iteration_opcodes_drive_a_generator_to_completion() {
    // for-of from bytecode: GetIter, then IterNext/IterDone/IterValue in a
    // loop until the iterator reports done.
    let mut body = ChunkBuilder::for_function(generator_info("gen"));
    for v in [1.0, 2.0, 3.0] {
        body.emit_number(v);
        body.emit(Op::Yield);
        body.emit(Op::Pop);
    }
    body.emit(Op::ReturnUndefined);

    let mut b = ChunkBuilder::new();
    let chunk = b.add_chunk(body.finish().unwrap());
    let iter = b.alloc_local();
    let total = b.alloc_local();
    b.emit(Op::MakeClosure { chunk });
    b.emit(Op::LoadUndefined);
    b.emit(Op::Call { argc: 0 });
    b.emit(Op::GetIter);
    b.emit(Op::StoreLocal { slot: iter });
    b.emit_number(0.0);
    b.emit(Op::StoreLocal { slot: total });
    let head = b.current_offset();
    b.emit(Op::LoadLocal { slot: iter });
    b.emit(Op::IterNext);
    b.emit(Op::Dup);
    b.emit(Op::IterDone);
    let exit = b.emit_jump_if_true();
    b.emit(Op::IterValue);
    b.emit(Op::LoadLocal { slot: total });
    b.emit(Op::Add);
    b.emit(Op::StoreLocal { slot: total });
    let back = b.emit_jump();
    b.patch_jump_to(back, head as u32);
    b.patch_jump(exit);
    b.emit(Op::Pop);
    b.emit(Op::LoadLocal { slot: total });
    b.emit(Op::Return);

    init_tracing();
    let mut interp = Interpreter::new();
    let result = interp.run(Rc::new(b.finish().unwrap())).unwrap();
    assert_eq!(result, Value::Number(6.0));
}
