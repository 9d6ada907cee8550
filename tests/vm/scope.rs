//! Scope-chain resolution: block, catch, and `with` scopes, plus the
//! teardown ranges that keep the chain balanced on non-local exits.

use std::rc::Rc;

use protovm::{ChunkBuilder, Interpreter, Op, Value};

use super::eval_chunk;

#[test]
fn block_scope_shadows_and_unwinds() {
    // x = 1; { x declared as 2; read } read after pop
    let mut b = ChunkBuilder::new();
    let x = b.add_str("x");
    let inner = b.alloc_local();
    b.emit_number(1.0);
    b.emit(Op::DeclareName { name: x });
    b.emit(Op::PushScope);
    b.emit_number(2.0);
    b.emit(Op::DeclareName { name: x });
    b.emit(Op::LoadName { name: x });
    b.emit(Op::StoreLocal { slot: inner });
    b.emit(Op::PopScope);
    b.emit(Op::LoadLocal { slot: inner });
    b.emit(Op::LoadName { name: x });
    b.emit(Op::Add);
    b.emit(Op::Return);
    assert_eq!(eval_chunk(b.finish().unwrap()), Value::Number(3.0));
}

#[test]
fn assignment_walks_to_the_declaring_scope() {
    // x = 1; { x = 5 } x afterwards is 5: the block has no own binding.
    let mut b = ChunkBuilder::new();
    let x = b.add_str("x");
    b.emit_number(1.0);
    b.emit(Op::DeclareName { name: x });
    b.emit(Op::PushScope);
    b.emit_number(5.0);
    b.emit(Op::StoreName { name: x });
    b.emit(Op::PopScope);
    b.emit(Op::LoadName { name: x });
    b.emit(Op::Return);
    assert_eq!(eval_chunk(b.finish().unwrap()), Value::Number(5.0));
}

#[test]
fn undeclared_assignment_lands_on_the_global() {
    let mut b = ChunkBuilder::new();
    let y = b.add_str("y");
    b.emit(Op::PushScope);
    b.emit_number(7.0);
    b.emit(Op::StoreName { name: y });
    b.emit(Op::PopScope);
    b.emit(Op::LoadUndefined);
    b.emit(Op::Return);

    let mut interp = Interpreter::new();
    interp.run(Rc::new(b.finish().unwrap())).unwrap();
    assert_eq!(interp.get_global("y"), Value::Number(7.0));
}

#[test]
fn with_scope_resolves_through_the_target() {
    let mut b = ChunkBuilder::new();
    let x = b.add_str("x");
    b.emit_number(1.0);
    b.emit(Op::DeclareName { name: x });
    b.emit(Op::NewObject);
    b.emit(Op::Dup);
    b.emit_number(2.0);
    b.emit(Op::SetProp { name: x });
    b.emit(Op::EnterWith);
    b.emit(Op::LoadName { name: x });
    b.emit(Op::PopScope);
    b.emit(Op::Return);
    assert_eq!(eval_chunk(b.finish().unwrap()), Value::Number(2.0));
}

#[test]
fn with_scope_assignment_writes_to_the_target() {
    let mut b = ChunkBuilder::new();
    let x = b.add_str("x");
    let o = b.alloc_local();
    b.emit(Op::NewObject);
    b.emit(Op::Dup);
    b.emit_number(2.0);
    b.emit(Op::SetProp { name: x });
    b.emit(Op::Dup);
    b.emit(Op::StoreLocal { slot: o });
    b.emit(Op::EnterWith);
    b.emit_number(9.0);
    b.emit(Op::StoreName { name: x });
    b.emit(Op::PopScope);
    b.emit(Op::LoadLocal { slot: o });
    b.emit(Op::GetProp { name: x });
    b.emit(Op::Return);
    assert_eq!(eval_chunk(b.finish().unwrap()), Value::Number(9.0));
}

#[test]
fn with_scope_misses_fall_through_to_outer_bindings() {
    let mut b = ChunkBuilder::new();
    let x = b.add_str("x");
    b.emit_number(1.0);
    b.emit(Op::DeclareName { name: x });
    b.emit(Op::NewObject);
    b.emit(Op::EnterWith);
    b.emit(Op::LoadName { name: x });
    b.emit(Op::PopScope);
    b.emit(Op::Return);
    assert_eq!(eval_chunk(b.finish().unwrap()), Value::Number(1.0));
}

#[test]
fn break_out_of_with_pops_the_scope() {
    let mut b = ChunkBuilder::new();
    let x = b.add_str("x");
    let seen = b.alloc_local();
    b.emit_number(1.0);
    b.emit(Op::DeclareName { name: x });
    b.emit(Op::NewObject);
    b.emit(Op::Dup);
    b.emit_number(2.0);
    b.emit(Op::SetProp { name: x });
    b.emit(Op::EnterWith);
    let region = b.open_region(0);
    b.emit(Op::LoadName { name: x });
    b.emit(Op::StoreLocal { slot: seen });
    let brk = b.emit_break();
    b.close_scope_exit(region);
    b.emit(Op::PopScope);
    b.patch_jump(brk);
    // Outside: the with scope is gone, x resolves to the global binding.
    b.emit(Op::LoadLocal { slot: seen });
    b.emit(Op::LoadName { name: x });
    b.emit(Op::Add);
    b.emit(Op::Return);
    assert_eq!(eval_chunk(b.finish().unwrap()), Value::Number(3.0));
}

#[test]
fn throw_out_of_with_pops_the_scope_before_catch() {
    let mut b = ChunkBuilder::new();
    let x = b.add_str("x");
    b.emit_number(1.0);
    b.emit(Op::DeclareName { name: x });
    let outer = b.open_region(0);
    b.emit(Op::NewObject);
    b.emit(Op::Dup);
    b.emit_number(2.0);
    b.emit(Op::SetProp { name: x });
    b.emit(Op::EnterWith);
    let sregion = b.open_region(0);
    b.emit_str("boom");
    b.emit(Op::Throw);
    b.close_scope_exit(sregion);
    b.emit(Op::PopScope);
    let handler = b.current_offset();
    b.close_catch(outer, handler);
    // Handler runs with the with scope unlinked.
    b.emit(Op::Pop);
    b.emit(Op::LoadName { name: x });
    b.emit(Op::Return);
    assert_eq!(eval_chunk(b.finish().unwrap()), Value::Number(1.0));
}

#[test]
fn catch_scope_binding_is_local_to_the_handler() {
    // The handler declares the caught value in its own scope; the binding
    // vanishes once the scope pops.
    let mut b = ChunkBuilder::new();
    let e = b.add_str("e");
    let caught = b.alloc_local();
    b.emit_str("outer");
    b.emit(Op::DeclareName { name: e });
    let region = b.open_region(0);
    b.emit_str("inner");
    b.emit(Op::Throw);
    let handler = b.current_offset();
    b.close_catch(region, handler);
    b.emit(Op::PushCatchScope);
    b.emit(Op::DeclareName { name: e });
    b.emit(Op::LoadName { name: e });
    b.emit(Op::StoreLocal { slot: caught });
    b.emit(Op::PopScope);
    b.emit(Op::LoadLocal { slot: caught });
    b.emit(Op::LoadName { name: e });
    b.emit(Op::Add);
    b.emit(Op::Return);
    assert_eq!(
        eval_chunk(b.finish().unwrap()),
        Value::from_string("innerouter")
    );
}
