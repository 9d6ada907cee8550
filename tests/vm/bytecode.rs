//! The bytecode contract: serialization round trips and up-front
//! validation of malformed chunks.

use protovm::bytecode::{ExceptionEntry, ExceptionTable};
use protovm::{Chunk, ChunkBuilder, HandlerKind, Op, Value, VmError};

use super::{eval_chunk, run_chunk};

fn sample_chunk() -> Chunk {
    // A function call plus a catch region, to cover nested chunks and the
    // exception table in one payload.
    let mut inner = ChunkBuilder::new();
    inner.emit_number(2.0);
    inner.emit_number(20.0);
    inner.emit(Op::Mul);
    inner.emit(Op::Return);

    let mut b = ChunkBuilder::new();
    let chunk = b.add_chunk(inner.finish().unwrap());
    let region = b.open_region(0);
    b.emit(Op::MakeClosure { chunk });
    b.emit(Op::LoadUndefined);
    b.emit(Op::Call { argc: 0 });
    b.emit_number(2.0);
    b.emit(Op::Add);
    b.emit(Op::Return);
    let handler = b.current_offset();
    b.close_catch(region, handler);
    b.emit(Op::Return);
    b.finish().unwrap()
}

#[test]
fn chunks_round_trip_through_json() {
    let chunk = sample_chunk();
    let json = serde_json::to_string(&chunk).unwrap();
    let restored: Chunk = serde_json::from_str(&json).unwrap();
    restored.validate().unwrap();
    assert_eq!(eval_chunk(restored), Value::Number(42.0));
}

#[test]
fn out_of_range_jump_is_rejected() {
    let chunk = Chunk {
        code: vec![Op::Jump { target: 99 }],
        ..Chunk::default()
    };
    assert!(matches!(
        chunk.validate(),
        Err(VmError::CorruptBytecode { .. })
    ));
}

#[test]
fn out_of_range_local_is_rejected() {
    let chunk = Chunk {
        code: vec![Op::LoadLocal { slot: 3 }],
        ..Chunk::default()
    };
    assert!(matches!(
        chunk.validate(),
        Err(VmError::CorruptBytecode { .. })
    ));
}

#[test]
fn enter_finally_must_reference_a_finally_entry() {
    let chunk = Chunk {
        code: vec![Op::EnterFinally { entry: 0 }, Op::EndFinally],
        exception_table: ExceptionTable {
            entries: vec![ExceptionEntry {
                start: 0,
                end: 1,
                handler: 1,
                handler_end: 0,
                kind: HandlerKind::Catch,
                stack_depth: 0,
            }],
        },
        ..Chunk::default()
    };
    assert!(matches!(
        chunk.validate(),
        Err(VmError::CorruptBytecode { .. })
    ));
}

#[test]
fn nested_chunks_are_validated_too() {
    let mut b = ChunkBuilder::new();
    let bad = b.add_chunk(Chunk {
        code: vec![Op::LoadLocal { slot: 7 }],
        ..Chunk::default()
    });
    b.emit(Op::MakeClosure { chunk: bad });
    b.emit(Op::Return);
    assert!(matches!(
        b.finish(),
        Err(VmError::CorruptBytecode { .. })
    ));
}

#[test]
fn stack_underflow_bypasses_catch_handlers() {
    // A corrupt chunk fault must not be observable by script handlers.
    let mut b = ChunkBuilder::new();
    let region = b.open_region(0);
    b.emit(Op::Pop);
    b.emit(Op::Return);
    let handler = b.current_offset();
    b.close_catch(region, handler);
    b.emit_str("caught");
    b.emit(Op::Return);
    let err = run_chunk(b.finish().unwrap()).unwrap_err();
    assert!(matches!(err, VmError::CorruptBytecode { .. }));
}
