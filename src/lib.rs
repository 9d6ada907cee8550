//! A suspendable bytecode interpreter core for a small prototype-based
//! scripting language.
//!
//! The crate takes compiled [`bytecode::Chunk`]s (produced out-of-process
//! or with the in-crate [`builder::ChunkBuilder`]) and executes them with:
//!
//! - a stack-machine dispatch loop with per-activation operand stacks and
//!   locals;
//! - scope-chain identifier resolution, including `with` and catch scopes;
//! - static exception-table unwinding where `throw`, `return`, `break`,
//!   and `continue` all route through the same table walk, and `finally`
//!   blocks replay the completion they interrupted;
//! - first-class generator objects that detach their frame at `yield` and
//!   support `next`/`return`/`throw` resumption and `yield*` delegation.
//!
//! ```
//! use std::rc::Rc;
//! use protovm::{ChunkBuilder, Interpreter, Op, Value};
//!
//! let mut b = ChunkBuilder::new();
//! b.emit_number(2.0);
//! b.emit_number(3.0);
//! b.emit(Op::Add);
//! b.emit(Op::Return);
//! let chunk = b.finish().unwrap();
//!
//! let mut interp = Interpreter::new();
//! let result = interp.run(Rc::new(chunk)).unwrap();
//! assert_eq!(result, Value::Number(5.0));
//! ```

pub mod builder;
pub mod bytecode;
pub mod error;
pub mod interpreter;
pub mod value;

pub use builder::{ChunkBuilder, JumpPlaceholder, OpenRegion};
pub use bytecode::{Chunk, ExceptionEntry, ExceptionTable, FunctionInfo, HandlerKind, Op};
pub use error::{GeneratorFault, VmError};
pub use interpreter::frame::{FrameDump, ResumeMode};
pub use interpreter::generator::{GeneratorState, GeneratorStatus};
pub use interpreter::{EngineOptions, Interpreter, InterruptHandle};
pub use value::{Callable, IteratorLike, Object, PropertyBag, PropertyKey, Str, Value};
