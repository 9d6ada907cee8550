//! Bytecode contract consumed from the compiler.
//!
//! A [`Chunk`] is an ordered opcode stream plus a constant pool, a static
//! exception table, and a locals-slot count. The interpreter trusts a
//! validated chunk to be well-formed; [`Chunk::validate`] bounds-checks
//! everything up front so malformed input fails abstractly instead of
//! corrupting interpreter state.
//!
//! The instruction set is a stack design: opcodes pop operands from and
//! push results onto the activation's operand stack.

use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::VmError;
use crate::value::Str;

/// Constant pool index (0-65535).
pub type ConstIndex = u16;

/// Locals slot index.
pub type LocalSlot = u16;

/// Jump target (instruction offset).
pub type JumpTarget = u32;

/// Bytecode instruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Op {
    // ═══════════════════════════════════════════════════════════════════════════
    // Constants & Operand Stack
    // ═══════════════════════════════════════════════════════════════════════════
    /// Push constant: push(constants[idx])
    LoadConst { idx: ConstIndex },

    /// Push undefined
    LoadUndefined,

    /// Push null
    LoadNull,

    /// Push boolean
    LoadBool { value: bool },

    /// Push small integer without touching the constant pool
    LoadInt { value: i32 },

    /// Discard the top of the operand stack
    Pop,

    /// Duplicate the top of the operand stack
    Dup,

    // ═══════════════════════════════════════════════════════════════════════════
    // Locals
    // ═══════════════════════════════════════════════════════════════════════════
    /// Push locals[slot]
    LoadLocal { slot: LocalSlot },

    /// locals[slot] = pop()
    StoreLocal { slot: LocalSlot },

    // ═══════════════════════════════════════════════════════════════════════════
    // Arithmetic & Comparison
    //
    // Coercion rules (numeric promotion, string concatenation, abstract
    // equality) are the object model's standard ladder; the loop only
    // guarantees operand order and stack depth.
    // ═══════════════════════════════════════════════════════════════════════════
    /// b = pop(), a = pop(), push(a + b)
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    /// push(-pop())
    Neg,
    /// push(!truthy(pop()))
    Not,
    /// Abstract equality
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    /// push(typeof pop())
    TypeOf,

    // ═══════════════════════════════════════════════════════════════════════════
    // Control Flow
    // ═══════════════════════════════════════════════════════════════════════════
    /// Unconditional jump
    Jump { target: JumpTarget },

    /// Jump if pop() is truthy
    JumpIfTrue { target: JumpTarget },

    /// Jump if pop() is falsy
    JumpIfFalse { target: JumpTarget },

    /// Labeled break: leave every `finally` and scope region between here
    /// and `target` through the exception-table machinery
    Break { target: JumpTarget },

    /// Labeled continue: same unwinding discipline as `Break`
    Continue { target: JumpTarget },

    // ═══════════════════════════════════════════════════════════════════════════
    // Identifier Access (scope chain)
    // ═══════════════════════════════════════════════════════════════════════════
    /// Declare a binding in the innermost scope: scope.put(name, pop())
    DeclareName { name: ConstIndex },

    /// Resolve an identifier innermost-first: push(scope_chain[name])
    LoadName { name: ConstIndex },

    /// Assign through the chain to wherever the binding lives
    StoreName { name: ConstIndex },

    // ═══════════════════════════════════════════════════════════════════════════
    // Scope Management
    // ═══════════════════════════════════════════════════════════════════════════
    /// Push a block scope
    PushScope,

    /// Push a catch scope (binding declared by the handler prologue)
    PushCatchScope,

    /// Splice a `with` scope whose backing bag is pop()
    EnterWith,

    /// Unlink the innermost scope (normal exit; non-local exits go through
    /// the exception table's `ScopeExit` entries)
    PopScope,

    // ═══════════════════════════════════════════════════════════════════════════
    // Property Access
    // ═══════════════════════════════════════════════════════════════════════════
    /// push(new empty object)
    NewObject,

    /// obj = pop(), push(obj.name)
    GetProp { name: ConstIndex },

    /// value = pop(), obj = pop(), obj.name = value
    SetProp { name: ConstIndex },

    /// key = pop(), obj = pop(), push(obj[key])
    GetIndex,

    /// value = pop(), key = pop(), obj = pop(), obj[key] = value
    SetIndex,

    /// obj = pop(), push(delete obj.name)
    DeleteProp { name: ConstIndex },

    /// obj = pop(), key = pop(), push(key in obj)
    HasProp,

    // ═══════════════════════════════════════════════════════════════════════════
    // Calls
    // ═══════════════════════════════════════════════════════════════════════════
    /// Stack: callee, this, arg0..argN → push(result)
    Call { argc: u8 },

    /// Stack: obj, arg0..argN → push(obj.name(args)), `this` = obj
    CallMethod { name: ConstIndex, argc: u8 },

    /// Stack: callee, arg0..argN → push(new callee(args))
    Construct { argc: u8 },

    /// Return pop() from the activation, running intervening `finally`
    /// blocks first
    Return,

    /// Return undefined
    ReturnUndefined,

    /// push(closure over constants[chunk] capturing the current scope)
    MakeClosure { chunk: ConstIndex },

    /// push(this)
    LoadThis,

    /// push(arguments object), materialized lazily (non-strict only)
    LoadArguments,

    // ═══════════════════════════════════════════════════════════════════════════
    // Exception Handling
    // ═══════════════════════════════════════════════════════════════════════════
    /// throw pop()
    Throw,

    /// Normal-completion entry into the finally block of exception-table
    /// entry `entry`: records a Normal pending action and jumps to the
    /// handler
    EnterFinally { entry: u16 },

    /// End of a finally body: replay the pending action recorded when the
    /// block was entered, unless the block overrode it
    EndFinally,

    // ═══════════════════════════════════════════════════════════════════════════
    // Generators & Iteration
    // ═══════════════════════════════════════════════════════════════════════════
    /// Suspend the activation, yielding pop() to the resumer; on resume the
    /// value passed to next() is pushed
    Yield,

    /// Begin `yield*` delegation to the iterator pop()
    YieldDelegate,

    /// obj = pop(); push obj if it satisfies the iterator capability
    GetIter,

    /// iter = pop(), push(iter.next())
    IterNext,

    /// result = pop(), push(result.value)
    IterValue,

    /// result = pop(), push(result.done as boolean)
    IterDone,

    /// No operation (alignment/patching)
    Nop,
}

/// Handler kind for an exception-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlerKind {
    /// Deliver the thrown value at `handler` with the operand stack
    /// truncated to `stack_depth`.
    Catch,
    /// Run the handler, replaying the interrupted completion afterwards.
    Finally,
    /// Zero-cost scope teardown: unwinding through this range pops one
    /// scope link. No handler code runs.
    ScopeExit,
}

/// One static exception-table entry covering `[start, end)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionEntry {
    pub start: JumpTarget,
    pub end: JumpTarget,
    pub handler: JumpTarget,
    /// End of the handler block; used to detect completions that override
    /// a pending action from inside a `finally` body. Zero for `ScopeExit`.
    pub handler_end: JumpTarget,
    pub kind: HandlerKind,
    /// Operand-stack depth to restore before entering the handler.
    pub stack_depth: u32,
}

impl ExceptionEntry {
    pub fn covers(&self, pc: usize) -> bool {
        (self.start as usize) <= pc && pc < (self.end as usize)
    }

    pub fn handler_covers(&self, pc: usize) -> bool {
        (self.handler as usize) <= pc && pc < (self.handler_end as usize)
    }
}

/// Static, per-function exception table. Entries for the same region are
/// ordered innermost-first; on unwind the first covering entry wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExceptionTable {
    pub entries: Vec<ExceptionEntry>,
}

impl ExceptionTable {
    /// Entries covering `pc`, innermost-first.
    pub fn covering(&self, pc: usize) -> impl Iterator<Item = (usize, &ExceptionEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter(move |(_, e)| e.covers(pc))
    }

    pub fn get(&self, index: usize) -> Option<&ExceptionEntry> {
        self.entries.get(index)
    }
}

/// Constants that can live in the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Constant {
    Str(Str),
    Number(f64),
    /// Nested chunk for a function literal.
    Chunk(Rc<Chunk>),
}

/// Function metadata carried on a chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub name: Option<Str>,
    pub param_count: usize,
    pub is_generator: bool,
    /// Strict functions never materialize the aliased `arguments` object.
    pub strict: bool,
}

/// Source line table entry (raw data for external trace formatting).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LineEntry {
    pub offset: u32,
    pub line: u32,
}

/// A compiled chunk of bytecode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Chunk {
    pub code: Vec<Op>,
    pub constants: Vec<Constant>,
    pub exception_table: ExceptionTable,
    /// Number of locals slots (parameters first).
    pub local_count: LocalSlot,
    /// Instruction offset → source line, ascending by offset.
    pub lines: Vec<LineEntry>,
    pub info: FunctionInfo,
}

impl Chunk {
    pub fn get(&self, pc: usize) -> Option<&Op> {
        self.code.get(pc)
    }

    pub fn constant(&self, idx: ConstIndex) -> Option<&Constant> {
        self.constants.get(idx as usize)
    }

    pub fn name_constant(&self, idx: ConstIndex) -> Result<Str, VmError> {
        match self.constant(idx) {
            Some(Constant::Str(s)) => Ok(s.clone()),
            _ => Err(VmError::corrupt("invalid name constant index")),
        }
    }

    /// Source line for a bytecode offset, if the compiler supplied one.
    pub fn line_for(&self, pc: usize) -> Option<u32> {
        let idx = self.lines.partition_point(|e| (e.offset as usize) <= pc);
        idx.checked_sub(1)
            .and_then(|i| self.lines.get(i))
            .map(|e| e.line)
    }

    /// Bounds-check the whole chunk, recursing into nested chunks.
    ///
    /// A validated chunk can still loop forever or compute garbage, but it
    /// can never index out of range at dispatch time.
    pub fn validate(&self) -> Result<(), VmError> {
        let len = self.code.len();
        let check_target = |target: JumpTarget, what: &str| {
            if target as usize > len {
                Err(VmError::corrupt(format!("{what} target {target} out of range")))
            } else {
                Ok(())
            }
        };
        for op in &self.code {
            match op {
                Op::Jump { target }
                | Op::JumpIfTrue { target }
                | Op::JumpIfFalse { target }
                | Op::Break { target }
                | Op::Continue { target } => check_target(*target, "jump")?,
                Op::LoadLocal { slot } | Op::StoreLocal { slot } => {
                    if *slot >= self.local_count {
                        return Err(VmError::corrupt(format!("local slot {slot} out of range")));
                    }
                }
                Op::LoadConst { idx } => {
                    if self.constant(*idx).is_none() {
                        return Err(VmError::corrupt(format!("constant {idx} out of range")));
                    }
                }
                Op::DeclareName { name }
                | Op::LoadName { name }
                | Op::StoreName { name }
                | Op::GetProp { name }
                | Op::SetProp { name }
                | Op::DeleteProp { name }
                | Op::CallMethod { name, .. } => {
                    self.name_constant(*name)?;
                }
                Op::MakeClosure { chunk } => match self.constant(*chunk) {
                    Some(Constant::Chunk(_)) => {}
                    _ => return Err(VmError::corrupt("MakeClosure constant is not a chunk")),
                },
                Op::EnterFinally { entry } => match self.exception_table.get(*entry as usize) {
                    Some(e) if e.kind == HandlerKind::Finally => {}
                    _ => {
                        return Err(VmError::corrupt(
                            "EnterFinally does not reference a Finally entry",
                        ))
                    }
                },
                _ => {}
            }
        }
        for entry in &self.exception_table.entries {
            check_target(entry.start, "exception range")?;
            check_target(entry.end, "exception range")?;
            check_target(entry.handler, "handler")?;
            check_target(entry.handler_end, "handler")?;
            if entry.start > entry.end {
                return Err(VmError::corrupt("inverted exception range"));
            }
        }
        for constant in &self.constants {
            if let Constant::Chunk(nested) = constant {
                nested.validate()?;
            }
        }
        Ok(())
    }
}
