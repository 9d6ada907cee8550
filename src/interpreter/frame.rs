//! Call frames: one activation of a bytecode function.
//!
//! A frame owns its operand stack, locals array, scope-chain head, and the
//! pending-action stack used to replay completions interrupted by `finally`
//! blocks. Frames are plain owned values, so a generator can detach its
//! frame at a `yield` and hand it back to the dispatch loop on resume.

use std::cell::RefCell;
use std::rc::Rc;

use crate::bytecode::{Chunk, LocalSlot};
use crate::error::VmError;
use crate::interpreter::scope::ScopeRef;
use crate::value::{CheapClone, ObjRef, Str, Value};

/// A completion interrupted by a `finally` block, recorded for replay at
/// the matching `EndFinally`.
#[derive(Debug)]
pub enum PendingAction {
    /// The block was entered on the normal path; nothing to replay.
    Normal,
    Return(Value),
    Throw(VmError),
    Break { target: usize },
    Continue { target: usize },
}

/// One pending-action record, tagged with the pc range of the `finally`
/// handler it belongs to. A completion that leaves the handler range
/// before `EndFinally` runs overrides the record.
#[derive(Debug)]
pub struct PendingEntry {
    pub action: PendingAction,
    pub handler: usize,
    pub handler_end: usize,
}

impl PendingEntry {
    pub fn handler_covers(&self, pc: usize) -> bool {
        self.handler <= pc && pc < self.handler_end
    }
}

/// How a suspended generator frame is being resumed.
#[derive(Debug)]
pub enum ResumeMode {
    /// `next(v)`: push `v` as the value of the suspended `yield`.
    Next(Value),
    /// `return(v)`: run the return machinery at the suspension point so
    /// intervening `finally` blocks observe the completion.
    Return(Value),
    /// `throw(v)`: raise `v` at the suspension point.
    Throw(Value),
}

/// One activation of a bytecode function.
pub struct CallFrame {
    pub chunk: Rc<Chunk>,
    pub pc: usize,
    /// Locals array, parameters first. Reference-counted so a materialized
    /// `arguments` object can alias the same backing store.
    pub locals: Rc<RefCell<Vec<Value>>>,
    pub stack: Vec<Value>,
    pub scope: ScopeRef,
    pub this: Value,
    /// Argument count at call time; the aliased window of `arguments`.
    pub argc: usize,
    /// Lazily materialized `arguments` object.
    pub arguments: Option<ObjRef>,
    /// Pending-action stack, one entry per `finally` handler currently on
    /// the replay path.
    pub pending: Vec<PendingEntry>,
    /// Injected resumption, consumed by the dispatch loop before the next
    /// fetch. Only ever set on suspended generator frames.
    pub resume: Option<ResumeMode>,
    /// Set while the owning generator is being closed; a `yield` under
    /// this flag is a protocol fault.
    pub closing: bool,
}

impl CallFrame {
    pub fn new(chunk: Rc<Chunk>, scope: ScopeRef, this: Value, args: &[Value]) -> CallFrame {
        let slots = (chunk.local_count as usize).max(args.len());
        let mut locals = vec![Value::Undefined; slots];
        locals[..args.len()].clone_from_slice(args);
        CallFrame {
            chunk,
            pc: 0,
            locals: Rc::new(RefCell::new(locals)),
            stack: Vec::new(),
            scope,
            this,
            argc: args.len(),
            arguments: None,
            pending: Vec::new(),
            resume: None,
            closing: false,
        }
    }

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Result<Value, VmError> {
        self.stack
            .pop()
            .ok_or_else(|| VmError::corrupt("operand stack underflow"))
    }

    /// Pop `n` values, preserving push order.
    pub fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, VmError> {
        if self.stack.len() < n {
            return Err(VmError::corrupt("operand stack underflow"));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    pub fn peek(&self) -> Result<&Value, VmError> {
        self.stack
            .last()
            .ok_or_else(|| VmError::corrupt("operand stack underflow"))
    }

    /// Truncate the operand stack to an exception-table entry's recorded
    /// depth before entering its handler.
    pub fn truncate_stack(&mut self, depth: u32) {
        self.stack.truncate(depth as usize);
    }

    pub fn load_local(&self, slot: LocalSlot) -> Value {
        self.locals
            .borrow()
            .get(slot as usize)
            .cloned()
            .unwrap_or(Value::Undefined)
    }

    pub fn store_local(&mut self, slot: LocalSlot, value: Value) {
        if let Some(cell) = self.locals.borrow_mut().get_mut(slot as usize) {
            *cell = value;
        }
    }

    /// The pc of the instruction currently being executed. The loop
    /// advances `pc` at fetch time, so faults attribute to `pc - 1`.
    pub fn current_pc(&self) -> usize {
        self.pc.saturating_sub(1)
    }

    /// Diagnostic snapshot of this activation.
    pub fn dump(&self) -> FrameDump {
        FrameDump {
            function_name: self.chunk.info.name.as_ref().map(CheapClone::cheap_clone),
            pc: self.current_pc(),
            line: self.chunk.line_for(self.current_pc()),
            locals: self.locals.borrow().clone(),
        }
    }
}

/// A point-in-time view of a frame for host diagnostics: name, source
/// position, and a copy of the locals.
#[derive(Debug)]
pub struct FrameDump {
    pub function_name: Option<Str>,
    pub pc: usize,
    pub line: Option<u32>,
    pub locals: Vec<Value>,
}
