//! The dispatch loop and the exception-table machinery.
//!
//! Every non-local transfer (`throw`, `return`, `break`, `continue`) routes
//! through the same table walk: entries covering the faulting pc are
//! consulted innermost-first, `ScopeExit` ranges unlink one scope each,
//! `Finally` handlers capture the in-flight completion on the frame's
//! pending stack, and `Catch` handlers terminate the walk for catchable
//! errors. `EndFinally` replays the captured completion, which re-enters
//! the same walk at the handler's pc and so naturally reaches the next
//! enclosing entry.

use tracing::trace;

use crate::bytecode::{Constant, HandlerKind, Op};
use crate::error::{GeneratorFault, VmError};
use crate::interpreter::frame::{CallFrame, PendingAction, PendingEntry, ResumeMode};
use crate::interpreter::scope::{self, Scope, ScopeKind};
use crate::interpreter::Interpreter;
use crate::value::{
    iter_result_parts, BytecodeFn, CheapClone, Exotic, IteratorLike, Object, PropertyKey, Str,
    Value,
};

/// How a frame's run concluded.
pub(crate) enum FrameExit {
    Return(Value),
    /// Generator suspension carrying the yielded value.
    Yield(Value),
    /// Begin `yield*` delegation to the carried iterator value.
    Delegate(Value),
}

enum Flow {
    Next,
    Exit(FrameExit),
}

impl Interpreter {
    /// Run a frame until it returns, suspends, or faults.
    pub(crate) fn run_frame(&mut self, frame: &mut CallFrame) -> Result<FrameExit, VmError> {
        if let Some(mode) = frame.resume.take() {
            // Errors coming out of apply_resume have already been offered
            // to this frame's handlers; they propagate as-is.
            if let Some(exit) = self.apply_resume(frame, mode)? {
                return Ok(exit);
            }
        }
        loop {
            let Some(op) = frame.chunk.get(frame.pc) else {
                return Ok(FrameExit::Return(Value::Undefined));
            };
            let op = op.clone();
            frame.pc += 1;
            match self.execute_op(frame, op) {
                Ok(Flow::Next) => {}
                Ok(Flow::Exit(exit)) => return Ok(exit),
                Err(err) => self.raise(frame, err)?,
            }
        }
    }

    /// Consume an injected resumption at a suspension point.
    fn apply_resume(
        &mut self,
        frame: &mut CallFrame,
        mode: ResumeMode,
    ) -> Result<Option<FrameExit>, VmError> {
        match mode {
            ResumeMode::Next(value) => {
                frame.push(value);
                Ok(None)
            }
            ResumeMode::Return(value) => match self.complete_return(frame, value)? {
                Flow::Next => Ok(None),
                Flow::Exit(exit) => Ok(Some(exit)),
            },
            ResumeMode::Throw(value) => {
                self.raise(frame, VmError::thrown(value))?;
                Ok(None)
            }
        }
    }

    fn execute_op(&mut self, frame: &mut CallFrame, op: Op) -> Result<Flow, VmError> {
        let chunk = frame.chunk.cheap_clone();
        match op {
            Op::LoadConst { idx } => {
                let value = match chunk.constant(idx) {
                    Some(Constant::Str(s)) => Value::Str(s.cheap_clone()),
                    Some(Constant::Number(n)) => Value::Number(*n),
                    Some(Constant::Chunk(_)) => {
                        return Err(VmError::corrupt("chunk constant loaded as value"))
                    }
                    None => return Err(VmError::corrupt("constant index out of range")),
                };
                frame.push(value);
            }
            Op::LoadUndefined => frame.push(Value::Undefined),
            Op::LoadNull => frame.push(Value::Null),
            Op::LoadBool { value } => frame.push(Value::Bool(value)),
            Op::LoadInt { value } => frame.push(Value::Number(value as f64)),
            Op::Pop => {
                frame.pop()?;
            }
            Op::Dup => {
                let top = frame.peek()?.clone();
                frame.push(top);
            }

            Op::LoadLocal { slot } => {
                let value = frame.load_local(slot);
                frame.push(value);
            }
            Op::StoreLocal { slot } => {
                let value = frame.pop()?;
                frame.store_local(slot, value);
            }

            Op::Add => {
                let b = frame.pop()?;
                let a = frame.pop()?;
                frame.push(add_values(&a, &b));
            }
            Op::Sub => self.binary_numeric(frame, |a, b| a - b)?,
            Op::Mul => self.binary_numeric(frame, |a, b| a * b)?,
            Op::Div => self.binary_numeric(frame, |a, b| a / b)?,
            Op::Mod => self.binary_numeric(frame, |a, b| a % b)?,
            Op::Neg => {
                let value = frame.pop()?;
                frame.push(Value::Number(-value.to_number()));
            }
            Op::Not => {
                let value = frame.pop()?;
                frame.push(Value::Bool(!value.truthy()));
            }
            Op::Eq => self.binary_compare(frame, |a, b| a.loose_equals(b))?,
            Op::NotEq => self.binary_compare(frame, |a, b| !a.loose_equals(b))?,
            Op::StrictEq => self.binary_compare(frame, |a, b| a.strict_equals(b))?,
            Op::StrictNotEq => self.binary_compare(frame, |a, b| !a.strict_equals(b))?,
            Op::Lt => self.binary_compare(frame, |a, b| {
                relational_cmp(a, b) == Some(std::cmp::Ordering::Less)
            })?,
            Op::LtEq => self.binary_compare(frame, |a, b| {
                matches!(
                    relational_cmp(a, b),
                    Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
                )
            })?,
            Op::Gt => self.binary_compare(frame, |a, b| {
                relational_cmp(a, b) == Some(std::cmp::Ordering::Greater)
            })?,
            Op::GtEq => self.binary_compare(frame, |a, b| {
                matches!(
                    relational_cmp(a, b),
                    Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
                )
            })?,
            Op::TypeOf => {
                let value = frame.pop()?;
                frame.push(Value::Str(Str::from(value.type_name())));
            }

            Op::Jump { target } => {
                if (target as usize) <= frame.current_pc() {
                    self.check_interrupt()?;
                }
                frame.pc = target as usize;
            }
            Op::JumpIfTrue { target } => {
                let value = frame.pop()?;
                if value.truthy() {
                    if (target as usize) <= frame.current_pc() {
                        self.check_interrupt()?;
                    }
                    frame.pc = target as usize;
                }
            }
            Op::JumpIfFalse { target } => {
                let value = frame.pop()?;
                if !value.truthy() {
                    if (target as usize) <= frame.current_pc() {
                        self.check_interrupt()?;
                    }
                    frame.pc = target as usize;
                }
            }
            Op::Break { target } => {
                if (target as usize) <= frame.current_pc() {
                    self.check_interrupt()?;
                }
                return self.complete_transfer(frame, target as usize, false);
            }
            Op::Continue { target } => {
                if (target as usize) <= frame.current_pc() {
                    self.check_interrupt()?;
                }
                return self.complete_transfer(frame, target as usize, true);
            }

            Op::DeclareName { name } => {
                let name = chunk.name_constant(name)?;
                let value = frame.pop()?;
                scope::declare(&frame.scope, name, value);
            }
            Op::LoadName { name } => {
                let name = chunk.name_constant(name)?;
                let value = scope::lookup(&frame.scope, &name)?;
                frame.push(value);
            }
            Op::StoreName { name } => {
                let name = chunk.name_constant(name)?;
                let value = frame.pop()?;
                scope::assign(&frame.scope, &name, value);
            }

            Op::PushScope => {
                frame.scope = Scope::push(ScopeKind::Block, &frame.scope);
            }
            Op::PushCatchScope => {
                frame.scope = Scope::push(ScopeKind::Catch, &frame.scope);
            }
            Op::EnterWith => {
                let target = frame.pop()?;
                let Value::Object(obj) = target else {
                    return Err(VmError::type_error(format!(
                        "cannot use {} as a with target",
                        target.type_name()
                    )));
                };
                frame.scope = Scope::push_with(obj, &frame.scope);
            }
            Op::PopScope => pop_scope(frame)?,

            Op::NewObject => {
                frame.push(Value::Object(Object::new().into_ref()));
            }
            Op::GetProp { name } => {
                let name = chunk.name_constant(name)?;
                let target = frame.pop()?;
                let value = self.get_property(&target, &PropertyKey::Str(name))?;
                frame.push(value);
            }
            Op::SetProp { name } => {
                let name = chunk.name_constant(name)?;
                let value = frame.pop()?;
                let target = frame.pop()?;
                self.set_property(&target, PropertyKey::Str(name), value)?;
            }
            Op::GetIndex => {
                let key = frame.pop()?;
                let target = frame.pop()?;
                let value = self.get_property(&target, &PropertyKey::from_value(&key))?;
                frame.push(value);
            }
            Op::SetIndex => {
                let value = frame.pop()?;
                let key = frame.pop()?;
                let target = frame.pop()?;
                self.set_property(&target, PropertyKey::from_value(&key), value)?;
            }
            Op::DeleteProp { name } => {
                let name = chunk.name_constant(name)?;
                let target = frame.pop()?;
                let deleted = match target {
                    Value::Object(obj) => {
                        use crate::value::PropertyBag;
                        obj.borrow_mut().delete(&PropertyKey::Str(name))
                    }
                    _ => true,
                };
                frame.push(Value::Bool(deleted));
            }
            Op::HasProp => {
                let target = frame.pop()?;
                let key = frame.pop()?;
                let Value::Object(obj) = target else {
                    return Err(VmError::type_error(format!(
                        "cannot use 'in' on {}",
                        target.type_name()
                    )));
                };
                use crate::value::PropertyBag;
                let found = obj.borrow().has(&PropertyKey::from_value(&key));
                frame.push(Value::Bool(found));
            }

            Op::Call { argc } => {
                self.check_interrupt()?;
                let args = frame.pop_n(argc as usize)?;
                let this = frame.pop()?;
                let callee = frame.pop()?;
                let result = self.call_value(callee, this, &args)?;
                frame.push(result);
            }
            Op::CallMethod { name, argc } => {
                self.check_interrupt()?;
                let name = chunk.name_constant(name)?;
                let args = frame.pop_n(argc as usize)?;
                let receiver = frame.pop()?;
                let method = self.get_property(&receiver, &PropertyKey::Str(name.cheap_clone()))?;
                if !method.is_callable() {
                    return Err(VmError::type_error(format!("{name} is not a function")));
                }
                let result = self.call_value(method, receiver, &args)?;
                frame.push(result);
            }
            Op::Construct { argc } => {
                self.check_interrupt()?;
                let args = frame.pop_n(argc as usize)?;
                let callee = frame.pop()?;
                let result = self.construct(callee, &args)?;
                frame.push(result);
            }
            Op::Return => {
                let value = frame.pop()?;
                return self.complete_return(frame, value);
            }
            Op::ReturnUndefined => {
                return self.complete_return(frame, Value::Undefined);
            }
            Op::MakeClosure { chunk: idx } => {
                let Some(Constant::Chunk(nested)) = chunk.constant(idx) else {
                    return Err(VmError::corrupt("MakeClosure constant is not a chunk"));
                };
                let function = self.make_function(BytecodeFn {
                    chunk: nested.cheap_clone(),
                    closure: Some(frame.scope.cheap_clone()),
                });
                frame.push(function);
            }
            Op::LoadThis => {
                let this = frame.this.clone();
                frame.push(this);
            }
            Op::LoadArguments => {
                if chunk.info.strict {
                    return Err(VmError::type_error(
                        "arguments object is not available in strict functions",
                    ));
                }
                if frame.arguments.is_none() {
                    use crate::value::PropertyBag;
                    let mut obj = Object::new();
                    obj.exotic = Exotic::Arguments {
                        slots: frame.locals.cheap_clone(),
                        len: frame.argc,
                    };
                    obj.put(
                        PropertyKey::from("length"),
                        Value::Number(frame.argc as f64),
                    );
                    frame.arguments = Some(obj.into_ref());
                }
                if let Some(args) = &frame.arguments {
                    frame.push(Value::Object(args.cheap_clone()));
                }
            }

            Op::Throw => {
                let value = frame.pop()?;
                return Err(VmError::thrown(value));
            }
            Op::EnterFinally { entry } => {
                let Some(entry) = chunk.exception_table.get(entry as usize) else {
                    return Err(VmError::corrupt("finally entry index out of range"));
                };
                frame.pending.push(PendingEntry {
                    action: PendingAction::Normal,
                    handler: entry.handler as usize,
                    handler_end: entry.handler_end as usize,
                });
                frame.pc = entry.handler as usize;
            }
            Op::EndFinally => {
                let Some(pending) = frame.pending.pop() else {
                    return Err(VmError::corrupt("EndFinally without a pending action"));
                };
                match pending.action {
                    PendingAction::Normal => {}
                    PendingAction::Return(value) => return self.complete_return(frame, value),
                    PendingAction::Throw(err) => return Err(err),
                    PendingAction::Break { target } => {
                        return self.complete_transfer(frame, target, false)
                    }
                    PendingAction::Continue { target } => {
                        return self.complete_transfer(frame, target, true)
                    }
                }
            }

            Op::Yield => {
                if !chunk.info.is_generator {
                    return Err(VmError::corrupt("yield outside a generator function"));
                }
                if frame.closing {
                    return Err(GeneratorFault::YieldFromClosing.into());
                }
                let value = frame.pop()?;
                return Ok(Flow::Exit(FrameExit::Yield(value)));
            }
            Op::YieldDelegate => {
                if !chunk.info.is_generator {
                    return Err(VmError::corrupt("yield outside a generator function"));
                }
                if frame.closing {
                    return Err(GeneratorFault::YieldFromClosing.into());
                }
                let value = frame.pop()?;
                if IteratorLike::from_value(&value).is_none() {
                    return Err(VmError::type_error("value is not iterable"));
                }
                return Ok(Flow::Exit(FrameExit::Delegate(value)));
            }
            Op::GetIter => {
                let value = frame.pop()?;
                if IteratorLike::from_value(&value).is_none() {
                    return Err(VmError::type_error("value is not iterable"));
                }
                frame.push(value);
            }
            Op::IterNext => {
                let iter = frame.pop()?;
                let Some(it) = IteratorLike::from_value(&iter) else {
                    return Err(VmError::type_error("value is not iterable"));
                };
                let result = self.call_value(it.next, Value::Object(it.target), &[])?;
                frame.push(result);
            }
            Op::IterValue => {
                let result = frame.pop()?;
                frame.push(iter_result_parts(&result).0);
            }
            Op::IterDone => {
                let result = frame.pop()?;
                frame.push(Value::Bool(iter_result_parts(&result).1));
            }
            Op::Nop => {}
        }
        Ok(Flow::Next)
    }

    fn binary_numeric(
        &mut self,
        frame: &mut CallFrame,
        op: fn(f64, f64) -> f64,
    ) -> Result<(), VmError> {
        let b = frame.pop()?;
        let a = frame.pop()?;
        frame.push(Value::Number(op(a.to_number(), b.to_number())));
        Ok(())
    }

    fn binary_compare(
        &mut self,
        frame: &mut CallFrame,
        op: fn(&Value, &Value) -> bool,
    ) -> Result<(), VmError> {
        let b = frame.pop()?;
        let a = frame.pop()?;
        frame.push(Value::Bool(op(&a, &b)));
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Table-driven unwinding
    // ═══════════════════════════════════════════════════════════════════════════

    /// Unwind an error from the faulting pc. Returns `Ok(())` when a handler
    /// in this frame took over, `Err` when the error leaves the frame.
    pub(crate) fn raise(&mut self, frame: &mut CallFrame, err: VmError) -> Result<(), VmError> {
        if !err.runs_finally() {
            return Err(err);
        }
        let at = frame.current_pc();
        let catchable = err.is_catchable();
        trace!(pc = at, catchable, error = %err, "unwinding");
        let chunk = frame.chunk.cheap_clone();
        for (_, entry) in chunk.exception_table.covering(at) {
            match entry.kind {
                HandlerKind::ScopeExit => pop_scope(frame)?,
                HandlerKind::Catch if catchable => {
                    discard_pending(frame, at, Some(entry.handler as usize));
                    frame.truncate_stack(entry.stack_depth);
                    frame.push(err.to_value());
                    frame.pc = entry.handler as usize;
                    return Ok(());
                }
                HandlerKind::Catch => {}
                HandlerKind::Finally => {
                    discard_pending(frame, at, Some(entry.handler as usize));
                    frame.truncate_stack(entry.stack_depth);
                    frame.pending.push(PendingEntry {
                        action: PendingAction::Throw(err),
                        handler: entry.handler as usize,
                        handler_end: entry.handler_end as usize,
                    });
                    frame.pc = entry.handler as usize;
                    return Ok(());
                }
            }
        }
        discard_pending(frame, at, None);
        Err(err)
    }

    /// Route a `return` completion through intervening `finally` blocks and
    /// scope-teardown ranges.
    fn complete_return(&mut self, frame: &mut CallFrame, value: Value) -> Result<Flow, VmError> {
        let at = frame.current_pc();
        let chunk = frame.chunk.cheap_clone();
        for (_, entry) in chunk.exception_table.covering(at) {
            match entry.kind {
                HandlerKind::ScopeExit => pop_scope(frame)?,
                HandlerKind::Catch => {}
                HandlerKind::Finally => {
                    discard_pending(frame, at, Some(entry.handler as usize));
                    frame.truncate_stack(entry.stack_depth);
                    frame.pending.push(PendingEntry {
                        action: PendingAction::Return(value),
                        handler: entry.handler as usize,
                        handler_end: entry.handler_end as usize,
                    });
                    frame.pc = entry.handler as usize;
                    return Ok(Flow::Next);
                }
            }
        }
        discard_pending(frame, at, None);
        Ok(Flow::Exit(FrameExit::Return(value)))
    }

    /// Route a `break`/`continue` to `target`, honoring every `finally` and
    /// scope-teardown range between here and there. Regions containing both
    /// ends are not being left and are skipped.
    fn complete_transfer(
        &mut self,
        frame: &mut CallFrame,
        target: usize,
        is_continue: bool,
    ) -> Result<Flow, VmError> {
        let at = frame.current_pc();
        let chunk = frame.chunk.cheap_clone();
        for (_, entry) in chunk.exception_table.covering(at) {
            if entry.covers(target) {
                continue;
            }
            match entry.kind {
                HandlerKind::ScopeExit => pop_scope(frame)?,
                HandlerKind::Catch => {}
                HandlerKind::Finally => {
                    discard_pending(frame, at, Some(entry.handler as usize));
                    frame.truncate_stack(entry.stack_depth);
                    let action = if is_continue {
                        PendingAction::Continue { target }
                    } else {
                        PendingAction::Break { target }
                    };
                    frame.pending.push(PendingEntry {
                        action,
                        handler: entry.handler as usize,
                        handler_end: entry.handler_end as usize,
                    });
                    frame.pc = entry.handler as usize;
                    return Ok(Flow::Next);
                }
            }
        }
        discard_pending(frame, at, Some(target));
        frame.pc = target;
        Ok(Flow::Next)
    }
}

/// Unlink the innermost scope.
fn pop_scope(frame: &mut CallFrame) -> Result<(), VmError> {
    match frame.scope.parent.as_ref() {
        Some(parent) => {
            frame.scope = parent.cheap_clone();
            Ok(())
        }
        None => Err(VmError::corrupt("scope chain underflow")),
    }
}

/// Drop pending records for `finally` handlers that `destination` leaves.
///
/// A completion that exits a handler range overrides the action recorded
/// when that handler was entered: the later completion wins. A destination
/// still inside the range (a `catch` within the `finally` body, a local
/// jump) keeps the record alive. `None` means the completion leaves the
/// frame entirely.
fn discard_pending(frame: &mut CallFrame, at: usize, destination: Option<usize>) {
    while let Some(top) = frame.pending.last() {
        let leaving =
            top.handler_covers(at) && destination.is_none_or(|dest| !top.handler_covers(dest));
        if !leaving {
            break;
        }
        frame.pending.pop();
    }
}

/// `+` with the string-concatenation rule: if either side is a string the
/// result is concatenation, otherwise numeric addition.
fn add_values(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Str(_), _) | (_, Value::Str(_)) => {
            Value::from_string(format!("{}{}", a.to_display(), b.to_display()))
        }
        _ => Value::Number(a.to_number() + b.to_number()),
    }
}

/// Relational comparison: lexicographic for two strings, numeric otherwise.
/// `None` means incomparable (NaN involved), which makes every relational
/// operator false.
fn relational_cmp(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if let (Value::Str(x), Value::Str(y)) = (a, b) {
        Some(x.as_str().cmp(y.as_str()))
    } else {
        a.to_number().partial_cmp(&b.to_number())
    }
}
