//! Generator objects: suspendable activations driven through the
//! `next`/`return`/`throw` protocol, plus `yield*` delegation.
//!
//! A generator owns its frame while suspended. Resuming takes the frame
//! out of the state cell (leaving `Executing` behind, which is how
//! re-entrant resumption is detected), runs it on the Rust stack, and
//! parks it again at the next suspension.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::trace;

use crate::error::{GeneratorFault, VmError};
use crate::interpreter::dispatch::FrameExit;
use crate::interpreter::frame::{CallFrame, FrameDump, ResumeMode};
use crate::interpreter::Interpreter;
use crate::value::{iter_result_parts, CheapClone, IteratorLike, ObjRef, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorStatus {
    /// Created, body not yet entered.
    SuspendedStart,
    /// Parked at a `yield`.
    SuspendedYield,
    /// Frame currently running on the Rust stack.
    Executing,
    Completed,
}

/// The state cell behind a generator object.
pub struct GeneratorState {
    pub status: GeneratorStatus,
    /// The suspended activation; `None` while executing or after
    /// completion.
    pub frame: Option<CallFrame>,
    /// Active `yield*` delegate, if any. While set, resumptions are
    /// forwarded to the delegate instead of the frame.
    pub delegate: Option<ObjRef>,
}

impl GeneratorState {
    pub fn new(frame: CallFrame) -> Self {
        GeneratorState {
            status: GeneratorStatus::SuspendedStart,
            frame: Some(frame),
            delegate: None,
        }
    }

    /// Diagnostic snapshot of the suspended activation, if there is one.
    pub fn dump(&self) -> Option<FrameDump> {
        self.frame.as_ref().map(CallFrame::dump)
    }
}

pub type GeneratorRef = Rc<RefCell<GeneratorState>>;

impl Interpreter {
    /// Resume a generator with the given mode. Returns the next
    /// `(value, done)` pair; script exceptions escaping the body surface
    /// as `Err`.
    pub fn resume_generator(
        &mut self,
        generator: &GeneratorRef,
        mode: ResumeMode,
    ) -> Result<(Value, bool), VmError> {
        let status = generator.borrow().status;
        trace!(?status, "generator resume");
        match status {
            GeneratorStatus::Executing => Err(GeneratorFault::AlreadyRunning.into()),
            GeneratorStatus::Completed => match mode {
                ResumeMode::Next(_) => Ok((Value::Undefined, true)),
                ResumeMode::Return(value) => Ok((value, true)),
                ResumeMode::Throw(value) => Err(VmError::thrown(value)),
            },
            GeneratorStatus::SuspendedStart => match mode {
                // The first next() starts the body; its argument has no
                // suspended yield to land on and is dropped.
                ResumeMode::Next(_) => self.drive(generator, None),
                ResumeMode::Return(value) => {
                    complete(generator);
                    Ok((value, true))
                }
                ResumeMode::Throw(value) => {
                    complete(generator);
                    Err(VmError::thrown(value))
                }
            },
            GeneratorStatus::SuspendedYield => {
                if generator.borrow().delegate.is_some() {
                    self.drive_delegate(generator, mode)
                } else {
                    self.drive(generator, Some(mode))
                }
            }
        }
    }

    /// Close a suspended generator: run `finally` blocks at the suspension
    /// point with yields forbidden, then mark it completed.
    pub fn close_generator(&mut self, generator: &GeneratorRef) -> Result<(), VmError> {
        let status = generator.borrow().status;
        match status {
            GeneratorStatus::Executing => Err(GeneratorFault::AlreadyRunning.into()),
            GeneratorStatus::Completed | GeneratorStatus::SuspendedStart => {
                complete(generator);
                Ok(())
            }
            GeneratorStatus::SuspendedYield => {
                if let Some(frame) = generator.borrow_mut().frame.as_mut() {
                    frame.closing = true;
                }
                match self.resume_generator(generator, ResumeMode::Return(Value::Undefined))? {
                    (_, true) => Ok(()),
                    // A delegate produced another value instead of
                    // finishing; the generator cannot be closed cleanly.
                    (_, false) => {
                        complete(generator);
                        Err(GeneratorFault::YieldFromClosing.into())
                    }
                }
            }
        }
    }

    /// Run the generator's own frame until the next suspension or
    /// completion.
    fn drive(
        &mut self,
        generator: &GeneratorRef,
        mode: Option<ResumeMode>,
    ) -> Result<(Value, bool), VmError> {
        self.enter_call()?;
        let mut frame = {
            let mut state = generator.borrow_mut();
            state.status = GeneratorStatus::Executing;
            match state.frame.take() {
                Some(frame) => frame,
                None => {
                    self.exit_call();
                    return Err(VmError::corrupt("generator frame missing"));
                }
            }
        };
        frame.resume = mode;
        self.trace_push(&frame);
        let result = self.run_frame(&mut frame);
        self.trace_pop();
        self.exit_call();
        match result {
            Ok(FrameExit::Return(value)) => {
                complete(generator);
                Ok((value, true))
            }
            Ok(FrameExit::Yield(value)) => {
                let mut state = generator.borrow_mut();
                state.status = GeneratorStatus::SuspendedYield;
                state.frame = Some(frame);
                Ok((value, false))
            }
            Ok(FrameExit::Delegate(iterable)) => {
                let target = match &iterable {
                    Value::Object(obj) => obj.cheap_clone(),
                    // The dispatch loop only suspends for iterator-shaped
                    // objects.
                    _ => {
                        complete(generator);
                        return Err(VmError::corrupt("yield* suspended on a non-object"));
                    }
                };
                {
                    let mut state = generator.borrow_mut();
                    state.status = GeneratorStatus::SuspendedYield;
                    state.frame = Some(frame);
                    state.delegate = Some(target);
                }
                self.drive_delegate(generator, ResumeMode::Next(Value::Undefined))
            }
            Err(err) => {
                complete(generator);
                Err(err)
            }
        }
    }

    /// Forward a resumption to the active `yield*` delegate. When the
    /// delegate finishes, its completion value resumes the generator's
    /// own frame at the `yield*` site.
    fn drive_delegate(
        &mut self,
        generator: &GeneratorRef,
        mode: ResumeMode,
    ) -> Result<(Value, bool), VmError> {
        let Some(target) = generator.borrow().delegate.as_ref().map(CheapClone::cheap_clone) else {
            return self.drive(generator, Some(mode));
        };
        let Some(it) = IteratorLike::from_value(&Value::Object(target.cheap_clone())) else {
            generator.borrow_mut().delegate = None;
            return self.drive(
                generator,
                Some(ResumeMode::Throw(Value::from_string(
                    "TypeError: delegate is not iterable",
                ))),
            );
        };
        match mode {
            ResumeMode::Next(value) => {
                let result = match self.delegate_call(generator, it.next, &target, &[value])? {
                    DelegateCall::Value(result) => result,
                    DelegateCall::Fault(fault) => {
                        return self.rethrow_from_delegate(generator, fault)
                    }
                };
                let (value, done) = iter_result_parts(&result);
                if done {
                    generator.borrow_mut().delegate = None;
                    self.drive(generator, Some(ResumeMode::Next(value)))
                } else {
                    Ok((value, false))
                }
            }
            ResumeMode::Return(value) => match it.ret {
                Some(ret) => {
                    let result =
                        match self.delegate_call(generator, ret, &target, &[value.clone()])? {
                            DelegateCall::Value(result) => result,
                            DelegateCall::Fault(fault) => {
                                return self.rethrow_from_delegate(generator, fault)
                            }
                        };
                    // A nullish answer from the hook ends the delegation
                    // with the value the consumer sent.
                    if result.is_nullish() {
                        generator.borrow_mut().delegate = None;
                        return self.drive(generator, Some(ResumeMode::Return(value)));
                    }
                    let (value, done) = iter_result_parts(&result);
                    if done {
                        generator.borrow_mut().delegate = None;
                        self.drive(generator, Some(ResumeMode::Return(value)))
                    } else {
                        Ok((value, false))
                    }
                }
                // No return hook: the delegation completes with the value
                // the consumer supplied.
                None => {
                    generator.borrow_mut().delegate = None;
                    self.drive(generator, Some(ResumeMode::Return(value)))
                }
            },
            ResumeMode::Throw(value) => match it.thr {
                Some(thr) => {
                    let result = match self.delegate_call(generator, thr, &target, &[value])? {
                        DelegateCall::Value(result) => result,
                        DelegateCall::Fault(value) => {
                            return self.rethrow_from_delegate(generator, value)
                        }
                    };
                    let (value, done) = iter_result_parts(&result);
                    if done {
                        generator.borrow_mut().delegate = None;
                        self.drive(generator, Some(ResumeMode::Next(value)))
                    } else {
                        Ok((value, false))
                    }
                }
                // The delegate cannot absorb the throw: close it if it
                // supports closing, then deliver the throw at the yield*
                // site so the generator's own handlers see it.
                None => {
                    if let Some(ret) = it.ret {
                        if let Err(err) =
                            self.call_value(ret, Value::Object(target.cheap_clone()), &[])
                        {
                            if !err.is_catchable() {
                                complete(generator);
                                return Err(err);
                            }
                        }
                    }
                    generator.borrow_mut().delegate = None;
                    self.drive(generator, Some(ResumeMode::Throw(value)))
                }
            },
        }
    }

    /// Call into the delegate iterator. A catchable error from the
    /// delegate becomes a `Fault` for injection into the generator frame
    /// at the `yield*` site; fatal errors complete the generator and
    /// propagate.
    fn delegate_call(
        &mut self,
        generator: &GeneratorRef,
        callee: Value,
        target: &ObjRef,
        args: &[Value],
    ) -> Result<DelegateCall, VmError> {
        match self.call_value(callee, Value::Object(target.cheap_clone()), args) {
            Ok(result) => Ok(DelegateCall::Value(result)),
            Err(err) if err.is_catchable() => Ok(DelegateCall::Fault(err.to_value())),
            Err(err) => {
                complete(generator);
                Err(err)
            }
        }
    }

    /// Deliver a delegate fault to the generator's own handlers.
    fn rethrow_from_delegate(
        &mut self,
        generator: &GeneratorRef,
        value: Value,
    ) -> Result<(Value, bool), VmError> {
        generator.borrow_mut().delegate = None;
        self.drive(generator, Some(ResumeMode::Throw(value)))
    }
}

enum DelegateCall {
    Value(Value),
    Fault(Value),
}

fn complete(generator: &GeneratorRef) {
    let mut state = generator.borrow_mut();
    state.status = GeneratorStatus::Completed;
    state.frame = None;
    state.delegate = None;
}

// ═══════════════════════════════════════════════════════════════════════════
// Prototype methods
// ═══════════════════════════════════════════════════════════════════════════

fn state_of(this: &Value) -> Result<GeneratorRef, VmError> {
    match this {
        Value::Object(obj) => obj
            .borrow()
            .generator_state()
            .ok_or_else(|| VmError::type_error("receiver is not a generator")),
        _ => Err(VmError::type_error("receiver is not a generator")),
    }
}

fn first_arg(args: &[Value]) -> Value {
    args.first().cloned().unwrap_or(Value::Undefined)
}

pub(crate) fn generator_next(
    interp: &mut Interpreter,
    this: Value,
    args: &[Value],
) -> Result<Value, VmError> {
    let generator = state_of(&this)?;
    let (value, done) = interp.resume_generator(&generator, ResumeMode::Next(first_arg(args)))?;
    Ok(interp.make_iter_result(value, done))
}

pub(crate) fn generator_return(
    interp: &mut Interpreter,
    this: Value,
    args: &[Value],
) -> Result<Value, VmError> {
    let generator = state_of(&this)?;
    let (value, done) = interp.resume_generator(&generator, ResumeMode::Return(first_arg(args)))?;
    Ok(interp.make_iter_result(value, done))
}

pub(crate) fn generator_throw(
    interp: &mut Interpreter,
    this: Value,
    args: &[Value],
) -> Result<Value, VmError> {
    let generator = state_of(&this)?;
    let (value, done) = interp.resume_generator(&generator, ResumeMode::Throw(first_arg(args)))?;
    Ok(interp.make_iter_result(value, done))
}

pub(crate) fn generator_close(
    interp: &mut Interpreter,
    this: Value,
    _args: &[Value],
) -> Result<Value, VmError> {
    let generator = state_of(&this)?;
    interp.close_generator(&generator)?;
    Ok(Value::Undefined)
}
