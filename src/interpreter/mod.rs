//! The interpreter engine: call dispatch, engine limits, and the host
//! embedding surface.
//!
//! Calls are re-entrant: invoking a bytecode function runs a nested
//! dispatch loop on the Rust stack, so errors propagate to the caller's
//! loop as plain `Result`s and each frame consults only its own exception
//! table. Generator frames are the exception; they detach from the Rust
//! stack at `yield` and live inside their generator object until resumed.

pub(crate) mod dispatch;
pub mod frame;
pub mod generator;
pub mod scope;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::bytecode::Chunk;
use crate::error::VmError;
use crate::interpreter::dispatch::FrameExit;
use crate::interpreter::frame::CallFrame;
use crate::interpreter::generator::GeneratorState;
use crate::interpreter::scope::{Scope, ScopeKind, ScopeRef};
use crate::value::{
    BytecodeFn, Callable, CheapClone, Exotic, Interner, NativeFn, ObjRef, Object, PropertyBag,
    PropertyKey, Str, Value,
};

/// Engine limits.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Maximum depth of nested activations, generators included.
    pub max_call_depth: usize,
    /// Instructions per [`Interpreter::run`] before execution aborts with
    /// [`VmError::Interrupted`]. `None` means unbounded.
    pub instruction_budget: Option<u64>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            max_call_depth: 512,
            instruction_budget: None,
        }
    }
}

/// A cloneable, thread-safe handle for aborting a running interpreter
/// from outside.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    /// Request that execution stop at the next interrupt check.
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::Relaxed);
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// One entry of the diagnostic call trace: which function is active at
/// each depth. Rich per-frame state comes from [`CallFrame::dump`] on
/// suspended generator frames.
#[derive(Debug, Clone)]
pub struct CallTraceEntry {
    pub function_name: Option<Str>,
}

/// The interpreter engine.
pub struct Interpreter {
    interner: Interner,
    global: ObjRef,
    global_scope: ScopeRef,
    options: EngineOptions,
    interrupt: InterruptHandle,
    fuel: Option<u64>,
    depth: usize,
    call_trace: Vec<CallTraceEntry>,
    generator_prototype: ObjRef,
}

impl Interpreter {
    pub fn new() -> Self {
        Self::with_options(EngineOptions::default())
    }

    pub fn with_options(options: EngineOptions) -> Self {
        let global = Object::new().into_ref();
        let global_scope = Scope::global(global.cheap_clone());
        let mut interp = Interpreter {
            interner: Interner::default(),
            global,
            global_scope,
            options,
            interrupt: InterruptHandle::default(),
            fuel: None,
            depth: 0,
            call_trace: Vec::new(),
            generator_prototype: Object::new().into_ref(),
        };
        interp.install_generator_prototype();
        interp
    }

    fn install_generator_prototype(&mut self) {
        let methods: [(&str, NativeFn); 4] = [
            ("next", generator::generator_next),
            ("return", generator::generator_return),
            ("throw", generator::generator_throw),
            ("close", generator::generator_close),
        ];
        for (name, f) in methods {
            let method = self.make_native(name, f);
            self.generator_prototype
                .borrow_mut()
                .put(PropertyKey::from(name), method);
        }
    }

    /// Intern a string, sharing the allocation with every other use of
    /// the same text.
    pub fn intern(&mut self, s: &str) -> Str {
        self.interner.intern(s)
    }

    pub fn global(&self) -> &ObjRef {
        &self.global
    }

    /// Define a global binding.
    pub fn set_global(&mut self, name: &str, value: Value) {
        let name = self.intern(name);
        self.global.borrow_mut().put(PropertyKey::Str(name), value);
    }

    pub fn get_global(&self, name: &str) -> Value {
        self.global
            .borrow()
            .get(&PropertyKey::from(name))
            .unwrap_or(Value::Undefined)
    }

    /// Expose a host function as a global.
    pub fn register_native(&mut self, name: &str, f: NativeFn) {
        let function = self.make_native(name, f);
        self.set_global(name, function);
    }

    /// A handle that can abort execution from another thread.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    /// Names of the activations currently on the call stack, outermost
    /// first.
    pub fn call_trace(&self) -> &[CallTraceEntry] {
        &self.call_trace
    }

    /// Execute a top-level chunk against the global scope.
    pub fn run(&mut self, chunk: Rc<Chunk>) -> Result<Value, VmError> {
        chunk.validate()?;
        self.fuel = self.options.instruction_budget;
        debug!(ops = chunk.code.len(), "running chunk");
        let mut frame = CallFrame::new(
            chunk,
            self.global_scope.cheap_clone(),
            Value::Undefined,
            &[],
        );
        self.enter_call()?;
        self.trace_push(&frame);
        let result = self.run_frame(&mut frame);
        self.trace_pop();
        self.exit_call();
        match result {
            Ok(FrameExit::Return(value)) => Ok(value),
            Ok(_) => Err(VmError::corrupt("top-level chunk suspended")),
            Err(err) => Err(err),
        }
    }

    /// Invoke a callable value through the uniform call contract.
    pub fn call_value(
        &mut self,
        callee: Value,
        this: Value,
        args: &[Value],
    ) -> Result<Value, VmError> {
        let callable = match &callee {
            Value::Object(obj) => obj.borrow().callable.clone(),
            _ => None,
        };
        let Some(callable) = callable else {
            return Err(VmError::type_error(format!(
                "{} is not a function",
                callee.type_name()
            )));
        };
        match callable {
            Callable::Native(f) => f(self, this, args),
            Callable::Bytecode(bfn) => {
                if bfn.chunk.info.is_generator {
                    return Ok(self.create_generator(&bfn, this, args));
                }
                trace!(
                    name = %bfn.chunk.info.name.as_ref().map(Str::as_str).unwrap_or("<anonymous>"),
                    argc = args.len(),
                    "call"
                );
                self.enter_call()?;
                let mut frame = self.build_frame(&bfn, this, args);
                self.trace_push(&frame);
                let result = self.run_frame(&mut frame);
                self.trace_pop();
                self.exit_call();
                match result {
                    Ok(FrameExit::Return(value)) => Ok(value),
                    Ok(_) => Err(VmError::corrupt("non-generator frame suspended")),
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// `new callee(args)`: a fresh object wired to the callee's
    /// `prototype` property becomes `this`; an object return value
    /// replaces it.
    pub fn construct(&mut self, callee: Value, args: &[Value]) -> Result<Value, VmError> {
        if !callee.is_callable() {
            return Err(VmError::type_error(format!(
                "{} is not a constructor",
                callee.type_name()
            )));
        }
        let proto = match self.get_property(&callee, &PropertyKey::from("prototype"))? {
            Value::Object(proto) => Some(proto),
            _ => None,
        };
        let instance = Object::with_prototype(proto).into_ref();
        let result = self.call_value(callee, Value::Object(instance.cheap_clone()), args)?;
        Ok(match result {
            Value::Object(_) => result,
            _ => Value::Object(instance),
        })
    }

    fn build_frame(&self, bfn: &BytecodeFn, this: Value, args: &[Value]) -> CallFrame {
        let parent = bfn
            .closure
            .as_ref()
            .map(CheapClone::cheap_clone)
            .unwrap_or_else(|| self.global_scope.cheap_clone());
        let scope = Scope::push(ScopeKind::Function, &parent);
        CallFrame::new(bfn.chunk.cheap_clone(), scope, this, args)
    }

    /// Calling a generator function runs no body code; it packages the
    /// frame into a fresh generator object.
    fn create_generator(&mut self, bfn: &Rc<BytecodeFn>, this: Value, args: &[Value]) -> Value {
        let frame = self.build_frame(bfn, this, args);
        let mut obj = Object::with_prototype(Some(self.generator_prototype.cheap_clone()));
        obj.exotic = Exotic::Generator(Rc::new(RefCell::new(GeneratorState::new(frame))));
        Value::Object(obj.into_ref())
    }

    /// Wrap a compiled function in a callable object with the usual
    /// `name`, `length`, and `prototype` properties.
    pub fn make_function(&mut self, bfn: BytecodeFn) -> Value {
        let info = bfn.chunk.info.clone();
        let mut obj = Object::new();
        obj.callable = Some(Callable::Bytecode(Rc::new(bfn)));
        obj.put(
            PropertyKey::from("name"),
            match &info.name {
                Some(name) => Value::Str(name.cheap_clone()),
                None => Value::from_string(""),
            },
        );
        obj.put(
            PropertyKey::from("length"),
            Value::Number(info.param_count as f64),
        );
        let obj = obj.into_ref();
        if !info.is_generator {
            let proto = Object::new().into_ref();
            proto
                .borrow_mut()
                .put(PropertyKey::from("constructor"), Value::Object(obj.cheap_clone()));
            obj.borrow_mut()
                .put(PropertyKey::from("prototype"), Value::Object(proto));
        }
        Value::Object(obj)
    }

    pub fn make_native(&mut self, name: &str, f: NativeFn) -> Value {
        let name = self.intern(name);
        let mut obj = Object::new();
        obj.callable = Some(Callable::Native(f));
        obj.put(PropertyKey::from("name"), Value::Str(name));
        Value::Object(obj.into_ref())
    }

    /// Build an iterator-result object `{ value, done }`.
    pub fn make_iter_result(&mut self, value: Value, done: bool) -> Value {
        let mut obj = Object::new();
        obj.put(PropertyKey::from("value"), value);
        obj.put(PropertyKey::from("done"), Value::Bool(done));
        Value::Object(obj.into_ref())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Property access
    // ═══════════════════════════════════════════════════════════════════════════

    pub(crate) fn get_property(
        &mut self,
        target: &Value,
        key: &PropertyKey,
    ) -> Result<Value, VmError> {
        match target {
            Value::Object(obj) => Ok(obj.borrow().get(key).unwrap_or(Value::Undefined)),
            Value::Str(s) => Ok(match key {
                PropertyKey::Str(k) if k.as_str() == "length" => {
                    Value::Number(s.as_str().chars().count() as f64)
                }
                PropertyKey::Index(i) => s
                    .as_str()
                    .chars()
                    .nth(*i as usize)
                    .map(|c| Value::from_string(c.to_string()))
                    .unwrap_or(Value::Undefined),
                _ => Value::Undefined,
            }),
            Value::Number(_) | Value::Bool(_) => Ok(Value::Undefined),
            Value::Undefined | Value::Null => Err(VmError::type_error(format!(
                "cannot read property '{key}' of {}",
                target.to_display()
            ))),
        }
    }

    pub(crate) fn set_property(
        &mut self,
        target: &Value,
        key: PropertyKey,
        value: Value,
    ) -> Result<(), VmError> {
        match target {
            Value::Object(obj) => {
                obj.borrow_mut().put(key, value);
                Ok(())
            }
            Value::Undefined | Value::Null => Err(VmError::type_error(format!(
                "cannot set property '{key}' of {}",
                target.to_display()
            ))),
            // Writes to primitives are silently dropped.
            _ => Ok(()),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Limits
    // ═══════════════════════════════════════════════════════════════════════════

    pub(crate) fn enter_call(&mut self) -> Result<(), VmError> {
        if self.depth >= self.options.max_call_depth {
            return Err(VmError::StackOverflow {
                limit: self.options.max_call_depth,
            });
        }
        self.depth += 1;
        Ok(())
    }

    pub(crate) fn exit_call(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Cheap abort check, consulted at every call and backward branch.
    pub(crate) fn check_interrupt(&mut self) -> Result<(), VmError> {
        if self.interrupt.is_interrupted() {
            return Err(VmError::Interrupted);
        }
        if let Some(fuel) = &mut self.fuel {
            if *fuel == 0 {
                return Err(VmError::Interrupted);
            }
            *fuel -= 1;
        }
        Ok(())
    }

    pub(crate) fn trace_push(&mut self, frame: &CallFrame) {
        self.call_trace.push(CallTraceEntry {
            function_name: frame.chunk.info.name.as_ref().map(CheapClone::cheap_clone),
        });
    }

    pub(crate) fn trace_pop(&mut self) {
        self.call_trace.pop();
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}
