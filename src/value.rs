//! Runtime value representation.
//!
//! The core [`Value`] type, the reference-counted [`Object`] property bag,
//! and the small closed capability set ([`PropertyBag`], [`Callable`]) that
//! the dispatch loop uses to talk to object-model collaborators.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::bytecode::Chunk;
use crate::error::VmError;
use crate::interpreter::generator::GeneratorState;
use crate::interpreter::scope::ScopeRef;
use crate::interpreter::Interpreter;

/// Trait for types that have cheap (O(1), reference-counted) clones.
///
/// Makes it explicit at call sites that a clone only bumps a reference
/// count. Types implementing this should never copy their backing data.
pub trait CheapClone: Clone {
    fn cheap_clone(&self) -> Self {
        self.clone()
    }
}

impl<T: ?Sized> CheapClone for Rc<T> {}

/// An immutable, cheaply clonable string.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Str(Rc<str>);

impl Str {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl CheapClone for Str {}

impl From<&str> for Str {
    fn from(s: &str) -> Self {
        Str(Rc::from(s))
    }
}

impl From<String> for Str {
    fn from(s: String) -> Self {
        Str(Rc::from(s.as_str()))
    }
}

impl fmt::Display for Str {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Str {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

impl Serialize for Str {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Str {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Str::from(String::deserialize(deserializer)?))
    }
}

/// String interner. Repeated identifier and property names share one
/// allocation, so scope lookups compare `Rc` pointers before bytes.
#[derive(Default)]
pub struct Interner {
    map: FxHashMap<Box<str>, Str>,
}

impl Interner {
    pub fn intern(&mut self, s: &str) -> Str {
        if let Some(interned) = self.map.get(s) {
            return interned.cheap_clone();
        }
        let interned = Str::from(s);
        self.map.insert(Box::from(s), interned.cheap_clone());
        interned
    }
}

/// A reference to a heap object.
pub type ObjRef = Rc<RefCell<Object>>;

/// A script value.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(Str),
    Object(ObjRef),
}

impl Value {
    pub fn from_string(s: impl Into<String>) -> Self {
        Value::Str(Str::from(s.into()))
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Null | Value::Undefined)
    }

    pub fn is_callable(&self) -> bool {
        match self {
            Value::Object(obj) => obj.borrow().callable.is_some(),
            _ => false,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "object", // historical quirk
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Object(obj) => {
                if obj.borrow().callable.is_some() {
                    "function"
                } else {
                    "object"
                }
            }
        }
    }

    /// ToBoolean.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            Value::Object(_) => true,
        }
    }

    /// ToNumber.
    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(true) => 1.0,
            Value::Bool(false) => 0.0,
            Value::Number(n) => *n,
            Value::Str(s) => {
                let t = s.as_str().trim();
                if t.is_empty() {
                    0.0
                } else {
                    t.parse::<f64>().unwrap_or(f64::NAN)
                }
            }
            Value::Object(_) => f64::NAN,
        }
    }

    /// ToString for display and concatenation.
    pub fn to_display(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::Str(s) => s.as_str().to_string(),
            Value::Object(obj) => {
                if obj.borrow().callable.is_some() {
                    "[function]".to_string()
                } else {
                    "[object]".to_string()
                }
            }
        }
    }

    /// Strict equality (`===`): same type, same value; objects by identity.
    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Abstract equality (`==`) with the standard coercion ladder.
    pub fn loose_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null | Value::Undefined, Value::Null | Value::Undefined) => true,
            (Value::Number(_), Value::Str(_)) => self.to_number() == other.to_number(),
            (Value::Str(_), Value::Number(_)) => self.to_number() == other.to_number(),
            (Value::Bool(_), _) => Value::Number(self.to_number()).loose_equals(other),
            (_, Value::Bool(_)) => self.loose_equals(&Value::Number(other.to_number())),
            _ => self.strict_equals(other),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.strict_equals(other)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Object(obj) => write!(f, "<object {:p}>", Rc::as_ptr(obj)),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// A property key: interned name or array index.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum PropertyKey {
    Str(Str),
    Index(u32),
}

impl PropertyKey {
    /// Build a key from a script value, folding numeric strings and
    /// non-negative integral numbers into `Index`.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Number(n) if n.fract() == 0.0 && *n >= 0.0 && *n <= u32::MAX as f64 => {
                PropertyKey::Index(*n as u32)
            }
            Value::Str(s) => match s.as_str().parse::<u32>() {
                Ok(idx) => PropertyKey::Index(idx),
                Err(_) => PropertyKey::Str(s.cheap_clone()),
            },
            other => PropertyKey::Str(Str::from(other.to_display())),
        }
    }
}

impl From<&str> for PropertyKey {
    fn from(s: &str) -> Self {
        PropertyKey::Str(Str::from(s))
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyKey::Str(s) => write!(f, "{s}"),
            PropertyKey::Index(i) => write!(f, "{i}"),
        }
    }
}

/// Signature for host-native functions exposed through the call contract.
pub type NativeFn = fn(&mut Interpreter, Value, &[Value]) -> Result<Value, VmError>;

/// A compiled function closed over its defining scope.
///
/// The closure link points at the scope chain captured where the function
/// literal was evaluated, never the caller's chain: closures are lexically
/// scoped even when `with` has dynamically extended the chain at the point
/// of definition.
pub struct BytecodeFn {
    pub chunk: Rc<Chunk>,
    pub closure: Option<ScopeRef>,
}

/// Anything invocable through the uniform call contract.
#[derive(Clone)]
pub enum Callable {
    Bytecode(Rc<BytecodeFn>),
    Native(NativeFn),
}

/// Exotic behavior attached to an object.
pub enum Exotic {
    None,
    /// The `arguments` object of a non-strict activation. Indexed
    /// properties below `len` are views into the activation's locals
    /// array, so mutation through either is visible through both.
    Arguments {
        slots: Rc<RefCell<Vec<Value>>>,
        len: usize,
    },
    /// A generator object owning its suspended frame.
    Generator(Rc<RefCell<GeneratorState>>),
}

/// A heap object: an insertion-ordered property bag with an optional
/// prototype link and optional call behavior.
pub struct Object {
    pub properties: IndexMap<PropertyKey, Value>,
    pub prototype: Option<ObjRef>,
    pub callable: Option<Callable>,
    pub exotic: Exotic,
}

impl Object {
    pub fn new() -> Self {
        Object {
            properties: IndexMap::new(),
            prototype: None,
            callable: None,
            exotic: Exotic::None,
        }
    }

    pub fn with_prototype(prototype: Option<ObjRef>) -> Self {
        Object {
            prototype,
            ..Object::new()
        }
    }

    pub fn into_ref(self) -> ObjRef {
        Rc::new(RefCell::new(self))
    }

    /// Own-property lookup only, no prototype walk.
    pub fn get_own(&self, key: &PropertyKey) -> Option<Value> {
        if let Exotic::Arguments { slots, len } = &self.exotic {
            if let PropertyKey::Index(i) = key {
                let i = *i as usize;
                if i < *len {
                    return slots.borrow().get(i).cloned();
                }
            }
        }
        self.properties.get(key).cloned()
    }

    pub fn generator_state(&self) -> Option<Rc<RefCell<GeneratorState>>> {
        match &self.exotic {
            Exotic::Generator(state) => Some(state.cheap_clone()),
            _ => None,
        }
    }
}

impl Default for Object {
    fn default() -> Self {
        Object::new()
    }
}

/// The property-bag capability consumed by the scope-chain resolver and
/// the generic property opcodes.
///
/// `get` and `has` follow the prototype chain; `put` and `delete` act on
/// the receiver only.
pub trait PropertyBag {
    fn get(&self, key: &PropertyKey) -> Option<Value>;
    fn put(&mut self, key: PropertyKey, value: Value);
    fn has(&self, key: &PropertyKey) -> bool;
    fn delete(&mut self, key: &PropertyKey) -> bool;
}

impl PropertyBag for Object {
    fn get(&self, key: &PropertyKey) -> Option<Value> {
        if let Some(value) = self.get_own(key) {
            return Some(value);
        }
        let mut current = self.prototype.as_ref().map(CheapClone::cheap_clone);
        while let Some(proto) = current.take() {
            let borrowed = proto.borrow();
            if let Some(value) = borrowed.get_own(key) {
                return Some(value);
            }
            current = borrowed.prototype.as_ref().map(CheapClone::cheap_clone);
        }
        None
    }

    fn put(&mut self, key: PropertyKey, value: Value) {
        if let Exotic::Arguments { slots, len } = &self.exotic {
            if let PropertyKey::Index(i) = key {
                let i = i as usize;
                if i < *len {
                    if let Some(slot) = slots.borrow_mut().get_mut(i) {
                        *slot = value;
                    }
                    return;
                }
            }
        }
        self.properties.insert(key, value);
    }

    fn has(&self, key: &PropertyKey) -> bool {
        self.get(key).is_some()
    }

    fn delete(&mut self, key: &PropertyKey) -> bool {
        if let Exotic::Arguments { len, .. } = &mut self.exotic {
            if let PropertyKey::Index(i) = key {
                // Deleting an aliased slot severs the alias for the tail;
                // the core only needs deletion to make `has` false.
                if (*i as usize) < *len {
                    *len = *i as usize;
                    return true;
                }
            }
        }
        self.properties.shift_remove(key).is_some()
    }
}

/// The iterator capability: any object exposing a callable `next`, with
/// optional `return` and `throw`. This is the shape used for `for-of`,
/// `yield*` delegation, and generator objects themselves.
pub struct IteratorLike {
    pub target: ObjRef,
    pub next: Value,
    pub ret: Option<Value>,
    pub thr: Option<Value>,
}

impl IteratorLike {
    /// Probe a value for iterator shape. Returns `None` when the value is
    /// not an object or has no callable `next`.
    pub fn from_value(value: &Value) -> Option<IteratorLike> {
        let Value::Object(obj) = value else {
            return None;
        };
        let borrowed = obj.borrow();
        let next = borrowed.get(&PropertyKey::from("next"))?;
        if !next.is_callable() {
            return None;
        }
        let method = |name: &str| {
            borrowed
                .get(&PropertyKey::from(name))
                .filter(Value::is_callable)
        };
        Some(IteratorLike {
            target: obj.cheap_clone(),
            next,
            ret: method("return"),
            thr: method("throw"),
        })
    }
}

/// Destructure an iterator-result object into `(value, done)`.
///
/// Non-object results are treated as exhausted, mirroring how a hostile
/// iterator is handled at the delegation boundary.
pub fn iter_result_parts(result: &Value) -> (Value, bool) {
    match result {
        Value::Object(obj) => {
            let borrowed = obj.borrow();
            let value = borrowed
                .get(&PropertyKey::from("value"))
                .unwrap_or(Value::Undefined);
            let done = borrowed
                .get(&PropertyKey::from("done"))
                .map(|d| d.truthy())
                .unwrap_or(false);
            (value, done)
        }
        _ => (Value::Undefined, true),
    }
}
