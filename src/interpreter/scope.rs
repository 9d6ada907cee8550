//! Scope chain: the linked list of lookup scopes used for identifier
//! resolution, innermost first.
//!
//! Every link backs onto a property bag. For block/function/catch scopes
//! the bag is a plain engine object used as binding storage; for a `with`
//! scope it is the `with` target itself, so `HasProperty` probes (including
//! the target's prototype chain) decide whether the link binds a name.

use std::rc::Rc;

use crate::error::VmError;
use crate::value::{CheapClone, ObjRef, Object, PropertyBag, PropertyKey, Str, Value};

/// What produced a scope link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Global,
    Function,
    Block,
    With,
    Catch,
}

/// One link in the scope chain. Links are immutable; bindings mutate
/// through the interior-mutable bag.
pub struct Scope {
    pub kind: ScopeKind,
    pub bag: ObjRef,
    pub parent: Option<ScopeRef>,
}

pub type ScopeRef = Rc<Scope>;

impl Scope {
    pub fn global(bag: ObjRef) -> ScopeRef {
        Rc::new(Scope {
            kind: ScopeKind::Global,
            bag,
            parent: None,
        })
    }

    /// Push a child link with a fresh backing bag.
    pub fn push(kind: ScopeKind, parent: &ScopeRef) -> ScopeRef {
        Rc::new(Scope {
            kind,
            bag: Object::new().into_ref(),
            parent: Some(parent.cheap_clone()),
        })
    }

    /// Splice in a `with` scope whose backing bag is the target object.
    pub fn push_with(target: ObjRef, parent: &ScopeRef) -> ScopeRef {
        Rc::new(Scope {
            kind: ScopeKind::With,
            bag: target,
            parent: Some(parent.cheap_clone()),
        })
    }
}

/// Walk the chain innermost-first and return the first link whose bag has
/// the name.
pub fn resolve(scope: &ScopeRef, key: &PropertyKey) -> Option<ScopeRef> {
    let mut current = Some(scope.cheap_clone());
    while let Some(link) = current.take() {
        if link.bag.borrow().has(key) {
            return Some(link);
        }
        current = link.parent.as_ref().map(CheapClone::cheap_clone);
    }
    None
}

/// Resolve and read an identifier.
pub fn lookup(scope: &ScopeRef, name: &Str) -> Result<Value, VmError> {
    let key = PropertyKey::Str(name.cheap_clone());
    match resolve(scope, &key) {
        Some(link) => Ok(link.bag.borrow().get(&key).unwrap_or(Value::Undefined)),
        None => Err(VmError::reference_error(name.as_str())),
    }
}

/// Assign through the chain to wherever the binding lives. An undeclared
/// name falls through to the outermost (global) bag.
pub fn assign(scope: &ScopeRef, name: &Str, value: Value) {
    let key = PropertyKey::Str(name.cheap_clone());
    if let Some(link) = resolve(scope, &key) {
        link.bag.borrow_mut().put(key, value);
        return;
    }
    let mut outermost = scope.cheap_clone();
    while let Some(parent) = outermost.parent.as_ref() {
        outermost = parent.cheap_clone();
    }
    outermost.bag.borrow_mut().put(key, value);
}

/// Declare a binding in the innermost scope.
pub fn declare(scope: &ScopeRef, name: Str, value: Value) {
    scope.bag.borrow_mut().put(PropertyKey::Str(name), value);
}
