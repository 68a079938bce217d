// Layered variable scopes

use parking_lot::RwLock;

use crate::parser::ast::{Value, Vars};

/// Variable lookup/assignment environment
///
/// Lookups may walk outward through enclosing scopes; assignments always
/// land in the scope they are made on.
pub trait Scope: Send + Sync {
    fn get(&self, name: &str) -> Option<Value>;

    fn set(&self, name: &str, value: Value);
}

/// A scope frame with an optional parent
///
/// One frame is created per nesting boundary (item loop iteration, module
/// call). A miss in the local frame forwards to the parent.
pub struct NestedScope<'a> {
    parent: Option<&'a dyn Scope>,
    vars: RwLock<Vars>,
}

impl<'a> NestedScope<'a> {
    pub fn new(parent: Option<&'a dyn Scope>) -> Self {
        NestedScope {
            parent,
            vars: RwLock::new(Vars::new()),
        }
    }

    /// Child frame of `parent`
    pub fn child(parent: &'a dyn Scope) -> Self {
        Self::new(Some(parent))
    }

    /// Root frame seeded with `vars`
    pub fn from_vars(vars: Vars) -> Self {
        NestedScope {
            parent: None,
            vars: RwLock::new(vars),
        }
    }
}

impl Default for NestedScope<'_> {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Scope for NestedScope<'_> {
    fn get(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.vars.read().get(name) {
            return Some(v.clone());
        }

        self.parent.and_then(|p| p.get(name))
    }

    fn set(&self, name: &str, value: Value) {
        self.vars.write().insert(name.to_string(), value);
    }
}

/// Read overlay in front of another scope
///
/// The overlay shadows reads but never receives writes: every `set` goes to
/// the fallback scope, so task-local variables cannot leak upward as
/// mutations.
pub struct PriorityScope<'a> {
    overlay: &'a Vars,
    rest: &'a dyn Scope,
}

impl<'a> PriorityScope<'a> {
    pub fn new(overlay: &'a Vars, rest: &'a dyn Scope) -> Self {
        PriorityScope { overlay, rest }
    }
}

impl Scope for PriorityScope<'_> {
    fn get(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.overlay.get(name) {
            return Some(v.clone());
        }

        self.rest.get(name)
    }

    fn set(&self, name: &str, value: Value) {
        self.rest.set(name, value);
    }
}
