//! Lexical environments
//!
//! Each scope is a node holding a name→value map behind its own lock, a
//! parent pointer, and optionally the async payload of the task that owns it.
//! Closures captured by several tasks share nodes, hence the per-node lock.

use crate::runtime::AsyncPayload;
use crate::value::{Str, Value};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;

pub type Env = Arc<Environment>;

pub struct Environment {
    vars: RwLock<FxHashMap<Str, Value>>,
    parent: Option<Env>,
    payload: Option<Arc<AsyncPayload>>,
}

impl Environment {
    /// A root scope with no parent
    pub fn root() -> Env {
        Arc::new(Environment {
            vars: RwLock::new(FxHashMap::default()),
            parent: None,
            payload: None,
        })
    }

    pub fn child(parent: &Env) -> Env {
        Arc::new(Environment {
            vars: RwLock::new(FxHashMap::default()),
            parent: Some(parent.clone()),
            payload: None,
        })
    }

    /// A child scope that carries a task's async context
    pub fn child_with_payload(parent: &Env, payload: Arc<AsyncPayload>) -> Env {
        Arc::new(Environment {
            vars: RwLock::new(FxHashMap::default()),
            parent: Some(parent.clone()),
            payload: Some(payload),
        })
    }

    pub fn parent(&self) -> Option<&Env> {
        self.parent.as_ref()
    }

    /// Look a name up through the scope chain
    pub fn get(&self, name: &str) -> Option<Value> {
        let mut current = self;
        loop {
            if let Some(value) = current.vars.read().get(name) {
                return Some(value.clone());
            }
            current = current.parent.as_deref()?;
        }
    }

    pub fn define(&self, name: Str, value: Value) {
        self.vars.write().insert(name, value);
    }

    /// True if `name` is bound in this scope itself (not a parent)
    pub fn has_own(&self, name: &str) -> bool {
        self.vars.read().contains_key(name)
    }

    /// Update the nearest existing binding; returns false if none exists
    pub fn assign_existing(&self, name: &str, value: Value) -> bool {
        let mut current = self;
        loop {
            {
                let mut vars = current.vars.write();
                if let Some(slot) = vars.get_mut(name) {
                    *slot = value;
                    return true;
                }
            }
            match current.parent.as_deref() {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    /// The nearest task payload in the chain
    pub fn payload(&self) -> Option<Arc<AsyncPayload>> {
        let mut current = self;
        loop {
            if let Some(payload) = &current.payload {
                return Some(payload.clone());
            }
            current = current.parent.as_deref()?;
        }
    }

    /// Number of ancestors above this scope
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self;
        while let Some(parent) = current.parent.as_deref() {
            depth += 1;
            current = parent;
        }
        depth
    }
}
