//! Runtime value model
//!
//! Values are shared across tasks under the parallel executor, so every
//! heap-backed variant is `Arc`-based and guarded by `parking_lot` locks.

use crate::compiler::FunctionProto;
use crate::environment::Env;
use crate::error::RuntimeError;
use crate::interpreter::NativeCall;
use crate::runtime::{Awaitable, ChannelHandle, FutureHandle, MutexHandle};
use crate::ast::Lambda;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;

/// A trait for types that are cheap to clone (reference-counted).
///
/// Use `cheap_clone()` instead of `clone()` to make it explicit that the
/// operation only bumps a reference count.
pub trait CheapClone: Clone {
    fn cheap_clone(&self) -> Self {
        self.clone()
    }
}

impl<T: ?Sized> CheapClone for Arc<T> {}

/// Reference-counted immutable string
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Str(Arc<str>);

impl CheapClone for Str {}

impl Str {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl AsRef<str> for Str {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for Str {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for Str {
    fn eq(&self, other: &str) -> bool {
        self.0.as_ref() == other
    }
}

impl PartialEq<&str> for Str {
    fn eq(&self, other: &&str) -> bool {
        self.0.as_ref() == *other
    }
}

impl From<&str> for Str {
    fn from(s: &str) -> Self {
        Str(s.into())
    }
}

impl From<String> for Str {
    fn from(s: String) -> Self {
        Str(s.into())
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

/// A runtime value
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Void,
    Bool(bool),
    Int(i64),
    Float(f64),
    Char(char),
    String(Str),
    Array(ArrayRef),
    Struct(Arc<StructInstance>),
    Function(Arc<Closure>),
    Native(Arc<NativeFunction>),
    BoundMethod(Arc<BoundMethod>),
    Iterator(IteratorRef),
    Error(Arc<ErrorValue>),
    Future(FutureHandle),
    Channel(ChannelHandle),
    Mutex(MutexHandle),
    Awaitable(Arc<dyn Awaitable>),
}

impl Value {
    pub fn string(s: impl Into<Str>) -> Self {
        Value::String(s.into())
    }

    pub fn array(values: Vec<Value>) -> Self {
        Value::Array(ArrayRef::new(values))
    }

    pub fn error(kind: &str, message: impl Into<String>) -> Self {
        Value::Error(Arc::new(ErrorValue::new(kind, message)))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Nil, `false` and error values are falsy; everything else is truthy
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false) | Value::Error(_))
    }

    /// Nil and error values take the `or` handler path
    pub fn is_failure(&self) -> bool {
        matches!(self, Value::Nil | Value::Error(_))
    }

    /// Runtime type name used for method resolution and typed patterns
    pub fn type_name(&self) -> &str {
        match self {
            Value::Nil => "Nil",
            Value::Void => "Void",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::Char(_) => "Char",
            Value::String(_) => "String",
            Value::Array(_) => "Array",
            Value::Struct(s) => s.name.as_str(),
            Value::Function(_) | Value::Native(_) | Value::BoundMethod(_) => "Function",
            Value::Iterator(_) => "Iterator",
            Value::Error(_) => "Error",
            Value::Future(_) => "Future",
            Value::Channel(_) => "Channel",
            Value::Mutex(_) => "Mutex",
            Value::Awaitable(_) => "Awaitable",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) | (Value::Void, Value::Void) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a.ptr_eq(b) || a.snapshot() == b.snapshot(),
            (Value::Struct(a), Value::Struct(b)) => {
                Arc::ptr_eq(a, b) || (a.name == b.name && a.snapshot() == b.snapshot())
            }
            (Value::Error(a), Value::Error(b)) => {
                Arc::ptr_eq(a, b) || (a.kind == b.kind && a.message == b.message)
            }
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Arc::ptr_eq(a, b),
            (Value::BoundMethod(a), Value::BoundMethod(b)) => Arc::ptr_eq(a, b),
            (Value::Iterator(a), Value::Iterator(b)) => a.ptr_eq(b),
            (Value::Future(a), Value::Future(b)) => Arc::ptr_eq(a, b),
            (Value::Channel(a), Value::Channel(b)) => Arc::ptr_eq(a, b),
            (Value::Mutex(a), Value::Mutex(b)) => Arc::ptr_eq(a, b),
            (Value::Awaitable(a), Value::Awaitable(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Void => f.write_str("void"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{}", n),
            Value::Char(c) => write!(f, "{}", c),
            Value::String(s) => f.write_str(s.as_str()),
            Value::Array(a) => {
                f.write_str("[")?;
                for (i, item) in a.snapshot().iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{:?}", item)?;
                }
                f.write_str("]")
            }
            Value::Struct(s) => {
                write!(f, "{} {{", s.name)?;
                for (i, (name, value)) in s.snapshot().iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, " {}: {:?}", name, value)?;
                }
                f.write_str(" }")
            }
            Value::Function(c) => match &c.name {
                Some(name) => write!(f, "<function {}>", name),
                None => f.write_str("<function>"),
            },
            Value::Native(n) => write!(f, "<native {}>", n.name),
            Value::BoundMethod(_) => f.write_str("<bound method>"),
            Value::Iterator(_) => f.write_str("<iterator>"),
            Value::Error(e) => write!(f, "{}", e),
            Value::Future(h) => write!(f, "<future #{}>", h.id()),
            Value::Channel(c) => write!(f, "<channel #{}>", c.id()),
            Value::Mutex(m) => write!(f, "<mutex #{}>", m.id()),
            Value::Awaitable(a) => write!(f, "<awaitable {}>", a.describe()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{:?}", s.as_str()),
            Value::Char(c) => write!(f, "{:?}", c),
            other => write!(f, "{}", other),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.into())
    }
}

/// Shared, mutable array storage
#[derive(Clone)]
pub struct ArrayRef(Arc<RwLock<Vec<Value>>>);

impl CheapClone for ArrayRef {}

impl ArrayRef {
    pub fn new(values: Vec<Value>) -> Self {
        ArrayRef(Arc::new(RwLock::new(values)))
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.0.read().get(index).cloned()
    }

    /// Store at `index`; writing one past the end appends
    pub fn set(&self, index: usize, value: Value) -> bool {
        let mut items = self.0.write();
        if let Some(slot) = items.get_mut(index) {
            *slot = value;
            true
        } else if index == items.len() {
            items.push(value);
            true
        } else {
            false
        }
    }

    pub fn push(&self, value: Value) {
        self.0.write().push(value);
    }

    pub fn snapshot(&self) -> Vec<Value> {
        self.0.read().clone()
    }

    pub fn ptr_eq(&self, other: &ArrayRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Struct instance with named fields in declaration order
pub struct StructInstance {
    pub name: Str,
    fields: RwLock<IndexMap<Str, Value>>,
}

impl StructInstance {
    pub fn new(name: Str, fields: IndexMap<Str, Value>) -> Arc<Self> {
        Arc::new(StructInstance {
            name,
            fields: RwLock::new(fields),
        })
    }

    pub fn get_field(&self, name: &str) -> Option<Value> {
        self.fields.read().get(name).cloned()
    }

    /// Overwrite an existing field; unknown fields are rejected
    pub fn set_field(&self, name: &str, value: Value) -> bool {
        match self.fields.write().get_mut(name) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> Vec<(Str, Value)> {
        self.fields
            .read()
            .iter()
            .map(|(k, v)| (k.cheap_clone(), v.clone()))
            .collect()
    }
}

/// Function body: lowered bytecode or an AST lambda for the tree-walker
pub enum FunctionBody {
    Bytecode(Arc<FunctionProto>),
    Ast(Arc<Lambda>),
}

/// A closure over its defining environment
pub struct Closure {
    pub name: Option<Str>,
    pub params: Vec<Str>,
    pub body: FunctionBody,
    pub env: Env,
}

impl Closure {
    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

/// Host function signature
pub type NativeFn = dyn Fn(&NativeCall<'_>, &[Value]) -> Result<Value, RuntimeError> + Send + Sync;

/// A natively implemented function
pub struct NativeFunction {
    pub name: Str,
    /// Expected argument count; `None` accepts any
    pub arity: Option<usize>,
    func: Box<NativeFn>,
}

impl NativeFunction {
    pub fn new<F>(name: &str, arity: Option<usize>, func: F) -> Arc<Self>
    where
        F: Fn(&NativeCall<'_>, &[Value]) -> Result<Value, RuntimeError> + Send + Sync + 'static,
    {
        Arc::new(NativeFunction {
            name: name.into(),
            arity,
            func: Box::new(func),
        })
    }

    pub fn call(&self, cx: &NativeCall<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
        if let Some(expected) = self.arity {
            if expected != args.len() {
                return Err(RuntimeError::type_error(format!(
                    "{} expects {} argument(s), got {}",
                    self.name,
                    expected,
                    args.len()
                )));
            }
        }
        (self.func)(cx, args)
    }
}

/// A method bound to its receiver; the receiver becomes the first argument
pub struct BoundMethod {
    pub receiver: Value,
    pub method: Value,
}

/// Language error value
#[derive(Debug, Clone)]
pub struct ErrorValue {
    pub kind: Str,
    pub message: Str,
    /// Raised value that was wrapped into this error, if any
    pub payload: Option<Value>,
}

impl ErrorValue {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        ErrorValue {
            kind: kind.into(),
            message: message.into().into(),
            payload: None,
        }
    }

    /// Wrap an arbitrary raised value; error values pass through unchanged
    pub fn wrap(value: Value) -> Value {
        match value {
            Value::Error(_) => value,
            other => Value::Error(Arc::new(ErrorValue {
                kind: "Error".into(),
                message: other.to_string().into(),
                payload: Some(other),
            })),
        }
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Source of values for `for` loops and lazy sequences
pub trait ValueIterator: Send {
    fn next_value(&mut self) -> Result<Option<Value>, RuntimeError>;

    /// Release resources held by the iterator; called on every loop exit
    fn close(&mut self) {}
}

/// Shared handle to a lazy iterator
#[derive(Clone)]
pub struct IteratorRef(Arc<Mutex<Box<dyn ValueIterator>>>);

impl CheapClone for IteratorRef {}

impl IteratorRef {
    pub fn new(iter: impl ValueIterator + 'static) -> Self {
        IteratorRef(Arc::new(Mutex::new(Box::new(iter))))
    }

    pub fn from_values<I>(iter: I) -> Self
    where
        I: Iterator<Item = Value> + Send + 'static,
    {
        IteratorRef::new(StdIter(iter))
    }

    pub fn next(&self) -> Result<Option<Value>, RuntimeError> {
        self.0.lock().next_value()
    }

    pub fn close(&self) {
        self.0.lock().close();
    }

    pub fn ptr_eq(&self, other: &IteratorRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

struct StdIter<I>(I);

impl<I: Iterator<Item = Value> + Send> ValueIterator for StdIter<I> {
    fn next_value(&mut self) -> Result<Option<Value>, RuntimeError> {
        Ok(self.0.next())
    }
}

/// Integer range iterator produced by `a..b` and `a..=b`
pub struct RangeIter {
    next: i64,
    end: i64,
    inclusive: bool,
    done: bool,
}

impl RangeIter {
    pub fn new(start: i64, end: i64, inclusive: bool) -> Self {
        RangeIter {
            next: start,
            end,
            inclusive,
            done: false,
        }
    }
}

impl ValueIterator for RangeIter {
    fn next_value(&mut self) -> Result<Option<Value>, RuntimeError> {
        let in_range = if self.inclusive {
            self.next <= self.end
        } else {
            self.next < self.end
        };
        if self.done || !in_range {
            self.done = true;
            return Ok(None);
        }
        let current = self.next;
        match self.next.checked_add(1) {
            Some(n) => self.next = n,
            None => self.done = true,
        }
        Ok(Some(Value::Int(current)))
    }

    fn close(&mut self) {
        self.done = true;
    }
}
