//! Pluggable evaluator capabilities
//!
//! The VM and the tree-walker never inspect value representations for
//! member lookup, operators, indexing, stringification or iteration; they
//! go through these traits so hosts can extend or replace the behavior.

use crate::ast::{BinaryOp, UnaryOp};
use crate::error::RuntimeError;
use crate::value::{IteratorRef, Str, Value};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Resolves methods that are not struct fields
pub trait MemberResolver: Send + Sync {
    fn resolve_method(&self, receiver: &Value, name: &str) -> Option<Value>;
}

pub trait OperatorEvaluator: Send + Sync {
    fn binary(&self, op: BinaryOp, left: &Value, right: &Value) -> Result<Value, RuntimeError>;
    fn unary(&self, op: UnaryOp, operand: &Value) -> Result<Value, RuntimeError>;
}

pub trait Indexer: Send + Sync {
    fn index_get(&self, object: &Value, index: &Value) -> Result<Value, RuntimeError>;
    fn index_set(&self, object: &Value, index: &Value, value: Value) -> Result<(), RuntimeError>;
}

pub trait Stringifier: Send + Sync {
    fn stringify(&self, value: &Value) -> Result<String, RuntimeError>;
}

pub trait Iteration: Send + Sync {
    fn iterate(&self, value: &Value) -> Result<IterationState, RuntimeError>;
}

/// An open iteration: arrays iterate over a snapshot taken at loop entry,
/// iterator values stay lazy
pub enum IterationState {
    Materialized { values: Vec<Value>, index: usize },
    Lazy(IteratorRef),
}

impl IterationState {
    pub fn next(&mut self) -> Result<Option<Value>, RuntimeError> {
        match self {
            IterationState::Materialized { values, index } => {
                let value = values.get(*index).cloned();
                if value.is_some() {
                    *index += 1;
                }
                Ok(value)
            }
            IterationState::Lazy(iter) => iter.next(),
        }
    }

    pub fn close(&mut self) {
        if let IterationState::Lazy(iter) = self {
            iter.close();
        }
    }
}

/// The capability set an interpreter evaluates with
#[derive(Clone)]
pub struct Capabilities {
    pub members: Arc<dyn MemberResolver>,
    pub operators: Arc<dyn OperatorEvaluator>,
    pub indexer: Arc<dyn Indexer>,
    pub stringifier: Arc<dyn Stringifier>,
    pub iteration: Arc<dyn Iteration>,
}

impl Capabilities {
    /// Standard capabilities with `methods` as the member resolver
    pub fn with_methods(methods: Arc<MethodTable>) -> Self {
        Capabilities {
            members: methods,
            operators: Arc::new(StandardOperators),
            indexer: Arc::new(StandardIndexer),
            stringifier: Arc::new(DisplayStringifier),
            iteration: Arc::new(StandardIteration),
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::with_methods(Arc::new(MethodTable::default()))
    }
}

/// Methods registered per type name (struct name or built-in type name)
#[derive(Default)]
pub struct MethodTable {
    methods: RwLock<FxHashMap<(Str, Str), Value>>,
}

impl MethodTable {
    pub fn register(&self, type_name: &str, name: &str, method: Value) {
        self.methods
            .write()
            .insert((type_name.into(), name.into()), method);
    }
}

impl MemberResolver for MethodTable {
    fn resolve_method(&self, receiver: &Value, name: &str) -> Option<Value> {
        let type_name: Str = match receiver {
            Value::Struct(s) => s.name.clone(),
            other => other.type_name().into(),
        };
        self.methods.read().get(&(type_name, Str::from(name))).cloned()
    }
}

pub struct StandardOperators;

fn arithmetic_error(message: &str) -> RuntimeError {
    RuntimeError::raise("ArithmeticError", message)
}

fn int_op(op: BinaryOp, a: i64, b: i64) -> Result<Value, RuntimeError> {
    let overflow = || arithmetic_error("integer overflow");
    let result = match op {
        BinaryOp::Add => a.checked_add(b).ok_or_else(overflow)?,
        BinaryOp::Sub => a.checked_sub(b).ok_or_else(overflow)?,
        BinaryOp::Mul => a.checked_mul(b).ok_or_else(overflow)?,
        BinaryOp::Div => {
            if b == 0 {
                return Err(RuntimeError::raise("DivisionByZero", "division by zero"));
            }
            a.checked_div(b).ok_or_else(overflow)?
        }
        BinaryOp::Mod => {
            if b == 0 {
                return Err(RuntimeError::raise("DivisionByZero", "division by zero"));
            }
            a.checked_rem(b).ok_or_else(overflow)?
        }
        BinaryOp::BitAnd => a & b,
        BinaryOp::BitOr => a | b,
        BinaryOp::BitXor => a ^ b,
        BinaryOp::Shl | BinaryOp::Shr => {
            let shift = u32::try_from(b)
                .ok()
                .filter(|s| *s < 64)
                .ok_or_else(|| arithmetic_error("shift amount out of range"))?;
            if op == BinaryOp::Shl {
                a << shift
            } else {
                a >> shift
            }
        }
        BinaryOp::Lt => return Ok(Value::Bool(a < b)),
        BinaryOp::LtEq => return Ok(Value::Bool(a <= b)),
        BinaryOp::Gt => return Ok(Value::Bool(a > b)),
        BinaryOp::GtEq => return Ok(Value::Bool(a >= b)),
        BinaryOp::Eq => return Ok(Value::Bool(a == b)),
        BinaryOp::NotEq => return Ok(Value::Bool(a != b)),
    };
    Ok(Value::Int(result))
}

fn float_op(op: BinaryOp, a: f64, b: f64) -> Option<Value> {
    Some(match op {
        BinaryOp::Add => Value::Float(a + b),
        BinaryOp::Sub => Value::Float(a - b),
        BinaryOp::Mul => Value::Float(a * b),
        BinaryOp::Div => Value::Float(a / b),
        BinaryOp::Mod => Value::Float(a % b),
        BinaryOp::Lt => Value::Bool(a < b),
        BinaryOp::LtEq => Value::Bool(a <= b),
        BinaryOp::Gt => Value::Bool(a > b),
        BinaryOp::GtEq => Value::Bool(a >= b),
        BinaryOp::Eq => Value::Bool(a == b),
        BinaryOp::NotEq => Value::Bool(a != b),
        _ => return None,
    })
}

fn ordering_op<T: PartialOrd>(op: BinaryOp, a: &T, b: &T) -> Option<Value> {
    Some(Value::Bool(match op {
        BinaryOp::Lt => a < b,
        BinaryOp::LtEq => a <= b,
        BinaryOp::Gt => a > b,
        BinaryOp::GtEq => a >= b,
        _ => return None,
    }))
}

impl OperatorEvaluator for StandardOperators {
    fn binary(&self, op: BinaryOp, left: &Value, right: &Value) -> Result<Value, RuntimeError> {
        let result = match (left, right) {
            (Value::Int(a), Value::Int(b)) => return int_op(op, *a, *b),
            (Value::Float(a), Value::Float(b)) => float_op(op, *a, *b),
            (Value::Int(a), Value::Float(b)) => float_op(op, *a as f64, *b),
            (Value::Float(a), Value::Int(b)) => float_op(op, *a, *b as f64),
            (Value::String(a), Value::String(b)) => ordering_op(op, &a.as_str(), &b.as_str()),
            (Value::Char(a), Value::Char(b)) => ordering_op(op, a, b),
            _ => None,
        };
        if let Some(value) = result {
            return Ok(value);
        }
        match op {
            BinaryOp::Eq => Ok(Value::Bool(left == right)),
            BinaryOp::NotEq => Ok(Value::Bool(left != right)),
            _ => Err(RuntimeError::type_error(format!(
                "unsupported operand types for {}: {} and {}",
                op.as_str(),
                left.type_name(),
                right.type_name()
            ))),
        }
    }

    fn unary(&self, op: UnaryOp, operand: &Value) -> Result<Value, RuntimeError> {
        match (op, operand) {
            (UnaryOp::Not, value) => Ok(Value::Bool(!value.is_truthy())),
            (UnaryOp::Neg, Value::Int(n)) => n
                .checked_neg()
                .map(Value::Int)
                .ok_or_else(|| arithmetic_error("integer overflow")),
            (UnaryOp::Neg, Value::Float(n)) => Ok(Value::Float(-n)),
            (UnaryOp::BitNot, Value::Int(n)) => Ok(Value::Int(!n)),
            (op, value) => Err(RuntimeError::type_error(format!(
                "unsupported operand type for {:?}: {}",
                op,
                value.type_name()
            ))),
        }
    }
}

pub struct StandardIndexer;

fn index_error(index: i64, len: usize) -> RuntimeError {
    RuntimeError::raise(
        "IndexError",
        format!("index {} out of bounds for length {}", index, len),
    )
}

impl Indexer for StandardIndexer {
    fn index_get(&self, object: &Value, index: &Value) -> Result<Value, RuntimeError> {
        match (object, index) {
            (Value::Array(items), Value::Int(i)) => usize::try_from(*i)
                .ok()
                .and_then(|i| items.get(i))
                .ok_or_else(|| index_error(*i, items.len())),
            (Value::String(s), Value::Int(i)) => usize::try_from(*i)
                .ok()
                .and_then(|i| s.as_str().chars().nth(i))
                .map(Value::Char)
                .ok_or_else(|| index_error(*i, s.as_str().chars().count())),
            (Value::Struct(s), Value::String(name)) => s.get_field(name.as_str()).ok_or_else(|| {
                RuntimeError::raise(
                    "MemberError",
                    format!("no field '{}' on {}", name, s.name),
                )
            }),
            (object, index) => Err(RuntimeError::type_error(format!(
                "cannot index {} with {}",
                object.type_name(),
                index.type_name()
            ))),
        }
    }

    fn index_set(&self, object: &Value, index: &Value, value: Value) -> Result<(), RuntimeError> {
        match (object, index) {
            (Value::Array(items), Value::Int(i)) => {
                let stored = usize::try_from(*i)
                    .ok()
                    .is_some_and(|idx| items.set(idx, value));
                if stored {
                    Ok(())
                } else {
                    Err(index_error(*i, items.len()))
                }
            }
            (Value::Struct(s), Value::String(name)) => {
                if s.set_field(name.as_str(), value) {
                    Ok(())
                } else {
                    Err(RuntimeError::raise(
                        "MemberError",
                        format!("no field '{}' on {}", name, s.name),
                    ))
                }
            }
            (object, index) => Err(RuntimeError::type_error(format!(
                "cannot assign into {} with index {}",
                object.type_name(),
                index.type_name()
            ))),
        }
    }
}

/// Stringifies with the value's `Display` form; strings render bare
pub struct DisplayStringifier;

impl Stringifier for DisplayStringifier {
    fn stringify(&self, value: &Value) -> Result<String, RuntimeError> {
        Ok(match value {
            Value::String(s) => s.as_str().to_string(),
            other => other.to_string(),
        })
    }
}

pub struct StandardIteration;

impl Iteration for StandardIteration {
    fn iterate(&self, value: &Value) -> Result<IterationState, RuntimeError> {
        match value {
            Value::Array(items) => Ok(IterationState::Materialized {
                values: items.snapshot(),
                index: 0,
            }),
            Value::Iterator(iter) => Ok(IterationState::Lazy(iter.clone())),
            Value::String(s) => Ok(IterationState::Materialized {
                values: s.as_str().chars().map(Value::Char).collect(),
                index: 0,
            }),
            other => Err(RuntimeError::type_error(format!(
                "value of type {} is not iterable",
                other.type_name()
            ))),
        }
    }
}
