//! Interpreter integration tests
//!
//! Programs are built directly from AST constructors; most scenarios run in
//! both the bytecode VM and the tree-walker to keep the two engines in step.

mod await_arms;
mod basics;
mod bytecode;
mod channels;
mod control_flow;
mod errors;
mod executor;
mod futures;
mod mutex;

use able_core::ast::{Expression, Module, Statement};
use able_core::{ExecMode, ExecutorKind, Runtime, RuntimeConfig, RuntimeError, Value};
use std::sync::Once;

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn test_config(executor: ExecutorKind, mode: ExecMode) -> RuntimeConfig {
    RuntimeConfig::default()
        .with_executor(executor)
        .with_exec_mode(mode)
}

pub fn create_test_runtime(executor: ExecutorKind, mode: ExecMode) -> Runtime {
    init_tracing();
    Runtime::with_config(test_config(executor, mode))
}

/// Evaluate a module under an explicit configuration
pub fn eval_result_with(config: RuntimeConfig, body: Vec<Statement>) -> Result<Value, RuntimeError> {
    init_tracing();
    Runtime::with_config(config).eval_module(&Module::new(body))
}

/// Evaluate on the cooperative executor with the bytecode engine
pub fn eval_result(body: Vec<Statement>) -> Result<Value, RuntimeError> {
    eval_result_with(
        test_config(ExecutorKind::Cooperative, ExecMode::Bytecode),
        body,
    )
}

#[allow(clippy::expect_used)]
pub fn eval(body: Vec<Statement>) -> Value {
    eval_result(body).expect("module evaluation failed")
}

#[allow(clippy::expect_used)]
pub fn eval_tree(body: Vec<Statement>) -> Value {
    eval_result_with(
        test_config(ExecutorKind::Cooperative, ExecMode::TreeWalker),
        body,
    )
    .expect("tree-walker evaluation failed")
}

/// Evaluate in both engines and require identical results
pub fn eval_both(body: Vec<Statement>) -> Value {
    let vm = eval(body.clone());
    let tree = eval_tree(body);
    assert_eq!(vm, tree, "bytecode and tree-walker disagree");
    vm
}

/// Kind of the error a module raised, if it raised one
pub fn raised_kind(result: Result<Value, RuntimeError>) -> Option<String> {
    result
        .err()
        .and_then(|err| err.raised_kind())
        .map(|kind| kind.as_str().to_string())
}

pub fn raised_kind_both(body: Vec<Statement>) -> Option<String> {
    let vm = raised_kind(eval_result(body.clone()));
    let tree = raised_kind(eval_result_with(
        test_config(ExecutorKind::Cooperative, ExecMode::TreeWalker),
        body,
    ));
    assert_eq!(vm, tree, "bytecode and tree-walker raised different kinds");
    vm
}

// ═══════════════════════════════════════════════════════════════════════════════
// Builders
// ═══════════════════════════════════════════════════════════════════════════════

pub fn s(expr: Expression) -> Statement {
    Statement::expr(expr)
}

pub fn declare(name: &str, value: Expression) -> Statement {
    s(Expression::declare(name, value))
}

pub fn assign(name: &str, value: Expression) -> Statement {
    s(Expression::assign(name, value))
}

pub fn call(name: &str, args: Vec<Expression>) -> Expression {
    Expression::call_named(name, args)
}

pub fn id(name: &str) -> Expression {
    Expression::ident(name)
}

pub fn int(n: i64) -> Expression {
    Expression::int(n)
}

pub fn string(value: &str) -> Expression {
    Expression::string(value)
}

pub fn ints(values: &[i64]) -> Value {
    Value::array(values.iter().map(|n| Value::Int(*n)).collect())
}
