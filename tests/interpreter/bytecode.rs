//! Hand-assembled programs that pin down individual VM instructions

use super::*;
use able_core::compiler::{Instruction, Op, Program};
use able_core::{Interpreter, Str};
use std::sync::Arc;

fn program(ops: Vec<Op>) -> Arc<Program> {
    Arc::new(Program {
        code: ops
            .into_iter()
            .map(|op| Instruction { op, span: None })
            .collect(),
        name: None,
    })
}

fn run(ops: Vec<Op>) -> Result<Value, RuntimeError> {
    init_tracing();
    let interp = Interpreter::new(RuntimeConfig::default());
    let env = interp.globals().clone();
    interp.run_bytecode(program(ops), env)
}

/// EnterScope; x := 1; ExitScope `count`; load x
fn scoped_load(count: usize) -> Vec<Op> {
    vec![
        Op::EnterScope,
        Op::Const {
            value: Value::Int(1),
        },
        Op::DeclareName {
            name: Str::from("x"),
        },
        Op::Pop,
        Op::ExitScope { count },
        Op::LoadName {
            name: Str::from("x"),
        },
        Op::Return,
    ]
}

#[test]
fn test_exit_scope_zero_keeps_current_scope() {
    assert_eq!(run(scoped_load(0)).ok(), Some(Value::Int(1)));
}

#[test]
fn test_exit_scope_unwinds_exact_count() {
    assert_eq!(
        raised_kind(run(scoped_load(1))).as_deref(),
        Some("ReferenceError")
    );
}

#[test]
fn test_exit_scope_never_passes_root() {
    let result = run(vec![
        Op::ExitScope { count: 1 },
        Op::Const { value: Value::Nil },
        Op::Return,
    ]);
    assert!(matches!(result, Err(RuntimeError::Internal(_))));
}
