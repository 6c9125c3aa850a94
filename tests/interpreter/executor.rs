//! Thread-per-task executor

use super::*;
use able_core::ast::{BinaryOp, Expression, MatchClause, Pattern, Statement};

fn parallel(mode: ExecMode) -> RuntimeConfig {
    test_config(ExecutorKind::Parallel, mode)
}

#[allow(clippy::expect_used)]
fn eval_parallel(body: Vec<Statement>) -> Value {
    let vm = eval_result_with(parallel(ExecMode::Bytecode), body.clone())
        .expect("parallel bytecode evaluation failed");
    let tree = eval_result_with(parallel(ExecMode::TreeWalker), body)
        .expect("parallel tree-walker evaluation failed");
    assert_eq!(vm, tree, "bytecode and tree-walker disagree");
    vm
}

#[test]
fn test_parallel_spawn_value() {
    let body = vec![
        declare(
            "f",
            Expression::spawn(Expression::binary(BinaryOp::Mul, int(6), int(7))),
        ),
        s(call("future_value", vec![id("f")])),
    ];
    assert_eq!(eval_parallel(body), Value::Int(42));
}

#[test]
fn test_parallel_channel_rendezvous() {
    let body = vec![
        declare("ch", call("channel_new", vec![int(0)])),
        declare(
            "f",
            Expression::spawn(call("channel_send", vec![id("ch"), int(7)])),
        ),
        declare("r", call("channel_receive", vec![id("ch")])),
        s(call("future_value", vec![id("f")])),
        s(id("r")),
    ];
    assert_eq!(eval_parallel(body), Value::Int(7));
}

#[test]
fn test_parallel_fan_in() {
    let receive = || call("channel_receive", vec![id("ch")]);
    let add = |a: Expression, b: Expression| Expression::binary(BinaryOp::Add, a, b);
    let body = vec![
        declare("ch", call("channel_new", vec![int(0)])),
        Statement::for_in(
            "i",
            Expression::range(int(0), int(4), false),
            vec![s(Expression::spawn(call(
                "channel_send",
                vec![id("ch"), id("i")],
            )))],
        ),
        s(add(add(receive(), receive()), add(receive(), receive()))),
    ];
    assert_eq!(eval_parallel(body), Value::Int(6));
}

#[test]
fn test_parallel_flush_waits_for_tasks() {
    let status = |name: &str| call("future_status", vec![id(name)]);
    let body = vec![
        declare("a", Expression::spawn(int(1))),
        declare(
            "b",
            Expression::spawn(Expression::block(vec![
                s(call("future_yield", vec![])),
                s(int(2)),
            ])),
        ),
        s(call("future_flush", vec![])),
        s(Expression::array(vec![
            status("a"),
            status("b"),
            call("future_pending_tasks", vec![]),
        ])),
    ];
    assert_eq!(
        eval_parallel(body),
        Value::array(vec![
            Value::string("resolved"),
            Value::string("resolved"),
            Value::Int(0),
        ])
    );
}

#[test]
fn test_parallel_failure_propagates() {
    let body = vec![
        declare(
            "f",
            Expression::spawn(Expression::binary(BinaryOp::Div, int(1), int(0))),
        ),
        s(Expression::rescue(
            call("future_value", vec![id("f")]),
            vec![MatchClause::new(
                Pattern::binding("e"),
                None,
                Expression::member(id("e"), "kind"),
            )],
        )),
    ];
    assert_eq!(eval_parallel(body), Value::string("DivisionByZero"));
}

#[test]
fn test_runtime_reports_executor_kind() {
    let runtime = create_test_runtime(ExecutorKind::Parallel, ExecMode::Bytecode);
    assert_eq!(runtime.config().executor, ExecutorKind::Parallel);
    assert_eq!(runtime.interpreter().executor_kind(), ExecutorKind::Parallel);
}

#[test]
fn test_config_from_json() {
    let config = RuntimeConfig::from_json(r#"{"executor": "parallel", "max_call_depth": 64}"#);
    assert!(matches!(
        config,
        Ok(RuntimeConfig {
            executor: ExecutorKind::Parallel,
            exec_mode: ExecMode::Bytecode,
            max_call_depth: 64,
            ..
        })
    ));
}

#[test]
fn test_config_from_invalid_json() {
    assert!(RuntimeConfig::from_json(r#"{"executor": "threads"}"#).is_err());
}
