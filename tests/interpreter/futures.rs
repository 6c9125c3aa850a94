use super::*;
use able_core::Interpreter;
use able_core::ast::{BinaryOp, Expression, MatchClause, Module, Pattern, Statement};
use able_core::runtime::{AsyncPayload, Future, PayloadHooks};

fn spawn(body: Expression) -> Expression {
    Expression::spawn(body)
}

fn kind_of(expr: Expression) -> Expression {
    Expression::rescue(
        expr,
        vec![MatchClause::new(
            Pattern::binding("e"),
            None,
            Expression::member(id("e"), "kind"),
        )],
    )
}

#[test]
fn test_spawn_and_value() {
    let body = vec![
        declare(
            "f",
            spawn(Expression::binary(BinaryOp::Add, int(1), int(2))),
        ),
        s(Expression::array(vec![
            call("future_value", vec![id("f")]),
            Expression::method_call(id("f"), "value", vec![]),
        ])),
    ];
    assert_eq!(eval_both(body), ints(&[3, 3]));
}

#[test]
fn test_status_transitions_after_flush() {
    let body = vec![
        declare("f", spawn(int(1))),
        declare("before", call("future_status", vec![id("f")])),
        s(call("future_flush", vec![])),
        s(Expression::array(vec![
            id("before"),
            call("future_status", vec![id("f")]),
        ])),
    ];
    assert_eq!(
        eval_both(body),
        Value::array(vec![Value::string("pending"), Value::string("resolved")])
    );
}

#[test]
fn test_failed_task_reraises_on_value() {
    let body = vec![
        declare(
            "f",
            spawn(Expression::binary(BinaryOp::Div, int(1), int(0))),
        ),
        s(call("future_flush", vec![])),
        declare("status", call("future_status", vec![id("f")])),
        s(Expression::array(vec![
            id("status"),
            kind_of(call("future_value", vec![id("f")])),
        ])),
    ];
    assert_eq!(
        eval_both(body),
        Value::array(vec![
            Value::string("failed"),
            Value::string("DivisionByZero"),
        ])
    );
}

#[test]
fn test_cancel_before_start() {
    let body = vec![
        declare("f", spawn(int(1))),
        s(call("future_cancel", vec![id("f")])),
        s(Expression::array(vec![
            call("future_status", vec![id("f")]),
            kind_of(call("future_value", vec![id("f")])),
        ])),
    ];
    assert_eq!(
        eval_both(body),
        Value::array(vec![
            Value::string("cancelled"),
            Value::string("FutureCancelled"),
        ])
    );
}

#[test]
fn test_cancel_after_completion_is_noop() {
    let body = vec![
        declare("f", spawn(int(9))),
        s(call("future_flush", vec![])),
        s(Expression::method_call(id("f"), "cancel", vec![])),
        s(Expression::array(vec![
            Expression::method_call(id("f"), "status", vec![]),
            call("future_value", vec![id("f")]),
        ])),
    ];
    assert_eq!(
        eval_both(body),
        Value::array(vec![Value::string("resolved"), Value::Int(9)])
    );
}

#[test]
fn test_yield_interleaves_tasks() {
    let task = |first: i64, second: i64| {
        spawn(Expression::block(vec![
            s(call("channel_send", vec![id("log"), int(first)])),
            s(call("future_yield", vec![])),
            s(call("channel_send", vec![id("log"), int(second)])),
        ]))
    };
    let drain = || call("channel_try_receive", vec![id("log")]);
    let body = vec![
        declare("log", call("channel_new", vec![int(10)])),
        declare("a", task(1, 3)),
        declare("b", task(2, 4)),
        s(call("future_flush", vec![])),
        s(Expression::array(vec![drain(), drain(), drain(), drain()])),
    ];
    assert_eq!(eval_both(body), ints(&[1, 2, 3, 4]));
}

#[test]
fn test_resumed_task_keeps_earlier_side_effects() {
    let body = vec![
        declare("counter", int(0)),
        declare(
            "f",
            spawn(Expression::block(vec![
                assign(
                    "counter",
                    Expression::binary(BinaryOp::Add, id("counter"), int(1)),
                ),
                s(call("future_yield", vec![])),
                s(id("counter")),
            ])),
        ),
        s(call("future_value", vec![id("f")])),
    ];
    assert_eq!(eval_both(body), Value::Int(1));
}

#[test]
fn test_task_yields_repeatedly() {
    let body = vec![s(call(
        "future_value",
        vec![spawn(Expression::block(vec![
            s(call("future_yield", vec![])),
            s(call("future_yield", vec![])),
            s(int(7)),
        ]))],
    ))];
    assert_eq!(eval_both(body), Value::Int(7));
}

#[test]
fn test_yield_inside_called_function_resumes_caller() {
    let body = vec![
        declare("steps", call("channel_new", vec![int(10)])),
        Statement::function(
            "pause",
            &["n"],
            Expression::block(vec![
                s(call("channel_send", vec![id("steps"), id("n")])),
                s(call("future_yield", vec![])),
                s(Expression::binary(BinaryOp::Mul, id("n"), int(10))),
            ]),
        ),
        declare(
            "f",
            spawn(Expression::binary(
                BinaryOp::Add,
                call("pause", vec![int(1)]),
                call("pause", vec![int(2)]),
            )),
        ),
        declare("total", call("future_value", vec![id("f")])),
        s(Expression::array(vec![
            id("total"),
            call("channel_try_receive", vec![id("steps")]),
            call("channel_try_receive", vec![id("steps")]),
            call("channel_try_receive", vec![id("steps")]),
        ])),
    ];
    assert_eq!(
        eval_both(body),
        Value::array(vec![Value::Int(30), Value::Int(1), Value::Int(2), Value::Nil])
    );
}

#[test]
fn test_pending_task_count() {
    let runtime = create_test_runtime(ExecutorKind::Cooperative, ExecMode::Bytecode);
    let module = Module::new(vec![
        s(spawn(int(1))),
        s(spawn(int(2))),
        s(call("future_pending_tasks", vec![])),
    ]);
    assert_eq!(runtime.eval_module(&module).ok(), Some(Value::Int(2)));
    assert_eq!(runtime.pending_tasks(), 0);
}

#[test]
fn test_tasks_deferred_without_auto_drain() {
    let mut config = test_config(ExecutorKind::Cooperative, ExecMode::Bytecode);
    config.auto_drain = false;
    init_tracing();
    let runtime = Runtime::with_config(config);
    let module = Module::new(vec![s(spawn(int(1)))]);
    assert!(matches!(runtime.eval_module(&module), Ok(Value::Future(_))));
    assert_eq!(runtime.pending_tasks(), 1);
    runtime.flush();
    assert_eq!(runtime.pending_tasks(), 0);
}

#[test]
fn test_await_outside_task() {
    let body = vec![s(Expression::await_arms(vec![call("await_default", vec![])]))];
    assert_eq!(raised_kind_both(body).as_deref(), Some("AsyncContextError"));
}

#[test]
fn test_cancelled_query_outside_task() {
    let body = vec![s(call("future_cancelled", vec![]))];
    assert_eq!(raised_kind_both(body).as_deref(), Some("AsyncContextError"));
}

#[test]
fn test_cancelled_query_inside_task() {
    let body = vec![
        declare("f", spawn(call("future_cancelled", vec![]))),
        s(call("future_value", vec![id("f")])),
    ];
    assert_eq!(eval_both(body), Value::Bool(false));
}

#[test]
fn test_cancel_blocked_receiver_runs_ensure() {
    let body = vec![
        declare("ch", call("channel_new", vec![int(0)])),
        declare("cleaned", Expression::bool(false)),
        declare(
            "f",
            spawn(Expression::ensure(
                call("channel_receive", vec![id("ch")]),
                vec![assign("cleaned", Expression::bool(true))],
            )),
        ),
        s(call("future_flush", vec![])),
        declare("blocked", call("future_status", vec![id("f")])),
        s(call("future_cancel", vec![id("f")])),
        s(call("future_flush", vec![])),
        s(Expression::array(vec![
            id("blocked"),
            call("future_status", vec![id("f")]),
            id("cleaned"),
        ])),
    ];
    assert_eq!(
        eval_both(body),
        Value::array(vec![
            Value::string("pending"),
            Value::string("cancelled"),
            Value::Bool(true),
        ])
    );
}

#[test]
fn test_spawn_captures_closure_environment() {
    let body = vec![
        Statement::function(
            "compute",
            &["x"],
            spawn(Expression::binary(BinaryOp::Mul, id("x"), int(2))),
        ),
        s(call("future_value", vec![call("compute", vec![int(21)])])),
    ];
    assert_eq!(eval_both(body), Value::Int(42));
}

#[test]
fn test_task_waits_on_nested_task() {
    let inner = call("future_value", vec![spawn(int(5))]);
    let body = vec![
        declare(
            "f",
            spawn(Expression::binary(BinaryOp::Add, inner, int(1))),
        ),
        s(call("future_value", vec![id("f")])),
    ];
    assert_eq!(eval_both(body), Value::Int(6));
}

#[test]
fn test_future_value_rejects_non_future() {
    let body = vec![s(call("future_value", vec![int(1)]))];
    assert_eq!(raised_kind_both(body).as_deref(), Some("TypeError"));
}

#[test]
fn test_repeated_waits_register_one_awaiter() {
    let interp = Interpreter::new(RuntimeConfig::default());
    let target = Future::new();
    let waiter = AsyncPayload::new(
        Future::new(),
        ExecutorKind::Cooperative,
        PayloadHooks::default(),
    );
    for _ in 0..3 {
        assert!(matches!(
            interp.future_value(&target, Some(&waiter)),
            Err(RuntimeError::Yield)
        ));
        // A spurious wake-up before the retry
        waiter.wake();
    }
    assert_eq!(target.awaiter_count(), 1);

    target.resolve(Value::Int(4));
    assert_eq!(target.awaiter_count(), 0);
    assert_eq!(
        interp.future_value(&target, Some(&waiter)).ok(),
        Some(Value::Int(4))
    );
}
