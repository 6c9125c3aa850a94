use super::*;
use able_core::ast::{BinaryOp, Expression, Statement};

fn lock(mutex: &str) -> Statement {
    s(call("mutex_lock", vec![id(mutex)]))
}

fn unlock(mutex: &str) -> Statement {
    s(call("mutex_unlock", vec![id(mutex)]))
}

fn log(entry: &str) -> Statement {
    s(call("channel_send", vec![id("log"), string(entry)]))
}

#[test]
fn test_unlock_of_unlocked_mutex() {
    let body = vec![declare("m", call("mutex_new", vec![])), unlock("m")];
    assert_eq!(raised_kind_both(body).as_deref(), Some("MutexUnlocked"));
}

#[test]
fn test_try_lock() {
    let body = vec![
        declare("m", call("mutex_new", vec![])),
        s(Expression::array(vec![
            call("mutex_try_lock", vec![id("m")]),
            call("mutex_try_lock", vec![id("m")]),
        ])),
    ];
    assert_eq!(
        eval_both(body),
        Value::array(vec![Value::Bool(true), Value::Bool(false)])
    );
}

#[test]
fn test_mutex_methods() {
    let body = vec![
        declare("m", call("mutex_new", vec![])),
        s(Expression::method_call(id("m"), "lock", vec![])),
        s(Expression::method_call(id("m"), "unlock", vec![])),
        s(Expression::method_call(id("m"), "try_lock", vec![])),
    ];
    assert_eq!(eval_both(body), Value::Bool(true));
}

#[test]
fn test_cooperative_mutual_exclusion() {
    let worker = |first: &str, second: &str| {
        Expression::spawn(Expression::block(vec![
            lock("m"),
            log(first),
            s(call("future_yield", vec![])),
            log(second),
            unlock("m"),
        ]))
    };
    let entry = || call("channel_try_receive", vec![id("log")]);
    let body = vec![
        declare("log", call("channel_new", vec![int(10)])),
        declare("m", call("mutex_new", vec![])),
        declare("a", worker("a1", "a2")),
        declare("b", worker("b1", "b2")),
        s(call("future_flush", vec![])),
        s(Expression::array(vec![entry(), entry(), entry(), entry()])),
    ];
    assert_eq!(
        eval(body),
        Value::array(vec![
            Value::string("a1"),
            Value::string("a2"),
            Value::string("b1"),
            Value::string("b2"),
        ])
    );
}

#[test]
fn test_parallel_counter() {
    let count = || Expression::member(id("counter"), "n");
    let worker_body = Expression::spawn(Expression::block(vec![Statement::for_in(
        "j",
        Expression::range(int(0), int(20), false),
        vec![
            lock("m"),
            s(Expression::assign_member(
                id("counter"),
                "n",
                Expression::binary(BinaryOp::Add, count(), int(1)),
            )),
            unlock("m"),
        ],
    )]));
    let wait = |name: &str| s(call("future_value", vec![id(name)]));
    let body = vec![
        declare("m", call("mutex_new", vec![])),
        declare(
            "counter",
            Expression::struct_literal("Counter", vec![("n", int(0))]),
        ),
        Statement::function("worker", &[], worker_body),
        declare("a", call("worker", vec![])),
        declare("b", call("worker", vec![])),
        declare("c", call("worker", vec![])),
        declare("d", call("worker", vec![])),
        wait("a"),
        wait("b"),
        wait("c"),
        wait("d"),
        s(Expression::array(vec![
            count(),
            call("mutex_try_lock", vec![id("m")]),
        ])),
    ];
    let result = eval_result_with(
        test_config(ExecutorKind::Parallel, ExecMode::Bytecode),
        body,
    );
    assert_eq!(
        result.ok(),
        Some(Value::array(vec![Value::Int(80), Value::Bool(true)]))
    );
}

#[test]
fn test_host_double_lock_deadlocks() {
    let body = vec![
        declare("m", call("mutex_new", vec![])),
        lock("m"),
        lock("m"),
    ];
    assert_eq!(raised_kind_both(body).as_deref(), Some("Deadlock"));
}

#[test]
fn test_task_waits_for_host_unlock() {
    let body = vec![
        declare("m", call("mutex_new", vec![])),
        lock("m"),
        declare(
            "f",
            Expression::spawn(Expression::block(vec![lock("m"), s(string("got"))])),
        ),
        s(call("future_flush", vec![])),
        declare("before", call("future_status", vec![id("f")])),
        unlock("m"),
        s(Expression::array(vec![
            id("before"),
            call("future_value", vec![id("f")]),
        ])),
    ];
    assert_eq!(
        eval_both(body),
        Value::array(vec![Value::string("pending"), Value::string("got")])
    );
}

#[test]
fn test_lock_arm() {
    let body = vec![
        declare("m", call("mutex_new", vec![])),
        declare(
            "f",
            Expression::spawn(Expression::block(vec![
                s(Expression::await_arms(vec![Expression::method_call(
                    id("m"),
                    "lock_arm",
                    vec![],
                )])),
                s(call("mutex_try_lock", vec![id("m")])),
            ])),
        ),
        declare("held", call("future_value", vec![id("f")])),
        unlock("m"),
        s(Expression::array(vec![
            id("held"),
            call("mutex_try_lock", vec![id("m")]),
        ])),
    ];
    assert_eq!(
        eval_both(body),
        Value::array(vec![Value::Bool(false), Value::Bool(true)])
    );
}
