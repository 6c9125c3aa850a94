use super::*;
use able_core::ast::{Expression, MatchClause, Module, Pattern, Statement};
use able_core::value::NativeFunction;

/// `future_value(spawn(await [arms...]))`
fn await_in_task(arms: Vec<Expression>) -> Expression {
    call(
        "future_value",
        vec![Expression::spawn(Expression::await_arms(arms))],
    )
}

fn default_arm(value: i64) -> Expression {
    call("await_default", vec![Expression::lambda(&[], int(value))])
}

#[test]
fn test_default_arm_runs_callback() {
    let body = vec![
        declare("ch", call("channel_new", vec![int(1)])),
        s(await_in_task(vec![
            call("channel_receive_arm", vec![id("ch")]),
            default_arm(5),
        ])),
    ];
    assert_eq!(eval_both(body), Value::Int(5));
}

#[test]
fn test_default_arm_without_callback_is_nil() {
    let body = vec![s(await_in_task(vec![call("await_default", vec![])]))];
    assert_eq!(eval_both(body), Value::Nil);
}

#[test]
fn test_ready_future_arm() {
    let body = vec![
        declare("g", Expression::spawn(int(10))),
        s(call("future_flush", vec![])),
        s(await_in_task(vec![id("g"), default_arm(0)])),
    ];
    assert_eq!(eval_both(body), Value::Int(10));
}

#[test]
fn test_channel_receive_arm() {
    let body = vec![
        declare("ch", call("channel_new", vec![int(1)])),
        s(call("channel_send", vec![id("ch"), string("hi")])),
        s(await_in_task(vec![Expression::method_call(
            id("ch"),
            "receive_arm",
            vec![],
        )])),
    ];
    assert_eq!(eval_both(body), Value::string("hi"));
}

#[test]
fn test_channel_send_arm() {
    let body = vec![
        declare("ch", call("channel_new", vec![int(1)])),
        declare(
            "sent",
            await_in_task(vec![call("channel_send_arm", vec![id("ch"), int(8)])]),
        ),
        s(Expression::array(vec![
            id("sent"),
            call("channel_try_receive", vec![id("ch")]),
        ])),
    ];
    assert_eq!(
        eval_both(body),
        Value::array(vec![Value::Nil, Value::Int(8)])
    );
}

#[test]
fn test_sleep_arm() {
    let body = vec![s(await_in_task(vec![call(
        "await_sleep",
        vec![int(10), string("slept")],
    )]))];
    assert_eq!(eval_both(body), Value::string("slept"));
}

#[test]
fn test_sleep_arm_loses_to_ready_arm() {
    let body = vec![
        declare("ch", call("channel_new", vec![int(1)])),
        s(call("channel_send", vec![id("ch"), int(1)])),
        s(await_in_task(vec![
            call("await_sleep", vec![int(5_000), string("slept")]),
            id("ch"),
        ])),
    ];
    assert_eq!(eval_both(body), Value::Int(1));
}

#[test]
fn test_first_ready_arm_in_order() {
    let body = vec![
        declare("empty", call("channel_new", vec![int(1)])),
        declare("g", Expression::spawn(int(2))),
        s(call("future_flush", vec![])),
        s(await_in_task(vec![
            call("channel_receive_arm", vec![id("empty")]),
            id("g"),
            default_arm(3),
        ])),
    ];
    assert_eq!(eval_both(body), Value::Int(2));

    let both_ready = vec![
        declare("ch", call("channel_new", vec![int(1)])),
        s(call("channel_send", vec![id("ch"), int(1)])),
        declare("g", Expression::spawn(int(2))),
        s(call("future_flush", vec![])),
        s(await_in_task(vec![id("ch"), id("g")])),
    ];
    assert_eq!(eval_both(both_ready), Value::Int(1));
}

#[test]
fn test_await_wakes_on_channel_send() {
    let body = vec![
        declare("ch", call("channel_new", vec![int(1)])),
        declare(
            "f",
            Expression::spawn(Expression::await_arms(vec![id("ch")])),
        ),
        s(call("future_flush", vec![])),
        declare("before", call("future_status", vec![id("f")])),
        s(call("channel_send", vec![id("ch"), int(5)])),
        s(Expression::array(vec![
            id("before"),
            call("future_value", vec![id("f")]),
        ])),
    ];
    assert_eq!(
        eval_both(body),
        Value::array(vec![Value::string("pending"), Value::Int(5)])
    );
}

fn raised_in_task(arms: Vec<Expression>) -> Vec<Statement> {
    vec![s(Expression::rescue(
        await_in_task(arms),
        vec![MatchClause::new(
            Pattern::binding("e"),
            None,
            Expression::member(id("e"), "kind"),
        )],
    ))]
}

#[test]
fn test_two_default_arms_rejected() {
    let body = raised_in_task(vec![
        call("await_default", vec![]),
        call("await_default", vec![]),
    ]);
    assert_eq!(eval_both(body), Value::string("AwaitError"));
}

#[test]
fn test_non_awaitable_arm_rejected() {
    let body = raised_in_task(vec![int(5)]);
    assert_eq!(eval_both(body), Value::string("TypeError"));
}

#[test]
fn test_struct_awaitable() {
    for mode in [ExecMode::Bytecode, ExecMode::TreeWalker] {
        let runtime = create_test_runtime(ExecutorKind::Cooperative, mode);
        let interp = runtime.interpreter();
        interp.register_method(
            "Ticket",
            "is_ready",
            Value::Native(NativeFunction::new("is_ready", Some(1), |_, _| {
                Ok(Value::Bool(true))
            })),
        );
        interp.register_method(
            "Ticket",
            "register",
            Value::Native(NativeFunction::new("register", Some(2), |_, _| Ok(Value::Nil))),
        );
        interp.register_method(
            "Ticket",
            "commit",
            Value::Native(NativeFunction::new("commit", Some(1), |_, args| {
                Ok(match args.first() {
                    Some(Value::Struct(ticket)) => ticket.get_field("v").unwrap_or_default(),
                    _ => Value::Nil,
                })
            })),
        );
        let module = Module::new(vec![s(await_in_task(vec![Expression::struct_literal(
            "Ticket",
            vec![("v", int(99))],
        )]))]);
        assert_eq!(runtime.eval_module(&module).ok(), Some(Value::Int(99)));
    }
}
