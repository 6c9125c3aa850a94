use super::*;
use able_core::ast::{BinaryOp, Expression, MatchClause, Pattern, Statement};

fn send(channel: &str, value: Expression) -> Statement {
    s(call("channel_send", vec![id(channel), value]))
}

fn receive(channel: &str) -> Expression {
    call("channel_receive", vec![id(channel)])
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
fn test_blocked_receiver_completes_after_host_send() {
    let body = vec![
        declare("ch", call("channel_new", vec![int(0)])),
        declare("f", Expression::spawn(receive("ch"))),
        s(call("future_flush", vec![])),
        send("ch", int(42)),
        s(call("future_value", vec![id("f")])),
    ];
    assert_eq!(eval_both(body), Value::Int(42));
}

#[test]
fn test_blocked_sender_unblocks_on_receive() {
    let body = vec![
        declare("ch", call("channel_new", vec![int(0)])),
        declare(
            "f",
            Expression::spawn(Expression::block(vec![
                send("ch", string("x")),
                s(string("sent")),
            ])),
        ),
        s(call("future_flush", vec![])),
        declare("r", receive("ch")),
        s(Expression::array(vec![
            id("r"),
            call("future_value", vec![id("f")]),
        ])),
    ];
    assert_eq!(
        eval_both(body),
        Value::array(vec![Value::string("x"), Value::string("sent")])
    );
}

#[test]
fn test_buffered_channel_is_fifo() {
    let body = vec![
        declare("ch", call("channel_new", vec![int(2)])),
        send("ch", int(1)),
        send("ch", int(2)),
        s(Expression::array(vec![receive("ch"), receive("ch")])),
    ];
    assert_eq!(eval_both(body), ints(&[1, 2]));
}

#[test]
fn test_producer_consumer_tasks() {
    let producer = Expression::spawn(Expression::block(vec![
        Statement::for_in(
            "i",
            Expression::range(int(1), int(3), true),
            vec![send("ch", id("i"))],
        ),
        s(call("channel_close", vec![id("ch")])),
    ]));
    let body = vec![
        declare("ch", call("channel_new", vec![int(0)])),
        declare("p", producer),
        declare(
            "total",
            Expression::spawn(Expression::block(vec![
                declare("sum", int(0)),
                declare("v", receive("ch")),
                Statement::while_loop(
                    Expression::binary(BinaryOp::NotEq, id("v"), Expression::nil()),
                    vec![
                        assign(
                            "sum",
                            Expression::binary(BinaryOp::Add, id("sum"), id("v")),
                        ),
                        assign("v", receive("ch")),
                    ],
                ),
                s(id("sum")),
            ])),
        ),
        s(call("future_value", vec![id("total")])),
    ];
    assert_eq!(eval_both(body), Value::Int(6));
}

#[test]
fn test_close_fails_parked_sender() {
    let body = vec![
        declare("ch", call("channel_new", vec![int(0)])),
        declare(
            "f",
            Expression::spawn(Expression::block(vec![
                send("ch", int(1)),
                s(Expression::string("sent")),
            ])),
        ),
        s(call("future_flush", vec![])),
        s(call("channel_close", vec![id("ch")])),
        declare("r", receive("ch")),
        s(Expression::array(vec![
            id("r"),
            kind_of(call("future_value", vec![id("f")])),
            call("future_status", vec![id("f")]),
        ])),
    ];
    assert_eq!(
        eval_both(body),
        Value::array(vec![
            Value::Nil,
            Value::string("ChannelSendOnClosed"),
            Value::string("failed"),
        ])
    );
}

#[test]
fn test_receive_on_closed_channel_is_nil() {
    let body = vec![
        declare("ch", call("channel_new", vec![int(1)])),
        send("ch", int(3)),
        s(call("channel_close", vec![id("ch")])),
        s(Expression::array(vec![receive("ch"), receive("ch")])),
    ];
    assert_eq!(
        eval_both(body),
        Value::array(vec![Value::Int(3), Value::Nil])
    );
}

#[test]
fn test_send_on_closed_channel() {
    let body = vec![
        declare("ch", call("channel_new", vec![int(1)])),
        s(call("channel_close", vec![id("ch")])),
        send("ch", int(1)),
    ];
    assert_eq!(
        raised_kind_both(body).as_deref(),
        Some("ChannelSendOnClosed")
    );
}

#[test]
fn test_double_close() {
    let body = vec![
        declare("ch", call("channel_new", vec![int(1)])),
        s(call("channel_close", vec![id("ch")])),
        s(kind_of(call("channel_close", vec![id("ch")]))),
    ];
    assert_eq!(eval_both(body), Value::string("ChannelClosed"));
}

#[test]
fn test_close_wakes_blocked_receiver() {
    let body = vec![
        declare("ch", call("channel_new", vec![int(0)])),
        declare("f", Expression::spawn(receive("ch"))),
        s(call("future_flush", vec![])),
        s(call("channel_close", vec![id("ch")])),
        s(call("future_value", vec![id("f")])),
    ];
    assert_eq!(eval_both(body), Value::Nil);
}

#[test]
fn test_host_send_without_receiver_deadlocks() {
    let body = vec![
        declare("ch", call("channel_new", vec![int(0)])),
        send("ch", int(1)),
    ];
    assert_eq!(raised_kind_both(body).as_deref(), Some("Deadlock"));
}

#[test]
fn test_try_send_and_try_receive() {
    let body = vec![
        declare("ch", call("channel_new", vec![int(1)])),
        s(Expression::array(vec![
            call("channel_try_send", vec![id("ch"), int(1)]),
            call("channel_try_send", vec![id("ch"), int(2)]),
            call("channel_try_receive", vec![id("ch")]),
            call("channel_try_receive", vec![id("ch")]),
        ])),
    ];
    assert_eq!(
        eval_both(body),
        Value::array(vec![
            Value::Bool(true),
            Value::Bool(false),
            Value::Int(1),
            Value::Nil,
        ])
    );
}

#[test]
fn test_channel_methods() {
    let body = vec![
        declare("ch", call("channel_new", vec![int(1)])),
        s(Expression::method_call(id("ch"), "send", vec![int(11)])),
        s(Expression::method_call(id("ch"), "receive", vec![])),
    ];
    assert_eq!(eval_both(body), Value::Int(11));
}

#[test]
fn test_negative_capacity_is_value_error() {
    let body = vec![s(call("channel_new", vec![int(-1)]))];
    assert_eq!(raised_kind_both(body).as_deref(), Some("ValueError"));
}

#[test]
fn test_parallel_buffered_channel() {
    let body = vec![
        declare("ch", call("channel_new", vec![int(4)])),
        declare(
            "f",
            Expression::spawn(Expression::block(vec![
                send("ch", int(1)),
                send("ch", int(2)),
            ])),
        ),
        s(call("future_value", vec![id("f")])),
        s(Expression::array(vec![receive("ch"), receive("ch")])),
    ];
    let result = eval_result_with(
        test_config(ExecutorKind::Parallel, ExecMode::Bytecode),
        body,
    );
    assert_eq!(result.ok(), Some(ints(&[1, 2])));
}
