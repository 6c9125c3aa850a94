use super::*;
use able_core::ast::{BinaryOp, Expression, MatchClause, Pattern, Statement};

fn divide_by_zero() -> Expression {
    Expression::binary(BinaryOp::Div, int(1), int(0))
}

fn clause(pattern: Pattern, body: Expression) -> MatchClause {
    MatchClause::new(pattern, None, body)
}

#[test]
fn test_division_by_zero_raises() {
    assert_eq!(
        raised_kind_both(vec![s(divide_by_zero())]).as_deref(),
        Some("DivisionByZero")
    );
}

#[test]
fn test_typed_rescue_binds_error() {
    let body = vec![s(Expression::rescue(
        divide_by_zero(),
        vec![clause(
            Pattern::typed("DivisionByZero", Pattern::binding("e")),
            Expression::member(id("e"), "message"),
        )],
    ))];
    assert_eq!(eval_both(body), Value::string("division by zero"));
}

#[test]
fn test_rescue_passes_through_success() {
    let body = vec![s(Expression::rescue(
        int(5),
        vec![clause(Pattern::Wildcard, int(0))],
    ))];
    assert_eq!(eval_both(body), Value::Int(5));
}

#[test]
fn test_unmatched_rescue_reraises() {
    let body = vec![s(Expression::rescue(
        divide_by_zero(),
        vec![clause(Pattern::typed("TypeError", Pattern::Wildcard), int(0))],
    ))];
    assert_eq!(raised_kind_both(body).as_deref(), Some("DivisionByZero"));
}

#[test]
fn test_rescue_clauses_in_order() {
    let body = vec![s(Expression::rescue(
        divide_by_zero(),
        vec![
            clause(Pattern::typed("TypeError", Pattern::Wildcard), string("type")),
            clause(Pattern::typed("Error", Pattern::Wildcard), string("any")),
            clause(Pattern::Wildcard, string("wildcard")),
        ],
    ))];
    assert_eq!(eval_both(body), Value::string("any"));
}

#[test]
fn test_ensure_runs_on_raise() {
    let body = vec![
        declare("x", int(0)),
        declare(
            "r",
            Expression::rescue(
                Expression::ensure(
                    Expression::block(vec![Statement::raise(string("boom"))]),
                    vec![assign("x", int(1))],
                ),
                vec![clause(
                    Pattern::binding("e"),
                    Expression::member(id("e"), "message"),
                )],
            ),
        ),
        s(Expression::array(vec![id("x"), id("r")])),
    ];
    assert_eq!(
        eval_both(body),
        Value::array(vec![Value::Int(1), Value::string("boom")])
    );
}

#[test]
fn test_ensure_runs_on_break() {
    let guarded = Expression::ensure(
        Expression::block(vec![Statement::break_loop(None, None)]),
        vec![assign(
            "count",
            Expression::binary(BinaryOp::Add, id("count"), int(1)),
        )],
    );
    let body = vec![
        declare("count", int(0)),
        s(Expression::loop_expr(None, vec![s(guarded)])),
        s(id("count")),
    ];
    assert_eq!(eval_both(body), Value::Int(1));
}

#[test]
fn test_ensure_keeps_body_value() {
    let body = vec![
        declare("log", int(0)),
        s(Expression::ensure(int(3), vec![assign("log", int(9))])),
    ];
    assert_eq!(eval_both(body), Value::Int(3));
}

#[test]
fn test_ensure_runs_on_return() {
    let body_fn = Expression::ensure(
        Expression::block(vec![Statement::return_value(Some(int(1)))]),
        vec![assign("cleaned", Expression::bool(true))],
    );
    let body = vec![
        declare("cleaned", Expression::bool(false)),
        Statement::function("f", &[], body_fn),
        declare("r", call("f", vec![])),
        s(Expression::array(vec![id("r"), id("cleaned")])),
    ];
    assert_eq!(
        eval_both(body),
        Value::array(vec![Value::Int(1), Value::Bool(true)])
    );
}

#[test]
fn test_or_else_on_nil() {
    let body = vec![s(Expression::or_else(
        Expression::nil(),
        None,
        vec![s(int(7))],
    ))];
    assert_eq!(eval_both(body), Value::Int(7));
}

#[test]
fn test_or_else_passes_through_values() {
    let body = vec![s(Expression::or_else(int(4), None, vec![s(int(7))]))];
    assert_eq!(eval_both(body), Value::Int(4));
}

#[test]
fn test_or_else_catches_raise() {
    let body = vec![s(Expression::or_else(
        Expression::block(vec![Statement::raise(int(42))]),
        Some("e"),
        vec![s(Expression::array(vec![
            Expression::member(id("e"), "kind"),
            Expression::member(id("e"), "payload"),
        ]))],
    ))];
    assert_eq!(
        eval_both(body),
        Value::array(vec![Value::string("Error"), Value::Int(42)])
    );
}

#[test]
fn test_propagate_raises_error_values() {
    let body = vec![
        Statement::function(
            "check",
            &["v"],
            Expression::propagate(id("v")),
        ),
        s(Expression::array(vec![
            call("check", vec![int(1)]),
            Expression::rescue(
                call(
                    "check",
                    vec![Expression::rescue(
                        divide_by_zero(),
                        vec![clause(Pattern::binding("e"), id("e"))],
                    )],
                ),
                vec![clause(
                    Pattern::binding("e"),
                    Expression::member(id("e"), "kind"),
                )],
            ),
        ])),
    ];
    assert_eq!(
        eval_both(body),
        Value::array(vec![Value::Int(1), Value::string("DivisionByZero")])
    );
}

#[test]
fn test_rethrow_reaches_outer_rescue() {
    let inner = Expression::rescue(
        divide_by_zero(),
        vec![clause(
            Pattern::Wildcard,
            Expression::block(vec![Statement::Rethrow]),
        )],
    );
    let body = vec![s(Expression::rescue(
        inner,
        vec![clause(
            Pattern::binding("e"),
            Expression::member(id("e"), "kind"),
        )],
    ))];
    assert_eq!(eval_both(body), Value::string("DivisionByZero"));
}

#[test]
fn test_rethrow_outside_rescue() {
    let body = vec![Statement::Rethrow];
    assert_eq!(raised_kind_both(body).as_deref(), Some("RethrowError"));
}

#[test]
fn test_match_without_matching_clause() {
    let body = vec![s(Expression::match_expr(
        int(3),
        vec![clause(
            Pattern::Literal(able_core::ast::Literal::Int(4)),
            int(0),
        )],
    ))];
    assert_eq!(raised_kind_both(body).as_deref(), Some("MatchError"));
}

#[test]
fn test_raise_wraps_plain_values() {
    let body = vec![s(Expression::rescue(
        Expression::block(vec![Statement::raise(int(42))]),
        vec![clause(
            Pattern::binding("e"),
            Expression::member(id("e"), "payload"),
        )],
    ))];
    assert_eq!(eval_both(body), Value::Int(42));
}

#[test]
fn test_error_struct_pattern() {
    let pattern = Pattern::Struct {
        name: Some("DivisionByZero".into()),
        fields: vec![("message".into(), Pattern::binding("m"))],
    };
    let body = vec![s(Expression::rescue(
        divide_by_zero(),
        vec![clause(pattern, id("m"))],
    ))];
    assert_eq!(eval_both(body), Value::string("division by zero"));
}

#[test]
fn test_undefined_name_is_reference_error() {
    let body = vec![s(id("missing"))];
    assert_eq!(raised_kind_both(body).as_deref(), Some("ReferenceError"));
}

#[test]
fn test_errors_unwind_through_calls() {
    let body = vec![
        Statement::function("inner", &[], divide_by_zero()),
        Statement::function("outer", &[], call("inner", vec![])),
        s(Expression::rescue(
            call("outer", vec![]),
            vec![clause(Pattern::Wildcard, string("caught"))],
        )),
    ];
    assert_eq!(eval_both(body), Value::string("caught"));
}

#[test]
fn test_raise_display_contains_message() {
    let err = eval_result(vec![s(divide_by_zero())]).err();
    let text = err.map(|e| e.to_string()).unwrap_or_default();
    assert!(text.contains("division by zero"), "unexpected: {}", text);
}
