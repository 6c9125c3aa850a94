use super::*;
use able_core::ast::{BinaryOp, Block, Expression, ForStatement, Pattern, Statement};

fn add(left: Expression, right: Expression) -> Expression {
    Expression::binary(BinaryOp::Add, left, right)
}

fn lt(left: Expression, right: Expression) -> Expression {
    Expression::binary(BinaryOp::Lt, left, right)
}

fn eq(left: Expression, right: Expression) -> Expression {
    Expression::binary(BinaryOp::Eq, left, right)
}

fn incr(name: &str) -> Statement {
    assign(name, add(id(name), int(1)))
}

#[test]
fn test_while_loop() {
    let body = vec![
        declare("i", int(0)),
        declare("sum", int(0)),
        Statement::while_loop(
            lt(id("i"), int(3)),
            vec![incr("i"), assign("sum", add(id("sum"), id("i")))],
        ),
        s(id("sum")),
    ];
    assert_eq!(eval_both(body), Value::Int(6));
}

#[test]
fn test_while_statement_value_is_void() {
    let body = vec![Statement::while_loop(Expression::bool(false), vec![])];
    assert_eq!(eval_both(body), Value::Void);
}

#[test]
fn test_for_over_range() {
    let body = vec![
        declare("sum", int(0)),
        Statement::for_in(
            "i",
            Expression::range(int(0), int(5), false),
            vec![assign("sum", add(id("sum"), id("i")))],
        ),
        s(id("sum")),
    ];
    assert_eq!(eval_both(body), Value::Int(10));
}

#[test]
fn test_for_inclusive_range() {
    let body = vec![
        declare("sum", int(0)),
        Statement::for_in(
            "i",
            Expression::range(int(1), int(4), true),
            vec![assign("sum", add(id("sum"), id("i")))],
        ),
        s(id("sum")),
    ];
    assert_eq!(eval_both(body), Value::Int(10));
}

#[test]
fn test_for_destructures_elements() {
    let pairs = Expression::array(vec![
        Expression::array(vec![int(1), int(2)]),
        Expression::array(vec![int(3), int(4)]),
    ]);
    let product = Expression::binary(BinaryOp::Mul, id("a"), id("b"));
    let body = vec![
        declare("sum", int(0)),
        Statement::For(ForStatement {
            label: None,
            pattern: Pattern::Array(vec![Pattern::binding("a"), Pattern::binding("b")]),
            iterable: pairs,
            body: Block::new(vec![assign("sum", add(id("sum"), product))]),
        }),
        s(id("sum")),
    ];
    assert_eq!(eval_both(body), Value::Int(14));
}

#[test]
fn test_loop_bindings_are_fresh_per_iteration() {
    // Each closure captures its own `i`
    let body = vec![
        declare("out", Expression::array(vec![int(0), int(0), int(0)])),
        Statement::for_in(
            "i",
            Expression::range(int(0), int(3), false),
            vec![s(Expression::assign_index(
                id("out"),
                id("i"),
                Expression::lambda(&[], id("i")),
            ))],
        ),
        s(Expression::array(vec![
            Expression::call(Expression::index(id("out"), int(0)), vec![]),
            Expression::call(Expression::index(id("out"), int(2)), vec![]),
        ])),
    ];
    assert_eq!(eval_both(body), ints(&[0, 2]));
}

#[test]
fn test_labeled_break_from_nested_loops() {
    let inner = Expression::loop_expr(
        None,
        vec![Statement::break_loop(Some("outer"), Some(int(42)))],
    );
    let body = vec![s(Expression::loop_expr(Some("outer"), vec![s(inner)]))];
    assert_eq!(eval_both(body), Value::Int(42));
}

#[test]
fn test_labeled_break_unwinds_every_nested_scope() {
    // Each loop body shadows `v`; breaking out of all three must land back
    // in the scope that declared the original
    let level = |name: &str, inner: Vec<Statement>| {
        let mut body = vec![declare("v", string(name))];
        body.extend(inner);
        body
    };
    let innermost = level("l3", vec![Statement::break_loop(Some("outer"), Some(id("v")))]);
    let middle = level("l2", vec![s(Expression::loop_expr(None, innermost))]);
    let outer = level("l1", vec![s(Expression::loop_expr(None, middle))]);
    let body = vec![
        declare("v", string("outer")),
        declare("result", Expression::loop_expr(Some("outer"), outer)),
        declare("after", string("declared")),
        s(Expression::array(vec![id("result"), id("v"), id("after")])),
    ];
    assert_eq!(
        eval_both(body),
        Value::array(vec![
            Value::string("l3"),
            Value::string("outer"),
            Value::string("declared"),
        ])
    );
}

#[test]
fn test_sum_over_array_literal() {
    let body = vec![
        declare("sum", int(0)),
        Statement::for_in(
            "x",
            Expression::array(vec![int(1), int(2), int(3)]),
            vec![assign("sum", add(id("sum"), id("x")))],
        ),
        s(id("sum")),
    ];
    assert_eq!(eval_both(body), Value::Int(6));
}

#[test]
fn test_labeled_while_break() {
    let body = vec![
        declare("hits", int(0)),
        Statement::while_loop(
            Expression::bool(true),
            vec![Statement::while_loop(
                Expression::bool(true),
                vec![incr("hits"), Statement::break_loop(Some("outer"), None)],
            )],
        )
        .labeled("outer"),
        s(id("hits")),
    ];
    assert_eq!(eval_both(body), Value::Int(1));
}

#[test]
fn test_continue_skips_rest_of_body() {
    let even = eq(Expression::binary(BinaryOp::Mod, id("i"), int(2)), int(0));
    let body = vec![
        declare("i", int(0)),
        declare("count", int(0)),
        Statement::while_loop(
            lt(id("i"), int(8)),
            vec![
                incr("i"),
                s(Expression::if_else(
                    even,
                    vec![Statement::continue_loop(None)],
                    None,
                )),
                incr("count"),
            ],
        ),
        s(id("count")),
    ];
    assert_eq!(eval_both(body), Value::Int(4));
}

#[test]
fn test_labeled_continue() {
    let inner = Statement::for_in(
        "j",
        Expression::range(int(0), int(3), false),
        vec![
            s(Expression::if_else(
                eq(id("j"), int(1)),
                vec![Statement::continue_loop(Some("outer"))],
                None,
            )),
            incr("count"),
        ],
    );
    let body = vec![
        declare("count", int(0)),
        Statement::for_in("i", Expression::range(int(0), int(3), false), vec![inner])
            .labeled("outer"),
        s(id("count")),
    ];
    assert_eq!(eval_both(body), Value::Int(3));
}

#[test]
fn test_breakpoint_returns_break_value() {
    let body = vec![s(Expression::breakpoint(
        "done",
        vec![
            Statement::break_loop(Some("done"), Some(int(7))),
            s(int(99)),
        ],
    ))];
    assert_eq!(eval_both(body), Value::Int(7));
}

#[test]
fn test_breakpoint_without_break_yields_body_value() {
    let body = vec![s(Expression::breakpoint("done", vec![s(int(5))]))];
    assert_eq!(eval_both(body), Value::Int(5));
}

#[test]
fn test_bare_break_value_is_nil() {
    let body = vec![s(Expression::loop_expr(
        None,
        vec![Statement::break_loop(None, None)],
    ))];
    assert_eq!(eval_both(body), Value::Nil);
}

#[test]
fn test_if_without_else_is_nil() {
    let body = vec![s(Expression::if_else(
        Expression::bool(false),
        vec![s(int(1))],
        None,
    ))];
    assert_eq!(eval_both(body), Value::Nil);
}

#[test]
fn test_if_else_branches() {
    let pick = |cond: bool| {
        vec![s(Expression::if_else(
            Expression::bool(cond),
            vec![s(int(1))],
            Some(vec![s(int(2))]),
        ))]
    };
    assert_eq!(eval_both(pick(true)), Value::Int(1));
    assert_eq!(eval_both(pick(false)), Value::Int(2));
}

#[test]
fn test_empty_module_is_nil() {
    assert_eq!(eval_both(vec![]), Value::Nil);
}

#[test]
fn test_empty_block_is_void() {
    assert_eq!(eval_both(vec![s(Expression::block(vec![]))]), Value::Void);
}

#[test]
fn test_block_scopes_declarations() {
    let body = vec![
        declare("x", int(1)),
        s(Expression::block(vec![declare("x", int(2))])),
        s(id("x")),
    ];
    assert_eq!(eval_both(body), Value::Int(1));
}

#[test]
fn test_return_from_inside_loop() {
    let find = Expression::block(vec![
        Statement::for_in(
            "i",
            Expression::range(int(0), int(100), false),
            vec![s(Expression::if_else(
                eq(id("i"), int(3)),
                vec![Statement::return_value(Some(Expression::binary(
                    BinaryOp::Mul,
                    id("i"),
                    int(10),
                )))],
                None,
            ))],
        ),
        s(int(-1)),
    ]);
    let body = vec![
        Statement::function("find", &[], find),
        s(call("find", vec![])),
    ];
    assert_eq!(eval_both(body), Value::Int(30));
}

#[test]
fn test_short_circuit_logic() {
    // The right side would raise if evaluated
    let boom = Expression::binary(BinaryOp::Div, int(1), int(0));
    let body = vec![s(Expression::array(vec![
        Expression::and(Expression::bool(false), boom.clone()),
        Expression::or(int(5), boom),
        Expression::and(int(1), int(2)),
        Expression::or(Expression::nil(), int(3)),
    ]))];
    assert_eq!(
        eval_both(body),
        Value::array(vec![
            Value::Bool(false),
            Value::Int(5),
            Value::Int(2),
            Value::Int(3),
        ])
    );
}

#[test]
fn test_match_expression() {
    let classify = |subject: Expression| {
        vec![s(Expression::match_expr(
            subject,
            vec![
                able_core::ast::MatchClause::new(
                    Pattern::Literal(able_core::ast::Literal::Int(0)),
                    None,
                    string("zero"),
                ),
                able_core::ast::MatchClause::new(
                    Pattern::binding("n"),
                    Some(lt(id("n"), int(0))),
                    string("negative"),
                ),
                able_core::ast::MatchClause::new(Pattern::Wildcard, None, string("positive")),
            ],
        ))]
    };
    assert_eq!(eval_both(classify(int(0))), Value::string("zero"));
    assert_eq!(eval_both(classify(int(-3))), Value::string("negative"));
    assert_eq!(eval_both(classify(int(8))), Value::string("positive"));
}
