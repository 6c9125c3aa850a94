use super::*;
use able_core::ast::{BinaryOp, Expression, Module, Statement};
use able_core::value::NativeFunction;

fn add(left: Expression, right: Expression) -> Expression {
    Expression::binary(BinaryOp::Add, left, right)
}

#[test]
fn test_arithmetic() {
    let body = vec![s(add(
        int(1),
        Expression::binary(BinaryOp::Mul, int(2), int(3)),
    ))];
    assert_eq!(eval_both(body), Value::Int(7));
}

#[test]
fn test_declare_and_assign() {
    let body = vec![
        declare("x", int(1)),
        assign("x", add(id("x"), int(4))),
        s(id("x")),
    ];
    assert_eq!(eval_both(body), Value::Int(5));
}

#[test]
fn test_redeclare_is_name_error() {
    let body = vec![declare("x", int(1)), declare("x", int(2))];
    assert_eq!(raised_kind_both(body).as_deref(), Some("NameError"));
}

#[test]
fn test_compound_assignment() {
    let body = vec![
        declare("n", int(10)),
        s(Expression::compound("n", BinaryOp::Sub, int(3))),
        s(id("n")),
    ];
    assert_eq!(eval_both(body), Value::Int(7));
}

#[test]
fn test_string_concat_and_interpolation() {
    let concat = vec![s(add(string("ab"), string("cd")))];
    assert_eq!(eval_both(concat), Value::string("abcd"));

    let interp = vec![s(Expression::interpolate(vec![
        string("v"),
        int(1),
        string("-"),
        Expression::bool(true),
    ]))];
    assert_eq!(eval_both(interp), Value::string("v1-true"));
}

#[test]
fn test_struct_fields() {
    let body = vec![
        declare(
            "p",
            Expression::struct_literal("Point", vec![("x", int(5)), ("y", int(7))]),
        ),
        s(add(
            Expression::member(id("p"), "x"),
            Expression::member(id("p"), "y"),
        )),
    ];
    assert_eq!(eval_both(body), Value::Int(12));
}

#[test]
fn test_struct_field_assignment() {
    let body = vec![
        declare("p", Expression::struct_literal("Point", vec![("x", int(1))])),
        s(Expression::assign_member(id("p"), "x", int(9))),
        s(Expression::member(id("p"), "x")),
    ];
    assert_eq!(eval_both(body), Value::Int(9));
}

#[test]
fn test_array_index_get_and_set() {
    let body = vec![
        declare("a", Expression::array(vec![int(1), int(2), int(3)])),
        s(Expression::assign_index(id("a"), int(1), int(20))),
        s(add(
            Expression::index(id("a"), int(0)),
            Expression::index(id("a"), int(1)),
        )),
    ];
    assert_eq!(eval_both(body), Value::Int(21));
}

#[test]
fn test_index_out_of_bounds() {
    let body = vec![
        declare("a", Expression::array(vec![int(1)])),
        s(Expression::index(id("a"), int(5))),
    ];
    assert_eq!(raised_kind_both(body).as_deref(), Some("IndexError"));
}

#[test]
fn test_closures_capture_environment() {
    let body = vec![
        Statement::function(
            "make_adder",
            &["x"],
            Expression::lambda(&["y"], add(id("x"), id("y"))),
        ),
        declare("add40", call("make_adder", vec![int(40)])),
        s(Expression::call(id("add40"), vec![int(2)])),
    ];
    assert_eq!(eval_both(body), Value::Int(42));
}

#[test]
fn test_recursive_fib() {
    let n = || id("n");
    let fib_body = Expression::if_else(
        Expression::binary(BinaryOp::Lt, n(), int(2)),
        vec![s(n())],
        Some(vec![s(add(
            call("fib", vec![Expression::binary(BinaryOp::Sub, n(), int(1))]),
            call("fib", vec![Expression::binary(BinaryOp::Sub, n(), int(2))]),
        ))]),
    );
    let body = vec![
        Statement::function("fib", &["n"], fib_body),
        s(call("fib", vec![int(10)])),
    ];
    assert_eq!(eval_both(body), Value::Int(55));
}

#[test]
fn test_arity_mismatch_is_type_error() {
    let body = vec![
        Statement::function("one", &["a"], id("a")),
        s(call("one", vec![int(1), int(2)])),
    ];
    assert_eq!(raised_kind_both(body).as_deref(), Some("TypeError"));
}

#[test]
fn test_unbounded_recursion_is_stack_overflow() {
    let body = vec![
        Statement::function(
            "down",
            &["n"],
            call("down", vec![add(id("n"), int(1))]),
        ),
        s(call("down", vec![int(0)])),
    ];
    for mode in [ExecMode::Bytecode, ExecMode::TreeWalker] {
        let mut config = test_config(ExecutorKind::Cooperative, mode);
        config.max_call_depth = 50;
        let result = eval_result_with(config, body.clone());
        assert_eq!(raised_kind(result).as_deref(), Some("StackOverflow"));
    }
}

#[test]
fn test_calling_non_function_is_type_error() {
    let body = vec![declare("x", int(3)), s(Expression::call(id("x"), vec![]))];
    assert_eq!(raised_kind_both(body).as_deref(), Some("TypeError"));
}

#[test]
fn test_registered_method_and_field_preference() {
    for mode in [ExecMode::Bytecode, ExecMode::TreeWalker] {
        let runtime = create_test_runtime(ExecutorKind::Cooperative, mode);
        let sum = NativeFunction::new("sum", Some(1), |_, args| match args.first() {
            Some(Value::Struct(p)) => {
                let x = p.get_field("x").and_then(|v| v.as_int()).unwrap_or(0);
                let y = p.get_field("y").and_then(|v| v.as_int()).unwrap_or(0);
                Ok(Value::Int(x + y))
            }
            _ => Ok(Value::Nil),
        });
        runtime
            .interpreter()
            .register_method("Point", "sum", Value::Native(sum));

        let point = Expression::struct_literal(
            "Point",
            vec![("x", int(3)), ("y", int(4)), ("sum", int(100))],
        );
        let module = Module::new(vec![
            declare("p", point),
            s(Expression::array(vec![
                Expression::method_call(id("p"), "sum", vec![]),
                Expression::member(id("p"), "sum"),
                call("p.sum", vec![]),
            ])),
        ]);
        let result = runtime.eval_module(&module);
        assert_eq!(result.ok(), Some(ints(&[7, 100, 7])));
    }
}

#[test]
fn test_missing_member_is_member_error() {
    let body = vec![
        declare("p", Expression::struct_literal("Point", vec![("x", int(1))])),
        s(Expression::member(id("p"), "z")),
    ];
    assert_eq!(raised_kind_both(body).as_deref(), Some("MemberError"));
}

#[test]
fn test_safe_member_on_nil() {
    let body = vec![
        declare("p", Expression::nil()),
        s(Expression::safe_member(id("p"), "x")),
    ];
    assert_eq!(eval_both(body), Value::Nil);

    let call_body = vec![
        declare("p", Expression::nil()),
        s(Expression::safe_call(id("p"), "sum", vec![])),
    ];
    assert_eq!(eval_both(call_body), Value::Nil);
}

#[test]
fn test_host_native() {
    let runtime = create_test_runtime(ExecutorKind::Cooperative, ExecMode::Bytecode);
    runtime.define_native("double", Some(1), |_, args| match args.first() {
        Some(Value::Int(n)) => Ok(Value::Int(n * 2)),
        _ => Err(RuntimeError::type_error("double expects an Int")),
    });
    let module = Module::new(vec![s(call("double", vec![int(21)]))]);
    assert_eq!(runtime.eval_module(&module).ok(), Some(Value::Int(42)));

    let bad = Module::new(vec![s(call("double", vec![string("x")]))]);
    assert_eq!(
        raised_kind(runtime.eval_module(&bad)).as_deref(),
        Some("TypeError")
    );
}

#[test]
fn test_eval_expression() {
    let runtime = create_test_runtime(ExecutorKind::Cooperative, ExecMode::Bytecode);
    let expr = Expression::unary(able_core::ast::UnaryOp::Neg, int(5));
    assert_eq!(runtime.eval_expression(&expr).ok(), Some(Value::Int(-5)));
}
