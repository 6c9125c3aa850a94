//! Tree-walking evaluator
//!
//! Evaluates AST directly with the same observable semantics as the VM. It
//! handles constructs the lowering pass rejects and backs the
//! `tree_walker` execution mode. Cooperative tasks running on it own a
//! thread and park at each suspension point, so a resumed task retries only
//! the call or await that yielded.

use crate::ast::{
    AssignOp, AssignTarget, AssignmentExpression, Block, CallExpression, Expression,
    ForStatement, IfExpression, LogicalOp, MatchClause, Module, Pattern, Statement,
    WhileStatement,
};
use crate::compiler::literal_value;
use crate::environment::{Env, Environment};
use crate::error::RuntimeError;
use crate::runtime::{AsyncPayload, evaluate_await};
use crate::value::{Closure, ErrorValue, FunctionBody, StructInstance, Str, Value};
use indexmap::IndexMap;
use std::sync::Arc;

use super::Interpreter;
use super::patterns::match_pattern;

/// Tree-walking evaluator bound to one task (or the host)
pub struct TreeWalker {
    interp: Interpreter,
    payload: Option<Arc<AsyncPayload>>,
    /// Errors being handled by rescue clauses, innermost last
    raised: Vec<Value>,
}

/// Does a break/continue with `label` target a loop labeled `own`?
fn targets_loop(label: &Option<Str>, own: &Option<Str>) -> bool {
    match label {
        None => true,
        Some(label) => own.as_ref() == Some(label),
    }
}

impl TreeWalker {
    pub fn new(interp: Interpreter, payload: Option<Arc<AsyncPayload>>) -> Self {
        TreeWalker {
            interp,
            payload,
            raised: Vec::new(),
        }
    }

    /// Evaluate module statements in `env`; an empty module yields nil
    pub fn eval_module(&mut self, module: &Module, env: &Env) -> Result<Value, RuntimeError> {
        self.eval_statements(&module.body, env, Value::Nil)
    }

    pub fn eval_expression(&mut self, expr: &Expression, env: &Env) -> Result<Value, RuntimeError> {
        self.eval(expr, env)
    }

    /// Evaluate a function body: `return` completes the call, loop signals
    /// may not escape it
    pub fn call_body(&mut self, body: &Expression, env: &Env) -> Result<Value, RuntimeError> {
        match self.eval(body, env) {
            Err(RuntimeError::Return(value)) => Ok(value),
            Err(RuntimeError::Break { .. }) => Err(RuntimeError::raise(
                "SyntaxError",
                "break outside of loop",
            )),
            Err(RuntimeError::Continue { .. }) => Err(RuntimeError::raise(
                "SyntaxError",
                "continue outside of loop",
            )),
            other => other,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // Statements
    // ═══════════════════════════════════════════════════════════════════════════════

    fn eval_statements(
        &mut self,
        statements: &[Statement],
        env: &Env,
        empty: Value,
    ) -> Result<Value, RuntimeError> {
        let mut last = empty;
        for stmt in statements {
            last = self.eval_statement(stmt, env)?;
        }
        Ok(last)
    }

    fn eval_block(&mut self, block: &Block, env: &Env) -> Result<Value, RuntimeError> {
        let scope = Environment::child(env);
        self.eval_statements(&block.body, &scope, Value::Void)
    }

    fn eval_statement(&mut self, stmt: &Statement, env: &Env) -> Result<Value, RuntimeError> {
        match stmt {
            Statement::Expression(expr) => self.eval(expr, env),
            Statement::While(w) => self.eval_while(w, env),
            Statement::For(f) => self.eval_for(f, env),
            Statement::Break(b) => {
                let value = match &b.value {
                    Some(value) => self.eval(value, env)?,
                    None => Value::Nil,
                };
                Err(RuntimeError::Break {
                    label: b.label.clone(),
                    value,
                })
            }
            Statement::Continue(c) => Err(RuntimeError::Continue {
                label: c.label.clone(),
            }),
            Statement::Return(r) => {
                let value = match &r.value {
                    Some(value) => self.eval(value, env)?,
                    None => Value::Nil,
                };
                Err(RuntimeError::Return(value))
            }
            Statement::Raise(r) => {
                let value = self.eval(&r.value, env)?;
                Err(RuntimeError::Raise(ErrorValue::wrap(value)))
            }
            Statement::Rethrow => match self.raised.last() {
                Some(value) => Err(RuntimeError::Raise(value.clone())),
                None => Err(RuntimeError::raise(
                    "RethrowError",
                    "rethrow outside of a rescue clause",
                )),
            },
            Statement::FunctionDeclaration(decl) => {
                let closure = ast_closure(&decl.function, env);
                declare(env, decl.name.clone(), closure.clone())?;
                Ok(closure)
            }
        }
    }

    fn eval_while(&mut self, stmt: &WhileStatement, env: &Env) -> Result<Value, RuntimeError> {
        loop {
            if !self.eval(&stmt.condition, env)?.is_truthy() {
                return Ok(Value::Void);
            }
            match self.eval_block(&stmt.body, env) {
                Ok(_) => {}
                Err(RuntimeError::Break { label, value }) if targets_loop(&label, &stmt.label) => {
                    return Ok(value);
                }
                Err(RuntimeError::Continue { label }) if targets_loop(&label, &stmt.label) => {}
                Err(err) => return Err(err),
            }
        }
    }

    fn eval_for(&mut self, stmt: &ForStatement, env: &Env) -> Result<Value, RuntimeError> {
        let iterable = self.eval(&stmt.iterable, env)?;
        let mut iter = self.interp.capabilities().iteration.iterate(&iterable)?;
        let result = self.run_for(stmt, env, &mut iter);
        iter.close();
        result
    }

    fn run_for(
        &mut self,
        stmt: &ForStatement,
        env: &Env,
        iter: &mut super::IterationState,
    ) -> Result<Value, RuntimeError> {
        while let Some(item) = iter.next()? {
            let scope = Environment::child(env);
            bind_pattern(&stmt.pattern, &item, &scope)?;
            match self.eval_statements(&stmt.body.body, &scope, Value::Void) {
                Ok(_) => {}
                Err(RuntimeError::Break { label, value }) if targets_loop(&label, &stmt.label) => {
                    return Ok(value);
                }
                Err(RuntimeError::Continue { label }) if targets_loop(&label, &stmt.label) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(Value::Void)
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // Expressions
    // ═══════════════════════════════════════════════════════════════════════════════

    fn eval(&mut self, expr: &Expression, env: &Env) -> Result<Value, RuntimeError> {
        match expr {
            Expression::Literal(lit) => Ok(literal_value(lit)),
            Expression::Identifier(name) => env
                .get(name.as_str())
                .ok_or_else(|| RuntimeError::reference_error(name.as_str())),
            Expression::Unary(u) => {
                let operand = self.eval(&u.operand, env)?;
                self.interp.capabilities().operators.unary(u.op, &operand)
            }
            Expression::Binary(b) => {
                let left = self.eval(&b.left, env)?;
                let right = self.eval(&b.right, env)?;
                self.interp.binary(b.op, &left, &right)
            }
            Expression::Logical(l) => {
                let left = self.eval(&l.left, env)?;
                let short_circuit = match l.op {
                    LogicalOp::And => !left.is_truthy(),
                    LogicalOp::Or => left.is_truthy(),
                };
                if short_circuit {
                    Ok(left)
                } else {
                    self.eval(&l.right, env)
                }
            }
            Expression::Assignment(a) => self.eval_assignment(a, env),
            Expression::Block(block) => self.eval_block(block, env),
            Expression::If(i) => self.eval_if(i, env),
            Expression::Loop(l) => loop {
                match self.eval_block(&l.body, env) {
                    Ok(_) => {}
                    Err(RuntimeError::Break { label, value }) if targets_loop(&label, &l.label) => {
                        return Ok(value);
                    }
                    Err(RuntimeError::Continue { label }) if targets_loop(&label, &l.label) => {}
                    Err(err) => return Err(err),
                }
            },
            Expression::Breakpoint(b) => match self.eval_block(&b.body, env) {
                Err(RuntimeError::Break {
                    label: Some(label),
                    value,
                }) if label == b.label => Ok(value),
                other => other,
            },
            Expression::Call(call) => self.eval_call(call, env),
            Expression::Member(m) => {
                let object = self.eval(&m.object, env)?;
                if m.safe && object.is_nil() {
                    return Ok(Value::Nil);
                }
                self.interp.member(&object, m.member.as_str(), false)
            }
            Expression::Index(i) => {
                let object = self.eval(&i.object, env)?;
                let index = self.eval(&i.index, env)?;
                self.interp
                    .capabilities()
                    .indexer
                    .index_get(&object, &index)
            }
            Expression::Lambda(lambda) => Ok(ast_closure(lambda, env)),
            Expression::Array(items) => {
                let values = items
                    .iter()
                    .map(|item| self.eval(item, env))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::array(values))
            }
            Expression::StructLiteral(s) => {
                let mut fields = IndexMap::with_capacity(s.fields.len());
                for (name, value) in &s.fields {
                    let value = self.eval(value, env)?;
                    fields.insert(name.clone(), value);
                }
                Ok(Value::Struct(StructInstance::new(s.name.clone(), fields)))
            }
            Expression::Interpolation(parts) => {
                let values = parts
                    .iter()
                    .map(|part| self.eval(part, env))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::string(self.interp.interpolate(&values)?))
            }
            Expression::Range(r) => {
                let start = self.eval(&r.start, env)?;
                let end = self.eval(&r.end, env)?;
                self.interp.make_range(&start, &end, r.inclusive)
            }
            Expression::Match(m) => {
                let subject = self.eval(&m.subject, env)?;
                match self.eval_clauses(&m.clauses, &subject, env)? {
                    Some(value) => Ok(value),
                    None => Err(RuntimeError::raise(
                        "MatchError",
                        format!("no match clause matched {}", subject),
                    )),
                }
            }
            Expression::Rescue(r) => match self.eval(&r.expression, env) {
                Err(RuntimeError::Raise(raised)) => {
                    self.raised.push(raised.clone());
                    let handled = self.eval_clauses(&r.clauses, &raised, env);
                    self.raised.pop();
                    match handled? {
                        Some(value) => Ok(value),
                        None => Err(RuntimeError::Raise(raised)),
                    }
                }
                other => other,
            },
            Expression::Ensure(e) => {
                let result = self.eval(&e.expression, env);
                if matches!(result, Err(RuntimeError::Yield | RuntimeError::Internal(_))) {
                    return result;
                }
                self.eval_block(&e.cleanup, env)?;
                result
            }
            Expression::OrElse(o) => {
                let failure = match self.eval(&o.expression, env) {
                    Ok(value) if !value.is_failure() => return Ok(value),
                    Ok(value) | Err(RuntimeError::Raise(value)) => value,
                    Err(err) => return Err(err),
                };
                let scope = Environment::child(env);
                if let Some(name) = &o.binding {
                    scope.define(name.clone(), failure);
                }
                self.eval_statements(&o.handler.body, &scope, Value::Void)
            }
            Expression::Propagate(inner) => {
                let value = self.eval(inner, env)?;
                if matches!(value, Value::Error(_)) {
                    return Err(RuntimeError::Raise(value));
                }
                Ok(value)
            }
            Expression::Await(a) => {
                let arms = self.eval(&a.arms, env)?;
                let payload = self.payload.clone().ok_or_else(|| {
                    RuntimeError::raise(
                        "AsyncContextError",
                        "await expressions must run inside an asynchronous task",
                    )
                })?;
                self.resumable(|| evaluate_await(&self.interp, &payload, a.id, &arms))
            }
            Expression::Spawn(s) => {
                let body = Arc::new((*s.body).clone());
                Ok(Value::Future(self.interp.spawn_tree(body, env.clone())))
            }
            Expression::Spanned(_, inner) => self.eval(inner, env),
        }
    }

    fn eval_if(&mut self, expr: &IfExpression, env: &Env) -> Result<Value, RuntimeError> {
        if self.eval(&expr.condition, env)?.is_truthy() {
            return self.eval_block(&expr.consequent, env);
        }
        for clause in &expr.elsif {
            if self.eval(&clause.condition, env)?.is_truthy() {
                return self.eval_block(&clause.body, env);
            }
        }
        match &expr.alternate {
            Some(block) => self.eval_block(block, env),
            None => Ok(Value::Nil),
        }
    }

    /// Arguments are evaluated before a named callee is resolved
    fn eval_call(&mut self, call: &CallExpression, env: &Env) -> Result<Value, RuntimeError> {
        let callee = match strip_spans(&call.callee) {
            Expression::Identifier(name) => {
                let args = self.eval_arguments(&call.arguments, env)?;
                let callee = self.interp.resolve_callee(env, name.as_str())?;
                return self.call_resumable(&callee, args);
            }
            Expression::Member(m) => {
                let object = self.eval(&m.object, env)?;
                if m.safe && object.is_nil() {
                    return Ok(Value::Nil);
                }
                self.interp.member(&object, m.member.as_str(), true)?
            }
            other => self.eval(other, env)?,
        };
        let args = self.eval_arguments(&call.arguments, env)?;
        self.call_resumable(&callee, args)
    }

    fn call_resumable(&self, callee: &Value, args: Vec<Value>) -> Result<Value, RuntimeError> {
        self.resumable(|| self.interp.call_value(callee, args.clone(), self.payload.as_ref()))
    }

    /// Retry `step` after each suspension while the task is parked on its
    /// own thread; without one the yield unwinds to the executor
    fn resumable<T>(
        &self,
        mut step: impl FnMut() -> Result<T, RuntimeError>,
    ) -> Result<T, RuntimeError> {
        loop {
            match step() {
                Err(RuntimeError::Yield) => match self.payload.as_ref().and_then(|p| p.park()) {
                    Some(resumed) => resumed?,
                    None => return Err(RuntimeError::Yield),
                },
                other => return other,
            }
        }
    }

    fn eval_arguments(
        &mut self,
        arguments: &[Expression],
        env: &Env,
    ) -> Result<Vec<Value>, RuntimeError> {
        arguments.iter().map(|arg| self.eval(arg, env)).collect()
    }

    /// First matching clause's body value; `None` when nothing matched
    fn eval_clauses(
        &mut self,
        clauses: &[MatchClause],
        subject: &Value,
        env: &Env,
    ) -> Result<Option<Value>, RuntimeError> {
        for clause in clauses {
            let Some(bindings) = match_pattern(&clause.pattern, subject) else {
                continue;
            };
            let scope = Environment::child(env);
            for (name, value) in bindings {
                scope.define(name, value);
            }
            if let Some(guard) = &clause.guard {
                if !self.eval(guard, &scope)?.is_truthy() {
                    continue;
                }
            }
            return self.eval(&clause.body, &scope).map(Some);
        }
        Ok(None)
    }

    fn eval_assignment(
        &mut self,
        expr: &AssignmentExpression,
        env: &Env,
    ) -> Result<Value, RuntimeError> {
        match (&expr.target, expr.op) {
            (AssignTarget::Name(name), AssignOp::Declare) => {
                let value = self.eval(&expr.value, env)?;
                declare(env, name.clone(), value.clone())?;
                Ok(value)
            }
            (AssignTarget::Name(name), AssignOp::Assign) => {
                let value = self.eval(&expr.value, env)?;
                assign(env, name, value.clone());
                Ok(value)
            }
            (AssignTarget::Name(name), AssignOp::Compound(op)) => {
                let current = env
                    .get(name.as_str())
                    .ok_or_else(|| RuntimeError::reference_error(name.as_str()))?;
                let rhs = self.eval(&expr.value, env)?;
                let value = self.interp.binary(op, &current, &rhs)?;
                assign(env, name, value.clone());
                Ok(value)
            }
            (AssignTarget::Index { object, index }, op) => {
                let rhs = self.eval(&expr.value, env)?;
                let object = self.eval(object, env)?;
                let index = self.eval(index, env)?;
                let indexer = self.interp.capabilities().indexer.clone();
                let value = match op {
                    AssignOp::Compound(op) => {
                        let current = indexer.index_get(&object, &index)?;
                        self.interp.binary(op, &current, &rhs)?
                    }
                    AssignOp::Assign | AssignOp::Declare => rhs,
                };
                indexer.index_set(&object, &index, value.clone())?;
                Ok(value)
            }
            (AssignTarget::Member { object, member }, op) => {
                let rhs = self.eval(&expr.value, env)?;
                let object = self.eval(object, env)?;
                let value = match op {
                    AssignOp::Compound(op) => {
                        let current = self.interp.member(&object, member.as_str(), false)?;
                        self.interp.binary(op, &current, &rhs)?
                    }
                    AssignOp::Assign | AssignOp::Declare => rhs,
                };
                self.interp
                    .set_member(&object, member.as_str(), value.clone())?;
                Ok(value)
            }
            (AssignTarget::Pattern(pattern), op) => {
                let value = self.eval(&expr.value, env)?;
                let bindings = pattern_bindings(pattern, &value)?;
                match op {
                    AssignOp::Declare => {
                        if bindings.iter().all(|(name, _)| env.has_own(name.as_str())) {
                            return Err(RuntimeError::raise(
                                "NameError",
                                ":= requires at least one new binding",
                            ));
                        }
                        for (name, bound) in bindings {
                            env.define(name, bound);
                        }
                    }
                    AssignOp::Assign => {
                        for (name, bound) in bindings {
                            assign(env, &name, bound);
                        }
                    }
                    AssignOp::Compound(_) => {
                        return Err(RuntimeError::raise(
                            "SyntaxError",
                            "compound assignment requires a single target",
                        ));
                    }
                }
                Ok(value)
            }
        }
    }
}

fn strip_spans(expr: &Expression) -> &Expression {
    match expr {
        Expression::Spanned(_, inner) => strip_spans(inner),
        other => other,
    }
}

fn ast_closure(lambda: &Arc<crate::ast::Lambda>, env: &Env) -> Value {
    Value::Function(Arc::new(Closure {
        name: lambda.name.clone(),
        params: lambda.params.clone(),
        body: FunctionBody::Ast(lambda.clone()),
        env: env.clone(),
    }))
}

fn declare(env: &Env, name: Str, value: Value) -> Result<(), RuntimeError> {
    if env.has_own(name.as_str()) {
        return Err(RuntimeError::raise(
            "NameError",
            ":= requires at least one new binding",
        ));
    }
    env.define(name, value);
    Ok(())
}

fn assign(env: &Env, name: &Str, value: Value) {
    if !env.assign_existing(name.as_str(), value.clone()) {
        env.define(name.clone(), value);
    }
}

fn pattern_bindings(pattern: &Pattern, value: &Value) -> Result<Vec<(Str, Value)>, RuntimeError> {
    match_pattern(pattern, value).ok_or_else(|| {
        RuntimeError::raise("PatternError", format!("pattern does not match {}", value))
    })
}

fn bind_pattern(pattern: &Pattern, value: &Value, env: &Env) -> Result<(), RuntimeError> {
    for (name, bound) in pattern_bindings(pattern, value)? {
        env.define(name, bound);
    }
    Ok(())
}
