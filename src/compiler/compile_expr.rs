//! Expression lowering

use super::{Compiler, EnsureRegion, HandlerKind, Op};
use crate::ast::{
    AssignOp, AssignTarget, AssignmentExpression, CallExpression, EnsureExpression, Expression,
    IfExpression, Literal, LogicalExpression, LogicalOp, MatchClause, OrElseExpression,
};
use crate::error::LoweringError;
use crate::value::{CheapClone, Str, Value};
use std::sync::Arc;

impl Compiler {
    /// Compile an expression; leaves exactly one value on the stack
    pub(crate) fn compile_expression(&mut self, expr: &Expression) -> Result<(), LoweringError> {
        match expr {
            Expression::Literal(lit) => {
                self.builder.emit(Op::Const {
                    value: literal_value(lit),
                });
                Ok(())
            }
            Expression::Identifier(name) => {
                self.builder.emit(Op::LoadName { name: name.clone() });
                Ok(())
            }
            Expression::Unary(u) => {
                self.compile_expression(&u.operand)?;
                self.builder.emit(Op::Unary { op: u.op });
                Ok(())
            }
            Expression::Binary(b) => {
                self.compile_expression(&b.left)?;
                self.compile_expression(&b.right)?;
                self.builder.emit(Op::Binary { op: b.op });
                Ok(())
            }
            Expression::Logical(l) => self.compile_logical(l),
            Expression::Assignment(a) => self.compile_assignment(a),
            Expression::Block(block) => self.compile_block(block),
            Expression::If(i) => self.compile_if(i),
            Expression::Loop(l) => {
                let enter = self.builder.emit_jump_op(Op::LoopEnter {
                    label: l.label.clone(),
                    break_target: 0,
                    continue_target: None,
                });
                self.push_loop(l.label.clone(), false);
                let start = self.emit_loop_head(enter);
                self.compile_block(&l.body)?;
                self.builder.emit(Op::Pop);
                self.builder.emit_jump_to(start);
                self.finish_loop(enter);
                Ok(())
            }
            Expression::Breakpoint(b) => {
                let enter = self.builder.emit_jump_op(Op::LoopEnter {
                    label: Some(b.label.clone()),
                    break_target: 0,
                    continue_target: None,
                });
                self.push_loop(Some(b.label.clone()), true);
                self.compile_block(&b.body)?;
                self.finish_loop(enter);
                Ok(())
            }
            Expression::Call(call) => self.compile_call(call),
            Expression::Member(m) => {
                self.compile_expression(&m.object)?;
                self.builder.emit(Op::MemberAccess {
                    member: m.member.clone(),
                    safe: m.safe,
                    prefer_methods: false,
                });
                Ok(())
            }
            Expression::Index(i) => {
                self.compile_expression(&i.object)?;
                self.compile_expression(&i.index)?;
                self.builder.emit(Op::IndexGet);
                Ok(())
            }
            Expression::Lambda(lambda) => {
                let function = Compiler::lower_function(lambda)?;
                self.builder.emit(Op::MakeClosure { function });
                Ok(())
            }
            Expression::Array(items) => {
                for item in items {
                    self.compile_expression(item)?;
                }
                self.builder.emit(Op::MakeArray { count: items.len() });
                Ok(())
            }
            Expression::StructLiteral(s) => {
                let mut names = Vec::with_capacity(s.fields.len());
                for (name, value) in &s.fields {
                    self.compile_expression(value)?;
                    names.push(name.cheap_clone());
                }
                self.builder.emit(Op::MakeStruct {
                    name: s.name.clone(),
                    fields: Arc::from(names),
                });
                Ok(())
            }
            Expression::Interpolation(parts) => {
                for part in parts {
                    self.compile_expression(part)?;
                }
                self.builder.emit(Op::Interpolate { count: parts.len() });
                Ok(())
            }
            Expression::Range(r) => {
                self.compile_expression(&r.start)?;
                self.compile_expression(&r.end)?;
                self.builder.emit(Op::MakeRange {
                    inclusive: r.inclusive,
                });
                Ok(())
            }
            Expression::Match(m) => {
                self.compile_expression(&m.subject)?;
                self.compile_clauses(&m.clauses, false)
            }
            Expression::Rescue(r) => {
                let handler = self.builder.emit_jump_op(Op::HandlerPush {
                    kind: HandlerKind::Rescue,
                    target: 0,
                });
                self.handler_depth += 1;
                let guarded = self.compile_expression(&r.expression);
                self.handler_depth -= 1;
                guarded?;
                self.builder.emit(Op::HandlerPop);
                let end = self.builder.emit_jump();

                // Handler entry: the raised error is on the stack
                self.builder.patch_jump(handler);
                self.compile_clauses(&r.clauses, true)?;
                self.builder.patch_jump(end);
                Ok(())
            }
            Expression::Ensure(e) => self.compile_ensure(e),
            Expression::OrElse(o) => self.compile_or_else(o),
            Expression::Propagate(inner) => {
                self.compile_expression(inner)?;
                self.builder.emit(Op::Propagate);
                Ok(())
            }
            Expression::Await(a) => {
                self.compile_expression(&a.arms)?;
                self.builder.emit(Op::Await { site: a.id });
                Ok(())
            }
            Expression::Spawn(s) => {
                let program = Compiler::lower_expression(&s.body)?;
                self.builder.emit(Op::Spawn { program });
                Ok(())
            }
            Expression::Spanned(span, inner) => {
                let previous = self.builder.set_span(Some(*span));
                let result = self.compile_expression(inner);
                self.builder.set_span(previous);
                result
            }
        }
    }

    /// `&&`: left; Dup; JumpIfFalse end; Pop; right
    /// `||`: left; Dup; JumpIfTrue end; Pop; right
    fn compile_logical(&mut self, expr: &LogicalExpression) -> Result<(), LoweringError> {
        self.compile_expression(&expr.left)?;
        self.builder.emit(Op::Dup);
        let end = match expr.op {
            LogicalOp::And => self.builder.emit_jump_if_false(),
            LogicalOp::Or => self.builder.emit_jump_if_true(),
        };
        self.builder.emit(Op::Pop);
        self.compile_expression(&expr.right)?;
        self.builder.patch_jump(end);
        Ok(())
    }

    fn compile_assignment(&mut self, expr: &AssignmentExpression) -> Result<(), LoweringError> {
        match (&expr.target, expr.op) {
            (AssignTarget::Name(name), AssignOp::Declare) => {
                self.compile_expression(&expr.value)?;
                self.builder.emit(Op::DeclareName { name: name.clone() });
            }
            (AssignTarget::Name(name), AssignOp::Assign) => {
                self.compile_expression(&expr.value)?;
                self.builder.emit(Op::AssignName { name: name.clone() });
            }
            (AssignTarget::Name(name), AssignOp::Compound(op)) => {
                self.builder.emit(Op::LoadName { name: name.clone() });
                self.compile_expression(&expr.value)?;
                self.builder.emit(Op::Binary { op });
                self.builder.emit(Op::AssignName { name: name.clone() });
            }
            (AssignTarget::Index { object, index }, AssignOp::Assign) => {
                self.compile_expression(&expr.value)?;
                self.compile_expression(object)?;
                self.compile_expression(index)?;
                self.builder.emit(Op::IndexSet);
            }
            (AssignTarget::Member { object, member }, AssignOp::Assign) => {
                self.compile_expression(&expr.value)?;
                self.compile_expression(object)?;
                self.builder.emit(Op::MemberSet {
                    member: member.clone(),
                });
            }
            (AssignTarget::Pattern(_), _) => {
                return Err(LoweringError::unsupported("destructuring assignment"));
            }
            (_, op) => {
                return Err(LoweringError::unsupported(format!(
                    "assignment operator {:?} on a non-name target",
                    op
                )));
            }
        }
        Ok(())
    }

    /// If/elsif/else chain; end jumps are patched once the chain is emitted
    fn compile_if(&mut self, expr: &IfExpression) -> Result<(), LoweringError> {
        let mut end_jumps = Vec::new();

        self.compile_expression(&expr.condition)?;
        let mut next = self.builder.emit_jump_if_false();
        self.compile_block(&expr.consequent)?;
        end_jumps.push(self.builder.emit_jump());

        for clause in &expr.elsif {
            self.builder.patch_jump(next);
            self.compile_expression(&clause.condition)?;
            next = self.builder.emit_jump_if_false();
            self.compile_block(&clause.body)?;
            end_jumps.push(self.builder.emit_jump());
        }

        self.builder.patch_jump(next);
        match &expr.alternate {
            Some(block) => self.compile_block(block)?,
            None => self.builder.emit(Op::Const { value: Value::Nil }),
        }
        for jump in end_jumps {
            self.builder.patch_jump(jump);
        }
        Ok(())
    }

    fn compile_call(&mut self, call: &CallExpression) -> Result<(), LoweringError> {
        let argc = call.arguments.len();
        match strip_spans(&call.callee) {
            Expression::Identifier(name) => {
                self.compile_arguments(&call.arguments)?;
                self.builder.emit(Op::CallName {
                    name: name.clone(),
                    argc,
                });
            }
            Expression::Member(m) if m.safe => {
                // object; Dup; JumpIfNil nil; member; args; Call; Jump end
                // nil: Pop; Const nil
                self.compile_expression(&m.object)?;
                self.builder.emit(Op::Dup);
                let nil_path = self.builder.emit_jump_if_nil();
                self.builder.emit(Op::MemberAccess {
                    member: m.member.clone(),
                    safe: false,
                    prefer_methods: true,
                });
                self.compile_arguments(&call.arguments)?;
                self.builder.emit(Op::Call { argc });
                let end = self.builder.emit_jump();
                self.builder.patch_jump(nil_path);
                self.builder.emit(Op::Pop);
                self.builder.emit(Op::Const { value: Value::Nil });
                self.builder.patch_jump(end);
            }
            Expression::Member(m) => {
                self.compile_expression(&m.object)?;
                self.builder.emit(Op::MemberAccess {
                    member: m.member.clone(),
                    safe: false,
                    prefer_methods: true,
                });
                self.compile_arguments(&call.arguments)?;
                self.builder.emit(Op::Call { argc });
            }
            _ => {
                self.compile_expression(&call.callee)?;
                self.compile_arguments(&call.arguments)?;
                self.builder.emit(Op::Call { argc });
            }
        }
        Ok(())
    }

    fn compile_arguments(&mut self, arguments: &[Expression]) -> Result<(), LoweringError> {
        for arg in arguments {
            self.compile_expression(arg)?;
        }
        Ok(())
    }

    /// Pattern clauses over the subject on top of the stack.
    ///
    /// ```text
    /// clause: EnterScope; MatchPattern fail; [guard; JumpIfFalse fail]
    ///         Pop; body; ExitScope; [RaisedPop]; Jump end
    /// fail:   ExitScope
    /// ...     MatchFailed | Reraise
    /// ```
    fn compile_clauses(
        &mut self,
        clauses: &[MatchClause],
        rescue: bool,
    ) -> Result<(), LoweringError> {
        let mut end_jumps = Vec::new();
        for clause in clauses {
            self.enter_scope();
            let mut fail_jumps = vec![self.builder.emit_jump_op(Op::MatchPattern {
                pattern: Arc::new(clause.pattern.clone()),
                fail: 0,
            })];
            if let Some(guard) = &clause.guard {
                self.compile_expression(guard)?;
                fail_jumps.push(self.builder.emit_jump_if_false());
            }
            self.builder.emit(Op::Pop);
            self.compile_expression(&clause.body)?;
            self.exit_scope();
            if rescue {
                self.builder.emit(Op::RaisedPop);
            }
            end_jumps.push(self.builder.emit_jump());

            for jump in fail_jumps {
                self.builder.patch_jump(jump);
            }
            self.builder.emit(Op::ExitScope { count: 1 });
        }
        self.builder
            .emit(if rescue { Op::Reraise } else { Op::MatchFailed });
        for jump in end_jumps {
            self.builder.patch_jump(jump);
        }
        Ok(())
    }

    /// ```text
    /// EnsureStart cleanup; guarded; EnsureCapture
    /// cleanup: block; Pop; EnsureEnd
    /// ```
    fn compile_ensure(&mut self, expr: &EnsureExpression) -> Result<(), LoweringError> {
        let start = self
            .builder
            .emit_jump_op(Op::EnsureStart { cleanup: 0 });
        self.ensure_stack.push(EnsureRegion {
            cleanup: expr.cleanup.clone(),
            scope_depth: self.scope_depth,
            handler_depth: self.handler_depth,
        });
        self.handler_depth += 1;
        let guarded = self.compile_expression(&expr.expression);
        self.ensure_stack.pop();
        if let Err(e) = guarded {
            self.handler_depth -= 1;
            return Err(e);
        }
        self.builder.emit(Op::EnsureCapture);

        self.builder.patch_jump(start);
        let cleanup = self.compile_block(&expr.cleanup);
        self.handler_depth -= 1;
        cleanup?;
        self.builder.emit(Op::Pop);
        self.builder.emit(Op::EnsureEnd);
        Ok(())
    }

    /// ```text
    /// HandlerPush handler; expr; HandlerPop; JumpUnlessFailure ok
    /// handler: EnterScope; [DeclareName err]; Pop; block; ExitScope
    /// ok:
    /// ```
    fn compile_or_else(&mut self, expr: &OrElseExpression) -> Result<(), LoweringError> {
        let handler = self.builder.emit_jump_op(Op::HandlerPush {
            kind: HandlerKind::OrElse,
            target: 0,
        });
        self.handler_depth += 1;
        let guarded = self.compile_expression(&expr.expression);
        self.handler_depth -= 1;
        guarded?;
        self.builder.emit(Op::HandlerPop);
        let ok = self
            .builder
            .emit_jump_op(Op::JumpUnlessFailure { target: 0 });

        self.builder.patch_jump(handler);
        self.enter_scope();
        if let Some(name) = &expr.binding {
            self.builder.emit(Op::DeclareName { name: name.clone() });
        }
        self.builder.emit(Op::Pop);
        self.compile_statements(&expr.handler.body, Value::Void)?;
        self.exit_scope();
        self.builder.patch_jump(ok);
        Ok(())
    }
}

fn strip_spans(expr: &Expression) -> &Expression {
    match expr {
        Expression::Spanned(_, inner) => strip_spans(inner),
        other => other,
    }
}

pub(crate) fn literal_value(lit: &Literal) -> Value {
    match lit {
        Literal::Nil => Value::Nil,
        Literal::Void => Value::Void,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Int(n) => Value::Int(*n),
        Literal::Float(n) => Value::Float(*n),
        Literal::Char(c) => Value::Char(*c),
        Literal::String(s) => Value::String(Str::clone(s)),
    }
}
