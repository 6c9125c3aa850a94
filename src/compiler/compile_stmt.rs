//! Statement lowering

use super::{Compiler, Op};
use crate::ast::{ForStatement, Statement, WhileStatement};
use crate::error::LoweringError;
use crate::value::{Str, Value};
use std::sync::Arc;

impl Compiler {
    /// Compile a statement; leaves exactly one value on the stack
    pub(crate) fn compile_statement(&mut self, stmt: &Statement) -> Result<(), LoweringError> {
        match stmt {
            Statement::Expression(expr) => self.compile_expression(expr),
            Statement::While(w) => self.compile_while(w),
            Statement::For(f) => self.compile_for(f),
            Statement::Break(b) => {
                let index = self.find_loop(b.label.as_ref(), "break")?;
                match &b.value {
                    Some(value) => self.compile_expression(value)?,
                    None => self.builder.emit(Op::Const { value: Value::Nil }),
                }
                let (scope_depth, ensure_depth) = self.loop_depths(index);
                self.emit_unwind_to(scope_depth, ensure_depth)?;
                let jump = self.builder.emit_jump();
                if let Some(ctx) = self.loop_stack.get_mut(index) {
                    ctx.break_jumps.push(jump);
                }
                Ok(())
            }
            Statement::Continue(c) => {
                let index = self.find_loop(c.label.as_ref(), "continue")?;
                let (scope_depth, ensure_depth) = self.loop_depths(index);
                let target = self
                    .loop_stack
                    .get(index)
                    .and_then(|ctx| ctx.continue_target)
                    .ok_or(LoweringError::OutsideLoop {
                        keyword: "continue",
                    })?;
                self.emit_unwind_to(scope_depth, ensure_depth)?;
                self.builder.emit_jump_to(target);
                Ok(())
            }
            Statement::Return(r) => {
                match &r.value {
                    Some(value) => self.compile_expression(value)?,
                    None => self.builder.emit(Op::Const { value: Value::Nil }),
                }
                self.emit_unwind_to(0, 0)?;
                self.builder.emit(Op::Return);
                Ok(())
            }
            Statement::Raise(r) => {
                self.compile_expression(&r.value)?;
                self.builder.emit(Op::Raise);
                Ok(())
            }
            Statement::Rethrow => {
                self.builder.emit(Op::Rethrow);
                Ok(())
            }
            Statement::FunctionDeclaration(decl) => {
                let function = Compiler::lower_function(&decl.function)?;
                self.builder.emit(Op::MakeClosure { function });
                self.builder.emit(Op::DeclareName {
                    name: decl.name.clone(),
                });
                Ok(())
            }
        }
    }

    fn loop_depths(&self, index: usize) -> (usize, usize) {
        self.loop_stack
            .get(index)
            .map(|ctx| (ctx.scope_depth, ctx.ensure_depth))
            .unwrap_or((self.scope_depth, self.ensure_stack.len()))
    }

    /// Emit `LoopEnter` and return its placeholder (break/continue patched later)
    fn emit_loop_enter(&mut self, label: Option<Str>) -> super::JumpPlaceholder {
        self.builder.emit_jump_op(Op::LoopEnter {
            label,
            break_target: 0,
            continue_target: None,
        })
    }

    /// Emit the loop head and register it as the continue target
    pub(crate) fn emit_loop_head(&mut self, enter: super::JumpPlaceholder) -> usize {
        let head = self.builder.current_offset();
        self.builder.emit(Op::LoopHead);
        self.builder.patch_continue(enter, head);
        self.set_continue_target(head);
        head
    }

    /// Close a loop: patch breaks and the frame's break target to `LoopExit`
    pub(crate) fn finish_loop(&mut self, enter: super::JumpPlaceholder) {
        self.builder.patch_jump(enter);
        self.pop_loop();
        self.builder.emit(Op::LoopExit);
    }

    /// ```text
    /// LoopEnter
    /// start: LoopHead; cond; JumpIfFalse done; block; Pop; Jump start
    /// done:  Const void
    /// exit:  LoopExit
    /// ```
    fn compile_while(&mut self, stmt: &WhileStatement) -> Result<(), LoweringError> {
        let enter = self.emit_loop_enter(stmt.label.clone());
        self.push_loop(stmt.label.clone(), false);
        let start = self.emit_loop_head(enter);

        self.compile_expression(&stmt.condition)?;
        let done = self.builder.emit_jump_if_false();
        self.compile_block(&stmt.body)?;
        self.builder.emit(Op::Pop);
        self.builder.emit_jump_to(start);

        self.builder.patch_jump(done);
        self.builder.emit(Op::Const { value: Value::Void });
        self.finish_loop(enter);
        Ok(())
    }

    /// ```text
    /// iterable; IterPush; LoopEnter
    /// start: LoopHead; IterNext done; EnterScope; BindPattern; body; ExitScope; Pop; Jump start
    /// done:  Const void
    /// exit:  LoopExit; IterClose
    /// ```
    fn compile_for(&mut self, stmt: &ForStatement) -> Result<(), LoweringError> {
        self.compile_expression(&stmt.iterable)?;
        self.builder.emit(Op::IterPush);
        let enter = self.emit_loop_enter(stmt.label.clone());
        self.push_loop(stmt.label.clone(), false);
        let start = self.emit_loop_head(enter);

        let done = self.builder.emit_jump_op(Op::IterNext { exhausted: 0 });
        self.enter_scope();
        self.builder.emit(Op::BindPattern {
            pattern: Arc::new(stmt.pattern.clone()),
        });
        self.compile_statements(&stmt.body.body, Value::Void)?;
        self.exit_scope();
        self.builder.emit(Op::Pop);
        self.builder.emit_jump_to(start);

        self.builder.patch_jump(done);
        self.builder.emit(Op::Const { value: Value::Void });
        self.finish_loop(enter);
        self.builder.emit(Op::IterClose);
        Ok(())
    }
}
