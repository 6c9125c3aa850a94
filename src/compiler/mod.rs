//! Bytecode lowering
//!
//! This module lowers AST statements and expressions into a flat [`Program`]
//! for the stack VM. Constructs without a lowering report
//! [`LoweringError::Unsupported`] so callers can fall back to the tree-walker.

mod builder;
mod bytecode;
mod compile_expr;
mod compile_stmt;

pub use builder::{JumpPlaceholder, ProgramBuilder};
pub use bytecode::{FunctionProto, HandlerKind, Instruction, JumpTarget, Op, Program};
pub(crate) use compile_expr::literal_value;

use crate::ast::{Block, Expression, Lambda, Module, Statement};
use crate::error::LoweringError;
use crate::value::{CheapClone, Str, Value};
use std::sync::Arc;

/// Compiler state for lowering one function body (or module)
pub struct Compiler {
    builder: ProgramBuilder,

    /// Lexical scope depth relative to the function/module entry
    scope_depth: usize,

    /// Handler frames open at this point, relative to the call frame
    handler_depth: usize,

    /// Loop context stack for break/continue
    loop_stack: Vec<LoopContext>,

    /// Ensure regions whose cleanup must be inlined on break/continue/return
    ensure_stack: Vec<EnsureRegion>,
}

/// Context for a loop or breakpoint block
struct LoopContext {
    label: Option<Str>,
    /// Breakpoint blocks accept labeled `break` only
    breakpoint: bool,
    scope_depth: usize,
    ensure_depth: usize,
    /// Instruction index of the `LoopHead` for `continue`
    continue_target: Option<usize>,
    /// Jump placeholders for break statements
    break_jumps: Vec<JumpPlaceholder>,
}

#[derive(Clone)]
struct EnsureRegion {
    cleanup: Block,
    scope_depth: usize,
    /// Handler depth before the region's ensure frame was pushed
    handler_depth: usize,
}

impl Compiler {
    pub fn new() -> Self {
        Self {
            builder: ProgramBuilder::new(),
            scope_depth: 0,
            handler_depth: 0,
            loop_stack: Vec::new(),
            ensure_stack: Vec::new(),
        }
    }

    /// Lower a module: statements in order, then return the last value
    pub fn lower_module(module: &Module) -> Result<Arc<Program>, LoweringError> {
        let mut compiler = Compiler::new();
        compiler.compile_statements(&module.body, Value::Nil)?;
        compiler.builder.emit(Op::Return);
        Ok(Arc::new(compiler.builder.finish(None)))
    }

    /// Lower a single expression into a program that returns its value
    pub fn lower_expression(expression: &Expression) -> Result<Arc<Program>, LoweringError> {
        let mut compiler = Compiler::new();
        compiler.compile_expression(expression)?;
        compiler.builder.emit(Op::Return);
        Ok(Arc::new(compiler.builder.finish(None)))
    }

    /// Lower a function body; parameters are bound by the VM at call time
    pub fn lower_function(lambda: &Lambda) -> Result<Arc<FunctionProto>, LoweringError> {
        let mut compiler = Compiler::new();
        compiler.compile_expression(&lambda.body)?;
        compiler.builder.emit(Op::Return);
        let program = Arc::new(compiler.builder.finish(lambda.name.clone()));
        Ok(Arc::new(FunctionProto {
            name: lambda.name.clone(),
            params: lambda.params.clone(),
            program,
        }))
    }

    /// Compile a statement list leaving exactly one value; `empty` is pushed
    /// when there are no statements
    fn compile_statements(
        &mut self,
        statements: &[Statement],
        empty: Value,
    ) -> Result<(), LoweringError> {
        if statements.is_empty() {
            self.builder.emit(Op::Const { value: empty });
            return Ok(());
        }
        let last = statements.len() - 1;
        for (i, stmt) in statements.iter().enumerate() {
            self.compile_statement(stmt)?;
            if i != last {
                self.builder.emit(Op::Pop);
            }
        }
        Ok(())
    }

    /// `EnterScope; body; ExitScope`
    fn compile_block(&mut self, block: &Block) -> Result<(), LoweringError> {
        self.enter_scope();
        self.compile_statements(&block.body, Value::Void)?;
        self.exit_scope();
        Ok(())
    }

    fn enter_scope(&mut self) {
        self.builder.emit(Op::EnterScope);
        self.scope_depth += 1;
    }

    fn exit_scope(&mut self) {
        self.builder.emit(Op::ExitScope { count: 1 });
        self.scope_depth = self.scope_depth.saturating_sub(1);
    }

    /// Push a loop context; returns its index
    fn push_loop(&mut self, label: Option<Str>, breakpoint: bool) -> usize {
        self.loop_stack.push(LoopContext {
            label,
            breakpoint,
            scope_depth: self.scope_depth,
            ensure_depth: self.ensure_stack.len(),
            continue_target: None,
            break_jumps: Vec::new(),
        });
        self.loop_stack.len() - 1
    }

    fn set_continue_target(&mut self, target: usize) {
        if let Some(ctx) = self.loop_stack.last_mut() {
            ctx.continue_target = Some(target);
        }
    }

    /// Pop a loop context and patch its break jumps to the current position
    fn pop_loop(&mut self) {
        if let Some(ctx) = self.loop_stack.pop() {
            for jump in ctx.break_jumps {
                self.builder.patch_jump(jump);
            }
        }
    }

    /// Resolve the loop targeted by a break/continue
    fn find_loop(
        &self,
        label: Option<&Str>,
        keyword: &'static str,
    ) -> Result<usize, LoweringError> {
        match label {
            Some(label) => {
                let index = self
                    .loop_stack
                    .iter()
                    .rposition(|ctx| ctx.label.as_ref() == Some(label))
                    .ok_or_else(|| LoweringError::UnknownLabel(label.cheap_clone()))?;
                let breakpoint = self
                    .loop_stack
                    .get(index)
                    .is_some_and(|ctx| ctx.breakpoint);
                if keyword == "continue" && breakpoint {
                    return Err(LoweringError::OutsideLoop { keyword });
                }
                Ok(index)
            }
            None => self
                .loop_stack
                .iter()
                .rposition(|ctx| !ctx.breakpoint)
                .ok_or(LoweringError::OutsideLoop { keyword }),
        }
    }

    /// Inline the cleanup of every ensure region above `ensure_depth` and
    /// unwind scopes down to `scope_depth`
    fn emit_unwind_to(
        &mut self,
        scope_depth: usize,
        ensure_depth: usize,
    ) -> Result<(), LoweringError> {
        let mut depth = self.scope_depth;
        let mut index = self.ensure_stack.len();
        while index > ensure_depth {
            index -= 1;
            let Some(region) = self.ensure_stack.get(index).cloned() else {
                break;
            };
            if depth > region.scope_depth {
                self.builder.emit(Op::ExitScope {
                    count: depth - region.scope_depth,
                });
                depth = region.scope_depth;
            }
            self.builder.emit(Op::HandlerTruncate {
                depth: region.handler_depth,
            });

            // Compile the cleanup as if at the region itself
            let saved_ensures = self.ensure_stack.split_off(index);
            let saved_scope = std::mem::replace(&mut self.scope_depth, depth);
            let saved_handlers = std::mem::replace(&mut self.handler_depth, region.handler_depth);
            let result = self.compile_block(&region.cleanup);
            self.scope_depth = saved_scope;
            self.handler_depth = saved_handlers;
            self.ensure_stack.extend(saved_ensures);
            result?;
            self.builder.emit(Op::Pop);
        }
        if depth > scope_depth {
            self.builder.emit(Op::ExitScope {
                count: depth - scope_depth,
            });
        }
        Ok(())
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}
