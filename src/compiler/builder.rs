//! ProgramBuilder - helper for emitting instructions
//!
//! Provides emit/patch support for forward jumps whose targets are only
//! known once the enclosing construct has been fully emitted.

use super::bytecode::{Instruction, JumpTarget, Op, Program};
use crate::error::SourceSpan;
use crate::value::Str;

/// Placeholder for a jump that needs to be patched later
#[derive(Debug, Clone, Copy)]
pub struct JumpPlaceholder {
    /// Index of the jump instruction in the code
    pub instruction_index: usize,
}

/// Builder for constructing programs
#[derive(Default)]
pub struct ProgramBuilder {
    code: Vec<Instruction>,
    span: Option<SourceSpan>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the next instruction to be emitted
    pub fn current_offset(&self) -> usize {
        self.code.len()
    }

    /// Set the span attached to subsequently emitted instructions; returns the previous one
    pub fn set_span(&mut self, span: Option<SourceSpan>) -> Option<SourceSpan> {
        std::mem::replace(&mut self.span, span)
    }

    pub fn emit(&mut self, op: Op) {
        self.code.push(Instruction {
            op,
            span: self.span,
        });
    }

    /// Emit a jump-like op with a placeholder target
    pub fn emit_jump_op(&mut self, op: Op) -> JumpPlaceholder {
        let instruction_index = self.code.len();
        self.emit(op);
        JumpPlaceholder { instruction_index }
    }

    pub fn emit_jump(&mut self) -> JumpPlaceholder {
        self.emit_jump_op(Op::Jump { target: 0 })
    }

    pub fn emit_jump_if_false(&mut self) -> JumpPlaceholder {
        self.emit_jump_op(Op::JumpIfFalse { target: 0 })
    }

    pub fn emit_jump_if_true(&mut self) -> JumpPlaceholder {
        self.emit_jump_op(Op::JumpIfTrue { target: 0 })
    }

    pub fn emit_jump_if_nil(&mut self) -> JumpPlaceholder {
        self.emit_jump_op(Op::JumpIfNil { target: 0 })
    }

    pub fn emit_jump_to(&mut self, target: JumpTarget) {
        self.emit(Op::Jump { target });
    }

    /// Patch a jump to point at the current position
    pub fn patch_jump(&mut self, placeholder: JumpPlaceholder) {
        let target = self.current_offset();
        self.patch_jump_to(placeholder, target);
    }

    /// Patch a jump to a specific target
    pub fn patch_jump_to(&mut self, placeholder: JumpPlaceholder, new_target: JumpTarget) {
        let Some(instr) = self.code.get_mut(placeholder.instruction_index) else {
            return;
        };
        match &mut instr.op {
            Op::Jump { target }
            | Op::JumpIfFalse { target }
            | Op::JumpIfTrue { target }
            | Op::JumpIfNil { target }
            | Op::JumpUnlessFailure { target }
            | Op::HandlerPush { target, .. } => *target = new_target,
            Op::IterNext { exhausted } => *exhausted = new_target,
            Op::MatchPattern { fail, .. } => *fail = new_target,
            Op::EnsureStart { cleanup } => *cleanup = new_target,
            Op::LoopEnter { break_target, .. } => *break_target = new_target,
            _ => {}
        }
    }

    /// Set the continue target of a `LoopEnter` emitted earlier
    pub fn patch_continue(&mut self, placeholder: JumpPlaceholder, new_target: JumpTarget) {
        if let Some(Instruction {
            op: Op::LoopEnter {
                continue_target, ..
            },
            ..
        }) = self.code.get_mut(placeholder.instruction_index)
        {
            *continue_target = Some(new_target);
        }
    }

    pub fn finish(self, name: Option<Str>) -> Program {
        Program {
            code: self.code,
            name,
        }
    }
}
