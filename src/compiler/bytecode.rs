//! Bytecode instruction set and program format
//!
//! The VM is stack-based: operands are pushed by earlier instructions and
//! consumed by later ones. Every lowered construct leaves exactly one value.

use crate::ast::{BinaryOp, NodeId, Pattern, UnaryOp};
use crate::error::SourceSpan;
use crate::value::{Str, Value};
use std::sync::Arc;

/// Jump target (instruction index)
pub type JumpTarget = usize;

/// Bytecode operation
#[derive(Debug, Clone)]
pub enum Op {
    // ═══════════════════════════════════════════════════════════════════════════════
    // Constants & Stack
    // ═══════════════════════════════════════════════════════════════════════════════
    /// Push a literal value
    Const { value: Value },

    /// Duplicate the top of stack
    Dup,

    /// Discard the top of stack
    Pop,

    // ═══════════════════════════════════════════════════════════════════════════════
    // Names & Scopes
    // ═══════════════════════════════════════════════════════════════════════════════
    /// Push the value bound to `name`
    LoadName { name: Str },

    /// `name := top`; fails if `name` already exists in the current scope.
    /// Leaves the value on the stack.
    DeclareName { name: Str },

    /// `name = top`; updates the nearest binding or defines one in the current
    /// scope. Leaves the value on the stack.
    AssignName { name: Str },

    /// Push a child environment
    EnterScope,

    /// Unwind `count` child environments (0 is treated as 1)
    ExitScope { count: usize },

    // ═══════════════════════════════════════════════════════════════════════════════
    // Operators
    // ═══════════════════════════════════════════════════════════════════════════════
    /// Pop right, pop left, push `left op right`
    Binary { op: BinaryOp },

    /// Pop operand, push `op operand`
    Unary { op: UnaryOp },

    // ═══════════════════════════════════════════════════════════════════════════════
    // Control Flow
    // ═══════════════════════════════════════════════════════════════════════════════
    Jump { target: JumpTarget },

    /// Pop condition; jump when falsy
    JumpIfFalse { target: JumpTarget },

    /// Pop condition; jump when truthy
    JumpIfTrue { target: JumpTarget },

    /// Pop value; jump when nil
    JumpIfNil { target: JumpTarget },

    /// Peek value; jump (keeping it) unless it is nil or an error value
    JumpUnlessFailure { target: JumpTarget },

    // ═══════════════════════════════════════════════════════════════════════════════
    // Calls & Functions
    // ═══════════════════════════════════════════════════════════════════════════════
    /// Stack: callee, arg1..argN → result
    Call { argc: usize },

    /// Stack: arg1..argN → result; callee resolved by (possibly dotted) name
    CallName { name: Str, argc: usize },

    /// Pop the return value and leave the current call frame
    Return,

    /// Push a closure over the current environment
    MakeClosure { function: Arc<FunctionProto> },

    // ═══════════════════════════════════════════════════════════════════════════════
    // Members, Indexing & Literals
    // ═══════════════════════════════════════════════════════════════════════════════
    /// Pop object, push member. `safe` short-circuits nil objects to nil;
    /// `prefer_methods` lets a method win over a same-named field.
    MemberAccess {
        member: Str,
        safe: bool,
        prefer_methods: bool,
    },

    /// Stack: value, object → value
    MemberSet { member: Str },

    /// Stack: object, index → element
    IndexGet,

    /// Stack: value, object, index → value
    IndexSet,

    /// Pop `count` values, push an array of them
    MakeArray { count: usize },

    /// Pop one value per field name, push a struct instance
    MakeStruct { name: Str, fields: Arc<[Str]> },

    /// Pop `count` parts, push their concatenated string forms
    Interpolate { count: usize },

    /// Stack: start, end → lazy integer iterator
    MakeRange { inclusive: bool },

    // ═══════════════════════════════════════════════════════════════════════════════
    // Loops & Iteration
    // ═══════════════════════════════════════════════════════════════════════════════
    /// Open a loop frame. `continue_target` is `None` for breakpoint blocks.
    LoopEnter {
        label: Option<Str>,
        break_target: JumpTarget,
        continue_target: Option<JumpTarget>,
    },

    /// Top of each iteration: restore the loop frame's stack height
    LoopHead,

    /// Pop the loop result, close the loop frame, push the result
    LoopExit,

    /// Pop an iterable and push an iterator frame
    IterPush,

    /// Push the next element, or jump when the iterator is exhausted
    IterNext { exhausted: JumpTarget },

    /// Close and pop the innermost iterator frame
    IterClose,

    // ═══════════════════════════════════════════════════════════════════════════════
    // Patterns
    // ═══════════════════════════════════════════════════════════════════════════════
    /// Pop a value and bind it into the current scope; raises on mismatch
    BindPattern { pattern: Arc<Pattern> },

    /// Peek the subject; bind on match, else jump
    MatchPattern {
        pattern: Arc<Pattern>,
        fail: JumpTarget,
    },

    /// Pop the subject and raise a non-exhaustive match error
    MatchFailed,

    // ═══════════════════════════════════════════════════════════════════════════════
    // Errors & Handlers
    // ═══════════════════════════════════════════════════════════════════════════════
    /// Pop a value and raise it (non-error values are wrapped)
    Raise,

    /// Re-raise the innermost error being handled by a rescue clause
    Rethrow,

    /// Pop the unmatched error and re-raise it
    Reraise,

    /// Pop a value; raise it if it is an error value, else push it back
    Propagate,

    /// Install a rescue/or-else handler that jumps to `target` on raise
    HandlerPush { kind: HandlerKind, target: JumpTarget },

    /// Remove the innermost handler (guarded region completed normally)
    HandlerPop,

    /// Drop handler frames above `depth` (relative to the current call frame)
    HandlerTruncate { depth: usize },

    /// Forget the innermost handled error once a rescue clause completes
    RaisedPop,

    /// Open an ensure region whose inlined cleanup starts at `cleanup`
    EnsureStart { cleanup: JumpTarget },

    /// Pop the guarded result into the ensure frame and enter cleanup
    EnsureCapture,

    /// Close the ensure frame: re-raise a captured error or push the result
    EnsureEnd,

    // ═══════════════════════════════════════════════════════════════════════════════
    // Concurrency
    // ═══════════════════════════════════════════════════════════════════════════════
    /// Stack: arms → winning arm's value; may suspend the task
    Await { site: NodeId },

    /// Spawn `program` as a task in a child of the current scope; push its future
    Spawn { program: Arc<Program> },
}

/// Handler frame kinds installed by `HandlerPush`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Rescue,
    OrElse,
}

/// A single instruction with optional source location
#[derive(Debug, Clone)]
pub struct Instruction {
    pub op: Op,
    pub span: Option<SourceSpan>,
}

/// Immutable lowered program, shared across invocations
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub code: Vec<Instruction>,
    pub name: Option<Str>,
}

impl Program {
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Iterate over the operations only
    pub fn ops(&self) -> impl Iterator<Item = &Op> {
        self.code.iter().map(|i| &i.op)
    }

    /// Human-readable listing for debugging
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        for (i, instr) in self.code.iter().enumerate() {
            out.push_str(&format!("{:4}  {:?}\n", i, instr.op));
        }
        out
    }
}

/// A lowered function body with its parameter list
#[derive(Debug)]
pub struct FunctionProto {
    pub name: Option<Str>,
    pub params: Vec<Str>,
    pub program: Arc<Program>,
}
