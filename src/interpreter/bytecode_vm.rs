//! Bytecode Virtual Machine
//!
//! A stack machine over lowered [`Program`]s. All execution state (operand
//! stack, call frames, loop/handler/iterator stacks) lives in the VM value,
//! so a task suspended with [`RuntimeError::Yield`] resumes by calling
//! [`Vm::run`] again: the suspending instruction is re-executed with its
//! operands still on the stack.

use crate::ast::Pattern;
use crate::compiler::{FunctionProto, HandlerKind, Op, Program};
use crate::environment::{Env, Environment};
use crate::error::RuntimeError;
use crate::runtime::{AsyncPayload, evaluate_await};
use crate::value::{Closure, ErrorValue, FunctionBody, StructInstance, Str, Value};
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::trace;

use super::Interpreter;
use super::capabilities::IterationState;
use super::patterns::match_pattern;

/// Outcome of a single instruction
enum OpResult {
    /// Proceed with `ip` (already advanced, or set by a jump/call)
    Continue,
    /// The outermost frame returned
    Halt(Value),
}

/// A call frame in the VM
struct CallFrame {
    /// Caller program and resume position
    program: Arc<Program>,
    return_ip: usize,
    /// Caller environment restored on return
    env: Env,
    /// Operand stack height below the callee slot
    stack_base: usize,
    loop_base: usize,
    handler_base: usize,
    iter_base: usize,
    raised_base: usize,
}

/// A live loop or breakpoint block
struct LoopFrame {
    label: Option<Str>,
    break_target: usize,
    continue_target: Option<usize>,
    env: Env,
    stack_len: usize,
    handler_depth: usize,
    iter_depth: usize,
    raised_depth: usize,
}

enum HandlerFrameKind {
    Rescue,
    OrElse,
    /// `captured` is set once the guarded region finished and cleanup runs
    Ensure {
        captured: Option<Result<Value, RuntimeError>>,
    },
}

/// Error handler for rescue / or-else / ensure
struct HandlerFrame {
    kind: HandlerFrameKind,
    target: usize,
    env: Env,
    stack_len: usize,
    loop_depth: usize,
    iter_depth: usize,
    raised_depth: usize,
    /// Call frame depth at time of push
    frame_depth: usize,
}

/// The bytecode virtual machine
pub struct Vm {
    interp: Interpreter,
    payload: Option<Arc<AsyncPayload>>,
    program: Arc<Program>,
    /// Next instruction to execute
    ip: usize,
    /// Instruction currently executing
    current: usize,
    env: Env,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    loops: Vec<LoopFrame>,
    handlers: Vec<HandlerFrame>,
    iterators: Vec<IterationState>,
    /// Errors being handled by rescue clauses, innermost last
    raised: Vec<Value>,
    finished: bool,
}

impl Vm {
    pub fn new(
        interp: Interpreter,
        program: Arc<Program>,
        env: Env,
        payload: Option<Arc<AsyncPayload>>,
    ) -> Self {
        Vm {
            interp,
            payload,
            program,
            ip: 0,
            current: 0,
            env,
            stack: Vec::with_capacity(16),
            frames: Vec::new(),
            loops: Vec::new(),
            handlers: Vec::new(),
            iterators: Vec::new(),
            raised: Vec::new(),
            finished: false,
        }
    }

    /// Execute until the program returns, raises, or the task must yield.
    ///
    /// After `Err(Yield)` the VM may be run again to resume.
    pub fn run(&mut self) -> Result<Value, RuntimeError> {
        if self.finished {
            return Err(RuntimeError::internal("VM already finished"));
        }
        loop {
            let program = self.program.clone();
            let Some(instruction) = program.code.get(self.ip) else {
                // Fell off the end: behave like `Return`
                let value = self.stack.pop().unwrap_or_default();
                match self.return_from_frame(value) {
                    Some(value) => return self.finish(Ok(value)),
                    None => continue,
                }
            };
            self.current = self.ip;
            self.ip += 1;

            match self.execute_op(&instruction.op) {
                Ok(OpResult::Continue) => {}
                Ok(OpResult::Halt(value)) => return self.finish(Ok(value)),
                Err(RuntimeError::Yield) => {
                    self.ip = self.current;
                    trace!(ip = self.current, "vm suspended");
                    return Err(RuntimeError::Yield);
                }
                Err(err) => {
                    if let Err(err) = self.handle_error(err) {
                        return self.finish(Err(err));
                    }
                }
            }
        }
    }

    fn finish(&mut self, result: Result<Value, RuntimeError>) -> Result<Value, RuntimeError> {
        while let Some(mut iter) = self.iterators.pop() {
            iter.close();
        }
        self.stack.clear();
        self.frames.clear();
        self.loops.clear();
        self.handlers.clear();
        self.raised.clear();
        self.finished = true;
        result
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // Stack helpers
    // ═══════════════════════════════════════════════════════════════════════════════

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack
            .pop()
            .ok_or_else(|| RuntimeError::internal("operand stack underflow"))
    }

    fn peek(&self) -> Result<&Value, RuntimeError> {
        self.stack
            .last()
            .ok_or_else(|| RuntimeError::internal("operand stack underflow"))
    }

    fn pop_n(&mut self, count: usize) -> Result<Vec<Value>, RuntimeError> {
        let start = self
            .stack
            .len()
            .checked_sub(count)
            .ok_or_else(|| RuntimeError::internal("operand stack underflow"))?;
        Ok(self.stack.split_off(start))
    }

    fn frame_loop_base(&self) -> usize {
        self.frames.last().map_or(0, |f| f.loop_base)
    }

    fn frame_handler_base(&self) -> usize {
        self.frames.last().map_or(0, |f| f.handler_base)
    }

    fn close_iterators_above(&mut self, depth: usize) {
        while self.iterators.len() > depth {
            if let Some(mut iter) = self.iterators.pop() {
                iter.close();
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // Instruction dispatch
    // ═══════════════════════════════════════════════════════════════════════════════

    fn execute_op(&mut self, op: &Op) -> Result<OpResult, RuntimeError> {
        match op {
            Op::Const { value } => {
                self.push(value.clone());
            }
            Op::Dup => {
                let value = self.peek()?.clone();
                self.push(value);
            }
            Op::Pop => {
                self.pop()?;
            }

            Op::LoadName { name } => {
                let value = self
                    .env
                    .get(name.as_str())
                    .ok_or_else(|| RuntimeError::reference_error(name.as_str()))?;
                self.push(value);
            }
            Op::DeclareName { name } => {
                let value = self.peek()?.clone();
                if self.env.has_own(name.as_str()) {
                    return Err(RuntimeError::raise(
                        "NameError",
                        ":= requires at least one new binding",
                    ));
                }
                self.env.define(name.clone(), value);
            }
            Op::AssignName { name } => {
                let value = self.peek()?.clone();
                if !self.env.assign_existing(name.as_str(), value.clone()) {
                    self.env.define(name.clone(), value);
                }
            }
            Op::EnterScope => {
                self.env = Environment::child(&self.env);
            }
            Op::ExitScope { count } => {
                for _ in 0..*count {
                    let parent = self
                        .env
                        .parent()
                        .cloned()
                        .ok_or_else(|| RuntimeError::internal("bytecode scope underflow"))?;
                    self.env = parent;
                }
            }

            Op::Binary { op } => {
                let right = self.pop()?;
                let left = self.pop()?;
                let result = self.interp.binary(*op, &left, &right)?;
                self.push(result);
            }
            Op::Unary { op } => {
                let operand = self.pop()?;
                let result = self.interp.capabilities().operators.unary(*op, &operand)?;
                self.push(result);
            }

            Op::Jump { target } => self.ip = *target,
            Op::JumpIfFalse { target } => {
                if !self.pop()?.is_truthy() {
                    self.ip = *target;
                }
            }
            Op::JumpIfTrue { target } => {
                if self.pop()?.is_truthy() {
                    self.ip = *target;
                }
            }
            Op::JumpIfNil { target } => {
                if self.pop()?.is_nil() {
                    self.ip = *target;
                }
            }
            Op::JumpUnlessFailure { target } => {
                if !self.peek()?.is_failure() {
                    self.ip = *target;
                }
            }

            Op::Call { argc } => {
                let base = self
                    .stack
                    .len()
                    .checked_sub(argc + 1)
                    .ok_or_else(|| RuntimeError::internal("operand stack underflow"))?;
                let callee = self
                    .stack
                    .get(base)
                    .cloned()
                    .ok_or_else(|| RuntimeError::internal("operand stack underflow"))?;
                let args = self.stack.get(base + 1..).map(<[Value]>::to_vec).unwrap_or_default();
                self.invoke(callee, args, base)?;
            }
            Op::CallName { name, argc } => {
                let base = self
                    .stack
                    .len()
                    .checked_sub(*argc)
                    .ok_or_else(|| RuntimeError::internal("operand stack underflow"))?;
                let callee = self.interp.resolve_callee(&self.env, name.as_str())?;
                let args = self.stack.get(base..).map(<[Value]>::to_vec).unwrap_or_default();
                self.invoke(callee, args, base)?;
            }
            Op::Return => {
                let value = self.pop()?;
                if let Some(value) = self.return_from_frame(value) {
                    return Ok(OpResult::Halt(value));
                }
            }
            Op::MakeClosure { function } => {
                let closure = make_closure(function, &self.env);
                self.push(closure);
            }

            Op::MemberAccess {
                member,
                safe,
                prefer_methods,
            } => {
                let object = self.pop()?;
                if *safe && object.is_nil() {
                    self.push(Value::Nil);
                } else {
                    let value = self.interp.member(&object, member.as_str(), *prefer_methods)?;
                    self.push(value);
                }
            }
            Op::MemberSet { member } => {
                let object = self.pop()?;
                let value = self.peek()?.clone();
                self.interp.set_member(&object, member.as_str(), value)?;
            }
            Op::IndexGet => {
                let index = self.pop()?;
                let object = self.pop()?;
                let value = self
                    .interp
                    .capabilities()
                    .indexer
                    .index_get(&object, &index)?;
                self.push(value);
            }
            Op::IndexSet => {
                let index = self.pop()?;
                let object = self.pop()?;
                let value = self.peek()?.clone();
                self.interp
                    .capabilities()
                    .indexer
                    .index_set(&object, &index, value)?;
            }
            Op::MakeArray { count } => {
                let items = self.pop_n(*count)?;
                self.push(Value::array(items));
            }
            Op::MakeStruct { name, fields } => {
                let values = self.pop_n(fields.len())?;
                let map: IndexMap<Str, Value> = fields.iter().cloned().zip(values).collect();
                self.push(Value::Struct(StructInstance::new(name.clone(), map)));
            }
            Op::Interpolate { count } => {
                let parts = self.pop_n(*count)?;
                let text = self.interp.interpolate(&parts)?;
                self.push(Value::string(text));
            }
            Op::MakeRange { inclusive } => {
                let end = self.pop()?;
                let start = self.pop()?;
                let range = self.interp.make_range(&start, &end, *inclusive)?;
                self.push(range);
            }

            Op::LoopEnter {
                label,
                break_target,
                continue_target,
            } => {
                self.loops.push(LoopFrame {
                    label: label.clone(),
                    break_target: *break_target,
                    continue_target: *continue_target,
                    env: self.env.clone(),
                    stack_len: self.stack.len(),
                    handler_depth: self.handlers.len(),
                    iter_depth: self.iterators.len(),
                    raised_depth: self.raised.len(),
                });
            }
            Op::LoopHead => {
                let index = self.find_loop_by(|frame| frame.continue_target == Some(self.current))?;
                self.restore_loop_frame(index)?;
                self.loops.truncate(index + 1);
            }
            Op::LoopExit => {
                let result = self.pop()?;
                let index = self.find_loop_by(|frame| frame.break_target == self.current)?;
                self.restore_loop_frame(index)?;
                self.loops.truncate(index);
                self.push(result);
            }
            Op::IterPush => {
                let iterable = self.pop()?;
                let state = self.interp.capabilities().iteration.iterate(&iterable)?;
                self.iterators.push(state);
            }
            Op::IterNext { exhausted } => {
                let iter = self
                    .iterators
                    .last_mut()
                    .ok_or_else(|| RuntimeError::internal("iterator stack underflow"))?;
                match iter.next()? {
                    Some(value) => self.push(value),
                    None => self.ip = *exhausted,
                }
            }
            Op::IterClose => {
                if let Some(mut iter) = self.iterators.pop() {
                    iter.close();
                }
            }

            Op::BindPattern { pattern } => {
                let value = self.pop()?;
                self.bind_pattern(pattern, &value)?;
            }
            Op::MatchPattern { pattern, fail } => {
                let subject = self.peek()?.clone();
                match match_pattern(pattern, &subject) {
                    Some(bindings) => {
                        for (name, value) in bindings {
                            self.env.define(name, value);
                        }
                    }
                    None => self.ip = *fail,
                }
            }
            Op::MatchFailed => {
                let subject = self.pop()?;
                return Err(RuntimeError::raise(
                    "MatchError",
                    format!("no match clause matched {}", subject),
                ));
            }

            Op::Raise => {
                let value = self.pop()?;
                return Err(RuntimeError::Raise(ErrorValue::wrap(value)));
            }
            Op::Rethrow => {
                let value = self.raised.last().cloned().ok_or_else(|| {
                    RuntimeError::raise("RethrowError", "rethrow outside of a rescue clause")
                })?;
                return Err(RuntimeError::Raise(value));
            }
            Op::Reraise => {
                let value = self.pop()?;
                self.raised.pop();
                return Err(RuntimeError::Raise(value));
            }
            Op::Propagate => {
                let value = self.pop()?;
                if matches!(value, Value::Error(_)) {
                    return Err(RuntimeError::Raise(value));
                }
                self.push(value);
            }
            Op::HandlerPush { kind, target } => {
                let kind = match kind {
                    HandlerKind::Rescue => HandlerFrameKind::Rescue,
                    HandlerKind::OrElse => HandlerFrameKind::OrElse,
                };
                self.push_handler(kind, *target);
            }
            Op::HandlerPop => {
                self.handlers
                    .pop()
                    .ok_or_else(|| RuntimeError::internal("handler stack underflow"))?;
            }
            Op::HandlerTruncate { depth } => {
                let keep = self.frame_handler_base() + depth;
                self.handlers.truncate(keep);
            }
            Op::RaisedPop => {
                self.raised.pop();
            }
            Op::EnsureStart { cleanup } => {
                self.push_handler(HandlerFrameKind::Ensure { captured: None }, *cleanup);
            }
            Op::EnsureCapture => {
                let result = self.pop()?;
                match self.handlers.last_mut() {
                    Some(HandlerFrame {
                        kind: HandlerFrameKind::Ensure { captured },
                        ..
                    }) if captured.is_none() => *captured = Some(Ok(result)),
                    _ => return Err(RuntimeError::internal("ensure frame missing at capture")),
                }
            }
            Op::EnsureEnd => match self.handlers.pop() {
                Some(HandlerFrame {
                    kind:
                        HandlerFrameKind::Ensure {
                            captured: Some(captured),
                        },
                    ..
                }) => {
                    let value = captured?;
                    self.push(value);
                }
                _ => return Err(RuntimeError::internal("ensure frame missing at end")),
            },

            Op::Await { site } => {
                let payload = self.payload.clone().ok_or_else(|| {
                    RuntimeError::raise(
                        "AsyncContextError",
                        "await expressions must run inside an asynchronous task",
                    )
                })?;
                let arms = self.peek()?.clone();
                let value = evaluate_await(&self.interp, &payload, *site, &arms)?;
                self.pop()?;
                self.push(value);
            }
            Op::Spawn { program } => {
                let handle = self.interp.spawn_program(program.clone(), self.env.clone());
                self.push(Value::Future(handle));
            }
        }
        Ok(OpResult::Continue)
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // Calls
    // ═══════════════════════════════════════════════════════════════════════════════

    /// Call `callee`; arguments stay on the stack until the call succeeds so
    /// a yielding native can be retried
    fn invoke(&mut self, callee: Value, args: Vec<Value>, base: usize) -> Result<(), RuntimeError> {
        let (callee, args) = unbind_method(callee, args);
        if let Value::Function(closure) = &callee {
            if let FunctionBody::Bytecode(proto) = &closure.body {
                return self.enter_function(closure, proto, args, base);
            }
        }
        let result = self.interp.call_value(&callee, args, self.payload.as_ref())?;
        self.stack.truncate(base);
        self.push(result);
        Ok(())
    }

    fn enter_function(
        &mut self,
        closure: &Closure,
        proto: &Arc<FunctionProto>,
        args: Vec<Value>,
        base: usize,
    ) -> Result<(), RuntimeError> {
        if self.frames.len() >= self.interp.config().max_call_depth {
            return Err(RuntimeError::raise(
                "StackOverflow",
                "maximum call depth exceeded",
            ));
        }
        let env = Environment::child(&closure.env);
        super::bind_params(closure, args, &env)?;

        self.stack.truncate(base);
        let caller_env = std::mem::replace(&mut self.env, env);
        let caller_program = std::mem::replace(&mut self.program, proto.program.clone());
        self.frames.push(CallFrame {
            program: caller_program,
            return_ip: self.ip,
            env: caller_env,
            stack_base: base,
            loop_base: self.loops.len(),
            handler_base: self.handlers.len(),
            iter_base: self.iterators.len(),
            raised_base: self.raised.len(),
        });
        self.ip = 0;
        Ok(())
    }

    /// Pop the current call frame and push `value` for the caller; returns
    /// the value when there is no caller left
    fn return_from_frame(&mut self, value: Value) -> Option<Value> {
        let Some(frame) = self.frames.pop() else {
            return Some(value);
        };
        self.close_iterators_above(frame.iter_base);
        self.stack.truncate(frame.stack_base);
        self.loops.truncate(frame.loop_base);
        self.handlers.truncate(frame.handler_base);
        self.raised.truncate(frame.raised_base);
        self.program = frame.program;
        self.ip = frame.return_ip;
        self.env = frame.env;
        self.push(value);
        None
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // Loops, handlers & unwinding
    // ═══════════════════════════════════════════════════════════════════════════════

    fn find_loop_by(&self, pred: impl Fn(&LoopFrame) -> bool) -> Result<usize, RuntimeError> {
        let base = self.frame_loop_base();
        self.loops
            .iter()
            .enumerate()
            .skip(base)
            .rev()
            .find(|(_, frame)| pred(frame))
            .map(|(index, _)| index)
            .ok_or_else(|| RuntimeError::internal("loop frame not found"))
    }

    /// Reset the stacks to the state recorded when the loop was entered
    fn restore_loop_frame(&mut self, index: usize) -> Result<(), RuntimeError> {
        let (env, stack_len, handler_depth, iter_depth, raised_depth) = {
            let frame = self
                .loops
                .get(index)
                .ok_or_else(|| RuntimeError::internal("loop frame not found"))?;
            (
                frame.env.clone(),
                frame.stack_len,
                frame.handler_depth,
                frame.iter_depth,
                frame.raised_depth,
            )
        };
        self.env = env;
        self.stack.truncate(stack_len);
        self.handlers.truncate(handler_depth);
        self.close_iterators_above(iter_depth);
        self.raised.truncate(raised_depth);
        Ok(())
    }

    fn push_handler(&mut self, kind: HandlerFrameKind, target: usize) {
        self.handlers.push(HandlerFrame {
            kind,
            target,
            env: self.env.clone(),
            stack_len: self.stack.len(),
            loop_depth: self.loops.len(),
            iter_depth: self.iterators.len(),
            raised_depth: self.raised.len(),
            frame_depth: self.frames.len(),
        });
    }

    /// Route an error to the innermost handler that accepts it
    fn handle_error(&mut self, err: RuntimeError) -> Result<(), RuntimeError> {
        if !matches!(err, RuntimeError::Raise(_) | RuntimeError::Cancelled) {
            return Err(err);
        }
        while let Some(mut handler) = self.handlers.pop() {
            let accepts = match &handler.kind {
                HandlerFrameKind::Rescue | HandlerFrameKind::OrElse => {
                    matches!(err, RuntimeError::Raise(_))
                }
                HandlerFrameKind::Ensure { captured } => captured.is_none(),
            };
            if !accepts {
                continue;
            }

            // Unwind to this handler's frame depth
            if self.frames.len() > handler.frame_depth {
                let mut unwound = self.frames.split_off(handler.frame_depth);
                if !unwound.is_empty() {
                    let frame = unwound.swap_remove(0);
                    self.program = frame.program;
                }
            }
            self.close_iterators_above(handler.iter_depth);
            self.stack.truncate(handler.stack_len);
            self.loops.truncate(handler.loop_depth);
            self.raised.truncate(handler.raised_depth);
            self.env = handler.env.clone();
            self.ip = handler.target;

            match handler.kind {
                HandlerFrameKind::Rescue => {
                    if let RuntimeError::Raise(value) = err {
                        self.raised.push(value.clone());
                        self.push(value);
                    }
                }
                HandlerFrameKind::OrElse => {
                    if let RuntimeError::Raise(value) = err {
                        self.push(value);
                    }
                }
                HandlerFrameKind::Ensure { .. } => {
                    handler.kind = HandlerFrameKind::Ensure {
                        captured: Some(Err(err)),
                    };
                    self.handlers.push(handler);
                }
            }
            return Ok(());
        }
        Err(err)
    }

    fn bind_pattern(&mut self, pattern: &Pattern, value: &Value) -> Result<(), RuntimeError> {
        let bindings = match_pattern(pattern, value).ok_or_else(|| {
            RuntimeError::raise("PatternError", format!("pattern does not match {}", value))
        })?;
        for (name, value) in bindings {
            self.env.define(name, value);
        }
        Ok(())
    }
}

/// Flatten bound methods: the receiver becomes the first argument
fn unbind_method(callee: Value, mut args: Vec<Value>) -> (Value, Vec<Value>) {
    let mut callee = callee;
    while let Value::BoundMethod(bound) = &callee {
        args.insert(0, bound.receiver.clone());
        let method = bound.method.clone();
        callee = method;
    }
    (callee, args)
}

pub(crate) fn make_closure(function: &Arc<FunctionProto>, env: &Env) -> Value {
    Value::Function(Arc::new(Closure {
        name: function.name.clone(),
        params: function.params.clone(),
        body: FunctionBody::Bytecode(function.clone()),
        env: env.clone(),
    }))
}
