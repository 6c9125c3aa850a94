//! Interpreter for executing lowered bytecode and AST
//!
//! [`Interpreter`] is a cheap handle shared by the VM, the tree-walker, await
//! arms and spawned tasks. It owns the global scope, the capability set and
//! the executor, and implements the operations both evaluators share: calls,
//! member access, task spawning and synchronous future waits.

mod bytecode_vm;
pub mod capabilities;
mod eval;
mod natives;
mod patterns;

pub use bytecode_vm::Vm;
pub use capabilities::{
    Capabilities, DisplayStringifier, Indexer, Iteration, IterationState, MemberResolver,
    MethodTable, OperatorEvaluator, StandardIndexer, StandardIteration, StandardOperators,
    Stringifier,
};
pub use eval::TreeWalker;
pub use patterns::match_pattern;

use crate::ast::{BinaryOp, Expression, Module};
use crate::compiler::{Compiler, Program};
use crate::config::{ExecMode, ExecutorKind, RuntimeConfig};
use crate::environment::{Env, Environment};
use crate::error::{LoweringError, RuntimeError};
use crate::runtime::{
    AsyncPayload, CooperativeExecutor, Executor, FutureHandle, HandoffTask, ParallelExecutor,
};
use crate::value::{
    BoundMethod, Closure, FunctionBody, IteratorRef, NativeFunction, RangeIter, Value,
};
use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Context handed to native functions
pub struct NativeCall<'a> {
    pub interp: &'a Interpreter,
    /// Async context of the calling task; `None` for synchronous host calls
    pub payload: Option<&'a Arc<AsyncPayload>>,
}

struct Shared {
    globals: Env,
    capabilities: Capabilities,
    methods: Arc<MethodTable>,
    executor: Arc<dyn Executor>,
    config: RuntimeConfig,
}

/// Shared interpreter handle
#[derive(Clone)]
pub struct Interpreter {
    shared: Arc<Shared>,
}

thread_local! {
    static CALL_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Tracks nested host-level calls on this thread
struct CallDepthGuard;

impl CallDepthGuard {
    fn enter(limit: usize) -> Result<Self, RuntimeError> {
        CALL_DEPTH.with(|depth| {
            if depth.get() >= limit {
                return Err(RuntimeError::raise(
                    "StackOverflow",
                    "maximum call depth exceeded",
                ));
            }
            depth.set(depth.get() + 1);
            Ok(CallDepthGuard)
        })
    }
}

impl Drop for CallDepthGuard {
    fn drop(&mut self) {
        CALL_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Defers cooperative draining until the outermost host entry returns
struct SyncSection<'a> {
    executor: &'a dyn Executor,
}

impl<'a> SyncSection<'a> {
    fn enter(executor: &'a dyn Executor) -> Self {
        executor.begin_synchronous_section();
        SyncSection { executor }
    }
}

impl Drop for SyncSection<'_> {
    fn drop(&mut self) {
        self.executor.end_synchronous_section();
    }
}

impl Interpreter {
    pub fn new(config: RuntimeConfig) -> Self {
        let methods = Arc::new(MethodTable::default());
        let capabilities = Capabilities::with_methods(methods.clone());
        Self::build(config, capabilities, methods, None)
    }

    /// Use a custom capability set; registered methods are consulted after
    /// the capability's own member resolver
    pub fn with_capabilities(config: RuntimeConfig, capabilities: Capabilities) -> Self {
        Self::build(config, capabilities, Arc::new(MethodTable::default()), None)
    }

    /// Use a caller-provided executor (its kind overrides `config.executor`)
    pub fn with_executor(mut config: RuntimeConfig, executor: Arc<dyn Executor>) -> Self {
        config.executor = executor.kind();
        let methods = Arc::new(MethodTable::default());
        let capabilities = Capabilities::with_methods(methods.clone());
        Self::build(config, capabilities, methods, Some(executor))
    }

    fn build(
        config: RuntimeConfig,
        capabilities: Capabilities,
        methods: Arc<MethodTable>,
        executor: Option<Arc<dyn Executor>>,
    ) -> Self {
        let executor = executor.unwrap_or_else(|| match config.executor {
            ExecutorKind::Cooperative => Arc::new(CooperativeExecutor::new(config.auto_drain)),
            ExecutorKind::Parallel => Arc::new(ParallelExecutor::new(Duration::from_millis(
                config.parallel_poll_interval_ms,
            ))),
        });
        let globals = Environment::root();
        natives::install(&globals, &methods);
        debug!(
            executor = ?config.executor,
            exec_mode = ?config.exec_mode,
            "interpreter created"
        );
        Interpreter {
            shared: Arc::new(Shared {
                globals,
                capabilities,
                methods,
                executor,
                config,
            }),
        }
    }

    pub fn globals(&self) -> &Env {
        &self.shared.globals
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.shared.capabilities
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.shared.executor
    }

    pub fn executor_kind(&self) -> ExecutorKind {
        self.shared.executor.kind()
    }

    /// Bind a native function in the global scope
    pub fn define_native<F>(&self, name: &str, arity: Option<usize>, func: F)
    where
        F: Fn(&NativeCall<'_>, &[Value]) -> Result<Value, RuntimeError> + Send + Sync + 'static,
    {
        let native = NativeFunction::new(name, arity, func);
        self.shared
            .globals
            .define(name.into(), Value::Native(native));
    }

    /// Register a method for a type name; the receiver is passed first
    pub fn register_method(&self, type_name: &str, name: &str, method: Value) {
        self.shared.methods.register(type_name, name, method);
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // Entry points
    // ═══════════════════════════════════════════════════════════════════════════════

    /// Evaluate a module in the global scope
    pub fn evaluate_module(&self, module: &Module) -> Result<Value, RuntimeError> {
        let _section = SyncSection::enter(self.shared.executor.as_ref());
        let globals = self.globals().clone();
        let result = match self.lower(|| Compiler::lower_module(module))? {
            Some(program) => self.run_bytecode(program, globals),
            None => TreeWalker::new(self.clone(), None).eval_module(module, &globals),
        };
        finish_host_result(result)
    }

    /// Evaluate a single expression in the global scope
    pub fn evaluate_expression(&self, expression: &Expression) -> Result<Value, RuntimeError> {
        let _section = SyncSection::enter(self.shared.executor.as_ref());
        let globals = self.globals().clone();
        let result = match self.lower(|| Compiler::lower_expression(expression))? {
            Some(program) => self.run_bytecode(program, globals),
            None => TreeWalker::new(self.clone(), None).eval_expression(expression, &globals),
        };
        finish_host_result(result)
    }

    /// Lower with the configured mode; `None` selects the tree-walker
    fn lower(
        &self,
        lower: impl FnOnce() -> Result<Arc<Program>, LoweringError>,
    ) -> Result<Option<Arc<Program>>, RuntimeError> {
        if self.config().exec_mode == ExecMode::TreeWalker {
            return Ok(None);
        }
        match lower() {
            Ok(program) => Ok(Some(program)),
            Err(err) if err.is_unsupported() => {
                debug!(%err, "falling back to tree-walker");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Run a lowered program to completion in `env`
    pub fn run_bytecode(&self, program: Arc<Program>, env: Env) -> Result<Value, RuntimeError> {
        Vm::new(self.clone(), program, env, None).run()
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // Calls & members
    // ═══════════════════════════════════════════════════════════════════════════════

    /// Call any callable value
    pub fn call_value(
        &self,
        callee: &Value,
        args: Vec<Value>,
        payload: Option<&Arc<AsyncPayload>>,
    ) -> Result<Value, RuntimeError> {
        let _depth = CallDepthGuard::enter(self.config().max_call_depth)?;
        match callee {
            Value::Function(closure) => self.call_closure(closure, args, payload),
            Value::Native(native) => native.call(
                &NativeCall {
                    interp: self,
                    payload,
                },
                &args,
            ),
            Value::BoundMethod(bound) => {
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(bound.receiver.clone());
                full.extend(args);
                self.call_value(&bound.method, full, payload)
            }
            other => Err(RuntimeError::type_error(format!(
                "value of type {} is not callable",
                other.type_name()
            ))),
        }
    }

    fn call_closure(
        &self,
        closure: &Closure,
        args: Vec<Value>,
        payload: Option<&Arc<AsyncPayload>>,
    ) -> Result<Value, RuntimeError> {
        let env = Environment::child(&closure.env);
        bind_params(closure, args, &env)?;
        match &closure.body {
            FunctionBody::Bytecode(proto) => {
                Vm::new(self.clone(), proto.program.clone(), env, payload.cloned()).run()
            }
            FunctionBody::Ast(lambda) => {
                TreeWalker::new(self.clone(), payload.cloned()).call_body(&lambda.body, &env)
            }
        }
    }

    /// Call the method `name` on `receiver`
    pub fn call_method(
        &self,
        receiver: &Value,
        name: &str,
        args: Vec<Value>,
        payload: Option<&Arc<AsyncPayload>>,
    ) -> Result<Value, RuntimeError> {
        let method = self.member(receiver, name, true)?;
        self.call_value(&method, args, payload)
    }

    fn lookup_method(&self, receiver: &Value, name: &str) -> Option<Value> {
        self.capabilities()
            .members
            .resolve_method(receiver, name)
            .or_else(|| self.shared.methods.resolve_method(receiver, name))
    }

    /// Member access. With `prefer_methods` a registered method wins over a
    /// struct field of the same name (call position).
    pub fn member(
        &self,
        receiver: &Value,
        name: &str,
        prefer_methods: bool,
    ) -> Result<Value, RuntimeError> {
        let bind = |method: Value| {
            Value::BoundMethod(Arc::new(BoundMethod {
                receiver: receiver.clone(),
                method,
            }))
        };
        let field = match receiver {
            Value::Struct(instance) => instance.get_field(name),
            Value::Error(err) => match name {
                "message" => Some(Value::String(err.message.clone())),
                "kind" => Some(Value::String(err.kind.clone())),
                "payload" => Some(err.payload.clone().unwrap_or_default()),
                _ => None,
            },
            _ => None,
        };
        let method = self.lookup_method(receiver, name);
        match (field, method) {
            (Some(_), Some(method)) if prefer_methods => Ok(bind(method)),
            (Some(field), _) => Ok(field),
            (None, Some(method)) => Ok(bind(method)),
            (None, None) => Err(RuntimeError::raise(
                "MemberError",
                format!("no member '{}' on value of type {}", name, receiver.type_name()),
            )),
        }
    }

    pub fn set_member(&self, object: &Value, name: &str, value: Value) -> Result<(), RuntimeError> {
        match object {
            Value::Struct(instance) => {
                if instance.set_field(name, value) {
                    Ok(())
                } else {
                    Err(RuntimeError::raise(
                        "MemberError",
                        format!("struct {} has no field '{}'", instance.name, name),
                    ))
                }
            }
            other => Err(RuntimeError::type_error(format!(
                "cannot assign member '{}' on value of type {}",
                name,
                other.type_name()
            ))),
        }
    }

    /// Resolve a call target by name; dotted names walk members
    pub fn resolve_callee(&self, env: &Env, name: &str) -> Result<Value, RuntimeError> {
        if let Some(value) = env.get(name) {
            return Ok(value);
        }
        let mut segments = name.split('.');
        let head = segments.next().unwrap_or(name);
        let rest: Vec<&str> = segments.collect();
        if rest.is_empty() {
            return Err(RuntimeError::reference_error(name));
        }
        let mut current = env
            .get(head)
            .ok_or_else(|| RuntimeError::reference_error(head))?;
        let last = rest.len() - 1;
        for (i, segment) in rest.iter().enumerate() {
            current = self.member(&current, segment, i == last)?;
        }
        Ok(current)
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // Shared value operations
    // ═══════════════════════════════════════════════════════════════════════════════

    pub fn binary(&self, op: BinaryOp, left: &Value, right: &Value) -> Result<Value, RuntimeError> {
        if let (BinaryOp::Add, Value::String(a), Value::String(b)) = (op, left, right) {
            let mut out = String::with_capacity(a.len() + b.len());
            out.push_str(a.as_str());
            out.push_str(b.as_str());
            return Ok(Value::string(out));
        }
        self.capabilities().operators.binary(op, left, right)
    }

    pub fn interpolate(&self, parts: &[Value]) -> Result<String, RuntimeError> {
        let mut out = String::new();
        for part in parts {
            out.push_str(&self.capabilities().stringifier.stringify(part)?);
        }
        Ok(out)
    }

    pub fn make_range(
        &self,
        start: &Value,
        end: &Value,
        inclusive: bool,
    ) -> Result<Value, RuntimeError> {
        match (start, end) {
            (Value::Int(start), Value::Int(end)) => Ok(Value::Iterator(IteratorRef::new(
                RangeIter::new(*start, *end, inclusive),
            ))),
            (a, b) => Err(RuntimeError::type_error(format!(
                "range bounds must be Int, got {} and {}",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // Tasks
    // ═══════════════════════════════════════════════════════════════════════════════

    /// Spawn a lowered program as a task. The VM is created on first run and
    /// resumed in place after every yield.
    pub fn spawn_program(&self, program: Arc<Program>, env: Env) -> FutureHandle {
        let interp = self.clone();
        let mut vm: Option<Vm> = None;
        self.executor().run(Box::new(move |payload| {
            let vm = vm.get_or_insert_with(|| {
                let task_env = Environment::child_with_payload(&env, payload.clone());
                Vm::new(interp.clone(), program.clone(), task_env, Some(payload.clone()))
            });
            vm.run()
        }))
    }

    /// Spawn an AST body as a task. Cooperative tasks run the walker on a
    /// thread of their own that parks at each suspension point and picks up
    /// where it stopped; parallel tasks block in place and never yield.
    pub fn spawn_tree(&self, body: Arc<Expression>, env: Env) -> FutureHandle {
        let interp = self.clone();
        let walk = move |payload: Arc<AsyncPayload>| {
            let task_env = Environment::child_with_payload(&env, payload.clone());
            TreeWalker::new(interp, Some(payload)).eval_expression(&body, &task_env)
        };
        match self.executor_kind() {
            ExecutorKind::Cooperative => {
                let mut task = HandoffTask::new(Box::new(walk));
                self.executor().run(Box::new(move |payload| task.step(payload)))
            }
            ExecutorKind::Parallel => {
                let mut walk = Some(walk);
                self.executor().run(Box::new(move |payload| match walk.take() {
                    Some(walk) => walk(payload.clone()),
                    None => Err(RuntimeError::internal("parallel task ran twice")),
                }))
            }
        }
    }

    /// The settled value of `handle`, suspending or blocking the caller until
    /// it is available
    pub fn future_value(
        &self,
        handle: &FutureHandle,
        payload: Option<&Arc<AsyncPayload>>,
    ) -> Result<Value, RuntimeError> {
        if !handle.is_pending() {
            if let Some(payload) = payload {
                payload.forget_future(handle.id());
            }
            return handle.outcome().into_result();
        }
        match (payload, self.executor_kind()) {
            (Some(payload), ExecutorKind::Cooperative) => {
                if payload.cancel_requested() {
                    return Err(RuntimeError::Cancelled);
                }
                if Arc::ptr_eq(payload.handle(), handle) {
                    return Err(RuntimeError::raise(
                        "Deadlock",
                        "a task cannot wait for its own future",
                    ));
                }
                payload.set_blocked(true);
                if payload.watch_future(handle.id()) {
                    let weak = Arc::downgrade(payload);
                    handle.add_awaiter(Box::new(move || {
                        if let Some(payload) = weak.upgrade() {
                            payload.wake();
                        }
                    }));
                }
                if !handle.is_pending() {
                    payload.set_blocked(false);
                    payload.forget_future(handle.id());
                    return handle.outcome().into_result();
                }
                trace!(task = payload.handle().id(), waiting_on = handle.id(), "future value suspended");
                Err(RuntimeError::Yield)
            }
            (Some(payload), ExecutorKind::Parallel) => {
                let _blocking = payload.enter_blocking();
                handle
                    .wait_cancellable(payload.handle().token())?
                    .into_result()
            }
            (None, ExecutorKind::Cooperative) => {
                let executor = self.executor();
                let timeout = Duration::from_millis(self.config().sync_wait_timeout_ms);
                while handle.is_pending() {
                    if !executor.drive(handle) {
                        executor.flush();
                    }
                    if handle.is_pending() && !executor.wait_for_work(timeout) && handle.is_pending()
                    {
                        return Err(RuntimeError::raise(
                            "Deadlock",
                            format!("future #{} can never complete", handle.id()),
                        ));
                    }
                }
                handle.outcome().into_result()
            }
            (None, ExecutorKind::Parallel) => handle.wait().into_result(),
        }
    }
}

/// Bind call arguments to a closure's parameters in `env`
pub(crate) fn bind_params(
    closure: &Closure,
    args: Vec<Value>,
    env: &Env,
) -> Result<(), RuntimeError> {
    if args.len() != closure.arity() {
        return Err(RuntimeError::type_error(format!(
            "{} expects {} argument(s), got {}",
            closure
                .name
                .as_ref()
                .map_or("function", |name| name.as_str()),
            closure.arity(),
            args.len()
        )));
    }
    for (param, arg) in closure.params.iter().zip(args) {
        env.define(param.clone(), arg);
    }
    Ok(())
}

/// Map control signals that escaped to the host onto results
fn finish_host_result(result: Result<Value, RuntimeError>) -> Result<Value, RuntimeError> {
    match result {
        Err(RuntimeError::Return(value)) => Ok(value),
        Err(RuntimeError::Break { .. }) => Err(RuntimeError::raise(
            "SyntaxError",
            "break outside of loop",
        )),
        Err(RuntimeError::Continue { .. }) => Err(RuntimeError::raise(
            "SyntaxError",
            "continue outside of loop",
        )),
        Err(RuntimeError::Yield) => Err(RuntimeError::internal(
            "yield outside of an asynchronous task",
        )),
        other => other,
    }
}
