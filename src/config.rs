//! Runtime configuration
//!
//! Loaded from JSON (or built in code) and optionally overridden by
//! environment variables:
//!
//! ```bash
//! ABLE_EXECUTOR=parallel cargo test
//! ABLE_EXEC_MODE=tree_walker cargo test
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

/// Which executor drives spawned tasks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    /// Single logical worker with deterministic interleaving
    #[default]
    Cooperative,
    /// One OS thread per task
    Parallel,
}

/// How module bodies are evaluated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    /// Lower to bytecode and run on the VM, falling back to the tree-walker
    /// for constructs the lowering pass does not support
    #[default]
    Bytecode,
    TreeWalker,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub executor: ExecutorKind,
    pub exec_mode: ExecMode,
    /// Nested call limit before a StackOverflow error is raised
    pub max_call_depth: usize,
    /// Drain cooperative tasks when the outermost synchronous section ends
    pub auto_drain: bool,
    /// Poll interval for parallel flush and mutex waits
    pub parallel_poll_interval_ms: u64,
    /// How long a synchronous caller waits for timer-driven wakeups before
    /// reporting a deadlock under the cooperative executor
    pub sync_wait_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            executor: ExecutorKind::Cooperative,
            exec_mode: ExecMode::Bytecode,
            max_call_depth: 200,
            auto_drain: true,
            parallel_poll_interval_ms: 10,
            sync_wait_timeout_ms: 1000,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(source: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn with_executor(mut self, executor: ExecutorKind) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_exec_mode(mut self, exec_mode: ExecMode) -> Self {
        self.exec_mode = exec_mode;
        self
    }

    /// Apply `ABLE_EXECUTOR` / `ABLE_EXEC_MODE` overrides
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.apply_overrides(
            std::env::var("ABLE_EXECUTOR").ok().as_deref(),
            std::env::var("ABLE_EXEC_MODE").ok().as_deref(),
        )
    }

    fn apply_overrides(
        mut self,
        executor: Option<&str>,
        exec_mode: Option<&str>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = executor {
            self.executor = parse_enum("ABLE_EXECUTOR", value)?;
        }
        if let Some(value) = exec_mode {
            self.exec_mode = parse_enum("ABLE_EXEC_MODE", value)?;
        }
        Ok(self)
    }
}

fn parse_enum<T: for<'de> Deserialize<'de>>(key: &str, value: &str) -> Result<T, ConfigError> {
    serde_json::from_value(serde_json::Value::String(value.trim().to_ascii_lowercase())).map_err(
        |_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        },
    )
}
