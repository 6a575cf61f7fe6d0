use std::fmt;

use crate::error::{ErrorKind, RunError};

/// Default cap on call-frame depth. Arduino targets have tiny stacks, so the
/// default is deliberately conservative; hosts can raise it.
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 128;

/// Default cap on the total number of emitted command records per run.
pub const DEFAULT_MAX_COMMANDS: usize = 100_000;

/// Default cap on the estimated bytes held in strings, arrays, and structs.
pub const DEFAULT_MAX_VALUE_BYTES: usize = 8 * 1024 * 1024;

/// Default number of machine steps a single `tick()` may execute before
/// yielding back to the host.
pub const DEFAULT_MAX_STEPS_PER_TICK: usize = 200_000;

/// Error returned when an execution limit is exceeded.
#[derive(Debug, Clone)]
pub enum ResourceError {
    /// Maximum call-frame depth exceeded.
    Recursion { limit: usize, depth: usize },
    /// Maximum emitted command count exceeded.
    Commands { limit: usize, count: usize },
    /// Maximum estimated value memory exceeded.
    Memory { limit: usize, used: usize },
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recursion { limit, depth } => {
                write!(f, "recursion limit exceeded: {depth} > {limit}")
            }
            Self::Commands { limit, count } => {
                write!(f, "command limit exceeded: {count} > {limit}")
            }
            Self::Memory { limit, used } => {
                write!(f, "memory limit exceeded: {used} bytes > {limit} bytes")
            }
        }
    }
}

impl std::error::Error for ResourceError {}

impl From<ResourceError> for RunError {
    fn from(err: ResourceError) -> Self {
        let kind = match err {
            ResourceError::Recursion { .. } => ErrorKind::StackOverflow,
            ResourceError::Commands { .. } | ResourceError::Memory { .. } => ErrorKind::MemoryExhausted,
        };
        Self::new(kind, err.to_string())
    }
}

/// Configurable execution limits.
///
/// Checks fire at call-frame push (recursion), command emission (command
/// count), and string/array allocation (memory estimate).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ResourceLimits {
    pub max_recursion_depth: usize,
    pub max_commands: usize,
    pub max_value_bytes: usize,
    pub max_steps_per_tick: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_recursion_depth: DEFAULT_MAX_RECURSION_DEPTH,
            max_commands: DEFAULT_MAX_COMMANDS,
            max_value_bytes: DEFAULT_MAX_VALUE_BYTES,
            max_steps_per_tick: DEFAULT_MAX_STEPS_PER_TICK,
        }
    }
}

/// Running usage counters checked against [`ResourceLimits`].
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ResourceUsage {
    commands: usize,
    value_bytes: usize,
}

impl ResourceUsage {
    /// Called before pushing a call frame.
    pub fn check_recursion(&self, limits: &ResourceLimits, depth: usize) -> Result<(), ResourceError> {
        if depth >= limits.max_recursion_depth {
            return Err(ResourceError::Recursion {
                limit: limits.max_recursion_depth,
                depth: depth + 1,
            });
        }
        Ok(())
    }

    /// Called once per emitted command record.
    pub fn on_command(&mut self, limits: &ResourceLimits) -> Result<(), ResourceError> {
        self.commands += 1;
        if self.commands > limits.max_commands {
            return Err(ResourceError::Commands {
                limit: limits.max_commands,
                count: self.commands,
            });
        }
        Ok(())
    }

    /// Called when a string, array, or struct grows by `bytes`.
    pub fn on_allocate(&mut self, limits: &ResourceLimits, bytes: usize) -> Result<(), ResourceError> {
        self.value_bytes = self.value_bytes.saturating_add(bytes);
        if self.value_bytes > limits.max_value_bytes {
            return Err(ResourceError::Memory {
                limit: limits.max_value_bytes,
                used: self.value_bytes,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn command_count(&self) -> usize {
        self.commands
    }
}
