//! Error types for the wealth agent

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Core Loop Errors
    // =============================

    #[error("Planning error: {0}")]
    PlanningError(String),

    #[error("Reflection error: {0}")]
    ReflectionError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Tool error: {0}")]
    ToolError(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid tool input: {0}")]
    InvalidToolInput(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Knowledge lookup error: {0}")]
    KnowledgeError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("SQL error: {0}")]
    SqlError(#[from] sqlx::Error),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl OrchestrationError {
    /// Stable code used in user-visible error objects
    pub fn code(&self) -> &'static str {
        match self {
            OrchestrationError::PlanningError(_) => "PLANNING_ERROR",
            OrchestrationError::ReflectionError(_) => "REFLECTION_ERROR",
            OrchestrationError::ToolNotFound(_) => "TOOL_NOT_FOUND",
            OrchestrationError::ToolError(_)
            | OrchestrationError::InvalidToolInput(_)
            | OrchestrationError::LlmError(_)
            | OrchestrationError::DatabaseError(_)
            | OrchestrationError::KnowledgeError(_)
            | OrchestrationError::HttpError(_)
            | OrchestrationError::SqlError(_) => "TOOL_EXECUTION_ERROR",
            OrchestrationError::StorageError(_) | OrchestrationError::IoError(_) => "STORAGE_ERROR",
            #[cfg(feature = "redis")]
            OrchestrationError::RedisError(_) => "STORAGE_ERROR",
            OrchestrationError::ExecutionError(_) => "EXECUTION_ERROR",
            OrchestrationError::ConfigError(_) => "CONFIG_ERROR",
            OrchestrationError::SerializationError(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Whether the error comes from the durable cache
    pub fn is_storage(&self) -> bool {
        self.code() == "STORAGE_ERROR"
    }
}

//
// ================= Task-level taxonomy =================
//

/// Failures recovered locally into a `TaskResult`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskErrorKind {
    DependencyUnmet,
    ToolNotFound,
    ToolExecutionError,
}

impl TaskErrorKind {
    /// Numeric code carried in error results.
    ///
    /// An unmet dependency is reported under the generic execution code (6001)
    /// since the task itself never ran.
    pub fn code(&self) -> u32 {
        match self {
            TaskErrorKind::DependencyUnmet => 6001,
            TaskErrorKind::ToolNotFound => 2000,
            TaskErrorKind::ToolExecutionError => 2001,
        }
    }

    /// Symbolic name of `code()`
    pub fn code_name(&self) -> &'static str {
        match self {
            TaskErrorKind::DependencyUnmet => "EXECUTION_ERROR",
            TaskErrorKind::ToolNotFound => "TOOL_NOT_FOUND",
            TaskErrorKind::ToolExecutionError => "TOOL_EXECUTION_ERROR",
        }
    }
}

impl fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskErrorKind::DependencyUnmet => "DEPENDENCY_UNMET",
            TaskErrorKind::ToolNotFound => "TOOL_NOT_FOUND",
            TaskErrorKind::ToolExecutionError => "TOOL_EXECUTION_ERROR",
        };
        write!(f, "{}", s)
    }
}
