//! Error taxonomy shared by every layer of the engine.
//!
//! `ErrorInfo` is the structured error persisted on workflow and task
//! states. `StoreError` is what state store backends return.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable error codes surfaced on failed workflow and task states
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Configuration is malformed
    ValidationError,
    /// The executor call for a task failed
    ExecutionError,
    /// A deadline passed before the task completed
    TimeoutExceeded,
    /// An aggregate task referenced a sibling that did not succeed
    MissingDependencyOutput,
    /// Persistence or signal transport failed after retries
    InfrastructureError,
    /// Execution stopped by an explicit cancel signal
    CanceledError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "ValidationError",
            ErrorCode::ExecutionError => "ExecutionError",
            ErrorCode::TimeoutExceeded => "TimeoutExceeded",
            ErrorCode::MissingDependencyOutput => "MissingDependencyOutput",
            ErrorCode::InfrastructureError => "InfrastructureError",
            ErrorCode::CanceledError => "CanceledError",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error attached to a failed state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorInfo {
    /// Stable machine-readable code
    pub code: ErrorCode,
    /// Human-readable message
    pub message: String,
    /// Optional structured details (e.g. the failing child task)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ExecutionError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TimeoutExceeded, message)
    }

    pub fn missing_dependency(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::MissingDependencyOutput, message)
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InfrastructureError, message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorInfo {}

/// Errors returned by state store backends and state transitions
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    #[error("State {id} is terminal ({status}); refusing transition to {attempted}")]
    TerminalState {
        id: String,
        status: String,
        attempted: String,
    },

    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("Parent {parent_state_id} of task {task_exec_id} does not exist in the same execution")]
    OrphanedChild {
        task_exec_id: String,
        parent_state_id: String,
    },

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn workflow_not_found(id: impl Into<String>) -> Self {
        StoreError::NotFound {
            kind: "workflow execution",
            id: id.into(),
        }
    }

    pub fn task_not_found(id: impl Into<String>) -> Self {
        StoreError::NotFound {
            kind: "task execution",
            id: id.into(),
        }
    }

    /// Transport-level failures are worth retrying; logical ones are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Backend(_))
    }
}
