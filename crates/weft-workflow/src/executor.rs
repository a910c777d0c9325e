//! Boundary to the agent/tool subsystem

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use weft_core::{ErrorInfo, Payload};

use crate::definition::ComponentRef;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecutorError {
    #[error("Execution failed: {0}")]
    Failed(String),

    #[error("Execution canceled")]
    Canceled,

    #[error("Executor unavailable: {0}")]
    Unavailable(String),
}

impl From<ExecutorError> for ErrorInfo {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::Canceled => ErrorInfo::new(weft_core::ErrorCode::CanceledError, err.to_string()),
            other => ErrorInfo::execution(other.to_string()),
        }
    }
}

/// One invocation of an agent or tool
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub workflow_id: String,
    pub workflow_exec_id: String,
    pub task_id: String,
    pub task_exec_id: String,
    pub target: ComponentRef,
    pub action: Option<String>,
    pub input: Payload,
}

/// Invokes the configured agent or tool for a basic task.
///
/// Implementations must watch `token` and abandon the call when it fires.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        request: ExecutionRequest,
        token: CancellationToken,
    ) -> Result<Payload, ExecutorError>;
}
