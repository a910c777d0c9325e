//! Shared engine runtime and per-execution context

use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use weft_core::{EngineConfig, Payload, StateStore, StoreResult};

use crate::definition::WorkflowConfig;
use crate::executor::Executor;
use crate::signals::{ControlSignal, SignalBus};

/// Collaborators shared by every execution
pub struct Runtime {
    pub store: Arc<dyn StateStore>,
    pub signals: Arc<SignalBus>,
    pub executor: Arc<dyn Executor>,
    pub config: EngineConfig,
}

/// Outcome of checking the control state before dispatching new work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Proceed,
    Cancel,
}

/// Everything a dispatch step needs to know about its execution
#[derive(Clone)]
pub struct ExecutionContext {
    pub workflow: Arc<WorkflowConfig>,
    pub workflow_exec_id: String,
    pub input: Payload,
    pub token: CancellationToken,
}

impl ExecutionContext {
    pub fn new(
        workflow: Arc<WorkflowConfig>,
        workflow_exec_id: impl Into<String>,
        input: Payload,
        token: CancellationToken,
    ) -> Self {
        Self {
            workflow,
            workflow_exec_id: workflow_exec_id.into(),
            input,
            token,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow.id
    }

    /// Same execution, different cancellation scope
    pub fn with_token(&self, token: CancellationToken) -> Self {
        Self {
            token,
            ..self.clone()
        }
    }

    /// Template scope: workflow info, latest top-level task results, extras
    pub async fn scope(&self, store: &dyn StateStore, extras: &Payload) -> StoreResult<Value> {
        let mut tasks = Map::new();
        for task in store.list_tasks(&self.workflow_exec_id).await? {
            if task.parent_state_id.is_some() {
                continue;
            }
            tasks.insert(
                task.task_id.clone(),
                json!({
                    "status": task.status,
                    "output": task.output,
                    "error": task.error,
                }),
            );
        }

        let mut scope = Map::new();
        scope.insert(
            "workflow".into(),
            json!({
                "id": self.workflow.id,
                "exec_id": self.workflow_exec_id,
                "input": self.input,
            }),
        );
        scope.insert("input".into(), Value::Object(self.input.clone()));
        scope.insert("tasks".into(), Value::Object(tasks));
        for (key, value) in extras {
            scope.insert(key.clone(), value.clone());
        }
        Ok(Value::Object(scope))
    }

    /// Wait out a pause; report whether dispatch may continue
    pub async fn gate(&self, signals: &SignalBus) -> Gate {
        if self.token.is_cancelled() {
            return Gate::Cancel;
        }
        let mut rx = signals.control(&self.workflow_exec_id);
        loop {
            let current = *rx.borrow_and_update();
            match current {
                ControlSignal::Run => return Gate::Proceed,
                ControlSignal::Cancel => return Gate::Cancel,
                ControlSignal::Pause => {}
            }
            tokio::select! {
                _ = self.token.cancelled() => return Gate::Cancel,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Gate::Proceed;
                    }
                }
            }
        }
    }
}
