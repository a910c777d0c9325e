//! State store contract and the in-memory backend.
//!
//! Every `update_*` call is an atomic read-modify-write: the mutation runs
//! against the current record while the backend holds it exclusively, and
//! the result is committed only if the mutation succeeds and does not move
//! a terminal record to another status.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::types::{TaskState, WorkflowState, WorkflowStatus};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Mutation applied to a task state inside an atomic update.
///
/// Mutations may run more than once when a backend retries a failed
/// commit, so they must not consume what they capture.
pub type TaskMutation = Arc<dyn Fn(&mut TaskState) -> StoreResult<()> + Send + Sync>;

/// Mutation applied to a workflow state inside an atomic update
pub type WorkflowMutation = Arc<dyn Fn(&mut WorkflowState) -> StoreResult<()> + Send + Sync>;

/// Wrap a closure as a task mutation
pub fn task_mutation<F>(f: F) -> TaskMutation
where
    F: Fn(&mut TaskState) -> StoreResult<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap a closure as a workflow mutation
pub fn workflow_mutation<F>(f: F) -> WorkflowMutation
where
    F: Fn(&mut WorkflowState) -> StoreResult<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Filter for listing workflow executions
#[derive(Debug, Clone, Default)]
pub struct WorkflowFilter {
    pub workflow_id: Option<String>,
    pub statuses: Vec<WorkflowStatus>,
}

impl WorkflowFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_status(mut self, status: WorkflowStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn matches(&self, state: &WorkflowState) -> bool {
        if let Some(ref id) = self.workflow_id {
            if &state.workflow_id != id {
                return false;
            }
        }
        self.statuses.is_empty() || self.statuses.contains(&state.status)
    }
}

/// Durable persistence of workflow and task execution states
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn create_workflow(&self, state: &WorkflowState) -> StoreResult<()>;
    async fn get_workflow(&self, workflow_exec_id: &str) -> StoreResult<WorkflowState>;
    async fn update_workflow(
        &self,
        workflow_exec_id: &str,
        mutation: WorkflowMutation,
    ) -> StoreResult<WorkflowState>;
    async fn list_workflows(&self, filter: &WorkflowFilter) -> StoreResult<Vec<WorkflowState>>;
    /// Removes the execution and every task state it owns
    async fn delete_workflow(&self, workflow_exec_id: &str) -> StoreResult<()>;

    async fn create_task(&self, state: &TaskState) -> StoreResult<()>;
    async fn get_task(&self, task_exec_id: &str) -> StoreResult<TaskState>;
    async fn update_task(&self, task_exec_id: &str, mutation: TaskMutation)
        -> StoreResult<TaskState>;
    /// Latest task state for `task_id` under the given parent (or at top level)
    async fn find_task(
        &self,
        workflow_exec_id: &str,
        task_id: &str,
        parent_state_id: Option<&str>,
    ) -> StoreResult<Option<TaskState>>;
    /// All task states of an execution in creation order
    async fn list_tasks(&self, workflow_exec_id: &str) -> StoreResult<Vec<TaskState>>;
    /// Children of a parent task in creation order
    async fn list_children(&self, parent_state_id: &str) -> StoreResult<Vec<TaskState>>;
}

/// Apply a workflow mutation and enforce terminality on the result
pub fn apply_workflow_mutation(
    current: &WorkflowState,
    mutation: &WorkflowMutation,
) -> StoreResult<WorkflowState> {
    let mut next = current.clone();
    mutation(&mut next)?;
    if current.status.is_terminal() && next.status != current.status {
        return Err(StoreError::TerminalState {
            id: current.workflow_exec_id.clone(),
            status: current.status.to_string(),
            attempted: next.status.to_string(),
        });
    }
    next.workflow_exec_id = current.workflow_exec_id.clone();
    Ok(next)
}

/// Apply a task mutation and enforce terminality on the result
pub fn apply_task_mutation(current: &TaskState, mutation: &TaskMutation) -> StoreResult<TaskState> {
    let mut next = current.clone();
    mutation(&mut next)?;
    if current.status.is_terminal() && next.status != current.status {
        return Err(StoreError::TerminalState {
            id: current.task_exec_id.clone(),
            status: current.status.to_string(),
            attempted: next.status.to_string(),
        });
    }
    next.task_exec_id = current.task_exec_id.clone();
    next.parent_state_id = current.parent_state_id.clone();
    Ok(next)
}

#[derive(Default)]
struct Tables {
    workflows: HashMap<String, WorkflowState>,
    tasks: HashMap<String, TaskState>,
    by_workflow: HashMap<String, Vec<String>>,
    by_parent: HashMap<String, Vec<String>>,
}

impl Tables {
    fn collect(&self, ids: Option<&Vec<String>>) -> Vec<TaskState> {
        ids.map(|ids| {
            ids.iter()
                .filter_map(|id| self.tasks.get(id).cloned())
                .collect()
        })
        .unwrap_or_default()
    }
}

/// In-memory state store; a single lock makes every update atomic
pub struct InMemoryStateStore {
    tables: RwLock<Tables>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn create_workflow(&self, state: &WorkflowState) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables.workflows.contains_key(&state.workflow_exec_id) {
            return Err(StoreError::AlreadyExists(state.workflow_exec_id.clone()));
        }
        tables
            .workflows
            .insert(state.workflow_exec_id.clone(), state.clone());
        Ok(())
    }

    async fn get_workflow(&self, workflow_exec_id: &str) -> StoreResult<WorkflowState> {
        let tables = self.tables.read().await;
        tables
            .workflows
            .get(workflow_exec_id)
            .cloned()
            .ok_or_else(|| StoreError::workflow_not_found(workflow_exec_id))
    }

    async fn update_workflow(
        &self,
        workflow_exec_id: &str,
        mutation: WorkflowMutation,
    ) -> StoreResult<WorkflowState> {
        let mut tables = self.tables.write().await;
        let current = tables
            .workflows
            .get(workflow_exec_id)
            .ok_or_else(|| StoreError::workflow_not_found(workflow_exec_id))?;
        let next = apply_workflow_mutation(current, &mutation)?;
        tables
            .workflows
            .insert(workflow_exec_id.to_string(), next.clone());
        Ok(next)
    }

    async fn list_workflows(&self, filter: &WorkflowFilter) -> StoreResult<Vec<WorkflowState>> {
        let tables = self.tables.read().await;
        let mut states: Vec<_> = tables
            .workflows
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        states.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(states)
    }

    async fn delete_workflow(&self, workflow_exec_id: &str) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables.workflows.remove(workflow_exec_id).is_none() {
            return Err(StoreError::workflow_not_found(workflow_exec_id));
        }
        let owned = tables.by_workflow.remove(workflow_exec_id).unwrap_or_default();
        for id in owned {
            tables.tasks.remove(&id);
            tables.by_parent.remove(&id);
        }
        Ok(())
    }

    async fn create_task(&self, state: &TaskState) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.workflows.contains_key(&state.workflow_exec_id) {
            return Err(StoreError::workflow_not_found(&state.workflow_exec_id));
        }
        if tables.tasks.contains_key(&state.task_exec_id) {
            return Err(StoreError::AlreadyExists(state.task_exec_id.clone()));
        }
        if let Some(ref parent_id) = state.parent_state_id {
            let same_execution = tables
                .tasks
                .get(parent_id)
                .map(|p| p.workflow_exec_id == state.workflow_exec_id)
                .unwrap_or(false);
            if !same_execution {
                return Err(StoreError::OrphanedChild {
                    task_exec_id: state.task_exec_id.clone(),
                    parent_state_id: parent_id.clone(),
                });
            }
            tables
                .by_parent
                .entry(parent_id.clone())
                .or_default()
                .push(state.task_exec_id.clone());
        }
        tables
            .by_workflow
            .entry(state.workflow_exec_id.clone())
            .or_default()
            .push(state.task_exec_id.clone());
        tables
            .tasks
            .insert(state.task_exec_id.clone(), state.clone());
        Ok(())
    }

    async fn get_task(&self, task_exec_id: &str) -> StoreResult<TaskState> {
        let tables = self.tables.read().await;
        tables
            .tasks
            .get(task_exec_id)
            .cloned()
            .ok_or_else(|| StoreError::task_not_found(task_exec_id))
    }

    async fn update_task(
        &self,
        task_exec_id: &str,
        mutation: TaskMutation,
    ) -> StoreResult<TaskState> {
        let mut tables = self.tables.write().await;
        let current = tables
            .tasks
            .get(task_exec_id)
            .ok_or_else(|| StoreError::task_not_found(task_exec_id))?;
        let next = apply_task_mutation(current, &mutation)?;
        tables.tasks.insert(task_exec_id.to_string(), next.clone());
        Ok(next)
    }

    async fn find_task(
        &self,
        workflow_exec_id: &str,
        task_id: &str,
        parent_state_id: Option<&str>,
    ) -> StoreResult<Option<TaskState>> {
        let tables = self.tables.read().await;
        let found = tables
            .collect(tables.by_workflow.get(workflow_exec_id))
            .into_iter()
            .filter(|t| t.task_id == task_id && t.parent_state_id.as_deref() == parent_state_id)
            .last();
        Ok(found)
    }

    async fn list_tasks(&self, workflow_exec_id: &str) -> StoreResult<Vec<TaskState>> {
        let tables = self.tables.read().await;
        Ok(tables.collect(tables.by_workflow.get(workflow_exec_id)))
    }

    async fn list_children(&self, parent_state_id: &str) -> StoreResult<Vec<TaskState>> {
        let tables = self.tables.read().await;
        Ok(tables.collect(tables.by_parent.get(parent_state_id)))
    }
}
