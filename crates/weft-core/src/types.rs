//! Workflow and task execution state records.
//!
//! Both records enforce the same terminality rule: once a status is one of
//! Success, Failed, Canceled or TimedOut it never changes again. Output and
//! error are mutually exclusive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{ErrorInfo, StoreError};

/// JSON object used for inputs and outputs
pub type Payload = Map<String, Value>;

/// Generate a fresh execution identifier
pub fn new_exec_id() -> String {
    Uuid::new_v4().to_string()
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(StoreError::Backend(format!(
                        "unknown {} value: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

/// Status of a workflow execution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Success,
    Failed,
    Canceled,
    TimedOut,
}

string_enum!(WorkflowStatus {
    Pending => "pending",
    Running => "running",
    Paused => "paused",
    Success => "success",
    Failed => "failed",
    Canceled => "canceled",
    TimedOut => "timed_out",
});

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Success
                | WorkflowStatus::Failed
                | WorkflowStatus::Canceled
                | WorkflowStatus::TimedOut
        )
    }

    fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Pending) => false,
            (Pending, Running) | (Pending, Paused) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Running, Running) | (Paused, Paused) => true,
            (_, next) => next.is_terminal(),
        }
    }
}

/// Status of a single task execution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
    TimedOut,
}

string_enum!(TaskStatus {
    Pending => "pending",
    Running => "running",
    Success => "success",
    Failed => "failed",
    Canceled => "canceled",
    TimedOut => "timed_out",
});

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Canceled | TaskStatus::TimedOut
        )
    }
}

/// Execution strategy a task state was produced by
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    Basic,
    Parallel,
    Collection,
    Aggregate,
    Signal,
    Wait,
    Router,
    Composite,
}

string_enum!(ExecutionType {
    Basic => "basic",
    Parallel => "parallel",
    Collection => "collection",
    Aggregate => "aggregate",
    Signal => "signal",
    Wait => "wait",
    Router => "router",
    Composite => "composite",
});

impl ExecutionType {
    /// Whether this execution type owns child task states
    pub fn has_children(&self) -> bool {
        matches!(
            self,
            ExecutionType::Parallel | ExecutionType::Collection | ExecutionType::Composite
        )
    }
}

/// Capability that produced a task state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    Agent,
    Tool,
    Router,
    Signal,
    Wait,
    Aggregate,
    Parallel,
    Collection,
    Composite,
}

string_enum!(ComponentType {
    Agent => "agent",
    Tool => "tool",
    Router => "router",
    Signal => "signal",
    Wait => "wait",
    Aggregate => "aggregate",
    Parallel => "parallel",
    Collection => "collection",
    Composite => "composite",
});

/// Summary of a task execution kept on the owning workflow state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSummary {
    pub task_exec_id: String,
    pub status: TaskStatus,
    pub execution_type: ExecutionType,
    pub updated_at: DateTime<Utc>,
}

/// Durable record of one task execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskState {
    pub task_exec_id: String,
    pub task_id: String,
    pub workflow_id: String,
    pub workflow_exec_id: String,
    /// Owning parallel/collection/composite parent
    #[serde(default)]
    pub parent_state_id: Option<String>,
    pub component: ComponentType,
    pub execution_type: ExecutionType,
    pub status: TaskStatus,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub tool_id: Option<String>,
    #[serde(default)]
    pub action_id: Option<String>,
    #[serde(default)]
    pub input: Option<Payload>,
    #[serde(default)]
    pub output: Option<Payload>,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskState {
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_exec_id: impl Into<String>,
        task_id: impl Into<String>,
        execution_type: ExecutionType,
        component: ComponentType,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_exec_id: new_exec_id(),
            task_id: task_id.into(),
            workflow_id: workflow_id.into(),
            workflow_exec_id: workflow_exec_id.into(),
            parent_state_id: None,
            component,
            execution_type,
            status: TaskStatus::Pending,
            agent_id: None,
            tool_id: None,
            action_id: None,
            input: None,
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_parent(mut self, parent_state_id: impl Into<String>) -> Self {
        self.parent_state_id = Some(parent_state_id.into());
        self
    }

    pub fn with_input(mut self, input: Payload) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>, action_id: Option<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self.action_id = action_id;
        self
    }

    pub fn with_tool(mut self, tool_id: impl Into<String>, action_id: Option<String>) -> Self {
        self.tool_id = Some(tool_id.into());
        self.action_id = action_id;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn set_status(&mut self, next: TaskStatus) -> Result<(), StoreError> {
        if self.status.is_terminal() {
            return Err(StoreError::TerminalState {
                id: self.task_exec_id.clone(),
                status: self.status.to_string(),
                attempted: next.to_string(),
            });
        }
        if next == TaskStatus::Pending && self.status != TaskStatus::Pending {
            return Err(StoreError::InvalidTransition {
                id: self.task_exec_id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_running(&mut self) -> Result<(), StoreError> {
        self.set_status(TaskStatus::Running)
    }

    pub fn succeed(&mut self, output: Payload) -> Result<(), StoreError> {
        self.set_status(TaskStatus::Success)?;
        self.output = Some(output);
        self.error = None;
        Ok(())
    }

    pub fn fail(&mut self, error: ErrorInfo) -> Result<(), StoreError> {
        self.set_status(TaskStatus::Failed)?;
        self.error = Some(error);
        self.output = None;
        Ok(())
    }

    pub fn time_out(&mut self, error: ErrorInfo) -> Result<(), StoreError> {
        self.set_status(TaskStatus::TimedOut)?;
        self.error = Some(error);
        self.output = None;
        Ok(())
    }

    /// Cancellation is not a failure: no error is recorded.
    pub fn cancel(&mut self) -> Result<(), StoreError> {
        self.set_status(TaskStatus::Canceled)?;
        self.error = None;
        self.output = None;
        Ok(())
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            task_exec_id: self.task_exec_id.clone(),
            status: self.status,
            execution_type: self.execution_type,
            updated_at: self.updated_at,
        }
    }
}

/// Durable record of one workflow execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowState {
    /// Workflow definition name
    pub workflow_id: String,
    /// Unique per run
    pub workflow_exec_id: String,
    pub status: WorkflowStatus,
    /// Immutable trigger payload
    pub input: Payload,
    #[serde(default)]
    pub output: Option<Payload>,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    /// Top-level task summaries keyed by task ID
    #[serde(default)]
    pub tasks: HashMap<String, TaskSummary>,
    /// Next node the dispatch loop will run (continuation key)
    #[serde(default)]
    pub current_task_id: Option<String>,
    /// Task state already created for `current_task_id`, if any
    #[serde(default)]
    pub current_task_exec_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_exec_id: impl Into<String>,
        input: Payload,
    ) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow_id.into(),
            workflow_exec_id: workflow_exec_id.into(),
            status: WorkflowStatus::Pending,
            input,
            output: None,
            error: None,
            tasks: HashMap::new(),
            current_task_id: None,
            current_task_exec_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn set_status(&mut self, next: WorkflowStatus) -> Result<(), StoreError> {
        if self.status.is_terminal() {
            return Err(StoreError::TerminalState {
                id: self.workflow_exec_id.clone(),
                status: self.status.to_string(),
                attempted: next.to_string(),
            });
        }
        if !self.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                id: self.workflow_exec_id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn start(&mut self, initial_task_id: impl Into<String>) -> Result<(), StoreError> {
        self.set_status(WorkflowStatus::Running)?;
        self.current_task_id = Some(initial_task_id.into());
        self.current_task_exec_id = None;
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), StoreError> {
        self.set_status(WorkflowStatus::Paused)
    }

    pub fn resume(&mut self) -> Result<(), StoreError> {
        self.set_status(WorkflowStatus::Running)
    }

    pub fn succeed(&mut self, output: Payload) -> Result<(), StoreError> {
        self.set_status(WorkflowStatus::Success)?;
        self.output = Some(output);
        self.error = None;
        self.clear_continuation();
        Ok(())
    }

    pub fn fail(&mut self, error: ErrorInfo) -> Result<(), StoreError> {
        self.set_status(WorkflowStatus::Failed)?;
        self.error = Some(error);
        self.output = None;
        self.clear_continuation();
        Ok(())
    }

    pub fn time_out(&mut self, error: ErrorInfo) -> Result<(), StoreError> {
        self.set_status(WorkflowStatus::TimedOut)?;
        self.error = Some(error);
        self.output = None;
        self.clear_continuation();
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), StoreError> {
        self.set_status(WorkflowStatus::Canceled)?;
        self.error = None;
        self.output = None;
        self.clear_continuation();
        Ok(())
    }

    /// Record the task created for the current node before it runs
    pub fn bind_current_task(&mut self, task: &TaskState) {
        self.current_task_exec_id = Some(task.task_exec_id.clone());
        self.record_task(task);
    }

    /// Record the latest summary of a top-level task
    pub fn record_task(&mut self, task: &TaskState) {
        self.tasks.insert(task.task_id.clone(), task.summary());
        self.updated_at = Utc::now();
    }

    /// Move the continuation to the next node
    pub fn advance_to(&mut self, next_task_id: impl Into<String>) {
        self.current_task_id = Some(next_task_id.into());
        self.current_task_exec_id = None;
        self.updated_at = Utc::now();
    }

    fn clear_continuation(&mut self) {
        self.current_task_id = None;
        self.current_task_exec_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> TaskState {
        TaskState::new("wf", "exec-1", "t1", ExecutionType::Basic, ComponentType::Agent)
    }

    #[test]
    fn test_task_terminality() {
        let mut state = task();
        state.mark_running().unwrap();
        state.succeed(Payload::new()).unwrap();

        assert!(state.fail(ErrorInfo::execution("late")).is_err());
        assert!(state.cancel().is_err());
        assert!(state.mark_running().is_err());
        assert_eq!(state.status, TaskStatus::Success);
        assert!(state.error.is_none());
    }

    #[test]
    fn test_task_output_error_exclusive() {
        let mut state = task();
        state.mark_running().unwrap();
        state.fail(ErrorInfo::execution("boom")).unwrap();
        assert!(state.output.is_none());
        assert_eq!(state.error.as_ref().unwrap().message, "boom");
    }

    #[test]
    fn test_cancel_carries_no_error() {
        let mut state = task();
        state.mark_running().unwrap();
        state.cancel().unwrap();
        assert_eq!(state.status, TaskStatus::Canceled);
        assert!(state.error.is_none());
    }

    #[test]
    fn test_workflow_lifecycle() {
        let mut wf = WorkflowState::new("wf", "exec-1", Payload::new());
        assert_eq!(wf.status, WorkflowStatus::Pending);

        wf.start("t1").unwrap();
        assert_eq!(wf.status, WorkflowStatus::Running);
        assert_eq!(wf.current_task_id.as_deref(), Some("t1"));

        wf.pause().unwrap();
        wf.resume().unwrap();

        let mut output = Payload::new();
        output.insert("ok".into(), Value::Bool(true));
        wf.succeed(output).unwrap();
        assert!(wf.current_task_id.is_none());
        assert!(wf.error.is_none());

        assert!(wf.cancel().is_err());
        assert!(wf.resume().is_err());
        assert_eq!(wf.status, WorkflowStatus::Success);
    }

    #[test]
    fn test_workflow_cannot_return_to_pending() {
        let mut wf = WorkflowState::new("wf", "exec-1", Payload::new());
        wf.start("t1").unwrap();
        assert!(matches!(
            wf.set_status(WorkflowStatus::Pending),
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Success,
            TaskStatus::Failed,
            TaskStatus::Canceled,
            TaskStatus::TimedOut,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert_eq!(
            serde_json::to_value(WorkflowStatus::TimedOut).unwrap(),
            serde_json::json!("timed_out")
        );
        assert!("bogus".parse::<ExecutionType>().is_err());
    }

    #[test]
    fn test_record_task_summary() {
        let mut wf = WorkflowState::new("wf", "exec-1", Payload::new());
        let t = task();
        wf.bind_current_task(&t);
        assert_eq!(wf.current_task_exec_id.as_deref(), Some(t.task_exec_id.as_str()));
        assert_eq!(wf.tasks["t1"].status, TaskStatus::Pending);

        wf.advance_to("t2");
        assert!(wf.current_task_exec_id.is_none());
        assert_eq!(wf.current_task_id.as_deref(), Some("t2"));
    }
}
