//! Row mapping between the relational layout and the state records

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::Row;
use std::collections::HashMap;
use weft_core::{
    ErrorInfo, Payload, StoreError, TaskState, TaskSummary, WorkflowState,
};

pub const WORKFLOW_COLUMNS: &str = "workflow_exec_id, workflow_id, status, input, output, error, \
     tasks, current_task_id, current_task_exec_id, created_at, updated_at";

pub const TASK_COLUMNS: &str = "task_exec_id, task_id, workflow_exec_id, workflow_id, component, \
     status, execution_type, parent_state_id, agent_id, tool_id, action_id, input, output, error, \
     created_at, updated_at";

/// Flat representation of a `workflow_states` row
#[derive(Debug, Clone)]
pub struct WorkflowRow {
    pub workflow_exec_id: String,
    pub workflow_id: String,
    pub status: String,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<Value>,
    pub tasks: Value,
    pub current_task_id: Option<String>,
    pub current_task_exec_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Flat representation of a `task_states` row
#[derive(Debug, Clone)]
pub struct TaskRow {
    pub task_exec_id: String,
    pub task_id: String,
    pub workflow_exec_id: String,
    pub workflow_id: String,
    pub component: String,
    pub status: String,
    pub execution_type: String,
    pub parent_state_id: Option<String>,
    pub agent_id: Option<String>,
    pub tool_id: Option<String>,
    pub action_id: Option<String>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, StoreError> {
    Ok(serde_json::to_value(value)?)
}

fn to_json_opt<T: Serialize>(value: &Option<T>) -> Result<Option<Value>, StoreError> {
    value.as_ref().map(to_json).transpose()
}

fn from_json<T: DeserializeOwned>(value: Value) -> Result<T, StoreError> {
    Ok(serde_json::from_value(value)?)
}

fn from_json_opt<T: DeserializeOwned>(value: Option<Value>) -> Result<Option<T>, StoreError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => from_json(v).map(Some),
    }
}

impl WorkflowRow {
    pub fn from_pg(row: &PgRow) -> Result<Self, StoreError> {
        Ok(Self {
            workflow_exec_id: row.try_get("workflow_exec_id").map_err(db_err)?,
            workflow_id: row.try_get("workflow_id").map_err(db_err)?,
            status: row.try_get("status").map_err(db_err)?,
            input: row.try_get("input").map_err(db_err)?,
            output: row.try_get("output").map_err(db_err)?,
            error: row.try_get("error").map_err(db_err)?,
            tasks: row.try_get("tasks").map_err(db_err)?,
            current_task_id: row.try_get("current_task_id").map_err(db_err)?,
            current_task_exec_id: row.try_get("current_task_exec_id").map_err(db_err)?,
            created_at: row.try_get("created_at").map_err(db_err)?,
            updated_at: row.try_get("updated_at").map_err(db_err)?,
        })
    }

    pub fn from_state(state: &WorkflowState) -> Result<Self, StoreError> {
        Ok(Self {
            workflow_exec_id: state.workflow_exec_id.clone(),
            workflow_id: state.workflow_id.clone(),
            status: state.status.to_string(),
            input: to_json(&state.input)?,
            output: to_json_opt(&state.output)?,
            error: to_json_opt(&state.error)?,
            tasks: to_json(&state.tasks)?,
            current_task_id: state.current_task_id.clone(),
            current_task_exec_id: state.current_task_exec_id.clone(),
            created_at: state.created_at,
            updated_at: state.updated_at,
        })
    }

    pub fn into_state(self) -> Result<WorkflowState, StoreError> {
        let tasks: HashMap<String, TaskSummary> = match self.tasks {
            Value::Null => HashMap::new(),
            v => from_json(v)?,
        };
        Ok(WorkflowState {
            workflow_id: self.workflow_id,
            workflow_exec_id: self.workflow_exec_id,
            status: self.status.parse()?,
            input: from_json::<Option<Payload>>(self.input)?.unwrap_or_default(),
            output: from_json_opt(self.output)?,
            error: from_json_opt::<ErrorInfo>(self.error)?,
            tasks,
            current_task_id: self.current_task_id,
            current_task_exec_id: self.current_task_exec_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl TaskRow {
    pub fn from_pg(row: &PgRow) -> Result<Self, StoreError> {
        Ok(Self {
            task_exec_id: row.try_get("task_exec_id").map_err(db_err)?,
            task_id: row.try_get("task_id").map_err(db_err)?,
            workflow_exec_id: row.try_get("workflow_exec_id").map_err(db_err)?,
            workflow_id: row.try_get("workflow_id").map_err(db_err)?,
            component: row.try_get("component").map_err(db_err)?,
            status: row.try_get("status").map_err(db_err)?,
            execution_type: row.try_get("execution_type").map_err(db_err)?,
            parent_state_id: row.try_get("parent_state_id").map_err(db_err)?,
            agent_id: row.try_get("agent_id").map_err(db_err)?,
            tool_id: row.try_get("tool_id").map_err(db_err)?,
            action_id: row.try_get("action_id").map_err(db_err)?,
            input: row.try_get("input").map_err(db_err)?,
            output: row.try_get("output").map_err(db_err)?,
            error: row.try_get("error").map_err(db_err)?,
            created_at: row.try_get("created_at").map_err(db_err)?,
            updated_at: row.try_get("updated_at").map_err(db_err)?,
        })
    }

    pub fn from_state(state: &TaskState) -> Result<Self, StoreError> {
        Ok(Self {
            task_exec_id: state.task_exec_id.clone(),
            task_id: state.task_id.clone(),
            workflow_exec_id: state.workflow_exec_id.clone(),
            workflow_id: state.workflow_id.clone(),
            component: state.component.to_string(),
            status: state.status.to_string(),
            execution_type: state.execution_type.to_string(),
            parent_state_id: state.parent_state_id.clone(),
            agent_id: state.agent_id.clone(),
            tool_id: state.tool_id.clone(),
            action_id: state.action_id.clone(),
            input: to_json_opt(&state.input)?,
            output: to_json_opt(&state.output)?,
            error: to_json_opt(&state.error)?,
            created_at: state.created_at,
            updated_at: state.updated_at,
        })
    }

    pub fn into_state(self) -> Result<TaskState, StoreError> {
        Ok(TaskState {
            task_exec_id: self.task_exec_id,
            task_id: self.task_id,
            workflow_id: self.workflow_id,
            workflow_exec_id: self.workflow_exec_id,
            parent_state_id: self.parent_state_id,
            component: self.component.parse()?,
            execution_type: self.execution_type.parse()?,
            status: self.status.parse()?,
            agent_id: self.agent_id,
            tool_id: self.tool_id,
            action_id: self.action_id,
            input: from_json_opt(self.input)?,
            output: from_json_opt(self.output)?,
            error: from_json_opt(self.error)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_core::{ComponentType, ErrorCode, ExecutionType, TaskStatus, WorkflowStatus};

    #[test]
    fn test_workflow_row_maps_nulls_and_summaries() {
        let mut input = Payload::new();
        input.insert("city".into(), json!("Lisbon"));
        let mut state = WorkflowState::new("weather", "exec-9", input);
        state.start("fetch").unwrap();
        let task = TaskState::new(
            "weather",
            "exec-9",
            "fetch",
            ExecutionType::Basic,
            ComponentType::Tool,
        );
        state.bind_current_task(&task);

        let row = WorkflowRow::from_state(&state).unwrap();
        assert_eq!(row.status, "running");
        assert!(row.output.is_none());
        assert!(row.error.is_none());
        assert_eq!(row.tasks["fetch"]["status"], "pending");

        let back = row.into_state().unwrap();
        assert_eq!(back.status, WorkflowStatus::Running);
        assert_eq!(back.input["city"], "Lisbon");
        assert_eq!(back.current_task_exec_id, Some(task.task_exec_id));
    }

    #[test]
    fn test_task_row_reads_error_column() {
        let now = Utc::now();
        let row = TaskRow {
            task_exec_id: "te-1".into(),
            task_id: "c2".into(),
            workflow_exec_id: "exec-1".into(),
            workflow_id: "wf".into(),
            component: "agent".into(),
            status: "failed".into(),
            execution_type: "basic".into(),
            parent_state_id: Some("te-0".into()),
            agent_id: Some("writer".into()),
            tool_id: None,
            action_id: Some("draft".into()),
            input: None,
            output: Some(Value::Null),
            error: Some(json!({"code": "ExecutionError", "message": "boom"})),
            created_at: now,
            updated_at: now,
        };

        let state = row.into_state().unwrap();
        assert_eq!(state.status, TaskStatus::Failed);
        assert!(state.output.is_none());
        assert_eq!(state.error.unwrap().code, ErrorCode::ExecutionError);
        assert_eq!(state.parent_state_id.as_deref(), Some("te-0"));
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let now = Utc::now();
        let row = WorkflowRow {
            workflow_exec_id: "e".into(),
            workflow_id: "w".into(),
            status: "exploded".into(),
            input: json!({}),
            output: None,
            error: None,
            tasks: Value::Null,
            current_task_id: None,
            current_task_exec_id: None,
            created_at: now,
            updated_at: now,
        };
        assert!(matches!(row.into_state(), Err(StoreError::Backend(_))));
    }
}
