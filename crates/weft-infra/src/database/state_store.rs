//! PostgreSQL-backed `StateStore`
//!
//! Updates lock the target row with `SELECT ... FOR UPDATE` inside a
//! transaction, apply the mutation, and write the result back before
//! committing.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;
use weft_core::{
    apply_task_mutation, apply_workflow_mutation, StateStore, StoreError, StoreResult,
    TaskMutation, TaskState, WorkflowFilter, WorkflowMutation, WorkflowState,
};

use super::rows::{db_err, TaskRow, WorkflowRow, TASK_COLUMNS, WORKFLOW_COLUMNS};

const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Clone)]
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn write_workflow(
        tx: &mut Transaction<'_, Postgres>,
        state: &WorkflowState,
    ) -> StoreResult<()> {
        let row = WorkflowRow::from_state(state)?;
        sqlx::query(
            r#"
            UPDATE workflow_states
            SET status = $2, output = $3, error = $4, tasks = $5,
                current_task_id = $6, current_task_exec_id = $7, updated_at = $8
            WHERE workflow_exec_id = $1
            "#,
        )
        .bind(&row.workflow_exec_id)
        .bind(&row.status)
        .bind(&row.output)
        .bind(&row.error)
        .bind(&row.tasks)
        .bind(&row.current_task_id)
        .bind(&row.current_task_exec_id)
        .bind(row.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn write_task(tx: &mut Transaction<'_, Postgres>, state: &TaskState) -> StoreResult<()> {
        let row = TaskRow::from_state(state)?;
        sqlx::query(
            r#"
            UPDATE task_states
            SET status = $2, component = $3, agent_id = $4, tool_id = $5, action_id = $6,
                input = $7, output = $8, error = $9, updated_at = $10
            WHERE task_exec_id = $1
            "#,
        )
        .bind(&row.task_exec_id)
        .bind(&row.status)
        .bind(&row.component)
        .bind(&row.agent_id)
        .bind(&row.tool_id)
        .bind(&row.action_id)
        .bind(&row.input)
        .bind(&row.output)
        .bind(&row.error)
        .bind(row.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    fn map_tasks(rows: Vec<sqlx::postgres::PgRow>) -> StoreResult<Vec<TaskState>> {
        rows.iter()
            .map(|row| TaskRow::from_pg(row)?.into_state())
            .collect()
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|d| d.code())
        .map(|code| code == UNIQUE_VIOLATION)
        .unwrap_or(false)
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn create_workflow(&self, state: &WorkflowState) -> StoreResult<()> {
        let row = WorkflowRow::from_state(state)?;
        let result = sqlx::query(&format!(
            "INSERT INTO workflow_states ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            WORKFLOW_COLUMNS
        ))
        .bind(&row.workflow_exec_id)
        .bind(&row.workflow_id)
        .bind(&row.status)
        .bind(&row.input)
        .bind(&row.output)
        .bind(&row.error)
        .bind(&row.tasks)
        .bind(&row.current_task_id)
        .bind(&row.current_task_exec_id)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(StoreError::AlreadyExists(state.workflow_exec_id.clone()))
            }
            Err(e) => Err(db_err(e)),
        }
    }

    async fn get_workflow(&self, workflow_exec_id: &str) -> StoreResult<WorkflowState> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM workflow_states WHERE workflow_exec_id = $1",
            WORKFLOW_COLUMNS
        ))
        .bind(workflow_exec_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::workflow_not_found(workflow_exec_id))?;

        WorkflowRow::from_pg(&row)?.into_state()
    }

    async fn update_workflow(
        &self,
        workflow_exec_id: &str,
        mutation: WorkflowMutation,
    ) -> StoreResult<WorkflowState> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query(&format!(
            "SELECT {} FROM workflow_states WHERE workflow_exec_id = $1 FOR UPDATE",
            WORKFLOW_COLUMNS
        ))
        .bind(workflow_exec_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::workflow_not_found(workflow_exec_id))?;

        let current = WorkflowRow::from_pg(&row)?.into_state()?;
        let next = apply_workflow_mutation(&current, &mutation)?;
        Self::write_workflow(&mut tx, &next).await?;
        tx.commit().await.map_err(db_err)?;

        debug!(execution_id = %workflow_exec_id, status = %next.status, "Workflow state updated");
        Ok(next)
    }

    async fn list_workflows(&self, filter: &WorkflowFilter) -> StoreResult<Vec<WorkflowState>> {
        let statuses: Vec<String> = filter.statuses.iter().map(|s| s.to_string()).collect();
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM workflow_states
            WHERE ($1::text IS NULL OR workflow_id = $1)
              AND (cardinality($2::text[]) = 0 OR status = ANY($2))
            ORDER BY created_at
            "#,
            WORKFLOW_COLUMNS
        ))
        .bind(&filter.workflow_id)
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| WorkflowRow::from_pg(row)?.into_state())
            .collect()
    }

    async fn delete_workflow(&self, workflow_exec_id: &str) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM workflow_states WHERE workflow_exec_id = $1")
            .bind(workflow_exec_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::workflow_not_found(workflow_exec_id));
        }
        Ok(())
    }

    async fn create_task(&self, state: &TaskState) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        if let Some(ref parent_id) = state.parent_state_id {
            let parent_exec: Option<String> = sqlx::query_scalar(
                "SELECT workflow_exec_id FROM task_states WHERE task_exec_id = $1",
            )
            .bind(parent_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
            if parent_exec.as_deref() != Some(state.workflow_exec_id.as_str()) {
                return Err(StoreError::OrphanedChild {
                    task_exec_id: state.task_exec_id.clone(),
                    parent_state_id: parent_id.clone(),
                });
            }
        }

        let row = TaskRow::from_state(state)?;
        let result = sqlx::query(&format!(
            "INSERT INTO task_states ({}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
            TASK_COLUMNS
        ))
        .bind(&row.task_exec_id)
        .bind(&row.task_id)
        .bind(&row.workflow_exec_id)
        .bind(&row.workflow_id)
        .bind(&row.component)
        .bind(&row.status)
        .bind(&row.execution_type)
        .bind(&row.parent_state_id)
        .bind(&row.agent_id)
        .bind(&row.tool_id)
        .bind(&row.action_id)
        .bind(&row.input)
        .bind(&row.output)
        .bind(&row.error)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&mut *tx)
        .await;

        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(StoreError::AlreadyExists(state.task_exec_id.clone()))
            }
            Err(e) => return Err(db_err(e)),
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn get_task(&self, task_exec_id: &str) -> StoreResult<TaskState> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM task_states WHERE task_exec_id = $1",
            TASK_COLUMNS
        ))
        .bind(task_exec_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::task_not_found(task_exec_id))?;

        TaskRow::from_pg(&row)?.into_state()
    }

    async fn update_task(
        &self,
        task_exec_id: &str,
        mutation: TaskMutation,
    ) -> StoreResult<TaskState> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query(&format!(
            "SELECT {} FROM task_states WHERE task_exec_id = $1 FOR UPDATE",
            TASK_COLUMNS
        ))
        .bind(task_exec_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::task_not_found(task_exec_id))?;

        let current = TaskRow::from_pg(&row)?.into_state()?;
        let next = apply_task_mutation(&current, &mutation)?;
        Self::write_task(&mut tx, &next).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(next)
    }

    async fn find_task(
        &self,
        workflow_exec_id: &str,
        task_id: &str,
        parent_state_id: Option<&str>,
    ) -> StoreResult<Option<TaskState>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM task_states
            WHERE workflow_exec_id = $1 AND task_id = $2
              AND parent_state_id IS NOT DISTINCT FROM $3
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            TASK_COLUMNS
        ))
        .bind(workflow_exec_id)
        .bind(task_id)
        .bind(parent_state_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|r| TaskRow::from_pg(&r)?.into_state()).transpose()
    }

    async fn list_tasks(&self, workflow_exec_id: &str) -> StoreResult<Vec<TaskState>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM task_states WHERE workflow_exec_id = $1 ORDER BY created_at",
            TASK_COLUMNS
        ))
        .bind(workflow_exec_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Self::map_tasks(rows)
    }

    async fn list_children(&self, parent_state_id: &str) -> StoreResult<Vec<TaskState>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM task_states WHERE parent_state_id = $1 ORDER BY created_at",
            TASK_COLUMNS
        ))
        .bind(parent_state_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Self::map_tasks(rows)
    }
}
