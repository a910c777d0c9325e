//! `StateStore` decorator that retries transient backend failures.
//!
//! Update mutations are re-runnable, so a failed commit is retried by
//! applying the same mutation to the record as it is stored now.

use async_trait::async_trait;
use std::sync::Arc;
use weft_core::{
    StateStore, StoreError, StoreResult, TaskMutation, TaskState, WorkflowFilter,
    WorkflowMutation, WorkflowState,
};

use crate::resilience::{retry_with, RetryPolicy};

pub struct RetryingStateStore {
    inner: Arc<dyn StateStore>,
    policy: RetryPolicy,
}

impl RetryingStateStore {
    pub fn new(inner: Arc<dyn StateStore>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &Arc<dyn StateStore> {
        &self.inner
    }
}

fn transient(e: &StoreError) -> bool {
    e.is_transient()
}

#[async_trait]
impl StateStore for RetryingStateStore {
    async fn create_workflow(&self, state: &WorkflowState) -> StoreResult<()> {
        retry_with(
            &self.policy,
            "create_workflow",
            || self.inner.create_workflow(state),
            transient,
        )
        .await
    }

    async fn get_workflow(&self, workflow_exec_id: &str) -> StoreResult<WorkflowState> {
        retry_with(
            &self.policy,
            "get_workflow",
            || self.inner.get_workflow(workflow_exec_id),
            transient,
        )
        .await
    }

    async fn update_workflow(
        &self,
        workflow_exec_id: &str,
        mutation: WorkflowMutation,
    ) -> StoreResult<WorkflowState> {
        retry_with(
            &self.policy,
            "update_workflow",
            || self.inner.update_workflow(workflow_exec_id, mutation.clone()),
            transient,
        )
        .await
    }

    async fn list_workflows(&self, filter: &WorkflowFilter) -> StoreResult<Vec<WorkflowState>> {
        retry_with(
            &self.policy,
            "list_workflows",
            || self.inner.list_workflows(filter),
            transient,
        )
        .await
    }

    async fn delete_workflow(&self, workflow_exec_id: &str) -> StoreResult<()> {
        retry_with(
            &self.policy,
            "delete_workflow",
            || self.inner.delete_workflow(workflow_exec_id),
            transient,
        )
        .await
    }

    async fn create_task(&self, state: &TaskState) -> StoreResult<()> {
        retry_with(
            &self.policy,
            "create_task",
            || self.inner.create_task(state),
            transient,
        )
        .await
    }

    async fn get_task(&self, task_exec_id: &str) -> StoreResult<TaskState> {
        retry_with(
            &self.policy,
            "get_task",
            || self.inner.get_task(task_exec_id),
            transient,
        )
        .await
    }

    async fn update_task(
        &self,
        task_exec_id: &str,
        mutation: TaskMutation,
    ) -> StoreResult<TaskState> {
        retry_with(
            &self.policy,
            "update_task",
            || self.inner.update_task(task_exec_id, mutation.clone()),
            transient,
        )
        .await
    }

    async fn find_task(
        &self,
        workflow_exec_id: &str,
        task_id: &str,
        parent_state_id: Option<&str>,
    ) -> StoreResult<Option<TaskState>> {
        retry_with(
            &self.policy,
            "find_task",
            || self.inner.find_task(workflow_exec_id, task_id, parent_state_id),
            transient,
        )
        .await
    }

    async fn list_tasks(&self, workflow_exec_id: &str) -> StoreResult<Vec<TaskState>> {
        retry_with(
            &self.policy,
            "list_tasks",
            || self.inner.list_tasks(workflow_exec_id),
            transient,
        )
        .await
    }

    async fn list_children(&self, parent_state_id: &str) -> StoreResult<Vec<TaskState>> {
        retry_with(
            &self.policy,
            "list_children",
            || self.inner.list_children(parent_state_id),
            transient,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use weft_core::{
        apply_workflow_mutation, task_mutation, workflow_mutation, InMemoryStateStore, Payload,
        WorkflowStatus,
    };

    /// Fails the first `failures` reads and locks with a backend error, and
    /// the first `commit_failures` workflow updates after running the
    /// mutation but before storing its result.
    struct Flaky {
        inner: InMemoryStateStore,
        failures: AtomicU32,
        commit_failures: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                inner: InMemoryStateStore::new(),
                failures: AtomicU32::new(failures),
                commit_failures: AtomicU32::new(0),
            }
        }

        fn with_commit_failures(self, n: u32) -> Self {
            self.commit_failures.store(n, Ordering::SeqCst);
            self
        }

        fn take(counter: &AtomicU32) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
        }

        fn trip(&self) -> StoreResult<()> {
            if Self::take(&self.failures) {
                return Err(StoreError::Backend("connection reset".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl StateStore for Flaky {
        async fn create_workflow(&self, state: &WorkflowState) -> StoreResult<()> {
            self.inner.create_workflow(state).await
        }
        async fn get_workflow(&self, id: &str) -> StoreResult<WorkflowState> {
            self.trip()?;
            self.inner.get_workflow(id).await
        }
        async fn update_workflow(
            &self,
            id: &str,
            mutation: WorkflowMutation,
        ) -> StoreResult<WorkflowState> {
            self.trip()?;
            if Self::take(&self.commit_failures) {
                let current = self.inner.get_workflow(id).await?;
                apply_workflow_mutation(&current, &mutation)?;
                return Err(StoreError::Backend("commit failed: connection reset".into()));
            }
            self.inner.update_workflow(id, mutation).await
        }
        async fn list_workflows(&self, f: &WorkflowFilter) -> StoreResult<Vec<WorkflowState>> {
            self.inner.list_workflows(f).await
        }
        async fn delete_workflow(&self, id: &str) -> StoreResult<()> {
            self.inner.delete_workflow(id).await
        }
        async fn create_task(&self, state: &TaskState) -> StoreResult<()> {
            self.inner.create_task(state).await
        }
        async fn get_task(&self, id: &str) -> StoreResult<TaskState> {
            self.inner.get_task(id).await
        }
        async fn update_task(&self, id: &str, mutation: TaskMutation) -> StoreResult<TaskState> {
            self.trip()?;
            self.inner.update_task(id, mutation).await
        }
        async fn find_task(
            &self,
            exec: &str,
            task: &str,
            parent: Option<&str>,
        ) -> StoreResult<Option<TaskState>> {
            self.inner.find_task(exec, task, parent).await
        }
        async fn list_tasks(&self, exec: &str) -> StoreResult<Vec<TaskState>> {
            self.inner.list_tasks(exec).await
        }
        async fn list_children(&self, parent: &str) -> StoreResult<Vec<TaskState>> {
            self.inner.list_children(parent).await
        }
    }

    fn store(failures: u32, attempts: u32) -> RetryingStateStore {
        RetryingStateStore::new(
            Arc::new(Flaky::new(failures)),
            RetryPolicy::fixed(attempts, Duration::from_millis(5)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_read_is_retried() {
        let store = store(2, 3);
        let wf = WorkflowState::new("wf", "exec-1", Payload::new());
        store.create_workflow(&wf).await.unwrap();

        let loaded = store.get_workflow("exec-1").await.unwrap();
        assert_eq!(loaded.workflow_exec_id, "exec-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_applies_mutation_once() {
        let store = store(1, 3);
        let wf = WorkflowState::new("wf", "exec-1", Payload::new());
        store.create_workflow(&wf).await.unwrap();

        let updated = store
            .update_workflow("exec-1", workflow_mutation(|s| s.start("t1")))
            .await
            .unwrap();
        assert_eq!(updated.status, WorkflowStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_commit_reapplies_mutation() {
        let store = RetryingStateStore::new(
            Arc::new(Flaky::new(0).with_commit_failures(2)),
            RetryPolicy::fixed(5, Duration::from_millis(1)),
        );
        let wf = WorkflowState::new("wf", "exec-1", Payload::new());
        store.create_workflow(&wf).await.unwrap();

        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let updated = store
            .update_workflow(
                "exec-1",
                workflow_mutation(move |s| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    s.start("t1")
                }),
            )
            .await
            .unwrap();

        assert_eq!(updated.status, WorkflowStatus::Running);
        assert_eq!(updated.current_task_id.as_deref(), Some("t1"));
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(store.get_workflow("exec-1").await.unwrap().status, WorkflowStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_commit_exhausts_budget() {
        let store = RetryingStateStore::new(
            Arc::new(Flaky::new(0).with_commit_failures(10)),
            RetryPolicy::fixed(3, Duration::from_millis(1)),
        );
        let wf = WorkflowState::new("wf", "exec-1", Payload::new());
        store.create_workflow(&wf).await.unwrap();

        let err = store
            .update_workflow("exec-1", workflow_mutation(|s| s.start("t1")))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.get_workflow("exec-1").await.unwrap().status, WorkflowStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_surfaces_backend_error() {
        let store = store(10, 2);
        let wf = WorkflowState::new("wf", "exec-1", Payload::new());
        store.create_workflow(&wf).await.unwrap();

        let err = store.get_workflow("exec-1").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_logical_errors_are_not_retried() {
        let store = store(0, 5);
        let err = store
            .update_task("missing", task_mutation(|s| s.mark_running()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }
}
