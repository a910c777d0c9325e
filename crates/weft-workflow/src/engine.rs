//! Workflow engine: registration, execution lifecycle and the dispatch loop

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use weft_core::{
    new_exec_id, task_mutation, workflow_mutation, EngineConfig, ErrorInfo, Payload, StateStore,
    StoreError, TaskState, WorkflowFilter, WorkflowState, WorkflowStatus,
};

use crate::context::{ExecutionContext, Gate, Runtime};
use crate::dag::TransitionGraph;
use crate::definition::WorkflowConfig;
use crate::dispatcher::{new_task_state, Dispatcher};
use crate::executor::Executor;
use crate::scheduling::{validate_schedule, WorkflowLauncher};
use crate::signals::{ControlSignal, Signal, SignalBus};
use crate::template::resolve_map;
use crate::transition::{self, Transition};
use crate::{Result, WorkflowError};

/// Parameters of a new execution
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub workflow_id: String,
    pub input: Payload,
    /// Caller-chosen execution ID; generated when absent
    pub exec_id: Option<String>,
    /// Top-level task to start from; the first declared task when absent
    pub initial_task_id: Option<String>,
}

impl StartRequest {
    pub fn new(workflow_id: impl Into<String>, input: Payload) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            input,
            exec_id: None,
            initial_task_id: None,
        }
    }

    pub fn with_exec_id(mut self, exec_id: impl Into<String>) -> Self {
        self.exec_id = Some(exec_id.into());
        self
    }

    pub fn with_initial_task(mut self, task_id: impl Into<String>) -> Self {
        self.initial_task_id = Some(task_id.into());
        self
    }
}

/// Handle on an execution whose dispatch loop runs in this process
struct ActiveExecution {
    token: CancellationToken,
    done: watch::Receiver<bool>,
}

/// Workflow engine
#[derive(Clone)]
pub struct WorkflowEngine {
    dispatcher: Dispatcher,
    /// Registered workflow definitions
    workflows: Arc<DashMap<String, Arc<WorkflowConfig>>>,
    /// Executions with a live dispatch loop
    active: Arc<DashMap<String, ActiveExecution>>,
}

impl WorkflowEngine {
    /// Create an engine with a private signal bus and default settings
    pub fn new(store: Arc<dyn StateStore>, executor: Arc<dyn Executor>) -> Self {
        Self::from_runtime(Runtime {
            store,
            signals: Arc::new(SignalBus::new()),
            executor,
            config: EngineConfig::default(),
        })
    }

    fn from_runtime(runtime: Runtime) -> Self {
        Self {
            dispatcher: Dispatcher::new(Arc::new(runtime)),
            workflows: Arc::new(DashMap::new()),
            active: Arc::new(DashMap::new()),
        }
    }

    fn rebuild(self, update: impl FnOnce(&mut Runtime)) -> Self {
        let current = self.dispatcher.runtime();
        let mut runtime = Runtime {
            store: current.store.clone(),
            signals: current.signals.clone(),
            executor: current.executor.clone(),
            config: current.config.clone(),
        };
        update(&mut runtime);
        Self {
            dispatcher: Dispatcher::new(Arc::new(runtime)),
            ..self
        }
    }

    /// Share a signal bus with other engines or the HTTP layer
    pub fn with_signal_bus(self, signals: Arc<SignalBus>) -> Self {
        self.rebuild(|runtime| runtime.signals = signals)
    }

    pub fn with_config(self, config: EngineConfig) -> Self {
        self.rebuild(|runtime| runtime.config = config)
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.dispatcher.runtime().store
    }

    pub fn signals(&self) -> &Arc<SignalBus> {
        &self.dispatcher.runtime().signals
    }

    pub fn config(&self) -> &EngineConfig {
        &self.dispatcher.runtime().config
    }

    /// Validate and register a workflow definition
    pub fn register(&self, workflow: WorkflowConfig) -> Result<()> {
        let graph = TransitionGraph::build(&workflow)?;
        if let Some(initial) = workflow.initial_task() {
            graph.warn_unreachable(&workflow.id, &initial.id);
        }
        if let Some(schedule) = &workflow.schedule {
            validate_schedule(schedule)?;
        }

        tracing::info!(
            workflow_id = %workflow.id,
            task_count = workflow.tasks.len(),
            "Workflow registered"
        );
        self.workflows.insert(workflow.id.clone(), Arc::new(workflow));
        Ok(())
    }

    pub fn workflow(&self, workflow_id: &str) -> Option<Arc<WorkflowConfig>> {
        self.workflows.get(workflow_id).map(|w| w.value().clone())
    }

    /// Registered workflows sorted by ID
    pub fn workflows(&self) -> Vec<Arc<WorkflowConfig>> {
        let mut all: Vec<_> = self.workflows.iter().map(|w| w.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Start an execution from the first declared task
    pub async fn start(&self, workflow_id: &str, input: Payload) -> Result<String> {
        self.start_with(StartRequest::new(workflow_id, input)).await
    }

    /// Persist a new execution and spawn its dispatch loop
    pub async fn start_with(&self, request: StartRequest) -> Result<String> {
        let workflow = self
            .workflow(&request.workflow_id)
            .ok_or_else(|| WorkflowError::NotFound(request.workflow_id.clone()))?;

        let initial = match request.initial_task_id {
            Some(task_id) => {
                if workflow.task(&task_id).is_none() {
                    return Err(WorkflowError::InvalidDefinition(format!(
                        "initial task {} is not a top-level task of {}",
                        task_id, workflow.id
                    )));
                }
                task_id
            }
            None => workflow
                .initial_task()
                .map(|t| t.id.clone())
                .ok_or_else(|| WorkflowError::InvalidDefinition(format!("{} has no tasks", workflow.id)))?,
        };

        // Persisted already Running so a failed start leaves nothing to recover
        let exec_id = request.exec_id.unwrap_or_else(new_exec_id);
        let mut state = WorkflowState::new(workflow.id.as_str(), exec_id.as_str(), request.input.clone());
        state.start(initial)?;
        self.store().create_workflow(&state).await.map_err(|err| match err {
            StoreError::AlreadyExists(id) => WorkflowError::AlreadyExists(id),
            other => other.into(),
        })?;

        tracing::info!(
            workflow_id = %workflow.id,
            workflow_exec_id = %exec_id,
            "Workflow execution started"
        );

        self.spawn_execution(workflow, exec_id.clone(), request.input);
        Ok(exec_id)
    }

    fn spawn_execution(&self, workflow: Arc<WorkflowConfig>, exec_id: String, input: Payload) {
        let token = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        self.active.insert(
            exec_id.clone(),
            ActiveExecution {
                token: token.clone(),
                done: done_rx,
            },
        );

        // A cancel published on the bus stops in-flight work
        let mut control = self.signals().control(&exec_id);
        let watch_token = token.clone();
        tokio::spawn(async move {
            loop {
                if *control.borrow_and_update() == ControlSignal::Cancel {
                    watch_token.cancel();
                    break;
                }
                tokio::select! {
                    _ = watch_token.cancelled() => break,
                    changed = control.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let ctx = ExecutionContext::new(workflow, exec_id.clone(), input, token.clone());
        let engine = self.clone();
        tokio::spawn(async move {
            let status = engine.drive(&ctx).await;
            tracing::info!(
                workflow_id = %ctx.workflow_id(),
                workflow_exec_id = %exec_id,
                status = ?status,
                "Dispatch loop exited"
            );
            engine.active.remove(&exec_id);
            engine.signals().release_execution(&exec_id);
            token.cancel();
            let _ = done_tx.send(true);
        });
    }

    /// Run the loop; an error that escapes it fails the execution
    async fn drive(&self, ctx: &ExecutionContext) -> Option<WorkflowStatus> {
        let err = match self.run_loop(ctx).await {
            Ok(status) => return Some(status),
            Err(err) => err,
        };

        tracing::error!(
            workflow_exec_id = %ctx.workflow_exec_id,
            error = %err,
            "Workflow execution aborted"
        );
        let info = match err {
            WorkflowError::Store(_) | WorkflowError::Internal(_) => ErrorInfo::infrastructure(err.to_string()),
            _ => ErrorInfo::validation(err.to_string()),
        };
        match self
            .store()
            .update_workflow(
                &ctx.workflow_exec_id,
                workflow_mutation(move |wf: &mut WorkflowState| {
                    if wf.is_terminal() {
                        return Ok(());
                    }
                    wf.fail(info.clone())
                }),
            )
            .await
        {
            Ok(state) => Some(state.status),
            Err(mark_err) => {
                tracing::error!(
                    workflow_exec_id = %ctx.workflow_exec_id,
                    error = %mark_err,
                    "Could not record the failure; execution stays as last persisted"
                );
                None
            }
        }
    }

    /// Main dispatch loop
    async fn run_loop(&self, ctx: &ExecutionContext) -> Result<WorkflowStatus> {
        let store = self.store();
        loop {
            if ctx.gate(self.signals()).await == Gate::Cancel {
                return self.finalize_cancel(ctx).await;
            }

            let workflow = store.get_workflow(&ctx.workflow_exec_id).await?;
            if workflow.is_terminal() {
                return Ok(workflow.status);
            }
            let Some(task_id) = workflow.current_task_id.clone() else {
                return self.complete(ctx, None).await;
            };
            let task = ctx.workflow.task(&task_id).ok_or_else(|| {
                WorkflowError::InvalidDefinition(format!(
                    "task {} is not defined in {}",
                    task_id,
                    ctx.workflow_id()
                ))
            })?;

            let state = match &workflow.current_task_exec_id {
                Some(task_exec_id) => store.get_task(task_exec_id).await?,
                None => {
                    let state = new_task_state(ctx, task, None);
                    store.create_task(&state).await?;
                    let bound = state.clone();
                    store
                        .update_workflow(
                            &ctx.workflow_exec_id,
                            workflow_mutation(move |wf: &mut WorkflowState| {
                                wf.bind_current_task(&bound);
                                Ok(())
                            }),
                        )
                        .await?;
                    state
                }
            };

            let finished = self.dispatcher.dispatch(ctx, task, state, Payload::new()).await?;
            let next = transition::resolve(task, &finished);
            tracing::debug!(
                workflow_exec_id = %ctx.workflow_exec_id,
                task_id = %task_id,
                transition = ?next,
                "Transition resolved"
            );

            match next {
                Transition::Next(next_task_id) => {
                    store
                        .update_workflow(
                            &ctx.workflow_exec_id,
                            workflow_mutation(move |wf: &mut WorkflowState| {
                                wf.record_task(&finished);
                                wf.advance_to(next_task_id.as_str());
                                Ok(())
                            }),
                        )
                        .await?;
                }
                Transition::Complete => return self.complete(ctx, Some(finished)).await,
                Transition::Fail(error) => {
                    let failed = store
                        .update_workflow(
                            &ctx.workflow_exec_id,
                            workflow_mutation(move |wf: &mut WorkflowState| {
                                wf.record_task(&finished);
                                wf.fail(error.clone())
                            }),
                        )
                        .await?;
                    tracing::warn!(
                        workflow_exec_id = %ctx.workflow_exec_id,
                        error = ?failed.error,
                        "Workflow failed"
                    );
                    return Ok(failed.status);
                }
                Transition::Cancel => return self.finalize_cancel(ctx).await,
            }
        }
    }

    async fn complete(&self, ctx: &ExecutionContext, last: Option<TaskState>) -> Result<WorkflowStatus> {
        let store = self.store();
        let output = match &ctx.workflow.outputs {
            Some(templates) => {
                let scope = ctx.scope(store.as_ref(), &Payload::new()).await?;
                resolve_map(templates, &scope)
            }
            None => last.as_ref().and_then(|t| t.output.clone()).unwrap_or_default(),
        };

        let completed = store
            .update_workflow(
                &ctx.workflow_exec_id,
                workflow_mutation(move |wf: &mut WorkflowState| {
                    if let Some(task) = &last {
                        wf.record_task(task);
                    }
                    wf.succeed(output.clone())
                }),
            )
            .await?;
        tracing::info!(
            workflow_id = %ctx.workflow_id(),
            workflow_exec_id = %ctx.workflow_exec_id,
            "Workflow completed"
        );
        Ok(completed.status)
    }

    async fn finalize_cancel(&self, ctx: &ExecutionContext) -> Result<WorkflowStatus> {
        ctx.token.cancel();
        let canceled = self.cancel_execution_state(&ctx.workflow_exec_id).await?;
        tracing::info!(
            workflow_id = %ctx.workflow_id(),
            workflow_exec_id = %ctx.workflow_exec_id,
            "Workflow canceled"
        );
        Ok(canceled.status)
    }

    /// Mark every non-terminal task and then the workflow itself Canceled
    async fn cancel_execution_state(&self, exec_id: &str) -> Result<WorkflowState> {
        let store = self.store();
        for task in store.list_tasks(exec_id).await? {
            if task.is_terminal() {
                continue;
            }
            match store
                .update_task(&task.task_exec_id, task_mutation(|s: &mut TaskState| s.cancel()))
                .await
            {
                Ok(_) | Err(StoreError::TerminalState { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }

        let top_level: Vec<TaskState> = store
            .list_tasks(exec_id)
            .await?
            .into_iter()
            .filter(|t| t.parent_state_id.is_none())
            .collect();
        let state = store
            .update_workflow(
                exec_id,
                workflow_mutation(move |wf: &mut WorkflowState| {
                    if wf.is_terminal() {
                        return Ok(());
                    }
                    for task in &top_level {
                        wf.record_task(task);
                    }
                    wf.cancel()
                }),
            )
            .await?;
        Ok(state)
    }

    /// Wait until the execution's dispatch loop exits, then return its state.
    /// An execution with no loop in this process is returned as stored.
    pub async fn wait_for_completion(&self, exec_id: &str) -> Result<WorkflowState> {
        let done = self.active.get(exec_id).map(|a| a.done.clone());
        if let Some(mut done) = done {
            while !*done.borrow_and_update() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        }
        self.get_execution(exec_id).await
    }

    pub fn is_active(&self, exec_id: &str) -> bool {
        self.active.contains_key(exec_id)
    }

    pub async fn get_execution(&self, exec_id: &str) -> Result<WorkflowState> {
        self.store()
            .get_workflow(exec_id)
            .await
            .map_err(|err| not_found(exec_id, err))
    }

    pub async fn list_executions(&self, filter: &WorkflowFilter) -> Result<Vec<WorkflowState>> {
        Ok(self.store().list_workflows(filter).await?)
    }

    /// Task states of an execution in creation order
    pub async fn list_tasks(&self, exec_id: &str) -> Result<Vec<TaskState>> {
        self.get_execution(exec_id).await?;
        Ok(self.store().list_tasks(exec_id).await?)
    }

    /// Stop dispatching new tasks; in-flight tasks finish
    pub async fn pause(&self, exec_id: &str) -> Result<WorkflowState> {
        let paused = self
            .store()
            .update_workflow(exec_id, workflow_mutation(|wf: &mut WorkflowState| wf.pause()))
            .await
            .map_err(|err| control_error(exec_id, err))?;
        self.signals().pause(exec_id);
        // The loop may have exited since the write; its control entry must not outlive it
        if !self.is_active(exec_id) {
            self.signals().release_execution(exec_id);
        }
        tracing::info!(workflow_exec_id = %exec_id, "Workflow paused");
        Ok(paused)
    }

    /// Re-enter the loop at the last undispatched task
    pub async fn resume(&self, exec_id: &str) -> Result<WorkflowState> {
        let current = self.get_execution(exec_id).await?;
        if current.status != WorkflowStatus::Paused {
            return Err(WorkflowError::NotRunning(format!(
                "{} is {} and cannot be resumed",
                exec_id, current.status
            )));
        }
        let resumed = self
            .store()
            .update_workflow(exec_id, workflow_mutation(|wf: &mut WorkflowState| wf.resume()))
            .await
            .map_err(|err| control_error(exec_id, err))?;
        self.signals().resume(exec_id);

        if !self.is_active(exec_id) {
            if let Some(workflow) = self.workflow(&resumed.workflow_id) {
                self.spawn_execution(workflow, exec_id.to_string(), resumed.input.clone());
            }
        }
        if !self.is_active(exec_id) {
            self.signals().release_execution(exec_id);
        }
        tracing::info!(workflow_exec_id = %exec_id, "Workflow resumed");
        Ok(resumed)
    }

    /// Cancel an execution. With a live loop the loop records the
    /// cancellation; otherwise it is recorded here.
    pub async fn cancel(&self, exec_id: &str) -> Result<WorkflowState> {
        let current = self.get_execution(exec_id).await?;
        if current.is_terminal() {
            return Err(WorkflowError::NotRunning(format!(
                "{} already finished as {}",
                exec_id, current.status
            )));
        }

        self.signals().cancel(exec_id);
        let token = self.active.get(exec_id).map(|a| a.token.clone());
        if let Some(token) = token {
            token.cancel();
            return Ok(current);
        }

        let canceled = self.cancel_execution_state(exec_id).await?;
        self.signals().release_execution(exec_id);
        tracing::info!(workflow_exec_id = %exec_id, "Detached workflow canceled");
        Ok(canceled)
    }

    /// Deliver an application signal to every current waiter
    pub fn send_signal(&self, key: &str, payload: Payload) -> Result<Arc<Signal>> {
        Ok(self.signals().send(key, payload)?)
    }

    /// Re-attach dispatch loops to every unfinished execution in the store
    pub async fn recover(&self) -> Result<usize> {
        let filter = WorkflowFilter::new()
            .with_status(WorkflowStatus::Pending)
            .with_status(WorkflowStatus::Running)
            .with_status(WorkflowStatus::Paused);
        let unfinished = self.store().list_workflows(&filter).await?;

        let mut recovered = 0;
        for state in unfinished {
            let exec_id = state.workflow_exec_id.clone();
            if self.is_active(&exec_id) {
                continue;
            }
            let Some(workflow) = self.workflow(&state.workflow_id) else {
                tracing::warn!(
                    workflow_id = %state.workflow_id,
                    workflow_exec_id = %exec_id,
                    "Execution belongs to an unregistered workflow; leaving it untouched"
                );
                continue;
            };

            match state.status {
                WorkflowStatus::Pending => {
                    if let Some(initial) = workflow.initial_task().map(|t| t.id.clone()) {
                        self.store()
                            .update_workflow(
                                &exec_id,
                                workflow_mutation(move |wf: &mut WorkflowState| wf.start(initial.as_str())),
                            )
                            .await?;
                    }
                }
                WorkflowStatus::Paused => {
                    self.signals().pause(&exec_id);
                }
                _ => {}
            }

            tracing::info!(
                workflow_id = %workflow.id,
                workflow_exec_id = %exec_id,
                status = %state.status,
                "Recovering execution"
            );
            self.spawn_execution(workflow, exec_id, state.input);
            recovered += 1;
        }
        Ok(recovered)
    }
}

fn not_found(exec_id: &str, err: StoreError) -> WorkflowError {
    match err {
        StoreError::NotFound { .. } => WorkflowError::ExecutionNotFound(exec_id.to_string()),
        other => other.into(),
    }
}

fn control_error(exec_id: &str, err: StoreError) -> WorkflowError {
    match err {
        StoreError::TerminalState { status, .. } => {
            WorkflowError::NotRunning(format!("{} already finished as {}", exec_id, status))
        }
        StoreError::InvalidTransition { from, to, .. } => {
            WorkflowError::NotRunning(format!("{} cannot move from {} to {}", exec_id, from, to))
        }
        other => not_found(exec_id, other),
    }
}

#[async_trait]
impl WorkflowLauncher for WorkflowEngine {
    async fn launch(&self, workflow_id: &str, input: Payload) -> Result<String> {
        self.start(workflow_id, input).await
    }

    async fn is_unfinished(&self, exec_id: &str) -> Result<bool> {
        Ok(!self.get_execution(exec_id).await?.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::TaskConfig;
    use crate::executor::{ExecutionRequest, ExecutorError};
    use weft_core::InMemoryStateStore;

    struct Noop;

    #[async_trait]
    impl Executor for Noop {
        async fn execute(
            &self,
            _request: ExecutionRequest,
            _token: CancellationToken,
        ) -> std::result::Result<Payload, ExecutorError> {
            Ok(Payload::new())
        }
    }

    fn engine() -> WorkflowEngine {
        WorkflowEngine::new(Arc::new(InMemoryStateStore::new()), Arc::new(Noop))
    }

    #[test]
    fn test_register_rejects_dangling_transition() {
        let engine = engine();
        let workflow = WorkflowConfig::new("wf").with_task(TaskConfig::tool("t1", "x").on_success("nope"));
        assert!(matches!(
            engine.register(workflow),
            Err(WorkflowError::DagValidation(_))
        ));
        assert!(engine.workflow("wf").is_none());
    }

    #[tokio::test]
    async fn test_start_unknown_workflow() {
        let engine = engine();
        assert!(matches!(
            engine.start("missing", Payload::new()).await,
            Err(WorkflowError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_start_rejects_unknown_initial_task() {
        let engine = engine();
        engine
            .register(WorkflowConfig::new("wf").with_task(TaskConfig::tool("t1", "x")))
            .unwrap();
        let request = StartRequest::new("wf", Payload::new()).with_initial_task("ghost");
        assert!(matches!(
            engine.start_with(request).await,
            Err(WorkflowError::InvalidDefinition(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_exec_id_rejected() {
        let engine = engine();
        engine
            .register(WorkflowConfig::new("wf").with_task(TaskConfig::tool("t1", "x")))
            .unwrap();
        let request = StartRequest::new("wf", Payload::new()).with_exec_id("fixed");
        engine.start_with(request.clone()).await.unwrap();
        assert!(matches!(
            engine.start_with(request).await,
            Err(WorkflowError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_control_on_unknown_execution() {
        let engine = engine();
        assert!(matches!(
            engine.cancel("nope").await,
            Err(WorkflowError::ExecutionNotFound(_))
        ));
        assert!(matches!(
            engine.pause("nope").await,
            Err(WorkflowError::ExecutionNotFound(_))
        ));
    }
}
