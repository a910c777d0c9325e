//! Task dispatch: drives one task state from Pending/Running to a terminal
//! status and persists the result before returning it.
//!
//! Dispatch recurses through parent tasks (parallel, collection, composite)
//! so it returns a boxed future.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use weft_core::{task_mutation, ErrorInfo, Payload, StoreError, TaskState, TaskStatus};

use crate::aggregator::merge_outputs;
use crate::context::{ExecutionContext, Gate, Runtime};
use crate::definition::{
    AggregateTask, BasicTask, CompositeTask, RouterTask, SignalTask, TaskConfig, TaskKind, WaitTask,
    DEFAULT_ROUTE,
};
use crate::executor::{ExecutionRequest, ExecutorError};
use crate::signals::{Signal, SignalError};
use crate::template::{evaluate_condition, resolve_map, resolve_str, route_key};
use crate::Result;

/// Key of the absolute deadline persisted on a wait task's input
pub const DEADLINE_KEY: &str = "deadline";

/// How a task body finished, before it is persisted
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Payload),
    Failed(ErrorInfo),
    TimedOut(ErrorInfo),
    Canceled,
}

pub(crate) fn object(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

/// Fresh Pending state for `task` in the context's execution
pub fn new_task_state(ctx: &ExecutionContext, task: &TaskConfig, parent: Option<&str>) -> TaskState {
    let mut state = TaskState::new(
        ctx.workflow_id(),
        ctx.workflow_exec_id.as_str(),
        task.id.as_str(),
        task.execution_type(),
        task.component(),
    );
    if let TaskKind::Basic(basic) = &task.kind {
        match (&basic.agent, &basic.tool) {
            (Some(agent), _) => state = state.with_agent(agent.clone(), basic.action.clone()),
            (None, Some(tool)) => state = state.with_tool(tool.clone(), basic.action.clone()),
            (None, None) => {}
        }
    }
    if let Some(parent) = parent {
        state = state.with_parent(parent);
    }
    state
}

#[derive(Clone)]
pub struct Dispatcher {
    pub(crate) runtime: Arc<Runtime>,
}

impl Dispatcher {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Run `state` (already persisted) to completion.
    ///
    /// A terminal state is returned untouched, which is what lets recovery
    /// replay a continuation without re-running finished work.
    pub fn dispatch<'a>(
        &'a self,
        ctx: &'a ExecutionContext,
        task: &'a TaskConfig,
        state: TaskState,
        extras: Payload,
    ) -> BoxFuture<'a, Result<TaskState>> {
        Box::pin(async move { self.run(ctx, task, state, extras).await })
    }

    async fn run(
        &self,
        ctx: &ExecutionContext,
        task: &TaskConfig,
        state: TaskState,
        extras: Payload,
    ) -> Result<TaskState> {
        if state.is_terminal() {
            return Ok(state);
        }
        if ctx.token.is_cancelled() {
            return self.settle(ctx, task, state, Outcome::Canceled, &extras).await;
        }

        let store = &self.runtime.store;
        let state = if state.status == TaskStatus::Pending {
            let scope = ctx.scope(store.as_ref(), &extras).await?;
            let input = self.prepare_input(task, &scope, &extras);
            store
                .update_task(
                    &state.task_exec_id,
                    task_mutation(move |s: &mut TaskState| {
                        s.input = Some(input.clone());
                        s.mark_running()
                    }),
                )
                .await?
        } else {
            debug!(task_exec_id = %state.task_exec_id, "Resuming task already marked running");
            state
        };

        info!(
            workflow_exec_id = %ctx.workflow_exec_id,
            task_id = %task.id,
            task_exec_id = %state.task_exec_id,
            execution_type = %state.execution_type,
            "Dispatching task"
        );

        let outcome = match &task.kind {
            TaskKind::Basic(basic) => self.run_basic(ctx, task, basic, &state).await,
            TaskKind::Router(router) => self.run_router(ctx, router, &extras).await?,
            TaskKind::Signal(signal) => self.run_signal(ctx, signal, &extras).await?,
            TaskKind::Wait(wait) => self.run_wait(ctx, task, wait, &state, &extras).await?,
            TaskKind::Aggregate(aggregate) => self.run_aggregate(ctx, &state, aggregate).await?,
            TaskKind::Parallel(parallel) => self.run_parallel(ctx, &state, parallel, &extras).await?,
            TaskKind::Collection(collection) => {
                self.run_collection(ctx, &state, collection, &extras).await?
            }
            TaskKind::Composite(composite) => {
                self.run_composite(ctx, &state, composite, &extras).await?
            }
        };

        self.settle(ctx, task, state, outcome, &extras).await
    }

    fn wait_timeout(&self, task: &TaskConfig) -> Duration {
        task.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.runtime.config.default_wait_timeout())
    }

    fn prepare_input(&self, task: &TaskConfig, scope: &Value, extras: &Payload) -> Payload {
        let mut input = match &task.with {
            Some(with) => resolve_map(with, scope),
            None => extras.clone(),
        };
        if let TaskKind::Wait(_) = task.kind {
            let deadline = chrono::Duration::from_std(self.wait_timeout(task))
                .ok()
                .and_then(|d| Utc::now().checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            input.insert(DEADLINE_KEY.into(), json!(deadline.to_rfc3339()));
        }
        input
    }

    /// Apply output templates and persist the terminal status
    async fn settle(
        &self,
        ctx: &ExecutionContext,
        task: &TaskConfig,
        state: TaskState,
        outcome: Outcome,
        extras: &Payload,
    ) -> Result<TaskState> {
        let store = &self.runtime.store;
        let outcome = match (outcome, &task.outputs) {
            (Outcome::Success(raw), Some(templates)) => {
                let mut extras = extras.clone();
                extras.insert("output".into(), Value::Object(raw));
                let scope = ctx.scope(store.as_ref(), &extras).await?;
                Outcome::Success(resolve_map(templates, &scope))
            }
            (other, _) => other,
        };

        let task_exec_id = state.task_exec_id.clone();
        let updated = store
            .update_task(
                &task_exec_id,
                task_mutation(move |s: &mut TaskState| match outcome.clone() {
                    Outcome::Success(output) => s.succeed(output),
                    Outcome::Failed(error) => s.fail(error),
                    Outcome::TimedOut(error) => s.time_out(error),
                    Outcome::Canceled => s.cancel(),
                }),
            )
            .await;

        match updated {
            Ok(updated) => {
                info!(
                    workflow_exec_id = %ctx.workflow_exec_id,
                    task_id = %updated.task_id,
                    task_exec_id = %updated.task_exec_id,
                    status = %updated.status,
                    "Task settled"
                );
                Ok(updated)
            }
            // Settled concurrently (e.g. by a cancel sweep); the stored status stands
            Err(StoreError::TerminalState { .. }) => Ok(store.get_task(&task_exec_id).await?),
            Err(err) => Err(err.into()),
        }
    }

    async fn run_basic(
        &self,
        ctx: &ExecutionContext,
        task: &TaskConfig,
        basic: &BasicTask,
        state: &TaskState,
    ) -> Outcome {
        let Some(target) = basic.target() else {
            return Outcome::Failed(ErrorInfo::validation(format!(
                "task {} has neither an agent nor a tool",
                task.id
            )));
        };
        let request = ExecutionRequest {
            workflow_id: ctx.workflow_id().to_string(),
            workflow_exec_id: ctx.workflow_exec_id.clone(),
            task_id: task.id.clone(),
            task_exec_id: state.task_exec_id.clone(),
            target,
            action: basic.action.clone(),
            input: state.input.clone().unwrap_or_default(),
        };

        let token = ctx.token.child_token();
        let call = self.runtime.executor.execute(request, token.clone());
        let guarded = async {
            tokio::select! {
                result = call => result,
                _ = ctx.token.cancelled() => Err(ExecutorError::Canceled),
            }
        };

        let result = match task.timeout_secs {
            Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), guarded).await {
                Ok(result) => result,
                Err(_) => {
                    token.cancel();
                    warn!(task_exec_id = %state.task_exec_id, timeout_secs = secs, "Task timed out");
                    return Outcome::TimedOut(ErrorInfo::timeout(format!(
                        "task {} did not finish within {}s",
                        task.id, secs
                    )));
                }
            },
            None => guarded.await,
        };

        match result {
            Ok(output) => Outcome::Success(output),
            Err(_) if ctx.token.is_cancelled() => Outcome::Canceled,
            Err(ExecutorError::Canceled) => Outcome::Canceled,
            Err(err) => Outcome::Failed(err.into()),
        }
    }

    async fn run_router(
        &self,
        ctx: &ExecutionContext,
        router: &RouterTask,
        extras: &Payload,
    ) -> Result<Outcome> {
        let scope = ctx.scope(self.runtime.store.as_ref(), extras).await?;
        let key = route_key(&resolve_str(&router.condition, &scope));

        let chosen = match router.routes.get(&key) {
            Some(next) => Some((key.clone(), next)),
            None => router
                .routes
                .get(DEFAULT_ROUTE)
                .map(|next| (DEFAULT_ROUTE.to_string(), next)),
        };
        Ok(match chosen {
            Some((route, next)) => Outcome::Success(object(json!({ "route": route, "next": next }))),
            None => Outcome::Failed(ErrorInfo::execution(format!(
                "no route matches \"{}\" and no default route is configured",
                key
            ))),
        })
    }

    async fn run_signal(
        &self,
        ctx: &ExecutionContext,
        task: &SignalTask,
        extras: &Payload,
    ) -> Result<Outcome> {
        let scope = ctx.scope(self.runtime.store.as_ref(), extras).await?;
        let key = route_key(&resolve_str(&task.signal.id, &scope));
        let payload = task
            .signal
            .payload
            .as_ref()
            .map(|p| resolve_map(p, &scope))
            .unwrap_or_default();

        Ok(match self.runtime.signals.send(&key, payload) {
            Ok(sent) => Outcome::Success(signal_output(&sent)),
            Err(err) => Outcome::Failed(ErrorInfo::validation(err.to_string())),
        })
    }

    async fn run_wait(
        &self,
        ctx: &ExecutionContext,
        task: &TaskConfig,
        wait: &WaitTask,
        state: &TaskState,
        extras: &Payload,
    ) -> Result<Outcome> {
        let deadline_at = state
            .input
            .as_ref()
            .and_then(|input| input.get(DEADLINE_KEY))
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|d| d.with_timezone(&Utc));
        let remaining = match deadline_at {
            Some(at) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO),
            None => self.wait_timeout(task),
        };

        let scope = ctx.scope(self.runtime.store.as_ref(), extras).await?;
        let accept = |signal: &Signal| match &wait.condition {
            None => true,
            Some(expr) => {
                let mut scoped = scope.clone();
                if let Value::Object(map) = &mut scoped {
                    map.insert("signal".into(), json!({ "id": signal.id, "payload": signal.payload }));
                }
                evaluate_condition(expr, &scoped)
            }
        };

        let key = route_key(&resolve_str(&wait.wait_for, &scope));
        debug!(
            task_exec_id = %state.task_exec_id,
            signal_key = %key,
            remaining_ms = remaining.as_millis() as u64,
            "Waiting for signal"
        );
        let received = self
            .runtime
            .signals
            .wait(&key, &ctx.token, Instant::now() + remaining, accept)
            .await;

        Ok(match received {
            Ok(signal) => Outcome::Success(signal_output(&signal)),
            Err(SignalError::Timeout(key)) => Outcome::Failed(
                ErrorInfo::timeout(format!("no signal on {} before the deadline", key))
                    .with_details(json!({ "signal_key": key })),
            ),
            Err(SignalError::Canceled(_)) => Outcome::Canceled,
            Err(err) => Outcome::Failed(ErrorInfo::validation(err.to_string())),
        })
    }

    /// Dependencies are the aggregate's siblings: members of the same
    /// parent, or top-level tasks when it has none.
    async fn run_aggregate(
        &self,
        ctx: &ExecutionContext,
        state: &TaskState,
        aggregate: &AggregateTask,
    ) -> Result<Outcome> {
        let store = &self.runtime.store;
        let siblings = match &state.parent_state_id {
            Some(parent) => store.list_children(parent).await?,
            None => {
                let mut tasks = store.list_tasks(&ctx.workflow_exec_id).await?;
                tasks.retain(|t| t.parent_state_id.is_none());
                tasks
            }
        };
        let mut latest: HashMap<&str, &TaskState> = HashMap::new();
        for task in &siblings {
            latest.insert(task.task_id.as_str(), task);
        }

        let deps = aggregate
            .tasks
            .iter()
            .map(|id| (id.as_str(), latest.get(id.as_str()).copied()));
        Ok(match merge_outputs(deps) {
            Ok(merged) => Outcome::Success(merged),
            Err(error) => Outcome::Failed(error),
        })
    }

    /// Members run one after another; a member router jumps within the
    /// composite and a `final` member ends it early.
    async fn run_composite(
        &self,
        ctx: &ExecutionContext,
        parent: &TaskState,
        composite: &CompositeTask,
        extras: &Payload,
    ) -> Result<Outcome> {
        let store = &self.runtime.store;
        let mut prior: HashMap<String, TaskState> = store
            .list_children(&parent.task_exec_id)
            .await?
            .into_iter()
            .map(|child| (child.task_id.clone(), child))
            .collect();

        let mut outputs = Payload::new();
        let mut index = 0;
        while index < composite.tasks.len() {
            if ctx.gate(&self.runtime.signals).await == Gate::Cancel {
                return Ok(Outcome::Canceled);
            }
            let member = &composite.tasks[index];
            // A member revisited through a route gets a fresh state
            let state = match prior.remove(&member.id) {
                Some(state) => state,
                None => {
                    let state = new_task_state(ctx, member, Some(&parent.task_exec_id));
                    store.create_task(&state).await?;
                    state
                }
            };

            let done = self.dispatch(ctx, member, state, extras.clone()).await?;
            match done.status {
                TaskStatus::Success => {
                    let output = done.output.unwrap_or_default();
                    let routed = match member.kind {
                        TaskKind::Router(_) => output.get("next").and_then(Value::as_str).map(str::to_string),
                        _ => None,
                    };
                    outputs.insert(member.id.clone(), Value::Object(output));

                    if let Some(next) = routed {
                        match composite.tasks.iter().position(|t| t.id == next) {
                            Some(position) => index = position,
                            None => {
                                return Ok(Outcome::Failed(ErrorInfo::validation(format!(
                                    "route {} is not a member of {}",
                                    next, parent.task_id
                                ))))
                            }
                        }
                    } else if member.is_final {
                        break;
                    } else {
                        index += 1;
                    }
                }
                TaskStatus::Canceled => return Ok(Outcome::Canceled),
                _ => {
                    return Ok(Outcome::Failed(done.error.unwrap_or_else(|| {
                        ErrorInfo::execution(format!("member {} failed", member.id))
                    })))
                }
            }
        }
        Ok(Outcome::Success(outputs))
    }
}

fn signal_output(signal: &Signal) -> Payload {
    object(json!({
        "signal": {
            "id": signal.id,
            "key": signal.key,
            "payload": signal.payload,
        }
    }))
}
