//! Fan-out of parallel and collection children and status aggregation.
//!
//! Children are persisted before any of them runs, then dispatched on a
//! `JoinSet` bounded by the worker limit. The parent's outcome is derived
//! from the children's stored states in declaration order.

use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use tokio::task::JoinSet;
use tracing::{debug, warn};
use weft_core::{task_mutation, ErrorInfo, Payload, StoreError, TaskState, TaskStatus};

use crate::context::{ExecutionContext, Gate};
use crate::definition::{CollectionMode, CollectionTask, ParallelStrategy, ParallelTask, TaskConfig};
use crate::dispatcher::{new_task_state, Dispatcher, Outcome};
use crate::template::{evaluate_condition, resolve_str, resolve_value};
use crate::{Result, WorkflowError};

/// A child to run under a coordinating parent
#[derive(Debug, Clone)]
pub struct ChildPlan {
    pub config: TaskConfig,
    pub extras: Payload,
}

#[derive(Debug, Clone, Copy)]
struct Plan {
    strategy: ParallelStrategy,
    /// 0 means unbounded
    limit: usize,
    /// 0 means a single group
    batch: usize,
}

/// Parent outcome as a pure function of its children's final states.
///
/// `children` must be in declaration order: the parent error is the error
/// of the first failed child in that order.
pub fn aggregate_status(strategy: ParallelStrategy, children: &[TaskState]) -> Outcome {
    let mut outputs = Payload::new();
    let mut first_error = None;
    let mut succeeded = 0;
    let mut unsuccessful = 0;

    for child in children {
        match child.status {
            TaskStatus::Success => {
                succeeded += 1;
                outputs.insert(
                    child.task_id.clone(),
                    Value::Object(child.output.clone().unwrap_or_default()),
                );
            }
            TaskStatus::Failed | TaskStatus::TimedOut => {
                unsuccessful += 1;
                if first_error.is_none() {
                    first_error = Some(child.error.clone().unwrap_or_else(|| {
                        ErrorInfo::execution(format!("child {} failed", child.task_id))
                    }));
                }
            }
            _ => unsuccessful += 1,
        }
    }

    if children.is_empty() {
        return Outcome::Success(outputs);
    }
    let succeeds = match strategy {
        ParallelStrategy::WaitAll | ParallelStrategy::FailFast => unsuccessful == 0,
        ParallelStrategy::BestEffort | ParallelStrategy::Race => succeeded > 0,
    };
    if succeeds {
        return Outcome::Success(outputs);
    }
    match first_error {
        Some(error) => Outcome::Failed(error),
        None => Outcome::Canceled,
    }
}

/// Whether a settled child ends the dispatch of its siblings
fn stops_siblings(strategy: ParallelStrategy, child: &TaskState) -> bool {
    match strategy {
        ParallelStrategy::FailFast => {
            matches!(child.status, TaskStatus::Failed | TaskStatus::TimedOut)
        }
        ParallelStrategy::Race => child.status == TaskStatus::Success,
        ParallelStrategy::WaitAll | ParallelStrategy::BestEffort => false,
    }
}

impl Dispatcher {
    fn worker_limit(&self, max_workers: usize) -> usize {
        match (max_workers, self.runtime.config.max_concurrent_children) {
            (0, global) => global,
            (local, 0) => local,
            (local, global) => local.min(global),
        }
    }

    pub(crate) async fn run_parallel(
        &self,
        ctx: &ExecutionContext,
        parent: &TaskState,
        task: &ParallelTask,
        extras: &Payload,
    ) -> Result<Outcome> {
        let members = task
            .tasks
            .iter()
            .map(|child| ChildPlan {
                config: child.clone(),
                extras: extras.clone(),
            })
            .collect();
        let plan = Plan {
            strategy: task.strategy,
            limit: self.worker_limit(task.max_workers),
            batch: 0,
        };
        self.coordinate(ctx, parent, members, plan).await
    }

    pub(crate) async fn run_collection(
        &self,
        ctx: &ExecutionContext,
        parent: &TaskState,
        task: &CollectionTask,
        extras: &Payload,
    ) -> Result<Outcome> {
        let scope = ctx.scope(self.runtime.store.as_ref(), extras).await?;
        let items = match &task.items {
            Value::String(template) => resolve_str(template, &scope),
            other => resolve_value(other, &scope),
        };
        let Value::Array(items) = items else {
            return Ok(Outcome::Failed(ErrorInfo::validation(format!(
                "items of {} did not resolve to an array",
                parent.task_id
            ))));
        };

        let mut members = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let mut child_extras = extras.clone();
            child_extras.insert(task.item_var.clone(), item);
            child_extras.insert(task.index_var.clone(), json!(index));

            if let Some(filter) = &task.filter {
                let mut item_scope = scope.clone();
                if let Value::Object(map) = &mut item_scope {
                    map.extend(child_extras.clone());
                }
                if !evaluate_condition(filter, &item_scope) {
                    debug!(task_id = %parent.task_id, index, "Collection item filtered out");
                    continue;
                }
            }

            let mut config = (*task.task).clone();
            config.id = task.child_id(index);
            members.push(ChildPlan {
                config,
                extras: child_extras,
            });
        }

        let limit = match task.mode {
            CollectionMode::Sequential => 1,
            CollectionMode::Parallel => self.worker_limit(task.max_workers),
        };
        let plan = Plan {
            strategy: task.strategy,
            limit,
            batch: task.batch,
        };
        self.coordinate(ctx, parent, members, plan).await
    }

    async fn coordinate(
        &self,
        ctx: &ExecutionContext,
        parent: &TaskState,
        members: Vec<ChildPlan>,
        plan: Plan,
    ) -> Result<Outcome> {
        let store = &self.runtime.store;

        // Reuse children persisted by an earlier run of this parent
        let mut prior: HashMap<String, TaskState> = store
            .list_children(&parent.task_exec_id)
            .await?
            .into_iter()
            .map(|child| (child.task_id.clone(), child))
            .collect();
        let mut states: Vec<Option<TaskState>> = Vec::with_capacity(members.len());
        for member in &members {
            let state = match prior.remove(&member.config.id) {
                Some(state) => state,
                None => {
                    let state = new_task_state(ctx, &member.config, Some(&parent.task_exec_id));
                    store.create_task(&state).await?;
                    state
                }
            };
            states.push(Some(state));
        }

        let mut stopped = states
            .iter()
            .flatten()
            .any(|s| s.is_terminal() && stops_siblings(plan.strategy, s));
        let pending: Vec<usize> = states
            .iter()
            .enumerate()
            .filter(|(_, s)| s.as_ref().map(|s| !s.is_terminal()).unwrap_or(false))
            .map(|(i, _)| i)
            .collect();
        let groups: Vec<Vec<usize>> = if plan.batch > 0 {
            pending.chunks(plan.batch).map(|c| c.to_vec()).collect()
        } else {
            vec![pending]
        };

        debug!(
            task_id = %parent.task_id,
            children = members.len(),
            groups = groups.len(),
            limit = plan.limit,
            "Coordinating children"
        );

        let siblings = ctx.with_token(ctx.token.child_token());
        for group in groups {
            if stopped {
                break;
            }
            stopped = self.run_group(&siblings, &members, &mut states, group, plan).await?;
        }

        // Children never launched are closed out so the parent's view is final
        for state in states.into_iter().flatten().filter(|s| !s.is_terminal()) {
            let canceled = store
                .update_task(
                    &state.task_exec_id,
                    task_mutation(|s: &mut TaskState| s.cancel()),
                )
                .await;
            match canceled {
                Ok(_) | Err(StoreError::TerminalState { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }

        if ctx.token.is_cancelled() {
            return Ok(Outcome::Canceled);
        }

        let mut settled: HashMap<String, TaskState> = store
            .list_children(&parent.task_exec_id)
            .await?
            .into_iter()
            .map(|child| (child.task_id.clone(), child))
            .collect();
        let ordered: Vec<TaskState> = members
            .iter()
            .filter_map(|member| settled.remove(&member.config.id))
            .collect();
        Ok(aggregate_status(plan.strategy, &ordered))
    }

    /// Dispatch one group; returns whether sibling dispatch must stop
    async fn run_group(
        &self,
        ctx: &ExecutionContext,
        members: &[ChildPlan],
        states: &mut [Option<TaskState>],
        group: Vec<usize>,
        plan: Plan,
    ) -> Result<bool> {
        let mut queue: VecDeque<usize> = group.into();
        let mut running = JoinSet::new();
        let mut stop = false;
        let mut failure: Option<WorkflowError> = None;

        loop {
            while !stop && (plan.limit == 0 || running.len() < plan.limit) {
                let Some(index) = queue.pop_front() else {
                    break;
                };
                if ctx.gate(&self.runtime.signals).await == Gate::Cancel {
                    stop = true;
                    break;
                }
                let Some(state) = states[index].take() else {
                    continue;
                };
                let dispatcher = self.clone();
                let child_ctx = ctx.clone();
                let member = members[index].clone();
                running.spawn(async move {
                    let result = dispatcher
                        .dispatch(&child_ctx, &member.config, state, member.extras.clone())
                        .await;
                    (index, result)
                });
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            match joined {
                Ok((index, Ok(state))) => {
                    if !stop && stops_siblings(plan.strategy, &state) {
                        debug!(task_id = %state.task_id, status = %state.status, "Child settled the group");
                        ctx.token.cancel();
                        stop = true;
                    }
                    states[index] = Some(state);
                }
                Ok((_, Err(err))) => {
                    ctx.token.cancel();
                    stop = true;
                    failure.get_or_insert(err);
                }
                Err(join_err) => {
                    warn!(error = %join_err, "Child dispatch aborted");
                    ctx.token.cancel();
                    stop = true;
                    failure.get_or_insert(WorkflowError::Internal(join_err.to_string()));
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(stop),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::{ComponentType, ErrorCode, ExecutionType};

    fn child(id: &str, status: TaskStatus) -> TaskState {
        let mut state = TaskState::new("wf", "exec", id, ExecutionType::Basic, ComponentType::Tool);
        state.mark_running().unwrap();
        match status {
            TaskStatus::Success => state
                .succeed(json!({ "from": id }).as_object().cloned().unwrap())
                .unwrap(),
            TaskStatus::Failed => state
                .fail(ErrorInfo::execution(format!("{} broke", id)))
                .unwrap(),
            TaskStatus::Canceled => state.cancel().unwrap(),
            _ => {}
        }
        state
    }

    #[test]
    fn test_wait_all_fails_with_first_declared_error() {
        let children = [
            child("c1", TaskStatus::Success),
            child("c2", TaskStatus::Failed),
            child("c3", TaskStatus::Failed),
        ];
        match aggregate_status(ParallelStrategy::WaitAll, &children) {
            Outcome::Failed(error) => {
                assert_eq!(error.code, ErrorCode::ExecutionError);
                assert_eq!(error.message, "c2 broke");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_wait_all_success_maps_outputs() {
        let children = [child("c1", TaskStatus::Success), child("c2", TaskStatus::Success)];
        let Outcome::Success(output) = aggregate_status(ParallelStrategy::WaitAll, &children) else {
            panic!("expected success");
        };
        assert_eq!(output["c1"]["from"], "c1");
        assert_eq!(output["c2"]["from"], "c2");
    }

    #[test]
    fn test_empty_children_succeed() {
        for strategy in [
            ParallelStrategy::WaitAll,
            ParallelStrategy::FailFast,
            ParallelStrategy::BestEffort,
            ParallelStrategy::Race,
        ] {
            assert_eq!(aggregate_status(strategy, &[]), Outcome::Success(Payload::new()));
        }
    }

    #[test]
    fn test_race_and_best_effort_need_one_success() {
        let mixed = [
            child("c1", TaskStatus::Failed),
            child("c2", TaskStatus::Success),
            child("c3", TaskStatus::Canceled),
        ];
        for strategy in [ParallelStrategy::Race, ParallelStrategy::BestEffort] {
            let Outcome::Success(output) = aggregate_status(strategy, &mixed) else {
                panic!("expected success for {:?}", strategy);
            };
            assert_eq!(output.len(), 1);
            assert!(output.contains_key("c2"));
        }

        let all_failed = [child("c1", TaskStatus::Failed), child("c2", TaskStatus::Failed)];
        assert!(matches!(
            aggregate_status(ParallelStrategy::Race, &all_failed),
            Outcome::Failed(ref e) if e.message == "c1 broke"
        ));
    }

    #[test]
    fn test_only_canceled_children_cancel_parent() {
        let children = [child("c1", TaskStatus::Canceled)];
        assert_eq!(aggregate_status(ParallelStrategy::WaitAll, &children), Outcome::Canceled);
    }

    #[test]
    fn test_stop_rules() {
        assert!(stops_siblings(ParallelStrategy::FailFast, &child("c", TaskStatus::Failed)));
        assert!(!stops_siblings(ParallelStrategy::FailFast, &child("c", TaskStatus::Success)));
        assert!(stops_siblings(ParallelStrategy::Race, &child("c", TaskStatus::Success)));
        assert!(!stops_siblings(ParallelStrategy::WaitAll, &child("c", TaskStatus::Failed)));
    }
}
