//! Transition graph of a workflow and registration-time structural checks

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, EdgeRef};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::warn;

use crate::definition::{TaskConfig, TaskKind, WorkflowConfig};

#[derive(Debug, Error)]
pub enum DagValidationError {
    #[error("Empty workflow: no tasks defined")]
    EmptyWorkflow,

    #[error("Duplicate task ID: {0}")]
    DuplicateTaskId(String),

    #[error("Task {task} references unknown task {reference}")]
    MissingReference { task: String, reference: String },

    #[error("Invalid task {task}: {reason}")]
    InvalidTask { task: String, reason: String },

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),
}

/// Edge label in the transition graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Success,
    Error,
    Route,
    Timeout,
}

/// Directed graph of top-level tasks linked by their transitions
#[derive(Debug, Clone)]
pub struct TransitionGraph {
    graph: DiGraph<String, Edge>,
    nodes: HashMap<String, NodeIndex>,
}

impl TransitionGraph {
    /// Build and structurally validate the graph for a workflow
    pub fn build(workflow: &WorkflowConfig) -> Result<Self, DagValidationError> {
        if workflow.tasks.is_empty() {
            return Err(DagValidationError::EmptyWorkflow);
        }

        let mut seen = HashSet::new();
        for task in &workflow.tasks {
            collect_ids(task, &mut seen)?;
            validate_task(task)?;
        }

        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();
        for task in &workflow.tasks {
            let idx = graph.add_node(task.id.clone());
            nodes.insert(task.id.clone(), idx);
        }

        for task in &workflow.tasks {
            let from = nodes[&task.id];
            for (target, edge) in outgoing(task) {
                let to = nodes.get(target).ok_or_else(|| DagValidationError::MissingReference {
                    task: task.id.clone(),
                    reference: target.to_string(),
                })?;
                graph.add_edge(from, *to, edge);
            }
            if let TaskKind::Aggregate(agg) = &task.kind {
                for dep in &agg.tasks {
                    if !nodes.contains_key(dep) {
                        return Err(DagValidationError::MissingReference {
                            task: task.id.clone(),
                            reference: dep.clone(),
                        });
                    }
                }
            }
        }

        Ok(Self { graph, nodes })
    }

    /// Tasks no transition path from `start` can reach
    pub fn unreachable_from(&self, start: &str) -> Vec<String> {
        let Some(&start_idx) = self.nodes.get(start) else {
            return Vec::new();
        };
        let mut reached = HashSet::new();
        let mut dfs = Dfs::new(&self.graph, start_idx);
        while let Some(node) = dfs.next(&self.graph) {
            reached.insert(node);
        }

        let mut unreachable: Vec<String> = self
            .graph
            .node_indices()
            .filter(|n| !reached.contains(n))
            .map(|n| self.graph[n].clone())
            .collect();
        unreachable.sort();
        unreachable
    }

    /// Log unreachable tasks; they are legal (e.g. only started explicitly)
    pub fn warn_unreachable(&self, workflow_id: &str, start: &str) {
        for task_id in self.unreachable_from(start) {
            warn!(workflow_id = %workflow_id, task_id = %task_id, "Task is unreachable from the initial task");
        }
    }

    pub fn successors(&self, task_id: &str) -> Vec<(String, Edge)> {
        let Some(&idx) = self.nodes.get(task_id) else {
            return Vec::new();
        };
        let mut out: Vec<_> = self
            .graph
            .edges(idx)
            .map(|e| (self.graph[e.target()].clone(), *e.weight()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

fn outgoing(task: &TaskConfig) -> Vec<(&str, Edge)> {
    let mut out = Vec::new();
    if let Some(next) = task.success_next() {
        out.push((next, Edge::Success));
    }
    if let Some(next) = task.error_next() {
        out.push((next, Edge::Error));
    }
    match &task.kind {
        TaskKind::Router(router) => {
            for target in router.routes.values() {
                out.push((target.as_str(), Edge::Route));
            }
        }
        TaskKind::Wait(wait) => {
            if let Some(ref next) = wait.on_timeout {
                out.push((next.as_str(), Edge::Timeout));
            }
        }
        _ => {}
    }
    out
}

fn collect_ids(task: &TaskConfig, seen: &mut HashSet<String>) -> Result<(), DagValidationError> {
    if task.id.trim().is_empty() {
        return Err(DagValidationError::InvalidTask {
            task: task.id.clone(),
            reason: "task ID must not be empty".into(),
        });
    }
    if !seen.insert(task.id.clone()) {
        return Err(DagValidationError::DuplicateTaskId(task.id.clone()));
    }
    match &task.kind {
        TaskKind::Parallel(p) => {
            for child in &p.tasks {
                collect_ids(child, seen)?;
            }
        }
        TaskKind::Composite(c) => {
            for child in &c.tasks {
                collect_ids(child, seen)?;
            }
        }
        TaskKind::Collection(c) => collect_ids(&c.task, seen)?,
        _ => {}
    }
    Ok(())
}

fn invalid(task: &TaskConfig, reason: &str) -> DagValidationError {
    DagValidationError::InvalidTask {
        task: task.id.clone(),
        reason: reason.to_string(),
    }
}

fn validate_task(task: &TaskConfig) -> Result<(), DagValidationError> {
    match &task.kind {
        TaskKind::Basic(basic) => {
            if basic.target().is_none() {
                return Err(invalid(task, "basic task needs an agent or a tool"));
            }
        }
        TaskKind::Router(router) => {
            if router.routes.is_empty() {
                return Err(invalid(task, "router has no routes"));
            }
        }
        TaskKind::Parallel(p) => {
            if p.tasks.is_empty() {
                return Err(invalid(task, "parallel task has no children"));
            }
            let members: HashSet<&str> = p.tasks.iter().map(|t| t.id.as_str()).collect();
            for child in &p.tasks {
                validate_task(child)?;
                check_member_aggregate(child, &members)?;
            }
        }
        TaskKind::Collection(c) => {
            if c.item_var == c.index_var {
                return Err(invalid(task, "item_var and index_var must differ"));
            }
            if matches!(c.task.kind, TaskKind::Aggregate(_)) {
                return Err(invalid(&c.task, "an aggregate cannot be a collection item task"));
            }
            validate_task(&c.task)?;
        }
        TaskKind::Aggregate(agg) => {
            if agg.tasks.is_empty() {
                return Err(invalid(task, "aggregate references no tasks"));
            }
        }
        TaskKind::Signal(s) => {
            if s.signal.id.trim().is_empty() {
                return Err(invalid(task, "signal ID must not be empty"));
            }
        }
        TaskKind::Wait(w) => {
            if w.wait_for.trim().is_empty() {
                return Err(invalid(task, "wait_for must not be empty"));
            }
        }
        TaskKind::Composite(c) => {
            if c.tasks.is_empty() {
                return Err(invalid(task, "composite task has no members"));
            }
            let members: HashSet<&str> = c.tasks.iter().map(|t| t.id.as_str()).collect();
            for member in &c.tasks {
                validate_task(member)?;
                check_member_aggregate(member, &members)?;
                if let TaskKind::Router(router) = &member.kind {
                    for target in router.routes.values() {
                        if !members.contains(target.as_str()) {
                            return Err(DagValidationError::MissingReference {
                                task: member.id.clone(),
                                reference: target.clone(),
                            });
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// A nested aggregate may only reference members of its own parent
fn check_member_aggregate(member: &TaskConfig, members: &HashSet<&str>) -> Result<(), DagValidationError> {
    if let TaskKind::Aggregate(agg) = &member.kind {
        for dep in &agg.tasks {
            if dep == &member.id || !members.contains(dep.as_str()) {
                return Err(DagValidationError::MissingReference {
                    task: member.id.clone(),
                    reference: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{
        AggregateStrategy, AggregateTask, CompositeTask, ParallelStrategy, ParallelTask, RouterTask,
    };
    use std::collections::BTreeMap;

    fn linear() -> WorkflowConfig {
        WorkflowConfig::new("wf")
            .with_task(TaskConfig::agent("t1", "a", "run").on_success("t2").on_error("handle"))
            .with_task(TaskConfig::agent("t2", "a", "run").with_final())
            .with_task(TaskConfig::agent("handle", "a", "run").with_final())
    }

    #[test]
    fn test_valid_graph() {
        let graph = TransitionGraph::build(&linear()).unwrap();
        assert!(graph.unreachable_from("t1").is_empty());
        assert_eq!(
            graph.successors("t1"),
            vec![("handle".to_string(), Edge::Error), ("t2".to_string(), Edge::Success)]
        );
    }

    #[test]
    fn test_empty_workflow_rejected() {
        assert!(matches!(
            TransitionGraph::build(&WorkflowConfig::new("wf")),
            Err(DagValidationError::EmptyWorkflow)
        ));
    }

    #[test]
    fn test_dangling_transition_rejected() {
        let wf = WorkflowConfig::new("wf")
            .with_task(TaskConfig::agent("t1", "a", "run").on_success("ghost"));
        let err = TransitionGraph::build(&wf).unwrap_err();
        assert!(matches!(err, DagValidationError::MissingReference { ref reference, .. } if reference == "ghost"));
    }

    #[test]
    fn test_duplicate_ids_across_nesting() {
        let parallel = TaskConfig::new(
            "fan",
            TaskKind::Parallel(ParallelTask {
                strategy: ParallelStrategy::WaitAll,
                max_workers: 0,
                tasks: vec![TaskConfig::tool("t1", "x")],
            }),
        );
        let wf = WorkflowConfig::new("wf")
            .with_task(TaskConfig::tool("t1", "x").on_success("fan"))
            .with_task(parallel);
        assert!(matches!(
            TransitionGraph::build(&wf),
            Err(DagValidationError::DuplicateTaskId(ref id)) if id == "t1"
        ));
    }

    #[test]
    fn test_router_and_aggregate_references() {
        let mut routes = BTreeMap::new();
        routes.insert("yes".to_string(), "merge".to_string());
        let router = TaskConfig::new(
            "route",
            TaskKind::Router(RouterTask {
                condition: "{{ .input.ok }}".into(),
                routes,
            }),
        );
        let merge = TaskConfig::new(
            "merge",
            TaskKind::Aggregate(AggregateTask {
                strategy: AggregateStrategy::Merge,
                tasks: vec!["missing".into()],
            }),
        );
        let wf = WorkflowConfig::new("wf").with_task(router).with_task(merge);
        assert!(matches!(
            TransitionGraph::build(&wf),
            Err(DagValidationError::MissingReference { ref task, .. }) if task == "merge"
        ));
    }

    #[test]
    fn test_composite_aggregate_scoped_to_members() {
        let merge = |deps: &[&str]| {
            TaskConfig::new(
                "merge",
                TaskKind::Aggregate(AggregateTask {
                    strategy: AggregateStrategy::Merge,
                    tasks: deps.iter().map(|d| d.to_string()).collect(),
                }),
            )
        };
        let composite = |deps: &[&str]| {
            TaskConfig::new(
                "steps",
                TaskKind::Composite(CompositeTask {
                    tasks: vec![
                        TaskConfig::agent("a", "x", "run"),
                        TaskConfig::agent("b", "x", "run"),
                        merge(deps),
                    ],
                }),
            )
        };

        let ok = WorkflowConfig::new("wf")
            .with_task(TaskConfig::agent("outside", "x", "run").on_success("steps"))
            .with_task(composite(&["a", "b"]));
        assert!(TransitionGraph::build(&ok).is_ok());

        let leaking = WorkflowConfig::new("wf")
            .with_task(TaskConfig::agent("outside", "x", "run").on_success("steps"))
            .with_task(composite(&["a", "outside"]));
        assert!(matches!(
            TransitionGraph::build(&leaking),
            Err(DagValidationError::MissingReference { ref reference, .. }) if reference == "outside"
        ));
    }

    #[test]
    fn test_unreachable_tasks_reported() {
        let wf = WorkflowConfig::new("wf")
            .with_task(TaskConfig::agent("t1", "a", "run").with_final())
            .with_task(TaskConfig::agent("orphan", "a", "run"));
        let graph = TransitionGraph::build(&wf).unwrap();
        assert_eq!(graph.unreachable_from("t1"), vec!["orphan".to_string()]);
    }
}
