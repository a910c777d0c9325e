//! Workflow, task, schedule and trigger configuration documents.
//!
//! These are produced already validated by the configuration layer; the
//! engine only runs a structural check on registration (see `dag`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use weft_core::{ComponentType, ExecutionType, Payload};

/// Workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub tasks: Vec<TaskConfig>,
    /// Output templates resolved against the final execution scope
    #[serde(default)]
    pub outputs: Option<Payload>,
    #[serde(default)]
    pub schedule: Option<ScheduleConfig>,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
}

impl WorkflowConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            tasks: Vec::new(),
            outputs: None,
            schedule: None,
            triggers: Vec::new(),
        }
    }

    pub fn with_task(mut self, task: TaskConfig) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_outputs(mut self, outputs: Payload) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn with_schedule(mut self, schedule: ScheduleConfig) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerConfig) -> Self {
        self.triggers.push(trigger);
        self
    }

    /// Top-level task by ID
    pub fn task(&self, id: &str) -> Option<&TaskConfig> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// The first declared task starts every execution unless told otherwise
    pub fn initial_task(&self) -> Option<&TaskConfig> {
        self.tasks.first()
    }

    /// Declaration index of a top-level task
    pub fn position(&self, id: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.id == id)
    }
}

/// Outcome-specific transition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransitionConfig {
    pub next: Option<String>,
}

impl TransitionConfig {
    pub fn to(next: impl Into<String>) -> Self {
        Self {
            next: Some(next.into()),
        }
    }
}

/// A single task node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id: String,
    #[serde(flatten)]
    pub kind: TaskKind,
    /// Ends the workflow on success without consulting transitions
    #[serde(default, rename = "final")]
    pub is_final: bool,
    /// Input templates
    #[serde(default)]
    pub with: Option<Payload>,
    /// Output templates applied to the raw result
    #[serde(default)]
    pub outputs: Option<Payload>,
    #[serde(default)]
    pub on_success: Option<TransitionConfig>,
    #[serde(default)]
    pub on_error: Option<TransitionConfig>,
    /// Execution deadline; for wait tasks this is the signal deadline
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl TaskConfig {
    pub fn new(id: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            id: id.into(),
            kind,
            is_final: false,
            with: None,
            outputs: None,
            on_success: None,
            on_error: None,
            timeout_secs: None,
        }
    }

    pub fn agent(id: impl Into<String>, agent: impl Into<String>, action: impl Into<String>) -> Self {
        Self::new(
            id,
            TaskKind::Basic(BasicTask {
                agent: Some(agent.into()),
                tool: None,
                action: Some(action.into()),
            }),
        )
    }

    pub fn tool(id: impl Into<String>, tool: impl Into<String>) -> Self {
        Self::new(
            id,
            TaskKind::Basic(BasicTask {
                agent: None,
                tool: Some(tool.into()),
                action: None,
            }),
        )
    }

    pub fn with_final(mut self) -> Self {
        self.is_final = true;
        self
    }

    pub fn with_input(mut self, with: Payload) -> Self {
        self.with = Some(with);
        self
    }

    pub fn with_outputs(mut self, outputs: Payload) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn on_success(mut self, next: impl Into<String>) -> Self {
        self.on_success = Some(TransitionConfig::to(next));
        self
    }

    pub fn on_error(mut self, next: impl Into<String>) -> Self {
        self.on_error = Some(TransitionConfig::to(next));
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn execution_type(&self) -> ExecutionType {
        self.kind.execution_type()
    }

    pub fn component(&self) -> ComponentType {
        self.kind.component()
    }

    pub fn success_next(&self) -> Option<&str> {
        self.on_success.as_ref().and_then(|t| t.next.as_deref())
    }

    pub fn error_next(&self) -> Option<&str> {
        self.on_error.as_ref().and_then(|t| t.next.as_deref())
    }
}

/// Type-specific task configuration, tagged by `type`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    Basic(BasicTask),
    Router(RouterTask),
    Parallel(ParallelTask),
    Collection(CollectionTask),
    Aggregate(AggregateTask),
    Signal(SignalTask),
    Wait(WaitTask),
    Composite(CompositeTask),
}

impl TaskKind {
    pub fn execution_type(&self) -> ExecutionType {
        match self {
            TaskKind::Basic(_) => ExecutionType::Basic,
            TaskKind::Router(_) => ExecutionType::Router,
            TaskKind::Parallel(_) => ExecutionType::Parallel,
            TaskKind::Collection(_) => ExecutionType::Collection,
            TaskKind::Aggregate(_) => ExecutionType::Aggregate,
            TaskKind::Signal(_) => ExecutionType::Signal,
            TaskKind::Wait(_) => ExecutionType::Wait,
            TaskKind::Composite(_) => ExecutionType::Composite,
        }
    }

    pub fn component(&self) -> ComponentType {
        match self {
            TaskKind::Basic(b) if b.tool.is_some() => ComponentType::Tool,
            TaskKind::Basic(_) => ComponentType::Agent,
            TaskKind::Router(_) => ComponentType::Router,
            TaskKind::Parallel(_) => ComponentType::Parallel,
            TaskKind::Collection(_) => ComponentType::Collection,
            TaskKind::Aggregate(_) => ComponentType::Aggregate,
            TaskKind::Signal(_) => ComponentType::Signal,
            TaskKind::Wait(_) => ComponentType::Wait,
            TaskKind::Composite(_) => ComponentType::Composite,
        }
    }
}

/// Direct agent or tool invocation
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BasicTask {
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
}

/// Reference handed to the executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ComponentRef {
    Agent(String),
    Tool(String),
}

impl ComponentRef {
    pub fn id(&self) -> &str {
        match self {
            ComponentRef::Agent(id) | ComponentRef::Tool(id) => id,
        }
    }
}

impl BasicTask {
    pub fn target(&self) -> Option<ComponentRef> {
        match (&self.agent, &self.tool) {
            (Some(agent), _) => Some(ComponentRef::Agent(agent.clone())),
            (None, Some(tool)) => Some(ComponentRef::Tool(tool.clone())),
            (None, None) => None,
        }
    }
}

/// Picks exactly one next task from `routes` by the condition's value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterTask {
    pub condition: String,
    pub routes: BTreeMap<String, String>,
}

pub const DEFAULT_ROUTE: &str = "default";

/// How a parent settles from its children's outcomes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParallelStrategy {
    #[default]
    WaitAll,
    FailFast,
    BestEffort,
    #[serde(alias = "wait_any")]
    Race,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelTask {
    #[serde(default)]
    pub strategy: ParallelStrategy,
    /// 0 means no limit
    #[serde(default)]
    pub max_workers: usize,
    pub tasks: Vec<TaskConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CollectionMode {
    #[default]
    Parallel,
    Sequential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionTask {
    /// Array literal or a template resolving to an array
    pub items: Value,
    /// Template evaluated per item; falsy items are skipped
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default = "default_item_var")]
    pub item_var: String,
    #[serde(default = "default_index_var")]
    pub index_var: String,
    #[serde(default)]
    pub mode: CollectionMode,
    /// Items dispatched per group; 0 dispatches all at once
    #[serde(default)]
    pub batch: usize,
    #[serde(default)]
    pub strategy: ParallelStrategy,
    #[serde(default)]
    pub max_workers: usize,
    pub task: Box<TaskConfig>,
}

fn default_item_var() -> String {
    "item".to_string()
}

fn default_index_var() -> String {
    "index".to_string()
}

impl CollectionTask {
    /// Deterministic ID of the child generated for item `index`
    pub fn child_id(&self, index: usize) -> String {
        format!("{}#{}", self.task.id, index)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStrategy {
    #[default]
    Merge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateTask {
    #[serde(default)]
    pub strategy: AggregateStrategy,
    /// Sibling task IDs in merge order
    pub tasks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    pub id: String,
    #[serde(default)]
    pub payload: Option<Payload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalTask {
    pub signal: SignalConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitTask {
    /// Signal channel key
    pub wait_for: String,
    /// Payloads failing this condition are ignored
    #[serde(default)]
    pub condition: Option<String>,
    /// Next task when the deadline passes
    #[serde(default)]
    pub on_timeout: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeTask {
    pub tasks: Vec<TaskConfig>,
}

/// Retry applied when a scheduled start itself fails
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleRetry {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
}

impl Default for ScheduleRetry {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
        }
    }
}

fn default_max_attempts() -> u32 {
    1
}

fn default_backoff_secs() -> u64 {
    1
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    #[default]
    Skip,
    Allow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Defaults to the workflow ID when embedded in a workflow
    #[serde(default)]
    pub id: String,
    /// Defaults to the owning workflow when embedded
    #[serde(default)]
    pub workflow_id: String,
    pub cron: String,
    /// IANA timezone name, UTC when absent
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub input: Payload,
    #[serde(default)]
    pub retry: ScheduleRetry,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub overlap_policy: OverlapPolicy,
}

fn default_enabled() -> bool {
    true
}

impl ScheduleConfig {
    pub fn new(
        id: impl Into<String>,
        workflow_id: impl Into<String>,
        cron: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            workflow_id: workflow_id.into(),
            cron: cron.into(),
            timezone: None,
            input: Payload::new(),
            retry: ScheduleRetry::default(),
            enabled: true,
            start_at: None,
            end_at: None,
            overlap_policy: OverlapPolicy::Skip,
        }
    }

    pub fn with_input(mut self, input: Payload) -> Self {
        self.input = input;
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff_secs: u64) -> Self {
        self.retry = ScheduleRetry {
            max_attempts,
            backoff_secs,
        };
        self
    }

    pub fn with_timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = Some(tz.into());
        self
    }

    pub fn with_overlap(mut self, policy: OverlapPolicy) -> Self {
        self.overlap_policy = policy;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Event sources that start executions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    Signal { name: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
id: review
outputs:
  verdict: "{{ .tasks.decide.output.route }}"
tasks:
  - id: draft
    type: basic
    agent: writer
    action: draft
    with:
      topic: "{{ .workflow.input.topic }}"
    on_success: { next: fan }
    on_error: { next: apologize }
  - id: fan
    type: parallel
    strategy: fail_fast
    tasks:
      - { id: lint, type: basic, tool: linter }
      - { id: score, type: basic, agent: critic, action: score }
    on_success: { next: decide }
  - id: decide
    type: router
    condition: "{{ .tasks.fan.output.score.grade }}"
    routes: { A: publish, default: apologize }
  - id: publish
    type: wait
    wait_for: approved
    timeout_secs: 10
    on_timeout: apologize
    final: true
  - id: apologize
    type: signal
    signal: { id: sorry, payload: { reason: late } }
    final: true
schedule:
  cron: "0 9 * * 1-5"
  timezone: Europe/Lisbon
  retry: { max_attempts: 3, backoff_secs: 30 }
triggers:
  - { type: signal, name: review-requested }
"#;

    #[test]
    fn test_parse_workflow_document() {
        let wf: WorkflowConfig = serde_yaml::from_str(DOC).unwrap();

        assert_eq!(wf.id, "review");
        assert_eq!(wf.tasks.len(), 5);
        assert_eq!(wf.initial_task().unwrap().id, "draft");

        let draft = wf.task("draft").unwrap();
        assert_eq!(draft.execution_type(), ExecutionType::Basic);
        assert_eq!(draft.component(), ComponentType::Agent);
        assert_eq!(draft.success_next(), Some("fan"));
        assert_eq!(draft.error_next(), Some("apologize"));

        match &wf.task("fan").unwrap().kind {
            TaskKind::Parallel(p) => {
                assert_eq!(p.strategy, ParallelStrategy::FailFast);
                assert_eq!(p.tasks[0].component(), ComponentType::Tool);
            }
            other => panic!("unexpected kind {:?}", other),
        }

        let publish = wf.task("publish").unwrap();
        assert!(publish.is_final);
        assert_eq!(publish.timeout_secs, Some(10));

        let schedule = wf.schedule.unwrap();
        assert!(schedule.enabled);
        assert_eq!(schedule.retry.max_attempts, 3);
        assert_eq!(schedule.overlap_policy, OverlapPolicy::Skip);
        assert_eq!(wf.triggers[0], TriggerConfig::Signal { name: "review-requested".into() });
    }

    #[test]
    fn test_collection_defaults_and_child_ids() {
        let task: TaskConfig = serde_json::from_value(serde_json::json!({
            "id": "each",
            "type": "collection",
            "items": "{{ .workflow.input.cities }}",
            "task": { "id": "weather", "type": "basic", "tool": "forecast" }
        }))
        .unwrap();

        let TaskKind::Collection(c) = task.kind else {
            panic!("expected collection");
        };
        assert_eq!(c.item_var, "item");
        assert_eq!(c.index_var, "index");
        assert_eq!(c.mode, CollectionMode::Parallel);
        assert_eq!(c.child_id(2), "weather#2");
    }

    #[test]
    fn test_wait_any_alias() {
        let s: ParallelStrategy = serde_json::from_value(serde_json::json!("wait_any")).unwrap();
        assert_eq!(s, ParallelStrategy::Race);
    }
}
