//! Workflow scheduling
//!
//! Cron schedules evaluated in an IANA timezone. The scheduler polls for
//! due schedules and hands each fire to the execution processor, which
//! starts the workflow with retry.

use crate::dag::DagValidationError;
use crate::definition::{OverlapPolicy, ScheduleConfig, WorkflowConfig};
use crate::{Result, WorkflowError};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};
use weft_core::Payload;
use weft_infra::{retry_with, RetryPolicy};

const MAX_SCHEDULE_ATTEMPTS: u32 = 100;

/// Starts executions on behalf of the scheduler and signal triggers
#[async_trait]
pub trait WorkflowLauncher: Send + Sync {
    /// Start an execution; returns its execution ID
    async fn launch(&self, workflow_id: &str, input: Payload) -> Result<String>;

    /// Whether an execution has not reached a terminal status yet
    async fn is_unfinished(&self, workflow_exec_id: &str) -> Result<bool>;
}

/// A parsed cron expression bound to a timezone
#[derive(Debug, Clone)]
pub struct CronSchedule {
    schedule: cron::Schedule,
    timezone: Tz,
}

impl CronSchedule {
    /// Parse a 5-field expression (or an `@hourly`-style alias); a 6/7-field
    /// expression with seconds is accepted as is.
    pub fn parse(expression: &str, timezone: Option<&str>) -> std::result::Result<Self, String> {
        let normalized = normalize_cron(expression)?;
        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|e| format!("invalid cron expression {:?}: {}", expression, e))?;
        let timezone = match timezone {
            Some(name) => name
                .parse::<Tz>()
                .map_err(|e| format!("unknown timezone {:?}: {}", name, e))?,
            None => Tz::UTC,
        };
        Ok(Self { schedule, timezone })
    }

    /// First fire time strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.timezone))
            .next()
            .map(|t| t.with_timezone(&Utc))
    }
}

fn normalize_cron(expression: &str) -> std::result::Result<String, String> {
    let trimmed = expression.trim();
    let aliased = match trimmed {
        "@yearly" | "@annually" => Some("0 0 1 1 *"),
        "@monthly" => Some("0 0 1 * *"),
        "@weekly" => Some("0 0 * * 0"),
        "@daily" | "@midnight" => Some("0 0 * * *"),
        "@hourly" => Some("0 * * * *"),
        _ => None,
    };
    let expression = aliased.unwrap_or(trimmed);

    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!(
            "0 {} {} {} {} {}",
            fields[0],
            fields[1],
            fields[2],
            fields[3],
            weekday_field(fields[4])
        )),
        6 | 7 => Ok(expression.to_string()),
        n => Err(format!("cron expression {:?} has {} fields", expression, n)),
    }
}

/// Classic cron counts weekdays from Sunday = 0; use names so the meaning
/// does not depend on the parser's numbering.
fn weekday_field(field: &str) -> String {
    field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (part, None),
            };
            let range = match range.split_once('-') {
                Some((from, "7")) if step.is_none() && from != "0" && from != "7" => {
                    format!("{}-SAT,SUN", weekday_name(from))
                }
                Some((from, to)) => format!("{}-{}", weekday_name(from), weekday_name(to)),
                None => weekday_name(range).to_string(),
            };
            match step {
                Some(step) => format!("{}/{}", range, step),
                None => range,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn weekday_name(token: &str) -> &str {
    match token {
        "0" | "7" => "SUN",
        "1" => "MON",
        "2" => "TUE",
        "3" => "WED",
        "4" => "THU",
        "5" => "FRI",
        "6" => "SAT",
        other => other,
    }
}

/// Structural checks run when a workflow with a schedule is registered
pub fn validate_schedule(schedule: &ScheduleConfig) -> std::result::Result<(), DagValidationError> {
    CronSchedule::parse(&schedule.cron, schedule.timezone.as_deref())
        .map_err(DagValidationError::InvalidSchedule)?;

    let retry = &schedule.retry;
    if retry.max_attempts == 0 || retry.max_attempts > MAX_SCHEDULE_ATTEMPTS {
        return Err(DagValidationError::InvalidSchedule(format!(
            "retry.max_attempts must be between 1 and {}, got {}",
            MAX_SCHEDULE_ATTEMPTS, retry.max_attempts
        )));
    }
    if retry.backoff_secs == 0 {
        return Err(DagValidationError::InvalidSchedule(
            "retry.backoff_secs must be positive".into(),
        ));
    }
    if let (Some(start), Some(end)) = (schedule.start_at, schedule.end_at) {
        if start >= end {
            return Err(DagValidationError::InvalidSchedule(
                "start_at must be before end_at".into(),
            ));
        }
    }
    Ok(())
}

/// A schedule together with its runtime bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub config: ScheduleConfig,
    pub created_at: DateTime<Utc>,
    /// Last time the schedule fired
    pub last_run: Option<DateTime<Utc>>,
    /// Next fire time; `None` once the window has closed
    pub next_run: Option<DateTime<Utc>>,
    /// Execution started by the last successful fire
    pub last_exec_id: Option<String>,
    /// Error of the last fire whose start attempts were exhausted
    pub last_error: Option<String>,
}

impl ScheduleRecord {
    pub fn new(config: ScheduleConfig) -> Result<Self> {
        validate_schedule(&config)?;
        let mut record = Self {
            config,
            created_at: Utc::now(),
            last_run: None,
            next_run: None,
            last_exec_id: None,
            last_error: None,
        };
        record.update_next_run(Utc::now());
        Ok(record)
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Next fire strictly after `after`, inside `[start_at, end_at]`
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let cron = CronSchedule::parse(&self.config.cron, self.config.timezone.as_deref()).ok()?;
        let from = match self.config.start_at {
            Some(start) if start > after => start - ChronoDuration::milliseconds(1),
            _ => after,
        };
        let next = cron.next_after(from)?;
        match self.config.end_at {
            Some(end) if next > end => None,
            _ => Some(next),
        }
    }

    /// Recompute the next fire from `now`; missed fires are not back-filled
    pub fn update_next_run(&mut self, now: DateTime<Utc>) {
        self.next_run = self.next_fire(now);
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.config.enabled && self.next_run.map(|t| t <= now).unwrap_or(false)
    }
}

/// Schedule repository trait
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn save(&self, record: &ScheduleRecord) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<ScheduleRecord>>;
    async fn list(&self) -> Result<Vec<ScheduleRecord>>;
    async fn list_by_workflow(&self, workflow_id: &str) -> Result<Vec<ScheduleRecord>>;
    async fn list_due(&self, until: DateTime<Utc>) -> Result<Vec<ScheduleRecord>>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn update(&self, record: &ScheduleRecord) -> Result<()>;
}

/// In-memory schedule repository
pub struct InMemoryScheduleRepository {
    schedules: RwLock<HashMap<String, ScheduleRecord>>,
}

impl InMemoryScheduleRepository {
    pub fn new() -> Self {
        Self {
            schedules: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryScheduleRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScheduleRepository for InMemoryScheduleRepository {
    async fn save(&self, record: &ScheduleRecord) -> Result<()> {
        let mut schedules = self.schedules.write().await;
        schedules.insert(record.id().to_string(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ScheduleRecord>> {
        let schedules = self.schedules.read().await;
        Ok(schedules.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<ScheduleRecord>> {
        let schedules = self.schedules.read().await;
        let mut all: Vec<_> = schedules.values().cloned().collect();
        all.sort_by(|a, b| a.config.id.cmp(&b.config.id));
        Ok(all)
    }

    async fn list_by_workflow(&self, workflow_id: &str) -> Result<Vec<ScheduleRecord>> {
        let schedules = self.schedules.read().await;
        Ok(schedules
            .values()
            .filter(|s| s.config.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn list_due(&self, until: DateTime<Utc>) -> Result<Vec<ScheduleRecord>> {
        let schedules = self.schedules.read().await;
        let mut due: Vec<_> = schedules
            .values()
            .filter(|s| s.is_due(until))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_run);
        Ok(due)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut schedules = self.schedules.write().await;
        schedules.remove(id);
        Ok(())
    }

    async fn update(&self, record: &ScheduleRecord) -> Result<()> {
        let mut schedules = self.schedules.write().await;
        if schedules.contains_key(record.id()) {
            schedules.insert(record.id().to_string(), record.clone());
            Ok(())
        } else {
            Err(WorkflowError::NotFound(record.id().to_string()))
        }
    }
}

/// Execution request sent to the processor
#[derive(Debug, Clone)]
pub struct ScheduledExecution {
    pub schedule_id: String,
    pub workflow_id: String,
    pub input: Payload,
    pub scheduled_time: DateTime<Utc>,
}

/// Workflow scheduler service
pub struct WorkflowScheduler {
    repository: Arc<dyn ScheduleRepository>,
    execution_sender: mpsc::Sender<ScheduledExecution>,
    poll_interval: Duration,
    running: Arc<RwLock<bool>>,
}

impl WorkflowScheduler {
    pub fn new(
        repository: Arc<dyn ScheduleRepository>,
        execution_sender: mpsc::Sender<ScheduledExecution>,
    ) -> Self {
        Self {
            repository,
            execution_sender,
            poll_interval: Duration::from_secs(1),
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(10));
        self
    }

    /// Create a new schedule
    pub async fn create(&self, config: ScheduleConfig) -> Result<ScheduleRecord> {
        let record = ScheduleRecord::new(config)?;
        self.repository.save(&record).await?;

        info!(
            schedule_id = %record.id(),
            workflow_id = %record.config.workflow_id,
            next = ?record.next_run,
            enabled = record.config.enabled,
            "Created workflow schedule"
        );

        Ok(record)
    }

    /// Register the schedule embedded in a workflow, if any
    pub async fn register_workflow(&self, workflow: &WorkflowConfig) -> Result<Option<ScheduleRecord>> {
        let Some(mut config) = workflow.schedule.clone() else {
            return Ok(None);
        };
        if config.id.is_empty() {
            config.id = workflow.id.clone();
        }
        if config.workflow_id.is_empty() {
            config.workflow_id = workflow.id.clone();
        }
        self.create(config).await.map(Some)
    }

    pub async fn get(&self, id: &str) -> Result<Option<ScheduleRecord>> {
        self.repository.get(id).await
    }

    pub async fn list(&self) -> Result<Vec<ScheduleRecord>> {
        self.repository.list().await
    }

    /// Enable a schedule; the next fire is computed from now
    pub async fn enable(&self, id: &str) -> Result<()> {
        if let Some(mut record) = self.repository.get(id).await? {
            record.config.enabled = true;
            record.update_next_run(Utc::now());
            self.repository.update(&record).await?;

            info!(schedule_id = %id, next = ?record.next_run, "Enabled schedule");
            Ok(())
        } else {
            Err(WorkflowError::NotFound(id.to_string()))
        }
    }

    /// Disable a schedule
    pub async fn disable(&self, id: &str) -> Result<()> {
        if let Some(mut record) = self.repository.get(id).await? {
            record.config.enabled = false;
            self.repository.update(&record).await?;

            info!(schedule_id = %id, "Disabled schedule");
            Ok(())
        } else {
            Err(WorkflowError::NotFound(id.to_string()))
        }
    }

    /// Delete a schedule
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.repository.delete(id).await?;
        info!(schedule_id = %id, "Deleted schedule");
        Ok(())
    }

    /// Start the scheduler loop
    pub async fn start(&self) {
        {
            let mut running = self.running.write().await;
            if *running {
                warn!("Scheduler already running");
                return;
            }
            *running = true;
        }

        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Starting workflow scheduler"
        );

        let start = Instant::now() + self.poll_interval;
        let mut interval = interval_at(start, self.poll_interval);

        loop {
            interval.tick().await;

            let running = *self.running.read().await;
            if !running {
                break;
            }

            if let Err(e) = self.tick(Utc::now()).await {
                error!(error = %e, "Error checking schedules");
            }
        }

        info!("Workflow scheduler stopped");
    }

    /// Stop the scheduler
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        info!("Stopping workflow scheduler");
    }

    /// Fire every schedule due at `now`; returns how many fired
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.repository.list_due(now).await?;
        debug!(count = due.len(), "Checking due schedules");

        let mut fired = 0;
        for record in due {
            let execution = ScheduledExecution {
                schedule_id: record.id().to_string(),
                workflow_id: record.config.workflow_id.clone(),
                input: record.config.input.clone(),
                scheduled_time: record.next_run.unwrap_or(now),
            };

            if let Err(e) = self.execution_sender.send(execution).await {
                error!(
                    schedule_id = %record.id(),
                    error = %e,
                    "Failed to send execution request"
                );
                continue;
            }
            fired += 1;

            let mut updated = record.clone();
            updated.last_run = Some(now);
            updated.update_next_run(now);

            if let Err(e) = self.repository.update(&updated).await {
                error!(
                    schedule_id = %record.id(),
                    error = %e,
                    "Failed to update schedule"
                );
            }

            info!(
                schedule_id = %record.id(),
                workflow_id = %record.config.workflow_id,
                next = ?updated.next_run,
                "Triggered scheduled workflow"
            );
        }

        Ok(fired)
    }
}

/// Scheduled execution processor.
///
/// Each fire is started on its own task so one schedule's retry backoff
/// never delays another. A fire arriving while the same schedule's previous
/// dispatch is still retrying is dropped rather than queued.
pub struct ScheduledExecutionProcessor {
    receiver: mpsc::Receiver<ScheduledExecution>,
    dispatch: Arc<ScheduleDispatch>,
}

struct ScheduleDispatch {
    launcher: Arc<dyn WorkflowLauncher>,
    repository: Arc<dyn ScheduleRepository>,
    in_flight: DashSet<String>,
}

impl ScheduledExecutionProcessor {
    pub fn new(
        receiver: mpsc::Receiver<ScheduledExecution>,
        launcher: Arc<dyn WorkflowLauncher>,
        repository: Arc<dyn ScheduleRepository>,
    ) -> Self {
        Self {
            receiver,
            dispatch: Arc::new(ScheduleDispatch {
                launcher,
                repository,
                in_flight: DashSet::new(),
            }),
        }
    }

    /// Run the processor
    pub async fn run(mut self) {
        info!("Starting scheduled execution processor");

        while let Some(execution) = self.receiver.recv().await {
            let dispatch = self.dispatch.clone();
            tokio::spawn(async move {
                dispatch.process(execution).await;
            });
        }

        info!("Scheduled execution processor stopped");
    }

    /// Start one scheduled execution; returns its execution ID when started
    pub async fn process(&self, execution: ScheduledExecution) -> Option<String> {
        self.dispatch.process(execution).await
    }
}

impl ScheduleDispatch {
    async fn process(&self, execution: ScheduledExecution) -> Option<String> {
        if !self.in_flight.insert(execution.schedule_id.clone()) {
            warn!(
                schedule_id = %execution.schedule_id,
                scheduled_time = %execution.scheduled_time,
                "Previous dispatch still retrying; dropping tick"
            );
            return None;
        }
        let started = self.start(&execution).await;
        self.in_flight.remove(&execution.schedule_id);
        started
    }

    async fn start(&self, execution: &ScheduledExecution) -> Option<String> {
        let record = match self.repository.get(&execution.schedule_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(schedule_id = %execution.schedule_id, "Schedule vanished before it ran");
                return None;
            }
            Err(e) => {
                error!(schedule_id = %execution.schedule_id, error = %e, "Failed to load schedule");
                return None;
            }
        };

        if record.config.overlap_policy == OverlapPolicy::Skip {
            if let Some(previous) = &record.last_exec_id {
                match self.launcher.is_unfinished(previous).await {
                    Ok(true) => {
                        info!(
                            schedule_id = %execution.schedule_id,
                            previous_exec_id = %previous,
                            "Previous run still active; skipping tick"
                        );
                        return None;
                    }
                    Ok(false) => {}
                    Err(e) => debug!(previous_exec_id = %previous, error = %e, "Previous run not found"),
                }
            }
        }

        info!(
            schedule_id = %execution.schedule_id,
            workflow_id = %execution.workflow_id,
            scheduled_time = %execution.scheduled_time,
            "Processing scheduled execution"
        );

        let retry = &record.config.retry;
        let policy = RetryPolicy::fixed(retry.max_attempts, Duration::from_secs(retry.backoff_secs));
        let launched = retry_with(
            &policy,
            "scheduled_start",
            || self.launcher.launch(&execution.workflow_id, execution.input.clone()),
            |e: &WorkflowError| !matches!(e, WorkflowError::NotFound(_)),
        )
        .await;

        let mut updated = record.clone();
        let started = match launched {
            Ok(exec_id) => {
                info!(
                    schedule_id = %execution.schedule_id,
                    workflow_exec_id = %exec_id,
                    "Started scheduled workflow"
                );
                updated.last_exec_id = Some(exec_id.clone());
                updated.last_error = None;
                Some(exec_id)
            }
            Err(e) => {
                error!(
                    schedule_id = %execution.schedule_id,
                    attempts = retry.max_attempts,
                    error = %e,
                    "Failed to start scheduled workflow"
                );
                updated.last_error = Some(e.to_string());
                None
            }
        };

        // Keep the scheduler's bookkeeping; only the run outcome is ours
        if let Ok(Some(mut current)) = self.repository.get(&execution.schedule_id).await {
            current.last_exec_id = updated.last_exec_id;
            current.last_error = updated.last_error;
            if let Err(e) = self.repository.update(&current).await {
                error!(schedule_id = %execution.schedule_id, error = %e, "Failed to update schedule");
            }
        }
        started
    }
}
