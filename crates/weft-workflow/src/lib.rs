//! Workflow orchestration engine
//!
//! This crate drives declarative workflows to completion:
//! - Workflow and task configuration documents with registration-time checks
//! - A per-execution dispatch loop persisting every step to a `StateStore`
//! - Parallel, collection and composite fan-out with pluggable strategies
//! - Signal broadcast, wait tasks and pause/resume/cancel control
//! - Cron schedules and signal-driven triggers
//! - Crash recovery from the persisted continuation

pub mod aggregator;
pub mod context;
pub mod coordinator;
pub mod dag;
pub mod definition;
pub mod dispatcher;
pub mod engine;
pub mod executor;
pub mod scheduling;
pub mod signals;
pub mod template;
pub mod transition;
pub mod triggers;

pub use coordinator::aggregate_status;
pub use dag::{DagValidationError, TransitionGraph};
pub use definition::{
    AggregateStrategy, AggregateTask, BasicTask, CollectionMode, CollectionTask, ComponentRef,
    CompositeTask, OverlapPolicy, ParallelStrategy, ParallelTask, RouterTask, ScheduleConfig,
    ScheduleRetry, SignalConfig, SignalTask, TaskConfig, TaskKind, TransitionConfig, TriggerConfig,
    WaitTask, WorkflowConfig,
};
pub use dispatcher::{Dispatcher, Outcome};
pub use engine::{StartRequest, WorkflowEngine};
pub use executor::{ExecutionRequest, Executor, ExecutorError};
pub use scheduling::{
    InMemoryScheduleRepository, ScheduleRecord, ScheduleRepository, ScheduledExecutionProcessor,
    WorkflowLauncher, WorkflowScheduler,
};
pub use signals::{ControlSignal, Signal, SignalBus, SignalError};
pub use transition::Transition;
pub use triggers::TriggerManager;

use thiserror::Error;
use weft_core::StoreError;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("DAG validation error: {0}")]
    DagValidation(#[from] DagValidationError),

    #[error("Execution already exists: {0}")]
    AlreadyExists(String),

    #[error("Execution not running: {0}")]
    NotRunning(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Signal error: {0}")]
    Signal(#[from] SignalError),

    #[error("Schedule error: {0}")]
    Schedule(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WorkflowError {
    /// Errors worth retrying at the caller (store backend hiccups)
    pub fn is_transient(&self) -> bool {
        matches!(self, WorkflowError::Store(err) if err.is_transient())
    }
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
