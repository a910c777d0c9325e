//! Application state and initialization

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use weft_core::{AppConfig, InMemoryStateStore, StateStore, StoreBackend};
use weft_infra::{create_pool, run_migrations, PgPoolConfig, PgStateStore, RetryPolicy, RetryingStateStore};
use weft_workflow::{
    Executor, InMemoryScheduleRepository, ScheduleRepository, ScheduledExecutionProcessor,
    TriggerManager, WorkflowConfig, WorkflowEngine, WorkflowScheduler,
};

use crate::cli::Args;
use crate::executor::HttpExecutor;
use crate::loader;
use crate::server::Server;

const SCHEDULE_QUEUE_DEPTH: usize = 100;

/// Shared application state handed to every request handler
#[derive(Clone)]
pub struct AppState {
    pub engine: WorkflowEngine,
    pub scheduler: Arc<WorkflowScheduler>,
    pub triggers: Arc<TriggerManager>,
}

impl AppState {
    /// Wire the engine, scheduler and triggers over one store and executor.
    /// Returns the processor that turns schedule fires into executions.
    pub fn new(
        store: Arc<dyn StateStore>,
        executor: Arc<dyn Executor>,
        config: &AppConfig,
    ) -> (Self, ScheduledExecutionProcessor) {
        let engine = WorkflowEngine::new(store, executor).with_config(config.engine.clone());

        let repository: Arc<dyn ScheduleRepository> = Arc::new(InMemoryScheduleRepository::new());
        let (tx, rx) = mpsc::channel(SCHEDULE_QUEUE_DEPTH);
        let scheduler = WorkflowScheduler::new(repository.clone(), tx)
            .with_poll_interval(config.scheduler.poll_interval());
        let processor = ScheduledExecutionProcessor::new(rx, Arc::new(engine.clone()), repository);
        let triggers = TriggerManager::new(Arc::new(engine.clone()));

        let state = Self {
            engine,
            scheduler: Arc::new(scheduler),
            triggers: Arc::new(triggers),
        };
        (state, processor)
    }

    /// Register a workflow with the engine, its schedule and its triggers
    pub async fn install(&self, workflow: WorkflowConfig) -> Result<()> {
        let workflow_id = workflow.id.clone();
        self.engine
            .register(workflow.clone())
            .with_context(|| format!("Workflow {} failed validation", workflow_id))?;
        if let Some(schedule) = self.scheduler.register_workflow(&workflow).await? {
            info!(workflow_id = %workflow_id, next = ?schedule.next_run, "Workflow scheduled");
        }
        self.triggers.register_workflow(&workflow).await;
        Ok(())
    }
}

/// Main application
pub struct App {
    config: AppConfig,
    state: AppState,
    processor: ScheduledExecutionProcessor,
}

impl App {
    /// Build the application with all dependencies
    pub async fn build(args: Args) -> Result<Self> {
        args.validate().context("Invalid command line arguments")?;

        let mut config = match &args.config {
            Some(path) => AppConfig::load_from_file(&path.to_string_lossy())
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
            None => AppConfig::load().context("Failed to load configuration from environment")?,
        };
        if let Some(port) = args.port {
            config.server.port = port;
        }

        let store = build_store(&config).await?;
        let executor = Arc::new(
            HttpExecutor::new(&config.executor).context("Failed to build executor HTTP client")?,
        );
        let (state, processor) = AppState::new(store, executor, &config);

        let workflows = loader::load_dir(&args.workflows)?;
        info!(count = workflows.len(), path = %args.workflows.display(), "Loaded workflow documents");
        for workflow in workflows {
            state.install(workflow).await?;
        }

        if args.no_recover {
            warn!("Recovery disabled; unfinished executions stay detached");
        } else {
            let recovered = state
                .engine
                .recover()
                .await
                .context("Failed to recover unfinished executions")?;
            info!(recovered, "Recovered unfinished executions");
        }

        Ok(Self {
            config,
            state,
            processor,
        })
    }

    /// Run the application until a shutdown signal arrives
    pub async fn run(self) -> Result<()> {
        let scheduler = self.state.scheduler.clone();
        if self.config.scheduler.enabled {
            let poller = scheduler.clone();
            tokio::spawn(async move { poller.start().await });
            tokio::spawn(self.processor.run());
        } else {
            info!("Scheduler disabled by configuration");
        }

        let server = Server::new(self.config.server.clone(), self.state);
        let result = server.run().await;

        scheduler.stop().await;
        result
    }
}

async fn build_store(config: &AppConfig) -> Result<Arc<dyn StateStore>> {
    let inner: Arc<dyn StateStore> = match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using the in-memory state store; executions do not survive a restart");
            Arc::new(InMemoryStateStore::new())
        }
        StoreBackend::Postgres => {
            let pool = create_pool(&PgPoolConfig::from(&config.database))
                .await
                .context("Failed to connect to PostgreSQL")?;
            run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            Arc::new(PgStateStore::new(pool))
        }
    };

    let policy = RetryPolicy::exponential(
        config.engine.infra_retry_attempts,
        config.engine.infra_retry_initial_delay(),
    );
    Ok(Arc::new(RetryingStateStore::new(inner, policy)))
}
