// State management for scribe-local
//
// AppState owns every long-lived component. Nothing is global: callers get
// the state from init() and hand it around explicitly.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ScribeConfig;
use crate::database::DatabaseManager;
use crate::jobs::{JobEvent, JobQueueManager, RunnerLock};
use crate::transcription::TranscriptionPipeline;
use crate::worker::{RequestCoordinator, WorkerEngine, WorkerSupervisor};

pub struct AppState {
    config: ScribeConfig,
    database: Arc<DatabaseManager>,
    supervisor: Arc<WorkerSupervisor>,
    coordinator: Arc<RequestCoordinator>,
    queue: Arc<JobQueueManager>,
    /// Present only on the state allowed to run jobs
    runner_lock: Option<RunnerLock>,
    /// Jobs failed at startup because a previous run died mid-job
    recovered_jobs: usize,
}

impl AppState {
    /// Build the component graph without touching persisted jobs. Enough for
    /// inspecting results; another process may be running jobs meanwhile.
    /// The worker is started lazily by the first request.
    pub fn init(config: ScribeConfig) -> Result<(Self, mpsc::UnboundedReceiver<JobEvent>)> {
        Self::build(config, None)
    }

    /// Like `init`, but also claim the work directory's runner lock, fail
    /// jobs a crashed runner left `processing` and restore the pending
    /// backlog. Refused while another runner holds the lock.
    pub fn init_runner(config: ScribeConfig) -> Result<(Self, mpsc::UnboundedReceiver<JobEvent>)> {
        config.validate()?;
        create_work_dir(&config)?;
        let lock = RunnerLock::acquire(&config.work_dir)?;

        let (mut state, events) = Self::build(config, Some(lock))?;

        state.recovered_jobs = state.queue.recover_interrupted()?;
        if state.recovered_jobs > 0 {
            log::warn!(
                "{} job(s) were interrupted by a previous crash and marked failed",
                state.recovered_jobs
            );
        }
        state.queue.restore_backlog()?;

        Ok((state, events))
    }

    fn build(
        config: ScribeConfig,
        runner_lock: Option<RunnerLock>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<JobEvent>)> {
        config.validate()?;

        let database = Arc::new(
            DatabaseManager::new(config.database_path.clone())
                .context("Failed to initialize database")?,
        );

        create_work_dir(&config)?;

        let spec = config.worker_spec()?;
        log::info!("Using worker executable {}", spec.program.display());
        let supervisor = Arc::new(WorkerSupervisor::new(spec));
        let coordinator = Arc::new(RequestCoordinator::new(supervisor.clone()));

        let engine = Arc::new(
            WorkerEngine::new(coordinator.clone(), config.worker_timeouts())
                .with_scratch_dir(config.work_dir.clone()),
        );
        let pipeline = Arc::new(
            TranscriptionPipeline::new(engine, config.chunk_settings(), config.model_selector())
                .with_ffmpeg_path(config.ffmpeg_path.clone()),
        );

        let (queue, events) = JobQueueManager::new(database.clone(), pipeline);

        let state = Self {
            config,
            database,
            supervisor,
            coordinator,
            queue: Arc::new(queue),
            runner_lock,
            recovered_jobs: 0,
        };
        Ok((state, events))
    }

    pub fn config(&self) -> &ScribeConfig {
        &self.config
    }

    pub fn database(&self) -> &Arc<DatabaseManager> {
        &self.database
    }

    pub fn supervisor(&self) -> &Arc<WorkerSupervisor> {
        &self.supervisor
    }

    pub fn coordinator(&self) -> &Arc<RequestCoordinator> {
        &self.coordinator
    }

    pub fn queue(&self) -> &Arc<JobQueueManager> {
        &self.queue
    }

    pub fn recovered_jobs(&self) -> usize {
        self.recovered_jobs
    }

    pub fn is_runner(&self) -> bool {
        self.runner_lock.is_some()
    }

    /// Drain the backlog on a background task
    pub fn spawn_processing(&self) -> JoinHandle<()> {
        let queue = self.queue.clone();
        tokio::spawn(async move {
            if let Err(e) = queue.process_next().await {
                log::error!("Job processing stopped: {:#}", e);
            }
        })
    }

    /// Stop the worker. Any in-flight request is rejected.
    pub async fn shutdown(&self) {
        log::info!("Shutting down");
        self.supervisor.stop().await;
    }
}

fn create_work_dir(config: &ScribeConfig) -> Result<()> {
    std::fs::create_dir_all(&config.work_dir)
        .with_context(|| format!("Failed to create work dir {}", config.work_dir.display()))
}
