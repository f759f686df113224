// jobs/queue.rs
//
// Durable FIFO of transcription jobs with at most one job active at a time.
//
// The in-memory backlog holds job ids in enqueue order; the store holds the
// authoritative status. Terminal statuses that could not be persisted are
// kept and retried at the start of the next tick; no new job starts while
// one is outstanding, so the store never shows two jobs processing.

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::processor::{JobProcessor, ProgressSink};
use super::store::JobStore;
use super::types::{
    Job, JobConfig, JobEvent, JobOutput, JobStatus, StatusUpdate, CANCELLED_MESSAGE,
    CRASH_RECOVERY_MESSAGE, SUPERSEDED_MESSAGE,
};

/// Retry policy for persisting terminal statuses
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueSettings {
    pub persist_attempts: u32,
    pub persist_backoff: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            persist_attempts: 3,
            persist_backoff: Duration::from_millis(250),
        }
    }
}

/// Result of a `process_next()` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSummary {
    /// Another call owns the processing loop; nothing was done
    AlreadyRunning,
    /// The backlog was drained
    Finished { processed: usize },
}

#[derive(Debug, Clone)]
enum TerminalOutcome {
    Completed(JobOutput),
    Failed(String),
    Cancelled,
}

struct ActiveJob {
    job_id: String,
    cancel: CancellationToken,
    cancel_requested: bool,
}

/// Clears the loop flag however the loop ends
struct LoopGuard<'a>(&'a AtomicBool);

impl<'a> LoopGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct JobQueueManager {
    store: Arc<dyn JobStore>,
    processor: Arc<dyn JobProcessor>,
    settings: QueueSettings,
    backlog: Mutex<VecDeque<String>>,
    active: Mutex<Option<ActiveJob>>,
    running: AtomicBool,
    paused: AtomicBool,
    unpersisted: Mutex<Vec<(String, TerminalOutcome)>>,
    events: mpsc::UnboundedSender<JobEvent>,
}

impl JobQueueManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        processor: Arc<dyn JobProcessor>,
    ) -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        Self::with_settings(store, processor, QueueSettings::default())
    }

    pub fn with_settings(
        store: Arc<dyn JobStore>,
        processor: Arc<dyn JobProcessor>,
        settings: QueueSettings,
    ) -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let manager = Self {
            store,
            processor,
            settings,
            backlog: Mutex::new(VecDeque::new()),
            active: Mutex::new(None),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            unpersisted: Mutex::new(Vec::new()),
            events,
        };
        (manager, receiver)
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Persist a new pending job and append it to the backlog
    pub fn enqueue(&self, file_path: impl Into<String>, config: JobConfig) -> Result<String> {
        let job = Job::new(file_path, config);
        self.store
            .create_job(&job)
            .context("Failed to persist new job")?;

        self.with_backlog(|backlog| backlog.push_back(job.id.clone()));
        info!("Enqueued job {} for {}", job.id, job.file_path);
        self.emit(JobEvent::Created {
            job_id: job.id.clone(),
        });
        Ok(job.id)
    }

    /// Job ids waiting to run, in order
    pub fn backlog(&self) -> Vec<String> {
        self.backlog
            .lock()
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn active_job_id(&self) -> Option<String> {
        self.active
            .lock()
            .ok()
            .and_then(|a| a.as_ref().map(|a| a.job_id.clone()))
    }

    pub fn is_processing(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run jobs until the backlog is empty. A call made while another call is
    /// processing returns `AlreadyRunning` without touching any state.
    pub async fn process_next(&self) -> Result<ProcessSummary> {
        let mut processed = 0;
        let mut first = true;

        loop {
            let Some(guard) = LoopGuard::acquire(&self.running) else {
                if first {
                    debug!("Processing loop already running");
                    return Ok(ProcessSummary::AlreadyRunning);
                }
                break;
            };
            first = false;

            self.flush_unpersisted().await;
            if !self.has_unpersisted() {
                processed += self.drain().await?;
            }
            drop(guard);

            if self.has_unpersisted() {
                warn!("A finished job is still unrecorded; holding the backlog until the next tick");
                break;
            }
            // An enqueue that raced with the loop shutting down
            if self.backlog_len() == 0 || self.is_paused() {
                break;
            }
        }

        Ok(ProcessSummary::Finished { processed })
    }

    /// Stop taking new jobs once the active one finishes. Queued jobs stay
    /// pending.
    pub fn pause(&self) {
        info!("Pausing job queue");
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Cancel the active job by tearing down the worker. Returns false when
    /// nothing is running.
    pub async fn cancel_active(&self) -> bool {
        let job_id = match self.active.lock() {
            Ok(mut active) => active.as_mut().map(|a| {
                a.cancel_requested = true;
                a.cancel.cancel();
                a.job_id.clone()
            }),
            Err(_) => None,
        };

        match job_id {
            Some(job_id) => {
                info!("Cancelling active job {}", job_id);
                self.processor.cancel().await;
                true
            }
            None => {
                debug!("No active job to cancel");
                false
            }
        }
    }

    /// Fail every job left `processing` by a previous run. Call once at
    /// startup, before accepting work. Returns how many jobs were recovered.
    pub fn recover_interrupted(&self) -> Result<usize> {
        if self.is_processing() {
            return Err(anyhow!("Cannot recover interrupted jobs while the queue is processing"));
        }

        let stuck = self
            .store
            .list_jobs_by_status(JobStatus::Processing)
            .context("Failed to list interrupted jobs")?;

        let mut recovered = 0;
        for job in stuck {
            let changed = self.store.transition_job(
                &job.id,
                JobStatus::Processing,
                JobStatus::Failed,
                &StatusUpdate::error(CRASH_RECOVERY_MESSAGE),
            )?;
            if changed {
                warn!("Job {} was interrupted by a crash, marked failed", job.id);
                self.with_backlog(|backlog| backlog.retain(|id| *id != job.id));
                recovered += 1;
            }
        }

        if recovered > 0 {
            info!("Recovered {} interrupted job(s)", recovered);
        }
        Ok(recovered)
    }

    /// Reload persisted pending jobs into the backlog, oldest first
    pub fn restore_backlog(&self) -> Result<usize> {
        let pending = self
            .store
            .list_jobs_by_status(JobStatus::Pending)
            .context("Failed to list pending jobs")?;

        let restored = self.with_backlog(|backlog| {
            let mut added = 0;
            for job in pending {
                if !backlog.contains(&job.id) {
                    backlog.push_back(job.id);
                    added += 1;
                }
            }
            added
        });

        if restored > 0 {
            info!("Restored {} pending job(s) to the backlog", restored);
        }
        Ok(restored)
    }

    fn has_unpersisted(&self) -> bool {
        self.unpersisted.lock().map(|u| !u.is_empty()).unwrap_or(true)
    }

    fn with_backlog<T>(&self, f: impl FnOnce(&mut VecDeque<String>) -> T) -> T {
        match self.backlog.lock() {
            Ok(mut backlog) => f(&mut backlog),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn emit(&self, event: JobEvent) {
        if self.events.send(event).is_err() {
            debug!("Job event receiver dropped");
        }
    }

    fn progress_sink(&self, job_id: &str) -> ProgressSink {
        let events = self.events.clone();
        let job_id = job_id.to_string();
        Arc::new(move |percent: u8, stage: &str| {
            let _ = events.send(JobEvent::Progress {
                job_id: job_id.clone(),
                percent,
                stage: stage.to_string(),
            });
        })
    }

    /// Process backlog entries one at a time until empty
    async fn drain(&self) -> Result<usize> {
        let mut processed = 0;

        while !self.is_paused() {
            let Some(job_id) = self.with_backlog(|b| b.pop_front()) else {
                break;
            };

            let mut job = match self.store.get_job(&job_id) {
                Ok(Some(job)) => job,
                Ok(None) => {
                    warn!("Job {} vanished from the store, skipping", job_id);
                    continue;
                }
                Err(e) => {
                    self.with_backlog(|b| b.push_front(job_id.clone()));
                    error!("Failed to load job {}: {:#}", job_id, e);
                    return Err(e.context(format!("Failed to load job {}", job_id)));
                }
            };

            if job.status != JobStatus::Pending {
                warn!("Job {} is {}, not pending; skipping", job.id, job.status);
                continue;
            }

            match self.store.transition_job(
                &job.id,
                JobStatus::Pending,
                JobStatus::Processing,
                &StatusUpdate::default(),
            ) {
                Ok(true) => job.status = JobStatus::Processing,
                Ok(false) => {
                    warn!("Job {} changed status before it could start", job.id);
                    continue;
                }
                Err(e) => {
                    // Keep its place; the next tick tries again
                    self.with_backlog(|b| b.push_front(job_id.clone()));
                    error!("Failed to mark job {} processing: {:#}", job.id, e);
                    return Err(e.context(format!("Failed to start job {}", job.id)));
                }
            }

            self.run_job(job).await;
            processed += 1;

            if self.has_unpersisted() {
                break;
            }
        }

        Ok(processed)
    }

    async fn run_job(&self, job: Job) {
        let cancel = CancellationToken::new();
        if let Ok(mut active) = self.active.lock() {
            *active = Some(ActiveJob {
                job_id: job.id.clone(),
                cancel: cancel.clone(),
                cancel_requested: false,
            });
        }

        info!("Processing job {} ({})", job.id, job.file_path);
        let result = self
            .processor
            .process(&job, self.progress_sink(&job.id), cancel)
            .await;

        let cancelled = self
            .active
            .lock()
            .ok()
            .and_then(|mut a| a.take())
            .map(|a| a.cancel_requested)
            .unwrap_or(false);

        let outcome = if cancelled {
            TerminalOutcome::Cancelled
        } else {
            match result {
                Ok(output) => TerminalOutcome::Completed(output),
                Err(e) => {
                    error!("Job {} failed: {:#}", job.id, e);
                    TerminalOutcome::Failed(format!("{:#}", e))
                }
            }
        };

        self.finish_job(job.id, outcome).await;

        if cancelled {
            // The worker was torn down; bring it back before the next job
            if let Err(e) = self.processor.reset().await {
                warn!("Failed to reset processor after cancellation: {:#}", e);
            }
        }
    }

    async fn finish_job(&self, job_id: String, outcome: TerminalOutcome) {
        let mut delay = self.settings.persist_backoff;
        let attempts = self.settings.persist_attempts.max(1);

        for attempt in 1..=attempts {
            match self.persist(&job_id, &outcome) {
                Ok(true) => {
                    self.emit(terminal_event(&job_id, &outcome));
                    return;
                }
                Ok(false) => {
                    self.emit(self.superseded_event(&job_id));
                    return;
                }
                Err(e) => {
                    warn!(
                        "Failed to persist outcome of job {} (attempt {}/{}): {:#}",
                        job_id, attempt, attempts, e
                    );
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        error!(
            "Giving up persisting job {} for this tick, will retry on the next",
            job_id
        );
        if let Ok(mut unpersisted) = self.unpersisted.lock() {
            unpersisted.push((job_id, outcome));
        }
    }

    /// Record a terminal outcome. `Ok(false)` means the job had already left
    /// `processing` and the outcome was dropped.
    fn persist(&self, job_id: &str, outcome: &TerminalOutcome) -> Result<bool> {
        let changed = match outcome {
            TerminalOutcome::Completed(output) => self.store.complete_job(job_id, output)?,
            TerminalOutcome::Failed(message) => self.store.transition_job(
                job_id,
                JobStatus::Processing,
                JobStatus::Failed,
                &StatusUpdate::error(message.clone()),
            )?,
            TerminalOutcome::Cancelled => self.store.transition_job(
                job_id,
                JobStatus::Processing,
                JobStatus::Cancelled,
                &StatusUpdate::error(CANCELLED_MESSAGE),
            )?,
        };

        if !changed {
            warn!("Job {} was no longer processing when it finished", job_id);
        }
        Ok(changed)
    }

    /// Failure event mirroring whatever the store holds for a job whose
    /// outcome was dropped
    fn superseded_event(&self, job_id: &str) -> JobEvent {
        let error = match self.store.get_job(job_id) {
            Ok(Some(job)) => job
                .error
                .unwrap_or_else(|| format!("{} (job is {})", SUPERSEDED_MESSAGE, job.status)),
            _ => SUPERSEDED_MESSAGE.to_string(),
        };
        JobEvent::Failed {
            job_id: job_id.to_string(),
            error,
        }
    }

    async fn flush_unpersisted(&self) {
        let stashed = match self.unpersisted.lock() {
            Ok(mut unpersisted) => std::mem::take(&mut *unpersisted),
            Err(_) => return,
        };

        for (job_id, outcome) in stashed {
            debug!("Retrying persistence of job {}", job_id);
            self.finish_job(job_id, outcome).await;
        }
    }
}

fn terminal_event(job_id: &str, outcome: &TerminalOutcome) -> JobEvent {
    let job_id = job_id.to_string();
    match outcome {
        TerminalOutcome::Completed(output) => JobEvent::Completed {
            job_id,
            duration_seconds: output.duration_seconds,
            segment_count: output.segments.len(),
        },
        TerminalOutcome::Failed(error) => JobEvent::Failed {
            job_id,
            error: error.clone(),
        },
        TerminalOutcome::Cancelled => JobEvent::Failed {
            job_id,
            error: CANCELLED_MESSAGE.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseManager;
    use crate::diarization::Speaker;
    use crate::transcription::Segment;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tempfile::{tempdir, TempDir};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct FakeProcessor {
        seen: Mutex<Vec<String>>,
        gate: Option<Arc<Notify>>,
        failing_path: Option<String>,
        cancels: AtomicUsize,
        resets: AtomicUsize,
        /// When set, records how many jobs the store shows processing as each job starts
        observed_store: Option<Arc<DatabaseManager>>,
        processing_seen: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl JobProcessor for FakeProcessor {
        async fn process(
            &self,
            job: &Job,
            progress: ProgressSink,
            cancel: CancellationToken,
        ) -> Result<JobOutput> {
            self.seen.lock().unwrap().push(job.file_path.clone());
            if let Some(ref store) = self.observed_store {
                let processing = store.list_jobs_by_status(JobStatus::Processing).unwrap().len();
                self.processing_seen.lock().unwrap().push(processing);
            }
            progress(20, "Transcribing chunk 1/1");

            if let Some(ref gate) = self.gate {
                tokio::select! {
                    _ = gate.notified() => {}
                    _ = cancel.cancelled() => return Err(anyhow!("request cancelled")),
                }
            }

            if self.failing_path.as_deref() == Some(job.file_path.as_str()) {
                return Err(anyhow!("worker exited: signal 9"));
            }

            let mut segment = Segment::new(0.0, 1.0, "hello");
            segment.speaker = Some("SPEAKER_00".to_string());
            Ok(JobOutput {
                segments: vec![segment],
                speakers: vec![Speaker {
                    job_id: job.id.clone(),
                    speaker_id: "SPEAKER_00".to_string(),
                    display_name: Some("Speaker 1".to_string()),
                    color: None,
                }],
                duration_seconds: 1.0,
                model_used: Some("base".to_string()),
                language: None,
            })
        }

        async fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }

        async fn reset(&self) -> Result<()> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn setup(
        processor: FakeProcessor,
    ) -> (
        TempDir,
        Arc<DatabaseManager>,
        Arc<FakeProcessor>,
        JobQueueManager,
        mpsc::UnboundedReceiver<JobEvent>,
    ) {
        let dir = tempdir().unwrap();
        let db = Arc::new(DatabaseManager::new(dir.path().join("jobs.db")).unwrap());
        let processor = Arc::new(processor);
        let (queue, events) = JobQueueManager::new(db.clone(), processor.clone());
        (dir, db, processor, queue, events)
    }

    fn drain_events(events: &mut mpsc::UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_enqueue_persists_pending_job() {
        let (_dir, db, _, queue, mut events) = setup(FakeProcessor::default());

        let id = queue.enqueue("/audio/a.wav", JobConfig::default()).unwrap();

        let job = db.get_job(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(queue.backlog(), vec![id.clone()]);
        assert_eq!(drain_events(&mut events), vec![JobEvent::Created { job_id: id }]);
    }

    #[tokio::test]
    async fn test_jobs_run_in_fifo_order_and_complete() {
        let (_dir, db, processor, queue, mut events) = setup(FakeProcessor::default());
        let a = queue.enqueue("/audio/a.wav", JobConfig::default()).unwrap();
        let b = queue.enqueue("/audio/b.wav", JobConfig::default()).unwrap();

        let summary = queue.process_next().await.unwrap();
        assert_eq!(summary, ProcessSummary::Finished { processed: 2 });
        assert_eq!(
            *processor.seen.lock().unwrap(),
            vec!["/audio/a.wav".to_string(), "/audio/b.wav".to_string()]
        );

        for id in [&a, &b] {
            let job = db.get_job(id).unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Completed);
            assert!(job.completed_at.is_some());
            assert_eq!(db.get_segments(id).unwrap().len(), 1);
            assert_eq!(db.get_speakers(id).unwrap().len(), 1);
        }

        let completed: Vec<String> = drain_events(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                JobEvent::Completed { job_id, segment_count, .. } => {
                    assert_eq!(segment_count, 1);
                    Some(job_id)
                }
                _ => None,
            })
            .collect();
        assert_eq!(completed, vec![a, b]);
        assert!(queue.backlog().is_empty());
        assert!(!queue.is_processing());
    }

    #[tokio::test]
    async fn test_process_next_is_a_noop_while_running() {
        let gate = Arc::new(Notify::new());
        let (_dir, _db, _, queue, _events) = setup(FakeProcessor {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let queue = Arc::new(queue);

        let a = queue.enqueue("/audio/a.wav", JobConfig::default()).unwrap();
        let b = queue.enqueue("/audio/b.wav", JobConfig::default()).unwrap();

        let runner = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.process_next().await })
        };

        while queue.active_job_id().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(queue.process_next().await.unwrap(), ProcessSummary::AlreadyRunning);
        assert_eq!(queue.active_job_id(), Some(a));
        assert_eq!(queue.backlog(), vec![b]);

        gate.notify_one();
        while queue.backlog_len() > 0 || queue.active_job_id().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        gate.notify_one();

        let summary = runner.await.unwrap().unwrap();
        assert_eq!(summary, ProcessSummary::Finished { processed: 2 });
    }

    #[tokio::test]
    async fn test_failure_is_persisted_and_reported() {
        let (_dir, db, _, queue, mut events) = setup(FakeProcessor {
            failing_path: Some("/audio/bad.wav".to_string()),
            ..Default::default()
        });
        let bad = queue.enqueue("/audio/bad.wav", JobConfig::default()).unwrap();
        let good = queue.enqueue("/audio/good.wav", JobConfig::default()).unwrap();

        queue.process_next().await.unwrap();

        let failed = db.get_job(&bad).unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error.unwrap().contains("worker exited"));
        assert!(db.get_segments(&bad).unwrap().is_empty());
        assert_eq!(db.get_job(&good).unwrap().unwrap().status, JobStatus::Completed);

        let events = drain_events(&mut events);
        assert!(events.iter().any(|e| matches!(e, JobEvent::Failed { job_id, .. } if *job_id == bad)));
        assert!(events.iter().any(|e| matches!(e, JobEvent::Progress { percent: 20, .. })));
    }

    #[tokio::test]
    async fn test_cancel_active_marks_cancelled_and_resets() {
        let gate = Arc::new(Notify::new());
        let (_dir, db, processor, queue, mut events) = setup(FakeProcessor {
            gate: Some(gate),
            ..Default::default()
        });
        let queue = Arc::new(queue);
        assert!(!queue.cancel_active().await);

        let id = queue.enqueue("/audio/a.wav", JobConfig::default()).unwrap();
        let runner = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.process_next().await })
        };
        while queue.active_job_id().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(queue.cancel_active().await);
        runner.await.unwrap().unwrap();

        let job = db.get_job(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.error.as_deref(), Some(CANCELLED_MESSAGE));
        assert_eq!(processor.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(processor.resets.load(Ordering::SeqCst), 1);
        assert!(drain_events(&mut events).contains(&JobEvent::Failed {
            job_id: id,
            error: CANCELLED_MESSAGE.to_string()
        }));
    }

    #[tokio::test]
    async fn test_recover_interrupted_fails_processing_jobs() {
        let (_dir, db, processor, queue, _events) = setup(FakeProcessor::default());

        // Simulate a previous run that died mid-job
        let stuck = Job::new("/audio/stuck.wav", JobConfig::default());
        db.create_job(&stuck).unwrap();
        db.transition_job(&stuck.id, JobStatus::Pending, JobStatus::Processing, &StatusUpdate::default())
            .unwrap();
        let waiting = Job::new("/audio/waiting.wav", JobConfig::default());
        db.create_job(&waiting).unwrap();

        assert_eq!(queue.recover_interrupted().unwrap(), 1);
        let job = db.get_job(&stuck.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(CRASH_RECOVERY_MESSAGE));

        // Never re-enqueued; only the pending job comes back
        assert_eq!(queue.restore_backlog().unwrap(), 1);
        assert_eq!(queue.backlog(), vec![waiting.id.clone()]);
        queue.process_next().await.unwrap();
        assert_eq!(*processor.seen.lock().unwrap(), vec!["/audio/waiting.wav".to_string()]);
        assert_eq!(db.get_job(&stuck.id).unwrap().unwrap().status, JobStatus::Failed);

        // Second recovery finds nothing
        assert_eq!(queue.recover_interrupted().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_restore_backlog_skips_duplicates() {
        let (_dir, _db, _, queue, _events) = setup(FakeProcessor::default());
        let a = queue.enqueue("/audio/a.wav", JobConfig::default()).unwrap();
        let b = queue.enqueue("/audio/b.wav", JobConfig::default()).unwrap();

        assert_eq!(queue.restore_backlog().unwrap(), 0);
        assert_eq!(queue.backlog(), vec![a, b]);
    }

    #[tokio::test]
    async fn test_paused_queue_leaves_jobs_pending() {
        let (_dir, db, processor, queue, _events) = setup(FakeProcessor::default());
        let id = queue.enqueue("/audio/a.wav", JobConfig::default()).unwrap();

        queue.pause();
        assert_eq!(queue.process_next().await.unwrap(), ProcessSummary::Finished { processed: 0 });
        assert_eq!(db.get_job(&id).unwrap().unwrap().status, JobStatus::Pending);
        assert_eq!(queue.backlog_len(), 1);

        queue.resume();
        assert_eq!(queue.process_next().await.unwrap(), ProcessSummary::Finished { processed: 1 });
        assert!(processor.seen.lock().unwrap().len() == 1);
    }

    /// Store wrapper whose terminal transitions fail a fixed number of times
    struct FlakyStore {
        inner: Arc<DatabaseManager>,
        failures_left: AtomicUsize,
    }

    impl JobStore for FlakyStore {
        fn create_job(&self, job: &Job) -> Result<()> {
            self.inner.create_job(job)
        }
        fn get_job(&self, id: &str) -> Result<Option<Job>> {
            self.inner.get_job(id)
        }
        fn list_jobs(&self) -> Result<Vec<Job>> {
            self.inner.list_jobs()
        }
        fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
            self.inner.list_jobs_by_status(status)
        }
        fn transition_job(&self, id: &str, from: JobStatus, to: JobStatus, update: &StatusUpdate) -> Result<bool> {
            if to.is_terminal() {
                let left = self.failures_left.load(Ordering::SeqCst);
                if left > 0 {
                    self.failures_left.store(left - 1, Ordering::SeqCst);
                    return Err(anyhow!("database is locked"));
                }
            }
            self.inner.transition_job(id, from, to, update)
        }
        fn delete_job(&self, id: &str) -> Result<bool> {
            self.inner.delete_job(id)
        }
        fn replace_segments(&self, job_id: &str, segments: &[Segment]) -> Result<()> {
            self.inner.replace_segments(job_id, segments)
        }
        fn get_segments(&self, job_id: &str) -> Result<Vec<Segment>> {
            self.inner.get_segments(job_id)
        }
        fn replace_speakers(&self, job_id: &str, speakers: &[Speaker]) -> Result<()> {
            self.inner.replace_speakers(job_id, speakers)
        }
        fn get_speakers(&self, job_id: &str) -> Result<Vec<Speaker>> {
            self.inner.get_speakers(job_id)
        }
        fn rename_speaker(&self, job_id: &str, speaker_id: &str, display_name: &str) -> Result<bool> {
            self.inner.rename_speaker(job_id, speaker_id, display_name)
        }
    }

    #[tokio::test]
    async fn test_unpersisted_outcome_is_retried_next_tick() {
        let dir = tempdir().unwrap();
        let db = Arc::new(DatabaseManager::new(dir.path().join("jobs.db")).unwrap());
        let store = Arc::new(FlakyStore {
            inner: db.clone(),
            failures_left: AtomicUsize::new(2),
        });
        let (queue, mut events) = JobQueueManager::with_settings(
            store,
            Arc::new(FakeProcessor::default()),
            QueueSettings {
                persist_attempts: 2,
                persist_backoff: Duration::from_millis(1),
            },
        );

        let id = queue.enqueue("/audio/a.wav", JobConfig::default()).unwrap();
        queue.process_next().await.unwrap();

        // Both attempts failed: still processing, no terminal event yet
        assert_eq!(db.get_job(&id).unwrap().unwrap().status, JobStatus::Processing);
        assert!(!drain_events(&mut events)
            .iter()
            .any(|e| matches!(e, JobEvent::Completed { .. })));

        queue.process_next().await.unwrap();
        assert_eq!(db.get_job(&id).unwrap().unwrap().status, JobStatus::Completed);
        assert!(drain_events(&mut events)
            .iter()
            .any(|e| matches!(e, JobEvent::Completed { .. })));
    }

    #[tokio::test]
    async fn test_unrecorded_outcome_holds_the_backlog() {
        let dir = tempdir().unwrap();
        let db = Arc::new(DatabaseManager::new(dir.path().join("jobs.db")).unwrap());
        let store = Arc::new(FlakyStore {
            inner: db.clone(),
            failures_left: AtomicUsize::new(1),
        });
        let processor = Arc::new(FakeProcessor {
            observed_store: Some(db.clone()),
            ..Default::default()
        });
        let (queue, _events) = JobQueueManager::with_settings(
            store,
            processor.clone(),
            QueueSettings {
                persist_attempts: 1,
                persist_backoff: Duration::from_millis(1),
            },
        );

        let a = queue.enqueue("/audio/a.wav", JobConfig::default()).unwrap();
        let b = queue.enqueue("/audio/b.wav", JobConfig::default()).unwrap();

        // a finishes but cannot be recorded; b must not start beside it
        assert_eq!(
            queue.process_next().await.unwrap(),
            ProcessSummary::Finished { processed: 1 }
        );
        assert_eq!(db.get_job(&a).unwrap().unwrap().status, JobStatus::Processing);
        assert_eq!(db.get_job(&b).unwrap().unwrap().status, JobStatus::Pending);
        assert_eq!(queue.backlog(), vec![b.clone()]);

        queue.process_next().await.unwrap();
        assert_eq!(db.get_job(&a).unwrap().unwrap().status, JobStatus::Completed);
        assert_eq!(db.get_job(&b).unwrap().unwrap().status, JobStatus::Completed);
        assert_eq!(*processor.processing_seen.lock().unwrap(), vec![1, 1]);
    }

    #[tokio::test]
    async fn test_outcome_dropped_when_job_was_failed_elsewhere() {
        let gate = Arc::new(Notify::new());
        let (dir, db, _, queue, mut events) = setup(FakeProcessor {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let queue = Arc::new(queue);
        let id = queue.enqueue("/audio/a.wav", JobConfig::default()).unwrap();

        let runner = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.process_next().await })
        };
        while queue.active_job_id().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // A second manager on the same database treats the live job as interrupted
        let other_db = Arc::new(DatabaseManager::new(dir.path().join("jobs.db")).unwrap());
        let (other, _other_events) =
            JobQueueManager::new(other_db, Arc::new(FakeProcessor::default()));
        assert_eq!(other.recover_interrupted().unwrap(), 1);

        gate.notify_one();
        runner.await.unwrap().unwrap();

        let job = db.get_job(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(CRASH_RECOVERY_MESSAGE));
        assert!(db.get_segments(&id).unwrap().is_empty());

        let events = drain_events(&mut events);
        assert!(!events.iter().any(|e| matches!(e, JobEvent::Completed { .. })));
        assert!(events.contains(&JobEvent::Failed {
            job_id: id,
            error: CRASH_RECOVERY_MESSAGE.to_string(),
        }));
    }
}
