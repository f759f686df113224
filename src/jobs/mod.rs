// Job lifecycle
//
// - types.rs: Job, JobStatus, JobEvent and friends
// - store.rs: persistence boundary used by the queue
// - processor.rs: the work performed per job
// - queue.rs: the single-concurrency job queue
// - runner_lock.rs: one processing process per work directory

pub mod processor;
pub mod queue;
pub mod runner_lock;
pub mod store;
pub mod types;

pub use processor::{JobProcessor, ProgressSink};
pub use queue::{JobQueueManager, ProcessSummary};
pub use runner_lock::RunnerLock;
pub use store::JobStore;
pub use types::{
    Job, JobConfig, JobEvent, JobOutput, JobStatus, StatusUpdate, CANCELLED_MESSAGE,
    CRASH_RECOVERY_MESSAGE, SUPERSEDED_MESSAGE,
};
