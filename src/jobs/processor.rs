// jobs/processor.rs
//
// What the queue runs for each job.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::types::{Job, JobOutput};

/// Receives (percent, stage) updates for the active job
pub type ProgressSink = Arc<dyn Fn(u8, &str) + Send + Sync>;

#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Run one job to completion. Must return promptly once `cancel` fires.
    async fn process(
        &self,
        job: &Job,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<JobOutput>;

    /// Abort in-flight work for the active job
    async fn cancel(&self);

    /// Restore a usable state after a cancellation
    async fn reset(&self) -> Result<()>;
}
