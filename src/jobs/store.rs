// jobs/store.rs
//
// Persistence boundary for jobs and their results. The persisted status is
// the source of truth across restarts; status changes are compare-and-set.

use anyhow::Result;

use super::types::{Job, JobOutput, JobStatus, StatusUpdate};
use crate::diarization::Speaker;
use crate::transcription::Segment;

pub trait JobStore: Send + Sync {
    fn create_job(&self, job: &Job) -> Result<()>;

    fn get_job(&self, id: &str) -> Result<Option<Job>>;

    /// All jobs, oldest first
    fn list_jobs(&self) -> Result<Vec<Job>>;

    /// Jobs in `status`, oldest first
    fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>>;

    /// Move a job from `from` to `to`. Returns false, changing nothing, when
    /// the job is missing or no longer in `from`.
    fn transition_job(
        &self,
        id: &str,
        from: JobStatus,
        to: JobStatus,
        update: &StatusUpdate,
    ) -> Result<bool>;

    /// Delete a job and everything attached to it
    fn delete_job(&self, id: &str) -> Result<bool>;

    fn replace_segments(&self, job_id: &str, segments: &[Segment]) -> Result<()>;

    fn get_segments(&self, job_id: &str) -> Result<Vec<Segment>>;

    fn replace_speakers(&self, job_id: &str, speakers: &[Speaker]) -> Result<()>;

    fn get_speakers(&self, job_id: &str) -> Result<Vec<Speaker>>;

    fn rename_speaker(&self, job_id: &str, speaker_id: &str, display_name: &str) -> Result<bool>;

    /// Store the results and flip `processing -> completed`
    fn complete_job(&self, id: &str, output: &JobOutput) -> Result<bool> {
        self.replace_segments(id, &output.segments)?;
        self.replace_speakers(id, &output.speakers)?;
        self.transition_job(
            id,
            JobStatus::Processing,
            JobStatus::Completed,
            &StatusUpdate {
                error: None,
                duration_seconds: Some(output.duration_seconds),
                model_used: output.model_used.clone(),
            },
        )
    }
}
