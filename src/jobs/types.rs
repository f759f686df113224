// jobs/types.rs
//
// Job records, lifecycle states and the events reported to callers.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::diarization::Speaker;
use crate::transcription::Segment;

/// Message stored on jobs found mid-flight at startup
pub const CRASH_RECOVERY_MESSAGE: &str =
    "Interrupted by an application crash or unclean shutdown; not retried automatically";

/// Message stored on jobs stopped by the user
pub const CANCELLED_MESSAGE: &str = "Cancelled by user";

/// Reported when a job's status was finalized elsewhere while it ran
pub const SUPERSEDED_MESSAGE: &str = "Job was finalized elsewhere while running; result discarded";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Allowed lifecycle edges. `Processing -> Failed` doubles as the crash
    /// recovery transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(anyhow!("Unknown job status: {}", other)),
        }
    }
}

/// Engine configuration requested for one job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Model size, or "auto"/None to use the preference list
    pub model: Option<String>,
    /// Language hint; None lets the engine detect it
    pub language: Option<String>,
    #[serde(default)]
    pub diarization: bool,
    /// Expected speaker count, a hint for the diarization engine
    pub num_speakers: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub file_path: String,
    pub config: JobConfig,
    pub status: JobStatus,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
    pub duration_seconds: Option<f64>,
    pub model_used: Option<String>,
    pub error: Option<String>,
}

impl Job {
    pub fn new(file_path: impl Into<String>, config: JobConfig) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            file_path: file_path.into(),
            config,
            status: JobStatus::Pending,
            created_at: now.clone(),
            updated_at: now,
            completed_at: None,
            duration_seconds: None,
            model_used: None,
            error: None,
        }
    }
}

/// Fields written together with a status change
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
    pub error: Option<String>,
    pub duration_seconds: Option<f64>,
    pub model_used: Option<String>,
}

impl StatusUpdate {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Everything a successful job produces
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOutput {
    pub segments: Vec<Segment>,
    pub speakers: Vec<Speaker>,
    pub duration_seconds: f64,
    pub model_used: Option<String>,
    pub language: Option<String>,
}

/// Lifecycle notifications. These are the only events the queue emits.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum JobEvent {
    Created {
        job_id: String,
    },
    Progress {
        job_id: String,
        percent: u8,
        stage: String,
    },
    Completed {
        job_id: String,
        duration_seconds: f64,
        segment_count: usize,
    },
    Failed {
        job_id: String,
        error: String,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Created { job_id }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::Failed { job_id, .. } => job_id,
        }
    }
}
