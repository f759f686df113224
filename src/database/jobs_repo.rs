// Jobs repository for scribe-local
// Job rows, compare-and-set status changes, and the JobStore implementation

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::segments_repo::{get_segments_impl, replace_segments_impl};
use super::speakers_repo::{get_speakers_impl, rename_speaker_impl, replace_speakers_impl};
use super::DatabaseManager;
use crate::diarization::Speaker;
use crate::jobs::{Job, JobConfig, JobOutput, JobStatus, JobStore, StatusUpdate};
use crate::transcription::Segment;

const JOB_COLUMNS: &str = r#"
    id, file_path, model, language, diarization, num_speakers, status,
    created_at, updated_at, completed_at, duration_seconds, model_used, error
"#;

impl DatabaseManager {
    /// Count jobs per status, for the listing summary
    pub fn count_jobs_by_status(&self) -> Result<Vec<(JobStatus, i64)>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status ORDER BY status")
                .context("Failed to prepare job count query")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .context("Failed to count jobs")?;

            let mut counts = Vec::new();
            for row in rows {
                let (status, count) = row?;
                counts.push((status.parse()?, count));
            }
            Ok(counts)
        })
    }
}

impl JobStore for DatabaseManager {
    fn create_job(&self, job: &Job) -> Result<()> {
        self.with_connection(|conn| create_job_impl(conn, job))
    }

    fn get_job(&self, id: &str) -> Result<Option<Job>> {
        self.with_connection(|conn| get_job_impl(conn, id))
    }

    fn list_jobs(&self) -> Result<Vec<Job>> {
        self.with_connection(|conn| list_jobs_impl(conn, None))
    }

    fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        self.with_connection(|conn| list_jobs_impl(conn, Some(status)))
    }

    fn transition_job(
        &self,
        id: &str,
        from: JobStatus,
        to: JobStatus,
        update: &StatusUpdate,
    ) -> Result<bool> {
        self.with_connection(|conn| transition_job_impl(conn, id, from, to, update))
    }

    fn delete_job(&self, id: &str) -> Result<bool> {
        self.with_connection(|conn| {
            let deleted = conn
                .execute("DELETE FROM jobs WHERE id = ?", params![id])
                .context("Failed to delete job")?;
            Ok(deleted > 0)
        })
    }

    fn replace_segments(&self, job_id: &str, segments: &[Segment]) -> Result<()> {
        self.with_connection(|conn| {
            let tx = conn.unchecked_transaction()
                .context("Failed to start transaction")?;
            replace_segments_impl(&tx, job_id, segments)?;
            tx.commit().context("Failed to commit segments")?;
            Ok(())
        })
    }

    fn get_segments(&self, job_id: &str) -> Result<Vec<Segment>> {
        self.with_connection(|conn| get_segments_impl(conn, job_id))
    }

    fn replace_speakers(&self, job_id: &str, speakers: &[Speaker]) -> Result<()> {
        self.with_connection(|conn| {
            let tx = conn.unchecked_transaction()
                .context("Failed to start transaction")?;
            replace_speakers_impl(&tx, job_id, speakers)?;
            tx.commit().context("Failed to commit speakers")?;
            Ok(())
        })
    }

    fn get_speakers(&self, job_id: &str) -> Result<Vec<Speaker>> {
        self.with_connection(|conn| get_speakers_impl(conn, job_id))
    }

    fn rename_speaker(&self, job_id: &str, speaker_id: &str, display_name: &str) -> Result<bool> {
        self.with_connection(|conn| rename_speaker_impl(conn, job_id, speaker_id, display_name))
    }

    /// Results and the status flip land in one transaction
    fn complete_job(&self, id: &str, output: &JobOutput) -> Result<bool> {
        self.with_connection(|conn| {
            let tx = conn.unchecked_transaction()
                .context("Failed to start transaction")?;

            replace_segments_impl(&tx, id, &output.segments)?;
            replace_speakers_impl(&tx, id, &output.speakers)?;
            let changed = transition_job_impl(
                &tx,
                id,
                JobStatus::Processing,
                JobStatus::Completed,
                &StatusUpdate {
                    error: None,
                    duration_seconds: Some(output.duration_seconds),
                    model_used: output.model_used.clone(),
                },
            )?;

            if !changed {
                // Leave segments and speakers untouched
                tx.rollback().context("Failed to roll back job completion")?;
                return Ok(false);
            }

            tx.commit().context("Failed to commit job completion")?;
            Ok(true)
        })
    }
}

fn create_job_impl(conn: &Connection, job: &Job) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO jobs (
            id, file_path, model, language, diarization, num_speakers, status,
            created_at, updated_at, completed_at, duration_seconds, model_used, error
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        "#,
        params![
            job.id,
            job.file_path,
            job.config.model,
            job.config.language,
            job.config.diarization as i32,
            job.config.num_speakers,
            job.status.as_str(),
            job.created_at,
            job.updated_at,
            job.completed_at,
            job.duration_seconds,
            job.model_used,
            job.error,
        ],
    ).context("Failed to create job")?;

    Ok(())
}

fn get_job_impl(conn: &Connection, id: &str) -> Result<Option<Job>> {
    let sql = format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS);
    let row = conn
        .query_row(&sql, params![id], raw_job_from_row)
        .optional()
        .context("Failed to get job")?;

    row.map(RawJob::into_job).transpose()
}

fn list_jobs_impl(conn: &Connection, status: Option<JobStatus>) -> Result<Vec<Job>> {
    let sql = format!(
        "SELECT {} FROM jobs WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at ASC, rowid ASC",
        JOB_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)
        .context("Failed to prepare list_jobs query")?;

    let rows = stmt
        .query_map(params![status.map(|s| s.as_str())], raw_job_from_row)
        .context("Failed to query jobs")?;

    let mut jobs = Vec::new();
    for row in rows {
        jobs.push(row.context("Failed to read job row")?.into_job()?);
    }
    Ok(jobs)
}

pub(super) fn transition_job_impl(
    conn: &Connection,
    id: &str,
    from: JobStatus,
    to: JobStatus,
    update: &StatusUpdate,
) -> Result<bool> {
    if !from.can_transition_to(to) {
        return Err(anyhow!("Illegal job transition {} -> {}", from, to));
    }

    let now = chrono::Utc::now().to_rfc3339();
    let completed_at = if to.is_terminal() { Some(now.clone()) } else { None };

    let updated = conn.execute(
        r#"
        UPDATE jobs SET
            status = ?1,
            updated_at = ?2,
            completed_at = COALESCE(?3, completed_at),
            error = ?4,
            duration_seconds = COALESCE(?5, duration_seconds),
            model_used = COALESCE(?6, model_used)
        WHERE id = ?7 AND status = ?8
        "#,
        params![
            to.as_str(),
            now,
            completed_at,
            update.error,
            update.duration_seconds,
            update.model_used,
            id,
            from.as_str(),
        ],
    ).context("Failed to update job status")?;

    Ok(updated > 0)
}

/// Row image before the status string is validated
struct RawJob {
    job: Job,
    status: String,
}

impl RawJob {
    fn into_job(self) -> Result<Job> {
        let mut job = self.job;
        job.status = self.status.parse()
            .with_context(|| format!("Job {} has a corrupt status", job.id))?;
        Ok(job)
    }
}

fn raw_job_from_row(row: &Row<'_>) -> rusqlite::Result<RawJob> {
    Ok(RawJob {
        job: Job {
            id: row.get(0)?,
            file_path: row.get(1)?,
            config: JobConfig {
                model: row.get(2)?,
                language: row.get(3)?,
                diarization: row.get::<_, i32>(4)? != 0,
                num_speakers: row.get(5)?,
            },
            status: JobStatus::Pending,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            completed_at: row.get(9)?,
            duration_seconds: row.get(10)?,
            model_used: row.get(11)?,
            error: row.get(12)?,
        },
        status: row.get(6)?,
    })
}
