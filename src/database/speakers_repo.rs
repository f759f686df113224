// Speakers repository for scribe-local
// Per-job speaker identities and user-facing names

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use crate::diarization::Speaker;

/// Delete and rewrite every speaker of a job. Callers own the transaction.
pub(super) fn replace_speakers_impl(conn: &Connection, job_id: &str, speakers: &[Speaker]) -> Result<()> {
    conn.execute("DELETE FROM speakers WHERE job_id = ?", params![job_id])
        .context("Failed to delete old speakers")?;

    let mut stmt = conn.prepare(
        "INSERT INTO speakers (job_id, speaker_id, display_name, color) VALUES (?1, ?2, ?3, ?4)"
    ).context("Failed to prepare speaker insert")?;

    for speaker in speakers {
        stmt.execute(params![job_id, speaker.speaker_id, speaker.display_name, speaker.color])
            .with_context(|| format!("Failed to insert speaker {}", speaker.speaker_id))?;
    }

    Ok(())
}

pub(super) fn get_speakers_impl(conn: &Connection, job_id: &str) -> Result<Vec<Speaker>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT job_id, speaker_id, display_name, color
        FROM speakers
        WHERE job_id = ?
        ORDER BY speaker_id ASC
        "#
    ).context("Failed to prepare get_speakers query")?;

    let speakers = stmt.query_map(params![job_id], |row| {
        Ok(Speaker {
            job_id: row.get(0)?,
            speaker_id: row.get(1)?,
            display_name: row.get(2)?,
            color: row.get(3)?,
        })
    }).context("Failed to query speakers")?;

    speakers.collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to collect speakers")
}

pub(super) fn rename_speaker_impl(
    conn: &Connection,
    job_id: &str,
    speaker_id: &str,
    display_name: &str,
) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE speakers SET display_name = ?1 WHERE job_id = ?2 AND speaker_id = ?3",
        params![display_name, job_id, speaker_id],
    ).context("Failed to rename speaker")?;

    Ok(updated > 0)
}

#[cfg(test)]
mod tests {
    use crate::database::DatabaseManager;
    use crate::diarization::build_speakers;
    use crate::jobs::{Job, JobConfig, JobStore};
    use crate::transcription::Segment;
    use tempfile::tempdir;

    #[test]
    fn test_rename_speaker() {
        let dir = tempdir().unwrap();
        let db = DatabaseManager::new(dir.path().join("test.db")).unwrap();
        let job = Job::new("/a.wav", JobConfig::default());
        db.create_job(&job).unwrap();

        let mut a = Segment::new(0.0, 1.0, "hi");
        a.speaker = Some("SPEAKER_01".to_string());
        let mut b = Segment::new(1.0, 2.0, "hello");
        b.speaker = Some("SPEAKER_00".to_string());
        db.replace_speakers(&job.id, &build_speakers(&job.id, &[a, b])).unwrap();

        assert!(db.rename_speaker(&job.id, "SPEAKER_01", "Alice").unwrap());
        assert!(!db.rename_speaker(&job.id, "SPEAKER_09", "Nobody").unwrap());

        let speakers = db.get_speakers(&job.id).unwrap();
        assert_eq!(speakers.len(), 2);
        assert_eq!(speakers[0].speaker_id, "SPEAKER_00");
        assert_eq!(speakers[1].display_name.as_deref(), Some("Alice"));
        assert!(speakers[0].color.is_some());
    }
}
