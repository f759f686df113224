// Segments repository for scribe-local
// Bulk replace and ordered reads of a job's transcript segments

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use super::DatabaseManager;
use crate::transcription::Segment;

impl DatabaseManager {
    /// Full transcript text of a job, segments joined by spaces
    pub fn get_full_transcript(&self, job_id: &str) -> Result<String> {
        self.with_connection(|conn| {
            let segments = get_segments_impl(conn, job_id)?;
            let texts: Vec<&str> = segments.iter().map(|s| s.text.as_str()).collect();
            Ok(texts.join(" "))
        })
    }
}

/// Delete and rewrite every segment of a job. Callers own the transaction.
pub(super) fn replace_segments_impl(conn: &Connection, job_id: &str, segments: &[Segment]) -> Result<()> {
    conn.execute("DELETE FROM segments WHERE job_id = ?", params![job_id])
        .context("Failed to delete old segments")?;

    let mut stmt = conn.prepare(
        r#"
        INSERT INTO segments (job_id, sequence_id, start_time, end_time, text, speaker, confidence)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#
    ).context("Failed to prepare segment insert")?;

    for (sequence, segment) in segments.iter().enumerate() {
        stmt.execute(params![
            job_id,
            sequence as i64,
            segment.start,
            segment.end,
            segment.text,
            segment.speaker,
            segment.confidence,
        ]).context("Failed to insert segment")?;
    }

    Ok(())
}

pub(super) fn get_segments_impl(conn: &Connection, job_id: &str) -> Result<Vec<Segment>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT start_time, end_time, text, speaker, confidence
        FROM segments
        WHERE job_id = ?
        ORDER BY sequence_id ASC
        "#
    ).context("Failed to prepare get_segments query")?;

    let segments = stmt.query_map(params![job_id], |row| {
        Ok(Segment {
            start: row.get(0)?,
            end: row.get(1)?,
            text: row.get(2)?,
            speaker: row.get(3)?,
            confidence: row.get(4)?,
        })
    }).context("Failed to query segments")?;

    segments.collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to collect segments")
}
