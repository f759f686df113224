// Search functionality for scribe-local
// Full-text search over transcript segments

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::Serialize;

use super::DatabaseManager;

/// A segment whose text matched a search
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentMatch {
    pub job_id: String,
    pub file_path: String,
    pub start: f64,
    pub end: f64,
    pub text: String,
    /// Matched text with `<mark>` highlights
    pub snippet: String,
}

impl DatabaseManager {
    /// Search segment text across all jobs, best matches first
    pub fn search_segments(&self, query: &str, limit: usize) -> Result<Vec<SegmentMatch>> {
        self.with_connection(|conn| search_segments_impl(conn, query, limit))
    }
}

fn search_segments_impl(conn: &Connection, query: &str, limit: usize) -> Result<Vec<SegmentMatch>> {
    let query = query.trim();
    if query.is_empty() {
        return Ok(Vec::new());
    }

    // FTS5 query - quote as a phrase, escaping embedded quotes
    let fts_query = format!("\"{}\"", query.replace('"', "\"\""));

    let mut stmt = conn.prepare(
        r#"
        SELECT s.job_id, j.file_path, s.start_time, s.end_time, s.text,
               snippet(segments_fts, 1, '<mark>', '</mark>', '...', 32) AS matched_text
        FROM segments_fts
        INNER JOIN segments s ON s.id = segments_fts.rowid
        INNER JOIN jobs j ON j.id = s.job_id
        WHERE segments_fts MATCH ?1
        ORDER BY rank, s.job_id, s.sequence_id
        LIMIT ?2
        "#
    ).context("Failed to prepare segment search")?;

    let matches = stmt.query_map(params![fts_query, limit as i64], |row| {
        Ok(SegmentMatch {
            job_id: row.get(0)?,
            file_path: row.get(1)?,
            start: row.get(2)?,
            end: row.get(3)?,
            text: row.get(4)?,
            snippet: row.get(5)?,
        })
    }).context("Failed to search segments")?;

    matches.collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to collect search results")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{Job, JobConfig, JobStore};
    use crate::transcription::Segment;
    use tempfile::tempdir;

    #[test]
    fn test_search_finds_segment_text() {
        let dir = tempdir().unwrap();
        let db = DatabaseManager::new(dir.path().join("test.db")).unwrap();
        let job = Job::new("/audio/standup.wav", JobConfig::default());
        db.create_job(&job).unwrap();
        db.replace_segments(
            &job.id,
            &[
                Segment::new(0.0, 30.0, "we shipped the release on friday"),
                Segment::new(29.0, 59.0, "the budget review moves to monday"),
            ],
        ).unwrap();

        let hits = db.search_segments("budget review", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].job_id, job.id);
        assert_eq!(hits[0].file_path, "/audio/standup.wav");
        assert_eq!(hits[0].start, 29.0);
        assert!(hits[0].snippet.contains("<mark>"));

        // Replacing segments drops stale index entries
        db.replace_segments(&job.id, &[Segment::new(0.0, 5.0, "nothing here")]).unwrap();
        assert!(db.search_segments("budget", 10).unwrap().is_empty());
    }

    #[test]
    fn test_blank_and_quoted_queries() {
        let dir = tempdir().unwrap();
        let db = DatabaseManager::new(dir.path().join("test.db")).unwrap();

        assert!(db.search_segments("   ", 10).unwrap().is_empty());
        assert!(db.search_segments("say \"hi\"", 10).unwrap().is_empty());
    }
}
