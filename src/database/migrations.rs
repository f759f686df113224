// Database migrations for scribe-local
// Creates and updates the database schema

use anyhow::{Context, Result};
use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Run all necessary migrations to bring the database up to date
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    let table_exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
        [],
        |row| row.get(0),
    ).unwrap_or(false);

    if !table_exists {
        return Ok(0);
    }

    let version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    ).unwrap_or(0);

    Ok(version)
}

/// Jobs and transcript segments (version 1)
fn migrate_v1(conn: &Connection) -> Result<()> {
    log::info!("Running database migration v1");

    conn.execute_batch(r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Jobs: one transcription request and its lifecycle
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY NOT NULL,
            file_path TEXT NOT NULL,
            model TEXT,
            language TEXT,
            diarization INTEGER NOT NULL DEFAULT 0,
            num_speakers INTEGER,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT,
            duration_seconds REAL,
            model_used TEXT,
            error TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_status
        ON jobs(status, created_at);

        -- Segments: timed transcript text produced by a job
        CREATE TABLE IF NOT EXISTS segments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL,
            sequence_id INTEGER NOT NULL,
            start_time REAL NOT NULL,
            end_time REAL NOT NULL,
            text TEXT NOT NULL,
            speaker TEXT,
            confidence REAL,
            FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_segments_job
        ON segments(job_id, sequence_id);

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);
    "#).context("Failed to run migration v1")?;

    Ok(())
}

/// Speakers and full-text search over segments (version 2)
fn migrate_v2(conn: &Connection) -> Result<()> {
    log::info!("Running database migration v2");

    conn.execute_batch(r#"
        -- Speakers: one row per distinct speaker identifier in a job
        CREATE TABLE IF NOT EXISTS speakers (
            job_id TEXT NOT NULL,
            speaker_id TEXT NOT NULL,
            display_name TEXT,
            color TEXT,
            PRIMARY KEY (job_id, speaker_id),
            FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
        );

        -- Full-text search virtual table for segment text
        CREATE VIRTUAL TABLE IF NOT EXISTS segments_fts USING fts5(
            job_id,
            text,
            content='segments',
            content_rowid='id'
        );

        -- Triggers to keep FTS in sync with segments
        CREATE TRIGGER IF NOT EXISTS segments_fts_insert AFTER INSERT ON segments BEGIN
            INSERT INTO segments_fts(rowid, job_id, text)
            VALUES (new.id, new.job_id, new.text);
        END;

        CREATE TRIGGER IF NOT EXISTS segments_fts_delete AFTER DELETE ON segments BEGIN
            INSERT INTO segments_fts(segments_fts, rowid, job_id, text)
            VALUES('delete', old.id, old.job_id, old.text);
        END;

        CREATE TRIGGER IF NOT EXISTS segments_fts_update AFTER UPDATE ON segments BEGIN
            INSERT INTO segments_fts(segments_fts, rowid, job_id, text)
            VALUES('delete', old.id, old.job_id, old.text);
            INSERT INTO segments_fts(rowid, job_id, text)
            VALUES (new.id, new.job_id, new.text);
        END;

        -- Index segments written before the FTS table existed
        INSERT INTO segments_fts(segments_fts) VALUES('rebuild');

        INSERT OR IGNORE INTO schema_version (version) VALUES (2);
    "#).context("Failed to run migration v2")?;

    Ok(())
}
