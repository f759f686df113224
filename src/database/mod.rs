// Database module for scribe-local
// SQLite persistence for jobs, transcript segments and speakers

pub mod manager;
pub mod migrations;
pub mod jobs_repo;
pub mod segments_repo;
pub mod speakers_repo;
pub mod search;

pub use manager::DatabaseManager;
pub use search::SegmentMatch;
