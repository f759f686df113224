// scribe-local - local transcription jobs driven through an isolated worker
//
// - worker: line protocol, process supervision, request correlation
// - transcription: chunked inference and the per-job pipeline
// - diarization: speaker alignment and speaker records
// - jobs: durable queue with one active job at a time
// - database: SQLite persistence for jobs and their results

pub mod audio;
pub mod config;
pub mod database;
pub mod diarization;
pub mod jobs;
pub mod models;
pub mod state;
pub mod transcription;
pub mod worker;

pub use config::ScribeConfig;
pub use state::AppState;

/// Initialize env_logger to output to stderr (reads RUST_LOG env var)
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}
