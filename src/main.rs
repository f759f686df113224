// scribe-local command line

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::mpsc::UnboundedReceiver;

use scribe_lib::jobs::{JobConfig, JobEvent, JobStatus, JobStore};
use scribe_lib::transcription::format_timestamp;
use scribe_lib::{init_logging, AppState, ScribeConfig};

#[derive(Parser)]
#[command(name = "scribe-local", version, about = "Local transcription job runner")]
struct Cli {
    /// JSON config file; falls back to SCRIBE_CONFIG, then defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Queue files for transcription and process the backlog
    Transcribe {
        files: Vec<PathBuf>,
        /// Model size, or "auto"
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        language: Option<String>,
        /// Label segments with speakers
        #[arg(long)]
        diarize: bool,
        /// Expected number of speakers
        #[arg(long)]
        speakers: Option<u32>,
    },
    /// Process jobs left pending by an earlier run
    Run,
    /// List jobs
    List {
        #[arg(long)]
        status: Option<String>,
    },
    /// Print a job's transcript
    Show { job_id: String },
    /// Full-text search over transcripts
    Search {
        query: String,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Give a speaker a display name
    RenameSpeaker {
        job_id: String,
        speaker_id: String,
        name: String,
    },
    /// Delete a finished job and its transcript
    Delete { job_id: String },
    /// Start the worker and round-trip a ping
    Ping,
}

#[tokio::main]
async fn main() {
    init_logging();

    if let Err(e) = run(Cli::parse()).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// State for commands that run jobs: holds the runner lock and has already
/// recovered jobs a crashed run left behind
fn open_runner(config: ScribeConfig) -> Result<(AppState, UnboundedReceiver<JobEvent>)> {
    let (state, events) = AppState::init_runner(config)?;
    if state.recovered_jobs() > 0 {
        println!(
            "{} job(s) interrupted by a previous crash were marked failed",
            state.recovered_jobs()
        );
    }
    Ok((state, events))
}

async fn run(cli: Cli) -> Result<()> {
    let config = ScribeConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Command::Transcribe {
            files,
            model,
            language,
            diarize,
            speakers,
        } => {
            if files.is_empty() {
                return Err(anyhow!("No input files given"));
            }
            let (state, events) = open_runner(config)?;
            let config = JobConfig {
                model,
                language,
                diarization: diarize,
                num_speakers: speakers,
            };
            for file in files {
                let path = std::fs::canonicalize(&file)
                    .with_context(|| format!("Input file not found: {}", file.display()))?;
                let id = state.queue().enqueue(path.to_string_lossy(), config.clone())?;
                println!("Queued {} as {}", path.display(), id);
            }
            process_backlog(state, events).await
        }
        Command::Run => {
            let (state, events) = open_runner(config)?;
            process_backlog(state, events).await
        }
        command => inspect(AppState::init(config)?.0, command).await,
    }
}

/// Commands that only read or edit stored results
async fn inspect(state: AppState, command: Command) -> Result<()> {
    match command {
        Command::Transcribe { .. } | Command::Run => {
            Err(anyhow!("Processing commands need the runner state"))
        }
        Command::List { status } => {
            let jobs = match status {
                Some(status) => state.database().list_jobs_by_status(status.parse()?)?,
                None => state.database().list_jobs()?,
            };
            for job in jobs {
                let detail = match job.status {
                    JobStatus::Failed | JobStatus::Cancelled => job.error.unwrap_or_default(),
                    JobStatus::Completed => format!(
                        "{:.1}s, model {}",
                        job.duration_seconds.unwrap_or_default(),
                        job.model_used.unwrap_or_default()
                    ),
                    _ => String::new(),
                };
                println!("{}  {:<10}  {}  {}", job.id, job.status, job.file_path, detail);
            }

            let totals: Vec<String> = state
                .database()
                .count_jobs_by_status()?
                .into_iter()
                .map(|(status, count)| format!("{} {}", count, status))
                .collect();
            if !totals.is_empty() {
                println!("{}", totals.join(", "));
            }
            Ok(())
        }
        Command::Show { job_id } => {
            let db = state.database();
            let job = db
                .get_job(&job_id)?
                .ok_or_else(|| anyhow!("No job with id {}", job_id))?;
            println!("{} ({})", job.file_path, job.status);

            let labels: HashMap<String, String> = db
                .get_speakers(&job_id)?
                .into_iter()
                .map(|s| (s.speaker_id.clone(), s.label().to_string()))
                .collect();

            for segment in db.get_segments(&job_id)? {
                match segment.speaker.as_deref() {
                    Some(speaker) => {
                        let label = labels.get(speaker).map(String::as_str).unwrap_or(speaker);
                        println!("{} {}: {}", format_timestamp(segment.start), label, segment.text);
                    }
                    None => println!("{} {}", format_timestamp(segment.start), segment.text),
                }
            }
            Ok(())
        }
        Command::Search { query, limit } => {
            for hit in state.database().search_segments(&query, limit)? {
                println!(
                    "{} {} {}: {}",
                    hit.job_id,
                    hit.file_path,
                    format_timestamp(hit.start),
                    hit.snippet
                );
            }
            Ok(())
        }
        Command::RenameSpeaker {
            job_id,
            speaker_id,
            name,
        } => {
            if !state.database().rename_speaker(&job_id, &speaker_id, &name)? {
                return Err(anyhow!("Job {} has no speaker {}", job_id, speaker_id));
            }
            Ok(())
        }
        Command::Delete { job_id } => {
            let job = state
                .database()
                .get_job(&job_id)?
                .ok_or_else(|| anyhow!("No job with id {}", job_id))?;
            if !job.status.is_terminal() {
                return Err(anyhow!("Job {} is {}; only finished jobs can be deleted", job_id, job.status));
            }
            state.database().delete_job(&job_id)?;
            Ok(())
        }
        Command::Ping => {
            state.coordinator().ping(state.config().worker_timeouts().ping).await?;
            if let Some(info) = state.supervisor().info() {
                println!(
                    "Worker ready: device={} compute={} version={}",
                    info.device.unwrap_or_default(),
                    info.compute_type.unwrap_or_default(),
                    info.version.unwrap_or_default()
                );
            }
            state.shutdown().await;
            Ok(())
        }
    }
}

/// Drain the queue, printing events. Ctrl-C cancels the active job and
/// leaves the rest pending.
async fn process_backlog(state: AppState, mut events: UnboundedReceiver<JobEvent>) -> Result<()> {
    let printer = tokio::spawn(async move {
        let mut failed = 0usize;
        while let Some(event) = events.recv().await {
            match event {
                JobEvent::Created { .. } => {}
                JobEvent::Progress { job_id, percent, stage } => {
                    println!("{} {:>3}% {}", short_id(&job_id), percent, stage)
                }
                JobEvent::Completed {
                    job_id,
                    duration_seconds,
                    segment_count,
                } => println!(
                    "{} done: {} segment(s) over {:.1}s",
                    short_id(&job_id),
                    segment_count,
                    duration_seconds
                ),
                JobEvent::Failed { job_id, error } => {
                    failed += 1;
                    println!("{} failed: {}", short_id(&job_id), error)
                }
            }
        }
        failed
    });

    let mut processing = state.spawn_processing();
    tokio::select! {
        _ = &mut processing => {}
        _ = tokio::signal::ctrl_c() => {
            println!("Interrupted, cancelling the active job");
            state.queue().pause();
            state.queue().cancel_active().await;
            let _ = processing.await;
        }
    }

    state.shutdown().await;
    drop(state);

    let failed = printer.await.unwrap_or(0);
    if failed > 0 {
        return Err(anyhow!("{} job(s) failed", failed));
    }
    Ok(())
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
