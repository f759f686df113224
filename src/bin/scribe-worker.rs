//! Reference worker
//!
//! Speaks the line-delimited JSON protocol on stdin/stdout with a
//! deterministic stub engine: a window with audible signal transcribes to a
//! fixed sentence, a silent one to nothing, and diarization alternates two
//! speakers every few seconds.
//!
//! stdout carries protocol lines only; logs go to stderr.
//!
//! Test switches (environment):
//! - `SCRIBE_STUB_SKIP_READY=1`   never announce `ready`
//! - `SCRIBE_STUB_DELAY_MS=<n>`   sleep before every response
//! - `SCRIBE_STUB_HANG=<type>`    never answer requests of that type
//! - `SCRIBE_STUB_FAIL=<type>`    answer requests of that type with an error
//! - `SCRIBE_STUB_CRASH=<type>`   exit abruptly on a request of that type

use std::io::{self, BufRead, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::json;

use scribe_lib::audio::read_wav;
use scribe_lib::worker::{decode_line, encode, kinds, WireMessage};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// RMS below this counts as silence
const SILENCE_RMS: f32 = 0.01;

/// Length of each alternating speaker turn, seconds
const TURN_SECONDS: f64 = 10.0;

struct StubSettings {
    skip_ready: bool,
    delay: Option<Duration>,
    hang_on: Option<String>,
    fail_on: Option<String>,
    crash_on: Option<String>,
}

impl StubSettings {
    fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            skip_ready: var("SCRIBE_STUB_SKIP_READY").is_some(),
            delay: var("SCRIBE_STUB_DELAY_MS")
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis),
            hang_on: var("SCRIBE_STUB_HANG"),
            fail_on: var("SCRIBE_STUB_FAIL"),
            crash_on: var("SCRIBE_STUB_CRASH"),
        }
    }
}

fn emit(message: &WireMessage) -> Result<()> {
    let line = encode(message)?;
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    handle.write_all(line.as_bytes())?;
    handle.flush()?;
    Ok(())
}

fn progress(id: Option<&str>, percent: f64, stage: &str, message: &str) -> Result<()> {
    let mut update = WireMessage::new(kinds::PROGRESS)
        .with_field("percent", percent)
        .with_field("stage", stage)
        .with_field("message", message);
    if let Some(id) = id {
        update = update.with_id(id);
    }
    emit(&update)
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

fn file_path(request: &WireMessage) -> Result<&Path> {
    request
        .str_field("filePath")
        .map(Path::new)
        .ok_or_else(|| anyhow!("Missing filePath"))
}

fn handle_load_model(request: &WireMessage) -> Result<WireMessage> {
    let model = request.str_field("modelSize").unwrap_or("base").to_string();
    let id = request.id.as_deref();

    progress(id, -1.0, "downloading", &format!("Fetching {} model", model))?;
    progress(id, 100.0, "loading", &format!("Loaded {} model", model))?;
    log::info!("Stub model {} loaded", model);

    Ok(WireMessage::new(kinds::MODEL_LOADED).with_field("modelSize", model))
}

fn handle_transcribe(request: &WireMessage) -> Result<WireMessage> {
    let path = file_path(request)?;
    let id = request.id.as_deref();
    let audio = read_wav(path)?;
    let duration = audio.duration_seconds();

    progress(id, 0.0, "transcribing", "Transcribing audio")?;

    let segments = if rms(&audio.samples) >= SILENCE_RMS {
        vec![json!({
            "start": 0.0,
            "end": duration,
            "text": format!("speech for {:.1} seconds", duration),
            "confidence": 0.9,
        })]
    } else {
        log::debug!("{} is silent", path.display());
        Vec::new()
    };

    progress(id, 100.0, "transcribing", "Transcription complete")?;

    let language = request.str_field("language").unwrap_or("en").to_string();
    Ok(WireMessage::new(kinds::TRANSCRIPTION_RESULT)
        .with_field("segments", segments)
        .with_field("language", language)
        .with_field("duration", duration))
}

fn handle_diarize(request: &WireMessage) -> Result<WireMessage> {
    let path = file_path(request)?;
    let audio = read_wav(path)?;
    let duration = audio.duration_seconds();
    let speaker_count = request
        .field("numSpeakers")
        .and_then(|v| v.as_u64())
        .filter(|n| *n > 0)
        .unwrap_or(2);

    progress(request.id.as_deref(), 50.0, "diarizing", "Identifying speakers")?;

    let mut segments = Vec::new();
    let mut start = 0.0;
    let mut turn = 0u64;
    while start < duration {
        let end = (start + TURN_SECONDS).min(duration);
        segments.push(json!({
            "start": start,
            "end": end,
            "speaker": format!("SPEAKER_{:02}", turn % speaker_count),
        }));
        start = end;
        turn += 1;
    }
    let speakers: Vec<String> = (0..speaker_count.min(turn.max(1)))
        .map(|n| format!("SPEAKER_{:02}", n))
        .collect();

    Ok(WireMessage::new(kinds::DIARIZATION_RESULT)
        .with_field("segments", segments)
        .with_field("speakers", speakers))
}

fn process_request(request: &WireMessage) -> Result<WireMessage> {
    match request.kind.as_str() {
        kinds::PING => Ok(WireMessage::new(kinds::PONG)),
        kinds::LOAD_MODEL => handle_load_model(request),
        kinds::LOAD_DIARIZATION_MODEL => Ok(WireMessage::new(kinds::DIARIZATION_MODEL_LOADED)),
        kinds::TRANSCRIBE => handle_transcribe(request).context("Transcription failed"),
        kinds::DIARIZE => handle_diarize(request).context("Diarization failed"),
        other => Err(anyhow!("Unknown request type: {}", other)),
    }
}

fn error_message(id: Option<String>, error: String) -> WireMessage {
    let message = WireMessage::new(kinds::ERROR).with_field("error", error);
    match id {
        Some(id) => message.with_id(id),
        None => message,
    }
}

fn main() {
    // Default env_logger target is stderr
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let settings = StubSettings::from_env();
    log::info!("scribe-worker {} starting (stub engine)", VERSION);

    if !settings.skip_ready {
        let ready = WireMessage::new(kinds::READY)
            .with_field("device", "cpu")
            .with_field("version", VERSION)
            .with_field("computeType", "int8");
        if let Err(e) = emit(&ready) {
            log::error!("Failed to announce ready: {}", e);
            std::process::exit(1);
        }
    }

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                log::error!("Failed to read line: {}", e);
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let request = match decode_line(&line) {
            Ok(request) => request,
            Err(e) => {
                log::error!("Failed to parse request: {}", e);
                let _ = emit(&error_message(None, format!("Parse error: {}", e)));
                continue;
            }
        };

        log::debug!("Received {} (id={:?})", request.kind, request.id);
        let kind = request.kind.as_str();

        if settings.crash_on.as_deref() == Some(kind) {
            log::error!("Simulated crash on {}", kind);
            std::process::exit(3);
        }

        if settings.hang_on.as_deref() == Some(kind) {
            log::warn!("Simulated hang on {}", kind);
            loop {
                std::thread::sleep(Duration::from_secs(3600));
            }
        }

        if let Some(delay) = settings.delay {
            std::thread::sleep(delay);
        }

        let response = if settings.fail_on.as_deref() == Some(kind) {
            error_message(request.id.clone(), format!("Simulated failure on {}", kind))
        } else {
            match process_request(&request) {
                Ok(response) => match request.id.clone() {
                    Some(id) => response.with_id(id),
                    None => response,
                },
                Err(e) => error_message(request.id.clone(), format!("{:#}", e)),
            }
        };

        if let Err(e) = emit(&response) {
            log::error!("Failed to write response: {}", e);
            break;
        }
    }

    log::info!("scribe-worker shutting down");
}
