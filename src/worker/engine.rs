// worker/engine.rs
//
// InferenceEngine backed by the out-of-process worker. Windows are written to
// temporary WAV files and referenced by path in the request.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::coordinator::{CallError, CallOptions, ProgressCallback, RequestCoordinator};
use super::protocol::{kinds, WireMessage};
use crate::audio::write_wav;
use crate::diarization::SpeakerSegment;
use crate::transcription::{AudioWindow, InferenceEngine, WindowTranscript};

/// Per-call timeouts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerTimeouts {
    pub ping: Duration,
    pub load_model: Duration,
    pub transcribe: Duration,
    pub diarize: Duration,
}

impl Default for WorkerTimeouts {
    fn default() -> Self {
        Self {
            ping: Duration::from_secs(10),
            load_model: Duration::from_secs(10 * 60),
            transcribe: Duration::from_secs(30 * 60),
            diarize: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct LoadedModel {
    generation: u64,
    model: String,
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireSegment {
    #[serde(default)]
    start: f64,
    #[serde(default)]
    end: f64,
    #[serde(default)]
    text: String,
    #[serde(default)]
    speaker: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

pub struct WorkerEngine {
    coordinator: Arc<RequestCoordinator>,
    timeouts: WorkerTimeouts,
    scratch_dir: Option<PathBuf>,
    loaded_model: Mutex<Option<LoadedModel>>,
    diarization_generation: Mutex<Option<u64>>,
}

impl WorkerEngine {
    pub fn new(coordinator: Arc<RequestCoordinator>, timeouts: WorkerTimeouts) -> Self {
        Self {
            coordinator,
            timeouts,
            scratch_dir: None,
            loaded_model: Mutex::new(None),
            diarization_generation: Mutex::new(None),
        }
    }

    /// Directory for temporary window files (system temp dir when unset)
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    pub fn coordinator(&self) -> &Arc<RequestCoordinator> {
        &self.coordinator
    }

    /// Liveness check against the running worker
    pub async fn ping(&self) -> Result<()> {
        self.coordinator.ping(self.timeouts.ping).await?;
        Ok(())
    }

    async fn call(
        &self,
        request: WireMessage,
        timeout: Duration,
        progress: Option<ProgressCallback>,
    ) -> Result<WireMessage> {
        let mut options = CallOptions::with_timeout(timeout);
        options.on_progress = progress;

        match self.coordinator.call(request, options).await {
            Ok(response) => Ok(response),
            Err(e @ CallError::Timeout { .. }) => {
                // The worker serves one request at a time; a hung one blocks everything after it
                warn!("Restarting worker after timeout: {}", e);
                self.coordinator.cancel().await;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn current_generation(&self) -> Option<u64> {
        self.coordinator.supervisor().running_generation().await
    }

    async fn ensure_diarization_model(&self, progress: Option<ProgressCallback>) -> Result<()> {
        let mut loaded = self.diarization_generation.lock().await;
        let generation = self.current_generation().await;
        if generation.is_some() && *loaded == generation {
            return Ok(());
        }

        info!("Loading diarization model");
        self.call(
            WireMessage::new(kinds::LOAD_DIARIZATION_MODEL),
            self.timeouts.load_model,
            progress,
        )
        .await
        .context("Failed to load diarization model")?;

        *loaded = self.current_generation().await;
        Ok(())
    }

    fn window_file(&self) -> Result<tempfile::NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("scribe-window-").suffix(".wav");
        let file = match self.scratch_dir {
            Some(ref dir) => {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create scratch dir {}", dir.display()))?;
                builder.tempfile_in(dir)
            }
            None => builder.tempfile(),
        };
        file.context("Failed to create temporary window file")
    }
}

fn parse_segments(response: &WireMessage) -> Result<Vec<WireSegment>> {
    match response.field("segments") {
        Some(value) => serde_json::from_value(value.clone())
            .with_context(|| format!("Malformed segments in {} response", response.kind)),
        None => Ok(Vec::new()),
    }
}

/// Collapse a worker transcription result into one window transcript
fn parse_window_transcript(response: &WireMessage) -> Result<WindowTranscript> {
    if response.kind != kinds::TRANSCRIPTION_RESULT {
        return Err(anyhow!("Unexpected response type `{}`", response.kind));
    }

    let segments = parse_segments(response)?;
    let text = if segments.is_empty() {
        response.str_field("text").unwrap_or_default().trim().to_string()
    } else {
        segments
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    };

    let scores: Vec<f32> = segments.iter().filter_map(|s| s.confidence).collect();
    let confidence = if scores.is_empty() {
        None
    } else {
        Some(scores.iter().sum::<f32>() / scores.len() as f32)
    };

    Ok(WindowTranscript {
        text,
        language: response.str_field("language").map(str::to_string),
        confidence,
    })
}

fn parse_speaker_segments(response: &WireMessage) -> Result<Vec<SpeakerSegment>> {
    if response.kind != kinds::DIARIZATION_RESULT {
        return Err(anyhow!("Unexpected response type `{}`", response.kind));
    }

    Ok(parse_segments(response)?
        .into_iter()
        .filter_map(|s| {
            let speaker = s.speaker?;
            Some(SpeakerSegment {
                start: s.start,
                end: s.end.max(s.start),
                speaker,
            })
        })
        .collect())
}

#[async_trait]
impl InferenceEngine for WorkerEngine {
    async fn load_model(
        &self,
        model: &str,
        language: Option<&str>,
        progress: Option<ProgressCallback>,
    ) -> Result<()> {
        let mut loaded = self.loaded_model.lock().await;

        if let (Some(current), Some(generation)) = (loaded.as_ref(), self.current_generation().await) {
            if current.generation == generation
                && current.model == model
                && current.language.as_deref() == language
            {
                debug!("Model {} already loaded in worker generation {}", model, generation);
                return Ok(());
            }
        }

        info!("Loading transcription model {} (language {:?})", model, language);
        let mut request = WireMessage::new(kinds::LOAD_MODEL).with_field("modelSize", model);
        if let Some(language) = language {
            request = request.with_field("language", language);
        }

        self.call(request, self.timeouts.load_model, progress)
            .await
            .with_context(|| format!("Failed to load model {}", model))?;

        *loaded = self.current_generation().await.map(|generation| LoadedModel {
            generation,
            model: model.to_string(),
            language: language.map(str::to_string),
        });
        Ok(())
    }

    async fn transcribe_window(
        &self,
        window: AudioWindow<'_>,
        language: Option<&str>,
        progress: Option<ProgressCallback>,
    ) -> Result<WindowTranscript> {
        let file = self.window_file()?;
        write_wav(file.path(), window.samples, window.sample_rate)?;

        let mut request = WireMessage::new(kinds::TRANSCRIBE)
            .with_field("filePath", file.path().to_string_lossy().to_string())
            .with_field("enableDiarization", false);
        if let Some(language) = language {
            request = request.with_field("language", language);
        }

        let response = self.call(request, self.timeouts.transcribe, progress).await?;
        parse_window_transcript(&response)
    }

    async fn diarize(
        &self,
        audio_path: &Path,
        num_speakers: Option<u32>,
        progress: Option<ProgressCallback>,
    ) -> Result<Vec<SpeakerSegment>> {
        self.ensure_diarization_model(progress.clone()).await?;

        let mut request = WireMessage::new(kinds::DIARIZE)
            .with_field("filePath", audio_path.to_string_lossy().to_string());
        if let Some(n) = num_speakers {
            request = request.with_field("numSpeakers", n);
        }

        let response = self.call(request, self.timeouts.diarize, progress).await?;
        parse_speaker_segments(&response)
    }

    async fn cancel(&self) {
        self.coordinator.cancel().await;
    }

    async fn reset(&self) -> Result<()> {
        *self.loaded_model.lock().await = None;
        *self.diarization_generation.lock().await = None;
        self.coordinator
            .supervisor()
            .ensure_started()
            .await
            .context("Failed to restart worker")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::protocol::decode_line;

    #[test]
    fn test_window_transcript_joins_segment_text() {
        let response = decode_line(
            r#"{"type":"transcriptionResult","id":"1","language":"en","segments":[
                {"start":0.0,"end":2.0,"text":" Hello ","confidence":0.8},
                {"start":2.0,"end":3.0,"text":""},
                {"start":3.0,"end":4.5,"text":"world","confidence":0.6}]}"#
                .replace('\n', "")
                .as_str(),
        )
        .unwrap();

        let transcript = parse_window_transcript(&response).unwrap();
        assert_eq!(transcript.text, "Hello world");
        assert_eq!(transcript.language.as_deref(), Some("en"));
        assert!((transcript.confidence.unwrap() - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_window_transcript_without_segments_is_empty() {
        let response = decode_line(r#"{"type":"transcriptionResult","id":"1","segments":[]}"#).unwrap();
        let transcript = parse_window_transcript(&response).unwrap();
        assert!(transcript.text.is_empty());
        assert!(transcript.confidence.is_none());
    }

    #[test]
    fn test_wrong_response_type_is_rejected() {
        let response = decode_line(r#"{"type":"pong","id":"1"}"#).unwrap();
        assert!(parse_window_transcript(&response).is_err());
        assert!(parse_speaker_segments(&response).is_err());
    }

    #[test]
    fn test_speaker_segments_skip_unlabelled_turns() {
        let response = decode_line(
            r#"{"type":"diarizationResult","id":"2","segments":[{"start":0,"end":5,"speaker":"SPEAKER_00"},{"start":5,"end":6}],"speakers":["SPEAKER_00"]}"#,
        )
        .unwrap();

        let turns = parse_speaker_segments(&response).unwrap();
        assert_eq!(
            turns,
            vec![SpeakerSegment {
                start: 0.0,
                end: 5.0,
                speaker: "SPEAKER_00".to_string()
            }]
        );
    }
}
