// transcription/engine.rs
//
// Seam between the job pipeline and whatever performs inference. The
// production implementation talks to the worker process; tests substitute
// in-memory engines.

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

use super::types::{AudioWindow, WindowTranscript};
use crate::diarization::SpeakerSegment;
use crate::worker::ProgressCallback;

#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Make `model` the active transcription model. Cheap when already loaded.
    async fn load_model(
        &self,
        model: &str,
        language: Option<&str>,
        progress: Option<ProgressCallback>,
    ) -> Result<()>;

    /// Transcribe one bounded window of audio
    async fn transcribe_window(
        &self,
        window: AudioWindow<'_>,
        language: Option<&str>,
        progress: Option<ProgressCallback>,
    ) -> Result<WindowTranscript>;

    /// Speaker turns over the whole file
    async fn diarize(
        &self,
        audio_path: &Path,
        num_speakers: Option<u32>,
        progress: Option<ProgressCallback>,
    ) -> Result<Vec<SpeakerSegment>>;

    /// Abort in-flight work. Every outstanding call fails.
    async fn cancel(&self);

    /// Return to a clean state before the next job
    async fn reset(&self) -> Result<()>;
}

/// Shorthand used where engines are shared across tasks
pub type SharedEngine = std::sync::Arc<dyn InferenceEngine>;
