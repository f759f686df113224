// transcription/pipeline.rs
//
// End-to-end processing of one job: decode the input, load the model,
// transcribe window by window, optionally diarize and align speakers.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::chunking::{
    ChunkSettings, ChunkedDriver, COMPLETE_PROGRESS, DIARIZE_PROGRESS, FINALIZE_PROGRESS,
    SETUP_PROGRESS, TRANSCRIBE_PROGRESS_START,
};
use super::engine::SharedEngine;
use crate::audio::{decode_audio_file, AudioBuffer};
use crate::diarization::{align, build_speakers};
use crate::jobs::{Job, JobOutput, JobProcessor, ProgressSink};
use crate::models::ModelSelector;
use crate::worker::{ProgressCallback, ProgressUpdate};

/// Setup band progress once the input is decoded
const DECODED_PROGRESS: u8 = 5;

pub struct TranscriptionPipeline {
    engine: SharedEngine,
    chunking: ChunkSettings,
    models: ModelSelector,
    ffmpeg_path: Option<PathBuf>,
}

impl TranscriptionPipeline {
    pub fn new(engine: SharedEngine, chunking: ChunkSettings, models: ModelSelector) -> Self {
        Self {
            engine,
            chunking,
            models,
            ffmpeg_path: None,
        }
    }

    pub fn with_ffmpeg_path(mut self, path: Option<PathBuf>) -> Self {
        self.ffmpeg_path = path;
        self
    }

    pub fn engine(&self) -> &SharedEngine {
        &self.engine
    }

    async fn decode(&self, path: &Path) -> Result<AudioBuffer> {
        let path = path.to_path_buf();
        let ffmpeg = self.ffmpeg_path.clone();
        tokio::task::spawn_blocking(move || decode_audio_file(&path, ffmpeg.as_deref()))
            .await
            .context("Audio decode task failed")?
    }
}

/// Map worker-side progress for a setup step into the 5-20% band
fn setup_progress_callback(progress: ProgressSink) -> ProgressCallback {
    Arc::new(move |update: ProgressUpdate| {
        let span = (TRANSCRIBE_PROGRESS_START - DECODED_PROGRESS) as f64;
        let percent = match update.percent {
            Some(p) => DECODED_PROGRESS + (p.clamp(0.0, 100.0) / 100.0 * span).floor() as u8,
            None => DECODED_PROGRESS,
        };
        let stage = update.message.unwrap_or(update.stage);
        progress(percent.min(TRANSCRIBE_PROGRESS_START - 1), &stage);
    })
}

/// Run `fut` unless `cancel` fires first
async fn cancellable<T>(
    cancel: &CancellationToken,
    what: &str,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(anyhow!("{} cancelled", what)),
        result = fut => result,
    }
}

#[async_trait]
impl JobProcessor for TranscriptionPipeline {
    async fn process(
        &self,
        job: &Job,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<JobOutput> {
        let input = Path::new(&job.file_path);
        let language = job.config.language.as_deref();

        progress(SETUP_PROGRESS, "Preparing audio");
        let audio = cancellable(&cancel, "Audio preparation", self.decode(input)).await?;
        let duration = audio.duration_seconds();

        let choice = self.models.select(job.config.model.as_deref());
        progress(DECODED_PROGRESS, &format!("Loading {} model", choice.model));
        cancellable(
            &cancel,
            "Model loading",
            self.engine
                .load_model(&choice.model, language, Some(setup_progress_callback(progress.clone()))),
        )
        .await?;

        let driver = ChunkedDriver::new(self.engine.as_ref(), self.chunking);
        let mut segments = driver
            .transcribe(&audio, language, &*progress, &cancel)
            .await?;

        let mut speakers = Vec::new();
        if job.config.diarization {
            progress(DIARIZE_PROGRESS, "Identifying speakers");
            let turns = cancellable(
                &cancel,
                "Diarization",
                self.engine.diarize(input, job.config.num_speakers, None),
            )
            .await
            .context("Speaker diarization failed")?;

            if turns.is_empty() {
                warn!("Diarization returned no speaker turns for job {}", job.id);
            }
            segments = align(segments, &turns);
            speakers = build_speakers(&job.id, &segments);
        }

        progress(FINALIZE_PROGRESS, "Finalizing");
        info!(
            "Job {} produced {} segment(s), {} speaker(s) over {:.1}s",
            job.id,
            segments.len(),
            speakers.len(),
            duration
        );
        progress(COMPLETE_PROGRESS, "Done");

        Ok(JobOutput {
            segments,
            speakers,
            duration_seconds: duration,
            model_used: Some(choice.model),
            language: job.config.language.clone(),
        })
    }

    async fn cancel(&self) {
        self.engine.cancel().await;
    }

    async fn reset(&self) -> Result<()> {
        self.engine.reset().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::write_wav;
    use crate::diarization::SpeakerSegment;
    use crate::jobs::JobConfig;
    use crate::transcription::{AudioWindow, InferenceEngine, WindowTranscript};
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct ScriptedEngine {
        loaded: Mutex<Vec<String>>,
        windows: Mutex<usize>,
        turns: Vec<SpeakerSegment>,
    }

    #[async_trait]
    impl InferenceEngine for ScriptedEngine {
        async fn load_model(&self, model: &str, _: Option<&str>, progress: Option<ProgressCallback>) -> Result<()> {
            if let Some(progress) = progress {
                progress(ProgressUpdate {
                    percent: None,
                    stage: "downloading".to_string(),
                    message: None,
                });
            }
            self.loaded.lock().unwrap().push(model.to_string());
            Ok(())
        }

        async fn transcribe_window(
            &self,
            window: AudioWindow<'_>,
            _: Option<&str>,
            _: Option<ProgressCallback>,
        ) -> Result<WindowTranscript> {
            *self.windows.lock().unwrap() += 1;
            Ok(WindowTranscript {
                text: format!("text {}", window.index),
                ..Default::default()
            })
        }

        async fn diarize(&self, _: &Path, _: Option<u32>, _: Option<ProgressCallback>) -> Result<Vec<SpeakerSegment>> {
            Ok(self.turns.clone())
        }

        async fn cancel(&self) {}

        async fn reset(&self) -> Result<()> {
            Ok(())
        }
    }

    fn wav(dir: &Path, seconds: usize) -> String {
        let path = dir.join(format!("{}s.wav", seconds));
        write_wav(&path, &vec![0.2; seconds * 1000], 1000).unwrap();
        path.to_string_lossy().to_string()
    }

    fn pipeline(engine: Arc<ScriptedEngine>) -> TranscriptionPipeline {
        TranscriptionPipeline::new(
            engine,
            ChunkSettings::default(),
            ModelSelector::new(vec!["base".to_string()], None),
        )
    }

    fn collect_progress() -> (ProgressSink, Arc<Mutex<Vec<u8>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (Arc::new(move |p: u8, _: &str| sink.lock().unwrap().push(p)), seen)
    }

    #[tokio::test]
    async fn test_transcribes_and_aligns_speakers() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(ScriptedEngine {
            turns: vec![
                SpeakerSegment {
                    start: 0.0,
                    end: 40.0,
                    speaker: "SPEAKER_01".to_string(),
                },
                SpeakerSegment {
                    start: 40.0,
                    end: 90.0,
                    speaker: "SPEAKER_00".to_string(),
                },
            ],
            ..Default::default()
        });
        let job = Job::new(
            wav(dir.path(), 90),
            JobConfig {
                model: Some("small".to_string()),
                diarization: true,
                ..Default::default()
            },
        );

        let (sink, seen) = collect_progress();
        let output = pipeline(engine.clone())
            .process(&job, sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*engine.windows.lock().unwrap(), 4);
        assert_eq!(*engine.loaded.lock().unwrap(), vec!["small".to_string()]);
        assert_eq!(output.segments.len(), 4);
        assert_eq!(output.segments[0].speaker.as_deref(), Some("SPEAKER_01"));
        assert_eq!(output.segments[3].speaker.as_deref(), Some("SPEAKER_00"));
        assert_eq!(output.speakers.len(), 2);
        assert_eq!(output.model_used.as_deref(), Some("small"));
        assert!((output.duration_seconds - 90.0).abs() < 1e-9);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.first(), Some(&0));
        assert!(seen.contains(&FINALIZE_PROGRESS));
        assert_eq!(seen.last(), Some(&COMPLETE_PROGRESS));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_without_diarization_segments_have_no_speaker() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(ScriptedEngine::default());
        let job = Job::new(wav(dir.path(), 10), JobConfig::default());

        let (sink, _) = collect_progress();
        let output = pipeline(engine.clone())
            .process(&job, sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output.segments.len(), 1);
        assert!(output.segments[0].speaker.is_none());
        assert!(output.speakers.is_empty());
        // Auto selection falls back to the head of the preference list
        assert_eq!(output.model_used.as_deref(), Some("base"));
    }

    #[tokio::test]
    async fn test_missing_input_fails() {
        let engine = Arc::new(ScriptedEngine::default());
        let job = Job::new("/nonexistent/input.wav", JobConfig::default());
        let (sink, _) = collect_progress();

        let err = pipeline(engine.clone())
            .process(&job, sink, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("does not exist"));
        assert_eq!(*engine.windows.lock().unwrap(), 0);
    }
}
