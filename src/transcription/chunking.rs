// transcription/chunking.rs
//
// Splits long input into overlapping windows the engine can handle and
// stitches the per-window results back into one file-absolute timeline.
//
// Overlapping regions are not de-duplicated: words spoken across a window
// boundary may appear in both neighbouring segments.

use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use tokio_util::sync::CancellationToken;

use super::engine::InferenceEngine;
use super::types::{AudioWindow, Segment};
use crate::audio::AudioBuffer;

/// Progress bands for one job, in percent
pub const SETUP_PROGRESS: u8 = 0;
pub const TRANSCRIBE_PROGRESS_START: u8 = 20;
pub const TRANSCRIBE_PROGRESS_SPAN: u8 = 70;
pub const DIARIZE_PROGRESS: u8 = 90;
pub const FINALIZE_PROGRESS: u8 = 95;
pub const COMPLETE_PROGRESS: u8 = 100;

/// Absorbs float noise so an exact multiple does not gain an empty window
const WINDOW_EPSILON: f64 = 1e-9;

/// Window sizing
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkSettings {
    /// Longest input the engine accepts per call, seconds
    pub ceiling_seconds: f64,
    /// Shared audio between consecutive windows, seconds
    pub overlap_seconds: f64,
}

impl ChunkSettings {
    pub fn validate(&self) -> Result<()> {
        if self.ceiling_seconds.is_nan() || self.ceiling_seconds <= 0.0 {
            return Err(anyhow!("chunk ceiling must be positive, got {}", self.ceiling_seconds));
        }
        if self.overlap_seconds < 0.0 || self.overlap_seconds >= self.ceiling_seconds {
            return Err(anyhow!(
                "chunk overlap must be in [0, {}), got {}",
                self.ceiling_seconds,
                self.overlap_seconds
            ));
        }
        Ok(())
    }

    fn stride(&self) -> f64 {
        self.ceiling_seconds - self.overlap_seconds
    }
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            ceiling_seconds: 30.0,
            overlap_seconds: 1.0,
        }
    }
}

/// A planned window, file-absolute
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSpan {
    pub index: usize,
    pub start: f64,
    pub end: f64,
}

/// Number of engine calls needed for `total` seconds of audio
pub fn window_count(total: f64, settings: &ChunkSettings) -> usize {
    if total <= settings.ceiling_seconds {
        return 1;
    }
    let n = ((total - settings.overlap_seconds) / settings.stride() - WINDOW_EPSILON).ceil();
    n.max(1.0) as usize
}

/// Window `i` covers `[i * stride, min(i * stride + ceiling, total)]`
pub fn plan_windows(total: f64, settings: &ChunkSettings) -> Vec<WindowSpan> {
    let total = total.max(0.0);
    if total <= settings.ceiling_seconds {
        return vec![WindowSpan {
            index: 0,
            start: 0.0,
            end: total,
        }];
    }

    (0..window_count(total, settings))
        .map(|index| {
            let start = index as f64 * settings.stride();
            WindowSpan {
                index,
                start,
                end: (start + settings.ceiling_seconds).min(total),
            }
        })
        .collect()
}

/// Job progress when window `index` of `total_windows` begins
pub fn window_progress(index: usize, total_windows: usize) -> u8 {
    if total_windows == 0 {
        return TRANSCRIBE_PROGRESS_START;
    }
    let fraction = index as f64 / total_windows as f64;
    TRANSCRIBE_PROGRESS_START + (fraction * TRANSCRIBE_PROGRESS_SPAN as f64).floor() as u8
}

/// Drives one engine call per window, in order
pub struct ChunkedDriver<'a> {
    engine: &'a dyn InferenceEngine,
    settings: ChunkSettings,
}

impl<'a> ChunkedDriver<'a> {
    pub fn new(engine: &'a dyn InferenceEngine, settings: ChunkSettings) -> Self {
        Self { engine, settings }
    }

    /// Transcribe the whole buffer. The first failing window, or `cancel`
    /// firing, aborts the run and nothing produced so far is returned.
    pub async fn transcribe(
        &self,
        audio: &AudioBuffer,
        language: Option<&str>,
        on_progress: &(dyn Fn(u8, &str) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<Vec<Segment>> {
        self.settings.validate()?;

        let total = audio.duration_seconds();
        let windows = plan_windows(total, &self.settings);
        let n = windows.len();

        info!(
            "Transcribing {:.2}s of audio in {} window(s) (ceiling {}s, overlap {}s)",
            total, n, self.settings.ceiling_seconds, self.settings.overlap_seconds
        );

        let mut segments = Vec::with_capacity(n);

        for span in windows {
            on_progress(
                window_progress(span.index, n),
                &format!("Transcribing chunk {}/{}", span.index + 1, n),
            );

            let window = AudioWindow {
                index: span.index,
                start: span.start,
                end: span.end,
                samples: audio.slice(span.start, span.end),
                sample_rate: audio.sample_rate,
            };

            let call = self.engine.transcribe_window(window, language, None);
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(anyhow!("Transcription cancelled")),
                result = call => result,
            };
            let result = outcome.with_context(|| {
                format!(
                    "Chunk {}/{} ({:.1}s-{:.1}s) failed",
                    span.index + 1,
                    n,
                    span.start,
                    span.end
                )
            })?;

            let text = result.text.trim();
            if text.is_empty() {
                debug!("Chunk {}/{} produced no text, skipping", span.index + 1, n);
                continue;
            }

            let mut segment = Segment::new(span.start, span.end, text);
            segment.confidence = result.confidence;
            segments.push(segment);
        }

        info!("Transcription produced {} segment(s) from {} window(s)", segments.len(), n);
        Ok(segments)
    }
}
