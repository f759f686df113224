// transcription/types.rs
//
// Transcript data types shared by the chunk driver, the pipeline and storage.

use serde::{Deserialize, Serialize};

/// A span of recognized text. Times are seconds from the start of the input
/// file, never relative to a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

impl Segment {
    pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            end: end.max(start),
            text: text.into(),
            speaker: None,
            confidence: None,
        }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// What the engine returns for one window
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowTranscript {
    pub text: String,
    pub language: Option<String>,
    pub confidence: Option<f32>,
}

/// One slice of the input handed to the engine
#[derive(Debug, Clone, Copy)]
pub struct AudioWindow<'a> {
    pub index: usize,
    /// File-absolute start, seconds
    pub start: f64,
    /// File-absolute end, seconds
    pub end: f64,
    pub samples: &'a [f32],
    pub sample_rate: u32,
}

/// Format seconds as [MM:SS]
pub fn format_timestamp(seconds: f64) -> String {
    let total_seconds = seconds.max(0.0).floor() as u64;
    format!("[{:02}:{:02}]", total_seconds / 60, total_seconds % 60)
}
