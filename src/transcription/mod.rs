// Transcription module
//
// - types.rs: Segment and window types
// - engine.rs: InferenceEngine trait (the seam to the worker)
// - chunking.rs: window planning and the chunked inference driver
// - pipeline.rs: per-job processing (decode, load model, chunks, diarize)

pub mod chunking;
pub mod engine;
pub mod pipeline;
pub mod types;

pub use chunking::{plan_windows, window_count, window_progress, ChunkSettings, ChunkedDriver, WindowSpan};
pub use engine::{InferenceEngine, SharedEngine};
pub use pipeline::TranscriptionPipeline;
pub use types::{format_timestamp, AudioWindow, Segment, WindowTranscript};
