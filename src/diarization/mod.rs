// Speaker diarization support
//
// The diarization engine itself runs in the worker process; this module
// maps its speaker turns onto transcript segments and derives per-job
// speaker identities.

pub mod aligner;
pub mod speakers;

pub use aligner::{align, find_best_speaker, overlap, SpeakerSegment, UNKNOWN_SPEAKER};
pub use speakers::{build_speakers, distinct_speakers, Speaker, SPEAKER_PALETTE};
