// diarization/aligner.rs
//
// Assigns a speaker to every transcript segment by maximum time overlap with
// the diarization output.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::transcription::Segment;

/// Label given to segments that overlap no speaker turn
pub const UNKNOWN_SPEAKER: &str = "UNKNOWN";

/// One speaker turn from the diarization engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerSegment {
    /// Start time in seconds
    pub start: f64,
    /// End time in seconds
    pub end: f64,
    /// Engine-assigned identifier (e.g. "SPEAKER_00")
    pub speaker: String,
}

/// Overlap of two closed intervals, zero if disjoint
pub fn overlap(a_start: f64, a_end: f64, b_start: f64, b_end: f64) -> f64 {
    (a_end.min(b_end) - a_start.max(b_start)).max(0.0)
}

/// The speaker segment with the largest positive overlap. Ties resolve to
/// the earliest entry in `speaker_segments`.
pub fn find_best_speaker<'a>(
    speaker_segments: &'a [SpeakerSegment],
    start: f64,
    end: f64,
) -> Option<&'a SpeakerSegment> {
    let mut best: Option<(&SpeakerSegment, f64)> = None;

    for candidate in speaker_segments {
        let amount = overlap(start, end, candidate.start, candidate.end);
        if amount <= 0.0 {
            continue;
        }
        match best {
            Some((_, best_amount)) if amount <= best_amount => {}
            _ => best = Some((candidate, amount)),
        }
    }

    best.map(|(segment, _)| segment)
}

/// Label each segment with its best-overlapping speaker, or `UNKNOWN`
pub fn align(segments: Vec<Segment>, speaker_segments: &[SpeakerSegment]) -> Vec<Segment> {
    segments
        .into_iter()
        .map(|mut segment| {
            let speaker = find_best_speaker(speaker_segments, segment.start, segment.end)
                .map(|s| s.speaker.clone())
                .unwrap_or_else(|| UNKNOWN_SPEAKER.to_string());
            debug!(
                "Segment [{:.1}s-{:.1}s] assigned to {}",
                segment.start, segment.end, speaker
            );
            segment.speaker = Some(speaker);
            segment
        })
        .collect()
}
