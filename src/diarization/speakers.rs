// diarization/speakers.rs
//
// Per-job speaker identities derived from aligned segments.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::aligner::UNKNOWN_SPEAKER;
use crate::transcription::Segment;

/// Colours handed out in order to a job's speakers
pub const SPEAKER_PALETTE: [&str; 8] = [
    "#3B82F6", "#10B981", "#F59E0B", "#EF4444", "#8B5CF6", "#EC4899", "#14B8A6", "#F97316",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Speaker {
    pub job_id: String,
    /// Identifier as produced by the diarization engine
    pub speaker_id: String,
    /// User-facing name; starts as "Speaker N" and can be renamed
    pub display_name: Option<String>,
    pub color: Option<String>,
}

impl Speaker {
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.speaker_id)
    }
}

/// Distinct speaker ids in sorted order, excluding the unknown sentinel
pub fn distinct_speakers(segments: &[Segment]) -> Vec<String> {
    segments
        .iter()
        .filter_map(|s| s.speaker.as_deref())
        .filter(|s| *s != UNKNOWN_SPEAKER)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// One speaker record per distinct id seen in `segments`
pub fn build_speakers(job_id: &str, segments: &[Segment]) -> Vec<Speaker> {
    distinct_speakers(segments)
        .into_iter()
        .enumerate()
        .map(|(i, speaker_id)| Speaker {
            job_id: job_id.to_string(),
            speaker_id,
            display_name: Some(format!("Speaker {}", i + 1)),
            color: Some(SPEAKER_PALETTE[i % SPEAKER_PALETTE.len()].to_string()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(speaker: &str) -> Segment {
        let mut s = Segment::new(0.0, 1.0, "x");
        s.speaker = Some(speaker.to_string());
        s
    }

    #[test]
    fn test_distinct_speakers_sorted_without_unknown() {
        let segments = vec![seg("SPEAKER_01"), seg("UNKNOWN"), seg("SPEAKER_00"), seg("SPEAKER_01")];
        assert_eq!(distinct_speakers(&segments), vec!["SPEAKER_00", "SPEAKER_01"]);
    }

    #[test]
    fn test_build_speakers_assigns_names_and_colours() {
        let segments = vec![seg("SPEAKER_01"), seg("SPEAKER_00")];
        let speakers = build_speakers("job-1", &segments);

        assert_eq!(speakers.len(), 2);
        assert_eq!(speakers[0].speaker_id, "SPEAKER_00");
        assert_eq!(speakers[0].label(), "Speaker 1");
        assert_eq!(speakers[0].color.as_deref(), Some(SPEAKER_PALETTE[0]));
        assert_eq!(speakers[1].color.as_deref(), Some(SPEAKER_PALETTE[1]));
        assert!(speakers.iter().all(|s| s.job_id == "job-1"));
    }

    #[test]
    fn test_no_speakers_without_labels() {
        let segments = vec![Segment::new(0.0, 1.0, "x")];
        assert!(build_speakers("job-1", &segments).is_empty());
    }
}
