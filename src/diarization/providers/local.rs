// Local transcript analysis
//
// Self-introduction detection with compiled regex patterns. This is the
// fully local identification path: no transcript text leaves the process.
// The local embedding backend has no counterpart here because it is the
// host's model integration, injected into the registry as a trait object.

use async_trait::async_trait;
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;

use super::TranscriptAnalyzer;
use crate::diarization::errors::Result;
use crate::diarization::merger::UNKNOWN_SPEAKER_LABEL;
use crate::diarization::types::{IdentificationCandidate, LabeledUtterance};

/// Introduction patterns with their base confidence
///
/// The phrase part is case-insensitive; the captured name must be
/// capitalized (one or two words) so mid-sentence noise does not match.
static INTRO_PATTERNS: Lazy<Vec<(Regex, f32)>> = Lazy::new(|| {
    vec![
        (
            Regex::new(r"(?:(?i)\bmy name is)\s+([A-Z][A-Za-z'\-]+(?:\s+[A-Z][A-Za-z'\-]+)?)")
                .unwrap(),
            0.95,
        ),
        (
            Regex::new(r"(?:(?i)\bi(?:'m| am))\s+([A-Z][A-Za-z'\-]+(?:\s+[A-Z][A-Za-z'\-]+)?)")
                .unwrap(),
            0.85,
        ),
        (
            Regex::new(r"(?:(?i)\bthis is)\s+([A-Z][A-Za-z'\-]+(?:\s+[A-Z][A-Za-z'\-]+)?)")
                .unwrap(),
            0.75,
        ),
        (
            Regex::new(r"\b([A-Z][A-Za-z'\-]+(?:\s+[A-Z][A-Za-z'\-]+)?)\s+(?:(?i)here|speaking)\b")
                .unwrap(),
            0.6,
        ),
    ]
});

/// Capitalized words that start a sentence but are never names
const NAME_STOPWORDS: &[&str] = &[
    "The", "A", "An", "Here", "Not", "So", "Just", "Sure", "Sorry", "Going", "Very", "Really",
    "Okay", "Still", "Also", "Now", "All", "Done", "Back", "Good", "Fine", "Happy", "Glad",
    "Ready", "Afraid", "Thinking", "Trying", "Wondering",
];

/// Regex-based self-introduction detector
pub struct LocalPatternAnalyzer;

impl LocalPatternAnalyzer {
    pub fn new() -> Self {
        Self
    }

    fn looks_like_name(candidate: &str) -> bool {
        let first = match candidate.split_whitespace().next() {
            Some(word) => word,
            None => return false,
        };
        !NAME_STOPWORDS.contains(&first)
    }
}

impl Default for LocalPatternAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TranscriptAnalyzer for LocalPatternAnalyzer {
    fn provider_name(&self) -> &'static str {
        "local-patterns"
    }

    async fn extract_candidates(
        &self,
        utterances: &[LabeledUtterance],
    ) -> Result<Vec<IdentificationCandidate>> {
        let mut candidates = Vec::new();

        for (idx, utterance) in utterances.iter().enumerate() {
            // A name found in unattributed speech has no label to bind to
            if utterance.speaker_label == UNKNOWN_SPEAKER_LABEL {
                continue;
            }

            for (pattern, base_confidence) in INTRO_PATTERNS.iter() {
                for captures in pattern.captures_iter(&utterance.text) {
                    let name = captures[1].trim().to_string();
                    if !Self::looks_like_name(&name) {
                        debug!("Rejected name candidate '{}' (stop word)", name);
                        continue;
                    }

                    debug!(
                        "Found introduction '{}' for {} at utterance {}",
                        name, utterance.speaker_label, idx
                    );
                    candidates.push(IdentificationCandidate {
                        speaker_label: utterance.speaker_label.clone(),
                        name,
                        confidence: *base_confidence,
                        source_index: idx,
                    });
                }
            }
        }

        Ok(candidates)
    }
}
