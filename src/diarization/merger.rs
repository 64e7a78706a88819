// Transcript-speaker merger
//
// Aligns clustered audio segments with transcript utterances. Each
// utterance goes to the cluster with the greatest temporal overlap;
// segment boundaries are padded by a small gap tolerance when testing for
// a match. Cluster-to-label assignment is first-seen order over segments
// sorted by start time and never changes for the rest of the run.

use std::collections::HashMap;

use log::{debug, info};

use super::types::{AlignmentFailure, AudioSegment, LabeledUtterance, TranscriptUtterance};

/// Sentinel label for utterances with no temporal match
pub const UNKNOWN_SPEAKER_LABEL: &str = "Unknown";

/// How far outside a segment an utterance may sit and still match
pub const GAP_TOLERANCE_SECS: f64 = 0.5;

/// Result of merging segments with a transcript
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// Labeled utterances in transcript order
    pub utterances: Vec<LabeledUtterance>,
    /// Utterances that matched nothing (non-fatal, surfaced for observability)
    pub failures: Vec<AlignmentFailure>,
    /// Cluster ID to speaker label assignment used for this run
    pub labels: HashMap<usize, String>,
}

/// Merge clustered segments with transcript utterances
pub fn merge(segments: &[AudioSegment], utterances: &[TranscriptUtterance]) -> MergeOutcome {
    let labels = assign_labels(segments);
    let mut labeled = Vec::with_capacity(utterances.len());
    let mut failures = Vec::new();

    for (index, utterance) in utterances.iter().enumerate() {
        let best = best_match(utterance, segments);

        let (segment, overlap) = match best {
            Some(found) => found,
            None => {
                debug!(
                    "No speaker match for utterance {} at {:.2}-{:.2}s",
                    index, utterance.start_time, utterance.end_time
                );
                failures.push(AlignmentFailure {
                    utterance_index: index,
                    start_time: utterance.start_time,
                    end_time: utterance.end_time,
                });
                labeled.push(LabeledUtterance {
                    text: utterance.text.clone(),
                    start_time: utterance.start_time,
                    end_time: utterance.end_time,
                    speaker_label: UNKNOWN_SPEAKER_LABEL.to_string(),
                    alignment_confidence: 0.0,
                    is_overlapping: false,
                });
                continue;
            }
        };

        let confidence = alignment_confidence(utterance, overlap);
        let label = labels
            .get(&segment.cluster_id)
            .cloned()
            .unwrap_or_else(|| UNKNOWN_SPEAKER_LABEL.to_string());

        labeled.push(LabeledUtterance {
            text: utterance.text.clone(),
            start_time: utterance.start_time,
            end_time: utterance.end_time,
            speaker_label: label,
            alignment_confidence: confidence,
            is_overlapping: segment.is_overlapping,
        });

        // Overlapping speech is attributed to both clusters: emit the same
        // utterance under the second cluster's label for time accounting
        if segment.is_overlapping {
            if let Some((other, other_overlap)) =
                best_match_excluding(utterance, segments, segment.cluster_id)
            {
                let other_label = labels
                    .get(&other.cluster_id)
                    .cloned()
                    .unwrap_or_else(|| UNKNOWN_SPEAKER_LABEL.to_string());
                labeled.push(LabeledUtterance {
                    text: utterance.text.clone(),
                    start_time: utterance.start_time,
                    end_time: utterance.end_time,
                    speaker_label: other_label,
                    alignment_confidence: alignment_confidence(utterance, other_overlap),
                    is_overlapping: true,
                });
            }
        }
    }

    info!(
        "Merged {} utterances against {} segments ({} unaligned)",
        utterances.len(),
        segments.len(),
        failures.len()
    );

    MergeOutcome {
        utterances: labeled,
        failures,
        labels,
    }
}

/// Assign "Speaker N" labels to clusters in order of first appearance
fn assign_labels(segments: &[AudioSegment]) -> HashMap<usize, String> {
    let mut ordered: Vec<&AudioSegment> = segments.iter().collect();
    ordered.sort_by(|a, b| {
        a.start_time
            .partial_cmp(&b.start_time)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cluster_id.cmp(&b.cluster_id))
    });

    let mut labels = HashMap::new();
    let mut next = 1usize;
    for segment in ordered {
        labels.entry(segment.cluster_id).or_insert_with(|| {
            let label = format!("Speaker {}", next);
            next += 1;
            label
        });
    }
    labels
}

/// True overlap between an utterance and a segment, in seconds
fn true_overlap(utterance: &TranscriptUtterance, segment: &AudioSegment) -> f64 {
    (utterance.end_time.min(segment.end_time) - utterance.start_time.max(segment.start_time))
        .max(0.0)
}

/// Overlap with the segment boundaries padded by the gap tolerance
fn padded_overlap(utterance: &TranscriptUtterance, segment: &AudioSegment) -> f64 {
    (utterance.end_time.min(segment.end_time + GAP_TOLERANCE_SECS)
        - utterance
            .start_time
            .max(segment.start_time - GAP_TOLERANCE_SECS))
    .max(0.0)
}

/// Best-matching segment by true overlap, falling back to the padded test
fn best_match<'a>(
    utterance: &TranscriptUtterance,
    segments: &'a [AudioSegment],
) -> Option<(&'a AudioSegment, f64)> {
    segments
        .iter()
        .filter(|s| padded_overlap(utterance, s) > 0.0)
        .map(|s| (s, true_overlap(utterance, s)))
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
}

fn best_match_excluding<'a>(
    utterance: &TranscriptUtterance,
    segments: &'a [AudioSegment],
    excluded_cluster: usize,
) -> Option<(&'a AudioSegment, f64)> {
    segments
        .iter()
        .filter(|s| s.cluster_id != excluded_cluster)
        .filter(|s| padded_overlap(utterance, s) > 0.0)
        .map(|s| (s, true_overlap(utterance, s)))
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
}

fn alignment_confidence(utterance: &TranscriptUtterance, overlap: f64) -> f32 {
    let duration = utterance.duration();
    if duration <= 0.0 {
        return 0.0;
    }
    ((overlap / duration) as f32).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(start: f64, end: f64, cluster_id: usize) -> AudioSegment {
        AudioSegment {
            start_time: start,
            end_time: end,
            cluster_id,
            is_overlapping: false,
        }
    }

    fn utterance(text: &str, start: f64, end: f64) -> TranscriptUtterance {
        TranscriptUtterance {
            text: text.to_string(),
            start_time: start,
            end_time: end,
        }
    }

    #[test]
    fn test_greatest_overlap_wins() {
        let segments = vec![segment(0.0, 5.0, 0), segment(5.0, 10.0, 1)];
        let utterances = vec![utterance("mostly second", 4.0, 9.0)];

        let outcome = merge(&segments, &utterances);
        assert_eq!(outcome.utterances.len(), 1);
        assert_eq!(outcome.utterances[0].speaker_label, "Speaker 2");
        // 4 of 5 seconds covered
        assert!((outcome.utterances[0].alignment_confidence - 0.8).abs() < 0.001);
    }

    #[test]
    fn test_labels_assigned_first_seen_and_stable() {
        // Cluster 3 appears first in time, so it becomes Speaker 1
        let segments = vec![segment(0.0, 4.0, 3), segment(4.0, 8.0, 0)];
        let utterances = vec![
            utterance("first", 0.0, 3.0),
            utterance("second", 4.5, 7.5),
        ];

        let outcome = merge(&segments, &utterances);
        assert_eq!(outcome.utterances[0].speaker_label, "Speaker 1");
        assert_eq!(outcome.utterances[1].speaker_label, "Speaker 2");

        // Re-running yields identical labels
        let again = merge(&segments, &utterances);
        for (a, b) in outcome.utterances.iter().zip(again.utterances.iter()) {
            assert_eq!(a.speaker_label, b.speaker_label);
        }
    }

    #[test]
    fn test_gap_tolerance_allows_near_match() {
        let segments = vec![segment(0.0, 5.0, 0)];
        // Starts 0.3s after the segment ends: within tolerance
        let utterances = vec![utterance("late", 5.3, 6.0)];

        let outcome = merge(&segments, &utterances);
        assert_eq!(outcome.utterances[0].speaker_label, "Speaker 1");
        assert!(outcome.failures.is_empty());
        // No true overlap, so confidence is zero
        assert_eq!(outcome.utterances[0].alignment_confidence, 0.0);
    }

    #[test]
    fn test_unaligned_utterance_gets_unknown_sentinel() {
        let segments = vec![segment(0.0, 5.0, 0)];
        let utterances = vec![utterance("way later", 10.0, 12.0)];

        let outcome = merge(&segments, &utterances);
        assert_eq!(outcome.utterances[0].speaker_label, UNKNOWN_SPEAKER_LABEL);
        assert_eq!(outcome.utterances[0].alignment_confidence, 0.0);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].utterance_index, 0);
    }

    #[test]
    fn test_overlapping_segment_duplicates_utterance() {
        let mut overlapped_a = segment(4.0, 6.0, 0);
        overlapped_a.is_overlapping = true;
        let mut overlapped_b = segment(4.0, 6.0, 1);
        overlapped_b.is_overlapping = true;

        let segments = vec![
            segment(0.0, 4.0, 0),
            overlapped_a,
            overlapped_b,
            segment(6.0, 9.0, 1),
        ];
        let utterances = vec![utterance("both talking", 4.2, 5.8)];

        let outcome = merge(&segments, &utterances);
        assert_eq!(outcome.utterances.len(), 2);
        assert!(outcome.utterances.iter().all(|u| u.is_overlapping));

        let labels: Vec<&str> = outcome
            .utterances
            .iter()
            .map(|u| u.speaker_label.as_str())
            .collect();
        assert!(labels.contains(&"Speaker 1"));
        assert!(labels.contains(&"Speaker 2"));
    }

    #[test]
    fn test_transcript_order_preserved() {
        let segments = vec![segment(0.0, 10.0, 0)];
        let utterances = vec![
            utterance("one", 0.0, 2.0),
            utterance("two", 2.0, 4.0),
            utterance("three", 4.0, 6.0),
        ];

        let outcome = merge(&segments, &utterances);
        let texts: Vec<&str> = outcome.utterances.iter().map(|u| u.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
    }
}
