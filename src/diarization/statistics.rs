// Statistics aggregator
//
// Pure function of its input: per-speaker speaking time, percentage of the
// meeting, and turn counts, recomputed from the labeled utterances on
// every call. Overlapping utterances contribute their full duration to
// every attributed speaker, so percentages may legitimately sum above 100.

use std::collections::HashMap;

use super::types::{LabeledUtterance, SpeakerStatistics};

/// Compute per-speaker statistics from labeled utterances
///
/// A turn is a maximal contiguous run of utterances sharing one
/// speaker_label in time order. Output follows first-appearance order in
/// the time-sorted sequence; ordering beyond that is the caller's concern.
pub fn aggregate(
    utterances: &[LabeledUtterance],
    meeting_total_duration: f64,
) -> Vec<SpeakerStatistics> {
    let mut ordered: Vec<&LabeledUtterance> = utterances.iter().collect();
    ordered.sort_by(|a, b| {
        a.start_time
            .partial_cmp(&b.start_time)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                a.end_time
                    .partial_cmp(&b.end_time)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(a.speaker_label.cmp(&b.speaker_label))
    });

    let mut speaking_time: HashMap<&str, f64> = HashMap::new();
    let mut turn_count: HashMap<&str, u32> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();
    let mut previous_label: Option<&str> = None;

    for utterance in ordered {
        let label = utterance.speaker_label.as_str();

        if !speaking_time.contains_key(label) {
            order.push(label);
        }
        *speaking_time.entry(label).or_insert(0.0) += utterance.duration();

        if previous_label != Some(label) {
            *turn_count.entry(label).or_insert(0) += 1;
        }
        previous_label = Some(label);
    }

    order
        .into_iter()
        .map(|label| {
            let seconds = speaking_time.get(label).copied().unwrap_or(0.0);
            let percentage = if meeting_total_duration > 0.0 {
                (seconds / meeting_total_duration * 100.0) as f32
            } else {
                0.0
            };
            SpeakerStatistics {
                speaker_label: label.to_string(),
                speaking_time_seconds: seconds,
                speaking_percentage: percentage,
                turn_count: turn_count.get(label).copied().unwrap_or(0),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utterance(label: &str, start: f64, end: f64) -> LabeledUtterance {
        LabeledUtterance {
            text: String::new(),
            start_time: start,
            end_time: end,
            speaker_label: label.to_string(),
            alignment_confidence: 1.0,
            is_overlapping: false,
        }
    }

    fn overlapping(label: &str, start: f64, end: f64) -> LabeledUtterance {
        LabeledUtterance {
            is_overlapping: true,
            ..utterance(label, start, end)
        }
    }

    #[test]
    fn test_two_speaker_scenario() {
        // [0-5s A, 5-13s B, 13-18s A] over an 18s meeting
        let utterances = vec![
            utterance("Speaker 1", 0.0, 5.0),
            utterance("Speaker 2", 5.0, 13.0),
            utterance("Speaker 1", 13.0, 18.0),
        ];

        let stats = aggregate(&utterances, 18.0);
        assert_eq!(stats.len(), 2);

        assert_eq!(stats[0].speaker_label, "Speaker 1");
        assert!((stats[0].speaking_time_seconds - 10.0).abs() < 1e-9);
        assert!((stats[0].speaking_percentage - 55.555_6).abs() < 0.01);
        assert_eq!(stats[0].turn_count, 2);

        assert_eq!(stats[1].speaker_label, "Speaker 2");
        assert!((stats[1].speaking_time_seconds - 8.0).abs() < 1e-9);
        assert!((stats[1].speaking_percentage - 44.444_4).abs() < 0.01);
        assert_eq!(stats[1].turn_count, 1);
    }

    #[test]
    fn test_idempotent_and_deterministic() {
        let utterances = vec![
            utterance("Speaker 1", 0.0, 4.0),
            utterance("Speaker 2", 4.0, 9.0),
            utterance("Speaker 1", 9.0, 11.0),
        ];

        let first = aggregate(&utterances, 11.0);
        let second = aggregate(&utterances, 11.0);
        assert_eq!(first, second);
    }

    #[test]
    fn test_overlap_counts_toward_every_speaker() {
        let utterances = vec![
            utterance("Speaker 1", 0.0, 4.0),
            overlapping("Speaker 1", 4.0, 6.0),
            overlapping("Speaker 2", 4.0, 6.0),
            utterance("Speaker 2", 6.0, 10.0),
        ];

        let stats = aggregate(&utterances, 10.0);
        let total_pct: f32 = stats.iter().map(|s| s.speaking_percentage).sum();

        assert!((stats[0].speaking_time_seconds - 6.0).abs() < 1e-9);
        assert!((stats[1].speaking_time_seconds - 6.0).abs() < 1e-9);
        // Overlap legitimately pushes the sum above 100%
        assert!(total_pct > 100.0);
    }

    #[test]
    fn test_contiguous_run_is_one_turn() {
        let utterances = vec![
            utterance("Speaker 1", 0.0, 2.0),
            utterance("Speaker 1", 2.0, 4.0),
            utterance("Speaker 1", 4.0, 6.0),
            utterance("Speaker 2", 6.0, 8.0),
            utterance("Speaker 1", 8.0, 10.0),
        ];

        let stats = aggregate(&utterances, 10.0);
        assert_eq!(stats[0].turn_count, 2);
        assert_eq!(stats[1].turn_count, 1);
    }

    #[test]
    fn test_input_order_does_not_matter() {
        let sorted = vec![
            utterance("Speaker 1", 0.0, 5.0),
            utterance("Speaker 2", 5.0, 13.0),
            utterance("Speaker 1", 13.0, 18.0),
        ];
        let shuffled = vec![sorted[2].clone(), sorted[0].clone(), sorted[1].clone()];

        assert_eq!(aggregate(&sorted, 18.0), aggregate(&shuffled, 18.0));
    }

    #[test]
    fn test_empty_and_zero_duration() {
        assert!(aggregate(&[], 10.0).is_empty());

        let utterances = vec![utterance("Speaker 1", 0.0, 5.0)];
        let stats = aggregate(&utterances, 0.0);
        assert_eq!(stats[0].speaking_percentage, 0.0);
    }
}
