// Speaker identification engine
//
// Turns labeled utterances into committed name mappings: the routed
// analyzer extracts raw self-introduction candidates, confidence is shaped
// by name and context quality, conflicts resolve per label, and only
// candidates at or above the run's confidence threshold are committed.
// Everything below the threshold stays a plain speaker label.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::timeout;

use super::errors::{DiarizationError, Result};
use super::router::{ExecutionTarget, ProviderRouter};
use super::types::{
    Capability, IdentificationCandidate, LabeledUtterance, MappingSource, PrivacyMode,
    SpeakerMapping,
};

/// Confidence boost when the introduction holds for the speaker's next
/// utterance without contradiction
const FOLLOW_ON_BOOST: f32 = 0.05;

/// Filler words that degrade context quality
const FILLER_WORDS: &[&str] = &["um", "uh", "like", "you know", "i mean"];

/// Result of an identification pass
#[derive(Debug, Clone)]
pub struct IdentificationOutcome {
    /// Mappings at or above the confidence threshold
    pub committed: Vec<SpeakerMapping>,
    /// Candidates that stayed below the threshold (observability only)
    pub rejected: Vec<IdentificationCandidate>,
}

/// Identification engine for one run
pub struct IdentificationEngine {
    router: Arc<ProviderRouter>,
    call_timeout: Duration,
}

impl IdentificationEngine {
    pub fn new(router: Arc<ProviderRouter>, call_timeout: Duration) -> Self {
        Self {
            router,
            call_timeout,
        }
    }

    /// Extract, score and gate name candidates for the given utterances
    pub async fn identify(
        &self,
        utterances: &[LabeledUtterance],
        confidence_threshold: f32,
    ) -> Result<IdentificationOutcome> {
        if utterances.is_empty() {
            return Ok(IdentificationOutcome {
                committed: Vec::new(),
                rejected: Vec::new(),
            });
        }

        let raw = self.extract(utterances).await?;
        let shaped = shape_candidates(raw, utterances);
        let resolved = resolve_conflicts(shaped);
        let (committed, rejected) = gate_candidates(resolved, confidence_threshold);

        info!(
            "Identification: {} committed, {} below threshold {:.2}",
            committed.len(),
            rejected.len(),
            confidence_threshold
        );

        Ok(IdentificationOutcome {
            committed,
            rejected,
        })
    }

    /// Run the routed analyzer, falling back per privacy mode
    async fn extract(
        &self,
        utterances: &[LabeledUtterance],
    ) -> Result<Vec<IdentificationCandidate>> {
        let target = self.router.select(Capability::Identification)?;
        let registry = self.router.registry();

        let analyzer = match target {
            ExecutionTarget::Local => registry.local_analyzer(),
            ExecutionTarget::External => registry.external_analyzer(),
        }
        .ok_or_else(|| DiarizationError::ModelUnavailable {
            capability: Capability::Identification,
            reason: "selected provider disappeared from registry".to_string(),
        })?;

        match timeout(self.call_timeout, analyzer.extract_candidates(utterances)).await {
            Ok(Ok(candidates)) => {
                if target == ExecutionTarget::External {
                    self.router.record_external_success();
                }
                Ok(candidates)
            }
            Ok(Err(e)) => self.handle_failure(target, utterances, e).await,
            Err(_) => {
                self.handle_failure(
                    target,
                    utterances,
                    DiarizationError::ExternalProviderError(format!(
                        "analysis timed out after {:?}",
                        self.call_timeout
                    )),
                )
                .await
            }
        }
    }

    async fn handle_failure(
        &self,
        target: ExecutionTarget,
        utterances: &[LabeledUtterance],
        error: DiarizationError,
    ) -> Result<Vec<IdentificationCandidate>> {
        if target == ExecutionTarget::External {
            warn!("External analysis failed: {}", error);
            self.router.record_external_failure(Capability::Identification);

            if self.router.privacy_mode() == PrivacyMode::PreferExternal {
                if let Some(local) = self.router.registry().local_analyzer() {
                    self.router.mark_degraded();
                    return timeout(self.call_timeout, local.extract_candidates(utterances))
                        .await
                        .map_err(|_| {
                            DiarizationError::ModelUnavailable {
                                capability: Capability::Identification,
                                reason: "local analysis timed out after external failure"
                                    .to_string(),
                            }
                        })?;
                }
            }
        }

        Err(error)
    }
}

/// Adjust raw pattern confidence by name quality, context quality, and the
/// follow-on heuristic
pub fn shape_candidates(
    candidates: Vec<IdentificationCandidate>,
    utterances: &[LabeledUtterance],
) -> Vec<IdentificationCandidate> {
    candidates
        .into_iter()
        .map(|mut candidate| {
            let context = utterances
                .get(candidate.source_index)
                .map(|u| u.text.as_str())
                .unwrap_or("");

            let mut confidence = candidate.confidence
                * assess_name_quality(&candidate.name)
                * assess_context_quality(context);

            if follow_on_holds(&candidate, utterances) {
                confidence += FOLLOW_ON_BOOST;
            }

            candidate.confidence = confidence.clamp(0.0, 1.0);
            candidate
        })
        .collect()
}

/// Single-character tokens, digits and symbols make a poor name; a full
/// first + last name is the strongest signal
fn assess_name_quality(name: &str) -> f32 {
    let tokens: Vec<&str> = name.split_whitespace().collect();
    if tokens.is_empty() {
        return 0.0;
    }
    if name.chars().any(|c| c.is_ascii_digit()) {
        return 0.3;
    }
    if tokens.iter().any(|t| t.chars().count() < 2) {
        return 0.6;
    }
    if tokens.len() >= 2 {
        1.0
    } else {
        0.9
    }
}

fn assess_context_quality(context: &str) -> f32 {
    let mut quality: f32 = 1.0;

    if context.len() < 20 {
        quality *= 0.85;
    }

    let lowered = context.to_lowercase();
    let filler_count = FILLER_WORDS
        .iter()
        .filter(|word| lowered.contains(*word))
        .count();
    quality *= 0.95f32.powi(filler_count as i32);

    quality
}

/// The introduction heuristically extends to the speaker's immediately
/// following utterance; it holds unless that utterance introduces a
/// different name
fn follow_on_holds(candidate: &IdentificationCandidate, utterances: &[LabeledUtterance]) -> bool {
    let next = utterances
        .iter()
        .enumerate()
        .skip(candidate.source_index + 1)
        .find(|(_, u)| u.speaker_label == candidate.speaker_label);

    match next {
        Some((_, utterance)) => {
            let lowered = utterance.text.to_lowercase();
            let contradicted = (lowered.contains("my name is")
                || lowered.contains("i'm ")
                || lowered.contains("i am "))
                && !lowered.contains(&candidate.name.to_lowercase());
            !contradicted
        }
        None => false,
    }
}

/// Per label: highest confidence wins; on an exact tie the most recently
/// observed candidate wins
pub fn resolve_conflicts(candidates: Vec<IdentificationCandidate>) -> Vec<IdentificationCandidate> {
    let mut best: HashMap<String, IdentificationCandidate> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for candidate in candidates {
        let replace = match best.get(&candidate.speaker_label) {
            Some(current) => {
                candidate.confidence > current.confidence
                    || (candidate.confidence == current.confidence
                        && candidate.source_index >= current.source_index)
            }
            None => {
                order.push(candidate.speaker_label.clone());
                true
            }
        };
        if replace {
            best.insert(candidate.speaker_label.clone(), candidate);
        }
    }

    order
        .into_iter()
        .filter_map(|label| best.remove(&label))
        .collect()
}

/// Commit candidates at or above the threshold; the rest are surfaced as
/// rejected (LowConfidence, non-fatal)
pub fn gate_candidates(
    candidates: Vec<IdentificationCandidate>,
    confidence_threshold: f32,
) -> (Vec<SpeakerMapping>, Vec<IdentificationCandidate>) {
    let mut committed = Vec::new();
    let mut rejected = Vec::new();

    for candidate in candidates {
        if candidate.confidence >= confidence_threshold {
            committed.push(SpeakerMapping {
                speaker_label: candidate.speaker_label,
                assigned_name: Some(candidate.name),
                confidence: candidate.confidence,
                source: MappingSource::Identification,
            });
        } else {
            debug!(
                "Candidate '{}' for {} below threshold ({:.2} < {:.2})",
                candidate.name, candidate.speaker_label, candidate.confidence, confidence_threshold
            );
            rejected.push(candidate);
        }
    }

    (committed, rejected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(label: &str, name: &str, confidence: f32, idx: usize) -> IdentificationCandidate {
        IdentificationCandidate {
            speaker_label: label.to_string(),
            name: name.to_string(),
            confidence,
            source_index: idx,
        }
    }

    fn utterance(text: &str, label: &str, idx: usize) -> LabeledUtterance {
        let start = idx as f64 * 5.0;
        LabeledUtterance {
            text: text.to_string(),
            start_time: start,
            end_time: start + 4.0,
            speaker_label: label.to_string(),
            alignment_confidence: 1.0,
            is_overlapping: false,
        }
    }

    #[test]
    fn test_gate_commits_at_exact_threshold() {
        let candidates = vec![
            candidate("Speaker 1", "John Smith", 0.7, 0),
            candidate("Speaker 2", "Jane Doe", 0.7 - f32::EPSILON * 2.0, 1),
        ];

        let (committed, rejected) = gate_candidates(candidates, 0.7);
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].assigned_name.as_deref(), Some("John Smith"));
        assert_eq!(committed[0].source, MappingSource::Identification);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].name, "Jane Doe");
    }

    #[test]
    fn test_gate_against_high_threshold() {
        let candidates = vec![candidate("Speaker 1", "John Smith", 0.92, 0)];

        let (committed, _) = gate_candidates(candidates.clone(), 0.7);
        assert_eq!(committed.len(), 1);

        let (committed, rejected) = gate_candidates(candidates, 0.95);
        assert!(committed.is_empty());
        assert_eq!(rejected.len(), 1);
    }

    #[test]
    fn test_conflict_highest_confidence_wins() {
        let candidates = vec![
            candidate("Speaker 1", "Jon", 0.6, 0),
            candidate("Speaker 1", "John Smith", 0.9, 3),
        ];

        let resolved = resolve_conflicts(candidates);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].name, "John Smith");
    }

    #[test]
    fn test_conflict_tie_most_recent_wins() {
        let candidates = vec![
            candidate("Speaker 1", "Alice", 0.8, 0),
            candidate("Speaker 1", "Alicia", 0.8, 5),
        ];

        let resolved = resolve_conflicts(candidates);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].name, "Alicia");
    }

    #[test]
    fn test_name_quality_scoring() {
        assert!((assess_name_quality("John Smith") - 1.0).abs() < 0.001);
        assert!((assess_name_quality("John") - 0.9).abs() < 0.001);
        assert!(assess_name_quality("J") < 0.7);
        assert!(assess_name_quality("Agent 47") < 0.5);
        assert_eq!(assess_name_quality(""), 0.0);
    }

    #[test]
    fn test_context_quality_penalizes_filler() {
        let clean = assess_context_quality("Hi everyone, my name is Alice Johnson");
        let noisy = assess_context_quality("um, like, you know, I'm Alice I mean");
        assert!(clean > noisy);
    }

    #[test]
    fn test_follow_on_boost_applied() {
        let utterances = vec![
            utterance("Hi there everyone, I'm Bob", "Speaker 1", 0),
            utterance("Let's get started with the agenda", "Speaker 1", 1),
        ];
        let shaped = shape_candidates(vec![candidate("Speaker 1", "Bob", 0.85, 0)], &utterances);
        // 0.85 * 0.9 (single name) + 0.05 follow-on; context is long enough
        assert!((shaped[0].confidence - 0.815).abs() < 0.01);
    }

    #[test]
    fn test_follow_on_contradiction_withholds_boost() {
        let utterances = vec![
            utterance("Hi, I'm Bob", "Speaker 1", 0),
            utterance("Actually, my name is Robert", "Speaker 1", 1),
        ];
        let boosted = shape_candidates(vec![candidate("Speaker 1", "Bob", 0.85, 0)], &utterances);

        let utterances_ok = vec![
            utterance("Hi, I'm Bob", "Speaker 1", 0),
            utterance("Glad to be here with everyone", "Speaker 1", 1),
        ];
        let unboosted =
            shape_candidates(vec![candidate("Speaker 1", "Bob", 0.85, 0)], &utterances_ok);

        assert!(unboosted[0].confidence > boosted[0].confidence);
    }

    #[tokio::test]
    async fn test_identify_empty_input() {
        use crate::diarization::providers::ProviderRegistry;

        let registry = Arc::new(
            ProviderRegistry::new()
                .with_local_analyzer(Arc::new(crate::diarization::providers::LocalPatternAnalyzer::new())),
        );
        let router = Arc::new(ProviderRouter::new(PrivacyMode::LocalOnly, registry, 3));
        let engine = IdentificationEngine::new(router, Duration::from_secs(5));

        let outcome = engine.identify(&[], 0.7).await.unwrap();
        assert!(outcome.committed.is_empty());
    }

    #[tokio::test]
    async fn test_identify_end_to_end_local() {
        use crate::diarization::providers::{LocalPatternAnalyzer, ProviderRegistry};

        let registry = Arc::new(
            ProviderRegistry::new().with_local_analyzer(Arc::new(LocalPatternAnalyzer::new())),
        );
        let router = Arc::new(ProviderRouter::new(PrivacyMode::LocalOnly, registry, 3));
        let engine = IdentificationEngine::new(router, Duration::from_secs(5));

        let utterances = vec![
            utterance("Hello everyone, my name is Alice Johnson", "Speaker 1", 0),
            utterance("Thanks Alice, let's begin", "Speaker 2", 1),
        ];

        let outcome = engine.identify(&utterances, 0.7).await.unwrap();
        assert_eq!(outcome.committed.len(), 1);
        assert_eq!(outcome.committed[0].speaker_label, "Speaker 1");
        assert_eq!(
            outcome.committed[0].assigned_name.as_deref(),
            Some("Alice Johnson")
        );
    }
}
