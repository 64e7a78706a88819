//! Clustering configuration and shared primitives
//!
//! Batch and real-time clustering are distinct strategies with different
//! correctness properties (globally optimal vs. append-only); they share
//! only the window/embedding primitives and the segment builder here.

pub mod batch;
pub mod streaming;

use crate::diarization::types::AudioSegment;

// Analysis window constants
pub const WINDOW_SECS: f64 = 1.0;
pub const MIN_WINDOW_SECS: f64 = 0.4;

/// Assignment threshold: a window joins a cluster only at or above this
/// cosine similarity
pub const ASSIGNMENT_THRESHOLD: f32 = 0.75;

/// Top-2 similarity margin below which a window counts as overlapping speech
pub const OVERLAP_MARGIN: f32 = 0.1;

/// Soft cap on simultaneously active clusters in streaming mode
pub const MAX_ACTIVE_CLUSTERS: usize = 8;

/// Batch clusters below this total duration are folded into the nearest
/// surviving cluster
pub const MIN_CLUSTER_SECS: f64 = 2.0;

/// Gap tolerance when joining adjacent windows into one segment
pub const WINDOW_JOIN_EPSILON: f64 = 0.05;

/// One embedded analysis window
#[derive(Debug, Clone)]
pub struct WindowEmbedding {
    /// Start time in seconds
    pub start_time: f64,
    /// End time in seconds
    pub end_time: f64,
    /// Embedding vector from the routed provider
    pub embedding: Vec<f32>,
}

impl WindowEmbedding {
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }
}

/// Cluster attribution for one window
///
/// cluster_ids holds one entry normally, two when the window is ambiguous
/// between clusters (overlapping speech); never more than two.
#[derive(Debug, Clone)]
pub struct WindowAssignment {
    pub start_time: f64,
    pub end_time: f64,
    pub cluster_ids: Vec<usize>,
    pub is_overlapping: bool,
}

/// Cosine similarity between two embeddings
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// Merge per-window attributions into AudioSegments
///
/// Adjacent windows of the same cluster and overlap flag join into one
/// segment. Output is sorted by (start_time, cluster_id), so start times are
/// non-decreasing.
pub fn build_segments(assignments: &[WindowAssignment]) -> Vec<AudioSegment> {
    let mut segments: Vec<AudioSegment> = Vec::new();
    let mut open: std::collections::HashMap<(usize, bool), AudioSegment> =
        std::collections::HashMap::new();

    let mut ordered: Vec<&WindowAssignment> = assignments.iter().collect();
    ordered.sort_by(|a, b| {
        a.start_time
            .partial_cmp(&b.start_time)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    for assignment in ordered {
        for &cluster_id in &assignment.cluster_ids {
            let key = (cluster_id, assignment.is_overlapping);
            let joins = open
                .get(&key)
                .map_or(false, |s| assignment.start_time - s.end_time <= WINDOW_JOIN_EPSILON);

            if joins {
                if let Some(segment) = open.get_mut(&key) {
                    segment.end_time = segment.end_time.max(assignment.end_time);
                }
            } else {
                if let Some(finished) = open.remove(&key) {
                    segments.push(finished);
                }
                open.insert(
                    key,
                    AudioSegment {
                        start_time: assignment.start_time,
                        end_time: assignment.end_time,
                        cluster_id,
                        is_overlapping: assignment.is_overlapping,
                    },
                );
            }
        }
    }

    segments.extend(open.into_values());
    segments.sort_by(|a, b| {
        a.start_time
            .partial_cmp(&b.start_time)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cluster_id.cmp(&b.cluster_id))
    });
    segments
}
