//! Batch clustering - globally optimal agglomerative merge
//!
//! All windows are available before any segment is emitted, so clustering
//! can consider the full embedding set: a greedy pass forms provisional
//! clusters, an agglomerative pass merges centroids until no pair reaches
//! the assignment threshold, and a noise pass folds clusters below the
//! minimum duration into their nearest survivor.

use log::{debug, info};

use super::{
    cosine_similarity, WindowAssignment, WindowEmbedding, ASSIGNMENT_THRESHOLD, MIN_CLUSTER_SECS,
    OVERLAP_MARGIN,
};
use crate::diarization::types::SpeakerCluster;

struct ProvisionalCluster {
    centroid: Vec<f32>,
    window_indices: Vec<usize>,
    total_duration: f64,
}

impl ProvisionalCluster {
    fn window_count(&self) -> usize {
        self.window_indices.len()
    }
}

/// Cluster a complete window set
///
/// Returns per-window attributions plus the final cluster state. Cluster IDs
/// are assigned in order of first temporal appearance, so the result is
/// deterministic for a given input.
pub fn cluster_windows(
    windows: &[WindowEmbedding],
) -> (Vec<WindowAssignment>, Vec<SpeakerCluster>) {
    if windows.is_empty() {
        return (Vec::new(), Vec::new());
    }

    let mut clusters = greedy_pass(windows);
    agglomerative_pass(&mut clusters);
    noise_pass(&mut clusters);

    info!(
        "Batch clustering: {} windows -> {} clusters",
        windows.len(),
        clusters.len()
    );

    finalize(clusters, windows)
}

/// Sequential pass: join the best-matching centroid at or above the
/// threshold, otherwise open a new cluster
fn greedy_pass(windows: &[WindowEmbedding]) -> Vec<ProvisionalCluster> {
    let mut clusters: Vec<ProvisionalCluster> = Vec::new();

    for (idx, window) in windows.iter().enumerate() {
        let best = clusters
            .iter()
            .enumerate()
            .map(|(c, cluster)| (c, cosine_similarity(&window.embedding, &cluster.centroid)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        match best {
            Some((c, similarity)) if similarity >= ASSIGNMENT_THRESHOLD => {
                let count = clusters[c].window_count();
                update_centroid(&mut clusters[c].centroid, count, &window.embedding);
                clusters[c].window_indices.push(idx);
                clusters[c].total_duration += window.duration();
            }
            _ => {
                clusters.push(ProvisionalCluster {
                    centroid: window.embedding.clone(),
                    window_indices: vec![idx],
                    total_duration: window.duration(),
                });
            }
        }
    }

    clusters
}

/// Merge the closest centroid pair until no pair reaches the threshold
fn agglomerative_pass(clusters: &mut Vec<ProvisionalCluster>) {
    loop {
        let mut best: Option<(usize, usize, f32)> = None;
        for i in 0..clusters.len() {
            for j in (i + 1)..clusters.len() {
                let similarity = cosine_similarity(&clusters[i].centroid, &clusters[j].centroid);
                if similarity >= ASSIGNMENT_THRESHOLD
                    && best.map_or(true, |(_, _, s)| similarity > s)
                {
                    best = Some((i, j, similarity));
                }
            }
        }

        let (i, j, similarity) = match best {
            Some(pair) => pair,
            None => break,
        };

        debug!("Merging clusters {} and {} (similarity {:.3})", i, j, similarity);
        let absorbed = clusters.remove(j);
        merge_into(&mut clusters[i], absorbed);
    }
}

/// Fold clusters below the minimum duration into their nearest survivor
fn noise_pass(clusters: &mut Vec<ProvisionalCluster>) {
    while clusters.len() > 1 {
        let smallest = clusters
            .iter()
            .enumerate()
            .filter(|(_, c)| c.total_duration < MIN_CLUSTER_SECS)
            .min_by(|a, b| {
                a.1.total_duration
                    .partial_cmp(&b.1.total_duration)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(idx, _)| idx);

        let idx = match smallest {
            Some(idx) => idx,
            None => return,
        };

        let base = clusters[idx].centroid.clone();
        let nearest = clusters
            .iter()
            .enumerate()
            .filter(|(other, _)| *other != idx)
            .max_by(|a, b| {
                let sim_a = cosine_similarity(&base, &a.1.centroid);
                let sim_b = cosine_similarity(&base, &b.1.centroid);
                sim_a.partial_cmp(&sim_b).unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(other, _)| other);

        match nearest {
            Some(nearest) => {
                debug!(
                    "Noise pass: folding {:.2}s cluster into cluster {}",
                    clusters[idx].total_duration, nearest
                );
                let absorbed = clusters.remove(idx);
                let target = if nearest > idx { nearest - 1 } else { nearest };
                merge_into(&mut clusters[target], absorbed);
            }
            None => return,
        }
    }
}

fn merge_into(target: &mut ProvisionalCluster, absorbed: ProvisionalCluster) {
    let target_count = target.window_count() as f32;
    let absorbed_count = absorbed.window_count() as f32;
    let total = target_count + absorbed_count;

    for (t, a) in target.centroid.iter_mut().zip(absorbed.centroid.iter()) {
        *t = (*t * target_count + a * absorbed_count) / total;
    }
    target.window_indices.extend(absorbed.window_indices);
    target.total_duration += absorbed.total_duration;
}

fn update_centroid(centroid: &mut [f32], current_count: usize, embedding: &[f32]) {
    let count = current_count as f32;
    for (c, e) in centroid.iter_mut().zip(embedding.iter()) {
        *c = (*c * count + e) / (count + 1.0);
    }
}

/// Remap cluster IDs to first-appearance order and compute per-window
/// attributions with overlap marking
fn finalize(
    mut clusters: Vec<ProvisionalCluster>,
    windows: &[WindowEmbedding],
) -> (Vec<WindowAssignment>, Vec<SpeakerCluster>) {
    for cluster in &mut clusters {
        cluster.window_indices.sort_unstable();
    }
    clusters.sort_by(|a, b| {
        let a_first = a.window_indices.first().copied().unwrap_or(usize::MAX);
        let b_first = b.window_indices.first().copied().unwrap_or(usize::MAX);
        a_first.cmp(&b_first)
    });

    let mut window_cluster = vec![0usize; windows.len()];
    for (cluster_id, cluster) in clusters.iter().enumerate() {
        for &w in &cluster.window_indices {
            window_cluster[w] = cluster_id;
        }
    }

    let mut assignments = Vec::with_capacity(windows.len());
    for (idx, window) in windows.iter().enumerate() {
        let assigned = window_cluster[idx];
        let mut cluster_ids = vec![assigned];
        let mut is_overlapping = false;

        if clusters.len() > 1 {
            // Ambiguity against the other final centroids marks overlap
            let assigned_sim = cosine_similarity(&window.embedding, &clusters[assigned].centroid);
            let runner_up = clusters
                .iter()
                .enumerate()
                .filter(|(c, _)| *c != assigned)
                .map(|(c, cluster)| (c, cosine_similarity(&window.embedding, &cluster.centroid)))
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

            if let Some((other, other_sim)) = runner_up {
                if (assigned_sim - other_sim).abs() <= OVERLAP_MARGIN {
                    cluster_ids.push(other);
                    is_overlapping = true;
                }
            }
        }

        assignments.push(WindowAssignment {
            start_time: window.start_time,
            end_time: window.end_time,
            cluster_ids,
            is_overlapping,
        });
    }

    let speaker_clusters = clusters
        .iter()
        .enumerate()
        .map(|(cluster_id, cluster)| SpeakerCluster {
            cluster_id,
            centroid_embedding: cluster.centroid.clone(),
            segment_count: cluster.window_count(),
            total_duration: cluster.total_duration,
            last_updated: cluster.window_indices.last().copied().unwrap_or(0) as u64,
        })
        .collect();

    (assignments, speaker_clusters)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(start: f64, embedding: Vec<f32>) -> WindowEmbedding {
        WindowEmbedding {
            start_time: start,
            end_time: start + 1.0,
            embedding,
        }
    }

    #[test]
    fn test_two_distinct_voices_form_two_clusters() {
        let windows = vec![
            window(0.0, vec![1.0, 0.0, 0.0]),
            window(1.0, vec![0.98, 0.02, 0.0]),
            window(2.0, vec![0.0, 1.0, 0.0]),
            window(3.0, vec![0.02, 0.98, 0.0]),
            window(4.0, vec![0.99, 0.01, 0.0]),
        ];

        let (assignments, clusters) = cluster_windows(&windows);
        assert_eq!(clusters.len(), 2);
        // First-appearance ordering: the voice at t=0 is cluster 0
        assert_eq!(assignments[0].cluster_ids, vec![0]);
        assert_eq!(assignments[2].cluster_ids, vec![1]);
        assert_eq!(assignments[4].cluster_ids, vec![0]);
    }

    #[test]
    fn test_short_cluster_folded_into_nearest() {
        // Third voice speaks for one window only, below MIN_CLUSTER_SECS
        let windows = vec![
            window(0.0, vec![1.0, 0.0, 0.0]),
            window(1.0, vec![1.0, 0.0, 0.0]),
            window(2.0, vec![1.0, 0.0, 0.0]),
            window(3.0, vec![0.0, 1.0, 0.0]),
            window(4.0, vec![0.0, 1.0, 0.0]),
            window(5.0, vec![0.0, 1.0, 0.0]),
            window(6.0, vec![0.6, 0.6, 0.52]),
        ];

        let (_, clusters) = cluster_windows(&windows);
        assert_eq!(clusters.len(), 2);
        let total: f64 = clusters.iter().map(|c| c.total_duration).sum();
        assert!((total - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_ambiguous_window_marked_overlapping() {
        // A single window equidistant between two well-established voices:
        // too short to survive as its own cluster, ambiguous after folding
        let v = 1.0 / 2.0f32.sqrt();
        let mut windows = Vec::new();
        for i in 0..5 {
            windows.push(window(i as f64, vec![1.0, 0.0, 0.0]));
        }
        for i in 5..10 {
            windows.push(window(i as f64, vec![0.0, 1.0, 0.0]));
        }
        windows.push(window(10.0, vec![v, v, 0.0]));

        let (assignments, clusters) = cluster_windows(&windows);
        assert_eq!(clusters.len(), 2);

        let flagged: Vec<_> = assignments.iter().filter(|a| a.is_overlapping).collect();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].cluster_ids.len(), 2);
        assert!((flagged[0].start_time - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_deterministic_for_same_input() {
        let windows = vec![
            window(0.0, vec![1.0, 0.1, 0.0]),
            window(1.0, vec![0.9, 0.2, 0.1]),
            window(2.0, vec![0.0, 1.0, 0.2]),
            window(3.0, vec![0.1, 0.9, 0.1]),
        ];

        let (a1, c1) = cluster_windows(&windows);
        let (a2, c2) = cluster_windows(&windows);
        assert_eq!(a1.len(), a2.len());
        assert_eq!(c1.len(), c2.len());
        for (x, y) in a1.iter().zip(a2.iter()) {
            assert_eq!(x.cluster_ids, y.cluster_ids);
            assert_eq!(x.is_overlapping, y.is_overlapping);
        }
    }

    #[test]
    fn test_empty_input() {
        let (assignments, clusters) = cluster_windows(&[]);
        assert!(assignments.is_empty());
        assert!(clusters.is_empty());
    }
}
