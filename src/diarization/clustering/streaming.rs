//! Streaming clustering - append-only assignment for live audio
//!
//! Windows arrive incrementally and past decisions are never revisited. A
//! soft cap on active clusters keeps noisy audio from spawning clusters
//! without bound: at the cap a new voice is forced into the least-recently
//! updated cluster and flagged as overlapping rather than rejected.

use log::debug;

use super::{
    cosine_similarity, WindowAssignment, WindowEmbedding, ASSIGNMENT_THRESHOLD,
    MAX_ACTIVE_CLUSTERS, OVERLAP_MARGIN,
};
use crate::diarization::types::SpeakerCluster;

/// Append-only clusterer for real-time runs
pub struct StreamingClusterer {
    clusters: Vec<SpeakerCluster>,
    seq: u64,
}

impl StreamingClusterer {
    pub fn new() -> Self {
        Self {
            clusters: Vec::new(),
            seq: 0,
        }
    }

    /// Assign one window; never revisits earlier assignments
    pub fn assign(&mut self, window: &WindowEmbedding) -> WindowAssignment {
        self.seq += 1;
        let seq = self.seq;

        let mut ranked: Vec<(usize, f32)> = self
            .clusters
            .iter()
            .map(|c| (c.cluster_id, cosine_similarity(&window.embedding, &c.centroid_embedding)))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let best = ranked.first().copied();
        let second = ranked.get(1).copied();

        match best {
            Some((cluster_id, similarity)) if similarity >= ASSIGNMENT_THRESHOLD => {
                self.join(cluster_id, window, seq, true);
                let mut cluster_ids = vec![cluster_id];
                let mut is_overlapping = false;

                // Ambiguity between the top two clusters marks overlap and
                // attributes the time to both
                if let Some((runner_up, runner_sim)) = second {
                    if similarity - runner_sim <= OVERLAP_MARGIN {
                        self.attribute_duration(runner_up, window.duration());
                        cluster_ids.push(runner_up);
                        is_overlapping = true;
                    }
                }

                WindowAssignment {
                    start_time: window.start_time,
                    end_time: window.end_time,
                    cluster_ids,
                    is_overlapping,
                }
            }
            _ if self.clusters.len() < MAX_ACTIVE_CLUSTERS => {
                let cluster_id = self.clusters.len();
                debug!(
                    "Window at {:.2}s opens cluster {} (best similarity {:.3})",
                    window.start_time,
                    cluster_id,
                    best.map(|(_, s)| s).unwrap_or(0.0)
                );
                self.clusters.push(SpeakerCluster {
                    cluster_id,
                    centroid_embedding: window.embedding.clone(),
                    segment_count: 1,
                    total_duration: window.duration(),
                    last_updated: seq,
                });
                WindowAssignment {
                    start_time: window.start_time,
                    end_time: window.end_time,
                    cluster_ids: vec![cluster_id],
                    is_overlapping: false,
                }
            }
            _ => {
                // At the cap: force into the least-recently-updated cluster.
                // Forced windows do not update the centroid.
                let cluster_id = self
                    .clusters
                    .iter()
                    .min_by_key(|c| c.last_updated)
                    .map(|c| c.cluster_id)
                    .unwrap_or(0);
                debug!(
                    "Cluster cap reached, window at {:.2}s forced into cluster {}",
                    window.start_time, cluster_id
                );
                self.join(cluster_id, window, seq, false);
                WindowAssignment {
                    start_time: window.start_time,
                    end_time: window.end_time,
                    cluster_ids: vec![cluster_id],
                    is_overlapping: true,
                }
            }
        }
    }

    fn join(&mut self, cluster_id: usize, window: &WindowEmbedding, seq: u64, update_centroid: bool) {
        if let Some(cluster) = self.clusters.iter_mut().find(|c| c.cluster_id == cluster_id) {
            if update_centroid {
                let count = cluster.segment_count as f32;
                for (c, e) in cluster
                    .centroid_embedding
                    .iter_mut()
                    .zip(window.embedding.iter())
                {
                    *c = (*c * count + e) / (count + 1.0);
                }
            }
            cluster.segment_count += 1;
            cluster.total_duration += window.duration();
            cluster.last_updated = seq;
        }
    }

    fn attribute_duration(&mut self, cluster_id: usize, duration: f64) {
        if let Some(cluster) = self.clusters.iter_mut().find(|c| c.cluster_id == cluster_id) {
            cluster.total_duration += duration;
        }
    }

    pub fn clusters(&self) -> &[SpeakerCluster] {
        &self.clusters
    }

    pub fn into_clusters(self) -> Vec<SpeakerCluster> {
        self.clusters
    }
}

impl Default for StreamingClusterer {
    fn default() -> Self {
        Self::new()
    }
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
    fn test_new_voice_opens_cluster() {
        let mut clusterer = StreamingClusterer::new();
        let a = clusterer.assign(&window(0.0, vec![1.0, 0.0]));
        let b = clusterer.assign(&window(1.0, vec![0.0, 1.0]));

        assert_eq!(a.cluster_ids, vec![0]);
        assert_eq!(b.cluster_ids, vec![1]);
        assert_eq!(clusterer.clusters().len(), 2);
    }

    #[test]
    fn test_similar_window_joins_and_updates_centroid() {
        let mut clusterer = StreamingClusterer::new();
        clusterer.assign(&window(0.0, vec![1.0, 0.0]));
        let joined = clusterer.assign(&window(1.0, vec![0.98, 0.0]));

        assert_eq!(joined.cluster_ids, vec![0]);
        let cluster = &clusterer.clusters()[0];
        assert_eq!(cluster.segment_count, 2);
        assert!((cluster.total_duration - 2.0).abs() < 1e-9);
        assert!((cluster.centroid_embedding[0] - 0.99).abs() < 0.001);
    }

    #[test]
    fn test_ambiguous_window_attributed_to_both() {
        let mut clusterer = StreamingClusterer::new();
        clusterer.assign(&window(0.0, vec![1.0, 0.0]));
        clusterer.assign(&window(1.0, vec![0.5, 0.866]));

        // Equidistant from both voices: joins the best and is attributed to
        // the runner-up within the margin
        let ambiguous = clusterer.assign(&window(2.0, vec![0.866, 0.5]));

        assert!(ambiguous.is_overlapping);
        assert_eq!(ambiguous.cluster_ids.len(), 2);
        // Both clusters carry the time
        assert!(clusterer.clusters().iter().all(|c| c.total_duration > 1.0));
    }

    #[test]
    fn test_cap_forces_into_least_recently_updated() {
        let mut clusterer = StreamingClusterer::new();
        // Fill the cap with orthogonal-ish voices
        for i in 0..MAX_ACTIVE_CLUSTERS {
            let mut embedding = vec![0.0; MAX_ACTIVE_CLUSTERS];
            embedding[i] = 1.0;
            clusterer.assign(&window(i as f64, embedding));
        }
        assert_eq!(clusterer.clusters().len(), MAX_ACTIVE_CLUSTERS);

        // A genuinely new voice cannot open a cluster anymore
        let mut embedding = vec![0.0; MAX_ACTIVE_CLUSTERS];
        embedding[0] = -1.0;
        let forced = clusterer.assign(&window(20.0, embedding));

        assert_eq!(clusterer.clusters().len(), MAX_ACTIVE_CLUSTERS);
        assert!(forced.is_overlapping);
        // Cluster 0 was the least recently updated
        assert_eq!(forced.cluster_ids, vec![0]);
    }

    #[test]
    fn test_assignments_are_append_only() {
        let mut clusterer = StreamingClusterer::new();
        let first = clusterer.assign(&window(0.0, vec![1.0, 0.0]));

        // Later windows shift the centroid but never the earlier assignment
        for i in 1..10 {
            clusterer.assign(&window(i as f64, vec![0.9, 0.3]));
        }
        assert_eq!(first.cluster_ids, vec![0]);
        assert_eq!(clusterer.clusters()[0].segment_count, 10);
    }
}
