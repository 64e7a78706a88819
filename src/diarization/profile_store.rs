// Voice profile and retention store
//
// Audit/compliance infrastructure only: each run's cluster centroids are
// reduced to a one-way SHA-256 digest and persisted with a retention
// expiry. Digests are not comparable, so this store cannot and does not
// power cross-meeting recognition.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{error, info, warn};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::errors::{DiarizationError, Result};
use super::types::{SpeakerCluster, VoiceProfileRecord};
use crate::database::DatabaseManager;

/// Bounded retries for profile writes
const WRITE_RETRIES: usize = 3;

/// Store for voice profile audit records
pub struct ProfileStore {
    db: Arc<DatabaseManager>,
    retention_days: i64,
}

impl ProfileStore {
    pub fn new(db: Arc<DatabaseManager>, retention_days: i64) -> Self {
        Self {
            db,
            retention_days: retention_days.max(1),
        }
    }

    /// Persist an audit record for one cluster centroid
    ///
    /// The raw vector never reaches storage; only its digest does.
    pub fn record(
        &self,
        meeting_id: &str,
        speaker_label: &str,
        centroid_embedding: &[f32],
    ) -> Result<VoiceProfileRecord> {
        let now = Utc::now();
        let record = VoiceProfileRecord {
            profile_id: Uuid::new_v4().to_string(),
            meeting_id: meeting_id.to_string(),
            speaker_label: speaker_label.to_string(),
            embedding_digest: digest_embedding(centroid_embedding),
            created_at: now,
            retention_expiry: now + chrono::Duration::days(self.retention_days),
        };

        let mut last_error = None;
        for attempt in 1..=WRITE_RETRIES {
            match self.db.insert_voice_profile(&record) {
                Ok(()) => {
                    info!(
                        "Recorded voice profile {} for {} in meeting {}",
                        record.profile_id, speaker_label, meeting_id
                    );
                    return Ok(record);
                }
                Err(e) => {
                    warn!(
                        "Profile write attempt {}/{} failed: {}",
                        attempt, WRITE_RETRIES, e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(DiarizationError::PersistenceError(format!(
            "profile write failed after {} attempts: {}",
            WRITE_RETRIES,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Record every cluster of a finished run
    pub fn record_run(
        &self,
        meeting_id: &str,
        clusters: &[SpeakerCluster],
        labels: &std::collections::HashMap<usize, String>,
    ) -> Result<Vec<VoiceProfileRecord>> {
        let mut records = Vec::new();
        for cluster in clusters {
            let label = match labels.get(&cluster.cluster_id) {
                Some(label) => label.clone(),
                // Clusters that never matched an utterance still get audited
                None => format!("Cluster {}", cluster.cluster_id),
            };
            records.push(self.record(meeting_id, &label, &cluster.centroid_embedding)?);
        }
        Ok(records)
    }

    /// Delete records past their retention expiry
    pub fn sweep_expired(&self) -> Result<usize> {
        let deleted = self
            .db
            .delete_expired_profiles(Utc::now())
            .map_err(|e| DiarizationError::PersistenceError(e.to_string()))?;
        if deleted > 0 {
            info!("Retention sweep deleted {} expired voice profiles", deleted);
        }
        Ok(deleted)
    }

    /// Spawn the periodic retention sweep; stops when the token is cancelled
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, token: CancellationToken) {
        let store = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.sweep_expired() {
                            error!("Retention sweep failed: {}", e);
                        }
                    }
                }
            }
        });
    }
}

/// One-way digest of an embedding (hex SHA-256 over little-endian bytes)
pub fn digest_embedding(embedding: &[f32]) -> String {
    let bytes: Vec<u8> = embedding.iter().flat_map(|f| f.to_le_bytes()).collect();

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let result = hasher.finalize();

    format!("{:x}", result)
}
