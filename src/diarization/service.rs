// Diarization service - the RPC-style surface consumed by the UI layer
//
// One run per meeting, concurrent meetings bounded by a worker pool.
// Configuration changes replace the active config wholesale; every run
// snapshots it at start. Mapping and profile writes for a meeting are
// serialized behind a per-meeting lock so a manual correction and an
// in-flight automatic pass cannot race; Manual entries win regardless.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::sync::{mpsc, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use super::engine::{SegmentationEngine, SegmentationOutcome};
use super::errors::{DiarizationError, Result};
use super::identification::IdentificationEngine;
use super::merger::{self, MergeOutcome};
use super::profile_store::ProfileStore;
use super::providers::ProviderRegistry;
use super::router::ProviderRouter;
use super::statistics;
use super::types::{
    AudioChunk, Capability, DiarizationConfig, MappingSource, ProcessingMode, RunSummary,
    SpeakerMapping, SpeakerStatistics, TranscriptUtterance,
};

/// Bounded retries for mapping and utterance writes
const PERSIST_RETRIES: usize = 3;

/// Service-level tuning, distinct from the per-run DiarizationConfig
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Maximum concurrently executing runs
    pub max_concurrent_runs: usize,
    /// Consecutive external failures before the per-run circuit opens
    pub breaker_threshold: u32,
    /// Timeout applied to every provider call
    pub provider_timeout: Duration,
    /// Days before a voice profile record expires
    pub retention_days: i64,
    /// Real-time chunk queue capacity; a full queue marks the run degraded
    pub chunk_queue_capacity: usize,
    /// How often the retention sweep runs
    pub sweep_interval: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 2,
            breaker_threshold: 3,
            provider_timeout: Duration::from_secs(10),
            retention_days: 90,
            chunk_queue_capacity: 32,
            sweep_interval: Duration::from_secs(3600),
        }
    }
}

/// Removes the meeting from the active set when the run ends
struct RunClaim {
    runs: Arc<DashMap<String, ()>>,
    meeting_id: String,
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        self.runs.remove(&self.meeting_id);
    }
}

/// The diarization core's service surface
pub struct DiarizationService {
    config: RwLock<DiarizationConfig>,
    registry: Arc<ProviderRegistry>,
    profiles: Arc<ProfileStore>,
    db: Arc<crate::database::DatabaseManager>,
    run_permits: Arc<Semaphore>,
    meeting_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    active_runs: Arc<DashMap<String, ()>>,
    settings: ServiceSettings,
    shutdown: CancellationToken,
}

impl DiarizationService {
    pub fn new(
        db: Arc<crate::database::DatabaseManager>,
        registry: Arc<ProviderRegistry>,
        settings: ServiceSettings,
    ) -> Arc<Self> {
        let profiles = Arc::new(ProfileStore::new(db.clone(), settings.retention_days));
        let shutdown = CancellationToken::new();
        profiles
            .clone()
            .spawn_sweeper(settings.sweep_interval, shutdown.clone());

        info!(
            "Diarization service started (worker pool: {}, retention: {} days)",
            settings.max_concurrent_runs, settings.retention_days
        );

        Arc::new(Self {
            config: RwLock::new(DiarizationConfig::default()),
            registry,
            profiles,
            db,
            run_permits: Arc::new(Semaphore::new(settings.max_concurrent_runs.max(1))),
            meeting_locks: DashMap::new(),
            active_runs: Arc::new(DashMap::new()),
            settings,
            shutdown,
        })
    }

    /// Replace the active configuration wholesale (last full write wins)
    pub async fn configure_diarization(&self, config: DiarizationConfig) -> Result<()> {
        if !(0.0..=1.0).contains(&config.confidence_threshold) {
            return Err(DiarizationError::InvalidConfiguration(format!(
                "confidence_threshold must be within [0, 1], got {}",
                config.confidence_threshold
            )));
        }

        info!(
            "Configuration replaced: mode {:?}, privacy {:?}, threshold {:.2}, identification {}",
            config.processing_mode,
            config.privacy_mode,
            config.confidence_threshold,
            config.enable_identification
        );
        *self.config.write().await = config;
        Ok(())
    }

    pub async fn current_config(&self) -> DiarizationConfig {
        self.config.read().await.clone()
    }

    /// Recompute statistics from the meeting's stored utterances
    pub async fn get_speaker_statistics(&self, meeting_id: &str) -> Result<Vec<SpeakerStatistics>> {
        let duration = self
            .db
            .get_meeting_duration(meeting_id)
            .map_err(|e| DiarizationError::PersistenceError(e.to_string()))?
            .ok_or_else(|| DiarizationError::MeetingNotFound(meeting_id.to_string()))?;

        let utterances = self
            .db
            .get_utterances(meeting_id)
            .map_err(|e| DiarizationError::PersistenceError(e.to_string()))?;

        Ok(statistics::aggregate(&utterances, duration))
    }

    /// Create or update a Manual mapping entry for a speaker label
    ///
    /// Manual entries are terminal: no automatic pass may overwrite them.
    /// A manual correction over an existing manual entry is allowed; the
    /// last committed write wins and the conflict is logged.
    pub async fn update_speaker_name(
        &self,
        meeting_id: &str,
        speaker_label: &str,
        new_name: &str,
    ) -> Result<()> {
        let lock = self.meeting_lock(meeting_id);
        let _guard = lock.lock().await;

        let had_manual = self
            .db
            .has_manual_mapping(meeting_id, speaker_label)
            .map_err(|e| DiarizationError::PersistenceError(e.to_string()))?;
        if had_manual {
            warn!(
                "{}",
                DiarizationError::ConcurrentModificationConflict {
                    meeting_id: meeting_id.to_string(),
                    speaker_label: speaker_label.to_string(),
                }
            );
        }

        let mapping = SpeakerMapping {
            speaker_label: speaker_label.to_string(),
            assigned_name: Some(new_name.to_string()),
            confidence: 1.0,
            source: MappingSource::Manual,
        };
        with_retry(PERSIST_RETRIES, || self.db.append_mapping(meeting_id, &mapping))?;

        info!(
            "Manual name '{}' set for {} in meeting {}",
            new_name, speaker_label, meeting_id
        );
        Ok(())
    }

    /// Resolve the effective mappings for a meeting
    pub async fn get_speaker_mappings(&self, meeting_id: &str) -> Result<Vec<SpeakerMapping>> {
        self.db
            .resolve_mappings(meeting_id)
            .map_err(|e| DiarizationError::PersistenceError(e.to_string()))
    }

    /// Run the full batch pipeline for a recorded meeting
    pub async fn diarize_batch(
        &self,
        meeting_id: &str,
        samples: &[f32],
        sample_rate: u32,
        utterances: &[TranscriptUtterance],
    ) -> Result<RunSummary> {
        let config = self.config.read().await.clone();
        if config.processing_mode != ProcessingMode::Batch {
            debug!("Batch entry point used while configured for {:?}", config.processing_mode);
        }

        let _claim = self.claim_run(meeting_id)?;
        let _permit = self.acquire_permit().await?;

        let router = Arc::new(ProviderRouter::new(
            config.privacy_mode,
            self.registry.clone(),
            self.settings.breaker_threshold,
        ));
        let engine = SegmentationEngine::new(router.clone(), self.settings.provider_timeout);

        let outcome = engine.segment_batch(samples, sample_rate).await?;
        let merged = merger::merge(&outcome.segments, utterances);

        let audio_secs = if sample_rate > 0 {
            samples.len() as f64 / sample_rate as f64
        } else {
            0.0
        };
        let total_duration = meeting_duration(audio_secs, &outcome, utterances);

        self.finalize_run(meeting_id, &config, router, outcome, merged, total_duration)
            .await
    }

    /// Start a real-time session for a live meeting
    ///
    /// Takes the service by Arc because the session keeps it alive for the
    /// finalization path.
    pub async fn start_realtime(self: Arc<Self>, meeting_id: &str) -> Result<RealtimeSession> {
        let config = self.config.read().await.clone();
        if config.processing_mode != ProcessingMode::RealTime {
            debug!("Real-time entry point used while configured for {:?}", config.processing_mode);
        }

        let claim = self.claim_run(meeting_id)?;
        let permit = self.acquire_permit().await?;

        let router = Arc::new(ProviderRouter::new(
            config.privacy_mode,
            self.registry.clone(),
            self.settings.breaker_threshold,
        ));
        let engine = Arc::new(SegmentationEngine::new(
            router.clone(),
            self.settings.provider_timeout,
        ));

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<AudioChunk>(self.settings.chunk_queue_capacity);
        let cancel = CancellationToken::new();

        // Cancellation gates intake (push_chunk) and closes the channel;
        // the worker finishes the bounded backlog chunk by chunk, so a
        // cancel lands between chunks, never mid-inference-call
        let worker = tokio::spawn(async move {
            let mut segmenter = engine.start_streaming();
            while let Some(chunk) = chunk_rx.recv().await {
                segmenter.push_chunk(&chunk).await?;
            }
            segmenter.finalize().await
        });

        info!("Real-time diarization started for meeting {}", meeting_id);

        Ok(RealtimeSession {
            meeting_id: meeting_id.to_string(),
            service: self.clone(),
            config,
            router,
            chunk_tx: Some(chunk_tx),
            utterances: tokio::sync::Mutex::new(Vec::new()),
            cancel,
            worker,
            queue_degraded: AtomicBool::new(false),
            _claim: claim,
            _permit: permit,
        })
    }

    /// Run the retention sweep immediately
    pub fn sweep_expired_profiles(&self) -> Result<usize> {
        self.profiles.sweep_expired()
    }

    fn claim_run(&self, meeting_id: &str) -> Result<RunClaim> {
        use dashmap::mapref::entry::Entry;
        match self.active_runs.entry(meeting_id.to_string()) {
            Entry::Occupied(_) => Err(DiarizationError::RunAlreadyActive(meeting_id.to_string())),
            Entry::Vacant(entry) => {
                entry.insert(());
                Ok(RunClaim {
                    runs: self.active_runs.clone(),
                    meeting_id: meeting_id.to_string(),
                })
            }
        }
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        self.run_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DiarizationError::PersistenceError("worker pool closed".to_string()))
    }

    fn meeting_lock(&self, meeting_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.meeting_locks
            .entry(meeting_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Identification, persistence and summary for a finished segmentation
    async fn finalize_run(
        &self,
        meeting_id: &str,
        config: &DiarizationConfig,
        router: Arc<ProviderRouter>,
        outcome: SegmentationOutcome,
        merged: MergeOutcome,
        total_duration: f64,
    ) -> Result<RunSummary> {
        let mut committed = Vec::new();

        if config.enable_identification {
            let engine = IdentificationEngine::new(router.clone(), self.settings.provider_timeout);
            match engine
                .identify(&merged.utterances, config.confidence_threshold)
                .await
            {
                Ok(identification) => committed = identification.committed,
                // ExternalOnly without a provider fails fast by design
                Err(e @ DiarizationError::ExternalRequired { .. }) => return Err(e),
                Err(DiarizationError::ModelUnavailable { capability, reason })
                    if capability == Capability::Identification =>
                {
                    warn!("Identification disabled for this run: {}", reason);
                }
                Err(e) => warn!("Identification failed, keeping plain labels: {}", e),
            }
        }

        let lock = self.meeting_lock(meeting_id);
        let _guard = lock.lock().await;

        with_retry(PERSIST_RETRIES, || {
            self.db
                .replace_utterances(meeting_id, &merged.utterances, total_duration)
        })?;

        for mapping in &committed {
            let manual_exists = self
                .db
                .has_manual_mapping(meeting_id, &mapping.speaker_label)
                .map_err(|e| DiarizationError::PersistenceError(e.to_string()))?;
            if manual_exists {
                // Manual-wins is the tie-breaker of record
                warn!(
                    "{}",
                    DiarizationError::ConcurrentModificationConflict {
                        meeting_id: meeting_id.to_string(),
                        speaker_label: mapping.speaker_label.clone(),
                    }
                );
                continue;
            }
            with_retry(PERSIST_RETRIES, || self.db.append_mapping(meeting_id, mapping))?;
        }

        self.profiles
            .record_run(meeting_id, &outcome.clusters, &merged.labels)?;

        let mappings = self
            .db
            .resolve_mappings(meeting_id)
            .map_err(|e| DiarizationError::PersistenceError(e.to_string()))?;

        info!(
            "Run finished for meeting {}: {} utterances, {} mappings, degraded: {}",
            meeting_id,
            merged.utterances.len(),
            mappings.len(),
            router.is_degraded()
        );

        Ok(RunSummary {
            meeting_id: meeting_id.to_string(),
            utterances: merged.utterances,
            mappings,
            degraded: router.is_degraded(),
            alignment_failures: merged.failures,
            skipped_windows: outcome.skipped_windows,
        })
    }
}

impl Drop for DiarizationService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A live real-time diarization run
///
/// Audio chunks and transcript utterances arrive independently; `finish`
/// merges them and persists the results. `cancel` stops chunk intake at
/// the next chunk boundary and persists whatever was finalized so far.
pub struct RealtimeSession {
    meeting_id: String,
    service: Arc<DiarizationService>,
    config: DiarizationConfig,
    router: Arc<ProviderRouter>,
    chunk_tx: Option<mpsc::Sender<AudioChunk>>,
    utterances: tokio::sync::Mutex<Vec<TranscriptUtterance>>,
    cancel: CancellationToken,
    worker: tokio::task::JoinHandle<Result<SegmentationOutcome>>,
    queue_degraded: AtomicBool,
    _claim: RunClaim,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for RealtimeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeSession")
            .field("meeting_id", &self.meeting_id)
            .field("queue_degraded", &self.queue_degraded)
            .finish_non_exhaustive()
    }
}

impl RealtimeSession {
    pub fn meeting_id(&self) -> &str {
        &self.meeting_id
    }

    /// Deliver one audio chunk
    ///
    /// A full queue is a degraded-mode condition, not an error: the chunk
    /// waits for capacity and the backlog is reported on the summary.
    pub async fn push_chunk(&self, chunk: AudioChunk) -> Result<()> {
        let sender = match &self.chunk_tx {
            Some(sender) => sender,
            None => return Ok(()),
        };
        if self.cancel.is_cancelled() {
            debug!("Chunk dropped after cancellation for meeting {}", self.meeting_id);
            return Ok(());
        }

        match sender.try_send(chunk) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(chunk)) => {
                if !self.queue_degraded.swap(true, Ordering::SeqCst) {
                    warn!(
                        "Chunk backlog for meeting {} exceeded {} entries",
                        self.meeting_id, self.service.settings.chunk_queue_capacity
                    );
                }
                sender.send(chunk).await.map_err(|_| {
                    DiarizationError::LocalProviderError("run task stopped".to_string())
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DiarizationError::LocalProviderError(
                "run task stopped".to_string(),
            )),
        }
    }

    /// Deliver transcript utterances as they arrive
    pub async fn push_utterances(&self, utterances: Vec<TranscriptUtterance>) {
        self.utterances.lock().await.extend(utterances);
    }

    /// Close the session normally: drain the queue, merge and persist
    pub async fn finish(mut self) -> Result<RunSummary> {
        drop(self.chunk_tx.take());
        self.complete().await
    }

    /// Stop at the next chunk boundary and persist the partial results
    pub async fn cancel(mut self) -> Result<RunSummary> {
        info!("Cancelling real-time run for meeting {}", self.meeting_id);
        self.cancel.cancel();
        drop(self.chunk_tx.take());
        self.complete().await
    }

    async fn complete(self) -> Result<RunSummary> {
        let outcome = self
            .worker
            .await
            .map_err(|e| DiarizationError::LocalProviderError(format!("run task failed: {}", e)))??;

        if self.queue_degraded.load(Ordering::SeqCst) {
            self.router.mark_degraded();
        }

        let utterances = self.utterances.into_inner();
        let merged = merger::merge(&outcome.segments, &utterances);

        let audio_secs = outcome
            .segments
            .iter()
            .map(|s| s.end_time)
            .fold(0.0f64, f64::max);
        let total_duration = meeting_duration(audio_secs, &outcome, &utterances);

        self.service
            .finalize_run(
                &self.meeting_id,
                &self.config,
                self.router.clone(),
                outcome,
                merged,
                total_duration,
            )
            .await
    }
}

/// Total meeting duration: the furthest point any input reaches
fn meeting_duration(
    audio_secs: f64,
    outcome: &SegmentationOutcome,
    utterances: &[TranscriptUtterance],
) -> f64 {
    let segment_end = outcome
        .segments
        .iter()
        .map(|s| s.end_time)
        .fold(0.0f64, f64::max);
    let utterance_end = utterances.iter().map(|u| u.end_time).fold(0.0f64, f64::max);
    audio_secs.max(segment_end).max(utterance_end)
}

/// Retry a persistence operation a bounded number of times
fn with_retry<T>(attempts: usize, mut op: impl FnMut() -> anyhow::Result<T>) -> Result<T> {
    let mut last_error = None;
    for attempt in 1..=attempts {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!("Persistence attempt {}/{} failed: {}", attempt, attempts, e);
                last_error = Some(e);
            }
        }
    }
    Err(DiarizationError::PersistenceError(format!(
        "write failed after {} attempts: {}",
        attempts,
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diarization::types::PrivacyMode;

    #[tokio::test]
    async fn test_configure_validates_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(
            crate::database::DatabaseManager::new(dir.path().join("test.db")).unwrap(),
        );
        let service = DiarizationService::new(
            db,
            Arc::new(ProviderRegistry::new()),
            ServiceSettings::default(),
        );

        let bad = DiarizationConfig {
            confidence_threshold: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            service.configure_diarization(bad).await,
            Err(DiarizationError::InvalidConfiguration(_))
        ));

        let good = DiarizationConfig {
            privacy_mode: PrivacyMode::LocalOnly,
            confidence_threshold: 0.9,
            ..Default::default()
        };
        service.configure_diarization(good).await.unwrap();
        let current = service.current_config().await;
        assert_eq!(current.privacy_mode, PrivacyMode::LocalOnly);
        assert!((current.confidence_threshold - 0.9).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_statistics_for_unknown_meeting() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(
            crate::database::DatabaseManager::new(dir.path().join("test.db")).unwrap(),
        );
        let service = DiarizationService::new(
            db,
            Arc::new(ProviderRegistry::new()),
            ServiceSettings::default(),
        );

        let err = service.get_speaker_statistics("missing").await.unwrap_err();
        assert!(matches!(err, DiarizationError::MeetingNotFound(_)));
    }

    #[tokio::test]
    async fn test_manual_name_update_and_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(
            crate::database::DatabaseManager::new(dir.path().join("test.db")).unwrap(),
        );
        let service = DiarizationService::new(
            db,
            Arc::new(ProviderRegistry::new()),
            ServiceSettings::default(),
        );

        service
            .update_speaker_name("m1", "Speaker 1", "Alice")
            .await
            .unwrap();
        // Second manual write is allowed; last committed wins
        service
            .update_speaker_name("m1", "Speaker 1", "Alice Johnson")
            .await
            .unwrap();

        let mappings = service.get_speaker_mappings("m1").await.unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].assigned_name.as_deref(), Some("Alice Johnson"));
        assert_eq!(mappings[0].source, MappingSource::Manual);
    }

    #[test]
    fn test_with_retry_bounded() {
        let mut calls = 0;
        let result: Result<()> = with_retry(3, || {
            calls += 1;
            Err(anyhow::anyhow!("disk full"))
        });
        assert!(matches!(result, Err(DiarizationError::PersistenceError(_))));
        assert_eq!(calls, 3);

        let mut calls = 0;
        let result = with_retry(3, || {
            calls += 1;
            if calls < 2 {
                Err(anyhow::anyhow!("transient"))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 2);
    }
}
