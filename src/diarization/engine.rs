// Segmentation engine - turns audio into speaker-attributed segments
//
// The engine owns windowing, provider calls (through the router) and the
// strategy dispatch: batch runs cluster globally after embedding every
// window, real-time runs assign append-only as chunks arrive. A single
// window's provider failure skips that window; only run-wide embedding
// unavailability is fatal.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::time::timeout;

use super::clustering::{
    batch, build_segments, streaming::StreamingClusterer, WindowAssignment, WindowEmbedding,
    MIN_WINDOW_SECS, WINDOW_SECS,
};
use super::errors::{DiarizationError, Result};
use super::providers::AudioWindow;
use super::router::{ExecutionTarget, ProviderRouter};
use super::types::{AudioChunk, AudioSegment, Capability, PrivacyMode, SpeakerCluster};

/// Result of a segmentation pass
#[derive(Debug, Clone)]
pub struct SegmentationOutcome {
    /// Speaker-attributed segments in non-decreasing start_time order
    pub segments: Vec<AudioSegment>,
    /// Final cluster state; centroids feed the profile store
    pub clusters: Vec<SpeakerCluster>,
    /// Windows skipped because embedding extraction failed
    pub skipped_windows: usize,
}

/// Segmentation engine for one run
pub struct SegmentationEngine {
    router: Arc<ProviderRouter>,
    call_timeout: Duration,
}

impl SegmentationEngine {
    pub fn new(router: Arc<ProviderRouter>, call_timeout: Duration) -> Self {
        Self {
            router,
            call_timeout,
        }
    }

    pub fn router(&self) -> &Arc<ProviderRouter> {
        &self.router
    }

    /// Process a complete waveform (batch mode)
    pub async fn segment_batch(
        &self,
        samples: &[f32],
        sample_rate: u32,
    ) -> Result<SegmentationOutcome> {
        let windows = slice_windows(samples, sample_rate, 0.0);
        info!(
            "Batch segmentation: {} samples at {} Hz -> {} windows",
            samples.len(),
            sample_rate,
            windows.len()
        );

        let mut embedded = Vec::new();
        let mut skipped = 0usize;

        for window in &windows {
            match self.embed_window(window).await? {
                Some(embedding) => embedded.push(WindowEmbedding {
                    start_time: window.start_time,
                    end_time: window.end_time,
                    embedding,
                }),
                None => skipped += 1,
            }
        }

        if embedded.is_empty() && !windows.is_empty() {
            return Err(DiarizationError::ModelUnavailable {
                capability: Capability::Segmentation,
                reason: "embedding extraction failed for every analysis window".to_string(),
            });
        }

        let (assignments, clusters) = batch::cluster_windows(&embedded);
        Ok(SegmentationOutcome {
            segments: build_segments(&assignments),
            clusters,
            skipped_windows: skipped,
        })
    }

    /// Start an incremental (real-time) segmentation pass
    pub fn start_streaming(self: Arc<Self>) -> StreamingSegmenter {
        StreamingSegmenter {
            engine: self,
            clusterer: StreamingClusterer::new(),
            assignments: Vec::new(),
            buffer: Vec::new(),
            sample_rate: None,
            clock_secs: 0.0,
            windows_seen: 0,
            skipped_windows: 0,
        }
    }

    /// Embed one window through the routed provider
    ///
    /// Ok(Some) on success, Ok(None) when this window is skipped, Err only
    /// for conditions fatal to the whole run.
    async fn embed_window(&self, window: &AudioWindow) -> Result<Option<Vec<f32>>> {
        let target = self.router.select(Capability::Segmentation)?;
        let registry = self.router.registry();

        let provider = match target {
            ExecutionTarget::Local => registry.local_embedding(),
            ExecutionTarget::External => registry.external_embedding(),
        }
        .ok_or_else(|| DiarizationError::ModelUnavailable {
            capability: Capability::Segmentation,
            reason: "selected provider disappeared from registry".to_string(),
        })?;

        perf_trace!(
            "Embedding window {:.2}-{:.2}s via {}",
            window.start_time,
            window.end_time,
            provider.provider_name()
        );

        match timeout(self.call_timeout, provider.embed(window)).await {
            Ok(Ok(embedding)) => {
                if target == ExecutionTarget::External {
                    self.router.record_external_success();
                }
                Ok(Some(embedding))
            }
            Ok(Err(e)) => {
                warn!(
                    "Embedding failed for window {:.2}-{:.2}s: {}",
                    window.start_time, window.end_time, e
                );
                self.handle_window_failure(target, window).await
            }
            Err(_) => {
                warn!(
                    "Embedding timed out after {:?} for window {:.2}-{:.2}s",
                    self.call_timeout, window.start_time, window.end_time
                );
                self.handle_window_failure(target, window).await
            }
        }
    }

    /// After a failed call: count it toward the breaker and, under
    /// PreferExternal, retry this window locally before skipping it
    async fn handle_window_failure(
        &self,
        target: ExecutionTarget,
        window: &AudioWindow,
    ) -> Result<Option<Vec<f32>>> {
        if target == ExecutionTarget::External {
            self.router.record_external_failure(Capability::Segmentation);

            if self.router.privacy_mode() == PrivacyMode::PreferExternal {
                if let Some(local) = self.router.registry().local_embedding() {
                    self.router.mark_degraded();
                    match timeout(self.call_timeout, local.embed(window)).await {
                        Ok(Ok(embedding)) => return Ok(Some(embedding)),
                        Ok(Err(e)) => warn!("Local fallback also failed for window: {}", e),
                        Err(_) => warn!("Local fallback timed out for window"),
                    }
                }
            }
        }

        Ok(None)
    }
}

/// Incremental segmentation state for one real-time run
///
/// Chunks are buffered until a full analysis window is available; every
/// full window is embedded and assigned append-only. Finalization flushes
/// the tail and hands back the accumulated outcome.
pub struct StreamingSegmenter {
    engine: Arc<SegmentationEngine>,
    clusterer: StreamingClusterer,
    assignments: Vec<WindowAssignment>,
    buffer: Vec<f32>,
    sample_rate: Option<u32>,
    clock_secs: f64,
    windows_seen: usize,
    skipped_windows: usize,
}

impl StreamingSegmenter {
    /// Consume one chunk, processing every full window it completes
    pub async fn push_chunk(&mut self, chunk: &AudioChunk) -> Result<()> {
        match self.sample_rate {
            None => self.sample_rate = Some(chunk.sample_rate),
            Some(rate) if rate != chunk.sample_rate => {
                // Collaborator contract violation; drop the stale partial
                // window rather than mixing rates
                warn!(
                    "Sample rate changed mid-stream ({} -> {}), dropping partial window",
                    rate, chunk.sample_rate
                );
                self.clock_secs += self.buffer.len() as f64 / rate as f64;
                self.buffer.clear();
                self.sample_rate = Some(chunk.sample_rate);
            }
            _ => {}
        }

        self.buffer.extend_from_slice(&chunk.samples);
        let rate = chunk.sample_rate;
        let window_len = (WINDOW_SECS * rate as f64) as usize;

        while self.buffer.len() >= window_len {
            let samples: Vec<f32> = self.buffer.drain(..window_len).collect();
            let window = AudioWindow {
                start_time: self.clock_secs,
                end_time: self.clock_secs + WINDOW_SECS,
                samples,
                sample_rate: rate,
            };
            self.clock_secs += WINDOW_SECS;
            self.process_window(window).await?;
        }

        Ok(())
    }

    /// Flush the tail window and return the accumulated outcome
    pub async fn finalize(mut self) -> Result<SegmentationOutcome> {
        if let Some(rate) = self.sample_rate {
            let tail_secs = self.buffer.len() as f64 / rate as f64;
            if tail_secs >= MIN_WINDOW_SECS {
                let samples = std::mem::take(&mut self.buffer);
                let window = AudioWindow {
                    start_time: self.clock_secs,
                    end_time: self.clock_secs + tail_secs,
                    samples,
                    sample_rate: rate,
                };
                self.process_window(window).await?;
            }
        }

        if self.windows_seen > 0 && self.windows_seen == self.skipped_windows {
            return Err(DiarizationError::ModelUnavailable {
                capability: Capability::Segmentation,
                reason: "embedding extraction failed for every analysis window".to_string(),
            });
        }

        info!(
            "Streaming segmentation finalized: {} windows, {} skipped, {} clusters",
            self.windows_seen,
            self.skipped_windows,
            self.clusterer.clusters().len()
        );

        Ok(SegmentationOutcome {
            segments: build_segments(&self.assignments),
            clusters: self.clusterer.into_clusters(),
            skipped_windows: self.skipped_windows,
        })
    }

    async fn process_window(&mut self, window: AudioWindow) -> Result<()> {
        self.windows_seen += 1;
        match self.engine.embed_window(&window).await? {
            Some(embedding) => {
                let assignment = self.clusterer.assign(&WindowEmbedding {
                    start_time: window.start_time,
                    end_time: window.end_time,
                    embedding,
                });
                self.assignments.push(assignment);
            }
            None => self.skipped_windows += 1,
        }
        Ok(())
    }
}

/// Split a waveform into fixed-length analysis windows
fn slice_windows(samples: &[f32], sample_rate: u32, start_offset: f64) -> Vec<AudioWindow> {
    let window_len = (WINDOW_SECS * sample_rate as f64) as usize;
    if window_len == 0 {
        return Vec::new();
    }

    let mut windows = Vec::new();
    let mut offset = 0usize;

    while offset + window_len <= samples.len() {
        let start_time = start_offset + offset as f64 / sample_rate as f64;
        windows.push(AudioWindow {
            start_time,
            end_time: start_time + WINDOW_SECS,
            samples: samples[offset..offset + window_len].to_vec(),
            sample_rate,
        });
        offset += window_len;
    }

    // Keep the tail if it is long enough to embed meaningfully
    let tail_len = samples.len() - offset;
    let tail_secs = tail_len as f64 / sample_rate as f64;
    if tail_secs >= MIN_WINDOW_SECS {
        let start_time = start_offset + offset as f64 / sample_rate as f64;
        windows.push(AudioWindow {
            start_time,
            end_time: start_time + tail_secs,
            samples: samples[offset..].to_vec(),
            sample_rate,
        });
    }

    windows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diarization::providers::{EmbeddingProvider, ProviderRegistry};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const RATE: u32 = 16_000;

    /// Returns one of two voices depending on window start time
    struct TimedVoices {
        switch_at: f64,
        calls: AtomicUsize,
    }

    impl TimedVoices {
        fn new(switch_at: f64) -> Self {
            Self {
                switch_at,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for TimedVoices {
        fn provider_name(&self) -> &'static str {
            "timed-voices"
        }

        async fn embed(&self, window: &AudioWindow) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if window.start_time < self.switch_at {
                Ok(vec![1.0, 0.0, 0.0])
            } else {
                Ok(vec![0.0, 1.0, 0.0])
            }
        }
    }

    /// Always fails, counting how often it was asked
    struct FailingProvider {
        calls: AtomicUsize,
    }

    impl FailingProvider {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FailingProvider {
        fn provider_name(&self) -> &'static str {
            "failing"
        }

        async fn embed(&self, _window: &AudioWindow) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(DiarizationError::ExternalProviderError(
                "connection refused".to_string(),
            ))
        }
    }

    fn silence(seconds: f64) -> Vec<f32> {
        vec![0.0; (seconds * RATE as f64) as usize]
    }

    fn make_engine(privacy: PrivacyMode, registry: ProviderRegistry) -> SegmentationEngine {
        let router = Arc::new(ProviderRouter::new(privacy, Arc::new(registry), 3));
        SegmentationEngine::new(router, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_batch_two_voices() {
        let registry =
            ProviderRegistry::new().with_local_embedding(Arc::new(TimedVoices::new(5.0)));
        let engine = make_engine(PrivacyMode::LocalOnly, registry);

        let outcome = engine.segment_batch(&silence(10.0), RATE).await.unwrap();
        assert_eq!(outcome.clusters.len(), 2);
        assert_eq!(outcome.skipped_windows, 0);
        assert!(!outcome.segments.is_empty());
        // Non-decreasing start order
        assert!(outcome
            .segments
            .windows(2)
            .all(|w| w[0].start_time <= w[1].start_time));
        // First voice is cluster 0
        assert_eq!(outcome.segments[0].cluster_id, 0);
    }

    #[tokio::test]
    async fn test_local_only_never_calls_external() {
        let external = Arc::new(TimedVoices::new(5.0));
        let registry = ProviderRegistry::new()
            .with_local_embedding(Arc::new(TimedVoices::new(5.0)))
            .with_external_embedding(external.clone());
        let engine = make_engine(PrivacyMode::LocalOnly, registry);

        engine.segment_batch(&silence(6.0), RATE).await.unwrap();
        assert_eq!(external.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_prefer_external_falls_back_per_window() {
        let external = Arc::new(FailingProvider::new());
        let local = Arc::new(TimedVoices::new(100.0));
        let registry = ProviderRegistry::new()
            .with_local_embedding(local.clone())
            .with_external_embedding(external.clone());
        let engine = make_engine(PrivacyMode::PreferExternal, registry);

        let outcome = engine.segment_batch(&silence(6.0), RATE).await.unwrap();

        // Run completes on the local provider, degraded, nothing skipped
        assert_eq!(outcome.skipped_windows, 0);
        assert_eq!(outcome.clusters.len(), 1);
        assert!(engine.router().is_degraded());
        // Circuit opened after 3 consecutive failures, so the external
        // provider saw only the first windows
        assert_eq!(external.calls.load(Ordering::SeqCst), 3);
        assert_eq!(local.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_external_only_without_provider_fails_before_any_window() {
        let local = Arc::new(TimedVoices::new(5.0));
        let registry = ProviderRegistry::new().with_local_embedding(local.clone());
        let engine = make_engine(PrivacyMode::ExternalOnly, registry);

        let err = engine.segment_batch(&silence(6.0), RATE).await.unwrap_err();
        assert!(matches!(err, DiarizationError::ExternalRequired { .. }));
        assert_eq!(local.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_all_windows_failing_is_model_unavailable() {
        let registry =
            ProviderRegistry::new().with_local_embedding(Arc::new(FailingProvider::new()));
        let engine = make_engine(PrivacyMode::LocalOnly, registry);

        let err = engine.segment_batch(&silence(4.0), RATE).await.unwrap_err();
        assert!(matches!(err, DiarizationError::ModelUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_streaming_chunks_produce_segments() {
        let registry =
            ProviderRegistry::new().with_local_embedding(Arc::new(TimedVoices::new(2.0)));
        let engine = Arc::new(make_engine(PrivacyMode::LocalOnly, registry));

        let mut segmenter = engine.start_streaming();
        // 0.5s chunks; a window completes every second
        for _ in 0..8 {
            segmenter
                .push_chunk(&AudioChunk {
                    samples: silence(0.5),
                    sample_rate: RATE,
                })
                .await
                .unwrap();
        }

        let outcome = segmenter.finalize().await.unwrap();
        assert_eq!(outcome.clusters.len(), 2);
        assert!(outcome
            .segments
            .windows(2)
            .all(|w| w[0].start_time <= w[1].start_time));
    }

    #[test]
    fn test_slice_windows_keeps_long_tail() {
        let windows = slice_windows(&silence(2.5), RATE, 0.0);
        assert_eq!(windows.len(), 3);
        assert!((windows[2].end_time - 2.5).abs() < 1e-6);

        // A tail shorter than the minimum is dropped
        let windows = slice_windows(&silence(2.2), RATE, 0.0);
        assert_eq!(windows.len(), 2);
    }
}
