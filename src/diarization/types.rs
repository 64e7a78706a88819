// Core types for speaker diarization and identification

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pipeline capabilities that can be routed to a local or external provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Audio windows -> speaker embeddings
    Segmentation,
    /// Transcript text -> speaker name candidates
    Identification,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Segmentation => write!(f, "segmentation"),
            Capability::Identification => write!(f, "identification"),
        }
    }
}

/// Processing mode for diarization
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProcessingMode {
    /// Process the complete recording at once (higher accuracy)
    #[default]
    Batch,
    /// Process audio chunks as they arrive (lower latency)
    RealTime,
}

/// Privacy mode governing whether audio/text may leave the device
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum PrivacyMode {
    /// Never use external providers (maximum privacy)
    LocalOnly,
    /// Use external providers if available, fall back to local
    #[default]
    PreferExternal,
    /// Require external providers, fail if unavailable
    ExternalOnly,
}

/// Configuration for a diarization run
///
/// The service holds the active configuration; every run snapshots a copy at
/// start, so a concurrent settings change never affects an in-flight run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiarizationConfig {
    /// Batch or real-time processing
    pub processing_mode: ProcessingMode,
    /// Privacy policy for provider routing
    pub privacy_mode: PrivacyMode,
    /// Minimum confidence for committing an identified name (0.0 to 1.0)
    pub confidence_threshold: f32,
    /// Whether to run speaker identification at all
    pub enable_identification: bool,
}

impl Default for DiarizationConfig {
    fn default() -> Self {
        Self {
            processing_mode: ProcessingMode::Batch,
            privacy_mode: PrivacyMode::PreferExternal,
            confidence_threshold: 0.7,
            enable_identification: true,
        }
    }
}

/// A chunk of audio delivered to a real-time session
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Mono f32 samples
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
}

/// A time range attributed to one speaker cluster
///
/// Emitted by the segmentation engine in non-decreasing start_time order.
/// cluster_id is process-local to one run, never a cross-meeting identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSegment {
    /// Start time in seconds
    pub start_time: f64,
    /// End time in seconds
    pub end_time: f64,
    /// Run-local cluster ID
    pub cluster_id: usize,
    /// Whether this range is attributed to more than one cluster
    pub is_overlapping: bool,
}

impl AudioSegment {
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }
}

/// Live clustering state for one inferred speaker
///
/// Owned exclusively by one in-flight run and destroyed when the run ends.
/// Only the one-way digest of the centroid ever reaches storage.
#[derive(Debug, Clone)]
pub struct SpeakerCluster {
    /// Run-local cluster ID
    pub cluster_id: usize,
    /// Running mean embedding for all audio attributed to this cluster
    pub centroid_embedding: Vec<f32>,
    /// Number of windows assigned to this cluster
    pub segment_count: usize,
    /// Total attributed audio duration in seconds
    pub total_duration: f64,
    /// Sequence number of the last window that updated this cluster
    pub last_updated: u64,
}

/// A time-stamped transcript utterance from the transcription engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptUtterance {
    /// Transcript text
    pub text: String,
    /// Start time in seconds
    pub start_time: f64,
    /// End time in seconds
    pub end_time: f64,
}

impl TranscriptUtterance {
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }
}

/// A transcript utterance attributed to a speaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabeledUtterance {
    /// Transcript text
    pub text: String,
    /// Start time in seconds
    pub start_time: f64,
    /// End time in seconds
    pub end_time: f64,
    /// Stable display label ("Speaker 1", "Speaker 2", ...)
    pub speaker_label: String,
    /// Fraction of the utterance covered by the attributed segment (0.0 to 1.0)
    pub alignment_confidence: f32,
    /// Whether this utterance lies in overlapping speech
    pub is_overlapping: bool,
}

impl LabeledUtterance {
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }
}

/// Where a speaker name assignment came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MappingSource {
    /// Produced by the identification engine
    Identification,
    /// Set by the user; terminal, never overwritten automatically
    Manual,
}

impl std::fmt::Display for MappingSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MappingSource::Identification => write!(f, "identification"),
            MappingSource::Manual => write!(f, "manual"),
        }
    }
}

/// Mapping between a speaker label and an assigned name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerMapping {
    /// Speaker label (e.g., "Speaker 1")
    pub speaker_label: String,
    /// Assigned name, if any
    pub assigned_name: Option<String>,
    /// Confidence of the assignment (0.0 to 1.0; 1.0 for manual entries)
    pub confidence: f32,
    /// How the assignment was made
    pub source: MappingSource,
}

/// A candidate speaker name extracted from transcript text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentificationCandidate {
    /// Speaker label the candidate is for
    pub speaker_label: String,
    /// Extracted name
    pub name: String,
    /// Confidence score (0.0 to 1.0)
    pub confidence: f32,
    /// Index of the utterance the pattern was found in
    pub source_index: usize,
}

/// Audit record of a voice cluster observed in a meeting
///
/// embedding_digest is a one-way SHA-256 digest of the in-memory centroid.
/// The raw vector is never persisted and the digest supports no similarity
/// lookup, so these records cannot power cross-meeting recognition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceProfileRecord {
    /// Unique profile ID
    pub profile_id: String,
    /// Meeting this cluster was observed in
    pub meeting_id: String,
    /// Speaker label the cluster received in that meeting
    pub speaker_label: String,
    /// Hex SHA-256 digest of the centroid embedding
    pub embedding_digest: String,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// When the record becomes eligible for deletion
    pub retention_expiry: DateTime<Utc>,
}

/// Per-speaker statistics derived from labeled utterances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerStatistics {
    /// Speaker label
    pub speaker_label: String,
    /// Total speaking time in seconds
    pub speaking_time_seconds: f64,
    /// Share of the meeting duration (0.0 to 100.0; overlapping speech can
    /// push the sum across speakers above 100)
    pub speaking_percentage: f32,
    /// Number of speaking turns
    pub turn_count: u32,
}

/// An utterance the merger could not attribute to any cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignmentFailure {
    /// Index of the utterance in transcript order
    pub utterance_index: usize,
    /// Start time in seconds
    pub start_time: f64,
    /// End time in seconds
    pub end_time: f64,
}

/// Result of one diarization run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Meeting the run belongs to
    pub meeting_id: String,
    /// Labeled utterances in transcript order
    pub utterances: Vec<LabeledUtterance>,
    /// Effective speaker mappings after the run
    pub mappings: Vec<SpeakerMapping>,
    /// Whether the run fell back from an external provider
    pub degraded: bool,
    /// Utterances that could not be aligned to any cluster
    pub alignment_failures: Vec<AlignmentFailure>,
    /// Analysis windows skipped because embedding extraction failed
    pub skipped_windows: usize,
}
