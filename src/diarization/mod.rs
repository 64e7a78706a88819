// Speaker diarization and identification core
// Determines who spoke when, and optionally what each speaker's name is,
// under a user-selected privacy policy
//
// Components:
// - router: local vs. external provider selection per capability
// - engine + clustering: audio stream -> time-stamped speaker clusters
//   (batch and streaming strategies)
// - merger: clustered segments + transcript -> labeled utterances
// - identification: name candidates from self-introductions
// - profile_store: irreversible audit records with retention
// - statistics: per-speaker time, percentage and turn counts
// - service: the RPC-style surface the UI layer consumes

pub mod clustering;
pub mod engine;
pub mod errors;
pub mod identification;
pub mod merger;
pub mod profile_store;
pub mod providers;
pub mod router;
pub mod service;
pub mod statistics;
pub mod types;

// Re-export commonly used types
pub use errors::DiarizationError;
pub use merger::UNKNOWN_SPEAKER_LABEL;
pub use service::{DiarizationService, RealtimeSession, ServiceSettings};
pub use types::{
    AudioChunk, AudioSegment, Capability, DiarizationConfig, LabeledUtterance, MappingSource,
    PrivacyMode, ProcessingMode, RunSummary, SpeakerMapping, SpeakerStatistics,
    TranscriptUtterance, VoiceProfileRecord,
};
