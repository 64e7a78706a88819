// Meeting diarization core
//
// Library crate implementing the diarization pipeline for meeting
// recordings: segmentation and clustering, transcript merging, speaker
// identification, audit-grade voice profile storage, and statistics.
// Audio capture, speech-to-text, the embedding/text models themselves and
// the UI are external collaborators.

// Performance logging macros - exported for use by other modules
#[macro_use]
pub mod macros;

// Core modules
pub mod database;
pub mod diarization;

// The service surface most hosts need
pub use diarization::{
    AudioChunk, DiarizationConfig, DiarizationError, DiarizationService, LabeledUtterance,
    PrivacyMode, ProcessingMode, RealtimeSession, RunSummary, ServiceSettings, SpeakerMapping,
    SpeakerStatistics, TranscriptUtterance,
};
pub use database::DatabaseManager;
