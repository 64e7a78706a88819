// Error types for speaker diarization and identification

use thiserror::Error;

use super::types::Capability;

/// Errors that can occur during speaker diarization and identification
///
/// Per-window and per-utterance failures are not errors: skipped windows,
/// alignment failures and below-threshold identification candidates are
/// surfaced through `RunSummary` instead. Only capability-wide conditions
/// and persistence problems are raised through this enum.
#[derive(Debug, Error)]
pub enum DiarizationError {
    /// No usable provider for a required capability
    #[error("no usable {capability} provider: {reason}")]
    ModelUnavailable {
        capability: Capability,
        reason: String,
    },

    /// ExternalOnly mode with no external provider reachable
    #[error("external {capability} provider required but not configured: {reason}")]
    ExternalRequired {
        capability: Capability,
        reason: String,
    },

    /// A transient external provider failure (timeout, auth, rate limit)
    #[error("external provider error: {0}")]
    ExternalProviderError(String),

    /// A local provider failed to produce a result
    #[error("local provider error: {0}")]
    LocalProviderError(String),

    /// Transcript analysis produced an unusable response
    #[error("identification error: {0}")]
    IdentificationError(String),

    /// A profile or mapping write failed after bounded retries
    #[error("persistence error: {0}")]
    PersistenceError(String),

    /// Two writers targeted the same meeting's mapping
    #[error("concurrent modification of mapping for {speaker_label} in meeting {meeting_id}")]
    ConcurrentModificationConflict {
        meeting_id: String,
        speaker_label: String,
    },

    /// Rejected configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// No stored run data for the requested meeting
    #[error("meeting not found: {0}")]
    MeetingNotFound(String),

    /// A run is already active for the requested meeting
    #[error("a diarization run is already active for meeting {0}")]
    RunAlreadyActive(String),
}

/// Result type for diarization operations
pub type Result<T> = std::result::Result<T, DiarizationError>;

impl DiarizationError {
    /// Whether the caller may retry the operation with a different provider
    pub fn is_routable(&self) -> bool {
        matches!(
            self,
            DiarizationError::ExternalProviderError(_) | DiarizationError::LocalProviderError(_)
        )
    }
}
