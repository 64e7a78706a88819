// Row models for the persistence layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::diarization::types::{MappingSource, SpeakerMapping};

/// One entry in the append-only speaker-mapping history
///
/// The effective mapping for a label is resolved from this history; rows
/// are never updated in place, which is what makes Manual-wins structural
/// rather than convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingRecord {
    /// Row ID
    pub id: String,
    /// Meeting the mapping belongs to
    pub meeting_id: String,
    /// Speaker label (e.g., "Speaker 1")
    pub speaker_label: String,
    /// Assigned name, if any
    pub assigned_name: Option<String>,
    /// Confidence of the assignment
    pub confidence: f32,
    /// Identification or Manual
    pub source: MappingSource,
    /// When the entry was appended
    pub created_at: DateTime<Utc>,
}

impl MappingRecord {
    pub fn to_mapping(&self) -> SpeakerMapping {
        SpeakerMapping {
            speaker_label: self.speaker_label.clone(),
            assigned_name: self.assigned_name.clone(),
            confidence: self.confidence,
            source: self.source,
        }
    }
}

/// Parse a mapping source column value
pub fn parse_mapping_source(value: &str) -> MappingSource {
    match value {
        "manual" => MappingSource::Manual,
        _ => MappingSource::Identification,
    }
}
