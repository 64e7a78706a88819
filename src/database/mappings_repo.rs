// Speaker mappings repository
// Append-only history of name assignments; the effective mapping is
// resolved from history so Manual entries win structurally

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use super::models::{parse_mapping_source, MappingRecord};
use super::DatabaseManager;
use crate::diarization::types::{MappingSource, SpeakerMapping};

impl DatabaseManager {
    /// Append one mapping entry to the meeting's history
    pub fn append_mapping(&self, meeting_id: &str, mapping: &SpeakerMapping) -> Result<()> {
        self.with_connection(|conn| append_mapping_impl(conn, meeting_id, mapping))
    }

    /// Whether the label already has a manual entry in this meeting
    pub fn has_manual_mapping(&self, meeting_id: &str, speaker_label: &str) -> Result<bool> {
        self.with_connection(|conn| {
            let count: i64 = conn
                .query_row(
                    r#"
                    SELECT COUNT(*) FROM speaker_mappings
                    WHERE meeting_id = ?1 AND speaker_label = ?2 AND source = 'manual'
                    "#,
                    params![meeting_id, speaker_label],
                    |row| row.get(0),
                )
                .context("Failed to count manual mappings")?;
            Ok(count > 0)
        })
    }

    /// Full mapping history for a meeting, oldest first
    pub fn get_mapping_history(&self, meeting_id: &str) -> Result<Vec<MappingRecord>> {
        self.with_connection(|conn| get_mapping_history_impl(conn, meeting_id))
    }

    /// Resolve the effective mapping per speaker label
    ///
    /// The latest Manual entry wins outright; otherwise the strongest
    /// Identification entry (highest confidence, most recent on a tie).
    pub fn resolve_mappings(&self, meeting_id: &str) -> Result<Vec<SpeakerMapping>> {
        let history = self.get_mapping_history(meeting_id)?;

        let mut order: Vec<String> = Vec::new();
        let mut resolved: std::collections::HashMap<String, MappingRecord> =
            std::collections::HashMap::new();

        for record in history {
            let label = record.speaker_label.clone();
            if !resolved.contains_key(&label) {
                order.push(label.clone());
                resolved.insert(label, record);
                continue;
            }

            let current = &resolved[&label];
            let replace = match (current.source, record.source) {
                // History is ordered, so a later manual entry is the newer one
                (_, MappingSource::Manual) => true,
                (MappingSource::Manual, MappingSource::Identification) => false,
                (MappingSource::Identification, MappingSource::Identification) => {
                    record.confidence >= current.confidence
                }
            };
            if replace {
                resolved.insert(label, record);
            }
        }

        Ok(order
            .into_iter()
            .filter_map(|label| resolved.remove(&label).map(|r| r.to_mapping()))
            .collect())
    }
}

fn append_mapping_impl(
    conn: &Connection,
    meeting_id: &str,
    mapping: &SpeakerMapping,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO speaker_mappings (
            id, meeting_id, speaker_label, assigned_name, confidence, source, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            Uuid::new_v4().to_string(),
            meeting_id,
            mapping.speaker_label,
            mapping.assigned_name,
            mapping.confidence as f64,
            mapping.source.to_string(),
            Utc::now().to_rfc3339(),
        ],
    )
    .context("Failed to append speaker mapping")?;
    Ok(())
}

fn get_mapping_history_impl(conn: &Connection, meeting_id: &str) -> Result<Vec<MappingRecord>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT id, meeting_id, speaker_label, assigned_name, confidence, source, created_at
            FROM speaker_mappings
            WHERE meeting_id = ?1
            ORDER BY created_at, rowid
            "#,
        )
        .context("Failed to prepare mapping query")?;

    let rows = stmt
        .query_map(params![meeting_id], |row| {
            let source: String = row.get(5)?;
            let created_at: String = row.get(6)?;
            Ok(MappingRecord {
                id: row.get(0)?,
                meeting_id: row.get(1)?,
                speaker_label: row.get(2)?,
                assigned_name: row.get(3)?,
                confidence: row.get::<_, f64>(4)? as f32,
                source: parse_mapping_source(&source),
                created_at: created_at
                    .parse::<DateTime<Utc>>()
                    .unwrap_or_else(|_| Utc::now()),
            })
        })
        .context("Failed to query mappings")?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row.context("Failed to read mapping row")?);
    }
    Ok(records)
}
