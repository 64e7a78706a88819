// Voice profiles repository
// Audit records only: a one-way digest per observed cluster, swept once
// past its retention expiry

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use super::DatabaseManager;
use crate::diarization::types::VoiceProfileRecord;

impl DatabaseManager {
    /// Insert one voice profile record
    pub fn insert_voice_profile(&self, record: &VoiceProfileRecord) -> Result<()> {
        self.with_connection(|conn| insert_voice_profile_impl(conn, record))
    }

    /// All profile records for a meeting
    pub fn get_voice_profiles(&self, meeting_id: &str) -> Result<Vec<VoiceProfileRecord>> {
        self.with_connection(|conn| get_voice_profiles_impl(conn, meeting_id))
    }

    /// Delete every record whose retention expiry has passed
    pub fn delete_expired_profiles(&self, now: DateTime<Utc>) -> Result<usize> {
        self.with_connection(|conn| {
            let deleted = conn
                .execute(
                    "DELETE FROM voice_profiles WHERE retention_expiry <= ?1",
                    params![now.to_rfc3339()],
                )
                .context("Failed to delete expired profiles")?;
            Ok(deleted)
        })
    }
}

fn insert_voice_profile_impl(conn: &Connection, record: &VoiceProfileRecord) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO voice_profiles (
            profile_id, meeting_id, speaker_label, embedding_digest, created_at, retention_expiry
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        params![
            record.profile_id,
            record.meeting_id,
            record.speaker_label,
            record.embedding_digest,
            record.created_at.to_rfc3339(),
            record.retention_expiry.to_rfc3339(),
        ],
    )
    .context("Failed to insert voice profile")?;
    Ok(())
}

fn get_voice_profiles_impl(conn: &Connection, meeting_id: &str) -> Result<Vec<VoiceProfileRecord>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT profile_id, meeting_id, speaker_label, embedding_digest,
                   created_at, retention_expiry
            FROM voice_profiles
            WHERE meeting_id = ?1
            ORDER BY speaker_label
            "#,
        )
        .context("Failed to prepare profile query")?;

    let rows = stmt
        .query_map(params![meeting_id], |row| {
            let created_at: String = row.get(4)?;
            let retention_expiry: String = row.get(5)?;
            Ok(VoiceProfileRecord {
                profile_id: row.get(0)?,
                meeting_id: row.get(1)?,
                speaker_label: row.get(2)?,
                embedding_digest: row.get(3)?,
                created_at: created_at
                    .parse::<DateTime<Utc>>()
                    .unwrap_or_else(|_| Utc::now()),
                retention_expiry: retention_expiry
                    .parse::<DateTime<Utc>>()
                    .unwrap_or_else(|_| Utc::now()),
            })
        })
        .context("Failed to query voice profiles")?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row.context("Failed to read profile row")?);
    }
    Ok(records)
}
