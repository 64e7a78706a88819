// Labeled utterances repository
// Stores the merger's output per meeting; statistics are recomputed from
// these rows on every request

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use uuid::Uuid;

use super::DatabaseManager;
use crate::diarization::types::LabeledUtterance;

impl DatabaseManager {
    /// Replace a meeting's labeled utterances with a new set
    pub fn replace_utterances(
        &self,
        meeting_id: &str,
        utterances: &[LabeledUtterance],
        total_duration: f64,
    ) -> Result<()> {
        self.with_connection_mut(|conn| {
            replace_utterances_impl(conn, meeting_id, utterances, total_duration)
        })
    }

    /// Get all labeled utterances for a meeting, in transcript order
    pub fn get_utterances(&self, meeting_id: &str) -> Result<Vec<LabeledUtterance>> {
        self.with_connection(|conn| get_utterances_impl(conn, meeting_id))
    }

    /// Get a meeting's stored total duration, if the meeting exists
    pub fn get_meeting_duration(&self, meeting_id: &str) -> Result<Option<f64>> {
        self.with_connection(|conn| get_meeting_duration_impl(conn, meeting_id))
    }
}

fn replace_utterances_impl(
    conn: &mut Connection,
    meeting_id: &str,
    utterances: &[LabeledUtterance],
    total_duration: f64,
) -> Result<()> {
    let tx = conn.transaction().context("Failed to begin transaction")?;

    tx.execute(
        r#"
        INSERT INTO meetings (id, total_duration, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?3)
        ON CONFLICT(id) DO UPDATE SET
            total_duration = excluded.total_duration,
            updated_at = excluded.updated_at
        "#,
        params![meeting_id, total_duration, Utc::now().to_rfc3339()],
    )
    .context("Failed to upsert meeting")?;

    tx.execute(
        "DELETE FROM labeled_utterances WHERE meeting_id = ?1",
        params![meeting_id],
    )
    .context("Failed to clear previous utterances")?;

    for (sequence_id, utterance) in utterances.iter().enumerate() {
        tx.execute(
            r#"
            INSERT INTO labeled_utterances (
                id, meeting_id, sequence_id, text, start_time, end_time,
                speaker_label, alignment_confidence, is_overlapping
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                Uuid::new_v4().to_string(),
                meeting_id,
                sequence_id as i64,
                utterance.text,
                utterance.start_time,
                utterance.end_time,
                utterance.speaker_label,
                utterance.alignment_confidence as f64,
                utterance.is_overlapping,
            ],
        )
        .context("Failed to insert utterance")?;
    }

    tx.commit().context("Failed to commit utterances")?;
    Ok(())
}

fn get_utterances_impl(conn: &Connection, meeting_id: &str) -> Result<Vec<LabeledUtterance>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT text, start_time, end_time, speaker_label,
                   alignment_confidence, is_overlapping
            FROM labeled_utterances
            WHERE meeting_id = ?1
            ORDER BY sequence_id
            "#,
        )
        .context("Failed to prepare utterance query")?;

    let rows = stmt
        .query_map(params![meeting_id], |row| {
            Ok(LabeledUtterance {
                text: row.get(0)?,
                start_time: row.get(1)?,
                end_time: row.get(2)?,
                speaker_label: row.get(3)?,
                alignment_confidence: row.get::<_, f64>(4)? as f32,
                is_overlapping: row.get(5)?,
            })
        })
        .context("Failed to query utterances")?;

    let mut utterances = Vec::new();
    for row in rows {
        utterances.push(row.context("Failed to read utterance row")?);
    }
    Ok(utterances)
}

fn get_meeting_duration_impl(conn: &Connection, meeting_id: &str) -> Result<Option<f64>> {
    let duration = conn
        .query_row(
            "SELECT total_duration FROM meetings WHERE id = ?1",
            params![meeting_id],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })
        .context("Failed to query meeting duration")?;
    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn utterance(label: &str, start: f64, end: f64) -> LabeledUtterance {
        LabeledUtterance {
            text: format!("{} said something", label),
            start_time: start,
            end_time: end,
            speaker_label: label.to_string(),
            alignment_confidence: 0.9,
            is_overlapping: false,
        }
    }

    #[test]
    fn test_replace_and_read_back() {
        let dir = tempdir().unwrap();
        let db = DatabaseManager::new(dir.path().join("test.db")).unwrap();

        let utterances = vec![
            utterance("Speaker 1", 0.0, 5.0),
            utterance("Speaker 2", 5.0, 9.0),
        ];
        db.replace_utterances("meeting-1", &utterances, 9.0).unwrap();

        let loaded = db.get_utterances("meeting-1").unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].speaker_label, "Speaker 1");
        assert_eq!(loaded[1].speaker_label, "Speaker 2");
        assert_eq!(db.get_meeting_duration("meeting-1").unwrap(), Some(9.0));
    }

    #[test]
    fn test_replace_overwrites_previous_run() {
        let dir = tempdir().unwrap();
        let db = DatabaseManager::new(dir.path().join("test.db")).unwrap();

        db.replace_utterances("meeting-1", &[utterance("Speaker 1", 0.0, 5.0)], 5.0)
            .unwrap();
        db.replace_utterances("meeting-1", &[utterance("Speaker 1", 0.0, 3.0)], 3.0)
            .unwrap();

        let loaded = db.get_utterances("meeting-1").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(db.get_meeting_duration("meeting-1").unwrap(), Some(3.0));
    }

    #[test]
    fn test_unknown_meeting() {
        let dir = tempdir().unwrap();
        let db = DatabaseManager::new(dir.path().join("test.db")).unwrap();

        assert!(db.get_utterances("nope").unwrap().is_empty());
        assert_eq!(db.get_meeting_duration("nope").unwrap(), None);
    }
}
