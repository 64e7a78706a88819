// Database migrations
// Creates and updates the database schema

use anyhow::{Context, Result};
use rusqlite::Connection;

/// Current schema version
const SCHEMA_VERSION: i32 = 2;

/// Run all necessary migrations to bring the database up to date
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < 2 {
        migrate_v2(conn)?;
    }

    log::debug!("Database schema at version {}", SCHEMA_VERSION);
    Ok(())
}

/// Get the current schema version from the database
fn get_schema_version(conn: &Connection) -> Result<i32> {
    // Check if schema_version table exists
    let table_exists: bool = conn
        .query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(false);

    if !table_exists {
        return Ok(0);
    }

    let version: i32 = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get(0)
        })
        .unwrap_or(0);

    Ok(version)
}

fn record_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?1, datetime('now'))",
        [version],
    )
    .context("Failed to record schema version")?;
    Ok(())
}

/// Initial schema creation (version 1)
fn migrate_v1(conn: &Connection) -> Result<()> {
    log::info!("Running migration v1: initial schema");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS meetings (
            id TEXT PRIMARY KEY,
            total_duration REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT
        );

        CREATE TABLE IF NOT EXISTS labeled_utterances (
            id TEXT PRIMARY KEY,
            meeting_id TEXT NOT NULL REFERENCES meetings(id) ON DELETE CASCADE,
            sequence_id INTEGER NOT NULL,
            text TEXT NOT NULL,
            start_time REAL NOT NULL,
            end_time REAL NOT NULL,
            speaker_label TEXT NOT NULL,
            alignment_confidence REAL NOT NULL,
            is_overlapping INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS speaker_mappings (
            id TEXT PRIMARY KEY,
            meeting_id TEXT NOT NULL,
            speaker_label TEXT NOT NULL,
            assigned_name TEXT,
            confidence REAL NOT NULL,
            source TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS voice_profiles (
            profile_id TEXT PRIMARY KEY,
            meeting_id TEXT NOT NULL,
            speaker_label TEXT NOT NULL,
            embedding_digest TEXT NOT NULL,
            created_at TEXT NOT NULL,
            retention_expiry TEXT NOT NULL
        );
        "#,
    )
    .context("Failed to create initial schema")?;

    record_version(conn, 1)
}

/// Query indexes (version 2)
fn migrate_v2(conn: &Connection) -> Result<()> {
    log::info!("Running migration v2: indexes");

    conn.execute_batch(
        r#"
        CREATE INDEX IF NOT EXISTS idx_utterances_meeting
            ON labeled_utterances(meeting_id, sequence_id);
        CREATE INDEX IF NOT EXISTS idx_mappings_meeting
            ON speaker_mappings(meeting_id, speaker_label);
        CREATE INDEX IF NOT EXISTS idx_profiles_expiry
            ON voice_profiles(retention_expiry);
        "#,
    )
    .context("Failed to create indexes")?;

    record_version(conn, 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }
}
