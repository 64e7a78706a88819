// SQLite persistence for diarization results
//
// The core persists three things: labeled utterances (statistics are
// recomputed from them on demand), the append-only speaker-mapping history,
// and voice-profile audit records.

pub mod manager;
pub mod migrations;
pub mod models;

mod mappings_repo;
mod profiles_repo;
mod utterances_repo;

pub use manager::DatabaseManager;
pub use models::MappingRecord;
