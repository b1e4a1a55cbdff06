use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS editor_cache (
    rec_id INTEGER NOT NULL,
    uid INTEGER NOT NULL,
    mtime_ms INTEGER NOT NULL,
    dirty INTEGER NOT NULL DEFAULT 0,
    fingerprint BLOB NOT NULL CHECK (length(fingerprint) = 32),
    entry BLOB NOT NULL,
    PRIMARY KEY (rec_id, uid)
);

CREATE TABLE IF NOT EXISTS hp_changesets (
    changeset_number INTEGER PRIMARY KEY AUTOINCREMENT,
    rec_id INTEGER NOT NULL,
    record BLOB NOT NULL,
    created_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_hp_changesets_rec ON hp_changesets (rec_id, changeset_number);
";
