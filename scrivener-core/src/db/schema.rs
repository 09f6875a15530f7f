//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: Initial schema
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        id               TEXT PRIMARY KEY,
        slug             TEXT NOT NULL DEFAULT '',
        project_path     TEXT,
        working_dir      TEXT,
        started_at       DATETIME NOT NULL,
        ended_at         DATETIME,
        message_count    INTEGER NOT NULL DEFAULT 0,
        version          TEXT,
        transcript_path  TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_sessions_started ON sessions(started_at DESC);

    CREATE TABLE IF NOT EXISTS messages (
        uuid             TEXT PRIMARY KEY,
        session_id       TEXT NOT NULL REFERENCES sessions(id),
        ts               DATETIME NOT NULL,
        role             TEXT NOT NULL,
        text_content     TEXT NOT NULL DEFAULT '',
        thinking_content TEXT,
        model            TEXT,
        cwd              TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);
    CREATE INDEX IF NOT EXISTS idx_messages_ts ON messages(ts);

    -- tool_id is assigned per invocation by the host, but only guaranteed
    -- unique within its owning message
    CREATE TABLE IF NOT EXISTS tool_calls (
        tool_id          TEXT NOT NULL,
        message_uuid     TEXT NOT NULL REFERENCES messages(uuid),
        session_id       TEXT NOT NULL,
        name             TEXT NOT NULL,
        input            JSON NOT NULL,
        output           TEXT,
        PRIMARY KEY (message_uuid, tool_id)
    );

    CREATE INDEX IF NOT EXISTS idx_tool_calls_session ON tool_calls(session_id);

    CREATE TABLE IF NOT EXISTS file_positions (
        path             TEXT PRIMARY KEY,
        byte_offset      INTEGER NOT NULL DEFAULT 0,
        updated_at       DATETIME
    );

    -- Full-text index over message text only (not thinking or tool payloads).
    -- External-content table; the triggers below keep it transactionally
    -- consistent with the messages table.
    CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
        text_content,
        content='messages',
        content_rowid='rowid'
    );

    CREATE TRIGGER IF NOT EXISTS messages_fts_insert
    AFTER INSERT ON messages BEGIN
        INSERT INTO messages_fts(rowid, text_content)
        VALUES (NEW.rowid, NEW.text_content);
    END;

    CREATE TRIGGER IF NOT EXISTS messages_fts_delete
    AFTER DELETE ON messages BEGIN
        INSERT INTO messages_fts(messages_fts, rowid, text_content)
        VALUES ('delete', OLD.rowid, OLD.text_content);
    END;

    CREATE TRIGGER IF NOT EXISTS messages_fts_update
    AFTER UPDATE ON messages BEGIN
        INSERT INTO messages_fts(messages_fts, rowid, text_content)
        VALUES ('delete', OLD.rowid, OLD.text_content);
        INSERT INTO messages_fts(rowid, text_content)
        VALUES (NEW.rowid, NEW.text_content);
    END;
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::debug!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}
