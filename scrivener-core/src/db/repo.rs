//! Database repository layer
//!
//! Provides the mutation and query operations of the storage engine. All
//! multi-statement writes run inside a transaction; the message uuid and
//! tool_id primary keys make every insert idempotent.

use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

/// Database handle with a single connection behind a mutex
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL allows concurrent readers while the daemon writes; busy_timeout
        // bounds the wait when a reader holds the database mid-checkpoint.
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&conn)
    }

    // ============================================
    // Session operations
    // ============================================

    /// Insert or update a session by id.
    ///
    /// The update path never touches `started_at`, `ended_at` or
    /// `message_count`: start time is set once and finalization owns the
    /// end time. Descriptive fields only improve: an empty or missing value
    /// in a later batch never clobbers one already stored.
    pub fn upsert_session(&self, session: &Session) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO sessions (id, slug, project_path, working_dir, started_at, version, transcript_path)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                slug = COALESCE(NULLIF(excluded.slug, ''), sessions.slug),
                project_path = COALESCE(excluded.project_path, sessions.project_path),
                working_dir = COALESCE(excluded.working_dir, sessions.working_dir),
                version = COALESCE(excluded.version, sessions.version),
                transcript_path = excluded.transcript_path
            "#,
            params![
                session.id,
                session.slug,
                session.project_path,
                session.working_dir,
                session.started_at.to_rfc3339(),
                session.version,
                session.transcript_path,
            ],
        )?;
        Ok(())
    }

    /// Set a session's end time. Idempotent; no ordering check against
    /// `started_at` is enforced here.
    pub fn end_session(&self, id: &str, end_time: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sessions SET ended_at = ?2 WHERE id = ?1",
            params![id, end_time.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Fetch one session by id
    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM sessions WHERE id = ?", [id], Self::row_to_session)
            .optional()
            .map_err(Error::from)
    }

    /// List sessions ordered by start time descending
    pub fn list_sessions(&self, limit: usize) -> Result<Vec<Session>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM sessions ORDER BY started_at DESC LIMIT ?")?;
        let rows = stmt.query_map([limit as i64], Self::row_to_session)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// List sessions ordered by most-recent message activity
    pub fn list_sessions_by_activity(&self, limit: usize) -> Result<Vec<Session>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT s.*
            FROM sessions s
            LEFT JOIN (
                SELECT session_id, MAX(ts) AS last_ts
                FROM messages
                GROUP BY session_id
            ) m ON m.session_id = s.id
            ORDER BY COALESCE(m.last_ts, s.started_at) DESC
            LIMIT ?
            "#,
        )?;
        let rows = stmt.query_map([limit as i64], Self::row_to_session)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    fn row_to_session(row: &Row) -> rusqlite::Result<Session> {
        Ok(Session {
            id: row.get("id")?,
            slug: row.get("slug")?,
            project_path: row.get("project_path")?,
            working_dir: row.get("working_dir")?,
            started_at: parse_ts(&row.get::<_, String>("started_at")?),
            ended_at: row
                .get::<_, Option<String>>("ended_at")?
                .map(|s| parse_ts(&s)),
            message_count: row.get("message_count")?,
            version: row.get("version")?,
            transcript_path: row.get("transcript_path")?,
        })
    }

    // ============================================
    // Message operations
    // ============================================

    /// Insert a message if its uuid is not already present.
    ///
    /// On a new insert, each nested tool call is inserted if absent (by
    /// tool_id) and the owning session's message count is recomputed as
    /// `COUNT(*)`. A duplicate uuid is a no-op, not an error; the return
    /// value reports whether the row was new.
    pub fn insert_message(&self, msg: &Message) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            r#"
            INSERT OR IGNORE INTO messages
                (uuid, session_id, ts, role, text_content, thinking_content, model, cwd)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                msg.uuid,
                msg.session_id,
                msg.timestamp.to_rfc3339(),
                msg.role.as_str(),
                msg.text_content,
                msg.thinking_content,
                msg.model,
                msg.cwd,
            ],
        )?;

        if inserted > 0 {
            for call in &msg.tool_calls {
                tx.execute(
                    r#"
                    INSERT OR IGNORE INTO tool_calls
                        (tool_id, message_uuid, session_id, name, input, output)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    "#,
                    params![
                        call.tool_id,
                        msg.uuid,
                        msg.session_id,
                        call.name,
                        call.input.to_string(),
                        call.output,
                    ],
                )?;
            }

            tx.execute(
                r#"
                UPDATE sessions
                SET message_count = (SELECT COUNT(*) FROM messages WHERE session_id = ?1)
                WHERE id = ?1
                "#,
                params![msg.session_id],
            )?;
        }

        tx.commit()?;
        Ok(inserted > 0)
    }

    /// Fetch all messages for a session, timestamp-ascending, with their
    /// tool calls attached.
    pub fn session_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT * FROM messages WHERE session_id = ? ORDER BY ts ASC, rowid ASC",
        )?;
        let mut messages: Vec<Message> = stmt
            .query_map([session_id], Self::row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = conn.prepare(
            "SELECT * FROM tool_calls WHERE session_id = ? ORDER BY rowid ASC",
        )?;
        let mut by_message: HashMap<String, Vec<ToolCall>> = HashMap::new();
        let calls = stmt.query_map([session_id], |row| {
            let message_uuid: String = row.get("message_uuid")?;
            let input_str: String = row.get("input")?;
            Ok((
                message_uuid,
                ToolCall {
                    tool_id: row.get("tool_id")?,
                    name: row.get("name")?,
                    input: serde_json::from_str(&input_str)
                        .unwrap_or(serde_json::Value::Null),
                    output: row.get("output")?,
                },
            ))
        })?;
        for call in calls {
            let (uuid, call) = call?;
            by_message.entry(uuid).or_default().push(call);
        }

        for msg in &mut messages {
            if let Some(calls) = by_message.remove(&msg.uuid) {
                msg.tool_calls = calls;
            }
        }

        Ok(messages)
    }

    fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
        let role_str: String = row.get("role")?;
        let role = Role::from_str(&role_str).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
        })?;

        Ok(Message {
            uuid: row.get("uuid")?,
            session_id: row.get("session_id")?,
            timestamp: parse_ts(&row.get::<_, String>("ts")?),
            role,
            text_content: row.get("text_content")?,
            thinking_content: row.get("thinking_content")?,
            model: row.get("model")?,
            cwd: row.get("cwd")?,
            tool_calls: Vec::new(),
        })
    }

    // ============================================
    // File position operations
    // ============================================

    /// Last successfully processed byte offset for a path, 0 if unknown
    pub fn file_position(&self, path: &Path) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let offset: Option<i64> = conn
            .query_row(
                "SELECT byte_offset FROM file_positions WHERE path = ?",
                [path.to_string_lossy()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(offset.unwrap_or(0).max(0) as u64)
    }

    /// Record the processed byte offset for a path.
    ///
    /// Offsets are monotonically non-decreasing per path: a smaller value
    /// than the stored one is ignored.
    pub fn set_file_position(&self, path: &Path, offset: u64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO file_positions (path, byte_offset, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(path) DO UPDATE SET
                byte_offset = MAX(file_positions.byte_offset, excluded.byte_offset),
                updated_at = excluded.updated_at
            "#,
            params![
                path.to_string_lossy(),
                offset as i64,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    // ============================================
    // Search and statistics
    // ============================================

    /// Full-text search over message text content.
    ///
    /// Returns hits ranked by bm25 relevance, each with a highlighted
    /// snippet. Thinking content and tool payloads are not indexed.
    pub fn search_messages(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let escaped = escape_fts_query(query);
        if escaped.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT m.uuid, m.session_id, m.ts, m.role,
                   snippet(messages_fts, 0, '[', ']', '…', 12) AS snippet,
                   bm25(messages_fts) AS rank
            FROM messages_fts
            JOIN messages m ON m.rowid = messages_fts.rowid
            WHERE messages_fts MATCH ?1
            ORDER BY rank
            LIMIT ?2
            "#,
        )?;

        let rows = stmt.query_map(params![escaped, limit as i64], |row| {
            let role_str: String = row.get("role")?;
            let role = Role::from_str(&role_str).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
            })?;
            let rank: f64 = row.get("rank")?;
            Ok(SearchHit {
                uuid: row.get("uuid")?,
                session_id: row.get("session_id")?,
                timestamp: parse_ts(&row.get::<_, String>("ts")?),
                role,
                snippet: row.get("snippet")?,
                // bm25 returns lower-is-better negative scores
                rank: -rank,
            })
        })?;

        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Aggregate usage statistics: entity counts and per-tool-name frequency
    pub fn usage_stats(&self) -> Result<UsageStats> {
        let conn = self.conn.lock().unwrap();

        let sessions: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))?;
        let messages: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?;
        let tool_calls: i64 =
            conn.query_row("SELECT COUNT(*) FROM tool_calls", [], |r| r.get(0))?;

        let mut stmt = conn.prepare(
            "SELECT name, COUNT(*) AS n FROM tool_calls GROUP BY name ORDER BY n DESC, name ASC",
        )?;
        let tool_breakdown = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(UsageStats {
            sessions,
            messages,
            tool_calls,
            tool_breakdown,
        })
    }
}

/// Parse an RFC 3339 timestamp from a TEXT column, falling back to now
fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Quote each query token so user input cannot inject FTS5 syntax
fn escape_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    fn sample_session(id: &str) -> Session {
        Session {
            id: id.to_string(),
            slug: "proj".to_string(),
            project_path: Some("/home/dev/proj".to_string()),
            working_dir: Some("/home/dev/proj".to_string()),
            started_at: Utc::now(),
            ended_at: None,
            message_count: 0,
            version: Some("2.1.0".to_string()),
            transcript_path: "/tmp/s1.jsonl".to_string(),
        }
    }

    fn sample_message(uuid: &str, session_id: &str, text: &str) -> Message {
        Message {
            uuid: uuid.to_string(),
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            role: Role::User,
            text_content: text.to_string(),
            thinking_content: None,
            model: None,
            cwd: None,
            tool_calls: Vec::new(),
        }
    }

    #[test]
    fn test_upsert_session_preserves_end_time_and_count() {
        let db = test_db();
        let session = sample_session("s1");
        db.upsert_session(&session).unwrap();

        db.insert_message(&sample_message("m1", "s1", "hello"))
            .unwrap();
        let end = Utc::now();
        db.end_session("s1", end).unwrap();

        // Re-upsert with changed slug must not clobber ended_at or count
        let mut updated = session.clone();
        updated.slug = "renamed".to_string();
        db.upsert_session(&updated).unwrap();

        let stored = db.get_session("s1").unwrap().unwrap();
        assert_eq!(stored.slug, "renamed");
        assert_eq!(stored.message_count, 1);
        assert!(stored.ended_at.is_some());
    }

    #[test]
    fn test_uuid_dedup_keeps_first_seen_content() {
        let db = test_db();
        db.upsert_session(&sample_session("s1")).unwrap();

        assert!(db
            .insert_message(&sample_message("m1", "s1", "first"))
            .unwrap());
        assert!(!db
            .insert_message(&sample_message("m1", "s1", "second"))
            .unwrap());

        let messages = db.session_messages("s1").unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text_content, "first");
    }

    #[test]
    fn test_message_count_invariant() {
        let db = test_db();
        db.upsert_session(&sample_session("s1")).unwrap();

        for i in 0..5 {
            db.insert_message(&sample_message(&format!("m{i}"), "s1", "x"))
                .unwrap();
        }
        // Duplicate does not bump the count
        db.insert_message(&sample_message("m0", "s1", "x")).unwrap();

        let session = db.get_session("s1").unwrap().unwrap();
        assert_eq!(session.message_count, 5);
    }

    #[test]
    fn test_tool_calls_round_trip() {
        let db = test_db();
        db.upsert_session(&sample_session("s1")).unwrap();

        let mut msg = sample_message("m1", "s1", "");
        msg.role = Role::Assistant;
        msg.tool_calls = vec![
            ToolCall {
                tool_id: "t1".to_string(),
                name: "Bash".to_string(),
                input: serde_json::json!({"command": "ls"}),
                output: Some("ok".to_string()),
            },
            ToolCall {
                tool_id: "t2".to_string(),
                name: "Read".to_string(),
                input: serde_json::json!({"path": "/x"}),
                output: None,
            },
        ];
        db.insert_message(&msg).unwrap();

        let messages = db.session_messages("s1").unwrap();
        let calls = &messages[0].tool_calls;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "Bash");
        assert_eq!(calls[0].output.as_deref(), Some("ok"));
        assert_eq!(calls[1].output, None);
        assert_eq!(calls[1].input["path"], "/x");
    }

    #[test]
    fn test_same_tool_id_under_different_messages() {
        let db = test_db();
        db.upsert_session(&sample_session("s1")).unwrap();
        db.upsert_session(&sample_session("s2")).unwrap();

        // The host's invocation ids are only unique per message; the same id
        // arriving under another message is a distinct call
        let call = ToolCall {
            tool_id: "call_1".to_string(),
            name: "Bash".to_string(),
            input: serde_json::json!({}),
            output: None,
        };
        let mut first = sample_message("m1", "s1", "");
        first.tool_calls = vec![call.clone()];
        let mut second = sample_message("m2", "s2", "");
        second.tool_calls = vec![call];

        db.insert_message(&first).unwrap();
        db.insert_message(&second).unwrap();

        assert_eq!(db.session_messages("s1").unwrap()[0].tool_calls.len(), 1);
        assert_eq!(db.session_messages("s2").unwrap()[0].tool_calls.len(), 1);
        assert_eq!(db.usage_stats().unwrap().tool_calls, 2);
    }

    #[test]
    fn test_upsert_keeps_descriptive_fields_over_empty_update() {
        let db = test_db();
        db.upsert_session(&sample_session("s1")).unwrap();

        // A later batch whose entries lacked slug/cwd/version must not wipe
        // the values already stored
        let mut sparse = sample_session("s1");
        sparse.slug = String::new();
        sparse.working_dir = None;
        sparse.project_path = None;
        sparse.version = None;
        db.upsert_session(&sparse).unwrap();

        let stored = db.get_session("s1").unwrap().unwrap();
        assert_eq!(stored.slug, "proj");
        assert_eq!(stored.working_dir.as_deref(), Some("/home/dev/proj"));
        assert_eq!(stored.project_path.as_deref(), Some("/home/dev/proj"));
        assert_eq!(stored.version.as_deref(), Some("2.1.0"));
    }

    #[test]
    fn test_end_session_idempotent() {
        let db = test_db();
        db.upsert_session(&sample_session("s1")).unwrap();

        let end = Utc::now();
        db.end_session("s1", end).unwrap();
        db.end_session("s1", end).unwrap();

        let session = db.get_session("s1").unwrap().unwrap();
        assert!(session.ended_at.is_some());
    }

    #[test]
    fn test_file_position_defaults_to_zero_and_is_monotonic() {
        let db = test_db();
        let path = Path::new("/tmp/x.jsonl");

        assert_eq!(db.file_position(path).unwrap(), 0);

        db.set_file_position(path, 100).unwrap();
        assert_eq!(db.file_position(path).unwrap(), 100);

        // A smaller offset never goes backwards
        db.set_file_position(path, 50).unwrap();
        assert_eq!(db.file_position(path).unwrap(), 100);

        db.set_file_position(path, 250).unwrap();
        assert_eq!(db.file_position(path).unwrap(), 250);
    }

    #[test]
    fn test_search_returns_ranked_snippet() {
        let db = test_db();
        db.upsert_session(&sample_session("s1")).unwrap();
        db.insert_message(&sample_message("m1", "s1", "the parser handles emoji correctly"))
            .unwrap();
        db.insert_message(&sample_message("m2", "s1", "unrelated content"))
            .unwrap();

        let hits = db.search_messages("parser", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].uuid, "m1");
        assert!(hits[0].snippet.contains("[parser]"));
    }

    #[test]
    fn test_search_does_not_index_thinking() {
        let db = test_db();
        db.upsert_session(&sample_session("s1")).unwrap();

        let mut msg = sample_message("m1", "s1", "visible words");
        msg.role = Role::Assistant;
        msg.thinking_content = Some("hiddenthought".to_string());
        db.insert_message(&msg).unwrap();

        assert!(db.search_messages("hiddenthought", 10).unwrap().is_empty());
        assert_eq!(db.search_messages("visible", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_search_escapes_fts_syntax() {
        let db = test_db();
        db.upsert_session(&sample_session("s1")).unwrap();
        db.insert_message(&sample_message("m1", "s1", "plain text"))
            .unwrap();

        // Must not error on operators or quotes
        assert!(db.search_messages("NEAR(\"x\"", 10).is_ok());
        assert!(db.search_messages("a AND b OR", 10).is_ok());
    }

    #[test]
    fn test_usage_stats() {
        let db = test_db();
        db.upsert_session(&sample_session("s1")).unwrap();

        let mut msg = sample_message("m1", "s1", "x");
        msg.role = Role::Assistant;
        msg.tool_calls = vec![
            ToolCall {
                tool_id: "t1".to_string(),
                name: "Bash".to_string(),
                input: serde_json::json!({}),
                output: None,
            },
            ToolCall {
                tool_id: "t2".to_string(),
                name: "Bash".to_string(),
                input: serde_json::json!({}),
                output: None,
            },
            ToolCall {
                tool_id: "t3".to_string(),
                name: "Read".to_string(),
                input: serde_json::json!({}),
                output: None,
            },
        ];
        db.insert_message(&msg).unwrap();
        db.insert_message(&sample_message("m2", "s1", "y")).unwrap();

        let stats = db.usage_stats().unwrap();
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.messages, 2);
        assert_eq!(stats.tool_calls, 3);
        assert_eq!(stats.tool_breakdown[0], ("Bash".to_string(), 2));
        assert_eq!(stats.tool_breakdown[1], ("Read".to_string(), 1));
    }

    #[test]
    fn test_list_sessions_by_activity() {
        let db = test_db();

        let mut old = sample_session("old");
        old.started_at = Utc::now() - chrono::Duration::hours(2);
        let mut fresh = sample_session("fresh");
        fresh.started_at = Utc::now() - chrono::Duration::hours(1);
        db.upsert_session(&old).unwrap();
        db.upsert_session(&fresh).unwrap();

        // A recent message makes the older session the most active
        db.insert_message(&sample_message("m1", "old", "ping"))
            .unwrap();

        let by_activity = db.list_sessions_by_activity(10).unwrap();
        assert_eq!(by_activity[0].id, "old");

        let by_start = db.list_sessions(10).unwrap();
        assert_eq!(by_start[0].id, "fresh");
    }
}
