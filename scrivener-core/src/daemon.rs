//! Ingestion daemon core
//!
//! Per-session state machine driving incremental transcript ingestion. The
//! binary owns the actual loop (timer, signals, file-change notifications);
//! everything here is synchronous and testable: [`Daemon::tick`] performs one
//! full reconcile-and-ingest pass and can be called from a poll timer, a
//! change notification, or a test, interchangeably.
//!
//! Session lifecycle:
//! - **Discovered**: a registry marker exists but the transcript has not yet
//!   yielded session metadata. The transcript file may not even exist yet.
//! - **Active**: metadata was read and a session row upserted; every tick
//!   ingests new bytes past the stored offset.
//! - When the marker vanishes the session is finalized: one last incremental
//!   read, then the end time is recorded and in-memory state is dropped.
//!
//! Ingestion is byte-offset based and idempotent: offsets only move forward,
//! message uuids de-duplicate re-reads, and a partial trailing line parses to
//! nothing now and parses whole once the writer completes it.

use crate::db::Database;
use crate::error::Result;
use crate::parser::{self, SessionMeta};
use crate::registry::Registry;
use crate::types::Session;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Where a tracked session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Marker seen, no session metadata yet
    Discovered,
    /// Session row exists, ingesting incrementally
    Active,
}

#[derive(Debug)]
struct Tracked {
    transcript_path: PathBuf,
    state: SessionState,
}

/// What one [`Daemon::tick`] did, for logging and for the binary to react to
/// (newly discovered transcripts get a file watch added).
#[derive(Debug, Default)]
pub struct TickReport {
    /// Transcript paths first seen this tick
    pub discovered: Vec<PathBuf>,
    /// New messages stored this tick
    pub messages_inserted: usize,
    /// Sessions finalized this tick
    pub finalized: usize,
}

/// The ingestion daemon's state machine.
pub struct Daemon {
    db: Database,
    registry: Registry,
    tracked: HashMap<String, Tracked>,
}

impl Daemon {
    pub fn new(db: Database, registry: Registry) -> Self {
        Self {
            db,
            registry,
            tracked: HashMap::new(),
        }
    }

    /// Current lifecycle state of a tracked session, if any.
    pub fn session_state(&self, session_id: &str) -> Option<SessionState> {
        self.tracked.get(session_id).map(|t| t.state)
    }

    /// One reconcile-and-ingest pass.
    ///
    /// Reconciles the in-memory tracked set against the registry (the
    /// registry wins in both directions), then runs incremental processing
    /// for every tracked session. A failure in one session is logged and
    /// never blocks the others.
    pub fn tick(&mut self) -> Result<TickReport> {
        let mut report = TickReport::default();

        let registered = self.registry.list_registered()?;
        let live_ids: HashSet<&str> = registered.iter().map(|s| s.session_id.as_str()).collect();

        // Markers gone: finalize those sessions
        let vanished: Vec<String> = self
            .tracked
            .keys()
            .filter(|id| !live_ids.contains(id.as_str()))
            .cloned()
            .collect();
        for session_id in vanished {
            self.finalize(&session_id, &mut report);
        }

        // New markers: start tracking
        for live in &registered {
            if !self.tracked.contains_key(&live.session_id) {
                tracing::info!(session_id = %live.session_id, path = ?live.transcript_path, "Discovered live session");
                report.discovered.push(live.transcript_path.clone());
                self.tracked.insert(
                    live.session_id.clone(),
                    Tracked {
                        transcript_path: live.transcript_path.clone(),
                        state: SessionState::Discovered,
                    },
                );
            }
        }

        // Ingest for everything still tracked
        let ids: Vec<String> = self.tracked.keys().cloned().collect();
        for session_id in ids {
            match self.process(&session_id) {
                Ok(inserted) => report.messages_inserted += inserted,
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Ingestion pass failed")
                }
            }
        }

        Ok(report)
    }

    /// Final ingest pass and end-time stamp for every tracked session.
    /// Called when the daemon is shutting down.
    pub fn shutdown(&mut self) -> Result<TickReport> {
        let mut report = TickReport::default();
        let ids: Vec<String> = self.tracked.keys().cloned().collect();
        for session_id in ids {
            self.finalize(&session_id, &mut report);
        }
        Ok(report)
    }

    fn finalize(&mut self, session_id: &str, report: &mut TickReport) {
        tracing::info!(session_id, "Finalizing session");

        match self.process(session_id) {
            Ok(inserted) => report.messages_inserted += inserted,
            Err(e) => tracing::warn!(session_id, error = %e, "Final ingestion pass failed"),
        }

        // A session that never produced metadata has no row; the update is a
        // harmless no-op then.
        if let Err(e) = self.db.end_session(session_id, Utc::now()) {
            tracing::warn!(session_id, error = %e, "Failed to record session end time");
        }

        self.tracked.remove(session_id);
        report.finalized += 1;
    }

    /// Incremental ingestion for one tracked session.
    ///
    /// Returns the number of new messages stored. The stored offset advances
    /// past every newline-terminated line read this pass, whether or not it
    /// produced a message; an unterminated trailing line is left behind the
    /// offset and re-read in full on a later tick, once the writer has
    /// finished it.
    fn process(&mut self, session_id: &str) -> Result<usize> {
        let (path, state) = match self.tracked.get(session_id) {
            Some(t) => (t.transcript_path.clone(), t.state),
            None => return Ok(0),
        };

        let offset = self.db.file_position(&path)?;

        let len = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            // The host creates the transcript lazily; stay Discovered
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        if len <= offset {
            if len < offset {
                tracing::warn!(path = ?path, offset, len, "Transcript shrank below stored offset");
            }
            return Ok(0);
        }

        let bytes = std::fs::read(&path)?;
        let start = (offset as usize).min(bytes.len());
        let tail = &bytes[start..];

        // Only consume up to the last complete line; a half-written tail is
        // re-read in full next tick
        let consumed = match tail.iter().rposition(|&b| b == b'\n') {
            Some(idx) => idx + 1,
            None => return Ok(0),
        };
        let text = String::from_utf8_lossy(&tail[..consumed]);
        let batch = parser::parse_transcript(&text);

        if batch.skipped_lines > 0 {
            tracing::debug!(path = ?path, skipped = batch.skipped_lines, "Skipped unparseable lines");
        }

        if let Some(meta) = &batch.session {
            self.db.upsert_session(&session_from_meta(meta, &path))?;
            if state == SessionState::Discovered {
                tracing::info!(session_id, "Session metadata read, now active");
                if let Some(t) = self.tracked.get_mut(session_id) {
                    t.state = SessionState::Active;
                }
            }
        }

        let mut inserted = 0;
        for msg in &batch.messages {
            match self.db.insert_message(msg) {
                Ok(true) => inserted += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(uuid = %msg.uuid, error = %e, "Failed to store message")
                }
            }
        }

        self.db.set_file_position(&path, (start + consumed) as u64)?;

        if inserted > 0 {
            tracing::debug!(session_id, inserted, "Stored new messages");
        }
        Ok(inserted)
    }
}

/// Build a session row from parsed metadata and the transcript location.
fn session_from_meta(meta: &SessionMeta, transcript_path: &Path) -> Session {
    let slug = meta
        .slug
        .clone()
        .or_else(|| {
            meta.working_dir
                .as_deref()
                .and_then(|wd| Path::new(wd).file_name())
                .and_then(|n| n.to_str())
                .map(str::to_string)
        })
        .unwrap_or_default();

    Session {
        id: meta.session_id.clone(),
        slug,
        project_path: decode_project_path(transcript_path),
        working_dir: meta.working_dir.clone(),
        started_at: meta.first_timestamp,
        ended_at: None,
        message_count: 0,
        version: meta.version.clone(),
        transcript_path: transcript_path.to_string_lossy().into_owned(),
    }
}

/// Decode the project path from the transcript's parent directory name.
///
/// The host stores transcripts under a folder named after the project path
/// with separators replaced by dashes, e.g. `-home-user-dev-myproject`.
/// Paths whose components contain literal dashes decode wrongly; the value
/// is informational only.
fn decode_project_path(transcript_path: &Path) -> Option<String> {
    let folder = transcript_path.parent()?.file_name()?.to_str()?;
    if !folder.starts_with('-') {
        return None;
    }
    Some(folder.replace('-', "/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LiveSession;
    use std::io::Write;
    use tempfile::TempDir;

    fn setup() -> (Daemon, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let registry = Registry::new(dir.path().join("registry"));
        (Daemon::new(db, registry), dir)
    }

    fn entry(uuid: &str, session: &str, role: &str, text: &str) -> String {
        format!(
            r#"{{"uuid":"{uuid}","sessionId":"{session}","type":"{role}","timestamp":"2026-08-25T10:00:00Z","cwd":"/home/dev/proj","version":"2.1.0","message":{{"role":"{role}","content":[{{"type":"text","text":"{text}"}}]}}}}"#
        )
    }

    fn register(daemon: &Daemon, id: &str, path: &Path) {
        daemon
            .registry
            .register(&LiveSession {
                session_id: id.to_string(),
                transcript_path: path.to_path_buf(),
            })
            .unwrap();
    }

    #[test]
    fn test_discovers_and_activates_session() {
        let (mut daemon, dir) = setup();
        let transcript = dir.path().join("s1.jsonl");
        register(&daemon, "s1", &transcript);

        // Marker exists but no transcript file yet
        let report = daemon.tick().unwrap();
        assert_eq!(report.discovered, vec![transcript.clone()]);
        assert_eq!(daemon.session_state("s1"), Some(SessionState::Discovered));

        std::fs::write(&transcript, entry("m1", "s1", "user", "hello") + "\n").unwrap();
        let report = daemon.tick().unwrap();
        assert_eq!(report.messages_inserted, 1);
        assert_eq!(daemon.session_state("s1"), Some(SessionState::Active));

        let session = daemon.db.get_session("s1").unwrap().unwrap();
        assert_eq!(session.message_count, 1);
        assert!(session.ended_at.is_none());
    }

    #[test]
    fn test_incremental_append_only_reads_new_bytes() {
        let (mut daemon, dir) = setup();
        let transcript = dir.path().join("s1.jsonl");
        register(&daemon, "s1", &transcript);

        std::fs::write(&transcript, entry("m1", "s1", "user", "one") + "\n").unwrap();
        daemon.tick().unwrap();

        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(&transcript)
            .unwrap();
        writeln!(f, "{}", entry("m2", "s1", "assistant", "two")).unwrap();
        drop(f);

        let report = daemon.tick().unwrap();
        assert_eq!(report.messages_inserted, 1);
        assert_eq!(daemon.db.session_messages("s1").unwrap().len(), 2);
    }

    #[test]
    fn test_idle_tick_inserts_nothing() {
        let (mut daemon, dir) = setup();
        let transcript = dir.path().join("s1.jsonl");
        register(&daemon, "s1", &transcript);
        std::fs::write(&transcript, entry("m1", "s1", "user", "hi") + "\n").unwrap();

        daemon.tick().unwrap();
        let report = daemon.tick().unwrap();
        assert_eq!(report.messages_inserted, 0);
        assert!(report.discovered.is_empty());
    }

    #[test]
    fn test_marker_removal_finalizes_session() {
        let (mut daemon, dir) = setup();
        let transcript = dir.path().join("s1.jsonl");
        register(&daemon, "s1", &transcript);
        std::fs::write(&transcript, entry("m1", "s1", "user", "hi") + "\n").unwrap();
        daemon.tick().unwrap();

        // Append after the last tick, then unregister: the final pass must
        // still pick the tail up
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(&transcript)
            .unwrap();
        writeln!(f, "{}", entry("m2", "s1", "assistant", "bye")).unwrap();
        drop(f);
        daemon.registry.unregister("s1").unwrap();

        let report = daemon.tick().unwrap();
        assert_eq!(report.finalized, 1);
        assert_eq!(report.messages_inserted, 1);
        assert_eq!(daemon.session_state("s1"), None);

        let session = daemon.db.get_session("s1").unwrap().unwrap();
        assert!(session.ended_at.is_some());
        assert_eq!(session.message_count, 2);
    }

    #[test]
    fn test_shutdown_finalizes_all_tracked() {
        let (mut daemon, dir) = setup();
        for id in ["s1", "s2"] {
            let transcript = dir.path().join(format!("{id}.jsonl"));
            register(&daemon, id, &transcript);
            std::fs::write(&transcript, entry("m1", id, "user", "hi") + "\n").unwrap();
        }
        daemon.tick().unwrap();

        let report = daemon.shutdown().unwrap();
        assert_eq!(report.finalized, 2);
        assert!(daemon.db.get_session("s1").unwrap().unwrap().ended_at.is_some());
        assert!(daemon.db.get_session("s2").unwrap().unwrap().ended_at.is_some());
    }

    #[test]
    fn test_partial_trailing_line_completed_later() {
        let (mut daemon, dir) = setup();
        let transcript = dir.path().join("s1.jsonl");
        register(&daemon, "s1", &transcript);

        let full = entry("m1", "s1", "user", "split across writes");
        let (head, tail) = full.split_at(full.len() / 2);

        std::fs::write(&transcript, head).unwrap();
        let report = daemon.tick().unwrap();
        assert_eq!(report.messages_inserted, 0);
        assert_eq!(daemon.db.file_position(&transcript).unwrap(), 0);

        // Writer finishes the line; it is re-read in full, nothing lost
        std::fs::write(
            &transcript,
            format!("{head}{tail}\n{}\n", entry("m2", "s1", "user", "next")),
        )
        .unwrap();
        let report = daemon.tick().unwrap();
        assert_eq!(report.messages_inserted, 2);
        assert_eq!(daemon.db.session_messages("s1").unwrap()[0].uuid, "m1");
    }

    #[test]
    fn test_one_bad_session_does_not_block_others() {
        let (mut daemon, dir) = setup();

        // s1's transcript path is a directory: reads fail
        let bad_path = dir.path().join("not-a-file");
        std::fs::create_dir(&bad_path).unwrap();
        register(&daemon, "s1", &bad_path);

        let good = dir.path().join("s2.jsonl");
        register(&daemon, "s2", &good);
        std::fs::write(&good, entry("m1", "s2", "user", "hi") + "\n").unwrap();

        let report = daemon.tick().unwrap();
        assert_eq!(report.messages_inserted, 1);
        assert!(daemon.db.get_session("s2").unwrap().is_some());
    }

    #[test]
    fn test_decode_project_path() {
        assert_eq!(
            decode_project_path(Path::new("/data/projects/-home-dev-proj/s.jsonl")),
            Some("/home/dev/proj".to_string())
        );
        assert_eq!(
            decode_project_path(Path::new("/data/projects/plain/s.jsonl")),
            None
        );
    }
}
