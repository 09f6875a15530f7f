//! Live-session registry
//!
//! Durable filesystem registry of which sessions are currently open. The
//! lifecycle hooks write and remove one marker file per session; the daemon
//! treats the set of markers on disk as the authoritative watch list, so the
//! registry survives restarts of either side.
//!
//! Layout under the registry root:
//! - `sessions/<session_id>.json`: one marker per live session
//! - `daemon.pid`: pid of the running ingestion daemon, if any

use crate::config::Config;
use crate::error::{Error, Result};
use crate::types::LiveSession;
use std::path::PathBuf;

/// Filesystem-backed live-session registry.
pub struct Registry {
    root: PathBuf,
}

impl Registry {
    /// Open a registry rooted at the given directory.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Open the registry at the default runtime location.
    pub fn open_default() -> Self {
        Self::new(Config::runtime_dir())
    }

    fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    fn marker_path(&self, session_id: &str) -> PathBuf {
        // Session ids are opaque; a separator would escape the registry dir
        let safe: String = session_id
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.sessions_dir().join(format!("{safe}.json"))
    }

    /// Record a session as live. Registering an already-registered session
    /// overwrites its marker, so a repeated start hook converges on the
    /// latest transcript path.
    pub fn register(&self, session: &LiveSession) -> Result<()> {
        std::fs::create_dir_all(self.sessions_dir())?;
        let marker = self.marker_path(&session.session_id);
        let json = serde_json::to_string_pretty(session)?;
        std::fs::write(&marker, json)?;
        tracing::debug!(session_id = %session.session_id, path = ?marker, "Registered live session");
        Ok(())
    }

    /// Remove a session's marker. Removing a marker that does not exist is
    /// not an error.
    pub fn unregister(&self, session_id: &str) -> Result<()> {
        let marker = self.marker_path(session_id);
        match std::fs::remove_file(&marker) {
            Ok(()) => {
                tracing::debug!(session_id, "Unregistered live session");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Whether a marker exists for the given session.
    pub fn marker_exists(&self, session_id: &str) -> bool {
        self.marker_path(session_id).exists()
    }

    /// Enumerate all live sessions.
    ///
    /// Markers that cannot be read or parsed are deleted and skipped, so one
    /// corrupt file cannot wedge the daemon's reconcile loop.
    pub fn list_registered(&self) -> Result<Vec<LiveSession>> {
        let dir = self.sessions_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            match std::fs::read_to_string(&path)
                .map_err(Error::Io)
                .and_then(|s| serde_json::from_str::<LiveSession>(&s).map_err(Error::Json))
            {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    tracing::warn!(path = ?path, error = %e, "Removing malformed session marker");
                    let _ = std::fs::remove_file(&path);
                }
            }
        }

        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(sessions)
    }

    // ============================================
    // Daemon pid file
    // ============================================

    fn pid_path(&self) -> PathBuf {
        self.root.join("daemon.pid")
    }

    /// Pid of the running daemon, if a pid file exists and the process is
    /// alive. A stale pid file (dead process, unreadable content) is removed.
    pub fn daemon_pid(&self) -> Option<u32> {
        let path = self.pid_path();
        let content = std::fs::read_to_string(&path).ok()?;
        match content.trim().parse::<u32>() {
            Ok(pid) if pid_alive(pid) => Some(pid),
            _ => {
                let _ = std::fs::remove_file(&path);
                None
            }
        }
    }

    /// Whether an ingestion daemon is currently running.
    pub fn is_daemon_alive(&self) -> bool {
        self.daemon_pid().is_some()
    }

    /// Record the current process as the running daemon.
    pub fn write_daemon_pid(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::write(self.pid_path(), std::process::id().to_string())?;
        Ok(())
    }

    /// Remove the daemon pid file.
    pub fn clear_daemon_pid(&self) -> Result<()> {
        match std::fs::remove_file(self.pid_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// Check whether a process exists using signal 0.
fn pid_alive(pid: u32) -> bool {
    // kill(pid, 0) performs permission and existence checks without
    // delivering a signal
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}
