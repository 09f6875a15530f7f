//! Lifecycle hook handlers
//!
//! The host CLI invokes these on session start and end, feeding a small JSON
//! payload on stdin. The contract with the host is strict: handle the signal
//! quickly and exit 0 no matter what went wrong internally, because failing the
//! host's own lifecycle event is worse than losing a recording. Diagnostics
//! go to an append-only log file instead of stderr.
//!
//! The start handler also spawns the ingestion daemon when none is running,
//! so recording works without any manual setup. Two near-simultaneous start
//! signals may both attempt the spawn; the loser's daemon finds the pid file
//! already claimed and exits, which is fine.

use chrono::Utc;
use scrivener_core::{Config, LiveSession, Registry};
use serde::Deserialize;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};

#[derive(Debug, Deserialize)]
struct StartPayload {
    #[serde(alias = "sessionId")]
    session_id: String,
    #[serde(alias = "transcriptPath")]
    transcript_path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct EndPayload {
    #[serde(alias = "sessionId")]
    session_id: String,
}

/// Handle the session-start signal: register the live-session marker and
/// make sure a daemon is running.
pub fn session_start() {
    Config::ensure_xdg_env();

    let payload: StartPayload = match read_stdin_json() {
        Ok(p) => p,
        Err(e) => {
            log_line(&format!("session-start: bad payload: {e}"));
            return;
        }
    };

    let registry = Registry::open_default();
    let live = LiveSession {
        session_id: payload.session_id.clone(),
        transcript_path: payload.transcript_path,
    };
    if let Err(e) = registry.register(&live) {
        log_line(&format!(
            "session-start {}: register failed: {e}",
            payload.session_id
        ));
        return;
    }

    let spawned = if registry.is_daemon_alive() {
        false
    } else {
        spawn_daemon()
    };

    log_line(&format!(
        "session-start {}: registered{}",
        payload.session_id,
        if spawned { ", daemon spawned" } else { "" }
    ));
}

/// Handle the session-end signal: remove the live-session marker. The
/// daemon notices the missing marker on its next tick and finalizes.
pub fn session_end() {
    Config::ensure_xdg_env();

    let payload: EndPayload = match read_stdin_json() {
        Ok(p) => p,
        Err(e) => {
            log_line(&format!("session-end: bad payload: {e}"));
            return;
        }
    };

    let registry = Registry::open_default();
    match registry.unregister(&payload.session_id) {
        Ok(()) => log_line(&format!("session-end {}: unregistered", payload.session_id)),
        Err(e) => log_line(&format!(
            "session-end {}: unregister failed: {e}",
            payload.session_id
        )),
    }
}

fn read_stdin_json<T: serde::de::DeserializeOwned>() -> Result<T, String> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .map_err(|e| e.to_string())?;
    serde_json::from_str(&input).map_err(|e| e.to_string())
}

/// Start a detached daemon process. Returns whether the spawn succeeded.
fn spawn_daemon() -> bool {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            log_line(&format!("daemon spawn: cannot resolve own binary: {e}"));
            return false;
        }
    };

    match Command::new(exe)
        .arg("daemon")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(_) => true,
        Err(e) => {
            log_line(&format!("daemon spawn failed: {e}"));
            false
        }
    }
}

/// Append one line to the hook diagnostics log. Best-effort only.
fn log_line(msg: &str) {
    let path = Config::hooks_log_path();
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let line = format!("{} {}\n", Utc::now().to_rfc3339(), msg);
    let _ = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut f| std::io::Write::write_all(&mut f, line.as_bytes()));
}
