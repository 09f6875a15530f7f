//! Foreground daemon loop
//!
//! Owns the process-level concerns around the core state machine: the
//! single-instance guard, the pid file, the termination signal handler, and
//! file-change notifications. Change notifications and the fixed-interval
//! poll drain through the same [`Daemon::tick`] call, so a missed or failed
//! notification only costs latency, never data.

use anyhow::{bail, Context, Result};
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebounceEventResult};
use scrivener_core::{Config, Daemon, Database, Registry};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

/// Wakes the loop out of its poll sleep.
enum LoopEvent {
    /// A watched transcript changed
    Change,
    /// Termination signal received
    Shutdown,
}

pub fn run(config: &Config, poll_override: Option<u64>) -> Result<()> {
    let registry = Registry::open_default();

    // Single-instance guard; a stale pid file is reclaimed by the check
    if let Some(pid) = registry.daemon_pid() {
        bail!("daemon already running (pid {})", pid);
    }
    registry.write_daemon_pid().context("failed to write pid file")?;

    let db_path = Config::database_path();
    tracing::info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;

    let mut daemon = Daemon::new(db, Registry::open_default());

    let (tx, rx) = mpsc::channel::<LoopEvent>();

    let signal_tx = tx.clone();
    ctrlc::set_handler(move || {
        let _ = signal_tx.send(LoopEvent::Shutdown);
    })
    .context("failed to set termination handler")?;

    // Change notifications are best-effort: if the watcher cannot be built
    // the poll alone carries ingestion
    let change_tx = tx;
    let mut debouncer = match new_debouncer(
        Duration::from_millis(250),
        move |res: DebounceEventResult| {
            if res.is_ok() {
                let _ = change_tx.send(LoopEvent::Change);
            }
        },
    ) {
        Ok(d) => Some(d),
        Err(e) => {
            tracing::warn!(error = %e, "File watcher unavailable, relying on polling only");
            None
        }
    };

    let poll_ms = poll_override.unwrap_or(config.daemon.poll_interval_ms);
    let poll = Duration::from_millis(poll_ms.max(1));

    println!("scrivener daemon running (poll every {}ms)", poll.as_millis());
    tracing::info!(poll_ms, "Daemon loop starting");

    let mut watched: HashSet<PathBuf> = HashSet::new();
    let mut pending_watch: Vec<PathBuf> = Vec::new();

    loop {
        match daemon.tick() {
            Ok(report) => {
                pending_watch.extend(report.discovered);
                if report.messages_inserted > 0 || report.finalized > 0 {
                    tracing::info!(
                        inserted = report.messages_inserted,
                        finalized = report.finalized,
                        "Tick complete"
                    );
                }
            }
            Err(e) => tracing::error!(error = %e, "Tick failed"),
        }

        // Watch transcripts discovered so far. A transcript that does not
        // exist yet fails to watch and is retried next tick; the poll covers
        // it meanwhile.
        if let Some(debouncer) = debouncer.as_mut() {
            pending_watch.retain(|path| {
                if watched.contains(path) {
                    return false;
                }
                match debouncer.watcher().watch(path, RecursiveMode::NonRecursive) {
                    Ok(()) => {
                        tracing::debug!(path = ?path, "Watching transcript");
                        watched.insert(path.clone());
                        false
                    }
                    Err(_) => true,
                }
            });
        }

        match rx.recv_timeout(poll) {
            Ok(LoopEvent::Shutdown) => break,
            Ok(LoopEvent::Change) => continue,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    println!("Shutting down...");
    tracing::info!("Daemon shutting down, finalizing tracked sessions");
    match daemon.shutdown() {
        Ok(report) => tracing::info!(finalized = report.finalized, "Shutdown complete"),
        Err(e) => tracing::error!(error = %e, "Shutdown finalization failed"),
    }

    if let Err(e) = registry.clear_daemon_pid() {
        tracing::warn!(error = %e, "Failed to remove pid file");
    }

    Ok(())
}
