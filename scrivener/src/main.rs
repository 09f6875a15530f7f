//! scrivener - session recorder for AI CLI transcripts
//!
//! Ingestion daemon plus lifecycle hook handlers and reporting commands.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/scrivener/scrivener.db
//! - Logs: $XDG_STATE_HOME/scrivener/scrivener.log
//! - Config: $XDG_CONFIG_HOME/scrivener/config.toml
//! - Markers/pid: $XDG_RUNTIME_DIR/scrivener/

mod daemon_loop;
mod hook;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scrivener_core::{Config, Database};

#[derive(Parser)]
#[command(name = "scrivener")]
#[command(about = "Record AI CLI sessions into a local searchable store")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the ingestion daemon in the foreground
    Daemon {
        /// Poll interval in milliseconds (overrides config)
        #[arg(long)]
        poll: Option<u64>,
    },

    /// Lifecycle hook handlers; read JSON on stdin and always exit 0
    #[command(subcommand)]
    Hook(HookCommand),

    /// List recorded sessions
    Sessions {
        /// Maximum number of sessions to show
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Order by most recent message activity instead of start time
        #[arg(long)]
        active: bool,
    },

    /// Show all messages of one session
    Show {
        /// Session id
        session_id: String,
    },

    /// Full-text search over message text
    Search {
        /// Search terms
        query: String,

        /// Maximum number of hits
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Aggregate usage statistics
    Stats,
}

#[derive(Subcommand)]
enum HookCommand {
    /// Handle the host's session-start signal
    SessionStart,
    /// Handle the host's session-end signal
    SessionEnd,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Hook handlers run before anything that could fail: they must exit 0
    // no matter what state the rest of the system is in
    if let Command::Hook(hook_cmd) = &cli.command {
        match hook_cmd {
            HookCommand::SessionStart => hook::session_start(),
            HookCommand::SessionEnd => hook::session_end(),
        }
        return Ok(());
    }

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard =
        scrivener_core::logging::init(&config.logging).context("failed to initialize logging")?;

    match cli.command {
        Command::Hook(_) => unreachable!("handled above"),
        Command::Daemon { poll } => daemon_loop::run(&config, poll),
        Command::Sessions { limit, active } => cmd_sessions(limit, active),
        Command::Show { session_id } => cmd_show(&session_id),
        Command::Search { query, limit } => cmd_search(&query, limit),
        Command::Stats => cmd_stats(),
    }
}

fn open_database() -> Result<Database> {
    let db_path = Config::database_path();
    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;
    Ok(db)
}

fn cmd_sessions(limit: usize, active: bool) -> Result<()> {
    let db = open_database()?;
    let sessions = if active {
        db.list_sessions_by_activity(limit)?
    } else {
        db.list_sessions(limit)?
    };

    if sessions.is_empty() {
        println!("No recorded sessions.");
        return Ok(());
    }

    for session in sessions {
        let status = if session.ended_at.is_some() {
            "ended"
        } else {
            "open"
        };
        println!(
            "{}  [{}]  {}  {} messages  started {}",
            session.id,
            status,
            if session.slug.is_empty() {
                "-"
            } else {
                &session.slug
            },
            session.message_count,
            session.started_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

fn cmd_show(session_id: &str) -> Result<()> {
    let db = open_database()?;
    let session = db
        .get_session(session_id)?
        .with_context(|| format!("no session with id {}", session_id))?;

    println!("Session {} ({})", session.id, session.slug);
    if let Some(dir) = &session.working_dir {
        println!("  dir:     {}", dir);
    }
    println!("  started: {}", session.started_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(ended) = session.ended_at {
        println!("  ended:   {}", ended.format("%Y-%m-%d %H:%M:%S"));
    }
    println!();

    for msg in db.session_messages(session_id)? {
        println!(
            "[{}] {}",
            msg.timestamp.format("%H:%M:%S"),
            msg.role.as_str()
        );
        if !msg.text_content.is_empty() {
            println!("{}", msg.text_content);
        }
        for call in &msg.tool_calls {
            let outcome = match &call.output {
                Some(_) => "",
                None => " (no result)",
            };
            println!("  -> {}{}", call.name, outcome);
        }
        println!();
    }
    Ok(())
}

fn cmd_search(query: &str, limit: usize) -> Result<()> {
    let db = open_database()?;
    let hits = db.search_messages(query, limit)?;

    if hits.is_empty() {
        println!("No matches.");
        return Ok(());
    }

    for hit in hits {
        println!(
            "{}  {}  [{}]",
            hit.session_id,
            hit.timestamp.format("%Y-%m-%d %H:%M"),
            hit.role.as_str()
        );
        println!("  {}", hit.snippet);
    }
    Ok(())
}

fn cmd_stats() -> Result<()> {
    let db = open_database()?;
    let stats = db.usage_stats()?;

    println!("Sessions:   {}", stats.sessions);
    println!("Messages:   {}", stats.messages);
    println!("Tool calls: {}", stats.tool_calls);

    if !stats.tool_breakdown.is_empty() {
        println!("\nBy tool:");
        for (name, count) in &stats.tool_breakdown {
            println!("  {:<20} {}", name, count);
        }
    }
    Ok(())
}
