//! # scrivener-core
//!
//! Core library for scrivener - a session recorder for AI CLI transcripts.
//!
//! This library provides:
//! - Domain types for sessions, messages, and tool calls
//! - A pure transcript parser for the host CLI's JSONL format
//! - Database storage layer with SQLite and full-text search
//! - The live-session registry and the ingestion daemon's state machine
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! Lifecycle hooks write durable markers into the [`registry`]; the
//! [`daemon`] reconciles against those markers each tick and ingests new
//! transcript bytes through the [`parser`] into the [`db`] layer. Offsets
//! and message uuids make every step idempotent, so crashes and restarts
//! on either side are recovered by simply re-running a tick.
//!
//! ## Example
//!
//! ```rust,no_run
//! use scrivener_core::{Config, Database};
//!
//! // Load configuration
//! let config = Config::load().expect("failed to load config");
//!
//! // Open database
//! let db = Database::open(&Config::database_path()).expect("failed to open database");
//! db.migrate().expect("failed to run migrations");
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use daemon::{Daemon, SessionState, TickReport};
pub use db::Database;
pub use error::{Error, Result};
pub use registry::Registry;
pub use types::*;

// Public modules
pub mod config;
pub mod daemon;
pub mod db;
pub mod error;
pub mod logging;
pub mod parser;
pub mod registry;
pub mod types;
