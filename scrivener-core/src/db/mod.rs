//! Database layer for scrivener
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations
//! - Repository pattern for queries
//! - Per-file byte offsets for incremental ingestion
//! - An FTS5 index over message text, kept in sync by triggers

pub mod repo;
pub mod schema;

pub use repo::Database;
