//! Core domain types for scrivener
//!
//! These types represent the canonical data model persisted by the storage
//! engine, normalized from the host CLI's transcript records.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Transcript** | Append-only line-delimited JSON file the host CLI writes per session |
//! | **Entry** | One parsed line of a transcript |
//! | **Session** | One recorded conversation, identified by the host-assigned id |
//! | **Message** | A user or assistant turn extracted from an entry |
//! | **ToolCall** | A tool invocation nested in an assistant message, with its resolved output |
//! | **Live session marker** | Durable record that a session is open and should be watched |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ============================================
// Session
// ============================================

/// A recorded session.
///
/// Created on the first successful metadata read from a transcript;
/// `started_at` is set once, `ended_at` is set by finalization and never
/// un-set, and `message_count` is recomputed on every message insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Host-assigned session identifier (opaque, globally unique)
    pub id: String,
    /// Human label derived from the working-directory path
    pub slug: String,
    /// Project path decoded from the transcript's directory name
    pub project_path: Option<String>,
    /// Working directory reported by the transcript entries
    pub working_dir: Option<String>,
    /// When the session started (first entry timestamp)
    pub started_at: DateTime<Utc>,
    /// When the session ended; None while still open
    pub ended_at: Option<DateTime<Utc>>,
    /// Denormalized message count, recomputed on insert
    pub message_count: i64,
    /// Host tool version
    pub version: Option<String>,
    /// Path of the source transcript file
    pub transcript_path: String,
}

// ============================================
// Message
// ============================================

/// Author role of a message. Only user and assistant turns are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            _ => Err(format!("unknown role: {}", s)),
        }
    }
}

/// One user or assistant turn.
///
/// The source-assigned `uuid` is the sole de-duplication key: re-inserting
/// the same uuid is a no-op and the first-seen content wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Source-assigned entry identifier (primary idempotency key)
    pub uuid: String,
    /// Owning session id
    pub session_id: String,
    /// Entry timestamp
    pub timestamp: DateTime<Utc>,
    /// Author role
    pub role: Role,
    /// Concatenated text segments (possibly empty)
    pub text_content: String,
    /// Thinking content; assistant messages only
    pub thinking_content: Option<String>,
    /// Model identifier; assistant messages only
    pub model: Option<String>,
    /// Working directory at the time of the entry
    pub cwd: Option<String>,
    /// Tool invocations nested in this message
    pub tool_calls: Vec<ToolCall>,
}

/// A tool invocation nested in a message.
///
/// `output` stays None when no matching tool result was seen in the same
/// parse batch as the invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Source-assigned invocation identifier
    pub tool_id: String,
    /// Tool name
    pub name: String,
    /// Structured input payload
    pub input: serde_json::Value,
    /// Resolved output text, if a result arrived in the same batch
    pub output: Option<String>,
}

// ============================================
// Registry
// ============================================

/// A durable live-session marker: session id mapped to its transcript path.
///
/// Exists exactly while the host considers the session open. The set of
/// markers on disk is the authoritative list of what the daemon watches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveSession {
    pub session_id: String,
    pub transcript_path: PathBuf,
}

// ============================================
// Query results
// ============================================

/// One full-text search hit with a highlighted snippet.
#[derive(Debug, Clone)]
pub struct SearchHit {
    /// Message uuid
    pub uuid: String,
    /// Owning session id
    pub session_id: String,
    /// Message timestamp
    pub timestamp: DateTime<Utc>,
    /// Author role
    pub role: Role,
    /// Highlighted snippet around the match
    pub snippet: String,
    /// Relevance score (higher = more relevant)
    pub rank: f64,
}

/// Aggregate usage statistics over the whole store.
#[derive(Debug, Clone, Default)]
pub struct UsageStats {
    /// Total session count
    pub sessions: i64,
    /// Total message count
    pub messages: i64,
    /// Total tool call count
    pub tool_calls: i64,
    /// Per-tool-name frequency, sorted by count descending
    pub tool_breakdown: Vec<(String, i64)>,
}
