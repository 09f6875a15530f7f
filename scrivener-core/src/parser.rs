//! Transcript event parser
//!
//! Turns raw line-delimited JSON transcript text into normalized [`Message`]s
//! with nested [`ToolCall`]s. Pure: no I/O, and malformed input never raises;
//! a bad line is skipped and parsing continues with the next one.
//!
//! # Two-pass resolution
//!
//! Tool invocations and their results arrive as separate content segments,
//! usually in separate entries. Parsing therefore runs in two passes over the
//! same batch:
//!
//! 1. collect every `tool_result` segment into a map from invocation id to
//!    resolved output text;
//! 2. build messages from user/assistant entries, attaching tool calls with
//!    outputs looked up in the pass-1 map.
//!
//! A result that lands in a *later* ingestion batch than its invocation is
//! never linked back; the call keeps a NULL output. Closing that gap would
//! need a persistent pending-result table and is deliberately not done here.
//!
//! # Error handling
//!
//! - Malformed JSON lines: skipped, counted in [`ParseBatch::skipped_lines`].
//! - Missing fields: tolerated via `#[serde(default)]`; entries without a
//!   uuid or a resolvable session id cannot be stored and are skipped.
//! - Unknown record kinds (snapshots etc.) and unknown content segment types:
//!   ignored without aborting the entry.

use crate::types::{Message, Role, ToolCall};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;

// ============================================
// Raw JSONL record types (serde deserialization)
// ============================================

/// One line of a transcript.
///
/// Uses `#[serde(default)]` liberally to handle missing fields gracefully.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawEntry {
    uuid: Option<String>,
    session_id: Option<String>,
    #[serde(rename = "type")]
    entry_type: Option<String>,
    timestamp: Option<String>,
    cwd: Option<String>,
    version: Option<String>,
    slug: Option<String>,
    message: Option<RawMessage>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawMessage {
    role: Option<String>,
    model: Option<String>,
    content: Option<RawContent>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "thinking")]
    Thinking { thinking: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: serde_json::Value,
    },
    // Catch-all for unknown segment types
    #[serde(other)]
    Unknown,
}

// ============================================
// Parser output
// ============================================

/// Session metadata extracted from the first valid entry of a batch.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    /// Host-assigned session id
    pub session_id: String,
    /// Human-readable slug, when the host emitted one
    pub slug: Option<String>,
    /// Working directory from the first entry that carried one
    pub working_dir: Option<String>,
    /// Host tool version
    pub version: Option<String>,
    /// Timestamp of the first entry
    pub first_timestamp: DateTime<Utc>,
}

/// Result of parsing one transcript segment.
#[derive(Debug, Default)]
pub struct ParseBatch {
    /// Session metadata, present once any user/assistant entry was seen
    pub session: Option<SessionMeta>,
    /// Messages in input line order
    pub messages: Vec<Message>,
    /// Lines that could not be parsed or stored
    pub skipped_lines: usize,
}

/// Parse a transcript segment into ordered messages.
///
/// Output preserves input line order, which is assumed (not verified) to be
/// timestamp-ascending.
pub fn parse_transcript(text: &str) -> ParseBatch {
    let mut batch = ParseBatch::default();

    // Pass 1: resolve tool results across the whole batch
    let results = collect_tool_results(text);

    // Pass 2: build messages
    let mut last_timestamp: Option<DateTime<Utc>> = None;
    let mut batch_session_id: Option<String> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let entry: RawEntry = match serde_json::from_str(line) {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping malformed transcript line");
                batch.skipped_lines += 1;
                continue;
            }
        };

        let role = match entry.entry_type.as_deref() {
            Some("user") | Some("assistant") => match entry
                .message
                .as_ref()
                .and_then(|m| m.role.as_deref())
                .or(entry.entry_type.as_deref())
            {
                Some(r) => match Role::from_str(r) {
                    Ok(role) => role,
                    Err(_) => {
                        batch.skipped_lines += 1;
                        continue;
                    }
                },
                None => {
                    batch.skipped_lines += 1;
                    continue;
                }
            },
            // Other record kinds (snapshots etc.) are ignored entirely
            _ => continue,
        };

        // An entry with no message body is skipped
        let Some(ref message) = entry.message else {
            batch.skipped_lines += 1;
            continue;
        };

        let timestamp = entry
            .timestamp
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .or(last_timestamp)
            .unwrap_or_else(Utc::now);
        last_timestamp = Some(timestamp);

        if batch_session_id.is_none() {
            batch_session_id = entry.session_id.clone();
        }

        // Session metadata comes from the first retained entry; slug, cwd and
        // version fill in from later entries if the first ones lacked them.
        match batch.session {
            None => {
                if let Some(sid) = entry.session_id.clone().or_else(|| batch_session_id.clone()) {
                    batch.session = Some(SessionMeta {
                        session_id: sid,
                        slug: entry.slug.clone(),
                        working_dir: entry.cwd.clone(),
                        version: entry.version.clone(),
                        first_timestamp: timestamp,
                    });
                }
            }
            Some(ref mut meta) => {
                if meta.slug.is_none() {
                    meta.slug = entry.slug.clone();
                }
                if meta.working_dir.is_none() {
                    meta.working_dir = entry.cwd.clone();
                }
                if meta.version.is_none() {
                    meta.version = entry.version.clone();
                }
            }
        }

        // Without a uuid the entry has no identity and cannot be stored
        let Some(uuid) = entry.uuid.clone() else {
            batch.skipped_lines += 1;
            continue;
        };

        let Some(session_id) = entry.session_id.clone().or_else(|| batch_session_id.clone())
        else {
            batch.skipped_lines += 1;
            continue;
        };

        let (text_content, thinking_content, tool_calls) =
            flatten_content(message.content.as_ref(), &results);

        batch.messages.push(Message {
            uuid,
            session_id,
            timestamp,
            role,
            text_content,
            thinking_content: if role == Role::Assistant {
                thinking_content
            } else {
                None
            },
            model: if role == Role::Assistant {
                message.model.clone()
            } else {
                None
            },
            cwd: entry.cwd.clone(),
            tool_calls,
        });
    }

    batch
}

/// Pass 1: map every tool invocation id to its resolved output text.
///
/// Non-string result payloads are serialized to canonical JSON text.
fn collect_tool_results(text: &str) -> HashMap<String, String> {
    let mut results = HashMap::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(entry) = serde_json::from_str::<RawEntry>(line) else {
            continue;
        };
        if !matches!(entry.entry_type.as_deref(), Some("user") | Some("assistant")) {
            continue;
        }
        let Some(RawContent::Blocks(blocks)) = entry.message.and_then(|m| m.content) else {
            continue;
        };
        for block in blocks {
            if let ContentBlock::ToolResult {
                tool_use_id,
                content,
            } = block
            {
                let rendered = match content {
                    serde_json::Value::String(s) => s,
                    v => v.to_string(),
                };
                results.insert(tool_use_id, rendered);
            }
        }
    }

    results
}

/// Flatten a message body into text, thinking and tool calls.
///
/// Text segments concatenate in order joined by newline; the last thinking
/// segment wins; each tool_use segment becomes a [`ToolCall`] with output
/// resolved from the pass-1 map (None when unresolved).
fn flatten_content(
    content: Option<&RawContent>,
    results: &HashMap<String, String>,
) -> (String, Option<String>, Vec<ToolCall>) {
    match content {
        None => (String::new(), None, Vec::new()),
        Some(RawContent::Text(s)) => (s.clone(), None, Vec::new()),
        Some(RawContent::Blocks(blocks)) => {
            let mut texts: Vec<&str> = Vec::new();
            let mut thinking: Option<String> = None;
            let mut tool_calls = Vec::new();

            for block in blocks {
                match block {
                    ContentBlock::Text { text } => texts.push(text),
                    ContentBlock::Thinking { thinking: t } => thinking = Some(t.clone()),
                    ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                        tool_id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                        output: results.get(id).cloned(),
                    }),
                    // Results carry no message content of their own
                    ContentBlock::ToolResult { .. } => {}
                    ContentBlock::Unknown => {}
                }
            }

            (texts.join("\n"), thinking, tool_calls)
        }
    }
}
