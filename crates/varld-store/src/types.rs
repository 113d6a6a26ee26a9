// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current schema version stamped into [`WorldChat`] snapshots.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 2;

// ─── World ───────────────────────────────────────────────────────────────────

/// Persisted world configuration (`<root>/<worldId>/config.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldRecord {
    /// Stable kebab-cased identifier; doubles as the storage directory name.
    pub id: String,
    /// Human-facing display name.
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Maximum consecutive agent turns before the world idles.
    #[serde(default = "default_turn_limit")]
    pub turn_limit: u32,
    /// Default provider/model for chat-level operations (auto-naming etc.)
    /// and for agents that name none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_model: Option<String>,
    /// Opaque MCP tool configuration.  Persisted verbatim; this runtime does
    /// not interpret it beyond carrying the shape.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_config: Option<serde_json::Value>,
    /// The currently active chat, if any.  Must name an existing chat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_chat_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn default_turn_limit() -> u32 {
    5
}

impl WorldRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            turn_limit: default_turn_limit(),
            chat_provider: None,
            chat_model: None,
            mcp_config: None,
            current_chat_id: None,
            created_at: Utc::now(),
        }
    }
}

// ─── Agent ───────────────────────────────────────────────────────────────────

/// Persisted agent configuration (`agents/<agentId>/config.json`).
///
/// The system prompt is **not** part of this record on disk — it is stored
/// alongside as `system-prompt.md` for readability and rejoined on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfigRecord {
    /// Kebab-cased identifier, unique within the owning world.
    pub id: String,
    pub name: String,
    /// Free-form type tag (e.g. "assistant", "critic").
    #[serde(rename = "type", default = "default_agent_type")]
    pub agent_type: String,
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    /// Cumulative number of LLM invocations over the agent's lifetime.
    #[serde(default)]
    pub llm_call_count: u64,
    /// Messages this agent has emitted, keyed by chat id.
    #[serde(default)]
    pub message_counts: HashMap<String, u64>,
}

fn default_agent_type() -> String {
    "assistant".into()
}

/// A fully assembled agent: config + system prompt + ordered memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    #[serde(flatten)]
    pub config: AgentConfigRecord,
    pub system_prompt: String,
    #[serde(default)]
    pub memory: Vec<MemoryEntry>,
}

impl AgentRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            config: AgentConfigRecord {
                id: id.into(),
                name: name.into(),
                agent_type: default_agent_type(),
                provider: "openai".into(),
                model: "gpt-4o".into(),
                temperature: None,
                max_tokens: None,
                created_at: now,
                last_active: now,
                llm_call_count: 0,
                message_counts: HashMap::new(),
            },
            system_prompt: String::new(),
            memory: Vec::new(),
        }
    }
}

/// Substitute prompt for agents whose `system-prompt.md` is missing.
pub fn default_system_prompt(agent_name: &str) -> String {
    format!(
        "You are {agent_name}, a helpful assistant participating in a group \
         conversation. Answer when addressed and keep replies concise."
    )
}

// ─── Memory ──────────────────────────────────────────────────────────────────

/// Role of a memory entry.  Mirrors the provider-facing role set but keeps
/// this crate independent from the model crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One entry in an agent's ordered memory (`agents/<agentId>/memory.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEntry {
    pub role: MessageRole,
    pub content: String,
    /// Originating participant for user/assistant entries authored by
    /// someone else.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Stable id assigned by the runtime on first emission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<String>,
    /// The chat this entry belongs to.  Every non-system entry in a
    /// persisted chat carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRecord>>,
    /// For role = tool: the id of the call this entry answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Author agent, when an agent wrote this entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

impl MemoryEntry {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            sender: None,
            message_id: None,
            reply_to_message_id: None,
            chat_id: None,
            tool_calls: None,
            tool_call_id: None,
            created_at: Utc::now(),
            agent_id: None,
        }
    }
}

/// A complete tool call captured on an assistant memory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

// ─── Chat ────────────────────────────────────────────────────────────────────

/// Listing summary of a chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMeta {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Denormalized message count, bumped on every append.
    pub message_count: u64,
}

/// Full chat file (`chats/<chatId>.json`): summary fields plus the ordered,
/// deduplicated message stream and an optional captured snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatData {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: u64,
    #[serde(default)]
    pub messages: Vec<MemoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<WorldChat>,
}

impl ChatData {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            created_at: now,
            updated_at: now,
            message_count: 0,
            messages: Vec::new(),
            snapshot: None,
        }
    }

    pub fn meta(&self) -> ChatMeta {
        ChatMeta {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            message_count: self.message_count,
        }
    }
}

// ─── Snapshot ────────────────────────────────────────────────────────────────

/// An agent as captured in a snapshot: config with its prompt rejoined,
/// memory excluded (the merged message stream lives on the snapshot itself).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSnapshot {
    #[serde(flatten)]
    pub config: AgentConfigRecord,
    pub system_prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMeta {
    pub captured_at: DateTime<Utc>,
    pub schema_version: u32,
    pub total_messages: u64,
    pub active_agents: u64,
}

/// A serializable capture of a chat: world config, all agents with their
/// prompts, and the merged message stream.  Value snapshot — carries no
/// ownership back-link once serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldChat {
    pub world: WorldRecord,
    pub agents: Vec<AgentSnapshot>,
    pub messages: Vec<MemoryEntry>,
    pub metadata: SnapshotMeta,
}

// ─── Identifier helpers ──────────────────────────────────────────────────────

/// Convert a display name into a kebab-cased identifier.
///
/// Lowercases, maps runs of non-alphanumeric characters to single hyphens,
/// and trims leading/trailing hyphens: `"My World!" → "my-world"`.
pub fn to_kebab_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Whether `id` is safe to use as a storage path segment.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Kebab-case ids ────────────────────────────────────────────────────────

    #[test]
    fn kebab_lowercases_and_hyphenates() {
        assert_eq!(to_kebab_case("My World"), "my-world");
    }

    #[test]
    fn kebab_collapses_symbol_runs() {
        assert_eq!(to_kebab_case("a  &&  b!"), "a-b");
    }

    #[test]
    fn kebab_strips_leading_and_trailing_separators() {
        assert_eq!(to_kebab_case("  spaced out  "), "spaced-out");
    }

    #[test]
    fn kebab_of_empty_is_empty() {
        assert_eq!(to_kebab_case("!!!"), "");
    }

    #[test]
    fn valid_id_rejects_path_traversal() {
        assert!(!is_valid_id("../etc"));
        assert!(!is_valid_id("a/b"));
        assert!(!is_valid_id(""));
        assert!(is_valid_id("my-world_2"));
    }

    // ── Record construction ───────────────────────────────────────────────────

    #[test]
    fn new_world_gets_default_turn_limit() {
        let w = WorldRecord::new("w1", "World One");
        assert_eq!(w.turn_limit, 5);
        assert!(w.current_chat_id.is_none());
    }

    #[test]
    fn new_agent_record_has_empty_memory() {
        let a = AgentRecord::new("a1", "Agent One");
        assert!(a.memory.is_empty());
        assert_eq!(a.config.llm_call_count, 0);
    }

    #[test]
    fn default_prompt_mentions_agent_name() {
        assert!(default_system_prompt("scout").contains("scout"));
    }

    // ── Serialisation contracts ───────────────────────────────────────────────

    #[test]
    fn world_record_uses_camel_case_keys() {
        let w = WorldRecord::new("w1", "World One");
        let json = serde_json::to_string(&w).unwrap();
        assert!(json.contains("\"turnLimit\""));
        assert!(json.contains("\"createdAt\""));
        assert!(!json.contains("turn_limit"));
    }

    #[test]
    fn memory_entry_omits_absent_options() {
        let e = MemoryEntry::new(MessageRole::User, "hi");
        let json = serde_json::to_string(&e).unwrap();
        assert!(!json.contains("messageId"));
        assert!(!json.contains("toolCalls"));
    }

    #[test]
    fn memory_entry_dates_are_rfc3339_strings() {
        let e = MemoryEntry::new(MessageRole::User, "hi");
        let v: serde_json::Value = serde_json::to_value(&e).unwrap();
        let s = v["createdAt"].as_str().expect("createdAt must be a string");
        assert!(s.contains('T'), "expected ISO-8601 timestamp, got {s}");
    }

    #[test]
    fn agent_record_flattens_config() {
        let a = AgentRecord::new("a1", "Agent One");
        let v: serde_json::Value = serde_json::to_value(&a).unwrap();
        assert_eq!(v["id"], "a1");
        assert_eq!(v["type"], "assistant");
        assert!(v["systemPrompt"].is_string());
    }

    #[test]
    fn chat_data_round_trips_with_snapshot() {
        let mut c = ChatData::new("c1", "Chat");
        c.snapshot = Some(WorldChat {
            world: WorldRecord::new("w", "W"),
            agents: vec![],
            messages: vec![],
            metadata: SnapshotMeta {
                captured_at: Utc::now(),
                schema_version: SNAPSHOT_SCHEMA_VERSION,
                total_messages: 0,
                active_agents: 0,
            },
        });
        let json = serde_json::to_string(&c).unwrap();
        let back: ChatData = serde_json::from_str(&json).unwrap();
        assert_eq!(
            back.snapshot.unwrap().metadata.schema_version,
            SNAPSHOT_SCHEMA_VERSION
        );
    }
}
