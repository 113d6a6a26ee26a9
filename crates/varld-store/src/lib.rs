// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
mod error;
mod fs;
mod mem;
mod types;

pub use error::{Result, StoreError};
pub use fs::FileStorage;
pub use mem::MemoryStorage;
pub use types::*;

use async_trait::async_trait;

/// Durable persistence contract for worlds, agents, and chats.
///
/// All implementations guarantee:
/// - writes are atomic at the per-file level,
/// - reads of non-existent entities return `Ok(None)` (absence is not an
///   error),
/// - deletes of non-existent entities return `Ok(false)`,
/// - listings are deterministic (agents by name, chats by `updated_at`
///   descending, worlds by id).
#[async_trait]
pub trait Storage: Send + Sync {
    // ── Worlds ────────────────────────────────────────────────────────────────
    async fn save_world(&self, world: &WorldRecord) -> Result<()>;
    async fn load_world(&self, world_id: &str) -> Result<Option<WorldRecord>>;
    /// Removes the world and everything it owns (agents, chats).
    async fn delete_world(&self, world_id: &str) -> Result<bool>;
    async fn list_worlds(&self) -> Result<Vec<WorldRecord>>;
    async fn world_exists(&self, world_id: &str) -> Result<bool>;

    // ── Agents ────────────────────────────────────────────────────────────────
    /// Persists config, system prompt, and memory.  File back-ends split the
    /// prompt out of the config file and store it as readable text.
    async fn save_agent(&self, world_id: &str, agent: &AgentRecord) -> Result<()>;
    /// Reassembles config + prompt + memory.  A missing prompt file yields
    /// the default prompt, not an error.
    async fn load_agent(&self, world_id: &str, agent_id: &str) -> Result<Option<AgentRecord>>;
    async fn delete_agent(&self, world_id: &str, agent_id: &str) -> Result<bool>;
    async fn list_agents(&self, world_id: &str) -> Result<Vec<AgentRecord>>;
    /// Hot path: rewrite only the memory file.
    async fn save_agent_memory(
        &self,
        world_id: &str,
        agent_id: &str,
        memory: &[MemoryEntry],
    ) -> Result<()>;
    /// Move the current memory aside (timestamped sibling) before a clear so
    /// an audit trail survives.  No-op when there is no memory.
    async fn archive_agent_memory(&self, world_id: &str, agent_id: &str) -> Result<()>;

    // ── Chats ─────────────────────────────────────────────────────────────────
    /// Upsert: creates the chat file or overwrites it with updated data.
    async fn save_chat(&self, world_id: &str, chat: &ChatData) -> Result<()>;
    async fn load_chat(&self, world_id: &str, chat_id: &str) -> Result<Option<ChatData>>;
    async fn delete_chat(&self, world_id: &str, chat_id: &str) -> Result<bool>;
    async fn list_chats(&self, world_id: &str) -> Result<Vec<ChatMeta>>;

    // ── Snapshots ─────────────────────────────────────────────────────────────
    /// Attach a captured snapshot to its chat file.
    async fn save_world_chat(
        &self,
        world_id: &str,
        chat_id: &str,
        snapshot: &WorldChat,
    ) -> Result<()>;
    async fn load_world_chat(&self, world_id: &str, chat_id: &str) -> Result<Option<WorldChat>>;

    // ── Integrity ─────────────────────────────────────────────────────────────
    /// Report structural problems without changing anything.
    async fn validate_world(&self, world_id: &str) -> Result<Vec<String>>;
    /// Fix what can be fixed (drop dangling references, re-stub missing
    /// files); returns a description of each repair made.
    async fn repair_world(&self, world_id: &str) -> Result<Vec<String>>;
}
