// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Chat sessions: lifecycle, auto-save of message events, and the
//! snapshot/restore data transforms.
//!
//! The manager owns the *runtime* notion of the active chat; the persisted
//! `currentChatId` on the world config is written by the world handle, which
//! drives this manager.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use varld_store::{
    AgentRecord, AgentSnapshot, ChatData, ChatMeta, MemoryEntry, MessageRole, SnapshotMeta,
    Storage, WorldChat, WorldRecord, SNAPSHOT_SCHEMA_VERSION,
};

use crate::error::{Result, WorldError};
use crate::events::MessageEvent;
use crate::mention::SenderKind;

pub struct ChatManager {
    world_id: String,
    storage: Arc<dyn Storage>,
    active: Mutex<Option<String>>,
    /// Agent turns currently executing.  Chat switches are refused while
    /// this is non-zero.
    turns_in_flight: AtomicUsize,
}

impl ChatManager {
    pub fn new(world_id: impl Into<String>, storage: Arc<dyn Storage>, active: Option<String>) -> Self {
        Self {
            world_id: world_id.into(),
            storage,
            active: Mutex::new(active),
            turns_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn active(&self) -> Option<String> {
        self.active.lock().unwrap().clone()
    }

    /// Overwrite the active pointer without the in-flight guard.  Used when
    /// loading a world or finishing a restore, where no turns can be running.
    pub fn set_active_unchecked(&self, chat_id: Option<String>) {
        *self.active.lock().unwrap() = chat_id;
    }

    // ── Turn guard ────────────────────────────────────────────────────────────

    pub fn begin_turn(&self) {
        self.turns_in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub fn end_turn(&self) {
        self.turns_in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn turns_in_flight(&self) -> usize {
        self.turns_in_flight.load(Ordering::SeqCst)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Create a chat, persist it, and make it active.
    pub async fn create(&self, name: &str, description: &str) -> Result<ChatData> {
        let mut chat = ChatData::new(Uuid::new_v4().to_string(), name);
        chat.description = description.to_string();
        self.storage.save_chat(&self.world_id, &chat).await?;
        self.set_active_unchecked(Some(chat.id.clone()));
        debug!(world_id = %self.world_id, chat_id = %chat.id, "created chat");
        Ok(chat)
    }

    /// Create an auto-named chat and make it active.
    pub async fn new_chat(&self) -> Result<ChatData> {
        let existing = self.storage.list_chats(&self.world_id).await?;
        let name = format!("Chat {}", existing.len() + 1);
        self.create(&name, "").await
    }

    /// Switch the active chat without creating one.
    ///
    /// Refused with `Conflict` while any agent turn is in progress — callers
    /// must wait for the turn to finish.
    pub async fn switch_to(&self, chat_id: &str) -> Result<()> {
        if self.turns_in_flight() > 0 {
            return Err(WorldError::Conflict(
                "cannot switch chats while an agent turn is in progress".into(),
            ));
        }
        if self.storage.load_chat(&self.world_id, chat_id).await?.is_none() {
            return Err(WorldError::NotFound(format!("chat '{chat_id}'")));
        }
        self.set_active_unchecked(Some(chat_id.to_string()));
        Ok(())
    }

    /// Delete a chat; clears the active pointer when it named this chat.
    pub async fn delete(&self, chat_id: &str) -> Result<bool> {
        let removed = self.storage.delete_chat(&self.world_id, chat_id).await?;
        let mut active = self.active.lock().unwrap();
        if active.as_deref() == Some(chat_id) {
            *active = None;
        }
        Ok(removed)
    }

    pub async fn list(&self) -> Result<Vec<ChatMeta>> {
        Ok(self.storage.list_chats(&self.world_id).await?)
    }

    /// Rename and/or re-describe a chat.
    pub async fn update(&self, chat_id: &str, name: Option<&str>, description: Option<&str>) -> Result<ChatData> {
        let mut chat = self
            .storage
            .load_chat(&self.world_id, chat_id)
            .await?
            .ok_or_else(|| WorldError::NotFound(format!("chat '{chat_id}'")))?;
        if let Some(n) = name {
            chat.name = n.to_string();
        }
        if let Some(d) = description {
            chat.description = d.to_string();
        }
        chat.updated_at = Utc::now();
        self.storage.save_chat(&self.world_id, &chat).await?;
        Ok(chat)
    }

    // ── Auto-save ─────────────────────────────────────────────────────────────

    /// Append a published message to the active chat, deduplicated by
    /// message id, bumping `updated_at` and the message count.
    pub async fn append_message(
        &self,
        ev: &MessageEvent,
        sender_kind: SenderKind,
        author_agent_id: Option<&str>,
    ) -> Result<()> {
        let Some(active) = self.active() else {
            return Ok(());
        };
        // Messages stamped for another chat never leak into the active one.
        if let Some(target) = &ev.chat_id {
            if target != &active {
                return Ok(());
            }
        }
        let mut chat = self
            .storage
            .load_chat(&self.world_id, &active)
            .await?
            .ok_or_else(|| WorldError::NotFound(format!("chat '{active}'")))?;

        if chat
            .messages
            .iter()
            .any(|m| m.message_id.as_deref() == Some(ev.message_id.as_str()))
        {
            return Ok(());
        }

        chat.messages.push(chat_entry_from_event(ev, sender_kind, author_agent_id, &active));
        chat.message_count += 1;
        chat.updated_at = Utc::now();
        self.storage.save_chat(&self.world_id, &chat).await?;
        Ok(())
    }

    // ── Snapshot ──────────────────────────────────────────────────────────────

    /// Build a [`WorldChat`] capture for one chat: world config, every agent
    /// with its prompt, and the merged deduplicated message stream.
    pub fn create_world_chat(
        world: &WorldRecord,
        agents: &[AgentRecord],
        chat_id: &str,
    ) -> WorldChat {
        let messages = merge_chat_messages(agents, chat_id);
        WorldChat {
            world: world.clone(),
            agents: agents
                .iter()
                .map(|a| AgentSnapshot {
                    config: a.config.clone(),
                    system_prompt: a.system_prompt.clone(),
                })
                .collect(),
            metadata: SnapshotMeta {
                captured_at: Utc::now(),
                schema_version: SNAPSHOT_SCHEMA_VERSION,
                total_messages: messages.len() as u64,
                active_agents: agents.len() as u64,
            },
            messages,
        }
    }
}

/// Map a bus message event to the chat-file entry shape.
fn chat_entry_from_event(
    ev: &MessageEvent,
    sender_kind: SenderKind,
    author_agent_id: Option<&str>,
    chat_id: &str,
) -> MemoryEntry {
    MemoryEntry {
        role: match sender_kind {
            SenderKind::Agent => MessageRole::Assistant,
            SenderKind::Human | SenderKind::System => MessageRole::User,
        },
        content: ev.content.clone(),
        sender: Some(ev.sender.clone()),
        message_id: Some(ev.message_id.clone()),
        reply_to_message_id: ev.reply_to_message_id.clone(),
        chat_id: Some(chat_id.to_string()),
        tool_calls: ev.tool_calls.clone(),
        tool_call_id: None,
        created_at: ev.timestamp,
        agent_id: author_agent_id.map(str::to_string),
    }
}

/// Merge every agent's memory for one chat into a single ordered stream.
///
/// Entries sharing a message id collapse to one canonical copy: the
/// human-authored `user` entry when the message was human, otherwise the
/// author's own copy.  Entries without a message id (tool plumbing) are kept
/// as-is.  The result is ordered by creation time.
pub fn merge_chat_messages(agents: &[AgentRecord], chat_id: &str) -> Vec<MemoryEntry> {
    // Rank used when several copies of the same message id compete:
    // human-authored user copy > author's own copy > any other copy.
    fn rank(e: &MemoryEntry) -> u8 {
        let human_user = e.role == MessageRole::User && e.agent_id.is_none();
        let author_copy = e.role == MessageRole::Assistant && e.agent_id.is_some();
        if human_user {
            3
        } else if author_copy {
            2
        } else {
            1
        }
    }

    let mut by_id: std::collections::HashMap<String, MemoryEntry> = std::collections::HashMap::new();
    let mut plumbing: Vec<MemoryEntry> = Vec::new();

    for agent in agents {
        for entry in &agent.memory {
            if entry.chat_id.as_deref() != Some(chat_id) {
                continue;
            }
            match &entry.message_id {
                Some(id) => {
                    let keep = by_id
                        .get(id)
                        .map(|existing| rank(entry) > rank(existing))
                        .unwrap_or(true);
                    if keep {
                        by_id.insert(id.clone(), entry.clone());
                    }
                }
                None => {
                    // Tool calls and results are private to their author;
                    // only the author's copy exists, keep it verbatim.
                    plumbing.push(entry.clone());
                }
            }
        }
    }

    let mut merged: Vec<MemoryEntry> = by_id.into_values().chain(plumbing).collect();
    merged.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    merged
}

/// Project the merged snapshot stream back into one agent's point of view:
/// own entries keep their roles (and tool plumbing), other agents' replies
/// become `user` entries from that sender, and foreign tool plumbing is
/// dropped.
pub fn memory_view_for_agent(messages: &[MemoryEntry], agent_id: &str) -> Vec<MemoryEntry> {
    messages
        .iter()
        .filter_map(|m| {
            let own = m.agent_id.as_deref() == Some(agent_id);
            match m.role {
                MessageRole::Tool => own.then(|| m.clone()),
                MessageRole::Assistant => {
                    if own {
                        Some(m.clone())
                    } else if m.tool_calls.is_some() {
                        // Another agent's tool-call turn: private plumbing.
                        None
                    } else {
                        let mut e = m.clone();
                        e.role = MessageRole::User;
                        Some(e)
                    }
                }
                MessageRole::User | MessageRole::System => Some(m.clone()),
            }
        })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
