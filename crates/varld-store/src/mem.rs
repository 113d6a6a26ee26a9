// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
//! In-memory back-end for the test harness.
//!
//! Keeps the same contract as [`crate::FileStorage`] (absence → `Ok(None)`,
//! deterministic listings, prompt-default substitution) without touching the
//! filesystem.  Selected via `storage.backend = memory` or `VARLD_STORAGE`.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    default_system_prompt, is_valid_id, AgentRecord, ChatData, ChatMeta, MemoryEntry, Result,
    StoreError, Storage, WorldChat, WorldRecord,
};

struct WorldSlot {
    world: WorldRecord,
    agents: HashMap<String, AgentRecord>,
    chats: HashMap<String, ChatData>,
}

impl Default for WorldSlot {
    fn default() -> Self {
        // A placeholder world record; overwritten by the first save_world.
        // Slots created implicitly (agent saved before its world) are
        // filtered out of listings until the world config arrives.
        Self {
            world: WorldRecord::new("", ""),
            agents: HashMap::new(),
            chats: HashMap::new(),
        }
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    worlds: Mutex<HashMap<String, WorldSlot>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn checked(id: &str) -> Result<()> {
    if is_valid_id(id) {
        Ok(())
    } else {
        Err(StoreError::InvalidId(id.to_string()))
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    // ── Worlds ────────────────────────────────────────────────────────────────

    async fn save_world(&self, world: &WorldRecord) -> Result<()> {
        checked(&world.id)?;
        let mut worlds = self.worlds.lock().unwrap();
        let slot = worlds.entry(world.id.clone()).or_default();
        slot.world = world.clone();
        Ok(())
    }

    async fn load_world(&self, world_id: &str) -> Result<Option<WorldRecord>> {
        checked(world_id)?;
        let worlds = self.worlds.lock().unwrap();
        Ok(worlds
            .get(world_id)
            .map(|s| s.world.clone())
            .filter(|w| !w.id.is_empty()))
    }

    async fn delete_world(&self, world_id: &str) -> Result<bool> {
        checked(world_id)?;
        Ok(self.worlds.lock().unwrap().remove(world_id).is_some())
    }

    async fn list_worlds(&self) -> Result<Vec<WorldRecord>> {
        let worlds = self.worlds.lock().unwrap();
        let mut out: Vec<WorldRecord> = worlds
            .values()
            .map(|s| s.world.clone())
            .filter(|w| !w.id.is_empty())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn world_exists(&self, world_id: &str) -> Result<bool> {
        checked(world_id)?;
        Ok(self.worlds.lock().unwrap().contains_key(world_id))
    }

    // ── Agents ────────────────────────────────────────────────────────────────

    async fn save_agent(&self, world_id: &str, agent: &AgentRecord) -> Result<()> {
        checked(world_id)?;
        checked(&agent.config.id)?;
        let mut worlds = self.worlds.lock().unwrap();
        let slot = worlds.entry(world_id.to_string()).or_default();
        slot.agents.insert(agent.config.id.clone(), agent.clone());
        Ok(())
    }

    async fn load_agent(&self, world_id: &str, agent_id: &str) -> Result<Option<AgentRecord>> {
        checked(world_id)?;
        checked(agent_id)?;
        let worlds = self.worlds.lock().unwrap();
        let mut agent = worlds
            .get(world_id)
            .and_then(|s| s.agents.get(agent_id))
            .cloned();
        if let Some(a) = agent.as_mut() {
            if a.system_prompt.is_empty() {
                a.system_prompt = default_system_prompt(&a.config.name);
            }
        }
        Ok(agent)
    }

    async fn delete_agent(&self, world_id: &str, agent_id: &str) -> Result<bool> {
        checked(world_id)?;
        checked(agent_id)?;
        let mut worlds = self.worlds.lock().unwrap();
        Ok(worlds
            .get_mut(world_id)
            .map(|s| s.agents.remove(agent_id).is_some())
            .unwrap_or(false))
    }

    async fn list_agents(&self, world_id: &str) -> Result<Vec<AgentRecord>> {
        checked(world_id)?;
        let worlds = self.worlds.lock().unwrap();
        let mut out: Vec<AgentRecord> = worlds
            .get(world_id)
            .map(|s| s.agents.values().cloned().collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.config.name.cmp(&b.config.name));
        Ok(out)
    }

    async fn save_agent_memory(
        &self,
        world_id: &str,
        agent_id: &str,
        memory: &[MemoryEntry],
    ) -> Result<()> {
        checked(world_id)?;
        checked(agent_id)?;
        let mut worlds = self.worlds.lock().unwrap();
        if let Some(agent) = worlds
            .get_mut(world_id)
            .and_then(|s| s.agents.get_mut(agent_id))
        {
            agent.memory = memory.to_vec();
        }
        Ok(())
    }

    async fn archive_agent_memory(&self, _world_id: &str, _agent_id: &str) -> Result<()> {
        // Nothing durable to archive in a volatile back-end.
        Ok(())
    }

    // ── Chats ─────────────────────────────────────────────────────────────────

    async fn save_chat(&self, world_id: &str, chat: &ChatData) -> Result<()> {
        checked(world_id)?;
        checked(&chat.id)?;
        let mut worlds = self.worlds.lock().unwrap();
        let slot = worlds.entry(world_id.to_string()).or_default();
        slot.chats.insert(chat.id.clone(), chat.clone());
        Ok(())
    }

    async fn load_chat(&self, world_id: &str, chat_id: &str) -> Result<Option<ChatData>> {
        checked(world_id)?;
        checked(chat_id)?;
        let worlds = self.worlds.lock().unwrap();
        Ok(worlds
            .get(world_id)
            .and_then(|s| s.chats.get(chat_id))
            .cloned())
    }

    async fn delete_chat(&self, world_id: &str, chat_id: &str) -> Result<bool> {
        checked(world_id)?;
        checked(chat_id)?;
        let mut worlds = self.worlds.lock().unwrap();
        Ok(worlds
            .get_mut(world_id)
            .map(|s| s.chats.remove(chat_id).is_some())
            .unwrap_or(false))
    }

    async fn list_chats(&self, world_id: &str) -> Result<Vec<ChatMeta>> {
        checked(world_id)?;
        let worlds = self.worlds.lock().unwrap();
        let mut out: Vec<ChatMeta> = worlds
            .get(world_id)
            .map(|s| s.chats.values().map(|c| c.meta()).collect())
            .unwrap_or_default();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    // ── Snapshots ─────────────────────────────────────────────────────────────

    async fn save_world_chat(
        &self,
        world_id: &str,
        chat_id: &str,
        snapshot: &WorldChat,
    ) -> Result<()> {
        checked(world_id)?;
        checked(chat_id)?;
        let mut worlds = self.worlds.lock().unwrap();
        let slot = worlds.entry(world_id.to_string()).or_default();
        let chat = slot
            .chats
            .entry(chat_id.to_string())
            .or_insert_with(|| ChatData::new(chat_id, chat_id));
        chat.snapshot = Some(snapshot.clone());
        chat.updated_at = Utc::now();
        Ok(())
    }

    async fn load_world_chat(&self, world_id: &str, chat_id: &str) -> Result<Option<WorldChat>> {
        Ok(self
            .load_chat(world_id, chat_id)
            .await?
            .and_then(|c| c.snapshot))
    }

    // ── Integrity ─────────────────────────────────────────────────────────────

    async fn validate_world(&self, world_id: &str) -> Result<Vec<String>> {
        checked(world_id)?;
        let worlds = self.worlds.lock().unwrap();
        let mut problems = Vec::new();
        match worlds.get(world_id) {
            None => problems.push(format!("world '{world_id}' does not exist")),
            Some(slot) => {
                if let Some(active) = &slot.world.current_chat_id {
                    if !slot.chats.contains_key(active) {
                        problems.push(format!(
                            "currentChatId '{active}' does not name an existing chat"
                        ));
                    }
                }
            }
        }
        Ok(problems)
    }

    async fn repair_world(&self, world_id: &str) -> Result<Vec<String>> {
        checked(world_id)?;
        let mut worlds = self.worlds.lock().unwrap();
        let mut repairs = Vec::new();
        if let Some(slot) = worlds.get_mut(world_id) {
            if let Some(active) = slot.world.current_chat_id.clone() {
                if !slot.chats.contains_key(&active) {
                    slot.world.current_chat_id = None;
                    repairs.push(format!("cleared dangling currentChatId '{active}'"));
                }
            }
        }
        Ok(repairs)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
