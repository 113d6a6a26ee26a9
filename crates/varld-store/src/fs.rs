// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Filesystem back-end: one directory per world.
//!
//! ```text
//! <root>/<worldId>/config.json
//! <root>/<worldId>/agents/<agentId>/config.json
//! <root>/<worldId>/agents/<agentId>/system-prompt.md
//! <root>/<worldId>/agents/<agentId>/memory.json
//! <root>/<worldId>/chats/<chatId>.json
//! ```
//!
//! Every write is temp-file + fsync + rename, so a crash mid-write leaves
//! either the old file or the new one, never a torn file.  JSON is
//! pretty-printed UTF-8; the system prompt is plain markdown text.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::{
    default_system_prompt, is_valid_id, AgentConfigRecord, AgentRecord, ChatData, ChatMeta,
    MemoryEntry, Result, StoreError, Storage, WorldChat, WorldRecord,
};

pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn world_dir(&self, world_id: &str) -> Result<PathBuf> {
        checked(world_id)?;
        Ok(self.root.join(world_id))
    }

    fn agent_dir(&self, world_id: &str, agent_id: &str) -> Result<PathBuf> {
        checked(agent_id)?;
        Ok(self.world_dir(world_id)?.join("agents").join(agent_id))
    }

    fn chat_path(&self, world_id: &str, chat_id: &str) -> Result<PathBuf> {
        checked(chat_id)?;
        Ok(self
            .world_dir(world_id)?
            .join("chats")
            .join(format!("{chat_id}.json")))
    }

    async fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        write_atomic(path, &bytes).await
    }

    /// Migrate a legacy name-keyed agent directory to its id.
    ///
    /// Older layouts keyed the agent directory by display name.  When a
    /// directory's name differs from the id in its config, the directory is
    /// renamed so that all future reads and writes go through the id.
    async fn migrate_legacy_agent_dir(&self, world_id: &str, dir_name: &str, id: &str) {
        let from = match self.agent_dir(world_id, dir_name) {
            Ok(p) => p,
            Err(_) => return,
        };
        let to = match self.agent_dir(world_id, id) {
            Ok(p) => p,
            Err(_) => return,
        };
        if to.exists() {
            warn!(world_id, dir = dir_name, id, "legacy agent dir shadows id-keyed dir; leaving both");
            return;
        }
        match tokio::fs::rename(&from, &to).await {
            Ok(()) => debug!(world_id, from = dir_name, to = id, "migrated legacy agent directory"),
            Err(e) => warn!(world_id, from = dir_name, error = %e, "legacy agent migration failed"),
        }
    }

    async fn load_agent_from_dir(&self, dir: &Path) -> Result<Option<AgentRecord>> {
        let config: AgentConfigRecord = match read_json(&dir.join("config.json")).await? {
            Some(c) => c,
            None => return Ok(None),
        };
        let system_prompt = match tokio::fs::read_to_string(dir.join("system-prompt.md")).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                default_system_prompt(&config.name)
            }
            Err(e) => return Err(e.into()),
        };
        let memory: Vec<MemoryEntry> =
            read_json(&dir.join("memory.json")).await?.unwrap_or_default();
        Ok(Some(AgentRecord {
            config,
            system_prompt,
            memory,
        }))
    }
}

#[async_trait]
impl Storage for FileStorage {
    // ── Worlds ────────────────────────────────────────────────────────────────

    async fn save_world(&self, world: &WorldRecord) -> Result<()> {
        let dir = self.world_dir(&world.id)?;
        tokio::fs::create_dir_all(dir.join("agents")).await?;
        tokio::fs::create_dir_all(dir.join("chats")).await?;
        self.write_json(&dir.join("config.json"), world).await
    }

    async fn load_world(&self, world_id: &str) -> Result<Option<WorldRecord>> {
        read_json(&self.world_dir(world_id)?.join("config.json")).await
    }

    async fn delete_world(&self, world_id: &str) -> Result<bool> {
        let dir = self.world_dir(world_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_worlds(&self) -> Result<Vec<WorldRecord>> {
        let mut worlds = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(worlds),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let config_path = entry.path().join("config.json");
            match read_json::<WorldRecord>(&config_path).await {
                Ok(Some(w)) => worlds.push(w),
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %config_path.display(), error = %e, "skipping unreadable world");
                }
            }
        }
        worlds.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(worlds)
    }

    async fn world_exists(&self, world_id: &str) -> Result<bool> {
        Ok(self.world_dir(world_id)?.join("config.json").is_file())
    }

    // ── Agents ────────────────────────────────────────────────────────────────

    async fn save_agent(&self, world_id: &str, agent: &AgentRecord) -> Result<()> {
        let dir = self.agent_dir(world_id, &agent.config.id)?;
        tokio::fs::create_dir_all(&dir).await?;
        // Config file carries everything except the prompt, which is stored
        // alongside as readable text and rejoined on load.
        self.write_json(&dir.join("config.json"), &agent.config)
            .await?;
        write_atomic(&dir.join("system-prompt.md"), agent.system_prompt.as_bytes()).await?;
        self.write_json(&dir.join("memory.json"), &agent.memory)
            .await
    }

    async fn load_agent(&self, world_id: &str, agent_id: &str) -> Result<Option<AgentRecord>> {
        let dir = self.agent_dir(world_id, agent_id)?;
        self.load_agent_from_dir(&dir).await
    }

    async fn delete_agent(&self, world_id: &str, agent_id: &str) -> Result<bool> {
        let dir = self.agent_dir(world_id, agent_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_agents(&self, world_id: &str) -> Result<Vec<AgentRecord>> {
        let agents_dir = self.world_dir(world_id)?.join("agents");
        let mut found: Vec<(String, AgentRecord)> = Vec::new();
        let mut dir = match tokio::fs::read_dir(&agents_dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().to_string();
            match self.load_agent_from_dir(&entry.path()).await {
                Ok(Some(agent)) => found.push((dir_name, agent)),
                Ok(None) => {}
                Err(e) => {
                    warn!(world_id, dir = %dir_name, error = %e, "skipping unreadable agent");
                }
            }
        }

        // Migrate any directory still keyed by display name instead of id.
        let mut agents = Vec::with_capacity(found.len());
        for (dir_name, agent) in found {
            if dir_name != agent.config.id {
                self.migrate_legacy_agent_dir(world_id, &dir_name, &agent.config.id)
                    .await;
            }
            agents.push(agent);
        }
        agents.sort_by(|a, b| a.config.name.cmp(&b.config.name));
        Ok(agents)
    }

    async fn save_agent_memory(
        &self,
        world_id: &str,
        agent_id: &str,
        memory: &[MemoryEntry],
    ) -> Result<()> {
        let dir = self.agent_dir(world_id, agent_id)?;
        tokio::fs::create_dir_all(&dir).await?;
        self.write_json(&dir.join("memory.json"), &memory.to_vec())
            .await
    }

    async fn archive_agent_memory(&self, world_id: &str, agent_id: &str) -> Result<()> {
        let dir = self.agent_dir(world_id, agent_id)?;
        let live = dir.join("memory.json");
        if !live.is_file() {
            return Ok(());
        }
        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let archive = dir.join(format!("memory-{stamp}.json"));
        tokio::fs::rename(&live, &archive).await?;
        debug!(world_id, agent_id, archive = %archive.display(), "archived agent memory");
        Ok(())
    }

    // ── Chats ─────────────────────────────────────────────────────────────────

    async fn save_chat(&self, world_id: &str, chat: &ChatData) -> Result<()> {
        let path = self.chat_path(world_id, &chat.id)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.write_json(&path, chat).await
    }

    async fn load_chat(&self, world_id: &str, chat_id: &str) -> Result<Option<ChatData>> {
        read_json(&self.chat_path(world_id, chat_id)?).await
    }

    async fn delete_chat(&self, world_id: &str, chat_id: &str) -> Result<bool> {
        let path = self.chat_path(world_id, chat_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_chats(&self, world_id: &str) -> Result<Vec<ChatMeta>> {
        let chats_dir = self.world_dir(world_id)?.join("chats");
        let mut chats = Vec::new();
        let mut dir = match tokio::fs::read_dir(&chats_dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(chats),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<ChatData>(&path).await {
                Ok(Some(chat)) => chats.push(chat.meta()),
                Ok(None) => {}
                Err(e) => {
                    warn!(world_id, path = %path.display(), error = %e, "skipping unreadable chat");
                }
            }
        }
        chats.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(chats)
    }

    // ── Snapshots ─────────────────────────────────────────────────────────────

    async fn save_world_chat(
        &self,
        world_id: &str,
        chat_id: &str,
        snapshot: &WorldChat,
    ) -> Result<()> {
        let mut chat = self
            .load_chat(world_id, chat_id)
            .await?
            .unwrap_or_else(|| ChatData::new(chat_id, chat_id));
        chat.snapshot = Some(snapshot.clone());
        chat.updated_at = Utc::now();
        self.save_chat(world_id, &chat).await
    }

    async fn load_world_chat(&self, world_id: &str, chat_id: &str) -> Result<Option<WorldChat>> {
        Ok(self
            .load_chat(world_id, chat_id)
            .await?
            .and_then(|c| c.snapshot))
    }

    // ── Integrity ─────────────────────────────────────────────────────────────

    async fn validate_world(&self, world_id: &str) -> Result<Vec<String>> {
        let mut problems = Vec::new();
        let world = match self.load_world(world_id).await? {
            Some(w) => w,
            None => {
                problems.push(format!("world '{world_id}' has no config.json"));
                return Ok(problems);
            }
        };

        let agents = self.list_agents(world_id).await?;
        for a in &agents {
            let dir = self.agent_dir(world_id, &a.config.id)?;
            if !dir.join("system-prompt.md").is_file() {
                problems.push(format!(
                    "agent '{}' is missing system-prompt.md (default substituted on load)",
                    a.config.id
                ));
            }
            if !dir.join("memory.json").is_file() {
                problems.push(format!("agent '{}' is missing memory.json", a.config.id));
            }
        }

        let chats = self.list_chats(world_id).await?;
        if let Some(active) = &world.current_chat_id {
            if !chats.iter().any(|c| &c.id == active) {
                problems.push(format!(
                    "currentChatId '{active}' does not name an existing chat"
                ));
            }
        }

        // Chat files that failed to parse are invisible to list_chats;
        // re-scan the directory to report them.
        let chats_dir = self.world_dir(world_id)?.join("chats");
        if let Ok(mut dir) = tokio::fs::read_dir(&chats_dir).await {
            while let Some(entry) = dir.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let text = tokio::fs::read_to_string(&path).await?;
                if serde_json::from_str::<ChatData>(&text).is_err() {
                    problems.push(format!("chat file '{}' is unparsable", path.display()));
                }
            }
        }

        Ok(problems)
    }

    async fn repair_world(&self, world_id: &str) -> Result<Vec<String>> {
        let mut repairs = Vec::new();
        let mut world = match self.load_world(world_id).await? {
            Some(w) => w,
            None => return Ok(repairs),
        };

        // Re-stub missing per-agent files so later hot-path writes and reads
        // see a consistent directory.
        let agents = self.list_agents(world_id).await?;
        for a in &agents {
            let dir = self.agent_dir(world_id, &a.config.id)?;
            let prompt = dir.join("system-prompt.md");
            if !prompt.is_file() {
                write_atomic(&prompt, default_system_prompt(&a.config.name).as_bytes()).await?;
                repairs.push(format!("wrote default system-prompt.md for '{}'", a.config.id));
            }
            let memory = dir.join("memory.json");
            if !memory.is_file() {
                self.write_json::<Vec<MemoryEntry>>(&memory, &Vec::new())
                    .await?;
                repairs.push(format!("wrote empty memory.json for '{}'", a.config.id));
            }
        }

        // Quarantine unparsable chat files.
        let chats_dir = self.world_dir(world_id)?.join("chats");
        if let Ok(mut dir) = tokio::fs::read_dir(&chats_dir).await {
            while let Some(entry) = dir.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let text = tokio::fs::read_to_string(&path).await?;
                if serde_json::from_str::<ChatData>(&text).is_err() {
                    let quarantine = path.with_extension("json.corrupt");
                    tokio::fs::rename(&path, &quarantine).await?;
                    repairs.push(format!(
                        "quarantined unparsable chat file as '{}'",
                        quarantine.display()
                    ));
                }
            }
        }

        // Clear a dangling active-chat pointer.
        let chats = self.list_chats(world_id).await?;
        if let Some(active) = world.current_chat_id.clone() {
            if !chats.iter().any(|c| c.id == active) {
                world.current_chat_id = None;
                self.save_world(&world).await?;
                repairs.push(format!("cleared dangling currentChatId '{active}'"));
            }
        }

        Ok(repairs)
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn checked(id: &str) -> Result<()> {
    if is_valid_id(id) {
        Ok(())
    } else {
        Err(StoreError::InvalidId(id.to_string()))
    }
}

/// Read and deserialize a JSON file; `Ok(None)` when the file does not exist.
async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_str(&text)?))
}

/// Atomic write: write `<file>.tmp`, flush userspace buffers, sync to disk,
/// then rename over the destination.  If rename returns Ok the new file is
/// fully consistent; on any error path the temp file is removed.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp_path = {
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        path.with_file_name(format!("{filename}.tmp"))
    };

    let write_result: Result<()> = async {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
    .await;

    if let Err(err) = write_result {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err);
    }

    if let Err(err) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err.into());
    }

    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
