// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
//! World lifecycle: construction of the bus, turn controller, approval
//! engine, and chat manager; agent CRUD; and the process-wide manager that
//! owns the `worldId → bus` registry.
//!
//! Agent runtimes never reach back into the manager — they get a
//! [`WorldContext`] handle at construction, which carries exactly the
//! capabilities a turn needs (publish, subscribe, storage, turns, approvals,
//! chats, tools).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock as StdRwLock};

use chrono::Utc;
use tokio::sync::{watch, Mutex as TokioMutex, RwLock};
use tracing::{debug, info, warn};

use varld_config::{Config, ProviderConfig};
use varld_model::ModelProvider;
use varld_store::{
    to_kebab_case, AgentRecord, ChatData, ChatMeta, MemoryEntry, Storage, WorldChat, WorldRecord,
};

use crate::agent::AgentRuntime;
use crate::approval::ApprovalEngine;
use crate::bus::{BusRegistry, WorldBus};
use crate::chat::{memory_view_for_agent, ChatManager};
use crate::error::{Result, WorldError};
use crate::events::{MessageEvent, SseEvent, SystemEvent};
use crate::mention::SenderKind;
use crate::turns::TurnController;
use crate::wire;

// ─── Provider factory ────────────────────────────────────────────────────────

/// Seam through which agent runtimes obtain their model providers.  The
/// default builds real drivers from config; tests inject scripted mocks.
pub trait ProviderFactory: Send + Sync {
    fn make(&self, cfg: &ProviderConfig) -> anyhow::Result<Arc<dyn ModelProvider>>;
}

pub struct DefaultProviderFactory;

impl ProviderFactory for DefaultProviderFactory {
    fn make(&self, cfg: &ProviderConfig) -> anyhow::Result<Arc<dyn ModelProvider>> {
        varld_model::from_config(cfg).map(Arc::from)
    }
}

// ─── World context ───────────────────────────────────────────────────────────

/// The capability handle given to every agent runtime.
#[derive(Clone)]
pub struct WorldContext {
    pub world_id: String,
    pub bus: Arc<WorldBus>,
    pub storage: Arc<dyn Storage>,
    pub turns: Arc<TurnController>,
    pub approvals: Arc<ApprovalEngine>,
    pub chats: Arc<ChatManager>,
    pub tools: Arc<varld_tools::ToolRegistry>,
    pub memory_window: usize,
    /// (id, name) of every live agent, for sender classification.
    directory: Arc<StdRwLock<Vec<(String, String)>>>,
}

impl WorldContext {
    /// Classify a message sender for the response filter and turn
    /// accounting.  Unknown names count as human: external callers may post
    /// under any label.
    pub fn classify_sender(&self, sender: &str) -> SenderKind {
        if sender.is_empty() || sender.eq_ignore_ascii_case("system") {
            return SenderKind::System;
        }
        if sender.eq_ignore_ascii_case("human") || sender.eq_ignore_ascii_case("user") {
            return SenderKind::Human;
        }
        let dir = self.directory.read().unwrap();
        if dir
            .iter()
            .any(|(id, name)| sender.eq_ignore_ascii_case(id) || sender.eq_ignore_ascii_case(name))
        {
            SenderKind::Agent
        } else {
            SenderKind::Human
        }
    }

    /// The agent id behind a sender name, when the sender is a known agent.
    pub fn resolve_agent_id(&self, sender: &str) -> Option<String> {
        let dir = self.directory.read().unwrap();
        dir.iter()
            .find(|(id, name)| sender.eq_ignore_ascii_case(id) || sender.eq_ignore_ascii_case(name))
            .map(|(id, _)| id.clone())
    }

    /// Publish on the `message` topic.  The turn controller observes the
    /// event *before* any subscriber can read it, so an agent beginning its
    /// turn always sees every prior agent message counted.
    pub fn publish_message(&self, ev: MessageEvent) {
        let kind = self.classify_sender(&ev.sender);
        let chat = ev.chat_id.clone().or_else(|| self.chats.active());
        self.turns.observe(chat.as_deref(), kind, &ev.content);
        self.bus.publish_message(ev);
    }

    pub fn publish_sse(&self, ev: SseEvent) {
        self.bus.publish_sse(ev);
    }

    pub fn publish_system(&self, ev: SystemEvent) {
        self.bus.publish_system(ev);
    }

    fn set_directory(&self, entries: Vec<(String, String)>) {
        *self.directory.write().unwrap() = entries;
    }
}

// ─── World ───────────────────────────────────────────────────────────────────

/// Parameters accepted by agent create/update.
#[derive(Debug, Clone, Default)]
pub struct AgentParams {
    pub name: String,
    pub agent_type: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
}

struct AgentSlot {
    runtime: Arc<AgentRuntime>,
    task: tokio::task::JoinHandle<()>,
}

pub struct World {
    config: RwLock<WorldRecord>,
    agents: RwLock<HashMap<String, AgentSlot>>,
    ctx: WorldContext,
    shutdown_tx: watch::Sender<bool>,
    provider_factory: Arc<dyn ProviderFactory>,
    app_config: Config,
    autosave: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World").finish_non_exhaustive()
    }
}

impl World {
    /// Assemble a world from its persisted record: bus bindings, turn
    /// controller, chat manager, and one subscribed runtime per stored
    /// agent.
    pub async fn open(
        record: WorldRecord,
        storage: Arc<dyn Storage>,
        bus: Arc<WorldBus>,
        tools: Arc<varld_tools::ToolRegistry>,
        provider_factory: Arc<dyn ProviderFactory>,
        app_config: Config,
    ) -> Result<Arc<Self>> {
        let (shutdown_tx, _) = watch::channel(false);
        let ctx = WorldContext {
            world_id: record.id.clone(),
            bus,
            storage: Arc::clone(&storage),
            turns: Arc::new(TurnController::new(record.turn_limit)),
            approvals: Arc::new(ApprovalEngine::new()),
            chats: Arc::new(ChatManager::new(
                record.id.clone(),
                Arc::clone(&storage),
                record.current_chat_id.clone(),
            )),
            tools,
            memory_window: app_config.world.memory_window,
            directory: Arc::new(StdRwLock::new(Vec::new())),
        };

        let world = Arc::new(Self {
            config: RwLock::new(record),
            agents: RwLock::new(HashMap::new()),
            ctx,
            shutdown_tx,
            provider_factory,
            app_config,
            autosave: Mutex::new(None),
        });

        // Subscribe every stored agent before the world becomes reachable.
        let stored = world.ctx.storage.list_agents(&world.id()).await?;
        {
            let mut agents = world.agents.write().await;
            for record in stored {
                match world.spawn_runtime(record) {
                    Ok((id, slot)) => {
                        agents.insert(id, slot);
                    }
                    Err(e) => warn!(world_id = %world.id(), error = %e, "skipping agent with bad provider config"),
                }
            }
        }
        world.refresh_directory().await;
        world.start_autosave();
        Ok(world)
    }

    pub fn id(&self) -> String {
        self.ctx.world_id.clone()
    }

    pub fn context(&self) -> &WorldContext {
        &self.ctx
    }

    pub async fn config(&self) -> WorldRecord {
        self.config.read().await.clone()
    }

    /// Mutate and re-persist the world config.  In-memory state is rolled
    /// back when the write fails.
    pub async fn update_config(&self, f: impl FnOnce(&mut WorldRecord)) -> Result<WorldRecord> {
        let previous = self.config.read().await.clone();
        let updated = {
            let mut cfg = self.config.write().await;
            f(&mut cfg);
            cfg.id = previous.id.clone();
            cfg.clone()
        };
        if let Err(e) = self.ctx.storage.save_world(&updated).await {
            *self.config.write().await = previous;
            return Err(e.into());
        }
        self.ctx.turns.set_limit(updated.turn_limit);
        Ok(updated)
    }

    // ── Messaging ─────────────────────────────────────────────────────────────

    /// Publish a human message into the world.  When no chat is active, one
    /// is created implicitly first.
    pub async fn post_human(&self, content: &str) -> Result<MessageEvent> {
        let chat_id = match self.ctx.chats.active() {
            Some(id) => id,
            None => {
                let chat = self.ctx.chats.new_chat().await?;
                self.persist_active_chat(Some(chat.id.clone())).await?;
                chat.id
            }
        };
        let ev = MessageEvent::human(content, Some(chat_id));
        self.ctx.publish_message(ev.clone());
        Ok(ev)
    }

    /// Route an inbound client message: approval-response envelopes are
    /// dispatched to the engine before the chat manager can mistake them for
    /// conversation; everything else is published as a human message.
    pub async fn post_inbound(&self, content: &str) -> Result<Option<MessageEvent>> {
        if let Some(resp) = wire::detect_approval_response(content) {
            let routed = self.ctx.approvals.resolve(&resp.tool_call_id, resp.decision);
            if !routed {
                warn!(tool_call_id = %resp.tool_call_id, "approval response with no pending request");
            }
            return Ok(None);
        }
        self.post_human(content).await.map(Some)
    }

    pub fn subscribe_messages(&self) -> tokio::sync::broadcast::Receiver<MessageEvent> {
        self.ctx.bus.subscribe_messages()
    }

    pub fn subscribe_sse(&self) -> tokio::sync::broadcast::Receiver<SseEvent> {
        self.ctx.bus.subscribe_sse()
    }

    pub fn subscribe_system(&self) -> tokio::sync::broadcast::Receiver<SystemEvent> {
        self.ctx.bus.subscribe_system()
    }

    // ── Agents ────────────────────────────────────────────────────────────────

    pub async fn create_agent(&self, params: AgentParams) -> Result<AgentRecord> {
        if params.name.trim().is_empty() {
            return Err(WorldError::validation("name", "must not be empty"));
        }
        let id = to_kebab_case(&params.name);
        if id.is_empty() {
            return Err(WorldError::validation(
                "name",
                "must contain at least one alphanumeric character",
            ));
        }
        if self.agents.read().await.contains_key(&id) {
            return Err(WorldError::Conflict(format!("agent '{id}' already exists")));
        }

        let world_cfg = self.config.read().await.clone();
        let now = Utc::now();
        let mut record = AgentRecord::new(id.clone(), params.name.trim());
        record.config.agent_type = params.agent_type.unwrap_or_else(|| "assistant".into());
        record.config.provider = params
            .provider
            .or(world_cfg.chat_provider)
            .unwrap_or_else(|| self.app_config.chat.provider.clone());
        record.config.model = params
            .model
            .or(world_cfg.chat_model)
            .unwrap_or_else(|| self.app_config.chat.model.clone());
        record.config.temperature = params.temperature;
        record.config.max_tokens = params.max_tokens;
        record.config.created_at = now;
        record.config.last_active = now;
        record.system_prompt = params
            .system_prompt
            .unwrap_or_else(|| varld_store::default_system_prompt(&record.config.name));

        // Fail before any state changes when the provider is unusable.
        let (agent_id, slot) = self.spawn_runtime(record.clone())?;

        if let Err(e) = self.ctx.storage.save_agent(&self.id(), &record).await {
            slot.task.abort();
            return Err(e.into());
        }
        self.agents.write().await.insert(agent_id, slot);
        self.refresh_directory().await;
        info!(world_id = %self.id(), agent_id = %record.config.id, "created agent");
        Ok(record)
    }

    pub async fn update_agent(&self, agent_id: &str, params: AgentParams) -> Result<AgentRecord> {
        let agents = self.agents.read().await;
        let slot = agents
            .get(agent_id)
            .ok_or_else(|| WorldError::NotFound(format!("agent '{agent_id}'")))?;
        let previous = slot.runtime.snapshot();
        let updated = slot.runtime.update_record(|r| {
            if !params.name.trim().is_empty() {
                r.config.name = params.name.trim().to_string();
            }
            if let Some(t) = &params.agent_type {
                r.config.agent_type = t.clone();
            }
            if let Some(p) = &params.provider {
                r.config.provider = p.clone();
            }
            if let Some(m) = &params.model {
                r.config.model = m.clone();
            }
            if params.temperature.is_some() {
                r.config.temperature = params.temperature;
            }
            if params.max_tokens.is_some() {
                r.config.max_tokens = params.max_tokens;
            }
            if let Some(sp) = &params.system_prompt {
                r.system_prompt = sp.clone();
            }
        });
        if let Err(e) = self.ctx.storage.save_agent(&self.id(), &updated).await {
            slot.runtime.update_record(|r| *r = previous.clone());
            return Err(e.into());
        }
        drop(agents);
        self.refresh_directory().await;
        Ok(updated)
    }

    pub async fn delete_agent(&self, agent_id: &str) -> Result<bool> {
        // Storage first; in-memory teardown only once the tree is gone.
        let removed = self.ctx.storage.delete_agent(&self.id(), agent_id).await?;
        if let Some(slot) = self.agents.write().await.remove(agent_id) {
            slot.task.abort();
        }
        self.refresh_directory().await;
        Ok(removed)
    }

    /// Truncate an agent's memory (archiving the old file) and reset its
    /// per-chat counters.  Config and prompt survive.
    pub async fn clear_agent_memory(&self, agent_id: &str) -> Result<()> {
        let agents = self.agents.read().await;
        let slot = agents
            .get(agent_id)
            .ok_or_else(|| WorldError::NotFound(format!("agent '{agent_id}'")))?;
        self.ctx.storage.archive_agent_memory(&self.id(), agent_id).await?;
        let record = slot.runtime.update_record(|r| {
            r.memory.clear();
            r.config.message_counts.clear();
        });
        self.ctx.storage.save_agent(&self.id(), &record).await?;
        Ok(())
    }

    pub async fn get_agent(&self, agent_id: &str) -> Option<AgentRecord> {
        self.agents
            .read()
            .await
            .get(agent_id)
            .map(|s| s.runtime.snapshot())
    }

    pub async fn list_agents(&self) -> Vec<AgentRecord> {
        let agents = self.agents.read().await;
        let mut records: Vec<AgentRecord> = agents.values().map(|s| s.runtime.snapshot()).collect();
        records.sort_by(|a, b| a.config.name.cmp(&b.config.name));
        records
    }

    // ── Chats ─────────────────────────────────────────────────────────────────

    pub async fn create_chat(&self, name: &str, description: &str) -> Result<ChatData> {
        let chat = self.ctx.chats.create(name, description).await?;
        self.persist_active_chat(Some(chat.id.clone())).await?;
        self.ctx.turns.reset_chat(Some(&chat.id));
        Ok(chat)
    }

    pub async fn new_chat(&self) -> Result<ChatData> {
        let chat = self.ctx.chats.new_chat().await?;
        self.persist_active_chat(Some(chat.id.clone())).await?;
        self.ctx.turns.reset_chat(Some(&chat.id));
        Ok(chat)
    }

    /// Switch the active chat.  Refused while any agent turn is in flight.
    pub async fn set_chat(&self, chat_id: &str) -> Result<()> {
        self.ctx.chats.switch_to(chat_id).await?;
        self.persist_active_chat(Some(chat_id.to_string())).await?;
        self.ctx.turns.reset_chat(Some(chat_id));
        Ok(())
    }

    pub async fn delete_chat(&self, chat_id: &str) -> Result<bool> {
        let removed = self.ctx.chats.delete(chat_id).await?;
        if removed {
            self.ctx.approvals.clear_chat(chat_id);
            self.ctx.turns.reset_chat(Some(chat_id));
            let active = self.ctx.chats.active();
            self.persist_active_chat(active).await?;
        }
        Ok(removed)
    }

    pub async fn update_chat(
        &self,
        chat_id: &str,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<ChatData> {
        self.ctx.chats.update(chat_id, name, description).await
    }

    pub async fn list_chats(&self) -> Result<Vec<ChatMeta>> {
        self.ctx.chats.list().await
    }

    pub fn active_chat(&self) -> Option<String> {
        self.ctx.chats.active()
    }

    async fn persist_active_chat(&self, chat_id: Option<String>) -> Result<()> {
        self.ctx.chats.set_active_unchecked(chat_id.clone());
        self.update_config(|cfg| cfg.current_chat_id = chat_id)
            .await?;
        Ok(())
    }

    // ── Snapshot / restore ────────────────────────────────────────────────────

    /// Capture a chat as a [`WorldChat`] and persist it on the chat file.
    pub async fn create_world_chat(&self, chat_id: &str) -> Result<WorldChat> {
        if self.ctx.storage.load_chat(&self.id(), chat_id).await?.is_none() {
            return Err(WorldError::NotFound(format!("chat '{chat_id}'")));
        }
        let config = self.config.read().await.clone();
        let agents = self.list_agents().await;
        let snapshot = ChatManager::create_world_chat(&config, &agents, chat_id);
        self.ctx
            .storage
            .save_world_chat(&self.id(), chat_id, &snapshot)
            .await?;
        Ok(snapshot)
    }

    pub async fn load_world_chat(&self, chat_id: &str) -> Result<Option<WorldChat>> {
        Ok(self.ctx.storage.load_world_chat(&self.id(), chat_id).await?)
    }

    /// Overwrite the agent set from a snapshot: absent agents are deleted,
    /// present ones upserted, and each agent's memory for the snapshot's
    /// chat replaced by its view of the captured stream.
    ///
    /// The change is staged first — every new record is fully constructed
    /// before anything is written — and rolled back if any write fails.
    pub async fn restore_from_world_chat(&self, snapshot: &WorldChat) -> Result<()> {
        let chat_id = snapshot
            .messages
            .iter()
            .find_map(|m| m.chat_id.clone())
            .or_else(|| snapshot.world.current_chat_id.clone())
            .ok_or_else(|| WorldError::validation("snapshot", "carries no chat id"))?;

        // Stage: construct the complete desired record set.
        let current = self.list_agents().await;
        let mut staged: Vec<AgentRecord> = Vec::with_capacity(snapshot.agents.len());
        for snap in &snapshot.agents {
            let view = memory_view_for_agent(&snapshot.messages, &snap.config.id);
            let mut memory: Vec<MemoryEntry> = current
                .iter()
                .find(|a| a.config.id == snap.config.id)
                .map(|a| {
                    a.memory
                        .iter()
                        .filter(|m| m.chat_id.as_deref() != Some(chat_id.as_str()))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            memory.extend(view);
            staged.push(AgentRecord {
                config: snap.config.clone(),
                system_prompt: snap.system_prompt.clone(),
                memory,
            });
        }

        // Persist the staged set; undo on the first failure.
        let mut written: Vec<String> = Vec::new();
        for record in &staged {
            if let Err(e) = self.ctx.storage.save_agent(&self.id(), record).await {
                for id in &written {
                    if let Some(old) = current.iter().find(|a| &a.config.id == id) {
                        let _ = self.ctx.storage.save_agent(&self.id(), old).await;
                    }
                }
                return Err(e.into());
            }
            written.push(record.config.id.clone());
        }

        // Swap the live runtimes.
        let snapshot_ids: std::collections::HashSet<&str> =
            snapshot.agents.iter().map(|a| a.config.id.as_str()).collect();
        {
            let mut agents = self.agents.write().await;
            // Delete agents absent from the snapshot.
            let stale: Vec<String> = agents
                .keys()
                .filter(|id| !snapshot_ids.contains(id.as_str()))
                .cloned()
                .collect();
            for id in stale {
                if let Some(slot) = agents.remove(&id) {
                    slot.task.abort();
                }
                self.ctx.storage.delete_agent(&self.id(), &id).await?;
            }
            // Upsert the rest.
            for record in staged {
                let id = record.config.id.clone();
                if let Some(slot) = agents.get(&id) {
                    slot.runtime.update_record(|r| *r = record.clone());
                    continue;
                }
                match self.spawn_runtime(record) {
                    Ok((id, slot)) => {
                        agents.insert(id, slot);
                    }
                    Err(e) => {
                        warn!(world_id = %self.id(), agent_id = %id, error = %e, "restored agent has unusable provider config");
                    }
                }
            }
        }
        self.refresh_directory().await;
        Ok(())
    }

    // ── Teardown ──────────────────────────────────────────────────────────────

    /// Stop every agent subscription, fail pending approvals as denied, and
    /// end the auto-save loop.  In-flight streams observe the shutdown
    /// signal and terminate with an `error` frame reading `cancelled`.
    pub async fn destroy(&self) {
        let _ = self.shutdown_tx.send(true);
        self.ctx.approvals.cancel_all();
        let mut agents = self.agents.write().await;
        for (_, slot) in agents.drain() {
            slot.task.abort();
        }
        if let Some(task) = self.autosave.lock().unwrap().take() {
            task.abort();
        }
        debug!(world_id = %self.id(), "world destroyed");
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn spawn_runtime(&self, record: AgentRecord) -> Result<(String, AgentSlot)> {
        let provider_cfg = self.resolve_provider(&record);
        if varld_model::get_driver(&provider_cfg.provider).is_none() {
            return Err(WorldError::validation(
                "provider",
                format!("unknown provider '{}'", provider_cfg.provider),
            ));
        }
        let provider = self
            .provider_factory
            .make(&provider_cfg)
            .map_err(|e| WorldError::Provider(e.to_string()))?;
        let id = record.config.id.clone();
        let runtime = AgentRuntime::new(record, provider, self.ctx.clone());
        let task = runtime.spawn(self.shutdown_tx.subscribe());
        Ok((id, AgentSlot { runtime, task }))
    }

    /// Map an agent's provider/model fields to a concrete provider config:
    /// a named entry from the config file wins, then the raw provider id.
    fn resolve_provider(&self, record: &AgentRecord) -> ProviderConfig {
        let cfg = &record.config;
        if let Some(entry) = self.app_config.providers.get(&cfg.provider) {
            let mut out = entry.clone();
            if !cfg.model.is_empty() {
                out.model = cfg.model.clone();
            }
            if cfg.temperature.is_some() {
                out.temperature = cfg.temperature;
            }
            if cfg.max_tokens.is_some() {
                out.max_tokens = cfg.max_tokens;
            }
            return out;
        }
        let base = if self.app_config.chat.provider == cfg.provider {
            self.app_config.chat.clone()
        } else {
            ProviderConfig {
                provider: cfg.provider.clone(),
                model: cfg.model.clone(),
                ..ProviderConfig::default()
            }
        };
        base.for_agent(&cfg.provider, &cfg.model, cfg.temperature, cfg.max_tokens)
    }

    async fn refresh_directory(&self) {
        let agents = self.agents.read().await;
        let entries: Vec<(String, String)> = agents
            .values()
            .map(|s| {
                let r = s.runtime.snapshot();
                (r.config.id, r.config.name)
            })
            .collect();
        self.ctx.set_directory(entries);
    }

    /// The auto-save loop: every published message is appended to the active
    /// chat, deduplicated by message id.
    fn start_autosave(self: &Arc<Self>) {
        let ctx = self.ctx.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut rx = ctx.bus.subscribe_messages();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    msg = rx.recv() => match msg {
                        Ok(ev) => {
                            let kind = ctx.classify_sender(&ev.sender);
                            let author = match kind {
                                SenderKind::Agent => ctx.resolve_agent_id(&ev.sender),
                                _ => None,
                            };
                            if let Err(e) = ctx.chats.append_message(&ev, kind, author.as_deref()).await {
                                warn!(world_id = %ctx.world_id, error = %e, "chat auto-save failed");
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(world_id = %ctx.world_id, skipped = n, "auto-save lagged on message topic");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
        *self.autosave.lock().unwrap() = Some(task);
    }
}

// ─── World manager ───────────────────────────────────────────────────────────

/// Process-wide owner of worlds, their buses, and the storage binding.
pub struct WorldManager {
    storage: Arc<dyn Storage>,
    app_config: Config,
    buses: BusRegistry,
    worlds: TokioMutex<HashMap<String, Arc<World>>>,
    provider_factory: Arc<dyn ProviderFactory>,
    tools: Arc<varld_tools::ToolRegistry>,
}

impl WorldManager {
    pub fn new(storage: Arc<dyn Storage>, app_config: Config) -> Self {
        Self::with_provider_factory(storage, app_config, Arc::new(DefaultProviderFactory))
    }

    pub fn with_provider_factory(
        storage: Arc<dyn Storage>,
        app_config: Config,
        provider_factory: Arc<dyn ProviderFactory>,
    ) -> Self {
        let tools = Arc::new(varld_tools::ToolRegistry::with_builtins(
            app_config.tools.timeout_secs,
        ));
        Self {
            storage,
            app_config,
            buses: BusRegistry::new(),
            worlds: TokioMutex::new(HashMap::new()),
            provider_factory,
            tools,
        }
    }

    /// Create a world: validate the name, persist the config, and bring the
    /// runtime up.  Nothing is registered in memory when the write fails.
    pub async fn create_world(&self, name: &str, description: &str) -> Result<Arc<World>> {
        if name.trim().is_empty() {
            return Err(WorldError::validation("name", "must not be empty"));
        }
        let id = to_kebab_case(name);
        if id.is_empty() {
            return Err(WorldError::validation(
                "name",
                "must contain at least one alphanumeric character",
            ));
        }
        if self.storage.world_exists(&id).await? {
            return Err(WorldError::Conflict(format!("world '{id}' already exists")));
        }

        let mut record = WorldRecord::new(id.clone(), name.trim());
        record.description = description.to_string();
        record.turn_limit = self.app_config.world.turn_limit;
        record.chat_provider = Some(self.app_config.chat.provider.clone());
        record.chat_model = Some(self.app_config.chat.model.clone());
        self.storage.save_world(&record).await?;

        let world = self.open_world(record).await?;
        self.worlds.lock().await.insert(id, Arc::clone(&world));
        info!(world_id = %world.id(), "created world");
        Ok(world)
    }

    /// Fetch a world, loading it from storage (and lazily reconstructing
    /// its bus) when it is not yet live.
    pub async fn get_world(&self, world_id: &str) -> Result<Arc<World>> {
        if let Some(world) = self.worlds.lock().await.get(world_id) {
            return Ok(Arc::clone(world));
        }
        let record = self
            .storage
            .load_world(world_id)
            .await?
            .ok_or_else(|| WorldError::NotFound(format!("world '{world_id}'")))?;
        let world = self.open_world(record).await?;
        self.worlds
            .lock()
            .await
            .insert(world_id.to_string(), Arc::clone(&world));
        Ok(world)
    }

    pub async fn list_worlds(&self) -> Result<Vec<WorldRecord>> {
        Ok(self.storage.list_worlds().await?)
    }

    pub async fn update_world(
        &self,
        world_id: &str,
        f: impl FnOnce(&mut WorldRecord),
    ) -> Result<WorldRecord> {
        let world = self.get_world(world_id).await?;
        world.update_config(f).await
    }

    /// Delete a world: unsubscribe agents, destroy the bus, remove the
    /// storage tree.  A storage failure rolls the in-memory deletion back.
    pub async fn delete_world(&self, world_id: &str) -> Result<()> {
        let live = self.worlds.lock().await.remove(world_id);
        if let Some(world) = &live {
            world.destroy().await;
        }
        self.buses.remove(world_id);

        match self.storage.delete_world(world_id).await {
            Ok(existed) => {
                if !existed && live.is_none() {
                    return Err(WorldError::NotFound(format!("world '{world_id}'")));
                }
                Ok(())
            }
            Err(e) => {
                // The tree survived; bring the world back so state and disk
                // stay consistent.
                if let Ok(Some(record)) = self.storage.load_world(world_id).await {
                    if let Ok(world) = self.open_world(record).await {
                        self.worlds
                            .lock()
                            .await
                            .insert(world_id.to_string(), world);
                    }
                }
                Err(e.into())
            }
        }
    }

    pub async fn validate_world(&self, world_id: &str) -> Result<Vec<String>> {
        Ok(self.storage.validate_world(world_id).await?)
    }

    pub async fn repair_world(&self, world_id: &str) -> Result<Vec<String>> {
        Ok(self.storage.repair_world(world_id).await?)
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.storage)
    }

    async fn open_world(&self, record: WorldRecord) -> Result<Arc<World>> {
        let bus = self.buses.get_or_create(&record.id);
        World::open(
            record,
            Arc::clone(&self.storage),
            bus,
            Arc::clone(&self.tools),
            Arc::clone(&self.provider_factory),
            self.app_config.clone(),
        )
        .await
    }
}
