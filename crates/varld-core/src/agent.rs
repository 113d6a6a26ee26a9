// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
//! The per-agent runtime: a subscriber loop on the world's `message` topic.
//!
//! For every delivered message the agent either records it silently
//! ("passive memory" — every agent retains the full conversation) or runs a
//! turn: assemble the prompt from its own memory, stream the completion,
//! route tool calls through the approval engine, publish the reply, and
//! write everything back to memory.
//!
//! Failures inside the loop never escape the task — they become `sse` error
//! frames and log lines, so one failing agent cannot tear down its world.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use varld_model::{
    ChatMessage, CompletionRequest, FunctionCall, ModelProvider, StreamEvent, ToolCallRequest,
    ToolSchema, Usage,
};
use varld_store::{AgentRecord, MemoryEntry, MessageRole, ToolCallRecord};
use varld_tools::{ApprovalPolicy, ToolCall};

use crate::approval::{ApprovalDecision, ApprovalEngine, ApprovalScope, APPROVAL_TOOL_NAME};
use crate::error::Result;
use crate::events::{MessageEvent, SseEvent, SsePhase};
use crate::mention::{should_respond, SenderKind};
use crate::world::WorldContext;

/// Ceiling on completion rounds within one turn (initial call plus tool
/// follow-ups).  A model that keeps requesting tools past this simply gets
/// its last text surfaced.
const MAX_TOOL_ROUNDS: u32 = 5;

/// Text injected as the tool result when the human denies a call.
const DENIED_BY_USER: &str = "Tool execution denied by user";

pub struct AgentRuntime {
    record: Mutex<AgentRecord>,
    provider: Arc<dyn ModelProvider>,
    ctx: WorldContext,
}

/// What one completion round produced.
enum RoundOutcome {
    Complete {
        text: String,
        tool_calls: Vec<ToolCall>,
        usage: Option<Usage>,
    },
    Error(String),
    Cancelled,
}

impl AgentRuntime {
    pub fn new(record: AgentRecord, provider: Arc<dyn ModelProvider>, ctx: WorldContext) -> Arc<Self> {
        Arc::new(Self {
            record: Mutex::new(record),
            provider,
            ctx,
        })
    }

    pub fn id(&self) -> String {
        self.record.lock().unwrap().config.id.clone()
    }

    pub fn name(&self) -> String {
        self.record.lock().unwrap().config.name.clone()
    }

    /// A point-in-time copy of the full record (config + prompt + memory).
    pub fn snapshot(&self) -> AgentRecord {
        self.record.lock().unwrap().clone()
    }

    /// Apply an admin mutation to the record.  The caller persists.
    pub fn update_record(&self, f: impl FnOnce(&mut AgentRecord)) -> AgentRecord {
        let mut r = self.record.lock().unwrap();
        f(&mut r);
        r.clone()
    }

    /// Swap the memory wholesale (clear-memory, restore).
    pub fn replace_memory(&self, memory: Vec<MemoryEntry>) -> AgentRecord {
        let mut r = self.record.lock().unwrap();
        r.memory = memory;
        r.clone()
    }

    /// Subscribe to the world's message topic and process events until the
    /// world shuts down.  Must be called before the agent is visible to
    /// callers, so no message published after creation is missed.
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let agent = Arc::clone(self);
        let mut rx = agent.ctx.bus.subscribe_messages();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    msg = rx.recv() => match msg {
                        Ok(ev) => {
                            if let Err(e) = agent.handle_message(ev, &mut shutdown).await {
                                warn!(agent_id = %agent.id(), error = %e, "agent turn failed");
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(agent_id = %agent.id(), skipped = n, "agent lagged on message topic");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            debug!(agent_id = %agent.id(), "agent subscription ended");
        })
    }

    async fn handle_message(
        &self,
        ev: MessageEvent,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (agent_id, agent_name) = {
            let r = self.record.lock().unwrap();
            (r.config.id.clone(), r.config.name.clone())
        };

        // Own emissions are already in memory; never re-process them.
        if ev.sender.eq_ignore_ascii_case(&agent_id) || ev.sender.eq_ignore_ascii_case(&agent_name)
        {
            return Ok(());
        }

        // Approval-request frames are engine plumbing addressed to clients,
        // not conversation.
        if ev
            .tool_calls
            .as_ref()
            .map(|tcs| tcs.iter().any(|t| t.name == APPROVAL_TOOL_NAME))
            .unwrap_or(false)
        {
            return Ok(());
        }

        let kind = self.ctx.classify_sender(&ev.sender);
        let chat_id = ev.chat_id.clone().or_else(|| self.ctx.chats.active());
        let responds = should_respond(&agent_id, &agent_name, &ev.content, &ev.sender, kind, false);

        if !responds || !self.ctx.turns.can_respond(chat_id.as_deref()) {
            // Passive memory: retain the message, emit nothing.
            self.record_incoming(&ev, kind, chat_id.as_deref()).await?;
            return Ok(());
        }

        self.ctx.chats.begin_turn();
        let outcome = self
            .run_turn(&ev, kind, chat_id, &agent_id, &agent_name, shutdown)
            .await;
        self.ctx.chats.end_turn();
        outcome
    }

    // ── One full turn ─────────────────────────────────────────────────────────

    async fn run_turn(
        &self,
        ev: &MessageEvent,
        kind: SenderKind,
        chat_id: Option<String>,
        agent_id: &str,
        agent_name: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        self.record_incoming(ev, kind, chat_id.as_deref()).await?;

        let out_message_id = Uuid::new_v4().to_string();
        self.ctx
            .publish_sse(SseEvent::phase(agent_name, SsePhase::Start, &out_message_id));

        let mut usage_total: Option<Usage> = None;
        let final_text: String;

        let mut round = 0u32;
        loop {
            round += 1;
            let request = self.build_request(chat_id.as_deref());
            {
                let mut r = self.record.lock().unwrap();
                r.config.llm_call_count += 1;
                r.config.last_active = Utc::now();
            }

            match self
                .stream_once(request, agent_name, &out_message_id, shutdown)
                .await
            {
                RoundOutcome::Cancelled => {
                    self.ctx.publish_sse(
                        SseEvent::phase(agent_name, SsePhase::Error, &out_message_id)
                            .with_error("cancelled"),
                    );
                    return Ok(());
                }
                RoundOutcome::Error(msg) => {
                    self.ctx.publish_sse(
                        SseEvent::phase(agent_name, SsePhase::Error, &out_message_id)
                            .with_error(&msg),
                    );
                    warn!(agent_id, error = %msg, "provider error ended the turn");
                    return Ok(());
                }
                RoundOutcome::Complete {
                    text,
                    tool_calls,
                    usage,
                } => {
                    if let Some(u) = usage {
                        let total = usage_total.get_or_insert(Usage::default());
                        total.input_tokens += u.input_tokens;
                        total.output_tokens += u.output_tokens;
                    }
                    if tool_calls.is_empty() || round >= MAX_TOOL_ROUNDS {
                        final_text = text;
                        break;
                    }

                    // The assistant turn that requested the tools, then each
                    // call routed through the approval engine.
                    self.append_tool_call_turn(&text, &tool_calls, chat_id.as_deref())
                        .await?;
                    for tc in tool_calls {
                        let proceed = self
                            .process_tool_call(tc, chat_id.as_deref(), agent_id, agent_name, &out_message_id, shutdown)
                            .await?;
                        if !proceed {
                            self.ctx.publish_sse(
                                SseEvent::phase(agent_name, SsePhase::Error, &out_message_id)
                                    .with_error("cancelled"),
                            );
                            return Ok(());
                        }
                    }
                }
            }
        }

        // Final emission: end frame, then the message event.
        let mut end = SseEvent::phase(agent_name, SsePhase::End, &out_message_id)
            .with_content(&final_text);
        if let Some(u) = usage_total {
            end = end.with_usage(u);
        }
        self.ctx.publish_sse(end);

        let out_ev = MessageEvent {
            content: final_text,
            sender: agent_name.to_string(),
            timestamp: Utc::now(),
            message_id: out_message_id,
            chat_id: chat_id.clone(),
            reply_to_message_id: Some(ev.message_id.clone()),
            tool_calls: None,
        };
        self.ctx.publish_message(out_ev.clone());

        // Memory write-back: the outbound entry plus counters, persisted as
        // one record save.
        let record = {
            let mut r = self.record.lock().unwrap();
            r.memory.push(MemoryEntry {
                role: MessageRole::Assistant,
                content: out_ev.content.clone(),
                sender: Some(out_ev.sender.clone()),
                message_id: Some(out_ev.message_id.clone()),
                reply_to_message_id: out_ev.reply_to_message_id.clone(),
                chat_id: chat_id.clone(),
                tool_calls: None,
                tool_call_id: None,
                created_at: out_ev.timestamp,
                agent_id: Some(agent_id.to_string()),
            });
            if let Some(chat) = &chat_id {
                *r.config.message_counts.entry(chat.clone()).or_insert(0) += 1;
            }
            r.clone()
        };
        self.ctx
            .storage
            .save_agent(&self.ctx.world_id, &record)
            .await?;
        Ok(())
    }

    // ── Streaming ─────────────────────────────────────────────────────────────

    async fn stream_once(
        &self,
        request: CompletionRequest,
        agent_name: &str,
        message_id: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> RoundOutcome {
        let mut stream = match self.provider.stream_chat(request).await {
            Ok(s) => s,
            Err(e) => return RoundOutcome::Error(e.to_string()),
        };

        let mut text = String::new();
        // Keyed by the parallel-tool-call index from the provider: fragments
        // for different calls interleave by index, every provider uses 0 for
        // a single call.
        let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();
        let mut usage: Option<Usage> = None;

        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.changed() => return RoundOutcome::Cancelled,
                ev = stream.next() => ev,
            };
            let Some(event) = event else { break };
            match event {
                Ok(StreamEvent::TextDelta(delta)) if !delta.is_empty() => {
                    text.push_str(&delta);
                    // Chunk frames carry the accumulated content so a late
                    // subscriber renders correctly from any frame.
                    self.ctx.publish_sse(
                        SseEvent::phase(agent_name, SsePhase::Chunk, message_id)
                            .with_content(&text),
                    );
                }
                Ok(StreamEvent::TextDelta(_)) => {}
                Ok(StreamEvent::ToolCallDelta {
                    index,
                    id,
                    name,
                    arguments,
                }) => {
                    let slot = pending.entry(index).or_insert_with(PendingToolCall::default);
                    if !id.is_empty() {
                        slot.id = id;
                    }
                    if !name.is_empty() {
                        slot.name = name;
                    }
                    slot.args_buf.push_str(&arguments);
                }
                Ok(StreamEvent::Usage(u)) => usage = Some(u),
                Ok(StreamEvent::Done) => break,
                Ok(StreamEvent::Error(msg)) => return RoundOutcome::Error(msg),
                Err(e) => return RoundOutcome::Error(e.to_string()),
            }
        }

        // Flush accumulated tool calls, ordered by index.  Calls with no
        // name cannot be dispatched and are dropped; a missing id gets a
        // synthetic one so the result linkage still works.
        let mut flushed: Vec<(u32, PendingToolCall)> = pending.into_iter().collect();
        flushed.sort_by_key(|(idx, _)| *idx);
        let mut tool_calls = Vec::with_capacity(flushed.len());
        for (i, (_, ptc)) in flushed.into_iter().enumerate() {
            if ptc.name.is_empty() {
                warn!(tool_call_id = %ptc.id, "dropping tool call with empty name from model");
                continue;
            }
            tool_calls.push(ptc.finish(i));
        }

        RoundOutcome::Complete {
            text,
            tool_calls,
            usage,
        }
    }

    /// Assemble the completion request: system prompt, the last N memory
    /// entries of the chat, tools.
    fn build_request(&self, chat_id: Option<&str>) -> CompletionRequest {
        let r = self.record.lock().unwrap();
        let mut messages = vec![ChatMessage::system(&r.system_prompt)];

        let window: Vec<&MemoryEntry> = r
            .memory
            .iter()
            .filter(|m| m.chat_id.as_deref() == chat_id)
            .collect();
        let skip = window.len().saturating_sub(self.ctx.memory_window);
        for entry in window.into_iter().skip(skip) {
            match entry.role {
                MessageRole::User => {
                    let sender = entry.sender.clone().unwrap_or_else(|| "user".into());
                    messages.push(ChatMessage::user_from(&entry.content, sender));
                }
                MessageRole::Assistant => {
                    let mut msg = ChatMessage::assistant(&entry.content);
                    if let Some(calls) = &entry.tool_calls {
                        msg.tool_calls = Some(
                            calls
                                .iter()
                                .map(|c| ToolCallRequest {
                                    id: c.id.clone(),
                                    function: FunctionCall {
                                        name: c.name.clone(),
                                        arguments: c.arguments.to_string(),
                                    },
                                })
                                .collect(),
                        );
                    }
                    messages.push(msg);
                }
                MessageRole::Tool => {
                    let id = entry.tool_call_id.clone().unwrap_or_default();
                    messages.push(ChatMessage::tool_result(id, &entry.content));
                }
                MessageRole::System => {}
            }
        }

        let tools: Vec<ToolSchema> = self
            .ctx
            .tools
            .schemas()
            .into_iter()
            .map(|s| ToolSchema {
                name: s.name,
                description: s.description,
                parameters: s.parameters,
            })
            .collect();

        CompletionRequest {
            messages,
            tools,
            stream: true,
        }
    }

    // ── Tool calls ────────────────────────────────────────────────────────────

    /// Route one completed tool call: trusted tools run immediately, Deny
    /// tools are refused synthetically, everything else asks the human
    /// (subject to the chat's session grants).  Returns `false` when the
    /// turn was cancelled while suspended.
    async fn process_tool_call(
        &self,
        tc: ToolCall,
        chat_id: Option<&str>,
        agent_id: &str,
        agent_name: &str,
        message_id: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool> {
        let policy = self.ctx.tools.policy(&tc.name);
        let keyed_by_cwd = self
            .ctx
            .tools
            .get(&tc.name)
            .map(|t| t.keyed_by_working_dir())
            .unwrap_or(false);

        let decision = match policy {
            ApprovalPolicy::Auto => ApprovalDecision::Approve(ApprovalScope::Once),
            ApprovalPolicy::Deny => ApprovalDecision::Deny,
            ApprovalPolicy::Ask => {
                let chat_key = chat_id.unwrap_or("");
                let key = ApprovalEngine::approval_key(&tc.name, &tc.args, keyed_by_cwd);
                if self.ctx.approvals.is_approved(chat_key, &key) {
                    debug!(agent_id, tool = %tc.name, "session grant covers tool call");
                    ApprovalDecision::Approve(ApprovalScope::Once)
                } else {
                    let rx = self.ctx.approvals.register(&tc.id, agent_id);
                    let working_dir = tc.args.get("cwd").and_then(|v| v.as_str());
                    let payload =
                        ApprovalEngine::request_payload(&tc.id, &tc.name, &tc.args, working_dir);
                    let request_ev = MessageEvent {
                        content: format!("Approval required: {} wants to run '{}'", agent_name, tc.name),
                        sender: agent_name.to_string(),
                        timestamp: Utc::now(),
                        message_id: Uuid::new_v4().to_string(),
                        chat_id: chat_id.map(str::to_string),
                        reply_to_message_id: Some(message_id.to_string()),
                        tool_calls: Some(vec![payload]),
                    };
                    // Published directly on the bus: approval plumbing is not
                    // a conversational turn and must not move the turn
                    // counter.
                    self.ctx.bus.publish_message(request_ev);

                    let decision = tokio::select! {
                        biased;
                        _ = shutdown.changed() => return Ok(false),
                        d = rx => d,
                    };
                    match decision {
                        Ok(d) => {
                            if let ApprovalDecision::Approve(ApprovalScope::Session) = d {
                                self.ctx.approvals.grant_session(chat_key, &key);
                            }
                            d
                        }
                        // Responder dropped (world teardown): treat as cancel.
                        Err(_) => return Ok(false),
                    }
                }
            }
        };

        match decision {
            ApprovalDecision::Deny => {
                self.append_tool_result(&tc.id, DENIED_BY_USER, chat_id).await?;
                self.ctx.publish_sse(
                    SseEvent::phase(agent_name, SsePhase::ToolError, message_id)
                        .with_error(format!("{}: denied", tc.name)),
                );
            }
            ApprovalDecision::Approve(_) => {
                self.ctx.publish_sse(
                    SseEvent::phase(agent_name, SsePhase::ToolStart, message_id)
                        .with_content(tc.name.clone()),
                );
                let output = self.ctx.tools.execute(&tc).await;
                let phase = if output.is_error {
                    SsePhase::ToolError
                } else {
                    SsePhase::ToolResult
                };
                self.append_tool_result(&tc.id, &output.content, chat_id).await?;
                self.ctx.publish_sse(
                    SseEvent::phase(agent_name, phase, message_id).with_content(&output.content),
                );
            }
        }
        Ok(true)
    }

    // ── Memory plumbing ───────────────────────────────────────────────────────

    /// Append an inbound message to memory (exactly once per message id) and
    /// persist on the memory hot path.
    async fn record_incoming(
        &self,
        ev: &MessageEvent,
        kind: SenderKind,
        chat_id: Option<&str>,
    ) -> Result<()> {
        let author_agent_id = match kind {
            SenderKind::Agent => self.ctx.resolve_agent_id(&ev.sender),
            _ => None,
        };
        let (agent_id, memory) = {
            let mut r = self.record.lock().unwrap();
            if r.memory
                .iter()
                .any(|m| m.message_id.as_deref() == Some(ev.message_id.as_str()))
            {
                return Ok(());
            }
            r.memory.push(MemoryEntry {
                role: MessageRole::User,
                content: ev.content.clone(),
                sender: Some(ev.sender.clone()),
                message_id: Some(ev.message_id.clone()),
                reply_to_message_id: ev.reply_to_message_id.clone(),
                chat_id: chat_id.map(str::to_string),
                tool_calls: ev.tool_calls.clone(),
                tool_call_id: None,
                created_at: ev.timestamp,
                agent_id: author_agent_id,
            });
            (r.config.id.clone(), r.memory.clone())
        };
        self.ctx
            .storage
            .save_agent_memory(&self.ctx.world_id, &agent_id, &memory)
            .await?;
        Ok(())
    }

    /// Record the assistant turn that requested tools.
    async fn append_tool_call_turn(
        &self,
        text: &str,
        tool_calls: &[ToolCall],
        chat_id: Option<&str>,
    ) -> Result<()> {
        let records: Vec<ToolCallRecord> = tool_calls
            .iter()
            .map(|tc| ToolCallRecord {
                id: tc.id.clone(),
                name: tc.name.clone(),
                arguments: tc.args.clone(),
            })
            .collect();
        let (agent_id, memory) = {
            let mut r = self.record.lock().unwrap();
            let own_id = r.config.id.clone();
            let own_name = r.config.name.clone();
            r.memory.push(MemoryEntry {
                role: MessageRole::Assistant,
                content: text.to_string(),
                sender: Some(own_name),
                message_id: None,
                reply_to_message_id: None,
                chat_id: chat_id.map(str::to_string),
                tool_calls: Some(records),
                tool_call_id: None,
                created_at: Utc::now(),
                agent_id: Some(own_id.clone()),
            });
            (own_id, r.memory.clone())
        };
        self.ctx
            .storage
            .save_agent_memory(&self.ctx.world_id, &agent_id, &memory)
            .await?;
        Ok(())
    }

    /// Inject a tool result into memory as a role=tool entry.
    async fn append_tool_result(
        &self,
        tool_call_id: &str,
        content: &str,
        chat_id: Option<&str>,
    ) -> Result<()> {
        let (agent_id, memory) = {
            let mut r = self.record.lock().unwrap();
            let own_id = r.config.id.clone();
            r.memory.push(MemoryEntry {
                role: MessageRole::Tool,
                content: content.to_string(),
                sender: None,
                message_id: None,
                reply_to_message_id: None,
                chat_id: chat_id.map(str::to_string),
                tool_calls: None,
                tool_call_id: Some(tool_call_id.to_string()),
                created_at: Utc::now(),
                agent_id: Some(own_id.clone()),
            });
            (own_id, r.memory.clone())
        };
        self.ctx
            .storage
            .save_agent_memory(&self.ctx.world_id, &agent_id, &memory)
            .await?;
        Ok(())
    }
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    /// Resolve the accumulated fragments into a dispatchable call.  The
    /// arguments must end up a JSON object; anything unparsable becomes `{}`
    /// so the tool can report the problem instead of the turn dying.
    fn finish(self, ordinal: usize) -> ToolCall {
        let args = if self.args_buf.is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            match serde_json::from_str(&self.args_buf) {
                Ok(v) => v,
                Err(parse_err) => {
                    warn!(
                        tool_name = %self.name,
                        tool_call_id = %self.id,
                        error = %parse_err,
                        "model sent tool call with invalid JSON arguments; substituting {{}}"
                    );
                    serde_json::Value::Object(Default::default())
                }
            }
        };
        let id = if self.id.is_empty() {
            warn!(tool_name = %self.name, "tool call from model had empty id; generating synthetic id");
            format!("tc_synthetic_{ordinal}")
        } else {
            self.id
        };
        ToolCall {
            id,
            name: self.name,
            args,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
