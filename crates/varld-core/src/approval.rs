// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Tool-call approval engine.
//!
//! Every Ask-policy tool call passes through here:
//!
//! ```text
//! PENDING ──approve(once)───► EXECUTING ──result──► DONE
//!    │    ──approve(session)► EXECUTING ──result──► DONE  [key cached]
//!    │    ──deny────────────► DONE [synthetic denial]
//!    │    ──cancel──────────► DONE [synthetic cancel]
//! ```
//!
//! Approval identity: shell-style tools are keyed by `(tool, working dir)`;
//! everything else by `(tool, sha256 of the canonicalized argument object)`,
//! so semantically equal argument objects hash equally regardless of field
//! order.  Session grants live per chat and die with it.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tracing::debug;

use varld_store::ToolCallRecord;

/// Function name of the synthetic approval-request tool call.
pub const APPROVAL_TOOL_NAME: &str = "client.requestApproval";

/// Wire vocabulary offered to clients.
pub const APPROVAL_OPTIONS: [&str; 3] = ["deny", "approve_once", "approve_session"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalScope {
    Once,
    Session,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve(ApprovalScope),
    Deny,
}

impl ApprovalDecision {
    /// Parse a decision from either vocabulary: the canonical wire tokens
    /// (`deny` / `approve_once` / `approve_session`, or `approve` plus a
    /// `scope`) and the legacy UI tokens (`Cancel` / `Once` / `Always`).
    /// Everything is matched case-insensitively and normalised here; nothing
    /// downstream ever sees the UI vocabulary.
    pub fn parse(decision: &str, scope: Option<&str>) -> Option<Self> {
        let d = decision.trim().to_ascii_lowercase();
        match d.as_str() {
            "deny" | "cancel" => Some(Self::Deny),
            "approve_once" | "once" => Some(Self::Approve(ApprovalScope::Once)),
            "approve_session" | "always" => Some(Self::Approve(ApprovalScope::Session)),
            "approve" => {
                let s = scope.map(|s| s.trim().to_ascii_lowercase());
                match s.as_deref() {
                    Some("session") | Some("always") => {
                        Some(Self::Approve(ApprovalScope::Session))
                    }
                    // An approve without scope is a one-shot grant.
                    Some("once") | None => Some(Self::Approve(ApprovalScope::Once)),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

/// A registered approval awaiting a human decision.
struct PendingApproval {
    agent_id: String,
    responder: oneshot::Sender<ApprovalDecision>,
}

#[derive(Default)]
pub struct ApprovalEngine {
    /// Per-chat session grants.
    session: Mutex<HashMap<String, HashSet<String>>>,
    /// In-flight requests keyed by tool-call id, preserving the
    /// `tool_call_id → agent` linkage so any client's response reaches the
    /// correct suspended turn.
    pending: Mutex<HashMap<String, PendingApproval>>,
}

impl ApprovalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the approval key for a tool invocation.
    pub fn approval_key(tool_name: &str, args: &Value, keyed_by_working_dir: bool) -> String {
        if keyed_by_working_dir {
            let cwd = args.get("cwd").and_then(|v| v.as_str()).unwrap_or("");
            format!("{tool_name}:{cwd}")
        } else {
            let mut hasher = Sha256::new();
            hasher.update(canonical_json(args).as_bytes());
            let digest = hasher.finalize();
            let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
            format!("{tool_name}:{hex}")
        }
    }

    pub fn is_approved(&self, chat_id: &str, key: &str) -> bool {
        self.session
            .lock()
            .unwrap()
            .get(chat_id)
            .map(|set| set.contains(key))
            .unwrap_or(false)
    }

    pub fn grant_session(&self, chat_id: &str, key: &str) {
        debug!(chat_id, key, "caching session approval");
        self.session
            .lock()
            .unwrap()
            .entry(chat_id.to_string())
            .or_default()
            .insert(key.to_string());
    }

    /// Drop a chat's grants (the chat ended or was deleted).
    pub fn clear_chat(&self, chat_id: &str) {
        self.session.lock().unwrap().remove(chat_id);
    }

    /// Register a pending request and return the receiver its decision will
    /// arrive on.
    pub fn register(
        &self,
        tool_call_id: &str,
        agent_id: &str,
    ) -> oneshot::Receiver<ApprovalDecision> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(
            tool_call_id.to_string(),
            PendingApproval {
                agent_id: agent_id.to_string(),
                responder: tx,
            },
        );
        rx
    }

    /// Route a decision to the suspended turn.  Returns `false` when no such
    /// request is pending (stale or duplicate response).
    pub fn resolve(&self, tool_call_id: &str, decision: ApprovalDecision) -> bool {
        let pending = self.pending.lock().unwrap().remove(tool_call_id);
        match pending {
            Some(p) => {
                debug!(tool_call_id, agent_id = %p.agent_id, ?decision, "resolving approval");
                p.responder.send(decision).is_ok()
            }
            None => false,
        }
    }

    /// The agent a pending request belongs to.
    pub fn pending_agent(&self, tool_call_id: &str) -> Option<String> {
        self.pending
            .lock()
            .unwrap()
            .get(tool_call_id)
            .map(|p| p.agent_id.clone())
    }

    /// Deny every pending request (world teardown).
    pub fn cancel_all(&self) {
        let drained: Vec<PendingApproval> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, p)| p).collect()
        };
        for p in drained {
            let _ = p.responder.send(ApprovalDecision::Deny);
        }
    }

    /// Build the synthetic `client.requestApproval` tool-call payload carried
    /// on the approval-request message event.
    pub fn request_payload(
        tool_call_id: &str,
        tool_name: &str,
        args: &Value,
        working_dir: Option<&str>,
    ) -> ToolCallRecord {
        let mut arguments = json!({
            "originalToolCall": { "name": tool_name, "args": args },
            "message": format!("Agent requests permission to run '{tool_name}'"),
            "options": APPROVAL_OPTIONS,
        });
        if let Some(wd) = working_dir {
            arguments["workingDirectory"] = json!(wd);
        }
        ToolCallRecord {
            id: tool_call_id.to_string(),
            name: APPROVAL_TOOL_NAME.to_string(),
            arguments,
        }
    }
}

/// Serialize a JSON value with object keys sorted recursively, so that
/// semantically equal objects produce identical byte strings.
pub fn canonical_json(v: &Value) -> String {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
