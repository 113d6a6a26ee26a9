// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
//! The wire boundary: every JSON frame consumed or produced by clients is
//! shaped here and nowhere else.
//!
//! Outbound, internal events become `{type: "message" | "sse" | "system"}`
//! frames with stable field names and phase tokens.  Inbound, the enhanced
//! tool-result envelope (`{__type: "tool_result", ...}`) is recognised and
//! turned into an approval decision before anything downstream can mistake
//! it for a chat message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use varld_model::Usage;
use varld_store::ToolCallRecord;

use crate::approval::ApprovalDecision;
use crate::events::{MessageEvent, SseEvent, SystemEvent};

/// A JSON frame as seen by CLI and HTTP clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireFrame {
    #[serde(rename_all = "camelCase")]
    Message {
        message_id: String,
        sender: String,
        content: String,
        created_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chat_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to_message_id: Option<String>,
        #[serde(rename = "tool_calls", default, skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<ToolCallRecord>>,
    },
    #[serde(rename_all = "camelCase")]
    Sse {
        phase: String,
        agent_name: String,
        message_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    #[serde(rename_all = "camelCase")]
    System {
        category: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chat_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

pub fn from_message(ev: &MessageEvent) -> WireFrame {
    WireFrame::Message {
        message_id: ev.message_id.clone(),
        sender: ev.sender.clone(),
        content: ev.content.clone(),
        created_at: ev.timestamp,
        chat_id: ev.chat_id.clone(),
        reply_to_message_id: ev.reply_to_message_id.clone(),
        tool_calls: ev.tool_calls.clone(),
    }
}

pub fn from_sse(ev: &SseEvent) -> WireFrame {
    WireFrame::Sse {
        phase: ev.phase.as_str().to_string(),
        agent_name: ev.agent_name.clone(),
        message_id: ev.message_id.clone(),
        content: ev.content.clone(),
        error: ev.error.clone(),
        usage: ev.usage,
    }
}

pub fn from_system(ev: &SystemEvent) -> WireFrame {
    WireFrame::System {
        category: ev.category.clone(),
        content: ev.content.clone(),
        chat_id: ev.chat_id.clone(),
        timestamp: ev.timestamp,
    }
}

pub fn to_json(frame: &WireFrame) -> String {
    serde_json::to_string(frame).unwrap_or_else(|_| "{}".into())
}

// ─── Approval response envelope ──────────────────────────────────────────────

/// A decoded approval decision addressed to a suspended tool call.
#[derive(Debug, Clone)]
pub struct ApprovalResponse {
    pub tool_call_id: String,
    pub agent_id: Option<String>,
    pub decision: ApprovalDecision,
}

/// Recognise the enhanced tool-result envelope in an inbound message body.
///
/// The wire shape is double-encoded by design (for compatibility with
/// clients that treat message content as an opaque string):
///
/// ```json
/// {"__type":"tool_result","tool_call_id":"…","agentId":"…",
///  "content":"{\"decision\":\"approve\",\"scope\":\"session\", …}"}
/// ```
///
/// The inner content is accepted both as a JSON string and as an inline
/// object; the decision vocabulary is normalised by
/// [`ApprovalDecision::parse`].  Returns `None` for anything that is not an
/// envelope — callers then treat the body as a regular chat message.
pub fn detect_approval_response(content: &str) -> Option<ApprovalResponse> {
    let v: Value = serde_json::from_str(content.trim()).ok()?;
    if v.get("__type")?.as_str()? != "tool_result" {
        return None;
    }
    let tool_call_id = v.get("tool_call_id")?.as_str()?.to_string();
    let agent_id = v
        .get("agentId")
        .and_then(|a| a.as_str())
        .map(str::to_string);
    let inner: Value = match v.get("content") {
        Some(Value::String(s)) => serde_json::from_str(s).ok()?,
        Some(obj) if obj.is_object() => obj.clone(),
        _ => return None,
    };
    let decision_str = inner.get("decision")?.as_str()?;
    let scope = inner.get("scope").and_then(|s| s.as_str());
    let decision = ApprovalDecision::parse(decision_str, scope)?;
    Some(ApprovalResponse {
        tool_call_id,
        agent_id,
        decision,
    })
}

/// Build the envelope a client sends to answer an approval request.
pub fn approval_response_envelope(
    tool_call_id: &str,
    agent_id: &str,
    decision: &str,
    scope: Option<&str>,
    tool_name: &str,
    tool_args: &Value,
    working_directory: Option<&str>,
) -> String {
    let mut inner = json!({
        "decision": decision,
        "toolName": tool_name,
        "toolArgs": tool_args,
    });
    if let Some(s) = scope {
        inner["scope"] = json!(s);
    }
    if let Some(wd) = working_directory {
        inner["workingDirectory"] = json!(wd);
    }
    let envelope = json!({
        "__type": "tool_result",
        "tool_call_id": tool_call_id,
        "agentId": agent_id,
        "content": inner.to_string(),
    });
    envelope.to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
