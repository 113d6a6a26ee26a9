// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

// ─── Message types ────────────────────────────────────────────────────────────

/// A single message in a completion request.
///
/// This is the provider-facing shape: flat role + content with optional
/// tool-call linkage, matching what every chat-completion API consumes after
/// its own wire mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Display name of the author, for providers that accept one (OpenAI
    /// `name` field).  Providers without the concept fold it into the text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Tool invocations requested by an assistant turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    /// For role = tool: the id of the call this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user_from(text: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::user(text)
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn tool_result(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            name: None,
            tool_calls: None,
            tool_call_id: Some(id.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// A complete tool call carried on an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object
    pub arguments: String,
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSchema>,
    pub stream: bool,
}

// ─── Stream events ────────────────────────────────────────────────────────────

/// A single streamed chunk from the model.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A text delta streamed from the model
    TextDelta(String),
    /// The model wants to call a tool.  Fragments for the same call share an
    /// `index`; callers accumulate `arguments` across deltas until the stream
    /// ends, then surface complete records.
    ToolCallDelta {
        index: u32,
        id: String,
        name: String,
        /// Partial JSON arguments (may arrive across multiple deltas)
        arguments: String,
    },
    /// Final usage statistics
    Usage(Usage),
    /// The stream finished normally.  No further events follow.
    Done,
    /// A provider-level failure.  Terminates the stream; no further events
    /// follow.
    Error(String),
}

/// Token usage from one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
