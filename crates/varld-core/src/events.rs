// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use uuid::Uuid;

use varld_model::Usage;
use varld_store::ToolCallRecord;

/// Sender name used for messages typed by the human operator.
pub const HUMAN_SENDER: &str = "HUMAN";

/// A chat message travelling over a world's `message` topic.
/// Immutable once published.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub content: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    /// Stable id assigned on first emission.
    pub message_id: String,
    pub chat_id: Option<String>,
    pub reply_to_message_id: Option<String>,
    /// Tool-call payload, used by the approval engine's synthetic requests
    /// and echoed on agent messages that carried tool invocations.
    pub tool_calls: Option<Vec<ToolCallRecord>>,
}

impl MessageEvent {
    /// A human-authored message with a fresh id.
    pub fn human(content: impl Into<String>, chat_id: Option<String>) -> Self {
        Self {
            content: content.into(),
            sender: HUMAN_SENDER.to_string(),
            timestamp: Utc::now(),
            message_id: Uuid::new_v4().to_string(),
            chat_id,
            reply_to_message_id: None,
            tool_calls: None,
        }
    }

    /// An agent-authored reply.
    pub fn from_agent(
        sender: impl Into<String>,
        content: impl Into<String>,
        chat_id: Option<String>,
        reply_to: Option<String>,
    ) -> Self {
        Self {
            content: content.into(),
            sender: sender.into(),
            timestamp: Utc::now(),
            message_id: Uuid::new_v4().to_string(),
            chat_id,
            reply_to_message_id: reply_to,
            tool_calls: None,
        }
    }
}

/// Streaming phase of an agent's in-flight LLM output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsePhase {
    Start,
    Chunk,
    End,
    Error,
    ToolStart,
    ToolProgress,
    ToolResult,
    ToolError,
}

impl SsePhase {
    /// Stable wire token for this phase.
    pub fn as_str(&self) -> &'static str {
        match self {
            SsePhase::Start => "start",
            SsePhase::Chunk => "chunk",
            SsePhase::End => "end",
            SsePhase::Error => "error",
            SsePhase::ToolStart => "tool-start",
            SsePhase::ToolProgress => "tool-progress",
            SsePhase::ToolResult => "tool-result",
            SsePhase::ToolError => "tool-error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "start" => SsePhase::Start,
            "chunk" => SsePhase::Chunk,
            "end" => SsePhase::End,
            "error" => SsePhase::Error,
            "tool-start" => SsePhase::ToolStart,
            "tool-progress" => SsePhase::ToolProgress,
            "tool-result" => SsePhase::ToolResult,
            "tool-error" => SsePhase::ToolError,
            _ => return None,
        })
    }
}

/// A streaming frame on a world's `sse` topic.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub agent_name: String,
    pub phase: SsePhase,
    /// The message the stream will resolve into.
    pub message_id: String,
    /// Accumulated content so far (chunk) or final content (end).
    pub content: Option<String>,
    pub error: Option<String>,
    pub usage: Option<Usage>,
}

impl SseEvent {
    pub fn phase(agent_name: impl Into<String>, phase: SsePhase, message_id: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            phase,
            message_id: message_id.into(),
            content: None,
            error: None,
            usage: None,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// An out-of-band notification on a world's `system` topic.
#[derive(Debug, Clone)]
pub struct SystemEvent {
    pub category: String,
    pub content: String,
    pub chat_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl SystemEvent {
    pub fn new(category: impl Into<String>, content: impl Into<String>, chat_id: Option<String>) -> Self {
        Self {
            category: category.into(),
            content: content.into(),
            chat_id,
            timestamp: Utc::now(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_message_has_fresh_unique_ids() {
        let a = MessageEvent::human("hi", None);
        let b = MessageEvent::human("hi", None);
        assert_ne!(a.message_id, b.message_id);
        assert_eq!(a.sender, HUMAN_SENDER);
    }

    #[test]
    fn agent_message_carries_reply_link() {
        let m = MessageEvent::from_agent("a1", "sure", Some("c1".into()), Some("m0".into()));
        assert_eq!(m.reply_to_message_id.as_deref(), Some("m0"));
        assert_eq!(m.chat_id.as_deref(), Some("c1"));
    }

    #[test]
    fn every_phase_round_trips_through_its_token() {
        for phase in [
            SsePhase::Start,
            SsePhase::Chunk,
            SsePhase::End,
            SsePhase::Error,
            SsePhase::ToolStart,
            SsePhase::ToolProgress,
            SsePhase::ToolResult,
            SsePhase::ToolError,
        ] {
            assert_eq!(SsePhase::parse(phase.as_str()), Some(phase));
        }
    }

    #[test]
    fn tool_phases_use_hyphenated_tokens() {
        assert_eq!(SsePhase::ToolStart.as_str(), "tool-start");
        assert_eq!(SsePhase::ToolError.as_str(), "tool-error");
    }

    #[test]
    fn unknown_phase_token_is_none() {
        assert!(SsePhase::parse("finished").is_none());
    }
}
