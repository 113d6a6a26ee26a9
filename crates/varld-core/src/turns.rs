// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Consecutive agent-turn accounting.
//!
//! The counter is scoped per world *and* per chat: a human message or a
//! chat switch resets it.  State is transient; a reloaded world starts at
//! zero.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::mention::SenderKind;

/// A human message containing this literal token silences agents until the
/// next human message, exactly as if the turn limit had been reached.
pub const PASS_DIRECTIVE: &str = "<world>pass</world>";

#[derive(Debug, Default, Clone, Copy)]
struct ChatTurnState {
    /// Agent-authored messages since the last human one.
    count: u32,
    /// Set by the pass directive; cleared by the next ordinary human message.
    passed: bool,
}

pub struct TurnController {
    limit: Mutex<u32>,
    state: Mutex<HashMap<String, ChatTurnState>>,
}

/// Key used for traffic outside any chat.
fn chat_key(chat_id: Option<&str>) -> String {
    chat_id.unwrap_or("").to_string()
}

impl TurnController {
    pub fn new(limit: u32) -> Self {
        Self {
            limit: Mutex::new(limit),
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> u32 {
        *self.limit.lock().unwrap()
    }

    /// Follow a world-config update.
    pub fn set_limit(&self, limit: u32) {
        *self.limit.lock().unwrap() = limit;
    }

    /// Account for a published message.  Human (and system) messages reset
    /// the counter — unless they carry the pass directive, which arms the
    /// silence flag and leaves the counter untouched.  Agent messages
    /// increment it.
    pub fn observe(&self, chat_id: Option<&str>, sender_kind: SenderKind, content: &str) {
        let mut state = self.state.lock().unwrap();
        let entry = state.entry(chat_key(chat_id)).or_default();
        match sender_kind {
            SenderKind::Human | SenderKind::System => {
                if content.contains(PASS_DIRECTIVE) {
                    entry.passed = true;
                } else {
                    entry.count = 0;
                    entry.passed = false;
                }
            }
            SenderKind::Agent => {
                entry.count = entry.count.saturating_add(1);
            }
        }
    }

    /// Whether an agent may begin a turn in this chat.
    pub fn can_respond(&self, chat_id: Option<&str>) -> bool {
        let limit = self.limit();
        let state = self.state.lock().unwrap();
        let entry = state.get(&chat_key(chat_id)).copied().unwrap_or_default();
        !entry.passed && entry.count < limit
    }

    pub fn count(&self, chat_id: Option<&str>) -> u32 {
        let state = self.state.lock().unwrap();
        state.get(&chat_key(chat_id)).map(|s| s.count).unwrap_or(0)
    }

    /// Forget a chat's state (chat switch or delete).
    pub fn reset_chat(&self, chat_id: Option<&str>) {
        self.state.lock().unwrap().remove(&chat_key(chat_id));
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
