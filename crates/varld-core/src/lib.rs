// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
mod agent;
mod approval;
mod bus;
mod chat;
mod error;
mod events;
mod mention;
mod turns;
pub mod wire;
mod world;
#[cfg(test)]
mod tests;

pub use agent::AgentRuntime;
pub use approval::{
    canonical_json, ApprovalDecision, ApprovalEngine, ApprovalScope, APPROVAL_OPTIONS,
    APPROVAL_TOOL_NAME,
};
pub use bus::{BusRegistry, WorldBus};
pub use chat::{memory_view_for_agent, merge_chat_messages, ChatManager};
pub use error::{Result, WorldError};
pub use events::{MessageEvent, SseEvent, SsePhase, SystemEvent, HUMAN_SENDER};
pub use mention::{extract_mentions, first_mention, should_respond, Mention, SenderKind};
pub use turns::{TurnController, PASS_DIRECTIVE};
pub use world::{
    AgentParams, DefaultProviderFactory, ProviderFactory, World, WorldContext, WorldManager,
};
