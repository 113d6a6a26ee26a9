// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Runtime tests over the in-memory back-end and scripted mock providers.
//! No network, no disk, no real models.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::timeout;

use varld_config::{Config, ProviderConfig, StorageBackend};
use varld_model::{MockProvider, ModelProvider, ScriptedMockProvider, StreamEvent};
use varld_store::{MemoryStorage, MessageRole, Storage};

use crate::events::MessageEvent;
use crate::world::{AgentParams, ProviderFactory, World, WorldManager};
use crate::{wire, WorldError, APPROVAL_TOOL_NAME, PASS_DIRECTIVE};

const WAIT: Duration = Duration::from_secs(5);
const SETTLE: Duration = Duration::from_millis(300);

// ─── Harness ─────────────────────────────────────────────────────────────────

fn text_script(text: &str) -> Vec<StreamEvent> {
    vec![StreamEvent::TextDelta(text.into()), StreamEvent::Done]
}

fn tool_script(id: &str, name: &str, args: &str) -> Vec<StreamEvent> {
    vec![
        StreamEvent::ToolCallDelta {
            index: 0,
            id: id.into(),
            name: name.into(),
            arguments: args.into(),
        },
        StreamEvent::Done,
    ]
}

/// Provider factory handing each agent (keyed by its configured model name)
/// a pre-scripted provider; agents without a script echo via the mock.
struct ScriptedFactory {
    scripts: Mutex<HashMap<String, Vec<Vec<StreamEvent>>>>,
}

impl ScriptedFactory {
    fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
        }
    }

    fn with_script(self, model: &str, scripts: Vec<Vec<StreamEvent>>) -> Self {
        self.scripts.lock().unwrap().insert(model.into(), scripts);
        self
    }
}

impl ProviderFactory for ScriptedFactory {
    fn make(&self, cfg: &ProviderConfig) -> anyhow::Result<Arc<dyn ModelProvider>> {
        match self.scripts.lock().unwrap().remove(&cfg.model) {
            Some(scripts) => Ok(Arc::new(ScriptedMockProvider::new(scripts))),
            None => Ok(Arc::new(MockProvider)),
        }
    }
}

fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.storage.backend = StorageBackend::Memory;
    cfg
}

async fn world_with_agents(
    factory: ScriptedFactory,
    agent_names: &[&str],
) -> (WorldManager, Arc<World>) {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let manager = WorldManager::with_provider_factory(storage, test_config(), Arc::new(factory));
    let world = manager.create_world("Test World", "runtime tests").await.unwrap();
    for name in agent_names {
        world
            .create_agent(AgentParams {
                name: name.to_string(),
                provider: Some("mock".into()),
                // The model name doubles as the script key in the factory.
                model: Some(name.to_string()),
                ..AgentParams::default()
            })
            .await
            .unwrap();
    }
    (manager, world)
}

fn is_agent_chat_message(ev: &MessageEvent) -> bool {
    let is_approval = ev
        .tool_calls
        .as_ref()
        .map(|tcs| tcs.iter().any(|t| t.name == APPROVAL_TOOL_NAME))
        .unwrap_or(false);
    ev.sender != crate::HUMAN_SENDER && !is_approval
}

/// Collect up to `n` agent-authored chat messages (approval frames and the
/// human's own messages excluded).
async fn collect_agent_messages(
    rx: &mut tokio::sync::broadcast::Receiver<MessageEvent>,
    n: usize,
) -> Vec<MessageEvent> {
    let mut out = Vec::new();
    while out.len() < n {
        match timeout(WAIT, rx.recv()).await {
            Ok(Ok(ev)) => {
                if is_agent_chat_message(&ev) {
                    out.push(ev);
                }
            }
            _ => break,
        }
    }
    out
}

/// Assert that no further agent chat message arrives within the settle
/// window.
async fn assert_silence(rx: &mut tokio::sync::broadcast::Receiver<MessageEvent>) {
    let deadline = tokio::time::Instant::now() + SETTLE;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return;
        }
        match timeout(remaining, rx.recv()).await {
            Ok(Ok(ev)) => {
                assert!(
                    !is_agent_chat_message(&ev),
                    "unexpected agent message: {} from {}",
                    ev.content,
                    ev.sender
                );
            }
            _ => return,
        }
    }
}

/// Poll until an agent's persisted memory satisfies `pred`.
async fn wait_for_memory(
    world: &World,
    agent_id: &str,
    pred: impl Fn(&varld_store::AgentRecord) -> bool,
) -> varld_store::AgentRecord {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Some(record) = world.get_agent(agent_id).await {
            if pred(&record) {
                return record;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "memory condition not reached for '{agent_id}'"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ─── Broadcast & mentions ────────────────────────────────────────────────────

#[tokio::test]
async fn broadcast_draws_a_reply_from_every_agent() {
    let (_m, world) = world_with_agents(ScriptedFactory::new(), &["a1", "a2", "a3"]).await;
    let mut rx = world.subscribe_messages();
    world.post_human("Hello team!").await.unwrap();

    let replies = collect_agent_messages(&mut rx, 3).await;
    assert_eq!(replies.len(), 3, "every agent replies to a broadcast");
    let mut senders: Vec<String> = replies.iter().map(|r| r.sender.clone()).collect();
    senders.sort();
    assert_eq!(senders, vec!["a1", "a2", "a3"]);
}

#[tokio::test]
async fn direct_mention_draws_exactly_one_reply() {
    let (_m, world) = world_with_agents(ScriptedFactory::new(), &["a1", "a2", "a3"]).await;
    let mut rx = world.subscribe_messages();
    let human = world.post_human("@a1 Please summarize.").await.unwrap();

    let replies = collect_agent_messages(&mut rx, 1).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].sender, "a1");
    assert_eq!(
        replies[0].reply_to_message_id.as_deref(),
        Some(human.message_id.as_str())
    );
    assert_silence(&mut rx).await;

    // The unmentioned agents keep the human message in passive memory with
    // no assistant reply of their own.
    for other in ["a2", "a3"] {
        let record = wait_for_memory(&world, other, |r| {
            r.memory
                .iter()
                .any(|e| e.message_id.as_deref() == Some(human.message_id.as_str()))
        })
        .await;
        assert!(
            record.memory.iter().all(|e| e.role != MessageRole::Assistant),
            "{other} must not have replied"
        );
    }
}

#[tokio::test]
async fn paragraph_leading_mention_draws_one_reply() {
    let (_m, world) = world_with_agents(ScriptedFactory::new(), &["a1", "a2"]).await;
    let mut rx = world.subscribe_messages();
    world
        .post_human("Here is an update.\n@a2 Please react.")
        .await
        .unwrap();

    let replies = collect_agent_messages(&mut rx, 1).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].sender, "a2");
    assert_silence(&mut rx).await;
}

#[tokio::test]
async fn mid_text_mention_draws_no_replies_but_is_remembered() {
    let (_m, world) = world_with_agents(ScriptedFactory::new(), &["a1", "a2", "a3"]).await;
    let mut rx = world.subscribe_messages();
    let human = world
        .post_human("Great work - let's loop in @a3 later.")
        .await
        .unwrap();

    assert_silence(&mut rx).await;
    for agent in ["a1", "a2", "a3"] {
        wait_for_memory(&world, agent, |r| {
            r.memory
                .iter()
                .any(|e| e.message_id.as_deref() == Some(human.message_id.as_str()))
        })
        .await;
    }
}

// ─── Turn limiting ───────────────────────────────────────────────────────────

#[tokio::test]
async fn pass_directive_silences_the_world() {
    let (_m, world) = world_with_agents(ScriptedFactory::new(), &["a1", "a2"]).await;
    let mut rx = world.subscribe_messages();
    world.post_human(PASS_DIRECTIVE).await.unwrap();
    assert_silence(&mut rx).await;

    // The next ordinary human message wakes everyone up again.
    world.post_human("back to work").await.unwrap();
    let replies = collect_agent_messages(&mut rx, 2).await;
    assert_eq!(replies.len(), 2);
}

#[tokio::test]
async fn mention_chain_stops_at_the_turn_limit() {
    // a1 and a2 ping-pong mentions; with a limit of 5 exactly five agent
    // messages appear, then silence.
    let factory = ScriptedFactory::new()
        .with_script(
            "a1",
            vec![
                text_script("@a2 ping"),
                text_script("@a2 ping"),
                text_script("@a2 ping"),
                text_script("@a2 ping"),
            ],
        )
        .with_script(
            "a2",
            vec![
                text_script("@a1 pong"),
                text_script("@a1 pong"),
                text_script("@a1 pong"),
                text_script("@a1 pong"),
            ],
        );
    let (_m, world) = world_with_agents(factory, &["a1", "a2"]).await;
    let mut rx = world.subscribe_messages();
    world.post_human("@a1 keep talking").await.unwrap();

    let replies = collect_agent_messages(&mut rx, 5).await;
    assert_eq!(replies.len(), 5, "turn limit caps the chain");
    assert_silence(&mut rx).await;
}

// ─── Tool approval ───────────────────────────────────────────────────────────

/// Wait for the next approval-request frame and return its tool-call id.
async fn next_approval_request(
    rx: &mut tokio::sync::broadcast::Receiver<MessageEvent>,
) -> Option<String> {
    loop {
        match timeout(WAIT, rx.recv()).await {
            Ok(Ok(ev)) => {
                if let Some(tcs) = &ev.tool_calls {
                    if let Some(tc) = tcs.iter().find(|t| t.name == APPROVAL_TOOL_NAME) {
                        return Some(tc.id.clone());
                    }
                }
            }
            _ => return None,
        }
    }
}

#[tokio::test]
async fn approve_once_executes_but_asks_again() {
    let factory = ScriptedFactory::new().with_script(
        "a1",
        vec![
            tool_script("call-1", "shell_cmd", r#"{"cmd":"echo approved-run"}"#),
            text_script("first done"),
            tool_script("call-2", "shell_cmd", r#"{"cmd":"echo approved-run"}"#),
            text_script("second done"),
        ],
    );
    let (_m, world) = world_with_agents(factory, &["a1"]).await;
    let mut rx = world.subscribe_messages();

    world.post_human("@a1 run it").await.unwrap();
    let tc1 = next_approval_request(&mut rx).await.expect("first approval request");
    assert_eq!(tc1, "call-1");

    let envelope = wire::approval_response_envelope(
        &tc1,
        "a1",
        "approve_once",
        None,
        "shell_cmd",
        &serde_json::json!({"cmd":"echo approved-run"}),
        None,
    );
    world.post_inbound(&envelope).await.unwrap();

    let replies = collect_agent_messages(&mut rx, 1).await;
    assert_eq!(replies[0].content, "first done");

    // The tool result made it into memory.
    let record = wait_for_memory(&world, "a1", |r| {
        r.memory.iter().any(|e| e.role == MessageRole::Tool)
    })
    .await;
    assert!(record
        .memory
        .iter()
        .any(|e| e.role == MessageRole::Tool && e.content.contains("approved-run")));

    // A second identical call asks again: once-grants are not cached.
    world.post_human("@a1 run it again").await.unwrap();
    let tc2 = next_approval_request(&mut rx).await.expect("second approval request");
    assert_eq!(tc2, "call-2");
    let envelope = wire::approval_response_envelope(
        &tc2,
        "a1",
        "deny",
        None,
        "shell_cmd",
        &serde_json::json!({"cmd":"echo approved-run"}),
        None,
    );
    world.post_inbound(&envelope).await.unwrap();
    let replies = collect_agent_messages(&mut rx, 1).await;
    assert_eq!(replies[0].content, "second done");

    // The denial was synthesized into memory so the agent could react.
    let record = world.get_agent("a1").await.unwrap();
    assert!(record
        .memory
        .iter()
        .any(|e| e.role == MessageRole::Tool && e.content.contains("denied")));
}

#[tokio::test]
async fn approve_session_caches_the_grant_for_the_chat() {
    let factory = ScriptedFactory::new().with_script(
        "a1",
        vec![
            tool_script("call-1", "shell_cmd", r#"{"cmd":"echo cached-run"}"#),
            text_script("first done"),
            tool_script("call-2", "shell_cmd", r#"{"cmd":"echo cached-run"}"#),
            text_script("second done"),
        ],
    );
    let (_m, world) = world_with_agents(factory, &["a1"]).await;
    let mut rx = world.subscribe_messages();

    world.post_human("@a1 run it").await.unwrap();
    let tc1 = next_approval_request(&mut rx).await.expect("approval request");
    let envelope = wire::approval_response_envelope(
        &tc1,
        "a1",
        "approve_session",
        None,
        "shell_cmd",
        &serde_json::json!({"cmd":"echo cached-run"}),
        None,
    );
    world.post_inbound(&envelope).await.unwrap();
    let replies = collect_agent_messages(&mut rx, 1).await;
    assert_eq!(replies[0].content, "first done");

    // Second identical call: no approval frame may appear before the reply.
    world.post_human("@a1 once more").await.unwrap();
    let mut saw_approval = false;
    let reply = loop {
        match timeout(WAIT, rx.recv()).await {
            Ok(Ok(ev)) => {
                if ev
                    .tool_calls
                    .as_ref()
                    .map(|tcs| tcs.iter().any(|t| t.name == APPROVAL_TOOL_NAME))
                    .unwrap_or(false)
                {
                    saw_approval = true;
                }
                if is_agent_chat_message(&ev) {
                    break ev;
                }
            }
            other => panic!("no reply arrived: {other:?}"),
        }
    };
    assert!(!saw_approval, "session grant must bypass the approval request");
    assert_eq!(reply.content, "second done");
}

// ─── Isolation & lifecycle ───────────────────────────────────────────────────

#[tokio::test]
async fn events_never_cross_world_boundaries() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let manager =
        WorldManager::with_provider_factory(storage, test_config(), Arc::new(ScriptedFactory::new()));
    let world_a = manager.create_world("World A", "").await.unwrap();
    let world_b = manager.create_world("World B", "").await.unwrap();

    let mut rx_b = world_b.subscribe_messages();
    world_a.post_human("only for A").await.unwrap();
    tokio::time::sleep(SETTLE).await;
    assert!(
        matches!(rx_b.try_recv(), Err(tokio::sync::broadcast::error::TryRecvError::Empty)),
        "world B observed world A traffic"
    );
}

#[tokio::test]
async fn duplicate_world_create_is_a_conflict() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let manager = WorldManager::new(storage, test_config());
    manager.create_world("Same Name", "").await.unwrap();
    let err = manager.create_world("Same Name", "").await.unwrap_err();
    assert!(matches!(err, WorldError::Conflict(_)));
}

#[tokio::test]
async fn deleted_world_is_gone_and_not_found() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let manager = WorldManager::new(Arc::clone(&storage), test_config());
    let world = manager.create_world("Doomed", "").await.unwrap();
    let id = world.id();
    manager.delete_world(&id).await.unwrap();
    assert!(matches!(
        manager.get_world(&id).await,
        Err(WorldError::NotFound(_))
    ));
    assert!(!storage.world_exists(&id).await.unwrap());
}

#[tokio::test]
async fn world_reloads_from_storage_with_its_agents() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    {
        let manager = WorldManager::with_provider_factory(
            Arc::clone(&storage),
            test_config(),
            Arc::new(ScriptedFactory::new()),
        );
        let world = manager.create_world("Persistent", "").await.unwrap();
        world
            .create_agent(AgentParams {
                name: "scout".into(),
                provider: Some("mock".into()),
                model: Some("scout".into()),
                ..AgentParams::default()
            })
            .await
            .unwrap();
    }
    // A fresh manager over the same storage sees the world and its agent.
    let manager = WorldManager::with_provider_factory(
        storage,
        test_config(),
        Arc::new(ScriptedFactory::new()),
    );
    let world = manager.get_world("persistent").await.unwrap();
    let agents = world.list_agents().await;
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].config.id, "scout");
}

// ─── Chat auto-save & dedup ──────────────────────────────────────────────────

#[tokio::test]
async fn chat_stream_stores_each_human_message_once() {
    let (_m, world) = world_with_agents(ScriptedFactory::new(), &["a1", "a2", "a3"]).await;
    let mut rx = world.subscribe_messages();
    world.post_human("Hello team!").await.unwrap();
    let _ = collect_agent_messages(&mut rx, 3).await;
    tokio::time::sleep(SETTLE).await;

    let chat_id = world.active_chat().unwrap();
    let chat = world
        .context()
        .storage
        .load_chat(&world.id(), &chat_id)
        .await
        .unwrap()
        .unwrap();
    let human_entries = chat
        .messages
        .iter()
        .filter(|m| m.sender.as_deref() == Some(crate::HUMAN_SENDER))
        .count();
    assert_eq!(human_entries, 1, "one entry per human message id");
    // One reply per agent on top of the human message.
    assert_eq!(chat.message_count, 4);
}

// ─── Snapshot / restore ──────────────────────────────────────────────────────

#[tokio::test]
async fn restore_of_a_fresh_snapshot_is_idempotent() {
    let (_m, world) = world_with_agents(ScriptedFactory::new(), &["a1", "a2"]).await;
    let mut rx = world.subscribe_messages();
    world.post_human("Hello team!").await.unwrap();
    let _ = collect_agent_messages(&mut rx, 2).await;
    tokio::time::sleep(SETTLE).await;

    let chat_id = world.active_chat().unwrap();

    let normalize = |mut agents: Vec<varld_store::AgentRecord>| -> serde_json::Value {
        agents.sort_by(|a, b| a.config.id.cmp(&b.config.id));
        for a in &mut agents {
            a.memory.retain(|m| m.chat_id.as_deref() == Some(chat_id.as_str()));
            a.memory.sort_by(|x, y| {
                (x.created_at, x.message_id.clone()).cmp(&(y.created_at, y.message_id.clone()))
            });
        }
        serde_json::to_value(&agents).unwrap()
    };

    let before = normalize(world.list_agents().await);
    let snapshot = world.create_world_chat(&chat_id).await.unwrap();
    world.restore_from_world_chat(&snapshot).await.unwrap();
    let after = normalize(world.list_agents().await);

    assert_eq!(before, after, "restore(snapshot(W)) must leave W unchanged");
}

#[tokio::test]
async fn restore_drops_agents_absent_from_the_snapshot() {
    let (_m, world) = world_with_agents(ScriptedFactory::new(), &["a1", "a2"]).await;
    let mut rx = world.subscribe_messages();
    world.post_human("hi").await.unwrap();
    let _ = collect_agent_messages(&mut rx, 2).await;
    tokio::time::sleep(SETTLE).await;

    let chat_id = world.active_chat().unwrap();
    let snapshot = world.create_world_chat(&chat_id).await.unwrap();

    // A latecomer that the snapshot does not know about.
    world
        .create_agent(AgentParams {
            name: "late".into(),
            provider: Some("mock".into()),
            ..AgentParams::default()
        })
        .await
        .unwrap();
    assert_eq!(world.list_agents().await.len(), 3);

    world.restore_from_world_chat(&snapshot).await.unwrap();
    let ids: Vec<String> = world
        .list_agents()
        .await
        .into_iter()
        .map(|a| a.config.id)
        .collect();
    assert_eq!(ids, vec!["a1", "a2"]);
}

// ─── Chat switching ──────────────────────────────────────────────────────────

#[tokio::test]
async fn chat_switch_moves_the_active_pointer() {
    let (_m, world) = world_with_agents(ScriptedFactory::new(), &[]).await;
    let first = world.create_chat("first", "").await.unwrap();
    let second = world.create_chat("second", "").await.unwrap();
    assert_eq!(world.active_chat().as_deref(), Some(second.id.as_str()));

    world.set_chat(&first.id).await.unwrap();
    assert_eq!(world.active_chat().as_deref(), Some(first.id.as_str()));
    let cfg = world.config().await;
    assert_eq!(cfg.current_chat_id.as_deref(), Some(first.id.as_str()));
}

#[tokio::test]
async fn deleting_the_active_chat_clears_the_pointer() {
    let (_m, world) = world_with_agents(ScriptedFactory::new(), &[]).await;
    let chat = world.create_chat("only", "").await.unwrap();
    assert!(world.delete_chat(&chat.id).await.unwrap());
    assert!(world.active_chat().is_none());
    assert!(world.config().await.current_chat_id.is_none());
}
