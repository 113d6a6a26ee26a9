// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end scenarios over the public crate APIs: real worlds on the file
//! back-end with the mock model provider (no network).

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use varld_config::Config;
use varld_core::{AgentParams, MessageEvent, WorldManager, HUMAN_SENDER};
use varld_store::{FileStorage, MessageRole, Storage};

const WAIT: Duration = Duration::from_secs(5);
const SETTLE: Duration = Duration::from_millis(300);

fn file_manager(root: &std::path::Path) -> WorldManager {
    let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(root));
    WorldManager::new(storage, Config::default())
}

async fn add_mock_agent(world: &varld_core::World, name: &str) {
    world
        .create_agent(AgentParams {
            name: name.to_string(),
            provider: Some("mock".into()),
            ..AgentParams::default()
        })
        .await
        .unwrap();
}

async fn collect_agent_messages(
    rx: &mut tokio::sync::broadcast::Receiver<MessageEvent>,
    n: usize,
) -> Vec<MessageEvent> {
    let mut out = Vec::new();
    while out.len() < n {
        match timeout(WAIT, rx.recv()).await {
            Ok(Ok(ev)) if ev.sender != HUMAN_SENDER => out.push(ev),
            Ok(Ok(_)) => {}
            _ => break,
        }
    }
    out
}

#[tokio::test]
async fn broadcast_round_trip_on_the_file_backend() {
    let dir = tempfile::tempdir().unwrap();
    let manager = file_manager(dir.path());

    let world = manager.create_world("Ops Room", "incident response").await.unwrap();
    for name in ["triage", "historian", "scribe"] {
        add_mock_agent(&world, name).await;
    }

    let mut rx = world.subscribe_messages();
    world.post_human("Hello team!").await.unwrap();

    let replies = collect_agent_messages(&mut rx, 3).await;
    assert_eq!(replies.len(), 3, "every agent answers a broadcast");
    for reply in &replies {
        assert!(reply.content.starts_with("MOCK:"), "mock provider echoes");
        assert!(reply.chat_id.is_some(), "replies carry the implicit chat");
    }

    // Let the memory writes land, then verify the on-disk tree.
    tokio::time::sleep(SETTLE).await;
    let world_dir = dir.path().join("ops-room");
    assert!(world_dir.join("config.json").is_file());
    assert!(world_dir.join("agents/triage/config.json").is_file());
    assert!(world_dir.join("agents/triage/system-prompt.md").is_file());
    assert!(world_dir.join("agents/triage/memory.json").is_file());
    let chats: Vec<_> = std::fs::read_dir(world_dir.join("chats"))
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(chats.len(), 1, "the implicit chat was persisted");
}

#[tokio::test]
async fn world_survives_a_process_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let manager = file_manager(dir.path());
        let world = manager.create_world("Persistent", "").await.unwrap();
        add_mock_agent(&world, "keeper").await;
        let mut rx = world.subscribe_messages();
        world.post_human("@keeper remember this").await.unwrap();
        let replies = collect_agent_messages(&mut rx, 1).await;
        assert_eq!(replies.len(), 1);
        tokio::time::sleep(SETTLE).await;
    }

    // A new manager over the same tree plays the part of a restarted
    // process.
    let manager = file_manager(dir.path());
    let world = manager.get_world("persistent").await.unwrap();
    let keeper = world.get_agent("keeper").await.expect("agent reloaded");
    assert!(
        keeper
            .memory
            .iter()
            .any(|e| e.role == MessageRole::User && e.content.contains("remember this")),
        "memory survived the reload"
    );
    assert!(
        keeper
            .memory
            .iter()
            .any(|e| e.role == MessageRole::Assistant),
        "the reply survived the reload"
    );
    assert_eq!(keeper.config.llm_call_count, 1);
}

#[tokio::test]
async fn only_the_first_mentioned_agent_answers() {
    let dir = tempfile::tempdir().unwrap();
    let manager = file_manager(dir.path());
    let world = manager.create_world("Routing", "").await.unwrap();
    for name in ["alpha", "beta"] {
        add_mock_agent(&world, name).await;
    }

    let mut rx = world.subscribe_messages();
    world.post_human("@alpha take this; @beta stay put").await.unwrap();
    let replies = collect_agent_messages(&mut rx, 1).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].sender, "alpha");

    // Nothing further within the settle window.
    match timeout(SETTLE, rx.recv()).await {
        Ok(Ok(ev)) => assert_eq!(ev.sender, HUMAN_SENDER, "unexpected reply from {}", ev.sender),
        _ => {}
    }
}

#[tokio::test]
async fn exported_snapshot_contains_the_conversation() {
    let dir = tempfile::tempdir().unwrap();
    let manager = file_manager(dir.path());
    let world = manager.create_world("Archive", "").await.unwrap();
    add_mock_agent(&world, "echo").await;

    let mut rx = world.subscribe_messages();
    world.post_human("for the record").await.unwrap();
    let replies = collect_agent_messages(&mut rx, 1).await;
    assert_eq!(replies.len(), 1);
    tokio::time::sleep(SETTLE).await;

    let chat_id = world.active_chat().unwrap();
    let snapshot = world.create_world_chat(&chat_id).await.unwrap();
    assert_eq!(snapshot.world.id, "archive");
    assert_eq!(snapshot.agents.len(), 1);
    assert_eq!(snapshot.metadata.total_messages, 2, "human message + reply");
    assert!(snapshot
        .messages
        .iter()
        .any(|m| m.content == "for the record"));

    // The snapshot is also attached to the chat file for later loading.
    let reloaded = world.load_world_chat(&chat_id).await.unwrap().unwrap();
    assert_eq!(reloaded.metadata.total_messages, 2);
}
