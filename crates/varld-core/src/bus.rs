// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Per-world event bus: three broadcast topics with no cross-world leakage.
//!
//! Publishing is non-blocking; each subscriber owns a receiver and drains it
//! at its own pace.  A lagging `sse` subscriber may lose chunk frames
//! (broadcast lag drops the oldest events first); the `message` topic is
//! sized so that drops do not occur at realistic message rates, and the
//! runtime always emits `end`/`error` as the last frames of a stream so a
//! lagged subscriber resynchronises on them.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::events::{MessageEvent, SseEvent, SystemEvent};

/// Capacity of the `message` topic.  Messages must never be dropped, so this
/// is far above any realistic burst.
pub const MESSAGE_TOPIC_CAPACITY: usize = 1024;
/// Capacity of the `sse` topic.  Chunk frames are best-effort.
pub const SSE_TOPIC_CAPACITY: usize = 256;
/// Capacity of the `system` topic.
pub const SYSTEM_TOPIC_CAPACITY: usize = 64;

/// One bus per world.  Cheap to share as `Arc<WorldBus>`.
pub struct WorldBus {
    message_tx: broadcast::Sender<MessageEvent>,
    sse_tx: broadcast::Sender<SseEvent>,
    system_tx: broadcast::Sender<SystemEvent>,
}

impl WorldBus {
    pub fn new() -> Self {
        let (message_tx, _) = broadcast::channel(MESSAGE_TOPIC_CAPACITY);
        let (sse_tx, _) = broadcast::channel(SSE_TOPIC_CAPACITY);
        let (system_tx, _) = broadcast::channel(SYSTEM_TOPIC_CAPACITY);
        Self {
            message_tx,
            sse_tx,
            system_tx,
        }
    }

    /// Publish to the `message` topic.  Returns the number of subscribers
    /// that will observe the event; publishing to an empty topic is not an
    /// error.
    pub fn publish_message(&self, ev: MessageEvent) -> usize {
        self.message_tx.send(ev).unwrap_or(0)
    }

    pub fn publish_sse(&self, ev: SseEvent) -> usize {
        self.sse_tx.send(ev).unwrap_or(0)
    }

    pub fn publish_system(&self, ev: SystemEvent) -> usize {
        self.system_tx.send(ev).unwrap_or(0)
    }

    /// Subscribe to the `message` topic.  Dropping the receiver unsubscribes;
    /// dropping it twice is naturally idempotent.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<MessageEvent> {
        self.message_tx.subscribe()
    }

    pub fn subscribe_sse(&self) -> broadcast::Receiver<SseEvent> {
        self.sse_tx.subscribe()
    }

    pub fn subscribe_system(&self) -> broadcast::Receiver<SystemEvent> {
        self.system_tx.subscribe()
    }

    pub fn message_subscriber_count(&self) -> usize {
        self.message_tx.receiver_count()
    }
}

impl Default for WorldBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide `worldId → bus` map.
///
/// Owned by the world manager; nothing outside it may mutate the map.
/// Buses are created lazily on first use and dropped on world delete, which
/// closes every topic and ends all subscriber loops.
pub struct BusRegistry {
    inner: Mutex<HashMap<String, std::sync::Arc<WorldBus>>>,
}

impl BusRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, world_id: &str) -> std::sync::Arc<WorldBus> {
        let mut map = self.inner.lock().unwrap();
        map.entry(world_id.to_string())
            .or_insert_with(|| std::sync::Arc::new(WorldBus::new()))
            .clone()
    }

    pub fn get(&self, world_id: &str) -> Option<std::sync::Arc<WorldBus>> {
        self.inner.lock().unwrap().get(world_id).cloned()
    }

    /// Drop the world's bus.  Existing receivers observe `Closed` on their
    /// next `recv` once all senders are gone.
    pub fn remove(&self, world_id: &str) -> Option<std::sync::Arc<WorldBus>> {
        self.inner.lock().unwrap().remove(world_id)
    }

    pub fn contains(&self, world_id: &str) -> bool {
        self.inner.lock().unwrap().contains_key(world_id)
    }
}

impl Default for BusRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_message() {
        let bus = WorldBus::new();
        let mut rx = bus.subscribe_messages();
        bus.publish_message(MessageEvent::human("hi", None));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.content, "hi");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let bus = WorldBus::new();
        assert_eq!(bus.publish_message(MessageEvent::human("hi", None)), 0);
    }

    #[tokio::test]
    async fn per_topic_fifo_order_is_preserved() {
        let bus = WorldBus::new();
        let mut rx = bus.subscribe_messages();
        for i in 0..10 {
            bus.publish_message(MessageEvent::human(format!("m{i}"), None));
        }
        for i in 0..10 {
            assert_eq!(rx.recv().await.unwrap().content, format!("m{i}"));
        }
    }

    #[tokio::test]
    async fn every_subscriber_gets_every_message() {
        let bus = WorldBus::new();
        let mut a = bus.subscribe_messages();
        let mut b = bus.subscribe_messages();
        bus.publish_message(MessageEvent::human("x", None));
        assert_eq!(a.recv().await.unwrap().content, "x");
        assert_eq!(b.recv().await.unwrap().content, "x");
    }

    #[tokio::test]
    async fn no_cross_world_leakage_between_buses() {
        let reg = BusRegistry::new();
        let bus_a = reg.get_or_create("world-a");
        let bus_b = reg.get_or_create("world-b");
        let mut rx_b = bus_b.subscribe_messages();
        bus_a.publish_message(MessageEvent::human("only for a", None));
        // B's receiver must see nothing.
        assert!(matches!(
            rx_b.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn registry_returns_same_bus_for_same_world() {
        let reg = BusRegistry::new();
        let a1 = reg.get_or_create("w");
        let a2 = reg.get_or_create("w");
        assert!(std::sync::Arc::ptr_eq(&a1, &a2));
    }

    #[tokio::test]
    async fn removed_bus_closes_for_subscribers() {
        let reg = BusRegistry::new();
        let bus = reg.get_or_create("w");
        let mut rx = bus.subscribe_messages();
        drop(bus);
        reg.remove("w");
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Closed)
        ));
    }
}
