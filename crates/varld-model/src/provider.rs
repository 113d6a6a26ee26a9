// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::{CompletionRequest, StreamEvent};

pub type ResponseStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamEvent>> + Send>>;

/// Streaming chat abstraction over a single provider/model pair.
///
/// Implementations are stateless between calls: everything a completion
/// needs travels in the [`CompletionRequest`].  The returned stream yields
/// [`StreamEvent`]s and guarantees that `Done` or `Error` is the final item.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider id for status display (matches the registry id).
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Send a completion request and return a streaming response.
    async fn stream_chat(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream>;
}

impl std::fmt::Debug for dyn ModelProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelProvider")
            .field("name", &self.name())
            .field("model_name", &self.model_name())
            .finish()
    }
}
