// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Anthropic driver — native Messages API with SSE streaming.
//!
//! # Endpoint
//! `POST {base_url}/v1/messages` with `x-api-key` and `anthropic-version`
//! headers.
//!
//! # Event mapping
//! - `content_block_start` (tool_use) → tool-call delta carrying id + name
//! - `content_block_delta` / `text_delta` → text delta
//! - `content_block_delta` / `input_json_delta` → tool-call argument delta
//! - `message_delta` (usage) → usage
//! - `message_stop` → done

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{provider::ResponseStream, ChatMessage, CompletionRequest, Role, StreamEvent, Usage};

pub struct AnthropicProvider {
    model: String,
    api_key: Option<String>,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: Option<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Self {
        Self {
            model,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl crate::ModelProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream_chat(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let key = self
            .api_key
            .as_deref()
            .context("ANTHROPIC_API_KEY not set")?;

        let (system_text, messages) = build_anthropic_messages(&req.messages);

        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "stream": req.stream,
        });
        if !system_text.is_empty() {
            body["system"] = json!(system_text);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        debug!(model = %self.model, tool_count = tools.len(), "sending anthropic request");

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .context("Anthropic request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Anthropic error {status}: {text}");
        }

        let byte_stream = resp.bytes_stream();
        // SSE lines can be split across TCP chunks, so we carry a remainder
        // buffer forward.  Only complete lines (terminated by '\n') are parsed;
        // anything left over is prepended to the next chunk.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let text = match chunk {
                    Ok(b) => String::from_utf8_lossy(&b).to_string(),
                    Err(e) => {
                        return std::future::ready(Some(vec![Err(anyhow::anyhow!(e))]));
                    }
                };
                buf.push_str(&text);
                let mut events = Vec::new();
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);
                    if let Some(data) = line.strip_prefix("data: ") {
                        let data = data.trim();
                        if let Ok(v) = serde_json::from_str::<Value>(data) {
                            if let Some(ev) = parse_anthropic_event(&v) {
                                events.push(Ok(ev));
                            }
                        }
                    }
                }
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Map one decoded Anthropic SSE event to a [`StreamEvent`].
///
/// Returns `None` for bookkeeping events (`message_start`, pings,
/// `content_block_stop`) that carry nothing the caller acts on.
pub(crate) fn parse_anthropic_event(v: &Value) -> Option<StreamEvent> {
    match v["type"].as_str().unwrap_or("") {
        "content_block_start" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let block = &v["content_block"];
            if block["type"].as_str() == Some("tool_use") {
                let id = block["id"].as_str().unwrap_or("").to_string();
                let name = block["name"].as_str().unwrap_or("").to_string();
                return Some(StreamEvent::ToolCallDelta {
                    index,
                    id,
                    name,
                    arguments: String::new(),
                });
            }
            None
        }
        "content_block_delta" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let delta = &v["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => {
                    let text = delta["text"].as_str().unwrap_or("").to_string();
                    Some(StreamEvent::TextDelta(text))
                }
                "input_json_delta" => {
                    let partial = delta["partial_json"].as_str().unwrap_or("").to_string();
                    Some(StreamEvent::ToolCallDelta {
                        index,
                        id: String::new(),
                        name: String::new(),
                        arguments: partial,
                    })
                }
                _ => None,
            }
        }
        "message_delta" => {
            let usage = &v["usage"];
            if usage.is_object() {
                return Some(StreamEvent::Usage(Usage {
                    input_tokens: usage["input_tokens"].as_u64().unwrap_or(0) as u32,
                    output_tokens: usage["output_tokens"].as_u64().unwrap_or(0) as u32,
                }));
            }
            None
        }
        "message_stop" => Some(StreamEvent::Done),
        "error" => {
            let msg = v["error"]["message"]
                .as_str()
                .unwrap_or("unknown provider error")
                .to_string();
            Some(StreamEvent::Error(msg))
        }
        _ => None,
    }
}

/// Split out the system text and convert the rest to Anthropic's message
/// shape.  Tool results become `tool_result` content blocks on user turns;
/// assistant tool calls become `tool_use` blocks.  Sender names are folded
/// into the text (the Messages API has no name field).
pub(crate) fn build_anthropic_messages(messages: &[ChatMessage]) -> (String, Vec<Value>) {
    let mut system_text = String::new();
    let mut out: Vec<Value> = Vec::new();

    for m in messages {
        match m.role {
            Role::System => {
                if !system_text.is_empty() {
                    system_text.push_str("\n\n");
                }
                system_text.push_str(&m.content);
            }
            Role::User => {
                let text = match &m.name {
                    Some(n) => format!("{n}: {}", m.content),
                    None => m.content.clone(),
                };
                out.push(json!({ "role": "user", "content": text }));
            }
            Role::Assistant => {
                if let Some(calls) = &m.tool_calls {
                    let mut blocks: Vec<Value> = Vec::new();
                    if !m.content.is_empty() {
                        blocks.push(json!({ "type": "text", "text": m.content }));
                    }
                    for c in calls {
                        let input: Value = serde_json::from_str(&c.function.arguments)
                            .unwrap_or_else(|_| json!({}));
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": c.id,
                            "name": c.function.name,
                            "input": input,
                        }));
                    }
                    out.push(json!({ "role": "assistant", "content": blocks }));
                } else {
                    out.push(json!({ "role": "assistant", "content": m.content }));
                }
            }
            Role::Tool => {
                let id = m.tool_call_id.clone().unwrap_or_default();
                out.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": id,
                        "content": m.content,
                    }]
                }));
            }
        }
    }

    (system_text, out)
}
