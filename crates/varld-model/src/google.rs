// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Google Gemini driver — native Generative Language API.
//!
//! Uses the `streamGenerateContent` endpoint with `?alt=sse`.
//!
//! # Auth
//! API key via the `x-goog-api-key` header.
//!
//! # Endpoint pattern
//! `POST {base_url}/v1beta/models/{model}:streamGenerateContent?alt=sse`
//!
//! Gemini emits complete `functionCall` parts rather than argument deltas,
//! and matches function responses to calls by *name*, not id.  The driver
//! synthesizes stable ids so downstream accumulation works the same way as
//! for the other providers.

use std::collections::HashMap;

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{provider::ResponseStream, ChatMessage, CompletionRequest, Role, StreamEvent, Usage};

pub struct GoogleProvider {
    model: String,
    api_key: Option<String>,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl GoogleProvider {
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
            base_url: base_url
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".into()),
            max_tokens: max_tokens.unwrap_or(8192),
            temperature: temperature.unwrap_or(0.2),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl crate::ModelProvider for GoogleProvider {
    fn name(&self) -> &str {
        "google"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream_chat(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let key = self.api_key.as_deref().context("GEMINI_API_KEY not set")?;

        // Map tool_call_id → function name so functionResponse parts can use
        // the name Gemini matches on.
        let mut tc_name_map: HashMap<String, String> = HashMap::new();
        for m in &req.messages {
            if let Some(calls) = &m.tool_calls {
                for c in calls {
                    tc_name_map.insert(c.id.clone(), c.function.name.clone());
                }
            }
        }

        let mut system_parts: Vec<Value> = Vec::new();
        let mut contents: Vec<Value> = Vec::new();

        for m in &req.messages {
            match m.role {
                Role::System => {
                    system_parts.push(json!({ "text": m.content }));
                }
                Role::User => {
                    let text = match &m.name {
                        Some(n) => format!("{n}: {}", m.content),
                        None => m.content.clone(),
                    };
                    contents.push(json!({ "role": "user", "parts": [{ "text": text }] }));
                }
                Role::Assistant => {
                    let mut parts: Vec<Value> = Vec::new();
                    if !m.content.is_empty() {
                        parts.push(json!({ "text": m.content }));
                    }
                    if let Some(calls) = &m.tool_calls {
                        for c in calls {
                            let args: Value = serde_json::from_str(&c.function.arguments)
                                .unwrap_or_else(|_| json!({}));
                            parts.push(json!({
                                "functionCall": { "name": c.function.name, "args": args }
                            }));
                        }
                    }
                    if parts.is_empty() {
                        parts.push(json!({ "text": "" }));
                    }
                    contents.push(json!({ "role": "model", "parts": parts }));
                }
                Role::Tool => {
                    let id = m.tool_call_id.clone().unwrap_or_default();
                    let name = tc_name_map.get(&id).cloned().unwrap_or_else(|| id.clone());
                    contents.push(json!({
                        "role": "user",
                        "parts": [{
                            "functionResponse": {
                                "name": name,
                                "response": { "content": m.content },
                            }
                        }]
                    }));
                }
            }
        }

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "maxOutputTokens": self.max_tokens,
                "temperature": self.temperature,
            },
        });
        if !system_parts.is_empty() {
            body["systemInstruction"] = json!({ "parts": system_parts });
        }
        if !req.tools.is_empty() {
            let function_declarations: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!([{ "functionDeclarations": function_declarations }]);
        }

        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url.trim_end_matches('/'),
            self.model
        );

        debug!(model = %self.model, "sending gemini request");

        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", key)
            .json(&body)
            .send()
            .await
            .context("Gemini request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Gemini error {status}: {text}");
        }

        let byte_stream = resp.bytes_stream();
        // `scan` state: (line buffer, synthetic tool-call counter, done seen).
        // Gemini has no [DONE] sentinel; the final chunk carries a finishReason
        // and usageMetadata, after which the body just ends.  We emit Done when
        // the byte stream is exhausted.
        let event_stream = byte_stream
            .scan((String::new(), 0u32), |(buf, tc_counter), chunk| {
                let events: Vec<anyhow::Result<StreamEvent>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        let mut out = Vec::new();
                        while let Some(pos) = buf.find('\n') {
                            let line = buf[..pos].trim_end_matches('\r').to_string();
                            buf.drain(..=pos);
                            if let Some(data) = line.strip_prefix("data: ") {
                                if let Ok(v) = serde_json::from_str::<Value>(data.trim()) {
                                    out.extend(parse_gemini_chunk(&v, tc_counter).into_iter().map(Ok));
                                }
                            }
                        }
                        out
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter)
            .chain(futures::stream::iter(vec![Ok(StreamEvent::Done)]));

        Ok(Box::pin(event_stream))
    }
}

/// Parse one decoded Gemini SSE chunk into zero or more [`StreamEvent`]s.
///
/// `tc_counter` feeds the synthetic tool-call ids (`gm_call_<n>`); Gemini
/// does not assign ids itself.
pub(crate) fn parse_gemini_chunk(v: &Value, tc_counter: &mut u32) -> Vec<StreamEvent> {
    let mut events = Vec::new();

    if let Some(parts) = v["candidates"][0]["content"]["parts"].as_array() {
        for part in parts {
            if let Some(text) = part["text"].as_str() {
                if !text.is_empty() {
                    events.push(StreamEvent::TextDelta(text.to_string()));
                }
            }
            if let Some(fc) = part.get("functionCall") {
                let name = fc["name"].as_str().unwrap_or("").to_string();
                let args = fc
                    .get("args")
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "{}".to_string());
                let index = *tc_counter;
                *tc_counter += 1;
                events.push(StreamEvent::ToolCallDelta {
                    index,
                    id: format!("gm_call_{index}"),
                    name,
                    arguments: args,
                });
            }
        }
    }

    if let Some(usage) = v.get("usageMetadata").filter(|u| u.is_object()) {
        let input = usage["promptTokenCount"].as_u64().unwrap_or(0) as u32;
        let output = usage["candidatesTokenCount"].as_u64().unwrap_or(0) as u32;
        if input > 0 || output > 0 {
            events.push(StreamEvent::Usage(Usage {
                input_tokens: input,
                output_tokens: output,
            }));
        }
    }

    events
}
