// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Shared base implementation for OpenAI-compatible chat completion APIs.
//!
//! Five of the recognised providers speak the same `/chat/completions` SSE
//! wire format: OpenAI itself, Azure OpenAI, Ollama, xAI, and OpenRouter.
//! This module provides a single `OpenAICompatProvider` that each driver
//! configures with its own defaults (URL, auth style, headers).
//!
//! # Auth styles
//! - `Bearer` — `Authorization: Bearer <key>` (OpenAI, xAI, OpenRouter)
//! - `ApiKeyHeader` — `api-key: <key>` (Azure OpenAI)
//! - `None` — no authentication (local servers like Ollama)

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{provider::ResponseStream, ChatMessage, CompletionRequest, Role, StreamEvent, Usage};

/// How to send the API key in HTTP requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>` — standard for most providers.
    Bearer,
    /// `api-key: <key>` — Azure OpenAI style.
    ApiKeyHeader,
    /// No authentication header — local servers (Ollama).
    None,
}

/// OpenAI-compatible chat completion provider.
pub struct OpenAICompatProvider {
    /// Provider id returned by `ModelProvider::name()`.
    driver_name: &'static str,
    /// Model id forwarded to the API.
    model: String,
    /// API key (pre-resolved from config or env).
    api_key: Option<String>,
    /// Full chat completions URL, e.g. `https://api.openai.com/v1/chat/completions`.
    chat_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
    /// Additional HTTP headers (e.g. `HTTP-Referer` for OpenRouter).
    extra_headers: Vec<(String, String)>,
    auth_style: AuthStyle,
}

impl OpenAICompatProvider {
    /// Construct a provider from an API base URL.
    ///
    /// `base_url` ends **before** `/chat/completions`, e.g.
    /// `https://api.x.ai/v1`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        driver_name: &'static str,
        model: String,
        api_key: Option<String>,
        base_url: &str,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        extra_headers: Vec<(String, String)>,
        auth_style: AuthStyle,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            driver_name,
            model,
            api_key,
            chat_url: format!("{base}/chat/completions"),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            client: reqwest::Client::new(),
            extra_headers,
            auth_style,
        }
    }

    /// Construct a provider from a **pre-built** chat completions URL.
    ///
    /// Use this when the full URL cannot be derived by appending
    /// `/chat/completions` to a base — e.g. Azure OpenAI, which encodes the
    /// deployment name and API version as path/query segments:
    /// `https://<resource>.openai.azure.com/openai/deployments/<deployment>/chat/completions?api-version=…`
    #[allow(clippy::too_many_arguments)]
    pub fn with_full_chat_url(
        driver_name: &'static str,
        model: String,
        api_key: Option<String>,
        chat_url: impl Into<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        extra_headers: Vec<(String, String)>,
        auth_style: AuthStyle,
    ) -> Self {
        Self {
            driver_name,
            model,
            api_key,
            chat_url: chat_url.into(),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            client: reqwest::Client::new(),
            extra_headers,
            auth_style,
        }
    }
}

#[async_trait]
impl crate::ModelProvider for OpenAICompatProvider {
    fn name(&self) -> &str {
        self.driver_name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream_chat(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let messages = build_openai_messages(&req.messages);

        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": req.stream,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "stream_options": { "include_usage": true },
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        debug!(
            driver = %self.driver_name,
            model = %self.model,
            tool_count = tools.len(),
            message_count = messages.len(),
            "sending completion request"
        );

        let mut http_req = self.client.post(&self.chat_url).json(&body);
        http_req = match self.auth_style {
            AuthStyle::Bearer => {
                let key = self
                    .api_key
                    .as_deref()
                    .context("API key not set; provide api_key or api_key_env in config")?;
                http_req.bearer_auth(key)
            }
            AuthStyle::ApiKeyHeader => {
                let key = self
                    .api_key
                    .as_deref()
                    .context("API key not set; provide api_key or api_key_env in config")?;
                http_req.header("api-key", key)
            }
            AuthStyle::None => http_req,
        };
        for (name, val) in &self.extra_headers {
            http_req = http_req.header(name.as_str(), val.as_str());
        }

        let resp = http_req
            .send()
            .await
            .with_context(|| format!("{} request failed", self.driver_name))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("{} error {status}: {text}", self.driver_name);
        }

        let byte_stream = resp.bytes_stream();
        // SSE events can be split across multiple TCP packets.  Maintain a
        // line buffer across chunks; emit events only for complete lines.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<anyhow::Result<StreamEvent>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Parse a single complete SSE `data:` line into a [`StreamEvent`].
///
/// Returns `None` for empty lines, comment lines, or unparseable data.
fn parse_sse_data_line(line: &str) -> Option<anyhow::Result<StreamEvent>> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(StreamEvent::Done));
    }
    let v: Value = serde_json::from_str(data).ok()?;
    Some(Ok(parse_sse_chunk(&v)))
}

/// Drain all complete `\n`-terminated SSE lines from `buf`.
///
/// Any trailing incomplete line (bytes not yet terminated by `\n`) is left
/// in `buf` so it can be extended by the next TCP chunk.  This is necessary
/// because a single SSE event may be split across multiple TCP packets.
pub(crate) fn drain_complete_sse_lines(buf: &mut String) -> Vec<anyhow::Result<StreamEvent>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        // Strip the optional Windows-style \r before \n.
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        // Advance buffer past the consumed line including the \n.
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_sse_data_line(&line) {
            events.push(ev);
        }
    }
    events
}

fn parse_sse_chunk(v: &Value) -> StreamEvent {
    // Usage-only chunk (emitted when stream_options.include_usage = true)
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        return StreamEvent::Usage(Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        });
    }

    let delta = &v["choices"][0]["delta"];

    // Tool call delta — the API may send multiple parallel tool calls, each
    // identified by an "index" field.  Each SSE chunk carries exactly one
    // tool-call delta in practice; the index routes accumulation downstream.
    if let Some(tc) = delta.get("tool_calls").and_then(|t| t.get(0)) {
        let index = tc["index"].as_u64().unwrap_or(0) as u32;
        let id = tc["id"].as_str().unwrap_or("").to_string();
        let name = tc["function"]["name"].as_str().unwrap_or("").to_string();
        let args = tc["function"]["arguments"].as_str().unwrap_or("").to_string();
        return StreamEvent::ToolCallDelta {
            index,
            id,
            name,
            arguments: args,
        };
    }

    // Text delta
    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        return StreamEvent::TextDelta(text.to_string());
    }

    StreamEvent::TextDelta(String::new())
}

fn role_str(r: &Role) -> &'static str {
    match r {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Convert a slice of [`ChatMessage`]s into the OpenAI wire-format JSON array.
///
/// Extracted as a free function so it can be unit-tested without making HTTP
/// requests.
pub(crate) fn build_openai_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let mut v = json!({
                "role": role_str(&m.role),
                "content": m.content,
            });
            // OpenAI accepts a participant name on user/assistant messages;
            // it must be a bare identifier, so spaces are replaced.
            if let Some(name) = &m.name {
                if matches!(m.role, Role::User | Role::Assistant) {
                    v["name"] = json!(name.replace(' ', "_"));
                }
            }
            if let Some(calls) = &m.tool_calls {
                let arr: Vec<Value> = calls
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c.id,
                            "type": "function",
                            "function": {
                                "name": c.function.name,
                                "arguments": c.function.arguments,
                            }
                        })
                    })
                    .collect();
                v["tool_calls"] = json!(arr);
            }
            if let Some(id) = &m.tool_call_id {
                v["tool_call_id"] = json!(id);
            }
            v
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ModelProvider;

    fn make_provider() -> OpenAICompatProvider {
        OpenAICompatProvider::new(
            "test-compat",
            "test-model".into(),
            None,
            "http://localhost:9999/v1",
            Some(1024),
            Some(0.0),
            vec![],
            AuthStyle::None,
        )
    }

    #[test]
    fn name_returns_driver_name() {
        let p = make_provider();
        assert_eq!(p.name(), "test-compat");
    }

    #[test]
    fn chat_url_appends_path() {
        let p = make_provider();
        assert_eq!(p.chat_url, "http://localhost:9999/v1/chat/completions");
    }

    #[test]
    fn base_url_trailing_slash_stripped() {
        let p = OpenAICompatProvider::new(
            "x",
            "m".into(),
            None,
            "http://localhost:1234/v1/",
            None,
            None,
            vec![],
            AuthStyle::None,
        );
        assert_eq!(p.chat_url, "http://localhost:1234/v1/chat/completions");
    }

    // ── parse_sse_chunk ───────────────────────────────────────────────────────

    #[test]
    fn parse_sse_text_delta() {
        let v = serde_json::json!({
            "choices": [{ "delta": { "content": "hello" } }]
        });
        let ev = parse_sse_chunk(&v);
        assert!(matches!(ev, StreamEvent::TextDelta(t) if t == "hello"));
    }

    #[test]
    fn parse_sse_no_content_no_tools_is_empty_text_delta() {
        let v = serde_json::json!({
            "choices": [{ "delta": {} }]
        });
        let ev = parse_sse_chunk(&v);
        assert!(matches!(ev, StreamEvent::TextDelta(t) if t.is_empty()));
    }

    #[test]
    fn parse_sse_tool_call_start_with_id_and_name() {
        let v = serde_json::json!({
            "choices": [{
                "delta": {
                    "tool_calls": [{
                        "index": 0,
                        "id": "call_abc",
                        "function": { "name": "shell_cmd", "arguments": "" }
                    }]
                }
            }]
        });
        let ev = parse_sse_chunk(&v);
        assert!(
            matches!(&ev, StreamEvent::ToolCallDelta { index, id, name, arguments }
                if *index == 0 && id == "call_abc" && name == "shell_cmd" && arguments.is_empty()),
            "unexpected event: {ev:?}"
        );
    }

    #[test]
    fn parse_sse_tool_call_args_delta() {
        let v = serde_json::json!({
            "choices": [{
                "delta": {
                    "tool_calls": [{
                        "id": "",
                        "function": { "name": "", "arguments": "{\"cmd\": " }
                    }]
                }
            }]
        });
        let ev = parse_sse_chunk(&v);
        assert!(
            matches!(&ev, StreamEvent::ToolCallDelta { arguments, .. } if arguments == "{\"cmd\": "),
            "unexpected event: {ev:?}"
        );
    }

    #[test]
    fn parse_sse_usage_event() {
        let v = serde_json::json!({
            "usage": { "prompt_tokens": 100, "completion_tokens": 50 }
        });
        let ev = parse_sse_chunk(&v);
        assert!(
            matches!(ev, StreamEvent::Usage(Usage { input_tokens: 100, output_tokens: 50 })),
            "unexpected event: {ev:?}"
        );
    }

    #[test]
    fn parse_sse_null_usage_falls_through_to_delta() {
        // When usage is null (not the final stats chunk), it should fall
        // through to delta parsing rather than emit a Usage event.
        let v = serde_json::json!({
            "usage": null,
            "choices": [{ "delta": { "content": "hi" } }]
        });
        let ev = parse_sse_chunk(&v);
        assert!(matches!(ev, StreamEvent::TextDelta(t) if t == "hi"));
    }

    // ── SSE line-buffer behaviour ─────────────────────────────────────────────
    //
    // A single SSE event may be split across two TCP packets.  Only complete
    // `\n`-terminated lines are parsed; the remainder stays buffered.  Without
    // this, tool-call fragments land in the wrong accumulation slot and the
    // conversation history sent on the next turn is corrupt.

    #[test]
    fn drain_complete_lines_handles_single_complete_line() {
        let line = r#"{"choices":[{"delta":{"content":"hi"}}]}"#;
        let mut buf = format!("data: {line}\n");
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Ok(StreamEvent::TextDelta(t)) if t == "hi"));
        assert!(buf.is_empty(), "buffer should be drained");
    }

    #[test]
    fn drain_complete_lines_retains_incomplete_last_line() {
        let partial = "data: {\"choices\":[{\"delta\":{\"content\":\"hel";
        let mut buf = partial.to_string();
        let events = drain_complete_sse_lines(&mut buf);
        assert!(events.is_empty(), "no complete line yet");
        assert_eq!(buf, partial, "partial line must stay in buffer");
    }

    #[test]
    fn sse_event_split_across_two_chunks_is_parsed_correctly() {
        let full_line = r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"shell_cmd","arguments":""}}]}}]}"#;
        let split = full_line.len() / 2;
        let chunk1 = &full_line[..split];
        let chunk2 = &full_line[split..];

        let mut buf = String::new();

        // First chunk: no newline yet — no events emitted
        buf.push_str(chunk1);
        let events1 = drain_complete_sse_lines(&mut buf);
        assert!(events1.is_empty(), "should not emit partial event");
        assert!(!buf.is_empty(), "buffer must hold partial line");

        // Second chunk + newline: completes the event
        buf.push_str(chunk2);
        buf.push('\n');
        let events2 = drain_complete_sse_lines(&mut buf);
        assert_eq!(events2.len(), 1, "should emit exactly one event");
        assert!(buf.is_empty());

        match &events2[0] {
            Ok(StreamEvent::ToolCallDelta { index, id, name, .. }) => {
                assert_eq!(*index, 0);
                assert_eq!(id, "call_1");
                assert_eq!(name, "shell_cmd");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn multiple_sse_events_in_one_tcp_chunk_all_parsed() {
        let chunk = concat!(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"c0\",\"function\":{\"name\":\"clock\",\"arguments\":\"\"}}]}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":1,\"id\":\"c1\",\"function\":{\"name\":\"shell_cmd\",\"arguments\":\"\"}}]}}]}\n",
        );
        let mut buf = chunk.to_string();
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 2, "both events should be parsed");
        assert!(buf.is_empty());

        match &events[0] {
            Ok(StreamEvent::ToolCallDelta { index, id, name, .. }) => {
                assert_eq!(*index, 0);
                assert_eq!(id, "c0");
                assert_eq!(name, "clock");
            }
            other => panic!("unexpected first event: {other:?}"),
        }
        match &events[1] {
            Ok(StreamEvent::ToolCallDelta { index, id, name, .. }) => {
                assert_eq!(*index, 1);
                assert_eq!(id, "c1");
                assert_eq!(name, "shell_cmd");
            }
            other => panic!("unexpected second event: {other:?}"),
        }
    }

    #[test]
    fn done_event_is_parsed_correctly() {
        let mut buf = "data: [DONE]\n".to_string();
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Ok(StreamEvent::Done)));
    }

    #[test]
    fn windows_crlf_line_endings_are_handled() {
        let line = r#"{"choices":[{"delta":{"content":"hi"}}]}"#;
        let mut buf = format!("data: {line}\r\n");
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Ok(StreamEvent::TextDelta(t)) if t == "hi"));
    }

    // ── Wire-format serialization ─────────────────────────────────────────────

    #[test]
    fn plain_text_message_serialized_as_string_content() {
        let msgs = vec![ChatMessage::user("hello world")];
        let json = build_openai_messages(&msgs);
        assert_eq!(json[0]["role"], "user");
        assert_eq!(json[0]["content"], "hello world");
    }

    #[test]
    fn sender_name_forwarded_with_spaces_replaced() {
        let msgs = vec![ChatMessage::user_from("hi", "Data Analyst")];
        let json = build_openai_messages(&msgs);
        assert_eq!(json[0]["name"], "Data_Analyst");
    }

    #[test]
    fn tool_result_carries_call_id() {
        let msgs = vec![ChatMessage::tool_result("tc-1", "just text")];
        let json = build_openai_messages(&msgs);
        assert_eq!(json[0]["role"], "tool");
        assert_eq!(json[0]["tool_call_id"], "tc-1");
        assert_eq!(json[0]["content"], "just text");
    }

    #[test]
    fn assistant_tool_calls_serialized_as_array() {
        use crate::{FunctionCall, ToolCallRequest};
        let msg = ChatMessage {
            role: Role::Assistant,
            content: String::new(),
            name: None,
            tool_calls: Some(vec![
                ToolCallRequest {
                    id: "call_1".into(),
                    function: FunctionCall {
                        name: "clock".into(),
                        arguments: "{}".into(),
                    },
                },
                ToolCallRequest {
                    id: "call_2".into(),
                    function: FunctionCall {
                        name: "shell_cmd".into(),
                        arguments: r#"{"cmd":"ls"}"#.into(),
                    },
                },
            ]),
            tool_call_id: None,
        };
        let json = build_openai_messages(&[msg]);
        let calls = json[0]["tool_calls"].as_array().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0]["id"], "call_1");
        assert_eq!(calls[1]["function"]["name"], "shell_cmd");
    }
}
