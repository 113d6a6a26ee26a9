// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::Value;

/// Per-tool approval default, consulted by the runtime's approval engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalPolicy {
    /// Trusted builtin: always run without asking
    Auto,
    /// Ask for human approval before each invocation (subject to
    /// session-scoped grants)
    Ask,
    /// Never run; a synthetic denial is injected without asking
    Deny,
}

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier assigned by the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub args: Value,
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    /// If true, the tool execution failed non-fatally (returned error message).
    pub is_error: bool,
}

impl ToolOutput {
    /// Successful plain-text result.
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    /// Error result containing a plain-text error message.
    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: msg.into(),
            is_error: true,
        }
    }
}

/// Trait that every built-in and user-defined tool must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters
    fn parameters_schema(&self) -> Value;
    /// Default approval level for this tool
    fn default_policy(&self) -> ApprovalPolicy;
    /// Whether the working directory participates in this tool's approval
    /// identity.  Shell-style tools return `true`: one session grant covers
    /// further commands in the same directory, while the same command from a
    /// different directory asks again.
    fn keyed_by_working_dir(&self) -> bool {
        false
    }
    /// Execute the tool.  Errors should be wrapped in [`ToolOutput::err`].
    async fn execute(&self, call: &ToolCall) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct MinimalTool;

    #[async_trait]
    impl Tool for MinimalTool {
        fn name(&self) -> &str {
            "minimal"
        }
        fn description(&self) -> &str {
            "a minimal tool"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn default_policy(&self) -> ApprovalPolicy {
            ApprovalPolicy::Auto
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, "ok")
        }
    }

    #[test]
    fn default_key_excludes_working_dir() {
        assert!(!MinimalTool.keyed_by_working_dir());
    }

    #[test]
    fn output_ok_is_not_error() {
        let out = ToolOutput::ok("c1", "fine");
        assert!(!out.is_error);
        assert_eq!(out.call_id, "c1");
    }

    #[test]
    fn output_err_sets_flag() {
        let out = ToolOutput::err("c1", "boom");
        assert!(out.is_error);
        assert_eq!(out.content, "boom");
    }

    #[tokio::test]
    async fn execute_echoes_call_id() {
        let call = ToolCall {
            id: "xyz".into(),
            name: "minimal".into(),
            args: json!({}),
        };
        let out = MinimalTool.execute(&call).await;
        assert_eq!(out.call_id, "xyz");
    }
}
