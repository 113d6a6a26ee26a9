// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use crate::{ApprovalPolicy, Tool, ToolCall, ToolOutput};

/// A tool schema – mirrors the model crate's `ToolSchema` but keeps this
/// crate independent from it.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Central registry holding all available tools.
///
/// Immutable after construction; all methods take `&self`, so a single
/// `Arc<ToolRegistry>` is shared by every agent in a world.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Registry preloaded with the builtin tool set.
    pub fn with_builtins(tool_timeout_secs: u64) -> Self {
        let mut reg = Self::new();
        reg.register(crate::builtin::ClockTool);
        reg.register(crate::builtin::ShellTool {
            timeout_secs: tool_timeout_secs,
        });
        reg
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Approval default for a tool; unknown names fall back to `Ask` so a
    /// hallucinated tool never runs silently.
    pub fn policy(&self, name: &str) -> ApprovalPolicy {
        self.tools
            .get(name)
            .map(|t| t.default_policy())
            .unwrap_or(ApprovalPolicy::Ask)
    }

    /// Produce schemas for all registered tools, sorted by name.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub async fn execute(&self, call: &ToolCall) -> ToolOutput {
        match self.tools.get(&call.name) {
            Some(tool) => tool.execute(call).await,
            None => ToolOutput::err(&call.id, format!("unknown tool: {}", call.name)),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::tool::{Tool, ToolCall, ToolOutput};

    /// Minimal no-op tool for registry tests.
    struct EchoTool {
        name: &'static str,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn default_policy(&self) -> ApprovalPolicy {
            ApprovalPolicy::Auto
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, format!("echo:{}", call.args))
        }
    }

    #[tokio::test]
    async fn registered_tool_executes() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo" });
        let out = reg
            .execute(&ToolCall {
                id: "1".into(),
                name: "echo".into(),
                args: json!({"x": 1}),
            })
            .await;
        assert!(!out.is_error);
        assert!(out.content.contains("echo:"));
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_output() {
        let reg = ToolRegistry::new();
        let out = reg
            .execute(&ToolCall {
                id: "1".into(),
                name: "nope".into(),
                args: json!({}),
            })
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("unknown tool"));
    }

    #[test]
    fn unknown_tool_policy_defaults_to_ask() {
        let reg = ToolRegistry::new();
        assert_eq!(reg.policy("hallucinated"), ApprovalPolicy::Ask);
    }

    #[test]
    fn schemas_sorted_by_name() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "zeta" });
        reg.register(EchoTool { name: "alpha" });
        let schemas = reg.schemas();
        assert_eq!(schemas[0].name, "alpha");
        assert_eq!(schemas[1].name, "zeta");
    }

    #[test]
    fn builtins_include_shell_and_clock() {
        let reg = ToolRegistry::with_builtins(30);
        let names = reg.names();
        assert!(names.contains(&"shell_cmd".to_string()));
        assert!(names.contains(&"clock".to_string()));
    }

    #[test]
    fn shell_asks_clock_is_auto() {
        let reg = ToolRegistry::with_builtins(30);
        assert_eq!(reg.policy("shell_cmd"), ApprovalPolicy::Ask);
        assert_eq!(reg.policy("clock"), ApprovalPolicy::Auto);
    }
}
