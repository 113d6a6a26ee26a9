// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use crate::tool::{ApprovalPolicy, Tool, ToolCall, ToolOutput};

/// Built-in trusted tool: returns the current UTC time.  Runs without
/// approval, which makes it the reference example of the auto-approved path.
pub struct ClockTool;

#[async_trait]
impl Tool for ClockTool {
    fn name(&self) -> &str {
        "clock"
    }

    fn description(&self) -> &str {
        "Return the current date and time in UTC (RFC 3339)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        ToolOutput::ok(&call.id, Utc::now().to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clock_returns_rfc3339_timestamp() {
        let out = ClockTool
            .execute(&ToolCall {
                id: "c".into(),
                name: "clock".into(),
                args: json!({}),
            })
            .await;
        assert!(!out.is_error);
        assert!(out.content.contains('T'));
    }

    #[test]
    fn clock_is_auto_approved() {
        assert_eq!(ClockTool.default_policy(), ApprovalPolicy::Auto);
    }
}
