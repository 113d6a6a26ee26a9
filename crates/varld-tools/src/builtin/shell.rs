// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::tool::{ApprovalPolicy, Tool, ToolCall, ToolOutput};

/// Hard byte ceiling for combined stdout + stderr returned to the model.
/// 20 KB ≈ 5,000 tokens — keeps output well within a small context window.
const OUTPUT_LIMIT_BYTES: usize = 20_000;

/// Number of lines to keep from the head of oversized output.
const HEAD_LINES: usize = 100;

/// Number of lines to keep from the tail of oversized output.
/// Errors and summaries almost always appear at the end of command output,
/// so preserving the tail is at least as important as preserving the head.
const TAIL_LINES: usize = 100;

/// Built-in tool that runs a shell command.  Requires human approval; the
/// working directory is part of its approval identity.
pub struct ShellTool {
    pub timeout_secs: u64,
}

impl Default for ShellTool {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell_cmd"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return stdout + stderr.\n\
         'cmd' is required and can be any bash one-liner.\n\
         Output is capped at ~20 KB; when larger, the first 100 and last 100 \
         lines are preserved with an omission marker in the middle.\n\
         Prefer non-interactive commands. Avoid commands that require a TTY."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "cmd": {
                    "type": "string",
                    "description": "The complete bash one-liner to execute."
                },
                "cwd": {
                    "type": "string",
                    "description": "Working directory (optional, defaults to the process cwd)"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Execution timeout in seconds (optional)"
                }
            },
            "required": ["cmd"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    fn keyed_by_working_dir(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let command = match call.args.get("cmd").and_then(|v| v.as_str()) {
            Some(c) => c.to_string(),
            None => {
                return ToolOutput::err(
                    &call.id,
                    "Please provide the shell command to execute as the 'cmd' parameter.",
                );
            }
        };
        let cwd = call
            .args
            .get("cwd")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let timeout = call
            .args
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .unwrap_or(self.timeout_secs);

        debug!(cmd = %command, "executing shell tool");

        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(&command);
        // Isolate the subprocess from the calling terminal and make sure a
        // timed-out child is killed rather than left running.
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        if let Some(wd) = &cwd {
            cmd.current_dir(wd);
        }

        let result =
            tokio::time::timeout(std::time::Duration::from_secs(timeout), cmd.output()).await;

        match result {
            Ok(Ok(output)) => {
                let mut content = String::new();
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);

                if !stdout.is_empty() {
                    content.push_str(&head_tail_truncate(&stdout));
                }
                if !stderr.is_empty() {
                    if !content.is_empty() {
                        content.push('\n');
                    }
                    content.push_str("[stderr]\n");
                    content.push_str(&head_tail_truncate(&stderr));
                }
                if content.is_empty() {
                    content = format!("[exit {}]", output.status.code().unwrap_or(-1));
                }

                let code = output.status.code().unwrap_or(-1);
                if code == 0 {
                    ToolOutput::ok(&call.id, content)
                } else if code == 1 {
                    // Exit code 1 is the Unix convention for "no matches"
                    // (grep/rg), "condition false" (test/[), and similar
                    // non-fatal empty results.  Include the code in the output
                    // for transparency but do not flag it as an error.
                    ToolOutput::ok(&call.id, format!("[exit 1]\n{content}"))
                } else {
                    ToolOutput::err(&call.id, format!("[exit {code}]\n{content}"))
                }
            }
            Ok(Err(e)) => ToolOutput::err(&call.id, format!("spawn error: {e}")),
            Err(_) => ToolOutput::err(&call.id, format!("timeout after {timeout}s")),
        }
    }
}

/// Truncate `s` to fit within `OUTPUT_LIMIT_BYTES`.
///
/// When truncation is needed the first `HEAD_LINES` and last `TAIL_LINES`
/// lines are kept verbatim, with an omission marker in the middle showing how
/// many lines were dropped.
pub(crate) fn head_tail_truncate(s: &str) -> String {
    if s.len() <= OUTPUT_LIMIT_BYTES {
        return s.to_string();
    }

    let lines: Vec<&str> = s.lines().collect();
    let total = lines.len();

    if total <= HEAD_LINES + TAIL_LINES {
        // Byte budget exceeded by very long lines; hard cut in the middle.
        let head = &s[..OUTPUT_LIMIT_BYTES / 2];
        let tail = &s[s.len() - OUTPUT_LIMIT_BYTES / 2..];
        return format!("{head}\n[... output truncated ...]\n{tail}");
    }

    let head = lines[..HEAD_LINES].join("\n");
    let tail = lines[total - TAIL_LINES..].join("\n");
    let omitted = total - HEAD_LINES - TAIL_LINES;
    format!("{head}\n[... {omitted} lines omitted ...]\n{tail}")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(args: Value) -> ToolCall {
        ToolCall {
            id: "c1".into(),
            name: "shell_cmd".into(),
            args,
        }
    }

    #[tokio::test]
    async fn echo_returns_stdout() {
        let out = ShellTool::default().execute(&call(json!({"cmd": "echo hi"}))).await;
        assert!(!out.is_error);
        assert!(out.content.contains("hi"));
    }

    #[tokio::test]
    async fn missing_cmd_is_an_error() {
        let out = ShellTool::default().execute(&call(json!({}))).await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn nonzero_exit_is_error_with_code() {
        let out = ShellTool::default().execute(&call(json!({"cmd": "exit 3"}))).await;
        assert!(out.is_error);
        assert!(out.content.contains("[exit 3]"));
    }

    #[tokio::test]
    async fn exit_one_is_not_an_error() {
        let out = ShellTool::default().execute(&call(json!({"cmd": "false"}))).await;
        assert!(!out.is_error);
        assert!(out.content.contains("[exit 1]"));
    }

    #[tokio::test]
    async fn cwd_is_respected() {
        let out = ShellTool::default()
            .execute(&call(json!({"cmd": "pwd", "cwd": "/tmp"})))
            .await;
        assert!(out.content.trim_end().ends_with("tmp"));
    }

    #[tokio::test]
    async fn timeout_kills_long_command() {
        let tool = ShellTool { timeout_secs: 1 };
        let out = tool.execute(&call(json!({"cmd": "sleep 10"}))).await;
        assert!(out.is_error);
        assert!(out.content.contains("timeout"));
    }

    #[test]
    fn head_tail_keeps_both_ends() {
        let many: String = (0..5000).map(|i| format!("line {i}\n")).collect();
        let truncated = head_tail_truncate(&many);
        assert!(truncated.len() < many.len());
        assert!(truncated.contains("line 0"));
        assert!(truncated.contains("line 4999"));
        assert!(truncated.contains("omitted"));
    }

    #[test]
    fn short_output_untouched() {
        assert_eq!(head_tail_truncate("hello"), "hello");
    }

    #[test]
    fn shell_is_keyed_by_working_dir() {
        assert!(ShellTool::default().keyed_by_working_dir());
    }
}
