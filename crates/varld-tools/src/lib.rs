// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
pub mod builtin;
mod registry;
mod tool;

pub use registry::{ToolRegistry, ToolSchema};
pub use tool::{ApprovalPolicy, Tool, ToolCall, ToolOutput};
