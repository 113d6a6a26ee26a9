// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Typed failure kinds of the runtime.
///
/// Approval denials are deliberately absent: a denial is synthesized into a
/// tool-result message so the agent can react, it never surfaces as an error.
#[derive(Debug, Error)]
pub enum WorldError {
    /// Entity (world/agent/chat/message) does not exist.  Surfaced, never
    /// retried.
    #[error("{0} not found")]
    NotFound(String),

    /// Duplicate create or concurrent-edit collision.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Malformed input, named after the offending field.
    #[error("validation failed for '{field}': {reason}")]
    Validation { field: String, reason: String },

    /// Disk I/O failure.  Compound operations roll back their in-memory
    /// state before surfacing this.
    #[error("storage failure: {0}")]
    Storage(#[from] varld_store::StoreError),

    /// LLM or tool back-end failure.  Inside the agent loop this becomes an
    /// `sse` error frame instead of propagating.
    #[error("provider failure: {0}")]
    Provider(String),

    /// World destroy or chat teardown ended the operation quietly.
    #[error("cancelled")]
    Cancelled,

    /// Unexpected state; considered a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, WorldError>;

impl WorldError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
