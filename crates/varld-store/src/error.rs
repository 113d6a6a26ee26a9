// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("invalid identifier '{0}': ids may only contain letters, digits, '-' and '_'")]
    InvalidId(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
