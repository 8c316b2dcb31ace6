// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for botfleet-core.

use thiserror::Error;

/// Core errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// State store operation failed. Transient; callers log and retry on the
    /// next reconciler tick.
    #[error("State store error: {0}")]
    StateStore(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A configuration blob was malformed or incomplete. Fatal to the
    /// affected bot.
    #[error("Invalid config for {bot_id}: {reason}")]
    InvalidConfig {
        /// Bot the config belongs to.
        bot_id: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A model name did not resolve through the alias table.
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    /// A tool name is not present in the tool registry.
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// The bot was not found in the configuration store.
    #[error("Bot not found: {0}")]
    BotNotFound(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;
