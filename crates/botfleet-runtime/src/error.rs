// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for botfleet-runtime.

use thiserror::Error;

/// Runtime errors.
///
/// Propagation policy: an error inside a single message handler never
/// escapes the channel-router worker for that key; an error inside the
/// reconciler never escapes one tick; an error during worker add/remove
/// rolls the bot back to idle and is logged.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Error from botfleet-core (state store, config, catalog).
    #[error(transparent)]
    Core(#[from] botfleet_core::CoreError),

    /// Chat-service operation failed.
    #[error("Chat service error: {0}")]
    Chat(#[from] crate::chat::ChatError),

    /// Agent engine operation failed.
    #[error("Engine error: {0}")]
    Engine(#[from] crate::engine::EngineError),

    /// Channel router rejected an enqueue.
    #[error("Router error: {0}")]
    Router(#[from] crate::router::RouterError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using the runtime [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
