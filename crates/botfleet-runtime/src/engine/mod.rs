// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent-engine seam.
//!
//! The LLM execution engine is an external collaborator. The core consumes
//! two surfaces: the session service (create/list/delete, keyed by
//! `(app_name, user_key)`) and the streaming run operation. Run events are
//! classified by the agent runner; `FunctionResponse` events are received
//! but ignored - only function *names* are mapped to display labels.

pub mod mock;

pub use self::mock::{MockEngine, RunScript};

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use botfleet_core::SessionId;

/// Errors from engine operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The run failed inside the engine.
    #[error("Engine run failed: {0}")]
    Run(String),

    /// No event arrived within the engine timeout.
    #[error("Engine timed out")]
    Timeout,

    /// A session-service operation failed.
    #[error("Session service error: {0}")]
    Session(String),

    /// The request was refused by the per-model rate window.
    #[error("Rate limited for model {model}")]
    RateLimited {
        /// The model whose window is exhausted.
        model: String,
    },
}

/// One event from a streaming agent run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Incremental text.
    Partial(String),
    /// The agent started a function call.
    FunctionCall {
        /// Engine-side function name.
        name: String,
    },
    /// A function call returned. Ignored by the core.
    FunctionResponse {
        /// Engine-side function name.
        name: String,
    },
    /// Terminal: the run finished. `text` may be empty when all content was
    /// already streamed as partials, or `None` when the run produced
    /// nothing.
    Final {
        /// Final text payload, if any.
        text: Option<String>,
    },
    /// Terminal: the engine escalated instead of completing.
    Escalation {
        /// Human-readable escalation message, if the engine provided one.
        message: Option<String>,
    },
}

/// Stream of run events.
pub type EngineEventStream =
    Pin<Box<dyn Stream<Item = Result<EngineEvent, EngineError>> + Send>>;

/// The consumed engine surface.
#[async_trait]
pub trait AgentEngine: Send + Sync {
    /// Create a fresh session for `(app_name, user_key)`.
    async fn create_session(
        &self,
        app_name: &str,
        user_key: &str,
    ) -> Result<SessionId, EngineError>;

    /// All live sessions for `(app_name, user_key)`.
    async fn list_sessions(
        &self,
        app_name: &str,
        user_key: &str,
    ) -> Result<Vec<SessionId>, EngineError>;

    /// Delete one session.
    async fn delete_session(
        &self,
        app_name: &str,
        user_key: &str,
        session: &SessionId,
    ) -> Result<(), EngineError>;

    /// Attach `message` to the session and stream the run. The token
    /// cancels the run cooperatively; after cancellation the stream ends
    /// without a terminal event.
    async fn run(
        &self,
        app_name: &str,
        session: &SessionId,
        user_key: &str,
        message: &str,
        cancel: CancellationToken,
    ) -> Result<EngineEventStream, EngineError>;
}
