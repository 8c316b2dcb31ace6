// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The shared bot lifecycle registry.
//!
//! The state store is the only mutable state shared between supervisor
//! processes. It holds the authoritative [`BotState`] per bot, the
//! configuration blobs consumed on start, the TTL-bounded transition locks,
//! and the per-model rate-limit ledger.
//!
//! Contract: transitions into `starting` and `stopping` go through
//! [`StateStore::try_start`] / [`StateStore::try_stop`], which take the
//! corresponding lock so concurrent reconcilers never advance the same bot
//! twice. Everything else is plain atomic writes.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryStateStore;
pub use self::postgres::PostgresStateStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::bot::{AgentConfig, BotId, BotState, InitConfig};
use crate::error::Result;

/// Default TTL on transition locks. Must exceed the longest expected
/// transition; on expiry the lock frees itself and a later tick retries.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(10);

/// Outcome of a stop attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDecision {
    /// Nothing to do; the bot was in neither `should_stop` nor
    /// `should_restart`, or the lock was contended.
    None,
    /// The bot moved to `stopping`; tear the worker down and settle to idle.
    ToIdle,
    /// The bot moved to `starting`; tear the worker down and start it again
    /// with freshly loaded configs.
    ToRestart,
}

/// Shared lifecycle registry.
///
/// Failure semantics: [`get_state`](StateStore::get_state) fails closed to
/// [`BotState::Idle`] (the next tick re-observes); every other operation
/// surfaces its error for the caller to log and retry.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Current state for a bot. Absent or unreadable means idle.
    async fn get_state(&self, id: &BotId) -> BotState;

    /// Write a state unconditionally.
    async fn set_state(&self, id: &BotId, state: BotState) -> Result<()>;

    /// Atomically write both configuration blobs, then `should_start`.
    async fn mark_should_start(
        &self,
        id: &BotId,
        init: &InitConfig,
        setup: &AgentConfig,
    ) -> Result<()>;

    /// Request a stop.
    async fn mark_should_stop(&self, id: &BotId) -> Result<()>;

    /// Request a stop followed by a fresh start.
    async fn mark_should_restart(&self, id: &BotId) -> Result<()>;

    /// Delete both configuration blobs.
    async fn clear_config(&self, id: &BotId) -> Result<()>;

    /// Read the init blob written by the last `mark_should_start`.
    async fn init_config(&self, id: &BotId) -> Result<Option<InitConfig>>;

    /// Read the agent blob written by the last `mark_should_start`.
    async fn setup_config(&self, id: &BotId) -> Result<Option<AgentConfig>>;

    /// Under the start lock: if the bot is `should_start`, advance it to
    /// `starting` and return true. Lock contention returns false without
    /// error.
    async fn try_start(&self, id: &BotId) -> Result<bool>;

    /// Under the stop lock: `should_stop` advances to `stopping`
    /// ([`StopDecision::ToIdle`]), `should_restart` advances straight to
    /// `starting` ([`StopDecision::ToRestart`]).
    async fn try_stop(&self, id: &BotId) -> Result<StopDecision>;

    /// Every bot id the store knows about, deduplicated.
    async fn list_all_bots(&self) -> Result<Vec<BotId>>;

    /// Set every known bot to idle and delete all config and lock entries.
    /// Invoked once at process start to recover from crashes.
    async fn reset_all(&self) -> Result<()>;

    /// Append to a model's rate-limit ledger. Entries expire `interval`
    /// after being recorded; a zero interval is not recorded at all.
    async fn record_model_usage(&self, model: &str, tokens: u64, interval: Duration)
    -> Result<()>;

    /// Sum of unexpired ledger entries for a model.
    async fn model_window_tokens(&self, model: &str) -> Result<u64>;
}

/// Lock key for the `should_start -> starting` transition.
pub(crate) fn starting_lock_key(id: &BotId) -> String {
    format!("lock:bot:{id}:starting")
}

/// Lock key for the `should_stop -> stopping` transition.
pub(crate) fn stopping_lock_key(id: &BotId) -> String {
    format!("lock:bot:{id}:stopping")
}
