// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process state store backend.
//!
//! Same semantics as the PostgreSQL backend over guarded maps. Used by the
//! test suites and by single-node deployments that do not share state
//! across processes. Config blobs are held in their serialized form so the
//! wire round-trip is exercised exactly like the production backend.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use crate::bot::{AgentConfig, BotId, BotState, InitConfig};
use crate::error::Result;

use super::{DEFAULT_LOCK_TTL, StateStore, StopDecision, starting_lock_key, stopping_lock_key};

#[derive(Default)]
struct Inner {
    states: HashMap<String, BotState>,
    init_blobs: HashMap<String, String>,
    setup_blobs: HashMap<String, String>,
    locks: HashMap<String, Instant>,
    history: Vec<HistoryEntry>,
}

struct HistoryEntry {
    model: String,
    tokens: u64,
    expires_at: Instant,
}

/// In-memory [`StateStore`] backend.
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
    lock_ttl: Duration,
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStateStore {
    /// Create an empty store with the default lock TTL.
    pub fn new() -> Self {
        Self::with_lock_ttl(DEFAULT_LOCK_TTL)
    }

    /// Create an empty store with a custom lock TTL.
    pub fn with_lock_ttl(lock_ttl: Duration) -> Self {
        Self { inner: Mutex::new(Inner::default()), lock_ttl }
    }

    fn acquire_lock(inner: &mut Inner, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        if let Some(expires) = inner.locks.get(key)
            && *expires > now
        {
            return false;
        }
        inner.locks.insert(key.to_string(), now + ttl);
        true
    }

    fn release_lock(inner: &mut Inner, key: &str) {
        inner.locks.remove(key);
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get_state(&self, id: &BotId) -> BotState {
        let inner = self.inner.lock().await;
        inner.states.get(id.as_str()).copied().unwrap_or_default()
    }

    async fn set_state(&self, id: &BotId, state: BotState) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.states.insert(id.as_str().to_string(), state);
        Ok(())
    }

    async fn mark_should_start(
        &self,
        id: &BotId,
        init: &InitConfig,
        setup: &AgentConfig,
    ) -> Result<()> {
        let init_blob = serde_json::to_string(init)?;
        let setup_blob = serde_json::to_string(setup)?;
        let mut inner = self.inner.lock().await;
        inner.init_blobs.insert(id.as_str().to_string(), init_blob);
        inner.setup_blobs.insert(id.as_str().to_string(), setup_blob);
        inner.states.insert(id.as_str().to_string(), BotState::ShouldStart);
        Ok(())
    }

    async fn mark_should_stop(&self, id: &BotId) -> Result<()> {
        self.set_state(id, BotState::ShouldStop).await
    }

    async fn mark_should_restart(&self, id: &BotId) -> Result<()> {
        self.set_state(id, BotState::ShouldRestart).await
    }

    async fn clear_config(&self, id: &BotId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.init_blobs.remove(id.as_str());
        inner.setup_blobs.remove(id.as_str());
        Ok(())
    }

    async fn init_config(&self, id: &BotId) -> Result<Option<InitConfig>> {
        let inner = self.inner.lock().await;
        match inner.init_blobs.get(id.as_str()) {
            Some(blob) => Ok(Some(serde_json::from_str(blob)?)),
            None => Ok(None),
        }
    }

    async fn setup_config(&self, id: &BotId) -> Result<Option<AgentConfig>> {
        let inner = self.inner.lock().await;
        match inner.setup_blobs.get(id.as_str()) {
            Some(blob) => Ok(Some(serde_json::from_str(blob)?)),
            None => Ok(None),
        }
    }

    async fn try_start(&self, id: &BotId) -> Result<bool> {
        let key = starting_lock_key(id);
        let mut inner = self.inner.lock().await;
        if !Self::acquire_lock(&mut inner, &key, self.lock_ttl) {
            warn!(bot_id = %id, "Start lock contended");
            return Ok(false);
        }
        let advanced = match inner.states.get(id.as_str()).copied().unwrap_or_default() {
            BotState::ShouldStart => {
                inner.states.insert(id.as_str().to_string(), BotState::Starting);
                true
            }
            _ => false,
        };
        Self::release_lock(&mut inner, &key);
        Ok(advanced)
    }

    async fn try_stop(&self, id: &BotId) -> Result<StopDecision> {
        let key = stopping_lock_key(id);
        let mut inner = self.inner.lock().await;
        if !Self::acquire_lock(&mut inner, &key, self.lock_ttl) {
            warn!(bot_id = %id, "Stop lock contended");
            return Ok(StopDecision::None);
        }
        let decision = match inner.states.get(id.as_str()).copied().unwrap_or_default() {
            BotState::ShouldStop => {
                inner.states.insert(id.as_str().to_string(), BotState::Stopping);
                StopDecision::ToIdle
            }
            BotState::ShouldRestart => {
                inner.states.insert(id.as_str().to_string(), BotState::Starting);
                StopDecision::ToRestart
            }
            _ => StopDecision::None,
        };
        Self::release_lock(&mut inner, &key);
        Ok(decision)
    }

    async fn list_all_bots(&self) -> Result<Vec<BotId>> {
        let inner = self.inner.lock().await;
        let mut ids: Vec<BotId> = inner
            .states
            .keys()
            .chain(inner.init_blobs.keys())
            .map(|k| BotId::new(k.clone()))
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn reset_all(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for state in inner.states.values_mut() {
            *state = BotState::Idle;
        }
        inner.init_blobs.clear();
        inner.setup_blobs.clear();
        inner.locks.clear();
        inner.history.clear();
        Ok(())
    }

    async fn record_model_usage(
        &self,
        model: &str,
        tokens: u64,
        interval: Duration,
    ) -> Result<()> {
        if interval.is_zero() {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        inner.history.push(HistoryEntry {
            model: model.to_string(),
            tokens,
            expires_at: Instant::now() + interval,
        });
        Ok(())
    }

    async fn model_window_tokens(&self, model: &str) -> Result<u64> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.history.retain(|e| e.expires_at > now);
        Ok(inner
            .history
            .iter()
            .filter(|e| e.model == model)
            .map(|e| e.tokens)
            .sum())
    }
}
