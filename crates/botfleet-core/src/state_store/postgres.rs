// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL state store backend.
//!
//! Rows instead of keys: `bot_states`, `bot_configs`, `bot_locks`, and
//! `model_history`. The transition lock is an upsert guarded by
//! `expires_at`, so an expired holder is displaced atomically and a crashed
//! supervisor never blocks a bot for longer than the TTL.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::bot::{AgentConfig, BotId, BotState, InitConfig};
use crate::error::Result;

use super::{DEFAULT_LOCK_TTL, StateStore, StopDecision, starting_lock_key, stopping_lock_key};

/// PostgreSQL-backed [`StateStore`].
pub struct PostgresStateStore {
    pool: PgPool,
    lock_ttl: Duration,
}

impl PostgresStateStore {
    /// Create a store over an existing pool with the default lock TTL.
    pub fn new(pool: PgPool) -> Self {
        Self::with_lock_ttl(pool, DEFAULT_LOCK_TTL)
    }

    /// Create a store with a custom lock TTL.
    pub fn with_lock_ttl(pool: PgPool, lock_ttl: Duration) -> Self {
        Self { pool, lock_ttl }
    }

    /// Claim a lock key. Returns the holder token on success, `None` when a
    /// live holder already owns the key.
    async fn acquire_lock(&self, key: &str) -> Result<Option<String>> {
        let holder = Uuid::new_v4().to_string();
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.lock_ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(10));

        let result = sqlx::query(
            r#"
            INSERT INTO bot_locks (lock_key, holder, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (lock_key) DO UPDATE SET
                holder = EXCLUDED.holder,
                expires_at = EXCLUDED.expires_at
            WHERE bot_locks.expires_at <= now()
            "#,
        )
        .bind(key)
        .bind(&holder)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(lock_key = %key, "Failed to acquire lock");
            return Ok(None);
        }
        Ok(Some(holder))
    }

    /// Release a lock we hold. A TTL-expired lock taken over by another
    /// holder is left alone.
    async fn release_lock(&self, key: &str, holder: &str) {
        let released =
            sqlx::query("DELETE FROM bot_locks WHERE lock_key = $1 AND holder = $2")
                .bind(key)
                .bind(holder)
                .execute(&self.pool)
                .await;
        if let Err(e) = released {
            error!(lock_key = %key, error = %e, "Failed to release lock");
        }
    }

    async fn read_state(&self, id: &BotId) -> Result<BotState> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT state FROM bot_states WHERE bot_id = $1")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;

        Ok(match row {
            Some((raw,)) => BotState::parse(&raw).unwrap_or_else(|| {
                error!(bot_id = %id, state = %raw, "Unrecognized state in store");
                BotState::Idle
            }),
            None => BotState::Idle,
        })
    }

    async fn write_state(&self, id: &BotId, state: BotState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bot_states (bot_id, state, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (bot_id) DO UPDATE SET
                state = EXCLUDED.state,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(id.as_str())
        .bind(state.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn get_state(&self, id: &BotId) -> BotState {
        match self.read_state(id).await {
            Ok(state) => state,
            Err(e) => {
                error!(bot_id = %id, error = %e, "get_state failed, assuming idle");
                BotState::Idle
            }
        }
    }

    async fn set_state(&self, id: &BotId, state: BotState) -> Result<()> {
        self.write_state(id, state).await
    }

    async fn mark_should_start(
        &self,
        id: &BotId,
        init: &InitConfig,
        setup: &AgentConfig,
    ) -> Result<()> {
        let init_blob = serde_json::to_value(init)?;
        let setup_blob = serde_json::to_value(setup)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO bot_configs (bot_id, init_config, setup_config, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (bot_id) DO UPDATE SET
                init_config = EXCLUDED.init_config,
                setup_config = EXCLUDED.setup_config,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(id.as_str())
        .bind(&init_blob)
        .bind(&setup_blob)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO bot_states (bot_id, state, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (bot_id) DO UPDATE SET
                state = EXCLUDED.state,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(id.as_str())
        .bind(BotState::ShouldStart.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn mark_should_stop(&self, id: &BotId) -> Result<()> {
        self.write_state(id, BotState::ShouldStop).await
    }

    async fn mark_should_restart(&self, id: &BotId) -> Result<()> {
        self.write_state(id, BotState::ShouldRestart).await
    }

    async fn clear_config(&self, id: &BotId) -> Result<()> {
        sqlx::query("DELETE FROM bot_configs WHERE bot_id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn init_config(&self, id: &BotId) -> Result<Option<InitConfig>> {
        let row: Option<(Option<serde_json::Value>,)> =
            sqlx::query_as("SELECT init_config FROM bot_configs WHERE bot_id = $1")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        match row.and_then(|(blob,)| blob) {
            Some(blob) => Ok(Some(serde_json::from_value(blob)?)),
            None => Ok(None),
        }
    }

    async fn setup_config(&self, id: &BotId) -> Result<Option<AgentConfig>> {
        let row: Option<(Option<serde_json::Value>,)> =
            sqlx::query_as("SELECT setup_config FROM bot_configs WHERE bot_id = $1")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        match row.and_then(|(blob,)| blob) {
            Some(blob) => Ok(Some(serde_json::from_value(blob)?)),
            None => Ok(None),
        }
    }

    async fn try_start(&self, id: &BotId) -> Result<bool> {
        let key = starting_lock_key(id);
        let Some(holder) = self.acquire_lock(&key).await? else {
            return Ok(false);
        };

        let outcome = async {
            match self.read_state(id).await? {
                BotState::ShouldStart => {
                    self.write_state(id, BotState::Starting).await?;
                    debug!(bot_id = %id, "Advanced to starting");
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
        .await;

        self.release_lock(&key, &holder).await;
        outcome
    }

    async fn try_stop(&self, id: &BotId) -> Result<StopDecision> {
        let key = stopping_lock_key(id);
        let Some(holder) = self.acquire_lock(&key).await? else {
            return Ok(StopDecision::None);
        };

        let outcome = async {
            match self.read_state(id).await? {
                BotState::ShouldStop => {
                    self.write_state(id, BotState::Stopping).await?;
                    debug!(bot_id = %id, "Advanced to stopping");
                    Ok(StopDecision::ToIdle)
                }
                BotState::ShouldRestart => {
                    self.write_state(id, BotState::Starting).await?;
                    debug!(bot_id = %id, "Advanced to starting for restart");
                    Ok(StopDecision::ToRestart)
                }
                _ => Ok(StopDecision::None),
            }
        }
        .await;

        self.release_lock(&key, &holder).await;
        outcome
    }

    async fn list_all_bots(&self) -> Result<Vec<BotId>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT bot_id FROM bot_states
            UNION
            SELECT bot_id FROM bot_configs
            ORDER BY bot_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| BotId::new(id)).collect())
    }

    async fn reset_all(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE bot_states SET state = 'idle', updated_at = now()")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM bot_configs").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM bot_locks").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM model_history").execute(&mut *tx).await?;
        tx.commit().await?;
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
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::seconds(60));

        sqlx::query(
            r#"
            INSERT INTO model_history (model, tokens, recorded_at, expires_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(model)
        .bind(tokens as i64)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn model_window_tokens(&self, model: &str) -> Result<u64> {
        // Opportunistic prune keeps the ledger small without a dedicated
        // background task.
        sqlx::query("DELETE FROM model_history WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?;

        let (sum,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(tokens), 0)
            FROM model_history
            WHERE model = $1 AND expires_at > now()
            "#,
        )
        .bind(model)
        .fetch_one(&self.pool)
        .await?;
        Ok(sum.max(0) as u64)
    }
}
