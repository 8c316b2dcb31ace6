// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The external configuration store.
//!
//! Authoritative bot and agent rows live in a relational database owned by
//! the control plane. The supervisor only reads them (on every start and
//! restart) and writes back a single error text when a start fails, so the
//! control plane can surface it.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::Mutex;

use crate::bot::{AgentConfig, BotId, InitConfig};
use crate::error::{CoreError, Result};
use crate::tools;

/// Defaults applied when a bot or agent row leaves a field blank.
#[derive(Debug, Clone)]
pub struct ConfigDefaults {
    /// Command prefix for bots without one.
    pub command_prefix: String,
    /// Model for agents without one.
    pub default_model: String,
}

impl Default for ConfigDefaults {
    fn default() -> Self {
        Self {
            command_prefix: "!".to_string(),
            default_model: "gemini-2.5-flash".to_string(),
        }
    }
}

/// Read access to the authoritative bot/agent rows.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// All configured bot ids.
    async fn list_bot_ids(&self) -> Result<Vec<BotId>>;

    /// Load both config blobs for one bot. Tool names are validated here;
    /// an unknown tool is a config error, fatal to the bot.
    async fn load_bot(&self, id: &BotId) -> Result<(InitConfig, AgentConfig)>;

    /// Record (or clear, with `None`) the start-failure text on the bot row.
    async fn record_bot_error(&self, id: &BotId, error: Option<&str>) -> Result<()>;
}

/// PostgreSQL-backed [`ConfigStore`].
pub struct PostgresConfigStore {
    pool: PgPool,
    defaults: ConfigDefaults,
}

impl PostgresConfigStore {
    /// Create a store over an existing pool.
    pub fn new(pool: PgPool, defaults: ConfigDefaults) -> Self {
        Self { pool, defaults }
    }
}

#[derive(sqlx::FromRow)]
struct BotRow {
    id: i64,
    credential_token: String,
    error_message: String,
    command_prefix: Option<String>,
    dm_allowlist: serde_json::Value,
    server_allowlist: serde_json::Value,
    function_display_map: serde_json::Value,
    agent_id: Option<i64>,
    agent_name: Option<String>,
    description: Option<String>,
    role_instructions: Option<String>,
    tool_instructions: Option<String>,
    model_name: Option<String>,
    tools: Option<serde_json::Value>,
}

fn string_list(value: &serde_json::Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl ConfigStore for PostgresConfigStore {
    async fn list_bot_ids(&self) -> Result<Vec<BotId>> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT id FROM bots ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| BotId::from_row_id(id)).collect())
    }

    async fn load_bot(&self, id: &BotId) -> Result<(InitConfig, AgentConfig)> {
        let row_id = id
            .row_id()
            .ok_or_else(|| CoreError::BotNotFound(id.as_str().to_string()))?;

        let row: Option<BotRow> = sqlx::query_as(
            r#"
            SELECT
                b.id, b.credential_token, b.error_message, b.command_prefix,
                b.dm_allowlist, b.server_allowlist, b.function_display_map,
                a.id AS agent_id, a.name AS agent_name, a.description,
                a.role_instructions, a.tool_instructions, a.model_name, a.tools
            FROM bots b
            LEFT JOIN agents a ON a.id = b.agent_id
            WHERE b.id = $1
            "#,
        )
        .bind(row_id)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or_else(|| CoreError::BotNotFound(id.as_str().to_string()))?;
        let agent_id = row.agent_id.ok_or_else(|| CoreError::InvalidConfig {
            bot_id: id.as_str().to_string(),
            reason: "bot has no agent assigned".to_string(),
        })?;

        let init = InitConfig {
            bot_id: id.clone(),
            credential_token: row.credential_token,
            command_prefix: row
                .command_prefix
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| self.defaults.command_prefix.clone()),
            dm_allowlist: string_list(&row.dm_allowlist).into_iter().collect(),
            server_allowlist: string_list(&row.server_allowlist).into_iter().collect(),
        };

        let tool_names = row.tools.as_ref().map(string_list).unwrap_or_default();
        tools::validate(&tool_names)?;

        let function_display_map = row
            .function_display_map
            .as_object()
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let setup = AgentConfig {
            agent_id,
            agent_name: row.agent_name.unwrap_or_default(),
            app_name: id.as_str().to_string(),
            description: row.description.unwrap_or_default(),
            role_instructions: row.role_instructions.unwrap_or_default(),
            tool_instructions: row.tool_instructions.unwrap_or_default(),
            model_name: row
                .model_name
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| self.defaults.default_model.clone()),
            tools: tool_names,
            function_display_map,
            error_message: row.error_message,
        };

        Ok((init, setup))
    }

    async fn record_bot_error(&self, id: &BotId, error: Option<&str>) -> Result<()> {
        let row_id = id
            .row_id()
            .ok_or_else(|| CoreError::BotNotFound(id.as_str().to_string()))?;
        sqlx::query("UPDATE bots SET last_error = $1 WHERE id = $2")
            .bind(error)
            .bind(row_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// In-memory [`ConfigStore`] for tests.
#[derive(Default)]
pub struct MemoryConfigStore {
    bots: Mutex<HashMap<BotId, (InitConfig, AgentConfig)>>,
    errors: Mutex<HashMap<BotId, String>>,
}

impl MemoryConfigStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a bot's configuration pair.
    pub async fn put_bot(&self, id: BotId, init: InitConfig, setup: AgentConfig) {
        self.bots.lock().await.insert(id, (init, setup));
    }

    /// Remove a bot entirely.
    pub async fn remove_bot(&self, id: &BotId) {
        self.bots.lock().await.remove(id);
    }

    /// The last error recorded for a bot, if any.
    pub async fn last_error(&self, id: &BotId) -> Option<String> {
        self.errors.lock().await.get(id).cloned()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn list_bot_ids(&self) -> Result<Vec<BotId>> {
        let mut ids: Vec<BotId> = self.bots.lock().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn load_bot(&self, id: &BotId) -> Result<(InitConfig, AgentConfig)> {
        let bots = self.bots.lock().await;
        let (init, setup) = bots
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::BotNotFound(id.as_str().to_string()))?;
        tools::validate(&setup.tools)?;
        Ok((init, setup))
    }

    async fn record_bot_error(&self, id: &BotId, error: Option<&str>) -> Result<()> {
        let mut errors = self.errors.lock().await;
        match error {
            Some(text) => {
                errors.insert(id.clone(), text.to_string());
            }
            None => {
                errors.remove(id);
            }
        }
        Ok(())
    }
}
