// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process configuration from environment variables.

use std::time::Duration;

/// Supervisor configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL URL for the configuration store and the usage sink.
    pub database_url: String,
    /// PostgreSQL URL for the state store. Defaults to `database_url`.
    pub state_url: String,
    /// User ids merged into every bot's DM allowlist.
    pub dm_allowlist_seeds: Vec<String>,
    /// Server ids merged into every bot's server allowlist.
    pub server_allowlist_seeds: Vec<String>,
    /// Model used when an agent row leaves the model blank.
    pub default_model: String,
    /// Reconciler tick period.
    pub tick_interval: Duration,
    /// Maximum simultaneous conversations per bot.
    pub max_channels: usize,
    /// Maximum pending messages per conversation.
    pub queue_capacity: usize,
    /// Command prefix used when a bot row leaves the prefix blank.
    pub command_prefix: String,
    /// Database connection pool size.
    pub db_pool_size: u32,
    /// Timeout for state store operations.
    pub store_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("BOTFLEET_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("BOTFLEET_DATABASE_URL"))?;

        let state_url =
            std::env::var("BOTFLEET_STATE_URL").unwrap_or_else(|_| database_url.clone());

        let dm_allowlist_seeds = split_csv(&std::env::var("BOTFLEET_DM_ALLOWLIST").unwrap_or_default());
        let server_allowlist_seeds =
            split_csv(&std::env::var("BOTFLEET_SERVER_ALLOWLIST").unwrap_or_default());

        let default_model = std::env::var("BOTFLEET_DEFAULT_MODEL")
            .unwrap_or_else(|_| "gemini-2.5-flash".to_string());

        let tick_interval = Duration::from_secs(
            std::env::var("BOTFLEET_TICK_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
        );

        let max_channels = std::env::var("BOTFLEET_MAX_CHANNELS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(100);

        let queue_capacity = std::env::var("BOTFLEET_QUEUE_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(64);

        let command_prefix =
            std::env::var("BOTFLEET_COMMAND_PREFIX").unwrap_or_else(|_| "!".to_string());

        let db_pool_size = std::env::var("BOTFLEET_DB_POOL_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(20);

        let store_timeout = Duration::from_millis(
            std::env::var("BOTFLEET_STORE_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10_000),
        );

        Ok(Self {
            database_url,
            state_url,
            dm_allowlist_seeds,
            server_allowlist_seeds,
            default_model,
            tick_interval,
            max_channels,
            queue_capacity,
            command_prefix,
            db_pool_size,
            store_timeout,
        })
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
}
