// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Botfleet - Multi-Tenant Chat-Bot Supervisor
//!
//! A single executable with two commands:
//!
//! - `botfleet run` - reset the transient state store, start the supervisor
//!   and reconciler, and serve until ctrl-c.
//! - `botfleet migrate` - apply the database schema and exit.
//!
//! External backends: the chat service and the agent engine are selected
//! through `BOTFLEET_CHAT_BACKEND` / `BOTFLEET_ENGINE_BACKEND`. The only
//! built-in value is `dev` (the in-process mock backends, useful for local
//! smoke runs); production deployments embed real backends through
//! [`botfleet_runtime::runtime::FleetRuntime::builder`].

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use botfleet_core::config_store::{ConfigDefaults, PostgresConfigStore};
use botfleet_core::state_store::{PostgresStateStore, StateStore};
use botfleet_core::usage::PostgresUsageSink;
use botfleet_core::{Config, migrations};
use botfleet_runtime::chat::{ChatService, MockChatService};
use botfleet_runtime::engine::{AgentEngine, MockEngine};
use botfleet_runtime::reconciler::ReconcilerConfig;
use botfleet_runtime::router::RouterConfig;
use botfleet_runtime::runtime::FleetRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "botfleet=info".into()),
        )
        .init();

    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let command = std::env::args().nth(1);
    match command.as_deref() {
        Some("run") => run().await,
        Some("migrate") => migrate().await,
        _ => {
            eprintln!("Usage: botfleet <run|migrate>");
            std::process::exit(2);
        }
    }
}

async fn connect(url: &str, pool_size: u32, timeout: std::time::Duration) -> Result<sqlx::PgPool> {
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(pool_size)
        .acquire_timeout(timeout)
        .connect(url)
        .await
        .context("Failed to connect to database")
}

async fn migrate() -> Result<()> {
    let config = Config::from_env()?;
    let pool = connect(&config.database_url, 2, config.store_timeout).await?;
    migrations::run(&pool).await?;
    if config.state_url != config.database_url {
        let state_pool = connect(&config.state_url, 2, config.store_timeout).await?;
        migrations::run(&state_pool).await?;
    }
    info!("Migrations applied");
    Ok(())
}

async fn run() -> Result<()> {
    let config = Config::from_env()?;

    info!(
        tick_interval_secs = config.tick_interval.as_secs(),
        max_channels = config.max_channels,
        queue_capacity = config.queue_capacity,
        "Starting botfleet"
    );

    let pool = connect(&config.database_url, config.db_pool_size, config.store_timeout).await?;
    migrations::run(&pool).await?;

    let state_pool = if config.state_url == config.database_url {
        pool.clone()
    } else {
        let state_pool =
            connect(&config.state_url, config.db_pool_size, config.store_timeout).await?;
        migrations::run(&state_pool).await?;
        state_pool
    };

    let state_store: Arc<dyn StateStore> = Arc::new(PostgresStateStore::new(state_pool));
    // Stale locks and in-flight markers from a crashed process would block
    // new transitions; the control plane re-marks desired state afterwards.
    state_store.reset_all().await?;
    info!("State store reset");

    let config_store = Arc::new(PostgresConfigStore::new(
        pool.clone(),
        ConfigDefaults {
            command_prefix: config.command_prefix.clone(),
            default_model: config.default_model.clone(),
        },
    ));
    let usage = Arc::new(PostgresUsageSink::new(pool.clone()));

    let chat: Arc<dyn ChatService> = match backend_env("BOTFLEET_CHAT_BACKEND").as_str() {
        "dev" => Arc::new(MockChatService::new()),
        other => bail!(
            "Unknown chat backend '{other}'; embed a real backend via FleetRuntime::builder"
        ),
    };
    let engine: Arc<dyn AgentEngine> = match backend_env("BOTFLEET_ENGINE_BACKEND").as_str() {
        "dev" => Arc::new(MockEngine::new()),
        other => bail!(
            "Unknown engine backend '{other}'; embed a real backend via FleetRuntime::builder"
        ),
    };

    let runtime = FleetRuntime::builder()
        .state_store(state_store)
        .config_store(config_store)
        .chat(chat)
        .engine(engine)
        .usage(usage)
        .router_config(RouterConfig {
            max_channels: config.max_channels,
            queue_capacity: config.queue_capacity,
            ..RouterConfig::default()
        })
        .reconciler_config(ReconcilerConfig { tick_interval: config.tick_interval })
        .allowlist_seeds(config.dm_allowlist_seeds.clone(), config.server_allowlist_seeds.clone())
        .build()?
        .start()
        .await;

    info!("Botfleet ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await;
    pool.close().await;
    info!("Botfleet shut down");

    Ok(())
}

fn backend_env(var: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| "dev".to_string())
}
