// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable supervisor runtime.
//!
//! This module provides [`FleetRuntime`], which wires the state store, the
//! configuration store, the chat and engine backends, and the usage sink
//! into a running supervisor + reconciler pair inside an existing tokio
//! application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use botfleet_runtime::runtime::FleetRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = FleetRuntime::builder()
//!         .state_store(state_store)
//!         .config_store(config_store)
//!         .chat(my_chat_backend)
//!         .engine(my_engine_backend)
//!         .usage(usage_sink)
//!         .build()?
//!         .start()
//!         .await;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use tracing::info;

use botfleet_core::config_store::ConfigStore;
use botfleet_core::state_store::StateStore;
use botfleet_core::usage::UsageSink;

use crate::chat::ChatService;
use crate::engine::AgentEngine;
use crate::error::{Error, Result};
use crate::reconciler::{Reconciler, ReconcilerConfig};
use crate::router::RouterConfig;
use crate::supervisor::{BotSummary, WorkerContext, WorkerSupervisor};

/// Builder for a [`FleetRuntime`].
#[derive(Default)]
pub struct FleetRuntimeBuilder {
    state_store: Option<Arc<dyn StateStore>>,
    config_store: Option<Arc<dyn ConfigStore>>,
    chat: Option<Arc<dyn ChatService>>,
    engine: Option<Arc<dyn AgentEngine>>,
    usage: Option<Arc<dyn UsageSink>>,
    router_config: Option<RouterConfig>,
    reconciler_config: Option<ReconcilerConfig>,
    dm_allowlist_seeds: Vec<String>,
    server_allowlist_seeds: Vec<String>,
}

impl FleetRuntimeBuilder {
    /// Set the shared state store (required).
    pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    /// Set the configuration store (required).
    pub fn config_store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.config_store = Some(store);
        self
    }

    /// Set the chat backend (required).
    pub fn chat(mut self, chat: Arc<dyn ChatService>) -> Self {
        self.chat = Some(chat);
        self
    }

    /// Set the engine backend (required).
    pub fn engine(mut self, engine: Arc<dyn AgentEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Set the usage sink (required).
    pub fn usage(mut self, usage: Arc<dyn UsageSink>) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Override router bounds. Default: 100 channels, 64 items each.
    pub fn router_config(mut self, config: RouterConfig) -> Self {
        self.router_config = Some(config);
        self
    }

    /// Override the reconciler tick. Default: 3 seconds.
    pub fn reconciler_config(mut self, config: ReconcilerConfig) -> Self {
        self.reconciler_config = Some(config);
        self
    }

    /// Environment-level allowlist seeds merged into every bot.
    pub fn allowlist_seeds(mut self, dm: Vec<String>, server: Vec<String>) -> Self {
        self.dm_allowlist_seeds = dm;
        self.server_allowlist_seeds = server;
        self
    }

    /// Validate and assemble the runtime. Nothing runs until
    /// [`FleetRuntime::start`].
    pub fn build(self) -> Result<FleetRuntime> {
        let state_store =
            self.state_store.ok_or_else(|| Error::Other("state_store is required".into()))?;
        let config_store =
            self.config_store.ok_or_else(|| Error::Other("config_store is required".into()))?;
        let chat = self.chat.ok_or_else(|| Error::Other("chat backend is required".into()))?;
        let engine =
            self.engine.ok_or_else(|| Error::Other("engine backend is required".into()))?;
        let usage = self.usage.ok_or_else(|| Error::Other("usage sink is required".into()))?;

        let supervisor = WorkerSupervisor::new(WorkerContext {
            state_store: state_store.clone(),
            config_store: config_store.clone(),
            chat,
            engine,
            usage,
            router_config: self.router_config.unwrap_or_default(),
            dm_allowlist_seeds: self.dm_allowlist_seeds,
            server_allowlist_seeds: self.server_allowlist_seeds,
        });

        Ok(FleetRuntime {
            state_store,
            config_store,
            supervisor,
            reconciler_config: self.reconciler_config.unwrap_or_default(),
        })
    }
}

/// A wired (and, after [`start`](FleetRuntime::start), running) supervisor.
pub struct FleetRuntime {
    state_store: Arc<dyn StateStore>,
    config_store: Arc<dyn ConfigStore>,
    supervisor: Arc<WorkerSupervisor>,
    reconciler_config: ReconcilerConfig,
}

impl FleetRuntime {
    /// Create a builder.
    pub fn builder() -> FleetRuntimeBuilder {
        FleetRuntimeBuilder::default()
    }

    /// Spawn the reconciler loop.
    pub async fn start(self) -> Self {
        let reconciler = Reconciler::new(
            self.state_store.clone(),
            self.config_store.clone(),
            self.supervisor.clone(),
            self.reconciler_config.clone(),
        );
        self.supervisor.start(reconciler).await;
        info!("Fleet runtime started");
        self
    }

    /// The supervisor, for direct driving in tests and embedders.
    pub fn supervisor(&self) -> &Arc<WorkerSupervisor> {
        &self.supervisor
    }

    /// Read-only monitoring snapshot across all bots.
    pub async fn snapshot(&self) -> Vec<BotSummary> {
        self.supervisor.snapshot().await
    }

    /// Stop the reconciler, then every worker.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
        info!("Fleet runtime shut down");
    }
}
