// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Drives observed bot state toward desired state.
//!
//! One long-running loop, stateless across ticks - all authority lives in
//! the state store, so a restarted process converges from scratch. Each
//! tick snapshots the known bot ids and runs the stop step before the start
//! step for every id: `should_restart` is handled by the stop step, which
//! demotes it to `starting` and re-marks `should_start` with configs
//! reloaded from the configuration store, so the same tick's start step
//! picks it up.
//!
//! Errors are isolated twice over: a failing bot never stops the tick, and
//! a failing tick never stops the loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use botfleet_core::config_store::ConfigStore;
use botfleet_core::state_store::{StateStore, StopDecision};
use botfleet_core::{BotId, BotState};

use crate::error::Result;
use crate::supervisor::WorkerSupervisor;

/// Reconciler configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Pause between ticks.
    pub tick_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self { tick_interval: Duration::from_secs(3) }
    }
}

/// The reconciliation loop.
pub struct Reconciler {
    store: Arc<dyn StateStore>,
    config_store: Arc<dyn ConfigStore>,
    supervisor: Arc<WorkerSupervisor>,
    config: ReconcilerConfig,
    shutdown: Arc<Notify>,
}

impl Reconciler {
    /// Create a reconciler over the given stores and supervisor.
    pub fn new(
        store: Arc<dyn StateStore>,
        config_store: Arc<dyn ConfigStore>,
        supervisor: Arc<WorkerSupervisor>,
        config: ReconcilerConfig,
    ) -> Self {
        Self { store, config_store, supervisor, config, shutdown: Arc::new(Notify::new()) }
    }

    /// Handle used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until shut down.
    pub async fn run(self) {
        info!(
            tick_interval_secs = self.config.tick_interval.as_secs_f64(),
            "Reconciler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Reconciler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.tick_interval) => {
                    self.tick().await;
                }
            }
        }

        info!("Reconciler stopped");
    }

    /// One pass over every known bot.
    pub async fn tick(&self) {
        let ids = match self.store.list_all_bots().await {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "Failed to list bots");
                return;
            }
        };

        for id in ids {
            if let Err(e) = self.reconcile_bot(&id).await {
                error!(bot_id = %id, error = %e, "Reconcile failed");
            }
        }
    }

    async fn reconcile_bot(&self, id: &BotId) -> Result<()> {
        // Stop step first: a restart demotes to starting here and the start
        // step below finishes the job in the same tick.
        match self.store.try_stop(id).await? {
            StopDecision::ToIdle => {
                self.supervisor.remove(id).await;
                self.store.set_state(id, BotState::Idle).await?;
                info!(bot_id = %id, "Bot stopped");
            }
            StopDecision::ToRestart => {
                self.supervisor.remove(id).await;
                match self.config_store.load_bot(id).await {
                    Ok((init, setup)) => {
                        self.store.mark_should_start(id, &init, &setup).await?;
                        info!(bot_id = %id, "Bot queued for restart");
                    }
                    Err(e) => {
                        error!(bot_id = %id, error = %e, "Config reload failed, settling to idle");
                        self.store.set_state(id, BotState::Idle).await?;
                        let text = e.to_string();
                        if let Err(e) = self.config_store.record_bot_error(id, Some(&text)).await {
                            warn!(bot_id = %id, error = %e, "Failed to record error note");
                        }
                    }
                }
            }
            StopDecision::None => {}
        }

        // Start step.
        if self.store.try_start(id).await? {
            let init = self.store.init_config(id).await?;
            let setup = self.store.setup_config(id).await?;
            match (init, setup) {
                (Some(init), Some(setup)) => {
                    if let Err(e) = self.supervisor.add(init, setup).await {
                        error!(bot_id = %id, error = %e, "Worker start failed");
                        let text = e.to_string();
                        if let Err(e) = self.config_store.record_bot_error(id, Some(&text)).await {
                            warn!(bot_id = %id, error = %e, "Failed to record error note");
                        }
                        self.store.set_state(id, BotState::Idle).await?;
                    }
                }
                _ => {
                    warn!(bot_id = %id, "Configs missing in state store, settling to idle");
                    self.store.set_state(id, BotState::Idle).await?;
                }
            }
        } else {
            debug!(bot_id = %id, "No start transition");
        }

        Ok(())
    }
}
