// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process registry of live bot workers.
//!
//! One entry per bot id, mutated only through [`WorkerSupervisor::add`] and
//! [`WorkerSupervisor::remove`] under a single guard, so concurrent
//! reconciler ticks never race the map. The registry is deliberately NOT
//! shared across processes - cross-process authority lives in the state
//! store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, Notify, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use botfleet_core::config_store::ConfigStore;
use botfleet_core::state_store::StateStore;
use botfleet_core::usage::UsageSink;
use botfleet_core::{AgentConfig, BotId, BotState, InitConfig, models};

use crate::agent_runner::AgentRunner;
use crate::chat::ChatService;
use crate::engine::AgentEngine;
use crate::error::Result;
use crate::reconciler::Reconciler;
use crate::router::{ChannelRouter, RouterConfig, RouterSnapshot};
use crate::worker::BotWorker;

/// How long a removed worker gets to stop cooperatively before it is
/// aborted. Must exceed the router drain window.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything needed to materialize a worker.
pub struct WorkerContext {
    /// Shared lifecycle registry.
    pub state_store: Arc<dyn StateStore>,
    /// Authoritative bot/agent rows.
    pub config_store: Arc<dyn ConfigStore>,
    /// Chat backend.
    pub chat: Arc<dyn ChatService>,
    /// Engine backend.
    pub engine: Arc<dyn AgentEngine>,
    /// Usage write path.
    pub usage: Arc<dyn UsageSink>,
    /// Router bounds applied to every bot.
    pub router_config: RouterConfig,
    /// Environment-level DM allowlist seeds.
    pub dm_allowlist_seeds: Vec<String>,
    /// Environment-level server allowlist seeds.
    pub server_allowlist_seeds: Vec<String>,
}

struct BotHandle {
    worker: Arc<BotWorker>,
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

struct ReconcilerTask {
    task: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

/// Monitoring view of one live bot.
#[derive(Debug, Clone, Serialize)]
pub struct BotSummary {
    /// Bot id.
    pub bot_id: String,
    /// Router state for the bot.
    pub router: RouterSnapshot,
}

/// Process-wide registry of running bots.
pub struct WorkerSupervisor {
    ctx: WorkerContext,
    bots: Mutex<HashMap<BotId, BotHandle>>,
    reconciler: Mutex<Option<ReconcilerTask>>,
}

impl WorkerSupervisor {
    /// Create an empty supervisor.
    pub fn new(ctx: WorkerContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            bots: Mutex::new(HashMap::new()),
            reconciler: Mutex::new(None),
        })
    }

    /// Materialize and register a worker for the given configs.
    ///
    /// Resolves the model through the catalog (a config error here is fatal
    /// to the bot and surfaced to the caller), spawns the worker task, and
    /// arranges the readiness write-back: `running` once the connection
    /// reports ready, `idle` plus an error note on the config row when the
    /// start fails. A duplicate add logs and no-ops.
    pub async fn add(self: &Arc<Self>, mut init: InitConfig, agent: AgentConfig) -> Result<()> {
        let bot_id = init.bot_id.clone();
        init.merge_allowlist_seeds(
            self.ctx.dm_allowlist_seeds.iter().map(String::as_str),
            self.ctx.server_allowlist_seeds.iter().map(String::as_str),
        );

        let model = models::resolve(&agent.model_name)?;

        let mut bots = self.bots.lock().await;
        if bots.contains_key(&bot_id) {
            warn!(bot_id = %bot_id, "Worker already present, ignoring add");
            return Ok(());
        }

        let router = Arc::new(ChannelRouter::new(self.ctx.router_config.clone()));
        let runner = AgentRunner::new(
            self.ctx.engine.clone(),
            self.ctx.state_store.clone(),
            self.ctx.usage.clone(),
            agent.clone(),
            model,
        );
        let worker = Arc::new(BotWorker::new(
            init,
            agent,
            self.ctx.chat.clone(),
            self.ctx.engine.clone(),
            router,
            runner,
        ));

        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();

        let task = {
            let worker = worker.clone();
            let cancel = cancel.clone();
            let this = Arc::downgrade(self);
            let state_store = self.ctx.state_store.clone();
            let bot_id = bot_id.clone();
            tokio::spawn(async move {
                worker.run(cancel.clone(), ready_tx).await;
                if cancel.is_cancelled() {
                    return;
                }
                // The worker died on its own (connection loss, startup
                // failure). Drop it from the registry and settle the state;
                // the reconciler re-evaluates desired state next tick.
                warn!(bot_id = %bot_id, "Worker exited unexpectedly");
                if let Some(supervisor) = this.upgrade() {
                    supervisor.detach(&bot_id).await;
                }
                if let Err(e) = state_store.set_state(&bot_id, BotState::Idle).await {
                    error!(bot_id = %bot_id, error = %e, "Failed to settle state after worker death");
                }
            })
        };

        bots.insert(bot_id.clone(), BotHandle { worker, task, cancel });
        drop(bots);

        // Readiness write-back.
        {
            let state_store = self.ctx.state_store.clone();
            let config_store = self.ctx.config_store.clone();
            let bot_id = bot_id.clone();
            tokio::spawn(async move {
                match ready_rx.await {
                    Ok(Ok(())) => {
                        if let Err(e) = state_store.set_state(&bot_id, BotState::Running).await {
                            error!(bot_id = %bot_id, error = %e, "Failed to write running state");
                        }
                        if let Err(e) = config_store.record_bot_error(&bot_id, None).await {
                            warn!(bot_id = %bot_id, error = %e, "Failed to clear error note");
                        }
                        info!(bot_id = %bot_id, "Bot running");
                    }
                    Ok(Err(e)) => {
                        error!(bot_id = %bot_id, error = %e, "Bot failed to start");
                        let text = e.to_string();
                        if let Err(e) = config_store.record_bot_error(&bot_id, Some(&text)).await {
                            warn!(bot_id = %bot_id, error = %e, "Failed to record error note");
                        }
                    }
                    // Worker dropped the channel without reporting: the
                    // death path above already settled things.
                    Err(_) => {}
                }
            });
        }

        info!(bot_id = %bot_id, "Worker registered");
        Ok(())
    }

    /// Cooperatively stop and deregister a worker. Returns false when the
    /// bot was not present.
    pub async fn remove(&self, id: &BotId) -> bool {
        let handle = self.bots.lock().await.remove(id);
        let Some(handle) = handle else {
            return false;
        };

        handle.cancel.cancel();
        let mut task = handle.task;
        if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
            warn!(bot_id = %id, "Worker did not stop in time, aborting");
            task.abort();
        }
        info!(bot_id = %id, "Worker removed");
        true
    }

    /// Drop a registry entry without joining its task. Used by the worker
    /// task itself on unexpected death.
    async fn detach(&self, id: &BotId) {
        self.bots.lock().await.remove(id);
    }

    /// Whether a worker is registered for the bot.
    pub async fn contains(&self, id: &BotId) -> bool {
        self.bots.lock().await.contains_key(id)
    }

    /// The live worker for a bot, if present.
    pub async fn get(&self, id: &BotId) -> Option<Arc<BotWorker>> {
        self.bots.lock().await.get(id).map(|handle| handle.worker.clone())
    }

    /// Ids of all registered workers.
    pub async fn list_all(&self) -> Vec<BotId> {
        let mut ids: Vec<BotId> = self.bots.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Read-only monitoring snapshot across all bots.
    pub async fn snapshot(&self) -> Vec<BotSummary> {
        let workers: Vec<(BotId, Arc<BotWorker>)> = {
            let bots = self.bots.lock().await;
            bots.iter().map(|(id, handle)| (id.clone(), handle.worker.clone())).collect()
        };
        let mut summaries = Vec::with_capacity(workers.len());
        for (bot_id, worker) in workers {
            summaries.push(BotSummary {
                bot_id: bot_id.as_str().to_string(),
                router: worker.router().snapshot().await,
            });
        }
        summaries.sort_by(|a, b| a.bot_id.cmp(&b.bot_id));
        summaries
    }

    /// Start the reconciler loop on this supervisor.
    pub async fn start(&self, reconciler: Reconciler) {
        let mut guard = self.reconciler.lock().await;
        if guard.is_some() {
            warn!("Reconciler already running");
            return;
        }
        let shutdown = reconciler.shutdown_handle();
        let task = tokio::spawn(reconciler.run());
        *guard = Some(ReconcilerTask { task, shutdown });
    }

    /// Stop the reconciler loop.
    pub async fn stop(&self) {
        let taken = self.reconciler.lock().await.take();
        if let Some(reconciler) = taken {
            reconciler.shutdown.notify_one();
            let mut task = reconciler.task;
            if tokio::time::timeout(Duration::from_secs(5), &mut task).await.is_err() {
                warn!("Reconciler did not stop in time, aborting");
                task.abort();
            }
        }
    }

    /// Stop the reconciler and remove every worker.
    pub async fn shutdown(&self) {
        self.stop().await;
        for id in self.list_all().await {
            self.remove(&id).await;
        }
    }
}
