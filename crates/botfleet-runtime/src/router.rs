// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-conversation fair queue.
//!
//! Routes messages into bounded per-key queues, each drained by exactly one
//! serial worker task. Messages for one conversation key are handled in
//! arrival order; distinct keys proceed concurrently. Two capacity bounds
//! keep resources finite:
//!
//! - `max_channels`: simultaneous keys with a live queue. At the bound, the
//!   least-recently-active idle queue is evicted; if nothing is evictable
//!   the enqueue fails with [`RouterError::Saturated`].
//! - `queue_capacity`: pending items per key. A full queue blocks the
//!   enqueue for a short bounded wait, then fails with
//!   [`RouterError::Backlogged`].
//!
//! Handler failures are the handler's problem: the serial worker awaits the
//! closure and moves on, so one bad message never poisons its queue.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use botfleet_core::ConversationKey;

/// Errors surfaced to the enqueueing side.
#[derive(Debug, Error)]
pub enum RouterError {
    /// All queue slots are occupied by non-idle conversations.
    #[error("Router saturated: {max_channels} conversations active")]
    Saturated {
        /// The configured bound that was hit.
        max_channels: usize,
    },
    /// The per-key queue stayed full for the whole bounded wait.
    #[error("Channel backlogged: {key}")]
    Backlogged {
        /// Canonical form of the affected key.
        key: String,
    },
    /// The router was shut down.
    #[error("Router is shut down")]
    ShutDown,
}

/// Router capacity bounds.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum simultaneous conversation keys with a live queue.
    pub max_channels: usize,
    /// Maximum pending items per key.
    pub queue_capacity: usize,
    /// How long a full-queue enqueue may block before failing.
    pub enqueue_wait: Duration,
    /// How long shutdown lets workers drain before cancelling them.
    pub drain_window: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_channels: 100,
            queue_capacity: 64,
            enqueue_wait: Duration::from_secs(1),
            drain_window: Duration::from_secs(5),
        }
    }
}

/// Boxed future a handler returns.
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Per-item handler. Errors must be absorbed inside the closure.
pub type Handler<T> = Box<dyn FnOnce(T) -> HandlerFuture + Send>;

struct QueueItem<T> {
    payload: T,
    handler: Handler<T>,
    enqueue_time: Instant,
}

struct QueueStats {
    pending: AtomicUsize,
    in_flight: AtomicBool,
    last_activity: StdMutex<Instant>,
    idle: Notify,
}

impl QueueStats {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: AtomicUsize::new(0),
            in_flight: AtomicBool::new(false),
            last_activity: StdMutex::new(Instant::now()),
            idle: Notify::new(),
        })
    }

    fn is_idle(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0 && !self.in_flight.load(Ordering::SeqCst)
    }

    fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap()
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }
}

struct ChannelQueue<T> {
    tx: mpsc::Sender<QueueItem<T>>,
    worker: JoinHandle<()>,
    stats: Arc<QueueStats>,
}

/// Monitoring view of one queue.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    /// Canonical key form.
    pub key: String,
    /// Items waiting in the queue.
    pub pending: usize,
    /// Whether a handler call is in flight.
    pub in_flight: bool,
    /// Time since the queue last dequeued or finished an item.
    pub idle_for: Duration,
}

/// Monitoring view of the whole router.
#[derive(Debug, Clone, Serialize)]
pub struct RouterSnapshot {
    /// Per-key views.
    pub channels: Vec<ChannelSnapshot>,
    /// Sum of pending counts.
    pub total_pending: usize,
}

/// Per-bot fair-queue router.
pub struct ChannelRouter<T> {
    config: RouterConfig,
    queues: Mutex<HashMap<ConversationKey, ChannelQueue<T>>>,
    closed: AtomicBool,
}

impl<T: Send + 'static> ChannelRouter<T> {
    /// Create an empty router.
    pub fn new(config: RouterConfig) -> Self {
        Self { config, queues: Mutex::new(HashMap::new()), closed: AtomicBool::new(false) }
    }

    /// Enqueue one item under `key`. Creates the queue (and its serial
    /// worker) on first use, evicting the least-recently-active idle queue
    /// when the channel bound is hit.
    pub async fn enqueue(
        &self,
        key: ConversationKey,
        payload: T,
        handler: Handler<T>,
    ) -> Result<(), RouterError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RouterError::ShutDown);
        }

        let (tx, stats) = {
            let mut queues = self.queues.lock().await;
            if !queues.contains_key(&key) {
                if queues.len() >= self.config.max_channels {
                    self.evict_one(&mut queues)?;
                }
                let queue = self.spawn_queue(&key);
                queues.insert(key.clone(), queue);
            }
            let queue = queues.get(&key).expect("queue just ensured");
            // Reserve the slot while the map guard is held, so a concurrent
            // eviction can never pick this queue.
            queue.stats.pending.fetch_add(1, Ordering::SeqCst);
            (queue.tx.clone(), queue.stats.clone())
        };

        let item = QueueItem { payload, handler, enqueue_time: Instant::now() };
        match tx.send_timeout(item, self.config.enqueue_wait).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                stats.pending.fetch_sub(1, Ordering::SeqCst);
                warn!(key = %key, "Channel backlogged, dropping message");
                Err(RouterError::Backlogged { key: key.canonical() })
            }
            Err(SendTimeoutError::Closed(_)) => {
                stats.pending.fetch_sub(1, Ordering::SeqCst);
                Err(RouterError::ShutDown)
            }
        }
    }

    fn spawn_queue(&self, key: &ConversationKey) -> ChannelQueue<T> {
        let (tx, mut rx) = mpsc::channel::<QueueItem<T>>(self.config.queue_capacity);
        let stats = QueueStats::new();
        let worker_stats = stats.clone();
        let worker_key = key.clone();

        let worker = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                // in_flight goes up before pending goes down, so the queue
                // never looks idle (and evictable) between dequeue and
                // handler entry.
                worker_stats.in_flight.store(true, Ordering::SeqCst);
                worker_stats.pending.fetch_sub(1, Ordering::SeqCst);
                worker_stats.touch();
                debug!(
                    key = %worker_key,
                    queued_ms = item.enqueue_time.elapsed().as_millis() as u64,
                    "Dequeued message"
                );
                (item.handler)(item.payload).await;
                worker_stats.in_flight.store(false, Ordering::SeqCst);
                worker_stats.touch();
                worker_stats.idle.notify_waiters();
            }
            worker_stats.idle.notify_waiters();
        });

        debug!(key = %key, "Spawned channel worker");
        ChannelQueue { tx, worker, stats }
    }

    /// Evict the least-recently-active idle queue, or fail with
    /// [`RouterError::Saturated`] when every queue has work.
    fn evict_one(
        &self,
        queues: &mut HashMap<ConversationKey, ChannelQueue<T>>,
    ) -> Result<(), RouterError> {
        let candidate = queues
            .iter()
            .filter(|(_, q)| q.stats.is_idle())
            .min_by_key(|(_, q)| q.stats.last_activity())
            .map(|(k, _)| k.clone());

        match candidate {
            Some(key) => {
                // Dropping the sender ends the (idle) worker loop.
                let queue = queues.remove(&key).expect("candidate came from the map");
                drop(queue.tx);
                debug!(key = %key, "Evicted idle channel queue");
                Ok(())
            }
            None => {
                error!(max_channels = self.config.max_channels, "Router saturated");
                Err(RouterError::Saturated { max_channels: self.config.max_channels })
            }
        }
    }

    /// Number of live queues.
    pub async fn channel_count(&self) -> usize {
        self.queues.lock().await.len()
    }

    /// Wait until the queue for `key` is empty with no handler in flight.
    /// A key with no queue is idle by definition.
    pub async fn wait_channel_idle(&self, key: &ConversationKey) {
        loop {
            let stats = {
                let queues = self.queues.lock().await;
                match queues.get(key) {
                    Some(queue) => queue.stats.clone(),
                    None => return,
                }
            };
            if Self::wait_stats_idle(&stats).await {
                return;
            }
        }
    }

    /// Wait until every queue is idle.
    pub async fn wait_all_idle(&self) {
        loop {
            let all: Vec<Arc<QueueStats>> = {
                let queues = self.queues.lock().await;
                queues.values().map(|q| q.stats.clone()).collect()
            };
            let mut settled = true;
            for stats in &all {
                if !Self::wait_stats_idle(stats).await {
                    settled = false;
                }
            }
            if settled {
                return;
            }
        }
    }

    /// Returns true once the given stats were observed idle.
    async fn wait_stats_idle(stats: &QueueStats) -> bool {
        if stats.is_idle() {
            return true;
        }
        // Register for the wakeup before the re-check; an unpolled Notified
        // future would miss notify_waiters entirely.
        let mut notified = std::pin::pin!(stats.idle.notified());
        notified.as_mut().enable();
        if stats.is_idle() {
            return true;
        }
        notified.await;
        stats.is_idle()
    }

    /// Monitoring snapshot.
    pub async fn snapshot(&self) -> RouterSnapshot {
        let queues = self.queues.lock().await;
        let mut channels: Vec<ChannelSnapshot> = queues
            .iter()
            .map(|(key, queue)| ChannelSnapshot {
                key: key.canonical(),
                pending: queue.stats.pending.load(Ordering::SeqCst),
                in_flight: queue.stats.in_flight.load(Ordering::SeqCst),
                idle_for: queue.stats.last_activity().elapsed(),
            })
            .collect();
        channels.sort_by(|a, b| a.key.cmp(&b.key));
        let total_pending = channels.iter().map(|c| c.pending).sum();
        RouterSnapshot { channels, total_pending }
    }

    /// Drain all workers within the drain window, then cancel stragglers.
    /// The router rejects enqueues from the first moment of shutdown.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<(ConversationKey, ChannelQueue<T>)> = {
            let mut queues = self.queues.lock().await;
            queues.drain().collect()
        };

        for (key, queue) in drained {
            // Dropping the sender lets the worker finish remaining items
            // and exit.
            drop(queue.tx);
            let mut worker = queue.worker;
            if tokio::time::timeout(self.config.drain_window, &mut worker).await.is_err() {
                warn!(key = %key, "Channel worker did not drain in time, cancelling");
                worker.abort();
            }
        }
    }
}

impl<T> Drop for ChannelRouter<T> {
    fn drop(&mut self) {
        // Workers holding only a dropped receiver will exit on their own;
        // anything mid-handler is detached.
        self.closed.store(true, Ordering::SeqCst);
    }
}
