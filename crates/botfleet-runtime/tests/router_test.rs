// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the per-conversation fair queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore};

use botfleet_core::ConversationKey;
use botfleet_runtime::router::{
    ChannelRouter, Handler, HandlerFuture, RouterConfig, RouterError,
};

fn handler<F, Fut>(f: F) -> Handler<String>
where
    F: FnOnce(String) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Box::new(move |payload| -> HandlerFuture { Box::pin(f(payload)) })
}

fn quick_config() -> RouterConfig {
    RouterConfig {
        max_channels: 4,
        queue_capacity: 8,
        enqueue_wait: Duration::from_millis(50),
        drain_window: Duration::from_millis(500),
    }
}

#[tokio::test]
async fn test_same_key_messages_processed_in_order() {
    let router = ChannelRouter::new(quick_config());
    let processed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let key = ConversationKey::channel("1");

    for label in ["a", "b", "c"] {
        let processed = processed.clone();
        router
            .enqueue(
                key.clone(),
                label.to_string(),
                handler(move |payload| async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    processed.lock().await.push(payload);
                }),
            )
            .await
            .unwrap();
    }

    router.wait_channel_idle(&key).await;
    assert_eq!(*processed.lock().await, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_distinct_keys_processed_concurrently() {
    let router = ChannelRouter::new(quick_config());
    let start = Instant::now();

    for channel in ["a", "b"] {
        router
            .enqueue(
                ConversationKey::channel(channel),
                channel.to_string(),
                handler(|_| async move {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                }),
            )
            .await
            .unwrap();
    }

    router.wait_all_idle().await;
    let elapsed = start.elapsed();
    // Two 150ms handlers in parallel must finish well under 2x150ms.
    assert!(elapsed < Duration::from_millis(270), "took {elapsed:?}");
}

#[tokio::test]
async fn test_full_queue_rejects_with_backlogged() {
    let config = RouterConfig { queue_capacity: 1, ..quick_config() };
    let router = ChannelRouter::new(config);
    let key = ConversationKey::channel("busy");
    let gate = Arc::new(Semaphore::new(0));

    // First item occupies the worker, second fills the queue.
    for _ in 0..2 {
        let gate = gate.clone();
        router
            .enqueue(
                key.clone(),
                String::new(),
                handler(move |_| async move {
                    gate.acquire().await.unwrap().forget();
                }),
            )
            .await
            .unwrap();
    }

    let result = router
        .enqueue(key.clone(), String::new(), handler(|_| async {}))
        .await;
    assert!(matches!(result, Err(RouterError::Backlogged { .. })));

    gate.add_permits(2);
    router.wait_channel_idle(&key).await;
}

#[tokio::test]
async fn test_saturation_and_idle_eviction() {
    let config = RouterConfig { max_channels: 1, ..quick_config() };
    let router = ChannelRouter::new(config);
    let busy = ConversationKey::channel("busy");
    let gate = Arc::new(Semaphore::new(0));

    {
        let gate = gate.clone();
        router
            .enqueue(
                busy.clone(),
                String::new(),
                handler(move |_| async move {
                    gate.acquire().await.unwrap().forget();
                }),
            )
            .await
            .unwrap();
    }

    // The only slot is held by a non-idle queue: saturated.
    let result = router
        .enqueue(ConversationKey::channel("other"), String::new(), handler(|_| async {}))
        .await;
    assert!(matches!(result, Err(RouterError::Saturated { max_channels: 1 })));

    // Once the first conversation settles, its slot is evictable.
    gate.add_permits(1);
    router.wait_channel_idle(&busy).await;

    router
        .enqueue(ConversationKey::channel("other"), String::new(), handler(|_| async {}))
        .await
        .unwrap();
    router.wait_all_idle().await;
    assert_eq!(router.channel_count().await, 1);
}

#[tokio::test]
async fn test_failed_handler_does_not_stall_queue() {
    let router = ChannelRouter::new(quick_config());
    let key = ConversationKey::channel("1");
    let processed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    // Handlers absorb their own failures; a message whose handling went
    // wrong must not block the ones behind it.
    router
        .enqueue(
            key.clone(),
            "failing".to_string(),
            handler(|_| async {
                // Simulates a handler that swallowed an internal error.
            }),
        )
        .await
        .unwrap();

    {
        let processed = processed.clone();
        router
            .enqueue(
                key.clone(),
                "after".to_string(),
                handler(move |payload| async move {
                    processed.lock().await.push(payload);
                }),
            )
            .await
            .unwrap();
    }

    router.wait_channel_idle(&key).await;
    assert_eq!(*processed.lock().await, vec!["after"]);
}

#[tokio::test]
async fn test_snapshot_reflects_pending_and_in_flight() {
    let config = RouterConfig { queue_capacity: 4, ..quick_config() };
    let router = ChannelRouter::new(config);
    let key = ConversationKey::channel("1");
    let gate = Arc::new(Semaphore::new(0));

    for _ in 0..2 {
        let gate = gate.clone();
        router
            .enqueue(
                key.clone(),
                String::new(),
                handler(move |_| async move {
                    gate.acquire().await.unwrap().forget();
                }),
            )
            .await
            .unwrap();
    }

    // Give the worker a moment to pick up the first item.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let snapshot = router.snapshot().await;
    assert_eq!(snapshot.channels.len(), 1);
    assert_eq!(snapshot.channels[0].key, "ch:1");
    assert_eq!(snapshot.channels[0].pending, 1);
    assert!(snapshot.channels[0].in_flight);
    assert_eq!(snapshot.total_pending, 1);

    gate.add_permits(2);
    router.wait_all_idle().await;

    let snapshot = router.snapshot().await;
    assert_eq!(snapshot.total_pending, 0);
    assert!(!snapshot.channels[0].in_flight);
}

#[tokio::test]
async fn test_shutdown_drains_then_rejects() {
    let router = ChannelRouter::new(quick_config());
    let key = ConversationKey::channel("1");
    let processed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    for label in ["a", "b", "c"] {
        let processed = processed.clone();
        router
            .enqueue(
                key.clone(),
                label.to_string(),
                handler(move |payload| async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    processed.lock().await.push(payload);
                }),
            )
            .await
            .unwrap();
    }

    router.shutdown().await;
    assert_eq!(*processed.lock().await, vec!["a", "b", "c"]);

    let result = router
        .enqueue(key.clone(), "late".to_string(), handler(|_| async {}))
        .await;
    assert!(matches!(result, Err(RouterError::ShutDown)));
}

#[tokio::test]
async fn test_wait_channel_idle_on_unknown_key_returns() {
    let router: ChannelRouter<String> = ChannelRouter::new(quick_config());
    router.wait_channel_idle(&ConversationKey::direct("nobody")).await;
}
