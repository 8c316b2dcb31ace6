// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent runner tests: event classification, chunking, rate limiting,
//! usage accounting, and the fallback error path.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use common::{TestHarness, dm};

use botfleet_core::state_store::{MemoryStateStore, StateStore};
use botfleet_core::usage::MemoryUsageSink;
use botfleet_core::{AgentConfig, ConversationKey, models};
use botfleet_runtime::agent_runner::AgentRunner;
use botfleet_runtime::engine::AgentEngine;
use botfleet_runtime::engine::{EngineEvent, MockEngine, RunScript};

struct Fixture {
    engine: Arc<MockEngine>,
    store: Arc<MemoryStateStore>,
    usage: Arc<MemoryUsageSink>,
    runner: AgentRunner,
}

fn fixture(model_name: &str) -> Fixture {
    let engine = Arc::new(MockEngine::new());
    let store = Arc::new(MemoryStateStore::new());
    let usage = Arc::new(MemoryUsageSink::new());
    let agent = AgentConfig {
        function_display_map: BTreeMap::from([(
            "search_web".to_string(),
            "Searching the web".to_string(),
        )]),
        model_name: model_name.to_string(),
        ..TestHarness::agent_config(1)
    };
    let model = models::resolve(model_name).unwrap();
    let runner =
        AgentRunner::new(engine.clone(), store.clone(), usage.clone(), agent, model);
    Fixture { engine, store, usage, runner }
}

async fn collect(mut chunks: mpsc::Receiver<String>) -> Vec<String> {
    let mut out = Vec::new();
    while let Some(chunk) = chunks.recv().await {
        out.push(chunk);
    }
    out
}

#[tokio::test]
async fn test_only_final_concatenates_partials() {
    let f = fixture("gemini-2.5-flash");
    f.engine.push_script(RunScript::events(vec![
        EngineEvent::Partial("Hello ".into()),
        EngineEvent::Partial("there".into()),
        EngineEvent::Final { text: Some(", friend.".into()) },
    ]));
    let session = f.engine.create_session("bot_1", "user_dm_100").await.unwrap();

    let chunks = collect(f.runner.run(
        &session,
        &ConversationKey::direct("100"),
        "hi",
        true,
        CancellationToken::new(),
    ))
    .await;

    assert_eq!(chunks, vec!["Hello there, friend."]);
}

#[tokio::test]
async fn test_streaming_mode_emits_partials_and_labels() {
    let f = fixture("gemini-2.5-flash");
    f.engine.push_script(RunScript::events(vec![
        EngineEvent::Partial("thinking".into()),
        EngineEvent::FunctionCall { name: "search_web".into() },
        EngineEvent::FunctionCall { name: "unmapped_fn".into() },
        EngineEvent::FunctionResponse { name: "search_web".into() },
        EngineEvent::Final { text: Some(" done".into()) },
    ]));
    let session = f.engine.create_session("bot_1", "user_dm_100").await.unwrap();

    let chunks = collect(f.runner.run(
        &session,
        &ConversationKey::direct("100"),
        "hi",
        false,
        CancellationToken::new(),
    ))
    .await;

    assert_eq!(
        chunks,
        vec![
            "thinking".to_string(),
            "[Searching the web]".to_string(),
            "(...)".to_string(),
            "thinking done".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_empty_final_yields_no_response_marker() {
    let f = fixture("gemini-2.5-flash");
    f.engine.push_script(RunScript::events(vec![EngineEvent::Final { text: None }]));
    let session = f.engine.create_session("bot_1", "user_dm_100").await.unwrap();

    let chunks = collect(f.runner.run(
        &session,
        &ConversationKey::direct("100"),
        "hi",
        true,
        CancellationToken::new(),
    ))
    .await;

    assert_eq!(chunks, vec!["⚠️ No valid response received."]);
}

#[tokio::test]
async fn test_escalation_terminates_with_warning() {
    let f = fixture("gemini-2.5-flash");
    f.engine.push_script(RunScript::events(vec![
        EngineEvent::Partial("partial that never completes".into()),
        EngineEvent::Escalation { message: Some("policy stop".into()) },
    ]));
    let session = f.engine.create_session("bot_1", "user_dm_100").await.unwrap();

    let chunks = collect(f.runner.run(
        &session,
        &ConversationKey::direct("100"),
        "hi",
        true,
        CancellationToken::new(),
    ))
    .await;

    assert_eq!(chunks, vec!["⚠️ Agent escalated: policy stop"]);
}

#[tokio::test]
async fn test_usage_recorded_with_estimates() {
    let f = fixture("gemini-2.5-flash");
    f.engine.push_script(RunScript::final_text("four words of output"));
    let session = f.engine.create_session("bot_1", "user_dm_100").await.unwrap();
    let query = "please count some tokens";

    let chunks = collect(f.runner.run(
        &session,
        &ConversationKey::direct("100"),
        query,
        true,
        CancellationToken::new(),
    ))
    .await;
    assert_eq!(chunks.len(), 1);

    let records = f.usage.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].agent_id, 1);
    assert_eq!(records[0].model_name, "gemini-2.5-flash");
    assert_eq!(records[0].input_tokens, models::estimate_tokens(query));
    assert_eq!(records[0].output_tokens, models::estimate_tokens("four words of output"));
    assert!(records[0].approximate);
}

#[tokio::test]
async fn test_engine_error_collapses_to_fallback_message() {
    let f = fixture("gemini-2.5-flash");
    f.engine.push_script(RunScript::failing("engine exploded"));
    let session = f.engine.create_session("bot_1", "user_dm_100").await.unwrap();

    let chunks = collect(f.runner.run(
        &session,
        &ConversationKey::direct("100"),
        "hi",
        true,
        CancellationToken::new(),
    ))
    .await;

    assert_eq!(chunks, vec!["Something went wrong, please try again later."]);
    assert!(f.usage.records().await.is_empty());
}

#[tokio::test]
async fn test_rate_limit_reject_policy() {
    // claude-3-7-sonnet-latest declares a 20k/60s window with the reject
    // policy.
    let f = fixture("claude-3-7-sonnet-latest");
    f.store
        .record_model_usage("claude-3-7-sonnet-latest", 20_000, Duration::from_secs(60))
        .await
        .unwrap();
    let session = f.engine.create_session("bot_1", "user_dm_100").await.unwrap();

    let chunks = collect(f.runner.run(
        &session,
        &ConversationKey::direct("100"),
        "hi",
        true,
        CancellationToken::new(),
    ))
    .await;

    assert_eq!(chunks, vec!["Something went wrong, please try again later."]);
    assert!(f.usage.records().await.is_empty());
    // The engine was never consulted.
    assert!(f.engine.runs().is_empty());
}

#[tokio::test]
async fn test_rate_limit_defer_policy_waits_for_window() {
    // claude-sonnet-4 defers. Seed the window with a short-lived entry so
    // the deferred request proceeds once it expires.
    let f = fixture("claude-sonnet-4");
    f.store
        .record_model_usage("claude-sonnet-4", 20_000, Duration::from_millis(400))
        .await
        .unwrap();
    let session = f.engine.create_session("bot_1", "user_dm_100").await.unwrap();

    let started = Instant::now();
    let chunks = collect(f.runner.run(
        &session,
        &ConversationKey::direct("100"),
        "hi",
        true,
        CancellationToken::new(),
    ))
    .await;

    assert_eq!(chunks, vec!["ok"]);
    assert!(started.elapsed() >= Duration::from_millis(300), "did not defer");
    assert_eq!(f.usage.records().await.len(), 1);
}

#[tokio::test]
async fn test_cancelled_run_writes_nothing() {
    let f = fixture("gemini-2.5-flash");
    f.engine.push_script(
        RunScript::final_text("slow answer").with_event_delay(Duration::from_millis(400)),
    );
    let session = f.engine.create_session("bot_1", "user_dm_100").await.unwrap();
    let cancel = CancellationToken::new();

    let chunks_rx = f.runner.run(
        &session,
        &ConversationKey::direct("100"),
        "hi",
        true,
        cancel.clone(),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let chunks = collect(chunks_rx).await;
    assert!(chunks.is_empty());
    assert!(f.usage.records().await.is_empty());
}

// ---------------------------------------------------------------------------
// Through the full stack
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_engine_failure_end_to_end_keeps_queue_alive() {
    let harness = TestHarness::start().await;
    let handle = harness.start_bot("bot_1").await;

    harness.engine.push_script(RunScript::failing("engine exploded"));
    handle.push_message(dm("100", "boom"));

    let sent = handle.wait_for_sent(1, common::WAIT).await.unwrap();
    assert_eq!(sent[0].1, "Something went wrong, please try again later.");
    assert!(harness.usage.records().await.is_empty());

    // The next message on the same conversation is still processed.
    handle.push_message(dm("100", "still there?"));
    let sent = handle.wait_for_sent(2, common::WAIT).await.unwrap();
    assert_eq!(sent[1].1, "ok");
    assert_eq!(harness.usage.records().await.len(), 1);
}

#[tokio::test]
async fn test_long_output_is_chunked_end_to_end() {
    let harness = TestHarness::start().await;
    let handle = harness.start_bot("bot_1").await;

    let long = format!("<start_of_audio>{}", "a".repeat(5100));
    harness.engine.push_script(RunScript::final_text(long));
    handle.push_message(dm("100", "tell me everything"));

    let sent = handle.wait_for_sent(3, common::WAIT).await.unwrap();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[0].1.chars().count(), 2000);
    assert_eq!(sent[1].1.chars().count(), 2000);
    assert_eq!(sent[2].1.chars().count(), 1100);
    assert!(!sent[0].1.contains("<start_of_audio>"));
}
