// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for botfleet-runtime integration tests.
//!
//! Builds a full supervisor + reconciler over the in-memory state store and
//! the mock chat/engine backends, with helpers for driving bots and waiting
//! on observable state.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use botfleet_core::config_store::MemoryConfigStore;
use botfleet_core::state_store::{MemoryStateStore, StateStore};
use botfleet_core::usage::MemoryUsageSink;
use botfleet_core::{AgentConfig, BotId, BotState, InitConfig};
use botfleet_runtime::chat::{
    Author, BotProfile, InboundChannel, InboundMessage, MockChatHandle, MockChatService,
};
use botfleet_runtime::engine::MockEngine;
use botfleet_runtime::reconciler::ReconcilerConfig;
use botfleet_runtime::router::RouterConfig;
use botfleet_runtime::runtime::FleetRuntime;

/// Reconciler tick used across the suites - fast enough that "within two
/// ticks" assertions stay subsecond.
pub const TICK: Duration = Duration::from_millis(20);

/// Generous bound for waiting on asynchronous effects.
pub const WAIT: Duration = Duration::from_secs(2);

/// Fully wired supervisor over memory/mock backends.
pub struct TestHarness {
    pub state: Arc<MemoryStateStore>,
    pub config: Arc<MemoryConfigStore>,
    pub chat: Arc<MockChatService>,
    pub engine: Arc<MockEngine>,
    pub usage: Arc<MemoryUsageSink>,
    pub runtime: FleetRuntime,
}

impl TestHarness {
    /// Start a harness with default router bounds.
    pub async fn start() -> Self {
        Self::start_with_router(RouterConfig::default()).await
    }

    /// Start a harness with explicit router bounds.
    pub async fn start_with_router(router: RouterConfig) -> Self {
        let state = Arc::new(MemoryStateStore::new());
        let config = Arc::new(MemoryConfigStore::new());
        let chat = Arc::new(MockChatService::new());
        let engine = Arc::new(MockEngine::new());
        let usage = Arc::new(MemoryUsageSink::new());

        let runtime = FleetRuntime::builder()
            .state_store(state.clone())
            .config_store(config.clone())
            .chat(chat.clone())
            .engine(engine.clone())
            .usage(usage.clone())
            .router_config(router)
            .reconciler_config(ReconcilerConfig { tick_interval: TICK })
            .build()
            .expect("harness wiring is complete")
            .start()
            .await;

        Self { state, config, chat, engine, usage, runtime }
    }

    /// Standard init config: DM allowlist `100`, server allowlist `srv1`,
    /// prefix `!`.
    pub fn init_config(bot: &str) -> InitConfig {
        InitConfig {
            bot_id: BotId::new(bot),
            credential_token: format!("token_{bot}"),
            command_prefix: "!".to_string(),
            dm_allowlist: BTreeSet::from(["100".to_string()]),
            server_allowlist: BTreeSet::from(["srv1".to_string()]),
        }
    }

    /// Standard agent config on a model without a rate window.
    pub fn agent_config(agent_id: i64) -> AgentConfig {
        AgentConfig {
            agent_id,
            agent_name: "helper".to_string(),
            app_name: format!("bot_{agent_id}"),
            description: "test persona".to_string(),
            role_instructions: "be helpful".to_string(),
            tool_instructions: "no tools".to_string(),
            model_name: "gemini-2.5-flash".to_string(),
            tools: vec![],
            function_display_map: BTreeMap::new(),
            error_message: "Something went wrong, please try again later.".to_string(),
        }
    }

    /// The profile a bot's chat line reports on ready.
    pub fn profile(bot: &str) -> BotProfile {
        BotProfile { user_id: format!("user_{bot}"), username: format!("{bot}-persona") }
    }

    /// Register the chat line, seed the config store, and mark the bot for
    /// start; returns once the bot is running.
    pub async fn start_bot(&self, bot: &str) -> MockChatHandle {
        let init = Self::init_config(bot);
        let agent = Self::agent_config(bot.strip_prefix("bot_").and_then(|n| n.parse().ok()).unwrap_or(1));
        self.start_bot_with(bot, init, agent).await
    }

    /// Like [`start_bot`](Self::start_bot) with explicit configs.
    pub async fn start_bot_with(
        &self,
        bot: &str,
        init: InitConfig,
        agent: AgentConfig,
    ) -> MockChatHandle {
        let id = BotId::new(bot);
        let handle = self.chat.register(&init.credential_token, Self::profile(bot));
        self.config.put_bot(id.clone(), init.clone(), agent.clone()).await;
        self.state.mark_should_start(&id, &init, &agent).await.unwrap();
        self.wait_for_state(&id, BotState::Running).await;
        handle
    }

    /// Poll until the bot reaches `target` or the wait bound elapses.
    pub async fn wait_for_state(&self, id: &BotId, target: BotState) {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let current = self.state.get_state(id).await;
            if current == target {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("bot {id} stuck in {current}, wanted {target}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Poll until the line has been connected `count` times. Distinguishes
    /// a completed restart from the original run.
    pub async fn wait_for_connects(&self, handle: &MockChatHandle, count: usize) {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if handle.connect_count() >= count {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("line never reached {count} connects, got {}", handle.connect_count());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Poll until the supervisor does (or does not) hold the bot.
    pub async fn wait_for_presence(&self, id: &BotId, present: bool) {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if self.runtime.supervisor().contains(id).await == present {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("bot {id} presence never became {present}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// A direct message from `author_id`.
pub fn dm(author_id: &str, content: &str) -> InboundMessage {
    InboundMessage {
        author: Author {
            id: author_id.to_string(),
            username: format!("user{author_id}"),
            display_name: None,
            is_bot: false,
            is_channel_admin: false,
        },
        channel: InboundChannel::Direct { user_id: author_id.to_string() },
        content: content.to_string(),
        mentions: vec![],
    }
}

/// A server-channel message. `mentions` lists mentioned user ids.
pub fn server_msg(
    author_id: &str,
    server_id: &str,
    channel_id: &str,
    content: &str,
    mentions: Vec<String>,
) -> InboundMessage {
    InboundMessage {
        author: Author {
            id: author_id.to_string(),
            username: format!("user{author_id}"),
            display_name: Some(format!("User {author_id}")),
            is_bot: false,
            is_channel_admin: false,
        },
        channel: InboundChannel::ServerText {
            server_id: server_id.to_string(),
            channel_id: channel_id.to_string(),
            channel_name: format!("chan-{channel_id}"),
            server_name: format!("server-{server_id}"),
        },
        content: content.to_string(),
        mentions,
    }
}

/// Mark a message's author as a bot account.
pub fn as_bot(mut message: InboundMessage) -> InboundMessage {
    message.author.is_bot = true;
    message
}

/// Mark a message's author as a channel admin.
pub fn as_admin(mut message: InboundMessage) -> InboundMessage {
    message.author.is_channel_admin = true;
    message
}
