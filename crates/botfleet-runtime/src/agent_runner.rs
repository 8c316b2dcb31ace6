// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent runner adaptor.
//!
//! Wraps the external engine's event stream into the chunked text the chat
//! side can deliver: partials accumulate, function calls surface as display
//! labels, escalations and finals terminate the stream. Output is sliced
//! into 2,000-character chunks with reserved marker tokens stripped.
//!
//! Failure semantics: any engine, connection, or adaptor error collapses to
//! a single chunk carrying the bot's configured fallback error message, and
//! no usage is written. A cancelled run emits nothing further and writes no
//! usage either; partial output already delivered stays where it is.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use botfleet_core::models::{self, LimitPolicy, ModelSpec, RateWindow};
use botfleet_core::state_store::StateStore;
use botfleet_core::usage::{UsageRecord, UsageSink};
use botfleet_core::{AgentConfig, ConversationKey, SessionId};

use crate::engine::{AgentEngine, EngineError, EngineEvent};
use crate::error::{Error, Result};

/// Timeout on each engine event.
pub const ENGINE_TIMEOUT: Duration = Duration::from_secs(30);

/// Fixed output chunk size, in characters.
pub const CHUNK_CHARS: usize = 2000;

/// Marker tokens stripped from output before delivery.
const RESERVED_MARKERS: [&str; 2] = ["<start_of_audio>", "<end_of_audio>"];

/// Emitted when a final event carries no content at all.
const NO_RESPONSE_MARKER: &str = "⚠️ No valid response received.";

/// Emitted for function calls without a display mapping.
const FUNCTION_PLACEHOLDER: &str = "(...)";

/// How often a deferred request re-checks the rate window.
const DEFER_POLL: Duration = Duration::from_millis(250);

/// Slice `text` into delivery chunks, stripping reserved markers and
/// dropping whitespace-only chunks.
pub fn chunk_text(text: &str) -> Vec<String> {
    let mut cleaned = text.to_string();
    for marker in RESERVED_MARKERS {
        cleaned = cleaned.replace(marker, "");
    }
    let chars: Vec<char> = cleaned.chars().collect();
    chars
        .chunks(CHUNK_CHARS)
        .map(|chunk| chunk.iter().collect::<String>())
        .filter(|chunk| !chunk.trim().is_empty())
        .collect()
}

/// Streams one bot's agent runs.
#[derive(Clone)]
pub struct AgentRunner {
    engine: Arc<dyn AgentEngine>,
    store: Arc<dyn StateStore>,
    usage: Arc<dyn UsageSink>,
    agent: AgentConfig,
    model: &'static ModelSpec,
}

impl AgentRunner {
    /// Build a runner for one bot.
    pub fn new(
        engine: Arc<dyn AgentEngine>,
        store: Arc<dyn StateStore>,
        usage: Arc<dyn UsageSink>,
        agent: AgentConfig,
        model: &'static ModelSpec,
    ) -> Self {
        Self { engine, store, usage, agent, model }
    }

    /// The canonical model this runner dispatches to.
    pub fn model(&self) -> &'static ModelSpec {
        self.model
    }

    /// Run the agent against `query` and stream back delivery-sized chunks.
    ///
    /// The receiver yields chunks in emission order and closes when the run
    /// terminates, fails (after the fallback message), or is cancelled.
    pub fn run(
        &self,
        session: &SessionId,
        key: &ConversationKey,
        query: &str,
        only_final: bool,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(16);
        let runner = self.clone();
        let session = session.clone();
        let key = key.clone();
        let query = query.to_string();
        tokio::spawn(async move {
            runner.pump(session, key, query, only_final, cancel, tx).await;
        });
        rx
    }

    async fn pump(
        self,
        session: SessionId,
        key: ConversationKey,
        query: String,
        only_final: bool,
        cancel: CancellationToken,
        tx: mpsc::Sender<String>,
    ) {
        if let Err(e) = self.stream_run(&session, &key, &query, only_final, &cancel, &tx).await {
            if cancel.is_cancelled() {
                return;
            }
            error!(
                app = %self.agent.app_name,
                key = %key,
                error = %e,
                "Agent run failed, sending fallback message"
            );
            let fallback = self.agent.error_message.clone();
            emit(&tx, &fallback, &cancel, &mut String::new()).await;
        }
    }

    async fn stream_run(
        &self,
        session: &SessionId,
        key: &ConversationKey,
        query: &str,
        only_final: bool,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<String>,
    ) -> Result<()> {
        let input_tokens = models::estimate_tokens(query);
        if let Some(window) = self.model.rate_window {
            self.check_rate_window(&window, input_tokens, cancel).await?;
        }

        let user_key = key.user_key();
        let mut stream = self
            .engine
            .run(&self.agent.app_name, session, &user_key, query, cancel.child_token())
            .await?;

        // Running accumulator of partial text, and the concatenation of
        // everything actually emitted (feeds the output token count).
        let mut partials = String::new();
        let mut emitted = String::new();

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = tokio::time::timeout(ENGINE_TIMEOUT, stream.next()) => match next {
                    Err(_) => return Err(EngineError::Timeout.into()),
                    Ok(None) => {
                        warn!(key = %key, "Engine stream ended without a terminal event");
                        return Ok(());
                    }
                    Ok(Some(Err(e))) => return Err(e.into()),
                    Ok(Some(Ok(event))) => event,
                },
            };

            match event {
                EngineEvent::Partial(text) => {
                    partials.push_str(&text);
                    if !only_final && !emit(tx, &text, cancel, &mut emitted).await {
                        return Ok(());
                    }
                }
                EngineEvent::FunctionCall { name } => {
                    if !only_final {
                        let label = match self.agent.function_display_map.get(&name) {
                            Some(label) => format!("[{label}]"),
                            None => FUNCTION_PLACEHOLDER.to_string(),
                        };
                        if !emit(tx, &label, cancel, &mut emitted).await {
                            return Ok(());
                        }
                    }
                }
                EngineEvent::FunctionResponse { .. } => {}
                EngineEvent::Escalation { message } => {
                    let text = format!(
                        "⚠️ Agent escalated: {}",
                        message.as_deref().unwrap_or("No specific message.")
                    );
                    if emit(tx, &text, cancel, &mut emitted).await {
                        self.finish_usage(input_tokens, &emitted, cancel).await;
                    }
                    return Ok(());
                }
                EngineEvent::Final { text } => {
                    let mut full = partials.clone();
                    if let Some(tail) = &text {
                        full.push_str(tail);
                    }
                    let full = full.trim().to_string();
                    let delivered = if full.is_empty() {
                        emit(tx, NO_RESPONSE_MARKER, cancel, &mut emitted).await
                    } else {
                        emit(tx, &full, cancel, &mut emitted).await
                    };
                    // A cut-off delivery means the handler went away
                    // (cancellation or shutdown); no usage for those.
                    if delivered {
                        self.finish_usage(input_tokens, &emitted, cancel).await;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Enforce the model's rate window against the shared ledger.
    async fn check_rate_window(
        &self,
        window: &RateWindow,
        input_tokens: u64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = match window.policy {
            LimitPolicy::Reject => None,
            LimitPolicy::Defer { max_wait } => Some(tokio::time::Instant::now() + max_wait),
        };

        loop {
            let used = match self.store.model_window_tokens(self.model.name).await {
                Ok(used) => used,
                Err(e) => {
                    // Best effort: a broken ledger must not take the bot
                    // down with it.
                    warn!(model = self.model.name, error = %e, "Rate window read failed");
                    0
                }
            };
            if used + input_tokens <= window.max_tokens {
                return Ok(());
            }

            match deadline {
                None => {
                    warn!(model = self.model.name, used, "Rate window exhausted, rejecting");
                    return Err(Error::Engine(EngineError::RateLimited {
                        model: self.model.name.to_string(),
                    }));
                }
                Some(deadline) if tokio::time::Instant::now() >= deadline => {
                    warn!(model = self.model.name, used, "Rate window still exhausted after defer");
                    return Err(Error::Engine(EngineError::RateLimited {
                        model: self.model.name.to_string(),
                    }));
                }
                Some(_) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(Error::Other("cancelled while deferred".to_string()));
                        }
                        _ = tokio::time::sleep(DEFER_POLL) => {}
                    }
                }
            }
        }
    }

    /// Record ledger and usage after a terminal event. Skipped entirely for
    /// cancelled runs.
    async fn finish_usage(&self, input_tokens: u64, emitted: &str, cancel: &CancellationToken) {
        if cancel.is_cancelled() {
            return;
        }
        if let Some(window) = self.model.rate_window
            && let Err(e) = self
                .store
                .record_model_usage(self.model.name, input_tokens, window.interval)
                .await
        {
            warn!(model = self.model.name, error = %e, "Failed to record rate window usage");
        }

        let output_tokens = models::estimate_tokens(emitted);
        let record = UsageRecord::now(
            self.agent.agent_id,
            self.agent.agent_name.clone(),
            self.model.name,
            input_tokens,
            output_tokens,
            true,
        );
        if let Err(e) = self.usage.record(record).await {
            warn!(app = %self.agent.app_name, error = %e, "Failed to record usage");
        }
    }
}

/// Chunk `text` and push the chunks, tracking what was emitted. Returns
/// false when the run should stop (cancellation or a dropped receiver).
async fn emit(
    tx: &mpsc::Sender<String>,
    text: &str,
    cancel: &CancellationToken,
    emitted: &mut String,
) -> bool {
    for chunk in chunk_text(text) {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            sent = tx.send(chunk.clone()) => {
                if sent.is_err() {
                    return false;
                }
                emitted.push_str(&chunk);
            }
        }
    }
    true
}
