// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One running bot.
//!
//! A bot worker owns the chat connection, the session cache, and a channel
//! router. The ingress loop only filters and enqueues - agent handlers
//! always run on the router's serial workers, never on the ingress task.
//!
//! Admission for an inbound message:
//! 1. no bot authors,
//! 2. only direct messages and standard server text channels,
//! 3. DM senders must be on the DM allowlist,
//! 4. server messages must mention the bot and come from an allowlisted
//!    server,
//! 5. a leading self-mention is stripped; empty remainders are dropped,
//! 6. a user-context preamble is prepended to the query.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use botfleet_core::{AgentConfig, BotId, ConversationKey, InitConfig, SessionId};

use crate::agent_runner::AgentRunner;
use crate::chat::{
    Author, ChatConnection, ChatEvent, ChatSender, ChatService, ConnectPrefs, InboundChannel,
    InboundMessage, send_with_retry,
};
use crate::engine::AgentEngine;
use crate::error::{Error, Result};
use crate::router::{ChannelRouter, RouterError};

/// Payload carried through the channel router for one accepted message.
pub struct InboundJob {
    /// Conversation the message belongs to.
    pub key: ConversationKey,
    /// Full query text, preamble included.
    pub query: String,
    /// Send-side of the originating connection.
    pub sender: Arc<dyn ChatSender>,
    /// Cancelled when the worker stops.
    pub cancel: CancellationToken,
}

/// Notice sent (best effort) when a conversation's queue is full.
const BACKLOG_NOTICE: &str = "⏳ This conversation is busy right now, please try again shortly.";

/// One bot: connection, session cache, router, agent runner.
pub struct BotWorker {
    init: InitConfig,
    agent: AgentConfig,
    chat: Arc<dyn ChatService>,
    engine: Arc<dyn AgentEngine>,
    router: Arc<ChannelRouter<InboundJob>>,
    runner: AgentRunner,
    sessions: Mutex<HashMap<ConversationKey, SessionId>>,
}

impl BotWorker {
    /// Assemble a worker from its parts. Nothing connects until
    /// [`BotWorker::run`].
    pub fn new(
        init: InitConfig,
        agent: AgentConfig,
        chat: Arc<dyn ChatService>,
        engine: Arc<dyn AgentEngine>,
        router: Arc<ChannelRouter<InboundJob>>,
        runner: AgentRunner,
    ) -> Self {
        Self {
            init,
            agent,
            chat,
            engine,
            router,
            runner,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// The bot this worker serves.
    pub fn bot_id(&self) -> &BotId {
        &self.init.bot_id
    }

    /// The worker's router, for monitoring snapshots.
    pub fn router(&self) -> &Arc<ChannelRouter<InboundJob>> {
        &self.router
    }

    /// Connect and serve until the connection ends or `cancel` fires.
    ///
    /// Readiness is reported once through `ready_tx`: `Ok` after the chat
    /// service delivers its ready event, `Err` when the connection could
    /// not be established. Cooperative stop closes the connection and
    /// drains the router.
    pub async fn run(
        self: Arc<Self>,
        cancel: CancellationToken,
        ready_tx: oneshot::Sender<Result<()>>,
    ) {
        let mut conn = match self.chat.connect(&self.init.credential_token, ConnectPrefs::required()).await
        {
            Ok(conn) => conn,
            Err(e) => {
                error!(bot_id = %self.init.bot_id, error = %e, "Chat connect failed");
                let _ = ready_tx.send(Err(e.into()));
                return;
            }
        };

        let sender = conn.sender();
        let mut ready_tx = Some(ready_tx);
        let mut profile = None;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!(bot_id = %self.init.bot_id, "Stop requested, closing connection");
                    conn.close().await;
                    self.router.shutdown().await;
                    return;
                }

                event = conn.next_event() => match event {
                    Some(ChatEvent::Ready(p)) => {
                        info!(bot_id = %self.init.bot_id, username = %p.username, "Bot ready");
                        profile = Some(p);
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(Ok(()));
                        }
                    }
                    Some(ChatEvent::Message(message)) => {
                        if let Some(profile) = &profile {
                            self.handle_inbound(profile, &sender, &cancel, message).await;
                        }
                    }
                    Some(ChatEvent::Closed) | None => {
                        warn!(bot_id = %self.init.bot_id, "Chat connection ended");
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(Err(Error::Chat(crate::chat::ChatError::Closed)));
                        }
                        self.router.shutdown().await;
                        return;
                    }
                }
            }
        }
    }

    /// Filter, derive the conversation key, and enqueue or answer commands.
    async fn handle_inbound(
        self: &Arc<Self>,
        profile: &crate::chat::BotProfile,
        sender: &Arc<dyn ChatSender>,
        cancel: &CancellationToken,
        message: InboundMessage,
    ) {
        if message.author.is_bot {
            return;
        }

        let (key, body) = match &message.channel {
            InboundChannel::Direct { user_id } => {
                if !self.init.dm_allowlist.contains(&message.author.id) {
                    debug!(bot_id = %self.init.bot_id, user = %message.author.id, "DM sender not allowlisted");
                    return;
                }
                (ConversationKey::direct(user_id.clone()), message.content.trim().to_string())
            }
            InboundChannel::ServerText { server_id, channel_id, .. } => {
                if !message.mentions.iter().any(|id| *id == profile.user_id) {
                    return;
                }
                if !self.init.server_allowlist.contains(server_id) {
                    debug!(bot_id = %self.init.bot_id, server = %server_id, "Server not allowlisted");
                    return;
                }
                let body = strip_leading_mention(&message.content, &profile.user_id);
                (ConversationKey::channel(channel_id.clone()), body)
            }
            InboundChannel::Other => return,
        };

        if body.is_empty() {
            return;
        }

        if let Some(rest) = body.strip_prefix(&self.init.command_prefix) {
            self.handle_command(rest, &key, &message.author, sender).await;
            return;
        }

        let query = format!("{}{body}", user_context_preamble(&message.author, &message.channel));
        // A stop request must reach in-flight agent streams, so every job
        // carries a child of the worker's stop token.
        let job = InboundJob {
            key: key.clone(),
            query,
            sender: sender.clone(),
            cancel: cancel.child_token(),
        };
        let worker = Arc::clone(self);
        let handler = Box::new(move |job: InboundJob| -> crate::router::HandlerFuture {
            Box::pin(async move { worker.process_job(job).await })
        });

        if let Err(e) = self.router.enqueue(key.clone(), job, handler).await {
            match e {
                RouterError::Saturated { .. } | RouterError::Backlogged { .. } => {
                    warn!(bot_id = %self.init.bot_id, key = %key, error = %e, "Dropping message");
                    let _ = send_with_retry(sender.as_ref(), &key, BACKLOG_NOTICE).await;
                }
                RouterError::ShutDown => {
                    debug!(bot_id = %self.init.bot_id, "Router shut down, dropping message");
                }
            }
        }
    }

    /// Handler body executed by the router's serial worker.
    async fn process_job(&self, job: InboundJob) {
        let session = match self.ensure_session(&job.key).await {
            Ok(session) => session,
            Err(e) => {
                error!(bot_id = %self.init.bot_id, key = %job.key, error = %e, "Session setup failed");
                let _ =
                    send_with_retry(job.sender.as_ref(), &job.key, &self.agent.error_message).await;
                return;
            }
        };

        let mut chunks = self.runner.run(&session, &job.key, &job.query, true, job.cancel.clone());
        while let Some(chunk) = chunks.recv().await {
            if let Err(e) = send_with_retry(job.sender.as_ref(), &job.key, &chunk).await {
                error!(bot_id = %self.init.bot_id, key = %job.key, error = %e, "Failed to deliver chunk");
                break;
            }
        }
    }

    /// Return the cached session for `key`, replacing it when the engine no
    /// longer knows it, or create a fresh one.
    async fn ensure_session(&self, key: &ConversationKey) -> Result<SessionId> {
        let user_key = key.user_key();
        let mut sessions = self.sessions.lock().await;

        if let Some(cached) = sessions.get(key) {
            match self.engine.list_sessions(&self.agent.app_name, &user_key).await {
                Ok(live) if live.contains(cached) => return Ok(cached.clone()),
                Ok(_) => {
                    info!(bot_id = %self.init.bot_id, key = %key, "Cached session vanished, recreating");
                }
                // Listing is a health check; on failure trust the cache.
                Err(e) => {
                    warn!(bot_id = %self.init.bot_id, error = %e, "Session list failed");
                    return Ok(cached.clone());
                }
            }
        } else {
            // Sessions persist across restarts; adopt the newest one the
            // service still has for this conversation.
            match self.engine.list_sessions(&self.agent.app_name, &user_key).await {
                Ok(live) => {
                    if let Some(existing) = live.last() {
                        debug!(bot_id = %self.init.bot_id, key = %key, session = %existing, "Adopted existing session");
                        sessions.insert(key.clone(), existing.clone());
                        return Ok(existing.clone());
                    }
                }
                Err(e) => {
                    warn!(bot_id = %self.init.bot_id, error = %e, "Session list failed");
                }
            }
        }

        let session = self.engine.create_session(&self.agent.app_name, &user_key).await?;
        info!(bot_id = %self.init.bot_id, key = %key, session = %session, "Created session");
        sessions.insert(key.clone(), session.clone());
        Ok(session)
    }

    /// Commands carried in chat, marked by the configured prefix.
    async fn handle_command(
        &self,
        rest: &str,
        caller_key: &ConversationKey,
        author: &Author,
        sender: &Arc<dyn ChatSender>,
    ) {
        let mut parts = rest.split_whitespace();
        match parts.next() {
            Some("help") => {
                let _ = send_with_retry(sender.as_ref(), caller_key, &self.help_text()).await;
            }
            Some("clear_sessions") => {
                let target = parts.next();
                self.clear_sessions(target, caller_key, author, sender).await;
            }
            _ => {
                // Unknown commands are silently ignored, like any other
                // non-addressed chatter.
            }
        }
    }

    fn help_text(&self) -> String {
        let prefix = &self.init.command_prefix;
        format!(
            "Commands:\n\
             {prefix}help - show this message\n\
             {prefix}clear_sessions [channel_<id>|dm_<id>] - forget the conversation history"
        )
    }

    /// Clear all engine sessions for the caller's conversation, or for an
    /// explicit target when the caller is a channel admin.
    async fn clear_sessions(
        &self,
        target: Option<&str>,
        caller_key: &ConversationKey,
        author: &Author,
        sender: &Arc<dyn ChatSender>,
    ) {
        let key = match target {
            None => caller_key.clone(),
            Some(raw) => {
                if !author.is_channel_admin {
                    let _ = send_with_retry(
                        sender.as_ref(),
                        caller_key,
                        "You need a channel admin role to clear another conversation.",
                    )
                    .await;
                    return;
                }
                match ConversationKey::parse_target(raw) {
                    Some(key) => key,
                    None => {
                        let _ = send_with_retry(
                            sender.as_ref(),
                            caller_key,
                            "Unknown target. Use channel_<id> or dm_<id>.",
                        )
                        .await;
                        return;
                    }
                }
            }
        };

        let user_key = key.user_key();
        let listed = self.engine.list_sessions(&self.agent.app_name, &user_key).await;
        let sessions = match listed {
            Ok(sessions) => sessions,
            Err(e) => {
                error!(bot_id = %self.init.bot_id, key = %key, error = %e, "Session list failed");
                let _ = send_with_retry(
                    sender.as_ref(),
                    caller_key,
                    "Failed to clear sessions, please try again later.",
                )
                .await;
                return;
            }
        };

        if sessions.is_empty() {
            let _ = send_with_retry(sender.as_ref(), caller_key, "No sessions found.").await;
            return;
        }

        let mut cleared = 0usize;
        for session in &sessions {
            match self.engine.delete_session(&self.agent.app_name, &user_key, session).await {
                Ok(()) => cleared += 1,
                Err(e) => {
                    warn!(bot_id = %self.init.bot_id, session = %session, error = %e, "Delete failed")
                }
            }
        }
        self.sessions.lock().await.remove(&key);

        info!(bot_id = %self.init.bot_id, key = %key, cleared, "Cleared sessions");
        let _ = send_with_retry(
            sender.as_ref(),
            caller_key,
            &format!("Cleared {cleared} session(s)."),
        )
        .await;
    }
}

/// Strip one leading self-mention (`<@id>` or `<@!id>`) and surrounding
/// whitespace.
fn strip_leading_mention(content: &str, bot_user_id: &str) -> String {
    let trimmed = content.trim_start();
    let plain = format!("<@{bot_user_id}>");
    let nick = format!("<@!{bot_user_id}>");
    let rest = trimmed
        .strip_prefix(&nick)
        .or_else(|| trimmed.strip_prefix(&plain))
        .unwrap_or(trimmed);
    rest.trim().to_string()
}

/// The `[USER_INFO]` block prepended to every query, matching the contract
/// the agent instructions describe.
fn user_context_preamble(author: &Author, channel: &InboundChannel) -> String {
    let mut block = String::from("[USER_INFO]\n");
    block.push_str(&format!("User ID: {}\n", author.id));
    block.push_str(&format!("Username: {}\n", author.username));
    if let Some(display) = &author.display_name
        && display != &author.username
    {
        block.push_str(&format!("Display Name: {display}\n"));
    }
    match channel {
        InboundChannel::Direct { .. } => {
            block.push_str("Channel Type: Direct Message\n");
        }
        InboundChannel::ServerText { channel_name, server_name, .. } => {
            block.push_str("Channel Type: Text Channel\n");
            block.push_str(&format!("Channel Name: {channel_name}\n"));
            block.push_str(&format!("Server Name: {server_name}\n"));
        }
        InboundChannel::Other => {}
    }
    block.push_str("[/USER_INFO]\n\n");
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_leading_mention() {
        assert_eq!(strip_leading_mention("<@42> hello", "42"), "hello");
        assert_eq!(strip_leading_mention("<@!42>  hello", "42"), "hello");
        assert_eq!(strip_leading_mention("  <@42>", "42"), "");
        assert_eq!(strip_leading_mention("hello <@42>", "42"), "hello <@42>");
        assert_eq!(strip_leading_mention("<@99> hello", "42"), "<@99> hello");
    }

    #[test]
    fn test_user_context_preamble_direct() {
        let author = Author {
            id: "7".into(),
            username: "alice".into(),
            display_name: Some("alice".into()),
            is_bot: false,
            is_channel_admin: false,
        };
        let block =
            user_context_preamble(&author, &InboundChannel::Direct { user_id: "7".into() });
        assert!(block.starts_with("[USER_INFO]\n"));
        assert!(block.contains("User ID: 7\n"));
        assert!(block.contains("Channel Type: Direct Message\n"));
        // Display name equal to the username is omitted.
        assert!(!block.contains("Display Name"));
        assert!(block.ends_with("[/USER_INFO]\n\n"));
    }

    #[test]
    fn test_user_context_preamble_server() {
        let author = Author {
            id: "7".into(),
            username: "alice".into(),
            display_name: Some("Alice W".into()),
            is_bot: false,
            is_channel_admin: true,
        };
        let channel = InboundChannel::ServerText {
            server_id: "s1".into(),
            channel_id: "c1".into(),
            channel_name: "general".into(),
            server_name: "Workshop".into(),
        };
        let block = user_context_preamble(&author, &channel);
        assert!(block.contains("Display Name: Alice W\n"));
        assert!(block.contains("Channel Type: Text Channel\n"));
        assert!(block.contains("Channel Name: general\n"));
        assert!(block.contains("Server Name: Workshop\n"));
    }
}
