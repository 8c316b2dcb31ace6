// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Chat-service seam.
//!
//! The actual chat client library lives outside this repo; workers talk to
//! it through [`ChatService`]. The contract: a typed inbound event stream
//! (ready, message, closed), and a send operation capped at 2,000 bytes.
//!
//! Implementations are PURE transport - admission control, routing, and
//! command handling all happen in the worker.

pub mod mock;

pub use self::mock::{MockChatHandle, MockChatService};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use botfleet_core::ConversationKey;

/// Errors from chat-service operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChatError {
    /// Could not open the connection (bad token, network down).
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// The connection ended.
    #[error("Connection closed")]
    Closed,

    /// A send was rejected by the service.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// A send did not complete within [`SEND_TIMEOUT`].
    #[error("Send timed out")]
    SendTimeout,

    /// The body exceeds [`MAX_MESSAGE_BYTES`].
    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
}

/// Hard cap the chat service puts on one outbound body.
pub const MAX_MESSAGE_BYTES: usize = 2000;

/// Timeout on one send attempt.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Retries after a failed or timed-out send attempt.
const SEND_RETRIES: u32 = 2;

/// Capabilities requested when opening a connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectPrefs {
    /// Receive direct messages.
    pub direct_messages: bool,
    /// Receive message content for server messages.
    pub message_content: bool,
    /// Receive member info (usernames, display names, admin flags).
    pub member_info: bool,
}

impl ConnectPrefs {
    /// The minimum set a bot worker needs.
    pub fn required() -> Self {
        Self { direct_messages: true, message_content: true, member_info: true }
    }
}

/// The bot's own identity on the chat service, delivered with the ready
/// event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotProfile {
    /// The bot account's user id.
    pub user_id: String,
    /// The bot account's username.
    pub username: String,
}

/// Author of an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    /// Stable user id.
    pub id: String,
    /// Account name.
    pub username: String,
    /// Per-server display name, when it differs from the username.
    pub display_name: Option<String>,
    /// Whether the account is a bot.
    pub is_bot: bool,
    /// Whether the author holds an administrative role on the channel the
    /// message arrived in.
    pub is_channel_admin: bool,
}

/// Where an inbound message arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundChannel {
    /// A direct message.
    Direct {
        /// The counterpart user id (equals the author for inbound traffic).
        user_id: String,
    },
    /// A standard server text channel.
    ServerText {
        /// Server id.
        server_id: String,
        /// Channel id.
        channel_id: String,
        /// Channel display name.
        channel_name: String,
        /// Server display name.
        server_name: String,
    },
    /// Anything else (threads, voice, system channels). Never admitted.
    Other,
}

/// One inbound message event.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Who wrote it.
    pub author: Author,
    /// Where it arrived.
    pub channel: InboundChannel,
    /// Raw body.
    pub content: String,
    /// User ids mentioned in the body.
    pub mentions: Vec<String>,
}

/// Typed connection lifecycle events.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// The connection is live and the service reported our identity.
    Ready(BotProfile),
    /// An inbound message.
    Message(InboundMessage),
    /// The connection ended (remote close or network loss).
    Closed,
}

/// Factory for chat connections. One implementation per chat backend.
#[async_trait]
pub trait ChatService: Send + Sync {
    /// Open one connection with the given credential token.
    async fn connect(
        &self,
        token: &str,
        prefs: ConnectPrefs,
    ) -> Result<Box<dyn ChatConnection>, ChatError>;
}

/// One live connection to the chat service.
#[async_trait]
pub trait ChatConnection: Send {
    /// Next lifecycle event. `None` after the connection is fully torn
    /// down.
    async fn next_event(&mut self) -> Option<ChatEvent>;

    /// A cloneable handle for sending messages.
    fn sender(&self) -> Arc<dyn ChatSender>;

    /// Close the connection cooperatively.
    async fn close(&mut self);
}

/// Send-side of a connection. Safe to clone into handler tasks.
#[async_trait]
pub trait ChatSender: Send + Sync {
    /// Send one text body to a conversation. Implementations reject bodies
    /// over [`MAX_MESSAGE_BYTES`].
    async fn send(&self, target: &ConversationKey, text: &str) -> Result<(), ChatError>;
}

/// Send with the standard per-attempt timeout and bounded retries.
pub async fn send_with_retry(
    sender: &dyn ChatSender,
    target: &ConversationKey,
    text: &str,
) -> Result<(), ChatError> {
    let mut last_err = ChatError::SendTimeout;
    for attempt in 0..=SEND_RETRIES {
        match tokio::time::timeout(SEND_TIMEOUT, sender.send(target, text)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => {
                warn!(target = %target, attempt, error = %e, "Chat send failed");
                last_err = e;
            }
            Err(_) => {
                warn!(target = %target, attempt, "Chat send timed out");
                last_err = ChatError::SendTimeout;
            }
        }
    }
    Err(last_err)
}
