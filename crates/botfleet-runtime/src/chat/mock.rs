// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock chat service for testing.
//!
//! Simulates the chat backend without any network: tests register a line
//! per credential token, push inbound events through the returned handle,
//! and assert on recorded sends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::sync::mpsc;

use botfleet_core::ConversationKey;

use super::{
    BotProfile, ChatConnection, ChatError, ChatEvent, ChatSender, ChatService, ConnectPrefs,
    InboundMessage, MAX_MESSAGE_BYTES,
};

struct LineState {
    profile: BotProfile,
    fail_connect: AtomicBool,
    connected: AtomicBool,
    connects: AtomicUsize,
    event_tx: Mutex<Option<mpsc::UnboundedSender<ChatEvent>>>,
    sent: Mutex<Vec<(ConversationKey, String)>>,
    sent_notify: Notify,
}

/// Mock [`ChatService`]. One "line" per registered credential token;
/// reconnecting after a restart reuses the same line with a fresh event
/// stream.
#[derive(Default)]
pub struct MockChatService {
    lines: Mutex<HashMap<String, Arc<LineState>>>,
}

impl MockChatService {
    /// Create a service with no registered lines.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a credential token and the profile its connection will
    /// report on ready.
    pub fn register(&self, token: &str, profile: BotProfile) -> MockChatHandle {
        let line = Arc::new(LineState {
            profile,
            fail_connect: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            event_tx: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            sent_notify: Notify::new(),
        });
        self.lines.lock().unwrap().insert(token.to_string(), line.clone());
        MockChatHandle { line }
    }
}

#[async_trait]
impl ChatService for MockChatService {
    async fn connect(
        &self,
        token: &str,
        _prefs: ConnectPrefs,
    ) -> Result<Box<dyn ChatConnection>, ChatError> {
        let line = self
            .lines
            .lock()
            .unwrap()
            .get(token)
            .cloned()
            .ok_or_else(|| ChatError::ConnectFailed("unknown token".to_string()))?;

        if line.fail_connect.load(Ordering::SeqCst) {
            return Err(ChatError::ConnectFailed("simulated connect failure".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *line.event_tx.lock().unwrap() = Some(tx);
        line.connected.store(true, Ordering::SeqCst);
        line.connects.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MockConnection { line, rx, ready_pending: true, closed_emitted: false }))
    }
}

struct MockConnection {
    line: Arc<LineState>,
    rx: mpsc::UnboundedReceiver<ChatEvent>,
    ready_pending: bool,
    closed_emitted: bool,
}

#[async_trait]
impl ChatConnection for MockConnection {
    async fn next_event(&mut self) -> Option<ChatEvent> {
        if self.ready_pending {
            self.ready_pending = false;
            return Some(ChatEvent::Ready(self.line.profile.clone()));
        }
        match self.rx.recv().await {
            Some(event) => Some(event),
            None if !self.closed_emitted => {
                self.closed_emitted = true;
                self.line.connected.store(false, Ordering::SeqCst);
                Some(ChatEvent::Closed)
            }
            None => None,
        }
    }

    fn sender(&self) -> Arc<dyn ChatSender> {
        Arc::new(MockSender { line: self.line.clone() })
    }

    async fn close(&mut self) {
        self.line.connected.store(false, Ordering::SeqCst);
        self.line.event_tx.lock().unwrap().take();
    }
}

struct MockSender {
    line: Arc<LineState>,
}

#[async_trait]
impl ChatSender for MockSender {
    async fn send(&self, target: &ConversationKey, text: &str) -> Result<(), ChatError> {
        if text.len() > MAX_MESSAGE_BYTES {
            return Err(ChatError::MessageTooLarge(text.len()));
        }
        if !self.line.connected.load(Ordering::SeqCst) {
            return Err(ChatError::Closed);
        }
        self.line.sent.lock().unwrap().push((target.clone(), text.to_string()));
        self.line.sent_notify.notify_waiters();
        Ok(())
    }
}

/// Test-side handle to one registered line.
pub struct MockChatHandle {
    line: Arc<LineState>,
}

impl MockChatHandle {
    /// Deliver an inbound message to the connected bot.
    pub fn push_message(&self, message: InboundMessage) {
        if let Some(tx) = self.line.event_tx.lock().unwrap().as_ref() {
            let _ = tx.send(ChatEvent::Message(message));
        }
    }

    /// Simulate a remote connection loss.
    pub fn disconnect(&self) {
        self.line.event_tx.lock().unwrap().take();
    }

    /// Make the next connect attempt fail.
    pub fn set_fail_connect(&self, fail: bool) {
        self.line.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Whether a connection is currently open.
    pub fn is_connected(&self) -> bool {
        self.line.connected.load(Ordering::SeqCst)
    }

    /// How many times this line has been connected to.
    pub fn connect_count(&self) -> usize {
        self.line.connects.load(Ordering::SeqCst)
    }

    /// Everything sent so far, in send order.
    pub fn sent(&self) -> Vec<(ConversationKey, String)> {
        self.line.sent.lock().unwrap().clone()
    }

    /// Wait until at least `n` messages were sent, or time out.
    pub async fn wait_for_sent(
        &self,
        n: usize,
        timeout: Duration,
    ) -> Result<Vec<(ConversationKey, String)>, String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut notified = std::pin::pin!(self.line.sent_notify.notified());
            notified.as_mut().enable();
            let sent = self.sent();
            if sent.len() >= n {
                return Ok(sent);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let sent = self.sent();
                if sent.len() >= n {
                    return Ok(sent);
                }
                return Err(format!("timed out waiting for {n} sends, got {}", sent.len()));
            }
        }
    }
}
