// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock agent engine for testing.
//!
//! Sessions live in a map; runs replay scripted event sequences with an
//! optional per-event delay, falling back to a single final event when no
//! script is queued.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use botfleet_core::SessionId;

use super::{AgentEngine, EngineError, EngineEvent, EngineEventStream};

/// Scripted behavior for one run.
#[derive(Debug, Clone)]
pub struct RunScript {
    /// Events to replay, in order.
    pub events: Vec<EngineEvent>,
    /// Pause before each event.
    pub event_delay: Duration,
    /// When set, the run call fails immediately with this message.
    pub error: Option<String>,
}

impl RunScript {
    /// A run that completes with one final text.
    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            events: vec![EngineEvent::Final { text: Some(text.into()) }],
            event_delay: Duration::ZERO,
            error: None,
        }
    }

    /// A run that fails before producing any event.
    pub fn failing(message: impl Into<String>) -> Self {
        Self { events: vec![], event_delay: Duration::ZERO, error: Some(message.into()) }
    }

    /// A run replaying an explicit event sequence.
    pub fn events(events: Vec<EngineEvent>) -> Self {
        Self { events, event_delay: Duration::ZERO, error: None }
    }

    /// Pause this long before each event.
    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = delay;
        self
    }
}

/// One recorded run invocation.
#[derive(Debug, Clone)]
pub struct RecordedRun {
    /// App name the run was issued under.
    pub app_name: String,
    /// Session it attached to.
    pub session: SessionId,
    /// Engine user key.
    pub user_key: String,
    /// Full message, including any user-context preamble.
    pub message: String,
}

/// Mock [`AgentEngine`].
pub struct MockEngine {
    sessions: Mutex<HashMap<(String, String), Vec<SessionId>>>,
    scripts: Mutex<VecDeque<RunScript>>,
    default_script: Mutex<RunScript>,
    runs: Mutex<Vec<RecordedRun>>,
    counter: AtomicU64,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    /// Create an engine whose runs answer `ok` unless scripted otherwise.
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            scripts: Mutex::new(VecDeque::new()),
            default_script: Mutex::new(RunScript::final_text("ok")),
            runs: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
        }
    }

    /// Queue a script for the next un-scripted run.
    pub fn push_script(&self, script: RunScript) {
        self.scripts.lock().unwrap().push_back(script);
    }

    /// Replace the fallback script used when the queue is empty.
    pub fn set_default_script(&self, script: RunScript) {
        *self.default_script.lock().unwrap() = script;
    }

    /// All run invocations so far, in call order.
    pub fn runs(&self) -> Vec<RecordedRun> {
        self.runs.lock().unwrap().clone()
    }

    /// Number of live sessions for `(app_name, user_key)`.
    pub fn session_count(&self, app_name: &str, user_key: &str) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .get(&(app_name.to_string(), user_key.to_string()))
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl AgentEngine for MockEngine {
    async fn create_session(
        &self,
        app_name: &str,
        user_key: &str,
    ) -> Result<SessionId, EngineError> {
        let id = SessionId::new(format!("sess_{}", self.counter.fetch_add(1, Ordering::SeqCst)));
        self.sessions
            .lock()
            .unwrap()
            .entry((app_name.to_string(), user_key.to_string()))
            .or_default()
            .push(id.clone());
        Ok(id)
    }

    async fn list_sessions(
        &self,
        app_name: &str,
        user_key: &str,
    ) -> Result<Vec<SessionId>, EngineError> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .get(&(app_name.to_string(), user_key.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_session(
        &self,
        app_name: &str,
        user_key: &str,
        session: &SessionId,
    ) -> Result<(), EngineError> {
        if let Some(list) = self
            .sessions
            .lock()
            .unwrap()
            .get_mut(&(app_name.to_string(), user_key.to_string()))
        {
            list.retain(|s| s != session);
        }
        Ok(())
    }

    async fn run(
        &self,
        app_name: &str,
        session: &SessionId,
        user_key: &str,
        message: &str,
        cancel: CancellationToken,
    ) -> Result<EngineEventStream, EngineError> {
        self.runs.lock().unwrap().push(RecordedRun {
            app_name: app_name.to_string(),
            session: session.clone(),
            user_key: user_key.to_string(),
            message: message.to_string(),
        });

        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_script.lock().unwrap().clone());

        if let Some(message) = script.error {
            return Err(EngineError::Run(message));
        }

        let delay = script.event_delay;
        let stream = futures::stream::unfold(
            (script.events.into_iter(), cancel),
            move |(mut events, cancel)| async move {
                let event = events.next()?;
                if !delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Some((Ok(event), (events, cancel)))
            },
        );
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_session_lifecycle() {
        let engine = MockEngine::new();
        let a = engine.create_session("app", "user_dm_1").await.unwrap();
        let b = engine.create_session("app", "user_dm_1").await.unwrap();
        assert_ne!(a, b);

        let sessions = engine.list_sessions("app", "user_dm_1").await.unwrap();
        assert_eq!(sessions, vec![a.clone(), b.clone()]);

        engine.delete_session("app", "user_dm_1", &a).await.unwrap();
        assert_eq!(engine.list_sessions("app", "user_dm_1").await.unwrap(), vec![b]);
    }

    #[tokio::test]
    async fn test_run_replays_script() {
        let engine = MockEngine::new();
        engine.push_script(RunScript::events(vec![
            EngineEvent::Partial("a".into()),
            EngineEvent::Final { text: Some("b".into()) },
        ]));

        let session = engine.create_session("app", "u").await.unwrap();
        let mut stream = engine
            .run("app", &session, "u", "hi", CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap(), EngineEvent::Partial("a".into()));
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            EngineEvent::Final { text: Some("b".into()) }
        );
        assert!(stream.next().await.is_none());

        assert_eq!(engine.runs().len(), 1);
        assert_eq!(engine.runs()[0].message, "hi");
    }

    #[tokio::test]
    async fn test_run_failure_script() {
        let engine = MockEngine::new();
        engine.push_script(RunScript::failing("boom"));
        let session = engine.create_session("app", "u").await.unwrap();
        let result = engine.run("app", &session, "u", "hi", CancellationToken::new()).await;
        assert!(matches!(result, Err(EngineError::Run(m)) if m == "boom"));
    }

    #[tokio::test]
    async fn test_cancel_stops_delayed_stream() {
        let engine = MockEngine::new();
        engine.push_script(
            RunScript::events(vec![
                EngineEvent::Partial("a".into()),
                EngineEvent::Final { text: Some("b".into()) },
            ])
            .with_event_delay(Duration::from_millis(200)),
        );
        let session = engine.create_session("app", "u").await.unwrap();
        let cancel = CancellationToken::new();
        let mut stream = engine.run("app", &session, "u", "hi", cancel.clone()).await.unwrap();

        cancel.cancel();
        assert!(stream.next().await.is_none());
    }
}
