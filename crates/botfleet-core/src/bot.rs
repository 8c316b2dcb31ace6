// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bot identity, lifecycle states, and configuration blobs.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable bot identity (`bot_<n>`). Assigned when the configuration row is
/// created and never changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BotId(String);

impl BotId {
    /// Wrap an existing identity string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build the canonical identity for a configuration row id.
    pub fn from_row_id(row_id: i64) -> Self {
        Self(format!("bot_{row_id}"))
    }

    /// The configuration row id, if this identity follows the canonical
    /// `bot_<n>` form.
    pub fn row_id(&self) -> Option<i64> {
        self.0.strip_prefix("bot_")?.parse().ok()
    }

    /// The identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BotId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of one bot. Exactly one state per bot id; absent means
/// [`BotState::Idle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotState {
    /// Not running and nothing requested.
    Idle,
    /// The control plane asked for a start.
    ShouldStart,
    /// A supervisor holds the start lock and is materializing the worker.
    Starting,
    /// The worker is connected and serving traffic.
    Running,
    /// The control plane asked for a stop.
    ShouldStop,
    /// A supervisor holds the stop lock and is tearing the worker down.
    Stopping,
    /// The control plane asked for a stop followed by a fresh start.
    ShouldRestart,
}

impl BotState {
    /// All recognized states, in no particular order.
    pub const ALL: [BotState; 7] = [
        BotState::Idle,
        BotState::ShouldStart,
        BotState::Starting,
        BotState::Running,
        BotState::ShouldStop,
        BotState::Stopping,
        BotState::ShouldRestart,
    ];

    /// The canonical string form stored in the state store.
    pub fn as_str(&self) -> &'static str {
        match self {
            BotState::Idle => "idle",
            BotState::ShouldStart => "should_start",
            BotState::Starting => "starting",
            BotState::Running => "running",
            BotState::ShouldStop => "should_stop",
            BotState::Stopping => "stopping",
            BotState::ShouldRestart => "should_restart",
        }
    }

    /// Parse a stored string form. Unknown strings yield `None` and must
    /// never be written back.
    pub fn parse(s: &str) -> Option<Self> {
        BotState::ALL.iter().copied().find(|st| st.as_str() == s)
    }
}

impl Default for BotState {
    fn default() -> Self {
        BotState::Idle
    }
}

impl fmt::Display for BotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable-per-run bot parameters. Written to the state store by the
/// control plane and read back exactly once per start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitConfig {
    /// The bot this config belongs to.
    pub bot_id: BotId,
    /// Chat-service credential. Opaque here.
    pub credential_token: String,
    /// Prefix that marks a command message (e.g. `!help`).
    pub command_prefix: String,
    /// User ids allowed to talk to the bot in direct messages.
    #[serde(default)]
    pub dm_allowlist: BTreeSet<String>,
    /// Server ids the bot will answer mentions in.
    #[serde(default)]
    pub server_allowlist: BTreeSet<String>,
}

impl InitConfig {
    /// Merge environment-level allowlist seeds into the per-bot allowlists.
    pub fn merge_allowlist_seeds<'a>(
        &mut self,
        dm_seeds: impl IntoIterator<Item = &'a str>,
        server_seeds: impl IntoIterator<Item = &'a str>,
    ) {
        self.dm_allowlist
            .extend(dm_seeds.into_iter().filter(|s| !s.is_empty()).map(String::from));
        self.server_allowlist
            .extend(server_seeds.into_iter().filter(|s| !s.is_empty()).map(String::from));
    }
}

/// Per-bot agent parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Row id of the agent definition; carried through to usage records.
    pub agent_id: i64,
    /// Display name of the agent definition; carried through to usage
    /// records.
    pub agent_name: String,
    /// Application name used to key engine sessions (`bot_<n>`).
    pub app_name: String,
    /// One-line description of the persona.
    pub description: String,
    /// Role instructions handed to the engine.
    pub role_instructions: String,
    /// Tool usage instructions handed to the engine.
    pub tool_instructions: String,
    /// Model name as stored; may be a historical alias.
    pub model_name: String,
    /// Ordered tool names. Validated against the tool registry when the
    /// config row is written.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Maps engine function names to the label shown in chat while the
    /// function runs.
    #[serde(default)]
    pub function_display_map: BTreeMap<String, String>,
    /// The single generic error text users see when anything goes wrong.
    pub error_message: String,
}

/// Opaque session identifier issued by the agent engine's session service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap an engine-issued identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Routing identity that serializes messages belonging to one conversation:
/// per-user for direct messages, per-channel for server messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConversationKey {
    /// A direct-message conversation with one user.
    Direct {
        /// The user on the other end.
        user_id: String,
    },
    /// A server text channel.
    Channel {
        /// The channel id.
        channel_id: String,
    },
}

impl ConversationKey {
    /// Key for a direct-message conversation.
    pub fn direct(user_id: impl Into<String>) -> Self {
        ConversationKey::Direct { user_id: user_id.into() }
    }

    /// Key for a server text channel.
    pub fn channel(channel_id: impl Into<String>) -> Self {
        ConversationKey::Channel { channel_id: channel_id.into() }
    }

    /// Canonical string form: `dm:<user_id>` or `ch:<channel_id>`.
    pub fn canonical(&self) -> String {
        match self {
            ConversationKey::Direct { user_id } => format!("dm:{user_id}"),
            ConversationKey::Channel { channel_id } => format!("ch:{channel_id}"),
        }
    }

    /// Underscore form used in command targets and engine user keys:
    /// `dm_<id>` / `channel_<id>`.
    pub fn slug(&self) -> String {
        match self {
            ConversationKey::Direct { user_id } => format!("dm_{user_id}"),
            ConversationKey::Channel { channel_id } => format!("channel_{channel_id}"),
        }
    }

    /// The engine user key for this conversation. Sessions are persisted
    /// under `(app_name, user_key)`, so the key must be stable across
    /// restarts.
    pub fn user_key(&self) -> String {
        format!("user_{}", self.slug())
    }

    /// Parse a command-target form (`dm_<id>` or `channel_<id>`).
    pub fn parse_target(target: &str) -> Option<Self> {
        if let Some(id) = target.strip_prefix("channel_") {
            if !id.is_empty() {
                return Some(ConversationKey::channel(id));
            }
        }
        if let Some(id) = target.strip_prefix("dm_") {
            if !id.is_empty() {
                return Some(ConversationKey::direct(id));
            }
        }
        None
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bot_state_round_trip() {
        for state in BotState::ALL {
            assert_eq!(BotState::parse(state.as_str()), Some(state));
        }
    }

    #[test]
    fn test_bot_state_rejects_unknown() {
        assert_eq!(BotState::parse("sleeping"), None);
        assert_eq!(BotState::parse(""), None);
        assert_eq!(BotState::parse("Running"), None);
    }

    #[test]
    fn test_bot_id_row_id() {
        assert_eq!(BotId::from_row_id(7).as_str(), "bot_7");
        assert_eq!(BotId::new("bot_42").row_id(), Some(42));
        assert_eq!(BotId::new("custom").row_id(), None);
    }

    #[test]
    fn test_conversation_key_forms() {
        let dm = ConversationKey::direct("123");
        assert_eq!(dm.canonical(), "dm:123");
        assert_eq!(dm.slug(), "dm_123");
        assert_eq!(dm.user_key(), "user_dm_123");

        let ch = ConversationKey::channel("456");
        assert_eq!(ch.canonical(), "ch:456");
        assert_eq!(ch.slug(), "channel_456");
    }

    #[test]
    fn test_conversation_key_parse_target() {
        assert_eq!(
            ConversationKey::parse_target("channel_99"),
            Some(ConversationKey::channel("99"))
        );
        assert_eq!(
            ConversationKey::parse_target("dm_5"),
            Some(ConversationKey::direct("5"))
        );
        assert_eq!(ConversationKey::parse_target("channel_"), None);
        assert_eq!(ConversationKey::parse_target("guild_1"), None);
        assert_eq!(ConversationKey::parse_target(""), None);
    }

    #[test]
    fn test_init_config_merge_seeds() {
        let mut init = InitConfig {
            bot_id: BotId::new("bot_1"),
            credential_token: "tok".into(),
            command_prefix: "!".into(),
            dm_allowlist: BTreeSet::from(["1".to_string()]),
            server_allowlist: BTreeSet::new(),
        };
        init.merge_allowlist_seeds(["1", "2", ""], ["srv"]);
        assert_eq!(init.dm_allowlist.len(), 2);
        assert!(init.server_allowlist.contains("srv"));
    }

    #[test]
    fn test_config_blob_round_trip() {
        let cfg = AgentConfig {
            agent_id: 3,
            agent_name: "helper".into(),
            app_name: "bot_3".into(),
            description: "d".into(),
            role_instructions: "r".into(),
            tool_instructions: "t".into(),
            model_name: "gemini-2.5-flash".into(),
            tools: vec!["search".into()],
            function_display_map: BTreeMap::from([("search_web".into(), "Searching".into())]),
            error_message: "oops".into(),
        };
        let blob = serde_json::to_string(&cfg).unwrap();
        let back: AgentConfig = serde_json::from_str(&blob).unwrap();
        assert_eq!(back, cfg);
    }
}
