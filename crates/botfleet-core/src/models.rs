// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The LLM catalog: known models, historical aliases, pricing, rate windows,
//! and token estimation.
//!
//! Model names stored in agent configs may be historical; [`resolve`]
//! consults the alias table first and fails with
//! [`CoreError::UnknownModel`](crate::error::CoreError::UnknownModel) for
//! anything the catalog does not carry.

use std::time::Duration;

use crate::error::CoreError;

/// Provider family a model belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// Google Gemini models.
    Gemini,
    /// OpenAI GPT models.
    Gpt,
    /// xAI Grok models.
    Grok,
    /// Anthropic Claude models.
    Claude,
}

/// What to do when a request would exceed a model's rate window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitPolicy {
    /// Fail the request with a rate-limit error.
    Reject,
    /// Wait for the window to free up, at most this long, then fail.
    Defer {
        /// Upper bound on the wait.
        max_wait: Duration,
    },
}

/// Token budget enforced over a sliding interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindow {
    /// Cumulative input-token budget inside one interval.
    pub max_tokens: u64,
    /// Window length.
    pub interval: Duration,
    /// Behavior when the budget would be exceeded.
    pub policy: LimitPolicy,
}

/// One catalog entry.
#[derive(Debug, Clone, Copy)]
pub struct ModelSpec {
    /// Canonical model name sent to the engine.
    pub name: &'static str,
    /// Provider family.
    pub family: ModelFamily,
    /// Price per one million input tokens, USD.
    pub input_price_per_1m: f64,
    /// Price per one million output tokens, USD.
    pub output_price_per_1m: f64,
    /// Rate window, if the model declares one.
    pub rate_window: Option<RateWindow>,
}

const MINUTE: Duration = Duration::from_secs(60);

static CATALOG: &[ModelSpec] = &[
    ModelSpec {
        name: "gemini-2.5-flash",
        family: ModelFamily::Gemini,
        input_price_per_1m: 0.15,
        output_price_per_1m: 0.60,
        rate_window: None,
    },
    ModelSpec {
        name: "gemini-2.5-pro",
        family: ModelFamily::Gemini,
        input_price_per_1m: 1.25,
        output_price_per_1m: 10.00,
        rate_window: None,
    },
    ModelSpec {
        name: "gpt-4.1",
        family: ModelFamily::Gpt,
        input_price_per_1m: 2.00,
        output_price_per_1m: 8.00,
        rate_window: None,
    },
    ModelSpec {
        name: "gpt-4.1-mini",
        family: ModelFamily::Gpt,
        input_price_per_1m: 0.40,
        output_price_per_1m: 1.60,
        rate_window: None,
    },
    ModelSpec {
        name: "gpt-4.1-nano",
        family: ModelFamily::Gpt,
        input_price_per_1m: 0.10,
        output_price_per_1m: 0.40,
        rate_window: None,
    },
    ModelSpec {
        name: "gpt-4o",
        family: ModelFamily::Gpt,
        input_price_per_1m: 2.50,
        output_price_per_1m: 10.00,
        rate_window: None,
    },
    ModelSpec {
        name: "gpt-4o-mini",
        family: ModelFamily::Gpt,
        input_price_per_1m: 0.15,
        output_price_per_1m: 0.60,
        rate_window: None,
    },
    ModelSpec {
        name: "xai/grok-3",
        family: ModelFamily::Grok,
        input_price_per_1m: 3.00,
        output_price_per_1m: 15.00,
        rate_window: None,
    },
    ModelSpec {
        name: "xai/grok-3-mini",
        family: ModelFamily::Grok,
        input_price_per_1m: 0.30,
        output_price_per_1m: 0.50,
        rate_window: None,
    },
    ModelSpec {
        name: "claude-sonnet-4",
        family: ModelFamily::Claude,
        input_price_per_1m: 3.00,
        output_price_per_1m: 15.00,
        rate_window: Some(RateWindow {
            max_tokens: 20_000,
            interval: MINUTE,
            policy: LimitPolicy::Defer { max_wait: Duration::from_secs(10) },
        }),
    },
    ModelSpec {
        name: "claude-3-7-sonnet-latest",
        family: ModelFamily::Claude,
        input_price_per_1m: 3.00,
        output_price_per_1m: 15.00,
        rate_window: Some(RateWindow {
            max_tokens: 20_000,
            interval: MINUTE,
            policy: LimitPolicy::Reject,
        }),
    },
    ModelSpec {
        name: "claude-3-5-haiku-latest",
        family: ModelFamily::Claude,
        input_price_per_1m: 0.80,
        output_price_per_1m: 4.00,
        rate_window: None,
    },
];

/// Historical name → canonical name. Stored configs are never rewritten;
/// resolution happens on every start.
static ALIASES: &[(&str, &str)] = &[
    ("gemini-2.5-flash-preview-04-17", "gemini-2.5-flash"),
    ("gemini-2.5-pro-preview-05-06", "gemini-2.5-pro"),
    ("claude-sonnet-4-20250514", "claude-sonnet-4"),
    ("claude-3-7-sonnet-20250219", "claude-3-7-sonnet-latest"),
];

/// Look up a catalog entry by canonical name.
pub fn find(name: &str) -> Option<&'static ModelSpec> {
    CATALOG.iter().find(|m| m.name == name)
}

/// Resolve a stored model name through the alias table to a catalog entry.
pub fn resolve(name: &str) -> Result<&'static ModelSpec, CoreError> {
    let canonical = ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, target)| *target)
        .unwrap_or(name);
    find(canonical).ok_or_else(|| CoreError::UnknownModel(name.to_string()))
}

/// All canonical model names.
pub fn known_names() -> impl Iterator<Item = &'static str> {
    CATALOG.iter().map(|m| m.name)
}

/// Deterministic token estimate for `text`.
///
/// No exact tokenizer ships with this workspace, so every model uses the
/// same documented approximation: whitespace-separated word count scaled by
/// 1.3, rounded up, never less than 1 for non-empty text. Usage records
/// built from this estimate carry the `approximate` flag.
pub fn estimate_tokens(text: &str) -> u64 {
    let words = text.split_whitespace().count() as u64;
    if words == 0 {
        return if text.is_empty() { 0 } else { 1 };
    }
    (words * 13).div_ceil(10)
}

/// Cost in USD for a token count at a per-million price.
pub fn cost_usd(tokens: u64, price_per_1m: f64) -> f64 {
    tokens as f64 * price_per_1m / 1_000_000.0
}
