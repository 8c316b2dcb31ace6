// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Token usage records and sinks.
//!
//! The supervisor only writes usage; aggregation and reporting live on the
//! control-plane side. Records are keyed by `(agent_id, model_name, year,
//! month)` and the PostgreSQL sink folds each write into the matching
//! monthly row. Failing to write usage never fails the interaction that
//! produced it - callers log and move on.

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use sqlx::PgPool;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::models;

/// One usage observation produced by a completed agent run.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    /// Agent definition row id.
    pub agent_id: i64,
    /// Agent display name, denormalized for reporting.
    pub agent_name: String,
    /// Canonical model name the run used.
    pub model_name: String,
    /// Calendar year of the run.
    pub year: i32,
    /// Calendar month of the run (1-12).
    pub month: u32,
    /// Tokens in the query, including the user-context preamble.
    pub input_tokens: u64,
    /// Tokens in the concatenated emitted text.
    pub output_tokens: u64,
    /// True when the counts come from the fallback estimator rather than an
    /// exact tokenizer.
    pub approximate: bool,
}

impl UsageRecord {
    /// Build a record stamped with the current calendar month.
    pub fn now(
        agent_id: i64,
        agent_name: impl Into<String>,
        model_name: impl Into<String>,
        input_tokens: u64,
        output_tokens: u64,
        approximate: bool,
    ) -> Self {
        let today = Utc::now();
        Self {
            agent_id,
            agent_name: agent_name.into(),
            model_name: model_name.into(),
            year: today.year(),
            month: today.month(),
            input_tokens,
            output_tokens,
            approximate,
        }
    }
}

/// Write-side of the usage pipeline.
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Record one observation. Not required to be idempotent.
    async fn record(&self, record: UsageRecord) -> Result<()>;
}

/// PostgreSQL-backed [`UsageSink`] folding writes into monthly aggregates
/// with costs computed from the model catalog.
pub struct PostgresUsageSink {
    pool: PgPool,
}

impl PostgresUsageSink {
    /// Create a sink over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageSink for PostgresUsageSink {
    async fn record(&self, record: UsageRecord) -> Result<()> {
        let (input_price, output_price) = models::find(&record.model_name)
            .map(|spec| (spec.input_price_per_1m, spec.output_price_per_1m))
            .unwrap_or((0.0, 0.0));
        let input_cost = models::cost_usd(record.input_tokens, input_price);
        let output_cost = models::cost_usd(record.output_tokens, output_price);
        let total_tokens = record.input_tokens + record.output_tokens;

        sqlx::query(
            r#"
            INSERT INTO token_usage (
                agent_id, agent_name, model_name, year, month,
                input_tokens, output_tokens, total_tokens,
                input_cost, output_cost, total_cost, approximate, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, now())
            ON CONFLICT (agent_id, model_name, year, month) DO UPDATE SET
                agent_name = EXCLUDED.agent_name,
                input_tokens = token_usage.input_tokens + EXCLUDED.input_tokens,
                output_tokens = token_usage.output_tokens + EXCLUDED.output_tokens,
                total_tokens = token_usage.total_tokens + EXCLUDED.total_tokens,
                input_cost = token_usage.input_cost + EXCLUDED.input_cost,
                output_cost = token_usage.output_cost + EXCLUDED.output_cost,
                total_cost = token_usage.total_cost + EXCLUDED.total_cost,
                approximate = token_usage.approximate OR EXCLUDED.approximate,
                updated_at = now()
            "#,
        )
        .bind(record.agent_id)
        .bind(&record.agent_name)
        .bind(&record.model_name)
        .bind(record.year)
        .bind(record.month as i32)
        .bind(record.input_tokens as i64)
        .bind(record.output_tokens as i64)
        .bind(total_tokens as i64)
        .bind(input_cost)
        .bind(output_cost)
        .bind(input_cost + output_cost)
        .bind(record.approximate)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory [`UsageSink`] for tests.
#[derive(Default)]
pub struct MemoryUsageSink {
    records: Mutex<Vec<UsageRecord>>,
}

impl MemoryUsageSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far, in write order.
    pub async fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl UsageSink for MemoryUsageSink {
    async fn record(&self, record: UsageRecord) -> Result<()> {
        self.records.lock().await.push(record);
        Ok(())
    }
}
