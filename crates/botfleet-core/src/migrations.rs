// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Idempotent schema setup.
//!
//! The whole schema lives in one raw SQL file of `CREATE ... IF NOT EXISTS`
//! statements, so `run` is safe to call on every boot and from `botfleet
//! migrate`.

use sqlx::PgPool;

use crate::error::Result;

/// Apply the schema to the given database.
pub async fn run(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(include_str!("../migrations/schema.sql"))
        .execute(pool)
        .await?;
    tracing::info!("Database schema verified");
    Ok(())
}
