// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Botfleet Runtime - Bot Lifecycle and Message Routing
//!
//! This crate materializes desired bot state into running workers. It hosts
//! the reconciler loop, the in-process worker supervisor, the per-bot
//! channel router, and the agent streaming adaptor, all over the shared
//! registry provided by `botfleet-core`.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Control Plane (external)                        │
//! │            writes desired state + config blobs, reads snapshots          │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     botfleet-runtime (This Crate)                        │
//! │                                                                          │
//! │   ┌────────────┐ tick  ┌─────────────┐  add/remove  ┌────────────────┐  │
//! │   │ Reconciler ├──────►│  Worker     ├─────────────►│  Bot Workers   │  │
//! │   │  (3s loop) │       │ Supervisor  │              │  (one task per │  │
//! │   └─────┬──────┘       └─────────────┘              │   bot)         │  │
//! │         │ try_start / try_stop                      └───────┬────────┘  │
//! │         ▼                                                   │           │
//! │   ┌────────────┐                          per conversation  ▼           │
//! │   │ State      │                          ┌────────────────────────┐    │
//! │   │ Store      │                          │     Channel Router     │    │
//! │   └────────────┘                          │  (ordered per key,     │    │
//! │                                           │   parallel across)     │    │
//! │                                           └──────────┬─────────────┘    │
//! │                                                      ▼                  │
//! │                                           ┌────────────────────────┐    │
//! │                                           │  Agent Runner Adaptor  │    │
//! │                                           │  (stream, chunk,       │    │
//! │                                           │   rate limit, usage)   │    │
//! │                                           └────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//!            │                          │                        │
//!            ▼                          ▼                        ▼
//!    ┌───────────────┐        ┌──────────────────┐     ┌──────────────────┐
//!    │ Chat Service  │        │   Agent Engine   │     │    Usage Sink    │
//!    │  (consumed)   │        │    (consumed)    │     │    (consumed)    │
//!    └───────────────┘        └──────────────────┘     └──────────────────┘
//! ```
//!
//! # Ordering Guarantees
//!
//! | Scope | Guarantee |
//! |-------|-----------|
//! | One conversation key | Messages are handled strictly in arrival order |
//! | Distinct keys, one bot | No ordering; handlers run concurrently |
//! | Distinct bots | No ordering |
//!
//! # Embedding
//!
//! The runtime is embeddable: supply your chat-service and engine
//! implementations through [`runtime::FleetRuntime::builder`] and keep the
//! rest of your application on the same tokio runtime. The `botfleet`
//! binary is the standalone deployment of the same builder wired from
//! environment variables.
//!
//! # Modules
//!
//! - [`agent_runner`]: Streams agent output, rate limits, records usage
//! - [`chat`]: Chat-service seam and its in-process mock
//! - [`engine`]: Agent-engine seam and its in-process mock
//! - [`error`]: Error types for runtime operations
//! - [`reconciler`]: Drives observed bot state toward desired state
//! - [`router`]: Per-conversation fair queue
//! - [`runtime`]: Embeddable runtime builder
//! - [`supervisor`]: In-process registry of live bot workers
//! - [`worker`]: One running bot

#![deny(missing_docs)]

pub mod agent_runner;
pub mod chat;
pub mod engine;
pub mod error;
pub mod reconciler;
pub mod router;
pub mod runtime;
pub mod supervisor;
pub mod worker;

pub use error::Error;
