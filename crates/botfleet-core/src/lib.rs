// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Botfleet Core - Shared State and Configuration
//!
//! This crate holds everything the botfleet supervisor shares across
//! processes: the bot lifecycle registry (the state store), the durable
//! configuration model, the model catalog, and usage accounting.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Control Plane                                   │
//! │              (REST API, admin UI - external to this repo)                │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                │ mark_should_start / stop / restart          │ reads
//!                ▼                                             ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       botfleet-core (This Crate)                         │
//! │  ┌──────────────┐  ┌──────────────┐  ┌─────────────┐  ┌─────────────┐   │
//! │  │  State Store │  │ Config Store │  │    Model    │  │    Usage    │   │
//! │  │ (states,     │  │ (bot/agent   │  │   Catalog   │  │    Sink     │   │
//! │  │  locks)      │  │  rows)       │  │             │  │             │   │
//! │  └──────────────┘  └──────────────┘  └─────────────┘  └─────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            PostgreSQL                                    │
//! │            (bot states, locks, configs, token usage)                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Bot Lifecycle State Machine
//!
//! ```text
//!                ┌──────┐
//!      ┌────────►│ idle │◄──────────────┐
//!      │         └──┬───┘               │
//!      │            │ mark_should_start │ worker gone /
//!      │            ▼                   │ start failed
//!      │     ┌──────────────┐           │
//!      │     │ should_start │           │
//!      │     └──────┬───────┘           │
//!      │            │ try_start (lock)  │
//!      │            ▼                   │
//!      │       ┌──────────┐             │
//!      │       │ starting ├─────────────┤
//!      │       └────┬─────┘             │
//!      │            │ worker ready      │
//!      │            ▼                   │
//!      │       ┌─────────┐   mark_should_restart   ┌────────────────┐
//!      │       │ running ├────────────────────────►│ should_restart │
//!      │       └────┬────┘                         └───────┬────────┘
//!      │            │ mark_should_stop                     │ try_stop (lock)
//!      │            ▼                                      ▼
//!      │      ┌─────────────┐  try_stop (lock)        back to starting
//!      │      │ should_stop ├────────┐
//!      │      └─────────────┘        ▼
//!      │                        ┌──────────┐
//!      └────────────────────────┤ stopping │
//!                               └──────────┘
//! ```
//!
//! Transitions into `starting` and `stopping` are serialized per bot by a
//! TTL-bounded lock held in the state store, so two supervisor processes
//! never race the same bot.
//!
//! # Modules
//!
//! - [`bot`]: Bot identity, lifecycle states, configuration blobs
//! - [`config`]: Process configuration from environment variables
//! - [`config_store`]: The external bot/agent configuration rows
//! - [`error`]: Error types shared by the workspace
//! - [`migrations`]: Idempotent schema setup
//! - [`models`]: LLM catalog - aliases, pricing, rate windows, token estimates
//! - [`state_store`]: The shared lifecycle registry and its backends
//! - [`tools`]: The registry of known agent tool names
//! - [`usage`]: Token usage records and sinks

#![deny(missing_docs)]

pub mod bot;
pub mod config;
pub mod config_store;
pub mod error;
pub mod migrations;
pub mod models;
pub mod state_store;
pub mod tools;
pub mod usage;

pub use bot::{AgentConfig, BotId, BotState, ConversationKey, InitConfig, SessionId};
pub use config::Config;
pub use error::CoreError;
pub use state_store::{StateStore, StopDecision};
