// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! pgkeeper - Postgres high-availability keeper
//!
//! One pgkeeper agent runs next to every Postgres node of a formation. It
//! supervises the local instance and keeps the node's state in sync with the
//! monitor, which decides the replication role of every node.
//!
//! # Architecture
//!
//! ```text
//!                    pgkeeper run (supervisor)
//!                    pidfile, signals, restarts
//!        ┌──────────────────┼──────────────────────┐
//!        ▼                  ▼                      ▼
//! ┌─────────────┐   ┌───────────────┐      ┌───────────────┐
//! │  postgres   │   │  node-active  │      │   listener    │
//! │ (permanent) │   │  (permanent)  │      │  (transient)  │
//! └─────────────┘   └───────────────┘      └───────────────┘
//!        ▲            │ observe   │ node_active     │ LISTEN state, log
//!        └────────────┘           ▼                 ▼
//!                           ┌──────────────────────────┐
//!                           │         monitor          │
//!                           └──────────────────────────┘
//! ```
//!
//! Services are stopped in reverse order, so the keeper and the listener are
//! gone before Postgres is asked to stop. A keeper stopped gracefully in the
//! middle of a tick completes that report first; no extra report is sent on
//! the way out.
//!
//! # Modules
//!
//! - [`supervisor`]: restart policies, pidfile, shutdown sequencing
//! - [`keeper`]: the observe/report/reconcile loop
//! - [`listener`]: logs formation state changes
//! - [`service`]: the processes the supervisor manages
//! - [`commands`]: what each `pgkeeper` subcommand does

#![deny(missing_docs)]

/// Operations behind the command line.
pub mod commands;

/// Agent configuration loaded from environment variables.
pub mod config;

/// Error types and exit codes.
pub mod error;

/// Keeper runtime loop.
pub mod keeper;

/// Notification listener service.
pub mod listener;

/// Local Postgres observation.
pub mod observer;

/// Supervisor pidfile.
pub mod pidfile;

/// Managed child processes.
pub mod service;

/// Signal to control event mapping.
pub mod signals;

/// Persisted keeper state.
pub mod state;

/// Out-of-process status checks.
pub mod status;

/// Process supervisor.
pub mod supervisor;

pub use config::Config;
pub use error::{Error, ExitCode, Result};
