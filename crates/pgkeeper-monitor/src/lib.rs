// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Monitor client for pgkeeper.
//!
//! The monitor is a Postgres database exposing the `pgautofailover` SQL API.
//! Nodes talk to it through [`MonitorClient`]:
//!
//! - `register`: join a formation and get a node id, group and first goal
//! - `node_active`: report locally observed state, get the current goal
//! - `get_primary` / `get_other_nodes` / `get_coordinator`: topology lookups
//! - `subscribe`: LISTEN for state changes pushed by the monitor
//!
//! [`PostgresMonitor`] is the production implementation, [`MockMonitor`]
//! scripts responses for tests.

#![deny(missing_docs)]

/// Monitor client trait and subscription handle
pub mod client;
/// Error types
pub mod error;
/// Scriptable in-memory monitor
pub mod mock;
/// sqlx-backed monitor client
pub mod postgres;

pub use client::{MonitorClient, MonitorNotification, Subscription};
pub use error::{MonitorError, Result};
pub use mock::MockMonitor;
pub use postgres::PostgresMonitor;
