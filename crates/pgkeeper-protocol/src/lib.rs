// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! pgkeeper protocol - keeper/monitor records and notification decoding
//!
//! This crate holds the vocabulary shared between a node's keeper and the
//! monitor that assigns replication roles across a formation:
//!
//! - [`NodeRole`]: the replication states the monitor knows about
//! - [`AssignedState`]: the goal the monitor hands back to a node
//! - [`NodeActiveRequest`] / [`RegisterRequest`]: what a node reports
//! - [`NodeAddress`]: topology records returned by the monitor
//! - [`StateNotification`]: pushed state changes, decoded by [`decode_notification`]
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  node_active / register   ┌──────────────┐
//! │    keeper    │ ────────────────────────▶ │   monitor    │
//! │              │ ◀──────────────────────── │              │
//! │              │      AssignedState        │              │
//! │              │                           │              │
//! │   listener   │ ◀─── LISTEN "state" ───── │   NOTIFY     │
//! └──────────────┘   "S:<rep>:<goal>:..."    └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use pgkeeper_protocol::{decode_notification, NodeRole};
//!
//! let n = decode_notification("S:wait_primary:wait_primary:7.default:0:1:9.localhost:4001")?;
//! assert_eq!(n.goal_state, NodeRole::WaitPrimary);
//! assert_eq!(n.node_name, "localhost");
//! # Ok::<(), pgkeeper_protocol::DecodeError>(())
//! ```

pub mod notification;
pub mod records;
pub mod role;

pub use notification::{DecodeError, StateNotification, decode_notification};
pub use records::{AssignedState, NodeActiveRequest, NodeAddress, NodeKind, RegisterRequest};
pub use role::{NodeRole, UnknownRole};

/// Channel the monitor publishes node state changes on.
pub const STATE_CHANNEL: &str = "state";

/// Channel the monitor publishes its event log on.
pub const LOG_CHANNEL: &str = "log";
