// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request and response records exchanged with the monitor.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::role::NodeRole;

/// Goal handed back by the monitor after `register` or `node_active`.
///
/// The three fields travel together: a caller either applies the whole
/// record or none of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedState {
    /// Node id allocated by the monitor.
    pub node_id: i64,
    /// Replication group the node belongs to.
    pub group_id: i32,
    /// Role the monitor wants the node to reach.
    pub role: NodeRole,
}

/// What a node reports on every keeper tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeActiveRequest {
    /// Formation the node belongs to.
    pub formation: String,
    /// Host name other nodes use to reach this node.
    pub node_name: String,
    /// Postgres port of this node.
    pub node_port: u16,
    /// Node id as last assigned by the monitor.
    pub node_id: i64,
    /// Group id as last assigned by the monitor.
    pub group_id: i32,
    /// Role the node currently believes it holds.
    pub reported_role: NodeRole,
    /// Whether the local postmaster answered.
    pub pg_is_running: bool,
    /// Current WAL position in `X/Y` notation.
    pub current_lsn: String,
    /// `pg_stat_replication.sync_state` of the first standby, or empty.
    pub sync_state: String,
}

/// Kind of node being registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Plain Postgres node.
    #[default]
    Standalone,
    /// Citus coordinator.
    Coordinator,
    /// Citus worker.
    Worker,
}

impl NodeKind {
    /// Name understood by `register_node`.
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Standalone => "standalone",
            NodeKind::Coordinator => "coordinator",
            NodeKind::Worker => "worker",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration of a node with the monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Formation to join.
    pub formation: String,
    /// Host name other nodes use to reach this node.
    pub node_name: String,
    /// Postgres port of this node.
    pub node_port: u16,
    /// Database the formation replicates.
    pub dbname: String,
    /// `pg_control_system().system_identifier`, 0 when unknown.
    pub system_identifier: i64,
    /// Requested group, or `None` to let the monitor pick.
    pub desired_group: Option<i32>,
    /// State the node starts from.
    pub initial_role: NodeRole,
    /// Kind of node.
    pub kind: NodeKind,
    /// Failover candidate priority (0..=100).
    pub candidate_priority: i32,
    /// Whether the node counts towards the synchronous quorum.
    pub replication_quorum: bool,
}

/// A node as returned by the topology queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    /// Node id.
    pub node_id: i64,
    /// Host name.
    pub name: String,
    /// Postgres port.
    pub port: u16,
    /// Last LSN the monitor heard about, when the query exposes it.
    pub lsn: Option<String>,
    /// Whether the monitor considers this node the primary.
    pub is_primary: bool,
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {} \"{}:{}\"", self.node_id, self.name, self.port)
    }
}
