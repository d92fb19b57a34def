// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Monitor client trait.

use async_trait::async_trait;
use pgkeeper_protocol::{AssignedState, NodeActiveRequest, NodeAddress, NodeRole, RegisterRequest};
use tokio::sync::mpsc;

use crate::error::Result;

/// A raw payload received on a LISTEN channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorNotification {
    /// Channel the payload was published on.
    pub channel: String,
    /// Payload text, decoded by the consumer.
    pub payload: String,
}

/// Receiving end of a monitor subscription.
///
/// Dropping it ends the subscription.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<MonitorNotification>,
}

impl Subscription {
    /// Wrap a channel fed by a client implementation.
    pub fn new(rx: mpsc::Receiver<MonitorNotification>) -> Self {
        Self { rx }
    }

    /// Next notification, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<MonitorNotification> {
        self.rx.recv().await
    }
}

/// Operations a node performs against the monitor.
///
/// Every call is a bounded request/response exchange; a failed call leaves
/// nothing half-applied on the monitor side that the caller needs to undo.
#[async_trait]
pub trait MonitorClient: Send + Sync {
    /// Register the node in its formation.
    async fn register(&self, request: &RegisterRequest) -> Result<AssignedState>;

    /// Report the locally observed state and fetch the current goal.
    ///
    /// Safe to repeat with the same arguments.
    async fn node_active(&self, request: &NodeActiveRequest) -> Result<AssignedState>;

    /// Current primary of a group, if any.
    async fn get_primary(&self, formation: &str, group_id: i32) -> Result<Option<NodeAddress>>;

    /// Other nodes of the group `node_name:node_port` belongs to, optionally
    /// restricted to nodes currently in `role`.
    async fn get_other_nodes(
        &self,
        node_name: &str,
        node_port: u16,
        role: Option<NodeRole>,
    ) -> Result<Vec<NodeAddress>>;

    /// Coordinator of a formation, if it has one.
    async fn get_coordinator(&self, formation: &str) -> Result<Option<NodeAddress>>;

    /// LISTEN on `channels`.
    async fn subscribe(&self, channels: &[&str]) -> Result<Subscription>;
}
