// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock monitor for testing.
//!
//! Records every call it receives and answers from scripted state, so keeper
//! behaviour can be exercised without a monitor database.

use async_trait::async_trait;
use pgkeeper_protocol::{AssignedState, NodeActiveRequest, NodeAddress, NodeRole, RegisterRequest};
use tokio::sync::{Mutex, mpsc};

use crate::client::{MonitorClient, MonitorNotification, Subscription};
use crate::error::{MonitorError, Result};

#[derive(Default)]
struct MockState {
    assigned: Option<AssignedState>,
    failing: bool,
    register_calls: Vec<RegisterRequest>,
    node_active_calls: Vec<NodeActiveRequest>,
    primary: Option<NodeAddress>,
    nodes: Vec<NodeAddress>,
    coordinator: Option<NodeAddress>,
    subscribers: Vec<(Vec<String>, mpsc::Sender<MonitorNotification>)>,
}

/// Mock monitor for testing.
#[derive(Default)]
pub struct MockMonitor {
    state: Mutex<MockState>,
}

impl MockMonitor {
    /// Create a mock that echoes reported state back as the goal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock whose calls all fail as if the monitor were down.
    pub fn failing() -> Self {
        Self {
            state: Mutex::new(MockState {
                failing: true,
                ..MockState::default()
            }),
        }
    }

    /// Answer `register` and `node_active` with `assigned` from now on.
    pub async fn set_assigned(&self, assigned: AssignedState) {
        self.state.lock().await.assigned = Some(assigned);
    }

    /// Make every call fail (or succeed again).
    pub async fn set_failing(&self, failing: bool) {
        self.state.lock().await.failing = failing;
    }

    /// Topology returned by the read-only queries.
    pub async fn set_topology(
        &self,
        primary: Option<NodeAddress>,
        nodes: Vec<NodeAddress>,
        coordinator: Option<NodeAddress>,
    ) {
        let mut state = self.state.lock().await;
        state.primary = primary;
        state.nodes = nodes;
        state.coordinator = coordinator;
    }

    /// `node_active` requests received so far.
    pub async fn node_active_calls(&self) -> Vec<NodeActiveRequest> {
        self.state.lock().await.node_active_calls.clone()
    }

    /// `register` requests received so far.
    pub async fn register_calls(&self) -> Vec<RegisterRequest> {
        self.state.lock().await.register_calls.clone()
    }

    /// Deliver `payload` to every live subscriber of `channel`.
    ///
    /// Returns how many subscribers received it; a subscriber with a full
    /// buffer misses the payload, like a LISTEN connection that dropped.
    pub async fn publish(&self, channel: &str, payload: &str) -> usize {
        let mut state = self.state.lock().await;
        state.subscribers.retain(|(_, tx)| !tx.is_closed());

        let mut delivered = 0;
        for (channels, tx) in &state.subscribers {
            if !channels.iter().any(|c| c == channel) {
                continue;
            }
            let notification = MonitorNotification {
                channel: channel.to_string(),
                payload: payload.to_string(),
            };
            if tx.try_send(notification).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    fn check(state: &MockState) -> Result<()> {
        if state.failing {
            return Err(MonitorError::Unavailable("mock monitor is failing".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MonitorClient for MockMonitor {
    async fn register(&self, request: &RegisterRequest) -> Result<AssignedState> {
        let mut state = self.state.lock().await;
        state.register_calls.push(request.clone());
        Self::check(&state)?;

        Ok(state.assigned.unwrap_or(AssignedState {
            node_id: 1,
            group_id: request.desired_group.unwrap_or(0),
            role: NodeRole::Single,
        }))
    }

    async fn node_active(&self, request: &NodeActiveRequest) -> Result<AssignedState> {
        let mut state = self.state.lock().await;
        state.node_active_calls.push(request.clone());
        Self::check(&state)?;

        Ok(state.assigned.unwrap_or(AssignedState {
            node_id: request.node_id,
            group_id: request.group_id,
            role: request.reported_role,
        }))
    }

    async fn get_primary(&self, _formation: &str, _group_id: i32) -> Result<Option<NodeAddress>> {
        let state = self.state.lock().await;
        Self::check(&state)?;
        Ok(state.primary.clone())
    }

    async fn get_other_nodes(
        &self,
        node_name: &str,
        node_port: u16,
        _role: Option<NodeRole>,
    ) -> Result<Vec<NodeAddress>> {
        let state = self.state.lock().await;
        Self::check(&state)?;
        Ok(state
            .nodes
            .iter()
            .filter(|n| !(n.name == node_name && n.port == node_port))
            .cloned()
            .collect())
    }

    async fn get_coordinator(&self, _formation: &str) -> Result<Option<NodeAddress>> {
        let state = self.state.lock().await;
        Self::check(&state)?;
        Ok(state.coordinator.clone())
    }

    async fn subscribe(&self, channels: &[&str]) -> Result<Subscription> {
        let mut state = self.state.lock().await;
        Self::check(&state)?;
        let (tx, rx) = mpsc::channel(16);
        state
            .subscribers
            .push((channels.iter().map(|c| c.to_string()).collect(), tx));
        Ok(Subscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(role: NodeRole) -> NodeActiveRequest {
        NodeActiveRequest {
            formation: "default".into(),
            node_name: "localhost".into(),
            node_port: 5432,
            node_id: 3,
            group_id: 0,
            reported_role: role,
            pg_is_running: true,
            current_lsn: "0/3000060".into(),
            sync_state: String::new(),
        }
    }

    #[tokio::test]
    async fn test_node_active_echoes_by_default() {
        let mock = MockMonitor::new();
        let assigned = mock.node_active(&request(NodeRole::Secondary)).await.unwrap();
        assert_eq!(assigned.node_id, 3);
        assert_eq!(assigned.role, NodeRole::Secondary);
        assert_eq!(mock.node_active_calls().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failing_mock_still_records_calls() {
        let mock = MockMonitor::failing();
        let err = mock.node_active(&request(NodeRole::Primary)).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(mock.node_active_calls().await.len(), 1);

        mock.set_failing(false).await;
        assert!(mock.node_active(&request(NodeRole::Primary)).await.is_ok());
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers() {
        let mock = MockMonitor::new();
        let mut state_sub = mock.subscribe(&["state"]).await.unwrap();
        let log_sub = mock.subscribe(&["log"]).await.unwrap();

        assert_eq!(mock.publish("state", "S:x").await, 1);
        let n = state_sub.recv().await.unwrap();
        assert_eq!(n.channel, "state");
        assert_eq!(n.payload, "S:x");

        drop(log_sub);
        assert_eq!(mock.publish("log", "hello").await, 0);
    }

    #[tokio::test]
    async fn test_other_nodes_excludes_self() {
        let mock = MockMonitor::new();
        let node = |id, port| NodeAddress {
            node_id: id,
            name: "localhost".into(),
            port,
            lsn: None,
            is_primary: id == 1,
        };
        mock.set_topology(Some(node(1, 5432)), vec![node(1, 5432), node(2, 5433)], None)
            .await;

        let others = mock.get_other_nodes("localhost", 5432, None).await.unwrap();
        assert_eq!(others, vec![node(2, 5433)]);
        assert_eq!(mock.get_primary("default", 0).await.unwrap(), Some(node(1, 5432)));
        assert_eq!(mock.get_coordinator("default").await.unwrap(), None);
    }
}
