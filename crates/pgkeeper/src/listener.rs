// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Notification listener service.
//!
//! Logs the monitor's event log and every node state change in the
//! formation. A payload that does not decode is logged and skipped.

use pgkeeper_monitor::{MonitorClient, MonitorError, MonitorNotification};
use pgkeeper_protocol::{LOG_CHANNEL, STATE_CHANNEL, StateNotification, decode_notification};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::signals::ControlEvent;

/// Listener for one formation.
#[derive(Debug, Clone)]
pub struct Listener {
    formation: String,
}

impl Listener {
    /// Listener logging state changes of `formation`.
    pub fn new(formation: impl Into<String>) -> Self {
        Self {
            formation: formation.into(),
        }
    }

    /// Log one notification, returning it decoded when it is a state change
    /// in this formation.
    pub fn handle(&self, notification: &MonitorNotification) -> Option<StateNotification> {
        match notification.channel.as_str() {
            LOG_CHANNEL => {
                info!(channel = LOG_CHANNEL, "{}", notification.payload);
                None
            }
            STATE_CHANNEL => match decode_notification(&notification.payload) {
                Ok(state) if state.formation_id == self.formation => {
                    info!(
                        group_id = state.group_id,
                        node_id = state.node_id,
                        "New state for node {} \"{}:{}\": {} -> {}",
                        state.node_id,
                        state.node_name,
                        state.node_port,
                        state.reported_state,
                        state.goal_state
                    );
                    Some(state)
                }
                Ok(state) => {
                    debug!(formation = %state.formation_id, "Skipping notification for another formation");
                    None
                }
                Err(e) => {
                    warn!(error = %e, payload = %notification.payload, "Failed to decode notification");
                    None
                }
            },
            other => {
                debug!(channel = other, "Skipping notification on unexpected channel");
                None
            }
        }
    }

    /// Listen until a stop request arrives.
    ///
    /// Returns an error when the subscription cannot be opened or ends, so
    /// the supervisor relaunches the service.
    pub async fn run(
        &self,
        monitor: &dyn MonitorClient,
        mut control: mpsc::UnboundedReceiver<ControlEvent>,
    ) -> Result<()> {
        let mut subscription = monitor.subscribe(&[STATE_CHANNEL, LOG_CHANNEL]).await?;
        info!(formation = %self.formation, "Listening for monitor notifications");

        loop {
            tokio::select! {
                event = control.recv() => match event {
                    Some(ControlEvent::Stop(mode)) => {
                        info!(mode = %mode, "Listener stopping");
                        return Ok(());
                    }
                    Some(ControlEvent::Reload) => debug!("Listener has nothing to reload"),
                    None => return Ok(()),
                },
                notification = subscription.recv() => match notification {
                    Some(notification) => {
                        self.handle(&notification);
                    }
                    None => {
                        return Err(MonitorError::Unavailable("notification subscription ended".into()).into());
                    }
                },
            }
        }
    }
}
