// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Keeper runtime loop.
//!
//! Every `sleep` the keeper observes the local instance, reports it to the
//! monitor with `node_active` and records the goal it gets back. The goal is
//! reported as reached once an observation of the instance agrees with it,
//! never on an assignment alone. The local
//! [`NodeState`] only moves after the monitor answered: a failed call leaves
//! both the in-memory state and the state file as they were, and the next
//! tick retries with the same identity.
//!
//! Notifications for this node received between ticks update the assigned
//! role and trigger an immediate tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pgkeeper_monitor::{MonitorClient, MonitorNotification, Subscription};
use pgkeeper_protocol::{NodeActiveRequest, STATE_CHANNEL, StateNotification, decode_notification};
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConfigError};
use crate::error::{Error, Result};
use crate::observer::{Observation, PostgresObserver};
use crate::signals::{ControlEvent, StopMode};
use crate::state::{NodeState, StateFile};

/// Re-reads configuration on reload requests.
pub type ConfigLoader = Box<dyn Fn() -> std::result::Result<Config, ConfigError> + Send + Sync>;

/// Identity and pacing of the keeper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeeperConfig {
    /// Formation the node belongs to.
    pub formation: String,
    /// Host name reported to the monitor.
    pub node_name: String,
    /// Postgres port reported to the monitor.
    pub node_port: u16,
    /// Time between ticks.
    pub sleep: Duration,
}

impl KeeperConfig {
    /// Keeper settings from the agent configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            formation: config.formation.clone(),
            node_name: config.node_name.clone(),
            node_port: config.pg_port,
            sleep: config.keeper_sleep,
        }
    }

    fn same_node(&self, other: &KeeperConfig) -> bool {
        self.formation == other.formation
            && self.node_name == other.node_name
            && self.node_port == other.node_port
    }
}

/// The keeper loop and the state it owns.
pub struct Keeper {
    config: KeeperConfig,
    monitor: Arc<dyn MonitorClient>,
    observer: Arc<dyn PostgresObserver>,
    state_file: StateFile,
    state: NodeState,
    observation_failed: bool,
    monitor_failed: bool,
    config_loader: Option<ConfigLoader>,
}

impl Keeper {
    /// Keeper starting from `state`.
    pub fn new(
        config: KeeperConfig,
        monitor: Arc<dyn MonitorClient>,
        observer: Arc<dyn PostgresObserver>,
        state_file: StateFile,
        state: NodeState,
    ) -> Self {
        Self {
            config,
            monitor,
            observer,
            state_file,
            state,
            observation_failed: false,
            monitor_failed: false,
            config_loader: None,
        }
    }

    /// Keeper starting from the state stored in `state_file`.
    pub fn load(
        config: KeeperConfig,
        monitor: Arc<dyn MonitorClient>,
        observer: Arc<dyn PostgresObserver>,
        state_file: StateFile,
    ) -> Result<Self> {
        let state = state_file.load()?;
        Ok(Self::new(config, monitor, observer, state_file, state))
    }

    /// Use `loader` on reload requests.
    pub fn with_config_loader(mut self, loader: ConfigLoader) -> Self {
        self.config_loader = Some(loader);
        self
    }

    /// Current state.
    pub fn state(&self) -> &NodeState {
        &self.state
    }

    /// Current settings.
    pub fn config(&self) -> &KeeperConfig {
        &self.config
    }

    async fn observe(&mut self) -> Option<Observation> {
        match self.observer.observe().await {
            Ok(observation) => {
                if self.observation_failed {
                    info!("Local Postgres can be observed again");
                    self.observation_failed = false;
                }
                Some(observation)
            }
            Err(e) => {
                if !self.observation_failed {
                    warn!(error = %e, "Failed to observe local Postgres, reporting defaults");
                }
                self.observation_failed = true;
                None
            }
        }
    }

    /// Run one observe/report/reconcile round.
    ///
    /// On error nothing has been changed, locally or on disk.
    pub async fn tick(&mut self) -> Result<()> {
        let observed = match self.observe().await {
            Some(observation) => self.state.with_observation(&observation).with_goal_checked(),
            None => self.state.with_observation(&Observation::default()),
        };

        let request = NodeActiveRequest {
            formation: self.config.formation.clone(),
            node_name: self.config.node_name.clone(),
            node_port: self.config.node_port,
            node_id: observed.node_id,
            group_id: observed.group_id,
            reported_role: observed.reported_role,
            pg_is_running: observed.pg_is_running,
            current_lsn: observed.lsn_text(),
            sync_state: observed.sync_state.clone(),
        };
        debug!(request = ?request, "Calling node_active");

        let assigned = match self.monitor.node_active(&request).await {
            Ok(assigned) => assigned,
            Err(e) => {
                self.monitor_failed = true;
                return Err(e.into());
            }
        };

        if self.monitor_failed {
            info!("Successfully got the state from the monitor again");
            self.monitor_failed = false;
        }
        if observed.reported_role != self.state.reported_role {
            info!(
                from = %self.state.reported_role,
                "Reached state \"{}\"",
                observed.reported_role
            );
        }
        if assigned.role != observed.assigned_role {
            info!(
                node_id = assigned.node_id,
                group_id = assigned.group_id,
                from = %observed.assigned_role,
                "Monitor assigned new state \"{}\"",
                assigned.role
            );
        }

        let next = observed.with_assignment(assigned, Utc::now());
        if let Err(e) = self.state_file.store(&next) {
            error!(
                error = %e,
                path = %self.state_file.path().display(),
                "Failed to store keeper state"
            );
        }
        self.state = next;
        Ok(())
    }

    /// Apply a state change pushed by the monitor.
    ///
    /// Returns `true` when the notification was about this node and changed
    /// its assigned role.
    pub fn apply_notification(&mut self, notification: &StateNotification) -> bool {
        let ours = notification.concerns(
            &self.config.formation,
            &self.config.node_name,
            self.config.node_port,
        );
        if !ours || notification.goal_state == self.state.assigned_role {
            return false;
        }

        info!(
            node_id = notification.node_id,
            from = %self.state.assigned_role,
            "Monitor assigned new state \"{}\"",
            notification.goal_state
        );
        let next = NodeState {
            assigned_role: notification.goal_state,
            ..self.state.clone()
        };
        if let Err(e) = self.state_file.store(&next) {
            error!(error = %e, "Failed to store keeper state");
        }
        self.state = next;
        true
    }

    fn on_notification(&mut self, notification: &MonitorNotification) -> bool {
        if notification.channel != STATE_CHANNEL {
            return false;
        }
        match decode_notification(&notification.payload) {
            Ok(decoded) => self.apply_notification(&decoded),
            Err(e) => {
                warn!(error = %e, payload = %notification.payload, "Ignoring malformed notification");
                false
            }
        }
    }

    fn reload(&mut self) {
        let Some(loader) = &self.config_loader else {
            debug!("No configuration source to reload");
            return;
        };

        match loader() {
            Ok(config) => {
                let next = KeeperConfig::from_config(&config);
                if self.config.same_node(&next) {
                    self.config = next;
                } else {
                    warn!(
                        formation = %next.formation,
                        node = %next.node_name,
                        port = next.node_port,
                        "Node identity cannot change while running, keeping the current one"
                    );
                    self.config.sleep = next.sleep;
                }
                info!(sleep_secs = self.config.sleep.as_secs(), "Reloaded configuration");
            }
            Err(e) => error!(error = %e, "Failed to reload configuration, keeping the current one"),
        }
    }

    /// Tick until a stop request arrives or `control` closes.
    ///
    /// A graceful stop lets the tick in flight finish; fast and immediate
    /// stops abandon it.
    pub async fn run(
        mut self,
        mut control: mpsc::UnboundedReceiver<ControlEvent>,
        mut subscription: Option<Subscription>,
    ) {
        info!(
            formation = %self.config.formation,
            node = %self.config.node_name,
            port = self.config.node_port,
            node_id = self.state.node_id,
            sleep_secs = self.config.sleep.as_secs(),
            "Keeper started"
        );

        let mut interval = ticker(self.config.sleep);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                event = control.recv() => match event {
                    Some(ControlEvent::Reload) => {
                        self.reload();
                        interval = ticker(self.config.sleep);
                        continue;
                    }
                    Some(ControlEvent::Stop(mode)) => {
                        info!(mode = %mode, "Keeper stopping");
                        break;
                    }
                    None => break,
                },
                notification = next_notification(&mut subscription) => match notification {
                    Some(notification) => {
                        if !self.on_notification(&notification) {
                            continue;
                        }
                    }
                    None => {
                        warn!("Monitor subscription ended, relying on ticks only");
                        subscription = None;
                        continue;
                    }
                },
            }

            let mut reload = false;
            let mut stop = None;
            {
                let tick = self.tick();
                tokio::pin!(tick);
                loop {
                    tokio::select! {
                        result = &mut tick => {
                            if let Err(e) = result {
                                report_failed_tick(&e);
                            }
                            break;
                        }
                        event = control.recv(), if stop.is_none() => match event {
                            Some(ControlEvent::Stop(StopMode::Graceful)) | None => {
                                info!("Finishing the current tick before stopping");
                                stop = Some(StopMode::Graceful);
                            }
                            Some(ControlEvent::Stop(mode)) => {
                                info!(mode = %mode, "Abandoning the current tick");
                                stop = Some(mode);
                                break;
                            }
                            Some(ControlEvent::Reload) => reload = true,
                        },
                    }
                }
            }

            if stop.is_some() {
                break;
            }
            if reload {
                self.reload();
                interval = ticker(self.config.sleep);
            } else {
                interval.reset();
            }
        }

        info!(node_id = self.state.node_id, role = %self.state.assigned_role, "Keeper stopped");
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_notification(subscription: &mut Option<Subscription>) -> Option<MonitorNotification> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

fn report_failed_tick(error: &Error) {
    match error {
        Error::Monitor(e) if e.is_transient() => {
            warn!(error = %e, "Failed to contact the monitor, retrying on the next tick")
        }
        e => error!(error = %e, "Keeper tick failed, retrying on the next tick"),
    }
}
