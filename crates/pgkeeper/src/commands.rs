// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operations behind the `pgkeeper` subcommands.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use pgkeeper_monitor::{MonitorClient, PostgresMonitor};
use pgkeeper_protocol::{NodeKind, NodeRole, RegisterRequest, STATE_CHANNEL};
use tokio::sync::mpsc;
use tracing::{Instrument, info, info_span, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::keeper::{Keeper, KeeperConfig};
use crate::listener::Listener;
use crate::observer::{LocalPostgres, PostgresObserver};
use crate::pidfile;
use crate::service::{self, LISTENER, NODE_ACTIVE};
use crate::signals::{self, StopMode};
use crate::state::{NodeState, StateFile};
use crate::supervisor::{Supervisor, SupervisorConfig};

/// Supervise Postgres and the agent services until stopped.
///
/// `log_filter` is handed down to the child services. With a monitor
/// configured the node must have been registered first.
pub async fn run(config: &Config, log_filter: &str) -> Result<()> {
    if config.monitor_uri.is_some() {
        let state = StateFile::new(&config.state_file).load()?;
        info!(
            node_id = state.node_id,
            group_id = state.group_id,
            role = %state.assigned_role,
            "Loaded keeper state"
        );
    }

    let services = service::default_services(config, log_filter)?;
    let supervisor = Supervisor::new(SupervisorConfig::from_config(config), services);
    let signals = signals::forward_signals(supervisor.control_sender())?;

    let result = supervisor.run().await;
    signals.abort();
    result
}

fn signal_supervisor(pidfile: &Path, signal: Signal) -> Result<Pid> {
    let contents =
        pidfile::read_live(pidfile)?.ok_or_else(|| Error::NotRunning(pidfile.to_path_buf()))?;
    service::send(contents.supervisor, signal)?;
    Ok(contents.supervisor)
}

/// Ask a running agent to stop.
pub fn stop(pidfile: &Path, mode: StopMode) -> Result<Pid> {
    let pid = signal_supervisor(pidfile, mode.signal())?;
    info!(pid = %pid, mode = %mode, "Sent stop request");
    Ok(pid)
}

/// Ask a running agent to reload its configuration.
pub fn reload(pidfile: &Path) -> Result<Pid> {
    let pid = signal_supervisor(pidfile, Signal::SIGHUP)?;
    info!(pid = %pid, "Sent reload request");
    Ok(pid)
}

/// Pid of the supervisor, or of `service` when given.
pub fn pid(pidfile: &Path, service: Option<&str>) -> Result<Option<Pid>> {
    match service {
        Some(name) => pidfile::find_service_pid(pidfile, name),
        None => Ok(pidfile::read_live(pidfile)?.map(|c| c.supervisor)),
    }
}

/// Register the node with the monitor and write its first state file.
pub async fn register(
    config: &Config,
    monitor: &dyn MonitorClient,
    observer: &dyn PostgresObserver,
) -> Result<NodeState> {
    let state_file = StateFile::new(&config.state_file);
    if state_file.exists() {
        let existing = state_file.load()?;
        return Err(Error::AlreadyRegistered {
            path: config.state_file.clone(),
            node_id: existing.node_id,
        });
    }

    let system_identifier = observer.system_identifier().await?;
    let request = RegisterRequest {
        formation: config.formation.clone(),
        node_name: config.node_name.clone(),
        node_port: config.pg_port,
        dbname: config.dbname.clone(),
        system_identifier,
        desired_group: config.group,
        initial_role: NodeRole::Init,
        kind: NodeKind::Standalone,
        candidate_priority: config.candidate_priority,
        replication_quorum: config.replication_quorum,
    };
    let assigned = monitor.register(&request).await?;

    let state = NodeState::registered(assigned, Utc::now());
    state_file.store(&state)?;
    info!(
        node_id = assigned.node_id,
        group_id = assigned.group_id,
        formation = %config.formation,
        "Registered node \"{}:{}\", assigned state \"{}\"",
        config.node_name,
        config.pg_port,
        assigned.role
    );
    Ok(state)
}

/// Local keeper state as pretty JSON.
pub fn show_state(config: &Config) -> Result<String> {
    let state = StateFile::new(&config.state_file).load()?;
    serde_json::to_string_pretty(&state).map_err(|source| Error::StateFile {
        path: config.state_file.clone(),
        source,
    })
}

/// Topology query behind `pgkeeper show`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowTarget {
    /// Primary of this node's group.
    Primary,
    /// Other nodes of this node's group.
    Nodes,
    /// Coordinator of the formation.
    Coordinator,
}

/// Ask the monitor about `target` and render the answer as text.
pub async fn show(config: &Config, monitor: &dyn MonitorClient, target: ShowTarget) -> Result<String> {
    match target {
        ShowTarget::Primary => {
            let group_id = match StateFile::new(&config.state_file).load() {
                Ok(state) => state.group_id,
                Err(Error::MissingState(_)) => config.group.unwrap_or(0),
                Err(e) => return Err(e),
            };
            Ok(match monitor.get_primary(&config.formation, group_id).await? {
                Some(primary) => primary.to_string(),
                None => format!("No primary in formation \"{}\" group {}", config.formation, group_id),
            })
        }
        ShowTarget::Nodes => {
            let nodes = monitor
                .get_other_nodes(&config.node_name, config.pg_port, None)
                .await?;
            Ok(nodes
                .iter()
                .map(|node| node.to_string())
                .collect::<Vec<_>>()
                .join("\n"))
        }
        ShowTarget::Coordinator => Ok(match monitor.get_coordinator(&config.formation).await? {
            Some(coordinator) => coordinator.to_string(),
            None => format!("No coordinator in formation \"{}\"", config.formation),
        }),
    }
}

/// `pgkeeper do service node-active`: the keeper loop.
pub async fn node_active_service(config: Config) -> Result<()> {
    async move {
        let monitor = Arc::new(PostgresMonitor::connect_lazy(
            config.require_monitor()?,
            config.connect_timeout,
        )?);
        let observer = Arc::new(LocalPostgres::connect_lazy(
            &config.local_uri,
            config.connect_timeout,
        )?);

        let keeper = Keeper::load(
            KeeperConfig::from_config(&config),
            monitor.clone(),
            observer,
            StateFile::new(&config.state_file),
        )?
        .with_config_loader(Box::new(Config::reload));

        let subscription = match monitor.subscribe(&[STATE_CHANNEL]).await {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                warn!(error = %e, "Failed to subscribe to monitor notifications, relying on ticks only");
                None
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let signals = signals::forward_signals(tx)?;
        keeper.run(rx, subscription).await;
        signals.abort();
        Ok::<(), Error>(())
    }
    .instrument(info_span!("service", name = NODE_ACTIVE))
    .await
}

/// `pgkeeper do service listener`: logs formation state changes.
pub async fn listener_service(config: Config) -> Result<()> {
    async move {
        let monitor =
            PostgresMonitor::connect_lazy(config.require_monitor()?, config.connect_timeout)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let signals = signals::forward_signals(tx)?;
        let result = Listener::new(&config.formation).run(&monitor, rx).await;
        signals.abort();
        result
    }
    .instrument(info_span!("service", name = LISTENER))
    .await
}
