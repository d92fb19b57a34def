// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process supervisor.
//!
//! The supervisor starts every [`Service`] in order, records their pids in the
//! pidfile and then runs a single event loop. Child exit watchers, delayed
//! relaunches and control events (signals) all post into that loop; only the
//! loop touches the services list and the pidfile.
//!
//! # Restarts
//!
//! An exited service is relaunched according to its [`RestartPolicy`],
//! after a capped exponential backoff. A service relaunched
//! `max_restarts` times within `window` has hit the restart ceiling: for a
//! permanent service the whole agent shuts down with an error, any other
//! service is left stopped. Counters reset once a service has stayed up for
//! `stable_period`.
//!
//! # Shutdown
//!
//! Services are stopped in reverse start order, so the keeper and the
//! listener go away before Postgres. A graceful stop signals one service at
//! a time and waits for it to exit; fast and immediate stops signal
//! everything at once. A stop that takes too long is escalated
//! (graceful → fast → immediate → SIGKILL). The pidfile is removed once the
//! last child has been reaped.
//!
//! # Pidfile ownership
//!
//! The pidfile is created exclusively and belongs to the supervisor while
//! its first line names it. Every rewrite checks that first; once another
//! process has taken the file over, the supervisor stops immediately and
//! never writes or removes it again.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::pidfile::{self, PidfileContents};
use crate::service::{self, RestartPolicy, Service, ServiceExit};
use crate::signals::{ControlEvent, StopMode};

/// Restart ceiling and backoff.
#[derive(Debug, Clone)]
pub struct RestartIntensity {
    /// Relaunches allowed within `window`.
    pub max_restarts: usize,
    /// Sliding window the relaunches are counted in.
    pub window: Duration,
    /// Uptime after which a service's counters are reset.
    pub stable_period: Duration,
    /// Delay before the first relaunch.
    pub backoff_base: Duration,
    /// Upper bound on the relaunch delay.
    pub backoff_max: Duration,
}

impl Default for RestartIntensity {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(10),
            stable_period: Duration::from_secs(15),
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
        }
    }
}

impl RestartIntensity {
    /// Delay before relaunching a service that already failed `retries` times.
    pub fn backoff(&self, retries: u32) -> Duration {
        let factor = 1u32 << retries.min(16);
        self.backoff_base.saturating_mul(factor).min(self.backoff_max)
    }
}

/// Configuration for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Pidfile path.
    pub pidfile: PathBuf,
    /// Restart ceiling and backoff.
    pub restart: RestartIntensity,
    /// How long a graceful stop may take before it escalates to fast.
    pub stop_timeout: Duration,
    /// How long fast and immediate stops may take before escalating.
    pub escalation_interval: Duration,
    /// Period of counter resets, pidfile checks and escalation checks.
    pub housekeeping_interval: Duration,
}

impl SupervisorConfig {
    /// Defaults for a supervisor writing `pidfile`.
    pub fn new(pidfile: impl Into<PathBuf>) -> Self {
        Self {
            pidfile: pidfile.into(),
            restart: RestartIntensity::default(),
            stop_timeout: Duration::from_secs(30),
            escalation_interval: Duration::from_secs(10),
            housekeeping_interval: Duration::from_secs(1),
        }
    }

    /// Supervisor settings from the agent configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            stop_timeout: config.stop_timeout,
            ..Self::new(&config.pidfile)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceState {
    Idle,
    Running,
    RestartPending,
    Retired,
}

struct ManagedService {
    service: Box<dyn Service>,
    state: ServiceState,
    pid: Option<Pid>,
    retries: u32,
    restarts: VecDeque<Instant>,
    start_time: Option<Instant>,
    stop_time: Option<Instant>,
    stop_sent: Option<StopMode>,
}

impl ManagedService {
    fn new(service: Box<dyn Service>) -> Self {
        Self {
            service,
            state: ServiceState::Idle,
            pid: None,
            retries: 0,
            restarts: VecDeque::new(),
            start_time: None,
            stop_time: None,
            stop_sent: None,
        }
    }

    fn name(&self) -> &str {
        self.service.name()
    }
}

#[derive(Debug)]
enum Event {
    Exited {
        index: usize,
        pid: Pid,
        exit: ServiceExit,
    },
    Relaunch {
        index: usize,
    },
}

#[derive(Debug, Clone, Copy)]
struct ShutdownState {
    mode: StopMode,
    since: Instant,
}

/// Owns and supervises the agent's services.
pub struct Supervisor {
    config: SupervisorConfig,
    services: Vec<ManagedService>,
    own_pid: Pid,
    owns_pidfile: bool,
    failure: Option<Error>,
    shutdown: Option<ShutdownState>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    control_rx: mpsc::UnboundedReceiver<ControlEvent>,
}

impl Supervisor {
    /// Supervisor for `services`, started in the given order.
    pub fn new(config: SupervisorConfig, services: Vec<Box<dyn Service>>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            config,
            services: services.into_iter().map(ManagedService::new).collect(),
            own_pid: Pid::this(),
            owns_pidfile: false,
            failure: None,
            shutdown: None,
            events_tx,
            events_rx,
            control_tx,
            control_rx,
        }
    }

    /// Sender for stop and reload requests, e.g. from
    /// [`forward_signals`](crate::signals::forward_signals).
    pub fn control_sender(&self) -> mpsc::UnboundedSender<ControlEvent> {
        self.control_tx.clone()
    }

    /// Whether a shutdown has begun.
    pub fn shutdown_in_progress(&self) -> bool {
        self.shutdown.is_some()
    }

    /// Start every service and supervise them until shutdown completes.
    ///
    /// Returns an error when the agent stopped for any reason other than a
    /// requested stop or every service retiring cleanly.
    pub async fn run(mut self) -> Result<()> {
        self.acquire_pidfile()?;
        info!(
            pid = %self.own_pid,
            pidfile = %self.config.pidfile.display(),
            services = self.services.len(),
            "Started supervisor"
        );

        if let Err(e) = self.start_all() {
            error!(error = %e, "Failed to start services, stopping the ones already running");
            self.fail(e);
            self.begin_shutdown(StopMode::Immediate);
        }

        self.supervise().await;

        if self.owns_pidfile {
            if let Err(e) = pidfile::remove_owned(&self.config.pidfile, self.own_pid) {
                self.fail(e);
            }
        }

        match self.failure.take() {
            Some(e) => {
                error!(error = %e, "Supervisor stopped with an error");
                Err(e)
            }
            None => {
                info!("Supervisor stopped");
                Ok(())
            }
        }
    }

    /// Begin shutting down with `mode`.
    ///
    /// Returns `false` without signaling anything when a shutdown is
    /// already in progress.
    pub fn request_stop(&mut self, mode: StopMode) -> bool {
        if let Some(shutdown) = &self.shutdown {
            info!(
                requested = %mode,
                in_progress = %shutdown.mode,
                "Shutdown already in progress, ignoring stop request"
            );
            return false;
        }
        self.begin_shutdown(mode);
        true
    }

    fn acquire_pidfile(&mut self) -> Result<()> {
        let path = &self.config.pidfile;
        // a stale file is dropped by read_live, then creation is retried once
        for _ in 0..2 {
            if pidfile::create(path, &PidfileContents::new(self.own_pid))? {
                self.owns_pidfile = true;
                return Ok(());
            }
            match pidfile::read_live(path)? {
                Some(existing) if existing.supervisor != self.own_pid => {
                    return Err(Error::AlreadyRunning {
                        path: path.clone(),
                        pid: existing.supervisor.as_raw(),
                    });
                }
                Some(_) => {
                    self.owns_pidfile = true;
                    return self.write_pidfile();
                }
                None => {}
            }
        }
        Err(Error::Pidfile {
            path: path.clone(),
            reason: "recreated by another process while starting".to_string(),
        })
    }

    fn write_pidfile(&self) -> Result<()> {
        let contents = PidfileContents {
            supervisor: self.own_pid,
            services: self
                .services
                .iter()
                .filter_map(|s| s.pid.map(|pid| (s.name().to_string(), pid)))
                .collect(),
        };
        pidfile::write(&self.config.pidfile, &contents)
    }

    fn update_pidfile(&mut self) {
        if !self.verify_pidfile() {
            return;
        }
        if let Err(e) = self.write_pidfile() {
            error!(error = %e, pidfile = %self.config.pidfile.display(), "Failed to update pidfile");
        }
    }

    fn fail(&mut self, error: Error) {
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }

    fn start_all(&mut self) -> Result<()> {
        for index in 0..self.services.len() {
            self.start_service(index)?;
            if !self.verify_pidfile() {
                break;
            }
            self.write_pidfile()?;
        }
        Ok(())
    }

    fn start_service(&mut self, index: usize) -> Result<()> {
        let managed = &mut self.services[index];
        let child = managed.service.start()?;
        let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
            return Err(Error::ServiceStart {
                name: managed.name().to_string(),
                source: std::io::Error::other("child exited before its pid could be read"),
            });
        };
        let pid = Pid::from_raw(pid);

        managed.pid = Some(pid);
        managed.state = ServiceState::Running;
        managed.start_time = Some(Instant::now());
        managed.stop_sent = None;
        info!(
            service = managed.name(),
            pid = %pid,
            policy = ?managed.service.restart_policy(),
            "Started service"
        );

        self.watch(index, pid, child);
        Ok(())
    }

    fn watch(&self, index: usize, pid: Pid, mut child: Child) {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => ServiceExit::from_status(status),
                Err(e) => {
                    warn!(pid = %pid, error = %e, "Failed to wait for child process");
                    ServiceExit::Lost
                }
            };
            let _ = tx.send(Event::Exited { index, pid, exit });
        });
    }

    fn finished(&self) -> bool {
        let live = self.services.iter().any(|s| s.pid.is_some());
        let pending = self
            .services
            .iter()
            .any(|s| s.state == ServiceState::RestartPending);
        !live && (self.shutdown.is_some() || !pending)
    }

    async fn supervise(&mut self) {
        let mut housekeeping = tokio::time::interval(self.config.housekeeping_interval);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.finished() {
            tokio::select! {
                Some(event) = self.events_rx.recv() => match event {
                    Event::Exited { index, pid, exit } => self.on_exit(index, pid, exit),
                    Event::Relaunch { index } => self.on_relaunch(index),
                },
                Some(control) = self.control_rx.recv() => match control {
                    ControlEvent::Stop(mode) => {
                        self.request_stop(mode);
                    }
                    ControlEvent::Reload => self.reload_services(),
                },
                _ = housekeeping.tick() => self.housekeeping(),
            }
        }

        if self.shutdown.is_none() {
            info!("Every service has exited");
        }
    }

    fn on_exit(&mut self, index: usize, pid: Pid, exit: ServiceExit) {
        let managed = &mut self.services[index];
        if managed.pid != Some(pid) {
            debug!(pid = %pid, "Ignoring exit of a process that is no longer tracked");
            return;
        }

        let now = Instant::now();
        managed.pid = None;
        managed.stop_time = Some(now);
        let uptime_ms = managed
            .start_time
            .map(|start| now.duration_since(start).as_millis())
            .unwrap_or_default();
        let name = managed.name().to_string();

        if self.shutdown.is_some() {
            managed.state = ServiceState::Retired;
            info!(service = %name, pid = %pid, "Service {} {}", name, exit);
            self.update_pidfile();
            self.advance_shutdown();
            return;
        }

        if exit.is_clean() {
            info!(service = %name, pid = %pid, uptime_ms, "Service {} {}", name, exit);
        } else {
            error!(service = %name, pid = %pid, uptime_ms, "Service {} {}", name, exit);
        }
        self.update_pidfile();
        if self.shutdown.is_some() {
            // the pidfile was lost while updating it
            self.services[index].state = ServiceState::Retired;
            return;
        }
        self.after_exit(index, exit);
    }

    fn after_exit(&mut self, index: usize, exit: ServiceExit) {
        let restart = self.config.restart.clone();
        let managed = &mut self.services[index];
        let policy = managed.service.restart_policy();
        let name = managed.name().to_string();

        if !policy.should_restart(&exit) {
            managed.state = ServiceState::Retired;
            info!(service = %name, policy = ?policy, "Not restarting service");
            return;
        }

        let now = Instant::now();
        managed
            .restarts
            .retain(|at| now.duration_since(*at) < restart.window);

        if managed.restarts.len() >= restart.max_restarts {
            managed.state = ServiceState::Retired;
            error!(
                service = %name,
                restarts = managed.restarts.len(),
                window_secs = restart.window.as_secs(),
                "Service restarted too often"
            );
            if policy == RestartPolicy::Permanent {
                self.fail(Error::RestartLimit { name });
                self.begin_shutdown(StopMode::Graceful);
            }
            return;
        }

        let delay = restart.backoff(managed.retries);
        managed.retries += 1;
        managed.restarts.push_back(now);
        managed.state = ServiceState::RestartPending;
        info!(
            service = %name,
            retries = managed.retries,
            delay_ms = delay.as_millis(),
            "Restarting service"
        );

        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Event::Relaunch { index });
        });
    }

    fn on_relaunch(&mut self, index: usize) {
        if self.shutdown.is_some() || self.services[index].state != ServiceState::RestartPending {
            return;
        }

        match self.start_service(index) {
            Ok(()) => self.update_pidfile(),
            Err(e) => {
                error!(error = %e, "Failed to restart service");
                self.after_exit(index, ServiceExit::Lost);
            }
        }
    }

    fn begin_shutdown(&mut self, mode: StopMode) {
        info!(mode = %mode, "Stopping every service");
        self.shutdown = Some(ShutdownState {
            mode,
            since: Instant::now(),
        });
        for managed in &mut self.services {
            if managed.state == ServiceState::RestartPending {
                managed.state = ServiceState::Retired;
            }
        }
        self.advance_shutdown();
    }

    /// Signal services in reverse start order.
    ///
    /// In graceful mode only the first live service is signaled; the next
    /// one follows once it has been reaped.
    fn advance_shutdown(&mut self) {
        let Some(shutdown) = self.shutdown else {
            return;
        };

        for managed in self.services.iter_mut().rev() {
            let Some(pid) = managed.pid else {
                continue;
            };

            if managed.stop_sent.is_none_or(|sent| sent < shutdown.mode) {
                managed.stop_sent = Some(shutdown.mode);
                info!(
                    service = managed.name(),
                    pid = %pid,
                    mode = %shutdown.mode,
                    signal = %shutdown.mode.signal(),
                    "Stopping service"
                );
                if let Err(e) = managed.service.stop(pid, shutdown.mode) {
                    error!(service = managed.name(), pid = %pid, error = %e, "Failed to stop service");
                }
            }

            if shutdown.mode == StopMode::Graceful {
                break;
            }
        }
    }

    fn reload_services(&mut self) {
        if self.shutdown.is_some() {
            debug!("Ignoring reload request during shutdown");
            return;
        }
        for managed in &self.services {
            let Some(pid) = managed.pid else {
                continue;
            };
            info!(service = managed.name(), pid = %pid, "Reloading service");
            if let Err(e) = managed.service.reload(pid) {
                warn!(service = managed.name(), pid = %pid, error = %e, "Failed to reload service");
            }
        }
    }

    fn housekeeping(&mut self) {
        let now = Instant::now();

        if let Some(shutdown) = self.shutdown {
            let deadline = match shutdown.mode {
                StopMode::Graceful => self.config.stop_timeout,
                _ => self.config.escalation_interval,
            };
            if now.duration_since(shutdown.since) < deadline {
                return;
            }

            match shutdown.mode.escalate() {
                Some(next) => {
                    warn!(from = %shutdown.mode, to = %next, "Services did not stop in time, escalating");
                    self.shutdown = Some(ShutdownState { mode: next, since: now });
                    self.advance_shutdown();
                }
                None => {
                    self.shutdown = Some(ShutdownState { since: now, ..shutdown });
                    self.kill_remaining();
                }
            }
            return;
        }

        let stable_period = self.config.restart.stable_period;
        for managed in &mut self.services {
            let stable = managed
                .start_time
                .is_some_and(|start| now.duration_since(start) >= stable_period);
            if managed.state == ServiceState::Running && managed.retries > 0 && stable {
                debug!(service = managed.name(), "Service is stable, resetting restart counters");
                managed.retries = 0;
                managed.restarts.clear();
            }
        }

        self.verify_pidfile();
    }

    /// Whether the pidfile still names this supervisor.
    ///
    /// Losing it starts an immediate shutdown unless one is under way.
    fn verify_pidfile(&mut self) -> bool {
        if !self.owns_pidfile {
            return false;
        }

        let path = &self.config.pidfile;
        let owner = match pidfile::read(path) {
            Ok(contents) => contents.map(|c| c.supervisor),
            Err(Error::Io(e)) => {
                warn!(error = %e, pidfile = %path.display(), "Failed to read pidfile");
                return true;
            }
            Err(e) => {
                warn!(error = %e, "Pidfile is unreadable");
                None
            }
        };

        if owner == Some(self.own_pid) {
            return true;
        }

        error!(
            pidfile = %path.display(),
            owner = ?owner.map(|p| p.as_raw()),
            "Pidfile was removed or taken over, stopping"
        );
        self.owns_pidfile = false;
        let path = path.clone();
        self.fail(Error::PidfileLost(path));
        if self.shutdown.is_none() {
            self.begin_shutdown(StopMode::Immediate);
        }
        false
    }

    fn kill_remaining(&self) {
        for managed in &self.services {
            let Some(pid) = managed.pid else {
                continue;
            };
            warn!(service = managed.name(), pid = %pid, "Service ignored every stop signal, killing it");
            if let Err(e) = service::send(pid, Signal::SIGKILL) {
                error!(service = managed.name(), pid = %pid, error = %e, "Failed to kill service");
            }
        }
    }
}
