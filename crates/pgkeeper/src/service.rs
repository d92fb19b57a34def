// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Services managed by the supervisor.
//!
//! A service is a child process with a name, a restart policy and the three
//! lifecycle operations `start`, `stop` and `reload`. The supervisor owns
//! every service; services never look at each other.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::signals::StopMode;

/// Name of the Postgres service.
pub const POSTGRES: &str = "postgres";
/// Name of the keeper loop service.
pub const NODE_ACTIVE: &str = "node-active";
/// Name of the notification listener service.
pub const LISTENER: &str = "listener";

/// What the supervisor does when a service exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Always restarted.
    Permanent,
    /// Never restarted.
    Temporary,
    /// Restarted only after an abnormal exit.
    Transient,
}

impl RestartPolicy {
    /// Whether a service under this policy is relaunched after `exit`.
    pub fn should_restart(self, exit: &ServiceExit) -> bool {
        match self {
            RestartPolicy::Permanent => true,
            RestartPolicy::Temporary => false,
            RestartPolicy::Transient => !exit.is_clean(),
        }
    }
}

/// How a service process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceExit {
    /// Exit status 0.
    Quit,
    /// Non-zero exit status.
    Failed(i32),
    /// Killed by a signal.
    Signaled(i32),
    /// Could not be spawned, or the exit status was lost.
    Lost,
}

impl ServiceExit {
    /// Classify an exit status.
    pub fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(0), _) => ServiceExit::Quit,
            (Some(code), _) => ServiceExit::Failed(code),
            (None, Some(sig)) => ServiceExit::Signaled(sig),
            (None, None) => ServiceExit::Lost,
        }
    }

    /// Whether this is a clean quit.
    pub fn is_clean(&self) -> bool {
        matches!(self, ServiceExit::Quit)
    }
}

impl std::fmt::Display for ServiceExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceExit::Quit => write!(f, "exited with code 0"),
            ServiceExit::Failed(code) => write!(f, "exited with code {}", code),
            ServiceExit::Signaled(sig) => match Signal::try_from(*sig) {
                Ok(signal) => write!(f, "was terminated by {}", signal),
                Err(_) => write!(f, "was terminated by signal {}", sig),
            },
            ServiceExit::Lost => write!(f, "was lost"),
        }
    }
}

/// A child process the supervisor keeps alive.
pub trait Service: Send + Sync {
    /// Name used in logs and in the pidfile.
    fn name(&self) -> &str;

    /// Restart policy.
    fn restart_policy(&self) -> RestartPolicy;

    /// Command that runs the service.
    fn command(&self) -> Command;

    /// Spawn the service.
    fn start(&self) -> Result<Child> {
        spawn(self.name(), self.command())
    }

    /// Ask the service at `pid` to stop.
    fn stop(&self, pid: Pid, mode: StopMode) -> Result<()> {
        send(pid, mode.signal())
    }

    /// Ask the service at `pid` to reload its configuration.
    fn reload(&self, pid: Pid) -> Result<()> {
        send(pid, Signal::SIGHUP)
    }
}

/// Spawn `command` for service `name`.
///
/// Children share the supervisor's stdio and process group, and are not
/// killed when their handle is dropped: only the supervisor stops them.
pub fn spawn(name: &str, mut command: Command) -> Result<Child> {
    command
        .stdin(Stdio::null())
        .kill_on_drop(false)
        .spawn()
        .map_err(|source| Error::ServiceStart {
            name: name.to_string(),
            source,
        })
}

/// Send `signal` to `pid`; a process that is already gone is not an error.
pub fn send(pid: Pid, signal: Signal) -> Result<()> {
    match signal::kill(pid, signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// The local Postgres instance.
///
/// The postmaster is run directly, so stop modes map onto Postgres' own
/// smart/fast/immediate shutdown and SIGHUP reloads its configuration.
#[derive(Debug, Clone)]
pub struct PostgresService {
    postgres_bin: PathBuf,
    pgdata: PathBuf,
    port: u16,
}

impl PostgresService {
    /// Postgres service for `config`.
    pub fn new(config: &Config) -> Self {
        Self {
            postgres_bin: config.postgres_bin.clone(),
            pgdata: config.pgdata.clone(),
            port: config.pg_port,
        }
    }
}

impl Service for PostgresService {
    fn name(&self) -> &str {
        POSTGRES
    }

    fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy::Permanent
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.postgres_bin);
        command
            .arg("-D")
            .arg(&self.pgdata)
            .arg("-p")
            .arg(self.port.to_string());
        command
    }
}

/// A pgkeeper sub-process: `pgkeeper do service <name>`.
#[derive(Debug, Clone)]
pub struct AgentService {
    name: &'static str,
    policy: RestartPolicy,
    program: PathBuf,
    log_filter: Option<String>,
}

impl AgentService {
    fn new(name: &'static str, policy: RestartPolicy, program: PathBuf) -> Self {
        Self {
            name,
            policy,
            program,
            log_filter: None,
        }
    }

    /// Keeper loop: reports to the monitor on every tick.
    pub fn node_active(program: PathBuf) -> Self {
        Self::new(NODE_ACTIVE, RestartPolicy::Permanent, program)
    }

    /// Notification listener: logs formation state changes.
    ///
    /// A clean exit retires it, a crash gets it relaunched.
    pub fn listener(program: PathBuf) -> Self {
        Self::new(LISTENER, RestartPolicy::Transient, program)
    }

    /// Pass `filter` to the child as `RUST_LOG`.
    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }
}

impl Service for AgentService {
    fn name(&self) -> &str {
        self.name
    }

    fn restart_policy(&self) -> RestartPolicy {
        self.policy
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(["do", "service", self.name]);
        if let Some(filter) = &self.log_filter {
            command.env("RUST_LOG", filter);
        }
        command
    }
}

/// Services run by `pgkeeper run`, in start order.
///
/// Without a monitor there is nothing to report to or listen on, so only
/// Postgres is supervised.
pub fn default_services(config: &Config, log_filter: &str) -> Result<Vec<Box<dyn Service>>> {
    let mut services: Vec<Box<dyn Service>> = vec![Box::new(PostgresService::new(config))];

    if config.monitor_uri.is_some() {
        let program = std::env::current_exe()?;
        services.push(Box::new(
            AgentService::node_active(program.clone()).with_log_filter(log_filter),
        ));
        services.push(Box::new(
            AgentService::listener(program).with_log_filter(log_filter),
        ));
    }

    Ok(services)
}
