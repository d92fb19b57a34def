// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent status as seen from outside the supervisor.

use std::fmt;
use std::path::Path;

use nix::unistd::Pid;

use crate::error::{ExitCode, Result};
use crate::pidfile;
use crate::service::POSTGRES;

/// Outcome of a status check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    /// No pidfile, or its supervisor is gone.
    NotRunning,
    /// The supervisor is alive but Postgres is not.
    PostgresDown {
        /// Supervisor pid
        pid: Pid,
    },
    /// Supervisor and Postgres are both alive.
    Running {
        /// Supervisor pid
        pid: Pid,
        /// Postgres pid
        postgres_pid: Pid,
    },
}

impl AgentStatus {
    /// Exit code of `pgkeeper status`.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            AgentStatus::NotRunning => ExitCode::STATUS_NOT_RUNNING,
            AgentStatus::PostgresDown { .. } => ExitCode::Pgctl,
            AgentStatus::Running { .. } => ExitCode::Quit,
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::NotRunning => write!(f, "pgkeeper is not running"),
            AgentStatus::PostgresDown { pid } => {
                write!(f, "pgkeeper is running with pid {}, Postgres is not running", pid)
            }
            AgentStatus::Running { pid, postgres_pid } => write!(
                f,
                "pgkeeper is running with pid {}, Postgres is running with pid {}",
                pid, postgres_pid
            ),
        }
    }
}

/// Check the agent recorded in `pidfile`.
///
/// Only reads: a stale pidfile is reported as not running and left in place.
pub fn check(pidfile: &Path) -> Result<AgentStatus> {
    let Some(contents) = pidfile::read(pidfile)? else {
        return Ok(AgentStatus::NotRunning);
    };
    if !pidfile::is_alive(contents.supervisor) {
        return Ok(AgentStatus::NotRunning);
    }

    let pid = contents.supervisor;
    Ok(match contents.service_pid(POSTGRES).filter(|p| pidfile::is_alive(*p)) {
        Some(postgres_pid) => AgentStatus::Running { pid, postgres_pid },
        None => AgentStatus::PostgresDown { pid },
    })
}
