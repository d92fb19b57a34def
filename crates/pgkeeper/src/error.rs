// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types and process exit codes for pgkeeper.

use std::path::PathBuf;

use pgkeeper_monitor::MonitorError;
use thiserror::Error;

use crate::config::ConfigError;

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;

/// Process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Clean exit.
    Quit = 0,
    /// Command line could not be parsed.
    BadArgs = 1,
    /// Configuration is missing or invalid.
    BadConfig = 2,
    /// Local state is missing, invalid or conflicting.
    BadState = 3,
    /// Local Postgres could not be queried.
    Pgsql = 4,
    /// Local Postgres is not running.
    Pgctl = 5,
    /// The monitor could not be reached or answered with an error.
    Monitor = 6,
    /// Anything else.
    InternalError = 12,
}

impl ExitCode {
    /// `status` exit code when no agent is running.
    pub const STATUS_NOT_RUNNING: ExitCode = ExitCode::BadState;

    /// Numeric code passed to `std::process::exit`.
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Agent errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Monitor call failed.
    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),

    /// Local Postgres query failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Filesystem or process I/O failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A signal could not be delivered.
    #[error("Failed to send signal: {0}")]
    Signal(#[from] nix::errno::Errno),

    /// The state file exists but cannot be parsed.
    #[error("Invalid state file {path}: {source}")]
    StateFile {
        /// State file path
        path: PathBuf,
        /// Parse error
        source: serde_json::Error,
    },

    /// No state file: the node was never registered.
    #[error("No state file at {0}, register the node first")]
    MissingState(PathBuf),

    /// A state file already exists.
    #[error("Node already registered with node id {node_id}, see {path}")]
    AlreadyRegistered {
        /// State file path
        path: PathBuf,
        /// Registered node id
        node_id: i64,
    },

    /// The pidfile content is not understood.
    #[error("Invalid pidfile {path}: {reason}")]
    Pidfile {
        /// Pidfile path
        path: PathBuf,
        /// What is wrong with it
        reason: String,
    },

    /// Another agent owns the pidfile.
    #[error("pgkeeper is already running with pid {pid}, see {path}")]
    AlreadyRunning {
        /// Pidfile path
        path: PathBuf,
        /// Running supervisor pid
        pid: i32,
    },

    /// No agent is running.
    #[error("pgkeeper is not running, no live pid in {0}")]
    NotRunning(PathBuf),

    /// A service could not be spawned.
    #[error("Failed to start service {name}: {source}")]
    ServiceStart {
        /// Service name
        name: String,
        /// Spawn error
        source: std::io::Error,
    },

    /// A permanent service kept failing.
    #[error("Service {name} restarted too often, giving up")]
    RestartLimit {
        /// Service name
        name: String,
    },

    /// The pidfile vanished or names another process.
    #[error("Pidfile {0} no longer belongs to this process")]
    PidfileLost(PathBuf),
}

impl Error {
    /// Exit code reported for this error.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Error::Config(_) => ExitCode::BadConfig,
            Error::Monitor(_) => ExitCode::Monitor,
            Error::Database(_) => ExitCode::Pgsql,
            Error::StateFile { .. }
            | Error::MissingState(_)
            | Error::AlreadyRegistered { .. }
            | Error::Pidfile { .. }
            | Error::AlreadyRunning { .. } => ExitCode::BadState,
            Error::NotRunning(_) => ExitCode::STATUS_NOT_RUNNING,
            Error::Io(_)
            | Error::Signal(_)
            | Error::ServiceStart { .. }
            | Error::RestartLimit { .. }
            | Error::PidfileLost(_) => ExitCode::InternalError,
        }
    }
}
