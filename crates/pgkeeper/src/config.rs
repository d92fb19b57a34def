// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for pgkeeper.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, warn};

/// Default Postgres port.
const DEFAULT_PGPORT: u16 = 5432;

/// Seconds between two keeper ticks.
const DEFAULT_KEEPER_SLEEP_SECS: u64 = 5;

/// Seconds a graceful stop may take before it escalates.
const DEFAULT_STOP_TIMEOUT_SECS: u64 = 30;

/// Seconds to wait for the monitor or local Postgres to answer.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Agent configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Postgres data directory
    pub pgdata: PathBuf,
    /// Postgres port
    pub pg_port: u16,
    /// `postgres` executable started by the supervisor
    pub postgres_bin: PathBuf,
    /// Connection string used to observe the local instance
    pub local_uri: String,
    /// Monitor connection string, `None` when running without a monitor
    pub monitor_uri: Option<String>,
    /// Formation this node belongs to
    pub formation: String,
    /// Host name other nodes use to reach this node
    pub node_name: String,
    /// Database the formation replicates
    pub dbname: String,
    /// Group requested at registration, the monitor picks one when unset
    pub group: Option<i32>,
    /// Failover candidate priority
    pub candidate_priority: i32,
    /// Whether this node takes part in the synchronous quorum
    pub replication_quorum: bool,
    /// Supervisor pidfile
    pub pidfile: PathBuf,
    /// Keeper state file
    pub state_file: PathBuf,
    /// Time between two keeper ticks
    pub keeper_sleep: Duration,
    /// Time a graceful stop may take before escalating
    pub stop_timeout: Duration,
    /// Connection timeout for the monitor and local Postgres
    pub connect_timeout: Duration,
}

impl Config {
    /// Load `.env` when present, then read the environment.
    pub fn load() -> Result<Self, ConfigError> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file loaded: {}", e);
        }
        Self::from_env()
    }

    /// Re-read `.env`, letting it override variables set by a previous load.
    ///
    /// Used on SIGHUP: variables inherited from the parent environment keep
    /// their values unless the file sets them.
    pub fn reload() -> Result<Self, ConfigError> {
        if let Err(e) = dotenvy::dotenv_override() {
            warn!("No .env file reloaded: {}", e);
        }
        Self::from_env()
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let pgdata = var("PGKEEPER_PGDATA")
            .or_else(|| var("PGDATA"))
            .map(PathBuf::from)
            .ok_or(ConfigError::MissingEnvVar("PGKEEPER_PGDATA or PGDATA"))?;

        let pg_port = match var("PGKEEPER_PGPORT").or_else(|| var("PGPORT")) {
            Some(v) => match v.parse::<u16>() {
                Ok(port) if port > 0 => port,
                _ => return Err(ConfigError::invalid("PGKEEPER_PGPORT", v)),
            },
            None => DEFAULT_PGPORT,
        };

        let postgres_bin = var("PGKEEPER_POSTGRES_BIN")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("postgres"));

        let dbname = var("PGKEEPER_DBNAME").unwrap_or_else(|| "postgres".to_string());

        let local_uri = var("PGKEEPER_LOCAL_URI")
            .unwrap_or_else(|| format!("postgres://localhost:{}/{}", pg_port, dbname));

        let monitor_disabled = flag("PGKEEPER_MONITOR_DISABLED", false)?;
        let monitor_uri = match var("PGKEEPER_MONITOR_URI") {
            Some(uri) if !monitor_disabled => Some(uri),
            Some(_) => None,
            None if monitor_disabled => None,
            None => {
                return Err(ConfigError::MissingEnvVar(
                    "PGKEEPER_MONITOR_URI (or set PGKEEPER_MONITOR_DISABLED=true)",
                ));
            }
        };

        let formation = var("PGKEEPER_FORMATION").unwrap_or_else(|| "default".to_string());
        let node_name = var("PGKEEPER_NODENAME").unwrap_or_else(|| "localhost".to_string());

        let group = match var("PGKEEPER_GROUP") {
            Some(v) => Some(
                v.parse::<i32>()
                    .ok()
                    .filter(|g| *g >= 0)
                    .ok_or_else(|| ConfigError::invalid("PGKEEPER_GROUP", v))?,
            ),
            None => None,
        };

        let candidate_priority = match var("PGKEEPER_CANDIDATE_PRIORITY") {
            Some(v) => v
                .parse::<i32>()
                .ok()
                .filter(|p| (0..=100).contains(p))
                .ok_or_else(|| ConfigError::invalid("PGKEEPER_CANDIDATE_PRIORITY", v))?,
            None => 50,
        };

        let replication_quorum = flag("PGKEEPER_REPLICATION_QUORUM", true)?;

        let pidfile = var("PGKEEPER_PIDFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| pgdata.join("pgkeeper.pid"));
        let state_file = var("PGKEEPER_STATE_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| pgdata.join("pgkeeper.state"));

        let keeper_sleep = seconds("PGKEEPER_KEEPER_SLEEP_SECS", DEFAULT_KEEPER_SLEEP_SECS)?;
        let stop_timeout = seconds("PGKEEPER_STOP_TIMEOUT_SECS", DEFAULT_STOP_TIMEOUT_SECS)?;
        let connect_timeout =
            seconds("PGKEEPER_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS)?;

        Ok(Self {
            pgdata,
            pg_port,
            postgres_bin,
            local_uri,
            monitor_uri,
            formation,
            node_name,
            dbname,
            group,
            candidate_priority,
            replication_quorum,
            pidfile,
            state_file,
            keeper_sleep,
            stop_timeout,
            connect_timeout,
        })
    }

    /// Monitor connection string, or an error when the monitor is disabled.
    pub fn require_monitor(&self) -> Result<&str, ConfigError> {
        self.monitor_uri
            .as_deref()
            .ok_or(ConfigError::MissingEnvVar("PGKEEPER_MONITOR_URI"))
    }
}

fn var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn flag(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match var(key) {
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::invalid(key, v)),
        },
        None => Ok(default),
    }
}

fn seconds(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    match var(key) {
        Some(v) => v
            .parse::<u64>()
            .ok()
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
            .ok_or_else(|| ConfigError::invalid(key, v)),
        None => Ok(Duration::from_secs(default)),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A variable holds a value that cannot be used.
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue {
        /// Variable name
        var: &'static str,
        /// Value found
        value: String,
    },
}

impl ConfigError {
    fn invalid(var: &'static str, value: String) -> Self {
        ConfigError::InvalidValue { var, value }
    }
}
