// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Keeper state persisted between ticks and restarts.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use pgkeeper_protocol::{AssignedState, NodeRole};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::observer::{Lsn, Observation};

/// Node state as last reported and assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    /// Node id assigned by the monitor.
    pub node_id: i64,
    /// Group id assigned by the monitor.
    pub group_id: i32,
    /// Role reported on the next `node_active` call.
    pub reported_role: NodeRole,
    /// Role the monitor last assigned.
    pub assigned_role: NodeRole,
    /// Whether Postgres was running at the last observation.
    pub pg_is_running: bool,
    /// WAL position at the last observation.
    pub current_lsn: Option<Lsn>,
    /// Sync state at the last observation.
    #[serde(default)]
    pub sync_state: String,
    /// When the monitor last answered.
    pub last_monitor_contact: Option<DateTime<Utc>>,
}

impl NodeState {
    /// State right after registration.
    pub fn registered(assigned: AssignedState, now: DateTime<Utc>) -> Self {
        Self {
            node_id: assigned.node_id,
            group_id: assigned.group_id,
            reported_role: NodeRole::Init,
            assigned_role: assigned.role,
            pg_is_running: false,
            current_lsn: None,
            sync_state: String::new(),
            last_monitor_contact: Some(now),
        }
    }

    /// Copy with the observed fields replaced.
    pub fn with_observation(&self, observation: &Observation) -> Self {
        Self {
            pg_is_running: observation.pg_is_running,
            current_lsn: observation.current_lsn,
            sync_state: observation.sync_state.clone(),
            ..self.clone()
        }
    }

    /// Copy reporting the assigned role once the observed instance agrees
    /// with it.
    ///
    /// Only call with a successful observation applied: a role is never
    /// reported as reached on the strength of defaults.
    pub fn with_goal_checked(&self) -> Self {
        if self.reported_role == self.assigned_role
            || self.pg_is_running != self.assigned_role.runs_postgres()
        {
            return self.clone();
        }
        Self {
            reported_role: self.assigned_role,
            ..self.clone()
        }
    }

    /// Copy with the monitor's answer applied.
    ///
    /// Identity and goal are replaced together; the reported role is left
    /// to local observation.
    pub fn with_assignment(&self, assigned: AssignedState, now: DateTime<Utc>) -> Self {
        Self {
            node_id: assigned.node_id,
            group_id: assigned.group_id,
            assigned_role: assigned.role,
            last_monitor_contact: Some(now),
            ..self.clone()
        }
    }

    /// Current WAL position as sent to the monitor.
    pub fn lsn_text(&self) -> String {
        self.current_lsn.unwrap_or_default().to_string()
    }
}

/// JSON state file.
///
/// Writes go to `<path>.new` first and are renamed over the file, so a
/// crash leaves either the old or the new state, never a mix.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    /// State file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a state has been stored.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read the stored state.
    pub fn load(&self) -> Result<NodeState> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::MissingState(self.path.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&text).map_err(|source| Error::StateFile {
            path: self.path.clone(),
            source,
        })
    }

    /// Replace the stored state.
    pub fn store(&self, state: &NodeState) -> Result<()> {
        let json = serde_json::to_string_pretty(state).map_err(|source| Error::StateFile {
            path: self.path.clone(),
            source,
        })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".new");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
