// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replication roles as named by the monitor.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A replication state a node can report or be assigned.
///
/// The textual form is the monitor's `replication_state` enum label, so the
/// same names appear on the wire, in notifications and in the state file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Freshly registered, nothing decided yet.
    Init,
    /// Only node in its group, no replication.
    Single,
    /// Primary waiting for a standby to come up.
    WaitPrimary,
    /// Primary with a healthy standby.
    Primary,
    /// Primary stopping writes ahead of a failover.
    Draining,
    /// Primary given a deadline to stop before being demoted.
    DemoteTimeout,
    /// Former primary, stopped.
    Demoted,
    /// Standby catching up with the primary.
    Catchingup,
    /// Standby in sync with the primary.
    Secondary,
    /// Standby about to be promoted.
    PreparePromotion,
    /// Standby cutting replication before promotion.
    StopReplication,
    /// Standby waiting for the primary to accept it.
    WaitStandby,
    /// Node taken out of rotation by an operator.
    Maintenance,
    /// Primary admitting a new standby.
    JoinPrimary,
    /// Node applying new replication settings.
    ApplySettings,
    /// Primary on its way to maintenance.
    PrepareMaintenance,
    /// Standby on its way to maintenance.
    WaitMaintenance,
    /// Standby reporting its LSN during an election.
    ReportLsn,
    /// Standby fetching missing WAL from another standby.
    FastForward,
    /// Standby following the newly elected primary.
    JoinSecondary,
    /// Node removed from the formation.
    Dropped,
}

/// Error returned when a role name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown node state: {0:?}")]
pub struct UnknownRole(pub String);

impl NodeRole {
    /// Every role, in the order the monitor declares them.
    pub const ALL: [NodeRole; 21] = [
        NodeRole::Init,
        NodeRole::Single,
        NodeRole::WaitPrimary,
        NodeRole::Primary,
        NodeRole::Draining,
        NodeRole::DemoteTimeout,
        NodeRole::Demoted,
        NodeRole::Catchingup,
        NodeRole::Secondary,
        NodeRole::PreparePromotion,
        NodeRole::StopReplication,
        NodeRole::WaitStandby,
        NodeRole::Maintenance,
        NodeRole::JoinPrimary,
        NodeRole::ApplySettings,
        NodeRole::PrepareMaintenance,
        NodeRole::WaitMaintenance,
        NodeRole::ReportLsn,
        NodeRole::FastForward,
        NodeRole::JoinSecondary,
        NodeRole::Dropped,
    ];

    /// Wire name of the role.
    pub fn as_str(self) -> &'static str {
        match self {
            NodeRole::Init => "init",
            NodeRole::Single => "single",
            NodeRole::WaitPrimary => "wait_primary",
            NodeRole::Primary => "primary",
            NodeRole::Draining => "draining",
            NodeRole::DemoteTimeout => "demote_timeout",
            NodeRole::Demoted => "demoted",
            NodeRole::Catchingup => "catchingup",
            NodeRole::Secondary => "secondary",
            NodeRole::PreparePromotion => "prepare_promotion",
            NodeRole::StopReplication => "stop_replication",
            NodeRole::WaitStandby => "wait_standby",
            NodeRole::Maintenance => "maintenance",
            NodeRole::JoinPrimary => "join_primary",
            NodeRole::ApplySettings => "apply_settings",
            NodeRole::PrepareMaintenance => "prepare_maintenance",
            NodeRole::WaitMaintenance => "wait_maintenance",
            NodeRole::ReportLsn => "report_lsn",
            NodeRole::FastForward => "fast_forward",
            NodeRole::JoinSecondary => "join_secondary",
            NodeRole::Dropped => "dropped",
        }
    }

    /// Whether a node in this role accepts writes.
    pub fn is_writable(self) -> bool {
        matches!(
            self,
            NodeRole::Single
                | NodeRole::WaitPrimary
                | NodeRole::Primary
                | NodeRole::JoinPrimary
                | NodeRole::ApplySettings
        )
    }

    /// Whether Postgres must be up for a node to be in this role.
    pub fn runs_postgres(self) -> bool {
        !matches!(
            self,
            NodeRole::Init
                | NodeRole::DemoteTimeout
                | NodeRole::Demoted
                | NodeRole::Maintenance
                | NodeRole::Dropped
        )
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeRole::ALL
            .iter()
            .copied()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| UnknownRole(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for role in NodeRole::ALL {
            assert_eq!(role.as_str().parse::<NodeRole>(), Ok(role));
        }
    }

    #[test]
    fn test_unknown_name_is_rejected() {
        let err = "wait_for_godot".parse::<NodeRole>().unwrap_err();
        assert_eq!(err, UnknownRole("wait_for_godot".to_string()));
        assert!("".parse::<NodeRole>().is_err());
        assert!("PRIMARY".parse::<NodeRole>().is_err());
    }

    #[test]
    fn test_serde_uses_wire_names() {
        let json = serde_json::to_string(&NodeRole::DemoteTimeout).unwrap();
        assert_eq!(json, "\"demote_timeout\"");
        let role: NodeRole = serde_json::from_str("\"catchingup\"").unwrap();
        assert_eq!(role, NodeRole::Catchingup);
    }

    #[test]
    fn test_writable_roles() {
        assert!(NodeRole::Primary.is_writable());
        assert!(NodeRole::Single.is_writable());
        assert!(!NodeRole::Secondary.is_writable());
        assert!(!NodeRole::Demoted.is_writable());
    }

    #[test]
    fn test_roles_running_postgres() {
        assert!(NodeRole::Primary.runs_postgres());
        assert!(NodeRole::Secondary.runs_postgres());
        assert!(!NodeRole::Init.runs_postgres());
        assert!(!NodeRole::Demoted.runs_postgres());
        assert!(!NodeRole::Maintenance.runs_postgres());
    }
}
