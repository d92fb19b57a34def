// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Observation of the local Postgres instance.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::debug;

use crate::error::Result;

/// A WAL position, `X/Y` in hex like Postgres prints it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

/// Error parsing an [`Lsn`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid LSN: {0:?}")]
pub struct InvalidLsn(pub String);

impl FromStr for Lsn {
    type Err = InvalidLsn;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || InvalidLsn(s.to_string());
        let (hi, lo) = s.split_once('/').ok_or_else(invalid)?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| invalid())?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| invalid())?;
        Ok(Lsn((u64::from(hi) << 32) | u64::from(lo)))
    }
}

impl Serialize for Lsn {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// What the keeper saw of the local instance on one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    /// Whether the postmaster answered.
    pub pg_is_running: bool,
    /// Current WAL position: write position on a primary, receive position on a standby.
    pub current_lsn: Option<Lsn>,
    /// Sync state of the first standby, empty without standbys.
    pub sync_state: String,
}

/// Source of [`Observation`]s.
#[async_trait]
pub trait PostgresObserver: Send + Sync {
    /// Observe the instance.
    ///
    /// An instance that cannot be reached is reported as not running; an
    /// error means it answered with something unexpected.
    async fn observe(&self) -> Result<Observation>;

    /// `pg_control_system().system_identifier` of the instance.
    async fn system_identifier(&self) -> Result<i64>;
}

/// Observer querying the local instance over a lazily connected pool.
#[derive(Clone)]
pub struct LocalPostgres {
    pool: PgPool,
}

impl LocalPostgres {
    /// Observer for the instance at `uri`; no connection is made until the
    /// first observation.
    pub fn connect_lazy(uri: &str, connect_timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(connect_timeout)
            .connect_lazy(uri)?;
        Ok(Self { pool })
    }
}

const OBSERVE_SQL: &str = r#"
    SELECT pg_is_in_recovery(),
           CASE WHEN pg_is_in_recovery()
                THEN pg_last_wal_receive_lsn()::text
                ELSE pg_current_wal_lsn()::text
           END,
           (SELECT sync_state::text
              FROM pg_stat_replication
             ORDER BY pid
             LIMIT 1)
"#;

fn unreachable(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Tls(_)
    )
}

#[async_trait]
impl PostgresObserver for LocalPostgres {
    async fn observe(&self) -> Result<Observation> {
        let row: (bool, Option<String>, Option<String>) =
            match sqlx::query_as(OBSERVE_SQL).fetch_one(&self.pool).await {
                Ok(row) => row,
                Err(e) if unreachable(&e) => {
                    debug!(error = %e, "Local Postgres is not reachable");
                    return Ok(Observation::default());
                }
                Err(e) => return Err(e.into()),
            };

        let (in_recovery, lsn, sync_state) = row;
        let current_lsn = lsn.and_then(|text| text.parse().ok());
        debug!(in_recovery, lsn = ?current_lsn, "Observed local Postgres");

        Ok(Observation {
            pg_is_running: true,
            current_lsn,
            sync_state: sync_state.unwrap_or_default(),
        })
    }

    async fn system_identifier(&self) -> Result<i64> {
        let id: i64 = sqlx::query_scalar("SELECT system_identifier FROM pg_control_system()")
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_text_form() {
        let lsn: Lsn = "16/B374D848".parse().unwrap();
        assert_eq!(lsn, Lsn(0x16_B374_D848));
        assert_eq!(lsn.to_string(), "16/B374D848");
        assert_eq!(Lsn::default().to_string(), "0/0");
    }

    #[test]
    fn test_lsn_rejects_garbage() {
        for text in ["", "0", "G/0", "0/", "1/2/3", "100000000/0"] {
            assert!(text.parse::<Lsn>().is_err(), "{text:?} should be rejected");
        }
    }

    #[test]
    fn test_lsn_ordering() {
        let a: Lsn = "0/FFFFFFFF".parse().unwrap();
        let b: Lsn = "1/0".parse().unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_lsn_serde_uses_text() {
        let json = serde_json::to_string(&Lsn(0x1_0000_0010)).unwrap();
        assert_eq!(json, "\"1/10\"");
        let back: Lsn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Lsn(0x1_0000_0010));
    }

    #[test]
    fn test_default_observation_is_not_running() {
        let observation = Observation::default();
        assert!(!observation.pg_is_running);
        assert_eq!(observation.current_lsn, None);
        assert!(observation.sync_state.is_empty());
    }
}
