// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the monitor client.

use pgkeeper_protocol::UnknownRole;
use thiserror::Error;

/// Result type using MonitorError
pub type Result<T> = std::result::Result<T, MonitorError>;

/// Errors from monitor operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MonitorError {
    /// Connection or query failure.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The monitor answered with no row where one was required.
    #[error("Monitor returned no result for {0}")]
    EmptyResult(&'static str),

    /// A returned column could not be mapped onto a protocol record.
    #[error("Monitor returned an invalid {field}: {value}")]
    InvalidResponse {
        /// Column name.
        field: &'static str,
        /// Offending value.
        value: String,
    },

    /// The monitor returned a state name this node does not know.
    #[error("Monitor returned an unknown state: {0}")]
    UnknownRole(#[from] UnknownRole),

    /// The monitor could not be reached.
    #[error("Monitor unavailable: {0}")]
    Unavailable(String),
}

impl MonitorError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            MonitorError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::WorkerCrashed
            ),
            MonitorError::Unavailable(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(MonitorError::Unavailable("down".into()).is_transient());
        assert!(MonitorError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!MonitorError::EmptyResult("node_active").is_transient());
        assert!(!MonitorError::UnknownRole(UnknownRole("x".into())).is_transient());
    }

    #[test]
    fn test_display() {
        let err = MonitorError::InvalidResponse {
            field: "port",
            value: "-1".into(),
        };
        assert_eq!(err.to_string(), "Monitor returned an invalid port: -1");
    }
}
