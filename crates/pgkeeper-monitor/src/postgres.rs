// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Monitor client over the `pgautofailover` SQL API.

use std::time::Duration;

use async_trait::async_trait;
use pgkeeper_protocol::{AssignedState, NodeActiveRequest, NodeAddress, NodeRole, RegisterRequest};
use sqlx::PgPool;
use sqlx::postgres::{PgListener, PgPoolOptions};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::{MonitorClient, MonitorNotification, Subscription};
use crate::error::{MonitorError, Result};

/// Buffered notifications per subscription before the forwarder waits.
const SUBSCRIPTION_BUFFER: usize = 64;

/// Pause between attempts to re-establish a lost LISTEN connection.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// PostgreSQL-backed monitor client.
#[derive(Clone)]
pub struct PostgresMonitor {
    pool: PgPool,
}

impl PostgresMonitor {
    /// Wrap an existing pool connected to the monitor database.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the monitor at `uri`.
    ///
    /// The pool is small: the keeper issues one call per tick and the
    /// subscription holds its own connection.
    pub async fn connect(uri: &str, connect_timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(connect_timeout)
            .connect(uri)
            .await?;
        Ok(Self::new(pool))
    }

    /// Pool that connects on first use.
    ///
    /// Long-running services use this so that an unreachable monitor
    /// surfaces as failed calls rather than a failed start.
    pub fn connect_lazy(uri: &str, connect_timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(connect_timeout)
            .connect_lazy(uri)?;
        Ok(Self::new(pool))
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn assigned(row: (i64, i32, String)) -> Result<AssignedState> {
    let (node_id, group_id, state) = row;
    Ok(AssignedState {
        node_id,
        group_id,
        role: state.parse()?,
    })
}

fn port(value: i32) -> Result<u16> {
    u16::try_from(value).map_err(|_| MonitorError::InvalidResponse {
        field: "port",
        value: value.to_string(),
    })
}

type NodeRow = (i64, String, i32, Option<String>, bool);

fn node_address(row: NodeRow) -> Result<NodeAddress> {
    let (node_id, name, node_port, lsn, is_primary) = row;
    Ok(NodeAddress {
        node_id,
        name,
        port: port(node_port)?,
        lsn,
        is_primary,
    })
}

#[async_trait]
impl MonitorClient for PostgresMonitor {
    async fn register(&self, request: &RegisterRequest) -> Result<AssignedState> {
        let row: Option<(i64, i32, String)> = sqlx::query_as(
            r#"
            SELECT assigned_node_id::bigint,
                   assigned_group_id::int,
                   assigned_group_state::text
              FROM pgautofailover.register_node($1::text, $2::text, $3::int, $4::name,
                                                $5::bigint, $6::int,
                                                $7::pgautofailover.replication_state,
                                                $8::text, $9::int, $10::bool)
            "#,
        )
        .bind(&request.formation)
        .bind(&request.node_name)
        .bind(i32::from(request.node_port))
        .bind(&request.dbname)
        .bind(request.system_identifier)
        .bind(request.desired_group.unwrap_or(-1))
        .bind(request.initial_role.as_str())
        .bind(request.kind.as_str())
        .bind(request.candidate_priority)
        .bind(request.replication_quorum)
        .fetch_optional(&self.pool)
        .await?;

        let state = assigned(row.ok_or(MonitorError::EmptyResult("register_node"))?)?;
        info!(
            formation = %request.formation,
            node_id = state.node_id,
            group_id = state.group_id,
            role = %state.role,
            "Registered node {}:{}",
            request.node_name,
            request.node_port
        );
        Ok(state)
    }

    async fn node_active(&self, request: &NodeActiveRequest) -> Result<AssignedState> {
        let row: Option<(i64, i32, String)> = sqlx::query_as(
            r#"
            SELECT assigned_node_id::bigint,
                   assigned_group_id::int,
                   assigned_group_state::text
              FROM pgautofailover.node_active($1::text, $2::text, $3::int, $4::int, $5::int,
                                              $6::pgautofailover.replication_state,
                                              $7::bool, $8::pg_lsn, $9::text)
            "#,
        )
        .bind(&request.formation)
        .bind(&request.node_name)
        .bind(i32::from(request.node_port))
        .bind(request.node_id)
        .bind(request.group_id)
        .bind(request.reported_role.as_str())
        .bind(request.pg_is_running)
        .bind(&request.current_lsn)
        .bind(&request.sync_state)
        .fetch_optional(&self.pool)
        .await?;

        let state = assigned(row.ok_or(MonitorError::EmptyResult("node_active"))?)?;
        debug!(
            node_id = state.node_id,
            group_id = state.group_id,
            role = %state.role,
            "node_active"
        );
        Ok(state)
    }

    async fn get_primary(&self, formation: &str, group_id: i32) -> Result<Option<NodeAddress>> {
        let row: Option<(i64, String, i32)> = sqlx::query_as(
            r#"
            SELECT primary_node_id::bigint, primary_name::text, primary_port::int
              FROM pgautofailover.get_primary($1::text, $2::int)
            "#,
        )
        .bind(formation)
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(node_id, name, node_port)| {
            node_address((node_id, name, node_port, None, true))
        })
        .transpose()
    }

    async fn get_other_nodes(
        &self,
        node_name: &str,
        node_port: u16,
        role: Option<NodeRole>,
    ) -> Result<Vec<NodeAddress>> {
        let rows: Vec<NodeRow> = match role {
            Some(role) => {
                sqlx::query_as(
                    r#"
                    SELECT node_id::bigint, node_name::text, node_port::int,
                           node_lsn::text, node_is_primary
                      FROM pgautofailover.get_other_nodes($1::text, $2::int,
                                                          $3::pgautofailover.replication_state)
                     ORDER BY node_id
                    "#,
                )
                .bind(node_name)
                .bind(i32::from(node_port))
                .bind(role.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT node_id::bigint, node_name::text, node_port::int,
                           node_lsn::text, node_is_primary
                      FROM pgautofailover.get_other_nodes($1::text, $2::int)
                     ORDER BY node_id
                    "#,
                )
                .bind(node_name)
                .bind(i32::from(node_port))
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(node_address).collect()
    }

    async fn get_coordinator(&self, formation: &str) -> Result<Option<NodeAddress>> {
        let row: Option<(String, i32)> = sqlx::query_as(
            r#"
            SELECT node_host::text, node_port::int
              FROM pgautofailover.get_coordinator($1::text)
            "#,
        )
        .bind(formation)
        .fetch_optional(&self.pool)
        .await?;

        // the coordinator query does not expose a node id
        row.map(|(name, node_port)| node_address((0, name, node_port, None, true)))
            .transpose()
    }

    async fn subscribe(&self, channels: &[&str]) -> Result<Subscription> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen_all(channels.iter().copied()).await?;
        info!(channels = ?channels, "Listening for monitor notifications");

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(async move {
            loop {
                // try_recv reports a lost connection as Ok(None); the next
                // call reconnects and re-issues LISTEN for every channel
                let received = tokio::select! {
                    _ = tx.closed() => break,
                    received = listener.try_recv() => received,
                };
                let notification = match received {
                    Ok(Some(n)) => MonitorNotification {
                        channel: n.channel().to_string(),
                        payload: n.payload().to_string(),
                    },
                    Ok(None) => {
                        warn!("Lost the monitor connection, re-establishing; notifications may have been missed");
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to receive monitor notification, retrying");
                        tokio::select! {
                            _ = tx.closed() => break,
                            _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => continue,
                        }
                    }
                };

                if tx.send(notification).await.is_err() {
                    break;
                }
            }
            debug!("Monitor subscription closed");
        });

        Ok(Subscription::new(rx))
    }
}
