// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Decoding of state change notifications pushed by the monitor.
//!
//! The monitor publishes one text payload per node state change on the
//! `state` channel:
//!
//! ```text
//! S:<reported>:<goal>:<len>.<formation>:<groupId>:<slot>:<nodeId>.<nodeName>:<nodePort>
//! ```
//!
//! - `<len>.<formation>`: the formation name, prefixed by its byte length
//! - `<slot>`: an integer carried by the monitor that the keeper does not use
//! - `<nodeId>.<nodeName>`: node id and host name, the host runs up to the
//!   last `:` so dotted host names and IPv6 literals survive
//!
//! Decoding borrows the payload, never modifies it, and either returns a
//! complete [`StateNotification`] or a [`DecodeError`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::role::NodeRole;

/// Errors that can occur while decoding a notification payload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unsupported notification kind {0:?}")]
    UnsupportedKind(String),

    #[error("missing '{delimiter}' after {field}")]
    MissingDelimiter {
        field: &'static str,
        delimiter: char,
    },

    #[error("invalid {field}: {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("{field} declares {declared} bytes but the payload does not hold them")]
    LengthMismatch {
        field: &'static str,
        declared: usize,
    },

    #[error("empty {0}")]
    EmptyField(&'static str),

    #[error("invalid {field}: {source}")]
    Role {
        field: &'static str,
        #[source]
        source: crate::role::UnknownRole,
    },
}

/// A decoded node state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateNotification {
    /// Role the node last reported.
    pub reported_state: NodeRole,
    /// Role the monitor assigned.
    pub goal_state: NodeRole,
    /// Formation the node belongs to.
    pub formation_id: String,
    /// Group within the formation.
    pub group_id: i32,
    /// Opaque integer between the group and the node fields.
    pub slot: i64,
    /// Node id.
    pub node_id: i64,
    /// Node host name.
    pub node_name: String,
    /// Node Postgres port.
    pub node_port: u16,
}

impl StateNotification {
    /// Whether this notification is about the given node.
    pub fn concerns(&self, formation: &str, node_name: &str, node_port: u16) -> bool {
        self.formation_id == formation && self.node_name == node_name && self.node_port == node_port
    }
}

/// Decode a notification payload.
pub fn decode_notification(payload: &str) -> Result<StateNotification, DecodeError> {
    let mut cursor = Cursor::new(payload);

    let kind = cursor.field("message kind", ':')?;
    if kind != "S" {
        return Err(DecodeError::UnsupportedKind(kind.to_string()));
    }

    let reported_state = role("reported state", cursor.field("reported state", ':')?)?;
    let goal_state = role("goal state", cursor.field("goal state", ':')?)?;

    let formation_len: usize = number("formation length", cursor.field("formation length", '.')?)?;
    let formation_id = cursor.take("formation", formation_len)?;
    cursor.expect("formation", ':')?;
    if formation_id.is_empty() {
        return Err(DecodeError::EmptyField("formation"));
    }

    let group_id: i32 = number("group id", cursor.field("group id", ':')?)?;
    let slot: i64 = number("slot", cursor.field("slot", ':')?)?;
    let node_id: i64 = number("node id", cursor.field("node id", '.')?)?;

    let (node_name, node_port) =
        cursor
            .rest()
            .rsplit_once(':')
            .ok_or(DecodeError::MissingDelimiter {
                field: "node name",
                delimiter: ':',
            })?;
    if node_name.is_empty() {
        return Err(DecodeError::EmptyField("node name"));
    }
    let node_port: u16 = number("node port", node_port)?;

    Ok(StateNotification {
        reported_state,
        goal_state,
        formation_id: formation_id.to_string(),
        group_id,
        slot,
        node_id,
        node_name: node_name.to_string(),
        node_port,
    })
}

fn role(field: &'static str, value: &str) -> Result<NodeRole, DecodeError> {
    value
        .parse()
        .map_err(|source| DecodeError::Role { field, source })
}

fn number<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, DecodeError> {
    // FromStr for integers accepts a leading '+', the monitor never sends one
    if value.starts_with('+') {
        return Err(DecodeError::InvalidNumber {
            field,
            value: value.to_string(),
        });
    }
    value.parse().map_err(|_| DecodeError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

/// Read-only scan position over a payload.
struct Cursor<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn remaining(&self) -> &'a str {
        &self.input[self.pos..]
    }

    /// Text up to `delimiter`, consuming the delimiter.
    ///
    /// A field never spans a `:`, so looking for `.` stops at the next colon.
    fn field(&mut self, field: &'static str, delimiter: char) -> Result<&'a str, DecodeError> {
        let rest = self.remaining();
        let end = rest
            .find(|c| c == delimiter || c == ':')
            .filter(|&i| rest[i..].starts_with(delimiter))
            .ok_or(DecodeError::MissingDelimiter { field, delimiter })?;
        self.pos += end + delimiter.len_utf8();
        Ok(&rest[..end])
    }

    fn take(&mut self, field: &'static str, len: usize) -> Result<&'a str, DecodeError> {
        let value = self
            .pos
            .checked_add(len)
            .and_then(|end| self.input.get(self.pos..end))
            .ok_or(DecodeError::LengthMismatch {
                field,
                declared: len,
            })?;
        self.pos += len;
        Ok(value)
    }

    fn expect(&mut self, field: &'static str, delimiter: char) -> Result<(), DecodeError> {
        if self.remaining().starts_with(delimiter) {
            self.pos += delimiter.len_utf8();
            Ok(())
        } else {
            Err(DecodeError::MissingDelimiter { field, delimiter })
        }
    }

    fn rest(&mut self) -> &'a str {
        let rest = self.remaining();
        self.pos = self.input.len();
        rest
    }
}
