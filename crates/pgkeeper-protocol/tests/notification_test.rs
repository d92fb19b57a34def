// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Notification decoding tests for pgkeeper-protocol.

use pgkeeper_protocol::{DecodeError, NodeRole, StateNotification, decode_notification};

#[test]
fn test_decode_reference_message() {
    let payload = "S:wait_primary:wait_primary:7.default:0:1:9.localhost:4001";
    let n = decode_notification(payload).unwrap();

    assert_eq!(
        n,
        StateNotification {
            reported_state: NodeRole::WaitPrimary,
            goal_state: NodeRole::WaitPrimary,
            formation_id: "default".to_string(),
            group_id: 0,
            slot: 1,
            node_id: 9,
            node_name: "localhost".to_string(),
            node_port: 4001,
        }
    );
}

#[test]
fn test_decode_leaves_input_untouched() {
    let payload = String::from("S:secondary:prepare_promotion:3.prd:2:1:14.db-2:5432");
    let before = payload.clone();
    let n = decode_notification(&payload).unwrap();

    assert_eq!(payload, before);
    assert_eq!(n.reported_state, NodeRole::Secondary);
    assert_eq!(n.goal_state, NodeRole::PreparePromotion);
    assert_eq!(n.formation_id, "prd");
    assert_eq!(n.group_id, 2);
    assert_eq!(n.node_id, 14);
    assert_eq!(n.node_name, "db-2");
    assert_eq!(n.node_port, 5432);
}

#[test]
fn test_decode_dotted_host_name() {
    let n = decode_notification("S:primary:draining:7.default:0:1:3.db1.example.com:5432").unwrap();
    assert_eq!(n.node_id, 3);
    assert_eq!(n.node_name, "db1.example.com");
    assert_eq!(n.node_port, 5432);
}

#[test]
fn test_formation_containing_delimiters() {
    // the length prefix is what bounds the formation name
    let n = decode_notification("S:single:single:5.a:b.c:1:1:2.node:6000").unwrap();
    assert_eq!(n.formation_id, "a:b.c");
    assert_eq!(n.node_id, 2);
}

#[test]
fn test_missing_node_separator_fails() {
    let result = decode_notification("S:wait_primary:wait_primary:7.default:0:1:9localhost:4001");
    assert_eq!(
        result,
        Err(DecodeError::MissingDelimiter {
            field: "node id",
            delimiter: '.'
        })
    );
}

#[test]
fn test_wrong_formation_length_fails() {
    assert!(matches!(
        decode_notification("S:primary:primary:6.default:0:1:9.localhost:4001"),
        Err(DecodeError::MissingDelimiter {
            field: "formation",
            ..
        })
    ));
    assert!(matches!(
        decode_notification("S:primary:primary:70.default:0:1:9.localhost:4001"),
        Err(DecodeError::LengthMismatch { .. })
    ));
}

#[test]
fn test_unknown_kind_fails() {
    assert_eq!(
        decode_notification("L:some log line"),
        Err(DecodeError::UnsupportedKind("L".to_string()))
    );
}

#[test]
fn test_unknown_role_fails() {
    let err = decode_notification("S:primary:lost:7.default:0:1:9.localhost:4001").unwrap_err();
    assert!(matches!(
        err,
        DecodeError::Role {
            field: "goal state",
            ..
        }
    ));
}

#[test]
fn test_bad_numbers_fail() {
    for payload in [
        "S:primary:primary:7.default:x:1:9.localhost:4001",
        "S:primary:primary:7.default:0:1:nine.localhost:4001",
        "S:primary:primary:7.default:0:1:9.localhost:99999",
        "S:primary:primary:7.default:0:1:9.localhost:4001 ",
        "S:primary:primary:7.default:0:1:9.localhost:+4001",
    ] {
        assert!(
            matches!(
                decode_notification(payload),
                Err(DecodeError::InvalidNumber { .. })
            ),
            "{payload} should not decode"
        );
    }
}

#[test]
fn test_truncated_payloads_fail() {
    let full = "S:wait_primary:wait_primary:7.default:0:1:9.localhost:4001";
    for end in 0..full.len() - "4001".len() {
        assert!(
            decode_notification(&full[..end]).is_err(),
            "prefix {:?} should not decode",
            &full[..end]
        );
    }
}

#[test]
fn test_empty_fields_fail() {
    assert_eq!(
        decode_notification("S:primary:primary:0.:0:1:9.localhost:4001"),
        Err(DecodeError::EmptyField("formation"))
    );
    assert_eq!(
        decode_notification("S:primary:primary:7.default:0:1:9.:4001"),
        Err(DecodeError::EmptyField("node name"))
    );
}
