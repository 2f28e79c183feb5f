//! Peer Message Schema
//!
//! Defines the logical message types exchanged between DGI nodes. Framing and
//! transport belong to the RPC collaborator; this module only fixes the schema.

use crate::types::PeerId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A message together with its sender, as delivered to a node's router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: PeerId,
    pub msg: PeerMessage,
}

/// Messages exchanged between DGI instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PeerMessage {
    /// Per-iteration dispatch solver state, sent to adjacent topology symbols.
    DispatchState {
        iteration: u32,
        symbol: String,
        delta_p: [f64; 3],
        lambda: [f64; 3],
    },

    /// Clock synchronizer challenge.
    Exchange {
        query: u32,
    },

    /// Clock synchronizer challenge response with a table snapshot.
    ExchangeResponse {
        response: u32,
        /// Responder wall-clock at send, unsynchronized, RFC 3339.
        send_time: String,
        table: Vec<OffsetRecord>,
    },

    /// Load balancer gossip and drafting control.
    LbControl {
        kind: LbKind,
        source: PeerId,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<f64>,
    },

    /// Group membership update from the group-management collaborator.
    PeerList {
        leader: PeerId,
        peers: Vec<PeerId>,
    },

    /// Snapshot reply from the state-collection collaborator.
    CollectedState {
        gateways: Vec<f64>,
        in_transit: Vec<LbKind>,
    },
}

/// One row of a clock synchronizer offset table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffsetRecord {
    pub uuid: PeerId,
    pub offset_secs: i64,
    pub offset_micros: i64,
    pub skew: f64,
    pub weight: f64,
}

/// Load balancer message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LbKind {
    Demand,
    Normal,
    Supply,
    Request,
    Yes,
    No,
    Drafting,
    Accept,
}

impl fmt::Display for LbKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LbKind::Demand => "demand",
            LbKind::Normal => "normal",
            LbKind::Supply => "supply",
            LbKind::Request => "request",
            LbKind::Yes => "yes",
            LbKind::No => "no",
            LbKind::Drafting => "drafting",
            LbKind::Accept => "accept",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_state_serializes_tagged() {
        let msg = PeerMessage::DispatchState {
            iteration: 3,
            symbol: "4".to_string(),
            delta_p: [0.1, 0.2, 0.3],
            lambda: [0.0, 0.0, 0.0],
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"DispatchState\""));
        assert!(json.contains("\"symbol\":\"4\""));
    }

    #[test]
    fn lb_control_omits_missing_value() {
        let msg = PeerMessage::LbControl {
            kind: LbKind::Request,
            source: PeerId::from("node-a"),
            value: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"kind\":\"request\""));
        assert!(!json.contains("value"));

        let accept = PeerMessage::LbControl {
            kind: LbKind::Accept,
            source: PeerId::from("node-b"),
            value: Some(2.0),
        };
        let json = serde_json::to_string(&accept).unwrap();
        assert!(json.contains("\"value\":2.0"));
    }

    #[test]
    fn exchange_response_round_trips() {
        let msg = PeerMessage::ExchangeResponse {
            response: 7,
            send_time: "2026-01-01T00:00:00+00:00".to_string(),
            table: vec![OffsetRecord {
                uuid: PeerId::from("node-c"),
                offset_secs: -1,
                offset_micros: -250_000,
                skew: 0.001,
                weight: 0.9,
            }],
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: PeerMessage = serde_json::from_str(&json).unwrap();
        match back {
            PeerMessage::ExchangeResponse { response, table, .. } => {
                assert_eq!(response, 7);
                assert_eq!(table.len(), 1);
                assert_eq!(table[0].offset_micros, -250_000);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
