//! Raw records as delivered by the routing node's subscription streams.
//!
//! Field names and variants follow the node's HTLC-event and invoice payloads
//! so a transport adapter can map them one-to-one. Byte fields serialize as
//! lowercase hex strings, which makes the records replayable from JSON lines.

use serde::{Deserialize, Serialize};

/// Direction of an HTLC relative to this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HtlcEventType {
    /// The node did not report a direction.
    #[default]
    Unknown,
    /// A payment originating at this node.
    Send,
    /// A payment terminating at this node.
    Receive,
    /// A payment routed through this node.
    Forward,
}

/// Amounts and timelocks of an HTLC pair at the moment it was forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HtlcInfo {
    pub incoming_timelock: u32,
    pub outgoing_timelock: u32,
    pub incoming_amt_msat: u64,
    pub outgoing_amt_msat: u64,
}

/// Lifecycle notification carried by a [`RawHtlcEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HtlcEventKind {
    /// The HTLC was handed to the outgoing link.
    Forward { info: HtlcInfo },
    /// The downstream peer failed the HTLC.
    ForwardFail,
    /// The HTLC was settled with the given preimage.
    Settle {
        #[serde(with = "crate::hex_bytes")]
        preimage: Vec<u8>,
    },
    /// The HTLC failed locally before or while being added to the outgoing link.
    LinkFail {
        info: HtlcInfo,
        wire_failure: String,
        failure_detail: String,
        failure_string: String,
    },
    /// The HTLC was irrevocably resolved on the incoming side.
    FinalHtlc { settled: bool, offchain: bool },
    /// Marker emitted once when the subscription is established.
    Subscribed,
    /// A payload this crate does not model.
    #[serde(other)]
    Unknown,
}

/// One record from the HTLC-event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawHtlcEvent {
    pub incoming_channel_id: u64,
    pub outgoing_channel_id: u64,
    pub incoming_htlc_id: u64,
    pub outgoing_htlc_id: u64,
    #[serde(default)]
    pub timestamp_ns: u64,
    #[serde(default)]
    pub event_type: HtlcEventType,
    pub event: HtlcEventKind,
}

/// One record from the invoice stream.
///
/// The node emits a record whenever an invoice is added, accepted or settled;
/// only `settled == true` records are of interest downstream.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawInvoice {
    pub settled: bool,
    pub amt_paid_msat: u64,
    #[serde(with = "crate::hex_bytes", default)]
    pub r_preimage: Vec<u8>,
    #[serde(with = "crate::hex_bytes", default)]
    pub r_hash: Vec<u8>,
    #[serde(default)]
    pub memo: String,
    #[serde(default)]
    pub settle_index: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_event_parses_from_json() {
        let line = r#"{
            "incoming_channel_id": 10,
            "outgoing_channel_id": 20,
            "incoming_htlc_id": 1,
            "outgoing_htlc_id": 2,
            "event_type": "FORWARD",
            "event": {
                "kind": "forward",
                "info": {
                    "incoming_timelock": 700,
                    "outgoing_timelock": 660,
                    "incoming_amt_msat": 5000,
                    "outgoing_amt_msat": 4990
                }
            }
        }"#;

        let event: RawHtlcEvent = serde_json::from_str(line).unwrap();
        assert_eq!(event.event_type, HtlcEventType::Forward);
        assert_eq!(event.timestamp_ns, 0);
        match event.event {
            HtlcEventKind::Forward { info } => {
                assert_eq!(info.incoming_amt_msat, 5000);
                assert_eq!(info.outgoing_amt_msat, 4990);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn settle_preimage_is_hex_encoded() {
        let event = RawHtlcEvent {
            incoming_channel_id: 1,
            outgoing_channel_id: 2,
            incoming_htlc_id: 3,
            outgoing_htlc_id: 4,
            timestamp_ns: 99,
            event_type: HtlcEventType::Forward,
            event: HtlcEventKind::Settle {
                preimage: vec![0xde, 0xad, 0xbe, 0xef],
            },
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"]["kind"], "settle");
        assert_eq!(json["event"]["preimage"], "deadbeef");
    }

    #[test]
    fn unmodelled_kind_parses_as_unknown() {
        let line = r#"{
            "incoming_channel_id": 1,
            "outgoing_channel_id": 2,
            "incoming_htlc_id": 3,
            "outgoing_htlc_id": 4,
            "event": { "kind": "something_new" }
        }"#;

        let event: RawHtlcEvent = serde_json::from_str(line).unwrap();
        assert_eq!(event.event, HtlcEventKind::Unknown);
        assert_eq!(event.event_type, HtlcEventType::Unknown);
    }

    #[test]
    fn invoice_defaults_missing_fields() {
        let invoice: RawInvoice =
            serde_json::from_str(r#"{"settled": true, "amt_paid_msat": 21000}"#).unwrap();
        assert!(invoice.settled);
        assert_eq!(invoice.amt_paid_msat, 21_000);
        assert!(invoice.r_preimage.is_empty());
        assert!(invoice.memo.is_empty());
    }
}
