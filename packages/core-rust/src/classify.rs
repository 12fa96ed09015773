//! Event classification: projects a [`RawHtlcEvent`] onto a forwarding outcome.
//!
//! Classification is pure. It performs no I/O, never fails, and maps every
//! record it does not act on to [`Outcome::Ignored`].

use crate::raw::{HtlcEventKind, HtlcEventType, RawHtlcEvent};
use crate::types::{PendingForward, RoutingKey};

/// What a single raw HTLC event means for a forwarding attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A forward was handed to the outgoing link; the payload is the new
    /// pending record.
    AttemptStarted(PendingForward),
    /// The forward completed successfully.
    Settled { key: RoutingKey, settled_at_ns: u64 },
    /// The forward failed on the local link.
    LinkFailed { key: RoutingKey },
    /// The forward failed downstream.
    ForwardFailed { key: RoutingKey },
    /// The record carries nothing the correlation engine acts on.
    Ignored { reason: &'static str },
}

impl Outcome {
    /// Returns the label used in logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AttemptStarted(_) => "attempt_started",
            Self::Settled { .. } => "settled",
            Self::LinkFailed { .. } => "link_failed",
            Self::ForwardFailed { .. } => "forward_failed",
            Self::Ignored { .. } => "ignored",
        }
    }

    /// Returns the routing key for every outcome except [`Outcome::Ignored`].
    #[must_use]
    pub fn key(&self) -> Option<RoutingKey> {
        match self {
            Self::AttemptStarted(pending) => Some(pending.key),
            Self::Settled { key, .. } | Self::LinkFailed { key } | Self::ForwardFailed { key } => {
                Some(*key)
            }
            Self::Ignored { .. } => None,
        }
    }
}

/// Classify one raw HTLC event.
///
/// Only forwards are correlated. Events the node tags as `Send` or `Receive`
/// concern payments that start or end here and are ignored, as are
/// subscription markers, final-resolution notices and unknown payloads.
#[must_use]
pub fn classify(event: &RawHtlcEvent) -> Outcome {
    match event.event_type {
        HtlcEventType::Send => return Outcome::Ignored { reason: "send" },
        HtlcEventType::Receive => return Outcome::Ignored { reason: "receive" },
        HtlcEventType::Forward | HtlcEventType::Unknown => {}
    }

    let key = RoutingKey::from(event);
    match &event.event {
        HtlcEventKind::Forward { info } => Outcome::AttemptStarted(PendingForward {
            key,
            incoming_amt_msat: info.incoming_amt_msat,
            outgoing_amt_msat: info.outgoing_amt_msat,
            started_at_ns: event.timestamp_ns,
        }),
        HtlcEventKind::Settle { .. } => Outcome::Settled {
            key,
            settled_at_ns: event.timestamp_ns,
        },
        HtlcEventKind::LinkFail { .. } => Outcome::LinkFailed { key },
        HtlcEventKind::ForwardFail => Outcome::ForwardFailed { key },
        HtlcEventKind::FinalHtlc { .. } => Outcome::Ignored {
            reason: "final_htlc",
        },
        HtlcEventKind::Subscribed => Outcome::Ignored {
            reason: "subscribed",
        },
        HtlcEventKind::Unknown => Outcome::Ignored { reason: "unknown" },
    }
}
