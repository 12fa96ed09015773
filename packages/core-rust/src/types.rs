use std::fmt;

use serde::{Deserialize, Serialize};

use crate::raw::{RawHtlcEvent, RawInvoice};

/// Routing coordinates of one forwarding attempt.
///
/// The full 4-tuple is the identity. Two attempts that are in flight at the
/// same time always differ in at least one component, so the tuple is
/// collision-free where a numeric combination of the components is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoutingKey {
    pub incoming_channel_id: u64,
    pub outgoing_channel_id: u64,
    pub incoming_htlc_id: u64,
    pub outgoing_htlc_id: u64,
}

impl RoutingKey {
    #[must_use]
    pub fn new(
        incoming_channel_id: u64,
        outgoing_channel_id: u64,
        incoming_htlc_id: u64,
        outgoing_htlc_id: u64,
    ) -> Self {
        Self {
            incoming_channel_id,
            outgoing_channel_id,
            incoming_htlc_id,
            outgoing_htlc_id,
        }
    }
}

impl From<&RawHtlcEvent> for RoutingKey {
    fn from(event: &RawHtlcEvent) -> Self {
        Self::new(
            event.incoming_channel_id,
            event.outgoing_channel_id,
            event.incoming_htlc_id,
            event.outgoing_htlc_id,
        )
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}:{}",
            self.incoming_channel_id,
            self.incoming_htlc_id,
            self.outgoing_channel_id,
            self.outgoing_htlc_id
        )
    }
}

/// A forwarding attempt that has started but not yet resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingForward {
    pub key: RoutingKey,
    pub incoming_amt_msat: u64,
    pub outgoing_amt_msat: u64,
    /// Node-reported time of the forward, nanoseconds since the Unix epoch.
    pub started_at_ns: u64,
}

/// Subscriber-facing categories. Each category has its own dispatcher and
/// its own ordered set of subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Completed forwards.
    Forward,
    /// Settled invoices.
    InvoiceSettled,
}

impl Category {
    /// Every category, in dispatcher start order.
    pub const ALL: [Category; 2] = [Category::Forward, Category::InvoiceSettled];

    /// Returns the canonical label used in logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::InvoiceSettled => "invoice_settled",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A forward that completed successfully, enriched with counterparty data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardSettled {
    pub key: RoutingKey,
    pub from_pubkey: String,
    pub from_alias: String,
    pub incoming_msat: u64,
    pub to_pubkey: String,
    pub to_alias: String,
    pub outgoing_msat: u64,
    pub settled_at_ns: u64,
}

impl ForwardSettled {
    /// Routing fee earned by this node. Zero if the node reports an outgoing
    /// amount larger than the incoming one.
    #[must_use]
    pub fn fee_msat(&self) -> u64 {
        self.incoming_msat.saturating_sub(self.outgoing_msat)
    }
}

/// An invoice payment received by this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceSettled {
    pub settled: bool,
    pub amt_paid_msat: u64,
    /// Hex-encoded payment preimage.
    pub preimage: String,
    /// Hex-encoded payment hash.
    pub payment_hash: String,
    pub memo: String,
}

impl From<&RawInvoice> for InvoiceSettled {
    fn from(invoice: &RawInvoice) -> Self {
        Self {
            settled: invoice.settled,
            amt_paid_msat: invoice.amt_paid_msat,
            preimage: hex::encode(&invoice.r_preimage),
            payment_hash: hex::encode(&invoice.r_hash),
            memo: invoice.memo.clone(),
        }
    }
}

/// The record delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum DomainEvent {
    ForwardSettled(ForwardSettled),
    InvoiceSettled(InvoiceSettled),
}

impl DomainEvent {
    #[must_use]
    pub fn category(&self) -> Category {
        match self {
            Self::ForwardSettled(_) => Category::Forward,
            Self::InvoiceSettled(_) => Category::InvoiceSettled,
        }
    }
}
