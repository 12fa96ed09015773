//! Correlation engine: the forwarding-attempt state machine.
//!
//! Drives the [`CorrelationIndex`] from classified HTLC events, enriches
//! settled forwards through the [`Enricher`], and hands finished
//! [`DomainEvent`]s to the [`SubscriptionRegistry`].
//!
//! All state is owned by the engine instance and injected at construction,
//! so independent engines can coexist in one process.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use fwdwatch_core::{
    classify, ClockSource, DomainEvent, ForwardSettled, InvoiceSettled, Outcome, RawHtlcEvent,
    RawInvoice, RoutingKey,
};
use tracing::{debug, warn};

use crate::config::RelayConfig;
use crate::index::{CorrelationIndex, InsertOutcome, PendingEntry};
use crate::registry::{DispatchReport, SubscriptionRegistry};
use crate::resolver::Enricher;

/// What processing one raw event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// A forward started; `replaced` is true if it overwrote an abandoned
    /// entry at the same key.
    Pending { replaced: bool },
    /// A settled forward was correlated and delivered.
    Delivered(DispatchReport),
    /// A failed forward was correlated; its entry was cleared.
    Cleared,
    /// A terminal event had no pending entry.
    Unmatched,
    /// The event was not acted on.
    Ignored,
}

/// Handler for one kind of raw record. Dispatchers are generic over this.
#[async_trait]
pub trait EventHandler<T>: Send + Sync {
    async fn handle(&self, item: T) -> ProcessOutcome;
}

/// Forwarding-event state machine plus invoice pass-through.
pub struct CorrelationEngine {
    index: Arc<CorrelationIndex>,
    registry: Arc<SubscriptionRegistry>,
    enricher: Enricher,
    clock: Arc<dyn ClockSource>,
    self_pubkey: ArcSwapOption<String>,
    placeholder: String,
}

impl CorrelationEngine {
    #[must_use]
    pub fn new(
        index: Arc<CorrelationIndex>,
        registry: Arc<SubscriptionRegistry>,
        enricher: Enricher,
        clock: Arc<dyn ClockSource>,
        config: &RelayConfig,
    ) -> Self {
        Self {
            index,
            registry,
            enricher,
            clock,
            self_pubkey: ArcSwapOption::empty(),
            placeholder: config.placeholder.clone(),
        }
    }

    /// Set this node's identity, used to pick the counterparty of each
    /// channel. Until set, enrichment treats every node as a counterparty.
    pub fn set_self_pubkey(&self, pubkey: String) {
        self.self_pubkey.store(Some(Arc::new(pubkey)));
    }

    #[must_use]
    pub fn self_pubkey(&self) -> Option<Arc<String>> {
        self.self_pubkey.load_full()
    }

    #[must_use]
    pub fn index(&self) -> &Arc<CorrelationIndex> {
        &self.index
    }

    #[must_use]
    pub fn enricher(&self) -> &Enricher {
        &self.enricher
    }

    /// Process one raw HTLC event, in arrival order.
    pub async fn process(&self, event: &RawHtlcEvent) -> ProcessOutcome {
        let outcome = classify(event);
        metrics::counter!("fwdwatch_events_total", "outcome" => outcome.as_str()).increment(1);

        match outcome {
            Outcome::AttemptStarted(pending) => {
                let replaced = match self.index.insert(pending, self.clock.now_ms()) {
                    InsertOutcome::Inserted => false,
                    InsertOutcome::Replaced(previous) => {
                        debug!(
                            key = %pending.key,
                            previous_incoming_msat = previous.forward.incoming_amt_msat,
                            "Forward restarted; previous attempt abandoned"
                        );
                        true
                    }
                    InsertOutcome::EvictedOldest(_) => {
                        metrics::counter!("fwdwatch_pending_evicted_total", "reason" => "capacity")
                            .increment(1);
                        false
                    }
                };
                debug!(
                    key = %pending.key,
                    incoming_msat = pending.incoming_amt_msat,
                    outgoing_msat = pending.outgoing_amt_msat,
                    pending = self.index.len(),
                    "Forward attempt started"
                );
                ProcessOutcome::Pending { replaced }
            }
            Outcome::Settled { key, settled_at_ns } => {
                let Some(entry) = self.index.take(&key) else {
                    warn!(key = %key, "Settle without a pending forward; discarded");
                    metrics::counter!("fwdwatch_correlation_misses_total").increment(1);
                    return ProcessOutcome::Unmatched;
                };
                let settled = self.enrich(entry, settled_at_ns).await;
                debug!(
                    key = %key,
                    from = %settled.from_alias,
                    to = %settled.to_alias,
                    incoming_msat = settled.incoming_msat,
                    outgoing_msat = settled.outgoing_msat,
                    fee_msat = settled.fee_msat(),
                    "Forward settled"
                );
                let report = self
                    .registry
                    .dispatch(&DomainEvent::ForwardSettled(settled))
                    .await;
                ProcessOutcome::Delivered(report)
            }
            Outcome::LinkFailed { key } | Outcome::ForwardFailed { key } => {
                self.clear_failed(key, outcome.as_str())
            }
            Outcome::Ignored { reason } => {
                debug!(reason, "HTLC event ignored");
                ProcessOutcome::Ignored
            }
        }
    }

    /// Deliver a settled invoice. Unsettled invoice updates are ignored.
    pub async fn process_invoice(&self, invoice: &RawInvoice) -> ProcessOutcome {
        if !invoice.settled {
            debug!(
                payment_hash = %hex::encode(&invoice.r_hash),
                "Invoice update is not a settlement; ignored"
            );
            return ProcessOutcome::Ignored;
        }
        debug!(
            amt_paid_msat = invoice.amt_paid_msat,
            settle_index = invoice.settle_index,
            "Invoice settled"
        );
        let report = self
            .registry
            .dispatch(&DomainEvent::InvoiceSettled(InvoiceSettled::from(invoice)))
            .await;
        ProcessOutcome::Delivered(report)
    }

    fn clear_failed(&self, key: RoutingKey, outcome: &'static str) -> ProcessOutcome {
        match self.index.take(&key) {
            Some(_) => {
                debug!(key = %key, outcome, "Forward failed; pending entry cleared");
                ProcessOutcome::Cleared
            }
            None => {
                debug!(key = %key, outcome, "Failure without a pending forward; discarded");
                ProcessOutcome::Unmatched
            }
        }
    }

    /// Resolve both counterparties. Runs after the entry has left the index
    /// and holds no lock across the resolver round trips.
    async fn enrich(&self, entry: PendingEntry, settled_at_ns: u64) -> ForwardSettled {
        let self_pubkey = self
            .self_pubkey
            .load_full()
            .map_or_else(String::new, |pk| pk.as_str().to_owned());
        let key = entry.forward.key;

        let from = self
            .enricher
            .counterparty(key.incoming_channel_id, &self_pubkey)
            .await;
        let to = self
            .enricher
            .counterparty(key.outgoing_channel_id, &self_pubkey)
            .await;

        if from.pubkey == self.placeholder || to.pubkey == self.placeholder {
            debug!(key = %key, "Forward enriched with placeholder identity");
        }

        ForwardSettled {
            key,
            from_pubkey: from.pubkey,
            from_alias: from.alias,
            incoming_msat: entry.forward.incoming_amt_msat,
            to_pubkey: to.pubkey,
            to_alias: to.alias,
            outgoing_msat: entry.forward.outgoing_amt_msat,
            settled_at_ns,
        }
    }
}

#[async_trait]
impl EventHandler<RawHtlcEvent> for CorrelationEngine {
    async fn handle(&self, item: RawHtlcEvent) -> ProcessOutcome {
        self.process(&item).await
    }
}

#[async_trait]
impl EventHandler<RawInvoice> for CorrelationEngine {
    async fn handle(&self, item: RawInvoice) -> ProcessOutcome {
        self.process_invoice(&item).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
