//! Ready-made [`Subscriber`] implementations.

use async_trait::async_trait;
use fwdwatch_core::{DomainEvent, Subscriber};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::info;

/// Writes every delivered event to the log as one structured line.
#[derive(Debug, Clone)]
pub struct LogSubscriber {
    name: String,
}

impl LogSubscriber {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Subscriber for LogSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, event: &DomainEvent) -> anyhow::Result<()> {
        let body = serde_json::to_string(event)?;
        match event {
            DomainEvent::ForwardSettled(fwd) => info!(
                subscriber = %self.name,
                from = %fwd.from_alias,
                to = %fwd.to_alias,
                fee_msat = fwd.fee_msat(),
                event = %body,
                "Forward settled"
            ),
            DomainEvent::InvoiceSettled(inv) => info!(
                subscriber = %self.name,
                amt_paid_msat = inv.amt_paid_msat,
                event = %body,
                "Invoice settled"
            ),
        }
        Ok(())
    }
}

/// Forwards events into a bounded channel.
///
/// Delivery never waits: a full channel is reported as a failed delivery so
/// a slow consumer cannot hold up the dispatcher.
#[derive(Debug)]
pub struct ChannelSubscriber {
    name: String,
    tx: mpsc::Sender<DomainEvent>,
}

impl ChannelSubscriber {
    /// Creates the subscriber and the receiving end of its channel.
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<DomainEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                name: name.into(),
                tx,
            },
            rx,
        )
    }
}

#[async_trait]
impl Subscriber for ChannelSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, event: &DomainEvent) -> anyhow::Result<()> {
        match self.tx.try_send(event.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => anyhow::bail!("{}: channel full", self.name),
            Err(TrySendError::Closed(_)) => anyhow::bail!("{}: receiver dropped", self.name),
        }
    }
}
