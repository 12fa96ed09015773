use async_trait::async_trait;

use crate::types::DomainEvent;

/// Receiver of enriched domain events.
///
/// Implementations are registered by name under one or more categories.
/// The registry holds only a weak handle, so the caller keeps ownership and
/// dropping the last strong reference silently ends the registration.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Unique name of this subscriber within a category.
    fn name(&self) -> &str;

    /// Handle one event. Deliveries to a single subscriber are never
    /// concurrent within one category.
    ///
    /// # Errors
    ///
    /// An error is logged by the dispatcher and does not affect delivery to
    /// other subscribers.
    async fn deliver(&self, event: &DomainEvent) -> anyhow::Result<()>;
}
