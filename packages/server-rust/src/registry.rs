//! Subscription registry: per-category, name-keyed, ordered subscriber sets.
//!
//! Fan-out follows the composite-observer shape: every live subscriber of a
//! category receives each event, in registration order. Unlike a plain
//! composite, each delivery is bounded by a timeout and isolated, so a slow,
//! failing or panicking subscriber cannot stop delivery to the rest.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use fwdwatch_core::{Category, DomainEvent, Subscriber};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

/// One registration: the name captured at registration time and a
/// non-owning handle to the subscriber.
struct Registration {
    name: String,
    handle: Weak<dyn Subscriber>,
}

/// Per-call delivery tally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl DispatchReport {
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.delivered + self.failed + self.timed_out
    }
}

/// Registry of subscribers by category.
///
/// The lock is held only to read or mutate the registration lists; it is
/// released before any subscriber is called.
pub struct SubscriptionRegistry {
    by_category: RwLock<HashMap<Category, Vec<Registration>>>,
    delivery_timeout: Duration,
}

impl SubscriptionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(delivery_timeout: Duration) -> Self {
        Self {
            by_category: RwLock::new(HashMap::new()),
            delivery_timeout,
        }
    }

    /// Register `subscriber` under `category`.
    ///
    /// A previous registration with the same name is replaced, and the name
    /// moves to the end of the delivery order. Returns `true` if a previous
    /// holder was replaced.
    pub fn register<S: Subscriber + 'static>(&self, category: Category, subscriber: &Arc<S>) -> bool {
        let name = subscriber.name().to_string();
        let weak: Weak<S> = Arc::downgrade(subscriber);
        let handle: Weak<dyn Subscriber> = weak;

        let mut guard = self.by_category.write();
        let list = guard.entry(category).or_default();
        let replaced = match list.iter().position(|r| r.name == name) {
            Some(pos) => {
                list.remove(pos);
                true
            }
            None => false,
        };
        list.push(Registration {
            name: name.clone(),
            handle,
        });
        drop(guard);

        if replaced {
            warn!(category = %category, subscriber = %name, "Subscriber name re-registered; previous holder replaced");
        } else {
            info!(category = %category, subscriber = %name, "Subscriber registered");
        }
        replaced
    }

    /// Remove the subscriber named `name` from `category`.
    ///
    /// Returns `false`, with a diagnostic, when no such registration exists.
    pub fn deregister(&self, category: Category, name: &str) -> bool {
        let removed = {
            let mut guard = self.by_category.write();
            guard.get_mut(&category).is_some_and(|list| {
                let before = list.len();
                list.retain(|r| r.name != name);
                list.len() != before
            })
        };

        if removed {
            info!(category = %category, subscriber = %name, "Subscriber deregistered");
        } else {
            warn!(category = %category, subscriber = %name, "Cannot deregister; subscriber does not exist");
        }
        removed
    }

    /// Names registered under `category` whose subscriber is still alive,
    /// in delivery order.
    #[must_use]
    pub fn subscribers(&self, category: Category) -> Vec<String> {
        self.by_category
            .read()
            .get(&category)
            .map(|list| {
                list.iter()
                    .filter(|r| r.handle.strong_count() > 0)
                    .map(|r| r.name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether `category` has at least one live subscriber.
    #[must_use]
    pub fn has_subscribers(&self, category: Category) -> bool {
        self.by_category
            .read()
            .get(&category)
            .is_some_and(|list| list.iter().any(|r| r.handle.strong_count() > 0))
    }

    /// Deliver `event` to every live subscriber of its category, in order.
    ///
    /// Each delivery is bounded by the registry's delivery timeout. Errors,
    /// timeouts and panics are logged per subscriber and counted in the
    /// returned report; they never abort delivery to later subscribers.
    pub async fn dispatch(&self, event: &DomainEvent) -> DispatchReport {
        let category = event.category();
        let (targets, dead) = self.snapshot(category);
        if dead {
            self.prune(category);
        }

        let mut report = DispatchReport::default();
        for subscriber in targets {
            let name = subscriber.name().to_string();
            let delivery = AssertUnwindSafe(subscriber.deliver(event)).catch_unwind();
            match tokio::time::timeout(self.delivery_timeout, delivery).await {
                Ok(Ok(Ok(()))) => {
                    report.delivered += 1;
                    debug!(category = %category, subscriber = %name, "Event delivered");
                    metrics::counter!("fwdwatch_deliveries_total", "result" => "delivered")
                        .increment(1);
                }
                Ok(Ok(Err(e))) => {
                    report.failed += 1;
                    warn!(category = %category, subscriber = %name, error = %e, "Subscriber failed to handle event");
                    metrics::counter!("fwdwatch_deliveries_total", "result" => "failed")
                        .increment(1);
                }
                Ok(Err(_panic)) => {
                    report.failed += 1;
                    warn!(category = %category, subscriber = %name, "Subscriber panicked while handling event");
                    metrics::counter!("fwdwatch_deliveries_total", "result" => "panicked")
                        .increment(1);
                }
                Err(_elapsed) => {
                    report.timed_out += 1;
                    warn!(
                        category = %category,
                        subscriber = %name,
                        timeout_ms = u64::try_from(self.delivery_timeout.as_millis()).unwrap_or(u64::MAX),
                        "Subscriber delivery timed out"
                    );
                    metrics::counter!("fwdwatch_deliveries_total", "result" => "timed_out")
                        .increment(1);
                }
            }
        }
        report
    }

    /// Upgrade the live handles of `category` under the read lock.
    fn snapshot(&self, category: Category) -> (Vec<Arc<dyn Subscriber>>, bool) {
        let guard = self.by_category.read();
        let Some(list) = guard.get(&category) else {
            return (Vec::new(), false);
        };
        let targets: Vec<Arc<dyn Subscriber>> =
            list.iter().filter_map(|r| r.handle.upgrade()).collect();
        let dead = targets.len() != list.len();
        (targets, dead)
    }

    fn prune(&self, category: Category) {
        let mut guard = self.by_category.write();
        if let Some(list) = guard.get_mut(&category) {
            list.retain(|r| {
                let alive = r.handle.strong_count() > 0;
                if !alive {
                    debug!(category = %category, subscriber = %r.name, "Pruned dropped subscriber");
                }
                alive
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
