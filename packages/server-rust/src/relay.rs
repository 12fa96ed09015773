//! Relay facade with deferred startup.
//!
//! 1. `new()` validates configuration and allocates the index, registry and
//!    engine
//! 2. subscribers are registered while the relay is idle (or at any time
//!    later)
//! 3. `start()` resolves this node's identity, opens one stream per category
//!    that has subscribers, and spawns a dispatcher for each plus the sweeper
//! 4. the returned [`RelayHandle`] joins or stops the running tasks

use std::sync::Arc;
use std::time::Duration;

use fwdwatch_core::{Category, ClockSource, RawHtlcEvent, RawInvoice, Subscriber};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::RelayConfig;
use crate::dispatcher::{Dispatcher, DispatcherExit};
use crate::engine::{CorrelationEngine, EventHandler};
use crate::error::{RelayError, ResolveError};
use crate::index::CorrelationIndex;
use crate::registry::SubscriptionRegistry;
use crate::resolver::{Enricher, MetadataResolver};
use crate::shutdown::{LifecycleState, ShutdownController};
use crate::source::{BoxedSource, NodeEvents};
use crate::sweeper::{StaleSweeper, SweeperHandle};

/// Owns every piece of relay state. Independent relays share nothing.
pub struct Relay {
    config: RelayConfig,
    registry: Arc<SubscriptionRegistry>,
    engine: Arc<CorrelationEngine>,
    clock: Arc<dyn ClockSource>,
    shutdown: Arc<ShutdownController>,
}

impl Relay {
    /// Creates an idle relay.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Config` if `config` fails validation.
    pub fn new(
        config: RelayConfig,
        resolver: Arc<dyn MetadataResolver>,
        clock: Arc<dyn ClockSource>,
    ) -> Result<Self, RelayError> {
        config.validate()?;

        let registry = Arc::new(SubscriptionRegistry::new(config.delivery_timeout));
        let engine = Arc::new(CorrelationEngine::new(
            Arc::new(CorrelationIndex::new(config.max_pending)),
            Arc::clone(&registry),
            Enricher::new(resolver, config.resolver_timeout, config.placeholder.clone()),
            Arc::clone(&clock),
            &config,
        ));

        Ok(Self {
            config,
            registry,
            engine,
            clock,
            shutdown: Arc::new(ShutdownController::new()),
        })
    }

    /// Register a subscriber for `category`. See
    /// [`SubscriptionRegistry::register`].
    pub fn register<S: Subscriber + 'static>(&self, category: Category, subscriber: &Arc<S>) -> bool {
        self.registry.register(category, subscriber)
    }

    pub fn deregister(&self, category: Category, name: &str) -> bool {
        self.registry.deregister(category, name)
    }

    #[must_use]
    pub fn registry(&self) -> Arc<SubscriptionRegistry> {
        Arc::clone(&self.registry)
    }

    #[must_use]
    pub fn engine(&self) -> Arc<CorrelationEngine> {
        Arc::clone(&self.engine)
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.shutdown.state()
    }

    /// Start dispatching.
    ///
    /// Categories without subscribers at this moment get no stream and no
    /// dispatcher. All streams are opened before any dispatcher is spawned,
    /// so a failed start leaves nothing running. A relay starts at most once.
    ///
    /// # Errors
    ///
    /// - `RelayError::AlreadyStarted` on a second call
    /// - `RelayError::SelfIdentity` if this node's identity cannot be resolved
    /// - `RelayError::Subscribe` if a stream cannot be opened
    pub async fn start(&self, node: Arc<dyn NodeEvents>) -> Result<RelayHandle, RelayError> {
        if !self.shutdown.start() {
            return Err(RelayError::AlreadyStarted);
        }

        match self.open_and_spawn(node.as_ref()).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.shutdown.trigger_shutdown();
                self.shutdown.wait_for_drain(Duration::ZERO).await;
                Err(e)
            }
        }
    }

    async fn open_and_spawn(&self, node: &dyn NodeEvents) -> Result<RelayHandle, RelayError> {
        let resolver = self.engine.enricher().resolver();
        let self_pubkey = tokio::time::timeout(self.config.resolver_timeout, resolver.self_identity())
            .await
            .unwrap_or_else(|_| Err(ResolveError::Unavailable("timed out".to_string())))
            .map_err(RelayError::SelfIdentity)?;
        info!(self_pubkey = %self_pubkey, "Resolved node identity");
        self.engine.set_self_pubkey(self_pubkey);

        let htlc_source = if self.registry.has_subscribers(Category::Forward) {
            Some(node.subscribe_htlc_events().await.map_err(|source| {
                RelayError::Subscribe {
                    category: Category::Forward,
                    source,
                }
            })?)
        } else {
            None
        };
        let invoice_source = if self.registry.has_subscribers(Category::InvoiceSettled) {
            Some(node.subscribe_invoices().await.map_err(|source| {
                RelayError::Subscribe {
                    category: Category::InvoiceSettled,
                    source,
                }
            })?)
        } else {
            None
        };

        let mut dispatchers = Vec::new();
        if let Some(source) = htlc_source {
            let handler: Arc<dyn EventHandler<RawHtlcEvent>> = self.engine.clone();
            dispatchers.push(self.spawn_dispatcher(Category::Forward, source, handler));
        }
        if let Some(source) = invoice_source {
            let handler: Arc<dyn EventHandler<RawInvoice>> = self.engine.clone();
            dispatchers.push(self.spawn_dispatcher(Category::InvoiceSettled, source, handler));
        }
        if dispatchers.is_empty() {
            info!("No subscribers registered; no streams opened");
        }

        let sweeper = StaleSweeper::new(
            Arc::clone(self.engine.index()),
            Arc::clone(&self.clock),
            self.config.pending_max_age,
        )
        .start(self.config.sweep_interval, self.shutdown.child_token());

        Ok(RelayHandle {
            dispatchers,
            sweeper,
            shutdown: Arc::clone(&self.shutdown),
            grace: self.config.shutdown_grace,
        })
    }

    fn spawn_dispatcher<T: Send + 'static>(
        &self,
        category: Category,
        source: BoxedSource<T>,
        handler: Arc<dyn EventHandler<T>>,
    ) -> DispatcherTask {
        let dispatcher = Dispatcher::new(category, source, handler, self.shutdown.child_token())
            .with_guard(self.shutdown.dispatcher_guard());
        DispatcherTask {
            category,
            handle: tokio::spawn(dispatcher.run()),
            exit: None,
        }
    }
}

struct DispatcherTask {
    category: Category,
    handle: JoinHandle<DispatcherExit>,
    exit: Option<DispatcherExit>,
}

impl DispatcherTask {
    async fn wait(&mut self) -> DispatcherExit {
        if let Some(exit) = &self.exit {
            return exit.clone();
        }
        let exit = match (&mut self.handle).await {
            Ok(exit) => exit,
            Err(e) if e.is_cancelled() => DispatcherExit::Cancelled,
            Err(e) => DispatcherExit::TransportError(format!("dispatcher task failed: {e}")),
        };
        self.exit = Some(exit.clone());
        exit
    }
}

/// Handle to a started relay.
pub struct RelayHandle {
    dispatchers: Vec<DispatcherTask>,
    sweeper: SweeperHandle,
    shutdown: Arc<ShutdownController>,
    grace: Duration,
}

impl RelayHandle {
    /// Categories that have a running (or finished) dispatcher.
    #[must_use]
    pub fn categories(&self) -> Vec<Category> {
        self.dispatchers.iter().map(|d| d.category).collect()
    }

    /// Wait until every dispatcher has exited on its own.
    ///
    /// Safe to drop mid-way; exits already observed are kept, and a later
    /// `join` or `stop` reports them.
    pub async fn join(&mut self) -> Vec<(Category, DispatcherExit)> {
        let mut exits = Vec::with_capacity(self.dispatchers.len());
        for task in &mut self.dispatchers {
            exits.push((task.category, task.wait().await));
        }
        exits
    }

    /// Cancel every dispatcher and the sweeper, then wait up to the
    /// configured grace period. Dispatchers still running after that are
    /// aborted.
    pub async fn stop(mut self) -> Vec<(Category, DispatcherExit)> {
        self.shutdown.trigger_shutdown();

        if !self.shutdown.wait_for_drain(self.grace).await {
            warn!(
                live = self.shutdown.live_dispatchers(),
                "Dispatchers did not stop within grace period; aborting"
            );
            for task in &self.dispatchers {
                if task.exit.is_none() {
                    task.handle.abort();
                }
            }
        }

        let exits = self.join().await;
        self.sweeper.stop().await;
        self.shutdown.wait_for_drain(Duration::ZERO).await;
        for (category, exit) in &exits {
            info!(category = %category, exit = %exit, "Dispatcher joined");
        }
        exits
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use fwdwatch_core::{DomainEvent, HtlcEventKind, HtlcEventType, HtlcInfo, ManualClock};
    use tokio::sync::mpsc;

    use super::*;
    use crate::error::SourceError;
    use crate::resolver::StaticDirectory;
    use crate::source::ChannelSource;
    use crate::subscribers::ChannelSubscriber;

    const SELF: &str = "02self";

    /// Node whose streams are fed by test code through channels.
    struct FakeNode {
        htlc: parking_lot::Mutex<Option<BoxedSource<RawHtlcEvent>>>,
        invoices: parking_lot::Mutex<Option<BoxedSource<RawInvoice>>>,
        opened: AtomicUsize,
    }

    type Feeds = (
        mpsc::Sender<Result<RawHtlcEvent, SourceError>>,
        mpsc::Sender<Result<RawInvoice, SourceError>>,
    );

    impl FakeNode {
        fn new() -> (Arc<Self>, Feeds) {
            let (htlc_tx, htlc) = ChannelSource::new(16);
            let (inv_tx, invoices) = ChannelSource::new(16);
            let node = Arc::new(Self {
                htlc: parking_lot::Mutex::new(Some(Box::new(htlc))),
                invoices: parking_lot::Mutex::new(Some(Box::new(invoices))),
                opened: AtomicUsize::new(0),
            });
            (node, (htlc_tx, inv_tx))
        }
    }

    #[async_trait]
    impl NodeEvents for FakeNode {
        async fn subscribe_htlc_events(&self) -> Result<BoxedSource<RawHtlcEvent>, SourceError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.htlc
                .lock()
                .take()
                .ok_or_else(|| SourceError::Transport("already open".to_string()))
        }

        async fn subscribe_invoices(&self) -> Result<BoxedSource<RawInvoice>, SourceError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.invoices
                .lock()
                .take()
                .ok_or_else(|| SourceError::Transport("already open".to_string()))
        }
    }

    /// Resolver that cannot answer anything.
    struct DownResolver;

    #[async_trait]
    impl MetadataResolver for DownResolver {
        async fn self_identity(&self) -> Result<String, ResolveError> {
            Err(ResolveError::Unavailable("down".to_string()))
        }
        async fn channel_endpoints(
            &self,
            _channel_id: u64,
        ) -> Result<crate::resolver::ChannelEndpoints, ResolveError> {
            Err(ResolveError::Unavailable("down".to_string()))
        }
        async fn alias(&self, _pubkey: &str) -> Result<String, ResolveError> {
            Err(ResolveError::Unavailable("down".to_string()))
        }
    }

    fn relay() -> Relay {
        let directory = StaticDirectory::new(SELF);
        directory.add_channel(10, "03alice", SELF);
        directory.add_channel(20, SELF, "03bob");
        directory.add_alias("03alice", "alice");
        directory.add_alias("03bob", "bob");
        Relay::new(
            RelayConfig::default(),
            Arc::new(directory),
            Arc::new(ManualClock::new(0)),
        )
        .unwrap()
    }

    fn htlc(event: HtlcEventKind) -> RawHtlcEvent {
        RawHtlcEvent {
            incoming_channel_id: 10,
            outgoing_channel_id: 20,
            incoming_htlc_id: 1,
            outgoing_htlc_id: 2,
            timestamp_ns: 99,
            event_type: HtlcEventType::Forward,
            event,
        }
    }

    fn forward_started() -> RawHtlcEvent {
        htlc(HtlcEventKind::Forward {
            info: HtlcInfo {
                incoming_timelock: 100,
                outgoing_timelock: 90,
                incoming_amt_msat: 10_000,
                outgoing_amt_msat: 9_990,
            },
        })
    }

    fn settled_invoice() -> RawInvoice {
        RawInvoice {
            settled: true,
            amt_paid_msat: 21_000,
            r_preimage: vec![0xaa],
            r_hash: vec![0xbb],
            memo: "tip".to_string(),
            settle_index: 1,
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = RelayConfig {
            max_pending: 0,
            ..RelayConfig::default()
        };
        let result = Relay::new(
            config,
            Arc::new(StaticDirectory::new(SELF)),
            Arc::new(ManualClock::new(0)),
        );
        assert!(matches!(result, Err(RelayError::Config(_))));
    }

    #[tokio::test]
    async fn forward_flows_end_to_end() {
        let relay = relay();
        let (sub, mut rx) = ChannelSubscriber::new("chan", 8);
        let sub = Arc::new(sub);
        relay.register(Category::Forward, &sub);

        let (node, (htlc_tx, _inv_tx)) = FakeNode::new();
        let mut handle = relay.start(node.clone()).await.unwrap();
        assert_eq!(handle.categories(), vec![Category::Forward]);
        assert_eq!(node.opened.load(Ordering::SeqCst), 1);
        assert_eq!(relay.state(), LifecycleState::Running);

        htlc_tx.send(Ok(forward_started())).await.unwrap();
        htlc_tx
            .send(Ok(htlc(HtlcEventKind::Settle { preimage: vec![1] })))
            .await
            .unwrap();

        let Some(DomainEvent::ForwardSettled(fwd)) = rx.recv().await else {
            panic!("expected a settled forward");
        };
        assert_eq!(fwd.from_alias, "alice");
        assert_eq!(fwd.to_alias, "bob");
        assert_eq!(fwd.fee_msat(), 10);
        assert_eq!(fwd.settled_at_ns, 99);

        drop(htlc_tx);
        let exits = handle.join().await;
        assert_eq!(exits, vec![(Category::Forward, DispatcherExit::StreamEnded)]);
        handle.stop().await;
        assert_eq!(relay.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn invoice_flows_end_to_end() {
        let relay = relay();
        let (sub, mut rx) = ChannelSubscriber::new("chan", 8);
        let sub = Arc::new(sub);
        relay.register(Category::InvoiceSettled, &sub);

        let (node, (_htlc_tx, inv_tx)) = FakeNode::new();
        let handle = relay.start(node).await.unwrap();
        assert_eq!(handle.categories(), vec![Category::InvoiceSettled]);

        let mut unsettled = settled_invoice();
        unsettled.settled = false;
        inv_tx.send(Ok(unsettled)).await.unwrap();
        inv_tx.send(Ok(settled_invoice())).await.unwrap();

        let Some(DomainEvent::InvoiceSettled(inv)) = rx.recv().await else {
            panic!("expected a settled invoice");
        };
        assert_eq!(inv.amt_paid_msat, 21_000);
        assert_eq!(inv.memo, "tip");

        let exits = handle.stop().await;
        assert_eq!(exits, vec![(Category::InvoiceSettled, DispatcherExit::Cancelled)]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn no_subscribers_opens_nothing() {
        let relay = relay();
        let (node, _feeds) = FakeNode::new();

        let mut handle = relay.start(node.clone()).await.unwrap();
        assert!(handle.categories().is_empty());
        assert_eq!(node.opened.load(Ordering::SeqCst), 0);
        assert!(handle.join().await.is_empty());
        handle.stop().await;
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let relay = relay();
        let (node, _feeds) = FakeNode::new();
        let handle = relay.start(node.clone()).await.unwrap();

        assert!(matches!(
            relay.start(node).await,
            Err(RelayError::AlreadyStarted)
        ));
        handle.stop().await;
    }

    #[tokio::test]
    async fn unresolvable_identity_fails_start() {
        let relay = Relay::new(
            RelayConfig::default(),
            Arc::new(DownResolver),
            Arc::new(ManualClock::new(0)),
        )
        .unwrap();
        let (node, _feeds) = FakeNode::new();

        assert!(matches!(
            relay.start(node).await,
            Err(RelayError::SelfIdentity(ResolveError::Unavailable(_)))
        ));
        assert_eq!(relay.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn subscribe_failure_names_category() {
        let relay = relay();
        let (sub, _rx) = ChannelSubscriber::new("chan", 8);
        let sub = Arc::new(sub);
        relay.register(Category::Forward, &sub);
        relay.register(Category::InvoiceSettled, &sub);

        let (node, _feeds) = FakeNode::new();
        node.invoices.lock().take();

        let err = relay.start(node).await.err().unwrap();
        assert!(matches!(
            err,
            RelayError::Subscribe {
                category: Category::InvoiceSettled,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn transport_error_ends_only_its_dispatcher() {
        let relay = relay();
        let (sub, mut rx) = ChannelSubscriber::new("chan", 8);
        let sub = Arc::new(sub);
        relay.register(Category::Forward, &sub);
        relay.register(Category::InvoiceSettled, &sub);

        let (node, (htlc_tx, inv_tx)) = FakeNode::new();
        let handle = relay.start(node).await.unwrap();

        htlc_tx
            .send(Err(SourceError::Transport("reset".to_string())))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        inv_tx.send(Ok(settled_invoice())).await.unwrap();

        let Some(DomainEvent::InvoiceSettled(inv)) = rx.recv().await else {
            panic!("expected the invoice dispatcher to keep delivering");
        };
        assert_eq!(inv.amt_paid_msat, 21_000);

        let exits = handle.stop().await;
        assert_eq!(
            exits,
            vec![
                (
                    Category::Forward,
                    DispatcherExit::TransportError("reset".to_string())
                ),
                (Category::InvoiceSettled, DispatcherExit::Cancelled),
            ]
        );
    }
}
