//! Lifecycle controller with cancellation and live-dispatcher tracking.
//!
//! Uses `ArcSwap` for lock-free lifecycle state transitions, a root
//! `CancellationToken` from which every dispatcher and the sweeper derive a
//! child, and an atomic counter with RAII guards for live dispatchers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;

/// Relay lifecycle state.
///
/// State machine: Idle -> Running -> Stopping -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed; no dispatcher has been started.
    Idle,
    /// Dispatchers are running.
    Running,
    /// Cancellation was requested; dispatchers are draining.
    Stopping,
    /// Every dispatcher has exited.
    Stopped,
}

/// Coordinates cancellation across dispatchers and the sweeper.
///
/// 1. `start()` moves to `Running`
/// 2. each dispatcher holds a `DispatcherGuard` and a `child_token()`
/// 3. `trigger_shutdown()` moves to `Stopping` and cancels every child
/// 4. `wait_for_drain()` waits until all guards are dropped
#[derive(Debug)]
pub struct ShutdownController {
    root: CancellationToken,
    live: Arc<AtomicU64>,
    state: Arc<ArcSwap<LifecycleState>>,
}

impl ShutdownController {
    /// Creates a new controller in the `Idle` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            live: Arc::new(AtomicU64::new(0)),
            state: Arc::new(ArcSwap::from_pointee(LifecycleState::Idle)),
        }
    }

    /// Transitions `Idle` to `Running`. Returns `false` if the controller
    /// has already left `Idle`.
    pub fn start(&self) -> bool {
        let previous = self.state.rcu(|current| match **current {
            LifecycleState::Idle => LifecycleState::Running,
            other => other,
        });
        *previous == LifecycleState::Idle
    }

    /// A token cancelled when shutdown is triggered.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// Cancels every child token and transitions to `Stopping`.
    pub fn trigger_shutdown(&self) {
        self.state.rcu(|current| match **current {
            LifecycleState::Stopped => LifecycleState::Stopped,
            _ => LifecycleState::Stopping,
        });
        self.root.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.root.is_cancelled()
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    /// Creates an RAII guard that marks one dispatcher as live.
    #[must_use]
    pub fn dispatcher_guard(&self) -> DispatcherGuard {
        self.live.fetch_add(1, Ordering::SeqCst);
        DispatcherGuard {
            live: Arc::clone(&self.live),
        }
    }

    #[must_use]
    pub fn live_dispatchers(&self) -> u64 {
        self.live.load(Ordering::SeqCst)
    }

    /// Waits for every dispatcher guard to drop, up to `timeout`.
    ///
    /// Returns `true` and transitions to `Stopped` if all dispatchers exited.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.live.load(Ordering::SeqCst) == 0 {
                self.state.store(Arc::new(LifecycleState::Stopped));
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the live-dispatcher counter when dropped.
#[derive(Debug)]
pub struct DispatcherGuard {
    live: Arc<AtomicU64>,
}

impl Drop for DispatcherGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}
