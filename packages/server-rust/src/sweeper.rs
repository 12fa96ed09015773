//! Background eviction of pending forwards that never resolved.
//!
//! The sweeper task listens for on-demand requests on an mpsc channel and
//! runs a sweep on every tick of its interval, until its cancellation token
//! fires or every request sender is gone.

use std::sync::Arc;
use std::time::Duration;

use fwdwatch_core::ClockSource;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::index::CorrelationIndex;

/// On-demand request to the sweeper.
#[derive(Debug)]
pub enum SweepTask {
    /// Sweep now and report how many entries were evicted.
    SweepNow { reply: oneshot::Sender<usize> },
}

/// Evicts stale entries from a [`CorrelationIndex`].
pub struct StaleSweeper {
    index: Arc<CorrelationIndex>,
    clock: Arc<dyn ClockSource>,
    max_age: Duration,
}

impl StaleSweeper {
    #[must_use]
    pub fn new(index: Arc<CorrelationIndex>, clock: Arc<dyn ClockSource>, max_age: Duration) -> Self {
        Self {
            index,
            clock,
            max_age,
        }
    }

    /// Run one sweep. Returns the number of evicted entries.
    pub fn sweep(&self) -> usize {
        let now_ms = self.clock.now_ms();
        let evicted = self.index.sweep_stale(now_ms, self.max_age);
        for entry in &evicted {
            warn!(
                key = %entry.forward.key,
                age_ms = now_ms.saturating_sub(entry.inserted_at_ms),
                incoming_msat = entry.forward.incoming_amt_msat,
                "Evicted stale pending forward"
            );
        }
        if !evicted.is_empty() {
            metrics::counter!("fwdwatch_pending_evicted_total", "reason" => "stale")
                .increment(evicted.len() as u64);
        }
        debug!(evicted = evicted.len(), pending = self.index.len(), "Sweep finished");
        evicted.len()
    }

    /// Spawn the sweeper loop.
    #[must_use]
    pub fn start(self, interval: Duration, cancel: CancellationToken) -> SweeperHandle {
        let (tx, mut rx) = mpsc::channel::<SweepTask>(16);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Skip the first immediate tick so nothing is swept at startup.
            ticker.tick().await;
            info!(interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX), "Sweeper started");

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    task = rx.recv() => match task {
                        Some(SweepTask::SweepNow { reply }) => {
                            let _ = reply.send(self.sweep());
                        }
                        None => break,
                    },
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                }
            }

            info!("Sweeper stopped");
        });

        SweeperHandle {
            tx: Some(tx),
            handle: Some(handle),
        }
    }
}

/// Handle to a running sweeper.
pub struct SweeperHandle {
    tx: Option<mpsc::Sender<SweepTask>>,
    handle: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Ask the sweeper to run now and wait for the eviction count.
    ///
    /// # Errors
    ///
    /// Returns an error if the sweeper has stopped.
    pub async fn sweep_now(&self) -> anyhow::Result<usize> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("sweeper not running"))?;
        let (reply, rx) = oneshot::channel();
        tx.send(SweepTask::SweepNow { reply })
            .await
            .map_err(|_| anyhow::anyhow!("sweeper channel closed"))?;
        Ok(rx.await?)
    }

    /// Close the request channel and wait for the loop to exit.
    pub async fn stop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
