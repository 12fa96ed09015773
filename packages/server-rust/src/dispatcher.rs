//! Per-category receive loop.
//!
//! A [`Dispatcher`] pulls records from one [`EventSource`] and feeds them, in
//! arrival order, to an [`EventHandler`]. It exits on end of stream, on a
//! transport error, or when its cancellation token fires, and never restarts
//! itself.

use std::fmt;
use std::sync::Arc;

use fwdwatch_core::Category;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::EventHandler;
use crate::error::SourceError;
use crate::shutdown::DispatcherGuard;
use crate::source::BoxedSource;

/// Why a dispatcher stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatcherExit {
    /// The source reported end of stream.
    StreamEnded,
    /// The source failed and cannot continue.
    TransportError(String),
    /// The dispatcher's cancellation token fired.
    Cancelled,
}

impl fmt::Display for DispatcherExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StreamEnded => f.write_str("stream ended"),
            Self::TransportError(e) => write!(f, "transport error: {e}"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// One receive loop bound to one category.
pub struct Dispatcher<T: Send + 'static> {
    category: Category,
    source: BoxedSource<T>,
    handler: Arc<dyn EventHandler<T>>,
    cancel: CancellationToken,
    guard: Option<DispatcherGuard>,
}

impl<T: Send + 'static> Dispatcher<T> {
    #[must_use]
    pub fn new(
        category: Category,
        source: BoxedSource<T>,
        handler: Arc<dyn EventHandler<T>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            category,
            source,
            handler,
            cancel,
            guard: None,
        }
    }

    /// Attach a guard that is released when the loop exits.
    #[must_use]
    pub fn with_guard(mut self, guard: DispatcherGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Run until the stream ends, fails, or is cancelled.
    ///
    /// A record that is already being handled when cancellation fires is
    /// handled to completion first.
    pub async fn run(mut self) -> DispatcherExit {
        info!(category = %self.category, "Dispatcher started");
        let mut processed: u64 = 0;

        let exit = loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break DispatcherExit::Cancelled,
                next = self.source.next_event() => next,
            };

            match next {
                Ok(Some(item)) => {
                    let outcome = self.handler.handle(item).await;
                    processed += 1;
                    debug!(category = %self.category, ?outcome, "Event processed");
                }
                Ok(None) => break DispatcherExit::StreamEnded,
                Err(SourceError::Decode(e)) => {
                    warn!(category = %self.category, error = %e, "Undecodable record skipped");
                }
                Err(SourceError::Transport(e)) => break DispatcherExit::TransportError(e),
            }
        };

        match &exit {
            DispatcherExit::TransportError(_) => {
                warn!(category = %self.category, processed, exit = %exit, "Dispatcher stopped");
            }
            _ => info!(category = %self.category, processed, exit = %exit, "Dispatcher stopped"),
        }
        drop(self.guard.take());
        exit
    }
}
